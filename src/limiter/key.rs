//! Limiter key generation and handling.

use std::fmt;
use std::net::IpAddr;

/// The identity a limiter counter is keyed on.
///
/// Trusted logged-in callers are keyed per account rather than per IP so that
/// shared-IP scenarios (offices, NAT) are not over-penalized. A source
/// address that fails to parse is still limited, under its raw form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyBasis {
    /// Keyed on the client source address
    Ip(IpAddr),
    /// Keyed on a numeric user id
    User(u64),
    /// Keyed on an unparseable source address, verbatim
    Unparsed(String),
}

impl fmt::Display for KeyBasis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyBasis::Ip(ip) => write!(f, "{}", ip),
            KeyBasis::User(id) => write!(f, "user-{}", id),
            KeyBasis::Unparsed(raw) => write!(f, "{}", raw),
        }
    }
}

/// A key that uniquely identifies one rate limit counter.
///
/// The key is composed of the limiter scope, the client identity, and the
/// window label. Two requests from the same identity and scope always map to
/// the same counter for a given window. Non-global limiters additionally
/// carry the process instance id, so their counters are never shared across
/// server instances.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimiterKey {
    /// The limiter scope (e.g. "ip", "assets")
    pub scope: String,
    /// The client identity this counter belongs to
    pub identity: String,
    /// Window label, e.g. "10s"
    pub window: String,
    /// Process instance id for non-global limiters
    pub instance: Option<String>,
}

impl LimiterKey {
    /// Create a new limiter key.
    pub fn new(scope: &str, basis: &KeyBasis, window_secs: u64, instance: Option<&str>) -> Self {
        Self {
            scope: scope.to_string(),
            identity: basis.to_string(),
            window: format!("{}s", window_secs),
            instance: instance.map(str::to_string),
        }
    }

    /// Render the key as the string used to address the counter store.
    pub fn to_string_key(&self) -> String {
        match &self.instance {
            Some(instance) => {
                format!("rate-limit:{}:{}:{}:{}", self.scope, self.identity, self.window, instance)
            }
            None => format!("rate-limit:{}:{}:{}", self.scope, self.identity, self.window),
        }
    }
}

impl fmt::Display for LimiterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
