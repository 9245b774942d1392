//! Rate-limit key resolution and address exemptions.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::AdmissionConfig;
use crate::limiter::KeyBasis;

/// Parsed authenticated-identity cookie bundle, deposited into request
/// extensions by an upstream cookie layer.
#[derive(Debug, Clone)]
pub struct AuthCookie {
    /// When the cookie was issued
    pub issued_at: DateTime<Utc>,
    /// Authenticated user id
    pub user_id: u64,
    /// Trust level of the authenticated user
    pub trust_level: u8,
}

/// Result of identity resolution for one request.
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    /// The identity admission counters are keyed on
    pub key_basis: KeyBasis,
    /// Whether the request skips admission entirely
    pub exempt: bool,
}

/// Determines the rate-limit key and exemption status for a request.
pub struct IdentityResolver {
    config: Arc<AdmissionConfig>,
}

impl IdentityResolver {
    /// Create a resolver over the shared admission state.
    pub fn new(config: Arc<AdmissionConfig>) -> Self {
        Self { config }
    }

    /// Resolve the limit key basis and exemption for a source address and
    /// optional auth cookie.
    ///
    /// A cookie older than the rotation period plus margin is treated as
    /// absent. A source address that fails to parse is limited under its
    /// raw form and is never exempt.
    pub fn resolve(&self, source_addr: &str, cookie: Option<&AuthCookie>) -> ResolvedIdentity {
        let settings = self.config.identity();
        let parsed: Option<IpAddr> = source_addr.trim().parse().ok();

        let fresh_cookie = cookie.filter(|c| {
            let max_age = settings.cookie_rotation_secs + settings.cookie_rotation_margin_secs;
            let age = Utc::now().signed_duration_since(c.issued_at).num_seconds();
            age >= 0 && (age as u64) <= max_age
        });

        let key_basis = match (fresh_cookie, parsed) {
            (Some(c), _) if c.trust_level >= settings.trust_level_threshold => {
                KeyBasis::User(c.user_id)
            }
            (_, Some(ip)) => KeyBasis::Ip(ip),
            _ => KeyBasis::Unparsed(source_addr.to_string()),
        };

        let exempt = parsed.map(|ip| self.config.is_exempt(ip)).unwrap_or(false);

        ResolvedIdentity { key_basis, exempt }
    }
}

/// A statically configured set of exempt addresses and CIDR blocks.
#[derive(Debug, Clone, Default)]
pub struct ExemptionList {
    entries: Vec<NetBlock>,
}

#[derive(Debug, Clone, Copy)]
struct NetBlock {
    network: IpAddr,
    prefix: u8,
}

impl ExemptionList {
    /// Parse configured entries (`10.1.2.3` or `10.0.0.0/8`). Malformed
    /// entries are logged and skipped.
    pub fn parse(entries: &[String]) -> Self {
        let parsed = entries
            .iter()
            .filter_map(|entry| match parse_entry(entry) {
                Some(block) => Some(block),
                None => {
                    warn!(entry = %entry, "skipping malformed exemption entry");
                    None
                }
            })
            .collect();
        Self { entries: parsed }
    }

    /// Whether `addr` falls inside any configured entry.
    pub fn contains(&self, addr: IpAddr) -> bool {
        self.entries
            .iter()
            .any(|block| prefix_match(block.network, addr, block.prefix))
    }

    /// Number of parsed entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_entry(entry: &str) -> Option<NetBlock> {
    let entry = entry.trim();
    if let Some((addr, prefix)) = entry.split_once('/') {
        let network: IpAddr = addr.parse().ok()?;
        let prefix: u8 = prefix.parse().ok()?;
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        (prefix <= max).then_some(NetBlock { network, prefix })
    } else {
        let network: IpAddr = entry.parse().ok()?;
        let prefix = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Some(NetBlock { network, prefix })
    }
}

/// Compare the leading `prefix` bits of two addresses of the same family.
fn prefix_match(network: IpAddr, addr: IpAddr, prefix: u8) -> bool {
    match (network, addr) {
        (IpAddr::V4(net), IpAddr::V4(addr)) => {
            octets_match(&net.octets(), &addr.octets(), prefix)
        }
        (IpAddr::V6(net), IpAddr::V6(addr)) => {
            octets_match(&net.octets(), &addr.octets(), prefix)
        }
        _ => false,
    }
}

fn octets_match(a: &[u8], b: &[u8], prefix: u8) -> bool {
    let full = (prefix / 8) as usize;
    let rest = prefix % 8;
    if a[..full] != b[..full] {
        return false;
    }
    if rest == 0 {
        return true;
    }
    let mask = 0xffu8 << (8 - rest);
    (a[full] & mask) == (b[full] & mask)
}

/// Whether an address is private, loopback, or link-local.
pub fn is_private_address(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            // Unique local fc00::/7, link local fe80::/10
            v6.is_loopback()
                || (v6.octets()[0] & 0xfe) == 0xfc
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}
