//! Configuration management for Tollgate.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};
use crate::identity::ExemptionList;
use crate::limiter::ConsumeMode;

/// Main configuration for the Tollgate middleware.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration (demo binary)
    #[serde(default)]
    pub server: ServerConfig,

    /// Admission limit configuration
    #[serde(default)]
    pub limits: LimitSettings,

    /// Identity resolution configuration
    #[serde(default)]
    pub identity: IdentitySettings,

    /// Request accounting configuration
    #[serde(default)]
    pub accounting: AccountingSettings,
}

impl TollgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents).map_err(|e| TollgateError::Config(e.to_string()))
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    ([127, 0, 0, 1], 8080).into()
}

/// Admission policy applied when a limit is hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitPolicy {
    /// Skip the admission protocol entirely
    Off,
    /// Log a warning and let the request through
    Warn,
    /// Reject with a 429
    Block,
    /// Log a warning and reject with a 429
    #[serde(rename = "warn+block")]
    WarnAndBlock,
}

impl LimitPolicy {
    /// Whether this policy emits a warning log on a hit.
    pub fn warns(&self) -> bool {
        matches!(self, LimitPolicy::Warn | LimitPolicy::WarnAndBlock)
    }

    /// Whether this policy rejects the request on a hit.
    pub fn blocks(&self) -> bool {
        matches!(self, LimitPolicy::Block | LimitPolicy::WarnAndBlock)
    }
}

/// Capacity and window for one limiter class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitClass {
    /// Maximum consumptions allowed per window
    pub capacity: u64,
    /// Window duration in seconds
    pub window_secs: u64,
    /// Whether counters are shared across all server instances
    #[serde(default = "default_true")]
    pub global: bool,
    /// Consumption mode on rejection
    #[serde(default = "default_mode")]
    pub mode: ConsumeMode,
}

fn default_true() -> bool {
    true
}

fn default_mode() -> ConsumeMode {
    ConsumeMode::Aggressive
}

/// Admission limit settings. Read at the start of every check, so changes
/// made at runtime through [`AdmissionConfig::set_limits`] take effect on
/// the next request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Policy applied when a limit is hit
    #[serde(default = "default_policy")]
    pub policy: LimitPolicy,

    /// Short-window ordinary limiter
    #[serde(default = "default_ordinary_short")]
    pub ordinary_short: LimitClass,

    /// Long-window ordinary limiter
    #[serde(default = "default_ordinary_long")]
    pub ordinary_long: LimitClass,

    /// Asset limiter (short window only)
    #[serde(default = "default_assets")]
    pub assets: LimitClass,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            ordinary_short: default_ordinary_short(),
            ordinary_long: default_ordinary_long(),
            assets: default_assets(),
        }
    }
}

fn default_policy() -> LimitPolicy {
    LimitPolicy::Block
}

fn default_ordinary_short() -> LimitClass {
    LimitClass {
        capacity: 50,
        window_secs: 10,
        global: true,
        mode: ConsumeMode::Aggressive,
    }
}

fn default_ordinary_long() -> LimitClass {
    LimitClass {
        capacity: 200,
        window_secs: 60,
        global: true,
        mode: ConsumeMode::Aggressive,
    }
}

fn default_assets() -> LimitClass {
    LimitClass {
        capacity: 200,
        window_secs: 10,
        global: true,
        mode: ConsumeMode::Aggressive,
    }
}

/// Identity resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitySettings {
    /// Trust level at which limits switch from per-IP to per-user keys
    #[serde(default = "default_trust_level_threshold")]
    pub trust_level_threshold: u8,

    /// Whether private/loopback addresses are exempt
    #[serde(default = "default_true")]
    pub exempt_private_addresses: bool,

    /// Statically exempt addresses, as IP literals or CIDR blocks
    #[serde(default)]
    pub exempt_addresses: Vec<String>,

    /// Auth-cookie rotation period in seconds
    #[serde(default = "default_cookie_rotation")]
    pub cookie_rotation_secs: u64,

    /// Margin added to the rotation period before a cookie is stale
    #[serde(default = "default_cookie_rotation_margin")]
    pub cookie_rotation_margin_secs: u64,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            trust_level_threshold: default_trust_level_threshold(),
            exempt_private_addresses: true,
            exempt_addresses: Vec::new(),
            cookie_rotation_secs: default_cookie_rotation(),
            cookie_rotation_margin_secs: default_cookie_rotation_margin(),
        }
    }
}

fn default_trust_level_threshold() -> u8 {
    1
}

fn default_cookie_rotation() -> u64 {
    600
}

fn default_cookie_rotation_margin() -> u64 {
    120
}

/// Request accounting settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountingSettings {
    /// Emit per-subsystem call counts and queue time headers
    #[serde(default)]
    pub detailed_performance_headers: bool,

    /// Site requires login: anonymous page views are not counted
    #[serde(default)]
    pub login_required: bool,

    /// Path prefixes always classified as background traffic
    #[serde(default = "default_background_prefixes")]
    pub background_path_prefixes: Vec<String>,
}

impl Default for AccountingSettings {
    fn default() -> Self {
        Self {
            detailed_performance_headers: false,
            login_required: false,
            background_path_prefixes: default_background_prefixes(),
        }
    }
}

fn default_background_prefixes() -> Vec<String> {
    vec!["/message-bus".to_string(), "/topics/timings".to_string()]
}

type ExemptionPredicate = dyn Fn(IpAddr) -> bool + Send + Sync;

/// Process-wide admission state, constructed once at startup and shared into
/// the middleware.
///
/// Limit settings are runtime-mutable; the exemption list and identity
/// settings are fixed at construction. At most one runtime exemption
/// predicate may be registered at a time, with an explicit unregister for
/// test teardown.
pub struct AdmissionConfig {
    limits: RwLock<LimitSettings>,
    identity: IdentitySettings,
    accounting: AccountingSettings,
    exemptions: ExemptionList,
    exemption_predicate: RwLock<Option<Arc<ExemptionPredicate>>>,
    instance_id: String,
}

impl AdmissionConfig {
    /// Build the runtime admission state from loaded configuration.
    ///
    /// Malformed exemption entries are logged and skipped.
    pub fn new(config: &TollgateConfig) -> Self {
        Self {
            limits: RwLock::new(config.limits.clone()),
            identity: config.identity.clone(),
            accounting: config.accounting.clone(),
            exemptions: ExemptionList::parse(&config.identity.exempt_addresses),
            exemption_predicate: RwLock::new(None),
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Snapshot of the current limit settings.
    pub fn limits(&self) -> LimitSettings {
        self.limits.read().clone()
    }

    /// Replace the limit settings at runtime.
    pub fn set_limits(&self, settings: LimitSettings) {
        *self.limits.write() = settings;
    }

    /// Identity settings.
    pub fn identity(&self) -> &IdentitySettings {
        &self.identity
    }

    /// Accounting settings.
    pub fn accounting(&self) -> &AccountingSettings {
        &self.accounting
    }

    /// Process instance id used by non-global limiter keys.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Register the process-wide runtime exemption predicate.
    ///
    /// Registering while one is active is a configuration error.
    pub fn register_exemption<F>(&self, predicate: F) -> Result<()>
    where
        F: Fn(IpAddr) -> bool + Send + Sync + 'static,
    {
        let mut slot = self.exemption_predicate.write();
        if slot.is_some() {
            return Err(TollgateError::ExemptionAlreadyRegistered);
        }
        *slot = Some(Arc::new(predicate));
        Ok(())
    }

    /// Remove the registered exemption predicate, if any.
    pub fn unregister_exemption(&self) {
        *self.exemption_predicate.write() = None;
    }

    /// Whether `addr` is exempt from admission control.
    pub fn is_exempt(&self, addr: IpAddr) -> bool {
        if self.exemptions.contains(addr) {
            return true;
        }
        let predicate = self.exemption_predicate.read().clone();
        if let Some(predicate) = predicate {
            if predicate(addr) {
                return true;
            }
        }
        self.identity.exempt_private_addresses && crate::identity::is_private_address(addr)
    }
}
