//! Admission control: the optimistic-charge / reconciliation protocol.
//!
//! At check time the system does not yet know whether a request will be
//! classified as a lightweight asset fetch; only the downstream handler
//! reveals that. Admission therefore charges the ordinary limiters up
//! front and hands back a [`ChargeTicket`] whose reconciliation, run after
//! the downstream call completes, moves the charge to the asset limiter
//! when the request turns out to be asset-classified.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{AdmissionConfig, LimitClass, LimitPolicy};
use crate::identity::{AuthCookie, IdentityResolver};
use crate::limiter::{CounterStore, KeyBasis, LimitExceeded, SlidingWindowLimiter};

/// A rejected admission, surfaced to the client as a 429.
#[derive(Debug, Clone)]
pub struct Rejection {
    /// Seconds until the offending window resets
    pub retry_after: u64,
    /// Code identifying which limit was hit
    pub error_code: String,
}

impl From<LimitExceeded> for Rejection {
    fn from(err: LimitExceeded) -> Self {
        Self {
            retry_after: err.retry_after,
            error_code: err.error_code,
        }
    }
}

/// Outcome of one admission check.
pub enum Admission {
    /// Policy is off or the client is exempt; nothing was charged and there
    /// is nothing to reconcile.
    Unlimited,
    /// A limit was hit under warn-only policy; the request proceeds
    /// unthrottled and carries no charges.
    Warned,
    /// Both ordinary limiters were charged; the ticket must be reconciled
    /// after the downstream call completes.
    Charged(ChargeTicket),
    /// The request is rejected.
    Rejected(Rejection),
}

/// The optimistic charges taken for one admitted request.
///
/// Holds the limiters the charge was taken against so reconciliation uses
/// the same capacity/window snapshot the charge did, even if the settings
/// change mid-request.
pub struct ChargeTicket {
    basis: KeyBasis,
    uri: String,
    ordinary_short: SlidingWindowLimiter,
    ordinary_long: SlidingWindowLimiter,
    assets: SlidingWindowLimiter,
    policy: LimitPolicy,
}

impl ChargeTicket {
    /// Correct the provisional charges now that the request's final
    /// classification is known.
    ///
    /// For an asset-classified request both ordinary charges are rolled
    /// back and the asset limiter is consumed instead; if that consumption
    /// fails the response already in flight is not revoked, so the miss is
    /// only logged. For an ordinary request the charges stand.
    pub async fn reconcile(self, asset_classified: bool) {
        if !asset_classified {
            return;
        }

        self.ordinary_short.rollback(&self.basis).await;
        self.ordinary_long.rollback(&self.basis).await;

        if let Err(err) = self.assets.consume(&self.basis).await {
            if self.policy.warns() {
                warn!(
                    identity = %self.basis,
                    window = %self.assets.window_label(),
                    uri = %self.uri,
                    error_code = %err.error_code,
                    "asset rate limit exceeded after response; charge recorded, response not revoked"
                );
            } else {
                debug!(
                    identity = %self.basis,
                    error_code = %err.error_code,
                    "asset rate limit exceeded after response"
                );
            }
        }
    }
}

/// Orchestrates the per-request limiter checks and the warn/block policy.
pub struct AdmissionController {
    config: Arc<AdmissionConfig>,
    resolver: IdentityResolver,
    store: Arc<dyn CounterStore>,
}

impl AdmissionController {
    /// Create a controller over the shared admission state and counter
    /// store.
    pub fn new(config: Arc<AdmissionConfig>, store: Arc<dyn CounterStore>) -> Self {
        let resolver = IdentityResolver::new(config.clone());
        Self {
            config,
            resolver,
            store,
        }
    }

    fn limiter(&self, scope: &str, class: &LimitClass) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(
            scope,
            class.capacity,
            Duration::from_secs(class.window_secs),
            class.mode,
            class.global,
            self.config.instance_id(),
            self.store.clone(),
        )
    }

    /// Run the admission protocol for one request.
    ///
    /// The limiter checks are strictly ordered: asset pre-check, short
    /// ordinary window, long ordinary window. The first failure
    /// short-circuits the rest under a blocking policy.
    pub async fn admit(
        &self,
        source_addr: &str,
        cookie: Option<&AuthCookie>,
        uri: &str,
    ) -> Admission {
        // Policy is read once per check; `off` skips everything.
        let settings = self.config.limits();
        let policy = settings.policy;
        if policy == LimitPolicy::Off {
            return Admission::Unlimited;
        }

        let resolved = self.resolver.resolve(source_addr, cookie);
        if resolved.exempt {
            return Admission::Unlimited;
        }
        let basis = resolved.key_basis;

        let ordinary_short = self.limiter("ip", &settings.ordinary_short);
        let ordinary_long = self.limiter("ip", &settings.ordinary_long);
        let assets = self.limiter("assets", &settings.assets);

        // Asset pre-check: non-mutating, and rejected before any ordinary
        // charge is taken.
        if !assets.can_consume(&basis).await {
            if policy.warns() {
                warn!(
                    identity = %basis,
                    window = %assets.window_label(),
                    uri = %uri,
                    "asset rate limit exhausted"
                );
            }
            if policy.blocks() {
                return Admission::Rejected(Rejection {
                    retry_after: assets.seconds_until_reset(),
                    error_code: assets.error_code().to_string(),
                });
            }
        }

        // Ordinary consumptions, short window first. A short-window charge
        // is retained even when the long-window consume then fails; that
        // asymmetry matches the observed behavior of the source system.
        for limiter in [&ordinary_short, &ordinary_long] {
            if let Err(err) = limiter.consume(&basis).await {
                if policy.warns() {
                    warn!(
                        identity = %basis,
                        window = %limiter.window_label(),
                        uri = %uri,
                        error_code = %err.error_code,
                        "rate limit exceeded"
                    );
                }
                if policy.blocks() {
                    return Admission::Rejected(err.into());
                }
                return Admission::Warned;
            }
        }

        Admission::Charged(ChargeTicket {
            basis,
            uri: uri.to_string(),
            ordinary_short,
            ordinary_long,
            assets,
            policy,
        })
    }
}
