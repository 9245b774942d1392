//! Core sliding-window limiter implementation.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::counter::{epoch_secs, seconds_until_reset, window_start};
use super::key::{KeyBasis, LimiterKey};
use super::store::{ConsumeMode, CounterStore};

/// A consumption was rejected because the active window is at capacity.
#[derive(Debug, Clone, Error)]
#[error("rate limit exceeded ({error_code}), retry in {retry_after}s")]
pub struct LimitExceeded {
    /// Seconds until the active window resets
    pub retry_after: u64,
    /// Caller-supplied code identifying which limit was hit
    pub error_code: String,
}

/// A keyed fixed-window rate limiter.
///
/// One limiter instance describes one limit class (scope, capacity, window,
/// consumption mode); the per-identity counters live in the shared store.
/// Global limiters key only on identity, so concurrent requests on different
/// server instances contend for the same counter through a shared store;
/// non-global limiters additionally key on the process instance id.
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    scope: String,
    capacity: u64,
    window: Duration,
    mode: ConsumeMode,
    global: bool,
    instance_id: String,
    error_code: String,
    store: Arc<dyn CounterStore>,
}

impl SlidingWindowLimiter {
    /// Create a new limiter.
    ///
    /// The error code reported on rejection is derived from the scope and
    /// window, e.g. `ip_10_secs_limit`.
    pub fn new(
        scope: &str,
        capacity: u64,
        window: Duration,
        mode: ConsumeMode,
        global: bool,
        instance_id: &str,
        store: Arc<dyn CounterStore>,
    ) -> Self {
        let error_code = format!("{}_{}_secs_limit", scope, window.as_secs());
        Self {
            scope: scope.to_string(),
            capacity,
            window,
            mode,
            global,
            instance_id: instance_id.to_string(),
            error_code,
            store,
        }
    }

    /// The code carried by rejections from this limiter.
    pub fn error_code(&self) -> &str {
        &self.error_code
    }

    /// Window label for logging, e.g. "10s".
    pub fn window_label(&self) -> String {
        format!("{}s", self.window.as_secs())
    }

    /// Seconds until the window containing the current time resets.
    pub fn seconds_until_reset(&self) -> u64 {
        seconds_until_reset(epoch_secs(), self.window)
    }

    fn key(&self, basis: &KeyBasis) -> String {
        let instance = if self.global {
            None
        } else {
            Some(self.instance_id.as_str())
        };
        LimiterKey::new(&self.scope, basis, self.window.as_secs(), instance).to_string_key()
    }

    /// Non-mutating capacity check: `true` iff the count for the active
    /// window is below capacity. A store failure reads as "capacity left".
    pub async fn can_consume(&self, basis: &KeyBasis) -> bool {
        self.can_consume_at(basis, epoch_secs()).await
    }

    pub(crate) async fn can_consume_at(&self, basis: &KeyBasis, now: u64) -> bool {
        let key = self.key(basis);
        let ws = window_start(now, self.window);
        match self.store.current(&key, ws).await {
            Ok(count) => count < self.capacity,
            Err(error) => {
                warn!(key = %key, error = %error, "counter store check failed; allowing");
                true
            }
        }
    }

    /// Atomically consume one unit for the active window.
    ///
    /// In aggressive mode the increment happens unconditionally, so a
    /// rejected request still spends quota. A store failure fails open.
    pub async fn consume(&self, basis: &KeyBasis) -> Result<(), LimitExceeded> {
        self.consume_at(basis, epoch_secs()).await
    }

    pub(crate) async fn consume_at(&self, basis: &KeyBasis, now: u64) -> Result<(), LimitExceeded> {
        let key = self.key(basis);
        let ws = window_start(now, self.window);

        match self.store.try_consume(&key, ws, self.capacity, self.mode).await {
            Ok(consumed) if consumed.allowed => Ok(()),
            Ok(consumed) => {
                debug!(
                    key = %key,
                    count = consumed.count,
                    capacity = self.capacity,
                    "rate limit exceeded"
                );
                Err(LimitExceeded {
                    retry_after: seconds_until_reset(now, self.window),
                    error_code: self.error_code.clone(),
                })
            }
            Err(error) => {
                warn!(key = %key, error = %error, "counter store consume failed; allowing");
                Ok(())
            }
        }
    }

    /// Undo one consumption for the active window. Safe to call after the
    /// window has rotated (the rollback becomes a no-op) and never drives
    /// the counter below zero.
    pub async fn rollback(&self, basis: &KeyBasis) {
        self.rollback_at(basis, epoch_secs()).await;
    }

    pub(crate) async fn rollback_at(&self, basis: &KeyBasis, now: u64) {
        let key = self.key(basis);
        let ws = window_start(now, self.window);
        if let Err(error) = self.store.rollback(&key, ws).await {
            debug!(key = %key, error = %error, "rollback skipped");
        }
    }

    /// Current count for the active window. Primarily useful for tests.
    pub async fn current_count(&self, basis: &KeyBasis) -> u64 {
        let key = self.key(basis);
        let ws = window_start(epoch_secs(), self.window);
        self.store.current(&key, ws).await.unwrap_or(0)
    }
}
