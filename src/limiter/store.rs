//! Counter store trait and the in-process implementation.
//!
//! The store owns all `WindowSlot` state, addressed by rendered limiter
//! keys. Mutations for one key are linearizable: concurrent consumptions
//! never lose updates. The trait abstracts over the in-process store and a
//! shared store reachable by every server instance (global-scope limiters).

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::counter::WindowSlot;

/// Errors surfaced by a counter store.
///
/// Callers treat any store error as "allow": rate limiting must never become
/// a bigger availability bottleneck than the abuse it prevents.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or timed out
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    /// The store is in read-only/degraded mode
    #[error("counter store is read-only")]
    ReadOnly,
}

/// How a limiter spends quota on a rejected consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumeMode {
    /// The increment happens unconditionally, so even a rejected request
    /// consumes one unit of quota. Discourages retry storms.
    Aggressive,
    /// Rejected requests do not consume quota.
    Lenient,
}

/// Outcome of a consumption attempt.
#[derive(Debug, Clone, Copy)]
pub struct Consumed {
    /// Whether the consumption was within capacity
    pub allowed: bool,
    /// The count recorded for the window after the attempt
    pub count: u64,
}

/// Trait for counter store implementations.
///
/// Remote implementations (a shared atomic-increment store) own their
/// timeout behavior and report failures as `StoreError::Unavailable`.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically consume one unit for `key` within the window beginning at
    /// `window_start`. A slot left over from an earlier window is reset
    /// before the attempt.
    async fn try_consume(
        &self,
        key: &str,
        window_start: u64,
        capacity: u64,
        mode: ConsumeMode,
    ) -> Result<Consumed, StoreError>;

    /// Decrement the counter for `key` by one, undoing a consumption later
    /// found to be inapplicable. A rollback against a rotated window is a
    /// no-op, and the count never drops below zero.
    async fn rollback(&self, key: &str, window_start: u64) -> Result<(), StoreError>;

    /// Current count for `key` in the window beginning at `window_start`.
    async fn current(&self, key: &str, window_start: u64) -> Result<u64, StoreError>;
}

/// In-process counter store backed by a concurrent keyed map.
///
/// Per-key linearizability comes from the map's entry locking: a slot is
/// read, rotated, and written while the entry reference is held.
pub struct MemoryCounterStore {
    slots: DashMap<String, WindowSlot>,
    read_only: AtomicBool,
}

impl MemoryCounterStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            read_only: AtomicBool::new(false),
        }
    }

    /// Put the store into (or take it out of) read-only mode.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Whether the store currently rejects writes.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// Number of keys with live slots. Primarily useful for tests.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Drop all counter state. Primarily useful for tests.
    pub fn clear(&self) {
        self.slots.clear();
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn try_consume(
        &self,
        key: &str,
        window_start: u64,
        capacity: u64,
        mode: ConsumeMode,
    ) -> Result<Consumed, StoreError> {
        if self.is_read_only() {
            return Err(StoreError::ReadOnly);
        }

        let mut slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| WindowSlot::empty(window_start));
        slot.rotate_to(window_start);

        match mode {
            ConsumeMode::Aggressive => {
                slot.count += 1;
                Ok(Consumed {
                    allowed: slot.count <= capacity,
                    count: slot.count,
                })
            }
            ConsumeMode::Lenient => {
                if slot.count < capacity {
                    slot.count += 1;
                    Ok(Consumed {
                        allowed: true,
                        count: slot.count,
                    })
                } else {
                    Ok(Consumed {
                        allowed: false,
                        count: slot.count,
                    })
                }
            }
        }
    }

    async fn rollback(&self, key: &str, window_start: u64) -> Result<(), StoreError> {
        if self.is_read_only() {
            return Err(StoreError::ReadOnly);
        }

        if let Some(mut slot) = self.slots.get_mut(key) {
            // A slot that rotated since the consumption is left untouched.
            if slot.window_start == window_start && slot.count > 0 {
                slot.count -= 1;
            }
        }

        Ok(())
    }

    async fn current(&self, key: &str, window_start: u64) -> Result<u64, StoreError> {
        Ok(self
            .slots
            .get(key)
            .filter(|slot| slot.window_start == window_start)
            .map(|slot| slot.count)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_aggressive_consume_charges_on_rejection() {
        let store = MemoryCounterStore::new();

        for _ in 0..2 {
            let consumed = store
                .try_consume("k", 100, 2, ConsumeMode::Aggressive)
                .await
                .unwrap();
            assert!(consumed.allowed);
        }

        let rejected = store
            .try_consume("k", 100, 2, ConsumeMode::Aggressive)
            .await
            .unwrap();
        assert!(!rejected.allowed);
        // The rejected attempt still spent a unit.
        assert_eq!(rejected.count, 3);
    }

    #[tokio::test]
    async fn test_lenient_consume_does_not_charge_on_rejection() {
        let store = MemoryCounterStore::new();

        for _ in 0..2 {
            store
                .try_consume("k", 100, 2, ConsumeMode::Lenient)
                .await
                .unwrap();
        }

        let rejected = store
            .try_consume("k", 100, 2, ConsumeMode::Lenient)
            .await
            .unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.count, 2);
        assert_eq!(store.current("k", 100).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_window_rotation_resets_count() {
        let store = MemoryCounterStore::new();

        for _ in 0..2 {
            store
                .try_consume("k", 100, 2, ConsumeMode::Aggressive)
                .await
                .unwrap();
        }
        assert!(
            !store
                .try_consume("k", 100, 2, ConsumeMode::Aggressive)
                .await
                .unwrap()
                .allowed
        );

        // Next window boundary: the count starts over.
        let consumed = store
            .try_consume("k", 110, 2, ConsumeMode::Aggressive)
            .await
            .unwrap();
        assert!(consumed.allowed);
        assert_eq!(consumed.count, 1);
    }

    #[tokio::test]
    async fn test_rollback_floors_at_zero() {
        let store = MemoryCounterStore::new();

        store
            .try_consume("k", 100, 5, ConsumeMode::Aggressive)
            .await
            .unwrap();

        store.rollback("k", 100).await.unwrap();
        store.rollback("k", 100).await.unwrap();
        store.rollback("k", 100).await.unwrap();

        assert_eq!(store.current("k", 100).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rollback_against_rotated_window_is_noop() {
        let store = MemoryCounterStore::new();

        store
            .try_consume("k", 100, 5, ConsumeMode::Aggressive)
            .await
            .unwrap();
        // Window rotates before the rollback arrives.
        store
            .try_consume("k", 110, 5, ConsumeMode::Aggressive)
            .await
            .unwrap();

        store.rollback("k", 100).await.unwrap();

        assert_eq!(store.current("k", 110).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_only_mode_rejects_writes() {
        let store = MemoryCounterStore::new();
        store.set_read_only(true);

        let result = store.try_consume("k", 100, 5, ConsumeMode::Aggressive).await;
        assert!(matches!(result, Err(StoreError::ReadOnly)));

        store.set_read_only(false);
        assert!(store
            .try_consume("k", 100, 5, ConsumeMode::Aggressive)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_consumes_never_lose_updates() {
        use std::sync::Arc;

        let store = Arc::new(MemoryCounterStore::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    store
                        .try_consume("k", 100, 1000, ConsumeMode::Aggressive)
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.current("k", 100).await.unwrap(), 200);
    }
}
