//! Rate limiting logic and counter state management.

mod counter;
mod key;
mod limiter;
mod store;

pub use counter::{epoch_secs, epoch_secs_f64, seconds_until_reset, window_start, WindowSlot};
pub use key::{KeyBasis, LimiterKey};
pub use limiter::{LimitExceeded, SlidingWindowLimiter};
pub use store::{ConsumeMode, Consumed, CounterStore, MemoryCounterStore, StoreError};
