//! Fixed-window counter state and window-boundary arithmetic.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall-clock time as seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current wall-clock time as fractional seconds since the Unix epoch.
pub fn epoch_secs_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Compute the start of the window containing `now`.
///
/// All requests within the same boundary share one counter; the boundary is
/// the wall-clock time floored to a multiple of the window duration.
pub fn window_start(now: u64, window: Duration) -> u64 {
    let secs = window.as_secs().max(1);
    (now / secs) * secs
}

/// Seconds remaining until the window containing `now` rotates.
pub fn seconds_until_reset(now: u64, window: Duration) -> u64 {
    let secs = window.as_secs().max(1);
    window_start(now, window) + secs - now
}

/// Counter state for one limiter key: the count for the active window and
/// the boundary that window started at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSlot {
    /// Number of consumptions recorded in the active window
    pub count: u64,
    /// Window boundary (epoch seconds, floored to the window duration)
    pub window_start: u64,
}

impl WindowSlot {
    /// Create an empty slot for the window beginning at `window_start`.
    pub fn empty(window_start: u64) -> Self {
        Self { count: 0, window_start }
    }

    /// Reset the count when the window boundary has advanced.
    pub fn rotate_to(&mut self, window_start: u64) {
        if self.window_start != window_start {
            self.count = 0;
            self.window_start = window_start;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_start_floors_to_boundary() {
        let window = Duration::from_secs(10);
        assert_eq!(window_start(100, window), 100);
        assert_eq!(window_start(104, window), 100);
        assert_eq!(window_start(109, window), 100);
        assert_eq!(window_start(110, window), 110);
    }

    #[test]
    fn test_same_boundary_shares_window() {
        let window = Duration::from_secs(60);
        assert_eq!(window_start(120, window), window_start(179, window));
        assert_ne!(window_start(120, window), window_start(180, window));
    }

    #[test]
    fn test_seconds_until_reset() {
        let window = Duration::from_secs(10);
        assert_eq!(seconds_until_reset(100, window), 10);
        assert_eq!(seconds_until_reset(104, window), 6);
        assert_eq!(seconds_until_reset(109, window), 1);
    }

    #[test]
    fn test_slot_rotation_resets_count() {
        let mut slot = WindowSlot { count: 5, window_start: 100 };

        slot.rotate_to(100);
        assert_eq!(slot.count, 5);

        slot.rotate_to(110);
        assert_eq!(slot.count, 0);
        assert_eq!(slot.window_start, 110);
    }
}
