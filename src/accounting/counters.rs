//! Process-wide traffic counters.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

use super::record::AccountingRecord;

/// Aggregated request counters shared by all concurrent requests.
///
/// Counters are best-effort telemetry, never a correctness-critical path:
/// while the counter sink is in read-only/degraded mode every increment is
/// skipped, and aggregation resumes once the mode is cleared.
#[derive(Default)]
pub struct RequestCounters {
    read_only: AtomicBool,

    total: AtomicU64,
    status_2xx: AtomicU64,
    status_3xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
    background: AtomicU64,
    api: AtomicU64,
    user_api: AtomicU64,

    page_views: AtomicU64,
    page_views_crawler: AtomicU64,
    page_views_logged_in: AtomicU64,
    page_views_anon: AtomicU64,
    page_views_logged_in_mobile: AtomicU64,
    page_views_anon_mobile: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CounterSnapshot {
    pub total: u64,
    pub status_2xx: u64,
    pub status_3xx: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,
    pub background: u64,
    pub api: u64,
    pub user_api: u64,
    pub page_views: u64,
    pub page_views_crawler: u64,
    pub page_views_logged_in: u64,
    pub page_views_anon: u64,
    pub page_views_logged_in_mobile: u64,
    pub page_views_anon_mobile: u64,
}

impl RequestCounters {
    /// Create a zeroed counter family.
    pub fn new() -> Self {
        Self::default()
    }

    /// Put the counter sink into (or out of) read-only mode.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Whether increments are currently skipped.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// Fold one completed request into the counters.
    ///
    /// 5xx and background are classified before the generic status buckets
    /// so a background request never double-counts into both.
    pub fn aggregate(&self, record: &AccountingRecord, login_required: bool) {
        if self.is_read_only() {
            return;
        }

        self.total.fetch_add(1, Ordering::Relaxed);

        if record.is_api {
            self.api.fetch_add(1, Ordering::Relaxed);
        }
        if record.is_user_api {
            self.user_api.fetch_add(1, Ordering::Relaxed);
        }

        if record.status >= 500 {
            self.status_5xx.fetch_add(1, Ordering::Relaxed);
        } else if record.is_background {
            self.background.fetch_add(1, Ordering::Relaxed);
        } else if (300..400).contains(&record.status) {
            self.status_3xx.fetch_add(1, Ordering::Relaxed);
        } else if (400..500).contains(&record.status) {
            self.status_4xx.fetch_add(1, Ordering::Relaxed);
        } else {
            self.status_2xx.fetch_add(1, Ordering::Relaxed);

            if record.track_view {
                self.page_views.fetch_add(1, Ordering::Relaxed);
                if record.is_crawler {
                    self.page_views_crawler.fetch_add(1, Ordering::Relaxed);
                } else if record.logged_in {
                    self.page_views_logged_in.fetch_add(1, Ordering::Relaxed);
                    if record.is_mobile {
                        self.page_views_logged_in_mobile.fetch_add(1, Ordering::Relaxed);
                    }
                } else if !login_required {
                    self.page_views_anon.fetch_add(1, Ordering::Relaxed);
                    if record.is_mobile {
                        self.page_views_anon_mobile.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    /// Copy out the current values.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total: self.total.load(Ordering::Relaxed),
            status_2xx: self.status_2xx.load(Ordering::Relaxed),
            status_3xx: self.status_3xx.load(Ordering::Relaxed),
            status_4xx: self.status_4xx.load(Ordering::Relaxed),
            status_5xx: self.status_5xx.load(Ordering::Relaxed),
            background: self.background.load(Ordering::Relaxed),
            api: self.api.load(Ordering::Relaxed),
            user_api: self.user_api.load(Ordering::Relaxed),
            page_views: self.page_views.load(Ordering::Relaxed),
            page_views_crawler: self.page_views_crawler.load(Ordering::Relaxed),
            page_views_logged_in: self.page_views_logged_in.load(Ordering::Relaxed),
            page_views_anon: self.page_views_anon.load(Ordering::Relaxed),
            page_views_logged_in_mobile: self.page_views_logged_in_mobile.load(Ordering::Relaxed),
            page_views_anon_mobile: self.page_views_anon_mobile.load(Ordering::Relaxed),
        }
    }
}
