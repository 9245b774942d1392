//! Request accounting: record building, classification, and counters.

mod classify;
mod counters;
mod record;

pub use classify::{ClientClassifier, UserAgentClassifier};
pub use counters::{CounterSnapshot, RequestCounters};
pub use record::{queue_delay_seconds, AccountingRecord, RequestSnapshot};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::Response;

use crate::config::AdmissionConfig;
use crate::deferred::DeferredQueue;

const TRACK_VIEW_HEADER: &str = "x-discourse-trackview";
const LOGGED_OUT_HEADER: &str = "x-logged-out";
const RUNTIME_HEADER: &str = "x-runtime";
const REDIS_CALLS_HEADER: &str = "x-redis-calls";
const REDIS_TIME_HEADER: &str = "x-redis-time";
const SQL_CALLS_HEADER: &str = "x-sql-calls";
const SQL_TIME_HEADER: &str = "x-sql-time";
const QUEUE_TIME_HEADER: &str = "x-queue-time";

/// Markers set by the downstream handler during its own processing, shared
/// through request extensions.
///
/// Also accumulates per-subsystem call counts and durations so the
/// performance headers and accounting record have real sources.
#[derive(Clone, Default)]
pub struct RequestMarks {
    inner: Arc<MarksInner>,
}

#[derive(Default)]
struct MarksInner {
    asset: AtomicBool,
    api: AtomicBool,
    user_api: AtomicBool,
    auth_failed: AtomicBool,
    redis_calls: AtomicU64,
    redis_nanos: AtomicU64,
    sql_calls: AtomicU64,
    sql_nanos: AtomicU64,
}

impl RequestMarks {
    /// Mark the request as an asset-classified request.
    pub fn mark_asset(&self) {
        self.inner.asset.store(true, Ordering::SeqCst);
    }

    /// Whether the downstream handler marked the request as an asset.
    pub fn is_asset(&self) -> bool {
        self.inner.asset.load(Ordering::SeqCst)
    }

    /// Mark that an API key authenticated this request.
    pub fn mark_api(&self) {
        self.inner.api.store(true, Ordering::SeqCst);
    }

    pub fn is_api(&self) -> bool {
        self.inner.api.load(Ordering::SeqCst)
    }

    /// Mark that a user-level API key authenticated this request.
    pub fn mark_user_api(&self) {
        self.inner.user_api.store(true, Ordering::SeqCst);
    }

    pub fn is_user_api(&self) -> bool {
        self.inner.user_api.load(Ordering::SeqCst)
    }

    /// Mark that authentication failed (bad token).
    pub fn mark_auth_failure(&self) {
        self.inner.auth_failed.store(true, Ordering::SeqCst);
    }

    pub fn is_auth_failed(&self) -> bool {
        self.inner.auth_failed.load(Ordering::SeqCst)
    }

    /// Record one Redis call of the given duration.
    pub fn record_redis_call(&self, duration: Duration) {
        self.inner.redis_calls.fetch_add(1, Ordering::Relaxed);
        self.inner
            .redis_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn redis_calls(&self) -> u64 {
        self.inner.redis_calls.load(Ordering::Relaxed)
    }

    pub fn redis_seconds(&self) -> f64 {
        self.inner.redis_nanos.load(Ordering::Relaxed) as f64 / 1e9
    }

    /// Record one SQL call of the given duration.
    pub fn record_sql_call(&self, duration: Duration) {
        self.inner.sql_calls.fetch_add(1, Ordering::Relaxed);
        self.inner
            .sql_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn sql_calls(&self) -> u64 {
        self.inner.sql_calls.load(Ordering::Relaxed)
    }

    pub fn sql_seconds(&self) -> f64 {
        self.inner.sql_nanos.load(Ordering::Relaxed) as f64 / 1e9
    }
}

/// Builds the accounting record for each completed request and hands the
/// counter aggregation off the critical path.
pub struct RequestAccountant {
    config: Arc<AdmissionConfig>,
    classifier: Arc<dyn ClientClassifier>,
    counters: Arc<RequestCounters>,
    queue: DeferredQueue,
}

impl RequestAccountant {
    /// Create an accountant over the shared state.
    pub fn new(
        config: Arc<AdmissionConfig>,
        classifier: Arc<dyn ClientClassifier>,
        counters: Arc<RequestCounters>,
        queue: DeferredQueue,
    ) -> Self {
        Self {
            config,
            classifier,
            counters,
            queue,
        }
    }

    /// Account for one completed request.
    ///
    /// Header attachment is synchronous (cheap, pure header-setting);
    /// counter aggregation is deferred and never blocks the response.
    pub fn account(
        &self,
        response: &mut Response,
        snapshot: &RequestSnapshot,
        marks: &RequestMarks,
        elapsed: Duration,
    ) {
        let settings = self.config.accounting();

        attach_performance_headers(
            response.headers_mut(),
            settings.detailed_performance_headers,
            snapshot,
            marks,
            elapsed,
        );

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let record = AccountingRecord::build(
            response.status().as_u16(),
            content_type.as_deref(),
            snapshot,
            marks,
            self.classifier.as_ref(),
            settings,
            elapsed,
        );

        if record.track_view {
            response
                .headers_mut()
                .insert(TRACK_VIEW_HEADER, HeaderValue::from_static("1"));
        }
        if record.auth_failed {
            response
                .headers_mut()
                .insert(LOGGED_OUT_HEADER, HeaderValue::from_static("1"));
        }

        let counters = self.counters.clone();
        let login_required = settings.login_required;
        self.queue.defer(move || counters.aggregate(&record, login_required));
    }

    /// The shared counter family.
    pub fn counters(&self) -> &Arc<RequestCounters> {
        &self.counters
    }
}

fn attach_performance_headers(
    headers: &mut HeaderMap,
    detailed: bool,
    snapshot: &RequestSnapshot,
    marks: &RequestMarks,
    elapsed: Duration,
) {
    insert_float(headers, RUNTIME_HEADER, elapsed.as_secs_f64());

    if !detailed {
        return;
    }

    insert_count(headers, REDIS_CALLS_HEADER, marks.redis_calls());
    insert_float(headers, REDIS_TIME_HEADER, marks.redis_seconds());
    insert_count(headers, SQL_CALLS_HEADER, marks.sql_calls());
    insert_float(headers, SQL_TIME_HEADER, marks.sql_seconds());
    if let Some(queue_seconds) = snapshot.queue_seconds {
        insert_float(headers, QUEUE_TIME_HEADER, queue_seconds);
    }
}

fn insert_float(headers: &mut HeaderMap, name: &'static str, value: f64) {
    if let Ok(value) = HeaderValue::from_str(&format!("{:.6}", value)) {
        headers.insert(name, value);
    }
}

fn insert_count(headers: &mut HeaderMap, name: &'static str, value: u64) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TollgateConfig;
    use axum::body::Body;
    use axum::http::Method;

    fn accountant(detailed: bool) -> RequestAccountant {
        let mut config = TollgateConfig::default();
        config.accounting.detailed_performance_headers = detailed;
        RequestAccountant::new(
            Arc::new(AdmissionConfig::new(&config)),
            Arc::new(UserAgentClassifier::default()),
            Arc::new(RequestCounters::new()),
            DeferredQueue::start(),
        )
    }

    fn snapshot() -> RequestSnapshot {
        RequestSnapshot {
            method: Method::GET,
            path: "/latest".to_string(),
            user_agent: Some("Mozilla/5.0".to_string()),
            logged_in: false,
            queue_seconds: Some(0.25),
            track_view_override: None,
        }
    }

    fn html_response() -> Response {
        Response::builder()
            .status(200)
            .header(CONTENT_TYPE, "text/html")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_runtime_header_always_attached() {
        let accountant = accountant(false);
        let mut response = html_response();

        accountant.account(&mut response, &snapshot(), &RequestMarks::default(), Duration::from_millis(5));

        assert!(response.headers().contains_key("x-runtime"));
        assert!(!response.headers().contains_key("x-redis-calls"));
    }

    #[tokio::test]
    async fn test_detailed_headers_when_enabled() {
        let accountant = accountant(true);
        let mut response = html_response();
        let marks = RequestMarks::default();
        marks.record_redis_call(Duration::from_millis(3));
        marks.record_sql_call(Duration::from_millis(7));

        accountant.account(&mut response, &snapshot(), &marks, Duration::from_millis(5));

        assert_eq!(response.headers()["x-redis-calls"], "1");
        assert_eq!(response.headers()["x-sql-calls"], "1");
        assert!(response.headers().contains_key("x-queue-time"));
    }

    #[tokio::test]
    async fn test_track_view_header_set_for_page_views() {
        let accountant = accountant(false);
        let mut response = html_response();

        accountant.account(&mut response, &snapshot(), &RequestMarks::default(), Duration::from_millis(5));

        assert_eq!(response.headers()["x-discourse-trackview"], "1");
    }

    #[tokio::test]
    async fn test_logged_out_marker_on_auth_failure() {
        let accountant = accountant(false);
        let mut response = html_response();
        let marks = RequestMarks::default();
        marks.mark_auth_failure();

        accountant.account(&mut response, &snapshot(), &marks, Duration::from_millis(5));

        assert_eq!(response.headers()["x-logged-out"], "1");
    }

    #[tokio::test]
    async fn test_aggregation_reaches_counters() {
        let accountant = accountant(false);
        let mut response = html_response();

        accountant.account(&mut response, &snapshot(), &RequestMarks::default(), Duration::from_millis(5));

        for _ in 0..200 {
            if accountant.counters().snapshot().total == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let snap = accountant.counters().snapshot();
        assert_eq!(snap.total, 1);
        assert_eq!(snap.page_views, 1);
    }
}
