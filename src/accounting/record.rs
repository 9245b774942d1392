//! Accounting record assembly.
//!
//! The record is an immutable snapshot built once per request after the
//! downstream call completes. Every fallible input degrades to an unset
//! field; assembly itself never touches the response.

use std::time::Duration;

use axum::http::Method;
use serde::Serialize;

use super::classify::ClientClassifier;
use super::RequestMarks;
use crate::config::AccountingSettings;

/// Immutable description of one completed request.
#[derive(Debug, Clone, Serialize)]
pub struct AccountingRecord {
    /// Final HTTP status code
    pub status: u16,
    /// Downstream used an API key
    pub is_api: bool,
    /// Downstream used a user-level API key
    pub is_user_api: bool,
    /// Internal/background channel request
    pub is_background: bool,
    /// Counted as a page view
    pub track_view: bool,
    /// Crawler user agent (anonymous requests only)
    pub is_crawler: bool,
    /// Mobile user agent
    pub is_mobile: bool,
    /// An authenticated-identity cookie was present
    pub logged_in: bool,
    /// Downstream flagged an authentication failure
    pub auth_failed: bool,
    /// UTF-8-sanitized user agent
    pub user_agent: Option<String>,
    /// Downstream duration in seconds
    pub duration_secs: f64,
    /// Redis calls recorded during downstream execution
    pub redis_calls: u64,
    /// Time spent in Redis calls, seconds
    pub redis_secs: f64,
    /// SQL calls recorded during downstream execution
    pub sql_calls: u64,
    /// Time spent in SQL calls, seconds
    pub sql_secs: f64,
    /// Queueing delay ahead of this process, seconds
    pub queue_seconds: Option<f64>,
}

/// Request-side inputs captured before the downstream call consumes the
/// request.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    /// Request method
    pub method: Method,
    /// Raw request path
    pub path: String,
    /// UTF-8-sanitized user agent
    pub user_agent: Option<String>,
    /// An authenticated-identity cookie was present
    pub logged_in: bool,
    /// Queueing delay derived from the upstream request-start header
    pub queue_seconds: Option<f64>,
    /// Page-view tracking override from the request header
    pub track_view_override: Option<bool>,
}

impl AccountingRecord {
    /// Assemble the record for a completed request.
    pub fn build(
        status: u16,
        content_type: Option<&str>,
        snapshot: &RequestSnapshot,
        marks: &RequestMarks,
        classifier: &dyn ClientClassifier,
        settings: &AccountingSettings,
        elapsed: Duration,
    ) -> Self {
        let is_api = marks.is_api();
        let is_user_api = marks.is_user_api();

        // The internal channels are background regardless of other signals.
        let is_background = settings
            .background_path_prefixes
            .iter()
            .any(|prefix| snapshot.path.starts_with(prefix.as_str()));

        let html = content_type
            .map(|ct| ct.starts_with("text/html"))
            .unwrap_or(false);
        let implicit_track_view = snapshot.method == Method::GET
            && html
            && (200..300).contains(&status)
            && !is_api
            && !is_user_api
            && !is_background;
        let track_view = snapshot.track_view_override.unwrap_or(implicit_track_view);

        let is_crawler = !snapshot.logged_in
            && snapshot
                .user_agent
                .as_deref()
                .map(|ua| classifier.is_crawler(ua))
                .unwrap_or(false);
        let is_mobile = snapshot
            .user_agent
            .as_deref()
            .map(|ua| classifier.is_mobile(ua))
            .unwrap_or(false);

        Self {
            status,
            is_api,
            is_user_api,
            is_background,
            track_view,
            is_crawler,
            is_mobile,
            logged_in: snapshot.logged_in,
            auth_failed: marks.is_auth_failed(),
            user_agent: snapshot.user_agent.clone(),
            duration_secs: elapsed.as_secs_f64(),
            redis_calls: marks.redis_calls(),
            redis_secs: marks.redis_seconds(),
            sql_calls: marks.sql_calls(),
            sql_secs: marks.sql_seconds(),
            queue_seconds: snapshot.queue_seconds,
        }
    }
}

/// Normalize the upstream request-start header to a queueing delay in
/// seconds relative to `now` (fractional epoch seconds).
///
/// Both `t=<epoch-seconds>` (fractional allowed) and raw epoch milliseconds
/// are accepted. Values in the future or unparseable yield `None`.
pub fn queue_delay_seconds(raw: &str, now: f64) -> Option<f64> {
    let raw = raw.trim();
    let start_secs = if let Some(value) = raw.strip_prefix("t=") {
        value.parse::<f64>().ok()?
    } else {
        let millis = raw.parse::<u64>().ok()?;
        millis as f64 / 1000.0
    };

    let delay = now - start_secs;
    (start_secs > 0.0 && delay >= 0.0).then_some(delay)
}
