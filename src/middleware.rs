//! Tower middleware binding admission control and accounting into the
//! request path.

use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::header::{RETRY_AFTER, USER_AGENT};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use tower::{Layer, Service};
use tracing::warn;

use crate::accounting::{
    queue_delay_seconds, ClientClassifier, RequestAccountant, RequestCounters, RequestMarks,
    RequestSnapshot,
};
use crate::admission::{Admission, AdmissionController, ChargeTicket, Rejection};
use crate::config::AdmissionConfig;
use crate::deferred::DeferredQueue;
use crate::identity::AuthCookie;
use crate::limiter::{epoch_secs_f64, CounterStore};

const ERROR_CODE_HEADER: &str = "x-rate-limit-error-code";
const REQUEST_START_HEADER: &str = "x-request-start";
const TRACK_VIEW_OVERRIDE_HEADER: &str = "x-track-view";

/// Shared middleware state: the admission controller and the accountant.
pub struct Tollgate {
    config: Arc<AdmissionConfig>,
    controller: AdmissionController,
    accountant: RequestAccountant,
}

impl Tollgate {
    /// Assemble the middleware state.
    ///
    /// Must be called from within a Tokio runtime (the deferred queue's
    /// runner task is spawned by the caller-provided queue).
    pub fn new(
        config: Arc<AdmissionConfig>,
        store: Arc<dyn CounterStore>,
        classifier: Arc<dyn ClientClassifier>,
        counters: Arc<RequestCounters>,
        queue: DeferredQueue,
    ) -> Self {
        let controller = AdmissionController::new(config.clone(), store);
        let accountant = RequestAccountant::new(config.clone(), classifier, counters, queue);
        Self {
            config,
            controller,
            accountant,
        }
    }

    /// The shared admission configuration.
    pub fn config(&self) -> &Arc<AdmissionConfig> {
        &self.config
    }

    /// The shared counter family.
    pub fn counters(&self) -> &Arc<RequestCounters> {
        self.accountant.counters()
    }
}

/// Middleware layer applying admission control and accounting.
#[derive(Clone)]
pub struct TollgateLayer {
    state: Arc<Tollgate>,
}

impl TollgateLayer {
    /// Create a layer over the shared state.
    pub fn new(state: Arc<Tollgate>) -> Self {
        Self { state }
    }
}

impl<S> Layer<S> for TollgateLayer {
    type Service = TollgateService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TollgateService {
            inner,
            state: self.state.clone(),
        }
    }
}

/// Middleware service wrapping the downstream handler.
#[derive(Clone)]
pub struct TollgateService<S> {
    inner: S,
    state: Arc<Tollgate>,
}

impl<S> Service<Request<Body>> for TollgateService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let state = self.state.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let started = Instant::now();

            let source_addr = client_addr(&req);
            let cookie = req.extensions().get::<AuthCookie>().cloned();
            let marks = RequestMarks::default();
            req.extensions_mut().insert(marks.clone());

            let snapshot = RequestSnapshot {
                method: req.method().clone(),
                path: req.uri().path().to_string(),
                user_agent: req
                    .headers()
                    .get(USER_AGENT)
                    .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned()),
                logged_in: cookie.is_some(),
                queue_seconds: req
                    .headers()
                    .get(REQUEST_START_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|raw| queue_delay_seconds(raw, epoch_secs_f64())),
                track_view_override: bool_header(req.headers(), TRACK_VIEW_OVERRIDE_HEADER),
            };

            let uri = req.uri().to_string();
            let ticket = match state.controller.admit(&source_addr, cookie.as_ref(), &uri).await {
                Admission::Rejected(rejection) => return Ok(rejection_response(&rejection)),
                Admission::Charged(ticket) => Some(ticket),
                Admission::Unlimited | Admission::Warned => None,
            };

            // Reconciliation is attached to completion of the downstream
            // call: the guard runs it inline on the normal path and from
            // `Drop` when the request future unwinds or is cancelled.
            let guard = ReconcileGuard::new(ticket, marks.clone());
            let result = inner.call(req).await;
            guard.finish().await;

            let mut response = result?;

            let accounted = catch_unwind(AssertUnwindSafe(|| {
                state
                    .accountant
                    .account(&mut response, &snapshot, &marks, started.elapsed());
            }));
            if accounted.is_err() {
                warn!(path = %snapshot.path, "request accounting failed; skipped");
            }

            Ok(response)
        })
    }
}

/// Scoped holder for the optimistic charges of one request.
struct ReconcileGuard {
    inner: Option<(ChargeTicket, RequestMarks)>,
}

impl ReconcileGuard {
    fn new(ticket: Option<ChargeTicket>, marks: RequestMarks) -> Self {
        Self {
            inner: ticket.map(|ticket| (ticket, marks)),
        }
    }

    /// Reconcile inline after the downstream call completed.
    async fn finish(mut self) {
        if let Some((ticket, marks)) = self.inner.take() {
            ticket.reconcile(marks.is_asset()).await;
        }
    }
}

impl Drop for ReconcileGuard {
    fn drop(&mut self) {
        // Reached only when the request future was dropped or unwound
        // before `finish`: charges are still corrected so an asset request
        // never permanently retains its ordinary charges.
        if let Some((ticket, marks)) = self.inner.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { ticket.reconcile(marks.is_asset()).await });
            }
        }
    }
}

/// Best source-address string for the request: forwarding headers first,
/// then the peer address.
fn client_addr<B>(req: &Request<B>) -> String {
    if let Some(value) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
    {
        if let Some(first) = value.split(',').next() {
            return first.trim().to_string();
        }
    }
    if let Some(value) = req.headers().get("x-real-ip").and_then(|h| h.to_str().ok()) {
        return value.trim().to_string();
    }
    if let Some(connect) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return connect.0.ip().to_string();
    }
    "unknown".to_string()
}

fn bool_header(headers: &HeaderMap, name: &str) -> Option<bool> {
    let value = headers.get(name)?.to_str().ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn rejection_response(rejection: &Rejection) -> Response {
    let body = format!(
        "Slow down, too many requests. Retry again in {} seconds. Error code: {}.",
        rejection.retry_after, rejection.error_code
    );
    let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();

    if let Ok(value) = HeaderValue::from_str(&rejection.retry_after.to_string()) {
        response.headers_mut().insert(RETRY_AFTER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&rejection.error_code) {
        response.headers_mut().insert(ERROR_CODE_HEADER, value);
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::UserAgentClassifier;
    use crate::config::{LimitPolicy, LimitSettings, TollgateConfig};
    use crate::limiter::MemoryCounterStore;
    use axum::extract::Extension;
    use axum::http::header::CONTENT_TYPE;
    use axum::routing::get;
    use axum::Router;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::util::ServiceExt;

    async fn page() -> impl IntoResponse {
        ([(CONTENT_TYPE, "text/html")], "<html>latest</html>")
    }

    async fn asset(Extension(marks): Extension<RequestMarks>) -> impl IntoResponse {
        marks.mark_asset();
        ([(CONTENT_TYPE, "text/css")], "body{}")
    }

    async fn slow_asset(Extension(marks): Extension<RequestMarks>) -> impl IntoResponse {
        marks.mark_asset();
        tokio::time::sleep(Duration::from_secs(30)).await;
        ([(CONTENT_TYPE, "text/css")], "body{}")
    }

    struct TestApp {
        router: Router,
        store: Arc<MemoryCounterStore>,
        state: Arc<Tollgate>,
    }

    fn test_app(configure: impl FnOnce(&mut TollgateConfig)) -> TestApp {
        let mut config = TollgateConfig::default();
        config.identity.exempt_private_addresses = false;
        configure(&mut config);

        let admission = Arc::new(AdmissionConfig::new(&config));
        let store = Arc::new(MemoryCounterStore::new());
        let state = Arc::new(Tollgate::new(
            admission,
            store.clone(),
            Arc::new(UserAgentClassifier::default()),
            Arc::new(RequestCounters::new()),
            DeferredQueue::start(),
        ));

        let router = Router::new()
            .route("/latest", get(page))
            .route("/assets/style.css", get(asset))
            .route("/assets/slow.css", get(slow_asset))
            .layer(TollgateLayer::new(state.clone()));

        TestApp { router, store, state }
    }

    fn settings(policy: LimitPolicy, short: u64, long: u64, assets: u64) -> LimitSettings {
        let mut settings = LimitSettings::default();
        settings.policy = policy;
        settings.ordinary_short.capacity = short;
        settings.ordinary_long.capacity = long;
        settings.assets.capacity = assets;
        settings
    }

    fn request(path: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header("x-forwarded-for", "203.0.113.50")
            .header(USER_AGENT, "Mozilla/5.0 (Windows NT 10.0)")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_block_mode_rejects_second_request() {
        let app = test_app(|c| c.limits = settings(LimitPolicy::Block, 1, 10, 10));

        let first = app.router.clone().oneshot(request("/latest")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.router.clone().oneshot(request("/latest")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key(RETRY_AFTER));
        assert_eq!(
            second.headers()["x-rate-limit-error-code"],
            "ip_10_secs_limit"
        );

        let body = second.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("ip_10_secs_limit"));
        assert!(text.contains("seconds"));
    }

    #[tokio::test]
    async fn test_warn_mode_lets_both_requests_through() {
        let app = test_app(|c| c.limits = settings(LimitPolicy::Warn, 1, 10, 10));

        for _ in 0..2 {
            let response = app.router.clone().oneshot(request("/latest")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_asset_request_rolls_back_ordinary_charges() {
        let app = test_app(|c| c.limits = settings(LimitPolicy::Block, 1, 10, 5));

        let asset = app
            .router
            .clone()
            .oneshot(request("/assets/style.css"))
            .await
            .unwrap();
        assert_eq!(asset.status(), StatusCode::OK);

        // The ordinary charge was rolled back, so an ordinary request from
        // the same client in the same window still passes.
        let page = app.router.clone().oneshot(request("/latest")).await.unwrap();
        assert_eq!(page.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_exempt_address_unlimited() {
        let app = test_app(|c| {
            c.limits = settings(LimitPolicy::Block, 1, 1, 1);
            c.identity.exempt_addresses = vec!["203.0.113.50".to_string()];
        });

        for _ in 0..5 {
            let response = app.router.clone().oneshot(request("/latest")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(app.store.slot_count(), 0);
    }

    #[tokio::test]
    async fn test_runtime_and_track_view_headers() {
        let app = test_app(|c| c.limits = settings(LimitPolicy::Block, 10, 10, 10));

        let response = app.router.clone().oneshot(request("/latest")).await.unwrap();

        assert!(response.headers().contains_key("x-runtime"));
        assert_eq!(response.headers()["x-discourse-trackview"], "1");
    }

    #[tokio::test]
    async fn test_track_view_override_forbids_counting() {
        let app = test_app(|c| c.limits = settings(LimitPolicy::Block, 10, 10, 10));

        let req = Request::builder()
            .uri("/latest")
            .header("x-forwarded-for", "203.0.113.50")
            .header("x-track-view", "0")
            .body(Body::empty())
            .unwrap();
        let response = app.router.clone().oneshot(req).await.unwrap();

        assert!(!response.headers().contains_key("x-discourse-trackview"));
    }

    #[tokio::test]
    async fn test_page_views_aggregated_off_path() {
        let app = test_app(|c| c.limits = settings(LimitPolicy::Block, 10, 10, 10));

        let response = app.router.clone().oneshot(request("/latest")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        for _ in 0..200 {
            if app.state.counters().snapshot().total == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let snap = app.state.counters().snapshot();
        assert_eq!(snap.total, 1);
        assert_eq!(snap.status_2xx, 1);
        assert_eq!(snap.page_views_anon, 1);
    }

    #[tokio::test]
    async fn test_cancelled_request_still_reconciles() {
        let app = test_app(|c| c.limits = settings(LimitPolicy::Block, 1, 10, 5));

        // Drop the request future while the downstream handler (which has
        // already marked the request as an asset) is still running.
        let fut = app.router.clone().oneshot(request("/assets/slow.css"));
        tokio::select! {
            _ = fut => panic!("slow asset should not finish"),
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }

        // Give the spawned reconcile task a moment to run.
        let mut rolled_back = false;
        for _ in 0..200 {
            let window = crate::limiter::window_start(
                crate::limiter::epoch_secs(),
                Duration::from_secs(10),
            );
            let ordinary = app
                .store
                .current("rate-limit:ip:203.0.113.50:10s", window)
                .await
                .unwrap();
            let assets = app
                .store
                .current("rate-limit:assets:203.0.113.50:10s", window)
                .await
                .unwrap();
            if ordinary == 0 && assets == 1 {
                rolled_back = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(rolled_back, "charges were not reconciled after cancellation");
    }

    #[tokio::test]
    async fn test_limit_settings_change_at_runtime() {
        let app = test_app(|c| c.limits = settings(LimitPolicy::Block, 1, 10, 10));

        let first = app.router.clone().oneshot(request("/latest")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = app.router.clone().oneshot(request("/latest")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

        // Switching to warn-only takes effect on the next check.
        let mut relaxed = app.state.config().limits();
        relaxed.policy = LimitPolicy::Warn;
        app.state.config().set_limits(relaxed);

        let third = app.router.clone().oneshot(request("/latest")).await.unwrap();
        assert_eq!(third.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_off_policy_passes_everything() {
        let app = test_app(|c| c.limits = settings(LimitPolicy::Off, 1, 1, 1));

        for _ in 0..5 {
            let response = app.router.clone().oneshot(request("/latest")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(app.store.slot_count(), 0);
    }
}
