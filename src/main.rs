use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Extension, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber;

use tollgate::accounting::{RequestCounters, RequestMarks, UserAgentClassifier};
use tollgate::config::{AdmissionConfig, TollgateConfig};
use tollgate::deferred::DeferredQueue;
use tollgate::limiter::MemoryCounterStore;
use tollgate::middleware::{Tollgate, TollgateLayer};

/// Demo server wiring the Tollgate middleware into a small Axum app.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Override the configured listen address
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Starting Tollgate demo server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => TollgateConfig::from_file(path)?,
        None => TollgateConfig::default(),
    };
    let bind_addr = args.bind.unwrap_or(config.server.bind_addr);
    info!(bind_addr = %bind_addr, policy = ?config.limits.policy, "Configuration loaded");

    let admission = Arc::new(AdmissionConfig::new(&config));
    let tollgate = Arc::new(Tollgate::new(
        admission,
        Arc::new(MemoryCounterStore::new()),
        Arc::new(UserAgentClassifier::default()),
        Arc::new(RequestCounters::new()),
        DeferredQueue::start(),
    ));
    info!("Admission middleware initialized");

    let app = Router::new()
        .route("/", get(index))
        .route("/assets/{*path}", get(asset))
        .route("/status", get(status))
        .with_state(tollgate.clone())
        .layer(TollgateLayer::new(tollgate))
        .into_make_service_with_connect_info::<SocketAddr>();

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("Listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Tollgate demo server stopped");
    Ok(())
}

async fn index() -> impl IntoResponse {
    ([(CONTENT_TYPE, "text/html")], "<html><body>hello</body></html>")
}

/// Serves a static asset and marks the request as asset-classified, so the
/// middleware moves its admission charge to the asset limiter.
async fn asset(Extension(marks): Extension<RequestMarks>) -> impl IntoResponse {
    marks.mark_asset();
    ([(CONTENT_TYPE, "text/css")], "body { margin: 0; }")
}

async fn status(State(tollgate): State<Arc<Tollgate>>) -> impl IntoResponse {
    Json(tollgate.counters().snapshot())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
