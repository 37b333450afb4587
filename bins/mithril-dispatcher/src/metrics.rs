// Dispatcher metrics and the status endpoint
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, Encoder, Histogram,
    IntCounter, IntCounterVec, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::info;

lazy_static! {
    pub static ref SUBMISSIONS_TOTAL: IntCounter = register_int_counter!(
        "mithril_submissions_total",
        "Submissions received from clients"
    )
    .expect("metric can be registered");
    pub static ref SUBMISSIONS_DROPPED: IntCounter = register_int_counter!(
        "mithril_submissions_dropped_total",
        "Submissions dropped because their subject could not be routed"
    )
    .expect("metric can be registered");
    pub static ref DISPATCH_OUTCOMES: IntCounterVec = register_int_counter_vec!(
        "mithril_dispatch_outcomes_total",
        "Terminal events published, by outcome",
        &["outcome"]
    )
    .expect("metric can be registered");
    pub static ref DISPATCH_DURATION: Histogram = register_histogram!(
        "mithril_dispatch_duration_seconds",
        "Time spent waiting for a worker reply",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("metric can be registered");
}

/// GET /status - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus text exposition
pub async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&prometheus::gather(), &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain".to_string())],
            e.to_string().into_bytes(),
        ),
    }
}

pub fn routes() -> Router {
    Router::new()
        .route("/status", get(health_check))
        .route("/metrics", get(metrics))
}

pub async fn serve(addr: String) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, routes()).await?;
    Ok(())
}
