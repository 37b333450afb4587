// Prometheus metrics and the worker's status endpoint
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter_vec, register_int_gauge, Encoder, Histogram,
    IntCounterVec, IntGauge, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::info;

lazy_static! {
    pub static ref JOBS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "mithril_jobs_total",
        "Jobs handled by this worker, by outcome",
        &["outcome"]
    )
    .expect("metric can be registered");
    pub static ref JOBS_IN_FLIGHT: IntGauge = register_int_gauge!(
        "mithril_jobs_in_flight",
        "Jobs currently being graded"
    )
    .expect("metric can be registered");
    pub static ref JOB_DURATION: Histogram = register_histogram!(
        "mithril_job_duration_seconds",
        "Wall time from request receipt to reply",
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
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

pub fn router() -> Router {
    Router::new()
        .route("/status", get(health_check))
        .route("/metrics", get(metrics))
}

pub async fn serve(addr: String) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Metrics server listening");
    axum::serve(listener, router()).await?;
    Ok(())
}
