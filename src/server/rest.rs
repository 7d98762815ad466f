//! REST API endpoints.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use serde_json::json;

use super::metrics;
use super::mcp::AppState;
use crate::error::{Error, QueryError};
use crate::query::Query;
use crate::watcher::WatchHealth;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: String,
    pub watcher: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub degraded_roots: Vec<String>,
}

/// Create REST API router.
pub fn create_rest_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/status", get(status))
        .route("/api/v1/query", post(query))
        .with_state(state)
}

/// Count a handled request and its latency.
pub fn record_request(endpoint: &str, method: &str, status: StatusCode, started: Instant) {
    metrics::REQUEST_COUNT
        .with_label_values(&[endpoint, method, status.as_str()])
        .inc();
    metrics::REQUEST_LATENCY
        .with_label_values(&[endpoint, method])
        .observe(started.elapsed().as_secs_f64());
}

/// HTTP status for a failed query.
#[must_use]
pub fn error_status(err: &Error) -> StatusCode {
    match err {
        Error::Query(QueryError::InvalidQuery(_)) => StatusCode::BAD_REQUEST,
        Error::Query(QueryError::NotFound(_)) => StatusCode::NOT_FOUND,
        Error::Embedding(_) => StatusCode::BAD_GATEWAY,
        _ if err.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Health check endpoint. Unhealthy when the database is unreachable or a
/// watch root is unwatched.
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let started = Instant::now();
    let db_status = match state.planner.store().health_check() {
        Ok(()) => "ok",
        Err(e) => {
            tracing::warn!(error = %e, "Database health check failed");
            "error"
        }
    };

    let (watcher, degraded_roots) = match state.watch_health() {
        WatchHealth::Healthy => ("healthy", Vec::new()),
        WatchHealth::Degraded { roots } => (
            "degraded",
            roots.iter().map(|r| r.display().to_string()).collect(),
        ),
    };

    let healthy = db_status == "ok" && watcher == "healthy";
    let response = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: db_status.to_string(),
        watcher: watcher.to_string(),
        degraded_roots,
    };

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    tracing::debug!(status = ?status_code, database = %db_status, watcher, "Health check");
    record_request("/health", "GET", status_code, started);

    (status_code, Json(response))
}

/// Prometheus metrics endpoint. Index gauges are refreshed first.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if let Err(e) = state.planner.stats() {
        tracing::warn!(error = %e, "Failed to refresh index gauges");
    }

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                b"Failed to encode metrics".to_vec(),
            )
        }
    }
}

/// Index statistics.
async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let started = Instant::now();
    let (code, body) = match state.planner.stats() {
        Ok(stats) => {
            tracing::debug!(files = stats.files, chunks = stats.chunks, "Status retrieved");
            (
                StatusCode::OK,
                json!({
                    "version": env!("CARGO_PKG_VERSION"),
                    "stats": stats,
                }),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read index stats");
            (error_status(&e), json!({"error": e.to_string()}))
        }
    };

    record_request("/api/v1/status", "GET", code, started);
    (code, Json(body))
}

/// Run any [`Query`] posted as JSON.
async fn query(State(state): State<Arc<AppState>>, Json(query): Json<Query>) -> impl IntoResponse {
    let started = Instant::now();
    let (code, body) = match state.planner.execute(query).await {
        Ok(response) => match serde_json::to_value(response) {
            Ok(value) => (StatusCode::OK, value),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, json!({"error": e.to_string()})),
        },
        Err(e) => (error_status(&e), json!({"error": e.to_string()})),
    };

    record_request("/api/v1/query", "POST", code, started);
    (code, Json(body))
}
