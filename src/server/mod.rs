//! HTTP surface.
//!
//! This module provides:
//! - The agent tool endpoints (`/mcp/tools`, `/mcp/invoke`)
//! - REST endpoints for health, metrics, status and queries
//! - Prometheus metrics and tracing setup

mod app;
mod mcp;
pub mod metrics;
mod observability;
mod rest;

pub use app::{shutdown_signal, App, ServerConfig};
pub use mcp::{create_mcp_router, get_tools, AppState, ToolInfo, ToolRequest, ToolResponse};
pub use metrics::init_metrics;
pub use observability::{config_from_env, init_tracing, spans, TracingConfig};
pub use rest::{create_rest_router, error_status, record_request, HealthResponse};
