//! Structured logging setup.
//!
//! `RUST_LOG` takes precedence over the configured level. Output is plain
//! text or JSON.

use tracing_subscriber::{
    filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, Registry,
};

/// Tracing configuration options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Enable JSON output format
    pub json: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Initialize tracing.
///
/// # Panics
///
/// Panics if a global subscriber has already been installed.
pub fn init_tracing(level: &str, json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        let json_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_file(true)
            .with_line_number(true);

        Registry::default().with(env_filter).with(json_layer).init();
    } else {
        let fmt_layer = fmt::layer().with_target(true).with_thread_names(true);

        Registry::default().with(env_filter).with(fmt_layer).init();
    }

    tracing::debug!(level, json, "Tracing initialized");
}

/// Read `DIRINDEX_LOG_LEVEL` and `DIRINDEX_LOG_JSON`.
#[must_use]
pub fn config_from_env() -> TracingConfig {
    from_lookup(|key| std::env::var(key).ok())
}

fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> TracingConfig {
    let level = lookup("DIRINDEX_LOG_LEVEL").unwrap_or_else(|| "info".to_string());
    let json = lookup("DIRINDEX_LOG_JSON")
        .is_some_and(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"));

    TracingConfig { level, json }
}

/// Spans shared by the HTTP and tool handlers.
pub mod spans {
    use tracing::{info_span, Span};

    /// Span for one HTTP request.
    #[must_use]
    pub fn request_span(method: &str, uri: &str, request_id: &str) -> Span {
        info_span!(
            "http_request",
            method = %method,
            uri = %uri,
            request_id = %request_id,
        )
    }

    /// Span for one tool invocation.
    #[must_use]
    pub fn tool_span(tool_name: &str) -> Span {
        info_span!("tool_invocation", tool = %tool_name)
    }
}
