//! Observability infrastructure for Warden.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors used across the engine
//! and its service binaries.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `warden_engine=debug`)
///
/// # Example
///
/// ```rust
/// use warden_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for per-scope provisioning operations.
///
/// # Example
///
/// ```rust
/// use warden_core::observability::scope_span;
///
/// let span = scope_span("ensure_binding", "eu");
/// let _guard = span.enter();
/// // ... provisioning step
/// ```
#[must_use]
pub fn scope_span(operation: &str, scope_id: &str) -> Span {
    tracing::info_span!(
        "scope",
        op = operation,
        scope_id = scope_id,
    )
}

/// Creates a span for job dispatch operations.
#[must_use]
pub fn dispatch_span(operation: &str, job_id: &str, scope_id: &str) -> Span {
    tracing::info_span!(
        "dispatch",
        op = operation,
        job_id = job_id,
        scope_id = scope_id,
    )
}
