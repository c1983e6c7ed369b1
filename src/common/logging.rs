//! Structured Logging for account-fleet
//!
//! Provides structured logging with:
//! - Pretty output for interactive runs, JSON output for log shipping
//! - Correlation IDs (batch job ids) tying every item of a run together
//! - Domain events for batch runs, pool transitions and store recovery
//!
//! Secrets (credentials, artifacts, payment attributes) are never part of an
//! event payload; pool events carry masked identifiers only.
//!
//! # Usage
//!
//! ```rust,ignore
//! use account_fleet::common::logging::{init_logging, LogLevel};
//!
//! init_logging(LogLevel::Info, false)?;
//! tracing::info!(target: "fleet::batch", job_id = %id, "Starting refresh");
//! ```

use serde::Serialize;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

// ============================================================================
// Log Levels
// ============================================================================

/// Application log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

// ============================================================================
// Structured Event Types
// ============================================================================

/// Event categories for structured logging
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Document store events (recovery, refused writes)
    Store,
    /// Resource pool transitions
    Pool,
    /// Credential exchange events
    Exchange,
    /// Batch run lifecycle
    Batch,
    /// System events (startup, shutdown)
    System,
}

/// Structured log event
#[derive(Debug, Serialize)]
pub struct LogEvent {
    /// Event timestamp (ISO 8601)
    pub timestamp: String,
    /// Log level
    pub level: String,
    /// Event category
    pub category: EventCategory,
    /// Human-readable message
    pub message: String,
    /// Correlation ID (batch job id)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Additional structured data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Duration in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

/// Error details for error events
#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
}

impl LogEvent {
    /// Create a new log event
    pub fn new(level: LogLevel, category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: level.as_filter().to_uppercase(),
            category,
            message: message.into(),
            correlation_id: None,
            data: None,
            duration_ms: None,
            error: None,
        }
    }

    /// Add correlation ID
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Add structured data
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Add duration
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Add error details
    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(ErrorDetails {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    /// Render as a single JSON line
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"error\": \"failed to serialize log\", \"message\": \"{}\"}}",
                self.message
            )
        })
    }
}

// ============================================================================
// Domain Events
// ============================================================================

/// Log the start of a batch run
pub fn log_batch_started(operation: &str, job_id: &str, total: usize, concurrency: usize) {
    let event = LogEvent::new(LogLevel::Info, EventCategory::Batch, format!("{} started", operation))
        .with_correlation_id(job_id)
        .with_data(serde_json::json!({
            "operation": operation,
            "total": total,
            "concurrency": concurrency
        }));

    tracing::info!(target: "fleet::batch", "{}", event.to_json());
}

/// Log the end of a batch run
pub fn log_batch_finished(
    operation: &str,
    job_id: &str,
    succeeded: usize,
    failed: usize,
    skipped: usize,
    duration_ms: u64,
) {
    let level = if failed > 0 { LogLevel::Warn } else { LogLevel::Info };
    let event = LogEvent::new(level, EventCategory::Batch, format!("{} finished", operation))
        .with_correlation_id(job_id)
        .with_duration(duration_ms)
        .with_data(serde_json::json!({
            "operation": operation,
            "succeeded": succeeded,
            "failed": failed,
            "skipped": skipped
        }));

    match level {
        LogLevel::Warn => tracing::warn!(target: "fleet::batch", "{}", event.to_json()),
        _ => tracing::info!(target: "fleet::batch", "{}", event.to_json()),
    }
}

/// Log a resource pool state transition
pub fn log_pool_event(event_type: &str, masked_identifier: &str, success: bool, detail: Option<&str>) {
    let level = if success { LogLevel::Info } else { LogLevel::Warn };
    let mut event = LogEvent::new(level, EventCategory::Pool, event_type).with_data(
        serde_json::json!({
            "resource": masked_identifier,
            "success": success
        }),
    );

    if let Some(detail) = detail {
        event = event.with_error("POOL_MISMATCH", detail);
    }

    if success {
        tracing::info!(target: "fleet::pool", "{}", event.to_json());
    } else {
        tracing::warn!(target: "fleet::pool", "{}", event.to_json());
    }
}

/// Log a store recovery or a refused write
pub fn log_store_event(event_type: &str, path: &str, detail: &str) {
    let event = LogEvent::new(LogLevel::Warn, EventCategory::Store, event_type)
        .with_data(serde_json::json!({ "path": path }))
        .with_error("STORE_WARNING", detail);

    tracing::warn!(target: "fleet::store", "{}", event.to_json());
}

// ============================================================================
// Initialization
// ============================================================================

/// Initialize the logging system
///
/// # Arguments
/// * `level` - Minimum log level to output
/// * `json_format` - Use JSON format (for log shipping)
pub fn init_logging(level: LogLevel, json_format: bool) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "account_fleet={lvl},account-fleet={lvl},fleet={lvl}",
            lvl = level.as_filter()
        ))
    });

    if json_format {
        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::CLOSE),
        );

        subscriber
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    } else {
        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false),
        );

        subscriber
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    }

    Ok(())
}

/// Initialize logging from FleetConfig
pub fn init_from_config(config: &super::config::FleetConfig) -> Result<(), LoggingError> {
    let level = LogLevel::from(config.log_level.as_str());
    init_logging(level, config.log_json)
}

/// Logging errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize logging: {0}")]
    InitFailed(String),
}

/// Generate a unique correlation ID for a batch run
pub fn generate_correlation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event_serialization() {
        let event = LogEvent::new(LogLevel::Info, EventCategory::Batch, "refresh finished")
            .with_correlation_id("job-123")
            .with_data(serde_json::json!({"succeeded": 3}))
            .with_duration(42);

        let json = event.to_json();
        assert!(json.contains("refresh finished"));
        assert!(json.contains("job-123"));
        assert!(json.contains("\"category\":\"batch\""));
        assert!(json.contains("42"));
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::from("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::from("INFO"), LogLevel::Info);
        assert_eq!(LogLevel::from("warning"), LogLevel::Warn);
        assert_eq!(LogLevel::from("unknown"), LogLevel::Info);
    }

    #[test]
    fn test_correlation_id_generation() {
        let id1 = generate_correlation_id();
        let id2 = generate_correlation_id();

        assert_eq!(id1.len(), 32);
        assert_ne!(id1, id2);
    }
}
