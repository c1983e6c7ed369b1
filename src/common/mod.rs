//! Common Infrastructure Module
//!
//! Shared utilities and configuration for account-fleet.
//!
//! This module contains:
//! - Configuration loading from environment variables and persisted settings
//! - Structured logging setup
//! - Common error types

pub mod config;
pub mod error;
pub mod logging;

// Re-exports for convenience
pub use config::{ConcurrencyCaps, ConfigError, FleetConfig, ProxyConfig, Settings};
pub use error::{FleetError, Result};
pub use logging::{
    generate_correlation_id, init_from_config, init_logging, log_batch_finished,
    log_batch_started, log_pool_event, log_store_event, EventCategory, LogEvent, LogLevel,
    LoggingError,
};
