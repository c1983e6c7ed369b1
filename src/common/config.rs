//! Environment-based Configuration for account-fleet
//!
//! Configuration is read from environment variables (optionally seeded from a
//! `.env` file by the binary) and then overlaid with the persisted
//! [`Settings`] document, so that toggles made from the CLI survive restarts.
//!
//! # Environment Variables
//!
//! ## Storage
//! - `FLEET_DATA_DIR` - Directory holding the account, pool and settings stores
//!
//! ## Network
//! - `FLEET_API_BASE` - Base URL of the auth API (begin/poll/refresh)
//! - `FLEET_PROXY_ENABLED` - "1"/"true" to route every outbound call via proxy
//! - `FLEET_PROXY_URL` - Proxy URL (required when the proxy is enabled)
//! - `FLEET_HTTP_TIMEOUT_SECS` - Per-call timeout
//!
//! ## Batch operations
//! - `FLEET_REFRESH_CONCURRENCY` / `FLEET_CONVERT_CONCURRENCY` /
//!   `FLEET_BIND_CONCURRENCY` - Worker caps per operation
//! - `FLEET_POLL_ATTEMPTS` - Exchange polling bound
//! - `FLEET_POLL_INTERVAL_MS` - Exchange polling interval
//! - `FLEET_BIND_COMMAND` - External binding agent command
//!
//! ## Logging
//! - `FLEET_LOG_LEVEL` - Logging level (trace, debug, info, warn, error)
//! - `FLEET_LOG_JSON` - Set to "1" for JSON log output

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::exchange::PollPolicy;
use crate::operations::Operation;

/// Upper bound for any per-operation worker cap
pub const MAX_CONCURRENCY: usize = 200;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Outbound proxy configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Whether outbound calls go through the proxy
    pub enabled: bool,
    /// Proxy URL
    pub url: Option<String>,
}

/// Worker caps per batch operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyCaps {
    pub refresh: usize,
    pub convert: usize,
    pub bind: usize,
}

impl Default for ConcurrencyCaps {
    fn default() -> Self {
        Self {
            refresh: 100,
            convert: 50,
            // Binding spends pool resources, keep it narrow
            bind: 20,
        }
    }
}

/// Persisted runtime overrides
///
/// Every field is optional; an unset field leaves the environment value in
/// place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convert_concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Directory holding all document stores
    pub data_dir: PathBuf,

    /// Auth API base URL
    pub api_base: String,

    /// Outbound proxy
    pub proxy: ProxyConfig,

    /// Per-call HTTP timeout
    pub http_timeout: Duration,

    /// Worker caps
    pub concurrency: ConcurrencyCaps,

    /// Exchange polling bound
    pub poll_attempts: u32,

    /// Exchange polling interval
    pub poll_interval: Duration,

    /// External binding agent command
    pub bind_command: Option<String>,

    /// Log level
    pub log_level: String,

    /// Emit JSON logs
    pub log_json: bool,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            api_base: "https://api.example.invalid".to_string(),
            proxy: ProxyConfig::default(),
            http_timeout: Duration::from_secs(20),
            concurrency: ConcurrencyCaps::default(),
            poll_attempts: PollPolicy::default().max_attempts,
            poll_interval: PollPolicy::default().interval,
            bind_command: None,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl FleetConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let data_dir = lookup("FLEET_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let api_base = lookup("FLEET_API_BASE")
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_base);

        let proxy = ProxyConfig {
            enabled: parse_var(&lookup, "FLEET_PROXY_ENABLED", parse_bool)?.unwrap_or(false),
            url: lookup("FLEET_PROXY_URL").filter(|v| !v.trim().is_empty()),
        };

        let http_timeout = parse_var(&lookup, "FLEET_HTTP_TIMEOUT_SECS", parse_number::<u64>)?
            .map(Duration::from_secs)
            .unwrap_or(defaults.http_timeout);

        let concurrency = ConcurrencyCaps {
            refresh: parse_var(&lookup, "FLEET_REFRESH_CONCURRENCY", parse_number)?
                .unwrap_or(defaults.concurrency.refresh),
            convert: parse_var(&lookup, "FLEET_CONVERT_CONCURRENCY", parse_number)?
                .unwrap_or(defaults.concurrency.convert),
            bind: parse_var(&lookup, "FLEET_BIND_CONCURRENCY", parse_number)?
                .unwrap_or(defaults.concurrency.bind),
        };

        let poll_attempts = parse_var(&lookup, "FLEET_POLL_ATTEMPTS", parse_number)?
            .unwrap_or(defaults.poll_attempts);

        let poll_interval = parse_var(&lookup, "FLEET_POLL_INTERVAL_MS", parse_number::<u64>)?
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        let bind_command = lookup("FLEET_BIND_COMMAND").filter(|v| !v.trim().is_empty());

        let log_level = lookup("FLEET_LOG_LEVEL").unwrap_or(defaults.log_level);
        let log_json = parse_var(&lookup, "FLEET_LOG_JSON", parse_bool)?.unwrap_or(false);

        let config = Self {
            data_dir,
            api_base,
            proxy,
            http_timeout,
            concurrency,
            poll_attempts,
            poll_interval,
            bind_command,
            log_level,
            log_json,
        };

        config.validate()?;
        Ok(config)
    }

    /// Overlay persisted settings and re-validate
    pub fn apply_settings(&mut self, settings: &Settings) -> Result<(), ConfigError> {
        if let Some(enabled) = settings.proxy_enabled {
            self.proxy.enabled = enabled;
        }
        if let Some(url) = &settings.proxy_url {
            self.proxy.url = Some(url.clone());
        }
        if let Some(cap) = settings.refresh_concurrency {
            self.concurrency.refresh = cap;
        }
        if let Some(cap) = settings.convert_concurrency {
            self.concurrency.convert = cap;
        }
        if let Some(cap) = settings.bind_concurrency {
            self.concurrency.bind = cap;
        }
        if let Some(attempts) = settings.poll_attempts {
            self.poll_attempts = attempts;
        }
        if let Some(ms) = settings.poll_interval_ms {
            self.poll_interval = Duration::from_millis(ms);
        }

        self.validate()
    }

    /// Validate value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, cap) in [
            ("FLEET_REFRESH_CONCURRENCY", self.concurrency.refresh),
            ("FLEET_CONVERT_CONCURRENCY", self.concurrency.convert),
            ("FLEET_BIND_CONCURRENCY", self.concurrency.bind),
        ] {
            if cap == 0 || cap > MAX_CONCURRENCY {
                return Err(ConfigError::InvalidValue(
                    name.to_string(),
                    format!("must be between 1 and {}", MAX_CONCURRENCY),
                ));
            }
        }

        if self.poll_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "FLEET_POLL_ATTEMPTS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        if self.proxy.enabled && self.proxy.url.is_none() {
            return Err(ConfigError::MissingEnvVar("FLEET_PROXY_URL".to_string()));
        }

        if self.http_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "FLEET_HTTP_TIMEOUT_SECS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Proxy URL to use for outbound calls, if the proxy is on
    pub fn active_proxy(&self) -> Option<&str> {
        if self.proxy.enabled {
            self.proxy.url.as_deref()
        } else {
            None
        }
    }

    /// Worker cap for a batch operation
    pub fn concurrency_for(&self, operation: Operation) -> usize {
        match operation {
            Operation::Refresh => self.concurrency.refresh,
            Operation::Convert => self.concurrency.convert,
            Operation::Bind => self.concurrency.bind,
        }
    }

    /// Exchange polling policy
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            max_attempts: self.poll_attempts,
            interval: self.poll_interval,
        }
    }

    pub fn accounts_path(&self) -> PathBuf {
        self.data_dir.join("accounts.json")
    }

    pub fn pool_path(&self) -> PathBuf {
        self.data_dir.join("resource_pool.json")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }

    /// Print configuration summary (hiding the proxy credentials)
    pub fn print_summary(&self) {
        println!("=== account-fleet Configuration ===");
        println!("Data dir: {}", display_path(&self.data_dir));
        println!("API base: {}", self.api_base);
        println!(
            "Proxy: {}",
            match self.active_proxy() {
                Some(url) => redact_proxy(url),
                None => "off".to_string(),
            }
        );
        println!("HTTP timeout: {}s", self.http_timeout.as_secs());
        println!(
            "Concurrency: refresh={} convert={} bind={}",
            self.concurrency.refresh, self.concurrency.convert, self.concurrency.bind
        );
        println!(
            "Polling: {} attempts every {}ms",
            self.poll_attempts,
            self.poll_interval.as_millis()
        );
        println!(
            "Bind command: {}",
            self.bind_command.as_deref().unwrap_or("(not set)")
        );
        println!("Log Level: {}", self.log_level);
        println!("===================================");
    }
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}

/// Strip userinfo from a proxy URL before printing it
fn redact_proxy(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) => match rest.rsplit_once('@') {
            Some((_, host)) => format!("{}://***@{}", scheme, host),
            None => url.to_string(),
        },
        None => url.to_string(),
    }
}

fn parse_var<F, T, P>(lookup: &F, name: &str, parse: P) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    P: Fn(&str, &str) -> Result<T, ConfigError>,
{
    match lookup(name) {
        Some(value) if !value.trim().is_empty() => parse(name, value.trim()).map(Some),
        _ => Ok(None),
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("expected a boolean, got {}", value),
        )),
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| {
        ConfigError::InvalidValue(name.to_string(), format!("must be a number, got {}", value))
    })
}
