//! Auth API transport
//!
//! `begin`, `poll` and `refresh` calls against the remote auth API. The
//! [`ExchangeTransport`] trait is the seam the exchange client is tested
//! through; [`HttpExchangeTransport`] is the blocking reqwest implementation.

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

use crate::common::config::FleetConfig;
use crate::types::artifact::SessionArtifact;

/// Credential fields returned by a successful poll
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PollPayload {
    #[serde(default)]
    pub short_credential: Option<String>,
    #[serde(default)]
    pub refresh_credential: Option<String>,
    #[serde(default)]
    pub subject_id: Option<String>,
}

/// Credential fields returned by a refresh
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RefreshPayload {
    #[serde(default)]
    pub short_credential: Option<String>,
    #[serde(default)]
    pub refresh_credential: Option<String>,
}

/// Outcome of one poll request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResponse {
    /// 2xx with a body
    Ready(PollPayload),
    /// 404: the other side has not completed yet
    Pending,
    /// Any other status
    Unexpected { status: u16 },
}

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid proxy URL {url}: {source}")]
    InvalidProxy {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response body: {0}")]
    Decode(String),
}

impl TransportError {
    /// Timeouts, connection failures and 5xx responses
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            TransportError::Status { status, .. } => *status >= 500,
            TransportError::InvalidProxy { .. } | TransportError::Decode(_) => false,
        }
    }
}

/// Remote side of the credential exchange
#[cfg_attr(test, mockall::automock)]
pub trait ExchangeTransport: Send + Sync {
    /// Register `request_id` + `challenge`, authenticated with the artifact
    fn begin(
        &self,
        artifact: &SessionArtifact,
        request_id: &str,
        challenge: &str,
    ) -> Result<(), TransportError>;

    /// Ask whether the exchange for `request_id` has completed
    fn poll(&self, request_id: &str, verifier: &str) -> Result<PollResponse, TransportError>;

    /// Mint a new short credential
    fn refresh(&self, refresh_credential: &str) -> Result<RefreshPayload, TransportError>;
}

/// Blocking HTTP transport
#[derive(Debug, Clone)]
pub struct HttpExchangeTransport {
    client: Client,
    base_url: String,
}

impl HttpExchangeTransport {
    /// Create a transport with a per-call timeout and optional proxy
    pub fn new(base_url: &str, timeout: Duration, proxy: Option<&str>) -> Result<Self, TransportError> {
        let builder = Client::builder().timeout(timeout);
        let builder = match proxy {
            Some(url) => {
                let proxy = reqwest::Proxy::all(url).map_err(|source| TransportError::InvalidProxy {
                    url: url.to_string(),
                    source,
                })?;
                builder.proxy(proxy)
            }
            None => builder.no_proxy(),
        };

        Ok(Self {
            client: builder.build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Create a transport from configuration
    pub fn from_config(config: &FleetConfig) -> Result<Self, TransportError> {
        Self::new(&config.api_base, config.http_timeout, config.active_proxy())
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn rejected(resp: reqwest::blocking::Response) -> TransportError {
        let status = resp.status().as_u16();
        let body = resp.text().unwrap_or_default();
        TransportError::Status { status, body }
    }
}

impl ExchangeTransport for HttpExchangeTransport {
    fn begin(
        &self,
        artifact: &SessionArtifact,
        request_id: &str,
        challenge: &str,
    ) -> Result<(), TransportError> {
        let url = format!("{}/auth/begin", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(artifact.format())
            .json(&serde_json::json!({
                "request_id": request_id,
                "challenge": challenge
            }))
            .send()?;

        if !resp.status().is_success() {
            return Err(Self::rejected(resp));
        }
        Ok(())
    }

    fn poll(&self, request_id: &str, verifier: &str) -> Result<PollResponse, TransportError> {
        let url = format!("{}/auth/poll", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("request_id", request_id), ("verifier", verifier)])
            .send()?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(PollResponse::Pending);
        }
        if !status.is_success() {
            return Ok(PollResponse::Unexpected {
                status: status.as_u16(),
            });
        }

        let text = resp.text()?;
        let payload: PollPayload =
            serde_json::from_str(&text).map_err(|e| TransportError::Decode(e.to_string()))?;
        Ok(PollResponse::Ready(payload))
    }

    fn refresh(&self, refresh_credential: &str) -> Result<RefreshPayload, TransportError> {
        let url = format!("{}/auth/refresh", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "refresh_credential": refresh_credential }))
            .send()?;

        if !resp.status().is_success() {
            return Err(Self::rejected(resp));
        }

        let text = resp.text()?;
        serde_json::from_str(&text).map_err(|e| TransportError::Decode(e.to_string()))
    }
}
