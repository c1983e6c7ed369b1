//! Credential exchange client
//!
//! ```text
//! INIT ──begin──► BEGIN_SENT ──► POLLING ──► SUCCESS
//!   │                               └──────► TIMEOUT
//!   └──rejected──► INIT_FAILED
//! ```
//!
//! Begin is sent once. Polling is the only retry loop and runs on the calling
//! thread, sleeping `interval` between attempts.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::pkce::ExchangeSession;
use super::transport::{ExchangeTransport, PollResponse, TransportError};
use crate::types::artifact::SessionArtifact;

/// Polling bound and interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 40,
            interval: Duration::from_millis(500),
        }
    }
}

/// Exchange progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Init,
    BeginSent,
    Polling { attempt: u32 },
    Success,
    Timeout,
    InitFailed,
}

impl fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::BeginSent => write!(f, "begin_sent"),
            Self::Polling { attempt } => write!(f, "polling({})", attempt),
            Self::Success => write!(f, "success"),
            Self::Timeout => write!(f, "timeout"),
            Self::InitFailed => write!(f, "init_failed"),
        }
    }
}

/// Exchange errors
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("exchange begin rejected: {0}")]
    Init(#[source] TransportError),

    #[error("no credentials after {attempts} poll attempts")]
    PollTimeout { attempts: u32 },

    #[error("refresh rejected: {0}")]
    RefreshRejected(#[source] TransportError),

    #[error("refresh response carried no short credential")]
    IncompleteRefresh,
}

impl ExchangeError {
    /// Whether running the same item again may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ExchangeError::PollTimeout { .. } => true,
            ExchangeError::Init(e) | ExchangeError::RefreshRejected(e) => e.is_transient(),
            ExchangeError::IncompleteRefresh => false,
        }
    }
}

/// Credentials obtained by an exchange
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    pub short_credential: String,
    pub refresh_credential: String,
    /// Remote subject id, when the API reports one
    pub subject_id: Option<String>,
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("subject_id", &self.subject_id)
            .finish_non_exhaustive()
    }
}

/// Credentials obtained by a refresh; `refresh_credential` is set only when rotated
#[derive(Clone, PartialEq, Eq)]
pub struct RefreshedCredentials {
    pub short_credential: String,
    pub refresh_credential: Option<String>,
}

impl fmt::Debug for RefreshedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshedCredentials")
            .field("rotated", &self.refresh_credential.is_some())
            .finish_non_exhaustive()
    }
}

/// Trades long-lived artifacts for session credentials
#[derive(Clone)]
pub struct CredentialExchangeClient {
    transport: Arc<dyn ExchangeTransport>,
    policy: PollPolicy,
}

impl CredentialExchangeClient {
    pub fn new(transport: Arc<dyn ExchangeTransport>, policy: PollPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    /// Run one full exchange for `artifact`. Blocks for up to
    /// `max_attempts * interval` plus network time.
    pub fn exchange(&self, artifact: &SessionArtifact) -> Result<SessionCredentials, ExchangeError> {
        let session = ExchangeSession::generate();
        let mut state = ExchangeState::Init;
        trace_state(&session, state);

        if let Err(e) = self
            .transport
            .begin(artifact, &session.request_id, &session.challenge)
        {
            state = ExchangeState::InitFailed;
            trace_state(&session, state);
            tracing::warn!(
                target: "fleet::exchange",
                request_id = %session.request_id,
                error = %e,
                "Exchange begin rejected"
            );
            return Err(ExchangeError::Init(e));
        }
        state = ExchangeState::BeginSent;
        trace_state(&session, state);

        for attempt in 1..=self.policy.max_attempts {
            if attempt > 1 {
                std::thread::sleep(self.policy.interval);
            }
            state = ExchangeState::Polling { attempt };
            trace_state(&session, state);

            match self.transport.poll(&session.request_id, &session.verifier) {
                Ok(PollResponse::Ready(payload)) => {
                    match (payload.short_credential, payload.refresh_credential) {
                        (Some(short_credential), Some(refresh_credential)) => {
                            state = ExchangeState::Success;
                            trace_state(&session, state);
                            tracing::info!(
                                target: "fleet::exchange",
                                request_id = %session.request_id,
                                attempt,
                                "Exchange completed"
                            );
                            return Ok(SessionCredentials {
                                short_credential,
                                refresh_credential,
                                subject_id: payload.subject_id,
                            });
                        }
                        _ => tracing::warn!(
                            target: "fleet::exchange",
                            request_id = %session.request_id,
                            attempt,
                            "Poll succeeded without both credentials"
                        ),
                    }
                }
                Ok(PollResponse::Pending) => {}
                Ok(PollResponse::Unexpected { status }) => tracing::warn!(
                    target: "fleet::exchange",
                    request_id = %session.request_id,
                    attempt,
                    status,
                    "Unexpected poll status"
                ),
                Err(e) => tracing::warn!(
                    target: "fleet::exchange",
                    request_id = %session.request_id,
                    attempt,
                    error = %e,
                    "Poll request failed"
                ),
            }
        }

        state = ExchangeState::Timeout;
        trace_state(&session, state);
        Err(ExchangeError::PollTimeout {
            attempts: self.policy.max_attempts,
        })
    }

    /// Mint a new short credential from a refresh credential
    pub fn refresh(&self, refresh_credential: &str) -> Result<RefreshedCredentials, ExchangeError> {
        let payload = self
            .transport
            .refresh(refresh_credential)
            .map_err(ExchangeError::RefreshRejected)?;

        let short_credential = payload
            .short_credential
            .filter(|c| !c.is_empty())
            .ok_or(ExchangeError::IncompleteRefresh)?;

        Ok(RefreshedCredentials {
            short_credential,
            refresh_credential: payload.refresh_credential.filter(|c| !c.is_empty()),
        })
    }
}

fn trace_state(session: &ExchangeSession, state: ExchangeState) {
    tracing::debug!(
        target: "fleet::exchange",
        request_id = %session.request_id,
        state = %state,
        "Exchange state"
    );
}
