//! Credential Exchange
//!
//! PKCE-style begin/poll handshake trading a long-lived artifact for session
//! credentials, plus refresh of short credentials.

pub mod client;
pub mod pkce;
pub mod transport;

pub use client::{
    CredentialExchangeClient, ExchangeError, ExchangeState, PollPolicy, RefreshedCredentials,
    SessionCredentials,
};
pub use pkce::{challenge_for, generate_verifier, ExchangeSession};
pub use transport::{
    ExchangeTransport, HttpExchangeTransport, PollPayload, PollResponse, RefreshPayload,
    TransportError,
};
