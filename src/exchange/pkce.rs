//! PKCE verifier/challenge generation
//!
//! The verifier is 32 random bytes, base64url without padding (43 chars). The
//! challenge is `base64url(sha256(verifier))`, also unpadded.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// One exchange attempt: request id plus the PKCE pair
#[derive(Clone)]
pub struct ExchangeSession {
    pub request_id: String,
    pub verifier: String,
    pub challenge: String,
}

impl ExchangeSession {
    /// Fresh random session
    pub fn generate() -> Self {
        let verifier = generate_verifier();
        let challenge = challenge_for(&verifier);
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            verifier,
            challenge,
        }
    }
}

impl std::fmt::Debug for ExchangeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeSession")
            .field("request_id", &self.request_id)
            .field("challenge", &self.challenge)
            .finish_non_exhaustive()
    }
}

/// Random PKCE verifier
pub fn generate_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// S256 challenge for a verifier
pub fn challenge_for(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc7636_vector() {
        assert_eq!(
            challenge_for("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_verifier_shape() {
        let verifier = generate_verifier();
        assert_eq!(verifier.len(), 43);
        assert!(verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(verifier, generate_verifier());
    }

    #[test]
    fn test_session_is_consistent() {
        let session = ExchangeSession::generate();
        assert_eq!(session.challenge, challenge_for(&session.verifier));
        assert!(!format!("{:?}", session).contains(&session.verifier));
    }
}
