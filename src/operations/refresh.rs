//! Credential refresh

use crate::common::error::{FleetError, Result};
use crate::exchange::CredentialExchangeClient;
use crate::types::account::{Account, AccountFlag, AccountPatch};

/// Enabled accounts holding a refresh credential
pub fn is_target(account: &Account) -> bool {
    !account.has_flag(AccountFlag::Disabled) && account.refresh_credential.is_some()
}

/// Worker minting a new short credential; rotates the refresh credential
/// only when the API returns a new one
pub fn refresh_worker(
    client: CredentialExchangeClient,
) -> impl Fn(&Account) -> Result<AccountPatch> + Send + Sync + 'static {
    move |account: &Account| {
        let refresh_credential = account
            .refresh_credential
            .as_deref()
            .ok_or_else(|| FleetError::validation("account has no refresh credential"))?;

        let refreshed = client.refresh(refresh_credential)?;
        Ok(AccountPatch::credentials(
            refreshed.short_credential,
            refreshed.refresh_credential,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::transport::{MockExchangeTransport, RefreshPayload, TransportError};
    use crate::exchange::PollPolicy;
    use std::sync::Arc;

    fn client(mock: MockExchangeTransport) -> CredentialExchangeClient {
        CredentialExchangeClient::new(Arc::new(mock), PollPolicy::default())
    }

    #[test]
    fn test_targets() {
        let account = Account::new("a@example.com");
        assert!(!is_target(&account));

        let account = account.with_credentials("short", "refresh");
        assert!(is_target(&account));
        assert!(!is_target(&account.with_flag(AccountFlag::Disabled, true)));
    }

    #[test]
    fn test_refresh_patch() {
        let mut mock = MockExchangeTransport::new();
        mock.expect_refresh()
            .withf(|credential| credential == "rt-1")
            .returning(|_| {
                Ok(RefreshPayload {
                    short_credential: Some("st-2".into()),
                    refresh_credential: Some("rt-2".into()),
                })
            });

        let worker = refresh_worker(client(mock));
        let patch = worker(&Account::new("a@example.com").with_credentials("st-1", "rt-1")).unwrap();

        assert_eq!(patch.short_credential.as_deref(), Some("st-2"));
        assert_eq!(patch.refresh_credential.as_deref(), Some("rt-2"));
        assert_eq!(patch.flags.get(&AccountFlag::CredentialInvalid), Some(&false));
    }

    #[test]
    fn test_rejected_refresh_fails_item() {
        let mut mock = MockExchangeTransport::new();
        mock.expect_refresh().returning(|_| {
            Err(TransportError::Status {
                status: 401,
                body: String::new(),
            })
        });

        let worker = refresh_worker(client(mock));
        let err = worker(&Account::new("a@example.com").with_credentials("st", "rt")).unwrap_err();
        assert_eq!(err.error_code(), "EXCHANGE_ERROR");
    }

    #[test]
    fn test_missing_refresh_credential() {
        let worker = refresh_worker(client(MockExchangeTransport::new()));
        let err = worker(&Account::new("a@example.com")).unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
    }
}
