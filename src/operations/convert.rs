//! Artifact conversion
//!
//! Trades an account's long-lived artifact for session credentials through
//! the exchange handshake. The API's subject id, or the artifact subject when
//! the API reports none, becomes the account's stable id.

use crate::common::error::Result;
use crate::exchange::CredentialExchangeClient;
use crate::types::account::{Account, AccountFlag, AccountPatch};
use crate::types::artifact::SessionArtifact;

/// Enabled accounts with an artifact and no usable short credential
pub fn is_target(account: &Account) -> bool {
    !account.has_flag(AccountFlag::Disabled)
        && account.long_credential.is_some()
        && (account.short_credential.is_none() || account.has_flag(AccountFlag::CredentialInvalid))
}

pub fn convert_worker(
    client: CredentialExchangeClient,
) -> impl Fn(&Account) -> Result<AccountPatch> + Send + Sync + 'static {
    move |account: &Account| {
        let artifact = SessionArtifact::parse(account.long_credential.as_deref().unwrap_or_default())?;
        let credentials = client.exchange(&artifact)?;

        let stable_id = credentials
            .subject_id
            .unwrap_or_else(|| artifact.subject().to_string());
        Ok(
            AccountPatch::credentials(credentials.short_credential, Some(credentials.refresh_credential))
                .with_stable_id(Some(stable_id)),
        )
    }
}
