//! Account Registry
//!
//! Domain layer over the account document store. Identity resolves by stable
//! id first and falls back to the normalized email; every mutation is one
//! read-modify-write through the store.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use crate::storage::{DocumentStore, StorageError, WriteIntent};
use crate::types::account::{normalize_email, Account};
use crate::types::artifact::{ArtifactError, SessionArtifact};

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("account storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid email: {0:?}")]
    InvalidEmail(String),

    #[error("line {line}: {reason}")]
    InvalidLine { line: usize, reason: String },

    #[error("line {line}: {source}")]
    InvalidArtifact {
        line: usize,
        #[source]
        source: ArtifactError,
    },
}

/// What an upsert did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Merged,
}

/// Counts for a multi-record upsert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub merged: usize,
}

/// Account registry
pub struct AccountRegistry {
    store: Arc<dyn DocumentStore<Account>>,
}

impl AccountRegistry {
    pub fn new(store: Arc<dyn DocumentStore<Account>>) -> Self {
        Self { store }
    }

    /// The underlying store, shared with batch runs
    pub fn store(&self) -> Arc<dyn DocumentStore<Account>> {
        self.store.clone()
    }

    /// Find by stable id, else by email
    pub fn find(&self, key: &str) -> Result<Option<Account>, RegistryError> {
        let accounts = self.store.load()?;
        let by_stable_id = accounts.iter().find(|a| a.stable_id.as_deref() == Some(key));
        let found = by_stable_id.or_else(|| {
            let email = normalize_email(key);
            accounts.iter().find(|a| a.email_key() == email)
        });
        Ok(found.cloned())
    }

    pub fn list(&self) -> Result<Vec<Account>, RegistryError> {
        Ok(self.store.load()?)
    }

    /// Accounts matching `filter`, in store order
    pub fn select<F>(&self, filter: F) -> Result<Vec<Account>, RegistryError>
    where
        F: Fn(&Account) -> bool,
    {
        Ok(self.store.load()?.into_iter().filter(|a| filter(a)).collect())
    }

    /// Insert, or merge into the account with the same stable id (else email)
    pub fn upsert(&self, account: Account) -> Result<UpsertOutcome, RegistryError> {
        validate_email(&account.email)?;

        let mut outcome = UpsertOutcome::Inserted;
        let mut incoming = Some(account);
        let now = Utc::now();
        self.store.update(&mut |accounts| match incoming.take() {
            Some(account) => {
                outcome = upsert_into(accounts, account, now);
                WriteIntent::Save
            }
            None => WriteIntent::Skip,
        })?;

        Ok(outcome)
    }

    /// Upsert several accounts with a single write
    pub fn upsert_many(&self, accounts: Vec<Account>) -> Result<UpsertSummary, RegistryError> {
        for account in &accounts {
            validate_email(&account.email)?;
        }

        let mut summary = UpsertSummary::default();
        let mut incoming = Some(accounts);
        let now = Utc::now();
        self.store.update(&mut |stored| {
            for account in incoming.take().unwrap_or_default() {
                match upsert_into(stored, account, now) {
                    UpsertOutcome::Inserted => summary.inserted += 1,
                    UpsertOutcome::Merged => summary.merged += 1,
                }
            }
            if summary.inserted + summary.merged > 0 {
                WriteIntent::Save
            } else {
                WriteIntent::Skip
            }
        })?;

        Ok(summary)
    }

    /// Remove one account. Never empties the store: removing the last
    /// account is refused and returns false; use [`Self::remove_bulk`].
    pub fn remove(&self, email: &str) -> Result<bool, RegistryError> {
        let key = normalize_email(email);
        let mut found = false;
        let persisted = self.store.update(&mut |accounts| {
            let before = accounts.len();
            accounts.retain(|a| a.email_key() != key);
            found = accounts.len() < before;
            if found {
                WriteIntent::Save
            } else {
                WriteIntent::Skip
            }
        })?;

        if found && !persisted {
            tracing::warn!(
                target: "fleet::store",
                email = %key,
                "Refused to remove the last account; use bulk removal"
            );
        }
        Ok(persisted)
    }

    /// User-initiated bulk delete; may empty the store
    pub fn remove_bulk(&self, emails: &[String]) -> Result<usize, RegistryError> {
        let keys: HashSet<String> = emails.iter().map(|e| normalize_email(e)).collect();
        let mut removed = 0;
        self.store.update(&mut |accounts| {
            let before = accounts.len();
            accounts.retain(|a| !keys.contains(&a.email_key()));
            removed = before - accounts.len();
            if removed > 0 {
                WriteIntent::SaveAllowEmpty
            } else {
                WriteIntent::Skip
            }
        })?;

        Ok(removed)
    }

    /// Import `email<sep>artifact` lines; `,`, tab or spaces separate the
    /// fields, blank lines and `#` comments are skipped. Nothing is written
    /// unless every line parses.
    pub fn import_lines(&self, text: &str) -> Result<UpsertSummary, RegistryError> {
        let mut accounts = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let number = index + 1;
            let (email, artifact) = line
                .split_once(|c: char| c == ',' || c.is_whitespace())
                .map(|(e, a)| (e.trim(), a.trim()))
                .filter(|(_, a)| !a.is_empty())
                .ok_or_else(|| RegistryError::InvalidLine {
                    line: number,
                    reason: "expected `email,artifact`".to_string(),
                })?;

            validate_email(email).map_err(|_| RegistryError::InvalidLine {
                line: number,
                reason: format!("invalid email {:?}", email),
            })?;
            let artifact = SessionArtifact::parse(artifact).map_err(|source| {
                RegistryError::InvalidArtifact {
                    line: number,
                    source,
                }
            })?;

            accounts.push(Account::new(email).with_long_credential(artifact.format()));
        }

        self.upsert_many(accounts)
    }
}

fn validate_email(email: &str) -> Result<(), RegistryError> {
    let email = email.trim();
    match email.split_once('@') {
        Some((local, domain))
            if !local.is_empty() && !domain.is_empty() && !email.contains(char::is_whitespace) =>
        {
            Ok(())
        }
        _ => Err(RegistryError::InvalidEmail(email.to_string())),
    }
}

/// Merge `incoming` into its match or append it. A stable-id match that
/// changes the email absorbs any other record holding that email.
fn upsert_into(accounts: &mut Vec<Account>, mut incoming: Account, now: DateTime<Utc>) -> UpsertOutcome {
    let position = incoming
        .stable_id
        .as_deref()
        .and_then(|id| accounts.iter().position(|a| a.stable_id.as_deref() == Some(id)))
        .or_else(|| {
            let key = incoming.email_key();
            accounts.iter().position(|a| a.email_key() == key)
        });

    let Some(mut position) = position else {
        incoming.updated_at = now;
        accounts.push(incoming);
        return UpsertOutcome::Inserted;
    };

    accounts[position].merge_from(incoming);
    accounts[position].updated_at = now;

    let key = accounts[position].email_key();
    let clash = accounts
        .iter()
        .enumerate()
        .position(|(i, a)| i != position && a.email_key() == key);
    if let Some(other) = clash {
        let mut absorbed = accounts.remove(other);
        if other < position {
            position -= 1;
        }
        absorbed.merge_from(accounts[position].clone());
        accounts[position] = absorbed;
    }

    UpsertOutcome::Merged
}
