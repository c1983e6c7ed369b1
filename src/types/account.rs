//! Account Types
//!
//! A managed account as persisted in the account store, plus the patch type
//! batch workers produce for merge-back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::batch::{MergeKey, RecordPatch};

/// Status flags an account can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountFlag {
    /// A payment resource has been bound to the account
    PaymentBound,
    /// Excluded from batch operations
    Disabled,
    /// Last exchange/refresh was rejected by the remote side
    CredentialInvalid,
}

impl fmt::Display for AccountFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PaymentBound => write!(f, "payment_bound"),
            Self::Disabled => write!(f, "disabled"),
            Self::CredentialInvalid => write!(f, "credential_invalid"),
        }
    }
}

/// Normalize an email for identity comparison
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// A managed account
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Remote subject id; authoritative for identity when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stable_id: Option<String>,
    /// Login email, unique within the store
    pub email: String,
    /// Short-lived session credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_credential: Option<String>,
    /// Long-lived artifact in canonical `subject::secret` form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_credential: Option<String>,
    /// Credential used to mint new short credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_credential: Option<String>,
    /// When the account was first recorded
    pub created_at: DateTime<Utc>,
    /// Last modification, used to pick a winner between duplicates
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
    /// Status flags
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flags: BTreeMap<AccountFlag, bool>,
}

impl Account {
    /// Create a new account with only an email
    pub fn new(email: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            stable_id: None,
            email: email.into().trim().to_string(),
            short_credential: None,
            long_credential: None,
            refresh_credential: None,
            created_at: now,
            updated_at: now,
            flags: BTreeMap::new(),
        }
    }

    /// Set the long-lived artifact
    pub fn with_long_credential(mut self, artifact: impl Into<String>) -> Self {
        self.long_credential = Some(artifact.into());
        self
    }

    /// Set the session credentials
    pub fn with_credentials(mut self, short: impl Into<String>, refresh: impl Into<String>) -> Self {
        self.short_credential = Some(short.into());
        self.refresh_credential = Some(refresh.into());
        self
    }

    /// Set the stable id
    pub fn with_stable_id(mut self, stable_id: impl Into<String>) -> Self {
        self.stable_id = Some(stable_id.into());
        self
    }

    /// Set a flag
    pub fn with_flag(mut self, flag: AccountFlag, value: bool) -> Self {
        self.flags.insert(flag, value);
        self
    }

    /// Normalized email
    pub fn email_key(&self) -> String {
        normalize_email(&self.email)
    }

    /// Whether a flag is set to true
    pub fn has_flag(&self, flag: AccountFlag) -> bool {
        self.flags.get(&flag).copied().unwrap_or(false)
    }

    /// Merge another record for the same account into this one.
    ///
    /// Fields set on `other` win; fields it leaves unset are kept. Flags merge
    /// per flag. The earliest `created_at` is kept.
    pub fn merge_from(&mut self, other: Account) {
        if other.stable_id.is_some() {
            self.stable_id = other.stable_id;
        }
        if !other.email.trim().is_empty() {
            self.email = other.email;
        }
        if other.short_credential.is_some() {
            self.short_credential = other.short_credential;
        }
        if other.long_credential.is_some() {
            self.long_credential = other.long_credential;
        }
        if other.refresh_credential.is_some() {
            self.refresh_credential = other.refresh_credential;
        }
        self.created_at = self.created_at.min(other.created_at);
        self.updated_at = self.updated_at.max(other.updated_at);
        self.flags.extend(other.flags);
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("Account")
            .field("stable_id", &self.stable_id)
            .field("email", &self.email)
            .field("short_credential", &redact(&self.short_credential))
            .field("long_credential", &redact(&self.long_credential))
            .field("refresh_credential", &redact(&self.refresh_credential))
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .field("flags", &self.flags)
            .finish()
    }
}

impl MergeKey for Account {
    fn stable_id(&self) -> Option<&str> {
        self.stable_id.as_deref()
    }

    fn natural_key(&self) -> String {
        self.email_key()
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }
}

/// Fields a batch worker sets on an account
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountPatch {
    pub stable_id: Option<String>,
    pub short_credential: Option<String>,
    pub refresh_credential: Option<String>,
    pub flags: BTreeMap<AccountFlag, bool>,
}

impl AccountPatch {
    /// Patch carrying fresh session credentials
    pub fn credentials(short: impl Into<String>, refresh: Option<String>) -> Self {
        Self {
            short_credential: Some(short.into()),
            refresh_credential: refresh,
            ..Self::default()
        }
        .with_flag(AccountFlag::CredentialInvalid, false)
    }

    /// Set a flag
    pub fn with_flag(mut self, flag: AccountFlag, value: bool) -> Self {
        self.flags.insert(flag, value);
        self
    }

    /// Set the stable id
    pub fn with_stable_id(mut self, stable_id: Option<String>) -> Self {
        self.stable_id = stable_id;
        self
    }
}

impl RecordPatch<Account> for AccountPatch {
    fn apply(&self, record: &mut Account) {
        if let Some(id) = &self.stable_id {
            record.stable_id = Some(id.clone());
        }
        if let Some(short) = &self.short_credential {
            record.short_credential = Some(short.clone());
        }
        if let Some(refresh) = &self.refresh_credential {
            record.refresh_credential = Some(refresh.clone());
        }
        for (flag, value) in &self.flags {
            record.flags.insert(*flag, *value);
        }
    }
}
