//! Long-lived Session Artifact
//!
//! The externally issued artifact is an identity and a secret joined by a
//! delimiter. Upstream tooling emits it either with the literal `::` or with
//! its URL-encoded form `%3A%3A`. This type is the only place that knows
//! about either encoding; everything else holds a parsed [`SessionArtifact`]
//! and writes it back in the canonical `subject::secret` form.

use std::fmt;
use std::str::FromStr;

/// Canonical delimiter between subject and secret
pub const CANONICAL_DELIMITER: &str = "::";

/// URL-encoded delimiter accepted on input
pub const ENCODED_DELIMITER: &str = "%3A%3A";

/// Artifact parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact is empty")]
    Empty,

    #[error("artifact has no subject/secret delimiter")]
    MissingDelimiter,

    #[error("artifact contains more than one delimiter")]
    AmbiguousDelimiter,

    #[error("artifact subject is empty")]
    EmptySubject,

    #[error("artifact secret is empty")]
    EmptySecret,
}

/// Parsed identity+secret artifact
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionArtifact {
    subject: String,
    secret: String,
}

impl SessionArtifact {
    /// Build from parts
    pub fn new(subject: impl Into<String>, secret: impl Into<String>) -> Result<Self, ArtifactError> {
        let subject = subject.into();
        let secret = secret.into();

        if subject.trim().is_empty() {
            return Err(ArtifactError::EmptySubject);
        }
        if secret.trim().is_empty() {
            return Err(ArtifactError::EmptySecret);
        }

        Ok(Self { subject, secret })
    }

    /// Parse either delimiter encoding.
    ///
    /// Inputs carrying more than one delimiter (of either kind, overlapping
    /// occurrences included) are rejected, as are inputs where a colon in
    /// either encoding touches the delimiter.
    pub fn parse(raw: &str) -> Result<Self, ArtifactError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ArtifactError::Empty);
        }

        // ASCII uppercasing keeps byte offsets, so matches index into `raw`
        let upper = raw.to_ascii_uppercase();
        let canonical = occurrences(raw, CANONICAL_DELIMITER);
        let encoded = occurrences(&upper, ENCODED_DELIMITER);

        let (at, width) = match (canonical.as_slice(), encoded.as_slice()) {
            ([], []) => return Err(ArtifactError::MissingDelimiter),
            ([at], []) => (*at, CANONICAL_DELIMITER.len()),
            ([], [at]) => (*at, ENCODED_DELIMITER.len()),
            _ => return Err(ArtifactError::AmbiguousDelimiter),
        };

        let (before, after) = (&upper[..at], &upper[at + width..]);
        if before.ends_with(':')
            || before.ends_with("%3A")
            || after.starts_with(':')
            || after.starts_with("%3A")
        {
            return Err(ArtifactError::AmbiguousDelimiter);
        }

        Self::new(&raw[..at], &raw[at + width..])
    }

    /// Canonical text form
    pub fn format(&self) -> String {
        format!("{}{}{}", self.subject, CANONICAL_DELIMITER, self.secret)
    }

    /// Identity part
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Secret part
    pub fn secret(&self) -> &str {
        &self.secret
    }
}

/// Byte offsets of every occurrence of `needle`, overlapping ones included
fn occurrences(haystack: &str, needle: &str) -> Vec<usize> {
    let bytes = haystack.as_bytes();
    (0..bytes.len())
        .filter(|&i| bytes[i..].starts_with(needle.as_bytes()))
        .collect()
}

impl FromStr for SessionArtifact {
    type Err = ArtifactError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Debug for SessionArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionArtifact")
            .field("subject", &self.subject)
            .field("secret", &"<redacted>")
            .finish()
    }
}
