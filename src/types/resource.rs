//! Resource Pool Types
//!
//! A pooled payment instrument and its lifecycle:
//! available → allocated → used | used+problematic, or allocated → available
//! on release.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Derived lifecycle state of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// Eligible for allocation
    Available,
    /// Handed to exactly one caller, not yet settled
    Allocated,
    /// Consumed by a successful binding
    Used,
    /// Exposed to the remote side and then failed; retired for good
    Problematic,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::Allocated => write!(f, "allocated"),
            Self::Used => write!(f, "used"),
            Self::Problematic => write!(f, "problematic"),
        }
    }
}

/// Resource import errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceParseError {
    #[error("empty identifier")]
    EmptyIdentifier,

    #[error("malformed attribute: {0}")]
    MalformedAttribute(String),
}

/// A pooled payment instrument
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Unique identifier within the pool
    pub identifier: String,
    /// Instrument attributes (expiry, holder, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    /// Currently handed out
    #[serde(default)]
    pub allocated: bool,
    /// Consumed
    #[serde(default)]
    pub used: bool,
    /// Failed after exposure
    #[serde(default)]
    pub problematic: bool,
}

impl Resource {
    /// Create an available resource
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            attributes: BTreeMap::new(),
            allocated: false,
            used: false,
            problematic: false,
        }
    }

    /// Add an attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Parse an import line: `identifier|key=value|key=value`
    pub fn parse_line(line: &str) -> Result<Self, ResourceParseError> {
        let mut parts = line.trim().split('|').map(str::trim);

        let identifier = parts
            .next()
            .filter(|id| !id.is_empty())
            .ok_or(ResourceParseError::EmptyIdentifier)?;

        let mut resource = Self::new(identifier);
        for part in parts.filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .filter(|(k, _)| !k.trim().is_empty())
                .ok_or_else(|| ResourceParseError::MalformedAttribute(part.to_string()))?;
            resource
                .attributes
                .insert(key.trim().to_string(), value.trim().to_string());
        }

        Ok(resource)
    }

    /// Lifecycle state derived from the flags
    pub fn state(&self) -> ResourceState {
        if self.problematic {
            ResourceState::Problematic
        } else if self.used {
            ResourceState::Used
        } else if self.allocated {
            ResourceState::Allocated
        } else {
            ResourceState::Available
        }
    }

    pub fn is_available(&self) -> bool {
        self.state() == ResourceState::Available
    }

    /// Identifier safe for logs: last four characters only, nothing at all
    /// for identifiers shorter than eight characters
    pub fn masked_identifier(&self) -> String {
        let chars: Vec<char> = self.identifier.chars().collect();
        if chars.len() < 8 {
            return "****".to_string();
        }
        let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
        format!("****{}", tail)
    }

    /// Clear every lifecycle flag
    pub(crate) fn clear_flags(&mut self) {
        self.allocated = false;
        self.used = false;
        self.problematic = false;
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("identifier", &self.masked_identifier())
            .field("attributes", &self.attributes.keys().collect::<Vec<_>>())
            .field("state", &self.state())
            .finish()
    }
}
