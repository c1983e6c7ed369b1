//! Domain Types
//!
//! - `account` - Managed accounts and the merge-back patch
//! - `resource` - Pooled payment instruments
//! - `artifact` - The typed long-lived artifact

pub mod account;
pub mod artifact;
pub mod resource;

pub use account::{normalize_email, Account, AccountFlag, AccountPatch};
pub use artifact::{ArtifactError, SessionArtifact};
pub use resource::{Resource, ResourceParseError, ResourceState};
