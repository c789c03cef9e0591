//! Ports to the two independently owned stores of "who can do what".
//!
//! The identity provider holds the metadata mirror consumed by downstream
//! authorization; the user directory is the application database's view of
//! the user. Neither store participates in a transaction with the other.

use async_trait::async_trait;
use authz::DatabaseUserRecord;
use serde_json::{Map, Value};

use crate::error::Result;

/// The external identity provider's per-user metadata store.
///
/// Metadata is exchanged as a raw property bag. Implementations should map
/// transport or availability failures to
/// [`IdentityError::IdentityProviderUnavailable`](crate::error::IdentityError::IdentityProviderUnavailable).
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// The user's metadata bag, or `None` if the provider has no such user.
    async fn read_metadata(&self, user_id: &str) -> Result<Option<Map<String, Value>>>;

    /// Replace the user's metadata bag.
    async fn write_metadata(&self, user_id: &str, metadata: Map<String, Value>) -> Result<()>;
}

/// The application database's user records.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Look up a user by identity-provider id.
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<DatabaseUserRecord>>;

    /// Identity-provider ids of every known user.
    async fn list_external_ids(&self) -> Result<Vec<String>>;
}
