use std::time::Duration;

use thiserror::Error;

use crate::mutex::OperationKind;

#[derive(Error, Debug)]
pub enum IdentityError {
    /// The operation did not acquire the lock, or did not finish, in time.
    #[error("Auth operation {operation_id} ({kind}) timed out after {timeout:?}")]
    MutexTimeout {
        operation_id: String,
        kind: OperationKind,
        timeout: Duration,
    },

    /// A queued operation was failed by `force_release_all`.
    #[error("Auth operation {operation_id} was cancelled")]
    MutexCancelled { operation_id: String },

    #[error("Identity provider unavailable: {0}")]
    IdentityProviderUnavailable(String),

    /// Incremental capability edits need a role to have been assigned first.
    #[error("No existing permissions for user: {0}")]
    NoExistingPermissions(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Authorization model error: {0}")]
    Authz(#[from] authz::AuthzError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Audit log error: {0}")]
    AuditLog(String),

    #[error("Hash verification failed")]
    HashVerificationFailed,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Initialization error: {0}")]
    Initialization(String),
}

impl IdentityError {
    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IdentityError::MutexTimeout { .. }
                | IdentityError::MutexCancelled { .. }
                | IdentityError::IdentityProviderUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, IdentityError>;
