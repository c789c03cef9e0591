//! Error types for the authorization model.
//!
//! # Security Note
//! These errors describe malformed role or metadata input. They never carry
//! capability lists, so they are safe to surface in operational logs.

use thiserror::Error;

/// Errors that can occur while parsing or projecting authorization state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    /// A role name outside the fixed hierarchy.
    ///
    /// Callers on the authorization path do not propagate this; they fall back
    /// to the lowest role and log a warning instead.
    #[error("Unknown role: {0}")]
    UnknownRole(String),

    /// A metadata property bag could not be coerced into the strict schema.
    #[error("Invalid identity metadata: {0}")]
    InvalidMetadata(String),
}

/// A specialized Result type for authorization operations.
pub type Result<T> = std::result::Result<T, AuthzError>;
