//! Role and permission model for the identity synchronization core.
//!
//! Everything in this crate is pure: no I/O, no async, no shared state. It
//! answers three questions that every authorization decision depends on:
//!
//! 1. **What can a role do?** The [`PermissionCatalog`] maps each role in the
//!    fixed hierarchy to its full capability set, with monotonic inheritance.
//! 2. **Did anything change?** [`hashing::permission_hash`] digests a
//!    capability set so two snapshots can be compared in O(1).
//! 3. **What does the data layer see?** The [`ClaimsBuilder`] projects stored
//!    metadata into the flat claims payload consumed by the downstream
//!    authorization engine.
//!
//! The [`metadata`] module defines the strict schema for the role/permission
//! mirror held by the identity provider, including validation and coercion of
//! the provider's loosely typed property bag.
//!
//! # Security Architecture
//!
//! - Deny by default: a missing or unknown role is always the lowest role.
//! - Claims can never exceed the catalog set of the role they carry.
//! - Per-user overrides only narrow.

pub mod catalog;
pub mod claims;
pub mod error;
pub mod hashing;
pub mod metadata;
pub mod types;

pub use catalog::{resolve_role, PermissionCatalog, STANDARD_CATALOG_VERSION};
pub use claims::{ClaimsBuilder, ClaimsPayload};
pub use error::{AuthzError, Result};
pub use metadata::{DatabaseUserRecord, IdentityMetadata, MetadataRead, AUTHORIZATION_KEYS};
pub use types::{Capability, CapabilitySet, CustomAccessOverride, PermissionSnapshot, Role};
