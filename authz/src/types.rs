//! Core authorization types: roles, capabilities, permission snapshots and
//! per-user access overrides.
//!
//! # Security Considerations
//!
//! - Roles form a fixed, totally ordered hierarchy. Anything outside it is
//!   treated as the lowest role, never as an elevated one.
//! - A [`PermissionSnapshot`] is derived data. It is recomputed from the
//!   catalog on demand and is never the source of truth.
//! - A [`CustomAccessOverride`] can only narrow what a role grants.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AuthzError;
use crate::hashing::permission_hash;

/// A single granted action, e.g. `"billing.create"`.
pub type Capability = String;

/// An ordered, deduplicated set of capabilities.
pub type CapabilitySet = BTreeSet<Capability>;

/// A position in the role hierarchy.
///
/// The derived `Ord` follows declaration order, which is the inheritance
/// order: every role inherits the capabilities of all roles before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Consultant,
    Manager,
    OrgAdmin,
    Developer,
}

impl Role {
    /// Every role, lowest first.
    pub const ALL: [Role; 5] = [
        Role::Viewer,
        Role::Consultant,
        Role::Manager,
        Role::OrgAdmin,
        Role::Developer,
    ];

    /// The most restrictive role. Used whenever a role is missing or invalid.
    pub const fn lowest() -> Self {
        Role::Viewer
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Consultant => "consultant",
            Role::Manager => "manager",
            Role::OrgAdmin => "org_admin",
            Role::Developer => "developer",
        }
    }

    /// This role followed by every role below it, highest first.
    pub fn with_lower_roles(&self) -> Vec<Role> {
        Role::ALL
            .iter()
            .rev()
            .copied()
            .filter(|role| role <= self)
            .collect()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .iter()
            .copied()
            .find(|role| role.as_str() == s.trim())
            .ok_or_else(|| AuthzError::UnknownRole(s.to_string()))
    }
}

/// A computed `{role, capabilities, hash, version}` tuple.
///
/// Invariant: `hash == permission_hash(capabilities)`. The constructor is the
/// only way to build one, so the invariant cannot be broken from outside.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionSnapshot {
    role: Role,
    capabilities: CapabilitySet,
    hash: String,
    version: String,
    computed_at: DateTime<Utc>,
}

impl PermissionSnapshot {
    pub fn new(role: Role, capabilities: CapabilitySet, version: impl Into<String>) -> Self {
        let hash = permission_hash(&capabilities);
        Self {
            role,
            capabilities,
            hash,
            version: version.into(),
            computed_at: Utc::now(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn computed_at(&self) -> DateTime<Utc> {
        self.computed_at
    }

    pub fn has(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Equality on everything except `computed_at`.
    pub fn same_permissions(&self, other: &PermissionSnapshot) -> bool {
        self.role == other.role
            && self.capabilities == other.capabilities
            && self.hash == other.hash
            && self.version == other.version
    }
}

/// A user-scoped restriction layered on top of a role's snapshot.
///
/// Overrides only ever remove access: denied capabilities are dropped from the
/// role's set, and a resource allowlist limits which ids of a resource type
/// the user may see. An empty override is equivalent to no override.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomAccessOverride {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub denied_capabilities: CapabilitySet,

    /// Resource type (e.g. `"clients"`) to the only ids visible for it.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resource_allowlist: BTreeMap<String, BTreeSet<String>>,
}

impl CustomAccessOverride {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(mut self, capability: impl Into<Capability>) -> Self {
        self.denied_capabilities.insert(capability.into());
        self
    }

    pub fn allow_only<I, S>(mut self, resource: impl Into<String>, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resource_allowlist
            .insert(resource.into(), ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.denied_capabilities.is_empty() && self.resource_allowlist.is_empty()
    }

    /// Removes denied capabilities from `capabilities`. Never adds anything.
    pub fn narrow(&self, capabilities: &CapabilitySet) -> CapabilitySet {
        capabilities
            .difference(&self.denied_capabilities)
            .cloned()
            .collect()
    }

    /// Whether `id` of `resource` is visible. Resource types without an
    /// allowlist entry are unrestricted by the override.
    pub fn can_access_resource(&self, resource: &str, id: &str) -> bool {
        self.resource_allowlist
            .get(resource)
            .map_or(true, |ids| ids.contains(id))
    }
}
