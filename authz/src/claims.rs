//! Projection of reconciled authorization state into the flat claims object
//! trusted verbatim by the downstream data-access authorization engine.
//!
//! # Security Note
//! Every field defaults to its most restrictive value when its source is
//! absent. Stored permissions and their hash are emitted unchanged, so a
//! consumer can compare `permission-hash` with the stored one to detect a
//! stale token. When the stored hash does not match the stored permissions
//! the state is untrusted, and the payload falls back to the stored
//! permissions that the role's catalog set (narrowed by any override) grants.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::catalog::PermissionCatalog;
use crate::error::{AuthzError, Result};
use crate::hashing::permission_hash;
use crate::metadata::{DatabaseUserRecord, IdentityMetadata};
use crate::types::{Capability, CapabilitySet, Role};

/// Claims handed to the authorization engine that gates data access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClaimsPayload {
    pub user_id: Option<String>,
    pub default_role: Role,
    pub allowed_roles: Vec<Role>,
    /// The user's id at the identity provider.
    #[serde(rename = "clerk-id")]
    pub external_id: String,
    pub permissions: Vec<Capability>,
    pub permission_hash: String,
    pub permission_version: String,
    pub manager_id: Option<String>,
    pub is_staff: bool,
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_access: BTreeMap<String, Vec<String>>,
}

impl ClaimsPayload {
    /// Re-key the payload under a namespace prefix, e.g. `x-hasura-`.
    pub fn to_prefixed_map(&self, prefix: &str) -> Result<Map<String, Value>> {
        let value =
            serde_json::to_value(self).map_err(|e| AuthzError::InvalidMetadata(e.to_string()))?;
        let Value::Object(fields) = value else {
            return Err(AuthzError::InvalidMetadata(
                "claims did not serialize to an object".to_string(),
            ));
        };
        Ok(fields
            .into_iter()
            .map(|(key, value)| (format!("{}{}", prefix, key), value))
            .collect())
    }

    pub fn allows(&self, capability: &str) -> bool {
        self.permissions.iter().any(|c| c == capability)
    }
}

/// Pure projection from metadata and database record to claims.
pub struct ClaimsBuilder<'a> {
    catalog: &'a PermissionCatalog,
}

impl<'a> ClaimsBuilder<'a> {
    pub fn new(catalog: &'a PermissionCatalog) -> Self {
        Self { catalog }
    }

    /// Build claims for the identity-provider user `external_id`.
    ///
    /// `metadata` is `None` when no role has ever been assigned, and `record`
    /// is `None` when the application database does not know the user.
    pub fn build(
        &self,
        external_id: &str,
        metadata: Option<&IdentityMetadata>,
        record: Option<&DatabaseUserRecord>,
    ) -> ClaimsPayload {
        let role = metadata.map_or(Role::lowest(), |m| m.role);
        let custom_access = metadata.and_then(|m| m.custom_access.as_ref());

        let (permissions, hash): (Vec<Capability>, String) = match metadata {
            Some(m) if m.hash_is_current() => (
                m.permissions.iter().cloned().collect(),
                m.permission_hash.clone(),
            ),
            Some(m) => {
                let allowed = self
                    .catalog
                    .narrowed_snapshot_for(role, custom_access)
                    .capabilities()
                    .clone();
                let kept: CapabilitySet = m.permissions.intersection(&allowed).cloned().collect();
                warn!(
                    "Stored permission hash for {} does not match its permissions, \
                     emitting {} of {} within the '{}' role",
                    external_id,
                    kept.len(),
                    m.permissions.len(),
                    role
                );
                let hash = permission_hash(&kept);
                (kept.into_iter().collect(), hash)
            }
            None => (Vec::new(), permission_hash(Vec::<String>::new())),
        };

        let user_id = record.map(|r| r.id.clone()).or_else(|| {
            metadata
                .map(|m| m.database_id.clone())
                .filter(|id| !id.is_empty())
        });
        let manager_id = match record {
            Some(r) => r.manager_id.clone(),
            None => metadata.and_then(|m| m.manager_id.clone()),
        };
        let is_staff = match record {
            Some(r) => r.is_staff,
            None => metadata.is_some_and(|m| m.is_staff),
        };

        ClaimsPayload {
            user_id,
            default_role: role,
            allowed_roles: role.with_lower_roles(),
            external_id: external_id.to_string(),
            permission_hash: hash,
            permission_version: metadata
                .map(|m| m.permission_version.clone())
                .unwrap_or_default(),
            permissions,
            manager_id,
            is_staff,
            org_id: record.and_then(|r| r.org_id.clone()),
            custom_access: custom_access
                .map(|over| {
                    over.resource_allowlist
                        .iter()
                        .map(|(resource, ids)| (resource.clone(), ids.iter().cloned().collect()))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}
