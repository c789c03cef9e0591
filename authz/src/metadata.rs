//! Strict schema for the role/permission mirror held by the identity provider.
//!
//! The provider stores metadata as a loosely typed property bag. Everything
//! crossing that boundary goes through [`IdentityMetadata::from_bag`], which
//! validates and coerces each field into a restrictive value instead of
//! trusting the stored shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::catalog::resolve_role;
use crate::error::{AuthzError, Result};
use crate::hashing::permission_hash;
use crate::types::{CapabilitySet, CustomAccessOverride, PermissionSnapshot, Role};

/// Keys owned by the synchronizer. Any other key in the bag belongs to
/// someone else and is preserved untouched on every write.
pub const AUTHORIZATION_KEYS: &[&str] = &[
    "role",
    "permissions",
    "permissionHash",
    "permissionVersion",
    "databaseId",
    "managerId",
    "isStaff",
    "customAccess",
    "assignedBy",
    "assignedAt",
    "lastUpdated",
];

/// The identity provider's mirror of a user's authorization state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityMetadata {
    pub role: Role,
    pub permissions: CapabilitySet,
    pub permission_hash: String,
    pub permission_version: String,
    pub database_id: String,
    pub manager_id: Option<String>,
    pub is_staff: bool,
    pub custom_access: Option<CustomAccessOverride>,
    pub assigned_by: String,
    pub assigned_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// Result of reading a property bag: the coerced metadata (if a role was
/// ever assigned) and the names of fields that had to be repaired.
#[derive(Debug, Clone, Default)]
pub struct MetadataRead {
    pub metadata: Option<IdentityMetadata>,
    pub coerced: Vec<&'static str>,
}

impl MetadataRead {
    pub fn was_coerced(&self, field: &str) -> bool {
        self.coerced.iter().any(|f| *f == field)
    }
}

impl IdentityMetadata {
    /// Validate and coerce a raw property bag.
    ///
    /// A bag without a `role` key has never had a role assigned and yields no
    /// metadata. Every other malformed field is replaced by its most
    /// restrictive value and recorded in [`MetadataRead::coerced`].
    pub fn from_bag(bag: &Map<String, Value>) -> MetadataRead {
        let mut coerced = Vec::new();

        let role = match bag.get("role") {
            None | Some(Value::Null) => return MetadataRead::default(),
            Some(Value::String(name)) => match name.parse::<Role>() {
                Ok(role) => role,
                Err(_) => {
                    coerced.push("role");
                    resolve_role(Some(name.as_str()))
                }
            },
            Some(other) => {
                warn!("Non-string role value {} in identity metadata", other);
                coerced.push("role");
                Role::lowest()
            }
        };

        let permissions = match bag.get("permissions") {
            Some(Value::Array(items)) => {
                let strings: CapabilitySet = items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
                if strings.len() != items.len() {
                    // Either non-strings or duplicates; both mean the stored
                    // list is not the canonical one we write.
                    coerced.push("permissions");
                }
                strings
            }
            _ => {
                coerced.push("permissions");
                CapabilitySet::new()
            }
        };

        let permission_hash = string_field(bag, "permissionHash", &mut coerced).unwrap_or_default();
        let permission_version =
            string_field(bag, "permissionVersion", &mut coerced).unwrap_or_default();

        let database_id = match bag.get("databaseId") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                coerced.push("databaseId");
                String::new()
            }
        };

        let manager_id = match bag.get("managerId") {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(_) => {
                coerced.push("managerId");
                None
            }
        };

        let is_staff = match bag.get("isStaff") {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => true,
            Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => false,
            None => false,
            Some(_) => {
                coerced.push("isStaff");
                false
            }
        };

        let custom_access = match bag.get("customAccess") {
            None | Some(Value::Null) => None,
            Some(value) => match serde_json::from_value::<CustomAccessOverride>(value.clone()) {
                Ok(over) => Some(over),
                Err(e) => {
                    warn!("Discarding malformed customAccess: {}", e);
                    coerced.push("customAccess");
                    None
                }
            },
        };

        let assigned_by = string_field(bag, "assignedBy", &mut coerced).unwrap_or_default();
        let assigned_at = timestamp_field(bag, "assignedAt", &mut coerced);
        let last_updated = timestamp_field(bag, "lastUpdated", &mut coerced);

        MetadataRead {
            metadata: Some(Self {
                role,
                permissions,
                permission_hash,
                permission_version,
                database_id,
                manager_id,
                is_staff,
                custom_access,
                assigned_by,
                assigned_at,
                last_updated,
            }),
            coerced,
        }
    }

    /// Write the authorization keys into `bag`, keeping every other key.
    pub fn merge_into(&self, mut bag: Map<String, Value>) -> Result<Map<String, Value>> {
        let value = serde_json::to_value(self)
            .map_err(|e| AuthzError::InvalidMetadata(e.to_string()))?;
        let Value::Object(fields) = value else {
            return Err(AuthzError::InvalidMetadata(
                "metadata did not serialize to an object".to_string(),
            ));
        };
        for (key, value) in fields {
            bag.insert(key, value);
        }
        Ok(bag)
    }

    /// The stored snapshot. The hash is recomputed from the stored
    /// permissions, not copied from `permission_hash`.
    pub fn snapshot(&self) -> PermissionSnapshot {
        PermissionSnapshot::new(
            self.role,
            self.permissions.clone(),
            self.permission_version.clone(),
        )
    }

    /// Whether the stored hash matches the stored permissions.
    pub fn hash_is_current(&self) -> bool {
        self.permission_hash == permission_hash(&self.permissions)
    }

    /// Equality on the fields that affect authorization decisions. Audit
    /// fields (`assignedBy`, timestamps) are ignored.
    pub fn same_authorization(&self, other: &IdentityMetadata) -> bool {
        self.role == other.role
            && self.permissions == other.permissions
            && self.permission_hash == other.permission_hash
            && self.permission_version == other.permission_version
            && self.database_id == other.database_id
            && self.manager_id == other.manager_id
            && self.is_staff == other.is_staff
            && self.custom_access == other.custom_access
    }
}

/// The application database's view of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseUserRecord {
    pub id: String,
    /// The user's id at the identity provider.
    pub external_id: String,
    pub org_id: Option<String>,
    pub manager_id: Option<String>,
    pub is_staff: bool,
}

fn string_field(
    bag: &Map<String, Value>,
    key: &'static str,
    coerced: &mut Vec<&'static str>,
) -> Option<String> {
    match bag.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        _ => {
            coerced.push(key);
            None
        }
    }
}

fn timestamp_field(
    bag: &Map<String, Value>,
    key: &'static str,
    coerced: &mut Vec<&'static str>,
) -> DateTime<Utc> {
    bag.get(key)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| {
            coerced.push(key);
            DateTime::<Utc>::default()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bag(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("test bag must be an object"),
        }
    }

    fn well_formed() -> Map<String, Value> {
        let permissions = ["clients.read", "dashboard.read"];
        bag(json!({
            "role": "manager",
            "permissions": permissions,
            "permissionHash": permission_hash(permissions),
            "permissionVersion": "2025.1",
            "databaseId": "42",
            "managerId": null,
            "isStaff": true,
            "assignedBy": "admin",
            "assignedAt": "2025-01-01T00:00:00Z",
            "lastUpdated": "2025-01-02T00:00:00Z",
            "theme": "dark"
        }))
    }

    #[test]
    fn test_well_formed_bag() {
        let read = IdentityMetadata::from_bag(&well_formed());
        assert!(read.coerced.is_empty(), "unexpected coercion: {:?}", read.coerced);

        let metadata = read.metadata.unwrap();
        assert_eq!(metadata.role, Role::Manager);
        assert_eq!(metadata.permissions.len(), 2);
        assert_eq!(metadata.database_id, "42");
        assert!(metadata.is_staff);
        assert!(metadata.hash_is_current());
    }

    #[test]
    fn test_bag_without_role_has_no_metadata() {
        let read = IdentityMetadata::from_bag(&bag(json!({ "theme": "dark" })));
        assert!(read.metadata.is_none());
    }

    #[test]
    fn test_unknown_role_is_coerced_to_lowest() {
        let mut raw = well_formed();
        raw.insert("role".to_string(), json!("superuser"));

        let read = IdentityMetadata::from_bag(&raw);
        assert!(read.was_coerced("role"));
        assert_eq!(read.metadata.unwrap().role, Role::Viewer);
    }

    #[test]
    fn test_malformed_fields_become_restrictive() {
        let raw = bag(json!({
            "role": "developer",
            "permissions": ["system.debug", 7],
            "databaseId": 42,
            "isStaff": "yes",
            "customAccess": "everything",
            "assignedAt": "yesterday"
        }));

        let read = IdentityMetadata::from_bag(&raw);
        let metadata = read.metadata.clone().unwrap();
        assert_eq!(metadata.permissions.len(), 1);
        assert_eq!(metadata.database_id, "42");
        assert!(!metadata.is_staff);
        assert!(metadata.custom_access.is_none());
        assert_eq!(metadata.assigned_at, DateTime::<Utc>::default());
        for field in ["permissions", "isStaff", "customAccess", "assignedAt"] {
            assert!(read.was_coerced(field), "{} should be coerced", field);
        }
    }

    #[test]
    fn test_merge_preserves_foreign_keys() {
        let original = well_formed();
        let mut metadata = IdentityMetadata::from_bag(&original).metadata.unwrap();
        metadata.role = Role::OrgAdmin;

        let merged = metadata.merge_into(original).unwrap();
        assert_eq!(merged["theme"], json!("dark"));
        assert_eq!(merged["role"], json!("org_admin"));
        for key in AUTHORIZATION_KEYS {
            assert!(merged.contains_key(*key), "missing {}", key);
        }

        let reread = IdentityMetadata::from_bag(&merged);
        assert!(reread.coerced.is_empty());
        assert_eq!(reread.metadata.unwrap(), metadata);
    }

    #[test]
    fn test_same_authorization_ignores_audit_fields() {
        let a = IdentityMetadata::from_bag(&well_formed()).metadata.unwrap();
        let mut b = a.clone();
        b.assigned_by = "someone-else".to_string();
        b.last_updated = Utc::now();
        assert!(a.same_authorization(&b));

        b.is_staff = false;
        assert!(!a.same_authorization(&b));
    }
}
