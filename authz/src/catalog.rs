//! The permission catalog: the source of truth for what each role can do.
//!
//! Grants are declared per role as increments over the role below it. The
//! effective set of a role is the union of its own grants and the grants of
//! every lower role, so a higher role's set is always a superset of a lower
//! role's set, whatever the grant table says.

use std::collections::BTreeMap;

use tracing::warn;

use crate::types::{CapabilitySet, CustomAccessOverride, PermissionSnapshot, Role};

/// Version tag of the built-in grant table. Bump it whenever the table below
/// changes so stale snapshots can be told apart from current ones.
pub const STANDARD_CATALOG_VERSION: &str = "2025.1";

/// Capabilities each role adds on top of the role below it.
const STANDARD_GRANTS: &[(Role, &[&str])] = &[
    (
        Role::Viewer,
        &[
            "dashboard.read",
            "clients.read",
            "billing.read",
            "staff.read",
            "reports.read",
        ],
    ),
    (
        Role::Consultant,
        &[
            "timesheets.read",
            "timesheets.create",
            "timesheets.update",
            "notes.read",
            "notes.create",
            "leave.create",
        ],
    ),
    (
        Role::Manager,
        &[
            "billing.create",
            "billing.update",
            "clients.create",
            "clients.update",
            "payroll.read",
            "staff.update",
            "timesheets.approve",
            "leave.approve",
            "reports.export",
        ],
    ),
    (
        Role::OrgAdmin,
        &[
            "billing.delete",
            "clients.delete",
            "payroll.process",
            "staff.create",
            "staff.delete",
            "users.manage",
            "roles.assign",
            "settings.update",
            "audit.read",
        ],
    ),
    (
        Role::Developer,
        &[
            "developer.tools",
            "system.debug",
            "system.impersonate",
            "settings.integrations",
        ],
    ),
];

/// Static mapping from role to the full capability set it grants.
#[derive(Debug, Clone)]
pub struct PermissionCatalog {
    effective: BTreeMap<Role, CapabilitySet>,
    version: String,
}

impl PermissionCatalog {
    /// Build a catalog from incremental per-role grants.
    ///
    /// Roles missing from `grants` simply inherit the set of the role below.
    pub fn new<'a, I>(version: impl Into<String>, grants: I) -> Self
    where
        I: IntoIterator<Item = (Role, &'a [&'a str])>,
    {
        let mut own: BTreeMap<Role, CapabilitySet> = BTreeMap::new();
        for (role, capabilities) in grants {
            own.entry(role)
                .or_default()
                .extend(capabilities.iter().map(|c| c.to_string()));
        }

        let mut effective = BTreeMap::new();
        let mut inherited = CapabilitySet::new();
        for role in Role::ALL {
            if let Some(added) = own.get(&role) {
                inherited.extend(added.iter().cloned());
            }
            effective.insert(role, inherited.clone());
        }

        Self {
            effective,
            version: version.into(),
        }
    }

    /// The built-in grant table.
    pub fn standard() -> Self {
        Self::new(
            STANDARD_CATALOG_VERSION,
            STANDARD_GRANTS.iter().map(|(role, caps)| (*role, *caps)),
        )
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Full capability set for `role`. Total and pure.
    pub fn capabilities_for(&self, role: Role) -> CapabilitySet {
        self.effective.get(&role).cloned().unwrap_or_default()
    }

    /// Capability set for a role given by name.
    ///
    /// Unknown names fall back to the lowest role's set. This never fails,
    /// since it gates every authorization decision.
    pub fn capabilities_for_name(&self, name: &str) -> CapabilitySet {
        self.capabilities_for(resolve_role(Some(name)))
    }

    /// Catalog-derived snapshot for `role`.
    pub fn snapshot_for(&self, role: Role) -> PermissionSnapshot {
        PermissionSnapshot::new(role, self.capabilities_for(role), self.version.clone())
    }

    /// Snapshot for `role` narrowed by a custom access override. This is the
    /// set the synchronizer stores and drift validation expects.
    pub fn narrowed_snapshot_for(
        &self,
        role: Role,
        custom_access: Option<&CustomAccessOverride>,
    ) -> PermissionSnapshot {
        let capabilities = match custom_access {
            Some(over) => over.narrow(&self.capabilities_for(role)),
            None => self.capabilities_for(role),
        };
        PermissionSnapshot::new(role, capabilities, self.version.clone())
    }

    /// Whether `role` grants `capability`.
    pub fn grants(&self, role: Role, capability: &str) -> bool {
        self.effective
            .get(&role)
            .is_some_and(|caps| caps.contains(capability))
    }
}

impl Default for PermissionCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

/// Resolve an optional role name to a role in the hierarchy.
///
/// Missing names resolve to the lowest role silently; names outside the
/// hierarchy resolve to the lowest role with a warning. Neither case can ever
/// produce an elevated role.
pub fn resolve_role(name: Option<&str>) -> Role {
    match name {
        None => Role::lowest(),
        Some(name) => name.parse().unwrap_or_else(|_| {
            warn!(
                "Inconsistent role '{}' outside the hierarchy, falling back to '{}'",
                name,
                Role::lowest()
            );
            Role::lowest()
        }),
    }
}
