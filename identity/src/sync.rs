//! The metadata synchronizer: the only writer of identity-provider metadata.
//!
//! Every public entry point runs under the [`AuthOperationMutex`] keyed by
//! the user id, so reads and writes for one user never interleave while
//! different users proceed in parallel. The `*_locked` helpers assume the
//! slot is already held and never take it again.
//!
//! A custom access override is applied when permissions are written: the
//! stored permissions are the role's catalog set minus the override's
//! denials, and the stored hash covers exactly that set.

use std::sync::Arc;

use authz::hashing::permission_hash;
use authz::{
    ClaimsBuilder, ClaimsPayload, CustomAccessOverride, DatabaseUserRecord, IdentityMetadata,
    MetadataRead, PermissionCatalog, PermissionSnapshot, Role,
};
use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::drift::{assess, DriftReport};
use crate::error::{IdentityError, Result};
use crate::mutex::{AuthOperationMutex, OperationKind};
use crate::provider::{IdentityProvider, UserDirectory};

/// Recorded as `assignedBy` for corrections made by drift validation.
pub const SYSTEM_ACTOR: &str = "system";

/// Keeps the identity provider's role/permission mirror consistent with the
/// permission catalog.
#[derive(Clone)]
pub struct MetadataSynchronizer {
    provider: Arc<dyn IdentityProvider>,
    directory: Arc<dyn UserDirectory>,
    catalog: Arc<PermissionCatalog>,
    mutex: AuthOperationMutex,
    audit: Arc<dyn AuditSink>,
}

impl MetadataSynchronizer {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        directory: Arc<dyn UserDirectory>,
        catalog: Arc<PermissionCatalog>,
        mutex: AuthOperationMutex,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            provider,
            directory,
            catalog,
            mutex,
            audit,
        }
    }

    pub fn catalog(&self) -> &PermissionCatalog {
        &self.catalog
    }

    pub fn mutex(&self) -> &AuthOperationMutex {
        &self.mutex
    }

    pub fn directory(&self) -> &Arc<dyn UserDirectory> {
        &self.directory
    }

    /// Assign `role` to `user_id` and write its catalog snapshot.
    ///
    /// An existing custom access override is kept unless `custom_access` is
    /// given; passing an empty override clears it. When the stored state
    /// already matches, nothing is written and no audit event is emitted.
    pub async fn update_role(
        &self,
        user_id: &str,
        role: Role,
        assigned_by: &str,
        custom_access: Option<CustomAccessOverride>,
    ) -> Result<PermissionSnapshot> {
        let this = self.clone();
        let user = user_id.to_string();
        let assigned_by = assigned_by.to_string();
        self.mutex
            .run(user_id, OperationKind::Refresh, move || async move {
                this.update_role_locked(&user, role, &assigned_by, custom_access)
                    .await
            })
            .await
    }

    /// Apply incremental capability edits: removals first, then additions.
    pub async fn update_capabilities(
        &self,
        user_id: &str,
        add: &[&str],
        remove: &[&str],
        updated_by: &str,
    ) -> Result<PermissionSnapshot> {
        let this = self.clone();
        let user = user_id.to_string();
        let add: Vec<String> = add.iter().map(|c| c.to_string()).collect();
        let remove: Vec<String> = remove.iter().map(|c| c.to_string()).collect();
        let updated_by = updated_by.to_string();
        self.mutex
            .run(user_id, OperationKind::Refresh, move || async move {
                let user_id = user.as_str();
                let (bag, read) = this.read_locked(user_id).await?;
                let Some(current) = read.metadata else {
                    return Err(IdentityError::NoExistingPermissions(user_id.to_string()));
                };

                let mut permissions = current.permissions.clone();
                for capability in &remove {
                    permissions.remove(capability);
                }
                for capability in &add {
                    if !this.catalog.grants(current.role, capability) {
                        warn!(
                            "Granting {} to {} outside the '{}' role's catalog set",
                            capability, user_id, current.role
                        );
                    }
                    permissions.insert(capability.clone());
                }

                let mut updated = current.clone();
                updated.permission_hash = permission_hash(&permissions);
                updated.permissions = permissions;
                if updated.same_authorization(&current) {
                    info!("Capabilities for {} already up to date", user_id);
                    return Ok(current.snapshot());
                }
                updated.last_updated = Utc::now();

                this.write_locked(user_id, bag, &updated).await?;
                this.record_audit(
                    AuditEvent::new(
                        AuditAction::PermissionsUpdate,
                        user_id,
                        Some(current.role),
                        updated.role,
                        updated_by.as_str(),
                    )
                    .with_details(json!({ "added": add, "removed": remove })),
                )
                .await;

                info!(
                    "Updated capabilities for {} (+{} -{})",
                    user_id,
                    add.len(),
                    remove.len()
                );
                Ok(updated.snapshot())
            })
            .await
    }

    /// Compare the stored metadata with the catalog and rewrite it when it
    /// has drifted. Returns whether a correction was written.
    pub async fn validate_and_sync(&self, user_id: &str) -> Result<bool> {
        let this = self.clone();
        let user = user_id.to_string();
        self.mutex
            .run(user_id, OperationKind::Validation, move || async move {
                let user_id = user.as_str();
                let (_, read) = this.read_locked(user_id).await?;
                let report = assess(&read, &this.catalog);

                let role = match &report {
                    DriftReport::Consistent => return Ok(false),
                    DriftReport::MissingRole => {
                        warn!(
                            "User {} has no valid role, assigning '{}'",
                            user_id,
                            Role::lowest()
                        );
                        Role::lowest()
                    }
                    DriftReport::Drifted {
                        role,
                        missing,
                        unexpected,
                        stale_hash,
                        stale_version,
                    } => {
                        warn!(
                            "Permission drift for {} ('{}'): {} missing, {} unexpected, \
                             stale hash: {}, stale version: {}",
                            user_id,
                            role,
                            missing.len(),
                            unexpected.len(),
                            stale_hash,
                            stale_version
                        );
                        *role
                    }
                };

                this.update_role_locked(user_id, role, SYSTEM_ACTOR, None)
                    .await?;
                info!("Corrected permissions for {} to '{}'", user_id, role);
                Ok(true)
            })
            .await
    }

    /// Set or clear the user's custom access override. An empty override
    /// clears it.
    pub async fn set_custom_access(
        &self,
        user_id: &str,
        custom_access: CustomAccessOverride,
        updated_by: &str,
    ) -> Result<()> {
        let this = self.clone();
        let user = user_id.to_string();
        let updated_by = updated_by.to_string();
        self.mutex
            .run(user_id, OperationKind::Refresh, move || async move {
                let user_id = user.as_str();
                let (bag, read) = this.read_locked(user_id).await?;
                let Some(current) = read.metadata else {
                    return Err(IdentityError::NoExistingPermissions(user_id.to_string()));
                };

                let custom_access = (!custom_access.is_empty()).then_some(custom_access);
                if current.custom_access == custom_access {
                    return Ok(());
                }

                // Restore what the previous override withheld from the role,
                // then apply the new one.
                let catalog_set = this.catalog.capabilities_for(current.role);
                let mut permissions = current.permissions.clone();
                if let Some(previous) = &current.custom_access {
                    permissions.extend(
                        previous
                            .denied_capabilities
                            .intersection(&catalog_set)
                            .cloned(),
                    );
                }
                if let Some(over) = &custom_access {
                    permissions = over.narrow(&permissions);
                }

                let mut updated = current.clone();
                updated.permission_hash = permission_hash(&permissions);
                updated.permissions = permissions;
                updated.custom_access = custom_access;
                updated.last_updated = Utc::now();
                this.write_locked(user_id, bag, &updated).await?;

                let details = serde_json::to_value(&updated.custom_access)?;
                this.record_audit(
                    AuditEvent::new(
                        AuditAction::CustomAccessUpdate,
                        user_id,
                        Some(current.role),
                        current.role,
                        updated_by.as_str(),
                    )
                    .with_details(details),
                )
                .await;
                info!("Updated custom access for {}", user_id);
                Ok(())
            })
            .await
    }

    /// The stored snapshot, or `None` if no role was ever assigned.
    pub async fn get_user_permissions(&self, user_id: &str) -> Result<Option<PermissionSnapshot>> {
        let this = self.clone();
        let user = user_id.to_string();
        self.mutex
            .run(user_id, OperationKind::PermissionCheck, move || async move {
                let (_, read) = this.read_locked(&user).await?;
                Ok(read.metadata.map(|m| m.snapshot()))
            })
            .await
    }

    /// Project the user's stored metadata and database record into claims.
    ///
    /// A user the provider does not know yet gets the most restrictive
    /// claims instead of an error.
    pub async fn build_claims(&self, user_id: &str) -> Result<ClaimsPayload> {
        let this = self.clone();
        let user = user_id.to_string();
        self.mutex
            .run(user_id, OperationKind::Extraction, move || async move {
                let user_id = user.as_str();
                let metadata = match this.provider.read_metadata(user_id).await? {
                    Some(bag) => {
                        let read = IdentityMetadata::from_bag(&bag);
                        let untrusted_role = read.was_coerced("role");
                        read.metadata.map(|mut metadata| {
                            if untrusted_role {
                                warn!(
                                    "Stored role for {} is not a known role, claims fall back to '{}'",
                                    user_id, metadata.role
                                );
                                // A cleared hash never matches, so the builder
                                // keeps only what the fallback role grants.
                                metadata.permission_hash.clear();
                            }
                            metadata
                        })
                    }
                    None => None,
                };
                let record = this.directory.find_by_external_id(user_id).await?;
                Ok(ClaimsBuilder::new(&this.catalog).build(
                    user_id,
                    metadata.as_ref(),
                    record.as_ref(),
                ))
            })
            .await
    }

    /// Raw read without taking the mutex. Callers must hold the user's slot.
    pub(crate) async fn peek(&self, user_id: &str) -> Result<MetadataRead> {
        self.read_locked(user_id).await.map(|(_, read)| read)
    }

    async fn update_role_locked(
        &self,
        user_id: &str,
        role: Role,
        assigned_by: &str,
        custom_access: Option<CustomAccessOverride>,
    ) -> Result<PermissionSnapshot> {
        let (bag, read) = self.read_locked(user_id).await?;
        let record = self.directory.find_by_external_id(user_id).await?;
        let existing = read.metadata.as_ref();
        let stored_role = read
            .was_coerced("role")
            .then(|| bag.get("role").cloned())
            .flatten();

        let custom_access = match custom_access {
            Some(over) => (!over.is_empty()).then_some(over),
            None => existing.and_then(|m| m.custom_access.clone()),
        };
        let snapshot = self
            .catalog
            .narrowed_snapshot_for(role, custom_access.as_ref());
        let now = Utc::now();
        let (database_id, manager_id, is_staff) = directory_fields(record.as_ref(), existing);

        let target = IdentityMetadata {
            role,
            permissions: snapshot.capabilities().clone(),
            permission_hash: snapshot.hash().to_string(),
            permission_version: snapshot.version().to_string(),
            database_id,
            manager_id,
            is_staff,
            custom_access,
            assigned_by: assigned_by.to_string(),
            assigned_at: now,
            last_updated: now,
        };

        if let Some(current) = existing {
            if current.same_authorization(&target) && read.coerced.is_empty() {
                info!("Role '{}' for {} already up to date", role, user_id);
                return Ok(snapshot);
            }
        }

        let mut details = json!({
            "permissionHash": snapshot.hash(),
            "permissionVersion": snapshot.version(),
        });
        if let Some(raw) = stored_role {
            // `oldRole` holds the coerced fallback; keep what was really stored.
            details["storedRole"] = raw;
        }

        self.write_locked(user_id, bag, &target).await?;
        self.record_audit(
            AuditEvent::new(
                AuditAction::RoleChange,
                user_id,
                existing.map(|m| m.role),
                role,
                assigned_by,
            )
            .with_details(details),
        )
        .await;

        info!(
            "Assigned role '{}' to {} ({} capabilities)",
            role,
            user_id,
            snapshot.capabilities().len()
        );
        Ok(snapshot)
    }

    async fn read_locked(&self, user_id: &str) -> Result<(Map<String, Value>, MetadataRead)> {
        let bag = self
            .provider
            .read_metadata(user_id)
            .await?
            .ok_or_else(|| IdentityError::UserNotFound(user_id.to_string()))?;
        let read = IdentityMetadata::from_bag(&bag);
        if !read.coerced.is_empty() {
            warn!(
                "Stored metadata for {} had malformed fields: {:?}",
                user_id, read.coerced
            );
        }
        Ok((bag, read))
    }

    async fn write_locked(
        &self,
        user_id: &str,
        bag: Map<String, Value>,
        metadata: &IdentityMetadata,
    ) -> Result<()> {
        let merged = metadata.merge_into(bag)?;
        self.provider.write_metadata(user_id, merged).await
    }

    /// A failed audit write is logged and never fails the mutation.
    async fn record_audit(&self, event: AuditEvent) {
        if let Err(e) = self.audit.record(&event).await {
            error!(
                "Failed to record audit event {}: {} (event: {})",
                event.action.as_str(),
                e,
                serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event))
            );
        }
    }
}

fn directory_fields(
    record: Option<&DatabaseUserRecord>,
    existing: Option<&IdentityMetadata>,
) -> (String, Option<String>, bool) {
    match (record, existing) {
        (Some(r), _) => (r.id.clone(), r.manager_id.clone(), r.is_staff),
        (None, Some(m)) => (m.database_id.clone(), m.manager_id.clone(), m.is_staff),
        (None, None) => (String::new(), None, false),
    }
}
