//! Detection and correction of drift between stored metadata and the
//! permission catalog.

use std::time::Duration;

use authz::hashing::permission_hash;
use authz::{CapabilitySet, MetadataRead, PermissionCatalog, Role};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::mutex::OperationKind;
use crate::sync::MetadataSynchronizer;

/// Outcome of comparing stored metadata with the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriftReport {
    Consistent,
    /// No role was ever assigned, or the stored role is not a known role.
    MissingRole,
    Drifted {
        role: Role,
        /// In the expected set but not stored.
        missing: CapabilitySet,
        /// Stored but not in the expected set.
        unexpected: CapabilitySet,
        /// The stored hash does not match the stored permissions.
        stale_hash: bool,
        /// The stored permission version is not the catalog's.
        stale_version: bool,
    },
}

impl DriftReport {
    pub fn is_consistent(&self) -> bool {
        matches!(self, DriftReport::Consistent)
    }
}

/// Compare stored metadata with the catalog set of its role, narrowed by
/// the stored custom access override.
///
/// Compares the capability sets themselves, not just hashes, so a stored
/// hash that happens to be consistent with tampered permissions is still
/// caught.
pub fn assess(stored: &MetadataRead, catalog: &PermissionCatalog) -> DriftReport {
    let Some(metadata) = stored.metadata.as_ref() else {
        return DriftReport::MissingRole;
    };
    if stored.was_coerced("role") {
        return DriftReport::MissingRole;
    }

    let expected = catalog
        .narrowed_snapshot_for(metadata.role, metadata.custom_access.as_ref())
        .capabilities()
        .clone();
    let missing: CapabilitySet = expected.difference(&metadata.permissions).cloned().collect();
    let unexpected: CapabilitySet = metadata.permissions.difference(&expected).cloned().collect();
    let stale_hash = metadata.permission_hash != permission_hash(&metadata.permissions);
    let stale_version = metadata.permission_version != catalog.version();

    if missing.is_empty() && unexpected.is_empty() && !stale_hash && !stale_version {
        return DriftReport::Consistent;
    }
    DriftReport::Drifted {
        role: metadata.role,
        missing,
        unexpected,
        stale_hash,
        stale_version,
    }
}

/// Totals from one sweep over a set of users.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub checked: usize,
    pub corrected: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Result of reconciling one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Consistent,
    Corrected,
    /// A validation for the user was already running or queued.
    Skipped,
}

/// Checks users for drift and delegates corrections to the synchronizer.
#[derive(Clone)]
pub struct DriftValidator {
    sync: MetadataSynchronizer,
}

impl DriftValidator {
    pub fn new(sync: MetadataSynchronizer) -> Self {
        Self { sync }
    }

    /// Read-only drift check for one user.
    pub async fn check(&self, user_id: &str) -> Result<DriftReport> {
        let sync = self.sync.clone();
        let user = user_id.to_string();
        self.sync
            .mutex()
            .run(user_id, OperationKind::PermissionCheck, move || async move {
                let read = sync.peek(&user).await?;
                Ok(assess(&read, sync.catalog()))
            })
            .await
    }

    /// Check one user and correct any drift.
    pub async fn reconcile(&self, user_id: &str) -> Result<Reconciliation> {
        if self
            .sync
            .mutex()
            .has_operation_for(user_id, OperationKind::Validation)
        {
            debug!("Validation already pending for {}, skipping", user_id);
            return Ok(Reconciliation::Skipped);
        }

        if self.check(user_id).await?.is_consistent() {
            return Ok(Reconciliation::Consistent);
        }
        if self.sync.validate_and_sync(user_id).await? {
            Ok(Reconciliation::Corrected)
        } else {
            // Fixed by someone else between the check and the validation.
            Ok(Reconciliation::Consistent)
        }
    }

    /// Reconcile each user in turn. A failure for one user is logged and
    /// does not stop the sweep.
    pub async fn sweep<S: AsRef<str>>(&self, user_ids: &[S]) -> SweepSummary {
        let mut summary = SweepSummary::default();
        for user_id in user_ids {
            let user_id = user_id.as_ref();
            summary.checked += 1;
            match self.reconcile(user_id).await {
                Ok(Reconciliation::Consistent) => {}
                Ok(Reconciliation::Corrected) => summary.corrected += 1,
                Ok(Reconciliation::Skipped) => summary.skipped += 1,
                Err(e) => {
                    warn!("Drift check failed for {}: {}", user_id, e);
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    /// Sweep every user in the directory.
    pub async fn sweep_all(&self) -> Result<SweepSummary> {
        let user_ids = self.sync.directory().list_external_ids().await?;
        let summary = self.sweep(&user_ids).await;
        info!(
            "Drift sweep finished: {} checked, {} corrected, {} skipped, {} failed",
            summary.checked, summary.corrected, summary.skipped, summary.failed
        );
        Ok(summary)
    }

    /// Run [`sweep_all`](Self::sweep_all) every `interval` until the handle
    /// is aborted.
    pub fn spawn_periodic_sweep(&self, interval: Duration) -> JoinHandle<()> {
        let validator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = validator.sweep_all().await {
                    warn!("Drift sweep could not list users: {}", e);
                }
            }
        })
    }
}
