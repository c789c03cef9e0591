//! Identity-metadata synchronization.
//!
//! This crate keeps the role and permission mirror held by an external
//! identity provider consistent with the [`authz`] permission catalog, and
//! serializes every operation that reads or writes that mirror.
//!
//! - [`mutex`]: the keyed FIFO [`AuthOperationMutex`] every operation runs
//!   under.
//! - [`sync`]: the [`MetadataSynchronizer`], the only writer of provider
//!   metadata.
//! - [`drift`]: the [`DriftValidator`], which detects and heals divergence
//!   from the catalog.
//! - [`provider`]: ports to the identity provider and the application's user
//!   directory, with a SQLite directory in [`database`] and in-process
//!   adapters in [`memory`].
//! - [`audit`]: audit events and a hash-chained audit log.
//!
//! [`IdentityService`] wires all of it together from an [`IdentityConfig`];
//! [`IdentityService::start`] also installs [`logging`].

pub mod audit;
pub mod config;
pub mod database;
pub mod drift;
pub mod error;
pub mod logging;
pub mod memory;
pub mod mutex;
pub mod provider;
pub mod sync;

use std::sync::Arc;

use authz::PermissionCatalog;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use audit::AuditLog;
use database::UserDatabase;
use drift::DriftValidator;
use mutex::AuthOperationMutex;
use provider::IdentityProvider;
use sync::MetadataSynchronizer;

/// The synchronization core with its persistent stores.
pub struct IdentityService {
    database: Arc<UserDatabase>,
    audit_log: Arc<AuditLog>,
    sync: MetadataSynchronizer,
    drift: DriftValidator,
    sweep: Option<JoinHandle<()>>,
}

impl IdentityService {
    /// Process entry point: install logging into `config.log_dir`, then
    /// start the service. Keep the returned guard alive so the log file is
    /// flushed.
    pub async fn start(
        config: IdentityConfig,
        provider: Arc<dyn IdentityProvider>,
    ) -> error::Result<(Self, WorkerGuard)> {
        let guard = logging::init_logging(&config)?;
        let service = Self::new(config, provider).await?;
        Ok((service, guard))
    }

    /// [`start`](Self::start) with configuration read from the environment.
    pub async fn start_from_env(
        provider: Arc<dyn IdentityProvider>,
    ) -> error::Result<(Self, WorkerGuard)> {
        Self::start(IdentityConfig::from_env()?, provider).await
    }

    /// Open the user database and audit log, and start the drift sweep if
    /// one is configured.
    pub async fn new(
        config: IdentityConfig,
        provider: Arc<dyn IdentityProvider>,
    ) -> error::Result<Self> {
        Self::with_catalog(config, provider, PermissionCatalog::standard()).await
    }

    pub async fn with_catalog(
        config: IdentityConfig,
        provider: Arc<dyn IdentityProvider>,
        catalog: PermissionCatalog,
    ) -> error::Result<Self> {
        info!("Initializing identity service");

        let database = Arc::new(UserDatabase::new(config.database.clone()).await?);
        let audit_log = Arc::new(AuditLog::new(config.audit_log.clone())?);
        let mutex = AuthOperationMutex::with_default_timeout(config.mutex_timeout);

        let sync = MetadataSynchronizer::new(
            provider,
            database.clone(),
            Arc::new(catalog),
            mutex,
            audit_log.clone(),
        );
        let drift = DriftValidator::new(sync.clone());
        let sweep = config.drift_sweep_interval.map(|interval| {
            info!("Starting drift sweep every {:?}", interval);
            drift.spawn_periodic_sweep(interval)
        });

        info!(
            "Identity service initialized (catalog version {})",
            sync.catalog().version()
        );
        Ok(Self {
            database,
            audit_log,
            sync,
            drift,
            sweep,
        })
    }

    pub fn sync(&self) -> &MetadataSynchronizer {
        &self.sync
    }

    pub fn drift(&self) -> &DriftValidator {
        &self.drift
    }

    pub fn mutex(&self) -> &AuthOperationMutex {
        self.sync.mutex()
    }

    pub fn database(&self) -> &UserDatabase {
        &self.database
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit_log
    }

    /// Verify the audit log's hash chain.
    pub async fn verify_integrity(&self) -> error::Result<bool> {
        let valid = self.audit_log.verify_chain().await?;
        if !valid {
            warn!("Audit log chain verification failed");
        }
        Ok(valid)
    }

    /// Stop the drift sweep and fail any queued operations.
    pub fn shutdown(&mut self) {
        if let Some(sweep) = self.sweep.take() {
            sweep.abort();
        }
        let cancelled = self.sync.mutex().force_release_all();
        info!(
            "Identity service shut down, {} queued operation(s) cancelled",
            cancelled
        );
    }
}

impl Drop for IdentityService {
    fn drop(&mut self) {
        if let Some(sweep) = self.sweep.take() {
            sweep.abort();
        }
    }
}

pub use audit::{AuditAction, AuditEvent, AuditLogConfig, AuditSink};
pub use config::IdentityConfig;
pub use database::UserDatabaseConfig;
pub use drift::{DriftReport, Reconciliation, SweepSummary};
pub use error::{IdentityError, Result};
pub use mutex::{AuthOperation, MutexEvent, MutexEventKind, OperationKind, SlotStatus};
pub use provider::UserDirectory;
