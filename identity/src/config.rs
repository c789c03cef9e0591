use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::audit::AuditLogConfig;
use crate::database::UserDatabaseConfig;
use crate::error::{IdentityError, Result};
use crate::logging::parse_filter;
use crate::mutex::DEFAULT_OPERATION_TIMEOUT;

/// Runtime configuration for the identity service.
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// Deadline for each auth operation, queueing included.
    pub mutex_timeout: Duration,
    pub database: UserDatabaseConfig,
    pub audit_log: AuditLogConfig,
    /// Interval of the background drift sweep. `None` disables it.
    pub drift_sweep_interval: Option<Duration>,
    /// Directory of the rolling log file written by [`init_logging`].
    ///
    /// [`init_logging`]: crate::logging::init_logging
    pub log_dir: PathBuf,
    /// Filter directives used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            mutex_timeout: DEFAULT_OPERATION_TIMEOUT,
            database: UserDatabaseConfig::default(),
            audit_log: AuditLogConfig::default(),
            drift_sweep_interval: None,
            log_dir: PathBuf::from("data/logs"),
            log_filter: "info".to_string(),
        }
    }
}

impl IdentityConfig {
    /// Load configuration from the environment, reading `.env` first if
    /// present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from defaults overridden by `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secs) = parse::<u64>(&lookup, "IDENTITY_MUTEX_TIMEOUT_SECS")? {
            if secs == 0 {
                return Err(IdentityError::Configuration(
                    "IDENTITY_MUTEX_TIMEOUT_SECS must be greater than zero".to_string(),
                ));
            }
            config.mutex_timeout = Duration::from_secs(secs);
        }
        if let Some(path) = lookup("IDENTITY_DATABASE_PATH") {
            config.database.database_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("IDENTITY_AUDIT_LOG_PATH") {
            config.audit_log.log_path = PathBuf::from(path);
        }
        if let Some(size) = parse::<u64>(&lookup, "IDENTITY_AUDIT_MAX_SIZE_MB")? {
            config.audit_log.max_size_mb = size;
        }
        if let Some(rotations) = parse::<u32>(&lookup, "IDENTITY_AUDIT_MAX_ROTATIONS")? {
            config.audit_log.max_rotations = rotations;
        }
        // Zero keeps the sweep disabled.
        if let Some(secs) = parse::<u64>(&lookup, "IDENTITY_DRIFT_SWEEP_SECS")? {
            config.drift_sweep_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(dir) = lookup("IDENTITY_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(filter) = lookup("IDENTITY_LOG_FILTER") {
            parse_filter(&filter)?;
            config.log_filter = filter;
        }

        Ok(config)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            IdentityError::Configuration(format!("Invalid value '{}' for {}: {}", raw, key, e))
        }),
    }
}
