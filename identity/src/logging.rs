//! Tracing setup for processes embedding the identity service.
//!
//! Mutex contention, drift corrections and audit failures are all reported
//! through `tracing`; this module routes them to a daily rolling file in
//! [`IdentityConfig::log_dir`] and to the console.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, time::OffsetTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::IdentityConfig;
use crate::error::{IdentityError, Result};

const LOG_FILE_PREFIX: &str = "identity";

/// Install the global subscriber described by `config`.
///
/// `RUST_LOG` takes precedence over [`IdentityConfig::log_filter`]. The
/// returned guard flushes the file writer when dropped, so keep it alive for
/// the life of the process.
pub fn init_logging(config: &IdentityConfig) -> Result<WorkerGuard> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(&config.log_filter)?,
    };
    let (writer, guard) = tracing_appender::non_blocking(log_file(&config.log_dir)?);

    let timer = OffsetTime::local_rfc_3339().unwrap_or_else(|_| {
        OffsetTime::new(
            time::UtcOffset::UTC,
            time::format_description::well_known::Rfc3339,
        )
    });

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_timer(timer.clone())
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(fmt::layer().with_timer(timer).with_target(false))
        .with(filter)
        .try_init()
        .map_err(|e| IdentityError::Initialization(format!("Logging already initialized: {}", e)))?;

    tracing::info!(
        "Identity logging initialized (filter '{}', directory {})",
        config.log_filter,
        config.log_dir.display()
    );
    Ok(guard)
}

/// Parse a filter directive such as `identity=debug,authz=info`.
pub fn parse_filter(directives: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directives).map_err(|e| {
        IdentityError::Configuration(format!("Invalid log filter '{}': {}", directives, e))
    })
}

fn log_file(dir: &Path) -> Result<RollingFileAppender> {
    std::fs::create_dir_all(dir)?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .build(dir)
        .map_err(|e| {
            IdentityError::Initialization(format!(
                "Failed to open log file in {}: {}",
                dir.display(),
                e
            ))
        })
}
