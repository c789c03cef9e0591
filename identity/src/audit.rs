use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use authz::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::error::{IdentityError, Result};

/// Previous-hash value of the first entry in a log file.
const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    RoleChange,
    PermissionsUpdate,
    CustomAccessUpdate,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::RoleChange => "role_change",
            AuditAction::PermissionsUpdate => "permissions_update",
            AuditAction::CustomAccessUpdate => "custom_access_update",
        }
    }
}

/// Emitted once per effective role or permission mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub old_role: Option<Role>,
    pub new_role: Role,
    pub assigned_by: String,
    pub action: AuditAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(
        action: AuditAction,
        user_id: impl Into<String>,
        old_role: Option<Role>,
        new_role: Role,
        assigned_by: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            user_id: user_id.into(),
            old_role,
            new_role,
            assigned_by: assigned_by.into(),
            action,
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Consumer of audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> Result<()>;
}

/// One line of the audit log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: String,
    pub event: AuditEvent,
    /// Hash of the previous entry in the same file
    pub previous_hash: String,
    pub entry_hash: String,
}

impl AuditLogEntry {
    fn new(event: AuditEvent, previous_hash: String) -> Self {
        let mut entry = Self {
            id: ulid::Ulid::new().to_string(),
            event,
            previous_hash,
            entry_hash: String::new(),
        };
        entry.entry_hash = entry.calculate_hash();
        entry
    }

    fn calculate_hash(&self) -> String {
        let mut hasher = Sha256::new();
        let event = &self.event;

        hasher.update(self.id.as_bytes());
        hasher.update(event.timestamp.to_rfc3339().as_bytes());
        hasher.update(event.user_id.as_bytes());
        if let Some(old_role) = event.old_role {
            hasher.update(old_role.as_str().as_bytes());
        }
        hasher.update(event.new_role.as_str().as_bytes());
        hasher.update(event.assigned_by.as_bytes());
        hasher.update(event.action.as_str().as_bytes());
        if let Some(ref details) = event.details {
            hasher.update(details.to_string().as_bytes());
        }
        hasher.update(self.previous_hash.as_bytes());

        hex::encode(hasher.finalize())
    }

    pub fn verify_hash(&self) -> bool {
        self.entry_hash == self.calculate_hash()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogConfig {
    pub log_path: PathBuf,
    /// Size in MB at which the file is rotated
    pub max_size_mb: u64,
    /// Rotated files kept next to the live one
    pub max_rotations: u32,
}

impl Default for AuditLogConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("data/identity/audit.log"),
            max_size_mb: 100,
            max_rotations: 10,
        }
    }
}

/// Append-only JSON-lines audit log with a SHA256 hash chain.
///
/// Each rotated file is a self-contained chain starting from the genesis
/// hash, so every file can be verified on its own.
pub struct AuditLog {
    config: AuditLogConfig,
    // Held across the whole append so two writers never chain off the same
    // previous hash.
    last_hash: Mutex<String>,
}

impl AuditLog {
    pub fn new(config: AuditLogConfig) -> Result<Self> {
        if let Some(parent) = config.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let last_hash = if config.log_path.exists() {
            Self::read_last_hash(&config.log_path)?
        } else {
            GENESIS_HASH.to_string()
        };

        Ok(Self {
            config,
            last_hash: Mutex::new(last_hash),
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.log_path
    }

    pub async fn append(&self, event: &AuditEvent) -> Result<AuditLogEntry> {
        let mut last_hash = self.last_hash.lock().await;

        if self.rotate_if_needed()? {
            *last_hash = GENESIS_HASH.to_string();
        }

        let entry = AuditLogEntry::new(event.clone(), last_hash.clone());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.log_path)?;
        writeln!(file, "{}", serde_json::to_string(&entry)?)?;
        file.flush()?;

        *last_hash = entry.entry_hash.clone();

        info!(
            "Audit entry written: action={}, user={}, new_role={}",
            event.action.as_str(),
            event.user_id,
            event.new_role
        );
        Ok(entry)
    }

    /// Read every entry of the live file, failing on a tampered entry.
    pub async fn entries(&self) -> Result<Vec<AuditLogEntry>> {
        let _guard = self.last_hash.lock().await;
        if !self.config.log_path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&self.config.log_path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let entry: AuditLogEntry = serde_json::from_str(&line?)?;
            if !entry.verify_hash() {
                return Err(IdentityError::HashVerificationFailed);
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Verify every entry hash and the chain links of the live file.
    pub async fn verify_chain(&self) -> Result<bool> {
        let _guard = self.last_hash.lock().await;
        if !self.config.log_path.exists() {
            return Ok(true);
        }

        let reader = BufReader::new(File::open(&self.config.log_path)?);
        let mut expected_previous = GENESIS_HASH.to_string();
        let mut line_number = 0;

        for line in reader.lines() {
            line_number += 1;
            let entry: AuditLogEntry = serde_json::from_str(&line?).map_err(|e| {
                IdentityError::AuditLog(format!("Failed to parse line {}: {}", line_number, e))
            })?;

            if !entry.verify_hash() {
                error!(
                    "Audit hash verification failed at line {}: entry_id={}",
                    line_number, entry.id
                );
                return Ok(false);
            }
            if entry.previous_hash != expected_previous {
                error!(
                    "Audit chain broken at line {}: expected_previous={}, got={}",
                    line_number, expected_previous, entry.previous_hash
                );
                return Ok(false);
            }
            expected_previous = entry.entry_hash;
        }

        info!("Audit chain verified: {} entries", line_number);
        Ok(true)
    }

    /// Rotate the live file once it reaches the size limit. Returns whether a
    /// rotation happened.
    fn rotate_if_needed(&self) -> Result<bool> {
        if !self.config.log_path.exists() {
            return Ok(false);
        }
        let size_mb = std::fs::metadata(&self.config.log_path)?.len() / (1024 * 1024);
        if size_mb < self.config.max_size_mb {
            return Ok(false);
        }

        let rotated = self
            .config
            .log_path
            .with_extension(format!("{}.log", Utc::now().format("%Y%m%d_%H%M%S%.3f")));
        std::fs::rename(&self.config.log_path, &rotated)?;
        info!("Rotated audit log to: {:?}", rotated);

        self.cleanup_old_rotations()?;
        Ok(true)
    }

    fn cleanup_old_rotations(&self) -> Result<()> {
        let Some(parent) = self.config.log_path.parent() else {
            return Ok(());
        };
        let live_name = self
            .config
            .log_path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("audit.log")
            .to_string();
        let stem = self
            .config
            .log_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("audit")
            .to_string();

        let mut rotated: Vec<_> = std::fs::read_dir(parent)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with(&format!("{}.", stem)) && name != live_name)
            })
            .collect();
        // Rotated names embed their timestamp, so name order is age order.
        rotated.sort_by_key(|entry| entry.file_name());

        while rotated.len() > self.config.max_rotations as usize {
            let oldest = rotated.remove(0);
            std::fs::remove_file(oldest.path())?;
            info!("Removed old audit rotation: {:?}", oldest.path());
        }
        Ok(())
    }

    fn read_last_hash(path: &Path) -> Result<String> {
        let reader = BufReader::new(File::open(path)?);
        let mut last_hash = GENESIS_HASH.to_string();
        for line in reader.lines().map_while(|r| r.ok()) {
            if let Ok(entry) = serde_json::from_str::<AuditLogEntry>(&line) {
                last_hash = entry.entry_hash;
            }
        }
        Ok(last_hash)
    }
}

#[async_trait]
impl AuditSink for AuditLog {
    async fn record(&self, event: &AuditEvent) -> Result<()> {
        self.append(event).await.map(|_| ())
    }
}
