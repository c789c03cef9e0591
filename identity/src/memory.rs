//! In-process implementations of the identity ports, for tests and local
//! development without a real identity provider.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use authz::DatabaseUserRecord;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::audit::{AuditEvent, AuditSink};
use crate::error::{IdentityError, Result};
use crate::provider::{IdentityProvider, UserDirectory};

/// Identity provider backed by a map of metadata bags.
#[derive(Default)]
pub struct InMemoryIdentityProvider {
    users: RwLock<HashMap<String, Map<String, Value>>>,
    unavailable: AtomicBool,
    writes: AtomicUsize,
}

impl InMemoryIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user with an empty metadata bag.
    pub async fn add_user(&self, user_id: &str) {
        self.users
            .write()
            .await
            .entry(user_id.to_string())
            .or_default();
    }

    /// Overwrite a user's bag directly, bypassing any validation.
    pub async fn set_raw(&self, user_id: &str, metadata: Map<String, Value>) {
        self.users
            .write()
            .await
            .insert(user_id.to_string(), metadata);
    }

    pub async fn raw(&self, user_id: &str) -> Option<Map<String, Value>> {
        self.users.read().await.get(user_id).cloned()
    }

    /// Simulate an outage: every call fails until switched back.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(IdentityError::IdentityProviderUnavailable(
                "in-memory provider switched off".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityProvider for InMemoryIdentityProvider {
    async fn read_metadata(&self, user_id: &str) -> Result<Option<Map<String, Value>>> {
        self.check_available()?;
        Ok(self.users.read().await.get(user_id).cloned())
    }

    async fn write_metadata(&self, user_id: &str, metadata: Map<String, Value>) -> Result<()> {
        self.check_available()?;
        let mut users = self.users.write().await;
        let Some(bag) = users.get_mut(user_id) else {
            return Err(IdentityError::UserNotFound(user_id.to_string()));
        };
        *bag = metadata;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// User directory backed by a map keyed by identity-provider id.
#[derive(Default)]
pub struct InMemoryUserDirectory {
    records: RwLock<HashMap<String, DatabaseUserRecord>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: DatabaseUserRecord) {
        self.records
            .write()
            .await
            .insert(record.external_id.clone(), record);
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<DatabaseUserRecord>> {
        Ok(self.records.read().await.get(external_id).cloned())
    }

    async fn list_external_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.records.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// Audit sink that keeps events in memory and can be told to fail.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
    failing: AtomicBool,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(IdentityError::AuditLog("audit store unavailable".to_string()));
        }
        self.events.lock().push(event.clone());
        Ok(())
    }
}
