//! In-memory implementations of the persistence traits.
//!
//! Used by tests and by embedders that do not need durability. Each store can
//! be switched into an unavailable mode to exercise failure handling.

use crate::audit::{AuditEntry, AuditLog};
use crate::cipher::KeyVersion;
use crate::credential::{CredentialRecordStore, StoredCredential};
use crate::error::{AuditError, StoreError};
use crate::registry::{Integration, IntegrationStore, ListFilter, StateWrite};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use switchyard_core::{IntegrationId, OwnerId};
use tokio::sync::RwLock;

#[derive(Default)]
struct Outage(AtomicBool);

impl Outage {
    fn set(&self, down: bool) {
        self.0.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.0.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable {
                details: "store switched off".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

/// Integration records in a map.
#[derive(Default)]
pub struct InMemoryIntegrationStore {
    records: RwLock<HashMap<IntegrationId, Integration>>,
    outage: Outage,
}

impl InMemoryIntegrationStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with `Unavailable` while `down` is true.
    pub fn set_unavailable(&self, down: bool) {
        self.outage.set(down);
    }

    fn name_taken(
        records: &HashMap<IntegrationId, Integration>,
        owner: OwnerId,
        name: &str,
        except: Option<IntegrationId>,
    ) -> bool {
        records
            .values()
            .any(|i| i.owner == owner && i.display_name == name && Some(i.id) != except)
    }
}

#[async_trait]
impl IntegrationStore for InMemoryIntegrationStore {
    async fn insert(&self, integration: &Integration) -> Result<(), StoreError> {
        self.outage.check()?;
        let mut records = self.records.write().await;
        if Self::name_taken(&records, integration.owner, &integration.display_name, None) {
            return Err(StoreError::DuplicateName {
                name: integration.display_name.clone(),
            });
        }
        records.insert(integration.id, integration.clone());
        Ok(())
    }

    async fn find(&self, id: IntegrationId) -> Result<Option<Integration>, StoreError> {
        self.outage.check()?;
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn list(
        &self,
        owner: OwnerId,
        filter: &ListFilter,
    ) -> Result<Vec<Integration>, StoreError> {
        self.outage.check()?;
        let mut found: Vec<Integration> = self
            .records
            .read()
            .await
            .values()
            .filter(|i| i.owner == owner && filter.matches(i))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.display_name.cmp(&b.display_name).then(a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Integration>, StoreError> {
        self.outage.check()?;
        let mut due: Vec<Integration> = self
            .records
            .read()
            .await
            .values()
            .filter(|i| i.state.is_monitored() && i.next_test_at.is_none_or(|at| at <= now))
            .cloned()
            .collect();
        // `None` sorts first: never-scheduled integrations go before overdue ones.
        due.sort_by(|a, b| a.next_test_at.cmp(&b.next_test_at).then(a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn update_config(
        &self,
        id: IntegrationId,
        config: &BTreeMap<String, String>,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.outage.check()?;
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(&id) else {
            return Ok(false);
        };
        record.config.clone_from(config);
        record.updated_at = updated_at;
        Ok(true)
    }

    async fn rename(
        &self,
        id: IntegrationId,
        display_name: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.outage.check()?;
        let mut records = self.records.write().await;
        let Some(owner) = records.get(&id).map(|i| i.owner) else {
            return Ok(false);
        };
        if Self::name_taken(&records, owner, display_name, Some(id)) {
            return Err(StoreError::DuplicateName {
                name: display_name.to_string(),
            });
        }
        if let Some(record) = records.get_mut(&id) {
            record.display_name = display_name.to_string();
            record.updated_at = updated_at;
        }
        Ok(true)
    }

    async fn write_state(&self, id: IntegrationId, write: &StateWrite) -> Result<bool, StoreError> {
        self.outage.check()?;
        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(record) if record.state == write.expected => {
                record.state = write.state;
                record.last_error.clone_from(&write.last_error);
                record.last_tested_at = write.last_tested_at;
                record.next_test_at = write.next_test_at;
                record.consecutive_failures = write.consecutive_failures;
                record.updated_at = write.updated_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_next_test_at(
        &self,
        id: IntegrationId,
        at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        self.outage.check()?;
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(&id) else {
            return Ok(false);
        };
        record.next_test_at = at;
        Ok(true)
    }

    async fn delete(&self, id: IntegrationId) -> Result<bool, StoreError> {
        self.outage.check()?;
        Ok(self.records.write().await.remove(&id).is_some())
    }
}

/// Encrypted credential records in a map.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    records: RwLock<HashMap<IntegrationId, StoredCredential>>,
    outage: Outage,
}

impl InMemoryCredentialStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with `Unavailable` while `down` is true.
    pub fn set_unavailable(&self, down: bool) {
        self.outage.set(down);
    }
}

#[async_trait]
impl CredentialRecordStore for InMemoryCredentialStore {
    async fn upsert(&self, id: IntegrationId, record: &StoredCredential) -> Result<(), StoreError> {
        self.outage.check()?;
        self.records.write().await.insert(id, record.clone());
        Ok(())
    }

    async fn load(&self, id: IntegrationId) -> Result<Option<StoredCredential>, StoreError> {
        self.outage.check()?;
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn remove(&self, id: IntegrationId) -> Result<(), StoreError> {
        self.outage.check()?;
        self.records.write().await.remove(&id);
        Ok(())
    }

    async fn list_stale(&self, active: &KeyVersion) -> Result<Vec<IntegrationId>, StoreError> {
        self.outage.check()?;
        let mut stale: Vec<IntegrationId> = self
            .records
            .read()
            .await
            .iter()
            .filter(|(_, record)| &record.key_version != active)
            .map(|(id, _)| *id)
            .collect();
        stale.sort();
        Ok(stale)
    }
}

/// Audit entries in a vector, in append order.
#[derive(Default)]
pub struct InMemoryAuditLog {
    entries: RwLock<Vec<AuditEntry>>,
    outage: AtomicBool,
}

impl InMemoryAuditLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with `Unavailable` while `down` is true.
    pub fn set_unavailable(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    /// Returns every entry across all integrations.
    pub async fn all(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }

    fn check(&self) -> Result<(), AuditError> {
        if self.outage.load(Ordering::SeqCst) {
            Err(AuditError::Unavailable {
                details: "audit log switched off".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append(&self, entry: AuditEntry) -> Result<(), AuditError> {
        self.check()?;
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn list_for(&self, integration_id: IntegrationId) -> Result<Vec<AuditEntry>, AuditError> {
        self.check()?;
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|e| e.integration_id == integration_id)
            .cloned()
            .collect())
    }
}
