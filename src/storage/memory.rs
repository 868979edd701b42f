use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::file_storage::Result;
use super::lock::SyncLock;
use super::{keys, StorageBridge};

/// In-process storage backend. State lives as long as the value does.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: Mutex<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        // A poisoned map is still consistent: every write is a single insert.
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl StorageBridge for MemoryStorage {
    async fn get_raw(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.records().get(key).cloned())
    }

    async fn put_raw(&self, key: &str, value: Value) -> Result<()> {
        self.records().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_raw(&self, key: &str) -> Result<()> {
        self.records().remove(key);
        Ok(())
    }

    async fn acquire_lock(&self, owner: &str, ttl: Duration) -> Result<bool> {
        let mut records = self.records();
        let current = match records.get(keys::SYNC_LOCK) {
            Some(value) => Some(serde_json::from_value::<SyncLock>(value.clone())?),
            None => None,
        };
        match SyncLock::try_take(current.as_ref(), owner, ttl) {
            Some(lock) => {
                records.insert(keys::SYNC_LOCK.to_string(), serde_json::to_value(&lock)?);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release_lock(&self, owner: &str) -> Result<()> {
        let mut records = self.records();
        let held_by_owner = records
            .get(keys::SYNC_LOCK)
            .and_then(|value| serde_json::from_value::<SyncLock>(value.clone()).ok())
            .map(|lock| lock.owner == owner)
            .unwrap_or(true);
        if held_by_owner {
            records.remove(keys::SYNC_LOCK);
        } else {
            log::warn!("Sync lock no longer held by {}, leaving it in place", owner);
        }
        Ok(())
    }
}
