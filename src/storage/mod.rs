//! Durable state for the sync engine.
//!
//! Everything the engine persists goes through [`StorageBridge`]. Backends
//! only provide keyed JSON reads/writes and the lock primitive; the typed
//! record accessors are shared default methods.

mod file_storage;
mod lock;
mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::sync::config::{AutoSyncConfig, ConflictInfo, LocalSnapshot, SyncStatus, WebDAVConfig};
use crate::sync::metadata::{SyncMetadata, SyncTimeRecord};

pub use file_storage::{FileStorage, Result, StorageError};
pub use lock::{SyncLock, DEFAULT_LOCK_TTL};
pub use memory::MemoryStorage;

/// Storage keys of the persisted records
pub mod keys {
    pub const WEBDAV_CONFIG: &str = "webdav-config";
    pub const SYNC_STATUS: &str = "sync-status";
    pub const SYNC_LOCK: &str = "sync-lock";
    pub const SYNC_METADATA: &str = "sync-metadata";
    pub const CONFLICT_DATA: &str = "conflict-data";
    pub const AUTO_SYNC_CONFIG: &str = "auto-sync-config";
    pub const SYNC_TIME_RECORD: &str = "sync-time-record";
    pub const LOCAL_DATA: &str = "local-data";

    /// Keys wiped by `clear_all`. Local data belongs to the dashboard and
    /// metadata is reset separately so the device id survives.
    pub const SYNC_KEYS: &[&str] = &[
        WEBDAV_CONFIG,
        SYNC_STATUS,
        SYNC_LOCK,
        CONFLICT_DATA,
        AUTO_SYNC_CONFIG,
        SYNC_TIME_RECORD,
    ];
}

async fn read<S, T>(store: &S, key: &str) -> Result<Option<T>>
where
    S: StorageBridge + ?Sized,
    T: DeserializeOwned,
{
    match store.get_raw(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

async fn write<S, T>(store: &S, key: &str, record: &T) -> Result<()>
where
    S: StorageBridge + ?Sized,
    T: Serialize + Sync,
{
    store.put_raw(key, serde_json::to_value(record)?).await
}

/// Durable key/value persistence consumed by the sync engine
#[async_trait]
pub trait StorageBridge: Send + Sync {
    /// Read a raw record
    async fn get_raw(&self, key: &str) -> Result<Option<Value>>;

    /// Replace a raw record. Backends must make this all-or-nothing.
    async fn put_raw(&self, key: &str, value: Value) -> Result<()>;

    async fn remove_raw(&self, key: &str) -> Result<()>;

    /// Take the sync lock for `owner`. Returns `false` when someone else
    /// holds a live lease. Calling it again as the holder extends the lease.
    async fn acquire_lock(&self, owner: &str, ttl: Duration) -> Result<bool>;

    /// Release the sync lock if `owner` still holds it
    async fn release_lock(&self, owner: &str) -> Result<()>;

    async fn load_lock(&self) -> Result<Option<SyncLock>> {
        read(self, keys::SYNC_LOCK).await
    }

    async fn load_config(&self) -> Result<Option<WebDAVConfig>> {
        read(self, keys::WEBDAV_CONFIG).await
    }

    async fn save_config(&self, config: &WebDAVConfig) -> Result<()> {
        write(self, keys::WEBDAV_CONFIG, config).await
    }

    async fn load_local_snapshot(&self) -> Result<LocalSnapshot> {
        Ok(read(self, keys::LOCAL_DATA).await?.unwrap_or_default())
    }

    /// Swap the whole local snapshot in one write
    async fn replace_local_snapshot(&self, snapshot: &LocalSnapshot) -> Result<()> {
        write(self, keys::LOCAL_DATA, snapshot).await
    }

    async fn load_status(&self) -> Result<SyncStatus> {
        Ok(read(self, keys::SYNC_STATUS).await?.unwrap_or_default())
    }

    async fn save_status(&self, status: &SyncStatus) -> Result<()> {
        write(self, keys::SYNC_STATUS, status).await
    }

    async fn load_conflict(&self) -> Result<Option<ConflictInfo>> {
        read(self, keys::CONFLICT_DATA).await
    }

    async fn save_conflict(&self, conflict: &ConflictInfo) -> Result<()> {
        write(self, keys::CONFLICT_DATA, conflict).await
    }

    async fn clear_conflict(&self) -> Result<()> {
        self.remove_raw(keys::CONFLICT_DATA).await
    }

    /// Load metadata, creating and persisting it (with a new device id) on
    /// first use
    async fn load_metadata(&self) -> Result<SyncMetadata> {
        if let Some(metadata) = read(self, keys::SYNC_METADATA).await? {
            return Ok(metadata);
        }
        let metadata = SyncMetadata::new();
        log::info!("Generated device id {}", metadata.device_id);
        self.save_metadata(&metadata).await?;
        Ok(metadata)
    }

    async fn save_metadata(&self, metadata: &SyncMetadata) -> Result<()> {
        write(self, keys::SYNC_METADATA, metadata).await
    }

    async fn get_last_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
        let metadata: Option<SyncMetadata> = read(self, keys::SYNC_METADATA).await?;
        Ok(metadata.and_then(|m| m.last_sync_time))
    }

    async fn load_auto_sync_config(&self) -> Result<AutoSyncConfig> {
        Ok(read(self, keys::AUTO_SYNC_CONFIG).await?.unwrap_or_default())
    }

    async fn save_auto_sync_config(&self, config: &AutoSyncConfig) -> Result<()> {
        write(self, keys::AUTO_SYNC_CONFIG, config).await
    }

    async fn load_time_record(&self) -> Result<SyncTimeRecord> {
        if let Some(record) = read(self, keys::SYNC_TIME_RECORD).await? {
            return Ok(record);
        }
        let metadata = self.load_metadata().await?;
        Ok(SyncTimeRecord::new(metadata.device_id))
    }

    async fn save_time_record(&self, record: &SyncTimeRecord) -> Result<()> {
        write(self, keys::SYNC_TIME_RECORD, record).await
    }

    /// Wipe all sync state. The device id is kept.
    async fn clear_all(&self) -> Result<()> {
        let device_id = self.load_metadata().await?.device_id;
        for key in keys::SYNC_KEYS {
            self.remove_raw(key).await?;
        }
        self.save_metadata(&SyncMetadata::with_device_id(device_id)).await
    }
}
