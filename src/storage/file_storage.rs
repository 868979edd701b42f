use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use super::lock::SyncLock;
use super::{keys, StorageBridge};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Data directory not found")]
    DataDirNotFound,
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend keeping one `<key>.json` file per record
pub struct FileStorage {
    base_path: PathBuf,
    /// Serializes lock read-modify-write cycles within this process
    lock_guard: Mutex<()>,
}

impl FileStorage {
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            base_path,
            lock_guard: Mutex::new(()),
        }
    }

    /// Get the default data directory
    pub fn default_data_dir() -> Result<PathBuf> {
        dirs::data_local_dir()
            .map(|p| p.join("tabdeck"))
            .ok_or(StorageError::DataDirNotFound)
    }

    /// Initialize the storage directory
    pub async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.base_path).await?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.base_path.join(format!("{}.json", key))
    }

    async fn read_record(&self, key: &str) -> Result<Option<Value>> {
        match tokio::fs::read(self.record_path(key)).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write to a sibling temp file and rename over the record so readers
    /// never observe a partial write
    async fn write_record(&self, key: &str, value: &Value) -> Result<()> {
        tokio::fs::create_dir_all(&self.base_path).await?;
        let path = self.record_path(key);
        let tmp_path = self.base_path.join(format!(".{}.json.tmp", key));
        let data = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&tmp_path, data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn remove_record(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StorageBridge for FileStorage {
    async fn get_raw(&self, key: &str) -> Result<Option<Value>> {
        self.read_record(key).await
    }

    async fn put_raw(&self, key: &str, value: Value) -> Result<()> {
        self.write_record(key, &value).await
    }

    async fn remove_raw(&self, key: &str) -> Result<()> {
        self.remove_record(key).await
    }

    async fn acquire_lock(&self, owner: &str, ttl: Duration) -> Result<bool> {
        let _guard = self.lock_guard.lock().await;
        let current = match self.read_record(keys::SYNC_LOCK).await? {
            Some(value) => serde_json::from_value::<SyncLock>(value).ok(),
            None => None,
        };
        match SyncLock::try_take(current.as_ref(), owner, ttl) {
            Some(lock) => {
                self.write_record(keys::SYNC_LOCK, &serde_json::to_value(&lock)?)
                    .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release_lock(&self, owner: &str) -> Result<()> {
        let _guard = self.lock_guard.lock().await;
        let current = match self.read_record(keys::SYNC_LOCK).await? {
            Some(value) => serde_json::from_value::<SyncLock>(value).ok(),
            None => return Ok(()),
        };
        match current {
            Some(lock) if lock.owner != owner => {
                log::warn!("Sync lock now held by {}, not releasing for {}", lock.owner, owner);
                Ok(())
            }
            _ => self.remove_record(keys::SYNC_LOCK).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DEFAULT_LOCK_TTL;
    use crate::sync::config::{LocalSnapshot, SyncState, SyncStatus, WebDAVConfig};
    use tempfile::TempDir;

    fn create_test_storage() -> (FileStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path().to_path_buf());
        (storage, temp_dir)
    }

    #[tokio::test]
    async fn test_records_survive_new_instance() {
        let (storage, temp) = create_test_storage();
        storage.init().await.unwrap();

        let config = WebDAVConfig {
            server_url: "https://dav.example.com".to_string(),
            username: "me".to_string(),
            enabled: true,
            auto_sync_interval: Some(30),
            ..Default::default()
        };
        storage.save_config(&config).await.unwrap();
        storage
            .save_status(&SyncStatus::new(SyncState::Success, None, None))
            .await
            .unwrap();
        let device_id = storage.load_metadata().await.unwrap().device_id;

        let reopened = FileStorage::new(temp.path().to_path_buf());
        assert_eq!(reopened.load_config().await.unwrap(), Some(config));
        assert_eq!(reopened.load_status().await.unwrap().status, SyncState::Success);
        assert_eq!(reopened.load_metadata().await.unwrap().device_id, device_id);
        assert!(temp.path().join("webdav-config.json").exists());
    }

    #[tokio::test]
    async fn test_snapshot_replace_leaves_no_temp_file() {
        let (storage, temp) = create_test_storage();
        let snapshot = LocalSnapshot {
            bookmarks: vec![serde_json::json!({"id": "b1", "url": "https://example.com"})],
            categories: vec![serde_json::json!({"id": "c1"})],
            settings: serde_json::json!({"theme": "dark"}),
        };
        storage.replace_local_snapshot(&snapshot).await.unwrap();

        assert_eq!(storage.load_local_snapshot().await.unwrap(), snapshot);
        assert!(!temp.path().join(".local-data.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_lock_survives_restart_until_released() {
        let (storage, temp) = create_test_storage();
        assert!(storage.acquire_lock("a", DEFAULT_LOCK_TTL).await.unwrap());

        let reopened = FileStorage::new(temp.path().to_path_buf());
        assert!(!reopened.acquire_lock("b", DEFAULT_LOCK_TTL).await.unwrap());

        reopened.release_lock("a").await.unwrap();
        assert!(reopened.acquire_lock("b", DEFAULT_LOCK_TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_missing_record_is_ok() {
        let (storage, _temp) = create_test_storage();
        storage.clear_conflict().await.unwrap();
        storage.release_lock("nobody").await.unwrap();
    }
}
