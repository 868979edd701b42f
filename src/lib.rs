use std::path::PathBuf;
use std::sync::Arc;

pub mod storage;
pub mod sync;

use storage::{FileStorage, StorageBridge};
use sync::{AutoSyncScheduler, SyncError, SyncManager, SyncRpcHandler, WebDavConnector};

/// The wired-up sync engine: storage, coordinator, debouncer and RPC handler
pub struct SyncEngine {
    pub storage: Arc<dyn StorageBridge>,
    pub manager: Arc<SyncManager>,
    pub auto_sync: Arc<AutoSyncScheduler>,
    pub rpc: SyncRpcHandler,
}

impl SyncEngine {
    /// Build an engine over any storage backend and restore persisted state.
    /// Must be called from within a tokio runtime.
    pub async fn start(storage: Arc<dyn StorageBridge>) -> Result<Self, SyncError> {
        let manager = SyncManager::new(storage.clone(), Arc::new(WebDavConnector));
        manager.init().await?;

        let auto_sync = Arc::new(AutoSyncScheduler::new(manager.clone()));
        let rpc = SyncRpcHandler::new(manager.clone(), auto_sync.clone());

        Ok(Self {
            storage,
            manager,
            auto_sync,
            rpc,
        })
    }

    /// Engine over file storage in `data_dir`, or the default data directory
    pub async fn open(data_dir: Option<PathBuf>) -> Result<Self, SyncError> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => FileStorage::default_data_dir()?,
        };
        let storage = FileStorage::new(data_dir);
        storage.init().await?;
        log::info!("Sync data directory: {}", storage.base_path().display());

        Self::start(Arc::new(storage)).await
    }

    /// Stop both schedulers
    pub fn shutdown(&self) {
        self.auto_sync.shutdown();
        self.manager.scheduler().shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::sync::{RpcChannel, SyncState, SyncStatus};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_creates_data_dir() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("nested").join("tabdeck");
        let engine = SyncEngine::open(Some(dir.clone())).await.unwrap();
        assert!(dir.is_dir());

        let response = engine
            .rpc
            .handle_json(serde_json::json!({"action": "getStatus"}))
            .await;
        assert_eq!(response["success"], true);
        assert_eq!(response["status"]["status"], "idle");
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_start_marks_interrupted_sync() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .save_status(&SyncStatus::new(SyncState::Syncing, None, None))
            .await
            .unwrap();

        let engine = SyncEngine::start(storage.clone()).await.unwrap();
        assert_eq!(engine.storage.load_status().await.unwrap().status, SyncState::Error);
    }
}
