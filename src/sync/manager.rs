use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::{StorageBridge, StorageError, SyncLock, DEFAULT_LOCK_TTL};

use super::config::{
    clamp_interval, ConflictResolution, SyncOptions, SyncOutcome, SyncState, SyncStats,
    SyncStatus, SyncTask, SyncTaskKind, WebDAVConfig,
};
use super::metadata::SyncMetadata;
use super::remote::{RemoteConnector, RemoteStatus, RemoteSyncResult, RemoteSyncService, SyncContext};
use super::scheduler::{AutoSyncTarget, IntervalScheduler};
use super::webdav::WebDAVError;

/// Interval used when auto sync is enabled without one
pub const DEFAULT_SYNC_INTERVAL: u32 = 30;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("ConfigInvalid: {0}")]
    ConfigInvalid(String),
    #[error("SyncInProgress")]
    SyncInProgress,
    #[error("NetworkError: {0}")]
    Network(String),
    #[error("ConflictDetected: {0}")]
    ConflictDetected(String),
    #[error("StorageError: {0}")]
    Storage(#[from] StorageError),
    #[error("Unknown: {0}")]
    Unknown(String),
}

impl SyncError {
    /// Stable name of the error kind
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::ConfigInvalid(_) => "ConfigInvalid",
            SyncError::SyncInProgress => "SyncInProgress",
            SyncError::Network(_) => "NetworkError",
            SyncError::ConflictDetected(_) => "ConflictDetected",
            SyncError::Storage(_) => "StorageError",
            SyncError::Unknown(_) => "Unknown",
        }
    }
}

impl From<WebDAVError> for SyncError {
    fn from(e: WebDAVError) -> Self {
        match e {
            WebDAVError::InvalidUrl(msg) => SyncError::ConfigInvalid(msg),
            other => SyncError::Network(other.to_string()),
        }
    }
}

/// Status snapshot served to UI polling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
    pub has_conflict: bool,
    pub is_auto_sync_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SyncMetadata>,
}

/// Coordinates sync tasks between local storage and the remote service.
///
/// Every data-moving operation runs under the persisted sync lock; a second
/// caller is rejected with [`SyncError::SyncInProgress`] rather than queued.
pub struct SyncManager {
    storage: Arc<dyn StorageBridge>,
    connector: Arc<dyn RemoteConnector>,
    /// Client built from the last valid config
    remote: Mutex<Option<Arc<dyn RemoteSyncService>>>,
    /// Task currently holding the lock in this process
    current_task: Mutex<Option<SyncTask>>,
    scheduler: IntervalScheduler,
    lock_ttl: Duration,
}

impl SyncManager {
    /// Create the manager and its periodic scheduler. Must be called from
    /// within a tokio runtime.
    pub fn new(storage: Arc<dyn StorageBridge>, connector: Arc<dyn RemoteConnector>) -> Arc<Self> {
        Self::with_lock_ttl(storage, connector, DEFAULT_LOCK_TTL)
    }

    pub fn with_lock_ttl(
        storage: Arc<dyn StorageBridge>,
        connector: Arc<dyn RemoteConnector>,
        lock_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<SyncManager>| {
            let target: Weak<dyn AutoSyncTarget> = weak.clone();
            Self {
                storage,
                connector,
                remote: Mutex::new(None),
                current_task: Mutex::new(None),
                scheduler: IntervalScheduler::spawn(target),
                lock_ttl,
            }
        })
    }

    pub fn storage(&self) -> &Arc<dyn StorageBridge> {
        &self.storage
    }

    pub fn scheduler(&self) -> &IntervalScheduler {
        &self.scheduler
    }

    /// Rebuild in-memory state from storage after a (re)start
    pub async fn init(&self) -> Result<(), SyncError> {
        let metadata = self.storage.load_metadata().await?;
        log::info!(
            "Sync: initializing for device {} ({} syncs so far)",
            metadata.device_id,
            metadata.total_syncs
        );

        let status = self.storage.load_status().await?;
        if status.status == SyncState::Syncing && self.live_lock().await?.is_none() {
            log::warn!("Sync: previous task {:?} was interrupted", status.task_id);
            self.storage
                .save_status(&SyncStatus::new(
                    SyncState::Error,
                    Some("Previous sync was interrupted".to_string()),
                    status.task_id,
                ))
                .await?;
        }

        if let Some(config) = self.storage.load_config().await? {
            if config.validate().is_ok() {
                match self.connector.connect(&config) {
                    Ok(remote) => self.set_remote(Some(remote)),
                    Err(e) => log::warn!("Sync: could not build remote client: {}", e),
                }
            }
            self.reconcile_scheduler(&config);
        }
        Ok(())
    }

    /// Lease held by any process that has not expired yet
    async fn live_lock(&self) -> Result<Option<SyncLock>, SyncError> {
        Ok(self
            .storage
            .load_lock()
            .await?
            .filter(|lock| !lock.is_expired(Utc::now())))
    }

    fn set_remote(&self, remote: Option<Arc<dyn RemoteSyncService>>) {
        *self.remote.lock().unwrap_or_else(|e| e.into_inner()) = remote;
    }

    fn cached_remote(&self) -> Option<Arc<dyn RemoteSyncService>> {
        self.remote.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn reconcile_scheduler(&self, config: &WebDAVConfig) {
        match config.scheduled_interval() {
            Some(minutes) => {
                self.scheduler.start(minutes);
            }
            None => self.scheduler.stop(),
        }
    }

    /// Remote client for the stored config, building it if needed
    async fn ready_remote(&self) -> Result<Arc<dyn RemoteSyncService>, SyncError> {
        let config = self
            .storage
            .load_config()
            .await?
            .ok_or_else(|| SyncError::ConfigInvalid("sync is not configured".to_string()))?;
        config.validate().map_err(SyncError::ConfigInvalid)?;

        if let Some(remote) = self.cached_remote() {
            return Ok(remote);
        }
        let remote = self.connector.connect(&config)?;
        self.set_remote(Some(remote.clone()));
        Ok(remote)
    }

    /// Validate, persist and apply a new remote configuration
    pub async fn update_config(&self, config: WebDAVConfig) -> Result<(), SyncError> {
        config.validate().map_err(SyncError::ConfigInvalid)?;
        let remote = self.connector.connect(&config)?;

        self.storage.save_config(&config).await?;
        self.set_remote(Some(remote));
        self.reconcile_scheduler(&config);

        log::info!(
            "Sync: config updated for {} (enabled={}, interval={:?})",
            config.server_url,
            config.enabled,
            config.auto_sync_interval
        );
        Ok(())
    }

    /// Bidirectional sync
    pub async fn sync(&self, options: SyncOptions) -> Result<SyncOutcome, SyncError> {
        self.execute(SyncTaskKind::Manual, options).await
    }

    /// Push the local snapshot to the remote
    pub async fn upload(&self, options: SyncOptions) -> Result<SyncOutcome, SyncError> {
        self.execute(SyncTaskKind::Upload, options).await
    }

    /// Replace the local snapshot with the remote copy
    pub async fn download(&self) -> Result<SyncOutcome, SyncError> {
        self.execute(SyncTaskKind::Download, SyncOptions::default()).await
    }

    pub async fn test_connection(&self) -> Result<(), SyncError> {
        let remote = self.ready_remote().await?;
        let result = remote.test_connection().await?;
        match result.status {
            RemoteStatus::Success => Ok(()),
            _ => Err(SyncError::Network(
                result
                    .error
                    .or(result.message)
                    .unwrap_or_else(|| "connection test failed".to_string()),
            )),
        }
    }

    pub async fn get_status(&self) -> Result<StatusReport, SyncError> {
        let status = self.storage.load_status().await?;
        let metadata = self.storage.load_metadata().await?;
        let has_conflict = self.storage.load_conflict().await?.is_some();
        Ok(StatusReport {
            status,
            last_sync_time: metadata.last_sync_time,
            has_conflict,
            is_auto_sync_enabled: self.scheduler.is_running(),
            metadata: Some(metadata),
        })
    }

    /// Re-run sync with a resolution strategy. Succeeds only if the re-run
    /// ends in success, which also clears the stored conflict.
    pub async fn resolve_conflict(
        &self,
        resolution: ConflictResolution,
    ) -> Result<SyncOutcome, SyncError> {
        if self.storage.load_conflict().await?.is_none() {
            log::info!("Sync: no stored conflict, running sync with {:?} anyway", resolution);
        }

        let outcome = self
            .execute(SyncTaskKind::Manual, SyncOptions::resolving(resolution))
            .await?;
        match outcome.status {
            SyncState::Success => Ok(outcome),
            _ => Err(SyncError::ConflictDetected(
                outcome
                    .message
                    .unwrap_or_else(|| format!("{:?} did not resolve the conflict", resolution)),
            )),
        }
    }

    /// Start or stop periodic sync and persist the choice into the config.
    /// Enabling needs a valid stored config.
    pub async fn enable_auto_sync(
        &self,
        enabled: bool,
        interval_minutes: Option<u32>,
    ) -> Result<(), SyncError> {
        let mut config = match self.storage.load_config().await? {
            Some(config) => config,
            None if enabled => {
                return Err(SyncError::ConfigInvalid("sync is not configured".to_string()))
            }
            None => {
                self.scheduler.stop();
                return Ok(());
            }
        };
        if enabled {
            config.validate().map_err(SyncError::ConfigInvalid)?;
        }
        config.enabled = enabled;
        if let Some(minutes) = interval_minutes {
            config.auto_sync_interval = Some(clamp_interval(minutes));
        }
        if enabled && config.auto_sync_interval.is_none() {
            config.auto_sync_interval = Some(DEFAULT_SYNC_INTERVAL);
        }

        self.storage.save_config(&config).await?;
        self.reconcile_scheduler(&config);
        log::info!(
            "Sync: auto sync {} (interval={:?})",
            if enabled { "enabled" } else { "disabled" },
            config.auto_sync_interval
        );
        Ok(())
    }

    /// Wipe all sync state except the device id. Refused while any process
    /// holds a live lease.
    pub async fn clear_sync_data(&self) -> Result<(), SyncError> {
        if self.is_sync_in_progress() {
            return Err(SyncError::SyncInProgress);
        }
        if let Some(lock) = self.live_lock().await? {
            log::info!("Sync: clear refused, lock held by {} until {}", lock.owner, lock.expires_at);
            return Err(SyncError::SyncInProgress);
        }
        self.scheduler.stop();
        self.storage.clear_all().await?;
        self.set_remote(None);
        log::info!("Sync: cleared all sync data");
        Ok(())
    }

    pub async fn get_sync_stats(&self) -> Result<SyncStats, SyncError> {
        let metadata = self.storage.load_metadata().await?;
        let status = self.storage.load_status().await?;
        let has_conflict = self.storage.load_conflict().await?.is_some();
        let config = self.storage.load_config().await?;
        Ok(SyncStats {
            device_id: metadata.device_id,
            version: metadata.version,
            total_syncs: metadata.total_syncs,
            last_sync_time: metadata.last_sync_time,
            status: status.status,
            has_conflict,
            auto_sync_enabled: self.scheduler.is_running(),
            auto_sync_interval: config.and_then(|c| c.auto_sync_interval),
            sync_in_progress: self.is_sync_in_progress(),
        })
    }

    /// When the remote copy was last written
    pub async fn remote_last_sync_time(&self) -> Result<Option<DateTime<Utc>>, SyncError> {
        self.ready_remote().await?.remote_last_sync_time().await
    }

    /// Whether a valid, enabled config is stored
    pub async fn is_enabled(&self) -> Result<bool, SyncError> {
        Ok(self
            .storage
            .load_config()
            .await?
            .map(|c| c.enabled && c.validate().is_ok())
            .unwrap_or(false))
    }

    pub fn is_sync_in_progress(&self) -> bool {
        self.current_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn current_task(&self) -> Option<SyncTask> {
        self.current_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Claim the in-process task slot. Fails when a task already holds it.
    fn claim_task(&self, task: &SyncTask) -> bool {
        let mut current = self.current_task.lock().unwrap_or_else(|e| e.into_inner());
        if current.is_some() {
            return false;
        }
        *current = Some(task.clone());
        true
    }

    fn release_task(&self, task: &SyncTask) {
        let mut current = self.current_task.lock().unwrap_or_else(|e| e.into_inner());
        if current.as_ref().map(|t| t.id) == Some(task.id) {
            *current = None;
        }
    }

    /// Run one data-moving task under the sync lock
    async fn execute(&self, kind: SyncTaskKind, options: SyncOptions) -> Result<SyncOutcome, SyncError> {
        let remote = self.ready_remote().await?;
        let task = SyncTask::new(kind, options);
        let owner = task.id.to_string();

        if !self.claim_task(&task) {
            log::info!("Sync: {:?} rejected, a task is already running", kind);
            return Err(SyncError::SyncInProgress);
        }
        match self.storage.acquire_lock(&owner, self.lock_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                self.release_task(&task);
                log::info!("Sync: {:?} rejected, another sync holds the lock", kind);
                return Err(SyncError::SyncInProgress);
            }
            Err(e) => {
                self.release_task(&task);
                return Err(e.into());
            }
        }
        log::info!("Sync: starting {:?} task {}", kind, task.id);

        let work = AssertUnwindSafe(self.run_task(&task, remote.as_ref())).catch_unwind();
        tokio::pin!(work);
        // Lease is renewed every TTL/2 while the remote call runs
        let mut renew = tokio::time::interval((self.lock_ttl / 2).max(Duration::from_millis(10)));
        renew.tick().await;
        let result = loop {
            tokio::select! {
                outcome = &mut work => {
                    break outcome.unwrap_or_else(|panic| Err(SyncError::Unknown(panic_message(panic))));
                }
                _ = renew.tick() => self.renew_lock(&owner).await,
            }
        };

        if let Err(e) = &result {
            log::error!("Sync: {:?} task {} failed: {}", kind, task.id, e);
            let status = SyncStatus::new(SyncState::Error, Some(e.to_string()), Some(task.id));
            if let Err(save_err) = self.storage.save_status(&status).await {
                log::error!("Sync: failed to persist error status: {}", save_err);
            }
        }

        self.finish_task(&task).await;
        result
    }

    async fn renew_lock(&self, owner: &str) {
        match self.storage.acquire_lock(owner, self.lock_ttl).await {
            Ok(true) => log::debug!("Sync: lease renewed for task {}", owner),
            Ok(false) => log::error!("Sync: task {} lost the sync lock", owner),
            Err(e) => log::warn!("Sync: failed to renew lease for task {}: {}", owner, e),
        }
    }

    async fn finish_task(&self, task: &SyncTask) {
        self.release_task(task);
        if let Err(e) = self.storage.release_lock(&task.id.to_string()).await {
            log::error!("Sync: failed to release lock for task {}: {}", task.id, e);
        }
    }

    async fn run_task(
        &self,
        task: &SyncTask,
        remote: &dyn RemoteSyncService,
    ) -> Result<SyncOutcome, SyncError> {
        let start = Instant::now();
        self.storage
            .save_status(&SyncStatus::new(SyncState::Syncing, None, Some(task.id)))
            .await?;

        let snapshot = self.storage.load_local_snapshot().await?;
        let metadata = self.storage.load_metadata().await?;
        let context = SyncContext {
            device_id: metadata.device_id.clone(),
            last_sync_time: metadata.last_sync_time,
            last_sync_hash: metadata.last_sync_hash.clone(),
        };

        let result = match task.kind {
            SyncTaskKind::Manual | SyncTaskKind::Auto => {
                remote.sync(&snapshot, &task.options, &context).await?
            }
            SyncTaskKind::Upload => remote.upload(&snapshot, &task.options, &context).await?,
            SyncTaskKind::Download => remote.download(&context).await?,
        };

        self.apply_result(task, result, metadata, start).await
    }

    /// Persist what the remote reported
    async fn apply_result(
        &self,
        task: &SyncTask,
        result: RemoteSyncResult,
        mut metadata: SyncMetadata,
        start: Instant,
    ) -> Result<SyncOutcome, SyncError> {
        match result.status {
            RemoteStatus::Success => {
                let mut data_applied = false;
                if task.kind != SyncTaskKind::Upload {
                    if let Some(data) = &result.data {
                        self.storage.replace_local_snapshot(data).await?;
                        data_applied = true;
                    }
                }
                self.storage.clear_conflict().await?;
                metadata.record_sync(result.remote_hash);
                self.storage.save_metadata(&metadata).await?;

                let message = result
                    .message
                    .unwrap_or_else(|| "Sync completed".to_string());
                self.storage
                    .save_status(&SyncStatus::new(
                        SyncState::Success,
                        Some(message.clone()),
                        Some(task.id),
                    ))
                    .await?;
                log::info!(
                    "Sync: {:?} task {} succeeded (data_applied={})",
                    task.kind,
                    task.id,
                    data_applied
                );

                Ok(SyncOutcome {
                    task_id: task.id,
                    kind: task.kind,
                    status: SyncState::Success,
                    message: Some(message),
                    conflict: None,
                    data_applied,
                    duration_ms: start.elapsed().as_millis() as u64,
                })
            }
            RemoteStatus::Conflict => {
                let conflict = result.conflict_info.ok_or_else(|| {
                    SyncError::Unknown("conflict result carried no conflict details".to_string())
                })?;
                self.storage.save_conflict(&conflict).await?;
                let message = result
                    .message
                    .unwrap_or_else(|| format!("Conflict detected: {:?}", conflict.kind));
                self.storage
                    .save_status(&SyncStatus::new(
                        SyncState::Conflict,
                        Some(message.clone()),
                        Some(task.id),
                    ))
                    .await?;
                log::warn!("Sync: {:?} task {} hit a conflict", task.kind, task.id);

                Ok(SyncOutcome {
                    task_id: task.id,
                    kind: task.kind,
                    status: SyncState::Conflict,
                    message: Some(message),
                    conflict: Some(conflict),
                    data_applied: false,
                    duration_ms: start.elapsed().as_millis() as u64,
                })
            }
            RemoteStatus::Error => Err(SyncError::Network(
                result
                    .error
                    .or(result.message)
                    .unwrap_or_else(|| "remote sync failed".to_string()),
            )),
        }
    }
}

#[async_trait]
impl AutoSyncTarget for SyncManager {
    async fn auto_sync(&self) {
        if self.is_sync_in_progress() {
            log::debug!("Sync: auto sync skipped, a task is already running");
            return;
        }
        match self.is_enabled().await {
            Ok(true) => {}
            Ok(false) => {
                log::debug!("Sync: auto sync skipped, sync is disabled");
                return;
            }
            Err(e) => {
                log::warn!("Sync: auto sync skipped, could not read config: {}", e);
                return;
            }
        }

        match self.execute(SyncTaskKind::Auto, SyncOptions::without_backup()).await {
            Ok(outcome) => log::info!("Sync: auto sync finished with {:?}", outcome.status),
            Err(SyncError::SyncInProgress) => {
                log::debug!("Sync: auto sync skipped, lock held elsewhere")
            }
            Err(e) => log::warn!("Sync: auto sync failed: {}", e),
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("sync task panicked: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("sync task panicked: {}", msg)
    } else {
        "sync task panicked".to_string()
    }
}
