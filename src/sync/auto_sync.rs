use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::storage::StorageBridge;

use super::config::{AutoSyncConfig, SyncOptions, SyncOutcome, SyncState};
use super::manager::{SyncError, SyncManager};
use super::metadata::SyncTimeRecord;

/// Events the host forwards to the debouncer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AutoSyncEvent {
    /// Local bookmarks, categories or settings changed
    DataChanged,
    /// A new-tab page was opened
    TabOpened,
}

#[derive(Debug)]
enum DebounceMessage {
    /// Push the pending upload out to now + delay
    Arm(Duration),
    Shutdown,
}

/// Serializes read-modify-write cycles on the persisted time record
struct TimeRecorder {
    storage: Arc<dyn StorageBridge>,
    guard: Mutex<()>,
}

impl TimeRecorder {
    async fn update(&self, apply: impl FnOnce(&mut SyncTimeRecord) + Send) -> Result<SyncTimeRecord, SyncError> {
        let _guard = self.guard.lock().await;
        let mut record = self.storage.load_time_record().await?;
        apply(&mut record);
        self.storage.save_time_record(&record).await?;
        Ok(record)
    }
}

/// Turns data-changed and page-opened events into uploads and downloads
pub struct AutoSyncScheduler {
    manager: Arc<SyncManager>,
    recorder: Arc<TimeRecorder>,
    sender: mpsc::UnboundedSender<DebounceMessage>,
}

impl AutoSyncScheduler {
    /// Spawn the debounce loop on the current tokio runtime
    pub fn new(manager: Arc<SyncManager>) -> Self {
        let recorder = Arc::new(TimeRecorder {
            storage: manager.storage().clone(),
            guard: Mutex::new(()),
        });
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(debounce_loop(manager.clone(), recorder.clone(), rx));

        Self {
            manager,
            recorder,
            sender: tx,
        }
    }

    fn storage(&self) -> &Arc<dyn StorageBridge> {
        self.manager.storage()
    }

    /// Record the change and (re)arm the upload debounce
    pub async fn on_data_changed(&self) -> Result<(), SyncError> {
        let now = Utc::now();
        self.recorder
            .update(|record| record.last_data_change_time = Some(now))
            .await?;

        let config = self.storage().load_auto_sync_config().await?;
        self.sender
            .send(DebounceMessage::Arm(Duration::from_millis(config.upload_delay_ms)))
            .map_err(|_| SyncError::Unknown("auto sync loop has stopped".to_string()))
    }

    /// Download check for a newly opened page. Returns the outcome when a
    /// download actually ran.
    pub async fn on_page_opened(&self) -> Result<Option<SyncOutcome>, SyncError> {
        let config = self.storage().load_auto_sync_config().await?;
        if !(config.enable_auto_download && config.download_on_page_open) {
            log::debug!("Auto sync: download on page open is off");
            return Ok(None);
        }
        if !self.manager.is_enabled().await? {
            log::debug!("Auto sync: remote sync is disabled");
            return Ok(None);
        }

        if config.check_remote_freshness {
            let record = self.storage().load_time_record().await?;
            match self.manager.remote_last_sync_time().await {
                Ok(remote_time) if record.should_download(remote_time) => {}
                Ok(remote_time) => {
                    log::debug!(
                        "Auto sync: remote ({:?}) not newer than last exchange ({:?})",
                        remote_time,
                        record.last_exchange()
                    );
                    return Ok(None);
                }
                Err(e) => {
                    log::warn!("Auto sync: could not check remote freshness, skipping: {}", e);
                    return Ok(None);
                }
            }
        }

        let outcome = self.manager.download().await?;
        if outcome.status == SyncState::Success {
            let now = Utc::now();
            self.recorder
                .update(|record| record.last_download_time = Some(now))
                .await?;
        }
        Ok(Some(outcome))
    }

    /// Entry point for host events. Sync failures are logged, not returned.
    pub async fn trigger(&self, event: AutoSyncEvent) -> Result<(), SyncError> {
        match event {
            AutoSyncEvent::DataChanged => self.on_data_changed().await,
            AutoSyncEvent::TabOpened => {
                match self.on_page_opened().await {
                    Ok(Some(outcome)) => {
                        log::info!("Auto sync: page-open download finished with {:?}", outcome.status)
                    }
                    Ok(None) => {}
                    Err(SyncError::SyncInProgress) => {
                        log::debug!("Auto sync: page-open download skipped, sync in progress")
                    }
                    Err(e) => log::warn!("Auto sync: page-open download failed: {}", e),
                }
                Ok(())
            }
        }
    }

    pub async fn config(&self) -> Result<AutoSyncConfig, SyncError> {
        Ok(self.storage().load_auto_sync_config().await?)
    }

    pub async fn update_config(&self, config: AutoSyncConfig) -> Result<(), SyncError> {
        self.storage().save_auto_sync_config(&config).await?;
        log::info!(
            "Auto sync: config updated (upload={}, download={}, delay={}ms)",
            config.enable_auto_upload,
            config.enable_auto_download,
            config.upload_delay_ms
        );
        Ok(())
    }

    pub async fn time_record(&self) -> Result<SyncTimeRecord, SyncError> {
        Ok(self.storage().load_time_record().await?)
    }

    /// Stop the debounce loop; a pending upload is dropped
    pub fn shutdown(&self) {
        let _ = self.sender.send(DebounceMessage::Shutdown);
    }
}

/// Single-slot trailing-edge debounce
async fn debounce_loop(
    manager: Arc<SyncManager>,
    recorder: Arc<TimeRecorder>,
    mut receiver: mpsc::UnboundedReceiver<DebounceMessage>,
) {
    let mut deadline: Option<Instant> = None;

    loop {
        let message = match deadline {
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {
                        deadline = None;
                        let manager = manager.clone();
                        let recorder = recorder.clone();
                        tokio::spawn(async move {
                            debounced_upload(&manager, &recorder).await;
                        });
                        continue;
                    }
                    msg = receiver.recv() => msg,
                }
            }
            None => receiver.recv().await,
        };

        match message {
            Some(DebounceMessage::Arm(delay)) => {
                deadline = Some(Instant::now() + delay);
            }
            Some(DebounceMessage::Shutdown) | None => break,
        }
    }

    log::debug!("Auto sync: debounce loop stopped");
}

async fn debounced_upload(manager: &SyncManager, recorder: &TimeRecorder) {
    let config = match manager.storage().load_auto_sync_config().await {
        Ok(config) => config,
        Err(e) => {
            log::warn!("Auto sync: could not read config: {}", e);
            return;
        }
    };
    if !config.enable_auto_upload {
        log::debug!("Auto sync: auto upload is off");
        return;
    }
    match manager.is_enabled().await {
        Ok(true) => {}
        Ok(false) => {
            log::debug!("Auto sync: remote sync is disabled");
            return;
        }
        Err(e) => {
            log::warn!("Auto sync: could not read remote config: {}", e);
            return;
        }
    }

    match manager.upload(SyncOptions::without_backup()).await {
        Ok(outcome) if outcome.status == SyncState::Success => {
            let now = Utc::now();
            if let Err(e) = recorder.update(|record| record.last_upload_time = Some(now)).await {
                log::error!("Auto sync: failed to record upload time: {}", e);
            }
            log::info!("Auto sync: uploaded after data change");
        }
        Ok(outcome) => log::warn!("Auto sync: upload ended with {:?}", outcome.status),
        Err(SyncError::SyncInProgress) => log::debug!("Auto sync: upload skipped, sync in progress"),
        Err(e) => log::warn!("Auto sync: upload failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::sync::testing::{sample_snapshot, valid_config, StubConnector, StubRemote, StubReply};
    use chrono::Duration as ChronoDuration;

    async fn setup(reply: StubReply) -> (AutoSyncScheduler, Arc<StubRemote>, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let remote = Arc::new(StubRemote::new(reply));
        let manager = SyncManager::new(storage.clone(), Arc::new(StubConnector::new(remote.clone())));
        let mut config = valid_config();
        config.enabled = true;
        manager.update_config(config).await.unwrap();
        (AutoSyncScheduler::new(manager), remote, storage)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_changes_uploads_once_after_last_event() {
        let (auto, remote, storage) = setup(StubReply::Success).await;

        for _ in 0..3 {
            auto.trigger(AutoSyncEvent::DataChanged).await.unwrap();
            tokio::time::sleep(Duration::from_millis(1500)).await;
        }
        // 1.5s after the last event: still waiting
        assert_eq!(remote.upload_calls(), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(remote.upload_calls(), 1);
        assert_eq!(remote.last_options().map(|o| o.create_backup), Some(false));

        let record = storage.load_time_record().await.unwrap();
        assert!(record.last_data_change_time.is_some());
        assert!(record.last_upload_time.is_some());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(remote.upload_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_delay_comes_from_config() {
        let (auto, remote, _storage) = setup(StubReply::Success).await;
        auto.update_config(AutoSyncConfig {
            upload_delay_ms: 10_000,
            ..Default::default()
        })
        .await
        .unwrap();

        auto.on_data_changed().await.unwrap();
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(remote.upload_calls(), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(remote.upload_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_upload_when_auto_upload_off() {
        let (auto, remote, storage) = setup(StubReply::Success).await;
        auto.update_config(AutoSyncConfig {
            enable_auto_upload: false,
            ..Default::default()
        })
        .await
        .unwrap();

        auto.on_data_changed().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(remote.upload_calls(), 0);
        // The change itself is still recorded
        assert!(storage.load_time_record().await.unwrap().last_data_change_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_upload_when_remote_disabled() {
        let (auto, remote, storage) = setup(StubReply::Success).await;
        let mut config = storage.load_config().await.unwrap().unwrap();
        config.enabled = false;
        storage.save_config(&config).await.unwrap();

        auto.on_data_changed().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(remote.upload_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_pending_upload() {
        let (auto, remote, _storage) = setup(StubReply::Success).await;
        auto.on_data_changed().await.unwrap();
        auto.shutdown();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(remote.upload_calls(), 0);
        assert!(auto.on_data_changed().await.is_err());
    }

    #[tokio::test]
    async fn test_page_open_downloads_only_when_remote_is_newer() {
        let (auto, remote, storage) =
            setup(StubReply::SuccessWithData(sample_snapshot("remote"))).await;

        // Nothing on the server yet
        assert!(auto.on_page_opened().await.unwrap().is_none());
        assert_eq!(remote.download_calls(), 0);

        let written = Utc::now() - ChronoDuration::minutes(1);
        remote.set_remote_time(Ok(Some(written)));
        let outcome = auto.on_page_opened().await.unwrap().unwrap();
        assert!(outcome.data_applied);
        assert_eq!(remote.download_calls(), 1);
        assert_eq!(storage.load_local_snapshot().await.unwrap(), sample_snapshot("remote"));
        assert!(auto.time_record().await.unwrap().last_download_time.is_some());

        // Same remote copy again: our download is newer
        assert!(auto.on_page_opened().await.unwrap().is_none());
        assert_eq!(remote.download_calls(), 1);
    }

    #[tokio::test]
    async fn test_page_open_downloads_unconditionally_without_freshness_check() {
        let (auto, remote, _storage) = setup(StubReply::Success).await;
        auto.update_config(AutoSyncConfig {
            check_remote_freshness: false,
            ..Default::default()
        })
        .await
        .unwrap();

        auto.trigger(AutoSyncEvent::TabOpened).await.unwrap();
        auto.trigger(AutoSyncEvent::TabOpened).await.unwrap();
        assert_eq!(remote.download_calls(), 2);
    }

    #[tokio::test]
    async fn test_page_open_skips_when_freshness_check_fails() {
        let (auto, remote, _storage) = setup(StubReply::Success).await;
        remote.set_remote_time(Err("timeout".to_string()));

        assert!(auto.on_page_opened().await.unwrap().is_none());
        assert_eq!(remote.download_calls(), 0);
    }

    #[tokio::test]
    async fn test_page_open_respects_flags() {
        let (auto, remote, _storage) = setup(StubReply::Success).await;
        remote.set_remote_time(Ok(Some(Utc::now())));
        auto.update_config(AutoSyncConfig {
            download_on_page_open: false,
            ..Default::default()
        })
        .await
        .unwrap();

        auto.trigger(AutoSyncEvent::TabOpened).await.unwrap();
        assert_eq!(remote.download_calls(), 0);
    }

    #[tokio::test]
    async fn test_page_open_failure_is_swallowed_by_trigger() {
        let (auto, remote, storage) = setup(StubReply::Fail("offline".to_string())).await;
        remote.set_remote_time(Ok(Some(Utc::now())));

        assert!(auto.trigger(AutoSyncEvent::TabOpened).await.is_ok());
        assert_eq!(remote.download_calls(), 1);
        assert!(storage.load_time_record().await.unwrap().last_download_time.is_none());
    }

    #[test]
    fn test_event_names() {
        let event: AutoSyncEvent = serde_json::from_str("\"tab_opened\"").unwrap();
        assert_eq!(event, AutoSyncEvent::TabOpened);
        assert_eq!(
            serde_json::to_value(AutoSyncEvent::DataChanged).unwrap(),
            serde_json::json!("data_changed")
        );
    }
}
