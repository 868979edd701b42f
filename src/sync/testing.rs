//! Scripted remote used by the coordinator, debouncer and RPC tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use super::config::{ConflictInfo, LocalSnapshot, SyncOptions, WebDAVConfig};
use super::manager::SyncError;
use super::remote::{RemoteConnector, RemoteSyncResult, RemoteSyncService, SyncContext};

pub fn valid_config() -> WebDAVConfig {
    WebDAVConfig {
        server_url: "https://dav.example.com/files/me".to_string(),
        username: "me".to_string(),
        password: "secret".to_string(),
        ..Default::default()
    }
}

pub fn sample_snapshot(tag: &str) -> LocalSnapshot {
    LocalSnapshot {
        bookmarks: vec![serde_json::json!({"id": format!("{}-1", tag), "url": "https://example.com"})],
        categories: vec![serde_json::json!({"id": format!("{}-cat", tag), "name": tag})],
        settings: serde_json::json!({"theme": tag}),
    }
}

/// What the stub answers to data-moving calls
#[derive(Debug, Clone)]
pub enum StubReply {
    Success,
    SuccessWithData(LocalSnapshot),
    Conflict(ConflictInfo),
    /// Resolves with an error result
    ErrorResult(String),
    /// Fails the call itself
    Fail(String),
    Panic,
}

#[derive(Default)]
pub struct StubRemote {
    reply: Mutex<Option<StubReply>>,
    remote_time: Mutex<Option<Result<Option<DateTime<Utc>>, String>>>,
    last_options: Mutex<Option<SyncOptions>>,
    last_uploaded: Mutex<Option<LocalSnapshot>>,
    uploads: AtomicUsize,
    downloads: AtomicUsize,
    syncs: AtomicUsize,
    yield_first: bool,
    gate: Option<Arc<Notify>>,
    gate_open: AtomicBool,
    entered: Notify,
}

impl StubRemote {
    pub fn new(reply: StubReply) -> Self {
        Self {
            reply: Mutex::new(Some(reply)),
            ..Default::default()
        }
    }

    /// Succeeds after yielding once to the runtime
    pub fn yielding() -> Self {
        Self {
            yield_first: true,
            ..Self::new(StubReply::Success)
        }
    }

    /// Succeeds only after `open_gate`
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Notify::new())),
            ..Self::new(StubReply::Success)
        }
    }

    pub fn set_reply(&self, reply: StubReply) {
        *self.reply.lock().unwrap() = Some(reply);
    }

    pub fn set_remote_time(&self, time: Result<Option<DateTime<Utc>>, String>) {
        *self.remote_time.lock().unwrap() = Some(time);
    }

    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            self.gate_open.store(true, Ordering::SeqCst);
            gate.notify_one();
        }
    }

    pub fn upload_calls(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn download_calls(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn sync_calls(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }

    pub fn last_options(&self) -> Option<SyncOptions> {
        self.last_options.lock().unwrap().clone()
    }

    pub fn last_uploaded(&self) -> Option<LocalSnapshot> {
        self.last_uploaded.lock().unwrap().clone()
    }

    async fn answer(&self) -> Result<RemoteSyncResult, SyncError> {
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            if !self.gate_open.load(Ordering::SeqCst) {
                gate.notified().await;
            }
        }
        if self.yield_first {
            tokio::task::yield_now().await;
        }

        let reply = self.reply.lock().unwrap().clone().unwrap_or(StubReply::Success);
        match reply {
            StubReply::Success => Ok(RemoteSyncResult::success("ok").with_hash("sha256:stub")),
            StubReply::SuccessWithData(data) => Ok(RemoteSyncResult::success("ok")
                .with_data(data)
                .with_hash("sha256:stub")),
            StubReply::Conflict(info) => Ok(RemoteSyncResult::conflict(info)),
            StubReply::ErrorResult(msg) => Ok(RemoteSyncResult::error(msg)),
            StubReply::Fail(msg) => Err(SyncError::Network(msg)),
            StubReply::Panic => panic!("stub remote exploded"),
        }
    }
}

#[async_trait]
impl RemoteSyncService for StubRemote {
    async fn upload(
        &self,
        snapshot: &LocalSnapshot,
        options: &SyncOptions,
        _context: &SyncContext,
    ) -> Result<RemoteSyncResult, SyncError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock().unwrap() = Some(options.clone());
        *self.last_uploaded.lock().unwrap() = Some(snapshot.clone());
        self.answer().await
    }

    async fn download(&self, _context: &SyncContext) -> Result<RemoteSyncResult, SyncError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.answer().await
    }

    async fn sync(
        &self,
        _snapshot: &LocalSnapshot,
        options: &SyncOptions,
        _context: &SyncContext,
    ) -> Result<RemoteSyncResult, SyncError> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock().unwrap() = Some(options.clone());
        self.answer().await
    }

    async fn test_connection(&self) -> Result<RemoteSyncResult, SyncError> {
        match self.reply.lock().unwrap().clone() {
            Some(StubReply::ErrorResult(msg)) => Ok(RemoteSyncResult::error(msg)),
            Some(StubReply::Fail(msg)) => Err(SyncError::Network(msg)),
            _ => Ok(RemoteSyncResult::success("Connection OK")),
        }
    }

    async fn remote_last_sync_time(&self) -> Result<Option<DateTime<Utc>>, SyncError> {
        match self.remote_time.lock().unwrap().clone() {
            Some(Ok(time)) => Ok(time),
            Some(Err(msg)) => Err(SyncError::Network(msg)),
            None => Ok(None),
        }
    }
}

/// Hands out the same stub for every config
pub struct StubConnector {
    remote: Arc<StubRemote>,
}

impl StubConnector {
    pub fn new(remote: Arc<StubRemote>) -> Self {
        Self { remote }
    }
}

impl RemoteConnector for StubConnector {
    fn connect(&self, _config: &WebDAVConfig) -> Result<Arc<dyn RemoteSyncService>, SyncError> {
        Ok(self.remote.clone())
    }
}
