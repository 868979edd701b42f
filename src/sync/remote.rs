use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::{ConflictInfo, LocalSnapshot, SyncOptions, WebDAVConfig};
use super::manager::SyncError;

/// Outcome reported by the remote service
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatus {
    Success,
    Conflict,
    Error,
}

/// Normalized result of a remote call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSyncResult {
    pub status: RemoteStatus,
    /// Remote snapshot to install locally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<LocalSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_info: Option<ConflictInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Content hash both sides agree on after this call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_hash: Option<String>,
}

impl RemoteSyncResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: RemoteStatus::Success,
            data: None,
            conflict_info: None,
            message: Some(message.into()),
            error: None,
            remote_hash: None,
        }
    }

    pub fn with_data(mut self, data: LocalSnapshot) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.remote_hash = Some(hash.into());
        self
    }

    pub fn conflict(info: ConflictInfo) -> Self {
        Self {
            status: RemoteStatus::Conflict,
            data: None,
            conflict_info: Some(info),
            message: Some("Local and remote data have diverged".to_string()),
            error: None,
            remote_hash: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            status: RemoteStatus::Error,
            data: None,
            conflict_info: None,
            message: None,
            error: Some(error.into()),
            remote_hash: None,
        }
    }
}

/// What the coordinator knows about the last exchange, handed to every call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncContext {
    pub device_id: String,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_sync_hash: Option<String>,
}

/// Performs the actual transfers against the remote store
#[async_trait]
pub trait RemoteSyncService: Send + Sync {
    async fn upload(
        &self,
        snapshot: &LocalSnapshot,
        options: &SyncOptions,
        context: &SyncContext,
    ) -> Result<RemoteSyncResult, SyncError>;

    async fn download(&self, context: &SyncContext) -> Result<RemoteSyncResult, SyncError>;

    /// Bidirectional sync; decides between push, pull and conflict
    async fn sync(
        &self,
        snapshot: &LocalSnapshot,
        options: &SyncOptions,
        context: &SyncContext,
    ) -> Result<RemoteSyncResult, SyncError>;

    async fn test_connection(&self) -> Result<RemoteSyncResult, SyncError>;

    /// When the remote copy was last written, if there is one
    async fn remote_last_sync_time(&self) -> Result<Option<DateTime<Utc>>, SyncError>;
}

/// Builds a remote client from a validated config
pub trait RemoteConnector: Send + Sync {
    fn connect(&self, config: &WebDAVConfig) -> Result<Arc<dyn RemoteSyncService>, SyncError>;
}
