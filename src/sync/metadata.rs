use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current schema version of the persisted sync records
pub const SYNC_SCHEMA_VERSION: u32 = 1;

/// Per-installation sync metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    pub version: u32,
    /// Stable identifier of this installation, never regenerated
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_syncs: u64,
    /// Content hash agreed with the remote at the last successful exchange
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_hash: Option<String>,
}

impl SyncMetadata {
    /// Fresh metadata with a newly generated device id
    pub fn new() -> Self {
        Self::with_device_id(generate_device_id())
    }

    pub fn with_device_id(device_id: String) -> Self {
        Self {
            version: SYNC_SCHEMA_VERSION,
            device_id,
            last_sync_time: None,
            total_syncs: 0,
            last_sync_hash: None,
        }
    }

    /// Record a successful exchange with the remote
    pub fn record_sync(&mut self, remote_hash: Option<String>) {
        self.last_sync_time = Some(Utc::now());
        self.total_syncs += 1;
        if remote_hash.is_some() {
            self.last_sync_hash = remote_hash;
        }
    }
}

impl Default for SyncMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Timestamps the auto-sync debouncer keeps across restarts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncTimeRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_data_change_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_upload_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_download_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub device_id: String,
}

impl SyncTimeRecord {
    pub fn new(device_id: String) -> Self {
        Self {
            device_id,
            ..Default::default()
        }
    }

    /// Most recent exchange with the remote in either direction
    pub fn last_exchange(&self) -> Option<DateTime<Utc>> {
        match (self.last_download_time, self.last_upload_time) {
            (Some(d), Some(u)) => Some(d.max(u)),
            (d, u) => d.or(u),
        }
    }

    /// Last-writer-wins guard for page-open downloads: pull only when the
    /// remote copy is strictly newer than our last exchange.
    pub fn should_download(&self, remote_last_sync: Option<DateTime<Utc>>) -> bool {
        match (remote_last_sync, self.last_exchange()) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(remote), Some(local)) => remote > local,
        }
    }
}

/// Generate a unique device id for this installation
fn generate_device_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}-{}", host, Uuid::new_v4().simple())
}
