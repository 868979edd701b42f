use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Shortest interval the periodic scheduler accepts, in minutes
pub const MIN_SYNC_INTERVAL: u32 = 5;

/// Longest interval the periodic scheduler accepts, in minutes (one day)
pub const MAX_SYNC_INTERVAL: u32 = 24 * 60;

/// Default debounce window for data-changed uploads
pub const DEFAULT_UPLOAD_DELAY_MS: u64 = 2000;

/// Clamp a requested interval into the scheduler policy range
pub fn clamp_interval(minutes: u32) -> u32 {
    minutes.clamp(MIN_SYNC_INTERVAL, MAX_SYNC_INTERVAL)
}

/// WebDAV connection and auto-sync settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebDAVConfig {
    /// WebDAV server URL (e.g., "https://cloud.example.com/remote.php/dav/files/user/")
    pub server_url: String,
    pub username: String,
    pub password: String,
    /// Remote directory holding the synced data
    #[serde(default = "default_sync_path")]
    pub sync_path: String,
    /// Whether sync is enabled at all
    #[serde(default)]
    pub enabled: bool,
    /// Periodic sync interval in minutes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_sync_interval: Option<u32>,
}

fn default_sync_path() -> String {
    "/tabdeck".to_string()
}

impl Default for WebDAVConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            username: String::new(),
            password: String::new(),
            sync_path: default_sync_path(),
            enabled: false,
            auto_sync_interval: None,
        }
    }
}

impl WebDAVConfig {
    /// Check the fields a remote client needs. Returns a description of the
    /// first problem found.
    pub fn validate(&self) -> Result<(), String> {
        let url = self.server_url.trim();
        if url.is_empty() {
            return Err("server URL is required".to_string());
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err("server URL must start with http:// or https://".to_string());
        }
        if self.username.trim().is_empty() {
            return Err("username is required".to_string());
        }
        Ok(())
    }

    /// Interval the periodic scheduler should run at, if any
    pub fn scheduled_interval(&self) -> Option<u32> {
        if !self.enabled {
            return None;
        }
        self.auto_sync_interval.filter(|m| *m > 0).map(clamp_interval)
    }
}

/// Event-driven auto-sync settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoSyncConfig {
    #[serde(default = "default_true")]
    pub enable_auto_upload: bool,
    #[serde(default = "default_true")]
    pub enable_auto_download: bool,
    /// Debounce window for data-changed events
    #[serde(default = "default_upload_delay")]
    pub upload_delay_ms: u64,
    #[serde(default = "default_true")]
    pub download_on_page_open: bool,
    /// Only download on page open when the remote copy is newer than our
    /// last exchange
    #[serde(default = "default_true")]
    pub check_remote_freshness: bool,
}

fn default_true() -> bool {
    true
}

fn default_upload_delay() -> u64 {
    DEFAULT_UPLOAD_DELAY_MS
}

impl Default for AutoSyncConfig {
    fn default() -> Self {
        Self {
            enable_auto_upload: true,
            enable_auto_download: true,
            upload_delay_ms: DEFAULT_UPLOAD_DELAY_MS,
            download_on_page_open: true,
            check_remote_freshness: true,
        }
    }
}

/// Current sync state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// Nothing has run yet
    #[default]
    Idle,
    /// A task holds the lock
    Syncing,
    /// Last task succeeded
    Success,
    /// Last task failed
    Error,
    /// Last task produced a conflict awaiting resolution
    Conflict,
}

/// Persisted sync status, readable by any UI surface
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub status: SyncState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            status: SyncState::Idle,
            message: None,
            timestamp: Utc::now(),
            task_id: None,
        }
    }
}

impl SyncStatus {
    pub fn new(status: SyncState, message: Option<String>, task_id: Option<Uuid>) -> Self {
        Self {
            status,
            message,
            timestamp: Utc::now(),
            task_id,
        }
    }
}

/// Kind of task a data-moving operation runs as
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncTaskKind {
    Manual,
    Auto,
    Upload,
    Download,
}

/// Options accepted by sync and upload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncOptions {
    /// Keep a copy of the previous remote data before overwriting it
    #[serde(default = "default_true")]
    pub create_backup: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_resolution: Option<ConflictResolution>,
    #[serde(default)]
    pub auto_resolve_conflicts: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            create_backup: true,
            conflict_resolution: None,
            auto_resolve_conflicts: false,
        }
    }
}

impl SyncOptions {
    /// Options used by debounced auto-uploads
    pub fn without_backup() -> Self {
        Self {
            create_backup: false,
            ..Self::default()
        }
    }

    /// Options used to re-run a sync with a resolution strategy
    pub fn resolving(resolution: ConflictResolution) -> Self {
        Self {
            conflict_resolution: Some(resolution),
            auto_resolve_conflicts: true,
            ..Self::default()
        }
    }
}

/// The single in-flight task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTask {
    pub id: Uuid,
    pub kind: SyncTaskKind,
    pub options: SyncOptions,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl SyncTask {
    pub fn new(kind: SyncTaskKind, options: SyncOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            options,
            created_at: Utc::now(),
            retry_count: 0,
        }
    }
}

/// How local and remote data diverged
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    DataConflict,
    TimestampConflict,
    HashMismatch,
}

/// A conflict waiting for a resolution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    #[serde(rename = "type")]
    pub kind: ConflictKind,
    pub local_data: LocalSnapshot,
    pub remote_data: LocalSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_timestamp: Option<DateTime<Utc>>,
}

/// Strategy applied when resolving a conflict
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    Manual,
    UseLocal,
    UseRemote,
    Merge,
}

/// Bookmarks, categories and settings as owned by the dashboard stores.
/// Element schemas belong to those stores and are carried as-is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LocalSnapshot {
    #[serde(default)]
    pub bookmarks: Vec<serde_json::Value>,
    #[serde(default)]
    pub categories: Vec<serde_json::Value>,
    #[serde(default)]
    pub settings: serde_json::Value,
}

impl LocalSnapshot {
    pub fn is_empty(&self) -> bool {
        self.bookmarks.is_empty() && self.categories.is_empty() && self.settings.is_null()
    }
}

/// What a data-moving operation reports back to its caller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub task_id: Uuid,
    pub kind: SyncTaskKind,
    pub status: SyncState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictInfo>,
    /// Whether remote data replaced the local snapshot
    pub data_applied: bool,
    pub duration_ms: u64,
}

/// Aggregate numbers for settings screens
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub device_id: String,
    pub version: u32,
    pub total_syncs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
    pub status: SyncState,
    pub has_conflict: bool,
    pub auto_sync_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_sync_interval: Option<u32>,
    pub sync_in_progress: bool,
}
