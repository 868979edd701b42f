use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::client::{WebDAVClient, WebDAVError};
use crate::sync::config::{
    ConflictInfo, ConflictKind, ConflictResolution, LocalSnapshot, SyncOptions, WebDAVConfig,
};
use crate::sync::manager::SyncError;
use crate::sync::metadata::SYNC_SCHEMA_VERSION;
use crate::sync::remote::{RemoteConnector, RemoteSyncResult, RemoteSyncService, SyncContext};

/// File name of the synced document inside the sync path
pub const DATA_FILE: &str = "tabdeck-data.json";

/// Document stored on the server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEnvelope {
    pub version: u32,
    /// Device that wrote this copy
    pub device_id: String,
    pub last_sync_time: DateTime<Utc>,
    pub hash: String,
    pub data: LocalSnapshot,
}

impl RemoteEnvelope {
    pub fn new(data: LocalSnapshot, device_id: &str) -> Self {
        Self {
            version: SYNC_SCHEMA_VERSION,
            device_id: device_id.to_string(),
            last_sync_time: Utc::now(),
            hash: content_hash(&data),
            data,
        }
    }
}

/// Deterministic content hash of a snapshot
pub fn content_hash(snapshot: &LocalSnapshot) -> String {
    // serde_json maps are sorted, so equal snapshots serialize equally
    let bytes = serde_json::to_vec(snapshot).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    format!("sha256:{:x}", hasher.finalize())
}

/// What a bidirectional sync should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    Push,
    Pull,
    UpToDate,
    Conflict(ConflictKind),
}

/// Compare local and remote against the hash of the last exchange
pub fn decide(
    local: &LocalSnapshot,
    remote: Option<&RemoteEnvelope>,
    context: &SyncContext,
    resolution: Option<ConflictResolution>,
) -> SyncDecision {
    let Some(remote) = remote else {
        return SyncDecision::Push;
    };
    match resolution {
        Some(ConflictResolution::UseLocal) => return SyncDecision::Push,
        Some(ConflictResolution::UseRemote) => return SyncDecision::Pull,
        _ => {}
    }

    let local_hash = content_hash(local);
    if local_hash == remote.hash {
        return SyncDecision::UpToDate;
    }

    let Some(last_hash) = context.last_sync_hash.as_deref() else {
        // Never synced from here: an empty dashboard just adopts the remote
        return if local.is_empty() {
            SyncDecision::Pull
        } else {
            SyncDecision::Conflict(ConflictKind::HashMismatch)
        };
    };

    let local_changed = local_hash != last_hash;
    let remote_changed = remote.hash != last_hash;
    match (local_changed, remote_changed) {
        (true, false) => SyncDecision::Push,
        (false, _) => SyncDecision::Pull,
        (true, true) => {
            let remote_is_newer = context
                .last_sync_time
                .map(|t| remote.last_sync_time > t)
                .unwrap_or(true);
            if remote_is_newer {
                SyncDecision::Conflict(ConflictKind::DataConflict)
            } else {
                SyncDecision::Conflict(ConflictKind::TimestampConflict)
            }
        }
    }
}

/// Remote service storing one JSON envelope on a WebDAV server
pub struct WebDavSyncService {
    client: WebDAVClient,
    sync_path: String,
}

impl WebDavSyncService {
    pub fn new(config: &WebDAVConfig) -> Result<Self, WebDAVError> {
        Ok(Self {
            client: WebDAVClient::new(config)?,
            sync_path: config.sync_path.trim_matches('/').to_string(),
        })
    }

    fn data_path(&self) -> String {
        format!("{}/{}", self.sync_path, DATA_FILE)
    }

    fn backup_path(&self) -> String {
        format!(
            "{}/backups/tabdeck-data-{}.json",
            self.sync_path,
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        )
    }

    /// Current remote envelope and its ETag
    async fn fetch(&self) -> Result<Option<(RemoteEnvelope, Option<String>)>, SyncError> {
        let Some((bytes, etag)) = self.client.get(&self.data_path()).await? else {
            return Ok(None);
        };
        let envelope = serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::Network(format!("remote data is unreadable: {}", e)))?;
        Ok(Some((envelope, etag)))
    }

    /// Write the local snapshot over the remote copy
    async fn push(
        &self,
        snapshot: &LocalSnapshot,
        options: &SyncOptions,
        context: &SyncContext,
        previous: Option<(RemoteEnvelope, Option<String>)>,
    ) -> Result<RemoteSyncResult, SyncError> {
        self.client.mkdir_p(&self.sync_path).await?;

        let mut etag = None;
        if let Some((old, old_etag)) = previous {
            if options.create_backup {
                self.client.mkdir_p(&format!("{}/backups", self.sync_path)).await?;
                let bytes = serde_json::to_vec_pretty(&old)
                    .map_err(|e| SyncError::Unknown(e.to_string()))?;
                self.client.put(&self.backup_path(), bytes, None).await?;
                log::info!("WebDAV: backed up remote copy from {}", old.device_id);
            }
            etag = old_etag;
        }

        let envelope = RemoteEnvelope::new(snapshot.clone(), &context.device_id);
        let bytes = serde_json::to_vec_pretty(&envelope)
            .map_err(|e| SyncError::Unknown(e.to_string()))?;
        let response = self.client.put(&self.data_path(), bytes, etag.as_deref()).await?;
        if response.conflict {
            return Ok(RemoteSyncResult::error(
                "Remote data changed during upload, sync again",
            ));
        }

        log::info!("WebDAV: uploaded {} bookmarks", snapshot.bookmarks.len());
        Ok(RemoteSyncResult::success("Uploaded local data").with_hash(envelope.hash))
    }

    fn pull(envelope: RemoteEnvelope) -> RemoteSyncResult {
        log::info!("WebDAV: pulled data written by {}", envelope.device_id);
        RemoteSyncResult::success("Downloaded remote data")
            .with_hash(envelope.hash)
            .with_data(envelope.data)
    }
}

#[async_trait]
impl RemoteSyncService for WebDavSyncService {
    async fn upload(
        &self,
        snapshot: &LocalSnapshot,
        options: &SyncOptions,
        context: &SyncContext,
    ) -> Result<RemoteSyncResult, SyncError> {
        let previous = self.fetch().await?;
        self.push(snapshot, options, context, previous).await
    }

    async fn download(&self, _context: &SyncContext) -> Result<RemoteSyncResult, SyncError> {
        match self.fetch().await? {
            Some((envelope, _)) => Ok(Self::pull(envelope)),
            None => Ok(RemoteSyncResult::success("No remote data yet")),
        }
    }

    async fn sync(
        &self,
        snapshot: &LocalSnapshot,
        options: &SyncOptions,
        context: &SyncContext,
    ) -> Result<RemoteSyncResult, SyncError> {
        if options.conflict_resolution == Some(ConflictResolution::Merge) {
            return Ok(RemoteSyncResult::error("Merge resolution is not supported"));
        }

        let remote = self.fetch().await?;
        let decision = decide(
            snapshot,
            remote.as_ref().map(|(envelope, _)| envelope),
            context,
            options.conflict_resolution,
        );
        log::debug!("WebDAV: sync decision {:?}", decision);

        match (decision, remote) {
            (SyncDecision::UpToDate, Some((envelope, _))) => {
                Ok(RemoteSyncResult::success("Already up to date").with_hash(envelope.hash))
            }
            (SyncDecision::Pull, Some((envelope, _))) => Ok(Self::pull(envelope)),
            (SyncDecision::Conflict(kind), Some((envelope, _))) => {
                Ok(RemoteSyncResult::conflict(ConflictInfo {
                    kind,
                    local_data: snapshot.clone(),
                    remote_data: envelope.data,
                    local_timestamp: context.last_sync_time,
                    remote_timestamp: Some(envelope.last_sync_time),
                }))
            }
            (_, remote) => self.push(snapshot, options, context, remote).await,
        }
    }

    async fn test_connection(&self) -> Result<RemoteSyncResult, SyncError> {
        match self.client.test_connection().await {
            Ok(true) => Ok(RemoteSyncResult::success("Connection OK")),
            Ok(false) => Ok(RemoteSyncResult::error("Server returned no resources")),
            Err(e) => Ok(RemoteSyncResult::error(e.to_string())),
        }
    }

    async fn remote_last_sync_time(&self) -> Result<Option<DateTime<Utc>>, SyncError> {
        Ok(self.fetch().await?.map(|(envelope, _)| envelope.last_sync_time))
    }
}

/// Builds [`WebDavSyncService`] clients from stored configs
#[derive(Debug, Default, Clone, Copy)]
pub struct WebDavConnector;

impl RemoteConnector for WebDavConnector {
    fn connect(&self, config: &WebDAVConfig) -> Result<Arc<dyn RemoteSyncService>, SyncError> {
        Ok(Arc::new(WebDavSyncService::new(config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn snapshot(url: &str) -> LocalSnapshot {
        LocalSnapshot {
            bookmarks: vec![serde_json::json!({"id": "b1", "url": url})],
            categories: vec![],
            settings: serde_json::json!({"columns": 4}),
        }
    }

    fn context_after(synced: &LocalSnapshot) -> SyncContext {
        SyncContext {
            device_id: "laptop".to_string(),
            last_sync_time: Some(Utc::now() - Duration::hours(1)),
            last_sync_hash: Some(content_hash(synced)),
        }
    }

    #[test]
    fn test_content_hash_is_stable_and_prefixed() {
        let a = snapshot("https://a.example");
        assert_eq!(content_hash(&a), content_hash(&a.clone()));
        assert_ne!(content_hash(&a), content_hash(&snapshot("https://b.example")));
        assert!(content_hash(&a).starts_with("sha256:"));
    }

    #[test]
    fn test_missing_remote_pushes() {
        let local = snapshot("https://a.example");
        assert_eq!(decide(&local, None, &SyncContext::default(), None), SyncDecision::Push);
    }

    #[test]
    fn test_identical_content_is_up_to_date() {
        let local = snapshot("https://a.example");
        let remote = RemoteEnvelope::new(local.clone(), "phone");
        assert_eq!(
            decide(&local, Some(&remote), &SyncContext::default(), None),
            SyncDecision::UpToDate
        );
    }

    #[test]
    fn test_one_sided_changes() {
        let base = snapshot("https://base.example");
        let changed = snapshot("https://changed.example");
        let context = context_after(&base);

        // Only local changed
        let remote = RemoteEnvelope::new(base.clone(), "phone");
        assert_eq!(decide(&changed, Some(&remote), &context, None), SyncDecision::Push);

        // Only remote changed
        let remote = RemoteEnvelope::new(changed, "phone");
        assert_eq!(decide(&base, Some(&remote), &context, None), SyncDecision::Pull);
    }

    #[test]
    fn test_both_changed_is_a_conflict() {
        let base = snapshot("https://base.example");
        let context = context_after(&base);
        let mut remote = RemoteEnvelope::new(snapshot("https://remote.example"), "phone");
        let local = snapshot("https://local.example");

        assert_eq!(
            decide(&local, Some(&remote), &context, None),
            SyncDecision::Conflict(ConflictKind::DataConflict)
        );

        remote.last_sync_time = Utc::now() - Duration::days(1);
        assert_eq!(
            decide(&local, Some(&remote), &context, None),
            SyncDecision::Conflict(ConflictKind::TimestampConflict)
        );
    }

    #[test]
    fn test_first_sync_with_local_data_is_hash_mismatch() {
        let remote = RemoteEnvelope::new(snapshot("https://remote.example"), "phone");
        let context = SyncContext::default();

        assert_eq!(
            decide(&snapshot("https://local.example"), Some(&remote), &context, None),
            SyncDecision::Conflict(ConflictKind::HashMismatch)
        );
        assert_eq!(
            decide(&LocalSnapshot::default(), Some(&remote), &context, None),
            SyncDecision::Pull
        );
    }

    #[test]
    fn test_resolution_forces_direction() {
        let remote = RemoteEnvelope::new(snapshot("https://remote.example"), "phone");
        let local = snapshot("https://local.example");
        let context = SyncContext::default();

        assert_eq!(
            decide(&local, Some(&remote), &context, Some(ConflictResolution::UseLocal)),
            SyncDecision::Push
        );
        assert_eq!(
            decide(&local, Some(&remote), &context, Some(ConflictResolution::UseRemote)),
            SyncDecision::Pull
        );
        assert_eq!(
            decide(&local, Some(&remote), &context, Some(ConflictResolution::Manual)),
            SyncDecision::Conflict(ConflictKind::HashMismatch)
        );
    }

    #[test]
    fn test_envelope_wire_format() {
        let envelope = RemoteEnvelope::new(snapshot("https://a.example"), "laptop");
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["deviceId"], "laptop");
        assert!(json["lastSyncTime"].is_string());
        assert_eq!(json["data"]["bookmarks"][0]["id"], "b1");
    }

    #[test]
    fn test_connector_maps_bad_url_to_config_error() {
        let config = WebDAVConfig {
            server_url: "not a url".to_string(),
            username: "me".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            WebDavConnector.connect(&config),
            Err(SyncError::ConfigInvalid(_))
        ));
    }
}
