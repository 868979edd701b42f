//! Request/response surface for UI layers.
//!
//! Requests are tagged by `action`; responses always carry `success` and,
//! on failure, an `error` string starting with the error kind. Nothing here
//! returns `Err` to the caller.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::auto_sync::{AutoSyncEvent, AutoSyncScheduler};
use super::config::{
    AutoSyncConfig, ConflictResolution, SyncOptions, SyncOutcome, SyncState, SyncStats,
    WebDAVConfig,
};
use super::manager::{StatusReport, SyncError, SyncManager};
use super::metadata::SyncTimeRecord;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum SyncRequest {
    Sync {
        #[serde(default)]
        options: SyncOptions,
    },
    Upload {
        #[serde(default)]
        options: SyncOptions,
    },
    Download,
    TestConnection,
    GetStatus,
    UpdateConfig {
        config: WebDAVConfig,
    },
    ResolveConflict {
        resolution: ConflictResolution,
    },
    EnableAutoSync {
        enabled: bool,
        #[serde(default, rename = "intervalMinutes", skip_serializing_if = "Option::is_none")]
        interval_minutes: Option<u32>,
    },
    ClearSyncData,
    TriggerAutoSync {
        #[serde(rename = "eventType")]
        event_type: AutoSyncEvent,
    },
    GetAutoSyncConfig,
    UpdateAutoSyncConfig {
        config: AutoSyncConfig,
    },
    GetSyncStats,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SyncOutcome>,
    /// Fields of `getStatus`, inlined
    #[serde(flatten)]
    pub status: Option<StatusReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<AutoSyncConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_record: Option<SyncTimeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<SyncStats>,
}

impl SyncResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    fn from_unit(result: Result<(), SyncError>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => Self::failure(e.to_string()),
        }
    }

    /// Data-moving results count as success only when the task succeeded.
    /// A conflict keeps its outcome so the UI can show both sides.
    fn from_outcome(result: Result<SyncOutcome, SyncError>) -> Self {
        match result {
            Ok(outcome) if outcome.status == SyncState::Success => Self {
                result: Some(outcome),
                ..Self::ok()
            },
            Ok(outcome) => {
                let detail = outcome
                    .message
                    .clone()
                    .unwrap_or_else(|| "local and remote data have diverged".to_string());
                Self {
                    result: Some(outcome),
                    ..Self::failure(SyncError::ConflictDetected(detail).to_string())
                }
            }
            Err(e) => Self::failure(e.to_string()),
        }
    }
}

/// Transport-agnostic request/response channel
#[async_trait]
pub trait RpcChannel: Send + Sync {
    async fn handle(&self, request: SyncRequest) -> SyncResponse;

    /// JSON in, JSON out. Malformed requests get a failure response.
    async fn handle_json(&self, request: Value) -> Value {
        let response = match serde_json::from_value::<SyncRequest>(request) {
            Ok(request) => self.handle(request).await,
            Err(e) => SyncResponse::failure(format!("Unknown: invalid request: {}", e)),
        };
        serde_json::to_value(&response).unwrap_or_else(|e| {
            serde_json::json!({ "success": false, "error": format!("Unknown: {}", e) })
        })
    }
}

/// Dispatches requests to the coordinator and the debouncer
pub struct SyncRpcHandler {
    manager: Arc<SyncManager>,
    auto_sync: Arc<AutoSyncScheduler>,
}

impl SyncRpcHandler {
    pub fn new(manager: Arc<SyncManager>, auto_sync: Arc<AutoSyncScheduler>) -> Self {
        Self { manager, auto_sync }
    }
}

#[async_trait]
impl RpcChannel for SyncRpcHandler {
    async fn handle(&self, request: SyncRequest) -> SyncResponse {
        log::debug!("RPC: {:?}", request);
        match request {
            SyncRequest::Sync { options } => SyncResponse::from_outcome(self.manager.sync(options).await),
            SyncRequest::Upload { options } => {
                SyncResponse::from_outcome(self.manager.upload(options).await)
            }
            SyncRequest::Download => SyncResponse::from_outcome(self.manager.download().await),
            SyncRequest::TestConnection => SyncResponse::from_unit(self.manager.test_connection().await),
            SyncRequest::GetStatus => match self.manager.get_status().await {
                Ok(report) => SyncResponse {
                    status: Some(report),
                    ..SyncResponse::ok()
                },
                Err(e) => SyncResponse::failure(e.to_string()),
            },
            SyncRequest::UpdateConfig { config } => {
                SyncResponse::from_unit(self.manager.update_config(config).await)
            }
            SyncRequest::ResolveConflict { resolution } => SyncResponse::from_unit(
                self.manager.resolve_conflict(resolution).await.map(|_| ()),
            ),
            SyncRequest::EnableAutoSync {
                enabled,
                interval_minutes,
            } => SyncResponse::from_unit(self.manager.enable_auto_sync(enabled, interval_minutes).await),
            SyncRequest::ClearSyncData => SyncResponse::from_unit(self.manager.clear_sync_data().await),
            SyncRequest::TriggerAutoSync { event_type } => {
                SyncResponse::from_unit(self.auto_sync.trigger(event_type).await)
            }
            SyncRequest::GetAutoSyncConfig => {
                let config = self.auto_sync.config().await;
                let record = self.auto_sync.time_record().await;
                match (config, record) {
                    (Ok(config), Ok(record)) => SyncResponse {
                        config: Some(config),
                        time_record: Some(record),
                        ..SyncResponse::ok()
                    },
                    (Err(e), _) | (_, Err(e)) => SyncResponse::failure(e.to_string()),
                }
            }
            SyncRequest::UpdateAutoSyncConfig { config } => {
                SyncResponse::from_unit(self.auto_sync.update_config(config).await)
            }
            SyncRequest::GetSyncStats => match self.manager.get_sync_stats().await {
                Ok(stats) => SyncResponse {
                    stats: Some(stats),
                    ..SyncResponse::ok()
                },
                Err(e) => SyncResponse::failure(e.to_string()),
            },
        }
    }
}
