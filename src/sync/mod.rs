pub mod auto_sync;
pub mod config;
pub mod metadata;
pub mod remote;
pub mod rpc;
pub mod scheduler;
pub mod webdav;

mod manager;

#[cfg(test)]
mod testing;

pub use auto_sync::{AutoSyncEvent, AutoSyncScheduler};
pub use config::{
    AutoSyncConfig, ConflictInfo, ConflictKind, ConflictResolution, LocalSnapshot, SyncOptions,
    SyncOutcome, SyncState, SyncStats, SyncStatus, SyncTask, SyncTaskKind, WebDAVConfig,
};
pub use manager::{StatusReport, SyncError, SyncManager, DEFAULT_SYNC_INTERVAL};
pub use metadata::{SyncMetadata, SyncTimeRecord};
pub use remote::{RemoteConnector, RemoteStatus, RemoteSyncResult, RemoteSyncService, SyncContext};
pub use rpc::{RpcChannel, SyncRequest, SyncResponse, SyncRpcHandler};
pub use scheduler::IntervalScheduler;
pub use webdav::{WebDAVClient, WebDAVError, WebDavConnector, WebDavSyncService};
