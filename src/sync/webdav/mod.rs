mod client;
mod service;

pub use client::{PutResponse, ResourceInfo, WebDAVClient, WebDAVError};
pub use service::{
    content_hash, decide, RemoteEnvelope, SyncDecision, WebDavConnector, WebDavSyncService,
    DATA_FILE,
};
