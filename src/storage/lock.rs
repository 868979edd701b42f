use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lease length for the sync lock. A process killed between acquire and
/// release leaves a lock that frees itself after this long.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(5 * 60);

/// Persisted advisory mutex guarding data-moving sync operations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncLock {
    /// Task id of the holder
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SyncLock {
    pub fn new(owner: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(5));
        Self {
            owner: owner.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Decide whether `owner` may take the lock given the current record.
    /// Returns the record to persist when it may. The holder taking it again
    /// extends its lease.
    pub fn try_take(current: Option<&SyncLock>, owner: &str, ttl: Duration) -> Option<SyncLock> {
        match current {
            Some(lock) if lock.owner == owner => {
                let renewed = SyncLock::new(owner, ttl);
                Some(SyncLock {
                    acquired_at: lock.acquired_at,
                    ..renewed
                })
            }
            Some(lock) if !lock.is_expired(Utc::now()) => {
                log::debug!(
                    "Sync lock held by {} until {}, rejecting {}",
                    lock.owner,
                    lock.expires_at,
                    owner
                );
                None
            }
            Some(lock) => {
                log::warn!(
                    "Sync lock held by {} expired at {}, taking over for {}",
                    lock.owner,
                    lock.expires_at,
                    owner
                );
                Some(SyncLock::new(owner, ttl))
            }
            None => Some(SyncLock::new(owner, ttl)),
        }
    }
}
