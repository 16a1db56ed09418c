//! Cleanup Sweeper
//!
//! Reclaims chunk storage of sessions that went idle past their TTL or
//! failed. Each session is handled under the same exclusive section merge
//! uses, so a sweep never races a merge.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use super::blob_store::{BlobKey, BlobStore};
use super::locks::SessionLocks;
use super::registry::{is_sweep_candidate, SessionRegistry};
use super::types::{SessionStatus, UploadError};

/// What happens to a reclaimed session record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Keep the record as `Expired` so status queries can still report it
    #[default]
    MarkExpired,
    /// Drop the record entirely
    Remove,
}

impl FromStr for RetentionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "expire" | "expired" => Ok(Self::MarkExpired),
            "remove" => Ok(Self::Remove),
            other => Err(format!("unknown retention policy: {}", other)),
        }
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MarkExpired => f.write_str("expire"),
            Self::Remove => f.write_str("remove"),
        }
    }
}

/// Totals for one sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Sessions expired or removed
    pub reclaimed: usize,
    /// Merged sessions whose leftover chunks were deleted
    pub orphans_released: usize,
    /// Sessions skipped because of an error
    pub failed: usize,
}

enum Swept {
    Reclaimed,
    OrphansReleased,
    Skipped,
}

#[derive(Clone)]
pub struct Sweeper {
    registry: Arc<dyn SessionRegistry>,
    store: Arc<dyn BlobStore>,
    locks: SessionLocks,
    retention: RetentionPolicy,
}

impl Sweeper {
    pub fn new(
        registry: Arc<dyn SessionRegistry>,
        store: Arc<dyn BlobStore>,
        locks: SessionLocks,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            registry,
            store,
            locks,
            retention,
        }
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Reclaim sessions idle since before `now - ttl`, and every failed
    /// session. Running it twice reclaims nothing the second time.
    pub async fn sweep(&self, now: DateTime<Utc>, ttl: Duration) -> Result<SweepReport, UploadError> {
        let cutoff = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl))
            .ok_or_else(|| UploadError::Validation(format!("ttl of {:?} is out of range", ttl)))?;

        let candidates = self.registry.sweep_candidates(cutoff).await?;
        let mut report = SweepReport::default();

        for candidate in candidates {
            match self.sweep_one(&candidate.file_id, cutoff).await {
                Ok(Swept::Reclaimed) => report.reclaimed += 1,
                Ok(Swept::OrphansReleased) => report.orphans_released += 1,
                Ok(Swept::Skipped) => {}
                Err(e) => {
                    tracing::warn!(file_id = %candidate.file_id, error = %e, "Failed to sweep session");
                    report.failed += 1;
                }
            }
        }

        if report != SweepReport::default() {
            tracing::info!(
                reclaimed = report.reclaimed,
                orphans_released = report.orphans_released,
                failed = report.failed,
                "Sweep finished"
            );
        }

        Ok(report)
    }

    /// Sweep with the current time and return how many sessions were reclaimed
    pub async fn cleanup_stale(&self, ttl: Duration) -> Result<usize, UploadError> {
        Ok(self.sweep(Utc::now(), ttl).await?.reclaimed)
    }

    async fn sweep_one(&self, file_id: &str, cutoff: DateTime<Utc>) -> Result<Swept, UploadError> {
        let _guard = self.locks.exclusive(file_id).await;

        // Re-read: the session may have been merged, refreshed or removed
        let Some(session) = self.registry.get(file_id).await? else {
            return Ok(Swept::Skipped);
        };

        if session.status == SessionStatus::Merged {
            if session.chunks_released {
                return Ok(Swept::Skipped);
            }
            let count = self.store.delete_prefix(&BlobKey::chunk_prefix(file_id)).await?;
            self.registry.mark_chunks_released(file_id).await?;
            tracing::debug!(file_id = %file_id, count = count, "Released leftover chunks of merged session");
            return Ok(Swept::OrphansReleased);
        }

        if !is_sweep_candidate(&session, cutoff) {
            return Ok(Swept::Skipped);
        }

        let count = self.store.delete_prefix(&BlobKey::chunk_prefix(file_id)).await?;

        match self.retention {
            RetentionPolicy::MarkExpired => {
                self.registry.transition(file_id, SessionStatus::Expired).await?;
            }
            RetentionPolicy::Remove => {
                self.registry.remove(file_id).await?;
            }
        }

        tracing::debug!(
            file_id = %file_id,
            previous = %session.status,
            chunks = count,
            "Reclaimed session"
        );

        Ok(Swept::Reclaimed)
    }

    /// Start background sweep task
    pub fn start(self, interval: Duration, ttl: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep(Utc::now(), ttl).await {
                    tracing::error!(error = %e, "Sweep failed");
                }
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
