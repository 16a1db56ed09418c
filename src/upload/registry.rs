//! Upload Session Registry
//!
//! Tracks per-upload state keyed by `file_id`. Every operation on a session
//! is a single atomic read-modify-write, so concurrent chunk arrivals never
//! lose updates.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::types::{
    ChunkOutcome, ChunkPolicy, ChunkRecord, FinalArtifact, NewSession, SessionStatus,
    UploadError, UploadSession,
};

// ============================================================================
// Registry Trait
// ============================================================================

/// Trait for session registry backends
#[async_trait::async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Return the session for `request.file_id`, creating it in `Initiated`
    /// state if absent. The flag is true when the session was created.
    async fn create_or_get(&self, request: &NewSession) -> Result<(UploadSession, bool), UploadError>;

    /// Record an accepted chunk. A duplicate or conflicting checksum leaves
    /// the session untouched.
    async fn record_chunk(
        &self,
        file_id: &str,
        index: u32,
        size: u64,
        checksum: &str,
        policy: ChunkPolicy,
    ) -> Result<(ChunkOutcome, UploadSession), UploadError>;

    async fn get(&self, file_id: &str) -> Result<Option<UploadSession>, UploadError>;

    /// Move the session to `next` if the current status allows it
    async fn transition(&self, file_id: &str, next: SessionStatus) -> Result<UploadSession, UploadError>;

    /// Mark the session merged and record the published artifact
    async fn complete_merge(
        &self,
        file_id: &str,
        artifact: &FinalArtifact,
        chunks_released: bool,
    ) -> Result<UploadSession, UploadError>;

    /// Note that a merged session's chunk blobs are gone
    async fn mark_chunks_released(&self, file_id: &str) -> Result<(), UploadError>;

    /// Sessions the sweeper should look at: unmerged sessions idle since
    /// before `cutoff`, failed sessions, and merged sessions that still own
    /// chunk blobs
    async fn sweep_candidates(&self, cutoff: DateTime<Utc>) -> Result<Vec<UploadSession>, UploadError>;

    /// Drop the session record. Returns false if it did not exist.
    async fn remove(&self, file_id: &str) -> Result<bool, UploadError>;
}

// ============================================================================
// Shared State Rules
// ============================================================================

/// Apply a chunk write to `session`, mutating it only on `Accepted`
pub(crate) fn apply_chunk(
    session: &mut UploadSession,
    index: u32,
    size: u64,
    checksum: &str,
    policy: ChunkPolicy,
    now: DateTime<Utc>,
) -> Result<ChunkOutcome, UploadError> {
    if session.status.is_closed() {
        return Ok(ChunkOutcome::SessionClosed);
    }

    if index >= session.expected_total_chunks {
        return Err(UploadError::Validation(format!(
            "chunk index {} out of range (total chunks: {})",
            index, session.expected_total_chunks
        )));
    }

    if let Some(existing) = session.received.get(&index) {
        if existing.checksum == checksum {
            return Ok(ChunkOutcome::DuplicateIgnored);
        }
        let may_overwrite =
            policy.overwrite_on_mismatch && session.status == SessionStatus::InProgress;
        if !may_overwrite {
            return Ok(ChunkOutcome::ChecksumConflict);
        }
    }

    session.received.insert(
        index,
        ChunkRecord {
            size,
            checksum: checksum.to_string(),
            received_at: now,
        },
    );
    session.last_activity_at = now;

    if session.is_complete() {
        session.status = SessionStatus::CompletePendingMerge;
    } else if session.status == SessionStatus::Initiated {
        session.status = SessionStatus::InProgress;
    }

    Ok(ChunkOutcome::Accepted)
}

pub(crate) fn apply_transition(
    session: &mut UploadSession,
    next: SessionStatus,
) -> Result<(), UploadError> {
    if !session.status.can_transition_to(next) {
        return Err(UploadError::state_conflict(session));
    }
    session.status = next;
    Ok(())
}

pub(crate) fn apply_merge(
    session: &mut UploadSession,
    artifact: &FinalArtifact,
    chunks_released: bool,
) -> Result<(), UploadError> {
    apply_transition(session, SessionStatus::Merged)?;
    session.final_checksum = Some(artifact.checksum.clone());
    session.final_key = Some(artifact.key.clone());
    session.final_size = Some(artifact.size);
    session.chunks_released = chunks_released;
    Ok(())
}

pub(crate) fn is_sweep_candidate(session: &UploadSession, cutoff: DateTime<Utc>) -> bool {
    match session.status {
        SessionStatus::Merged => !session.chunks_released,
        SessionStatus::Failed => true,
        SessionStatus::Expired => false,
        _ => session.is_idle_since(cutoff),
    }
}

// ============================================================================
// In-Memory Registry
// ============================================================================

/// In-memory registry; each call holds the map lock for its whole
/// read-modify-write
#[derive(Default)]
pub struct MemoryRegistry {
    sessions: RwLock<HashMap<String, UploadSession>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get session count
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait::async_trait]
impl SessionRegistry for MemoryRegistry {
    async fn create_or_get(&self, request: &NewSession) -> Result<(UploadSession, bool), UploadError> {
        let mut sessions = self.sessions.write().await;

        if let Some(existing) = sessions.get(&request.file_id) {
            return Ok((existing.clone(), false));
        }

        let session = UploadSession::new(request, Utc::now());
        sessions.insert(session.file_id.clone(), session.clone());
        Ok((session, true))
    }

    async fn record_chunk(
        &self,
        file_id: &str,
        index: u32,
        size: u64,
        checksum: &str,
        policy: ChunkPolicy,
    ) -> Result<(ChunkOutcome, UploadSession), UploadError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(file_id)
            .ok_or_else(|| UploadError::SessionNotFound(file_id.to_string()))?;

        let outcome = apply_chunk(session, index, size, checksum, policy, Utc::now())?;
        Ok((outcome, session.clone()))
    }

    async fn get(&self, file_id: &str) -> Result<Option<UploadSession>, UploadError> {
        Ok(self.sessions.read().await.get(file_id).cloned())
    }

    async fn transition(&self, file_id: &str, next: SessionStatus) -> Result<UploadSession, UploadError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(file_id)
            .ok_or_else(|| UploadError::SessionNotFound(file_id.to_string()))?;

        apply_transition(session, next)?;
        Ok(session.clone())
    }

    async fn complete_merge(
        &self,
        file_id: &str,
        artifact: &FinalArtifact,
        chunks_released: bool,
    ) -> Result<UploadSession, UploadError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(file_id)
            .ok_or_else(|| UploadError::SessionNotFound(file_id.to_string()))?;

        apply_merge(session, artifact, chunks_released)?;
        Ok(session.clone())
    }

    async fn mark_chunks_released(&self, file_id: &str) -> Result<(), UploadError> {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(file_id) {
            session.chunks_released = true;
        }
        Ok(())
    }

    async fn sweep_candidates(&self, cutoff: DateTime<Utc>) -> Result<Vec<UploadSession>, UploadError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|s| is_sweep_candidate(s, cutoff))
            .cloned()
            .collect())
    }

    async fn remove(&self, file_id: &str) -> Result<bool, UploadError> {
        Ok(self.sessions.write().await.remove(file_id).is_some())
    }
}

// ============================================================================
// Tests
// ============================================================================
