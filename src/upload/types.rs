//! Upload types for chunked, resumable uploads

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::blob_store::BlobError;

// ============================================================================
// Constants
// ============================================================================

/// Category used when the caller does not name one
pub const DEFAULT_CATEGORY: &str = "general";

/// Maximum chunk body size: 16MB
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Upper bound on `total_chunks` for a single session
pub const DEFAULT_MAX_TOTAL_CHUNKS: u32 = 100_000;

/// Session TTL: 24 hours
pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;

/// Longest accepted session TTL: 100 years
pub const MAX_SESSION_TTL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Background sweep period: 5 minutes
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

// ============================================================================
// Session Types
// ============================================================================

/// Parameters for creating a session, either by explicit registration or by
/// the first chunk of an unknown `file_id`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSession {
    pub file_id: String,
    pub owner_id: String,
    pub total_chunks: u32,
    pub filename: String,
    pub category: String,
    /// SHA-256 of the whole file, checked after merge when present
    #[serde(default)]
    pub expected_checksum: Option<String>,
}

/// A chunk the registry has accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub size: u64,
    pub checksum: String,
    pub received_at: DateTime<Utc>,
}

/// Upload session state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    pub file_id: String,
    pub owner_id: String,
    pub expected_total_chunks: u32,

    /// Accepted chunks keyed by index
    pub received: BTreeMap<u32, ChunkRecord>,

    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expected_filename: String,
    pub category: String,
    pub expected_checksum: Option<String>,

    /// Set once the session is merged
    pub final_checksum: Option<String>,
    pub final_key: Option<String>,
    pub final_size: Option<u64>,

    /// False while a merged session may still have chunk blobs on disk
    pub chunks_released: bool,
}

impl UploadSession {
    /// Create a new session in `Initiated` state
    pub fn new(request: &NewSession, now: DateTime<Utc>) -> Self {
        Self {
            file_id: request.file_id.clone(),
            owner_id: request.owner_id.clone(),
            expected_total_chunks: request.total_chunks,
            received: BTreeMap::new(),
            status: SessionStatus::Initiated,
            created_at: now,
            last_activity_at: now,
            expected_filename: request.filename.clone(),
            category: request.category.clone(),
            expected_checksum: request.expected_checksum.clone(),
            final_checksum: None,
            final_key: None,
            final_size: None,
            chunks_released: false,
        }
    }

    /// Check if every index in `[0, expected_total_chunks)` has been received
    pub fn is_complete(&self) -> bool {
        self.received.len() == self.expected_total_chunks as usize
            && self.missing_chunks().is_empty()
    }

    /// Get indices of chunks that still need to be uploaded
    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.expected_total_chunks)
            .filter(|i| !self.received.contains_key(i))
            .collect()
    }

    pub fn received_indices(&self) -> Vec<u32> {
        self.received.keys().copied().collect()
    }

    pub fn bytes_received(&self) -> u64 {
        self.received.values().map(|c| c.size).sum()
    }

    /// Calculate progress percentage
    pub fn progress(&self) -> f64 {
        if self.expected_total_chunks == 0 {
            return 100.0;
        }
        (self.received.len() as f64 / self.expected_total_chunks as f64) * 100.0
    }

    /// Whether the session is idle since before `cutoff`
    pub fn is_idle_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_activity_at < cutoff
    }
}

/// Session status
///
/// Transitions only move forward: `Initiated -> InProgress ->
/// CompletePendingMerge -> Merged`, or from any non-terminal state to
/// `Failed`/`Expired`. A failed session may still be retired to `Expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Registered, no chunk accepted yet
    Initiated,
    /// Receiving chunks
    InProgress,
    /// Every chunk received, waiting for merge
    CompletePendingMerge,
    /// Final artifact published
    Merged,
    /// Client-side assembly error or aborted by the client
    Failed,
    /// Reclaimed by the sweeper
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::InProgress => "in_progress",
            Self::CompletePendingMerge => "complete_pending_merge",
            Self::Merged => "merged",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    /// Merged, failed and expired sessions accept no further writes
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Merged | Self::Failed | Self::Expired)
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Initiated, InProgress)
                | (Initiated, CompletePendingMerge)
                | (InProgress, CompletePendingMerge)
                | (CompletePendingMerge, Merged)
                | (Initiated | InProgress | CompletePendingMerge, Failed)
                | (Initiated | InProgress | CompletePendingMerge | Failed, Expired)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(Self::Initiated),
            "in_progress" => Ok(Self::InProgress),
            "complete_pending_merge" => Ok(Self::CompletePendingMerge),
            "merged" => Ok(Self::Merged),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            other => Err(UploadError::Database(format!("unknown session status: {}", other))),
        }
    }
}

// ============================================================================
// Chunk Types
// ============================================================================

/// Result of offering a chunk to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkOutcome {
    /// Stored and recorded
    Accepted,
    /// Same index with the same checksum was already recorded
    DuplicateIgnored,
    /// Checksum disagrees with the bytes or with the recorded chunk
    ChecksumConflict,
    /// Session no longer accepts writes
    SessionClosed,
}

/// How the registry treats a different checksum at an already-filled index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkPolicy {
    /// Replace the recorded chunk while the session is `InProgress`
    pub overwrite_on_mismatch: bool,
}

/// Response after receiving a chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkReceipt {
    pub file_id: String,
    pub chunk_index: u32,
    pub outcome: ChunkOutcome,
    pub chunks_received: usize,
    pub total_chunks: u32,
    pub status: SessionStatus,
    pub complete: bool,
}

// ============================================================================
// Merge Types
// ============================================================================

/// The merged file as handed to the file catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalArtifact {
    pub file_id: String,
    /// Blob-store key of the published file
    pub key: String,
    pub category: String,
    pub filename: String,
    pub size: u64,
    pub checksum: String,
}

// ============================================================================
// Status View
// ============================================================================

/// Snapshot returned by status queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadStatus {
    pub file_id: String,
    pub status: SessionStatus,
    pub total_expected: u32,
    pub received_indices: Vec<u32>,
    pub missing_indices: Vec<u32>,
    pub bytes_received: u64,
    pub progress: f64,
    pub filename: String,
    pub category: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_checksum: Option<String>,
}

impl From<&UploadSession> for UploadStatus {
    fn from(session: &UploadSession) -> Self {
        Self {
            file_id: session.file_id.clone(),
            status: session.status,
            total_expected: session.expected_total_chunks,
            received_indices: session.received_indices(),
            missing_indices: session.missing_chunks(),
            bytes_received: session.bytes_received(),
            progress: session.progress(),
            filename: session.expected_filename.clone(),
            category: session.category.clone(),
            created_at: session.created_at,
            last_activity_at: session.last_activity_at,
            final_checksum: session.final_checksum.clone(),
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Chunk {index} checksum mismatch: expected {expected}, got {actual}")]
    ChecksumConflict {
        index: u32,
        expected: String,
        actual: String,
    },

    #[error("Chunk {0} is corrupted in storage")]
    ChunkCorrupted(u32),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {file_id} is {status}")]
    SessionStateConflict {
        file_id: String,
        status: SessionStatus,
    },

    #[error("Missing chunks: {missing:?}")]
    IncompleteUpload { missing: Vec<u32> },

    #[error("Final checksum mismatch: expected {expected}, got {actual}")]
    FinalChecksumMismatch { expected: String, actual: String },

    #[error("Session {0} belongs to another owner")]
    OwnerMismatch(String),

    #[error("Storage error: {0}")]
    Storage(#[from] BlobError),

    #[error("Database error: {0}")]
    Database(String),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::ChecksumConflict { .. } => StatusCode::CONFLICT,
            Self::ChunkCorrupted(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::SessionStateConflict { .. } => StatusCode::CONFLICT,
            Self::IncompleteUpload { .. } => StatusCode::BAD_REQUEST,
            Self::FinalChecksumMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::OwnerMismatch(_) => StatusCode::FORBIDDEN,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::ChecksumConflict { .. } => "CHECKSUM_CONFLICT",
            Self::ChunkCorrupted(_) => "CHUNK_CORRUPTED",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::SessionStateConflict { .. } => "SESSION_STATE_CONFLICT",
            Self::IncompleteUpload { .. } => "INCOMPLETE_UPLOAD",
            Self::FinalChecksumMismatch { .. } => "FINAL_CHECKSUM_MISMATCH",
            Self::OwnerMismatch(_) => "OWNER_MISMATCH",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
        }
    }

    pub(crate) fn state_conflict(session: &UploadSession) -> Self {
        Self::SessionStateConflict {
            file_id: session.file_id.clone(),
            status: session.status,
        }
    }
}

impl From<sqlx::Error> for UploadError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================
