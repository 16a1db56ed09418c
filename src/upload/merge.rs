//! Merge Engine
//!
//! Assembles the chunks of a complete session into one artifact. Runs under
//! the session's exclusive section, so it never overlaps chunk writes, a
//! second merge, or the sweeper.

use std::sync::Arc;

use futures::stream::{self, StreamExt};

use super::blob_store::{BlobError, BlobKey, BlobStore};
use super::checksum::{digest_stream, verify_hash};
use super::locks::SessionLocks;
use super::registry::SessionRegistry;
use super::types::{ChunkRecord, FinalArtifact, SessionStatus, UploadError, UploadSession};

#[derive(Clone)]
pub struct MergeEngine {
    registry: Arc<dyn SessionRegistry>,
    store: Arc<dyn BlobStore>,
    locks: SessionLocks,
}

impl MergeEngine {
    pub fn new(
        registry: Arc<dyn SessionRegistry>,
        store: Arc<dyn BlobStore>,
        locks: SessionLocks,
    ) -> Self {
        Self {
            registry,
            store,
            locks,
        }
    }

    /// Merge `file_id` and publish the result.
    ///
    /// Every failure before publication leaves chunk storage and the session
    /// status as they were, except a final checksum mismatch, which fails the
    /// session.
    pub async fn merge(&self, file_id: &str) -> Result<FinalArtifact, UploadError> {
        let _guard = self.locks.exclusive(file_id).await;

        let session = self
            .registry
            .get(file_id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(file_id.to_string()))?;

        if session.status.is_closed() {
            return Err(UploadError::state_conflict(&session));
        }

        let missing = session.missing_chunks();
        if !missing.is_empty() {
            return Err(UploadError::IncompleteUpload { missing });
        }

        tracing::info!(
            file_id = %file_id,
            chunks = session.expected_total_chunks,
            filename = %session.expected_filename,
            category = %session.category,
            "Assembling file from chunks"
        );

        let staging = BlobKey::staging(file_id)?;
        let (size, checksum) = match self.assemble(&session, &staging).await {
            Ok(assembled) => assembled,
            Err(e) => {
                self.discard(&staging).await;
                return Err(e);
            }
        };

        if let Some(expected) = &session.expected_checksum {
            if *expected != checksum {
                self.discard(&staging).await;
                self.registry.transition(file_id, SessionStatus::Failed).await?;

                tracing::warn!(
                    file_id = %file_id,
                    expected = %expected,
                    actual = %checksum,
                    "Final checksum mismatch, session failed"
                );

                return Err(UploadError::FinalChecksumMismatch {
                    expected: expected.clone(),
                    actual: checksum,
                });
            }
        }

        let final_key = BlobKey::artifact(
            &session.owner_id,
            &session.category,
            &session.expected_filename,
        )?;
        if let Err(e) = self.store.publish(&staging, &final_key).await {
            self.discard(&staging).await;
            return Err(e.into());
        }

        let artifact = FinalArtifact {
            file_id: file_id.to_string(),
            key: final_key.to_string(),
            category: session.category.clone(),
            filename: session.expected_filename.clone(),
            size,
            checksum,
        };

        // Chunks stay until the registry says MERGED, so a failed update is retryable
        self.registry.complete_merge(file_id, &artifact, false).await?;
        self.release_chunks(file_id).await;

        tracing::info!(
            file_id = %file_id,
            key = %artifact.key,
            size = artifact.size,
            checksum = %artifact.checksum,
            "File merged successfully"
        );

        Ok(artifact)
    }

    /// Re-verify each chunk and append it to `staging` in index order
    async fn assemble(
        &self,
        session: &UploadSession,
        staging: &BlobKey,
    ) -> Result<(u64, String), UploadError> {
        let chunks = stream::iter(&session.received).then(|(&index, record)| async move {
            let data = self.read_verified(session, index, record).await?;
            self.store.append(staging, &data).await?;
            Ok::<_, UploadError>(data)
        });

        let (checksum, size) = digest_stream(Box::pin(chunks)).await?;
        Ok((size, checksum))
    }

    /// Stored bytes of one chunk, checked against its recorded size and digest
    async fn read_verified(
        &self,
        session: &UploadSession,
        index: u32,
        record: &ChunkRecord,
    ) -> Result<Vec<u8>, UploadError> {
        let key = BlobKey::chunk(&session.file_id, index)?;
        let data = match self.store.get(&key).await {
            Ok(data) => data,
            Err(BlobError::NotFound(_)) => {
                tracing::warn!(file_id = %session.file_id, chunk_index = index, "Chunk missing from storage");
                return Err(UploadError::ChunkCorrupted(index));
            }
            Err(e) => return Err(e.into()),
        };

        if data.len() as u64 != record.size || !verify_hash(&data, &record.checksum) {
            tracing::warn!(
                file_id = %session.file_id,
                chunk_index = index,
                expected = %record.checksum,
                "Stored chunk no longer matches its checksum"
            );
            return Err(UploadError::ChunkCorrupted(index));
        }

        Ok(data)
    }

    /// Best-effort removal of chunk blobs after a successful merge
    async fn release_chunks(&self, file_id: &str) {
        match self.store.delete_prefix(&BlobKey::chunk_prefix(file_id)).await {
            Ok(count) => {
                tracing::debug!(file_id = %file_id, count = count, "Deleted merged chunks");
                if let Err(e) = self.registry.mark_chunks_released(file_id).await {
                    tracing::warn!(file_id = %file_id, error = %e, "Failed to record chunk release");
                }
            }
            Err(e) => {
                tracing::warn!(
                    file_id = %file_id,
                    error = %e,
                    "Failed to delete merged chunks, leaving them for the sweeper"
                );
            }
        }
    }

    async fn discard(&self, staging: &BlobKey) {
        if let Err(e) = self.store.delete(staging).await {
            tracing::warn!(key = %staging, error = %e, "Failed to delete staging blob");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
