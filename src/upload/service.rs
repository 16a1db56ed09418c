//! Upload Service
//!
//! Entry points for chunk receipt, status, merge, abort and cleanup.
//! Wires the registry, blob store, merge engine and sweeper together and
//! owns request validation.

use std::sync::Arc;
use std::time::Duration;

use super::blob_store::{sanitize_name, BlobKey, BlobStore};
use super::checksum::{compute_hash, is_valid_digest, normalize_digest};
use super::locks::SessionLocks;
use super::merge::MergeEngine;
use super::registry::SessionRegistry;
use super::sweeper::{RetentionPolicy, Sweeper};
use super::types::{
    ChunkOutcome, ChunkPolicy, ChunkReceipt, FinalArtifact, NewSession, SessionStatus,
    UploadError, UploadSession, UploadStatus, DEFAULT_CATEGORY, DEFAULT_MAX_CHUNK_SIZE,
    DEFAULT_MAX_TOTAL_CHUNKS, DEFAULT_SESSION_TTL_SECS,
};

/// Tunables for an upload service
#[derive(Debug, Clone, Copy)]
pub struct UploadSettings {
    pub chunk_policy: ChunkPolicy,
    pub max_chunk_size: usize,
    pub max_total_chunks: u32,
    pub retention: RetentionPolicy,
    pub session_ttl: Duration,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            chunk_policy: ChunkPolicy::default(),
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            max_total_chunks: DEFAULT_MAX_TOTAL_CHUNKS,
            retention: RetentionPolicy::default(),
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
        }
    }
}

/// Metadata accompanying one chunk body
#[derive(Debug, Clone, Default)]
pub struct ChunkUpload {
    pub file_id: String,
    pub owner_id: String,
    pub index: u32,
    pub total_chunks: u32,
    pub filename: String,
    pub category: Option<String>,
    /// SHA-256 of this chunk's bytes
    pub checksum: String,
    /// SHA-256 of the whole file, used when this chunk creates the session
    pub file_checksum: Option<String>,
}

struct UploadServiceInner {
    registry: Arc<dyn SessionRegistry>,
    store: Arc<dyn BlobStore>,
    locks: SessionLocks,
    merge: MergeEngine,
    sweeper: Sweeper,
    settings: UploadSettings,
}

/// Chunked upload service
#[derive(Clone)]
pub struct UploadService {
    inner: Arc<UploadServiceInner>,
}

impl UploadService {
    pub fn new(
        registry: Arc<dyn SessionRegistry>,
        store: Arc<dyn BlobStore>,
        settings: UploadSettings,
    ) -> Self {
        let locks = SessionLocks::new();
        let merge = MergeEngine::new(registry.clone(), store.clone(), locks.clone());
        let sweeper = Sweeper::new(
            registry.clone(),
            store.clone(),
            locks.clone(),
            settings.retention,
        );

        Self {
            inner: Arc::new(UploadServiceInner {
                registry,
                store,
                locks,
                merge,
                sweeper,
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.inner.settings
    }

    pub fn sweeper(&self) -> &Sweeper {
        &self.inner.sweeper
    }

    /// Register an upload ahead of its first chunk.
    ///
    /// Registering an existing `file_id` again returns its current status as
    /// long as owner and chunk count agree.
    pub async fn register_upload(&self, request: NewSession) -> Result<UploadStatus, UploadError> {
        let request = self.validate_session(request)?;
        let session = self.open_session(&request).await?;
        Ok(UploadStatus::from(&session))
    }

    /// Verify, store and record one chunk
    pub async fn receive_chunk(
        &self,
        upload: ChunkUpload,
        data: &[u8],
    ) -> Result<ChunkReceipt, UploadError> {
        let settings = &self.inner.settings;
        let index = upload.index;

        let request = self.validate_session(NewSession {
            file_id: upload.file_id,
            owner_id: upload.owner_id,
            total_chunks: upload.total_chunks,
            filename: upload.filename,
            category: upload.category.unwrap_or_default(),
            expected_checksum: upload.file_checksum,
        })?;

        if index >= request.total_chunks {
            return Err(UploadError::Validation(format!(
                "chunk index {} out of range (total chunks: {})",
                index, request.total_chunks
            )));
        }
        if data.len() > settings.max_chunk_size {
            return Err(UploadError::Validation(format!(
                "chunk of {} bytes exceeds the {} byte limit",
                data.len(),
                settings.max_chunk_size
            )));
        }

        let checksum = parse_digest("checksum", &upload.checksum)?;
        let actual = compute_hash(data);
        if actual != checksum {
            tracing::warn!(
                file_id = %request.file_id,
                chunk_index = index,
                expected = %checksum,
                actual = %actual,
                "Chunk checksum mismatch"
            );
            return Err(UploadError::ChecksumConflict {
                index,
                expected: checksum,
                actual,
            });
        }

        self.open_session(&request).await?;
        let file_id = request.file_id;

        let mut session_guard = self.inner.locks.shared(&file_id).await;
        let mut slot_guard = Some(self.inner.locks.slot(&file_id, index).await);
        let mut session = self.load_session(&file_id).await?;

        if replaces_chunk(&session, index, &checksum) && settings.chunk_policy.overwrite_on_mismatch {
            // Other writers could complete the session between the decision and the write
            slot_guard.take();
            drop(session_guard);
            session_guard = self.inner.locks.exclusive(&file_id).await;
            session = self.load_session(&file_id).await?;
        }

        if session.status.is_closed() {
            tracing::debug!(file_id = %file_id, chunk_index = index, status = %session.status, "Chunk for closed session");
            return Ok(receipt(&session, index, ChunkOutcome::SessionClosed));
        }

        let writes_blob = if replaces_chunk(&session, index, &checksum) {
            session_guard.is_exclusive() && session.status == SessionStatus::InProgress
        } else {
            // New index, or the same bytes again to heal a damaged blob
            true
        };

        if !writes_blob {
            tracing::warn!(
                file_id = %file_id,
                chunk_index = index,
                "Chunk conflicts with the one already recorded"
            );
            return Ok(receipt(&session, index, ChunkOutcome::ChecksumConflict));
        }

        self.inner
            .store
            .put(&BlobKey::chunk(&file_id, index)?, data)
            .await?;

        let (outcome, session) = self
            .inner
            .registry
            .record_chunk(&file_id, index, data.len() as u64, &checksum, settings.chunk_policy)
            .await?;

        match outcome {
            ChunkOutcome::Accepted => {
                tracing::debug!(
                    file_id = %file_id,
                    chunk_index = index,
                    size = data.len(),
                    received = session.received.len(),
                    total = session.expected_total_chunks,
                    "Received chunk"
                );
                if session.status == SessionStatus::CompletePendingMerge {
                    tracing::info!(file_id = %file_id, "All chunks received");
                }
            }
            ChunkOutcome::DuplicateIgnored => {
                tracing::debug!(file_id = %file_id, chunk_index = index, "Duplicate chunk ignored");
            }
            other => {
                tracing::warn!(file_id = %file_id, chunk_index = index, outcome = ?other, "Chunk not recorded");
            }
        }

        Ok(receipt(&session, index, outcome))
    }

    /// Status of an upload owned by `owner_id`
    pub async fn get_upload_status(
        &self,
        file_id: &str,
        owner_id: &str,
    ) -> Result<UploadStatus, UploadError> {
        let session = self.find_owned(file_id, owner_id).await?;
        Ok(UploadStatus::from(&session))
    }

    /// Assemble a complete upload into its final artifact
    pub async fn merge_upload(
        &self,
        file_id: &str,
        owner_id: &str,
    ) -> Result<FinalArtifact, UploadError> {
        self.find_owned(file_id, owner_id).await?;
        self.inner.merge.merge(file_id).await
    }

    /// Abandon an upload; its chunks are reclaimed on the next sweep
    pub async fn abort_upload(
        &self,
        file_id: &str,
        owner_id: &str,
    ) -> Result<UploadStatus, UploadError> {
        self.find_owned(file_id, owner_id).await?;

        let _guard = self.inner.locks.exclusive(file_id).await;
        let session = self
            .inner
            .registry
            .transition(file_id, SessionStatus::Failed)
            .await?;

        tracing::info!(file_id = %file_id, "Upload aborted");
        Ok(UploadStatus::from(&session))
    }

    /// Reclaim sessions idle longer than `ttl`; returns how many
    pub async fn cleanup_stale(&self, ttl: Duration) -> Result<usize, UploadError> {
        self.inner.sweeper.cleanup_stale(ttl).await
    }

    async fn open_session(&self, request: &NewSession) -> Result<UploadSession, UploadError> {
        let (session, created) = self.inner.registry.create_or_get(request).await?;

        if created {
            tracing::info!(
                file_id = %session.file_id,
                owner_id = %session.owner_id,
                total_chunks = session.expected_total_chunks,
                filename = %session.expected_filename,
                category = %session.category,
                "Created upload session"
            );
            return Ok(session);
        }

        if session.owner_id != request.owner_id {
            return Err(UploadError::OwnerMismatch(session.file_id));
        }
        if session.expected_total_chunks != request.total_chunks {
            return Err(UploadError::Validation(format!(
                "total_chunks {} does not match the session's {}",
                request.total_chunks, session.expected_total_chunks
            )));
        }

        Ok(session)
    }

    async fn load_session(&self, file_id: &str) -> Result<UploadSession, UploadError> {
        self.inner
            .registry
            .get(file_id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(file_id.to_string()))
    }

    /// A session owned by someone else is reported as missing
    async fn find_owned(&self, file_id: &str, owner_id: &str) -> Result<UploadSession, UploadError> {
        match self.inner.registry.get(file_id).await? {
            Some(session) if session.owner_id == owner_id => Ok(session),
            _ => Err(UploadError::SessionNotFound(file_id.to_string())),
        }
    }

    fn validate_session(&self, request: NewSession) -> Result<NewSession, UploadError> {
        if sanitize_name(&request.file_id).as_deref() != Some(request.file_id.as_str()) {
            return Err(UploadError::Validation(format!(
                "invalid file_id: {:?}",
                request.file_id
            )));
        }

        let owner_id = request.owner_id.trim();
        if owner_id.is_empty() {
            return Err(UploadError::Validation("owner_id is required".to_string()));
        }

        let max_total = self.inner.settings.max_total_chunks;
        if request.total_chunks == 0 || request.total_chunks > max_total {
            return Err(UploadError::Validation(format!(
                "total_chunks must be between 1 and {}",
                max_total
            )));
        }

        let filename = sanitize_name(&request.filename).ok_or_else(|| {
            UploadError::Validation(format!("invalid filename: {:?}", request.filename))
        })?;

        let category = if request.category.trim().is_empty() {
            DEFAULT_CATEGORY.to_string()
        } else {
            sanitize_name(&request.category).ok_or_else(|| {
                UploadError::Validation(format!("invalid category: {:?}", request.category))
            })?
        };

        let expected_checksum = request
            .expected_checksum
            .as_deref()
            .filter(|digest| !digest.trim().is_empty())
            .map(|digest| parse_digest("file_checksum", digest))
            .transpose()?;

        Ok(NewSession {
            file_id: request.file_id,
            owner_id: owner_id.to_string(),
            total_chunks: request.total_chunks,
            filename,
            category,
            expected_checksum,
        })
    }
}

fn parse_digest(field: &str, value: &str) -> Result<String, UploadError> {
    let digest = normalize_digest(value);
    if is_valid_digest(&digest) {
        Ok(digest)
    } else {
        Err(UploadError::Validation(format!(
            "{} must be a hex-encoded SHA-256 digest",
            field
        )))
    }
}

/// Whether `index` already holds a chunk with different bytes
fn replaces_chunk(session: &UploadSession, index: u32, checksum: &str) -> bool {
    session
        .received
        .get(&index)
        .is_some_and(|existing| existing.checksum != checksum)
}

fn receipt(session: &UploadSession, index: u32, outcome: ChunkOutcome) -> ChunkReceipt {
    ChunkReceipt {
        file_id: session.file_id.clone(),
        chunk_index: index,
        outcome,
        chunks_received: session.received.len(),
        total_chunks: session.expected_total_chunks,
        status: session.status,
        complete: session.is_complete(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::blob_store::{BlobError, LocalBlobStore, MemoryBlobStore};
    use crate::upload::registry::MemoryRegistry;
    use crate::upload::sqlite_registry::SqliteRegistry;
    use chrono::Utc;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    const TTL: Duration = Duration::from_secs(60);

    struct Fixture {
        registry: Arc<MemoryRegistry>,
        store: Arc<MemoryBlobStore>,
        service: UploadService,
    }

    fn fixture_with(settings: UploadSettings) -> Fixture {
        let registry = Arc::new(MemoryRegistry::new());
        let store = Arc::new(MemoryBlobStore::new());
        let service = UploadService::new(registry.clone(), store.clone(), settings);
        Fixture {
            registry,
            store,
            service,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(UploadSettings::default())
    }

    fn chunk(file_id: &str, index: u32, total: u32, data: &[u8]) -> ChunkUpload {
        ChunkUpload {
            file_id: file_id.to_string(),
            owner_id: "alice".to_string(),
            index,
            total_chunks: total,
            filename: "report.pdf".to_string(),
            category: Some("documents".to_string()),
            checksum: compute_hash(data),
            file_checksum: None,
        }
    }

    fn sample_file(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_three_chunk_upload_reassembles_file() {
        let fx = fixture();
        let data = sample_file(300);

        for (i, part) in data.chunks(100).enumerate() {
            let receipt = fx.service.receive_chunk(chunk("f1", i as u32, 3, part), part).await.unwrap();
            assert_eq!(receipt.outcome, ChunkOutcome::Accepted);
            assert_eq!(receipt.chunks_received, i + 1);
            assert_eq!(receipt.complete, i == 2);
        }

        let status = fx.service.get_upload_status("f1", "alice").await.unwrap();
        assert_eq!(status.status, SessionStatus::CompletePendingMerge);
        assert_eq!(status.bytes_received, 300);

        let artifact = fx.service.merge_upload("f1", "alice").await.unwrap();
        assert_eq!(artifact.key, "files/alice/documents/report.pdf");
        assert_eq!(artifact.size, 300);
        assert_eq!(artifact.checksum, compute_hash(&data));

        let stored = fx.store.get(&BlobKey::new(artifact.key.clone()).unwrap()).await.unwrap();
        assert_eq!(stored, data);

        let status = fx.service.get_upload_status("f1", "alice").await.unwrap();
        assert_eq!(status.status, SessionStatus::Merged);
        assert_eq!(status.final_checksum, Some(compute_hash(&data)));
    }

    #[tokio::test]
    async fn test_missing_middle_chunk_blocks_merge() {
        let fx = fixture();
        for index in [0u32, 2] {
            fx.service.receive_chunk(chunk("f1", index, 3, b"part"), b"part").await.unwrap();
        }

        let status = fx.service.get_upload_status("f1", "alice").await.unwrap();
        assert_eq!(status.missing_indices, vec![1]);

        match fx.service.merge_upload("f1", "alice").await {
            Err(UploadError::IncompleteUpload { missing }) => assert_eq!(missing, vec![1]),
            other => panic!("expected IncompleteUpload, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_checksum_persists_nothing() {
        let fx = fixture();
        let mut upload = chunk("f1", 0, 3, b"real bytes");
        upload.checksum = compute_hash(b"other bytes");

        let result = fx.service.receive_chunk(upload, b"real bytes").await;

        assert!(matches!(result, Err(UploadError::ChecksumConflict { index: 0, .. })));
        assert!(fx.store.is_empty().await);
        assert!(fx.registry.get("f1").await.unwrap().is_none());

        // Same against an existing session
        fx.service.receive_chunk(chunk("f1", 1, 3, b"one"), b"one").await.unwrap();
        let mut upload = chunk("f1", 0, 3, b"zero");
        upload.checksum = compute_hash(b"nope");
        assert!(fx.service.receive_chunk(upload, b"zero").await.is_err());

        let status = fx.service.get_upload_status("f1", "alice").await.unwrap();
        assert_eq!(status.received_indices, vec![1]);
        assert!(fx.store.get(&BlobKey::chunk("f1", 0).unwrap()).await.is_err());
    }

    #[tokio::test]
    async fn test_resubmitted_chunk_is_duplicate() {
        let fx = fixture();
        fx.service.receive_chunk(chunk("f1", 0, 2, b"zero"), b"zero").await.unwrap();
        let before = fx.registry.get("f1").await.unwrap().unwrap();

        for _ in 0..3 {
            let receipt = fx.service.receive_chunk(chunk("f1", 0, 2, b"zero"), b"zero").await.unwrap();
            assert_eq!(receipt.outcome, ChunkOutcome::DuplicateIgnored);
        }

        assert_eq!(fx.registry.get("f1").await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_duplicate_heals_damaged_blob() {
        let fx = fixture();
        fx.service.receive_chunk(chunk("f1", 0, 1, b"zero"), b"zero").await.unwrap();
        let key = BlobKey::chunk("f1", 0).unwrap();
        fx.store.put(&key, b"z3ro").await.unwrap();

        assert!(matches!(
            fx.service.merge_upload("f1", "alice").await,
            Err(UploadError::ChunkCorrupted(0))
        ));

        fx.service.receive_chunk(chunk("f1", 0, 1, b"zero"), b"zero").await.unwrap();
        let artifact = fx.service.merge_upload("f1", "alice").await.unwrap();
        assert_eq!(artifact.checksum, compute_hash(b"zero"));
    }

    #[tokio::test]
    async fn test_conflicting_rewrite_is_rejected() {
        let fx = fixture();
        fx.service.receive_chunk(chunk("f1", 0, 2, b"first"), b"first").await.unwrap();

        let receipt = fx.service.receive_chunk(chunk("f1", 0, 2, b"second"), b"second").await.unwrap();

        assert_eq!(receipt.outcome, ChunkOutcome::ChecksumConflict);
        let stored = fx.store.get(&BlobKey::chunk("f1", 0).unwrap()).await.unwrap();
        assert_eq!(stored, b"first");
    }

    #[tokio::test]
    async fn test_overwrite_policy_replaces_chunk() {
        let fx = fixture_with(UploadSettings {
            chunk_policy: ChunkPolicy { overwrite_on_mismatch: true },
            ..UploadSettings::default()
        });
        fx.service.receive_chunk(chunk("f1", 0, 2, b"first"), b"first").await.unwrap();

        let receipt = fx.service.receive_chunk(chunk("f1", 0, 2, b"second"), b"second").await.unwrap();

        assert_eq!(receipt.outcome, ChunkOutcome::Accepted);
        let stored = fx.store.get(&BlobKey::chunk("f1", 0).unwrap()).await.unwrap();
        assert_eq!(stored, b"second");
    }

    #[tokio::test]
    async fn test_overwrite_after_completion_keeps_earlier_chunk() {
        let fx = fixture_with(UploadSettings {
            chunk_policy: ChunkPolicy { overwrite_on_mismatch: true },
            ..UploadSettings::default()
        });
        fx.service.receive_chunk(chunk("f1", 0, 2, b"AAAA"), b"AAAA").await.unwrap();
        fx.service.receive_chunk(chunk("f1", 1, 2, b"CCCC"), b"CCCC").await.unwrap();

        let receipt = fx.service.receive_chunk(chunk("f1", 0, 2, b"BBBB"), b"BBBB").await.unwrap();

        assert_eq!(receipt.outcome, ChunkOutcome::ChecksumConflict);
        let stored = fx.store.get(&BlobKey::chunk("f1", 0).unwrap()).await.unwrap();
        assert_eq!(stored, b"AAAA");
        let artifact = fx.service.merge_upload("f1", "alice").await.unwrap();
        assert_eq!(artifact.checksum, compute_hash(b"AAAACCCC"));
    }

    /// Memory store that parks writes of one payload until released
    struct GatedStore {
        inner: MemoryBlobStore,
        payload: &'static [u8],
        entered: Notify,
        release: Notify,
    }

    impl GatedStore {
        fn new(payload: &'static [u8]) -> Self {
            Self {
                inner: MemoryBlobStore::new(),
                payload,
                entered: Notify::new(),
                release: Notify::new(),
            }
        }
    }

    #[async_trait::async_trait]
    impl BlobStore for GatedStore {
        async fn put(&self, key: &BlobKey, data: &[u8]) -> Result<(), BlobError> {
            if data == self.payload {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.put(key, data).await
        }
        async fn append(&self, key: &BlobKey, data: &[u8]) -> Result<(), BlobError> {
            self.inner.append(key, data).await
        }
        async fn get(&self, key: &BlobKey) -> Result<Vec<u8>, BlobError> {
            self.inner.get(key).await
        }
        async fn delete(&self, key: &BlobKey) -> Result<(), BlobError> {
            self.inner.delete(key).await
        }
        async fn delete_prefix(&self, prefix: &str) -> Result<usize, BlobError> {
            self.inner.delete_prefix(prefix).await
        }
        async fn publish(&self, temp: &BlobKey, final_key: &BlobKey) -> Result<(), BlobError> {
            self.inner.publish(temp, final_key).await
        }
    }

    #[tokio::test]
    async fn test_overwrite_in_flight_holds_off_completion() {
        let registry = Arc::new(MemoryRegistry::new());
        let store = Arc::new(GatedStore::new(b"BBBB"));
        let service = UploadService::new(
            registry.clone(),
            store.clone(),
            UploadSettings {
                chunk_policy: ChunkPolicy { overwrite_on_mismatch: true },
                ..UploadSettings::default()
            },
        );
        service.receive_chunk(chunk("f1", 0, 2, b"AAAA"), b"AAAA").await.unwrap();

        let overwrite = {
            let service = service.clone();
            tokio::spawn(async move { service.receive_chunk(chunk("f1", 0, 2, b"BBBB"), b"BBBB").await })
        };
        store.entered.notified().await;

        let completion = {
            let service = service.clone();
            tokio::spawn(async move { service.receive_chunk(chunk("f1", 1, 2, b"CCCC"), b"CCCC").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!completion.is_finished());

        store.release.notify_one();
        let replaced = overwrite.await.unwrap().unwrap();
        let completed = completion.await.unwrap().unwrap();

        assert_eq!(replaced.outcome, ChunkOutcome::Accepted);
        assert_eq!(completed.outcome, ChunkOutcome::Accepted);
        assert!(completed.complete);

        // Blob and registry agree on the replacement
        let stored = store.inner.get(&BlobKey::chunk("f1", 0).unwrap()).await.unwrap();
        assert_eq!(stored, b"BBBB");
        let session = registry.get("f1").await.unwrap().unwrap();
        assert_eq!(session.received[&0].checksum, compute_hash(b"BBBB"));

        let artifact = service.merge_upload("f1", "alice").await.unwrap();
        assert_eq!(artifact.checksum, compute_hash(b"BBBBCCCC"));
    }

    #[tokio::test]
    async fn test_closed_session_rejects_chunks() {
        let fx = fixture();
        fx.service.receive_chunk(chunk("f1", 0, 1, b"only"), b"only").await.unwrap();
        fx.service.merge_upload("f1", "alice").await.unwrap();

        let receipt = fx.service.receive_chunk(chunk("f1", 0, 1, b"only"), b"only").await.unwrap();

        assert_eq!(receipt.outcome, ChunkOutcome::SessionClosed);
        assert_eq!(receipt.status, SessionStatus::Merged);
        assert_eq!(fx.store.keys().await, vec!["files/alice/documents/report.pdf".to_string()]);
    }

    #[tokio::test]
    async fn test_foreign_owner() {
        let fx = fixture();
        fx.service.receive_chunk(chunk("f1", 0, 1, b"mine"), b"mine").await.unwrap();

        let mut upload = chunk("f1", 0, 1, b"mine");
        upload.owner_id = "bob".to_string();
        assert!(matches!(
            fx.service.receive_chunk(upload, b"mine").await,
            Err(UploadError::OwnerMismatch(_))
        ));
        assert!(matches!(
            fx.service.get_upload_status("f1", "bob").await,
            Err(UploadError::SessionNotFound(_))
        ));
        assert!(matches!(
            fx.service.merge_upload("f1", "bob").await,
            Err(UploadError::SessionNotFound(_))
        ));
        assert!(matches!(
            fx.service.abort_upload("f1", "bob").await,
            Err(UploadError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_request_validation() {
        let fx = fixture_with(UploadSettings {
            max_chunk_size: 8,
            max_total_chunks: 10,
            ..UploadSettings::default()
        });

        let cases = vec![
            (chunk("../escape", 0, 2, b"x"), b"x".to_vec()),
            (chunk("f1", 2, 2, b"x"), b"x".to_vec()),
            (chunk("f1", 0, 0, b"x"), b"x".to_vec()),
            (chunk("f1", 0, 11, b"x"), b"x".to_vec()),
            (chunk("f1", 0, 2, b"too large!"), b"too large!".to_vec()),
            (
                ChunkUpload {
                    checksum: "abc".to_string(),
                    ..chunk("f1", 0, 2, b"x")
                },
                b"x".to_vec(),
            ),
            (
                ChunkUpload {
                    filename: "../..".to_string(),
                    ..chunk("f1", 0, 2, b"x")
                },
                b"x".to_vec(),
            ),
            (
                ChunkUpload {
                    owner_id: " ".to_string(),
                    ..chunk("f1", 0, 2, b"x")
                },
                b"x".to_vec(),
            ),
        ];

        for (upload, data) in cases {
            let result = fx.service.receive_chunk(upload.clone(), &data).await;
            assert!(
                matches!(result, Err(UploadError::Validation(_))),
                "expected validation error for {:?}, got {:?}",
                upload,
                result
            );
        }
        assert_eq!(fx.registry.session_count().await, 0);

        // A later chunk may not change the chunk count
        fx.service.receive_chunk(chunk("f1", 0, 2, b"x"), b"x").await.unwrap();
        assert!(matches!(
            fx.service.receive_chunk(chunk("f1", 1, 3, b"y"), b"y").await,
            Err(UploadError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_names_are_sanitized_and_digests_normalized() {
        let fx = fixture();
        let mut upload = chunk("f1", 0, 1, b"data");
        upload.filename = "My Holiday Video.mp4".to_string();
        upload.category = None;
        upload.checksum = compute_hash(b"data").to_uppercase();
        upload.file_checksum = Some(compute_hash(b"data").to_uppercase());

        let receipt = fx.service.receive_chunk(upload, b"data").await.unwrap();
        assert_eq!(receipt.outcome, ChunkOutcome::Accepted);

        let session = fx.registry.get("f1").await.unwrap().unwrap();
        assert_eq!(session.expected_filename, "My_Holiday_Video.mp4");
        assert_eq!(session.category, DEFAULT_CATEGORY);
        assert_eq!(session.received[&0].checksum, compute_hash(b"data"));

        let artifact = fx.service.merge_upload("f1", "alice").await.unwrap();
        assert_eq!(artifact.key, "files/alice/general/My_Holiday_Video.mp4");
    }

    #[tokio::test]
    async fn test_register_then_upload() {
        let fx = fixture();
        let request = NewSession {
            file_id: "f1".to_string(),
            owner_id: "alice".to_string(),
            total_chunks: 2,
            filename: "a.txt".to_string(),
            category: String::new(),
            expected_checksum: Some(compute_hash(b"ab")),
        };

        let status = fx.service.register_upload(request.clone()).await.unwrap();
        assert_eq!(status.status, SessionStatus::Initiated);
        assert_eq!(status.missing_indices, vec![0, 1]);

        // Registering again is harmless, a different owner is not
        fx.service.register_upload(request.clone()).await.unwrap();
        let foreign = NewSession {
            owner_id: "bob".to_string(),
            ..request
        };
        assert!(matches!(
            fx.service.register_upload(foreign).await,
            Err(UploadError::OwnerMismatch(_))
        ));

        fx.service.receive_chunk(chunk("f1", 0, 2, b"a"), b"a").await.unwrap();
        fx.service.receive_chunk(chunk("f1", 1, 2, b"b"), b"b").await.unwrap();
        let artifact = fx.service.merge_upload("f1", "alice").await.unwrap();
        assert_eq!(artifact.checksum, compute_hash(b"ab"));
        assert_eq!(artifact.key, "files/alice/general/a.txt");
    }

    #[tokio::test]
    async fn test_final_checksum_mismatch_fails_session() {
        let fx = fixture();
        let mut first = chunk("f1", 0, 2, b"a");
        first.file_checksum = Some(compute_hash(b"ba"));
        fx.service.receive_chunk(first, b"a").await.unwrap();
        fx.service.receive_chunk(chunk("f1", 1, 2, b"b"), b"b").await.unwrap();

        assert!(matches!(
            fx.service.merge_upload("f1", "alice").await,
            Err(UploadError::FinalChecksumMismatch { .. })
        ));
        let status = fx.service.get_upload_status("f1", "alice").await.unwrap();
        assert_eq!(status.status, SessionStatus::Failed);

        // Failed sessions are reclaimed on the next sweep
        assert_eq!(fx.service.cleanup_stale(TTL).await.unwrap(), 1);
        assert!(fx.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_idle_session_expires() {
        let fx = fixture();
        fx.service.receive_chunk(chunk("f1", 0, 3, b"zero"), b"zero").await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(TTL.as_secs() as i64 + 1);
        let report = fx.service.sweeper().sweep(later, TTL).await.unwrap();

        assert_eq!(report.reclaimed, 1);
        assert!(fx.store.is_empty().await);
        let status = fx.service.get_upload_status("f1", "alice").await.unwrap();
        assert_eq!(status.status, SessionStatus::Expired);

        let receipt = fx.service.receive_chunk(chunk("f1", 1, 3, b"one"), b"one").await.unwrap();
        assert_eq!(receipt.outcome, ChunkOutcome::SessionClosed);
    }

    #[tokio::test]
    async fn test_idle_session_removed_under_remove_policy() {
        let fx = fixture_with(UploadSettings {
            retention: RetentionPolicy::Remove,
            ..UploadSettings::default()
        });
        fx.service.receive_chunk(chunk("f1", 0, 3, b"zero"), b"zero").await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(TTL.as_secs() as i64 + 1);
        fx.service.sweeper().sweep(later, TTL).await.unwrap();

        assert!(matches!(
            fx.service.get_upload_status("f1", "alice").await,
            Err(UploadError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_abort_then_cleanup() {
        let fx = fixture();
        fx.service.receive_chunk(chunk("f1", 0, 2, b"zero"), b"zero").await.unwrap();

        let status = fx.service.abort_upload("f1", "alice").await.unwrap();
        assert_eq!(status.status, SessionStatus::Failed);
        assert!(matches!(
            fx.service.abort_upload("f1", "alice").await,
            Err(UploadError::SessionStateConflict { .. })
        ));
        assert!(matches!(
            fx.service.merge_upload("f1", "alice").await,
            Err(UploadError::SessionStateConflict { .. })
        ));

        assert_eq!(fx.service.cleanup_stale(TTL).await.unwrap(), 1);
        assert!(fx.store.is_empty().await);
        let status = fx.service.get_upload_status("f1", "alice").await.unwrap();
        assert_eq!(status.status, SessionStatus::Expired);
    }

    #[tokio::test]
    async fn test_cleanup_never_touches_merged() {
        let fx = fixture();
        fx.service.receive_chunk(chunk("f1", 0, 1, b"done"), b"done").await.unwrap();
        fx.service.merge_upload("f1", "alice").await.unwrap();

        let later = Utc::now() + chrono::Duration::days(30);
        let report = fx.service.sweeper().sweep(later, TTL).await.unwrap();

        assert_eq!(report.reclaimed, 0);
        let status = fx.service.get_upload_status("f1", "alice").await.unwrap();
        assert_eq!(status.status, SessionStatus::Merged);
        assert_eq!(fx.store.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_distinct_chunks() {
        let fx = fixture();
        let data = sample_file(32 * 16);

        let handles: Vec<_> = data
            .chunks(16)
            .enumerate()
            .map(|(i, part)| {
                let service = fx.service.clone();
                let part = part.to_vec();
                tokio::spawn(async move {
                    service
                        .receive_chunk(chunk("f1", i as u32, 32, &part), &part)
                        .await
                        .unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().outcome, ChunkOutcome::Accepted);
        }

        let artifact = fx.service.merge_upload("f1", "alice").await.unwrap();
        assert_eq!(artifact.checksum, compute_hash(&data));
    }

    #[tokio::test]
    async fn test_concurrent_writes_to_one_index() {
        let fx = fixture();

        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let service = fx.service.clone();
                tokio::spawn(async move {
                    let part = vec![i; 64];
                    service.receive_chunk(chunk("f1", 0, 2, &part), &part).await.unwrap()
                })
            })
            .collect();

        let mut accepted = 0;
        for handle in handles {
            match handle.await.unwrap().outcome {
                ChunkOutcome::Accepted => accepted += 1,
                ChunkOutcome::ChecksumConflict => {}
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(accepted, 1);

        // The stored blob is the one the registry recorded
        let session = fx.registry.get("f1").await.unwrap().unwrap();
        let stored = fx.store.get(&BlobKey::chunk("f1", 0).unwrap()).await.unwrap();
        assert_eq!(compute_hash(&stored), session.received[&0].checksum);
    }

    #[tokio::test]
    async fn test_concurrent_merges_yield_one_winner() {
        let fx = fixture();
        fx.service.receive_chunk(chunk("f1", 0, 1, b"solo"), b"solo").await.unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let service = fx.service.clone();
                tokio::spawn(async move { service.merge_upload("f1", "alice").await })
            })
            .collect();

        let mut merged = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => merged += 1,
                Err(UploadError::SessionStateConflict { .. }) => {}
                Err(other) => panic!("unexpected error {:?}", other),
            }
        }
        assert_eq!(merged, 1);
    }

    /// Store whose writes always fail
    struct FullDisk;

    #[async_trait::async_trait]
    impl BlobStore for FullDisk {
        async fn put(&self, _key: &BlobKey, _data: &[u8]) -> Result<(), BlobError> {
            Err(BlobError::Io(std::io::Error::new(std::io::ErrorKind::Other, "no space left")))
        }
        async fn append(&self, _key: &BlobKey, _data: &[u8]) -> Result<(), BlobError> {
            Err(BlobError::Io(std::io::Error::new(std::io::ErrorKind::Other, "no space left")))
        }
        async fn get(&self, key: &BlobKey) -> Result<Vec<u8>, BlobError> {
            Err(BlobError::NotFound(key.to_string()))
        }
        async fn delete(&self, _key: &BlobKey) -> Result<(), BlobError> {
            Ok(())
        }
        async fn delete_prefix(&self, _prefix: &str) -> Result<usize, BlobError> {
            Ok(0)
        }
        async fn publish(&self, temp: &BlobKey, _final_key: &BlobKey) -> Result<(), BlobError> {
            Err(BlobError::NotFound(temp.to_string()))
        }
    }

    #[tokio::test]
    async fn test_storage_failure_is_reported() {
        let registry = Arc::new(MemoryRegistry::new());
        let service = UploadService::new(registry.clone(), Arc::new(FullDisk), UploadSettings::default());

        let result = service.receive_chunk(chunk("f1", 0, 2, b"zero"), b"zero").await;

        let err = result.unwrap_err();
        assert!(matches!(err, UploadError::Storage(_)));
        assert_eq!(err.status_code(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        let session = registry.get("f1").await.unwrap().unwrap();
        assert!(session.received.is_empty());
        assert_eq!(session.status, SessionStatus::Initiated);
    }

    #[tokio::test]
    async fn test_local_store_and_sqlite_registry() {
        let temp_dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}", temp_dir.path().join("stitch.db").display());
        let pool = crate::db::create_pool(&url).await.unwrap();
        let store = Arc::new(LocalBlobStore::new(temp_dir.path().join("blobs")).unwrap());
        let service = UploadService::new(
            Arc::new(SqliteRegistry::new(pool)),
            store.clone(),
            UploadSettings::default(),
        );
        let data = sample_file(300);

        for (i, part) in data.chunks(100).enumerate() {
            service.receive_chunk(chunk("f1", i as u32, 3, part), part).await.unwrap();
        }
        let artifact = service.merge_upload("f1", "alice").await.unwrap();

        let path = store.root().join("files/alice/documents/report.pdf");
        assert_eq!(std::fs::read(path).unwrap(), data);
        assert_eq!(artifact.checksum, compute_hash(&data));
        assert!(!store.root().join("chunks/f1").exists());
    }
}
