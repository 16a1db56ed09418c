//! Blob Store
//!
//! Key-addressed byte storage for chunk data and finalized files.
//! Supports local filesystem storage and an in-memory backend.

use std::collections::BTreeMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::checksum::compute_hash;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Invalid blob key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Keys
// ============================================================================

/// A validated, `/`-separated relative key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobKey(String);

impl BlobKey {
    pub fn new(key: impl Into<String>) -> Result<Self, BlobError> {
        let key = key.into();
        let valid = !key.is_empty()
            && !key.starts_with('/')
            && !key.contains('\\')
            && key
                .split('/')
                .all(|segment| !segment.is_empty() && segment != "." && segment != "..");

        if valid {
            Ok(Self(key))
        } else {
            Err(BlobError::InvalidKey(key))
        }
    }

    /// Storage location of chunk `index` of `file_id`
    pub fn chunk(file_id: &str, index: u32) -> Result<Self, BlobError> {
        Self::new(format!("{}{:08}.chunk", Self::chunk_prefix(file_id), index))
    }

    /// Directory prefix holding every chunk of `file_id`
    pub fn chunk_prefix(file_id: &str) -> String {
        format!("chunks/{}/", file_id)
    }

    /// Fresh staging location for one merge attempt
    pub fn staging(file_id: &str) -> Result<Self, BlobError> {
        Self::new(format!("tmp/{}.{}.part", file_id, Uuid::new_v4().simple()))
    }

    /// Published location of a merged file, namespaced by owner
    pub fn artifact(owner_id: &str, category: &str, filename: &str) -> Result<Self, BlobError> {
        Self::new(format!(
            "files/{}/{}/{}",
            owner_segment(owner_id),
            category,
            filename
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reduce a client-supplied name to a safe single key segment.
///
/// Path separators and whitespace become `_`, anything outside
/// `[A-Za-z0-9._-]` is dropped and leading/trailing `.`/`_` are stripped.
/// Returns `None` when nothing usable is left.
pub fn sanitize_name(name: &str) -> Option<String> {
    let joined = name
        .replace(['/', '\\'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_");

    let cleaned: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();

    let trimmed = cleaned.trim_matches(|c| c == '.' || c == '_');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Key segment for an owner.
///
/// Owners that are already safe segments map to themselves. Anything else
/// keeps its sanitized form plus a digest suffix, so distinct owners never
/// share a segment.
pub fn owner_segment(owner_id: &str) -> String {
    match sanitize_name(owner_id) {
        Some(clean) if clean == owner_id => clean,
        clean => {
            let digest = compute_hash(owner_id.as_bytes());
            format!(
                "{}-{}",
                clean.as_deref().unwrap_or("owner"),
                &digest[..16]
            )
        }
    }
}

// ============================================================================
// Blob Store Trait
// ============================================================================

/// Trait for blob storage backends
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under `key`, atomically replacing any previous value
    async fn put(&self, key: &BlobKey, data: &[u8]) -> Result<(), BlobError>;

    /// Append `data` to `key`, creating it if absent
    async fn append(&self, key: &BlobKey, data: &[u8]) -> Result<(), BlobError>;

    async fn get(&self, key: &BlobKey) -> Result<Vec<u8>, BlobError>;

    /// Delete `key`; a missing key is not an error
    async fn delete(&self, key: &BlobKey) -> Result<(), BlobError>;

    /// Delete every blob under a `/`-terminated prefix, returning the count
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, BlobError>;

    /// Move `temp` to `final_key`. The destination is either absent or
    /// complete, never partially written.
    async fn publish(&self, temp: &BlobKey, final_key: &BlobKey) -> Result<(), BlobError>;
}

fn check_prefix(prefix: &str) -> Result<&str, BlobError> {
    match prefix.strip_suffix('/') {
        Some(dir) => BlobKey::new(dir).map(|_| dir),
        None => Err(BlobError::InvalidKey(prefix.to_string())),
    }
}

fn not_found(key: &BlobKey) -> impl FnOnce(std::io::Error) -> BlobError + '_ {
    move |e| {
        if e.kind() == ErrorKind::NotFound {
            BlobError::NotFound(key.to_string())
        } else {
            BlobError::Io(e)
        }
    }
}

// ============================================================================
// Local Filesystem Storage
// ============================================================================

/// Local filesystem blob storage rooted at a directory
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, BlobError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of a key
    pub fn path_of(&self, key: &BlobKey) -> PathBuf {
        key.as_str()
            .split('/')
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }

    async fn ensure_parent(path: &Path) -> Result<(), BlobError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, key: &BlobKey, data: &[u8]) -> Result<(), BlobError> {
        let path = self.path_of(key);
        Self::ensure_parent(&path).await?;

        // Write to temporary file first, then rename for atomicity
        let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
        temp_name.push(format!(".{}.tmp", Uuid::new_v4().simple()));
        let temp_path = path.with_file_name(temp_name);

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        tracing::trace!(key = %key, size = data.len(), "Stored blob");
        Ok(())
    }

    async fn append(&self, key: &BlobKey, data: &[u8]) -> Result<(), BlobError> {
        let path = self.path_of(key);
        Self::ensure_parent(&path).await?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn get(&self, key: &BlobKey) -> Result<Vec<u8>, BlobError> {
        fs::read(self.path_of(key)).await.map_err(not_found(key))
    }

    async fn delete(&self, key: &BlobKey) -> Result<(), BlobError> {
        match fs::remove_file(self.path_of(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, BlobError> {
        let dir = check_prefix(prefix)?;
        let dir_path = dir
            .split('/')
            .fold(self.root.clone(), |path, segment| path.join(segment));

        let mut entries = match fs::read_dir(&dir_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                count += 1;
            }
        }

        fs::remove_dir_all(&dir_path).await?;
        Ok(count)
    }

    async fn publish(&self, temp: &BlobKey, final_key: &BlobKey) -> Result<(), BlobError> {
        let source = self.path_of(temp);
        let dest = self.path_of(final_key);

        // Flush appended data before it becomes visible
        fs::File::open(&source)
            .await
            .map_err(not_found(temp))?
            .sync_all()
            .await?;

        Self::ensure_parent(&dest).await?;
        fs::rename(&source, &dest).await.map_err(not_found(temp))?;

        tracing::debug!(from = %temp, to = %final_key, "Published blob");
        Ok(())
    }
}

// ============================================================================
// In-Memory Storage
// ============================================================================

/// In-memory blob storage
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored keys in order
    pub async fn keys(&self) -> Vec<String> {
        self.blobs.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &BlobKey, data: &[u8]) -> Result<(), BlobError> {
        self.blobs
            .write()
            .await
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn append(&self, key: &BlobKey, data: &[u8]) -> Result<(), BlobError> {
        self.blobs
            .write()
            .await
            .entry(key.to_string())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    async fn get(&self, key: &BlobKey) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .read()
            .await
            .get(key.as_str())
            .cloned()
            .ok_or_else(|| BlobError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &BlobKey) -> Result<(), BlobError> {
        self.blobs.write().await.remove(key.as_str());
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, BlobError> {
        check_prefix(prefix)?;
        let mut blobs = self.blobs.write().await;
        let before = blobs.len();
        blobs.retain(|key, _| !key.starts_with(prefix));
        Ok(before - blobs.len())
    }

    async fn publish(&self, temp: &BlobKey, final_key: &BlobKey) -> Result<(), BlobError> {
        let mut blobs = self.blobs.write().await;
        let data = blobs
            .remove(temp.as_str())
            .ok_or_else(|| BlobError::NotFound(temp.to_string()))?;
        blobs.insert(final_key.to_string(), data);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
