//! Chunked upload module
//!
//! Resumable uploads split into independently verified chunks, merged into
//! a final file once every chunk has arrived.

pub mod blob_store;
pub mod checksum;
pub mod locks;
pub mod merge;
pub mod registry;
pub mod service;
pub mod sqlite_registry;
pub mod sweeper;
pub mod types;

pub use blob_store::{BlobError, BlobKey, BlobStore, LocalBlobStore, MemoryBlobStore};
pub use checksum::{compute_hash, verify_hash, StreamingDigest};
pub use locks::SessionLocks;
pub use merge::MergeEngine;
pub use registry::{MemoryRegistry, SessionRegistry};
pub use service::{ChunkUpload, UploadService, UploadSettings};
pub use sqlite_registry::SqliteRegistry;
pub use sweeper::{RetentionPolicy, SweepReport, Sweeper};
pub use types::*;
