//! The upload, storage and retrieval engine: the chunked-upload state
//! machine, the asynchronous assembly pipeline, range-respecting retrieval
//! with decompression, ZIP browsing and the expiry sweeper. Everything here
//! is wired over the blob store, the metadata store and the ephemeral cache;
//! HTTP stays in the server crate.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use blob_store::BlobStore;
use common::UploadId;
use ephemeral_cache::EphemeralCache;
use metadata::MetadataStore;
use parking_lot::Mutex;
use tokio_util::task::TaskTracker;

mod coordinator;
mod pipeline;
mod retrieval;
mod sweeper;
mod types;
mod zip;

pub use crate::{
    coordinator::ChunkReceipt,
    retrieval::{
        is_previewable,
        BodyReader,
    },
    sweeper::ExpirySweeper,
    types::{
        IncompleteUpload,
        ProcessingStatusRecord,
        SessionStatus,
        StatusKind,
        UploadSession,
    },
    zip::ZipEntryInfo,
};

/// Size and lifetime caps, from configuration. Immutable once constructed.
#[derive(Clone, Debug)]
pub struct EngineLimits {
    /// Byte cap on a single artifact.
    pub max_file_size: u64,
    /// Maximum chunk size a session may declare.
    pub max_chunk_size: u64,
    /// Upper bound on a session's chunk count.
    pub max_chunks_per_file: u32,
    /// Session idle expiry.
    pub chunk_timeout: Duration,
    /// Lifetime of a stored artifact.
    pub file_expiry: Duration,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_file_size: 10 << 30,
            max_chunk_size: 50 << 20,
            max_chunks_per_file: 200,
            chunk_timeout: Duration::from_secs(30 * 60),
            file_expiry: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Clone)]
pub struct FileEngine {
    pub(crate) metadata: Arc<MetadataStore>,
    pub(crate) cache: EphemeralCache,
    pub(crate) blobs: BlobStore,
    pub(crate) scratch_root: PathBuf,
    pub(crate) limits: EngineLimits,
    /// Per-session mutation locks. Chunk payload writes go to disjoint files
    /// and stay outside these; only the session record itself is serialized.
    session_locks: Arc<Mutex<HashMap<UploadId, Arc<tokio::sync::Mutex<()>>>>>,
    /// Pipeline tasks, so shutdown can drain them.
    pub(crate) pipelines: TaskTracker,
}

impl FileEngine {
    pub fn new(
        metadata: Arc<MetadataStore>,
        cache: EphemeralCache,
        blobs: BlobStore,
        scratch_root: PathBuf,
        limits: EngineLimits,
    ) -> Self {
        Self {
            metadata,
            cache,
            blobs,
            scratch_root,
            limits,
            session_locks: Arc::new(Mutex::new(HashMap::new())),
            pipelines: TaskTracker::new(),
        }
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn cache(&self) -> &EphemeralCache {
        &self.cache
    }

    pub(crate) fn session_lock(&self, upload_id: UploadId) -> Arc<tokio::sync::Mutex<()>> {
        self.session_locks
            .lock()
            .entry(upload_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub(crate) fn drop_session_lock(&self, upload_id: UploadId) {
        self.session_locks.lock().remove(&upload_id);
    }

    /// Stop accepting new pipeline work and wait for in-flight jobs, up to
    /// `grace`. Jobs still running after that are abandoned; their rows stay
    /// `processing` until the retention sweep removes them.
    pub async fn shutdown(&self, grace: Duration) {
        self.pipelines.close();
        if tokio::time::timeout(grace, self.pipelines.wait())
            .await
            .is_err()
        {
            tracing::warn!("shutdown grace period expired with pipelines still running");
        }
    }
}
