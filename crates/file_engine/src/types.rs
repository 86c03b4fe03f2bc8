use bitvec::vec::BitVec;
use common::{
    FileId,
    JobId,
    UploadId,
};
use serde::{
    Deserialize,
    Serialize,
};

/// In-flight chunked upload. The cache record under `chunk_upload:<id>` is
/// the authoritative copy; a skeleton row in SQLite only maps the id to its
/// scratch directory for the sweeper.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadSession {
    pub upload_id: UploadId,
    pub filename: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    /// One bit per chunk. Bits only ever flip false -> true.
    pub received_mask: BitVec,
    pub created_at: i64,
    pub last_activity: i64,
    pub expires_at: i64,
    pub download_token: Option<String>,
    /// Client-declared hash of the artifact. Stored; assembly does not verify
    /// it.
    pub file_hash: Option<String>,
}

impl UploadSession {
    pub fn received_count(&self) -> usize {
        self.received_mask.count_ones()
    }

    pub fn is_complete(&self) -> bool {
        self.received_count() == self.total_chunks as usize
    }

    pub fn first_missing(&self) -> Option<u32> {
        self.received_mask.first_zero().map(|i| i as u32)
    }
}

/// Counts and timestamps reported by the session status endpoint.
#[derive(Debug, Serialize)]
pub struct SessionStatus {
    pub upload_id: UploadId,
    pub filename: String,
    pub received_chunks: usize,
    pub total_chunks: u32,
    pub complete: bool,
    pub created_at: i64,
    pub last_activity: i64,
    pub expires_at: i64,
}

impl From<&UploadSession> for SessionStatus {
    fn from(session: &UploadSession) -> Self {
        Self {
            upload_id: session.upload_id,
            filename: session.filename.clone(),
            received_chunks: session.received_count(),
            total_chunks: session.total_chunks,
            complete: session.is_complete(),
            created_at: session.created_at,
            last_activity: session.last_activity,
            expires_at: session.expires_at,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Processing,
    Completed,
    Failed,
}

/// Fast-polled indicator keyed by file id, cache only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessingStatusRecord {
    pub status: StatusKind,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub job_id: JobId,
}

/// Typed payload for the `Incomplete` failure so the completion handler can
/// surface the first missing index as a structured field.
#[derive(thiserror::Error, Debug)]
#[error("upload is missing chunk {missing_chunk}")]
pub struct IncompleteUpload {
    pub missing_chunk: u32,
}

pub(crate) fn session_key(upload_id: UploadId) -> String {
    format!("{}{upload_id}", ephemeral_cache::CHUNK_UPLOAD_PREFIX)
}

pub(crate) fn job_key(job_id: JobId) -> String {
    format!("{}{job_id}", ephemeral_cache::PROCESSING_JOB_PREFIX)
}

pub(crate) fn status_key(file_id: FileId) -> String {
    format!("{}{file_id}", ephemeral_cache::PROCESSING_PREFIX)
}

pub(crate) fn file_key(file_id: FileId) -> String {
    format!("{}{file_id}", ephemeral_cache::FILE_PREFIX)
}

pub(crate) fn content_key(file_id: FileId) -> String {
    format!("{}{file_id}", ephemeral_cache::CONTENT_PREFIX)
}
