use std::path::PathBuf;

use blob_store::BlobRef;
use common::{
    FileId,
    JobId,
    UploadId,
};
use compression::CompressionAlgo;
use serde::{
    Deserialize,
    Serialize,
};

/// Canonical record of a stored artifact. Immutable once written except for
/// `expires_at`, which admins may extend.
#[derive(Clone, Debug, PartialEq)]
pub struct FileDescriptor {
    pub id: FileId,
    /// Original client-supplied name, preserved verbatim (may be non-ASCII).
    pub filename: String,
    pub mime_type: String,
    pub original_size: u64,
    pub stored_size: u64,
    pub compression: CompressionAlgo,
    pub blob: BlobRef,
    pub created_at: i64,
    pub expires_at: i64,
    pub delete_token: String,
    pub download_token: Option<String>,
}

impl FileDescriptor {
    pub fn requires_download_token(&self) -> bool {
        self.download_token.is_some()
    }
}

/// Token-free view of a descriptor, safe to hand to any caller.
#[derive(Clone, Debug, Serialize)]
pub struct FileMetadata {
    pub id: FileId,
    pub filename: String,
    pub mime_type: String,
    pub original_size: u64,
    pub stored_size: u64,
    #[serde(serialize_with = "serialize_algo")]
    pub compression: CompressionAlgo,
    pub storage_kind: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub has_download_token: bool,
}

fn serialize_algo<S: serde::Serializer>(
    algo: &CompressionAlgo,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(algo.as_str())
}

impl From<&FileDescriptor> for FileMetadata {
    fn from(d: &FileDescriptor) -> Self {
        Self {
            id: d.id,
            filename: d.filename.clone(),
            mime_type: d.mime_type.clone(),
            original_size: d.original_size,
            stored_size: d.stored_size,
            compression: d.compression,
            storage_kind: d.blob.kind().to_string(),
            created_at: d.created_at,
            expires_at: d.expires_at,
            has_download_token: d.download_token.is_some(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => anyhow::bail!("unknown job status {s:?}"),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// pending -> processing -> {completed, failed}; no other edges.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

/// What a completed job hands back to the polling client.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JobResult {
    pub file_id: FileId,
    pub filename: String,
    pub size: u64,
    pub delete_token: String,
}

/// Record of one assembly pipeline run. `file_id` is allocated before the
/// descriptor exists, so it stays nullable rather than a foreign key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub job_id: JobId,
    pub upload_id: UploadId,
    pub file_id: Option<FileId>,
    pub status: JobStatus,
    pub progress: u8,
    pub error_message: Option<String>,
    pub result: Option<JobResult>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

/// What `sweep_expired` removed, with the on-disk locations the caller still
/// has to clean up.
#[derive(Debug)]
pub struct SweepOutcome {
    pub expired_files: Vec<(FileId, Option<PathBuf>)>,
    pub removed_logs: usize,
    pub removed_jobs: usize,
    pub expired_sessions: Vec<(UploadId, PathBuf)>,
}

impl SweepOutcome {
    pub fn removed_files(&self) -> usize {
        self.expired_files.len()
    }
}

#[derive(Clone, Copy, Debug)]
pub enum AccessKind {
    Download,
    Preview,
    Stream,
    Delete,
}

impl AccessKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessKind::Download => "download",
            AccessKind::Preview => "preview",
            AccessKind::Stream => "stream",
            AccessKind::Delete => "delete",
        }
    }
}
