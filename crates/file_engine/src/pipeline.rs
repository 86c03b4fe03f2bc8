//! The background assembly pipeline. One task per job: stitch the chunks
//! into a single artifact, compress when the policy says so, persist through
//! the blob and metadata stores, publish completion. Failures never reach a
//! client directly; they land on the job row and its status record.

use std::{
    path::PathBuf,
    time::Duration,
};

use anyhow::Context as _;
use bytes::Bytes;
use common::{
    secrets::generate_delete_token,
    time::unix_timestamp,
    FileId,
};
use compression::{
    compress,
    select_algo,
    wrap_writer,
    CompressionAlgo,
};
use errors::report_error;
use metadata::{
    FileDescriptor,
    FileMetadata,
    JobResult,
    JobStatus,
    ProcessingJob,
};
use tokio::io::{
    AsyncWriteExt,
    BufReader,
};

use crate::{
    types::{
        content_key,
        file_key,
        job_key,
        status_key,
        ProcessingStatusRecord,
        StatusKind,
        UploadSession,
    },
    FileEngine,
};

/// Artifacts at or below this size are compressed in memory and offered to
/// the blob store as a buffer; larger ones stream through the codec on disk
/// and always land external.
const MAX_IN_MEMORY_BYTES: u64 = 100 << 20;

const JOB_MIRROR_TTL: Duration = Duration::from_secs(3600);
const METADATA_MIRROR_TTL: Duration = Duration::from_secs(3600);
const STATUS_COMPLETED_TTL: Duration = Duration::from_secs(60);
const STATUS_FAILED_TTL: Duration = Duration::from_secs(600);

impl FileEngine {
    pub(crate) fn spawn_pipeline(
        &self,
        job: ProcessingJob,
        session: UploadSession,
        file_id: FileId,
    ) {
        let engine = self.clone();
        self.pipelines.spawn(async move {
            run_job(engine, job, session, file_id).await;
        });
    }

    /// Single-shot ingest: compress a whole in-memory artifact and persist
    /// it. The chunked pipeline reuses this for artifacts small enough to
    /// buffer.
    pub async fn store_buffer(
        &self,
        filename: String,
        bytes: Bytes,
        download_token: Option<String>,
    ) -> anyhow::Result<FileDescriptor> {
        let original_size = bytes.len() as u64;
        anyhow::ensure!(
            original_size <= self.limits.max_file_size,
            errors::ErrorMetadata::too_large(
                "FileTooLarge",
                format!(
                    "file of {original_size} bytes exceeds the {} byte limit",
                    self.limits.max_file_size
                ),
            )
        );
        let algo = select_algo(&filename, original_size);
        let compressed = compress(bytes, algo).await?;
        let stored_size = compressed.len() as u64;
        let file_id = FileId::generate();
        let blob = self.blobs.put(file_id, compressed).await?;
        let descriptor = self.build_descriptor(
            file_id,
            filename,
            original_size,
            stored_size,
            algo,
            blob,
            download_token,
        );
        if let Err(e) = self.metadata.save(&descriptor) {
            self.blobs.delete(&descriptor.blob).await?;
            return Err(e);
        }
        self.publish_file(&descriptor)?;
        Ok(descriptor)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_descriptor(
        &self,
        file_id: FileId,
        filename: String,
        original_size: u64,
        stored_size: u64,
        algo: CompressionAlgo,
        blob: blob_store::BlobRef,
        download_token: Option<String>,
    ) -> FileDescriptor {
        let now = unix_timestamp();
        FileDescriptor {
            id: file_id,
            mime_type: common::mime_types::mime_from_filename(&filename),
            filename,
            original_size,
            stored_size,
            compression: algo,
            blob,
            created_at: now,
            expires_at: now + self.limits.file_expiry.as_secs() as i64,
            delete_token: generate_delete_token(),
            download_token,
        }
    }

    /// Make a freshly saved descriptor visible to the cache tier: metadata
    /// mirror plus the expiry-ordered set the cache sweeper drains.
    pub(crate) fn publish_file(&self, descriptor: &FileDescriptor) -> anyhow::Result<()> {
        let mirror = serde_json::to_vec(&FileMetadata::from(descriptor))?;
        self.cache.batch(vec![
            ephemeral_cache::CacheOp::Set {
                key: file_key(descriptor.id),
                value: mirror.into(),
                ttl: Some(METADATA_MIRROR_TTL),
            },
            ephemeral_cache::CacheOp::ZAdd {
                member: descriptor.id.to_string(),
                score: descriptor.expires_at,
            },
        ]);
        Ok(())
    }

    pub(crate) fn mirror_job(&self, job: &ProcessingJob) {
        if let Err(e) = self
            .cache
            .set_json(&job_key(job.job_id), job, Some(JOB_MIRROR_TTL))
        {
            report_error(&mut e.context("mirroring job record"));
        }
    }

    /// Move the job forward. Status edges are validated and progress is
    /// clamped non-decreasing, so every observer sees a monotonic timeline.
    fn advance_job(
        &self,
        job: &mut ProcessingJob,
        status: Option<JobStatus>,
        progress: u8,
    ) -> anyhow::Result<()> {
        if let Some(next) = status {
            anyhow::ensure!(
                job.status.can_transition_to(next),
                "illegal job transition {} -> {}",
                job.status.as_str(),
                next.as_str()
            );
            job.status = next;
            if next.is_terminal() {
                job.completed_at = Some(unix_timestamp());
            }
        }
        job.progress = job.progress.max(progress);
        job.updated_at = unix_timestamp();
        self.metadata.update_job(job)?;
        self.mirror_job(job);
        Ok(())
    }

    fn assembled_path(&self, file_id: FileId) -> PathBuf {
        self.scratch_root.join(format!("{file_id}_assembled"))
    }

    fn compressed_path(&self, file_id: FileId) -> PathBuf {
        self.scratch_root.join(format!("{file_id}_compressed"))
    }
}

async fn run_job(
    engine: FileEngine,
    mut job: ProcessingJob,
    session: UploadSession,
    file_id: FileId,
) {
    let upload_id = session.upload_id;
    match process(&engine, &mut job, &session, file_id).await {
        Ok(descriptor) => {
            let result = JobResult {
                file_id,
                filename: descriptor.filename.clone(),
                size: descriptor.original_size,
                delete_token: descriptor.delete_token.clone(),
            };
            job.result = Some(result);
            if let Err(e) = engine.advance_job(&mut job, Some(JobStatus::Completed), 100) {
                report_error(&mut e.context("recording job completion"));
            }
            // The descriptor row is already visible (publication barrier):
            // only now may pollers learn the job completed.
            let status = ProcessingStatusRecord {
                status: StatusKind::Completed,
                filename: descriptor.filename.clone(),
                error: None,
                job_id: job.job_id,
            };
            if let Err(e) =
                engine
                    .cache
                    .set_json(&status_key(file_id), &status, Some(STATUS_COMPLETED_TTL))
            {
                report_error(&mut e.context("publishing completed status"));
            }
            if let Err(e) = engine.destroy_session(upload_id).await {
                report_error(&mut e.context("removing consumed session"));
            }
            tracing::info!(
                "job {} completed: stored {} as {} ({} -> {} bytes, {})",
                job.job_id,
                descriptor.filename,
                file_id,
                descriptor.original_size,
                descriptor.stored_size,
                descriptor.compression,
            );
        },
        Err(e) => {
            tracing::error!("job {} failed: {e:#}", job.job_id);
            let message = e.to_string();
            let progress = job.progress;
            job.error_message = Some(message.clone());
            if let Err(e) = engine.advance_job(&mut job, Some(JobStatus::Failed), progress) {
                report_error(&mut e.context("recording job failure"));
            }
            let status = ProcessingStatusRecord {
                status: StatusKind::Failed,
                filename: session.filename.clone(),
                error: Some(message),
                job_id: job.job_id,
            };
            if let Err(e) =
                engine
                    .cache
                    .set_json(&status_key(file_id), &status, Some(STATUS_FAILED_TTL))
            {
                report_error(&mut e.context("publishing failed status"));
            }
            // Roll back whatever the failed attempt left on disk. The
            // descriptor row, if it was written, was rolled back already.
            for path in [engine.assembled_path(file_id), engine.compressed_path(file_id)] {
                let _ = tokio::fs::remove_file(path).await;
            }
            if let Err(e) = engine.destroy_session(upload_id).await {
                report_error(&mut e.context("removing failed session's scratch"));
            }
            let _ = engine.cache.del(&content_key(file_id));
        },
    }
}

async fn process(
    engine: &FileEngine,
    job: &mut ProcessingJob,
    session: &UploadSession,
    file_id: FileId,
) -> anyhow::Result<FileDescriptor> {
    engine.advance_job(job, Some(JobStatus::Processing), 10)?;

    // Pre-flight: assembly plus a possible compressed copy must fit.
    engine.ensure_scratch_space(2 * session.total_size).await?;

    let assembled_path = engine.assembled_path(file_id);
    let mut assembled = tokio::fs::File::create(&assembled_path)
        .await
        .with_context(|| format!("creating assembled file {}", assembled_path.display()))?;
    for index in 0..session.total_chunks {
        let chunk_path = engine.chunk_path(session.upload_id, index);
        let mut chunk = tokio::fs::File::open(&chunk_path)
            .await
            .with_context(|| format!("opening chunk {}", chunk_path.display()))?;
        tokio::io::copy(&mut chunk, &mut assembled)
            .await
            .with_context(|| format!("appending chunk {index}"))?;
    }
    assembled.flush().await?;
    assembled.sync_all().await?;
    let original_size = assembled.metadata().await?.len();
    drop(assembled);
    engine.advance_job(job, None, 50)?;

    anyhow::ensure!(
        original_size <= engine.limits.max_file_size,
        "assembled artifact of {original_size} bytes exceeds the size cap"
    );

    let algo = select_algo(&session.filename, original_size);
    let (blob, stored_size, algo) = if original_size > MAX_IN_MEMORY_BYTES {
        if algo == CompressionAlgo::None {
            let blob = engine.blobs.adopt(file_id, &assembled_path).await?;
            (blob, original_size, algo)
        } else {
            // Stream through the codec on disk; the artifact never has to fit
            // in memory.
            let compressed_path = engine.compressed_path(file_id);
            let reader = tokio::fs::File::open(&assembled_path).await?;
            let out = tokio::fs::File::create(&compressed_path).await?;
            let mut writer = wrap_writer(out, algo);
            let mut reader = BufReader::new(reader);
            tokio::io::copy(&mut reader, &mut writer).await?;
            writer.shutdown().await?;
            drop(writer);
            let stored_size = tokio::fs::metadata(&compressed_path).await?.len();
            tokio::fs::remove_file(&assembled_path).await?;
            let blob = engine.blobs.adopt(file_id, &compressed_path).await?;
            (blob, stored_size, algo)
        }
    } else {
        let bytes = Bytes::from(tokio::fs::read(&assembled_path).await?);
        let compressed = compress(bytes, algo).await?;
        let stored_size = compressed.len() as u64;
        let blob = engine.blobs.put(file_id, compressed).await?;
        tokio::fs::remove_file(&assembled_path).await?;
        (blob, stored_size, algo)
    };

    let descriptor = engine.build_descriptor(
        file_id,
        session.filename.clone(),
        original_size,
        stored_size,
        algo,
        blob,
        session.download_token.clone(),
    );
    if let Err(e) = engine.metadata.save(&descriptor) {
        engine.blobs.delete(&descriptor.blob).await?;
        return Err(e.context("persisting descriptor"));
    }
    engine.advance_job(job, None, 90)?;
    engine.publish_file(&descriptor)?;
    Ok(descriptor)
}
