//! The chunked-upload state machine. The coordinator exclusively owns the
//! scratch directory keyed by upload id; nothing else writes there until the
//! pipeline takes over at `complete`.

use std::path::PathBuf;

use anyhow::Context as _;
use bitvec::vec::BitVec;
use bytes::Bytes;
use common::{
    time::unix_timestamp,
    FileId,
    JobId,
    UploadId,
};
use errors::ErrorMetadata;
use metadata::{
    JobStatus,
    ProcessingJob,
};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::{
    types::{
        session_key,
        status_key,
        IncompleteUpload,
        ProcessingStatusRecord,
        SessionStatus,
        StatusKind,
        UploadSession,
    },
    FileEngine,
};

/// Scratch chunk files untouched for longer than this are fair game for the
/// aggressive cleanup pass.
const AGGRESSIVE_SCRATCH_FILE_IDLE_SECS: i64 = 3600;
/// Sessions idle for longer than this are destroyed by the aggressive
/// cleanup pass, ahead of their normal timeout.
const AGGRESSIVE_SESSION_IDLE_SECS: i64 = 600;
/// Headroom demanded beyond the bytes about to be written.
const SCRATCH_SPACE_MARGIN: u64 = 64 << 20;

#[derive(Debug, Serialize)]
pub struct ChunkReceipt {
    pub received_chunks: usize,
    pub total_chunks: u32,
    pub complete: bool,
}

impl FileEngine {
    /// Start a session: validate the declared geometry, create the scratch
    /// directory, record the session.
    pub async fn initiate_upload(
        &self,
        filename: String,
        total_size: u64,
        chunk_size: u64,
        download_token: Option<String>,
        file_hash: Option<String>,
    ) -> anyhow::Result<UploadSession> {
        anyhow::ensure!(
            total_size > 0,
            ErrorMetadata::bad_request("EmptyUpload", "total_size must be positive")
        );
        if total_size > self.limits.max_file_size {
            anyhow::bail!(ErrorMetadata::too_large(
                "FileTooLarge",
                format!(
                    "file of {total_size} bytes exceeds the {} byte limit",
                    self.limits.max_file_size
                ),
            ));
        }
        if chunk_size == 0 || chunk_size > self.limits.max_chunk_size {
            anyhow::bail!(ErrorMetadata::bad_request(
                "BadChunkSize",
                format!(
                    "chunk_size must be in 1..={} bytes",
                    self.limits.max_chunk_size
                ),
            ));
        }
        let total_chunks = total_size.div_ceil(chunk_size);
        if total_chunks > self.limits.max_chunks_per_file as u64 {
            anyhow::bail!(ErrorMetadata::bad_request(
                "TooManyChunks",
                format!(
                    "{total_chunks} chunks exceed the {} chunk limit",
                    self.limits.max_chunks_per_file
                ),
            ));
        }
        self.ensure_scratch_space(total_size).await?;

        let upload_id = UploadId::generate();
        let scratch_dir = self.session_scratch_dir(upload_id);
        tokio::fs::create_dir_all(&scratch_dir)
            .await
            .with_context(|| format!("creating scratch dir {}", scratch_dir.display()))?;

        let now = unix_timestamp();
        let session = UploadSession {
            upload_id,
            filename,
            total_size,
            chunk_size,
            total_chunks: total_chunks as u32,
            received_mask: BitVec::repeat(false, total_chunks as usize),
            created_at: now,
            last_activity: now,
            expires_at: now + self.limits.chunk_timeout.as_secs() as i64,
            download_token,
            file_hash,
        };
        self.write_session(&session)?;
        self.metadata
            .insert_session(upload_id, &scratch_dir, session.expires_at)?;
        tracing::info!(
            "session {upload_id} initiated: {} bytes in {total_chunks} chunks",
            session.total_size
        );
        Ok(session)
    }

    /// Store one chunk. Chunks for distinct indices may run concurrently;
    /// only the session record mutation is serialized. Re-posting a received
    /// chunk is success without a rewrite.
    pub async fn put_chunk(
        &self,
        upload_id: UploadId,
        index: u32,
        bytes: Bytes,
    ) -> anyhow::Result<ChunkReceipt> {
        let lock = self.session_lock(upload_id);
        {
            let _guard = lock.lock().await;
            let session = self.load_session(upload_id)?;
            if index >= session.total_chunks {
                anyhow::bail!(ErrorMetadata::bad_request(
                    "ChunkIndexOutOfRange",
                    format!(
                        "chunk index {index} is outside the session's 0..{} range",
                        session.total_chunks
                    ),
                ));
            }
            anyhow::ensure!(
                bytes.len() as u64 <= session.chunk_size,
                ErrorMetadata::too_large(
                    "ChunkTooLarge",
                    format!("chunk exceeds the declared {} byte chunk size", session.chunk_size),
                )
            );
            if session.received_mask[index as usize] {
                return Ok(receipt(&session));
            }
        }

        self.ensure_scratch_space(bytes.len() as u64).await?;

        // The chunk file itself needs no lock: no other writer touches this
        // index. The received bit flips only after the fsync, so `complete`
        // can never observe a partially persisted chunk.
        let path = self.chunk_path(upload_id, index);
        let mut file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("creating chunk file {}", path.display()))?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        let _guard = lock.lock().await;
        let mut session = self.load_session(upload_id)?;
        if !session.received_mask[index as usize] {
            session.received_mask.set(index as usize, true);
            session.last_activity = unix_timestamp();
            session.expires_at =
                session.last_activity + self.limits.chunk_timeout.as_secs() as i64;
            self.write_session(&session)?;
            self.metadata
                .update_session_expiry(upload_id, session.expires_at)?;
        }
        Ok(receipt(&session))
    }

    /// Finalize: verify every bit is set, allocate ids, record the pending
    /// job and hand it to the pipeline. The cache session record is consumed
    /// here; the scratch directory and skeleton row live on until the
    /// pipeline is done with them.
    pub async fn complete_upload(&self, upload_id: UploadId) -> anyhow::Result<(JobId, FileId)> {
        let lock = self.session_lock(upload_id);
        let _guard = lock.lock().await;
        let session = self.load_session(upload_id)?;
        if let Some(missing_chunk) = session.first_missing() {
            return Err(anyhow::Error::new(IncompleteUpload { missing_chunk }).context(
                ErrorMetadata::bad_request(
                    "IncompleteUpload",
                    format!("chunk {missing_chunk} has not been uploaded"),
                ),
            ));
        }

        let job_id = JobId::generate();
        let file_id = FileId::generate();
        let now = unix_timestamp();
        let job = ProcessingJob {
            job_id,
            upload_id,
            file_id: Some(file_id),
            status: JobStatus::Pending,
            progress: 0,
            error_message: None,
            result: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.metadata.create_job(&job)?;
        self.mirror_job(&job);
        self.cache.set_json(
            &status_key(file_id),
            &ProcessingStatusRecord {
                status: StatusKind::Processing,
                filename: session.filename.clone(),
                error: None,
                job_id,
            },
            Some(self.limits.chunk_timeout),
        )?;

        // Consume the session: no more chunks, no second complete.
        self.cache.del(&session_key(upload_id));
        self.drop_session_lock(upload_id);

        self.spawn_pipeline(job, session, file_id);
        Ok((job_id, file_id))
    }

    pub fn session_status(&self, upload_id: UploadId) -> anyhow::Result<SessionStatus> {
        let session = self.load_session(upload_id)?;
        Ok(SessionStatus::from(&session))
    }

    /// The fast-polled processing indicator for a file id, if one is still
    /// in the cache.
    pub fn processing_status(
        &self,
        file_id: FileId,
    ) -> anyhow::Result<Option<ProcessingStatusRecord>> {
        self.cache.get_json(&status_key(file_id))
    }

    /// Remove a session and everything it owns. Used by expiry and by the
    /// aggressive cleanup; safe to call on a half-gone session.
    pub async fn destroy_session(&self, upload_id: UploadId) -> anyhow::Result<()> {
        self.cache.del(&session_key(upload_id));
        self.metadata.delete_session(upload_id)?;
        self.drop_session_lock(upload_id);
        let scratch = self.session_scratch_dir(upload_id);
        match tokio::fs::remove_dir_all(&scratch).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing scratch {}", scratch.display())),
        }
    }

    pub(crate) fn session_scratch_dir(&self, upload_id: UploadId) -> PathBuf {
        self.scratch_root.join(upload_id.to_string())
    }

    pub(crate) fn chunk_path(&self, upload_id: UploadId, index: u32) -> PathBuf {
        self.session_scratch_dir(upload_id)
            .join(format!("chunk_{index}"))
    }

    pub(crate) fn load_session(&self, upload_id: UploadId) -> anyhow::Result<UploadSession> {
        let session: Option<UploadSession> = self.cache.get_json(&session_key(upload_id))?;
        let session = session.ok_or_else(|| {
            anyhow::Error::from(ErrorMetadata::not_found(
                "UploadSessionNotFound",
                format!("upload session {upload_id} does not exist or has expired"),
            ))
        })?;
        if session.expires_at <= unix_timestamp() {
            anyhow::bail!(ErrorMetadata::not_found(
                "UploadSessionNotFound",
                format!("upload session {upload_id} does not exist or has expired"),
            ));
        }
        Ok(session)
    }

    pub(crate) fn write_session(&self, session: &UploadSession) -> anyhow::Result<()> {
        self.cache.set_json(
            &session_key(session.upload_id),
            session,
            Some(self.limits.chunk_timeout),
        )
    }

    /// Check the scratch filesystem can absorb `needed` more bytes. On
    /// shortfall, run the aggressive cleanup once and re-check before giving
    /// up.
    pub(crate) async fn ensure_scratch_space(&self, needed: u64) -> anyhow::Result<()> {
        if self.available_scratch_space()? >= needed + SCRATCH_SPACE_MARGIN {
            return Ok(());
        }
        tracing::warn!("scratch volume low; running aggressive cleanup");
        self.aggressive_cleanup().await?;
        if self.available_scratch_space()? >= needed + SCRATCH_SPACE_MARGIN {
            return Ok(());
        }
        anyhow::bail!(ErrorMetadata::insufficient_space(format!(
            "scratch volume cannot hold {needed} more bytes"
        )))
    }

    fn available_scratch_space(&self) -> anyhow::Result<u64> {
        fs2::available_space(&self.scratch_root)
            .with_context(|| format!("statting scratch volume {}", self.scratch_root.display()))
    }

    /// Reclaim scratch space ahead of the normal expiry schedule: sessions
    /// idle beyond ten minutes are destroyed, and orphaned scratch entries
    /// untouched for an hour are removed.
    pub(crate) async fn aggressive_cleanup(&self) -> anyhow::Result<()> {
        let now = unix_timestamp();
        for key in self.cache.list(ephemeral_cache::CHUNK_UPLOAD_PREFIX) {
            let Ok(Some(session)) = self.cache.get_json::<UploadSession>(&key) else {
                continue;
            };
            if now - session.last_activity > AGGRESSIVE_SESSION_IDLE_SECS {
                tracing::info!("aggressively destroying idle session {}", session.upload_id);
                self.destroy_session(session.upload_id).await?;
            }
        }

        let mut entries = tokio::fs::read_dir(&self.scratch_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // The blob area is not scratch.
            if name == "files" {
                continue;
            }
            if let Ok(upload_id) = name.parse::<UploadId>() {
                if self.cache.get(&session_key(upload_id)).is_some() {
                    continue;
                }
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let age = meta
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .map(|e| e.as_secs() as i64)
                .unwrap_or(0);
            if age > AGGRESSIVE_SCRATCH_FILE_IDLE_SECS {
                tracing::info!("removing stale scratch entry {name}");
                let path = entry.path();
                let result = if meta.is_dir() {
                    tokio::fs::remove_dir_all(&path).await
                } else {
                    tokio::fs::remove_file(&path).await
                };
                if let Err(e) = result {
                    tracing::warn!("failed to remove stale scratch {}: {e}", path.display());
                }
            }
        }
        Ok(())
    }
}

fn receipt(session: &UploadSession) -> ChunkReceipt {
    ChunkReceipt {
        received_chunks: session.received_count(),
        total_chunks: session.total_chunks,
        complete: session.is_complete(),
    }
}
