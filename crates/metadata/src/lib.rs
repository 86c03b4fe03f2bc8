//! Durable store for file descriptors, processing jobs, session skeletons and
//! the access log, backed by SQLite. One connection, behind a mutex; SQLite
//! does not allow concurrent writers on a single connection and the queries
//! here are all short.

use std::path::{
    Path,
    PathBuf,
};

use anyhow::Context as _;
use blob_store::BlobRef;
use bytes::Bytes;
use common::{
    FileId,
    JobId,
    UploadId,
};
use compression::CompressionAlgo;
use parking_lot::Mutex;
use rusqlite::{
    params,
    Connection,
    OptionalExtension,
    Row,
};

mod types;

pub use crate::types::{
    AccessKind,
    FileDescriptor,
    FileMetadata,
    JobResult,
    JobStatus,
    ProcessingJob,
    SweepOutcome,
};

/// Access-log rows older than this are pruned by the hourly sweep.
pub const ACCESS_LOG_RETENTION_SECS: i64 = 30 * 24 * 3600;
/// Completed and failed jobs older than this are pruned by the hourly sweep.
pub const JOB_RETENTION_SECS: i64 = 7 * 24 * 3600;

const FILES_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    id TEXT PRIMARY KEY,
    filename TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    original_size INTEGER NOT NULL,
    stored_size INTEGER NOT NULL,
    compression TEXT NOT NULL,
    storage_kind TEXT NOT NULL,
    external_path TEXT,
    inline_content BLOB,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    delete_token TEXT NOT NULL,
    download_token TEXT
);
CREATE INDEX IF NOT EXISTS files_expires_at ON files (expires_at);
CREATE INDEX IF NOT EXISTS files_created_at ON files (created_at);
CREATE INDEX IF NOT EXISTS files_filename ON files (filename);
"#;

const CHUNK_UPLOADS_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS chunk_uploads (
    upload_id TEXT PRIMARY KEY,
    scratch_dir TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS chunk_uploads_expires_at ON chunk_uploads (expires_at);
"#;

const PROCESSING_JOBS_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS processing_jobs (
    job_id TEXT PRIMARY KEY,
    upload_id TEXT NOT NULL,
    file_id TEXT,
    status TEXT NOT NULL,
    progress INTEGER NOT NULL,
    error_message TEXT,
    result TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    completed_at INTEGER
);
CREATE INDEX IF NOT EXISTS processing_jobs_completed_at ON processing_jobs (completed_at);
"#;

const FILE_ACCESS_LOGS_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS file_access_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    remote TEXT,
    user_agent TEXT,
    at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS file_access_logs_at ON file_access_logs (at);
"#;

pub struct MetadataStore {
    inner: Mutex<Connection>,
}

impl MetadataStore {
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let connection = Connection::open(path)
            .with_context(|| format!("opening metadata db {}", path.display()))?;
        Self::init(connection)
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(connection: Connection) -> anyhow::Result<Self> {
        connection.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        // Idempotent; safe to run on every startup.
        connection.execute_batch(FILES_INIT)?;
        connection.execute_batch(CHUNK_UPLOADS_INIT)?;
        connection.execute_batch(PROCESSING_JOBS_INIT)?;
        connection.execute_batch(FILE_ACCESS_LOGS_INIT)?;
        Ok(Self {
            inner: Mutex::new(connection),
        })
    }

    /// Insert a descriptor. A duplicate id is a conflict; with 128-bit random
    /// ids it means something upstream is broken, so it surfaces as a plain
    /// (500-mapping) error.
    pub fn save(&self, descriptor: &FileDescriptor) -> anyhow::Result<()> {
        let (external_path, inline_content) = match &descriptor.blob {
            BlobRef::Inline(bytes) => (None, Some(bytes.as_ref())),
            BlobRef::External(path) => (Some(path_str(path)?), None),
        };
        let connection = self.inner.lock();
        let inserted = connection.execute(
            "INSERT OR IGNORE INTO files (id, filename, mime_type, original_size, stored_size, \
             compression, storage_kind, external_path, inline_content, created_at, expires_at, \
             delete_token, download_token) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, \
             ?12, ?13)",
            params![
                descriptor.id.to_string(),
                descriptor.filename,
                descriptor.mime_type,
                descriptor.original_size,
                descriptor.stored_size,
                descriptor.compression.as_str(),
                descriptor.blob.kind(),
                external_path,
                inline_content,
                descriptor.created_at,
                descriptor.expires_at,
                descriptor.delete_token,
                descriptor.download_token,
            ],
        )?;
        anyhow::ensure!(
            inserted == 1,
            "descriptor id conflict for {}",
            descriptor.id
        );
        Ok(())
    }

    /// Full descriptor, inline bytes included. Expired rows are invisible.
    pub fn get(&self, id: FileId, now: i64) -> anyhow::Result<Option<FileDescriptor>> {
        let connection = self.inner.lock();
        connection
            .query_row(
                "SELECT id, filename, mime_type, original_size, stored_size, compression, \
                 storage_kind, external_path, inline_content, created_at, expires_at, \
                 delete_token, download_token FROM files WHERE id = ?1 AND expires_at > ?2",
                params![id.to_string(), now],
                descriptor_from_row,
            )
            .optional()?
            .transpose()
    }

    /// Descriptor sans content: never reads the inline BLOB column.
    pub fn get_metadata(&self, id: FileId, now: i64) -> anyhow::Result<Option<FileMetadata>> {
        let connection = self.inner.lock();
        connection
            .query_row(
                "SELECT id, filename, mime_type, original_size, stored_size, compression, \
                 storage_kind, created_at, expires_at, download_token FROM files WHERE id = ?1 \
                 AND expires_at > ?2",
                params![id.to_string(), now],
                metadata_from_row,
            )
            .optional()?
            .transpose()
    }

    /// Remove the row. Returns what the caller needs to remove the bytes,
    /// or None if the row was absent.
    pub fn delete(&self, id: FileId) -> anyhow::Result<Option<BlobRef>> {
        let mut connection = self.inner.lock();
        let tx = connection.transaction()?;
        let blob = tx
            .query_row(
                "SELECT storage_kind, external_path FROM files WHERE id = ?1",
                params![id.to_string()],
                blob_site_from_row,
            )
            .optional()?
            .transpose()?;
        if blob.is_some() {
            tx.execute("DELETE FROM files WHERE id = ?1", params![id.to_string()])?;
        }
        tx.commit()?;
        Ok(blob)
    }

    /// Live descriptors, newest first.
    pub fn list_active(&self, now: i64) -> anyhow::Result<Vec<FileMetadata>> {
        let connection = self.inner.lock();
        let mut stmt = connection.prepare(
            "SELECT id, filename, mime_type, original_size, stored_size, compression, \
             storage_kind, created_at, expires_at, download_token FROM files WHERE expires_at > \
             ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![now], metadata_from_row)?;
        rows.map(|r| r?).collect()
    }

    /// Admin filename search. Prefix match on the filename index.
    pub fn search_by_filename_prefix(
        &self,
        prefix: &str,
        now: i64,
    ) -> anyhow::Result<Vec<FileMetadata>> {
        let escaped = prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
        let connection = self.inner.lock();
        let mut stmt = connection.prepare(
            "SELECT id, filename, mime_type, original_size, stored_size, compression, \
             storage_kind, created_at, expires_at, download_token FROM files WHERE expires_at > \
             ?1 AND filename LIKE ?2 ESCAPE '\\' ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![now, format!("{escaped}%")], metadata_from_row)?;
        rows.map(|r| r?).collect()
    }

    /// Extend a descriptor's lifetime. Only strictly-future, strictly-larger
    /// timestamps are accepted; expiry never moves backwards.
    pub fn update_expiry(&self, id: FileId, new_ts: i64, now: i64) -> anyhow::Result<bool> {
        anyhow::ensure!(new_ts > now, "new expiry {new_ts} is not in the future");
        let connection = self.inner.lock();
        let updated = connection.execute(
            "UPDATE files SET expires_at = ?2 WHERE id = ?1 AND expires_at < ?2",
            params![id.to_string(), new_ts],
        )?;
        Ok(updated == 1)
    }

    /// One transaction that removes everything past its lifetime: expired
    /// files, stale access-log rows, finished jobs past retention and expired
    /// session skeletons. Returns the on-disk locations the caller must
    /// remove; the rows are already gone when this returns.
    pub fn sweep_expired(&self, now: i64) -> anyhow::Result<SweepOutcome> {
        let mut connection = self.inner.lock();
        let tx = connection.transaction()?;

        let expired_files: Vec<(FileId, Option<PathBuf>)> = {
            let mut stmt = tx.prepare(
                "SELECT id, external_path FROM files WHERE expires_at <= ?1",
            )?;
            let rows = stmt.query_map(params![now], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?;
            rows.map(|r| {
                let (id, path) = r?;
                Ok((id.parse::<FileId>()?, path.map(PathBuf::from)))
            })
            .collect::<anyhow::Result<_>>()?
        };
        tx.execute("DELETE FROM files WHERE expires_at <= ?1", params![now])?;

        let removed_logs = tx.execute(
            "DELETE FROM file_access_logs WHERE at <= ?1",
            params![now - ACCESS_LOG_RETENTION_SECS],
        )?;
        let removed_jobs = tx.execute(
            "DELETE FROM processing_jobs WHERE completed_at IS NOT NULL AND completed_at <= ?1",
            params![now - JOB_RETENTION_SECS],
        )?;

        let expired_sessions: Vec<(UploadId, PathBuf)> = {
            let mut stmt = tx.prepare(
                "SELECT upload_id, scratch_dir FROM chunk_uploads WHERE expires_at <= ?1",
            )?;
            let rows = stmt.query_map(params![now], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.map(|r| {
                let (id, dir) = r?;
                Ok((id.parse::<UploadId>()?, PathBuf::from(dir)))
            })
            .collect::<anyhow::Result<_>>()?
        };
        tx.execute("DELETE FROM chunk_uploads WHERE expires_at <= ?1", params![now])?;

        tx.commit()?;
        Ok(SweepOutcome {
            expired_files,
            removed_logs,
            removed_jobs,
            expired_sessions,
        })
    }

    /// Append-only; the caller treats failures as fire-and-forget.
    pub fn log_access(
        &self,
        id: FileId,
        kind: AccessKind,
        remote: Option<&str>,
        user_agent: Option<&str>,
        now: i64,
    ) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        connection.execute(
            "INSERT INTO file_access_logs (file_id, kind, remote, user_agent, at) VALUES (?1, \
             ?2, ?3, ?4, ?5)",
            params![id.to_string(), kind.as_str(), remote, user_agent, now],
        )?;
        Ok(())
    }

    pub fn create_job(&self, job: &ProcessingJob) -> anyhow::Result<()> {
        let result_json = job.result.as_ref().map(serde_json::to_string).transpose()?;
        let connection = self.inner.lock();
        connection.execute(
            "INSERT INTO processing_jobs (job_id, upload_id, file_id, status, progress, \
             error_message, result, created_at, updated_at, completed_at) VALUES (?1, ?2, ?3, \
             ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                job.job_id.to_string(),
                job.upload_id.to_string(),
                job.file_id.map(|id| id.to_string()),
                job.status.as_str(),
                job.progress as i64,
                job.error_message,
                result_json,
                job.created_at,
                job.updated_at,
                job.completed_at,
            ],
        )?;
        Ok(())
    }

    pub fn update_job(&self, job: &ProcessingJob) -> anyhow::Result<()> {
        let result_json = job.result.as_ref().map(serde_json::to_string).transpose()?;
        let connection = self.inner.lock();
        let updated = connection.execute(
            "UPDATE processing_jobs SET file_id = ?2, status = ?3, progress = ?4, error_message \
             = ?5, result = ?6, updated_at = ?7, completed_at = ?8 WHERE job_id = ?1",
            params![
                job.job_id.to_string(),
                job.file_id.map(|id| id.to_string()),
                job.status.as_str(),
                job.progress as i64,
                job.error_message,
                result_json,
                job.updated_at,
                job.completed_at,
            ],
        )?;
        anyhow::ensure!(updated == 1, "job {} vanished mid-update", job.job_id);
        Ok(())
    }

    pub fn get_job(&self, job_id: JobId) -> anyhow::Result<Option<ProcessingJob>> {
        let connection = self.inner.lock();
        connection
            .query_row(
                "SELECT job_id, upload_id, file_id, status, progress, error_message, result, \
                 created_at, updated_at, completed_at FROM processing_jobs WHERE job_id = ?1",
                params![job_id.to_string()],
                job_from_row,
            )
            .optional()?
            .transpose()
    }

    pub fn insert_session(
        &self,
        upload_id: UploadId,
        scratch_dir: &Path,
        expires_at: i64,
    ) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        connection.execute(
            "INSERT INTO chunk_uploads (upload_id, scratch_dir, expires_at) VALUES (?1, ?2, ?3)",
            params![upload_id.to_string(), path_str(scratch_dir)?, expires_at],
        )?;
        Ok(())
    }

    pub fn update_session_expiry(&self, upload_id: UploadId, expires_at: i64) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        connection.execute(
            "UPDATE chunk_uploads SET expires_at = ?2 WHERE upload_id = ?1",
            params![upload_id.to_string(), expires_at],
        )?;
        Ok(())
    }

    pub fn delete_session(&self, upload_id: UploadId) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        connection.execute(
            "DELETE FROM chunk_uploads WHERE upload_id = ?1",
            params![upload_id.to_string()],
        )?;
        Ok(())
    }
}

fn path_str(path: &Path) -> anyhow::Result<String> {
    Ok(path
        .to_str()
        .with_context(|| format!("non-UTF8 storage path {}", path.display()))?
        .to_string())
}

fn descriptor_from_row(row: &Row<'_>) -> rusqlite::Result<anyhow::Result<FileDescriptor>> {
    let id: String = row.get(0)?;
    let filename: String = row.get(1)?;
    let mime_type: String = row.get(2)?;
    let original_size: u64 = row.get(3)?;
    let stored_size: u64 = row.get(4)?;
    let compression: String = row.get(5)?;
    let storage_kind: String = row.get(6)?;
    let external_path: Option<String> = row.get(7)?;
    let inline_content: Option<Vec<u8>> = row.get(8)?;
    let created_at: i64 = row.get(9)?;
    let expires_at: i64 = row.get(10)?;
    let delete_token: String = row.get(11)?;
    let download_token: Option<String> = row.get(12)?;
    Ok((|| {
        let blob = blob_from_parts(&storage_kind, external_path, inline_content)?;
        Ok(FileDescriptor {
            id: id.parse()?,
            filename,
            mime_type,
            original_size,
            stored_size,
            compression: CompressionAlgo::parse(&compression)?,
            blob,
            created_at,
            expires_at,
            delete_token,
            download_token,
        })
    })())
}

fn metadata_from_row(row: &Row<'_>) -> rusqlite::Result<anyhow::Result<FileMetadata>> {
    let id: String = row.get(0)?;
    let filename: String = row.get(1)?;
    let mime_type: String = row.get(2)?;
    let original_size: u64 = row.get(3)?;
    let stored_size: u64 = row.get(4)?;
    let compression: String = row.get(5)?;
    let storage_kind: String = row.get(6)?;
    let created_at: i64 = row.get(7)?;
    let expires_at: i64 = row.get(8)?;
    let download_token: Option<String> = row.get(9)?;
    Ok((|| {
        Ok(FileMetadata {
            id: id.parse()?,
            filename,
            mime_type,
            original_size,
            stored_size,
            compression: CompressionAlgo::parse(&compression)?,
            storage_kind,
            created_at,
            expires_at,
            has_download_token: download_token.is_some(),
        })
    })())
}

fn blob_site_from_row(row: &Row<'_>) -> rusqlite::Result<anyhow::Result<BlobRef>> {
    let storage_kind: String = row.get(0)?;
    let external_path: Option<String> = row.get(1)?;
    Ok(blob_from_parts(&storage_kind, external_path, Some(Vec::new())))
}

fn blob_from_parts(
    storage_kind: &str,
    external_path: Option<String>,
    inline_content: Option<Vec<u8>>,
) -> anyhow::Result<BlobRef> {
    match storage_kind {
        "inline" => {
            let content = inline_content.context("inline descriptor without content")?;
            Ok(BlobRef::Inline(Bytes::from(content)))
        },
        "external" => {
            let path = external_path.context("external descriptor without path")?;
            Ok(BlobRef::External(PathBuf::from(path)))
        },
        other => anyhow::bail!("unknown storage kind {other:?}"),
    }
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<anyhow::Result<ProcessingJob>> {
    let job_id: String = row.get(0)?;
    let upload_id: String = row.get(1)?;
    let file_id: Option<String> = row.get(2)?;
    let status: String = row.get(3)?;
    let progress: i64 = row.get(4)?;
    let error_message: Option<String> = row.get(5)?;
    let result: Option<String> = row.get(6)?;
    let created_at: i64 = row.get(7)?;
    let updated_at: i64 = row.get(8)?;
    let completed_at: Option<i64> = row.get(9)?;
    Ok((|| {
        Ok(ProcessingJob {
            job_id: job_id.parse()?,
            upload_id: upload_id.parse()?,
            file_id: file_id.map(|id| id.parse()).transpose()?,
            status: JobStatus::parse(&status)?,
            progress: progress as u8,
            error_message,
            result: result.map(|r| serde_json::from_str(&r)).transpose()?,
            created_at,
            updated_at,
            completed_at,
        })
    })())
}

#[cfg(test)]
mod tests;
