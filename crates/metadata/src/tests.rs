use std::path::PathBuf;

use blob_store::BlobRef;
use bytes::Bytes;
use common::{
    FileId,
    JobId,
    UploadId,
};
use compression::CompressionAlgo;

use crate::{
    AccessKind,
    FileDescriptor,
    JobResult,
    JobStatus,
    MetadataStore,
    ProcessingJob,
    ACCESS_LOG_RETENTION_SECS,
    JOB_RETENTION_SECS,
};

const NOW: i64 = 1_700_000_000;

fn descriptor(expires_at: i64) -> FileDescriptor {
    FileDescriptor {
        id: FileId::generate(),
        filename: "hello.txt".to_string(),
        mime_type: "text/plain".to_string(),
        original_size: 13,
        stored_size: 13,
        compression: CompressionAlgo::None,
        blob: BlobRef::Inline(Bytes::from_static(b"Hello, world!")),
        created_at: NOW,
        expires_at,
        delete_token: "tokentoken12".to_string(),
        download_token: None,
    }
}

#[test]
fn test_save_get_roundtrip() -> anyhow::Result<()> {
    let store = MetadataStore::in_memory()?;
    let d = descriptor(NOW + 3600);
    store.save(&d)?;
    let fetched = store.get(d.id, NOW)?.expect("descriptor missing");
    assert_eq!(fetched, d);
    let meta = store.get_metadata(d.id, NOW)?.expect("metadata missing");
    assert_eq!(meta.filename, "hello.txt");
    assert!(!meta.has_download_token);
    assert_eq!(meta.storage_kind, "inline");
    Ok(())
}

#[test]
fn test_save_conflict_is_error() -> anyhow::Result<()> {
    let store = MetadataStore::in_memory()?;
    let d = descriptor(NOW + 3600);
    store.save(&d)?;
    assert!(store.save(&d).is_err());
    Ok(())
}

#[test]
fn test_expired_rows_are_invisible() -> anyhow::Result<()> {
    let store = MetadataStore::in_memory()?;
    let d = descriptor(NOW + 10);
    store.save(&d)?;
    assert!(store.get(d.id, NOW)?.is_some());
    assert!(store.get(d.id, NOW + 10)?.is_none());
    assert!(store.get_metadata(d.id, NOW + 10)?.is_none());
    Ok(())
}

#[test]
fn test_non_ascii_filename_is_preserved() -> anyhow::Result<()> {
    let store = MetadataStore::in_memory()?;
    let mut d = descriptor(NOW + 3600);
    d.filename = "日本語のファイル名.txt".to_string();
    store.save(&d)?;
    assert_eq!(
        store.get(d.id, NOW)?.unwrap().filename,
        "日本語のファイル名.txt"
    );
    Ok(())
}

#[test]
fn test_external_descriptor_roundtrip() -> anyhow::Result<()> {
    let store = MetadataStore::in_memory()?;
    let mut d = descriptor(NOW + 3600);
    d.blob = BlobRef::External(PathBuf::from("/scratch/files/abc"));
    store.save(&d)?;
    let fetched = store.get(d.id, NOW)?.unwrap();
    assert_eq!(fetched.blob, d.blob);
    assert_eq!(store.get_metadata(d.id, NOW)?.unwrap().storage_kind, "external");
    Ok(())
}

#[test]
fn test_delete_returns_blob_once() -> anyhow::Result<()> {
    let store = MetadataStore::in_memory()?;
    let d = descriptor(NOW + 3600);
    store.save(&d)?;
    assert!(store.delete(d.id)?.is_some());
    assert!(store.delete(d.id)?.is_none());
    assert!(store.get(d.id, NOW)?.is_none());
    Ok(())
}

#[test]
fn test_list_active_orders_newest_first() -> anyhow::Result<()> {
    let store = MetadataStore::in_memory()?;
    let mut first = descriptor(NOW + 3600);
    first.created_at = NOW - 100;
    let mut second = descriptor(NOW + 3600);
    second.created_at = NOW - 50;
    let expired = descriptor(NOW - 1);
    store.save(&first)?;
    store.save(&second)?;
    store.save(&expired)?;
    let listed = store.list_active(NOW)?;
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, second.id);
    assert_eq!(listed[1].id, first.id);
    Ok(())
}

#[test]
fn test_filename_prefix_search_escapes_like_wildcards() -> anyhow::Result<()> {
    let store = MetadataStore::in_memory()?;
    let mut a = descriptor(NOW + 3600);
    a.filename = "report_2024.txt".to_string();
    let mut b = descriptor(NOW + 3600);
    b.filename = "reportX2024.txt".to_string();
    store.save(&a)?;
    store.save(&b)?;
    let hits = store.search_by_filename_prefix("report_", NOW)?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, a.id);
    Ok(())
}

#[test]
fn test_update_expiry_is_strictly_monotonic() -> anyhow::Result<()> {
    let store = MetadataStore::in_memory()?;
    let d = descriptor(NOW + 3600);
    store.save(&d)?;
    // Into the past: rejected outright.
    assert!(store.update_expiry(d.id, NOW - 1, NOW).is_err());
    // Future but earlier than the current expiry: no-op.
    assert!(!store.update_expiry(d.id, NOW + 1800, NOW)?);
    // Extension applies.
    assert!(store.update_expiry(d.id, NOW + 7200, NOW)?);
    assert_eq!(store.get(d.id, NOW)?.unwrap().expires_at, NOW + 7200);
    // Unknown id.
    assert!(!store.update_expiry(FileId::generate(), NOW + 7200, NOW)?);
    Ok(())
}

#[test]
fn test_sweep_expired_removes_everything_due() -> anyhow::Result<()> {
    let store = MetadataStore::in_memory()?;
    let live = descriptor(NOW + 3600);
    let mut dead = descriptor(NOW - 5);
    dead.blob = BlobRef::External(PathBuf::from("/scratch/files/dead"));
    store.save(&live)?;
    store.save(&dead)?;

    store.log_access(live.id, AccessKind::Download, Some("127.0.0.1"), None, NOW)?;
    store.log_access(
        dead.id,
        AccessKind::Preview,
        None,
        Some("curl/8"),
        NOW - ACCESS_LOG_RETENTION_SECS - 10,
    )?;

    let old_job = ProcessingJob {
        job_id: JobId::generate(),
        upload_id: UploadId::generate(),
        file_id: None,
        status: JobStatus::Failed,
        progress: 100,
        error_message: Some("disk full".to_string()),
        result: None,
        created_at: NOW - JOB_RETENTION_SECS - 100,
        updated_at: NOW - JOB_RETENTION_SECS - 100,
        completed_at: Some(NOW - JOB_RETENTION_SECS - 100),
    };
    store.create_job(&old_job)?;

    let session_id = UploadId::generate();
    store.insert_session(session_id, &PathBuf::from("/scratch/sess"), NOW - 1)?;

    let outcome = store.sweep_expired(NOW)?;
    assert_eq!(outcome.removed_files(), 1);
    assert_eq!(outcome.expired_files[0].0, dead.id);
    assert_eq!(
        outcome.expired_files[0].1.as_deref(),
        Some(std::path::Path::new("/scratch/files/dead"))
    );
    assert_eq!(outcome.removed_logs, 1);
    assert_eq!(outcome.removed_jobs, 1);
    assert_eq!(outcome.expired_sessions.len(), 1);
    assert_eq!(outcome.expired_sessions[0].0, session_id);

    assert!(store.get_job(old_job.job_id)?.is_none());
    assert!(store.get(live.id, NOW)?.is_some());
    // Idempotent: a second sweep finds nothing.
    let outcome = store.sweep_expired(NOW)?;
    assert_eq!(outcome.removed_files(), 0);
    assert_eq!(outcome.expired_sessions.len(), 0);
    Ok(())
}

#[test]
fn test_job_roundtrip_and_update() -> anyhow::Result<()> {
    let store = MetadataStore::in_memory()?;
    let mut job = ProcessingJob {
        job_id: JobId::generate(),
        upload_id: UploadId::generate(),
        file_id: None,
        status: JobStatus::Pending,
        progress: 0,
        error_message: None,
        result: None,
        created_at: NOW,
        updated_at: NOW,
        completed_at: None,
    };
    store.create_job(&job)?;
    assert_eq!(store.get_job(job.job_id)?, Some(job.clone()));

    let file_id = FileId::generate();
    job.file_id = Some(file_id);
    job.status = JobStatus::Completed;
    job.progress = 100;
    job.result = Some(JobResult {
        file_id,
        filename: "big.bin".to_string(),
        size: 157_286_400,
        delete_token: "deadbeef1234".to_string(),
    });
    job.updated_at = NOW + 10;
    job.completed_at = Some(NOW + 10);
    store.update_job(&job)?;
    assert_eq!(store.get_job(job.job_id)?, Some(job));
    Ok(())
}

#[test]
fn test_session_rows() -> anyhow::Result<()> {
    let store = MetadataStore::in_memory()?;
    let id = UploadId::generate();
    store.insert_session(id, &PathBuf::from("/scratch/x"), NOW + 100)?;
    store.update_session_expiry(id, NOW + 500)?;
    let outcome = store.sweep_expired(NOW + 200)?;
    assert!(outcome.expired_sessions.is_empty());
    store.delete_session(id)?;
    let outcome = store.sweep_expired(NOW + 1000)?;
    assert!(outcome.expired_sessions.is_empty());
    Ok(())
}

#[test]
fn test_status_transitions() {
    assert!(JobStatus::Pending.can_transition_to(JobStatus::Processing));
    assert!(JobStatus::Processing.can_transition_to(JobStatus::Completed));
    assert!(JobStatus::Processing.can_transition_to(JobStatus::Failed));
    assert!(!JobStatus::Completed.can_transition_to(JobStatus::Processing));
    assert!(!JobStatus::Failed.can_transition_to(JobStatus::Completed));
    assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
}
