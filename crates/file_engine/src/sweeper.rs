//! Expiry enforcement. Two long-lived loops: a fast one draining the cache's
//! expiry-ordered set, and an hourly one sweeping the metadata store and the
//! filesystem debris it points at. Both are idempotent and safe to run
//! alongside retrieval, which re-checks expiry on every read.

use std::time::Duration;

use common::{
    backoff::Backoff,
    time::unix_timestamp,
    FileId,
};
use ephemeral_cache::CacheOp;
use errors::report_error;
use metadata::SweepOutcome;

use crate::{
    types::{
        content_key,
        file_key,
        session_key,
    },
    FileEngine,
};

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const METADATA_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct ExpirySweeper {
    engine: FileEngine,
}

impl ExpirySweeper {
    pub fn new(engine: FileEngine) -> Self {
        Self { engine }
    }

    /// Every five minutes: drop every member of the expiry-ordered set whose
    /// second has passed, along with its companion cache entries.
    pub async fn run_cache_loop(self) {
        let mut backoff = Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF);
        loop {
            tokio::time::sleep(CACHE_SWEEP_INTERVAL).await;
            match self.sweep_cache_once() {
                Ok(swept) => {
                    backoff.reset();
                    if swept > 0 {
                        tracing::info!("cache sweep dropped {swept} expired file entries");
                    }
                },
                Err(e) => {
                    report_error(&mut e.context("cache sweep iteration"));
                    let delay = backoff.fail(&mut rand::rng());
                    tokio::time::sleep(delay).await;
                },
            }
        }
    }

    /// Every hour: sweep the metadata store, then remove the blob files and
    /// scratch directories the removed rows pointed at.
    pub async fn run_metadata_loop(self) {
        let mut backoff = Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF);
        loop {
            tokio::time::sleep(METADATA_SWEEP_INTERVAL).await;
            match self.sweep_metadata_once().await {
                Ok(outcome) => {
                    backoff.reset();
                    tracing::info!(
                        "metadata sweep: {} files, {} sessions, {} log rows, {} jobs",
                        outcome.removed_files(),
                        outcome.expired_sessions.len(),
                        outcome.removed_logs,
                        outcome.removed_jobs,
                    );
                },
                Err(e) => {
                    report_error(&mut e.context("metadata sweep iteration"));
                    let delay = backoff.fail(&mut rand::rng());
                    tokio::time::sleep(delay).await;
                },
            }
        }
    }

    pub fn sweep_cache_once(&self) -> anyhow::Result<usize> {
        let cache = self.engine.cache();
        let due = cache.zrange_by_score(unix_timestamp());
        for (_, member) in &due {
            let mut ops = vec![CacheOp::ZRem {
                member: member.clone(),
            }];
            if let Ok(id) = member.parse::<FileId>() {
                ops.push(CacheOp::Del { key: file_key(id) });
                ops.push(CacheOp::Del {
                    key: content_key(id),
                });
            }
            cache.batch(ops);
        }
        cache.purge_expired();
        Ok(due.len())
    }

    pub async fn sweep_metadata_once(&self) -> anyhow::Result<SweepOutcome> {
        let now = unix_timestamp();
        let outcome = self.engine.metadata().sweep_expired(now)?;
        for (id, external_path) in &outcome.expired_files {
            if let Some(path) = external_path {
                match tokio::fs::remove_file(path).await {
                    Ok(()) => {},
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                    Err(e) => {
                        report_error(
                            &mut anyhow::Error::from(e)
                                .context(format!("removing expired blob {}", path.display())),
                        );
                    },
                }
            }
            self.engine.cache().batch(vec![
                CacheOp::Del { key: file_key(*id) },
                CacheOp::Del {
                    key: content_key(*id),
                },
                CacheOp::ZRem {
                    member: id.to_string(),
                },
            ]);
        }
        for (upload_id, scratch_dir) in &outcome.expired_sessions {
            self.engine.cache().del(&session_key(*upload_id));
            self.engine.drop_session_lock(*upload_id);
            match tokio::fs::remove_dir_all(scratch_dir).await {
                Ok(()) => {},
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => {
                    report_error(&mut anyhow::Error::from(e).context(format!(
                        "removing expired session scratch {}",
                        scratch_dir.display()
                    )));
                },
            }
        }
        Ok(outcome)
    }
}
