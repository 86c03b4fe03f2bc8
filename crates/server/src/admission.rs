//! Bounded admission for the upload and download paths. Two weighted
//! semaphores; acquisition is bounded so a saturated server answers 503
//! instead of queueing forever. The media streaming path deliberately takes
//! no permit, so long-lived streams cannot starve short requests.

use std::{
    sync::Arc,
    time::Duration,
};

use errors::ErrorMetadata;
use tokio::sync::{
    OwnedSemaphorePermit,
    Semaphore,
};

/// How long a request waits for a permit before being refused.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AdmissionControl {
    upload: Arc<Semaphore>,
    download: Arc<Semaphore>,
}

impl AdmissionControl {
    pub fn new(upload_permits: usize, download_permits: usize) -> Self {
        Self {
            upload: Arc::new(Semaphore::new(upload_permits)),
            download: Arc::new(Semaphore::new(download_permits)),
        }
    }

    pub async fn acquire_upload(&self) -> anyhow::Result<OwnedSemaphorePermit> {
        Self::acquire(&self.upload, "TooManyUploads", "too many concurrent uploads").await
    }

    pub async fn acquire_download(&self) -> anyhow::Result<OwnedSemaphorePermit> {
        Self::acquire(
            &self.download,
            "TooManyDownloads",
            "too many concurrent downloads",
        )
        .await
    }

    async fn acquire(
        semaphore: &Arc<Semaphore>,
        short_msg: &'static str,
        msg: &'static str,
    ) -> anyhow::Result<OwnedSemaphorePermit> {
        match tokio::time::timeout(ACQUIRE_TIMEOUT, semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_closed)) => anyhow::bail!("admission semaphore closed"),
            Err(_elapsed) => anyhow::bail!(ErrorMetadata::overloaded(short_msg, msg)),
        }
    }
}
