//! Retrieval: expiry-checked lookup, token authorization, decompression and
//! byte ranges. Ranges over uncompressed blobs seek; ranges over compressed
//! blobs decompress the stream and slice, with a small-content cache mirror
//! absorbing repeat previews.

use std::{
    io::Cursor,
    time::Duration,
};

use bytes::Bytes;
use common::{
    time::unix_timestamp,
    FileId,
};
use compression::{
    wrap_reader,
    CompressionAlgo,
};
use errors::ErrorMetadata;
use metadata::{
    AccessKind,
    FileDescriptor,
};
use tokio::io::{
    AsyncRead,
    AsyncReadExt,
    AsyncSeekExt,
    BufReader,
};

use crate::{
    types::content_key,
    FileEngine,
};

/// Decompressed artifacts at or below this size are mirrored into the cache
/// on first read.
const CONTENT_MIRROR_MAX: u64 = 1 << 20;
const CONTENT_MIRROR_TTL: Duration = Duration::from_secs(300);

/// MIME types the preview endpoint will serve.
pub fn is_previewable(mime: &str) -> bool {
    mime.starts_with("image/")
        || mime.starts_with("text/")
        || mime.starts_with("video/")
        || mime.starts_with("audio/")
        || matches!(mime, "application/json" | "application/xml" | "application/pdf")
}

pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

impl FileEngine {
    /// Look up a live descriptor and check the caller may read it. Expired
    /// and absent files are indistinguishable.
    pub fn authorize_file(
        &self,
        id: FileId,
        password: Option<&str>,
        is_admin: bool,
    ) -> anyhow::Result<FileDescriptor> {
        let descriptor = self.metadata.get(id, unix_timestamp())?.ok_or_else(|| {
            anyhow::Error::from(ErrorMetadata::not_found(
                "FileNotFound",
                format!("file {id} does not exist or has expired"),
            ))
        })?;
        if let Some(required) = &descriptor.download_token {
            if !is_admin && password != Some(required.as_str()) {
                anyhow::bail!(ErrorMetadata::unauthenticated(
                    "InvalidPassword",
                    "download password is missing or does not match",
                ));
            }
        }
        Ok(descriptor)
    }

    /// Full artifact, decompressed. Length is `descriptor.original_size`.
    pub async fn open_full(&self, descriptor: &FileDescriptor) -> anyhow::Result<BodyReader> {
        if descriptor.compression != CompressionAlgo::None {
            if let Some(bytes) = self.cache.get(&content_key(descriptor.id)) {
                return Ok(Box::new(Cursor::new(bytes)));
            }
            if descriptor.original_size <= CONTENT_MIRROR_MAX {
                let bytes = self.read_decompressed_mirrored(descriptor).await?;
                return Ok(Box::new(Cursor::new(bytes)));
            }
        }
        let reader = self.blobs.open(&descriptor.blob).await?;
        Ok(wrap_reader(BufReader::new(reader), descriptor.compression))
    }

    /// `start..end` (end exclusive) of the decompressed artifact. The caller
    /// has already validated the bounds against `original_size`.
    pub async fn open_range(
        &self,
        descriptor: &FileDescriptor,
        start: u64,
        end: u64,
    ) -> anyhow::Result<BodyReader> {
        let len = end - start;
        if descriptor.compression == CompressionAlgo::None {
            let mut reader = self.blobs.open(&descriptor.blob).await?;
            reader.seek(std::io::SeekFrom::Start(start)).await?;
            return Ok(Box::new(BufReader::new(reader).take(len)));
        }
        // Compressed blobs have no random access; the stream is decompressed
        // and the requested slice cut out of it.
        if descriptor.original_size <= CONTENT_MIRROR_MAX {
            let bytes = match self.cache.get(&content_key(descriptor.id)) {
                Some(bytes) => bytes,
                None => self.read_decompressed_mirrored(descriptor).await?,
            };
            let slice = bytes.slice(start as usize..end as usize);
            return Ok(Box::new(Cursor::new(slice)));
        }
        let reader = self.blobs.open(&descriptor.blob).await?;
        let mut reader = wrap_reader(BufReader::new(reader), descriptor.compression);
        let skipped =
            tokio::io::copy(&mut (&mut reader).take(start), &mut tokio::io::sink()).await?;
        anyhow::ensure!(
            skipped == start,
            "decompressed stream ended at {skipped} before range start {start}"
        );
        Ok(Box::new(reader.take(len)))
    }

    async fn read_decompressed_mirrored(
        &self,
        descriptor: &FileDescriptor,
    ) -> anyhow::Result<Bytes> {
        let reader = self.blobs.open(&descriptor.blob).await?;
        let mut decompressed = wrap_reader(BufReader::new(reader), descriptor.compression);
        let mut out = Vec::with_capacity(descriptor.original_size as usize);
        tokio::io::copy(&mut decompressed, &mut out).await?;
        let bytes = Bytes::from(out);
        self.cache.set(
            &content_key(descriptor.id),
            bytes.clone(),
            Some(CONTENT_MIRROR_TTL),
        );
        Ok(bytes)
    }

    /// Fire-and-forget access logging; a failed write never affects the
    /// request that triggered it.
    pub fn log_access(
        &self,
        id: FileId,
        kind: AccessKind,
        remote: Option<String>,
        user_agent: Option<String>,
    ) {
        let metadata = self.metadata.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = metadata.log_access(
                id,
                kind,
                remote.as_deref(),
                user_agent.as_deref(),
                unix_timestamp(),
            ) {
                tracing::warn!("access log write failed for {id}: {e:#}");
            }
        });
    }

    /// Admin extension of a descriptor's lifetime. Expiry only ever moves
    /// forward.
    pub fn extend_expiry(&self, id: FileId, new_ts: i64) -> anyhow::Result<()> {
        let now = unix_timestamp();
        anyhow::ensure!(
            new_ts > now,
            ErrorMetadata::bad_request("ExpiryInPast", "expires_at must be in the future")
        );
        if !self.metadata.update_expiry(id, new_ts, now)? {
            if self.metadata.get_metadata(id, now)?.is_some() {
                anyhow::bail!(ErrorMetadata::bad_request(
                    "ExpiryNotExtended",
                    "expires_at must be later than the current expiry",
                ));
            }
            anyhow::bail!(ErrorMetadata::not_found(
                "FileNotFound",
                format!("file {id} does not exist or has expired"),
            ));
        }
        self.cache.batch(vec![
            // The stale mirror is dropped rather than rewritten; the next
            // publish or read repopulates it.
            ephemeral_cache::CacheOp::Del {
                key: crate::types::file_key(id),
            },
            ephemeral_cache::CacheOp::ZAdd {
                member: id.to_string(),
                score: new_ts,
            },
        ]);
        Ok(())
    }

    /// Remove a file everywhere: metadata row, blob bytes, cache mirrors,
    /// expiry set. Returns false if the descriptor was already gone.
    pub async fn delete_file(&self, id: FileId) -> anyhow::Result<bool> {
        let Some(blob) = self.metadata.delete(id)? else {
            return Ok(false);
        };
        self.blobs.delete(&blob).await?;
        self.cache.batch(vec![
            ephemeral_cache::CacheOp::Del {
                key: crate::types::file_key(id),
            },
            ephemeral_cache::CacheOp::Del {
                key: content_key(id),
            },
            ephemeral_cache::CacheOp::ZRem {
                member: id.to_string(),
            },
        ]);
        Ok(true)
    }
}
