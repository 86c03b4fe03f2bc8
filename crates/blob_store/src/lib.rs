//! Hybrid blob persistence. Small compressed artifacts ride inline in their
//! metadata row; large ones spill to `<scratch_root>/files/<id>` on the local
//! filesystem. The tier is decided once, at write time, and never re-evaluated
//! for an existing blob.

use std::{
    io::{
        Cursor,
        SeekFrom,
    },
    path::{
        Path,
        PathBuf,
    },
    pin::Pin,
    task::{
        Context,
        Poll,
    },
};

use anyhow::Context as _;
use bytes::Bytes;
use common::FileId;
use errors::ErrorMetadata;
use tokio::{
    fs,
    io::{
        AsyncRead,
        AsyncSeek,
        AsyncWriteExt,
        ReadBuf,
    },
};

pub const DEFAULT_EXTERNAL_THRESHOLD: u64 = 1 << 30;

/// Where a blob's bytes live. Exactly one representation exists per blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlobRef {
    Inline(Bytes),
    External(PathBuf),
}

impl BlobRef {
    pub fn kind(&self) -> &'static str {
        match self {
            BlobRef::Inline(_) => "inline",
            BlobRef::External(_) => "external",
        }
    }
}

#[derive(Clone, Debug)]
pub struct BlobStore {
    files_dir: PathBuf,
    external_threshold: u64,
}

impl BlobStore {
    /// `files_dir` is created eagerly; a store that cannot create its
    /// directory is misconfigured, not lazily broken.
    pub fn new(scratch_root: &Path, external_threshold: u64) -> anyhow::Result<Self> {
        let files_dir = scratch_root.join("files");
        std::fs::create_dir_all(&files_dir)
            .with_context(|| format!("creating blob dir {}", files_dir.display()))?;
        Ok(Self {
            files_dir,
            external_threshold,
        })
    }

    pub fn external_path(&self, id: FileId) -> PathBuf {
        self.files_dir.join(id.to_string())
    }

    /// Persist `bytes` for `id`. Above the threshold the write is atomic:
    /// temp file, `sync_all`, rename, then fsync of the directory entry. A
    /// failure mid-write removes the partial temp file.
    pub async fn put(&self, id: FileId, bytes: Bytes) -> anyhow::Result<BlobRef> {
        if (bytes.len() as u64) <= self.external_threshold {
            return Ok(BlobRef::Inline(bytes));
        }
        let dest = self.external_path(id);
        let tmp = self.files_dir.join(format!(".tmp-{id}"));
        let result: anyhow::Result<()> = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp, &dest).await?;
            self.sync_dir().await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.context(format!("writing external blob {id}")));
        }
        Ok(BlobRef::External(dest))
    }

    /// Take ownership of an already-assembled file by renaming it into the
    /// external area. Used by the processing pipeline so a multi-gigabyte
    /// artifact is never copied.
    pub async fn adopt(&self, id: FileId, assembled: &Path) -> anyhow::Result<BlobRef> {
        let dest = self.external_path(id);
        fs::File::open(assembled)
            .await
            .with_context(|| format!("assembled file {} missing", assembled.display()))?
            .sync_all()
            .await?;
        fs::rename(assembled, &dest)
            .await
            .with_context(|| format!("adopting assembled file into {}", dest.display()))?;
        self.sync_dir().await?;
        Ok(BlobRef::External(dest))
    }

    /// Random-access reader over the blob's (compressed) bytes.
    pub async fn open(&self, blob: &BlobRef) -> anyhow::Result<BlobReader> {
        match blob {
            BlobRef::Inline(bytes) => Ok(BlobReader::Memory(Cursor::new(bytes.clone()))),
            BlobRef::External(path) => {
                let file = fs::File::open(path).await.with_context(|| {
                    ErrorMetadata::internal_storage_error(format!(
                        "external blob {} is missing",
                        path.display()
                    ))
                })?;
                Ok(BlobReader::File(file))
            },
        }
    }

    /// Idempotent. Removing a blob whose file is already gone is success.
    pub async fn delete(&self, blob: &BlobRef) -> anyhow::Result<()> {
        match blob {
            BlobRef::Inline(_) => Ok(()),
            BlobRef::External(path) => match fs::remove_file(path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e).with_context(|| format!("deleting blob {}", path.display())),
            },
        }
    }

    async fn sync_dir(&self) -> anyhow::Result<()> {
        fs::File::open(&self.files_dir).await?.sync_all().await?;
        Ok(())
    }
}

/// Reader over either tier. Seek is O(1) for inline bytes and delegates to
/// the file for external blobs.
pub enum BlobReader {
    File(fs::File),
    Memory(Cursor<Bytes>),
}

impl AsyncRead for BlobReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BlobReader::File(f) => Pin::new(f).poll_read(cx, buf),
            BlobReader::Memory(c) => Pin::new(c).poll_read(cx, buf),
        }
    }
}

impl AsyncSeek for BlobReader {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
        match self.get_mut() {
            BlobReader::File(f) => Pin::new(f).start_seek(position),
            BlobReader::Memory(c) => Pin::new(c).start_seek(position),
        }
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        match self.get_mut() {
            BlobReader::File(f) => Pin::new(f).poll_complete(cx),
            BlobReader::Memory(c) => Pin::new(c).poll_complete(cx),
        }
    }
}
