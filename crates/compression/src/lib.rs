//! Adaptive compression for stored artifacts: a deterministic selection
//! policy over filename + size, and the codecs behind it. Selection is a pure
//! function; the codecs stream, so neither tier of the blob store needs the
//! whole artifact in memory.

use std::path::Path;

use async_compression::{
    tokio::{
        bufread::{
            GzipDecoder,
            GzipEncoder,
            Lz4Decoder,
            Lz4Encoder,
            ZstdDecoder,
            ZstdEncoder,
        },
        write,
    },
    Level,
};
use bytes::Bytes;
use tokio::io::{
    AsyncBufRead,
    AsyncRead,
    AsyncWrite,
};

/// Skip compression entirely above this size; the CPU and memory cost beats
/// the gain.
pub const SKIP_COMPRESSION_ABOVE: u64 = 500 << 20;
/// Above this size, bias for throughput.
pub const LZ4_ABOVE: u64 = 100 << 20;
/// Below this size the header overhead of heavier codecs dominates.
pub const TINY_BELOW: u64 = 10 << 10;
/// Up to this size, spend CPU for ratio.
pub const ZSTD_BELOW: u64 = 10 << 20;

const ZSTD_LEVEL: i32 = 19;

/// Extensions whose content is already entropy-coded. Compressing these
/// again wastes a full pass over the bytes for ~0% gain.
const ALREADY_COMPRESSED: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "mp3", "aac", "ogg", "flac", "mp4", "mkv", "avi", "mov",
    "zip", "rar", "7z", "tar", "gz", "pdf",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressionAlgo {
    None,
    Gzip,
    Zstd,
    Lz4,
}

impl CompressionAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionAlgo::None => "none",
            CompressionAlgo::Gzip => "gzip",
            CompressionAlgo::Zstd => "zstd",
            CompressionAlgo::Lz4 => "lz4",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "none" => Ok(CompressionAlgo::None),
            "gzip" => Ok(CompressionAlgo::Gzip),
            "zstd" => Ok(CompressionAlgo::Zstd),
            "lz4" => Ok(CompressionAlgo::Lz4),
            _ => anyhow::bail!("unknown compression algorithm {s:?}"),
        }
    }
}

impl std::fmt::Display for CompressionAlgo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
}

/// The selection policy. Order matters: the extension check wins over every
/// size breakpoint.
pub fn select_algo(filename: &str, size: u64) -> CompressionAlgo {
    if let Some(ext) = extension_of(filename) {
        if ALREADY_COMPRESSED.contains(&ext.as_str()) {
            return CompressionAlgo::None;
        }
    }
    if size > SKIP_COMPRESSION_ABOVE {
        return CompressionAlgo::None;
    }
    if size > LZ4_ABOVE {
        return CompressionAlgo::Lz4;
    }
    if size < TINY_BELOW {
        return CompressionAlgo::Lz4;
    }
    if size < ZSTD_BELOW {
        return CompressionAlgo::Zstd;
    }
    CompressionAlgo::Lz4
}

/// Wrap a reader of compressed bytes so it yields the original bytes.
pub fn wrap_reader<'a, R>(reader: R, algo: CompressionAlgo) -> Box<dyn AsyncRead + Send + Unpin + 'a>
where
    R: AsyncBufRead + Send + Unpin + 'a,
{
    match algo {
        CompressionAlgo::None => Box::new(reader),
        CompressionAlgo::Gzip => Box::new(GzipDecoder::new(reader)),
        CompressionAlgo::Zstd => Box::new(ZstdDecoder::new(reader)),
        CompressionAlgo::Lz4 => Box::new(Lz4Decoder::new(reader)),
    }
}

/// Wrap a writer so plain bytes written to it land compressed. The caller
/// must call `shutdown()` on the returned writer to flush the codec's final
/// frame before the output is complete.
pub fn wrap_writer<'a, W>(writer: W, algo: CompressionAlgo) -> Box<dyn AsyncWrite + Send + Unpin + 'a>
where
    W: AsyncWrite + Send + Unpin + 'a,
{
    match algo {
        CompressionAlgo::None => Box::new(writer),
        CompressionAlgo::Gzip => Box::new(write::GzipEncoder::new(writer)),
        CompressionAlgo::Zstd => {
            Box::new(write::ZstdEncoder::with_quality(writer, Level::Precise(ZSTD_LEVEL)))
        },
        CompressionAlgo::Lz4 => Box::new(write::Lz4Encoder::new(writer)),
    }
}

pub async fn compress(data: Bytes, algo: CompressionAlgo) -> anyhow::Result<Bytes> {
    if algo == CompressionAlgo::None {
        return Ok(data);
    }
    let mut out = Vec::with_capacity(data.len() / 2 + 64);
    let input = &data[..];
    match algo {
        CompressionAlgo::None => unreachable!(),
        CompressionAlgo::Gzip => {
            tokio::io::copy(&mut GzipEncoder::new(input), &mut out).await?;
        },
        CompressionAlgo::Zstd => {
            tokio::io::copy(
                &mut ZstdEncoder::with_quality(input, Level::Precise(ZSTD_LEVEL)),
                &mut out,
            )
            .await?;
        },
        CompressionAlgo::Lz4 => {
            tokio::io::copy(&mut Lz4Encoder::new(input), &mut out).await?;
        },
    }
    Ok(out.into())
}

pub async fn decompress(data: Bytes, algo: CompressionAlgo) -> anyhow::Result<Bytes> {
    if algo == CompressionAlgo::None {
        return Ok(data);
    }
    let mut out = Vec::with_capacity(data.len() * 2);
    let input = &data[..];
    match algo {
        CompressionAlgo::None => unreachable!(),
        CompressionAlgo::Gzip => {
            tokio::io::copy(&mut GzipDecoder::new(input), &mut out).await?;
        },
        CompressionAlgo::Zstd => {
            tokio::io::copy(&mut ZstdDecoder::new(input), &mut out).await?;
        },
        CompressionAlgo::Lz4 => {
            tokio::io::copy(&mut Lz4Decoder::new(input), &mut out).await?;
        },
    }
    Ok(out.into())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rand::RngCore;
    use tokio::io::AsyncWriteExt;

    use crate::{
        compress,
        decompress,
        select_algo,
        wrap_reader,
        wrap_writer,
        CompressionAlgo,
        LZ4_ABOVE,
        SKIP_COMPRESSION_ABOVE,
        TINY_BELOW,
        ZSTD_BELOW,
    };

    #[test]
    fn test_selection_policy() {
        // Already-compressed extensions beat every size rule.
        assert_eq!(select_algo("movie.mp4", 300 << 20), CompressionAlgo::None);
        assert_eq!(select_algo("tiny.png", 100), CompressionAlgo::None);
        assert_eq!(select_algo("HUGE.ZIP", 2 << 30), CompressionAlgo::None);
        // Size breakpoints for compressible names.
        assert_eq!(
            select_algo("big.bin", SKIP_COMPRESSION_ABOVE + 1),
            CompressionAlgo::None
        );
        assert_eq!(select_algo("big.bin", LZ4_ABOVE + 1), CompressionAlgo::Lz4);
        assert_eq!(select_algo("small.txt", TINY_BELOW - 1), CompressionAlgo::Lz4);
        assert_eq!(select_algo("data.log", ZSTD_BELOW - 1), CompressionAlgo::Zstd);
        assert_eq!(select_algo("data.log", ZSTD_BELOW + 1), CompressionAlgo::Lz4);
        // 150 MiB chunked upload lands on lz4.
        assert_eq!(select_algo("big.bin", 150 << 20), CompressionAlgo::Lz4);
    }

    #[test]
    fn test_algo_parse_roundtrip() -> anyhow::Result<()> {
        for algo in [
            CompressionAlgo::None,
            CompressionAlgo::Gzip,
            CompressionAlgo::Zstd,
            CompressionAlgo::Lz4,
        ] {
            assert_eq!(CompressionAlgo::parse(algo.as_str())?, algo);
        }
        assert!(CompressionAlgo::parse("brotli").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_buffer_roundtrip_all_algos() -> anyhow::Result<()> {
        let mut patterned = b"Hello, world! ".repeat(1000);
        let mut random = vec![0u8; 64 << 10];
        rand::rng().fill_bytes(&mut random);
        patterned.extend_from_slice(&random);
        let original = Bytes::from(patterned);

        for algo in [
            CompressionAlgo::None,
            CompressionAlgo::Gzip,
            CompressionAlgo::Zstd,
            CompressionAlgo::Lz4,
        ] {
            let compressed = compress(original.clone(), algo).await?;
            if algo == CompressionAlgo::None {
                assert_eq!(compressed, original);
            }
            let restored = decompress(compressed, algo).await?;
            assert_eq!(restored, original, "roundtrip failed for {algo}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_writer_then_reader_roundtrip() -> anyhow::Result<()> {
        let original = b"the quick brown fox".repeat(500);
        for algo in [CompressionAlgo::Gzip, CompressionAlgo::Zstd, CompressionAlgo::Lz4] {
            let mut compressed = Vec::new();
            {
                let mut w = wrap_writer(&mut compressed, algo);
                w.write_all(&original).await?;
                w.shutdown().await?;
            }
            assert_ne!(compressed, original);
            let mut r = wrap_reader(&compressed[..], algo);
            let mut restored = Vec::new();
            tokio::io::copy(&mut r, &mut restored).await?;
            assert_eq!(restored, original);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_zstd_actually_shrinks_text() -> anyhow::Result<()> {
        let original = Bytes::from("log line: something happened\n".repeat(10_000));
        let compressed = compress(original.clone(), CompressionAlgo::Zstd).await?;
        assert!(compressed.len() < original.len() / 10);
        Ok(())
    }
}
