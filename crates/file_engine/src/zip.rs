//! ZIP archive browsing: list the entries of a stored archive and pull a
//! single entry out for preview. Entry names that are not UTF-8 get the
//! legacy Japanese-encoding treatment; see `decode_entry_name`.

use async_zip::tokio::read::seek::ZipFileReader;
use bytes::Bytes;
use compression::CompressionAlgo;
use errors::ErrorMetadata;
use futures::AsyncReadExt as _;
use metadata::FileDescriptor;
use serde::Serialize;
use tokio::io::BufReader;

use crate::FileEngine;

/// Cap on a single extracted entry; previews are for looking, not exporting.
const MAX_ENTRY_PREVIEW_BYTES: u64 = 100 << 20;

#[derive(Clone, Debug, Serialize)]
pub struct ZipEntryInfo {
    pub name: String,
    pub size: u64,
    pub compressed_size: u64,
    pub is_dir: bool,
}

impl FileEngine {
    pub async fn list_zip_entries(
        &self,
        descriptor: &FileDescriptor,
    ) -> anyhow::Result<Vec<ZipEntryInfo>> {
        let zip = self.open_zip(descriptor).await?;
        Ok(zip.file().entries().iter().map(entry_info).collect())
    }

    /// Read one entry, located by its decoded name.
    pub async fn read_zip_entry(
        &self,
        descriptor: &FileDescriptor,
        entry_name: &str,
    ) -> anyhow::Result<(ZipEntryInfo, Bytes)> {
        let mut zip = self.open_zip(descriptor).await?;
        let (index, info) = zip
            .file()
            .entries()
            .iter()
            .enumerate()
            .map(|(i, e)| (i, entry_info(e)))
            .find(|(_, info)| !info.is_dir && info.name == entry_name)
            .ok_or_else(|| {
                anyhow::Error::from(ErrorMetadata::not_found(
                    "ZipEntryNotFound",
                    format!("archive has no entry named {entry_name:?}"),
                ))
            })?;
        anyhow::ensure!(
            info.size <= MAX_ENTRY_PREVIEW_BYTES,
            ErrorMetadata::too_large(
                "ZipEntryTooLarge",
                format!("entry of {} bytes is too large to preview", info.size),
            )
        );
        let mut entry_reader = zip.reader_with_entry(index).await?;
        let mut buf = Vec::with_capacity(info.size as usize);
        entry_reader.read_to_end(&mut buf).await?;
        Ok((info, buf.into()))
    }

    async fn open_zip(
        &self,
        descriptor: &FileDescriptor,
    ) -> anyhow::Result<ZipFileReader<BufReader<blob_store::BlobReader>>> {
        if descriptor.mime_type != "application/zip" {
            anyhow::bail!(ErrorMetadata::bad_request(
                "NotAZip",
                format!("{} is not a ZIP archive", descriptor.filename),
            ));
        }
        // The selection policy never compresses .zip; anything else here is
        // an internal inconsistency.
        anyhow::ensure!(
            descriptor.compression == CompressionAlgo::None,
            "zip blob {} is unexpectedly compressed",
            descriptor.id
        );
        let reader = BufReader::new(self.blobs.open(&descriptor.blob).await?);
        ZipFileReader::with_tokio(reader).await.map_err(|e| {
            anyhow::Error::from(ErrorMetadata::bad_request(
                "NotAZip",
                format!("archive cannot be read: {e}"),
            ))
        })
    }
}

fn entry_info(entry: &async_zip::StoredZipEntry) -> ZipEntryInfo {
    let raw = entry.filename().as_bytes();
    ZipEntryInfo {
        name: decode_entry_name(raw),
        size: entry.uncompressed_size(),
        compressed_size: entry.compressed_size(),
        is_dir: raw.ends_with(b"/"),
    }
}

/// Decode a ZIP entry name. UTF-8 wins; otherwise Shift_JIS, EUC-JP and
/// ISO-2022-JP are tried in that order, and the first decoding that is clean
/// and actually contains Japanese-script characters is taken. The heuristic
/// is deliberately narrow: archives produced by legacy Windows tools in
/// Japan are the overwhelming real-world source of non-UTF-8 names.
pub fn decode_entry_name(raw: &[u8]) -> String {
    if let Ok(name) = std::str::from_utf8(raw) {
        return name.to_string();
    }
    for encoding in [
        encoding_rs::SHIFT_JIS,
        encoding_rs::EUC_JP,
        encoding_rs::ISO_2022_JP,
    ] {
        let (decoded, _, had_errors) = encoding.decode(raw);
        if !had_errors && contains_japanese(&decoded) {
            return decoded.into_owned();
        }
    }
    String::from_utf8_lossy(raw).into_owned()
}

fn contains_japanese(s: &str) -> bool {
    s.chars().any(|c| {
        matches!(c,
            '\u{3040}'..='\u{309F}'   // hiragana
            | '\u{30A0}'..='\u{30FF}' // katakana
            | '\u{4E00}'..='\u{9FFF}' // kanji
            | '\u{FF66}'..='\u{FF9D}' // halfwidth katakana
        )
    })
}
