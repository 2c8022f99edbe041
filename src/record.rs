//! Record file codec
//!
//! A record file is a fixed 2048-byte header region followed directly by
//! the payload:
//!
//! ```text
//! ┌──────────────────────────────────────┬─────────────────────┐
//! │ header JSON + trailing spaces (2048) │ payload bytes ...   │
//! └──────────────────────────────────────┴─────────────────────┘
//! ```

use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, Take};

/// Size of the header region at the start of every record file
pub const HEADER_SIZE: usize = 2048;

/// Extension of finalized records
pub const DATA_EXTENSION: &str = "data";

/// Extension of records still being ingested
pub const TEMP_EXTENSION: &str = "tmp";

/// Payload reader handed out by retrieval
pub type PayloadStream = Take<File>;

/// Record metadata stored in the header region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// Original filename
    pub name: String,
    /// MIME type derived from the name
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    /// Payload length in bytes
    #[serde(default)]
    pub length: u64,
    /// Caller-supplied metadata, opaque to the engine
    #[serde(default)]
    pub custom: serde_json::Value,
    /// Creation/modification time (ms since epoch)
    #[serde(default)]
    pub stamp: i64,
}

impl Header {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            width: 0,
            height: 0,
            length: 0,
            custom: serde_json::Value::Null,
            stamp: 0,
        }
    }
}

/// Serialize a header into a space-padded region of exactly `HEADER_SIZE` bytes
pub fn encode_header(header: &Header) -> Result<Vec<u8>> {
    let mut region = serde_json::to_vec(header)?;
    if region.len() > HEADER_SIZE {
        return Err(StorageError::HeaderTooLarge {
            size: region.len(),
            limit: HEADER_SIZE,
        });
    }
    region.resize(HEADER_SIZE, b' ');
    Ok(region)
}

/// Parse a header region, ignoring the padding
pub fn decode_header(region: &[u8]) -> Result<Header> {
    let end = region
        .iter()
        .rposition(|b| !b.is_ascii_whitespace() && *b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);

    serde_json::from_slice(&region[..end])
        .map_err(|e| StorageError::CorruptHeader(e.to_string()))
}

/// Read and decode the header region of record `id` stored at `path`
pub async fn read_header(path: &Path, id: u64) -> Result<Header> {
    let mut file = File::open(path)
        .await
        .map_err(|e| StorageError::from_record_io(e, id))?;

    let mut region = vec![0u8; HEADER_SIZE];
    if let Err(e) = file.read_exact(&mut region).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(StorageError::CorruptHeader(format!(
                "record {} is shorter than its header region",
                id
            )));
        }
        return Err(StorageError::Io(e));
    }
    decode_header(&region)
}

/// Overwrite the header region of an open record file
pub async fn write_header(file: &mut File, header: &Header) -> Result<()> {
    let region = encode_header(header)?;
    file.seek(SeekFrom::Start(0)).await?;
    file.write_all(&region).await?;
    Ok(())
}

/// Open the payload of record `id`, positioned at `start` and limited to `len` bytes
pub async fn open_payload(path: &Path, id: u64, start: u64, len: u64) -> Result<PayloadStream> {
    let mut file = File::open(path)
        .await
        .map_err(|e| StorageError::from_record_io(e, id))?;
    file.seek(SeekFrom::Start(HEADER_SIZE as u64 + start)).await?;
    Ok(file.take(len))
}
