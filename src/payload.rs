//! Payload sources accepted by ingestion
//!
//! Callers hand over bytes, a string or a reader. Strings are ambiguous:
//! anything that looks like base64 is decoded, everything else is opened as
//! a file path. Whatever comes in is resolved once into either a buffer or
//! a byte stream.

use crate::error::{Result, StorageError};
use base64::alphabet;
use base64::engine::{GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use bytes::Bytes;
use std::fmt;
use std::path::PathBuf;
use tokio::io::AsyncRead;

/// Standard alphabet, tolerating non-zero bits in the final quantum
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

/// Boxed reader used for streamed payloads
pub type PayloadReader = Box<dyn AsyncRead + Send + Unpin>;

pub enum Payload {
    /// In-memory bytes
    Bytes(Bytes),
    /// Base64 text or a filesystem path, decided by `looks_like_base64`
    Text(String),
    /// Explicit filesystem path
    Path(PathBuf),
    /// Any async byte stream
    Reader(PayloadReader),
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Bytes(b) => write!(f, "Payload::Bytes({} bytes)", b.len()),
            Payload::Text(t) => write!(f, "Payload::Text({} chars)", t.len()),
            Payload::Path(p) => write!(f, "Payload::Path({})", p.display()),
            Payload::Reader(_) => f.write_str("Payload::Reader"),
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(data))
    }
}

impl From<&[u8]> for Payload {
    fn from(data: &[u8]) -> Self {
        Payload::Bytes(Bytes::copy_from_slice(data))
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Payload::Bytes(data)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<PathBuf> for Payload {
    fn from(path: PathBuf) -> Self {
        Payload::Path(path)
    }
}

/// Canonical form after resolution
pub enum Source {
    Buffer(Bytes),
    Stream(PayloadReader),
}

impl Payload {
    /// Resolve into a buffer or a stream, opening files as needed
    pub async fn resolve(self) -> Result<Source> {
        match self {
            Payload::Bytes(data) => Ok(Source::Buffer(data)),
            Payload::Reader(reader) => Ok(Source::Stream(reader)),
            Payload::Path(path) => open_path(path).await,
            Payload::Text(text) => {
                if looks_like_base64(&text) {
                    let data = LENIENT_BASE64
                        .decode(text.as_bytes())
                        .map_err(|e| StorageError::MalformedInput(format!("base64: {}", e)))?;
                    Ok(Source::Buffer(Bytes::from(data)))
                } else {
                    open_path(PathBuf::from(text)).await
                }
            }
        }
    }
}

async fn open_path(path: PathBuf) -> Result<Source> {
    let file = tokio::fs::File::open(&path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::MalformedInput(format!("no such payload file: {}", path.display()))
        } else {
            StorageError::Io(e)
        }
    })?;
    Ok(Source::Stream(Box::new(file)))
}

fn is_base64_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'+' || c == b'/'
}

/// Pattern check for standard base64: length a multiple of 4, alphabet
/// characters only, and `=`/`==` padding at the very end.
///
/// This is a heuristic. A path such as `abcd/efgh` also matches and will be
/// decoded rather than opened; pass `Payload::Path` to avoid the guess.
pub fn looks_like_base64(text: &str) -> bool {
    let bytes = text.as_bytes();
    if bytes.len() % 4 != 0 {
        return false;
    }

    let padding = bytes.iter().rev().take_while(|b| **b == b'=').count();
    if padding > 2 {
        return false;
    }

    bytes[..bytes.len() - padding].iter().all(|b| is_base64_char(*b))
}
