use std::future::Future;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::pin::Pin;

use md5::{Digest, Md5};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::TransferError;

// ---------------------------------------------------------------------------
// Fingerprints
// ---------------------------------------------------------------------------

/// Computes MD5 of `data` and returns the hex-encoded digest.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Deterministic content digest used to recognise chunks that were already
/// accepted by the server in an earlier attempt.
pub trait Fingerprinter: Send + Sync {
    fn fingerprint(&self, data: &[u8]) -> String;
}

/// Hex MD5 fingerprints.
#[derive(Debug, Clone, Copy, Default)]
pub struct Md5Fingerprint;

impl Fingerprinter for Md5Fingerprint {
    fn fingerprint(&self, data: &[u8]) -> String {
        md5_hex(data)
    }
}

// ---------------------------------------------------------------------------
// ChunkSource
// ---------------------------------------------------------------------------

/// Random-access reader over the source file.
///
/// Implementations must return exactly `length` bytes or an error; partial
/// reads are never surfaced.
pub trait ChunkSource: Send + Sync {
    fn read_range(
        &self,
        offset: u64,
        length: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, TransferError>> + Send + '_>>;
}

/// Reads byte ranges from a file on disk.
#[derive(Debug, Clone)]
pub struct FileChunkSource {
    path: PathBuf,
}

impl FileChunkSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Current size of the file in bytes.
    pub async fn size(&self) -> Result<u64, TransferError> {
        Ok(tokio::fs::metadata(&self.path).await?.len())
    }
}

impl ChunkSource for FileChunkSource {
    fn read_range(
        &self,
        offset: u64,
        length: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, TransferError>> + Send + '_>> {
        Box::pin(async move {
            let mut file = tokio::fs::File::open(&self.path).await?;
            file.seek(SeekFrom::Start(offset)).await?;

            let mut buf = vec![0u8; length as usize];
            file.read_exact(&mut buf).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    TransferError::ShortRead {
                        offset,
                        expected: length,
                    }
                } else {
                    TransferError::Io(e)
                }
            })?;
            Ok(buf)
        })
    }
}
