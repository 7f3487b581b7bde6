//! File content access with byte-range reads

use crate::error::{FcResult, FileChunkError};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader};

/// Buffer size for range reads (64KB)
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A file-like input the engine can slice into chunks.
///
/// Implementations expose declared metadata plus random-access range reads;
/// the engine never assumes the whole content fits in memory.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Declared file name, path separators included as given
    fn name(&self) -> &str;

    /// Total size in bytes
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Declared MIME type, if the host knows one
    fn mime_hint(&self) -> Option<&str>;

    /// Last-modified tick (Unix seconds), if known
    fn last_modified(&self) -> Option<i64>;

    /// Read exactly `len` bytes starting at `offset`.
    ///
    /// A read past the declared size fails with `IO`.
    async fn read_range(&self, offset: u64, len: u64) -> FcResult<Bytes>;
}

/// Content source backed by a local file
pub struct FileSource {
    path: PathBuf,
    name: String,
    size: u64,
    mime_hint: Option<String>,
    last_modified: Option<i64>,
}

impl FileSource {
    /// Open a file and capture its metadata.
    pub async fn open(path: impl AsRef<Path>) -> FcResult<Self> {
        let path = path.as_ref().to_path_buf();
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| FileChunkError::io(format!("stat {}: {e}", path.display())))?;
        if !meta.is_file() {
            return Err(FileChunkError::input(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let last_modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64);

        Ok(Self {
            path,
            name,
            size: meta.len(),
            mime_hint: None,
            last_modified,
        })
    }

    /// Override the declared MIME type
    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime_hint = Some(mime.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ContentSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> u64 {
        self.size
    }

    fn mime_hint(&self) -> Option<&str> {
        self.mime_hint.as_deref()
    }

    fn last_modified(&self) -> Option<i64> {
        self.last_modified
    }

    async fn read_range(&self, offset: u64, len: u64) -> FcResult<Bytes> {
        if offset + len > self.size {
            return Err(FileChunkError::io(format!(
                "range {}..{} exceeds file size {}",
                offset,
                offset + len,
                self.size
            )));
        }

        let file = File::open(&self.path)
            .await
            .map_err(|e| FileChunkError::io(format!("open {}: {e}", self.path.display())))?;
        let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);
        reader
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| FileChunkError::io(format!("seek: {e}")))?;

        let mut buf = vec![0u8; len as usize];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|e| FileChunkError::io(format!("read {} bytes at {offset}: {e}", len)))?;
        Ok(Bytes::from(buf))
    }
}

/// In-memory content source, used in tests and for small generated payloads
#[derive(Clone)]
pub struct BytesSource {
    name: String,
    data: Bytes,
    mime_hint: Option<String>,
    last_modified: Option<i64>,
}

impl BytesSource {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            mime_hint: None,
            last_modified: None,
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime_hint = Some(mime.into());
        self
    }
}

#[async_trait]
impl ContentSource for BytesSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn mime_hint(&self) -> Option<&str> {
        self.mime_hint.as_deref()
    }

    fn last_modified(&self) -> Option<i64> {
        self.last_modified
    }

    async fn read_range(&self, offset: u64, len: u64) -> FcResult<Bytes> {
        let end = offset + len;
        if end > self.data.len() as u64 {
            return Err(FileChunkError::io(format!(
                "range {offset}..{end} exceeds buffer size {}",
                self.data.len()
            )));
        }
        Ok(self.data.slice(offset as usize..end as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bytes_source_range_reads() {
        let source = BytesSource::new("sample.bin", vec![0u8, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(source.len(), 8);
        let middle = source.read_range(2, 3).await.unwrap();
        assert_eq!(&middle[..], &[2, 3, 4]);
        assert!(source.read_range(6, 4).await.is_err());
    }

    #[tokio::test]
    async fn file_source_reads_exact_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        tokio::fs::write(&path, (0u8..=255).collect::<Vec<u8>>())
            .await
            .unwrap();

        let source = FileSource::open(&path).await.unwrap();
        assert_eq!(source.len(), 256);
        assert_eq!(source.name(), "payload.bin");

        let tail = source.read_range(250, 6).await.unwrap();
        assert_eq!(&tail[..], &[250, 251, 252, 253, 254, 255]);
        assert!(source.read_range(250, 7).await.is_err());
    }
}
