//! Object handles
//!
//! The storage engine reads and writes through three small file interfaces:
//! [`SequentialFile`], [`RandomAccessFile`] and [`WritableFile`]. Cloud objects
//! are exposed through two concrete handles implementing them:
//!
//! - [`CloudReadableFile`] implements both read interfaces, so a caller picks
//!   the access pattern it needs from the same handle.
//! - [`CloudWritableFile`] stages appends in a local file and uploads it as one
//!   object on close.
//!
//! Handles are not synchronized; the owning file abstraction serializes access.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::env::WriterRegistration;
use crate::retry::{retry_transient, RetryPolicy};
use crate::{Error, Result};

/// Sequential reader consumed by the storage engine.
#[async_trait]
pub trait SequentialFile: Send {
    /// Read up to `n` bytes from the current position. Empty at end of file.
    async fn read(&mut self, n: usize) -> Result<Bytes>;

    /// Advance the current position by `n` bytes, clamped to the file size.
    async fn skip(&mut self, n: u64) -> Result<()>;
}

/// Positional reader consumed by the storage engine.
#[async_trait]
pub trait RandomAccessFile: Send + Sync {
    /// Read up to `n` bytes starting at `offset`. Empty at or after end of file.
    async fn read_at(&self, offset: u64, n: usize) -> Result<Bytes>;
}

/// Append-only writer consumed by the storage engine.
#[async_trait]
pub trait WritableFile: Send {
    async fn append(&mut self, data: &[u8]) -> Result<()>;

    async fn flush(&mut self) -> Result<()>;

    /// Flush and make the staged data durable locally.
    async fn sync(&mut self) -> Result<()>;

    /// Finish the file and publish it. Calling `close` twice is a no-op.
    async fn close(&mut self) -> Result<()>;

    fn file_size(&self) -> u64;
}

/// Transport-level settings chosen when a handle is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileOptions {
    /// Capacity of the local write buffer.
    pub buffer_size: usize,

    /// Minimum size of a ranged fetch issued by sequential reads.
    pub readahead_size: usize,

    /// Retry policy applied to transient read failures.
    pub retry: RetryPolicy,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
            readahead_size: 2 * 1024 * 1024,
            retry: RetryPolicy::default(),
        }
    }
}

/// The vendor calls a handle needs after it has been handed out.
///
/// Providers implement this on a cheap clone of themselves so handles never
/// borrow the provider.
#[async_trait]
pub trait ObjectTransport: Send + Sync {
    /// Read `len` bytes at `offset`; the range must lie inside the object.
    async fn read_range(&self, bucket: &str, path: &str, offset: u64, len: u64) -> Result<Bytes>;

    /// Upload a local file as one object.
    async fn upload(&self, local_path: &Path, bucket: &str, path: &str) -> Result<()>;
}

/// Readable handle over one cloud object.
pub struct CloudReadableFile {
    bucket: String,
    object_path: String,
    size: u64,
    position: u64,
    buffer: Bytes,
    buffer_offset: u64,
    options: FileOptions,
    transport: Arc<dyn ObjectTransport>,
}

impl CloudReadableFile {
    pub fn new(
        bucket: impl Into<String>,
        object_path: impl Into<String>,
        size: u64,
        options: FileOptions,
        transport: Arc<dyn ObjectTransport>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            object_path: object_path.into(),
            size,
            position: 0,
            buffer: Bytes::new(),
            buffer_offset: 0,
            options,
            transport,
        }
    }

    pub fn name(&self) -> &'static str {
        "cloud"
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    /// Object size captured when the handle was opened.
    pub fn size(&self) -> u64 {
        self.size
    }

    async fn fetch(&self, offset: u64, len: u64) -> Result<Bytes> {
        if offset >= self.size || len == 0 {
            return Ok(Bytes::new());
        }
        let len = len.min(self.size - offset);
        let transport = &self.transport;
        let bucket = self.bucket.as_str();
        let path = self.object_path.as_str();

        retry_transient(&self.options.retry, "read_range", || {
            transport.read_range(bucket, path, offset, len)
        })
        .await
    }

    fn buffered(&self, offset: u64, len: u64) -> bool {
        offset >= self.buffer_offset
            && offset + len <= self.buffer_offset + self.buffer.len() as u64
    }
}

#[async_trait]
impl SequentialFile for CloudReadableFile {
    async fn read(&mut self, n: usize) -> Result<Bytes> {
        if self.position >= self.size || n == 0 {
            return Ok(Bytes::new());
        }
        let wanted = (n as u64).min(self.size - self.position);

        if !self.buffered(self.position, wanted) {
            let fetch_len = wanted.max(self.options.readahead_size as u64);
            self.buffer = self.fetch(self.position, fetch_len).await?;
            self.buffer_offset = self.position;
        }

        let start = (self.position - self.buffer_offset) as usize;
        let end = (start + wanted as usize).min(self.buffer.len());
        let data = self.buffer.slice(start..end);
        self.position += data.len() as u64;
        Ok(data)
    }

    async fn skip(&mut self, n: u64) -> Result<()> {
        self.position = self.position.saturating_add(n).min(self.size);
        Ok(())
    }
}

#[async_trait]
impl RandomAccessFile for CloudReadableFile {
    async fn read_at(&self, offset: u64, n: usize) -> Result<Bytes> {
        self.fetch(offset, n as u64).await
    }
}

/// Append-only handle that publishes a cloud object on close.
pub struct CloudWritableFile {
    local_path: PathBuf,
    bucket: String,
    object_path: String,
    writer: Option<BufWriter<fs::File>>,
    size: u64,
    last_error: Option<Error>,
    closed: bool,
    transport: Arc<dyn ObjectTransport>,
    registration: Option<WriterRegistration>,
}

impl CloudWritableFile {
    /// Create the local staging file (and its parent directories).
    pub async fn create(
        local_path: &Path,
        bucket: impl Into<String>,
        object_path: impl Into<String>,
        options: FileOptions,
        transport: Arc<dyn ObjectTransport>,
    ) -> Result<Self> {
        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::File::create(local_path).await?;

        Ok(Self {
            local_path: local_path.to_path_buf(),
            bucket: bucket.into(),
            object_path: object_path.into(),
            writer: Some(BufWriter::with_capacity(options.buffer_size.max(1), file)),
            size: 0,
            last_error: None,
            closed: false,
            transport,
            registration: None,
        })
    }

    pub(crate) fn with_registration(mut self, registration: WriterRegistration) -> Self {
        self.registration = Some(registration);
        self
    }

    pub fn name(&self) -> &'static str {
        "cloud"
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    /// Outcome of the last operation. Polling never fails the handle further.
    pub fn status(&self) -> std::result::Result<(), &Error> {
        match &self.last_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn check_usable(&self) -> Result<()> {
        if let Some(err) = &self.last_error {
            return Err(Error::invalid_state(format!(
                "writable file {} failed earlier: {}",
                self.object_path, err
            )));
        }
        if self.closed {
            return Err(Error::invalid_state(format!(
                "writable file {} is closed",
                self.object_path
            )));
        }
        Ok(())
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.last_error = Some(err.clone());
        }
        result
    }

    fn writer(&mut self) -> Result<&mut BufWriter<fs::File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| Error::invalid_state("writable file has no open writer"))
    }

    async fn publish(&mut self) -> Result<()> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| Error::invalid_state("writable file has no open writer"))?;
        writer.flush().await?;
        writer.get_mut().sync_all().await?;
        drop(writer);

        // Uploads and purge deletions are mutually exclusive.
        let _permit = match &self.registration {
            Some(registration) => Some(registration.upload_permit().await),
            None => None,
        };

        tracing::debug!(
            "Uploading {} ({} bytes) to {}/{}",
            self.local_path.display(),
            self.size,
            self.bucket,
            self.object_path
        );
        self.transport
            .upload(&self.local_path, &self.bucket, &self.object_path)
            .await
    }
}

#[async_trait]
impl WritableFile for CloudWritableFile {
    async fn append(&mut self, data: &[u8]) -> Result<()> {
        self.check_usable()?;
        let result = match self.writer() {
            Ok(writer) => writer.write_all(data).await.map_err(Error::from),
            Err(e) => Err(e),
        };
        let result = self.record(result);
        if result.is_ok() {
            self.size += data.len() as u64;
        }
        result
    }

    async fn flush(&mut self) -> Result<()> {
        self.check_usable()?;
        let result = match self.writer() {
            Ok(writer) => writer.flush().await.map_err(Error::from),
            Err(e) => Err(e),
        };
        self.record(result)
    }

    async fn sync(&mut self) -> Result<()> {
        self.check_usable()?;
        let result = match self.writer() {
            Ok(writer) => match writer.flush().await {
                Ok(()) => writer.get_mut().sync_all().await.map_err(Error::from),
                Err(e) => Err(e.into()),
            },
            Err(e) => Err(e),
        };
        self.record(result)
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.check_usable()?;
        let result = self.publish().await;
        let result = self.record(result);
        self.closed = true;
        // Closing ends the writer's claim on the object name.
        self.registration = None;
        result
    }

    fn file_size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Transport over a single in-memory object that can fail a few reads.
    #[derive(Default)]
    struct FakeTransport {
        data: Mutex<HashMap<String, Bytes>>,
        failures: AtomicU32,
        reads: AtomicU32,
    }

    #[async_trait]
    impl ObjectTransport for FakeTransport {
        async fn read_range(&self, _bucket: &str, path: &str, offset: u64, len: u64) -> Result<Bytes> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::io("injected"));
            }
            let data = self.data.lock().unwrap();
            let object = data.get(path).ok_or_else(|| Error::not_found(path))?;
            Ok(object.slice(offset as usize..(offset + len) as usize))
        }

        async fn upload(&self, local_path: &Path, _bucket: &str, path: &str) -> Result<()> {
            let bytes = fs::read(local_path).await?;
            self.data
                .lock()
                .unwrap()
                .insert(path.to_string(), Bytes::from(bytes));
            Ok(())
        }
    }

    fn transport_with(path: &str, content: &'static [u8]) -> Arc<FakeTransport> {
        let transport = FakeTransport::default();
        transport
            .data
            .lock()
            .unwrap()
            .insert(path.to_string(), Bytes::from_static(content));
        Arc::new(transport)
    }

    fn small_options() -> FileOptions {
        FileOptions {
            buffer_size: 4,
            readahead_size: 4,
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 1,
            },
        }
    }

    #[tokio::test]
    async fn test_sequential_read_uses_readahead() {
        let transport = transport_with("obj", b"0123456789");
        let mut file =
            CloudReadableFile::new("b", "obj", 10, small_options(), transport.clone());

        assert_eq!(file.read(2).await.unwrap(), Bytes::from_static(b"01"));
        assert_eq!(file.read(2).await.unwrap(), Bytes::from_static(b"23"));
        // Both reads were served by one 4-byte fetch.
        assert_eq!(transport.reads.load(Ordering::SeqCst), 1);

        file.skip(3).await.unwrap();
        assert_eq!(file.read(10).await.unwrap(), Bytes::from_static(b"789"));
        assert!(file.read(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_random_access_read_clamps_to_size() {
        let transport = transport_with("obj", b"0123456789");
        let file = CloudReadableFile::new("b", "obj", 10, small_options(), transport);

        assert_eq!(file.read_at(8, 5).await.unwrap(), Bytes::from_static(b"89"));
        assert!(file.read_at(10, 5).await.unwrap().is_empty());
        assert_eq!(file.name(), "cloud");
    }

    #[tokio::test]
    async fn test_read_retries_transient_failures() {
        let transport = transport_with("obj", b"abc");
        transport.failures.store(2, Ordering::SeqCst);
        let file = CloudReadableFile::new("b", "obj", 3, small_options(), transport.clone());

        assert_eq!(file.read_at(0, 3).await.unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(transport.reads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_writable_file_uploads_on_close() {
        let temp_dir = TempDir::new().unwrap();
        let local = temp_dir.path().join("nested/000001.log");
        let transport = Arc::new(FakeTransport::default());

        let mut file =
            CloudWritableFile::create(&local, "b", "db/000001.log", small_options(), transport.clone())
                .await
                .unwrap();
        file.append(b"hello ").await.unwrap();
        file.append(b"world").await.unwrap();
        file.sync().await.unwrap();
        assert_eq!(file.file_size(), 11);
        assert!(transport.data.lock().unwrap().is_empty());

        file.close().await.unwrap();
        assert!(file.status().is_ok());
        assert_eq!(
            transport.data.lock().unwrap().get("db/000001.log").unwrap(),
            &Bytes::from_static(b"hello world")
        );

        // Closed handles reject writes but a second close is harmless.
        assert!(matches!(
            file.append(b"x").await,
            Err(Error::InvalidState(_))
        ));
        file.close().await.unwrap();
    }
}
