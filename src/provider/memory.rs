//! In-memory storage provider
//!
//! Keeps buckets in process memory. Objects are replaced as a whole, so a
//! concurrent listing sees either the old object or the complete new one.
//! Used for tests and for running an environment without a vendor account.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::fs;

use super::{
    temp_download_path, CloudStorageProvider, ObjectInfo, ProviderOptions, RequestOp,
    PROVIDER_MEMORY,
};
use crate::file::{CloudReadableFile, CloudWritableFile, FileOptions, ObjectTransport};
use crate::path::list_prefix;
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    modified: DateTime<Utc>,
    metadata: HashMap<String, String>,
}

impl StoredObject {
    fn new(data: Bytes, metadata: HashMap<String, String>) -> Self {
        Self {
            data,
            modified: Utc::now(),
            metadata,
        }
    }

    fn info(&self) -> ObjectInfo {
        ObjectInfo {
            size: self.data.len() as u64,
            modification_time: self.modified,
            content_hash: format!("{:08x}", crc32fast::hash(&self.data)),
            metadata: self.metadata.clone(),
        }
    }
}

type Buckets = HashMap<String, BTreeMap<String, StoredObject>>;

/// In-memory provider. Cloning shares the underlying buckets.
#[derive(Clone)]
pub struct MemoryProvider {
    options: Arc<ProviderOptions>,
    buckets: Arc<RwLock<Buckets>>,
    failures: Arc<Mutex<HashMap<RequestOp, u32>>>,
}

impl MemoryProvider {
    pub fn new(options: ProviderOptions) -> Self {
        Self {
            options: Arc::new(options),
            buckets: Arc::new(RwLock::new(HashMap::new())),
            failures: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Make the next `count` calls of kind `op` fail with a transient `Io`
    /// error. Lets tests exercise failure handling without a network.
    pub fn fail_next(&self, op: RequestOp, count: u32) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(op, count);
        }
    }

    fn check_failure(&self, op: RequestOp) -> Result<()> {
        let mut failures = self
            .failures
            .lock()
            .map_err(|_| Error::internal("memory provider failure table poisoned"))?;
        if let Some(remaining) = failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::io(format!("injected {:?} failure", op)));
            }
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Buckets>> {
        self.buckets
            .read()
            .map_err(|_| Error::internal("memory provider lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Buckets>> {
        self.buckets
            .write()
            .map_err(|_| Error::internal("memory provider lock poisoned"))
    }

    fn finish<T>(&self, op: RequestOp, started: Instant, bytes: u64, result: Result<T>) -> Result<T> {
        self.options
            .record_request(op, started, bytes, result.is_ok());
        result
    }

    fn lookup(buckets: &Buckets, bucket: &str, path: &str) -> Result<StoredObject> {
        buckets
            .get(bucket)
            .ok_or_else(|| Error::not_found(format!("bucket {}", bucket)))?
            .get(path)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("{}/{}", bucket, path)))
    }

    fn insert(&self, bucket: &str, path: &str, object: StoredObject) -> Result<()> {
        let mut buckets = self.write()?;
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| Error::not_found(format!("bucket {}", bucket)))?;
        objects.insert(path.to_string(), object);
        Ok(())
    }

    fn read_range_sync(&self, bucket: &str, path: &str, offset: u64, len: u64) -> Result<Bytes> {
        self.check_failure(RequestOp::Read)?;
        let object = Self::lookup(&*self.read()?, bucket, path)?;
        let size = object.data.len() as u64;
        if offset > size || offset + len > size {
            return Err(Error::io(format!(
                "range {}..{} outside {}/{} ({} bytes)",
                offset,
                offset + len,
                bucket,
                path,
                size
            )));
        }
        Ok(object.data.slice(offset as usize..(offset + len) as usize))
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new(ProviderOptions::default())
    }
}

#[async_trait]
impl CloudStorageProvider for MemoryProvider {
    fn name(&self) -> &'static str {
        PROVIDER_MEMORY
    }

    fn options(&self) -> &ProviderOptions {
        &self.options
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        let started = Instant::now();
        let result = self.check_failure(RequestOp::Create).and_then(|_| {
            self.write()?.entry(bucket.to_string()).or_default();
            Ok(())
        });
        self.finish(RequestOp::Create, started, 0, result)
    }

    async fn exists_bucket(&self, bucket: &str) -> Result<()> {
        let started = Instant::now();
        let result = self.check_failure(RequestOp::Info).and_then(|_| {
            if self.read()?.contains_key(bucket) {
                Ok(())
            } else {
                Err(Error::not_found(format!("bucket {}", bucket)))
            }
        });
        self.finish(RequestOp::Info, started, 0, result)
    }

    async fn empty_bucket(&self, bucket: &str, path_prefix: &str) -> Result<()> {
        let started = Instant::now();
        let prefix = list_prefix(path_prefix);
        let result = self.check_failure(RequestOp::Delete).and_then(|_| {
            let mut buckets = self.write()?;
            let objects = buckets
                .get_mut(bucket)
                .ok_or_else(|| Error::not_found(format!("bucket {}", bucket)))?;
            objects.retain(|key, _| !key.starts_with(&prefix));
            Ok(())
        });
        self.finish(RequestOp::Delete, started, 0, result)
    }

    async fn delete_cloud_object(&self, bucket: &str, path: &str) -> Result<()> {
        let started = Instant::now();
        let result = self.check_failure(RequestOp::Delete).and_then(|_| {
            let mut buckets = self.write()?;
            buckets
                .get_mut(bucket)
                .ok_or_else(|| Error::not_found(format!("bucket {}", bucket)))?
                .remove(path)
                .map(|_| ())
                .ok_or_else(|| Error::not_found(format!("{}/{}", bucket, path)))
        });
        self.finish(RequestOp::Delete, started, 0, result)
    }

    async fn list_cloud_objects(&self, bucket: &str, path_prefix: &str) -> Result<Vec<String>> {
        let started = Instant::now();
        let prefix = list_prefix(path_prefix);
        let result = self.check_failure(RequestOp::List).and_then(|_| {
            let buckets = self.read()?;
            let objects = buckets
                .get(bucket)
                .ok_or_else(|| Error::not_found(format!("bucket {}", bucket)))?;
            Ok(objects
                .range(prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(&prefix))
                .map(|(key, _)| key[prefix.len()..].to_string())
                .filter(|name| !name.is_empty())
                .collect())
        });
        self.finish(RequestOp::List, started, 0, result)
    }

    async fn get_cloud_object_metadata(&self, bucket: &str, path: &str) -> Result<ObjectInfo> {
        let started = Instant::now();
        let result = self
            .check_failure(RequestOp::Info)
            .and_then(|_| Ok(Self::lookup(&*self.read()?, bucket, path)?.info()));
        self.finish(RequestOp::Info, started, 0, result)
    }

    async fn copy_cloud_object(
        &self,
        src_bucket: &str,
        src_path: &str,
        dst_bucket: &str,
        dst_path: &str,
    ) -> Result<()> {
        let started = Instant::now();
        let result = self.check_failure(RequestOp::Copy).and_then(|_| {
            let source = Self::lookup(&*self.read()?, src_bucket, src_path)?;
            let size = source.data.len() as u64;
            self.insert(
                dst_bucket,
                dst_path,
                StoredObject::new(source.data, source.metadata),
            )?;
            Ok(size)
        });
        let bytes = *result.as_ref().unwrap_or(&0);
        self.finish(RequestOp::Copy, started, bytes, result.map(|_| ()))
    }

    async fn get_cloud_object(&self, bucket: &str, path: &str, local_path: &Path) -> Result<()> {
        let started = Instant::now();
        let fetched = self
            .check_failure(RequestOp::Read)
            .and_then(|_| Ok(Self::lookup(&*self.read()?, bucket, path)?.data));
        let data = match fetched {
            Ok(data) => data,
            Err(e) => return self.finish(RequestOp::Read, started, 0, Err(e)),
        };
        let bytes = data.len() as u64;
        let result = write_local(local_path, &data).await;
        self.finish(RequestOp::Read, started, bytes, result)
    }

    async fn put_cloud_object(&self, local_path: &Path, bucket: &str, path: &str) -> Result<()> {
        let started = Instant::now();
        let result = match self.check_failure(RequestOp::Write) {
            Ok(()) => match fs::read(local_path).await {
                Ok(data) => {
                    let len = data.len() as u64;
                    self.insert(bucket, path, StoredObject::new(Bytes::from(data), HashMap::new()))
                        .map(|_| len)
                }
                Err(e) => Err(e.into()),
            },
            Err(e) => Err(e),
        };
        let bytes = *result.as_ref().unwrap_or(&0);
        self.finish(RequestOp::Write, started, bytes, result.map(|_| ()))
    }

    async fn put_cloud_object_metadata(
        &self,
        bucket: &str,
        path: &str,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        let started = Instant::now();
        let result = self.check_failure(RequestOp::Write).and_then(|_| {
            let mut buckets = self.write()?;
            let object = buckets
                .get_mut(bucket)
                .ok_or_else(|| Error::not_found(format!("bucket {}", bucket)))?
                .get_mut(path)
                .ok_or_else(|| Error::not_found(format!("{}/{}", bucket, path)))?;
            object.metadata = metadata;
            object.modified = Utc::now();
            Ok(())
        });
        self.finish(RequestOp::Write, started, 0, result)
    }

    async fn new_cloud_writable_file(
        &self,
        local_path: &Path,
        bucket: &str,
        path: &str,
        options: FileOptions,
    ) -> Result<CloudWritableFile> {
        CloudWritableFile::create(local_path, bucket, path, options, Arc::new(self.clone())).await
    }

    async fn new_cloud_readable_file(
        &self,
        bucket: &str,
        path: &str,
        options: FileOptions,
    ) -> Result<CloudReadableFile> {
        let size = self.get_cloud_object_size(bucket, path).await?;
        Ok(CloudReadableFile::new(
            bucket,
            path,
            size,
            options,
            Arc::new(self.clone()),
        ))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
impl ObjectTransport for MemoryProvider {
    async fn read_range(&self, bucket: &str, path: &str, offset: u64, len: u64) -> Result<Bytes> {
        let started = Instant::now();
        let result = self.read_range_sync(bucket, path, offset, len);
        let bytes = result.as_ref().map(|b| b.len() as u64).unwrap_or(0);
        self.finish(RequestOp::Read, started, bytes, result)
    }

    async fn upload(&self, local_path: &Path, bucket: &str, path: &str) -> Result<()> {
        self.put_cloud_object(local_path, bucket, path).await
    }
}

/// Write `data` to a temporary sibling of `local_path`, then rename it into
/// place so readers never see a partial download.
async fn write_local(local_path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = local_path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = temp_download_path(local_path);
    if let Err(e) = fs::write(&tmp, data).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    fs::rename(&tmp, local_path).await?;
    Ok(())
}
