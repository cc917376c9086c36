//! Storage provider abstraction
//!
//! A [`CloudStorageProvider`] exposes bucket and object operations against one
//! object-store vendor. Providers are created by name through the
//! [`ProviderRegistry`] and configured with [`ProviderOptions`].
//!
//! Every operation reports failures through [`crate::Error`]:
//! - `NotFound` / `NotSupported` are recoverable by the caller
//! - `Io` is transient and may be retried by the caller
//! - `InvalidConfiguration` is fatal
//!
//! Providers never retry on their own.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::env::CloudEnvOptions;
use crate::file::{CloudReadableFile, CloudWritableFile, FileOptions};
use crate::{Error, Result};

pub mod memory;
pub mod registry;
#[cfg(feature = "aws")]
pub mod s3;

pub use crate::retry::RetryPolicy;
pub use registry::{create_provider, ProviderFactory, ProviderRegistry, PROVIDER_MEMORY, PROVIDER_S3};

/// Key under which [`CloudStorageProvider::get_options`] returns the
/// provider's own [`ProviderOptions`].
pub const PROVIDER_OPTIONS_KEY: &str = "provider";

/// Kind of vendor call reported to the request callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestOp {
    Read,
    Write,
    List,
    Create,
    Delete,
    Copy,
    Info,
}

/// One completed vendor call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEvent {
    pub op: RequestOp,
    /// Payload bytes moved by the call (0 for metadata-only calls).
    pub bytes: u64,
    pub latency: Duration,
    pub success: bool,
}

/// Instrumentation hook, called after every vendor call from any task.
pub type RequestCallback = Arc<dyn Fn(&RequestEvent) + Send + Sync>;

/// Snapshot of an object's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectInfo {
    pub size: u64,
    pub modification_time: DateTime<Utc>,
    /// Vendor-defined content hash (the ETag for S3).
    pub content_hash: String,
    pub metadata: HashMap<String, String>,
}

/// Static credentials. Empty means "use the vendor's default chain".
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub access_key_id: Option<String>,
    pub secret_key: Option<String>,
    pub session_token: Option<String>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key_id: Some(access_key_id.into()),
            secret_key: Some(secret_key.into()),
            session_token: None,
        }
    }

    /// True when both halves of a static key pair are present.
    pub fn has_static_keys(&self) -> bool {
        matches!(
            (&self.access_key_id, &self.secret_key),
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty()
        )
    }

    /// Validate that credentials are either fully set or fully absent.
    pub fn validate(&self) -> Result<()> {
        let has_id = self.access_key_id.as_deref().is_some_and(|s| !s.is_empty());
        let has_secret = self.secret_key.as_deref().is_some_and(|s| !s.is_empty());
        if has_id != has_secret {
            return Err(Error::invalid_config(
                "credentials need both access_key_id and secret_key",
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Vendor-independent options shared by all providers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudOptions {
    pub credentials: Credentials,

    /// Retry policy handed to the vendor transport.
    pub retry: RetryPolicy,

    /// Endpoint override for S3-compatible stores (uses path-style addressing).
    pub endpoint: Option<String>,

    /// Create the destination bucket during `prepare` when it does not exist.
    pub create_bucket_if_missing: bool,
}

impl Default for CloudOptions {
    fn default() -> Self {
        Self {
            credentials: Credentials::default(),
            retry: RetryPolicy::default(),
            endpoint: None,
            create_bucket_if_missing: true,
        }
    }
}

/// Provider configuration. Immutable once a provider has been built from it.
#[derive(Clone)]
pub struct ProviderOptions {
    pub cloud: CloudOptions,

    /// Request timeout in milliseconds; 0 uses the vendor default.
    pub request_timeout_ms: u64,

    /// Connect timeout in milliseconds; 0 uses the vendor default.
    pub connect_timeout_ms: u64,

    /// Enable server-side encryption (KMS when `encryption_key_id` is set).
    pub server_side_encryption: bool,

    pub encryption_key_id: Option<String>,

    pub request_callback: Option<RequestCallback>,

    extensions: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            cloud: CloudOptions::default(),
            request_timeout_ms: 600_000,
            connect_timeout_ms: 30_000,
            server_side_encryption: false,
            encryption_key_id: None,
            request_callback: None,
            extensions: HashMap::new(),
        }
    }
}

impl fmt::Debug for ProviderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut extensions: Vec<&String> = self.extensions.keys().collect();
        extensions.sort();
        f.debug_struct("ProviderOptions")
            .field("cloud", &self.cloud)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("server_side_encryption", &self.server_side_encryption)
            .field("encryption_key_id", &self.encryption_key_id)
            .field("request_callback", &self.request_callback.is_some())
            .field("extensions", &extensions)
            .finish()
    }
}

impl ProviderOptions {
    pub fn with_request_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&RequestEvent) + Send + Sync + 'static,
    {
        self.request_callback = Some(Arc::new(callback));
        self
    }

    /// Attach a typed value retrievable through
    /// [`CloudStorageProvider::get_options`] under `name`.
    pub fn with_extension<T>(mut self, name: impl Into<String>, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        self.extensions.insert(name.into(), Arc::new(value));
        self
    }

    pub fn extension(&self, name: &str) -> Option<&(dyn Any + Send + Sync)> {
        self.extensions.get(name).map(|value| value.as_ref())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }

    /// Report a finished vendor call to the request callback, if any.
    pub fn record_request(&self, op: RequestOp, started: Instant, bytes: u64, success: bool) {
        if let Some(callback) = &self.request_callback {
            callback(&RequestEvent {
                op,
                bytes,
                latency: started.elapsed(),
                success,
            });
        }
    }

    /// Log the options; secrets are never printed.
    pub fn dump(&self, provider: &str) {
        tracing::info!(
            provider,
            request_timeout_ms = self.request_timeout_ms,
            connect_timeout_ms = self.connect_timeout_ms,
            server_side_encryption = self.server_side_encryption,
            encryption_key_id = self.encryption_key_id.as_deref().unwrap_or(""),
            endpoint = self.cloud.endpoint.as_deref().unwrap_or(""),
            static_credentials = self.cloud.credentials.has_static_keys(),
            retry_max_attempts = self.cloud.retry.max_attempts,
            create_bucket_if_missing = self.cloud.create_bucket_if_missing,
            request_callback = self.request_callback.is_some(),
            "Storage provider options"
        );
    }
}

/// Result of a named option lookup.
#[derive(Clone, Copy)]
pub enum NamedOption<'a> {
    Provider(&'a ProviderOptions),
    Extension(&'a (dyn Any + Send + Sync)),
}

impl<'a> NamedOption<'a> {
    /// Checked view of the option as `T`; `None` on a type mismatch.
    pub fn downcast<T: Any>(self) -> Option<&'a T> {
        match self {
            NamedOption::Provider(options) => {
                let any: &'a dyn Any = options;
                any.downcast_ref::<T>()
            }
            NamedOption::Extension(value) => value.downcast_ref::<T>(),
        }
    }
}

/// Interface to one cloud object store.
///
/// Bucket arguments are fully qualified bucket names
/// ([`crate::bucket::BucketOptions::name`]); object paths are keys inside the
/// bucket.
#[async_trait]
pub trait CloudStorageProvider: Send + Sync + 'static {
    /// Registry key of this provider.
    fn name(&self) -> &'static str;

    fn options(&self) -> &ProviderOptions;

    async fn create_bucket(&self, bucket: &str) -> Result<()>;

    /// `Err(NotFound)` when the bucket does not exist.
    async fn exists_bucket(&self, bucket: &str) -> Result<()>;

    /// Delete every object under `path_prefix`. Idempotent.
    async fn empty_bucket(&self, bucket: &str, path_prefix: &str) -> Result<()>;

    /// `Err(NotFound)` when the object does not exist.
    async fn delete_cloud_object(&self, bucket: &str, path: &str) -> Result<()>;

    /// Names under `path_prefix`, relative to it, in vendor listing order.
    async fn list_cloud_objects(&self, bucket: &str, path_prefix: &str) -> Result<Vec<String>>;

    async fn get_cloud_object_metadata(&self, bucket: &str, path: &str) -> Result<ObjectInfo>;

    /// `Err(NotFound)` when the object does not exist.
    async fn exists_cloud_object(&self, bucket: &str, path: &str) -> Result<()> {
        self.get_cloud_object_metadata(bucket, path).await.map(|_| ())
    }

    async fn get_cloud_object_size(&self, bucket: &str, path: &str) -> Result<u64> {
        Ok(self.get_cloud_object_metadata(bucket, path).await?.size)
    }

    async fn get_cloud_object_modification_time(
        &self,
        bucket: &str,
        path: &str,
    ) -> Result<DateTime<Utc>> {
        Ok(self
            .get_cloud_object_metadata(bucket, path)
            .await?
            .modification_time)
    }

    /// Server-side copy. Metadata is preserved; the destination is either
    /// fully written or left untouched.
    async fn copy_cloud_object(
        &self,
        src_bucket: &str,
        src_path: &str,
        dst_bucket: &str,
        dst_path: &str,
    ) -> Result<()>;

    /// Download an object into `local_path`.
    async fn get_cloud_object(&self, bucket: &str, path: &str, local_path: &Path) -> Result<()>;

    /// Upload `local_path` as an object.
    async fn put_cloud_object(&self, local_path: &Path, bucket: &str, path: &str) -> Result<()>;

    /// Replace (not merge) the object's metadata.
    async fn put_cloud_object_metadata(
        &self,
        bucket: &str,
        path: &str,
        metadata: HashMap<String, String>,
    ) -> Result<()>;

    async fn new_cloud_writable_file(
        &self,
        local_path: &Path,
        bucket: &str,
        path: &str,
        options: FileOptions,
    ) -> Result<CloudWritableFile>;

    async fn new_cloud_readable_file(
        &self,
        bucket: &str,
        path: &str,
        options: FileOptions,
    ) -> Result<CloudReadableFile>;

    /// Log the provider configuration.
    fn dump(&self) {
        self.options().dump(self.name());
    }

    /// Validate the provider against the environment that owns it. Called once
    /// before any other operation.
    async fn prepare(&self, env: &CloudEnvOptions) -> Result<()> {
        validate_buckets(self, env).await
    }

    /// Look up a named option: [`PROVIDER_OPTIONS_KEY`] or an extension.
    fn get_options(&self, name: &str) -> Option<NamedOption<'_>> {
        if name == PROVIDER_OPTIONS_KEY {
            return Some(NamedOption::Provider(self.options()));
        }
        self.options().extension(name).map(NamedOption::Extension)
    }

    fn as_any(&self) -> &dyn Any;
}

/// Concrete provider behind a trait object, when `name` matches it.
pub fn cast_as<'a, T>(provider: &'a dyn CloudStorageProvider, name: &str) -> Option<&'a T>
where
    T: CloudStorageProvider,
{
    if provider.name() != name {
        return None;
    }
    provider.as_any().downcast_ref::<T>()
}

/// Bucket checks shared by all providers' `prepare`.
///
/// The source bucket must exist; the destination bucket must exist or is
/// created when `create_bucket_if_missing` is set.
pub async fn validate_buckets<P>(provider: &P, env: &CloudEnvOptions) -> Result<()>
where
    P: CloudStorageProvider + ?Sized,
{
    provider.options().cloud.credentials.validate()?;

    if env.src_bucket.is_valid() {
        let src = env.src_bucket.name();
        provider.exists_bucket(src).await.map_err(|e| match e {
            Error::NotFound(_) => {
                Error::invalid_config(format!("source bucket {} does not exist", src))
            }
            other => other,
        })?;
    }

    if env.dest_bucket.is_valid() {
        let dest = env.dest_bucket.name();
        match provider.exists_bucket(dest).await {
            Ok(()) => {}
            Err(Error::NotFound(_)) if provider.options().cloud.create_bucket_if_missing => {
                tracing::info!("Creating destination bucket {}", dest);
                provider.create_bucket(dest).await?;
            }
            Err(Error::NotFound(_)) => {
                return Err(Error::invalid_config(format!(
                    "destination bucket {} does not exist",
                    dest
                )));
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

/// Temporary sibling path used while downloading into `local_path`.
pub(crate) fn temp_download_path(local_path: &Path) -> std::path::PathBuf {
    let file_name = local_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    local_path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()))
}
