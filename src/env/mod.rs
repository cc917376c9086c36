//! Cloud environment
//!
//! [`CloudEnv`] maps the storage engine's logical file names onto objects in a
//! source bucket (read-only, e.g. a snapshot to clone from) and a destination
//! bucket (where new files are written). Reads try the destination first and
//! fall back to the source.
//!
//! When enabled, a background purger deletes destination objects that the
//! engine's [`LiveFileTable`] no longer lists.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::bucket::BucketOptions;
use crate::config::{resolve_env, EnvSource};
use crate::file::{CloudReadableFile, CloudWritableFile, FileOptions};
use crate::path::{join_object_path, path_to_name};
use crate::provider::{CloudStorageProvider, Credentials};
use crate::{Error, Result};

mod live;
mod purge;

pub use live::{DirectoryLiveFiles, LiveFileTable, StaticLiveFiles};
pub use purge::{PurgeStats, WriterRegistration};

use purge::{PurgeContext, PurgerHandle, WriterRegistry};

/// Default time between purge cycles.
pub const DEFAULT_PURGER_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Options of a [`CloudEnv`].
#[derive(Clone)]
pub struct CloudEnvOptions {
    /// Bucket files are read from when missing in the destination.
    pub src_bucket: BucketOptions,

    /// Bucket new files are written to.
    pub dest_bucket: BucketOptions,

    pub storage_provider: Option<Arc<dyn CloudStorageProvider>>,

    pub credentials: Credentials,

    /// Run the background purger on the destination bucket.
    pub run_purger: bool,

    pub purger_interval: Duration,

    /// Options for handles created by the environment.
    pub file_options: FileOptions,
}

impl Default for CloudEnvOptions {
    fn default() -> Self {
        Self {
            src_bucket: BucketOptions::default(),
            dest_bucket: BucketOptions::default(),
            storage_provider: None,
            credentials: Credentials::default(),
            run_purger: false,
            purger_interval: DEFAULT_PURGER_INTERVAL,
            file_options: FileOptions::default(),
        }
    }
}

impl fmt::Debug for CloudEnvOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudEnvOptions")
            .field("src_bucket", &self.src_bucket)
            .field("dest_bucket", &self.dest_bucket)
            .field(
                "storage_provider",
                &self.storage_provider.as_ref().map(|p| p.name()),
            )
            .field("credentials", &self.credentials)
            .field("run_purger", &self.run_purger)
            .field("purger_interval", &self.purger_interval)
            .field("file_options", &self.file_options)
            .finish()
    }
}

impl CloudEnvOptions {
    /// Point both buckets at the same test location, honouring environment
    /// overrides, and pick up static credentials from the AWS variables.
    pub fn test_initialize(
        &mut self,
        bucket: &str,
        object_path: &str,
        region: &str,
        env: &dyn EnvSource,
    ) {
        self.src_bucket.test_initialize(bucket, object_path, region, env);
        self.dest_bucket = self.src_bucket.clone();

        let access_key = resolve_env(&[("CLOUDENV_TEST_ACCESS_KEY_ID", "AWS_ACCESS_KEY_ID")], env);
        let secret_key = resolve_env(
            &[("CLOUDENV_TEST_SECRET_ACCESS_KEY", "AWS_SECRET_ACCESS_KEY")],
            env,
        );
        if let (Some(id), Some(secret)) = (access_key, secret_key) {
            self.credentials = Credentials::new(id, secret);
        }
    }

    /// Override source and destination locations. Empty arguments keep the
    /// current value, so callers can move only the parts they care about.
    pub fn with_locations(
        mut self,
        src_bucket: &str,
        src_object_path: &str,
        src_region: &str,
        dest_bucket: &str,
        dest_object_path: &str,
        dest_region: &str,
    ) -> Self {
        self.src_bucket
            .override_location(src_bucket, src_object_path, src_region);
        self.dest_bucket
            .override_location(dest_bucket, dest_object_path, dest_region);
        self
    }

    pub fn dump(&self) {
        for (role, bucket) in [("source", &self.src_bucket), ("destination", &self.dest_bucket)] {
            tracing::info!(
                role,
                bucket = bucket.name(),
                object_path = bucket.object_path(),
                region = bucket.region(),
                valid = bucket.is_valid(),
                "Cloud env bucket"
            );
        }
        tracing::info!(
            provider = self.storage_provider.as_ref().map(|p| p.name()).unwrap_or("<none>"),
            run_purger = self.run_purger,
            purger_interval_secs = self.purger_interval.as_secs(),
            static_credentials = self.credentials.has_static_keys(),
            "Cloud env options"
        );
    }
}

/// Lifecycle of a [`CloudEnv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvState {
    Constructed,
    Prepared,
    Running,
    ShuttingDown,
    Destroyed,
}

/// Cloud-backed environment for one storage engine instance.
pub struct CloudEnv {
    options: CloudEnvOptions,
    live_files: Arc<dyn LiveFileTable>,
    writers: Arc<WriterRegistry>,
    state: EnvState,
    purger: Option<PurgerHandle>,
}

impl CloudEnv {
    /// Capture the options. No I/O happens until [`CloudEnv::prepare`].
    pub fn new(options: CloudEnvOptions, live_files: Arc<dyn LiveFileTable>) -> Self {
        Self {
            options,
            live_files,
            writers: Arc::new(WriterRegistry::default()),
            state: EnvState::Constructed,
            purger: None,
        }
    }

    /// Validate the configuration against the provider and start the purger.
    pub async fn prepare(&mut self) -> Result<()> {
        if self.state != EnvState::Constructed {
            return Err(Error::invalid_state(format!(
                "prepare called in state {:?}",
                self.state
            )));
        }

        let provider = self
            .options
            .storage_provider
            .clone()
            .ok_or_else(|| Error::invalid_config("no storage provider configured"))?;

        let src_valid = self.options.src_bucket.is_valid();
        let dest_valid = self.options.dest_bucket.is_valid();
        if !src_valid && !dest_valid {
            return Err(Error::invalid_config(
                "neither source nor destination bucket is configured",
            ));
        }
        if self.options.run_purger && !dest_valid {
            return Err(Error::invalid_config(
                "purger requires a valid destination bucket",
            ));
        }
        if self.options.run_purger && self.options.purger_interval.is_zero() {
            return Err(Error::invalid_config("purger interval must be positive"));
        }
        self.options.credentials.validate()?;

        provider.prepare(&self.options).await?;

        self.options.dump();
        provider.dump();
        self.state = EnvState::Prepared;

        if self.options.run_purger {
            let context = PurgeContext {
                provider: Arc::clone(&provider),
                bucket: self.options.dest_bucket.name().to_string(),
                object_path: self.options.dest_bucket.object_path().to_string(),
                live_files: Arc::clone(&self.live_files),
                writers: Arc::clone(&self.writers),
            };
            self.purger = Some(PurgerHandle::spawn(context, self.options.purger_interval));
        }

        self.state = EnvState::Running;
        tracing::info!("Cloud env running on provider {}", provider.name());
        Ok(())
    }

    /// Stop the purger and release the provider. Idempotent.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.state == EnvState::Destroyed {
            return Ok(());
        }
        self.state = EnvState::ShuttingDown;

        if let Some(purger) = self.purger.take() {
            purger.stop().await;
        }
        let pending = self.writers.pending_count();
        if pending > 0 {
            tracing::warn!("Shutting down with {} writable files still open", pending);
        }
        self.options.storage_provider = None;

        self.state = EnvState::Destroyed;
        tracing::info!("Cloud env shut down");
        Ok(())
    }

    pub fn state(&self) -> EnvState {
        self.state
    }

    pub fn options(&self) -> &CloudEnvOptions {
        &self.options
    }

    /// The provider, until the environment is shut down.
    pub fn storage_provider(&self) -> Option<&Arc<dyn CloudStorageProvider>> {
        self.options.storage_provider.as_ref()
    }

    /// Whether a purger task was started by `prepare`.
    pub fn has_purger(&self) -> bool {
        self.purger.is_some()
    }

    /// Object key of `fname` in the destination bucket.
    pub fn object_name(&self, fname: &str) -> String {
        join_object_path(self.options.dest_bucket.object_path(), &path_to_name(fname))
    }

    /// Run one purge cycle now, regardless of the background schedule.
    pub async fn purge_now(&self) -> Result<PurgeStats> {
        let provider = self.running_provider()?;
        let dest = self.dest()?;
        let context = PurgeContext {
            provider: Arc::clone(provider),
            bucket: dest.name().to_string(),
            object_path: dest.object_path().to_string(),
            live_files: Arc::clone(&self.live_files),
            writers: Arc::clone(&self.writers),
        };
        context.purge_once().await
    }

    pub async fn new_sequential_file(&self, fname: &str) -> Result<CloudReadableFile> {
        self.new_readable_file(fname).await
    }

    pub async fn new_random_access_file(&self, fname: &str) -> Result<CloudReadableFile> {
        self.new_readable_file(fname).await
    }

    async fn new_readable_file(&self, fname: &str) -> Result<CloudReadableFile> {
        let provider = self.running_provider()?;
        let options = self.options.file_options;
        self.read_with_fallback(fname, |bucket, key| async move {
            provider.new_cloud_readable_file(&bucket, &key, options).await
        })
        .await
    }

    /// Create a file in the destination bucket. It becomes visible on close.
    pub async fn new_writable_file(&self, fname: &str, local_path: &Path) -> Result<CloudWritableFile> {
        let provider = self.running_provider()?;
        let dest = self.dest()?;
        let name = path_to_name(fname);
        let key = join_object_path(dest.object_path(), &name);

        // Claimed before the handle exists so the purger never sees it unclaimed.
        let registration = self.writers.register(name);
        let file = provider
            .new_cloud_writable_file(local_path, dest.name(), &key, self.options.file_options)
            .await?;
        tracing::debug!("Opened writable file {} as {}/{}", fname, dest.name(), key);
        Ok(file.with_registration(registration))
    }

    /// `Err(NotFound)` when the file exists in neither bucket.
    pub async fn file_exists(&self, fname: &str) -> Result<()> {
        let provider = self.running_provider()?;
        self.read_with_fallback(fname, |bucket, key| async move {
            provider.exists_cloud_object(&bucket, &key).await
        })
        .await
    }

    pub async fn get_file_size(&self, fname: &str) -> Result<u64> {
        let provider = self.running_provider()?;
        self.read_with_fallback(fname, |bucket, key| async move {
            provider.get_cloud_object_size(&bucket, &key).await
        })
        .await
    }

    pub async fn get_file_modification_time(&self, fname: &str) -> Result<DateTime<Utc>> {
        let provider = self.running_provider()?;
        self.read_with_fallback(fname, |bucket, key| async move {
            provider.get_cloud_object_modification_time(&bucket, &key).await
        })
        .await
    }

    /// Delete from the destination bucket. The source is never modified.
    pub async fn delete_file(&self, fname: &str) -> Result<()> {
        let provider = self.running_provider()?;
        let dest = self.dest()?;
        let key = self.object_name(fname);
        provider.delete_cloud_object(dest.name(), &key).await?;
        tracing::debug!("Deleted {}/{}", dest.name(), key);
        Ok(())
    }

    /// Rename inside the destination bucket by copy then delete.
    ///
    /// When the delete fails after the copy succeeded both objects remain and
    /// `PartialFailure` is returned.
    pub async fn rename_file(&self, src: &str, target: &str) -> Result<()> {
        let provider = self.running_provider()?;
        let dest = self.dest()?;
        let src_key = self.object_name(src);
        let target_name = path_to_name(target);
        let target_key = join_object_path(dest.object_path(), &target_name);

        {
            let registration = self.writers.register(target_name);
            let _permit = registration.upload_permit().await;
            provider
                .copy_cloud_object(dest.name(), &src_key, dest.name(), &target_key)
                .await?;
        }

        provider
            .delete_cloud_object(dest.name(), &src_key)
            .await
            .map_err(|e| {
                Error::partial(format!(
                    "renamed {} to {} but failed to delete the source: {}",
                    src_key, target_key, e
                ))
            })?;
        tracing::debug!("Renamed {} to {} in {}", src_key, target_key, dest.name());
        Ok(())
    }

    /// Object names in either bucket, sorted and de-duplicated.
    pub async fn get_children(&self) -> Result<Vec<String>> {
        let provider = self.running_provider()?;
        let mut children = BTreeSet::new();
        for bucket in self.read_buckets() {
            let names = provider
                .list_cloud_objects(bucket.name(), bucket.object_path())
                .await?;
            children.extend(names);
        }
        Ok(children.into_iter().collect())
    }

    /// Upload a local file into the destination bucket as `fname`.
    pub async fn upload_file(&self, local_path: &Path, fname: &str) -> Result<()> {
        let provider = self.running_provider()?;
        let dest = self.dest()?;
        let name = path_to_name(fname);
        let key = join_object_path(dest.object_path(), &name);

        let registration = self.writers.register(name);
        let _permit = registration.upload_permit().await;
        provider.put_cloud_object(local_path, dest.name(), &key).await
    }

    /// Download `fname` from the destination, or the source when missing there.
    pub async fn download_file(&self, fname: &str, local_path: &Path) -> Result<()> {
        let provider = self.running_provider()?;
        self.read_with_fallback(fname, |bucket, key| async move {
            provider.get_cloud_object(&bucket, &key, local_path).await
        })
        .await
    }

    fn running_provider(&self) -> Result<&Arc<dyn CloudStorageProvider>> {
        if self.state != EnvState::Running {
            return Err(Error::invalid_state(format!(
                "cloud env is not running (state {:?})",
                self.state
            )));
        }
        self.options
            .storage_provider
            .as_ref()
            .ok_or_else(|| Error::invalid_state("cloud env has no storage provider"))
    }

    fn dest(&self) -> Result<&BucketOptions> {
        if self.options.dest_bucket.is_valid() {
            Ok(&self.options.dest_bucket)
        } else {
            Err(Error::invalid_config("no destination bucket configured"))
        }
    }

    /// Valid buckets in read order; the source is skipped when it names the
    /// same location as the destination.
    fn read_buckets(&self) -> Vec<&BucketOptions> {
        let src = &self.options.src_bucket;
        let dest = &self.options.dest_bucket;
        let mut buckets = Vec::with_capacity(2);
        if dest.is_valid() {
            buckets.push(dest);
        }
        let same_location =
            dest.is_valid() && src.name() == dest.name() && src.object_path() == dest.object_path();
        if src.is_valid() && !same_location {
            buckets.push(src);
        }
        buckets
    }

    async fn read_with_fallback<T, F, Fut>(&self, fname: &str, op: F) -> Result<T>
    where
        F: Fn(String, String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let name = path_to_name(fname);
        let mut last_not_found = None;
        for bucket in self.read_buckets() {
            let key = join_object_path(bucket.object_path(), &name);
            match op(bucket.name().to_string(), key).await {
                Err(e) if e.is_not_found() => last_not_found = Some(e),
                other => return other,
            }
        }
        Err(last_not_found.unwrap_or_else(|| Error::not_found(fname.to_string())))
    }
}

impl Drop for CloudEnv {
    fn drop(&mut self) {
        if let Some(purger) = self.purger.take() {
            tracing::debug!("Cloud env dropped without shutdown; aborting purger");
            purger.abort();
        }
    }
}
