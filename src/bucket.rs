//! Bucket descriptors
//!
//! A [`BucketOptions`] names one logical storage location: the vendor bucket
//! (qualified by a prefix), a key prefix inside it and the bucket's region.

use serde::{Deserialize, Serialize};

use crate::config::{resolve_env, EnvSource};

/// Namespace qualifier prepended to every bucket name unless overridden.
pub const DEFAULT_BUCKET_PREFIX: &str = "cloudenv.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BucketSection", into = "BucketSection")]
pub struct BucketOptions {
    prefix: String,
    bucket: String,
    object_path: String,
    region: String,
    name: String,
}

impl Default for BucketOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_BUCKET_PREFIX.to_string(),
            bucket: String::new(),
            object_path: String::new(),
            region: String::new(),
            name: String::new(),
        }
    }
}

impl BucketOptions {
    pub fn new(
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        object_path: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        let mut options = Self::default();
        options.set_bucket_name(bucket, prefix);
        options.set_object_path(object_path);
        options.set_region(region);
        options
    }

    /// Set the bucket and, when `prefix` is non-empty, replace the prefix.
    ///
    /// An empty bucket clears the derived name and makes the descriptor invalid.
    pub fn set_bucket_name(&mut self, bucket: impl Into<String>, prefix: impl Into<String>) {
        let prefix = prefix.into();
        if !prefix.is_empty() {
            self.prefix = prefix;
        }
        self.bucket = bucket.into();
        self.recompute_name();
    }

    pub fn set_object_path(&mut self, object_path: impl Into<String>) {
        self.object_path = object_path.into();
    }

    pub fn set_region(&mut self, region: impl Into<String>) {
        self.region = region.into();
    }

    /// Replace each of `bucket`, `object_path` and `region` that is non-empty.
    pub fn override_location(&mut self, bucket: &str, object_path: &str, region: &str) {
        if !bucket.is_empty() {
            self.set_bucket_name(bucket, "");
        }
        if !object_path.is_empty() {
            self.set_object_path(object_path);
        }
        if !region.is_empty() {
            self.set_region(region);
        }
    }

    fn recompute_name(&mut self) {
        if self.bucket.is_empty() {
            self.name.clear();
        } else {
            self.name = format!("{}{}", self.prefix, self.bucket);
        }
    }

    /// Fully qualified bucket name (`prefix + bucket`), empty when unset.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn is_valid(&self) -> bool {
        !self.name.is_empty()
    }

    /// Initialize from the environment for tests and bootstrap tooling.
    ///
    /// Each setting is looked up under a primary and a fallback variable. When
    /// no bucket variable is set, the host name is appended to `bucket` so
    /// concurrent test runs on different machines do not collide.
    pub fn test_initialize(
        &mut self,
        bucket: &str,
        object_path: &str,
        region: &str,
        env: &dyn EnvSource,
    ) {
        self.bucket = resolve_env(
            &[("CLOUDENV_TEST_BUCKET_NAME", "CLOUDENV_BUCKET_NAME")],
            env,
        )
        .unwrap_or_else(|| format!("{}{}", bucket, host_suffix()));

        if let Some(prefix) = resolve_env(
            &[("CLOUDENV_TEST_BUCKET_PREFIX", "CLOUDENV_BUCKET_PREFIX")],
            env,
        ) {
            self.prefix = prefix;
        }
        self.recompute_name();

        self.object_path = resolve_env(
            &[("CLOUDENV_TEST_OBJECT_PATH", "CLOUDENV_OBJECT_PATH")],
            env,
        )
        .unwrap_or_else(|| object_path.to_string());

        self.region = resolve_env(&[("CLOUDENV_TEST_REGION", "CLOUDENV_REGION")], env)
            .unwrap_or_else(|| region.to_string());
    }
}

// Bucket names only allow lowercase letters, digits, dots and dashes.
fn host_suffix() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| {
            h.to_ascii_lowercase()
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
                .collect()
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// Serialized form of a descriptor; `name` is always derived, never read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct BucketSection {
    bucket: String,
    prefix: String,
    object_path: String,
    region: String,
}

impl Default for BucketSection {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            prefix: DEFAULT_BUCKET_PREFIX.to_string(),
            object_path: String::new(),
            region: String::new(),
        }
    }
}

impl From<BucketSection> for BucketOptions {
    fn from(section: BucketSection) -> Self {
        BucketOptions::new(
            section.bucket,
            section.prefix,
            section.object_path,
            section.region,
        )
    }
}

impl From<BucketOptions> for BucketSection {
    fn from(options: BucketOptions) -> Self {
        Self {
            bucket: options.bucket,
            prefix: options.prefix,
            object_path: options.object_path,
            region: options.region,
        }
    }
}
