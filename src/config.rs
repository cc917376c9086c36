use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::bucket::BucketOptions;
use crate::env::CloudEnvOptions;
use crate::file::FileOptions;
use crate::provider::{
    CloudOptions, CloudStorageProvider, Credentials, ProviderOptions, RetryPolicy, PROVIDER_S3,
};

const DEFAULT_PURGER_INTERVAL_SECS: u64 = 600;

/// Source of environment variables.
pub trait EnvSource {
    /// Value of `name`; unset and empty variables are both `None`.
    fn var(&self, name: &str) -> Option<String>;
}

/// The process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        env::var(name).ok().filter(|value| !value.is_empty())
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).filter(|value| !value.is_empty()).cloned()
    }
}

/// Resolve ordered `(primary, fallback)` pairs; the first variable set wins.
pub fn resolve_env(pairs: &[(&str, &str)], env: &dyn EnvSource) -> Option<String> {
    pairs
        .iter()
        .find_map(|(primary, fallback)| env.var(primary).or_else(|| env.var(fallback)))
}

/// Top-level application configuration loaded from file + environment.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub provider: ProviderSection,
    pub source: BucketOptions,
    pub destination: BucketOptions,
    pub files: FileOptions,
    pub purger: PurgerSection,
    pub logging: LoggingSection,
}

impl AppConfig {
    /// Load configuration from disk and environment.
    pub fn load() -> Result<Self> {
        let config_path =
            env::var("CLOUDENV_CONFIG").unwrap_or_else(|_| "cloudenv.toml".to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Load `path` when it exists, then apply `CLOUDENV_*` overrides.
    ///
    /// Nested keys use a double underscore: `CLOUDENV_PURGER__INTERVAL_SECS`.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut builder = config::Config::builder();

        if path.exists() {
            builder = builder.add_source(config::File::from(PathBuf::from(path)));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CLOUDENV")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder
            .build()
            .with_context(|| format!("failed to read configuration from {}", path.display()))?;
        let mut config: Self = settings.try_deserialize()?;

        if config.logging.level.trim().is_empty() {
            config.logging.level = "info".to_string();
        }

        Ok(config)
    }

    /// Options for the configured provider.
    pub fn provider_options(&self) -> Result<ProviderOptions> {
        let provider = &self.provider;
        if provider.name.trim().is_empty() {
            bail!("provider.name must be specified");
        }
        if provider.encryption_key_id.is_some() && !provider.server_side_encryption {
            bail!("provider.encryption_key_id requires provider.server_side_encryption");
        }
        if provider.retry.max_attempts == 0 {
            bail!("provider.retry.max_attempts must be at least 1");
        }
        provider
            .credentials
            .validate()
            .context("invalid provider.credentials")?;

        let mut options = ProviderOptions::default();
        options.cloud = CloudOptions {
            credentials: provider.credentials.clone(),
            retry: provider.retry,
            endpoint: provider
                .endpoint
                .as_ref()
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty()),
            create_bucket_if_missing: provider.create_bucket_if_missing,
        };
        options.request_timeout_ms = provider.request_timeout_ms;
        options.connect_timeout_ms = provider.connect_timeout_ms;
        options.server_side_encryption = provider.server_side_encryption;
        options.encryption_key_id = provider.encryption_key_id.clone();
        Ok(options)
    }

    /// Environment options bound to an already created provider.
    pub fn env_options(&self, provider: Arc<dyn CloudStorageProvider>) -> Result<CloudEnvOptions> {
        if !self.source.is_valid() && !self.destination.is_valid() {
            bail!("at least one of source.bucket or destination.bucket must be specified");
        }
        if self.purger.enabled {
            if !self.destination.is_valid() {
                bail!("purger.enabled requires destination.bucket");
            }
            if self.purger.interval_secs == 0 {
                bail!("purger.interval_secs must be positive");
            }
        }

        Ok(CloudEnvOptions {
            src_bucket: self.source.clone(),
            dest_bucket: self.destination.clone(),
            storage_provider: Some(provider),
            credentials: self.provider.credentials.clone(),
            run_purger: self.purger.enabled,
            purger_interval: Duration::from_secs(self.purger.interval_secs),
            file_options: self.files,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    /// Registry key, e.g. `s3` or `mem`.
    pub name: String,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub server_side_encryption: bool,
    pub encryption_key_id: Option<String>,
    pub endpoint: Option<String>,
    pub credentials: Credentials,
    pub retry: RetryPolicy,
    pub create_bucket_if_missing: bool,
}

impl Default for ProviderSection {
    fn default() -> Self {
        let defaults = ProviderOptions::default();
        Self {
            name: PROVIDER_S3.to_string(),
            request_timeout_ms: defaults.request_timeout_ms,
            connect_timeout_ms: defaults.connect_timeout_ms,
            server_side_encryption: false,
            encryption_key_id: None,
            endpoint: None,
            credentials: Credentials::default(),
            retry: RetryPolicy::default(),
            create_bucket_if_missing: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PurgerSection {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Local directory whose files are treated as live.
    pub local_dir: Option<String>,
}

impl Default for PurgerSection {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: DEFAULT_PURGER_INTERVAL_SECS,
            local_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_resolve_env_prefers_primary() {
        let env = vars(&[("A", "primary"), ("B", "fallback")]);
        assert_eq!(resolve_env(&[("A", "B")], &env).as_deref(), Some("primary"));
    }

    #[test]
    fn test_resolve_env_falls_back_in_order() {
        let env = vars(&[("B", "fallback"), ("D", "second")]);
        assert_eq!(resolve_env(&[("A", "B"), ("C", "D")], &env).as_deref(), Some("fallback"));
        assert_eq!(resolve_env(&[("C", "D")], &env).as_deref(), Some("second"));
        assert_eq!(resolve_env(&[("X", "Y")], &env), None);
    }

    #[test]
    fn test_empty_variables_are_unset() {
        let env = vars(&[("A", ""), ("B", "value")]);
        assert_eq!(resolve_env(&[("A", "B")], &env).as_deref(), Some("value"));
    }
}
