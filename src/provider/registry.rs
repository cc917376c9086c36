//! Provider registry
//!
//! Maps a short vendor tag to a factory. Vendors excluded from the build are
//! reported the same way as unknown names: `NotSupported`.

use std::collections::HashMap;
use std::sync::Arc;

use super::memory::MemoryProvider;
use super::{CloudStorageProvider, ProviderOptions};
use crate::{Error, Result};

/// Amazon S3 (and S3-compatible stores via `CloudOptions::endpoint`).
pub const PROVIDER_S3: &str = "s3";

/// Process-local in-memory store.
pub const PROVIDER_MEMORY: &str = "mem";

/// Builds a provider from its options. Must not perform I/O.
pub type ProviderFactory =
    Arc<dyn Fn(ProviderOptions) -> Result<Arc<dyn CloudStorageProvider>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every provider compiled into this build.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(PROVIDER_MEMORY, |options| {
            Ok(Arc::new(MemoryProvider::new(options)) as Arc<dyn CloudStorageProvider>)
        });
        #[cfg(feature = "aws")]
        registry.register(PROVIDER_S3, |options| {
            Ok(Arc::new(super::s3::S3Provider::new(options)) as Arc<dyn CloudStorageProvider>)
        });
        registry
    }

    /// Register (or replace) the factory for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(ProviderOptions) -> Result<Arc<dyn CloudStorageProvider>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn create(
        &self,
        name: &str,
        options: ProviderOptions,
    ) -> Result<Arc<dyn CloudStorageProvider>> {
        match self.factories.get(name) {
            Some(factory) => {
                tracing::debug!("Creating storage provider '{}'", name);
                factory(options)
            }
            None if name == PROVIDER_S3 => Err(Error::not_supported(
                "storage provider 's3' requires the `aws` feature",
            )),
            None => Err(Error::not_supported(format!(
                "unknown storage provider '{}'",
                name
            ))),
        }
    }
}

/// Create a built-in provider by name.
pub fn create_provider(
    name: &str,
    options: ProviderOptions,
) -> Result<Arc<dyn CloudStorageProvider>> {
    ProviderRegistry::with_builtins().create(name, options)
}
