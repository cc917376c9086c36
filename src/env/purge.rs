//! Background purger
//!
//! Periodically reconciles the destination bucket with the engine's live file
//! table and deletes objects nothing refers to any more (leftovers of aborted
//! writes or superseded file generations).
//!
//! An object is never deleted while a writer might still publish it:
//! - names with an open writer, or whose writer started during the current
//!   cycle, are kept
//! - deletions and uploads exclude each other through the upload gate, so a
//!   writer that registers after the check uploads only after the delete

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{watch, RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;

use super::live::LiveFileTable;
use crate::path::{join_object_path, path_to_name};
use crate::provider::CloudStorageProvider;
use crate::{Error, Result};

/// Outcome of one purge cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub listed: usize,
    pub kept: usize,
    pub deleted: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct WriterSet {
    /// Object names with open writers, by number of writers.
    pending: HashMap<String, usize>,
    /// Object names registered since the current purge cycle began.
    touched: HashSet<String>,
}

/// Tracks object names that in-flight writers may still publish.
#[derive(Debug, Default)]
pub(crate) struct WriterRegistry {
    writers: Mutex<WriterSet>,
    gate: RwLock<()>,
}

impl WriterRegistry {
    fn lock(&self) -> Result<MutexGuard<'_, WriterSet>> {
        self.writers
            .lock()
            .map_err(|_| Error::internal("writer registry poisoned"))
    }

    pub(crate) fn register(self: &Arc<Self>, name: impl Into<String>) -> WriterRegistration {
        let name = name.into();
        if let Ok(mut writers) = self.lock() {
            *writers.pending.entry(name.clone()).or_insert(0) += 1;
            writers.touched.insert(name.clone());
        }
        WriterRegistration {
            registry: Arc::clone(self),
            name,
        }
    }

    fn release(&self, name: &str) {
        if let Ok(mut writers) = self.lock() {
            if let Some(count) = writers.pending.get_mut(name) {
                *count -= 1;
                if *count == 0 {
                    writers.pending.remove(name);
                }
            }
        }
    }

    /// Start a cycle: forget names touched by earlier cycles and return the
    /// names of writers that are open right now.
    fn begin_cycle(&self) -> Result<HashSet<String>> {
        let mut writers = self.lock()?;
        writers.touched.clear();
        Ok(writers.pending.keys().cloned().collect())
    }

    fn is_claimed(&self, name: &str) -> Result<bool> {
        let writers = self.lock()?;
        Ok(writers.pending.contains_key(name) || writers.touched.contains(name))
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.lock().map(|w| w.pending.len()).unwrap_or(0)
    }
}

/// A writer's claim on an object name, released on drop.
#[derive(Debug)]
pub struct WriterRegistration {
    registry: Arc<WriterRegistry>,
    name: String,
}

impl WriterRegistration {
    /// Hold while creating the object so the purger cannot delete it
    /// concurrently.
    pub(crate) async fn upload_permit(&self) -> RwLockReadGuard<'_, ()> {
        self.registry.gate.read().await
    }
}

impl Drop for WriterRegistration {
    fn drop(&mut self) {
        self.registry.release(&self.name);
    }
}

/// Everything a purge cycle needs, owned by the purger task.
#[derive(Clone)]
pub(crate) struct PurgeContext {
    pub(crate) provider: Arc<dyn CloudStorageProvider>,
    pub(crate) bucket: String,
    pub(crate) object_path: String,
    pub(crate) live_files: Arc<dyn LiveFileTable>,
    pub(crate) writers: Arc<WriterRegistry>,
}

impl PurgeContext {
    /// Whether `name` is an object this environment could have written.
    ///
    /// File names are flattened before upload, so nested keys belong to
    /// someone else: another environment with a deeper object path, or a
    /// source snapshot stored below the destination path.
    fn owns(name: &str) -> bool {
        !name.contains('/')
    }

    /// Run one reconciliation pass over the destination object path.
    pub(crate) async fn purge_once(&self) -> Result<PurgeStats> {
        // Liveness is snapshotted before listing.
        let open_writers = self.writers.begin_cycle()?;
        let live: HashSet<String> = self
            .live_files
            .live_files()?
            .iter()
            .map(|fname| path_to_name(fname))
            .collect();

        let listed = self
            .provider
            .list_cloud_objects(&self.bucket, &self.object_path)
            .await?;

        let mut stats = PurgeStats {
            listed: listed.len(),
            ..PurgeStats::default()
        };

        for name in listed {
            if !Self::owns(&name) {
                tracing::debug!("Purger: skipping foreign object {}", name);
                stats.kept += 1;
                continue;
            }
            if live.contains(&name) || open_writers.contains(&name) {
                stats.kept += 1;
                continue;
            }

            let _gate = self.writers.gate.write().await;
            if self.writers.is_claimed(&name)? {
                stats.kept += 1;
                continue;
            }

            let key = join_object_path(&self.object_path, &name);
            match self.provider.delete_cloud_object(&self.bucket, &key).await {
                Ok(()) => {
                    tracing::info!("Purger deleted unreferenced object {}/{}", self.bucket, key);
                    stats.deleted += 1;
                }
                Err(e) if e.is_not_found() => {
                    tracing::debug!("Purger: {}/{} already gone", self.bucket, key);
                }
                Err(e) => {
                    tracing::warn!("Purger failed to delete {}/{}: {}", self.bucket, key, e);
                    stats.failed += 1;
                }
            }
        }

        Ok(stats)
    }
}

/// Handle to a running purger task.
pub(crate) struct PurgerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PurgerHandle {
    pub(crate) fn spawn(context: PurgeContext, interval: Duration) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_purger(context, interval, shutdown_rx));
        Self { shutdown, task }
    }

    /// Signal the task and wait for it to exit.
    pub(crate) async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            if e.is_panic() {
                tracing::error!("Purger task panicked: {}", e);
            }
        }
    }

    /// Signal the task and abort it without waiting.
    pub(crate) fn abort(self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
    }
}

async fn run_purger(context: PurgeContext, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    tracing::info!(
        "Starting purger for {}/{} with interval {:?}",
        context.bucket,
        context.object_path,
        interval
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        if *shutdown.borrow() {
            break;
        }

        match context.purge_once().await {
            Ok(stats) if stats.deleted > 0 || stats.failed > 0 => {
                tracing::info!(
                    listed = stats.listed,
                    kept = stats.kept,
                    deleted = stats.deleted,
                    failed = stats.failed,
                    "Purge cycle finished"
                );
            }
            Ok(stats) => {
                tracing::debug!(listed = stats.listed, "Purge cycle found nothing to delete");
            }
            Err(e) => {
                // Keep the task alive; the next interval retries.
                tracing::warn!("Purge cycle skipped: {}", e);
            }
        }
    }

    tracing::info!("Purger stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_released_on_drop() {
        let registry = Arc::new(WriterRegistry::default());
        let first = registry.register("000001.sst");
        let second = registry.register("000001.sst");
        assert_eq!(registry.pending_count(), 1);

        drop(first);
        assert!(registry.is_claimed("000001.sst").unwrap());
        drop(second);
        assert_eq!(registry.pending_count(), 0);

        // Still touched until the next cycle starts.
        assert!(registry.is_claimed("000001.sst").unwrap());
        assert!(registry.begin_cycle().unwrap().is_empty());
        assert!(!registry.is_claimed("000001.sst").unwrap());
    }

    #[test]
    fn test_only_flat_names_are_owned() {
        assert!(PurgeContext::owns("000001.sst"));
        assert!(PurgeContext::owns("MANIFEST-000001"));
        assert!(!PurgeContext::owns("snap/000001.sst"));
        assert!(!PurgeContext::owns("tenant/db/CURRENT"));
    }

    #[test]
    fn test_begin_cycle_returns_open_writers() {
        let registry = Arc::new(WriterRegistry::default());
        let _open = registry.register("MANIFEST-000005");
        let open = registry.begin_cycle().unwrap();
        assert!(open.contains("MANIFEST-000005"));
    }
}
