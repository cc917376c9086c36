//! Live file tables
//!
//! The purger only deletes objects the storage engine no longer refers to. The
//! engine exposes that knowledge through [`LiveFileTable`].

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::{Error, Result};

/// Source of the set of files the storage engine still needs.
pub trait LiveFileTable: Send + Sync {
    /// Snapshot of live file names. An error skips the purge cycle.
    fn live_files(&self) -> Result<HashSet<String>>;
}

/// Live set maintained explicitly by the caller.
#[derive(Debug, Clone, Default)]
pub struct StaticLiveFiles {
    files: Arc<RwLock<HashSet<String>>>,
}

impl StaticLiveFiles {
    pub fn new<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            files: Arc::new(RwLock::new(files.into_iter().map(Into::into).collect())),
        }
    }

    pub fn insert(&self, fname: impl Into<String>) {
        if let Ok(mut files) = self.files.write() {
            files.insert(fname.into());
        }
    }

    pub fn remove(&self, fname: &str) -> bool {
        self.files
            .write()
            .map(|mut files| files.remove(fname))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.files.read().map(|files| files.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LiveFileTable for StaticLiveFiles {
    fn live_files(&self) -> Result<HashSet<String>> {
        self.files
            .read()
            .map(|files| files.clone())
            .map_err(|_| Error::internal("live file table poisoned"))
    }
}

/// Treats every regular file in a local directory as live.
///
/// This matches an engine that keeps a local copy of each file it still uses.
/// A missing directory is an error, never an empty live set.
#[derive(Debug, Clone)]
pub struct DirectoryLiveFiles {
    dir: PathBuf,
}

impl DirectoryLiveFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }
}

impl LiveFileTable for DirectoryLiveFiles {
    fn live_files(&self) -> Result<HashSet<String>> {
        let mut files = HashSet::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.insert(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_static_live_files() {
        let live = StaticLiveFiles::new(["000001.sst", "MANIFEST-000001"]);
        assert_eq!(live.len(), 2);

        let shared = live.clone();
        shared.insert("000002.sst");
        assert!(live.remove("000001.sst"));
        assert!(!live.remove("000001.sst"));

        let snapshot = live.live_files().unwrap();
        assert!(snapshot.contains("000002.sst"));
        assert!(!snapshot.contains("000001.sst"));
    }

    #[test]
    fn test_directory_live_files_skips_subdirectories() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("000003.sst"), b"x").unwrap();
        std::fs::create_dir(temp_dir.path().join("archive")).unwrap();

        let live = DirectoryLiveFiles::new(temp_dir.path()).live_files().unwrap();
        assert_eq!(live.len(), 1);
        assert!(live.contains("000003.sst"));
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let live = DirectoryLiveFiles::new(temp_dir.path().join("missing"));
        assert!(live.live_files().unwrap_err().is_not_found());
    }
}
