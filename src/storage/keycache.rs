use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::debug;

use crate::{
    error::Result,
    metadata::{self, BincodeStore},
};

/// Keys known to be present in a store, persisted between runs so
/// `exists` checks can skip the backend.
#[derive(Clone)]
pub struct KeyCache {
    inner: Arc<Inner>,
}

struct Inner {
    path: Option<PathBuf>,
    keys: Mutex<HashSet<String>>,
    dirty: AtomicBool,
}

impl KeyCache {
    /// A cache that is never written to disk.
    pub fn in_memory() -> Self {
        Self::with_keys(None, HashSet::new())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let keys = metadata::read_optional(&BincodeStore, path)?.unwrap_or_default();
        Ok(Self::with_keys(Some(path.to_path_buf()), keys))
    }

    fn with_keys(path: Option<PathBuf>, keys: HashSet<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                path,
                keys: Mutex::new(keys),
                dirty: AtomicBool::new(false),
            }),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys().contains(key)
    }

    pub fn insert(&self, key: String) {
        if self.keys().insert(key) {
            self.inner.dirty.store(true, Ordering::Release);
        }
    }

    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes the cache if anything changed since the last flush.
    pub async fn flush(&self) -> Result<()> {
        let Some(path) = self.inner.path.clone() else {
            return Ok(());
        };
        if !self.inner.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let keys = self.keys().clone();
        let count = keys.len();
        let written = tokio::task::spawn_blocking(move || {
            metadata::write_atomic(&BincodeStore, &keys, &path)
        })
        .await?;

        if let Err(e) = written {
            self.inner.dirty.store(true, Ordering::Release);
            return Err(e);
        }

        debug!(count, "key cache saved");
        Ok(())
    }

    fn keys(&self) -> MutexGuard<'_, HashSet<String>> {
        self.inner.keys.lock().unwrap_or_else(|e| e.into_inner())
    }
}
