use std::{fmt::Debug, io, path::PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{instrument, trace};

use crate::hash::BlobKey;

use super::{Backend, Finalize, Finalizer, KeyCache, Outcome, StreamReader, StreamWriter};

/// Stores one file per blob under a root directory.
#[derive(Clone)]
pub struct DirectoryBackend {
    root: PathBuf,
    keys: KeyCache,
}

impl DirectoryBackend {
    #[instrument(skip(keys), err)]
    pub async fn new<P: Into<PathBuf> + Debug>(root: P, keys: KeyCache) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        Ok(Self { root, keys })
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl Backend for DirectoryBackend {
    async fn new_writer(&self, key: &BlobKey) -> io::Result<(StreamWriter, Option<Finalizer>)> {
        let key = key.to_string();
        let target = self.blob_path(&key);
        let partial = self.root.join(format!("{key}.partial"));

        let file = fs::File::create(&partial).await?;
        let commit = Rename {
            partial,
            target,
            key,
            keys: self.keys.clone(),
        };

        Ok((Box::new(file), Some(Box::new(commit))))
    }

    async fn new_reader(&self, key: &BlobKey) -> io::Result<(StreamReader, Option<Finalizer>)> {
        let file = fs::File::open(self.blob_path(&key.to_string())).await?;
        Ok((Box::new(file), None))
    }

    async fn exists(&self, key: &BlobKey) -> io::Result<bool> {
        let key = key.to_string();
        if self.keys.contains(&key) {
            return Ok(true);
        }

        let found = fs::try_exists(self.blob_path(&key)).await?;
        if found {
            self.keys.insert(key);
        }
        Ok(found)
    }
}

struct Rename {
    partial: PathBuf,
    target: PathBuf,
    key: String,
    keys: KeyCache,
}

#[async_trait]
impl Finalize for Rename {
    async fn finalize(self: Box<Self>, outcome: Outcome<'_>) -> io::Result<()> {
        let Rename {
            partial,
            target,
            key,
            keys,
        } = *self;

        if outcome.is_committed() {
            fs::rename(&partial, &target).await?;
            trace!(key = %key, "blob committed");
            keys.insert(key);
            Ok(())
        } else {
            match fs::remove_file(&partial).await {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, sync::Arc};

    use super::*;
    use crate::{hash::Digest, storage::Bin};

    #[tokio::test]
    async fn commit_renames_and_records_key() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyCache::in_memory();
        let backend = DirectoryBackend::new(dir.path(), keys.clone()).await.unwrap();
        let bin = Bin::new("dir", Arc::new(backend.clone()));

        let data = b"directory backed blob".to_vec();
        let digest = Digest::of(&data);
        let key = BlobKey::new(data.len() as u64, digest);

        bin.store(data.len() as u64, &digest, Cursor::new(data.clone()))
            .await
            .unwrap();

        assert!(dir.path().join(key.to_string()).exists());
        assert!(!dir.path().join(format!("{key}.partial")).exists());
        assert!(keys.contains(&key.to_string()));

        let mut out = Vec::new();
        bin.fetch(data.len() as u64, &digest, &mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn abort_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DirectoryBackend::new(dir.path(), KeyCache::in_memory())
            .await
            .unwrap();
        let bin = Bin::new("dir", Arc::new(backend));

        let digest = Digest::of(b"expected");
        let err = bin
            .store(8, &digest, Cursor::new(b"tampered".to_vec()))
            .await
            .unwrap_err();
        assert!(err.is_verification());
        assert!(!bin.exists(8, &digest).await.unwrap());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn exists_finds_blobs_from_earlier_runs() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"left over".to_vec();
        let key = BlobKey::new(data.len() as u64, Digest::of(&data));
        std::fs::write(dir.path().join(key.to_string()), &data).unwrap();

        let keys = KeyCache::in_memory();
        let backend = DirectoryBackend::new(dir.path(), keys.clone()).await.unwrap();

        assert!(backend.exists(&key).await.unwrap());
        assert!(keys.contains(&key.to_string()));
    }
}
