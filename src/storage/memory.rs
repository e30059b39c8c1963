use std::{
    collections::HashMap,
    io::{self, Cursor},
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll},
};

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use crate::hash::BlobKey;

use super::{Backend, Finalize, Finalizer, Outcome, StreamReader, StreamWriter};

/// Keeps blobs in a process-local map. Blobs only become visible once a
/// transfer commits.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    blobs: Arc<Mutex<HashMap<String, Arc<Vec<u8>>>>>,
}

impl MemoryBackend {
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Vec<u8>>>> {
        self.blobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn new_writer(&self, key: &BlobKey) -> io::Result<(StreamWriter, Option<Finalizer>)> {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let writer = SharedBuffer(buffer.clone());
        let commit = Commit {
            blobs: self.blobs.clone(),
            key: key.to_string(),
            buffer,
        };

        Ok((Box::new(writer), Some(Box::new(commit))))
    }

    async fn new_reader(&self, key: &BlobKey) -> io::Result<(StreamReader, Option<Finalizer>)> {
        let blob = self
            .lock()
            .get(&key.to_string())
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{key} not exists")))?;

        Ok((Box::new(Cursor::new(ArcBytes(blob))), None))
    }

    async fn exists(&self, key: &BlobKey) -> io::Result<bool> {
        Ok(self.lock().contains_key(&key.to_string()))
    }
}

struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl AsyncWrite for SharedBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut inner = self.0.lock().unwrap_or_else(|e| e.into_inner());
        inner.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

struct Commit {
    blobs: Arc<Mutex<HashMap<String, Arc<Vec<u8>>>>>,
    key: String,
    buffer: Arc<Mutex<Vec<u8>>>,
}

#[async_trait]
impl Finalize for Commit {
    async fn finalize(self: Box<Self>, outcome: Outcome<'_>) -> io::Result<()> {
        if !outcome.is_committed() {
            return Ok(());
        }

        let Commit { blobs, key, buffer } = *self;
        let data = std::mem::take(&mut *buffer.lock().unwrap_or_else(|e| e.into_inner()));
        blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, Arc::new(data));
        Ok(())
    }
}

struct ArcBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for ArcBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
