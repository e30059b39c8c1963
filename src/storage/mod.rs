use std::{fmt, io, sync::Arc};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{instrument, warn};

use crate::{
    error::{Error, Result},
    hash::{BlobKey, Digest, StreamHasher},
};

pub use directory::DirectoryBackend;
pub use keycache::KeyCache;
pub use memory::MemoryBackend;

mod directory;
mod keycache;
mod memory;

pub type StreamReader = Box<dyn AsyncRead + Unpin + Send>;
pub type StreamWriter = Box<dyn AsyncWrite + Unpin + Send>;

const PIPE_BUFFER_SIZE: usize = 1024 * 1024;

/// How a transfer ended, handed to the backend's finalizer.
#[derive(Debug, Clone, Copy)]
pub enum Outcome<'a> {
    Committed,
    Aborted(&'a Error),
}

impl Outcome<'_> {
    pub fn is_committed(&self) -> bool {
        matches!(self, Outcome::Committed)
    }
}

/// Commit/abort step of a backend transfer. Consumed by value, so it can
/// run at most once.
#[async_trait]
pub trait Finalize: Send {
    async fn finalize(self: Box<Self>, outcome: Outcome<'_>) -> io::Result<()>;
}

pub type Finalizer = Box<dyn Finalize>;

#[async_trait]
pub trait Backend: Send + Sync {
    async fn new_writer(&self, key: &BlobKey) -> io::Result<(StreamWriter, Option<Finalizer>)>;

    async fn new_reader(&self, key: &BlobKey) -> io::Result<(StreamReader, Option<Finalizer>)>;

    async fn exists(&self, key: &BlobKey) -> io::Result<bool>;
}

/// Content-addressed store that verifies every transfer against the
/// claimed length and digest.
#[derive(Clone)]
pub struct Bin {
    name: String,
    backend: Arc<dyn Backend>,
}

impl fmt::Debug for Bin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bin").field("name", &self.name).finish()
    }
}

impl Bin {
    pub fn new<N: Into<String>>(name: N, backend: Arc<dyn Backend>) -> Self {
        Self {
            name: name.into(),
            backend,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[instrument(level = "debug", skip(self, reader), fields(bin = %self.name), err)]
    pub async fn store<R>(&self, length: u64, digest: &Digest, reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let key = BlobKey::new(length, *digest);
        let (mut writer, finalizer) = self.backend.new_writer(&key).await.map_err(Error::Backend)?;

        let result = async {
            let (n, actual) = pipe(reader, &mut writer).await?;
            writer.shutdown().await.map_err(Error::Transfer)?;
            verify(&key, n, actual)
        }
        .await;
        drop(writer);

        finish(finalizer, result).await
    }

    #[instrument(level = "debug", skip(self, writer), fields(bin = %self.name), err)]
    pub async fn fetch<W>(&self, length: u64, digest: &Digest, mut writer: W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let key = BlobKey::new(length, *digest);
        let (reader, finalizer) = self.backend.new_reader(&key).await.map_err(Error::Backend)?;

        let result = async {
            let (n, actual) = pipe(reader, &mut writer).await?;
            writer.flush().await.map_err(Error::Transfer)?;
            verify(&key, n, actual)
        }
        .await;

        finish(finalizer, result).await
    }

    pub async fn exists(&self, length: u64, digest: &Digest) -> Result<bool> {
        self.backend
            .exists(&BlobKey::new(length, *digest))
            .await
            .map_err(Error::Backend)
    }
}

/// Copies `reader` into `writer`, hashing everything that passes through.
async fn pipe<R, W>(mut reader: R, writer: &mut W) -> Result<(u64, Digest)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
    let mut hasher = StreamHasher::new();
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await.map_err(Error::Transfer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n]).await.map_err(Error::Transfer)?;
        total += n as u64;
    }

    Ok((total, hasher.finalize()))
}

fn verify(key: &BlobKey, actual_length: u64, actual: Digest) -> Result<()> {
    if actual_length != key.length || actual != key.digest {
        return Err(Error::Mismatch {
            key: *key,
            actual_length,
            actual,
        });
    }
    Ok(())
}

/// Runs the finalizer with the transfer outcome. A finalizer failure
/// replaces a success; an earlier failure is kept.
async fn finish(finalizer: Option<Finalizer>, result: Result<()>) -> Result<()> {
    let Some(finalizer) = finalizer else {
        return result;
    };

    let outcome = match &result {
        Ok(()) => Outcome::Committed,
        Err(e) => Outcome::Aborted(e),
    };
    let finalized = finalizer.finalize(outcome).await;

    match (result, finalized) {
        (Ok(()), Err(e)) => Err(Error::Backend(e)),
        (Err(e), Err(cleanup)) => {
            warn!(error = %cleanup, "finalizer failed after aborted transfer");
            Err(e)
        }
        (result, Ok(())) => result,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Cursor,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed | 1;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    fn mem_bin() -> (Bin, MemoryBackend) {
        let backend = MemoryBackend::default();
        (Bin::new("mem", Arc::new(backend.clone())), backend)
    }

    #[tokio::test]
    async fn round_trip() {
        let (bin, _) = mem_bin();
        let data = random_bytes(3 * 1024 * 1024 + 17, 7);
        let digest = Digest::of(&data);

        bin.store(data.len() as u64, &digest, Cursor::new(data.clone()))
            .await
            .unwrap();

        let mut out = Vec::new();
        bin.fetch(data.len() as u64, &digest, &mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn wrong_length_rejected() {
        let (bin, _) = mem_bin();
        let data = random_bytes(4096, 1);
        let digest = Digest::of(&data);
        let claimed = data.len() as u64 + 1;

        let err = bin
            .store(claimed, &digest, Cursor::new(data))
            .await
            .unwrap_err();
        assert!(err.is_verification());
        assert!(!bin.exists(claimed, &digest).await.unwrap());
    }

    #[tokio::test]
    async fn wrong_hash_rejected() {
        let (bin, _) = mem_bin();
        let data = random_bytes(4096, 2);
        let bogus = Digest::of(b"something else");

        let err = bin
            .store(data.len() as u64, &bogus, Cursor::new(data.clone()))
            .await
            .unwrap_err();
        assert!(err.is_verification());
        assert!(!bin.exists(data.len() as u64, &bogus).await.unwrap());
    }

    #[tokio::test]
    async fn wrong_data_rejected() {
        let (bin, backend) = mem_bin();
        let data = random_bytes(4096, 3);
        let digest = Digest::of(&data);

        let err = bin
            .store(data.len() as u64, &digest, Cursor::new(b"foobar".to_vec()))
            .await
            .unwrap_err();
        assert!(err.is_verification());
        assert!(!bin.exists(data.len() as u64, &digest).await.unwrap());
        assert_eq!(backend.len(), 0);
    }

    #[tokio::test]
    async fn fetch_missing_fails() {
        let (bin, _) = mem_bin();
        let err = bin
            .fetch(1, &Digest::of(b"nope"), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
    }

    struct Counting<'a>(&'a AtomicUsize, bool);

    #[async_trait]
    impl Finalize for Counting<'static> {
        async fn finalize(self: Box<Self>, outcome: Outcome<'_>) -> io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            if self.1 && outcome.is_committed() {
                return Err(io::Error::other("commit refused"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn finalizer_runs_once_and_can_fail() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        let ok = finish(Some(Box::new(Counting(&CALLS, false))), Ok(())).await;
        assert!(ok.is_ok());

        let refused = finish(Some(Box::new(Counting(&CALLS, true))), Ok(())).await;
        assert!(matches!(refused, Err(Error::Backend(_))));

        let key = BlobKey::new(1, Digest::of(b"x"));
        let failed = finish(
            Some(Box::new(Counting(&CALLS, true))),
            verify(&key, 2, Digest::of(b"xy")),
        )
        .await;
        assert!(failed.unwrap_err().is_verification());

        assert_eq!(CALLS.load(Ordering::SeqCst), 3);
    }

    /// Serves fixed bytes for every key and tallies its finalizers.
    struct Replaying {
        data: Vec<u8>,
        calls: Arc<AtomicUsize>,
        committed: Arc<AtomicUsize>,
    }

    struct Tally(Arc<AtomicUsize>, Arc<AtomicUsize>);

    #[async_trait]
    impl Finalize for Tally {
        async fn finalize(self: Box<Self>, outcome: Outcome<'_>) -> io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            if outcome.is_committed() {
                self.1.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Backend for Replaying {
        async fn new_writer(
            &self,
            _key: &BlobKey,
        ) -> io::Result<(StreamWriter, Option<Finalizer>)> {
            Ok((Box::new(tokio::io::sink()), None))
        }

        async fn new_reader(&self, _key: &BlobKey) -> io::Result<(StreamReader, Option<Finalizer>)> {
            let tally = Tally(self.calls.clone(), self.committed.clone());
            Ok((
                Box::new(Cursor::new(self.data.clone())),
                Some(Box::new(tally)),
            ))
        }

        async fn exists(&self, _key: &BlobKey) -> io::Result<bool> {
            Ok(true)
        }
    }

    fn replaying(data: Vec<u8>) -> (Bin, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let committed = Arc::new(AtomicUsize::new(0));
        let backend = Replaying {
            data,
            calls: calls.clone(),
            committed: committed.clone(),
        };
        (Bin::new("replay", Arc::new(backend)), calls, committed)
    }

    #[tokio::test]
    async fn fetch_finalizes_once_on_success() {
        let data = random_bytes(8192, 5);
        let digest = Digest::of(&data);
        let (bin, calls, committed) = replaying(data.clone());

        let mut out = Vec::new();
        bin.fetch(data.len() as u64, &digest, &mut out).await.unwrap();

        assert_eq!(out, data);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(committed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_rejects_tampered_bytes() {
        let data = random_bytes(8192, 6);
        let digest = Digest::of(&data);
        let mut tampered = data.clone();
        tampered[100] ^= 0xff;
        let (bin, calls, committed) = replaying(tampered);

        let err = bin
            .fetch(data.len() as u64, &digest, Vec::new())
            .await
            .unwrap_err();

        assert!(err.is_verification());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(committed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fetch_rejects_short_bytes() {
        let data = random_bytes(8192, 8);
        let digest = Digest::of(&data);
        let (bin, calls, committed) = replaying(data[..4096].to_vec());

        let err = bin
            .fetch(data.len() as u64, &digest, Vec::new())
            .await
            .unwrap_err();

        assert!(err.is_verification());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(committed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn four_mib_scenario() {
        let (bin, _) = mem_bin();
        let data = random_bytes(4 * 1024 * 1024, 11);
        let digest = Digest::of(&data);

        bin.store(4_194_304, &digest, Cursor::new(data)).await.unwrap();

        assert!(bin.exists(4_194_304, &digest).await.unwrap());
        assert!(!bin.exists(4_194_304, &Digest::of(b"other")).await.unwrap());
    }
}
