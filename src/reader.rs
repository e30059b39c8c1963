#[cfg(windows)]
use std::os::windows::fs::FileExt as WinFileExt;

#[cfg(unix)]
use std::os::unix::fs::FileExt as UnixFileExt;

use std::{
    fs::File,
    io::{self, Read},
    ops::Deref,
    path::Path,
    sync::Arc,
};

use fs2::FileExt;
use tracing::instrument;

use crate::{
    hash::{Digest, StreamHasher},
    metadata::Chunk,
};

pub const DEFAULT_MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    pub max_chunk_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
        }
    }
}

/// Result of running the chunker over a stream.
#[derive(Debug, Clone)]
pub struct Hashed {
    pub chunks: Vec<Chunk>,
    pub size: u64,
    pub digest: Digest,
}

/// Splits streams at fixed offsets and hashes every chunk on its own.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        assert!(config.max_chunk_size > 0, "chunk size must be positive");
        Self { config }
    }

    pub fn hash_reader<R: Read>(&self, reader: R) -> io::Result<Hashed> {
        self.run(reader, None)
    }

    /// Hashes at most the first `limit` chunks. The returned digest covers
    /// only the bytes read.
    pub fn hash_prefix<R: Read>(&self, reader: R, limit: usize) -> io::Result<Hashed> {
        self.run(reader, Some(limit))
    }

    #[instrument(level = "trace", skip(self), err)]
    pub fn hash_file(&self, path: &Path, limit: Option<usize>) -> io::Result<Hashed> {
        let file = FileLock::new(File::open(path)?)?;
        self.run(&*file, limit)
    }

    fn run<R: Read>(&self, mut reader: R, limit: Option<usize>) -> io::Result<Hashed> {
        let mut buf = vec![0u8; self.config.max_chunk_size];
        let mut whole = StreamHasher::new();
        let mut chunks = Vec::new();
        let mut offset = 0u64;

        while limit.is_none_or(|limit| chunks.len() < limit) {
            let n = fill(&mut reader, &mut buf)?;
            if n == 0 {
                break;
            }

            let data = &buf[..n];
            whole.update(data);
            chunks.push(Chunk {
                offset,
                length: n as u64,
                digest: Digest::of(data),
            });
            offset += n as u64;

            if n < buf.len() {
                break;
            }
        }

        Ok(Hashed {
            chunks,
            size: offset,
            digest: whole.finalize(),
        })
    }
}

/// Reads until `buf` is full or the stream ends.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Holds a shared advisory lock on a file for as long as it lives.
pub struct FileLock {
    inner: File,
}

impl FileLock {
    pub fn new(file: File) -> io::Result<Self> {
        FileExt::lock_shared(&file)?;

        Ok(Self { inner: file })
    }

    pub fn open(path: &Path) -> io::Result<Self> {
        Self::new(File::open(path)?)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.inner);
    }
}

impl Deref for FileLock {
    type Target = File;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Positional reader over `[offset, offset + limit)` of a shared file.
pub struct SliceReader {
    file: Arc<FileLock>,
    offset: u64,
    remaining: u64,
}

impl SliceReader {
    pub fn new(file: Arc<FileLock>, offset: u64, limit: u64) -> Self {
        Self {
            file,
            offset,
            remaining: limit,
        }
    }
}

impl Read for SliceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }

        let max_len = self.remaining.min(buf.len() as u64) as usize;
        let read_buf = &mut buf[..max_len];

        #[cfg(unix)]
        let n = self.file.read_at(read_buf, self.offset)?;

        #[cfg(windows)]
        let n = self.file.seek_read(read_buf, self.offset)?;

        if n == 0 {
            self.remaining = 0;
            return Ok(0);
        }

        self.offset += n as u64;
        self.remaining -= n as u64;

        Ok(n)
    }
}
