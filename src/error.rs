use std::{io, path::PathBuf};

use thiserror::Error;

use crate::hash::{BlobKey, Digest};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("backend error: {0}")]
    Backend(#[source] io::Error),

    #[error("transfer error: {0}")]
    Transfer(#[source] io::Error),

    #[error("data not match {key}: got {actual_length}-{actual}")]
    Mismatch {
        key: BlobKey,
        actual_length: u64,
        actual: Digest,
    },

    #[error("cannot read {} at offset {offset}, source changed since snapshot: {source}", path.display())]
    SourceChanged {
        path: PathBuf,
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("cannot persist {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("no stores configured, run `setup` first")]
    NoStores,

    #[error("operation cancelled")]
    Cancelled,

    #[error("{failed} of {total} upload jobs failed")]
    UploadFailed { failed: usize, total: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// True when the bytes moved did not match the claimed length or digest.
    pub fn is_verification(&self) -> bool {
        matches!(self, Error::Mismatch { .. })
    }

    pub(crate) fn persist(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Persist {
            path: path.into(),
            source,
        }
    }
}
