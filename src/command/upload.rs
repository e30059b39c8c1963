use std::{
    collections::HashSet,
    io::{self, Read},
    path::{MAIN_SEPARATOR, Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use regex::Regex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    bufpool::{BufferPool, PooledBuffer},
    error::{Error, Result},
    metadata::{Chunk, Snapshot, SnapshotSet},
    progress::Progress,
    reader::{FileLock, SliceReader},
    storage::Bin,
};

pub const DEFAULT_POOL_SIZE: usize = 4;
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Buffers in flight, which is also the number of concurrent transfers.
    pub pool_size: usize,
    pub progress_interval: Duration,
    /// Pause after the last transfer before returning.
    pub grace_period: Duration,
    /// Prefixes (regular expressions) of root-relative paths to upload.
    /// Empty selects everything.
    pub filters: Vec<String>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            grace_period: Duration::ZERO,
            filters: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct JobFailure {
    pub store: String,
    pub path: PathBuf,
    pub offset: u64,
    pub error: Error,
}

#[derive(Debug, Default)]
pub struct UploadReport {
    pub jobs: usize,
    /// Jobs never started because the run was cancelled or aborted.
    pub abandoned: usize,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    pub failed: Vec<JobFailure>,
    pub cancelled: bool,
}

impl UploadReport {
    pub fn into_result(self) -> Result<Self> {
        if !self.failed.is_empty() {
            return Err(Error::UploadFailed {
                failed: self.failed.len(),
                total: self.jobs,
            });
        }
        if self.cancelled {
            return Err(Error::Cancelled);
        }
        Ok(self)
    }
}

#[derive(Debug)]
struct Job {
    store: usize,
    path: PathBuf,
    chunk: Chunk,
}

/// Uploads every chunk of the latest snapshot that a store does not have
/// yet.
#[instrument(skip_all, fields(root = %set.root().display(), stores = stores.len()), err)]
pub async fn upload(
    set: &SnapshotSet,
    stores: &[Bin],
    options: &UploadOptions,
    cancel: CancellationToken,
) -> Result<UploadReport> {
    if stores.is_empty() {
        return Err(Error::NoStores);
    }
    let Some(latest) = set.latest() else {
        info!("no snapshot to upload");
        return Ok(UploadReport::default());
    };

    let filters = options
        .filters
        .iter()
        .map(|f| Regex::new(&format!("^(?:{f})")))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let jobs = collect_jobs(latest, stores, &filters).await?;
    let total_bytes = jobs.iter().map(|j| j.chunk.length).sum();
    info!(jobs = jobs.len(), total_bytes, "upload planned");

    let mut report = UploadReport {
        jobs: jobs.len(),
        total_bytes,
        ..Default::default()
    };
    if jobs.is_empty() {
        return Ok(report);
    }

    // Chunks never exceed the chunk size the snapshot was taken with, so
    // memory stays within pool_size * max_chunk_size.
    let largest = jobs.iter().map(|j| j.chunk.length).max().unwrap_or(0) as usize;
    let pool = BufferPool::new(options.pool_size.max(1), largest);
    let progress = Progress::new(total_bytes);
    let stop_reporter = CancellationToken::new();
    let reporter = progress
        .clone()
        .spawn_reporter(options.progress_interval, stop_reporter.clone());

    // Cancelled by the caller, or by a job that found its source changed.
    let abort = cancel.child_token();
    let root: Arc<Path> = set.root().into();
    let mut tasks = JoinSet::new();
    let mut dispatched = 0;

    for job in jobs {
        let buf = tokio::select! {
            biased;
            _ = abort.cancelled() => break,
            buf = pool.acquire() => match buf {
                Ok(buf) => buf,
                Err(_) => break,
            },
        };

        let bin = stores[job.store].clone();
        tasks.spawn(run_job(
            job,
            bin,
            root.clone(),
            buf,
            progress.clone(),
            abort.clone(),
        ));
        dispatched += 1;
    }
    report.abandoned = report.jobs - dispatched;

    let mut panicked = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Some(failure)) => report.failed.push(failure),
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "upload task failed");
                panicked.get_or_insert(e);
            }
        }
    }

    stop_reporter.cancel();
    reporter.await?;
    if let Some(e) = panicked {
        return Err(e.into());
    }

    if dispatched > 0 && !options.grace_period.is_zero() {
        debug!(grace = ?options.grace_period, "waiting before exit");
        tokio::time::sleep(options.grace_period).await;
    }

    progress.log();
    report.uploaded_bytes = progress.uploaded();
    report.cancelled = cancel.is_cancelled();
    info!(
        jobs = report.jobs,
        abandoned = report.abandoned,
        failed = report.failed.len(),
        uploaded_bytes = report.uploaded_bytes,
        cancelled = report.cancelled,
        "upload finished"
    );
    Ok(report)
}

/// One job per chunk missing from a store. A chunk shared by several
/// files is only sent once per store.
async fn collect_jobs(snapshot: &Snapshot, stores: &[Bin], filters: &[Regex]) -> Result<Vec<Job>> {
    let mut seen = HashSet::new();
    let mut jobs = Vec::new();

    for (path, file) in &snapshot.files {
        if !filters.is_empty() {
            let relative = path.to_string_lossy().replace(MAIN_SEPARATOR, "/");
            if !filters.iter().any(|f| f.is_match(&relative)) {
                continue;
            }
        }

        for chunk in file.chunks.iter() {
            for (index, bin) in stores.iter().enumerate() {
                if !seen.insert((index, chunk.key())) {
                    continue;
                }
                if bin.exists(chunk.length, &chunk.digest).await? {
                    continue;
                }
                jobs.push(Job {
                    store: index,
                    path: path.clone(),
                    chunk: *chunk,
                });
            }
        }
    }

    Ok(jobs)
}

async fn run_job(
    job: Job,
    bin: Bin,
    root: Arc<Path>,
    buf: PooledBuffer,
    progress: Arc<Progress>,
    abort: CancellationToken,
) -> Option<JobFailure> {
    let Job { path, chunk, .. } = job;
    let failure = |error| JobFailure {
        store: bin.name().to_string(),
        path: path.clone(),
        offset: chunk.offset,
        error,
    };

    let length = chunk.length as usize;

    let source = root.join(&path);
    let read = tokio::task::spawn_blocking(move || {
        let mut buf = buf;
        let result = read_chunk(&source, chunk.offset, &mut buf[..length]);
        (buf, result.map_err(|e| (source, e)))
    })
    .await;

    let buf = match read {
        Ok((buf, Ok(()))) => buf,
        Ok((_buf, Err((source, e)))) => {
            error!(
                path = %source.display(),
                offset = chunk.offset,
                error = %e,
                "source changed since snapshot, stopping"
            );
            abort.cancel();
            return Some(failure(Error::SourceChanged {
                path: source,
                offset: chunk.offset,
                source: e,
            }));
        }
        Err(e) => return Some(failure(e.into())),
    };

    match bin.store(chunk.length, &chunk.digest, &buf[..length]).await {
        Ok(()) => {
            debug!(bin = bin.name(), key = %chunk.key(), "uploaded");
            progress.add(chunk.length);
            None
        }
        Err(e) => {
            warn!(
                bin = bin.name(),
                path = %path.display(),
                offset = chunk.offset,
                error = %e,
                "upload failed"
            );
            Some(failure(e))
        }
    }
}

fn read_chunk(path: &Path, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    let file = Arc::new(FileLock::open(path)?);
    SliceReader::new(file, offset, buf.len() as u64).read_exact(buf)
}
