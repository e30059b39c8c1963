use std::{
    collections::{BTreeMap, HashMap},
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::{
    error::Result,
    hash::Digest,
    ignore::IgnoreRules,
    metadata::{self, BincodeStore, Chunk, File, Snapshot, SnapshotSet},
    reader::{Chunker, ChunkerConfig, Hashed},
};

pub const DEFAULT_CACHE_INTERVAL: Duration = Duration::from_secs(10);

/// How far a file's previous chunk list is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Reuse when size and modification time are unchanged. No read.
    FastCheck,
    /// Reuse when the first chunk still hashes the same.
    FastHash,
    /// Always rehash. Identical content seen before shares its chunk list.
    #[default]
    FullHash,
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub strategy: Strategy,
    pub chunker: ChunkerConfig,
    /// Where partial results of this scan are checkpointed.
    pub cache_path: Option<PathBuf>,
    /// Pick up files from an existing checkpoint instead of rescanning them.
    pub resume: bool,
    pub cache_interval: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            chunker: ChunkerConfig::default(),
            cache_path: None,
            resume: false,
            cache_interval: DEFAULT_CACHE_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub files: usize,
    pub hashed: usize,
    pub reused: usize,
    pub from_cache: usize,
    pub ignored: usize,
    pub skipped: usize,
    pub bytes_hashed: u64,
}

/// Walks the set's root and appends a new snapshot to it. The caller
/// persists the set afterwards.
#[instrument(skip(set, options), fields(root = %set.root().display(), strategy = ?options.strategy), err)]
pub fn snapshot(set: &mut SnapshotSet, options: &ScanOptions) -> Result<ScanStats> {
    let root = set.root().to_path_buf();
    let rules = IgnoreRules::load(&root)?;
    let chunker = Chunker::new(options.chunker);

    let mut cached = match (&options.cache_path, options.resume) {
        (Some(path), true) => {
            let cached = metadata::read_optional::<_, BTreeMap<PathBuf, File>>(&BincodeStore, path)?
                .unwrap_or_default();
            info!(count = cached.len(), "read files from cache");
            cached
        }
        _ => BTreeMap::new(),
    };

    let previous = set.latest().map(|s| &s.files);
    let mut history = ContentIndex::default();
    if options.strategy == Strategy::FullHash {
        for file in set.snapshots().iter().flat_map(|s| s.files.values()) {
            history.insert(file);
        }
    }

    let mut stats = ScanStats::default();
    let mut files = BTreeMap::new();
    let mut checkpoint = Checkpoint::new(options);

    for entry in WalkDir::new(&root).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                if e.io_error().map(io::Error::kind) == Some(io::ErrorKind::PermissionDenied) {
                    debug!(path = ?e.path(), "permission denied, skipping");
                } else {
                    warn!(error = %e, "cannot walk entry, skipping");
                }
                stats.skipped += 1;
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        checkpoint.maybe_write(&files)?;

        let relative = match entry.path().strip_prefix(&root) {
            Ok(relative) => relative.to_path_buf(),
            Err(_) => continue,
        };
        let Some(relative_str) = relative.to_str() else {
            warn!(path = %relative.display(), "path is not valid UTF-8, skipping");
            stats.skipped += 1;
            continue;
        };
        let relative_str = relative_str.replace(std::path::MAIN_SEPARATOR, "/");

        if let Some(rule) = rules.matching(&relative_str) {
            debug!(path = %relative_str, rule = %rule, "ignored");
            stats.ignored += 1;
            continue;
        }

        if let Some(file) = cached.remove(&relative) {
            debug!(path = %relative_str, "taken from cache");
            stats.from_cache += 1;
            files.insert(relative, file);
            continue;
        }

        debug!(path = %relative_str, "checking");
        let old = previous.and_then(|p| p.get(&relative));
        match scan_file(entry.path(), &relative, old, options.strategy, &chunker, &history) {
            Ok(scanned) => {
                if scanned.reused {
                    stats.reused += 1;
                } else {
                    stats.hashed += 1;
                }
                stats.bytes_hashed += scanned.bytes_read;
                if options.strategy == Strategy::FullHash {
                    history.insert(&scanned.file);
                }
                files.insert(relative, scanned.file);
            }
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "cannot read file, skipping");
                stats.skipped += 1;
            }
        }
    }

    stats.files = files.len();
    set.push(Snapshot {
        time: SystemTime::now(),
        files,
    });

    info!(
        files = stats.files,
        hashed = stats.hashed,
        reused = stats.reused,
        from_cache = stats.from_cache,
        ignored = stats.ignored,
        skipped = stats.skipped,
        bytes_hashed = stats.bytes_hashed,
        "snapshot taken"
    );
    Ok(stats)
}

/// Deletes the checkpoint of a finished scan.
pub fn remove_cache(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

struct Scanned {
    file: File,
    reused: bool,
    bytes_read: u64,
}

fn scan_file(
    path: &Path,
    relative: &Path,
    old: Option<&File>,
    strategy: Strategy,
    chunker: &Chunker,
    history: &ContentIndex,
) -> io::Result<Scanned> {
    let meta = fs::metadata(path)?;
    let size = meta.len();
    let modified = meta.modified()?;

    // A reused chunk list keeps describing the old size.
    let reuse = |old: &File, bytes_read| Scanned {
        file: File {
            path: relative.to_path_buf(),
            size: old.size,
            modified,
            digest: old.digest,
            chunks: old.chunks.clone(),
        },
        reused: true,
        bytes_read,
    };

    let mut sampled = 0;
    match (strategy, old) {
        (Strategy::FastCheck, Some(old)) if old.size == size && old.modified == modified => {
            return Ok(reuse(old, 0));
        }
        (Strategy::FastHash, Some(old)) => {
            let prefix = chunker.hash_file(path, Some(1))?;
            sampled = prefix.size;
            if prefix.chunks.first().map(Chunk::key) == old.chunks.first().map(Chunk::key) {
                return Ok(reuse(old, sampled));
            }
        }
        _ => {}
    }

    let Hashed {
        chunks,
        size: hashed_size,
        digest,
    } = chunker.hash_file(path, None)?;
    if hashed_size != size {
        warn!(path = %path.display(), size, hashed_size, "file changed while scanning");
    }

    let chunks = history
        .get(hashed_size, &digest)
        .filter(|known| known.as_ref() == chunks.as_slice())
        .unwrap_or_else(|| chunks.into());

    Ok(Scanned {
        file: File {
            path: relative.to_path_buf(),
            size: hashed_size,
            modified,
            digest,
            chunks,
        },
        reused: false,
        bytes_read: sampled + hashed_size,
    })
}

/// Chunk lists of previously seen content, keyed by whole-file identity.
#[derive(Default)]
struct ContentIndex {
    by_content: HashMap<(u64, Digest), Arc<[Chunk]>>,
}

impl ContentIndex {
    fn insert(&mut self, file: &File) {
        self.by_content
            .entry((file.size, file.digest))
            .or_insert_with(|| file.chunks.clone());
    }

    fn get(&self, size: u64, digest: &Digest) -> Option<Arc<[Chunk]>> {
        self.by_content.get(&(size, *digest)).cloned()
    }
}

/// Periodic checkpoint of the files scanned so far. The interval grows
/// with the time the last write took.
struct Checkpoint<'a> {
    path: Option<&'a Path>,
    base: Duration,
    due: Instant,
}

impl<'a> Checkpoint<'a> {
    fn new(options: &'a ScanOptions) -> Self {
        Self {
            path: options.cache_path.as_deref(),
            base: options.cache_interval,
            due: Instant::now() + options.cache_interval,
        }
    }

    fn maybe_write(&mut self, files: &BTreeMap<PathBuf, File>) -> Result<()> {
        let Some(path) = self.path else {
            return Ok(());
        };
        if Instant::now() < self.due {
            return Ok(());
        }

        let started = Instant::now();
        metadata::write_atomic(&BincodeStore, files, path)?;
        let took = started.elapsed();
        debug!(count = files.len(), ?took, "cache saved");

        self.due = Instant::now() + self.base.max(took * 10);
        Ok(())
    }
}
