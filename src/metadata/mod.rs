use std::{
    collections::BTreeMap,
    fs,
    io::{self, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, instrument};

use crate::{
    error::{Error, Result},
    hash::{BlobKey, Digest},
};

pub use self::bincode::BincodeStore;
pub use self::compressed::Compressed;

mod bincode;
mod compressed;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub offset: u64,
    pub length: u64,
    pub digest: Digest,
}

impl Chunk {
    pub fn key(&self) -> BlobKey {
        BlobKey::new(self.length, self.digest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    /// Relative to the snapshot root.
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
    /// Digest of the whole file content.
    pub digest: Digest,
    pub chunks: Arc<[Chunk]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub time: SystemTime,
    pub files: BTreeMap<PathBuf, File>,
}

impl Snapshot {
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|f| f.size).sum()
    }
}

/// Chronological history of snapshots taken of one directory.
#[derive(Debug, Clone)]
pub struct SnapshotSet {
    root: PathBuf,
    snapshots: Vec<Snapshot>,
}

impl SnapshotSet {
    pub fn new<P: Into<PathBuf>>(root: P) -> Result<Self> {
        let root = root.into();
        if !fs::metadata(&root)?.is_dir() {
            return Err(Error::NotADirectory(root));
        }

        Ok(Self {
            root,
            snapshots: Vec::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }

    pub fn push(&mut self, snapshot: Snapshot) {
        self.snapshots.push(snapshot);
    }

    /// Loads the persisted history. A missing file leaves the set untouched.
    #[instrument(skip(self), fields(root = %self.root.display()), err)]
    pub fn load(&mut self, path: &Path) -> Result<()> {
        let Some(snapshots) = read_optional::<_, Vec<Snapshot>>(&Compressed(BincodeStore), path)?
        else {
            debug!("no snapshot file yet");
            return Ok(());
        };

        self.snapshots = snapshots;
        debug!(count = self.snapshots.len(), "loaded snapshots");
        Ok(())
    }

    #[instrument(skip(self), fields(root = %self.root.display()), err)]
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(&Compressed(BincodeStore), &self.snapshots, path)
    }
}

pub trait MetadataStore {
    fn open<T: DeserializeOwned, R: Read>(&self, reader: R) -> io::Result<T>;
    fn save<T: Serialize, W: Write>(&self, value: &T, writer: W) -> io::Result<()>;
}

/// Decodes `path`, or returns `None` when it does not exist.
pub fn read_optional<S, T>(store: &S, path: &Path) -> Result<Option<T>>
where
    S: MetadataStore,
    T: DeserializeOwned,
{
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    Ok(Some(store.open(BufReader::new(file))?))
}

/// Writes `value` next to `path` and renames it into place, so a failure
/// never clobbers the previous content.
pub fn write_atomic<S, T>(store: &S, value: &T, path: &Path) -> Result<()>
where
    S: MetadataStore,
    T: Serialize,
{
    let tmp = temp_path(path);

    let write = || -> io::Result<()> {
        let file = fs::File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        store.save(value, &mut writer)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };

    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::persist(path, e)
    })
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".new");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn sample_snapshot(seed: &[u8]) -> Snapshot {
        let chunks: Arc<[Chunk]> = vec![Chunk {
            offset: 0,
            length: seed.len() as u64,
            digest: Digest::of(seed),
        }]
        .into();
        let file = File {
            path: PathBuf::from("dir/file.bin"),
            size: seed.len() as u64,
            modified: SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            digest: Digest::of(seed),
            chunks,
        };

        Snapshot {
            time: SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_100),
            files: BTreeMap::from([(file.path.clone(), file)]),
        }
    }

    #[test]
    fn load_missing_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = SnapshotSet::new(dir.path()).unwrap();

        set.load(&dir.path().join("absent.snapshots")).unwrap();
        assert!(set.snapshots().is_empty());
        assert!(set.latest().is_none());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("set.snapshots");

        let mut set = SnapshotSet::new(dir.path()).unwrap();
        set.push(sample_snapshot(b"first"));
        set.push(sample_snapshot(b"second"));
        set.save(&path).unwrap();
        assert!(!temp_path(&path).exists());

        let mut loaded = SnapshotSet::new(dir.path()).unwrap();
        loaded.load(&path).unwrap();
        assert_eq!(loaded.snapshots(), set.snapshots());
        assert_eq!(loaded.latest(), set.latest());
    }

    #[test]
    fn set_file_is_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("set.snapshots");

        let mut set = SnapshotSet::new(dir.path()).unwrap();
        set.push(sample_snapshot(b"gz"));
        set.save(&path).unwrap();

        let raw = fs::read(&path).unwrap();
        assert_eq!(&raw[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn failed_save_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("set.snapshots");

        let mut set = SnapshotSet::new(dir.path()).unwrap();
        set.push(sample_snapshot(b"kept"));
        set.save(&path).unwrap();

        // A directory squatting on the temp name makes the next save fail.
        fs::create_dir(temp_path(&path)).unwrap();
        set.push(sample_snapshot(b"lost"));
        let err = set.save(&path).unwrap_err();
        assert!(matches!(err, Error::Persist { .. }));

        let mut loaded = SnapshotSet::new(dir.path()).unwrap();
        loaded.load(&path).unwrap();
        assert_eq!(loaded.snapshots().len(), 1);
    }

    #[test]
    fn root_must_be_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        fs::write(&file, b"x").unwrap();

        assert!(matches!(
            SnapshotSet::new(&file),
            Err(Error::NotADirectory(_))
        ));
    }
}
