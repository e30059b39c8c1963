use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Serialize, de::DeserializeOwned};
use tracing::instrument;

use crate::{
    error::Result,
    metadata::{self, BincodeStore},
};

/// Durable key/value settings. Every `set` rewrites the whole file
/// atomically.
#[derive(Debug)]
pub struct Settings {
    path: PathBuf,
    values: BTreeMap<String, Vec<u8>>,
}

impl Settings {
    #[instrument(err)]
    pub fn open(path: &Path) -> Result<Self> {
        let values = metadata::read_optional(&BincodeStore, path)?.unwrap_or_default();

        Ok(Self {
            path: path.to_path_buf(),
            values,
        })
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.values
            .get(key)
            .map(|raw| bincode::deserialize(raw))
            .transpose()
            .map_err(Into::into)
    }

    #[instrument(skip(self, value), err)]
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        self.values
            .insert(key.to_string(), bincode::serialize(value)?);
        metadata::write_atomic(&BincodeStore, &self.values, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings");

        let mut settings = Settings::open(&path).unwrap();
        assert_eq!(settings.get::<String>("missing").unwrap(), None);

        settings
            .set("stores", &vec![PathBuf::from("/mnt/a"), PathBuf::from("/mnt/b")])
            .unwrap();
        settings.set("token", &"secret".to_string()).unwrap();

        let reopened = Settings::open(&path).unwrap();
        assert_eq!(
            reopened.get::<Vec<PathBuf>>("stores").unwrap(),
            Some(vec![PathBuf::from("/mnt/a"), PathBuf::from("/mnt/b")])
        );
        assert_eq!(
            reopened.get::<String>("token").unwrap().as_deref(),
            Some("secret")
        );
    }
}
