use std::io::{self, Read, Write};

use serde::{Serialize, de::DeserializeOwned};

use super::MetadataStore;

pub struct BincodeStore;

impl MetadataStore for BincodeStore {
    fn open<T: DeserializeOwned, R: Read>(&self, reader: R) -> io::Result<T> {
        bincode::deserialize_from(reader).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn save<T: Serialize, W: Write>(&self, value: &T, writer: W) -> io::Result<()> {
        bincode::serialize_into(writer, value).map_err(io::Error::other)
    }
}
