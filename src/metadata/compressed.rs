use std::io::{self, Read, Write};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Serialize, de::DeserializeOwned};

use super::MetadataStore;

/// Wraps another store in a gzip stream.
pub struct Compressed<S>(pub S);

impl<S: MetadataStore> MetadataStore for Compressed<S> {
    fn open<T: DeserializeOwned, R: Read>(&self, reader: R) -> io::Result<T> {
        self.0.open(GzDecoder::new(reader))
    }

    fn save<T: Serialize, W: Write>(&self, value: &T, writer: W) -> io::Result<()> {
        let mut encoder = GzEncoder::new(writer, Compression::default());
        self.0.save(value, &mut encoder)?;
        encoder.finish()?;
        Ok(())
    }
}
