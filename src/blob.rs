use std::fs;
use std::io::Write;
use std::path::PathBuf;

use serde_json::{Map, Value};
use tracing::info;

use crate::error::StoreError;
use crate::listing::NormalizedListing;

/// Durable named blobs. A write replaces the whole blob or nothing.
pub trait BlobStore {
    fn write(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError>;
    fn read(&self, name: &str) -> Result<Vec<u8>, StoreError>;
}

/// Blobs as files under one directory.
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl BlobStore for FsBlobStore {
    fn write(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp = self.dir.join(format!(".{}.tmp", name));
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, self.path(name))?;
        Ok(())
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        match fs::read(self.path(name)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::MissingBlob(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Serialise a batch as newline-delimited JSON, one listing per line.
pub fn to_ndjson(listings: &[NormalizedListing]) -> Result<Vec<u8>, StoreError> {
    let mut out = Vec::new();
    for (i, listing) in listings.iter().enumerate() {
        serde_json::to_writer(&mut out, listing).map_err(|e| StoreError::Json {
            line: i + 1,
            message: e.to_string(),
        })?;
        out.push(b'\n');
    }
    Ok(out)
}

/// Write the batch to `name`, replacing the previous run's blob.
pub fn materialize(
    store: &dyn BlobStore,
    name: &str,
    listings: &[NormalizedListing],
) -> Result<usize, StoreError> {
    let bytes = to_ndjson(listings)?;
    store.write(name, &bytes)?;
    info!(blob = name, records = listings.len(), bytes = bytes.len(), "materialized batch");
    Ok(bytes.len())
}

/// Parse newline-delimited JSON objects; blank lines are ignored.
pub fn parse_ndjson(bytes: &[u8]) -> Result<Vec<Map<String, Value>>, StoreError> {
    let text = std::str::from_utf8(bytes).map_err(|e| StoreError::Json {
        line: 0,
        message: e.to_string(),
    })?;

    let mut records = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => records.push(map),
            Ok(other) => {
                return Err(StoreError::Json {
                    line: i + 1,
                    message: format!("expected an object, got {}", other),
                })
            }
            Err(e) => {
                return Err(StoreError::Json {
                    line: i + 1,
                    message: e.to_string(),
                })
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
pub(crate) mod memory {
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    use super::*;

    /// In-memory store for tests; can be told to fail writes.
    #[derive(Default)]
    pub struct MemoryBlobStore {
        pub blobs: RefCell<HashMap<String, Vec<u8>>>,
        pub fail_writes: Cell<bool>,
    }

    impl BlobStore for MemoryBlobStore {
        fn write(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
            if self.fail_writes.get() {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "bucket is read-only",
                )));
            }
            self.blobs.borrow_mut().insert(name.to_string(), bytes.to_vec());
            Ok(())
        }

        fn read(&self, name: &str) -> Result<Vec<u8>, StoreError> {
            self.blobs
                .borrow()
                .get(name)
                .cloned()
                .ok_or_else(|| StoreError::MissingBlob(name.to_string()))
        }
    }
}
