//! File-based storage implementation
//!
//! Every key lives in its own file `<dir>/<key>.dat` laid out as
//! `{crc32_hex}\n{value bytes}`. Writes go to a temp file which is
//! fsynced and renamed over the old one, so a crash leaves either the old
//! or the new value, and the checksum catches anything torn in between.

use super::{Storage, StorageError};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const EXTENSION: &str = "dat";

/// File-based storage implementation
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Create a new FileStorage in the given directory
    /// Creates the directory if it doesn't exist
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(FileStorage { dir })
    }

    fn key_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StorageError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("invalid storage key {:?}", key),
            )));
        }
        Ok(self.dir.join(format!("{}.{}", key, EXTENSION)))
    }

    /// Atomically replace `path` (write to temp, fsync, rename, fsync dir)
    fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        let temp_path = path.with_extension("tmp");

        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)?;

        // The rename itself must survive a crash too.
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

fn encode(value: &[u8]) -> Vec<u8> {
    let mut out = format!("{:08x}\n", crc32fast::hash(value)).into_bytes();
    out.extend_from_slice(value);
    out
}

fn decode(path: &Path, raw: &[u8]) -> Result<Vec<u8>, StorageError> {
    let split = raw.iter().position(|b| *b == b'\n').ok_or_else(|| {
        StorageError::Corruption(format!("missing checksum header in {:?}", path))
    })?;
    let (header, value) = (&raw[..split], &raw[split + 1..]);

    let stored = std::str::from_utf8(header)
        .ok()
        .and_then(|h| u32::from_str_radix(h, 16).ok())
        .ok_or_else(|| StorageError::Corruption(format!("invalid checksum format in {:?}", path)))?;
    let computed = crc32fast::hash(value);

    if stored != computed {
        return Err(StorageError::Corruption(format!(
            "checksum mismatch in {:?}: stored {:08x}, computed {:08x}",
            path, stored, computed
        )));
    }
    Ok(value.to_vec())
}

impl Storage for FileStorage {
    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let path = self.key_path(key)?;
        self.atomic_write(&path, &encode(&value))
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.key_path(key)?;
        match fs::read(&path) {
            Ok(raw) => decode(&path, &raw).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn has_data(&self) -> Result<bool, StorageError> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == EXTENSION) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
