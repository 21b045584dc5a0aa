//! In-memory storage implementation
//!
//! Satisfies the `Storage` contract but loses everything when the process
//! exits. Use it for tests and for crash/restart simulation inside a
//! single process, never for a real deployment.

use super::{Storage, StorageError};
use parking_lot::Mutex;
use std::collections::HashMap;

/// In-memory storage backed by a mutex-guarded map
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.data.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.lock().get(key).cloned())
    }

    fn has_data(&self) -> Result<bool, StorageError> {
        Ok(!self.data.lock().is_empty())
    }
}
