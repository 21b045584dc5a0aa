//! Storage abstraction for Raft persistent state
//!
//! Raft requires `current_term`, `voted_for` and the log to reach stable
//! storage before the node replies to an RPC that depends on them. The
//! consensus module only sees a small key/value contract:
//! - `MemoryStorage`: in-process map, NOT crash-durable, for tests
//! - `FileStorage`: one checksummed file per key, fsynced on every write

pub mod file;
pub mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error (e.g., disk full, permission denied)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Data corruption detected
    #[error("data corruption: {0}")]
    Corruption(String),
    /// A stored value could not be encoded or decoded
    #[error("codec error for key {key}: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Key/value store for the persistent Raft state.
///
/// `set` must be durable before it returns for the backend to be safe
/// across crashes. Methods take `&self` so one store can be shared by a
/// node and by whoever restarts it later.
pub trait Storage: Send + Sync {
    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Fetch the value stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Whether anything has ever been stored.
    fn has_data(&self) -> Result<bool, StorageError>;
}
