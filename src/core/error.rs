use crate::storage::StorageError;
use thiserror::Error;

/// Errors surfaced by the consensus module
#[derive(Debug, Error)]
pub enum RaftError {
    /// This node is not the leader
    #[error("not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<u64> },

    /// The module has been shut down and no longer serves requests
    #[error("consensus module stopped")]
    Stopped,

    /// Persistent state could not be written or read; the node is dead
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    /// The call was dropped by the fault-injection proxy
    #[error("rpc dropped")]
    Dropped,
}

pub type Result<T> = std::result::Result<T, RaftError>;
