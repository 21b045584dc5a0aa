//! Transport layer for Raft RPC communication
//!
//! - `Transport`: outbound calls, addressed by peer id
//! - `RpcHandler`: inbound side, implemented by the shared consensus core
//!   and by decorators such as `RpcProxy`
//! - `inmemory`: channel-based transport for testing
//! - `http`: axum router for inbound RPCs plus reqwest peer clients

pub mod http;
pub mod inmemory;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::core::error::RaftError;
use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, RaftCore, RequestVoteArgs, RequestVoteResult,
};

/// Transport abstraction for Raft RPC communication
///
/// Errors are never retried here; the replication and election loops
/// simply try again on their next cycle.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a RequestVote RPC to a peer node
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError>;

    /// Send an AppendEntries RPC to a peer node
    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError>;
}

/// Receiving end of the two Raft RPCs
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteResult, RaftError>;

    async fn append_entries(&self, args: AppendEntriesArgs)
        -> Result<AppendEntriesResult, RaftError>;
}

/// Errors that can occur during transport operations
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// No connection to this peer (never connected, or disconnected)
    #[error("peer {0} is not connected")]
    PeerDisconnected(u64),
    /// Request timed out
    #[error("rpc timed out")]
    Timeout,
    /// Connection to the target node failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// The peer answered but refused to serve the call
    #[error("peer refused call: {0}")]
    Remote(String),
}

/// Inbound RPCs lock the core only for the duration of the handler
#[async_trait]
impl RpcHandler for Mutex<RaftCore> {
    async fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteResult, RaftError> {
        self.lock().await.handle_request_vote(&args)
    }

    async fn append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, RaftError> {
        self.lock().await.handle_append_entries(&args)
    }
}

#[async_trait]
impl<H: RpcHandler + ?Sized> RpcHandler for Arc<H> {
    async fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteResult, RaftError> {
        (**self).request_vote(args).await
    }

    async fn append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, RaftError> {
        (**self).append_entries(args).await
    }
}
