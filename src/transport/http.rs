//! HTTP transport implementation for Raft RPC
//!
//! Uses axum for the inbound side and reqwest for outbound peer calls.
//! Both RPCs are `POST /raft/<method>` with JSON bodies. A handler that
//! refuses to serve (stopped module, dropped by the fault proxy) answers
//! 503, which callers treat like an unreachable peer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use crate::core::error::RaftError;
use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, RequestVoteArgs, RequestVoteResult,
};
use crate::transport::{RpcHandler, Transport, TransportError};

pub const REQUEST_VOTE_PATH: &str = "/raft/request_vote";
pub const APPEND_ENTRIES_PATH: &str = "/raft/append_entries";

/// Outbound client map: one base URL per connected peer
pub struct PeerSet {
    peers: Mutex<HashMap<u64, String>>,
    /// HTTP client with timeout
    client: reqwest::Client,
}

impl PeerSet {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        Ok(PeerSet {
            peers: Mutex::new(HashMap::new()),
            client,
        })
    }

    /// Start routing calls for `peer` to `addr`. No-op if already connected.
    /// Returns true if a new connection was recorded.
    pub fn connect(&self, peer: u64, addr: SocketAddr) -> bool {
        let mut peers = self.peers.lock();
        if peers.contains_key(&peer) {
            return false;
        }
        peers.insert(peer, format!("http://{}", addr));
        true
    }

    /// Stop routing calls to `peer`. No-op if not connected.
    pub fn disconnect(&self, peer: u64) -> bool {
        self.peers.lock().remove(&peer).is_some()
    }

    pub fn disconnect_all(&self) {
        self.peers.lock().clear();
    }

    pub fn is_connected(&self, peer: u64) -> bool {
        self.peers.lock().contains_key(&peer)
    }

    async fn call<A: Serialize + Sync, R: DeserializeOwned + Send>(
        &self,
        target: u64,
        path: &str,
        args: &A,
    ) -> Result<R, TransportError> {
        let base = self
            .peers
            .lock()
            .get(&target)
            .cloned()
            .ok_or(TransportError::PeerDisconnected(target))?;

        let response = self
            .client
            .post(format!("{}{}", base, path))
            .json(args)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::ConnectionFailed(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Remote(format!("{}: {}", status, body)));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
    }
}

#[async_trait]
impl Transport for PeerSet {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        self.call(target, REQUEST_VOTE_PATH, &args).await
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        self.call(target, APPEND_ENTRIES_PATH, &args).await
    }
}

/// Create an axum router dispatching Raft RPCs to `handler`
pub fn create_router<H: RpcHandler + 'static>(handler: Arc<H>) -> Router {
    Router::new()
        .route(REQUEST_VOTE_PATH, post(handle_request_vote::<H>))
        .route(APPEND_ENTRIES_PATH, post(handle_append_entries::<H>))
        .with_state(handler)
}

struct Refused(RaftError);

impl IntoResponse for Refused {
    fn into_response(self) -> Response {
        (StatusCode::SERVICE_UNAVAILABLE, self.0.to_string()).into_response()
    }
}

async fn handle_request_vote<H: RpcHandler>(
    State(handler): State<Arc<H>>,
    Json(args): Json<RequestVoteArgs>,
) -> Result<Json<RequestVoteResult>, Refused> {
    handler.request_vote(args).await.map(Json).map_err(Refused)
}

async fn handle_append_entries<H: RpcHandler>(
    State(handler): State<Arc<H>>,
    Json(args): Json<AppendEntriesArgs>,
) -> Result<Json<AppendEntriesResult>, Refused> {
    handler.append_entries(args).await.map(Json).map_err(Refused)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RaftConfig;
    use crate::core::raft_core::RaftCore;
    use crate::storage::MemoryStorage;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    type SharedCore = Arc<tokio::sync::Mutex<RaftCore>>;

    fn new_test_core(id: u64, peers: Vec<u64>) -> SharedCore {
        let (tx, _rx) = mpsc::unbounded_channel();
        let core = RaftCore::new(id, peers, Arc::new(MemoryStorage::new()), tx, RaftConfig::default())
            .unwrap();
        Arc::new(tokio::sync::Mutex::new(core))
    }

    /// Serve `core` on an ephemeral port and return a PeerSet connected to it as peer 2
    async fn serve(core: SharedCore) -> PeerSet {
        let router = create_router(core);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let peers = PeerSet::new(Duration::from_secs(5)).unwrap();
        assert!(peers.connect(2, addr));
        peers
    }

    #[tokio::test]
    async fn test_http_request_vote() {
        let core2 = new_test_core(2, vec![1, 3]);
        let peers = serve(core2.clone()).await;

        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        };
        let result = peers.request_vote(2, args).await.unwrap();

        assert!(result.vote_granted);
        assert_eq!(result.term, 1);
        assert_eq!(core2.lock().await.voted_for, Some(1));
    }

    #[tokio::test]
    async fn test_http_append_entries() {
        let core2 = new_test_core(2, vec![1, 3]);
        let peers = serve(core2.clone()).await;

        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![crate::core::raft_core::LogEntry {
                term: 1,
                command: serde_json::json!({"op": "set", "key": "x"}),
            }],
            leader_commit: 0,
        };
        let result = peers.append_entries(2, args).await.unwrap();

        assert!(result.success);
        assert_eq!(core2.lock().await.log.len(), 1);
    }

    #[tokio::test]
    async fn test_http_stopped_node_answers_unavailable() {
        let core2 = new_test_core(2, vec![1, 3]);
        core2.lock().await.stop();
        let peers = serve(core2).await;

        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        };
        let result = peers.request_vote(2, args).await;
        assert!(matches!(result, Err(TransportError::Remote(_))));
    }

    #[tokio::test]
    async fn test_http_connection_refused() {
        // Grab a free port, then close it so nothing is listening
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let peers = PeerSet::new(Duration::from_millis(100)).unwrap();
        peers.connect(2, addr);

        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        };
        let result = peers.request_vote(2, args).await;

        assert!(matches!(
            result,
            Err(TransportError::ConnectionFailed(_)) | Err(TransportError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_are_idempotent() {
        let peers = PeerSet::new(Duration::from_secs(1)).unwrap();
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();

        assert!(peers.connect(3, addr));
        assert!(!peers.connect(3, addr));
        assert!(peers.is_connected(3));

        assert!(peers.disconnect(3));
        assert!(!peers.disconnect(3));
        assert!(!peers.is_connected(3));

        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        };
        let result = peers.request_vote(3, args).await;
        assert!(matches!(result, Err(TransportError::PeerDisconnected(3))));
    }
}
