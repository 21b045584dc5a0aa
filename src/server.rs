//! Server - hosts one consensus module behind an HTTP listener
//!
//! Inbound RPCs pass through the fault proxy before reaching the core.
//! Outbound calls go through a `PeerSet` the orchestrator wires up with
//! `connect_to_peer` / `disconnect_peer`.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::core::config::RaftConfig;
use crate::core::error::RaftError;
use crate::core::raft_core::{CommitEntry, RaftCore};
use crate::core::raft_node::RaftNode;
use crate::core::raft_server::{RaftHandle, RaftServer};
use crate::proxy::{FaultConfig, RpcProxy};
use crate::storage::Storage;
use crate::transport::http::{create_router, PeerSet};
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Raft(#[from] RaftError),
}

/// Static settings for one server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub id: u64,
    pub peer_ids: Vec<u64>,
    pub bind: SocketAddr,
    pub raft: RaftConfig,
    pub faults: FaultConfig,
}

impl ServerConfig {
    /// Loopback on an ephemeral port, default timings, jitter-only delivery
    pub fn new(id: u64, peer_ids: Vec<u64>) -> Self {
        Self {
            id,
            peer_ids,
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            raft: RaftConfig::default(),
            faults: FaultConfig::default(),
        }
    }

    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    pub fn with_raft(mut self, raft: RaftConfig) -> Self {
        self.raft = raft;
        self
    }

    pub fn with_faults(mut self, faults: FaultConfig) -> Self {
        self.faults = faults;
        self
    }
}

pub struct Server {
    id: u64,
    addr: SocketAddr,
    peers: Arc<PeerSet>,
    raft: RaftHandle,
    quit_tx: Option<oneshot::Sender<()>>,
    serve_task: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind the listener, start serving RPCs and start the consensus loop.
    /// The election timer waits until `ready` turns true.
    pub async fn start(
        config: ServerConfig,
        storage: Arc<dyn Storage>,
        commit_tx: mpsc::UnboundedSender<CommitEntry>,
        ready: watch::Receiver<bool>,
    ) -> Result<Self, ServerError> {
        let ServerConfig {
            id,
            peer_ids,
            bind,
            raft,
            faults,
        } = config;

        let core = RaftCore::new(id, peer_ids, storage, commit_tx, raft.clone())?;
        let shared_core = Arc::new(Mutex::new(core));
        let peers = Arc::new(PeerSet::new(raft.rpc_timeout)?);

        let listener = TcpListener::bind(bind)
            .await
            .map_err(|source| ServerError::Bind { addr: bind, source })?;
        let addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr: bind, source })?;

        let router = create_router(Arc::new(RpcProxy::new(shared_core.clone(), faults)));
        let (quit_tx, quit_rx) = oneshot::channel::<()>();
        let serve_task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = quit_rx.await;
                })
                .await;
            if let Err(e) = result {
                error!(node = id, error = %e, "rpc listener failed");
            }
        });

        let node = RaftNode::with_shared(shared_core, peers.clone());
        let raft = RaftServer::new(node, raft, ready).start();
        info!(node = id, %addr, "server listening");

        Ok(Server {
            id,
            addr,
            peers,
            raft,
            quit_tx: Some(quit_tx),
            serve_task: Some(serve_task),
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn raft(&self) -> &RaftHandle {
        &self.raft
    }

    /// No-op if already connected
    pub fn connect_to_peer(&self, peer: u64, addr: SocketAddr) -> bool {
        self.peers.connect(peer, addr)
    }

    /// No-op if not connected
    pub fn disconnect_peer(&self, peer: u64) -> bool {
        self.peers.disconnect(peer)
    }

    pub fn disconnect_all(&self) {
        self.peers.disconnect_all();
    }

    /// Stop the module, close the listener and wait for in-flight handlers.
    /// Calling it again does nothing.
    pub async fn shutdown(&mut self) {
        self.raft.stop().await;
        self.peers.disconnect_all();

        if let Some(quit_tx) = self.quit_tx.take() {
            let _ = quit_tx.send(());
        }
        if let Some(task) = self.serve_task.take() {
            if let Err(e) = task.await {
                error!(node = self.id, error = %e, "rpc listener task panicked");
            }
            info!(node = self.id, "server shut down");
        }
    }
}
