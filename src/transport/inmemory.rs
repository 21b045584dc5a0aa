//! In-memory transport implementation for testing

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::core::error::RaftError;
use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, RaftCore, RequestVoteArgs, RequestVoteResult,
};
use crate::transport::{RpcHandler, Transport, TransportError};

/// Request types that can be sent to a node
pub(crate) enum Request {
    RequestVote {
        args: RequestVoteArgs,
        reply: oneshot::Sender<Result<RequestVoteResult, RaftError>>,
    },
    AppendEntries {
        args: AppendEntriesArgs,
        reply: oneshot::Sender<Result<AppendEntriesResult, RaftError>>,
    },
}

/// In-memory transport that uses channels for communication
pub struct InMemoryTransport {
    /// Senders to each node's request channel
    senders: HashMap<u64, mpsc::Sender<Request>>,
    /// Peers calls are currently refused for
    blocked: Mutex<HashSet<u64>>,
    /// Optional timeout for RPC calls
    timeout: Option<Duration>,
}

impl InMemoryTransport {
    /// Create a new in-memory transport with senders to all nodes (no timeout)
    pub(crate) fn new(senders: HashMap<u64, mpsc::Sender<Request>>) -> Self {
        Self {
            senders,
            blocked: Mutex::new(HashSet::new()),
            timeout: None,
        }
    }

    /// Create a new in-memory transport with a timeout
    pub(crate) fn with_timeout(senders: HashMap<u64, mpsc::Sender<Request>>, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::new(senders)
        }
    }

    /// Refuse outbound calls to `peer` until reconnected
    pub fn disconnect_peer(&self, peer: u64) {
        self.blocked.lock().insert(peer);
    }

    pub fn reconnect_peer(&self, peer: u64) {
        self.blocked.lock().remove(&peer);
    }

    async fn call<R: Send>(
        &self,
        target: u64,
        request: impl FnOnce(oneshot::Sender<Result<R, RaftError>>) -> Request + Send,
    ) -> Result<R, TransportError> {
        let blocked = self.blocked.lock().contains(&target);
        if blocked {
            return Err(TransportError::PeerDisconnected(target));
        }
        let sender = self
            .senders
            .get(&target)
            .ok_or(TransportError::PeerDisconnected(target))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(request(reply_tx))
            .await
            .map_err(|_| TransportError::ConnectionFailed("node handle dropped".to_string()))?;

        // Apply timeout if configured
        let reply = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, reply_rx)
                .await
                .map_err(|_| TransportError::Timeout)?,
            None => reply_rx.await,
        };
        reply
            .map_err(|_| TransportError::ConnectionFailed("request dropped".to_string()))?
            .map_err(|e| TransportError::Remote(e.to_string()))
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        self.call(target, |reply| Request::RequestVote { args, reply }).await
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        self.call(target, |reply| Request::AppendEntries { args, reply }).await
    }
}

/// Handle for a node that processes incoming requests
pub struct NodeHandle {
    receiver: mpsc::Receiver<Request>,
}

impl NodeHandle {
    /// Process one incoming request using the given RaftCore
    pub async fn process_one(&mut self, node: &mut RaftCore) -> bool {
        match self.receiver.recv().await {
            Some(Request::RequestVote { args, reply }) => {
                let _ = reply.send(node.handle_request_vote(&args));
                true
            }
            Some(Request::AppendEntries { args, reply }) => {
                let _ = reply.send(node.handle_append_entries(&args));
                true
            }
            None => false,
        }
    }

    /// Dispatch every incoming request to `handler`, each on its own task
    pub fn serve<H: RpcHandler + 'static>(mut self, handler: Arc<H>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(request) = self.receiver.recv().await {
                let handler = handler.clone();
                tokio::spawn(async move {
                    match request {
                        Request::RequestVote { args, reply } => {
                            let _ = reply.send(handler.request_vote(args).await);
                        }
                        Request::AppendEntries { args, reply } => {
                            let _ = reply.send(handler.append_entries(args).await);
                        }
                    }
                });
            }
        })
    }
}

/// Create transports and handles for a cluster of nodes
pub fn create_cluster(node_ids: &[u64]) -> (HashMap<u64, InMemoryTransport>, HashMap<u64, NodeHandle>) {
    create_cluster_with_timeout(node_ids, None)
}

/// Create transports and handles for a cluster of nodes with optional timeout
pub fn create_cluster_with_timeout(
    node_ids: &[u64],
    timeout: Option<Duration>,
) -> (HashMap<u64, InMemoryTransport>, HashMap<u64, NodeHandle>) {
    let mut senders: HashMap<u64, mpsc::Sender<Request>> = HashMap::new();
    let mut handles: HashMap<u64, NodeHandle> = HashMap::new();

    // Create a channel for each node
    for &id in node_ids {
        let (tx, rx) = mpsc::channel(64);
        senders.insert(id, tx);
        handles.insert(id, NodeHandle { receiver: rx });
    }

    // Create a transport for each node with senders to all other nodes
    let mut transports: HashMap<u64, InMemoryTransport> = HashMap::new();
    for &id in node_ids {
        let other_senders: HashMap<u64, mpsc::Sender<Request>> = senders
            .iter()
            .filter(|(&k, _)| k != id)
            .map(|(&k, v)| (k, v.clone()))
            .collect();
        let transport = match timeout {
            Some(t) => InMemoryTransport::with_timeout(other_senders, t),
            None => InMemoryTransport::new(other_senders),
        };
        transports.insert(id, transport);
    }

    (transports, handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RaftConfig;
    use crate::core::raft_core::RaftState;
    use crate::storage::MemoryStorage;

    fn new_test_core(id: u64, peers: Vec<u64>) -> RaftCore {
        let (tx, _rx) = mpsc::unbounded_channel();
        RaftCore::new(id, peers, Arc::new(MemoryStorage::new()), tx, RaftConfig::default()).unwrap()
    }

    fn vote_args() -> RequestVoteArgs {
        RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        }
    }

    #[tokio::test]
    async fn test_request_vote() {
        let (transports, mut handles) = create_cluster(&[1, 2, 3]);
        let mut node2 = new_test_core(2, vec![1, 3]);

        let transport1 = transports.get(&1).unwrap();
        let handle2 = handles.get_mut(&2).unwrap();
        let (result, _) = tokio::join!(
            transport1.request_vote(2, vote_args()),
            handle2.process_one(&mut node2)
        );

        let result = result.unwrap();
        assert!(result.vote_granted);
        assert_eq!(result.term, 1);
        assert_eq!(node2.voted_for, Some(1));
    }

    #[tokio::test]
    async fn test_append_entries() {
        let (transports, mut handles) = create_cluster(&[1, 2, 3]);
        let mut node2 = new_test_core(2, vec![1, 3]);

        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        };
        let transport1 = transports.get(&1).unwrap();
        let handle2 = handles.get_mut(&2).unwrap();
        let (result, _) = tokio::join!(
            transport1.append_entries(2, args),
            handle2.process_one(&mut node2)
        );

        let result = result.unwrap();
        assert!(result.success);
        assert_eq!(node2.current_leader, Some(1));
    }

    #[tokio::test]
    async fn test_unknown_peer_is_disconnected() {
        let (transports, _handles) = create_cluster(&[1, 2]);

        let result = transports[&1].request_vote(99, vote_args()).await;
        assert!(matches!(result, Err(TransportError::PeerDisconnected(99))));
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect_peer() {
        let (transports, mut handles) = create_cluster(&[1, 2]);
        let core2 = Arc::new(tokio::sync::Mutex::new(new_test_core(2, vec![1])));
        handles.remove(&2).unwrap().serve(core2);

        let transport1 = &transports[&1];
        transport1.disconnect_peer(2);
        transport1.disconnect_peer(2);
        assert!(matches!(
            transport1.request_vote(2, vote_args()).await,
            Err(TransportError::PeerDisconnected(2))
        ));

        transport1.reconnect_peer(2);
        assert!(transport1.request_vote(2, vote_args()).await.unwrap().vote_granted);
    }

    #[tokio::test]
    async fn test_stopped_node_is_refused() {
        let (transports, mut handles) = create_cluster(&[1, 2]);
        let mut node2 = new_test_core(2, vec![1]);
        node2.stop();

        let handle2 = handles.get_mut(&2).unwrap();
        let (result, _) = tokio::join!(
            transports[&1].request_vote(2, vote_args()),
            handle2.process_one(&mut node2)
        );
        assert!(matches!(result, Err(TransportError::Remote(_))));
        assert_eq!(node2.state, RaftState::Dead);
    }

    #[tokio::test]
    async fn test_election_via_transport() {
        let (transports, mut handles) = create_cluster(&[1, 2, 3]);
        let mut node1 = new_test_core(1, vec![2, 3]);
        let mut node2 = new_test_core(2, vec![1, 3]);
        let mut node3 = new_test_core(3, vec![1, 2]);

        let args = node1.start_election().unwrap();
        let transport1 = transports.get(&1).unwrap();

        let mut handle2 = handles.remove(&2).unwrap();
        let mut handle3 = handles.remove(&3).unwrap();
        let (result2, result3, _, _) = tokio::join!(
            transport1.request_vote(2, args.clone()),
            transport1.request_vote(3, args.clone()),
            handle2.process_one(&mut node2),
            handle3.process_one(&mut node3),
        );

        let became_leader2 = node1.handle_request_vote_result(2, args.term, &result2.unwrap()).unwrap();
        let became_leader3 = node1.handle_request_vote_result(3, args.term, &result3.unwrap()).unwrap();

        // Exactly one of the replies tips the majority
        assert!(became_leader2 ^ became_leader3);
        assert_eq!(node1.state, RaftState::Leader);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_vote_timeout() {
        let (transports, _handles) =
            create_cluster_with_timeout(&[1, 2], Some(Duration::from_millis(100)));

        // Node 2 never processes the request
        let result = transports[&1].request_vote(2, vote_args()).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_responses_and_timeouts() {
        let (transports, mut handles) =
            create_cluster_with_timeout(&[1, 2, 3], Some(Duration::from_millis(100)));
        let mut node2 = new_test_core(2, vec![1, 3]);
        let mut handle2 = handles.remove(&2).unwrap();

        let transport1 = transports.get(&1).unwrap();
        let (result2, result3, _) = tokio::join!(
            transport1.request_vote(2, vote_args()),
            transport1.request_vote(3, vote_args()),
            handle2.process_one(&mut node2),
        );

        assert!(result2.unwrap().vote_granted);
        assert!(matches!(result3, Err(TransportError::Timeout)));
    }
}
