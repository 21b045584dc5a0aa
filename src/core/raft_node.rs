//! RaftNode - outbound side of the consensus module
//!
//! Every round locks the core only to build arguments and to process each
//! reply. The lock is never held while a call is in flight, so a slow peer
//! delays nothing but its own reply.

use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use futures::stream::FuturesUnordered;
use futures::StreamExt;

use super::raft_core::{AppendEntriesArgs, RaftCore, RaftState, RequestVoteArgs};
use crate::transport::Transport;

/// Shared reference to RaftCore
pub type SharedCore = Arc<Mutex<RaftCore>>;

/// Fans Raft RPCs out to peers over `T`
pub struct RaftNode<T: Transport> {
    core: SharedCore,
    transport: Arc<T>,
    replicate: Arc<Notify>,
}

impl<T: Transport> Clone for RaftNode<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            transport: self.transport.clone(),
            replicate: self.replicate.clone(),
        }
    }
}

impl<T: Transport> RaftNode<T> {
    /// Create a new RaftNode
    pub fn new(core: RaftCore, transport: T) -> Self {
        Self::with_shared(Arc::new(Mutex::new(core)), Arc::new(transport))
    }

    pub fn with_shared(core: SharedCore, transport: Arc<T>) -> Self {
        Self {
            core,
            transport,
            replicate: Arc::new(Notify::new()),
        }
    }

    /// Get a shared reference to the core (for incoming RPC handling)
    pub fn shared_core(&self) -> SharedCore {
        self.core.clone()
    }

    /// Ask the replication loop for an extra round now
    pub fn trigger_replication(&self) {
        self.replicate.notify_one();
    }

    pub(crate) fn replication_signal(&self) -> Arc<Notify> {
        self.replicate.clone()
    }

    /// Resolves once a replication round has been requested
    pub async fn replication_requested(&self) {
        self.replicate.notified().await
    }

    pub async fn state(&self) -> RaftState {
        self.core.lock().await.state
    }

    /// Become candidate and request votes from all peers concurrently.
    /// Returns true if this node became leader.
    pub async fn run_election(&self) -> bool {
        let args = {
            let mut core = self.core.lock().await;
            match core.start_election() {
                Ok(_) if core.is_leader() => return true,
                Ok(args) => args,
                Err(e) => {
                    debug!(node = core.id, error = %e, "could not start election");
                    return false;
                }
            }
        };
        self.request_votes(args).await
    }

    /// Send `args` to every peer and process replies as they arrive.
    /// The caller has already moved the core to Candidate for `args.term`.
    /// Returns true if this node became leader.
    pub async fn request_votes(&self, args: RequestVoteArgs) -> bool {
        let peers = self.core.lock().await.peers.clone();

        let mut futures: FuturesUnordered<_> = peers
            .iter()
            .map(|&peer_id| {
                let args = args.clone();
                let transport = &self.transport;
                async move { (peer_id, transport.request_vote(peer_id, args).await) }
            })
            .collect();

        while let Some((peer_id, result)) = futures.next().await {
            let result = match result {
                Ok(result) => result,
                Err(e) => {
                    debug!(node = args.candidate_id, peer = peer_id, error = %e, "RequestVote failed");
                    continue;
                }
            };

            let mut core = self.core.lock().await;
            match core.handle_request_vote_result(peer_id, args.term, &result) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => {
                    warn!(node = core.id, error = %e, "election aborted");
                    return false;
                }
            }
            // Stepped down, or a newer election already started
            if core.state != RaftState::Candidate || core.current_term != args.term {
                return false;
            }
        }

        false
    }

    /// One replication round: AppendEntries to every peer concurrently,
    /// each carrying that peer's entries from next_index onward.
    /// Returns true if the commit index advanced.
    pub async fn send_heartbeats(&self) -> bool {
        let requests: Vec<(u64, AppendEntriesArgs)> = {
            let core = self.core.lock().await;
            core.peers
                .iter()
                .filter_map(|&peer_id| core.append_entries_args(peer_id).map(|args| (peer_id, args)))
                .collect()
        };

        let mut futures: FuturesUnordered<_> = requests
            .into_iter()
            .map(|(peer_id, args)| {
                let transport = &self.transport;
                async move {
                    let result = transport.append_entries(peer_id, args.clone()).await;
                    (peer_id, args, result)
                }
            })
            .collect();

        let mut committed = false;
        while let Some((peer_id, args, result)) = futures.next().await {
            let result = match result {
                Ok(result) => result,
                Err(e) => {
                    debug!(node = args.leader_id, peer = peer_id, error = %e, "AppendEntries failed");
                    continue;
                }
            };

            let mut core = self.core.lock().await;
            match core.handle_append_entries_result(peer_id, &args, &result) {
                Ok(advanced) => committed |= advanced,
                Err(e) => {
                    warn!(node = core.id, error = %e, "replication aborted");
                    return committed;
                }
            }
        }

        // Tell followers about the new commit index without waiting a full tick
        if committed {
            self.trigger_replication();
        }
        committed
    }
}
