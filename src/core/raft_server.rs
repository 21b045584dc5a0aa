//! RaftServer - timer loop driving elections and replication
//!
//! The loop owns no Raft state. It waits on the shutdown signal, the
//! heartbeat interval, replication requests and the election deadline, and
//! spawns a task for each round so a slow round never delays the timers.

use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::config::RaftConfig;
use super::error::Result;
use super::raft_core::{Command, RaftState, Report, RequestVoteArgs};
use super::raft_node::{RaftNode, SharedCore};
use crate::transport::Transport;

/// Handle for interacting with a running RaftServer
#[derive(Clone)]
pub struct RaftHandle {
    core: SharedCore,
    replicate: Arc<Notify>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl RaftHandle {
    /// Append a command to the leader's log and kick off replication.
    /// Returns the entry's index; commitment is reported on the commit channel.
    pub async fn submit(&self, command: Command) -> Result<u64> {
        let index = self.core.lock().await.submit(command)?;
        self.replicate.notify_one();
        Ok(index)
    }

    pub async fn report(&self) -> Report {
        self.core.lock().await.report()
    }

    /// Stop the consensus module and its timer loop. Safe to call twice.
    pub async fn stop(&self) {
        self.core.lock().await.stop();
        self.shutdown_tx.send_replace(true);
    }

    pub fn shared_core(&self) -> SharedCore {
        self.core.clone()
    }
}

/// Raft server: runs the timers for one RaftNode
pub struct RaftServer<T: Transport> {
    node: RaftNode<T>,
    config: RaftConfig,
    ready: watch::Receiver<bool>,
    shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl<T: Transport + 'static> RaftServer<T> {
    /// The election timer stays off until `ready` turns true
    pub fn new(node: RaftNode<T>, config: RaftConfig, ready: watch::Receiver<bool>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            node,
            config,
            ready,
            shutdown_rx,
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// Start the server loop in the background and return a handle for interaction
    pub fn start(self) -> RaftHandle {
        let handle = RaftHandle {
            core: self.node.shared_core(),
            replicate: self.node.replication_signal(),
            shutdown_tx: self.shutdown_tx.clone(),
        };

        tokio::spawn(self.run());

        handle
    }

    /// Main server loop
    async fn run(mut self) {
        tokio::select! {
            _ = self.shutdown_rx.changed() => return,
            ready = wait_until_ready(&mut self.ready) => {
                if !ready {
                    return;
                }
            }
        }

        let id = {
            let mut core = self.node.shared_core().lock_owned().await;
            core.reset_election_timer();
            core.id
        };
        info!(node = id, "consensus loop started");

        let mut heartbeat_interval = interval(self.config.heartbeat_interval);
        // Delay keeps missed ticks from bunching up behind a long round
        heartbeat_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let (state, deadline) = {
                let core = self.node.shared_core().lock_owned().await;
                (core.state, core.election_deadline())
            };
            if state == RaftState::Dead {
                break;
            }

            tokio::select! {
                _ = self.shutdown_rx.changed() => break,
                _ = heartbeat_interval.tick() => {
                    if self.node.state().await == RaftState::Leader {
                        self.spawn_replication();
                    }
                }
                _ = self.node.replication_requested() => {
                    if self.node.state().await == RaftState::Leader {
                        self.spawn_replication();
                    }
                }
                _ = sleep_until(deadline), if state != RaftState::Leader => {
                    if let Some(args) = self.begin_election().await {
                        self.spawn_election(args);
                    }
                }
            }
        }

        debug!(node = id, "consensus loop exited");
    }

    /// Move to Candidate if the deadline really passed, before the loop
    /// looks at the deadline again. Returns the votes to request, or None
    /// when there is nothing to ask peers for.
    async fn begin_election(&self) -> Option<RequestVoteArgs> {
        let mut core = self.node.shared_core().lock_owned().await;
        // A heartbeat may have pushed the deadline back while we slept
        let due = matches!(core.state, RaftState::Follower | RaftState::Candidate)
            && Instant::now() >= core.election_deadline();
        if !due {
            return None;
        }

        match core.start_election() {
            // Single-node cluster: won on our own vote
            Ok(_) if core.is_leader() => {
                self.node.trigger_replication();
                None
            }
            Ok(args) => Some(args),
            Err(e) => {
                warn!(node = core.id, error = %e, "could not start election");
                None
            }
        }
    }

    fn spawn_replication(&self) {
        let node = self.node.clone();
        tokio::spawn(async move {
            node.send_heartbeats().await;
        });
    }

    fn spawn_election(&self, args: RequestVoteArgs) {
        let node = self.node.clone();
        tokio::spawn(async move {
            if node.request_votes(args).await {
                // Assert leadership before anyone else times out
                node.send_heartbeats().await;
            }
        });
    }
}

/// False if the ready sender went away without ever signalling
async fn wait_until_ready(ready: &mut watch::Receiver<bool>) -> bool {
    ready.wait_for(|ready| *ready).await.is_ok()
}
