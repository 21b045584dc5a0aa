//! Testing utilities for Raft cluster integration tests
//!
//! `Harness` runs an in-process cluster of real HTTP servers on loopback
//! ports, collects every node's commits, and lets tests partition, crash
//! and restart nodes while asserting on leadership and commitment.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::core::config::RaftConfig;
use crate::core::error::RaftError;
use crate::core::raft_core::{Command, CommitEntry};
use crate::proxy::FaultConfig;
use crate::server::{Server, ServerConfig};
use crate::storage::MemoryStorage;

type CommitLog = Arc<Mutex<Vec<CommitEntry>>>;

const LEADER_POLLS: usize = 8;
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const COMMIT_WAIT: Duration = Duration::from_secs(5);

struct Slot {
    server: Option<Server>,
    storage: Arc<MemoryStorage>,
    commits: CommitLog,
    collector: Option<JoinHandle<()>>,
    connected: bool,
}

/// An in-process cluster of `n` servers with ids `0..n`
pub struct Harness {
    slots: Vec<Slot>,
    config: RaftConfig,
    faults: FaultConfig,
}

impl Harness {
    /// Start `n` servers; delivery is unreliable if `RAFT_UNRELIABLE_RPC` is set
    pub async fn new(n: usize) -> Self {
        Self::with_faults(n, FaultConfig::from_env()).await
    }

    pub async fn with_faults(n: usize, faults: FaultConfig) -> Self {
        let config = RaftConfig::default();
        let (ready_tx, ready_rx) = watch::channel(false);

        let mut slots = Vec::with_capacity(n);
        for id in 0..n as u64 {
            let storage = Arc::new(MemoryStorage::new());
            let commits: CommitLog = Arc::default();
            let (server, collector) =
                start_server(id, n, &config, &faults, storage.clone(), commits.clone(), ready_rx.clone())
                    .await;
            slots.push(Slot {
                server: Some(server),
                storage,
                commits,
                collector: Some(collector),
                connected: false,
            });
        }

        let mut harness = Harness {
            slots,
            config,
            faults,
        };
        for id in 0..n as u64 {
            harness.reconnect_peer(id);
        }

        // Every peer is reachable before any election timer starts
        ready_tx.send_replace(true);
        info!(nodes = n, "harness started");
        harness
    }

    fn server(&self, id: u64) -> &Server {
        self.slots[id as usize]
            .server
            .as_ref()
            .unwrap_or_else(|| panic!("peer {} is crashed", id))
    }

    fn live_connected(&self) -> impl Iterator<Item = (u64, &Server)> {
        self.slots.iter().enumerate().filter_map(|(id, slot)| match &slot.server {
            Some(server) if slot.connected => Some((id as u64, server)),
            _ => None,
        })
    }

    /// Stop every server and wait for their commit channels to close
    pub async fn shutdown(mut self) {
        for slot in &self.slots {
            if let Some(server) = &slot.server {
                server.disconnect_all();
            }
        }
        for slot in self.slots.iter_mut() {
            slot.connected = false;
            if let Some(mut server) = slot.server.take() {
                server.shutdown().await;
            }
            if let Some(collector) = slot.collector.take() {
                let _ = collector.await;
            }
        }
        info!("harness shut down");
    }

    /// Cut `id` off from every other peer, in both directions
    pub fn disconnect_peer(&mut self, id: u64) {
        info!(peer = id, "disconnecting peer");
        if let Some(server) = &self.slots[id as usize].server {
            server.disconnect_all();
        }
        for (other, slot) in self.slots.iter().enumerate() {
            if other as u64 != id {
                if let Some(server) = &slot.server {
                    server.disconnect_peer(id);
                }
            }
        }
        self.slots[id as usize].connected = false;
    }

    /// Restore links between `id` and every other running peer
    pub fn reconnect_peer(&mut self, id: u64) {
        info!(peer = id, "reconnecting peer");
        let addr = self.server(id).listen_addr();
        for (other, slot) in self.slots.iter().enumerate() {
            let other = other as u64;
            if other == id {
                continue;
            }
            if let Some(server) = &slot.server {
                self.server(id).connect_to_peer(other, server.listen_addr());
                server.connect_to_peer(id, addr);
            }
        }
        self.slots[id as usize].connected = true;
    }

    /// Shut `id` down, keeping its storage for a later restart.
    /// Its collected commits are cleared since a restarted node delivers
    /// everything again from index 1.
    pub async fn crash_peer(&mut self, id: u64) {
        info!(peer = id, "crashing peer");
        self.disconnect_peer(id);
        let slot = &mut self.slots[id as usize];
        if let Some(mut server) = slot.server.take() {
            server.shutdown().await;
        }
        if let Some(collector) = slot.collector.take() {
            let _ = collector.await;
        }
        slot.commits.lock().clear();
    }

    /// Rebuild a crashed peer from its retained storage and reconnect it
    pub async fn restart_peer(&mut self, id: u64) {
        info!(peer = id, "restarting peer");
        let n = self.slots.len();
        let (_ready_tx, ready_rx) = watch::channel(true);
        let slot = &self.slots[id as usize];
        assert!(slot.server.is_none(), "peer {} is still running", id);

        let (server, collector) = start_server(
            id,
            n,
            &self.config,
            &self.faults,
            slot.storage.clone(),
            slot.commits.clone(),
            ready_rx,
        )
        .await;

        let slot = &mut self.slots[id as usize];
        slot.server = Some(server);
        slot.collector = Some(collector);
        self.reconnect_peer(id);
    }

    /// Everything `id` has delivered on its commit channel so far
    pub fn commits_of(&self, id: u64) -> Vec<CommitEntry> {
        self.slots[id as usize].commits.lock().clone()
    }

    /// Wait for exactly one leader among connected peers.
    /// Returns `(leader_id, term)`; panics if none emerges.
    pub async fn check_single_leader(&self) -> (u64, u64) {
        for _ in 0..LEADER_POLLS {
            let mut leaders = Vec::new();
            for (id, server) in self.live_connected() {
                let report = server.raft().report().await;
                if report.is_leader {
                    leaders.push((id, report.term));
                }
            }

            match leaders.as_slice() {
                [leader] => return *leader,
                [] => {}
                _ => {
                    let mut terms: Vec<u64> = leaders.iter().map(|(_, term)| *term).collect();
                    terms.sort_unstable();
                    terms.dedup();
                    assert_eq!(terms.len(), leaders.len(), "two leaders in one term: {:?}", leaders);
                    debug!(?leaders, "stale leader still reporting, retrying");
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        panic!("no single leader found");
    }

    /// No connected peer believes it is leader
    pub async fn check_no_leader(&self) {
        for (id, server) in self.live_connected() {
            assert!(
                !server.raft().report().await.is_leader,
                "peer {} is leader, expected none",
                id
            );
        }
    }

    /// Wait until exactly `expected_count` connected peers have committed
    /// `command`, all at the same index. Returns that index.
    pub async fn check_committed(&self, command: &Command, expected_count: usize) -> u64 {
        let deadline = tokio::time::Instant::now() + COMMIT_WAIT;
        loop {
            let mut index = None;
            let mut count = 0;
            for (id, _) in self.live_connected() {
                let commits = self.slots[id as usize].commits.lock();
                if let Some(entry) = commits.iter().find(|entry| &entry.command == command) {
                    match index {
                        None => index = Some(entry.index),
                        Some(seen) => assert_eq!(
                            seen, entry.index,
                            "peer {} committed {} at a different index",
                            id, command
                        ),
                    }
                    count += 1;
                }
            }

            if let Some(index) = index {
                if count == expected_count {
                    return index;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "{} committed on {} peers, expected {}",
                    command, count, expected_count
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// No connected peer has committed `command`
    pub fn check_not_committed(&self, command: &Command) {
        for (id, _) in self.live_connected() {
            let commits = self.slots[id as usize].commits.lock();
            assert!(
                commits.iter().all(|entry| &entry.command != command),
                "peer {} committed {}",
                id,
                command
            );
        }
    }

    pub async fn submit_to_server(&self, id: u64, command: Command) -> Result<u64, RaftError> {
        self.server(id).raft().submit(command).await
    }
}

async fn start_server(
    id: u64,
    n: usize,
    config: &RaftConfig,
    faults: &FaultConfig,
    storage: Arc<MemoryStorage>,
    commits: CommitLog,
    ready: watch::Receiver<bool>,
) -> (Server, JoinHandle<()>) {
    let peer_ids = (0..n as u64).filter(|peer| *peer != id).collect();
    let server_config = ServerConfig::new(id, peer_ids)
        .with_raft(config.clone())
        .with_faults(faults.clone());

    let (commit_tx, commit_rx) = mpsc::unbounded_channel();
    let server = Server::start(server_config, storage, commit_tx, ready)
        .await
        .unwrap_or_else(|e| panic!("peer {} failed to start: {}", id, e));
    (server, collect_commits(id, commit_rx, commits))
}

/// Drain a commit channel into `sink` until the module closes it
fn collect_commits(
    id: u64,
    mut commit_rx: mpsc::UnboundedReceiver<CommitEntry>,
    sink: CommitLog,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(entry) = commit_rx.recv().await {
            debug!(peer = id, index = entry.index, "collected commit");
            sink.lock().push(entry);
        }
    })
}
