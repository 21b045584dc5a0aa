//! Raft Consensus Algorithm Implementation
//!
//! This module implements the Raft consensus protocol as described in:
//! "In Search of an Understandable Consensus Algorithm" by Diego Ongaro and John Ousterhout
//!
//! `RaftCore` is synchronous and transport-agnostic. Callers hold the shared
//! lock while calling into it and do all network I/O after releasing it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::config::RaftConfig;
use super::error::{RaftError, Result};
use crate::storage::{Storage, StorageError};

/// Opaque client command carried by a log entry
pub type Command = serde_json::Value;

const TERM_KEY: &str = "currentTerm";
const VOTED_FOR_KEY: &str = "votedFor";
const LOG_KEY: &str = "log";

/// Raft node states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftState {
    /// Follower: Passive state, receives updates from leader
    Follower,
    /// Candidate: Actively seeking votes to become leader
    Candidate,
    /// Leader: Handles all client requests and replicates log
    Leader,
    /// Dead: shut down, serves nothing
    Dead,
}

/// A single log entry. Its index is its 1-based position in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term when entry was received by leader
    pub term: u64,
    /// Command/data stored in this entry
    pub command: Command,
}

/// A committed log position, handed to the hosting application exactly once
#[derive(Debug, Clone, PartialEq)]
pub struct CommitEntry {
    pub command: Command,
    pub index: u64,
    pub term: u64,
}

/// RequestVote RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    /// Candidate's term
    pub term: u64,
    /// Candidate requesting vote
    pub candidate_id: u64,
    /// Index of candidate's last log entry
    pub last_log_index: u64,
    /// Term of candidate's last log entry
    pub last_log_term: u64,
}

/// RequestVote RPC results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResult {
    /// Current term, for candidate to update itself
    pub term: u64,
    /// True means candidate received vote
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    /// Leader's term
    pub term: u64,
    /// Leader's ID
    pub leader_id: u64,
    /// Index of log entry immediately preceding new ones
    pub prev_log_index: u64,
    /// Term of prev_log_index entry
    pub prev_log_term: u64,
    /// Log entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,
    /// Leader's commit_index
    pub leader_commit: u64,
}

/// AppendEntries RPC results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResult {
    /// Current term, for leader to update itself
    pub term: u64,
    /// True if follower contained entry matching prev_log_index and prev_log_term
    pub success: bool,
    /// On failure: first index the leader should try next
    #[serde(default)]
    pub conflict_index: u64,
    /// On failure: term of the follower's entry at prev_log_index, if it has one
    #[serde(default)]
    pub conflict_term: Option<u64>,
}

/// Snapshot of who a node is and whether it leads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub id: u64,
    pub term: u64,
    pub is_leader: bool,
}

/// Core Raft state machine (sync, transport-agnostic)
pub struct RaftCore {
    // Storage backend for persistent state
    storage: Arc<dyn Storage>,
    // Committed entries go out here; dropped on shutdown to close the channel
    commit_tx: Option<mpsc::UnboundedSender<CommitEntry>>,
    config: RaftConfig,

    // Persistent state on all servers (written to storage before replying to RPCs)
    /// Latest term server has seen (initialized to 0 on first boot, increases monotonically)
    pub current_term: u64,
    /// Candidate ID that received vote in current term (or None if none)
    pub voted_for: Option<u64>,
    /// Log entries; first index is 1
    pub log: Vec<LogEntry>,

    // Volatile state on all servers
    /// Index of highest log entry known to be committed (initialized to 0, increases monotonically)
    pub commit_index: u64,
    /// Index of highest log entry delivered on the commit channel
    pub last_applied: u64,

    // Volatile state on leaders (reinitialized after election)
    /// For each server, index of next log entry to send to that server
    pub next_index: HashMap<u64, u64>,
    /// For each server, index of highest log entry known to be replicated on server
    pub match_index: HashMap<u64, u64>,

    // Node-specific state
    /// Unique identifier for this node
    pub id: u64,
    /// Current state of this node
    pub state: RaftState,
    /// IDs of other nodes in the cluster
    pub peers: Vec<u64>,
    /// Peers that have granted votes in the current election (used by candidates)
    votes_received: HashSet<u64>,
    /// Current known leader (updated when receiving valid AppendEntries)
    pub current_leader: Option<u64>,
    /// Start of the current election timeout cycle
    pub election_reset_at: Instant,
    /// Length of the current election timeout cycle, drawn fresh on every reset
    pub election_timeout: Duration,

    // Which persistent fields changed since the last write
    state_dirty: bool,
    log_dirty: bool,
}

impl RaftCore {
    /// Create a new Raft core, reloading term, vote and log from storage
    /// when it holds data from a previous run
    pub fn new(
        id: u64,
        peers: Vec<u64>,
        storage: Arc<dyn Storage>,
        commit_tx: mpsc::UnboundedSender<CommitEntry>,
        config: RaftConfig,
    ) -> Result<Self> {
        let (current_term, voted_for, log) = if storage.has_data()? {
            let term = load_key::<u64>(storage.as_ref(), TERM_KEY)?.unwrap_or(0);
            let voted_for = load_key::<Option<u64>>(storage.as_ref(), VOTED_FOR_KEY)?.flatten();
            let log = load_key::<Vec<LogEntry>>(storage.as_ref(), LOG_KEY)?.unwrap_or_default();
            info!(node = id, term, log_len = log.len(), "restored persistent state");
            (term, voted_for, log)
        } else {
            (0, None, Vec::new())
        };

        let election_timeout = config.random_election_timeout();

        Ok(RaftCore {
            storage,
            commit_tx: Some(commit_tx),
            config,
            current_term,
            voted_for,
            log,
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            id,
            state: RaftState::Follower,
            peers,
            votes_received: HashSet::new(),
            current_leader: None,
            election_reset_at: Instant::now(),
            election_timeout,
            state_dirty: false,
            log_dirty: false,
        })
    }

    // === Persistence helpers ===

    /// Write whatever persistent state changed. A failed write is fatal:
    /// the node halts and the error is returned instead of a reply.
    fn persist(&mut self) -> Result<()> {
        if let Err(e) = self.write_dirty() {
            error!(node = self.id, error = %e, "failed to persist raft state, halting");
            self.halt();
            return Err(e.into());
        }
        Ok(())
    }

    fn write_dirty(&mut self) -> std::result::Result<(), StorageError> {
        if self.state_dirty {
            // Term goes first. A crash between the two writes leaves a vote
            // cast in an older term, which only makes the node refuse votes
            // for the rest of the newer one.
            store_key(self.storage.as_ref(), TERM_KEY, &self.current_term)?;
            store_key(self.storage.as_ref(), VOTED_FOR_KEY, &self.voted_for)?;
            self.state_dirty = false;
        }
        if self.log_dirty {
            store_key(self.storage.as_ref(), LOG_KEY, &self.log)?;
            self.log_dirty = false;
        }
        Ok(())
    }

    // === Log accessors ===

    pub fn last_log_index(&self) -> u64 {
        self.log.len() as u64
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last().map_or(0, |entry| entry.term)
    }

    /// Term of the entry at `index`; index 0 is the empty-log sentinel with term 0
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.log.get(index as usize - 1).map(|entry| entry.term)
    }

    /// Check if candidate's log is at least as up-to-date as receiver's log
    /// Returns true if:
    /// - candidate's last log term > receiver's last log term, OR
    /// - candidate's last log term == receiver's last log term AND candidate's last log index >= receiver's last log index
    pub fn is_log_up_to_date(&self, candidate_last_log_term: u64, candidate_last_log_index: u64) -> bool {
        let my_last_term = self.last_log_term();
        let my_last_index = self.last_log_index();

        candidate_last_log_term > my_last_term
            || (candidate_last_log_term == my_last_term && candidate_last_log_index >= my_last_index)
    }

    fn first_index_of_term(&self, from: u64, term: u64) -> u64 {
        let mut index = from;
        while index > 1 && self.log[index as usize - 2].term == term {
            index -= 1;
        }
        index
    }

    fn last_index_of_term(&self, term: u64) -> Option<u64> {
        self.log
            .iter()
            .rposition(|entry| entry.term == term)
            .map(|pos| pos as u64 + 1)
    }

    // === Timers and roles ===

    /// Start a new election timeout cycle with a freshly drawn duration
    pub fn reset_election_timer(&mut self) {
        self.election_reset_at = Instant::now();
        self.election_timeout = self.config.random_election_timeout();
    }

    pub fn election_deadline(&self) -> Instant {
        self.election_reset_at + self.election_timeout
    }

    fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    pub fn is_leader(&self) -> bool {
        self.state == RaftState::Leader
    }

    pub fn report(&self) -> Report {
        Report {
            id: self.id,
            term: self.current_term,
            is_leader: self.is_leader(),
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.state == RaftState::Dead {
            return Err(RaftError::Stopped);
        }
        Ok(())
    }

    /// Adopt `term` (clearing the vote if it is newer) and become a follower
    fn become_follower(&mut self, term: u64) {
        let old_state = self.state;
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.state_dirty = true;
        }
        self.state = RaftState::Follower;
        self.next_index.clear();
        self.match_index.clear();
        self.votes_received.clear();
        self.reset_election_timer();
        if old_state != RaftState::Follower {
            info!(node = self.id, term, was = ?old_state, "stepped down to follower");
        }
    }

    /// Start a new election (called when election timeout elapses)
    /// Returns the RequestVote arguments to send to every peer
    pub fn start_election(&mut self) -> Result<RequestVoteArgs> {
        self.ensure_alive()?;

        self.state = RaftState::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.state_dirty = true;
        self.current_leader = None;
        self.votes_received.clear();
        self.votes_received.insert(self.id);
        self.reset_election_timer();
        info!(node = self.id, term = self.current_term, "became candidate");

        self.persist()?;

        let args = RequestVoteArgs {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };

        // Single-node cluster: our own vote is already a majority
        if self.votes_received.len() >= self.quorum() {
            self.become_leader();
        }
        Ok(args)
    }

    /// Become leader (called after receiving majority of votes)
    pub fn become_leader(&mut self) {
        self.state = RaftState::Leader;
        self.current_leader = Some(self.id);
        let next = self.last_log_index() + 1;
        self.next_index = self.peers.iter().map(|peer| (*peer, next)).collect();
        self.match_index = self.peers.iter().map(|peer| (*peer, 0)).collect();
        info!(node = self.id, term = self.current_term, log_len = self.log.len(), "became leader");
    }

    /// Transition to Dead and close the commit channel
    fn halt(&mut self) {
        self.state = RaftState::Dead;
        self.commit_tx = None;
        self.current_leader = None;
        self.next_index.clear();
        self.match_index.clear();
    }

    /// Shut the module down. Further RPCs are refused with `RaftError::Stopped`.
    pub fn stop(&mut self) {
        if self.state != RaftState::Dead {
            info!(node = self.id, term = self.current_term, "stopped");
        }
        self.halt();
    }

    // === Inbound RPC handlers ===

    /// Handle RequestVote RPC
    pub fn handle_request_vote(&mut self, args: &RequestVoteArgs) -> Result<RequestVoteResult> {
        self.ensure_alive()?;

        // If RPC request contains term T > currentTerm: set currentTerm = T, convert to follower
        if args.term > self.current_term {
            self.become_follower(args.term);
        }

        let vote_granted = args.term == self.current_term
            && self.voted_for.map_or(true, |id| id == args.candidate_id)
            && self.is_log_up_to_date(args.last_log_term, args.last_log_index);

        if vote_granted {
            if self.voted_for != Some(args.candidate_id) {
                self.voted_for = Some(args.candidate_id);
                self.state_dirty = true;
            }
            self.reset_election_timer();
        }

        self.persist()?;
        debug!(
            node = self.id,
            term = self.current_term,
            candidate = args.candidate_id,
            vote_granted,
            "handled RequestVote"
        );

        Ok(RequestVoteResult {
            term: self.current_term,
            vote_granted,
        })
    }

    /// Handle AppendEntries RPC (heartbeat or log replication)
    pub fn handle_append_entries(&mut self, args: &AppendEntriesArgs) -> Result<AppendEntriesResult> {
        self.ensure_alive()?;

        if args.term > self.current_term {
            self.become_follower(args.term);
        }

        let mut result = AppendEntriesResult {
            term: self.current_term,
            success: false,
            conflict_index: 0,
            conflict_term: None,
        };

        if args.term == self.current_term {
            // Valid AppendEntries from the current leader
            if self.state != RaftState::Follower {
                self.become_follower(args.term);
            } else {
                self.reset_election_timer();
            }
            self.current_leader = Some(args.leader_id);

            match self.term_at(args.prev_log_index) {
                Some(term) if term == args.prev_log_term => {
                    result.success = true;
                    self.merge_entries(args.prev_log_index, &args.entries);

                    // commitIndex = min(leaderCommit, index of last new entry)
                    let last_new_index = args.prev_log_index + args.entries.len() as u64;
                    let new_commit = args.leader_commit.min(last_new_index);
                    if new_commit > self.commit_index {
                        debug!(node = self.id, commit_index = new_commit, "follower advanced commit index");
                        self.commit_index = new_commit;
                    }
                }
                Some(term) => {
                    result.conflict_term = Some(term);
                    result.conflict_index = self.first_index_of_term(args.prev_log_index, term);
                }
                None => {
                    result.conflict_index = self.last_log_index() + 1;
                }
            }
        }

        self.persist()?;
        if result.success {
            self.deliver_committed();
        }
        Ok(result)
    }

    /// Skip entries already present, truncate at the first conflict, append the rest
    fn merge_entries(&mut self, prev_log_index: u64, entries: &[LogEntry]) {
        let mut log_pos = prev_log_index as usize;
        let mut new_pos = 0;
        while log_pos < self.log.len()
            && new_pos < entries.len()
            && self.log[log_pos].term == entries[new_pos].term
        {
            log_pos += 1;
            new_pos += 1;
        }

        if new_pos < entries.len() {
            if log_pos < self.log.len() {
                debug!(node = self.id, from_index = log_pos + 1, "truncating conflicting entries");
            }
            self.log.truncate(log_pos);
            self.log.extend_from_slice(&entries[new_pos..]);
            self.log_dirty = true;
        }
    }

    // === Leader side ===

    /// Add a new command to the leader's log. Returns its index.
    pub fn submit(&mut self, command: Command) -> Result<u64> {
        self.ensure_alive()?;
        if self.state != RaftState::Leader {
            return Err(RaftError::NotLeader {
                leader_hint: self.current_leader,
            });
        }

        self.log.push(LogEntry {
            term: self.current_term,
            command,
        });
        self.log_dirty = true;
        self.persist()?;

        let index = self.last_log_index();
        debug!(node = self.id, term = self.current_term, index, "appended entry");

        if self.peers.is_empty() {
            self.advance_commit_index();
        }
        Ok(index)
    }

    /// AppendEntries for `peer`, carrying everything from next_index onward.
    /// None unless this node is leader.
    pub fn append_entries_args(&self, peer: u64) -> Option<AppendEntriesArgs> {
        if self.state != RaftState::Leader {
            return None;
        }
        let last = self.last_log_index();
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(last + 1)
            .clamp(1, last + 1);
        let prev_log_index = next - 1;

        Some(AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.term_at(prev_log_index).unwrap_or(0),
            entries: self.log[prev_log_index as usize..].to_vec(),
            leader_commit: self.commit_index,
        })
    }

    /// Handle a RequestVote result sent during term `sent_term`.
    /// Returns true if this node became leader as a result.
    pub fn handle_request_vote_result(
        &mut self,
        peer_id: u64,
        sent_term: u64,
        result: &RequestVoteResult,
    ) -> Result<bool> {
        if self.state == RaftState::Dead {
            return Ok(false);
        }
        if result.term > self.current_term {
            self.become_follower(result.term);
            self.persist()?;
            return Ok(false);
        }
        // Replies from an older election, or after we already won or lost
        if self.state != RaftState::Candidate || sent_term != self.current_term {
            return Ok(false);
        }

        if result.vote_granted {
            self.votes_received.insert(peer_id);
            if self.votes_received.len() >= self.quorum() {
                self.become_leader();
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Handle the reply to `sent`. Returns true if the commit index advanced.
    pub fn handle_append_entries_result(
        &mut self,
        peer_id: u64,
        sent: &AppendEntriesArgs,
        result: &AppendEntriesResult,
    ) -> Result<bool> {
        if self.state == RaftState::Dead {
            return Ok(false);
        }
        if result.term > self.current_term {
            self.become_follower(result.term);
            self.persist()?;
            return Ok(false);
        }
        if self.state != RaftState::Leader || sent.term != self.current_term {
            return Ok(false);
        }

        let matched = self.match_index.get(&peer_id).copied().unwrap_or(0);

        if result.success {
            let replicated = sent.prev_log_index + sent.entries.len() as u64;
            let matched = matched.max(replicated);
            self.match_index.insert(peer_id, matched);
            self.next_index.insert(peer_id, matched + 1);
            return Ok(self.advance_commit_index());
        }

        let next = match result.conflict_term {
            Some(term) => self
                .last_index_of_term(term)
                .map_or(result.conflict_index, |index| index + 1),
            None if result.conflict_index > 0 => result.conflict_index,
            None => sent.prev_log_index,
        };
        let next = next.min(sent.prev_log_index).max(matched + 1);
        debug!(node = self.id, peer = peer_id, next_index = next, "backing off next index");
        self.next_index.insert(peer_id, next);
        Ok(false)
    }

    /// Commit the highest current-term index held by a majority.
    /// Entries from earlier terms are only committed along with it.
    fn advance_commit_index(&mut self) -> bool {
        let before = self.commit_index;
        for n in (self.commit_index + 1)..=self.last_log_index() {
            if self.log[n as usize - 1].term != self.current_term {
                continue;
            }
            let replicas = 1 + self.match_index.values().filter(|&&m| m >= n).count();
            if replicas >= self.quorum() {
                self.commit_index = n;
            }
        }

        if self.commit_index > before {
            debug!(node = self.id, term = self.current_term, commit_index = self.commit_index, "leader advanced commit index");
            self.deliver_committed();
            return true;
        }
        false
    }

    /// Send every entry in (last_applied, commit_index] on the commit channel
    fn deliver_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let Some(entry) = self.log.get(self.last_applied as usize) else {
                break;
            };
            self.last_applied += 1;
            let commit = CommitEntry {
                command: entry.command.clone(),
                index: self.last_applied,
                term: entry.term,
            };
            if let Some(tx) = &self.commit_tx {
                if tx.send(commit).is_err() {
                    debug!(node = self.id, "commit receiver dropped");
                }
            }
        }
    }
}

fn load_key<T: DeserializeOwned>(
    storage: &dyn Storage,
    key: &str,
) -> std::result::Result<Option<T>, StorageError> {
    match storage.get(key)? {
        None => Ok(None),
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StorageError::Codec {
                key: key.to_string(),
                source,
            }),
    }
}

fn store_key<T: Serialize>(
    storage: &dyn Storage,
    key: &str,
    value: &T,
) -> std::result::Result<(), StorageError> {
    let bytes = serde_json::to_vec(value).map_err(|source| StorageError::Codec {
        key: key.to_string(),
        source,
    })?;
    storage.set(key, bytes)
}
