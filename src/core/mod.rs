//! Consensus module: the synchronous Raft state machine, the node that fans
//! RPCs out to peers, and the server loop that drives its timers.

pub mod config;
pub mod error;
pub mod raft_core;
pub mod raft_node;
pub mod raft_server;
