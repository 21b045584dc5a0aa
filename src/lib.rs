//! Raft consensus participant
//!
//! One node of a replicated log: leader election, log replication and
//! in-order delivery of committed entries, served over HTTP.

pub mod core;
pub mod proxy;
pub mod server;
pub mod storage;
pub mod transport;

/// Testing utilities for integration tests.
pub mod testing;
