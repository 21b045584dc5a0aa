//! Raft server binary
//!
//! Runs a single Raft node and logs every committed entry.
//!
//! Example for a 3-node cluster:
//!   raft-server --id 1 --listen 127.0.0.1:8001 --data-dir /tmp/raft1 --peer 2=127.0.0.1:8002 --peer 3=127.0.0.1:8003
//!   raft-server --id 2 --listen 127.0.0.1:8002 --data-dir /tmp/raft2 --peer 1=127.0.0.1:8001 --peer 3=127.0.0.1:8003
//!   raft-server --id 3 --listen 127.0.0.1:8003 --data-dir /tmp/raft3 --peer 1=127.0.0.1:8001 --peer 2=127.0.0.1:8002
//!
//! Without `--data-dir` state lives in memory and is lost on exit.
//! Set `RAFT_UNRELIABLE_RPC=1` to drop and delay a share of inbound RPCs.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::EnvFilter;

use raft_consensus::core::config::RaftConfig;
use raft_consensus::proxy::FaultConfig;
use raft_consensus::server::{Server, ServerConfig};
use raft_consensus::storage::{FileStorage, MemoryStorage, Storage};

#[derive(Parser, Debug)]
#[command(name = "raft-server", about = "Run one Raft participant")]
struct Args {
    /// This node's numeric ID (must be unique in the cluster)
    #[arg(long, env = "RAFT_NODE_ID")]
    id: u64,

    /// Address to accept Raft RPCs on
    #[arg(long, env = "RAFT_LISTEN", default_value = "127.0.0.1:0")]
    listen: SocketAddr,

    /// A peer in the form ID=ADDR. Repeat for each peer.
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<(u64, SocketAddr)>,

    /// Directory for durable term, vote and log
    #[arg(long, env = "RAFT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 50)]
    heartbeat_ms: u64,

    #[arg(long, default_value_t = 150)]
    election_min_ms: u64,

    #[arg(long, default_value_t = 300)]
    election_max_ms: u64,
}

fn parse_peer(spec: &str) -> Result<(u64, SocketAddr), String> {
    let (id, addr) = spec
        .split_once('=')
        .ok_or_else(|| format!("--peer must be ID=ADDR, got: {spec}"))?;
    let id = id.parse().map_err(|e| format!("invalid peer id '{id}': {e}"))?;
    let addr = addr.parse().map_err(|e| format!("invalid peer address '{addr}': {e}"))?;
    Ok((id, addr))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("raft_consensus=info")),
        )
        .init();

    let args = Args::parse();

    let storage: Arc<dyn Storage> = match &args.data_dir {
        Some(dir) => Arc::new(FileStorage::new(dir)?),
        None => Arc::new(MemoryStorage::new()),
    };

    let raft = RaftConfig::default()
        .with_heartbeat_interval(Duration::from_millis(args.heartbeat_ms))
        .with_election_timeout(
            Duration::from_millis(args.election_min_ms),
            Duration::from_millis(args.election_max_ms),
        );
    let peer_ids = args.peers.iter().map(|(id, _)| *id).collect();
    let config = ServerConfig::new(args.id, peer_ids)
        .with_bind(args.listen)
        .with_raft(raft)
        .with_faults(FaultConfig::from_env());

    let (commit_tx, mut commit_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = watch::channel(false);
    let mut server = Server::start(config, storage, commit_tx, ready_rx).await?;
    info!(node = args.id, addr = %server.listen_addr(), "raft server started");

    for (peer, addr) in &args.peers {
        server.connect_to_peer(*peer, *addr);
    }
    ready_tx.send_replace(true);

    let id = args.id;
    let commits = tokio::spawn(async move {
        while let Some(entry) = commit_rx.recv().await {
            info!(node = id, index = entry.index, term = entry.term, command = %entry.command, "committed");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!(node = id, "shutting down");
    server.shutdown().await;
    commits.await?;
    Ok(())
}
