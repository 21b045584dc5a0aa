//! Fault-injecting wrapper around an inbound RPC handler
//!
//! `RpcProxy` sits between the network and the consensus core. In reliable
//! mode it only adds a few milliseconds of jitter; in unreliable mode it
//! drops or delays a share of calls so tests can exercise lossy networks.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::debug;

use crate::core::error::RaftError;
use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, RequestVoteArgs, RequestVoteResult,
};
use crate::transport::RpcHandler;

/// Environment variable that switches servers to unreliable delivery
pub const UNRELIABLE_ENV: &str = "RAFT_UNRELIABLE_RPC";

/// How inbound RPCs are perturbed before reaching the handler
#[derive(Debug, Clone, PartialEq)]
pub enum FaultConfig {
    /// Every call is delivered after 1..=max_jitter of delay
    Reliable { max_jitter: Duration },
    /// A call is dropped with `drop_chance`, otherwise held for `delay`
    /// with `delay_chance`, otherwise delivered after up to `max_jitter`
    Unreliable {
        drop_chance: f64,
        delay_chance: f64,
        delay: Duration,
        max_jitter: Duration,
    },
}

impl Default for FaultConfig {
    fn default() -> Self {
        FaultConfig::Reliable {
            max_jitter: Duration::from_millis(5),
        }
    }
}

impl FaultConfig {
    /// One drop and one long delay per ten calls
    pub fn unreliable() -> Self {
        FaultConfig::Unreliable {
            drop_chance: 0.1,
            delay_chance: 0.1,
            delay: Duration::from_millis(75),
            max_jitter: Duration::ZERO,
        }
    }

    /// Unreliable when `RAFT_UNRELIABLE_RPC` is set to anything non-empty
    pub fn from_env() -> Self {
        Self::from_flag(std::env::var(UNRELIABLE_ENV).ok().as_deref())
    }

    fn from_flag(flag: Option<&str>) -> Self {
        match flag {
            Some(value) if !value.is_empty() => Self::unreliable(),
            _ => Self::default(),
        }
    }
}

enum Fate {
    Drop,
    Deliver(Duration),
}

/// Inbound RPC handler that injects faults before delegating to `inner`
pub struct RpcProxy<H> {
    inner: H,
    faults: FaultConfig,
}

impl<H: RpcHandler> RpcProxy<H> {
    pub fn new(inner: H, faults: FaultConfig) -> Self {
        Self { inner, faults }
    }

    fn roll(&self) -> Fate {
        let mut rng = rand::rng();
        match &self.faults {
            FaultConfig::Reliable { max_jitter } => Fate::Deliver(jitter(&mut rng, *max_jitter)),
            FaultConfig::Unreliable {
                drop_chance,
                delay_chance,
                delay,
                max_jitter,
            } => {
                let dice: f64 = rng.random();
                if dice < *drop_chance {
                    Fate::Drop
                } else if dice < drop_chance + delay_chance {
                    Fate::Deliver(*delay)
                } else {
                    Fate::Deliver(jitter(&mut rng, *max_jitter))
                }
            }
        }
    }

    async fn admit(&self, rpc: &'static str) -> Result<(), RaftError> {
        match self.roll() {
            Fate::Drop => {
                debug!(rpc, "dropping inbound rpc");
                Err(RaftError::Dropped)
            }
            Fate::Deliver(wait) => {
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
                Ok(())
            }
        }
    }
}

fn jitter(rng: &mut impl Rng, max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rng.random_range(1..=max_ms))
}

#[async_trait]
impl<H: RpcHandler> RpcHandler for RpcProxy<H> {
    async fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteResult, RaftError> {
        self.admit("request_vote").await?;
        self.inner.request_vote(args).await
    }

    async fn append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, RaftError> {
        self.admit("append_entries").await?;
        self.inner.append_entries(args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RpcHandler for CountingHandler {
        async fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteResult, RaftError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RequestVoteResult {
                term: args.term,
                vote_granted: true,
            })
        }

        async fn append_entries(
            &self,
            args: AppendEntriesArgs,
        ) -> Result<AppendEntriesResult, RaftError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AppendEntriesResult {
                term: args.term,
                success: true,
                conflict_index: 0,
                conflict_term: None,
            })
        }
    }

    fn vote_args() -> RequestVoteArgs {
        RequestVoteArgs {
            term: 3,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        }
    }

    fn heartbeat() -> AppendEntriesArgs {
        AppendEntriesArgs {
            term: 3,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        }
    }

    #[test]
    fn test_env_flag_selects_mode() {
        assert_eq!(FaultConfig::from_flag(None), FaultConfig::default());
        assert_eq!(FaultConfig::from_flag(Some("")), FaultConfig::default());
        assert_eq!(FaultConfig::from_flag(Some("1")), FaultConfig::unreliable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reliable_delivers_with_small_jitter() {
        let proxy = RpcProxy::new(CountingHandler::default(), FaultConfig::default());

        let start = Instant::now();
        let result = proxy.request_vote(vote_args()).await.unwrap();
        let elapsed = start.elapsed();

        assert!(result.vote_granted);
        assert!(elapsed >= Duration::from_millis(1));
        assert!(elapsed <= Duration::from_millis(5));
        assert_eq!(proxy.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_call_never_reaches_handler() {
        let faults = FaultConfig::Unreliable {
            drop_chance: 1.0,
            delay_chance: 0.0,
            delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        };
        let proxy = RpcProxy::new(CountingHandler::default(), faults);

        assert!(matches!(proxy.append_entries(heartbeat()).await, Err(RaftError::Dropped)));
        assert!(matches!(proxy.request_vote(vote_args()).await, Err(RaftError::Dropped)));
        assert_eq!(proxy.inner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_call_is_held_then_delivered() {
        let faults = FaultConfig::Unreliable {
            drop_chance: 0.0,
            delay_chance: 1.0,
            delay: Duration::from_millis(75),
            max_jitter: Duration::ZERO,
        };
        let proxy = RpcProxy::new(CountingHandler::default(), faults);

        let start = Instant::now();
        let result = proxy.append_entries(heartbeat()).await.unwrap();

        assert!(result.success);
        assert!(start.elapsed() >= Duration::from_millis(75));
        assert_eq!(proxy.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreliable_drops_roughly_one_in_ten() {
        let proxy = RpcProxy::new(CountingHandler::default(), FaultConfig::unreliable());

        let mut dropped = 0;
        for _ in 0..1000 {
            if proxy.request_vote(vote_args()).await.is_err() {
                dropped += 1;
            }
        }

        assert!((40..=200).contains(&dropped), "dropped {} of 1000", dropped);
        assert_eq!(proxy.inner.calls.load(Ordering::SeqCst), 1000 - dropped);
    }
}
