//! Node configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{StoreError, StoreResult};

/// Retry budget for the join handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for JoinPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Timing and compaction knobs for the raft worker.
///
/// Election and heartbeat are counted in ticks, so with the default 100ms tick
/// a follower starts an election after roughly one second of silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaftTuning {
    pub tick_interval: Duration,
    pub election_tick: usize,
    pub heartbeat_tick: usize,
    /// Applied entries between log compactions.
    pub snapshot_threshold: u64,
}

impl Default for RaftTuning {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            election_tick: 10,
            heartbeat_tick: 3,
            snapshot_threshold: 1024,
        }
    }
}

/// Immutable configuration of one coordinator instance.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub node_id: String,
    /// Local address the consensus listener binds to.
    pub bind_addr: String,
    /// Address peers should dial. Falls back to `bind_addr` when unset.
    pub advertise_addr: Option<String>,
    pub data_dir: PathBuf,
    pub bootstrap: bool,
    /// HTTP address of an existing member's membership endpoint.
    pub join_addr: Option<String>,
    pub apply_timeout: Duration,
    pub membership_timeout: Duration,
    pub join: JoinPolicy,
    pub raft: RaftTuning,
}

impl CoordinatorConfig {
    pub fn builder(node_id: impl Into<String>) -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::new(node_id)
    }

    pub fn advertise_addr(&self) -> &str {
        self.advertise_addr.as_deref().unwrap_or(&self.bind_addr)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.node_id.trim().is_empty() {
            return Err(StoreError::Config("node id must not be empty".into()));
        }
        if self.bind_addr.trim().is_empty() {
            return Err(StoreError::Config("bind address must not be empty".into()));
        }
        if matches!(self.advertise_addr.as_deref(), Some(addr) if addr.trim().is_empty()) {
            return Err(StoreError::Config(
                "advertise address must not be empty when set".into(),
            ));
        }
        if self.bootstrap && self.join_addr.is_some() {
            return Err(StoreError::Config(
                "bootstrap and join are mutually exclusive".into(),
            ));
        }
        if self.join.max_attempts == 0 {
            return Err(StoreError::Config("join budget must allow at least one attempt".into()));
        }
        if self.raft.heartbeat_tick == 0 || self.raft.heartbeat_tick >= self.raft.election_tick {
            return Err(StoreError::Config(format!(
                "heartbeat tick ({}) must be non-zero and below election tick ({})",
                self.raft.heartbeat_tick, self.raft.election_tick
            )));
        }
        if self.raft.tick_interval.is_zero() {
            return Err(StoreError::Config("tick interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// Builder for [`CoordinatorConfig`]. `build` validates the result.
#[derive(Debug, Clone)]
pub struct CoordinatorConfigBuilder {
    config: CoordinatorConfig,
}

impl CoordinatorConfigBuilder {
    pub fn new(node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        let data_dir = PathBuf::from("data").join(format!("{node_id}-raft"));
        Self {
            config: CoordinatorConfig {
                node_id,
                bind_addr: "127.0.0.1:7000".to_string(),
                advertise_addr: None,
                data_dir,
                bootstrap: false,
                join_addr: None,
                apply_timeout: Duration::from_millis(500),
                membership_timeout: Duration::from_secs(10),
                join: JoinPolicy::default(),
                raft: RaftTuning::default(),
            },
        }
    }

    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_addr = addr.into();
        self
    }

    pub fn advertise_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.advertise_addr = Some(addr.into());
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn bootstrap(mut self, bootstrap: bool) -> Self {
        self.config.bootstrap = bootstrap;
        self
    }

    pub fn join(mut self, addr: impl Into<String>) -> Self {
        self.config.join_addr = Some(addr.into());
        self
    }

    pub fn apply_timeout(mut self, timeout: Duration) -> Self {
        self.config.apply_timeout = timeout;
        self
    }

    pub fn membership_timeout(mut self, timeout: Duration) -> Self {
        self.config.membership_timeout = timeout;
        self
    }

    pub fn join_policy(mut self, policy: JoinPolicy) -> Self {
        self.config.join = policy;
        self
    }

    pub fn raft_tuning(mut self, tuning: RaftTuning) -> Self {
        self.config.raft = tuning;
        self
    }

    pub fn snapshot_threshold(mut self, threshold: u64) -> Self {
        self.config.raft.snapshot_threshold = threshold;
        self
    }

    pub fn build(self) -> StoreResult<CoordinatorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = CoordinatorConfig::builder("a").build().unwrap();
        assert_eq!(config.apply_timeout, Duration::from_millis(500));
        assert_eq!(config.join.max_attempts, 30);
        assert_eq!(config.raft.election_tick, 10);
        assert_eq!(config.data_dir, PathBuf::from("data/a-raft"));
        assert_eq!(config.advertise_addr(), "127.0.0.1:7000");
    }

    #[test]
    fn advertise_overrides_bind() {
        let config = CoordinatorConfig::builder("a")
            .bind_addr("0.0.0.0:7001")
            .advertise_addr("10.0.0.5:7001")
            .build()
            .unwrap();
        assert_eq!(config.advertise_addr(), "10.0.0.5:7001");
    }

    #[test]
    fn rejects_invalid_combinations() {
        let err = CoordinatorConfig::builder("a")
            .bootstrap(true)
            .join("127.0.0.1:8000")
            .build()
            .unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));

        assert!(CoordinatorConfig::builder(" ").build().is_err());
        assert!(CoordinatorConfig::builder("a").bind_addr("").build().is_err());
        assert!(CoordinatorConfig::builder("a")
            .join_policy(JoinPolicy {
                max_attempts: 0,
                backoff: Duration::ZERO,
            })
            .build()
            .is_err());
        assert!(CoordinatorConfig::builder("a")
            .raft_tuning(RaftTuning {
                heartbeat_tick: 10,
                ..RaftTuning::default()
            })
            .build()
            .is_err());
    }
}
