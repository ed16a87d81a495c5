//! Store coordinator: the public face of a replica.
//!
//! Owns the key-value table and the consensus engine driving it. Writes and
//! membership changes are gated on leadership and go through consensus. Reads
//! go straight to the local table and may lag the leader.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::config::CoordinatorConfig;
use crate::engine::{ConsensusEngine, EngineStatus, RaftEngine, Role};
use crate::error::{StoreError, StoreResult};
use crate::fsm::{KvStateMachine, StateMachine};
use crate::membership::{HttpJoinTransport, JoinTransport, MembershipClient};

/// Time a join request may take beyond the leader's own membership wait.
///
/// The leader answers only after its conf change commits or times out, so the
/// client has to outlast `membership_timeout` plus the round trip.
const JOIN_REQUEST_SLACK: Duration = Duration::from_secs(2);

/// Status report for one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub keys: usize,
    #[serde(flatten)]
    pub consensus: EngineStatus,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    fsm: Arc<KvStateMachine>,
    engine: Box<dyn ConsensusEngine>,
}

impl Coordinator {
    /// Opens a replica backed by the raft engine, joining over HTTP if configured.
    pub fn open(config: CoordinatorConfig) -> StoreResult<Self> {
        let transport = HttpJoinTransport::new(join_request_timeout(&config));
        Self::open_with(config, &transport)
    }

    /// Like [`Coordinator::open`] with a caller-supplied join transport.
    pub fn open_with(
        config: CoordinatorConfig,
        transport: &dyn JoinTransport,
    ) -> StoreResult<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;

        let fsm = Arc::new(KvStateMachine::new());
        let engine = RaftEngine::open(&config, Arc::clone(&fsm) as Arc<dyn StateMachine>)?;
        Self::from_parts(config, fsm, Box::new(engine), transport)
    }

    /// Assembles a coordinator from existing parts and forms the cluster.
    ///
    /// Exactly one of bootstrap, join, or nothing happens, according to config.
    /// Any failure here is fatal and drops the engine.
    pub fn from_parts(
        config: CoordinatorConfig,
        fsm: Arc<KvStateMachine>,
        engine: Box<dyn ConsensusEngine>,
        transport: &dyn JoinTransport,
    ) -> StoreResult<Self> {
        let coordinator = Self {
            config,
            fsm,
            engine,
        };
        coordinator.form_cluster(transport)?;
        Ok(coordinator)
    }

    fn form_cluster(&self, transport: &dyn JoinTransport) -> StoreResult<()> {
        let id = self.config.node_id.as_str();
        let address = self.config.advertise_addr();

        if self.config.bootstrap {
            return self.engine.bootstrap_single_node(id, address);
        }

        match &self.config.join_addr {
            Some(target) if self.engine.has_existing_state() => {
                info!(target = %target, "persisted raft state found, skipping join");
                Ok(())
            }
            Some(target) => {
                info!(target = %target, member = id, address, "joining cluster");
                MembershipClient::new(transport, self.config.join).join(target, id, address)
            }
            None => {
                info!(member = id, "no bootstrap or join configured, waiting to be added");
                Ok(())
            }
        }
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.engine.role()
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    /// `Engine` error once the consensus engine has failed. The replica then
    /// serves stale reads only and should be restarted.
    pub fn health(&self) -> StoreResult<()> {
        self.engine.health()
    }

    fn ensure_leader(&self) -> StoreResult<()> {
        self.engine.health()?;
        if self.is_leader() {
            Ok(())
        } else {
            Err(StoreError::NotLeader {
                leader: self.engine.leader(),
            })
        }
    }

    /// Replicates a raw command and returns once it is applied here.
    ///
    /// A `ConsensusTimeout` does not mean the command failed. It may still
    /// commit, so callers must not blindly resubmit non-idempotent commands.
    pub fn apply(&self, command: &[u8]) -> StoreResult<()> {
        self.ensure_leader()?;
        let committed = self
            .engine
            .propose(command.to_vec(), self.config.apply_timeout)?;
        committed.response
    }

    /// Reads a key from the local table.
    pub fn read(&self, key: &str) -> Option<String> {
        self.fsm.get(key)
    }

    pub fn add_member(&self, id: &str, address: &str) -> StoreResult<()> {
        self.ensure_leader()?;
        self.engine
            .add_voter(id, address, self.config.membership_timeout)?;
        info!(member = id, address, "member added");
        Ok(())
    }

    pub fn remove_member(&self, id: &str) -> StoreResult<()> {
        self.ensure_leader()?;
        self.engine.remove_voter(id, self.config.membership_timeout)?;
        info!(member = id, "member removed");
        Ok(())
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.config.node_id.clone(),
            keys: self.fsm.len(),
            consensus: self.engine.status(),
        }
    }

    /// Stops the engine and releases the data directory.
    pub fn shutdown(&self) -> StoreResult<()> {
        self.engine.shutdown()
    }
}

fn join_request_timeout(config: &CoordinatorConfig) -> Duration {
    config.membership_timeout + JOIN_REQUEST_SLACK
}
