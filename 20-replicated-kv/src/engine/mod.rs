//! Consensus engine built on tikv/raft.
//!
//! A single worker thread owns the raft [`node::RaftNode`] and everything it
//! persists. The rest of the process talks to it through [`RaftEngine`], which
//! implements the [`ConsensusEngine`] contract the coordinator depends on:
//!
//! - `node`: raft state machine driver (ready handling, conf changes, snapshots)
//! - `runtime`: worker thread, request channel, pending proposal tracking
//! - `storage`: on-disk journal, snapshot files and the raft `Storage` impl
//! - `transport`: length-prefixed TCP frames between peers

pub mod node;
mod runtime;
mod storage;
mod transport;

use std::time::Duration;

use raft::StateRole;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StoreResult;

pub use runtime::RaftEngine;

/// Role of the local node as observed from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
    Candidate,
}

impl From<StateRole> for Role {
    fn from(role: StateRole) -> Self {
        match role {
            StateRole::Leader => Role::Leader,
            StateRole::Follower => Role::Follower,
            StateRole::Candidate | StateRole::PreCandidate => Role::Candidate,
        }
    }
}

/// A cluster member: opaque id plus the address peers use for raft traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub address: String,
}

impl Member {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }

    pub fn raft_id(&self) -> u64 {
        raft_id(&self.id)
    }
}

/// Outcome of a committed proposal.
///
/// `response` is whatever the state machine returned for the entry. The
/// proposal itself reached consensus even when `response` is an error.
#[derive(Debug)]
pub struct Committed {
    pub index: u64,
    pub term: u64,
    pub response: StoreResult<()>,
}

/// Point-in-time view of the engine, refreshed by the worker every loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub role: Role,
    pub term: u64,
    pub leader: Option<String>,
    pub commit_index: u64,
    pub applied_index: u64,
    pub snapshot_index: u64,
    pub members: Vec<Member>,
    /// Why the worker stopped, once it has failed. The node no longer takes part in consensus.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            role: Role::Follower,
            term: 0,
            leader: None,
            commit_index: 0,
            applied_index: 0,
            snapshot_index: 0,
            members: Vec::new(),
            failure: None,
        }
    }
}

/// What the coordinator needs from a consensus engine.
///
/// Blocking calls take an explicit timeout. On `ConsensusTimeout` the request
/// may still take effect later.
pub trait ConsensusEngine: Send + Sync {
    fn propose(&self, data: Vec<u8>, timeout: Duration) -> StoreResult<Committed>;

    fn role(&self) -> Role;

    /// Member id of the current leader, when known.
    fn leader(&self) -> Option<String>;

    /// True when the data directory held raft state at open, or after bootstrap.
    fn has_existing_state(&self) -> bool;

    /// Creates a one-member cluster. A no-op when state already exists.
    fn bootstrap_single_node(&self, id: &str, address: &str) -> StoreResult<()>;

    fn add_voter(&self, id: &str, address: &str, timeout: Duration) -> StoreResult<()>;

    fn remove_voter(&self, id: &str, timeout: Duration) -> StoreResult<()>;

    fn status(&self) -> EngineStatus;

    /// `Engine` error once the engine has failed and stopped replicating.
    fn health(&self) -> StoreResult<()>;

    /// Stops the engine and releases the data directory. Safe to call twice.
    fn shutdown(&self) -> StoreResult<()>;
}

/// Numeric raft id for a member id.
///
/// Raft needs non-zero `u64` ids, so the id is hashed and 0 is remapped.
pub fn raft_id(member_id: &str) -> u64 {
    let digest = Sha256::digest(member_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    match u64::from_be_bytes(bytes) {
        0 => 1,
        id => id,
    }
}
