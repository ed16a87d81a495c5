//! Raft-replicated key-value store with dynamic membership.
//!
//! A cluster keeps one string-to-string map consistent across its nodes. Writes
//! go through the leader's raft log and are applied on every replica in commit
//! order. Reads are served from the local copy and may lag the leader.
//!
//! # Architecture
//!
//! - **Coordinator**: leader-gated writes, local reads, cluster formation
//!   (bootstrap a first node, or join an existing one over HTTP)
//! - **State machine**: the replicated table plus snapshot and restore
//! - **Engine worker thread**: drives tikv/raft, persists the log, tracks proposals
//! - **Network threads**: accept peer frames, send one frame per connection
//! - **HTTP adapter**: axum routes calling into the coordinator
//!
//! The raft state stays single-threaded inside the worker. Everything else
//! talks to it over crossbeam channels.
//!
//! # Modules
//!
//! - [`command`]: commands replicated through the raft log
//! - [`fsm`]: the key-value table and the state machine contract
//! - [`coordinator`]: the store coordinator
//! - [`membership`]: join handshake with retry and backoff
//! - [`engine`]: raft node, worker runtime, durable storage, peer transport
//! - [`http`]: HTTP API
//! - [`config`]: node configuration
//! - [`error`]: error taxonomy

pub mod command;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod fsm;
pub mod http;
pub mod membership;

pub use command::Command;
pub use config::{CoordinatorConfig, JoinPolicy, RaftTuning};
pub use coordinator::{Coordinator, NodeStatus};
pub use engine::{ConsensusEngine, EngineStatus, Member, Role};
pub use error::{StoreError, StoreResult};
pub use fsm::{KvStateMachine, StateMachine};
pub use membership::{HttpJoinTransport, JoinTransport, MembershipClient};
