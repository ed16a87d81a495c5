//! Error taxonomy for the replicated store.
//!
//! Construction-time failures (`Config`, `Io`, `JoinExhausted`, `RestoreCorrupt`,
//! `Engine`) are fatal and surface from [`crate::Coordinator::open`]. Everything
//! else is a runtime outcome handed back to the caller of a single operation.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The command payload failed decoding or validation.
    #[error("malformed command: {0}")]
    MalformedCommand(String),

    /// This node is not the leader. Carries the leader's member id when known.
    #[error("not the leader{}", leader_hint(.leader))]
    NotLeader { leader: Option<String> },

    /// The engine did not report a commit within the wait. The entry may still commit.
    #[error("timed out waiting for consensus; the operation may still take effect")]
    ConsensusTimeout,

    /// Replication-level failure reported by the engine. Safe to retry.
    #[error("consensus error: {0}")]
    Consensus(String),

    /// The engine rejected an add/remove member request.
    #[error("membership change failed: {0}")]
    MembershipChangeFailed(String),

    /// The join handshake ran out of attempts.
    #[error("failed to join cluster via {target} after {attempts} attempts: {last_error}")]
    JoinExhausted {
        target: String,
        attempts: u32,
        last_error: String,
    },

    /// A snapshot could not be decoded. Never partially applied.
    #[error("snapshot restore failed: {0}")]
    RestoreCorrupt(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Engine start-up or internal failure.
    #[error("consensus engine error: {0}")]
    Engine(String),
}

fn leader_hint(leader: &Option<String>) -> String {
    match leader {
        Some(id) => format!(" (leader is {id})"),
        None => String::new(),
    }
}

impl From<raft::Error> for StoreError {
    fn from(err: raft::Error) -> Self {
        StoreError::Consensus(err.to_string())
    }
}

impl From<anyhow::Error> for StoreError {
    /// Recovers a typed error that was wrapped by `anyhow` inside the engine.
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<StoreError>() {
            Ok(typed) => typed,
            Err(other) => StoreError::Engine(format!("{other:#}")),
        }
    }
}
