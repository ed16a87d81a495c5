//! Join handshake for a node entering an existing cluster.
//!
//! The joining node asks a configured member to add it as a voter and keeps
//! asking, with a fixed backoff, until the request is accepted or the attempt
//! budget runs out. The target address is never re-resolved: if it points at a
//! follower every attempt is rejected with "not the leader" until leadership
//! moves there or the budget is spent.

use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::JoinPolicy;
use crate::error::{StoreError, StoreResult};

/// Sends one add-member request to a cluster member.
pub trait JoinTransport: Send + Sync {
    fn request_join(&self, target: &str, id: &str, address: &str) -> StoreResult<()>;
}

/// Calls `POST /add-node` on the target's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpJoinTransport {
    timeout: Duration,
}

impl HttpJoinTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Per-request timeout, covering connect and the leader's reply.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

fn add_node_url(target: &str) -> String {
    let base = target.trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        format!("{base}/add-node")
    } else {
        format!("http://{base}/add-node")
    }
}

impl JoinTransport for HttpJoinTransport {
    fn request_join(&self, target: &str, id: &str, address: &str) -> StoreResult<()> {
        // Built per call: a blocking client must not be created inside a tokio runtime,
        // and this transport may be handed to one later.
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|err| StoreError::MembershipChangeFailed(format!("http client: {err}")))?;

        let response = client
            .post(add_node_url(target))
            .query(&[("followerId", id), ("followerAddr", address)])
            .send()
            .map_err(|err| StoreError::MembershipChangeFailed(format!("request failed: {err}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().unwrap_or_default();
        Err(StoreError::MembershipChangeFailed(format!(
            "{status}: {}",
            body.trim()
        )))
    }
}

/// Retries the join request according to a [`JoinPolicy`].
pub struct MembershipClient<'a> {
    transport: &'a dyn JoinTransport,
    policy: JoinPolicy,
}

impl<'a> MembershipClient<'a> {
    pub fn new(transport: &'a dyn JoinTransport, policy: JoinPolicy) -> Self {
        Self { transport, policy }
    }

    /// Blocks until `target` accepts this node or the budget is exhausted.
    pub fn join(&self, target: &str, id: &str, address: &str) -> StoreResult<()> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.transport.request_join(target, id, address) {
                Ok(()) => {
                    info!(target, attempt, "joined cluster");
                    return Ok(());
                }
                Err(err) => {
                    warn!(target, attempt, max_attempts, error = %err, "join attempt failed");
                    last_error = err.to_string();
                }
            }
            if attempt < max_attempts {
                thread::sleep(self.policy.backoff);
            }
        }

        Err(StoreError::JoinExhausted {
            target: target.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }
}
