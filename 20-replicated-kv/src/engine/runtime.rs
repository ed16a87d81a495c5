//! Worker thread and the [`RaftEngine`] handle.
//!
//! Threads involved:
//!
//! - **Worker**: owns the [`RaftNode`], runs the raft event loop, serves requests
//! - **Listener**: accepts peer connections and forwards messages to the worker
//! - **Peer senders**: one per peer address, drain outbound frames
//!
//! Callers never touch raft state directly. They send a request over a channel
//! and wait on a reply channel with a timeout. Role and leader queries read a
//! status snapshot the worker republishes every loop, so they never block.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use parking_lot::{Mutex, RwLock};
use raft::StateRole;
use raft::prelude::{ConfChangeType, Message};
use tracing::{debug, error, info, warn};

use crate::config::CoordinatorConfig;
use crate::engine::node::{Applied, NodeOptions, Outcome, RaftNode};
use crate::engine::transport::{Inbound, Listener, Outbox};
use crate::engine::{Committed, ConsensusEngine, EngineStatus, Member, Role, raft_id};
use crate::error::{StoreError, StoreResult};
use crate::fsm::StateMachine;

const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10);

/// Requests sent from caller threads to the worker.
enum Request {
    Propose {
        data: Vec<u8>,
        respond_to: Sender<StoreResult<Committed>>,
    },
    AddVoter {
        member: Member,
        respond_to: Sender<StoreResult<()>>,
    },
    RemoveVoter {
        id: String,
        respond_to: Sender<StoreResult<()>>,
    },
    Bootstrap {
        respond_to: Sender<StoreResult<bool>>,
    },
    Shutdown,
}

enum Responder {
    Command(Sender<StoreResult<Committed>>),
    Membership(Sender<StoreResult<()>>),
}

impl Responder {
    fn fail(self, err: StoreError) {
        match self {
            Responder::Command(tx) => {
                let _ = tx.send(Err(err));
            }
            Responder::Membership(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// A proposal waiting for the entry at its index to be applied.
///
/// Keyed by log index. The term tells whether the entry that eventually lands
/// at that index is ours or was written by a later leader.
struct Pending {
    term: u64,
    responder: Responder,
}

/// Handle to a running raft engine.
pub struct RaftEngine {
    member: Member,
    request_tx: Sender<Request>,
    status: Arc<RwLock<EngineStatus>>,
    existing_state: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    listener: Mutex<Option<Listener>>,
}

impl RaftEngine {
    /// Opens the data directory, binds the raft listener and starts the worker.
    pub fn open(config: &CoordinatorConfig, fsm: Arc<dyn StateMachine>) -> StoreResult<Self> {
        let member = Member::new(&config.node_id, config.advertise_addr());
        let node = RaftNode::open(
            NodeOptions {
                member: member.clone(),
                data_dir: config.data_dir.clone(),
                tuning: config.raft,
            },
            fsm,
        )?;
        let existing_state = Arc::new(AtomicBool::new(node.has_state()));

        let (request_tx, request_rx) = unbounded();
        let (network_tx, network_rx) = unbounded();
        let listener = Listener::bind(&config.bind_addr, network_tx)?;
        let status = Arc::new(RwLock::new(node.status()));

        let mut worker = Worker {
            last_role: node.role(),
            node,
            outbox: Outbox::new(member.address.clone()),
            request_rx,
            network_rx,
            status: Arc::clone(&status),
            existing_state: Arc::clone(&existing_state),
            pending: BTreeMap::new(),
            peer_addresses: HashMap::new(),
            tick_interval: config.raft.tick_interval,
        };
        let handle = thread::Builder::new()
            .name(format!("raft-worker-{}", config.node_id))
            .spawn(move || {
                let failure = worker.run().err().map(|err| format!("{err:#}"));
                if let Some(failure) = &failure {
                    error!(error = %failure, "raft worker crashed");
                }
                worker.finish(failure);
            })
            .map_err(|err| StoreError::Engine(format!("failed to spawn raft worker: {err}")))?;

        info!(
            member = %member.id,
            raft_id = member.raft_id(),
            listen = %listener.local_addr(),
            advertise = %member.address,
            "raft engine started"
        );

        Ok(Self {
            member,
            request_tx,
            status,
            existing_state,
            worker: Mutex::new(Some(handle)),
            listener: Mutex::new(Some(listener)),
        })
    }

    fn call<T>(
        &self,
        timeout: Duration,
        build: impl FnOnce(Sender<StoreResult<T>>) -> Request,
    ) -> StoreResult<T> {
        let (tx, rx) = bounded(1);
        self.health()?;
        self.request_tx
            .send(build(tx))
            .map_err(|_| self.stopped())?;
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(StoreError::ConsensusTimeout),
            Err(RecvTimeoutError::Disconnected) => Err(self.stopped()),
        }
    }

    fn stopped(&self) -> StoreError {
        match self.health() {
            Err(err) => err,
            Ok(()) => StoreError::Engine("raft worker is not running".into()),
        }
    }
}

impl ConsensusEngine for RaftEngine {
    fn propose(&self, data: Vec<u8>, timeout: Duration) -> StoreResult<Committed> {
        self.call(timeout, |respond_to| Request::Propose { data, respond_to })
    }

    fn role(&self) -> Role {
        self.status.read().role
    }

    fn leader(&self) -> Option<String> {
        self.status.read().leader.clone()
    }

    fn has_existing_state(&self) -> bool {
        self.existing_state.load(Ordering::SeqCst)
    }

    fn bootstrap_single_node(&self, id: &str, address: &str) -> StoreResult<()> {
        if id != self.member.id || address != self.member.address {
            return Err(StoreError::Config(format!(
                "bootstrap member {id}@{address} does not match engine member {}@{}",
                self.member.id, self.member.address
            )));
        }
        if self.has_existing_state() {
            info!(member = id, "persisted raft state found, skipping bootstrap");
            return Ok(());
        }
        let created = self.call(BOOTSTRAP_TIMEOUT, |respond_to| Request::Bootstrap {
            respond_to,
        })?;
        if !created {
            info!(member = id, "raft log already populated, skipping bootstrap");
        }
        Ok(())
    }

    fn add_voter(&self, id: &str, address: &str, timeout: Duration) -> StoreResult<()> {
        let member = Member::new(id, address);
        self.call(timeout, |respond_to| Request::AddVoter { member, respond_to })
    }

    fn remove_voter(&self, id: &str, timeout: Duration) -> StoreResult<()> {
        let id = id.to_string();
        self.call(timeout, |respond_to| Request::RemoveVoter { id, respond_to })
    }

    fn status(&self) -> EngineStatus {
        self.status.read().clone()
    }

    fn health(&self) -> StoreResult<()> {
        match &self.status.read().failure {
            Some(failure) => Err(StoreError::Engine(format!("raft worker failed: {failure}"))),
            None => Ok(()),
        }
    }

    fn shutdown(&self) -> StoreResult<()> {
        let Some(handle) = self.worker.lock().take() else {
            return Ok(());
        };
        let _ = self.request_tx.send(Request::Shutdown);
        if let Some(mut listener) = self.listener.lock().take() {
            listener.stop();
        }
        handle
            .join()
            .map_err(|_| StoreError::Engine("raft worker panicked".into()))?;
        info!(member = %self.member.id, "raft engine stopped");
        Ok(())
    }
}

impl Drop for RaftEngine {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "raft engine shutdown failed");
        }
    }
}

/// The raft event loop.
///
/// Waits on requests, peer messages and the tick timer with `select!`, then
/// drains every ready raft produced before waiting again.
struct Worker {
    node: RaftNode,
    outbox: Outbox,
    request_rx: Receiver<Request>,
    network_rx: Receiver<Inbound>,
    status: Arc<RwLock<EngineStatus>>,
    existing_state: Arc<AtomicBool>,
    pending: BTreeMap<u64, Pending>,
    /// Sender addresses seen on inbound frames, for peers not yet in the member table.
    peer_addresses: HashMap<u64, String>,
    tick_interval: Duration,
    last_role: StateRole,
}

impl Worker {
    fn run(&mut self) -> Result<()> {
        let mut last_tick = Instant::now();
        self.drive()?;
        loop {
            let timeout = self
                .tick_interval
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::ZERO);

            crossbeam_channel::select! {
                recv(self.request_rx) -> req => {
                    match req {
                        Ok(req) => {
                            if !self.handle_request(req)? {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                recv(self.network_rx) -> inbound => {
                    match inbound {
                        Ok(inbound) => self.handle_inbound(inbound),
                        Err(_) => break,
                    }
                }
                default(timeout) => {}
            }

            if last_tick.elapsed() >= self.tick_interval {
                self.node.tick();
                last_tick = Instant::now();
            }

            self.drive()?;
        }
        Ok(())
    }

    /// Marks the node as no longer serving and records why, if it crashed.
    ///
    /// Pending callers see their reply channel close and read the failure from
    /// the status.
    fn finish(&mut self, failure: Option<String>) {
        let mut status = self.status.write();
        status.role = Role::Follower;
        status.leader = None;
        status.failure = failure;
    }

    fn drive(&mut self) -> Result<()> {
        self.process_ready()?;
        let handed_over = self.node.maybe_hand_over().is_some();
        if self.node.maybe_campaign()? || handed_over {
            self.process_ready()?;
        }
        self.node.maybe_compact()?;
        self.publish_status();
        self.observe_role();
        Ok(())
    }

    fn handle_request(&mut self, req: Request) -> Result<bool> {
        match req {
            Request::Propose { data, respond_to } => {
                if self.node.role() != StateRole::Leader {
                    let _ = respond_to.send(Err(self.not_leader()));
                    return Ok(true);
                }
                match self.node.propose(data) {
                    Ok((index, term)) => {
                        self.pending.insert(
                            index,
                            Pending {
                                term,
                                responder: Responder::Command(respond_to),
                            },
                        );
                    }
                    Err(err) => {
                        let _ = respond_to.send(Err(StoreError::Consensus(format!("{err:#}"))));
                    }
                }
            }
            Request::AddVoter { member, respond_to } => match self.check_add(&member) {
                Ok(true) => self.propose_membership(ConfChangeType::AddNode, &member, respond_to),
                Ok(false) => {
                    debug!(member = %member.id, "member already present");
                    let _ = respond_to.send(Ok(()));
                }
                Err(err) => {
                    let _ = respond_to.send(Err(err));
                }
            },
            Request::RemoveVoter { id, respond_to } => match self.check_remove(&id) {
                Ok(member) => {
                    self.propose_membership(ConfChangeType::RemoveNode, &member, respond_to)
                }
                Err(err) => {
                    let _ = respond_to.send(Err(err));
                }
            },
            Request::Bootstrap { respond_to } => {
                let result = self.bootstrap().map_err(StoreError::from);
                let _ = respond_to.send(result);
            }
            Request::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    fn bootstrap(&mut self) -> Result<bool> {
        let created = self.node.bootstrap()?;
        if created {
            self.existing_state.store(true, Ordering::SeqCst);
            self.drive()?;
        }
        Ok(created)
    }

    fn propose_membership(
        &mut self,
        change_type: ConfChangeType,
        member: &Member,
        respond_to: Sender<StoreResult<()>>,
    ) {
        match self.node.propose_conf_change(change_type, member) {
            Ok((index, term)) => {
                info!(
                    member = %member.id,
                    change = ?change_type,
                    index,
                    "proposed membership change"
                );
                self.pending.insert(
                    index,
                    Pending {
                        term,
                        responder: Responder::Membership(respond_to),
                    },
                );
            }
            Err(err) => {
                let error = StoreError::MembershipChangeFailed(format!("{err:#}"));
                let _ = respond_to.send(Err(error));
            }
        }
    }

    /// Returns `Ok(false)` when the member is already present with the same address.
    fn check_add(&self, member: &Member) -> StoreResult<bool> {
        if self.node.role() != StateRole::Leader {
            return Err(self.not_leader());
        }
        if let Some(existing) = self.node.member_by_raft_id(member.raft_id()) {
            if existing.id != member.id {
                return Err(StoreError::MembershipChangeFailed(format!(
                    "member id {} collides with existing member {}",
                    member.id, existing.id
                )));
            }
            if existing.address == member.address {
                return Ok(false);
            }
            return Err(StoreError::MembershipChangeFailed(format!(
                "member {} is already registered at {}",
                member.id, existing.address
            )));
        }
        if let Some(other) = self.node.members().find(|m| m.address == member.address) {
            return Err(StoreError::MembershipChangeFailed(format!(
                "address {} is already used by member {}",
                member.address, other.id
            )));
        }
        if self.node.has_pending_conf_change() {
            return Err(StoreError::MembershipChangeFailed(
                "another membership change is in progress".into(),
            ));
        }
        Ok(true)
    }

    fn check_remove(&self, id: &str) -> StoreResult<Member> {
        if self.node.role() != StateRole::Leader {
            return Err(self.not_leader());
        }
        let Some(member) = self.node.member_by_raft_id(raft_id(id)) else {
            return Err(StoreError::MembershipChangeFailed(format!(
                "unknown member {id}"
            )));
        };
        if self.node.voter_count() <= 1 {
            return Err(StoreError::MembershipChangeFailed(
                "cannot remove the last voter".into(),
            ));
        }
        if self.node.has_pending_conf_change() {
            return Err(StoreError::MembershipChangeFailed(
                "another membership change is in progress".into(),
            ));
        }
        Ok(member.clone())
    }

    fn not_leader(&self) -> StoreError {
        StoreError::NotLeader {
            leader: self.node.leader_member_id(),
        }
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        let from = inbound.message.from;
        if from != 0 {
            self.peer_addresses.insert(from, inbound.from);
        }
        if let Err(err) = self.node.step(inbound.message) {
            debug!(from, error = %format!("{err:#}"), "ignored peer message");
        }
    }

    fn process_ready(&mut self) -> Result<()> {
        while let Some(bundle) = self.node.poll_ready()? {
            for msg in bundle.messages {
                self.dispatch_message(msg)?;
            }
            for applied in bundle.applied {
                self.resolve(applied);
            }
        }
        self.fail_skipped();
        Ok(())
    }

    fn dispatch_message(&mut self, msg: Message) -> Result<()> {
        if msg.to == self.node.id() {
            self.node.step(msg)?;
            return Ok(());
        }

        let to = msg.to;
        let addr = self
            .node
            .member_by_raft_id(to)
            .map(|member| member.address.clone())
            .or_else(|| self.peer_addresses.get(&to).cloned());
        match addr {
            Some(addr) => self.outbox.send(&addr, &msg),
            None => warn!(peer = to, "no address for peer, dropping message"),
        }
        Ok(())
    }

    /// Answers the caller waiting on the entry that was just applied, if any.
    fn resolve(&mut self, applied: Applied) {
        let Some(pending) = self.pending.remove(&applied.index) else {
            return;
        };
        if pending.term != applied.term {
            pending.responder.fail(superseded(applied.index));
            return;
        }
        match (pending.responder, applied.outcome) {
            (Responder::Command(tx), Outcome::Command(response)) => {
                let _ = tx.send(Ok(Committed {
                    index: applied.index,
                    term: applied.term,
                    response,
                }));
            }
            (Responder::Membership(tx), Outcome::Membership) => {
                let _ = tx.send(Ok(()));
            }
            (Responder::Membership(tx), _) => {
                let _ = tx.send(Err(StoreError::MembershipChangeFailed(
                    "change was dropped because another membership change was pending".into(),
                )));
            }
            (responder, _) => responder.fail(superseded(applied.index)),
        }
    }

    /// Fails proposals whose index was covered by an installed snapshot.
    fn fail_skipped(&mut self) {
        let applied = self.node.applied_index();
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() > applied {
                break;
            }
            let (index, pending) = entry.remove_entry();
            pending.responder.fail(superseded(index));
        }
    }

    fn publish_status(&self) {
        *self.status.write() = self.node.status();
    }

    /// Logs role transitions. Losing leadership fails every pending proposal.
    ///
    /// Entries already in the log may still be committed by the next leader,
    /// so callers get `ConsensusTimeout` rather than a definite rejection.
    fn observe_role(&mut self) {
        let current = self.node.role();
        if current == self.last_role {
            return;
        }
        info!(
            from = ?self.last_role,
            to = ?current,
            term = self.node.term(),
            leader = ?self.node.leader_member_id(),
            "role changed"
        );
        if self.last_role == StateRole::Leader && !self.pending.is_empty() {
            warn!(pending = self.pending.len(), "leadership lost with proposals in flight");
            for (_, pending) in std::mem::take(&mut self.pending) {
                pending.responder.fail(StoreError::ConsensusTimeout);
            }
        }
        self.last_role = current;
    }
}

fn superseded(index: u64) -> StoreError {
    StoreError::Consensus(format!(
        "proposal at index {index} was superseded by another leader"
    ))
}
