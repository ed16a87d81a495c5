//! Raft node driver.
//!
//! [`RaftNode`] wraps tikv/raft's `RawNode` together with everything that has to
//! move in lockstep with it: the durable data directory, the state machine and
//! the member table learned from conf change entries. It is single-threaded and
//! owned by the engine worker.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use prost::Message as ProstMessage;
use raft::prelude::{
    ConfChange, ConfChangeType, ConfState, Config, Entry, EntryType, HardState, Message, RawNode,
    Snapshot,
};
use raft::{GetEntriesContext, StateRole, Storage};
use slog::{Logger, o};
use tracing::{debug, info, warn};

use crate::config::RaftTuning;
use crate::engine::storage::{ClusterStorage, DataDir, Record, SnapshotImage};
use crate::engine::{EngineStatus, Member};
use crate::error::StoreResult;
use crate::fsm::StateMachine;

/// The raft library insists on an slog logger; our logging goes through `tracing`.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// What applying one committed entry produced.
#[derive(Debug)]
pub enum Outcome {
    /// A normal entry. Carries the state machine's verdict.
    Command(StoreResult<()>),
    /// A conf change entry.
    Membership,
    /// Leader no-op, or a conf change raft replaced because another was pending.
    Empty,
}

#[derive(Debug)]
pub struct Applied {
    pub index: u64,
    pub term: u64,
    pub outcome: Outcome,
}

/// Messages to send and entries applied during one ready cycle.
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub applied: Vec<Applied>,
}

pub struct NodeOptions {
    pub member: Member,
    pub data_dir: PathBuf,
    pub tuning: RaftTuning,
}

pub struct RaftNode {
    id: u64,
    member: Member,
    cfg: Config,
    raw: RawNode<ClusterStorage>,
    storage: ClusterStorage,
    data: DataDir,
    fsm: Arc<dyn StateMachine>,
    members: BTreeMap<u64, Member>,
    conf_state: ConfState,
    conf_index: u64,
    applied_index: u64,
    snapshot_index: u64,
    snapshot_threshold: u64,
    has_state: bool,
    campaign_pending: bool,
    /// Set when this leader applied its own removal.
    handover_pending: bool,
}

impl RaftNode {
    /// Opens the data directory and rebuilds the node from what it holds.
    ///
    /// The newest snapshot is restored into `fsm` right away. Entries after it are
    /// handed back by raft as committed entries on the first ready, so the state
    /// machine catches up through the normal apply path.
    pub fn open(options: NodeOptions, fsm: Arc<dyn StateMachine>) -> Result<Self> {
        let id = options.member.raft_id();
        let (data, recovered) = DataDir::open(&options.data_dir)?;

        let mut members = BTreeMap::new();
        let mut snapshot_index = 0;
        if let Some(snapshot) = &recovered.snapshot {
            let image = SnapshotImage::decode(&snapshot.data[..])?;
            fsm.restore(&mut image.state.as_slice())?;
            members.extend(image.members.into_iter().map(|m| (m.raft_id(), m)));
            snapshot_index = snapshot.get_metadata().index;
            info!(index = snapshot_index, "restored state machine from snapshot");
        }

        let cfg = Config {
            id,
            election_tick: options.tuning.election_tick,
            heartbeat_tick: options.tuning.heartbeat_tick,
            max_inflight_msgs: 256,
            max_size_per_msg: 1024 * 1024,
            // A leader that lost its voters, including one that removed itself, steps down.
            check_quorum: true,
            ..Default::default()
        };
        let storage = recovered.storage;
        let conf_state = storage.initial_state()?.conf_state;
        let raw = RawNode::new(&cfg, storage.clone(), &silent_logger())
            .with_context(|| format!("failed to construct RawNode {id}"))?;

        let sole_voter = conf_state.voters == [id] && conf_state.learners.is_empty();
        Ok(Self {
            id,
            member: options.member,
            cfg,
            raw,
            storage,
            data,
            fsm,
            members,
            conf_state,
            conf_index: recovered.conf_index,
            applied_index: snapshot_index,
            snapshot_index,
            snapshot_threshold: options.tuning.snapshot_threshold.max(1),
            has_state: recovered.has_state,
            campaign_pending: sole_voter,
            handover_pending: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn member(&self) -> &Member {
        &self.member
    }

    pub fn has_state(&self) -> bool {
        self.has_state
    }

    pub fn tick(&mut self) {
        self.raw.tick();
    }

    pub fn campaign(&mut self) -> Result<()> {
        self.raw.campaign().context("campaign failed")
    }

    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    /// Raft id of the current leader, or 0 if none is known.
    pub fn leader_id(&self) -> u64 {
        self.raw.raft.leader_id
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn member_by_raft_id(&self, id: u64) -> Option<&Member> {
        self.members.get(&id)
    }

    pub fn voter_count(&self) -> usize {
        self.conf_state.voters.len()
    }

    pub fn has_pending_conf_change(&self) -> bool {
        self.raw.raft.has_pending_conf()
    }

    /// Member id of the leader, falling back to its raft id if it is not in the table.
    pub fn leader_member_id(&self) -> Option<String> {
        match self.leader_id() {
            0 => None,
            id => Some(
                self.members
                    .get(&id)
                    .map(|member| member.id.clone())
                    .unwrap_or_else(|| id.to_string()),
            ),
        }
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            role: self.role().into(),
            term: self.term(),
            leader: self.leader_member_id(),
            commit_index: self.raw.raft.raft_log.committed,
            applied_index: self.applied_index,
            snapshot_index: self.snapshot_index,
            members: self.members.values().cloned().collect(),
            failure: None,
        }
    }

    /// Appends a command to the leader's log. Returns its (index, term).
    ///
    /// Success only means the entry is in the local log. It can still be
    /// overwritten if leadership changes before it commits.
    pub fn propose(&mut self, data: Vec<u8>) -> Result<(u64, u64)> {
        self.raw.propose(vec![], data).context("propose failed")?;
        Ok(self.last_proposal())
    }

    /// Proposes adding or removing `member` as a voter. Returns its (index, term).
    pub fn propose_conf_change(
        &mut self,
        change_type: ConfChangeType,
        member: &Member,
    ) -> Result<(u64, u64)> {
        let mut cc = ConfChange::default();
        cc.set_change_type(change_type);
        cc.node_id = member.raft_id();
        cc.context = bincode::serialize(member)
            .context("failed to encode member")?
            .into();
        self.raw
            .propose_conf_change(vec![], cc)
            .context("propose conf change failed")?;
        Ok(self.last_proposal())
    }

    fn last_proposal(&self) -> (u64, u64) {
        (self.raw.raft.raft_log.last_index(), self.raw.raft.term)
    }

    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.raw.step(msg).context("step failed")
    }

    /// Writes a single-voter cluster into an empty data directory.
    ///
    /// The cluster starts with one committed conf change at index 1 that adds
    /// this node, so the member's address is part of the log every later member
    /// replicates. Returns `false` without touching anything if state exists.
    pub fn bootstrap(&mut self) -> Result<bool> {
        if self.has_state || self.storage.last_index()? > 0 {
            return Ok(false);
        }

        let mut cc = ConfChange::default();
        cc.set_change_type(ConfChangeType::AddNode);
        cc.node_id = self.id;
        cc.context = bincode::serialize(&self.member)
            .context("failed to encode member")?
            .into();

        let mut entry = Entry::default();
        entry.set_entry_type(EntryType::EntryConfChange);
        entry.index = 1;
        entry.term = 1;
        entry.data = cc.encode_to_vec().into();

        let conf_state = ConfState::from((vec![self.id], vec![]));
        let mut hard_state = HardState::default();
        hard_state.term = 1;
        hard_state.commit = 1;

        {
            let mut core = self.storage.mem().wl();
            core.append(std::slice::from_ref(&entry))?;
            core.set_conf_state(conf_state.clone());
            core.set_hardstate(hard_state.clone());
        }
        self.data.journal.append(&[
            Record::entry(&entry),
            Record::conf_state(1, &conf_state),
            Record::hard_state(&hard_state),
        ])?;

        self.raw = RawNode::new(&self.cfg, self.storage.clone(), &silent_logger())
            .context("failed to rebuild RawNode after bootstrap")?;
        self.conf_state = conf_state;
        self.conf_index = 1;
        self.has_state = true;
        self.campaign_pending = true;
        info!(member = %self.member.id, "bootstrapped single-node cluster");
        Ok(true)
    }

    /// Campaigns once everything committed has been applied, if a campaign is owed.
    ///
    /// Raft refuses to campaign while a committed conf change is unapplied, which
    /// is always the case right after bootstrap or a restart.
    pub fn maybe_campaign(&mut self) -> Result<bool> {
        if !self.campaign_pending || self.applied_index < self.raw.raft.raft_log.committed {
            return Ok(false);
        }
        self.campaign_pending = false;
        if self.role() == StateRole::Leader {
            return Ok(false);
        }
        self.campaign()?;
        Ok(true)
    }

    /// Hands leadership to the most caught-up remaining voter after this
    /// leader applied its own removal.
    ///
    /// Raft keeps a removed leader in charge until something else unseats it.
    /// The target refuses to campaign until it has applied the removal too, so
    /// a transfer raft aborted is started again until this node steps down.
    pub fn maybe_hand_over(&mut self) -> Option<u64> {
        if !self.handover_pending {
            return None;
        }
        if self.role() != StateRole::Leader {
            self.handover_pending = false;
            return None;
        }
        if self.raw.raft.lead_transferee.is_some() {
            return None;
        }
        let progress = self.raw.raft.prs();
        let target = self
            .conf_state
            .voters
            .iter()
            .copied()
            .filter(|&voter| voter != self.id)
            .max_by_key(|&voter| progress.get(voter).map_or(0, |pr| pr.matched));
        let Some(target) = target else {
            warn!("removed leader has no voter to hand over to");
            return None;
        };
        info!(to = target, "handing over leadership after self-removal");
        self.raw.transfer_leader(target);
        Some(target)
    }

    /// Processes one raft ready, if there is one.
    ///
    /// Order follows what raft requires of a durable node:
    ///
    /// 1. Collect messages that may be sent before persisting.
    /// 2. Install an incoming snapshot.
    /// 3. Apply committed entries.
    /// 4. Append new entries and the hard state, then sync the journal.
    /// 5. Collect messages that had to wait for the sync.
    /// 6. Advance, then handle the light ready the same way.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut messages = ready.take_messages();
        let mut applied = Vec::new();
        let mut records = Vec::new();

        if !ready.snapshot().is_empty() {
            self.install_snapshot(ready.snapshot().clone())?;
        }

        applied.extend(self.apply_entries(ready.take_committed_entries(), &mut records)?);

        if !ready.entries().is_empty() {
            self.storage
                .mem()
                .wl()
                .append(ready.entries())
                .context("append entries failed")?;
            records.extend(ready.entries().iter().map(Record::entry));
        }

        if let Some(hard_state) = ready.hs() {
            self.storage.mem().wl().set_hardstate(hard_state.clone());
            records.push(Record::hard_state(hard_state));
        }

        self.data.journal.append(&records)?;
        messages.extend(ready.take_persisted_messages());

        let mut light_ready = self.raw.advance(ready);
        let mut records = Vec::new();

        if let Some(commit) = light_ready.commit_index() {
            let hard_state = {
                let mut core = self.storage.mem().wl();
                core.mut_hard_state().commit = commit;
                core.hard_state().clone()
            };
            records.push(Record::hard_state(&hard_state));
        }

        messages.extend(light_ready.take_messages());
        applied.extend(self.apply_entries(light_ready.take_committed_entries(), &mut records)?);
        self.data.journal.append(&records)?;

        self.raw.advance_apply();

        Ok(Some(ReadyBundle { messages, applied }))
    }

    fn apply_entries(
        &mut self,
        entries: Vec<Entry>,
        records: &mut Vec<Record>,
    ) -> Result<Vec<Applied>> {
        let mut applied = Vec::with_capacity(entries.len());
        for entry in entries {
            let outcome = match entry.entry_type() {
                EntryType::EntryNormal if entry.data.is_empty() => Outcome::Empty,
                EntryType::EntryNormal => {
                    let result = self.fsm.apply(&entry.data);
                    if let Err(err) = &result {
                        debug!(index = entry.index, error = %err, "state machine rejected entry");
                    }
                    Outcome::Command(result)
                }
                EntryType::EntryConfChange => {
                    self.apply_conf_change(&entry, records)?;
                    Outcome::Membership
                }
                EntryType::EntryConfChangeV2 => {
                    warn!(index = entry.index, "ignoring joint conf change entry");
                    Outcome::Empty
                }
            };
            self.applied_index = entry.index;
            applied.push(Applied {
                index: entry.index,
                term: entry.term,
                outcome,
            });
        }
        Ok(applied)
    }

    /// Applies a conf change and updates the member table.
    ///
    /// Conf changes at or below `conf_index` are already reflected in the conf
    /// state raft was built with. They are replayed only for the member table.
    fn apply_conf_change(&mut self, entry: &Entry, records: &mut Vec<Record>) -> Result<()> {
        let cc = ConfChange::decode(&entry.data[..]).context("decode conf change failed")?;

        if entry.index > self.conf_index {
            let conf_state = self
                .raw
                .apply_conf_change(&cc)
                .context("apply conf change failed")?;
            self.storage.mem().wl().set_conf_state(conf_state.clone());
            records.push(Record::conf_state(entry.index, &conf_state));
            self.conf_state = conf_state;
            self.conf_index = entry.index;
            if cc.change_type() == ConfChangeType::RemoveNode && cc.node_id == self.id {
                self.handover_pending = true;
            }
        }

        let member: Option<Member> = bincode::deserialize(&cc.context[..]).ok();
        match cc.change_type() {
            ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => match member {
                Some(member) => {
                    info!(
                        index = entry.index,
                        member = %member.id,
                        address = %member.address,
                        "member added"
                    );
                    self.members.insert(cc.node_id, member);
                }
                None => warn!(
                    index = entry.index,
                    node = cc.node_id,
                    "conf change without member context"
                ),
            },
            ConfChangeType::RemoveNode => {
                if let Some(member) = self.members.remove(&cc.node_id) {
                    info!(index = entry.index, member = %member.id, "member removed");
                }
            }
        }
        Ok(())
    }

    /// Takes a snapshot when one is due or a peer needs a fresher one.
    pub fn maybe_compact(&mut self) -> Result<()> {
        let requested = self.storage.take_snapshot_request();
        let due = self.applied_index >= self.snapshot_index + self.snapshot_threshold;
        if requested || due {
            self.create_snapshot()?;
        }
        Ok(())
    }

    fn create_snapshot(&mut self) -> Result<()> {
        let index = self.applied_index;
        if index == 0 || index <= self.snapshot_index {
            return Ok(());
        }
        let term = self.storage.term(index)?;

        let state = self.fsm.snapshot()?;
        let keys = state.len();
        let image = SnapshotImage {
            members: self.members.values().cloned().collect(),
            state: state.to_bytes()?,
        };
        let mut snapshot = Snapshot::default();
        snapshot.data = image.encode()?.into();
        let meta = snapshot.mut_metadata();
        meta.index = index;
        meta.term = term;
        *meta.mut_conf_state() = self.conf_state.clone();

        self.data.snapshots.save(&snapshot)?;
        self.storage
            .mem()
            .wl()
            .compact(index)
            .context("log compaction failed")?;
        self.storage.set_latest(snapshot);
        self.snapshot_index = index;
        self.rewrite_journal(index, term)?;
        info!(index, term, keys, "compacted log into snapshot");
        Ok(())
    }

    /// Installs a snapshot received from the leader.
    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let meta = snapshot.get_metadata();
        let (index, term) = (meta.index, meta.term);
        let conf_state = meta.get_conf_state().clone();

        let image = SnapshotImage::decode(&snapshot.data[..])?;
        self.fsm.restore(&mut image.state.as_slice())?;
        self.members = image
            .members
            .into_iter()
            .map(|member| (member.raft_id(), member))
            .collect();

        self.storage
            .mem()
            .wl()
            .apply_snapshot(snapshot.clone())
            .context("apply snapshot failed")?;
        self.data.snapshots.save(&snapshot)?;
        self.storage.set_latest(snapshot);

        self.conf_state = conf_state;
        self.conf_index = index;
        self.applied_index = index;
        self.snapshot_index = index;
        self.has_state = true;
        self.rewrite_journal(index, term)?;
        info!(index, term, "installed snapshot from leader");
        Ok(())
    }

    /// Replaces the journal with the state that is not covered by the snapshot at `index`.
    fn rewrite_journal(&mut self, index: u64, term: u64) -> Result<()> {
        let hard_state = self.storage.mem().rl().hard_state().clone();
        let mut records = vec![
            Record::Snapshot { index, term },
            Record::conf_state(self.conf_index, &self.conf_state),
            Record::hard_state(&hard_state),
        ];
        let last = self.storage.last_index()?;
        if last > index {
            let tail = self
                .storage
                .entries(index + 1, last + 1, u64::MAX, GetEntriesContext::empty(false))?;
            records.extend(tail.iter().map(Record::entry));
        }
        self.data.journal.rewrite(&records)
    }
}
