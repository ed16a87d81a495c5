//! Durable raft state.
//!
//! A data directory holds three things:
//!
//! - `raft.log`: journal of hard state, conf state and log entries. Each record
//!   is a `u32` big-endian length followed by a bincode [`Record`].
//! - `snapshots/`: prost-encoded raft snapshots named by index and term.
//! - `LOCK`: advisory lock held for as long as the directory is open.
//!
//! At runtime raft reads everything from an in-memory [`MemStorage`]. The journal
//! is only read back at open, where it is replayed on top of the newest snapshot.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use parking_lot::RwLock;
use prost::Message as ProstMessage;
use raft::prelude::{ConfState, Entry, HardState, Snapshot};
use raft::storage::MemStorage;
use raft::{GetEntriesContext, RaftState, Storage, StorageError};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::Member;
use crate::error::StoreError;

const JOURNAL_FILE: &str = "raft.log";
const SNAPSHOT_DIR: &str = "snapshots";
const LOCK_FILE: &str = "LOCK";
const SNAPSHOTS_RETAINED: usize = 2;
const MAX_RECORD_LEN: usize = 256 * 1024 * 1024;

/// Raft storage shared between the worker and the `RawNode`.
///
/// Log reads go to `MemStorage`. Snapshot requests are answered from the last
/// snapshot the worker produced or installed, because `MemStorage` would hand
/// out a snapshot without the state machine image.
#[derive(Clone)]
pub struct ClusterStorage {
    mem: MemStorage,
    latest: Arc<RwLock<Option<Snapshot>>>,
    snapshot_wanted: Arc<AtomicBool>,
}

impl ClusterStorage {
    fn new(mem: MemStorage, latest: Option<Snapshot>) -> Self {
        Self {
            mem,
            latest: Arc::new(RwLock::new(latest)),
            snapshot_wanted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn mem(&self) -> &MemStorage {
        &self.mem
    }

    pub fn set_latest(&self, snapshot: Snapshot) {
        *self.latest.write() = Some(snapshot);
    }

    /// Returns and clears the flag raised when raft asked for a snapshot we could not serve.
    pub fn take_snapshot_request(&self) -> bool {
        self.snapshot_wanted.swap(false, Ordering::SeqCst)
    }
}

impl Storage for ClusterStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.mem.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.mem.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.mem.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.mem.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.mem.last_index()
    }

    fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<Snapshot> {
        if let Some(snapshot) = self.latest.read().as_ref() {
            let meta = snapshot.get_metadata();
            let conf = meta.get_conf_state();
            // A peer refuses a snapshot whose conf state does not list it.
            let includes_peer = conf.voters.contains(&to) || conf.learners.contains(&to);
            if meta.index != 0 && meta.index >= request_index && includes_peer {
                return Ok(snapshot.clone());
            }
        }
        self.snapshot_wanted.store(true, Ordering::SeqCst);
        Err(raft::Error::Store(
            StorageError::SnapshotTemporarilyUnavailable,
        ))
    }
}

/// One journal record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
    HardState {
        term: u64,
        vote: u64,
        commit: u64,
    },
    /// Membership in effect after the conf change entry at `index` was applied.
    ConfState {
        index: u64,
        voters: Vec<u64>,
        learners: Vec<u64>,
    },
    /// Prost-encoded raft entry.
    Entry(Vec<u8>),
    /// Marks a rewrite: entries at or below `index` live in the snapshot.
    Snapshot { index: u64, term: u64 },
}

impl Record {
    pub fn hard_state(hs: &HardState) -> Self {
        Record::HardState {
            term: hs.term,
            vote: hs.vote,
            commit: hs.commit,
        }
    }

    pub fn conf_state(index: u64, cs: &ConfState) -> Self {
        Record::ConfState {
            index,
            voters: cs.voters.clone(),
            learners: cs.learners.clone(),
        }
    }

    pub fn entry(entry: &Entry) -> Self {
        Record::Entry(entry.encode_to_vec())
    }
}

/// Append-only journal file.
pub struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    /// Opens the journal and returns its records. A torn tail is cut off.
    fn open(path: PathBuf) -> Result<(Self, Vec<Record>)> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open journal {}", path.display()))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .with_context(|| format!("failed to read journal {}", path.display()))?;

        let (records, valid) = decode_records(&bytes);
        if valid < bytes.len() {
            warn!(
                path = %path.display(),
                kept = valid,
                dropped = bytes.len() - valid,
                "truncating torn journal tail"
            );
            file.set_len(valid as u64)?;
            file.sync_all()?;
        }
        Ok((Self { path, file }, records))
    }

    /// Appends a batch and syncs it to disk.
    pub fn append(&mut self, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let buf = encode_records(records)?;
        self.file.write_all(&buf).context("journal write failed")?;
        self.file.sync_data().context("journal sync failed")?;
        Ok(())
    }

    /// Atomically replaces the journal with `records`.
    pub fn rewrite(&mut self, records: &[Record]) -> Result<()> {
        let buf = encode_records(records)?;
        let tmp = self.path.with_extension("log.tmp");
        {
            let mut file = File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        sync_parent(&self.path);
        Ok(())
    }
}

fn encode_records(records: &[Record]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for record in records {
        let bytes = bincode::serialize(record).context("failed to encode journal record")?;
        buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        buf.extend_from_slice(&bytes);
    }
    Ok(buf)
}

/// Decodes as many whole records as possible and returns the valid prefix length.
fn decode_records(bytes: &[u8]) -> (Vec<Record>, usize) {
    let mut records = Vec::new();
    let mut offset = 0;
    while bytes.len() - offset >= 4 {
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&bytes[offset..offset + 4]);
        let len = u32::from_be_bytes(len_buf) as usize;
        let start = offset + 4;
        if len > MAX_RECORD_LEN || bytes.len() - start < len {
            break;
        }
        match bincode::deserialize::<Record>(&bytes[start..start + len]) {
            Ok(record) => records.push(record),
            Err(_) => break,
        }
        offset = start + len;
    }
    (records, offset)
}

/// Directory of snapshot files, newest last by name.
pub struct SnapshotDir {
    path: PathBuf,
}

impl SnapshotDir {
    fn open(path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let meta = snapshot.get_metadata();
        let name = format!("snapshot-{:020}-{:020}.snap", meta.index, meta.term);
        let target = self.path.join(&name);
        let tmp = self.path.join(format!("{name}.tmp"));
        {
            let mut file = File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            file.write_all(&snapshot.encode_to_vec())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &target)?;
        sync_parent(&target);
        self.prune()
    }

    /// Loads the newest snapshot. A file that does not decode is fatal.
    fn latest(&self) -> Result<Option<Snapshot>> {
        let Some(path) = self.list()?.pop() else {
            return Ok(None);
        };
        let bytes = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let snapshot = Snapshot::decode(&bytes[..]).map_err(|err| {
            StoreError::RestoreCorrupt(format!("{}: {err}", path.display()))
        })?;
        Ok(Some(snapshot))
    }

    fn list(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "snap") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn prune(&self) -> Result<()> {
        let files = self.list()?;
        let excess = files.len().saturating_sub(SNAPSHOTS_RETAINED);
        for path in &files[..excess] {
            fs::remove_file(path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
        Ok(())
    }
}

/// Payload carried in `Snapshot::data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotImage {
    pub members: Vec<Member>,
    /// State machine image as written by `FsmSnapshot::persist`.
    pub state: Vec<u8>,
}

impl SnapshotImage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context("failed to encode snapshot image")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        bincode::deserialize(bytes)
            .map_err(|err| StoreError::RestoreCorrupt(format!("snapshot image: {err}")))
    }
}

/// State rebuilt from disk at open.
pub struct Recovered {
    pub storage: ClusterStorage,
    pub snapshot: Option<Snapshot>,
    /// Index of the conf change the recovered conf state reflects.
    pub conf_index: u64,
    pub has_state: bool,
}

/// An exclusively locked data directory.
pub struct DataDir {
    _lock: File,
    pub journal: Journal,
    pub snapshots: SnapshotDir,
}

impl DataDir {
    pub fn open(root: &Path) -> Result<(Self, Recovered)> {
        fs::create_dir_all(root)
            .with_context(|| format!("failed to create data directory {}", root.display()))?;
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(root.join(LOCK_FILE))?;
        if lock.try_lock_exclusive().is_err() {
            return Err(StoreError::Engine(format!(
                "data directory {} is already in use",
                root.display()
            ))
            .into());
        }

        let snapshots = SnapshotDir::open(root.join(SNAPSHOT_DIR))?;
        let snapshot = snapshots.latest()?;
        let (journal, records) = Journal::open(root.join(JOURNAL_FILE))?;
        let recovered = recover(snapshot, records)?;
        info!(
            dir = %root.display(),
            existing = recovered.has_state,
            "opened data directory"
        );

        Ok((
            Self {
                _lock: lock,
                journal,
                snapshots,
            },
            recovered,
        ))
    }
}

fn recover(snapshot: Option<Snapshot>, records: Vec<Record>) -> Result<Recovered> {
    let mem = MemStorage::new();
    let has_state = snapshot.is_some() || !records.is_empty();

    let mut base = 0;
    let mut conf_index = 0;
    if let Some(snapshot) = &snapshot {
        base = snapshot.get_metadata().index;
        conf_index = base;
        mem.wl()
            .apply_snapshot(snapshot.clone())
            .context("failed to load snapshot into raft storage")?;
    }

    let mut hard_state = None;
    let mut journal_base = 0;
    for record in records {
        match record {
            Record::Snapshot { index, .. } => journal_base = index,
            Record::Entry(bytes) => {
                let entry = Entry::decode(&bytes[..])
                    .map_err(|err| StoreError::RestoreCorrupt(format!("journal entry: {err}")))?;
                if entry.index <= base {
                    continue;
                }
                let first = mem.first_index()?;
                let last = mem.last_index()?;
                if entry.index < first || entry.index > last + 1 {
                    bail!(StoreError::RestoreCorrupt(format!(
                        "journal entry {} does not follow log range {first}..={last}",
                        entry.index
                    )));
                }
                mem.wl().append(&[entry])?;
            }
            Record::HardState { term, vote, commit } => {
                let mut hs = HardState::default();
                hs.term = term;
                hs.vote = vote;
                hs.commit = commit;
                hard_state = Some(hs);
            }
            Record::ConfState {
                index,
                voters,
                learners,
            } => {
                if index > conf_index {
                    conf_index = index;
                    mem.wl().set_conf_state(ConfState::from((voters, learners)));
                }
            }
        }
    }

    if journal_base > base {
        bail!(StoreError::RestoreCorrupt(format!(
            "journal starts after index {journal_base} but the newest snapshot is at {base}"
        )));
    }

    if let Some(mut hs) = hard_state {
        let last = mem.last_index()?;
        hs.commit = hs.commit.clamp(base, last.max(base));
        let mut core = mem.wl();
        hs.term = hs.term.max(core.hard_state().term);
        core.set_hardstate(hs);
    }

    Ok(Recovered {
        storage: ClusterStorage::new(mem, snapshot.clone()),
        snapshot,
        conf_index,
        has_state,
    })
}

fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use raft::prelude::EntryType;

    use super::*;

    fn entry(index: u64, term: u64) -> Entry {
        let mut entry = Entry::default();
        entry.index = index;
        entry.term = term;
        entry.set_entry_type(EntryType::EntryNormal);
        entry.data = format!("e{index}").into_bytes().into();
        entry
    }

    fn hard_state(term: u64, commit: u64) -> HardState {
        let mut hs = HardState::default();
        hs.term = term;
        hs.commit = commit;
        hs
    }

    fn snapshot(index: u64, term: u64, voters: Vec<u64>) -> Snapshot {
        let mut snapshot = Snapshot::default();
        snapshot.data = SnapshotImage {
            members: Vec::new(),
            state: Vec::new(),
        }
        .encode()
        .unwrap()
        .into();
        let meta = snapshot.mut_metadata();
        meta.index = index;
        meta.term = term;
        *meta.mut_conf_state() = ConfState::from((voters, vec![]));
        snapshot
    }

    #[test]
    fn journal_replays_entries_and_latest_hard_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut data, recovered) = DataDir::open(dir.path()).unwrap();
            assert!(!recovered.has_state);
            data.journal
                .append(&[
                    Record::entry(&entry(1, 1)),
                    Record::entry(&entry(2, 1)),
                    Record::conf_state(1, &ConfState::from((vec![7], vec![]))),
                    Record::hard_state(&hard_state(1, 2)),
                ])
                .unwrap();
            // Entry 2 replaced by a new leader's entry.
            data.journal
                .append(&[Record::entry(&entry(2, 2)), Record::hard_state(&hard_state(2, 2))])
                .unwrap();
        }

        let (_data, recovered) = DataDir::open(dir.path()).unwrap();
        assert!(recovered.has_state);
        assert_eq!(recovered.conf_index, 1);
        let storage = recovered.storage;
        assert_eq!(storage.last_index().unwrap(), 2);
        assert_eq!(storage.term(2).unwrap(), 2);
        let state = storage.initial_state().unwrap();
        assert_eq!(state.hard_state.commit, 2);
        assert_eq!(state.conf_state.voters, vec![7]);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut data, _) = DataDir::open(dir.path()).unwrap();
            data.journal.append(&[Record::entry(&entry(1, 1))]).unwrap();
        }
        let journal = dir.path().join(JOURNAL_FILE);
        let intact = fs::metadata(&journal).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&journal).unwrap();
        file.write_all(&[0, 0, 0, 40, 1, 2]).unwrap();
        drop(file);

        let (_data, recovered) = DataDir::open(dir.path()).unwrap();
        assert_eq!(recovered.storage.last_index().unwrap(), 1);
        assert_eq!(fs::metadata(&journal).unwrap().len(), intact);
    }

    #[test]
    fn rewrite_after_snapshot_keeps_only_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut data, _) = DataDir::open(dir.path()).unwrap();
            let records: Vec<_> = (1..=5).map(|i| Record::entry(&entry(i, 1))).collect();
            data.journal.append(&records).unwrap();
            data.snapshots.save(&snapshot(3, 1, vec![7])).unwrap();
            data.journal
                .rewrite(&[
                    Record::Snapshot { index: 3, term: 1 },
                    Record::conf_state(3, &ConfState::from((vec![7], vec![]))),
                    Record::hard_state(&hard_state(1, 5)),
                    Record::entry(&entry(4, 1)),
                    Record::entry(&entry(5, 1)),
                ])
                .unwrap();
        }

        let (_data, recovered) = DataDir::open(dir.path()).unwrap();
        let storage = recovered.storage;
        assert_eq!(recovered.snapshot.unwrap().get_metadata().index, 3);
        assert_eq!(storage.first_index().unwrap(), 4);
        assert_eq!(storage.last_index().unwrap(), 5);
        assert_eq!(storage.initial_state().unwrap().hard_state.commit, 5);
    }

    #[test]
    fn missing_snapshot_for_rewritten_journal_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut data, _) = DataDir::open(dir.path()).unwrap();
            data.journal
                .rewrite(&[Record::Snapshot { index: 9, term: 2 }])
                .unwrap();
        }
        let err = DataDir::open(dir.path()).err().unwrap();
        assert!(matches!(StoreError::from(err), StoreError::RestoreCorrupt(_)));
    }

    #[test]
    fn corrupt_snapshot_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(SNAPSHOT_DIR)).unwrap();
        fs::write(
            dir.path().join(SNAPSHOT_DIR).join("snapshot-1-1.snap"),
            b"\xff\xff\xff not a snapshot",
        )
        .unwrap();
        let err = DataDir::open(dir.path()).err().unwrap();
        assert!(matches!(StoreError::from(err), StoreError::RestoreCorrupt(_)));
    }

    #[test]
    fn only_newest_snapshots_are_retained() {
        let dir = tempfile::tempdir().unwrap();
        let (data, _) = DataDir::open(dir.path()).unwrap();
        for index in [10, 20, 30] {
            data.snapshots.save(&snapshot(index, 1, vec![7])).unwrap();
        }
        let names: Vec<_> = data
            .snapshots
            .list()
            .unwrap()
            .into_iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names[0].starts_with("snapshot-00000000000000000020"));
        assert!(names[1].starts_with("snapshot-00000000000000000030"));
    }

    #[test]
    fn data_directory_has_a_single_owner() {
        let dir = tempfile::tempdir().unwrap();
        let (first, _) = DataDir::open(dir.path()).unwrap();
        assert!(DataDir::open(dir.path()).is_err());
        drop(first);
        assert!(DataDir::open(dir.path()).is_ok());
    }

    #[test]
    fn snapshot_without_target_peer_requests_a_refresh() {
        let storage = ClusterStorage::new(MemStorage::new(), None);
        assert!(storage.snapshot(0, 2).is_err());
        assert!(storage.take_snapshot_request());
        assert!(!storage.take_snapshot_request());

        storage.set_latest(snapshot(5, 1, vec![1]));
        assert!(storage.snapshot(0, 2).is_err());
        assert!(storage.take_snapshot_request());

        storage.set_latest(snapshot(6, 1, vec![1, 2]));
        assert_eq!(storage.snapshot(0, 2).unwrap().get_metadata().index, 6);
        assert!(storage.snapshot(7, 2).is_err());
    }
}
