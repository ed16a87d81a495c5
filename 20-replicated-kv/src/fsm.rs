//! In-memory key-value table and the state machine contract the engine drives.
//!
//! The consensus engine is the only writer: it feeds committed entries to
//! [`StateMachine::apply`] strictly in commit order from a single thread, so the
//! table adds no write serialization of its own beyond the lock that keeps a
//! single mutation atomic for readers. Readers go straight to the table and see
//! whatever this replica has applied so far.

use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, BufReader, Read, Write};

use parking_lot::RwLock;
use tracing::debug;

use crate::command::{Command, WireCommand};
use crate::error::{StoreError, StoreResult};

/// Callbacks the consensus engine invokes on the replicated state.
pub trait StateMachine: Send + Sync + 'static {
    /// Decodes and applies one committed entry.
    ///
    /// A decode failure is returned as the entry's result. It is not an engine
    /// failure, and every replica reaches the same verdict from the same bytes.
    fn apply(&self, entry: &[u8]) -> StoreResult<()>;

    /// Captures a point-in-time copy of the whole table.
    fn snapshot(&self) -> StoreResult<FsmSnapshot>;

    /// Replaces the whole table with the contents of `snapshot`.
    fn restore(&self, snapshot: &mut dyn Read) -> StoreResult<()>;
}

/// Thread-safe key-value table replicated by the engine.
///
/// Uses `HashMap` because there is no ordering guarantee between keys. Snapshot
/// output is sorted separately so the serialized form is stable.
#[derive(Debug, Default)]
pub struct KvStateMachine {
    data: RwLock<HashMap<String, String>>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the current value of a key from this replica.
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Clones the whole table.
    pub fn entries(&self) -> HashMap<String, String> {
        self.data.read().clone()
    }

    fn execute(&self, command: Command) {
        let mut data = self.data.write();
        match command {
            Command::Set { key, value } => {
                data.insert(key, value);
            }
            Command::Delete { key } => {
                data.remove(&key);
            }
        }
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&self, entry: &[u8]) -> StoreResult<()> {
        let command = Command::decode(entry)?;
        debug!(key = command.key(), "applying command");
        self.execute(command);
        Ok(())
    }

    fn snapshot(&self) -> StoreResult<FsmSnapshot> {
        Ok(FsmSnapshot {
            data: self.data.read().clone(),
        })
    }

    fn restore(&self, snapshot: &mut dyn Read) -> StoreResult<()> {
        let mut table = HashMap::new();
        let reader = BufReader::new(snapshot);
        for (line_no, line) in reader.lines().enumerate() {
            let line = line.map_err(|err| StoreError::RestoreCorrupt(err.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let wire: WireCommand = serde_json::from_str(&line).map_err(|err| {
                StoreError::RestoreCorrupt(format!("line {}: {err}", line_no + 1))
            })?;
            match Command::try_from(wire) {
                Ok(Command::Set { key, value }) => {
                    table.insert(key, value);
                }
                Ok(Command::Delete { key }) => {
                    return Err(StoreError::RestoreCorrupt(format!(
                        "line {}: unexpected delete of `{key}`",
                        line_no + 1
                    )));
                }
                Err(err) => {
                    return Err(StoreError::RestoreCorrupt(format!(
                        "line {}: {err}",
                        line_no + 1
                    )));
                }
            }
        }

        *self.data.write() = table;
        Ok(())
    }
}

/// Point-in-time image of the table, detached from later applies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsmSnapshot {
    data: HashMap<String, String>,
}

impl FsmSnapshot {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Writes the image as one `set` command per line, sorted by key.
    pub fn persist(&self, sink: &mut dyn Write) -> StoreResult<()> {
        let sorted: BTreeMap<_, _> = self.data.iter().collect();
        for (key, value) in sorted {
            let line = Command::set(key.as_str(), value.as_str()).encode()?;
            sink.write_all(&line)?;
            sink.write_all(b"\n")?;
        }
        sink.flush()?;
        Ok(())
    }

    /// Convenience wrapper around [`FsmSnapshot::persist`].
    pub fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        self.persist(&mut buf)?;
        Ok(buf)
    }
}
