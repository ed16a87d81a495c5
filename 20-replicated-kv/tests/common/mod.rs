//! Shared harness: real replicas on localhost backed by temporary data directories.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::TcpListener as StdListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use parking_lot::RwLock;
use tempfile::TempDir;
use tokio::sync::oneshot;

use replicated_kv::config::{CoordinatorConfigBuilder, JoinPolicy, RaftTuning};
use replicated_kv::engine::RaftEngine;
use replicated_kv::{
    Command, Coordinator, CoordinatorConfig, JoinTransport, KvStateMachine, StateMachine,
    StoreError, StoreResult, http,
};

pub const WAIT: Duration = Duration::from_secs(10);

/// Reserves a free localhost port by binding and releasing it.
pub fn free_addr() -> String {
    let listener = StdListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").to_string()
}

/// Short ticks so elections settle in a few hundred milliseconds.
pub fn fast_tuning() -> RaftTuning {
    RaftTuning {
        tick_interval: Duration::from_millis(20),
        election_tick: 10,
        heartbeat_tick: 2,
        snapshot_threshold: 1024,
    }
}

pub fn node_config(id: &str, raft_addr: &str, data_dir: &Path) -> CoordinatorConfigBuilder {
    CoordinatorConfig::builder(id)
        .bind_addr(raft_addr)
        .data_dir(data_dir)
        .raft_tuning(fast_tuning())
        .apply_timeout(Duration::from_secs(3))
        .membership_timeout(Duration::from_secs(5))
        .join_policy(JoinPolicy {
            max_attempts: 20,
            backoff: Duration::from_millis(100),
        })
}

pub fn set(key: &str, value: &str) -> Vec<u8> {
    Command::set(key, value).encode().expect("encode set")
}

pub fn delete(key: &str) -> Vec<u8> {
    Command::delete(key).encode().expect("encode delete")
}

/// Polls `check` every 20ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, what: &str, mut check: impl FnMut() -> bool) -> Result<()> {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(20));
    }
    bail!("timed out after {timeout:?} waiting for {what}")
}

pub fn wait_for_leader(node: &Coordinator) -> Result<()> {
    wait_until(WAIT, &format!("{} to lead", node.node_id()), || node.is_leader())
}

pub fn wait_for_value(node: &Coordinator, key: &str, expected: Option<&str>) -> Result<()> {
    wait_until(WAIT, &format!("{key}={expected:?} on {}", node.node_id()), || {
        node.read(key).as_deref() == expected
    })
}

/// Applies a command on the leader, retrying while the previous leader steps down.
pub fn apply_on(node: &Coordinator, command: &[u8]) -> Result<()> {
    let mut attempts = 0;
    loop {
        match node.apply(command) {
            Ok(()) => return Ok(()),
            Err(StoreError::NotLeader { .. }) if attempts < 50 => {
                attempts += 1;
                thread::sleep(Duration::from_millis(50));
            }
            Err(err) => return Err(err).context("apply failed"),
        }
    }
}

/// In-process join transport: the target is a member id looked up here.
#[derive(Default)]
pub struct Directory {
    nodes: RwLock<HashMap<String, Arc<Coordinator>>>,
}

impl Directory {
    pub fn register(&self, node: Arc<Coordinator>) {
        self.nodes.write().insert(node.node_id().to_string(), node);
    }

    pub fn unregister(&self, id: &str) {
        self.nodes.write().remove(id);
    }
}

impl JoinTransport for Directory {
    fn request_join(&self, target: &str, id: &str, address: &str) -> StoreResult<()> {
        let node = self.nodes.read().get(target).cloned();
        match node {
            Some(node) => node.add_member(id, address),
            None => Err(StoreError::MembershipChangeFailed(format!(
                "{target} is unreachable"
            ))),
        }
    }
}

/// Fails the first `failures` join requests, then delegates.
pub struct Flaky<'a> {
    inner: &'a dyn JoinTransport,
    failures: usize,
    pub calls: AtomicUsize,
}

impl<'a> Flaky<'a> {
    pub fn new(inner: &'a dyn JoinTransport, failures: usize) -> Self {
        Self {
            inner,
            failures,
            calls: AtomicUsize::new(0),
        }
    }
}

impl JoinTransport for Flaky<'_> {
    fn request_join(&self, target: &str, id: &str, address: &str) -> StoreResult<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(StoreError::MembershipChangeFailed("connection refused".into()));
        }
        self.inner.request_join(target, id, address)
    }
}

struct Slot {
    dir: TempDir,
    raft_addr: String,
    node: Option<Arc<Coordinator>>,
}

/// A growing cluster. The first node bootstraps and the rest join through it.
pub struct TestCluster {
    pub directory: Arc<Directory>,
    first: String,
    slots: HashMap<String, Slot>,
    snapshot_threshold: u64,
}

impl TestCluster {
    pub fn bootstrap(id: &str) -> Result<Self> {
        Self::bootstrap_with_threshold(id, fast_tuning().snapshot_threshold)
    }

    pub fn bootstrap_with_threshold(id: &str, snapshot_threshold: u64) -> Result<Self> {
        let mut cluster = Self {
            directory: Arc::new(Directory::default()),
            first: id.to_string(),
            slots: HashMap::new(),
            snapshot_threshold,
        };
        let dir = TempDir::new()?;
        let raft_addr = free_addr();
        let config = node_config(id, &raft_addr, dir.path())
            .bootstrap(true)
            .snapshot_threshold(snapshot_threshold)
            .build()?;
        let node = Arc::new(Coordinator::open_with(config, cluster.directory.as_ref())?);
        wait_for_leader(&node)?;
        cluster.directory.register(Arc::clone(&node));
        cluster.slots.insert(
            id.to_string(),
            Slot {
                dir,
                raft_addr,
                node: Some(node),
            },
        );
        Ok(cluster)
    }

    pub fn join(&mut self, id: &str) -> Result<Arc<Coordinator>> {
        let directory = Arc::clone(&self.directory);
        self.join_with(id, directory.as_ref())
    }

    /// Opens a new node that joins through the first node using `transport`.
    pub fn join_with(
        &mut self,
        id: &str,
        transport: &dyn JoinTransport,
    ) -> Result<Arc<Coordinator>> {
        let (dir, raft_addr, config) = self.joiner(id)?;
        let node = Arc::new(Coordinator::open_with(config, transport)?);
        self.add_slot(id, dir, raft_addr, node)
    }

    /// Joins a node whose engine drives `engine_fsm` while reads go to `table`.
    pub fn join_with_state_machine(
        &mut self,
        id: &str,
        engine_fsm: Arc<dyn StateMachine>,
        table: Arc<KvStateMachine>,
    ) -> Result<Arc<Coordinator>> {
        let (dir, raft_addr, config) = self.joiner(id)?;
        let engine = RaftEngine::open(&config, engine_fsm)?;
        let directory = Arc::clone(&self.directory);
        let node = Coordinator::from_parts(config, table, Box::new(engine), directory.as_ref())?;
        self.add_slot(id, dir, raft_addr, Arc::new(node))
    }

    fn joiner(&self, id: &str) -> Result<(TempDir, String, CoordinatorConfig)> {
        let dir = TempDir::new()?;
        let raft_addr = free_addr();
        let config = node_config(id, &raft_addr, dir.path())
            .join(self.first.clone())
            .snapshot_threshold(self.snapshot_threshold)
            .build()?;
        Ok((dir, raft_addr, config))
    }

    fn add_slot(
        &mut self,
        id: &str,
        dir: TempDir,
        raft_addr: String,
        node: Arc<Coordinator>,
    ) -> Result<Arc<Coordinator>> {
        self.directory.register(Arc::clone(&node));
        self.slots.insert(
            id.to_string(),
            Slot {
                dir,
                raft_addr,
                node: Some(Arc::clone(&node)),
            },
        );
        Ok(node)
    }

    pub fn node(&self, id: &str) -> Arc<Coordinator> {
        let node = self.slots.get(id).and_then(|slot| slot.node.as_ref());
        Arc::clone(node.unwrap_or_else(|| panic!("node {id} is not running")))
    }

    pub fn leader(&self) -> Result<Arc<Coordinator>> {
        let mut found = None;
        wait_until(WAIT, "a leader", || {
            found = self
                .slots
                .values()
                .filter_map(|slot| slot.node.as_ref())
                .find(|node| node.is_leader())
                .cloned();
            found.is_some()
        })?;
        found.context("leader vanished")
    }

    /// Shuts a node down, keeping its data directory for a restart.
    pub fn stop(&mut self, id: &str) -> Result<()> {
        self.directory.unregister(id);
        let slot = self.slots.get_mut(id).context("unknown node")?;
        if let Some(node) = slot.node.take() {
            node.shutdown()?;
        }
        Ok(())
    }

    /// Reopens a stopped node on its old address and data directory.
    pub fn restart(&mut self, id: &str) -> Result<Arc<Coordinator>> {
        let bootstrap = id == self.first;
        let slot = self.slots.get_mut(id).context("unknown node")?;
        let mut builder = node_config(id, &slot.raft_addr, slot.dir.path())
            .snapshot_threshold(self.snapshot_threshold)
            .bootstrap(bootstrap);
        if !bootstrap {
            builder = builder.join(self.first.clone());
        }
        // An unreachable join target proves a restarted member never re-joins.
        let nowhere = Directory::default();
        let node = Arc::new(Coordinator::open_with(builder.build()?, &nowhere)?);
        slot.node = Some(Arc::clone(&node));
        self.directory.register(Arc::clone(&node));
        Ok(node)
    }

    pub fn data_dir(&self, id: &str) -> Option<PathBuf> {
        self.slots.get(id).map(|slot| slot.dir.path().to_path_buf())
    }

    pub fn shutdown(mut self) -> Result<()> {
        let ids: Vec<String> = self.slots.keys().cloned().collect();
        for id in ids {
            self.stop(&id)?;
        }
        Ok(())
    }
}

/// The HTTP API of one node, served on a background runtime thread.
pub struct HttpServer {
    pub addr: String,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl HttpServer {
    pub fn start(node: Arc<Coordinator>) -> Result<Self> {
        let listener = StdListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?.to_string();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        let thread = thread::spawn(move || {
            runtime.block_on(async move {
                let listener =
                    tokio::net::TcpListener::from_std(listener).expect("adopt listener");
                let _ = http::serve(listener, node, async {
                    let _ = shutdown_rx.await;
                })
                .await;
            });
        });

        Ok(Self {
            addr,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
