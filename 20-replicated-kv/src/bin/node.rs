//! Runs one replica: raft peer listener plus the HTTP API.
//!
//! # Example usage
//!
//! Start a first node, then grow the cluster by joining through its API:
//! ```bash
//! # Terminal 1
//! cargo run --bin node -- --node-id a --raft-port 7001 --http-port 8001 --bootstrap
//!
//! # Terminal 2
//! cargo run --bin node -- --node-id b --raft-port 7002 --http-port 8002 \
//!   --join 127.0.0.1:8001
//!
//! # Write on the leader, read anywhere
//! curl -X POST 127.0.0.1:8001/apply -d '{"op":"set","key":"x","value":"1"}'
//! curl '127.0.0.1:8002/get?key=x'
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueHint};
use tokio::net::TcpListener;
use tracing::{error, info};

use replicated_kv::config::{CoordinatorConfig, JoinPolicy};
use replicated_kv::{Coordinator, http};

const HEALTH_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a replicated key-value store node")]
struct Args {
    /// Unique member id within the cluster
    #[arg(long)]
    node_id: String,

    /// Port for raft peer traffic
    #[arg(long, default_value_t = 7000)]
    raft_port: u16,

    /// Port for the HTTP API
    #[arg(long, default_value_t = 8000)]
    http_port: u16,

    /// Interface both listeners bind to
    #[arg(long, default_value = "0.0.0.0", value_hint = ValueHint::Hostname)]
    bind_host: String,

    /// Host other members use to reach this node's raft port
    #[arg(long, default_value = "127.0.0.1", value_hint = ValueHint::Hostname)]
    advertise_host: String,

    /// Raft state directory (default: data/<node-id>-raft)
    #[arg(long, value_hint = ValueHint::DirPath)]
    data_dir: Option<PathBuf>,

    /// Form a new single-node cluster
    #[arg(long)]
    bootstrap: bool,

    /// HTTP address of a cluster member to join through
    #[arg(long, conflicts_with = "bootstrap", value_hint = ValueHint::Url)]
    join: Option<String>,

    #[arg(long, default_value_t = 500)]
    apply_timeout_ms: u64,

    #[arg(long, default_value_t = 30)]
    join_attempts: u32,

    #[arg(long, default_value_t = 1000)]
    join_backoff_ms: u64,
}

impl Args {
    fn to_config(&self) -> Result<CoordinatorConfig> {
        let mut builder = CoordinatorConfig::builder(self.node_id.clone())
            .bind_addr(format!("{}:{}", self.bind_host, self.raft_port))
            .advertise_addr(format!("{}:{}", self.advertise_host, self.raft_port))
            .bootstrap(self.bootstrap)
            .apply_timeout(Duration::from_millis(self.apply_timeout_ms))
            .join_policy(JoinPolicy {
                max_attempts: self.join_attempts,
                backoff: Duration::from_millis(self.join_backoff_ms),
            });
        if let Some(dir) = &self.data_dir {
            builder = builder.data_dir(dir.clone());
        }
        if let Some(target) = &self.join {
            builder = builder.join(target.clone());
        }
        builder.build().context("invalid node configuration")
    }
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

/// Resolves on ctrl-c, or as soon as the consensus engine reports a failure.
async fn shutdown_signal(coordinator: Arc<Coordinator>) {
    let mut health = tokio::time::interval(HEALTH_INTERVAL);
    let engine_failed = async move {
        loop {
            health.tick().await;
            if let Err(err) = coordinator.health() {
                error!(error = %err, "consensus engine failed, shutting down");
                return;
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
        _ = engine_failed => {}
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = args.to_config()?;

    // The join handshake uses a blocking HTTP client, so cluster formation
    // finishes before any tokio runtime exists.
    let coordinator = Arc::new(Coordinator::open(config).context("failed to start node")?);
    info!(node = coordinator.node_id(), role = ?coordinator.role(), "node started");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let http_addr = format!("{}:{}", args.bind_host, args.http_port);
    let served = runtime.block_on({
        let coordinator = Arc::clone(&coordinator);
        async move {
            let listener = TcpListener::bind(&http_addr)
                .await
                .with_context(|| format!("failed to bind http listener on {http_addr}"))?;
            info!(addr = %http_addr, "http api listening");
            let shutdown = shutdown_signal(Arc::clone(&coordinator));
            http::serve(listener, coordinator, shutdown)
                .await
                .context("http server failed")
        }
    });
    drop(runtime);

    // A failed engine exits non-zero so a supervisor restarts the node.
    let healthy = coordinator.health().context("consensus engine failed");
    coordinator.shutdown().context("engine shutdown failed")?;
    info!("node stopped");
    served.and(healthy)
}
