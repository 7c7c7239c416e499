use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;

use quill_control::command::{CommandContext, CommandRegistry};
use quill_control::coordinator::{CoordinatorConfig, ReshardCoordinator};
use quill_control::routing::{FileRoutingStore, RoutingCache, RoutingStore};
use quill_control::sim::{ClusterSpec, SimCluster};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "quillctl")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run `reShardCollection` against a cluster fixture.
    Reshard(ReshardArgs),
    /// Print the persisted chunk table for a namespace.
    Routing(RoutingArgs),
}

/// CLI options for running a resharding session.
#[derive(Parser, Debug)]
struct ReshardArgs {
    /// Cluster fixture JSON (groups, members, documents, chunk table).
    #[arg(long, env = "QUILL_CLUSTER")]
    cluster: PathBuf,

    /// Routing store directory.
    #[arg(long, env = "QUILL_DATA_DIR", default_value = ".quill")]
    data_dir: PathBuf,

    /// Target namespace, `<db>.<coll>`.
    #[arg(long)]
    ns: String,

    /// Proposed shard key document, e.g. `{"b": 1}`.
    #[arg(long)]
    key: String,

    #[arg(long, default_value_t = false)]
    unique: bool,

    /// Override the carried-over chunk count.
    #[arg(long)]
    num_initial_chunks: Option<u32>,

    /// Per-stage deadline.
    #[arg(long, env = "QUILL_STAGE_TIMEOUT_MS", default_value_t = 30_000)]
    stage_timeout_ms: u64,

    /// Distributed lock TTL.
    #[arg(long, env = "QUILL_LOCK_TTL_MS", default_value_t = 30_000)]
    lock_ttl_ms: u64,

    /// Retry budget for transient failures.
    #[arg(long, env = "QUILL_RETRY_ATTEMPTS", default_value_t = 3)]
    retry_attempts: u32,
}

/// CLI options for inspecting routing state.
#[derive(Parser, Debug)]
struct RoutingArgs {
    #[arg(long, env = "QUILL_DATA_DIR", default_value = ".quill")]
    data_dir: PathBuf,

    #[arg(long)]
    ns: String,
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Reshard(args) => run_reshard(args).await,
        Command::Routing(args) => run_routing(args).await,
    }
}

async fn run_reshard(args: ReshardArgs) -> anyhow::Result<()> {
    let fixture = std::fs::read(&args.cluster)
        .with_context(|| format!("read cluster fixture {}", args.cluster.display()))?;
    let spec: ClusterSpec =
        serde_json::from_slice(&fixture).context("parse cluster fixture")?;
    let key: serde_json::Value = serde_json::from_str(&args.key).context("parse --key")?;

    let cluster = SimCluster::build(&spec).map_err(|e| anyhow::anyhow!(e))?;
    let store = Arc::new(FileRoutingStore::open(&args.data_dir)?);
    SimCluster::bootstrap_store(&spec, store.as_ref())
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    let coordinator = Arc::new(ReshardCoordinator::new(
        Arc::new(cluster),
        store,
        Arc::new(RoutingCache::new()),
        CoordinatorConfig {
            stage_timeout: Duration::from_millis(args.stage_timeout_ms),
            lock_ttl: Duration::from_millis(args.lock_ttl_ms),
            retry_attempts: args.retry_attempts,
            config_addr: args.data_dir.display().to_string(),
            ..CoordinatorConfig::default()
        },
    ));

    let registry = CommandRegistry::standard();
    let ctx = CommandContext { coordinator };
    let payload = {
        let mut doc = json!({
            "reShardCollection": args.ns,
            "key": key,
            "unique": args.unique,
        });
        if let Some(n) = args.num_initial_chunks {
            doc.as_object_mut()
                .expect("object")
                .insert("numInitialChunks".to_string(), json!(n));
        }
        doc
    };

    let result = registry.dispatch(&ctx, &payload).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    // A failed session reports `ok: 0` without failing the process.
    Ok(())
}

async fn run_routing(args: RoutingArgs) -> anyhow::Result<()> {
    let store = FileRoutingStore::open(&args.data_dir)?;
    let table = store
        .read_table(&args.ns)
        .await
        .map_err(|e| anyhow::anyhow!(e))?
        .with_context(|| format!("{} is not sharded", args.ns))?;
    println!("{}", serde_json::to_string_pretty(&table)?);
    Ok(())
}
