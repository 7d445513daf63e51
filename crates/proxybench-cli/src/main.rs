//! Thin outer shell around the testing engine: load nodes and config from
//! disk, run the engine, print the resulting per-airport metrics as JSON.
//!
//! Subscription parsing, dedup, and result rendering are someone else's
//! job (see SPEC_FULL.md §1) — this binary exists only so the engine can
//! be exercised end-to-end without embedding it in a larger program.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use proxybench_core::{Node, TestConfig};
use proxybench_engine::orchestrator::{self, Progress};
use tracing_subscriber::EnvFilter;

/// Run the proxy-node health and throughput testing engine over a batch
/// of nodes.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to a JSON array of pre-deduplicated node records.
    nodes: PathBuf,

    /// Path to a YAML config document overriding `TestConfig` defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn load_nodes(path: &PathBuf) -> anyhow::Result<Vec<Node>> {
    let raw = fs_err::read_to_string(path)?;
    serde_json::from_str(&raw).with_context(|| format!("parsing node records from {}", path.display()))
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<TestConfig> {
    match path {
        None => Ok(TestConfig::default()),
        Some(path) => {
            let raw = fs_err::read_to_string(path)?;
            serde_yaml::from_str(&raw).with_context(|| format!("parsing config from {}", path.display()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let nodes = load_nodes(&args.nodes)?;
    let config = load_config(args.config.as_ref())?;

    let airports = orchestrator::run(nodes, &config, |progress| match progress {
        Progress::PhaseStarted { phase, total } => {
            tracing::info!(phase, total, "phase started");
        }
        Progress::NodeDone { phase, name } => {
            tracing::debug!(phase, node = %name, "node done");
        }
        Progress::PhaseFinished { phase } => {
            tracing::info!(phase, "phase finished");
        }
    })
    .await?;

    println!("{}", serde_json::to_string_pretty(&airports)?);
    Ok(())
}
