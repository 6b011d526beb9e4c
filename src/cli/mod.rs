//! CLI command definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "atelier")]
#[command(about = "Isolated workbenches for coding agents", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// JSON runtime config (defaults apply when omitted)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Workspace root (overrides config and ATELIER_ROOT)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Runtime preference: auto, container or tmux
    #[arg(long, global = true)]
    pub runtime: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Probe which runtimes work on this host
    Detect,

    /// Create an agent, run one command in it and tear it down
    Run {
        /// Agent archetype (e.g. coder, reviewer)
        agent_type: String,

        /// Shell command to run inside the agent
        command: String,

        /// Agent id (defaults to <agent_type>-<random>)
        #[arg(long)]
        id: Option<String>,

        /// Team the agent joins
        #[arg(short, long)]
        team: Option<String>,

        /// Container image (container runtime only)
        #[arg(long)]
        image: Option<String>,

        /// Host directory copied into the agent workspace
        #[arg(long)]
        project: Option<PathBuf>,

        /// Extra environment, KEY=VALUE
        #[arg(short, long = "env", value_parser = parse_env)]
        env: Vec<(String, String)>,

        /// Command timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Initialize the active runtime and print its counters
    Stats,

    /// Remove sessions and containers left behind by earlier runs
    Sweep,
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{}'", raw));
    }
    Ok((key.to_string(), value.to_string()))
}
