use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Multi-agent session orchestration")]
#[command(long_about = "Conductor turns a session plan into a supervised set of agent processes, \
                       schedules them by dependency and strategy, and recovers interrupted sessions \
                       from checkpoints. Get started with 'conductor validate <plan>'.")]
pub struct Cli {
    /// Configuration file (defaults to conductor.toml / .conductor-rc)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create and start a session from a plan file, streaming events until it finishes
    Run {
        /// Plan file (.toml or .json)
        plan: PathBuf,
        /// Simulate agents instead of launching processes
        #[arg(long, help = "Use simulated agents that exit successfully after a short delay")]
        dry_run: bool,
    },
    /// Check a plan's agents and dependency graph without running anything
    Validate {
        /// Plan file (.toml or .json)
        plan: PathBuf,
    },
    /// Recover interrupted sessions from the checkpoint directory and supervise them
    Recover {
        #[arg(long, help = "Use simulated agents for resumed and restarted work")]
        dry_run: bool,
    },
    /// Print the latest checkpointed state of one or all sessions
    Status {
        /// Session to show; all sessions when omitted
        session_id: Option<String>,
    },
}
