//! Clap derive structures for the `mote` binary.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// mote -- config-driven sensor-node agent
#[derive(Debug, Parser)]
#[command(
    name = "mote",
    version,
    about = "Run a sensor node: connectivity, message routing, sensor orchestration",
    long_about = "A single-task agent that reads sensors defined in a TOML\n\
        configuration, publishes their samples over a message broker, and\n\
        accepts commands and parameter updates on subscribed channels.\n\n\
        Restart authority is external: on a fatal error the process exits\n\
        and the supervisor decides what happens next.",
    propagate_version = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Option<Command>,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Path to the TOML configuration
    #[arg(
        long,
        short = 'c',
        env = "MOTE_CONFIG",
        default_value = "mote.toml",
        global = true
    )]
    pub config: PathBuf,

    /// Broker transport to run against
    #[arg(long, default_value = "log", global = true)]
    pub broker: BrokerMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// Which broker transport backs the session. The wire-protocol stack
/// is an external collaborator; these are the in-process stand-ins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BrokerMode {
    /// Publishes become log lines; nothing is received.
    Log,
    /// In-memory broker, useful for exercising the full loop.
    Sim,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the agent (default when no subcommand is given)
    Run,
    /// Load and validate the configuration, then exit
    Check,
}
