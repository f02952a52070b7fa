//! # CLI Interface
//!
//! Defines the command-line argument structure for `tessera-node` using
//! `clap` derive. Supports three subcommands: `run`, `init`, and `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Tessera secret-shared validator node.
///
/// Runs a committee of share operators for one validator: IBFT consensus
/// over beacon duties, slashing-protected signing, and threshold BLS
/// reconstruction of the validator's signatures.
#[derive(Parser, Debug)]
#[command(
    name = "tessera-node",
    about = "Tessera secret-shared validator node",
    version,
    propagate_version = true
)]
pub struct TesseraNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the tessera-node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the operator committee (single-process devnet).
    Run(RunArgs),
    /// Initialize a data directory: generate a validator key, split it
    /// into committee shares, and persist the share metadata.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the node data directory. When it holds keys generated by
    /// `init`, they are loaded; otherwise an ephemeral committee is
    /// generated for this run.
    #[arg(long, short = 'd', env = "TESSERA_DATA_DIR", default_value = ".tessera")]
    pub data_dir: PathBuf,

    /// Number of operators in the committee.
    #[arg(long, env = "TESSERA_OPERATORS", default_value_t = 4)]
    pub operators: u64,

    /// Milliseconds per devnet slot.
    #[arg(long, env = "TESSERA_SLOT_MS", default_value_t = 4_000)]
    pub slot_ms: u64,

    /// Number of duty rounds to run before exiting. 0 means run until
    /// interrupted.
    #[arg(long, env = "TESSERA_ROUNDS", default_value_t = 0)]
    pub rounds: u64,

    /// Default log level when RUST_LOG is not set.
    #[arg(long, env = "TESSERA_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format: "pretty" or "json".
    #[arg(long, env = "TESSERA_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Path to the data directory to initialize.
    #[arg(long, short = 'd', env = "TESSERA_DATA_DIR", default_value = ".tessera")]
    pub data_dir: PathBuf,

    /// Number of operators to split the validator key across.
    #[arg(long, default_value_t = 4)]
    pub operators: u64,
}
