//! CLI definitions for pofetch.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// pofetch CLI.
#[derive(Parser)]
#[command(name = "pofetch")]
#[command(about = "Persistent browser worker pool for bulk purchase-order attachment retrieval")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Fetch attachments for a batch of PO numbers
    Run {
        /// PO numbers to fetch
        po_numbers: Vec<String>,

        /// File with one PO number per line (# starts a comment)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Override the configured worker count
        #[arg(long)]
        workers: Option<u32>,

        /// Priority for the whole batch (urgent, high, normal, low)
        #[arg(long, default_value = "normal")]
        priority: String,

        /// Where to append per-task results (JSON lines)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the default configuration as TOML
    PrintConfig,
}
