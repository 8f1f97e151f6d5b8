use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use dimex::config::DEFAULT_SNAPSHOT_DIR;

#[derive(Parser)]
#[command(name = "dimex")]
#[command(version, about = "Distributed mutual exclusion with global snapshots", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one process of the demo: repeatedly take access and write to the shared file
    Run(RunArgs),

    /// Check the persisted global snapshots
    Analyze {
        /// Directory holding process_<id>.jsonl files
        #[arg(long, default_value = DEFAULT_SNAPSHOT_DIR)]
        snapshot_dir: PathBuf,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// This process's id (index into the address list)
    pub id: u32,

    /// Addresses of every process, in id order
    #[arg(required = true, num_args = 1..)]
    pub addresses: Vec<String>,

    /// File written only while holding access
    #[arg(long, default_value = "mxOUT.txt")]
    pub shared_file: PathBuf,

    /// Directory for completed snapshots
    #[arg(long, default_value = DEFAULT_SNAPSHOT_DIR)]
    pub snapshot_dir: PathBuf,

    /// Interval between snapshots started by this process (0 disables)
    #[arg(long, default_value_t = 2000)]
    pub snapshot_every_ms: u64,

    /// Time spent holding access
    #[arg(long, default_value_t = 1000)]
    pub hold_ms: u64,

    /// Pause between releasing and asking again
    #[arg(long, default_value_t = 500)]
    pub pause_ms: u64,

    /// Wait before the first request, so every process can start listening
    #[arg(long, default_value_t = 3000)]
    pub startup_delay_ms: u64,

    /// Stop asking for access after this many rounds (default: run forever)
    #[arg(long)]
    pub rounds: Option<u64>,

    /// Keep answering peers this long after the last round
    #[arg(long, default_value_t = 5000)]
    pub linger_ms: u64,
}
