//! CLI definitions for pairsync.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "pairsync",
    version,
    about = "Two-site photon coincidence core\n\nBuffers tagger timestamp streams, exchanges them over an encrypted peer link, and counts per-pair coincidences with FFT-calibrated clock offsets.",
    long_about = None
)]
pub struct Cli {
    /// Path to site.toml config file
    #[clap(long, short, default_value = "site.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print an example site.toml to stdout
    Init,

    /// Run the site daemon: peer link, tail readers, counting ticks
    Run {
        /// Simulate the tagger service instead of tailing real files
        #[clap(long)]
        mock: bool,

        /// Stop the session after this many seconds (default: unbounded)
        #[clap(long)]
        duration: Option<u64>,

        /// Channels to record locally (repeatable), e.g. -r 1 -r 2
        #[clap(long = "record", short = 'r', default_values_t = vec![1u8, 2])]
        record_channels: Vec<u8>,

        /// Seconds between JSONL metrics snapshots
        #[clap(long, default_value = "5")]
        interval: u64,

        /// Write JSONL metrics to this file (default: stdout lines)
        #[clap(long)]
        log: Option<PathBuf>,
    },

    /// Estimate the clock offset between two sites' saved timestamp files
    Offset {
        /// Local-site timestamp file(s); several files are merged
        #[clap(long, required = true, num_args = 1..)]
        local: Vec<PathBuf>,

        /// Remote-site timestamp file(s)
        #[clap(long, required = true, num_args = 1..)]
        remote: Vec<PathBuf>,

        /// Use the reduced-range live FFT geometry instead of the offline one
        #[clap(long)]
        live: bool,

        /// Override the histogram bin width in picoseconds
        #[clap(long)]
        tau: Option<u64>,

        /// Override the FFT length (must be a power of two)
        #[clap(long)]
        bins: Option<usize>,
    },

    /// Print metadata and integrity diagnostics for a timestamp file
    Inspect {
        /// Binary timestamp file
        file: PathBuf,
    },
}
