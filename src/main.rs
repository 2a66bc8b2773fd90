//! # Main — CLI Entry Point
//!
//! Parses the command line, initializes structured logging, and hands the
//! selected sieve form to the engine via `cli::run`.
//!
//! ## Subcommands
//!
//! - `kbn`: sieve k·b^n ± 1 terms for factors.
//! - `cullen-woodall`: sieve n·2^n ± 1 (Cullen and Woodall) terms.
//!
//! ## Global Options
//!
//! Engine options (worker counts, chunk size, thresholds, intervals) can
//! come from flags or from a TOML file given with `--config`; explicit
//! flags win. `LOG_FORMAT=json` switches logging to JSON for collectors.

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "deepsieve", about = "Sieve special-form candidates for factors")]
struct Cli {
    /// Path to checkpoint file for resuming sieves
    #[arg(long, default_value = "deepsieve.checkpoint")]
    checkpoint: PathBuf,

    /// Append discovered factors to this file
    #[arg(long)]
    factor_log: Option<PathBuf>,

    /// TOML file with engine option overrides
    #[arg(long, env = "DEEPSIEVE_CONFIG")]
    config: Option<PathBuf>,

    /// First sieve prime (inclusive)
    #[arg(long, default_value_t = 2)]
    min_prime: u64,

    /// Last sieve prime (inclusive)
    #[arg(long)]
    max_prime: u64,

    /// CPU worker threads (0 with no GPU workers auto-creates one)
    #[arg(long)]
    cpu_workers: Option<usize>,

    /// GPU-dispatching workers (requires a sieve form with a GPU path)
    #[arg(long)]
    gpu_workers: Option<usize>,

    /// Smallest prime eligible for GPU execution
    #[arg(long)]
    gpu_min_prime: Option<u64>,

    /// Primes per chunk (0 = use the sieve form's preferred size)
    #[arg(long)]
    chunk_size: Option<u32>,

    /// Below this prime only one worker runs at a time
    #[arg(long)]
    single_worker_threshold: Option<u64>,

    /// Seconds between status reports
    #[arg(long)]
    status_interval: Option<u64>,

    /// Seconds between checkpoint writes
    #[arg(long)]
    checkpoint_interval: Option<u64>,

    /// Attach a hardware snapshot to status log lines
    #[arg(long)]
    report_hardware: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sieve k*b^n +/- 1 terms for factors
    Kbn {
        /// Multiplier k
        #[arg(long)]
        k: u64,
        /// Base b
        #[arg(long)]
        base: u32,
        /// Minimum exponent n
        #[arg(long)]
        min_n: u64,
        /// Maximum exponent n
        #[arg(long)]
        max_n: u64,
    },
    /// Sieve Cullen (n*2^n + 1) and Woodall (n*2^n - 1) terms for factors
    CullenWoodall {
        /// Minimum n value
        #[arg(long)]
        min_n: u64,
        /// Maximum n value
        #[arg(long)]
        max_n: u64,
    },
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // Structured logging: LOG_FORMAT=json for collectors, human-readable
    // stderr otherwise.
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt().json().with_target(false).init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();
    cli::run(&cli)
}
