#![warn(missing_docs)]

//! blkrepl-sim: run a resync or online verify between two in-memory nodes
//! and print the resulting counters as JSON.

use std::path::PathBuf;

use anyhow::{bail, Result};
use blkrepl_worker::bitmap::SECTOR_SHIFT;
use blkrepl_worker::{Bitmap, SimPair, WorkerConfig};
use clap::{Parser, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Resync blocks marked out of sync.
    Resync,
    /// Verify the whole device and report differences.
    Verify,
}

#[derive(Parser)]
#[command(name = "blkrepl-sim")]
#[command(about = "Simulated block replication resync and verify", long_about = None)]
struct Cli {
    /// Worker config (TOML). Defaults apply when omitted.
    #[arg(short, long, env = "BLKREPL_CONFIG")]
    config: Option<PathBuf>,

    /// Device size in MiB.
    #[arg(short, long, default_value = "64")]
    size_mib: u64,

    /// Percentage of blocks to dirty before the run.
    #[arg(short, long, default_value = "100")]
    dirty: u32,

    /// Seed for choosing dirty blocks.
    #[arg(long, default_value = "1")]
    seed: u64,

    /// What to run.
    #[arg(short, long, value_enum, default_value = "resync")]
    mode: Mode,

    /// Give up after this many timer ticks.
    #[arg(short = 't', long, default_value = "10000")]
    max_ticks: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if cli.dirty > 100 {
        bail!("--dirty must be a percentage, got {}", cli.dirty);
    }

    let config = match &cli.config {
        Some(path) => WorkerConfig::load(path)?,
        None => WorkerConfig::default(),
    };
    let capacity = (cli.size_mib << 20) >> SECTOR_SHIFT;
    tracing::info!(
        "blkrepl-sim: {:?} over {} MiB, {}% dirty",
        cli.mode,
        cli.size_mib,
        cli.dirty
    );

    let pair = SimPair::new(capacity, &config)?;
    let report = match cli.mode {
        Mode::Resync => {
            pair.dirty(cli.dirty, cli.seed);
            pair.run_resync(cli.max_ticks).await?
        }
        Mode::Verify => {
            let marked = pair.dirty(cli.dirty, cli.seed);
            // verify must find what the bitmap was never told about
            for bit in 0..pair.source.bitmap.bits() {
                if pair.source.bitmap.test_bit(bit) {
                    pair.corrupt_target(bit);
                }
            }
            tracing::info!("blkrepl-sim: {} blocks differ before verify", marked);
            pair.source.bitmap.clear_bits(0, u64::MAX);
            pair.target.bitmap.clear_bits(0, u64::MAX);
            pair.run_verify(cli.max_ticks).await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
