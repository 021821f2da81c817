// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use kv_benchmark::{BenchMaterial, BenchmarkConfig, LocalStore, WorkloadCoordinator};

#[derive(Parser)]
#[clap(name = "kv-bench", about = "Load generator for transactional key-value stores")]
struct Opts {
    /// Path to the YAML benchmark configuration.
    #[clap(long, global = true, default_value = "config/bench.yaml")]
    config: PathBuf,
    /// Position of this process in the configured worker list.
    #[clap(long, global = true, default_value_t = 0)]
    worker_rank: u64,
    #[clap(subcommand)]
    command: Command,
}

/// The built-in store lives in this process, so every command sets it up
/// before running its own phase.
#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Create the table and register the users.
    Init,
    /// Init, then run the warmup phase.
    Warmup,
    /// Init, then run the benchmark phase.
    Benchmark,
    /// Init, warmup and benchmark in sequence.
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();
    let config = BenchmarkConfig::load(&opts.config)
        .with_context(|| format!("loading {}", opts.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let material = Arc::new(BenchMaterial::generate(
        config.workload.user_count,
        config.seed,
    ));
    let store = LocalStore::new(material.admin());
    let coordinator =
        WorkloadCoordinator::new(&config, opts.worker_rank, material, Arc::new(store))?;

    coordinator.init().await?;
    if matches!(opts.command, Command::Warmup | Command::Run) {
        let report = coordinator.run_warmup().await?;
        info!("{report}");
    }
    if matches!(opts.command, Command::Benchmark | Command::Run) {
        let report = coordinator.run_benchmark().await?;
        info!("{report}");
        println!("{report}");
    }
    coordinator.shutdown();
    Ok(())
}
