// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! feedq-dispatch: the per-product action dispatcher daemon.

use anyhow::Context;
use clap::Parser;
use feedq::config::EnvConfig;
use feedq::dispatch::{DispatchConfig, Dispatcher};
use feedq::process::signals;
use std::path::PathBuf;

/// feedq action dispatcher
#[derive(Parser, Debug)]
#[command(name = "feedq-dispatch")]
#[command(about = "Runs pattern/action rules over newly arrived products")]
#[command(version)]
struct Args {
    /// Action table file
    #[arg(short, long)]
    config: PathBuf,

    /// Queue file path (overrides FEEDQ_QUEUE)
    #[arg(short, long)]
    queue: Option<PathBuf>,

    /// Start this many seconds in the past
    #[arg(short, long, default_value_t = 0)]
    from: u64,

    /// Log destination: path, "-" for stderr, "" for syslog
    #[arg(long)]
    log: Option<String>,

    /// Verbosity (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let env = EnvConfig::from_env("feedq-dispatch");

    let log_dest = args
        .log
        .as_deref()
        .map(feedq::logging::LogDestination::parse)
        .unwrap_or(env.log_dest.clone());
    feedq::logging::init(
        &log_dest,
        &env.log_ident,
        feedq::logging::level_for_verbosity(args.verbose.max(env.verbosity)),
    )
    .context("logger initialization failed")?;
    signals::install();

    let mut dispatcher = Dispatcher::new(DispatchConfig {
        queue_path: args.queue.unwrap_or(env.queue_path),
        table_path: args.config,
        from_age_secs: args.from,
    })
    .map_err(|e| anyhow::anyhow!("dispatcher setup failed: {e}"))?;

    let dispatched = dispatcher
        .run()
        .map_err(|e| anyhow::anyhow!("dispatcher failed: {e}"))?;
    log::info!("feedq-dispatch exiting after {dispatched} product(s)");
    Ok(())
}
