// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! feedq-receiver: the downstream daemon.
//!
//! One coordinator per invocation: subscribes to an upstream for a feed
//! class, installs streamed and recovered products into the local queue,
//! and persists session memory so restarts resume the backlog instead of
//! re-requesting history.

use anyhow::Context;
use clap::Parser;
use feedq::config::EnvConfig;
use feedq::downstream::{Coordinator, DownstreamConfig};
use feedq::process::signals;
use feedq::product::{Feedtype, PatternSpec, ProductClass, Timestamp};
use std::path::PathBuf;

/// feedq downstream coordinator
#[derive(Parser, Debug)]
#[command(name = "feedq-receiver")]
#[command(about = "Receives feed products from an upstream")]
#[command(version)]
struct Args {
    /// Upstream control endpoint, host:port
    #[arg(short, long)]
    upstream: String,

    /// Feeds to subscribe to
    #[arg(short, long, default_value = "ANY")]
    feeds: String,

    /// Identity pattern
    #[arg(short, long, default_value = ".*")]
    pattern: String,

    /// Queue file path (overrides FEEDQ_QUEUE)
    #[arg(short, long)]
    queue: Option<PathBuf>,

    /// Session-memory directory (overrides FEEDQ_SESSION_DIR)
    #[arg(short, long)]
    session_dir: Option<PathBuf>,

    /// Log destination: path, "-" for stderr, "" for syslog
    #[arg(long)]
    log: Option<String>,

    /// Verbosity (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let env = EnvConfig::from_env("feedq-receiver");

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

    let feeds: Feedtype = args
        .feeds
        .parse()
        .map_err(|e| anyhow::anyhow!("bad --feeds: {e}"))?;
    let spec = PatternSpec::new(feeds, &args.pattern)
        .map_err(|e| anyhow::anyhow!("bad --pattern: {e}"))?;
    let class = ProductClass {
        from: Timestamp::ZERO,
        to: Timestamp::MAX,
        specs: vec![spec],
    };

    let coordinator = Coordinator::new(DownstreamConfig {
        upstream: args.upstream,
        class,
        queue_path: args.queue.unwrap_or(env.queue_path),
        session_dir: args.session_dir.unwrap_or(env.session_dir),
    });
    coordinator.run_with_backoff();
    log::info!("feedq-receiver exiting");
    Ok(())
}
