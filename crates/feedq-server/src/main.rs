// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! feedq-server: the upstream daemon.
//!
//! Serves subscriptions over the RPC control plane and supervises the
//! per-feedtype multicast sender children. Spawned sender children
//! re-enter this same binary through the hidden `sender-child`
//! subcommand.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use feedq::config::EnvConfig;
use feedq::mcast::{self, SenderConfig, SenderInfo, SenderManager};
use feedq::process::signals;
use feedq::product::{Feedtype, ProductClass};
use feedq::upstream::{UpstreamConfig, UpstreamServer};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

/// feedq upstream server
#[derive(Parser, Debug)]
#[command(name = "feedq-server")]
#[command(about = "Streams feed products to subscribed downstreams")]
#[command(version)]
struct Args {
    /// Queue file path (overrides FEEDQ_QUEUE)
    #[arg(short, long)]
    queue: Option<PathBuf>,

    /// Bind address for the control plane
    #[arg(short, long)]
    bind: Option<String>,

    /// Feeds offered to downstreams
    #[arg(short, long, default_value = "ANY")]
    feeds: String,

    /// Multicast sender definition FEED@group:port[@tcphost:tcpport];
    /// repeatable
    #[arg(short, long)]
    mcast: Vec<String>,

    /// Log destination: path, "-" for stderr, "" for syslog
    #[arg(long)]
    log: Option<String>,

    /// Verbosity (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Internal: run as a multicast sender child (spawned by the
    /// manager, not for operator use)
    #[command(hide = true)]
    SenderChild {
        #[arg(long)]
        feed: String,
        #[arg(long)]
        group: String,
        #[arg(long)]
        queue: PathBuf,
        #[arg(long, default_value = mcast::DEFAULT_SEGMENT)]
        segment: String,
        #[arg(long, default_value_t = 1)]
        ttl: u32,
        #[arg(long, default_value = "0.0.0.0")]
        interface: Ipv4Addr,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let env = EnvConfig::from_env("feedq-server");

    let log_dest = args
        .log
        .as_deref()
        .map(feedq::logging::LogDestination::parse)
        .unwrap_or(env.log_dest.clone());
    let verbosity = args.verbose.max(env.verbosity);
    feedq::logging::init(
        &log_dest,
        &env.log_ident,
        feedq::logging::level_for_verbosity(verbosity),
    )
    .context("logger initialization failed")?;
    signals::install();

    if let Some(Command::SenderChild {
        feed,
        group,
        queue,
        segment,
        ttl,
        interface,
    }) = args.command
    {
        return run_sender_child(&feed, &group, queue, segment, ttl, interface);
    }

    let queue_path = args.queue.unwrap_or(env.queue_path);
    let offered: Feedtype = args
        .feeds
        .parse()
        .map_err(|e| anyhow::anyhow!("bad --feeds: {e}"))?;
    if offered.is_empty() {
        bail!("--feeds selects nothing");
    }
    let bind = args
        .bind
        .unwrap_or_else(|| format!("0.0.0.0:{}", env.port));

    // The sender manager re-execs this binary for children.
    let mcast_mgr = if args.mcast.is_empty() {
        None
    } else {
        let program = std::env::current_exe().context("cannot locate own binary")?;
        let mgr = SenderManager::new(
            mcast::DEFAULT_SEGMENT,
            &program.to_string_lossy(),
            vec!["sender-child".to_string()],
        )
        .context("sender registry unavailable")?;
        for spec in &args.mcast {
            let info: SenderInfo =
                mcast::parse_sender_spec(spec).map_err(|e| anyhow::anyhow!("--mcast {spec}: {e}"))?;
            mgr.add_potential(info)
                .map_err(|e| anyhow::anyhow!("--mcast {spec}: {e}"))?;
        }
        Some(Arc::new(mgr))
    };

    // Reap sender children as they exit.
    if let Some(mgr) = &mcast_mgr {
        let mgr = mgr.clone();
        std::thread::spawn(move || loop {
            if signals::take_child_exited() {
                for pid in signals::reap_children() {
                    mgr.terminated(pid);
                }
            }
            std::thread::sleep(std::time::Duration::from_millis(500));
            if signals::terminated() {
                return;
            }
        });
    }

    let server = UpstreamServer::new(UpstreamConfig {
        queue_path,
        bind,
        offered,
    });
    server.run(mcast_mgr).context("server failed")?;
    log::info!("feedq-server exiting");
    Ok(())
}

fn run_sender_child(
    feed: &str,
    group: &str,
    queue: PathBuf,
    segment: String,
    ttl: u32,
    interface: Ipv4Addr,
) -> anyhow::Result<()> {
    let feedtype: Feedtype = feed
        .parse()
        .map_err(|e| anyhow::anyhow!("bad --feed: {e}"))?;
    let class = ProductClass::of(feedtype, ".*")
        .map_err(|e| anyhow::anyhow!("class construction failed: {e}"))?;
    let config = SenderConfig {
        queue_path: queue,
        class,
        group: group
            .parse()
            .map_err(|e| anyhow::anyhow!("bad --group: {e}"))?,
        segment_name: segment,
        ttl,
        interface,
    };
    mcast::run_sender(&config).map_err(|e| anyhow::anyhow!("sender failed: {e}"))
}
