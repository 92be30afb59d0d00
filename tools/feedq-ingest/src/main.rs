// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! feedq-ingest: reads product-name-header records from the ingest FIFO
//! and inserts the named spool files as products.
//!
//! The FIFO is reopened after every writer hangup, so a restarting
//! file-ingest daemon just keeps feeding the same path.

use anyhow::Context;
use clap::Parser;
use feedq::config::EnvConfig;
use feedq::ingest;
use feedq::process::signals;
use feedq::product::Feedtype;
use feedq::queue::{OpenFlags, ProductQueue};
use std::fs::File;
use std::path::PathBuf;

/// feedq ingest reader
#[derive(Parser, Debug)]
#[command(name = "feedq-ingest")]
#[command(about = "Inserts products named by ingest FIFO records")]
#[command(version)]
struct Args {
    /// Ingest FIFO path
    #[arg(short = 'F', long)]
    fifo: PathBuf,

    /// Spool directory holding the named data files
    #[arg(short, long)]
    spool: PathBuf,

    /// Feedtype assigned to ingested products
    #[arg(short = 't', long, default_value = "EXP")]
    feedtype: String,

    /// Queue file path (overrides FEEDQ_QUEUE)
    #[arg(short, long)]
    queue: Option<PathBuf>,

    /// Log destination: path, "-" for stderr, "" for syslog
    #[arg(long)]
    log: Option<String>,

    /// Verbosity (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let env = EnvConfig::from_env("feedq-ingest");

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

    let feedtype: Feedtype = args
        .feedtype
        .parse()
        .map_err(|e| anyhow::anyhow!("bad --feedtype: {e}"))?;

    ingest::ensure_fifo(&args.fifo, 0o660).context("cannot create ingest FIFO")?;
    let queue_path = args.queue.unwrap_or(env.queue_path);
    let queue = ProductQueue::open(&queue_path, OpenFlags::default())
        .map_err(|e| anyhow::anyhow!("queue open failed: {e}"))?;

    let mut total = 0u64;
    while !signals::terminated() {
        feedq::logging::service_signals();
        // Opening the read end blocks until a writer appears; EOF means
        // the writer went away, so reopen and wait for the next one.
        let mut fifo = match File::open(&args.fifo) {
            Ok(f) => f,
            Err(e) => {
                if signals::terminated() {
                    break;
                }
                log::warn!("cannot open {}: {e}", args.fifo.display());
                std::thread::sleep(std::time::Duration::from_secs(1));
                continue;
            }
        };
        let count = ingest::read_records(&mut fifo, |record| {
            match ingest::insert_record(&queue, &args.spool, feedtype, &record) {
                Ok(true) => {}
                Ok(false) => log::debug!("duplicate {}", record.filename),
                Err(e) => log::warn!("insertion of {} failed: {e}", record.filename),
            }
        })
        .context("FIFO read failed")?;
        total += count;
    }

    log::info!("feedq-ingest exiting after {total} record(s)");
    Ok(())
}
