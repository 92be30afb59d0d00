// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! feedqctl: operator CLI for product queues.
//!
//! Exit codes carry operational meaning:
//!
//! - 0: success
//! - 1: general failure
//! - 2: writer counter unsupported by the queue format
//! - 3: writer counter non-zero (a writer died without closing)
//! - 4: queue is corrupt

use clap::{Parser, Subcommand};
use feedq::config::{self, EnvConfig};
use feedq::product::{Feedtype, Product, ProductClass, Signature, Timestamp};
use feedq::queue::{
    CheckVerdict, CreateFlags, Direction, OpenFlags, ProductQueue, QueueError,
};
use std::path::PathBuf;
use std::process::ExitCode;

const EXIT_OK: u8 = 0;

const EXIT_FAILURE: u8 = 1;
const EXIT_WRITERS_NONZERO: u8 = 3;
const EXIT_CORRUPT: u8 = 4;

/// feedq operator CLI
#[derive(Parser, Debug)]
#[command(name = "feedqctl")]
#[command(about = "Create, check, inspect, and repair product queues")]
#[command(version)]
struct Args {
    /// Queue file path (overrides FEEDQ_QUEUE)
    #[arg(short, long)]
    queue: Option<PathBuf>,

    /// Verbosity (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new queue file
    Create {
        /// Data-area capacity in bytes
        #[arg(long, default_value_t = config::DEFAULT_BYTE_CAPACITY)]
        bytes: u64,
        /// Slot (product) capacity
        #[arg(long, default_value_t = config::DEFAULT_SLOT_CAPACITY)]
        slots: u64,
        /// Replace an existing file
        #[arg(long)]
        clobber: bool,
        /// Leave unwritten blocks unallocated
        #[arg(long)]
        sparse: bool,
        /// File mode bits
        #[arg(long, default_value = "0664")]
        mode: String,
    },
    /// Delete a queue file
    Delete,
    /// Verify queue invariants
    Check,
    /// Insert one product from a file
    Insert {
        /// Data file
        file: PathBuf,
        /// Product feedtype
        #[arg(long, default_value = "EXP")]
        feedtype: String,
        /// Identity string (defaults to the file name)
        #[arg(long)]
        ident: Option<String>,
    },
    /// Copy every product into another queue, oldest first
    Copy {
        /// Destination queue path
        dest: PathBuf,
    },
    /// List every product in insertion order
    Dump {
        /// Show at most this many products (0 = all)
        #[arg(long, default_value_t = 0)]
        limit: u64,
    },
    /// Print queue statistics
    Stats,
    /// Delete one product by signature
    Remove {
        /// 32-digit hex MD5 signature
        signature: String,
    },
    /// Zero the shared writer counter
    ResetWriters {
        /// Required: confirms no live process has the queue open
        #[arg(long)]
        force: bool,
    },
    /// Reset the minimum-virtual-residence-time metrics
    ClearMvrt,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let env = EnvConfig::from_env("feedqctl");
    let _ = feedq::logging::init(
        &feedq::logging::LogDestination::Stderr,
        &env.log_ident,
        feedq::logging::level_for_verbosity(args.verbose.max(env.verbosity)),
    );

    let queue_path = args.queue.unwrap_or(env.queue_path);
    match run(&queue_path, args.command) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("feedqctl: {e}");
            let code = match e {
                QueueError::Corrupt(_) | QueueError::CorruptCount => EXIT_CORRUPT,
                _ => EXIT_FAILURE,
            };
            ExitCode::from(code)
        }
    }
}

fn run(queue_path: &PathBuf, command: Command) -> Result<u8, QueueError> {
    match command {
        Command::Create {
            bytes,
            slots,
            clobber,
            sparse,
            mode,
        } => {
            let mode_bits = u32::from_str_radix(mode.trim_start_matches("0o"), 8)
                .map_err(|e| QueueError::Inval(format!("bad mode {mode}: {e}")))?;
            let mut flags = CreateFlags::default();
            if clobber {
                flags = flags.union(CreateFlags::CLOBBER);
            }
            if sparse {
                flags = flags.union(CreateFlags::SPARSE);
            }
            let q = ProductQueue::create(queue_path, bytes, slots, mode_bits, flags)?;
            println!(
                "created {} ({} data bytes, {} slots)",
                queue_path.display(),
                q.data_capacity(),
                q.slot_capacity()
            );
            q.close()?;
            Ok(EXIT_OK)
        }

        Command::Delete => {
            // Refuse to delete something that is not a queue.
            ProductQueue::open(queue_path, OpenFlags::READONLY)?;
            std::fs::remove_file(queue_path)?;
            println!("deleted {}", queue_path.display());
            Ok(EXIT_OK)
        }

        Command::Check => {
            let q = ProductQueue::open(queue_path, OpenFlags::READONLY)?;
            let report = q.verify(0)?;
            println!(
                "{}: {} product(s), {} reserved, writer count {}",
                queue_path.display(),
                report.products,
                report.reserved,
                report.writer_count
            );
            for issue in &report.issues {
                eprintln!("  {issue}");
            }
            Ok(match report.verdict {
                CheckVerdict::Clean => EXIT_OK,
                CheckVerdict::WriterCountNonZero => {
                    eprintln!(
                        "writer counter is {} with no live writer; \
                         run `feedqctl reset-writers --force` after verifying",
                        report.writer_count
                    );
                    EXIT_WRITERS_NONZERO
                }
                CheckVerdict::Corrupt => EXIT_CORRUPT,
            })
        }

        Command::Insert {
            file,
            feedtype,
            ident,
        } => {
            let feedtype: Feedtype = feedtype.parse().map_err(QueueError::Inval)?;
            let data = std::fs::read(&file)?;
            let ident = ident.unwrap_or_else(|| {
                file.file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "stdin".to_string())
            });
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into());
            let product = Product::new(feedtype, &ident, &hostname, 0, data);
            let q = ProductQueue::open(queue_path, OpenFlags::default())?;
            match q.insert(&product) {
                Ok(info) => {
                    println!("{} {} ({} bytes)", info.signature, info.ident, info.size);
                    Ok(EXIT_OK)
                }
                Err(QueueError::Dup) => {
                    println!("duplicate: {}", product.info.signature);
                    Ok(EXIT_OK)
                }
                Err(e) => Err(e),
            }
        }

        Command::Copy { dest } => {
            let src = ProductQueue::open(queue_path, OpenFlags::READONLY)?;
            let dst = ProductQueue::open(&dest, OpenFlags::default())?;
            src.set_cursor(Timestamp::ZERO);
            let class = ProductClass::everything();
            let mut copied = 0u64;
            let mut dups = 0u64;
            loop {
                let result = src.sequence(Direction::Gt, &class, |info, data| Product {
                    info: info.clone(),
                    data: data.to_vec(),
                });
                match result {
                    Ok(Some(product)) => match dst.insert_no_signal(&product) {
                        Ok(_) => copied += 1,
                        Err(QueueError::Dup) => dups += 1,
                        Err(e) => return Err(e),
                    },
                    Ok(None) => {}
                    Err(QueueError::End) => break,
                    Err(e) => return Err(e),
                }
            }
            println!("copied {copied} product(s), {dups} duplicate(s)");
            Ok(EXIT_OK)
        }

        Command::Dump { limit } => {
            let q = ProductQueue::open(queue_path, OpenFlags::READONLY)?;
            q.set_cursor(Timestamp::ZERO);
            let class = ProductClass::everything();
            let mut shown = 0u64;
            println!("{:32} {:>10} {:20} {:12} ident", "signature", "bytes", "inserted", "feedtype");
            loop {
                if limit != 0 && shown >= limit {
                    break;
                }
                let result = src_line(&q, &class);
                match result {
                    Ok(Some(line)) => {
                        println!("{line}");
                        shown += 1;
                    }
                    Ok(None) => {}
                    Err(QueueError::End) => break,
                    Err(e) => return Err(e),
                }
            }
            println!("{shown} product(s)");
            Ok(EXIT_OK)
        }

        Command::Stats => {
            let q = ProductQueue::open(queue_path, OpenFlags::READONLY)?;
            println!("queue:               {}", queue_path.display());
            println!("data capacity:       {}", q.data_capacity());
            println!("slot capacity:       {}", q.slot_capacity());
            println!("{}", q.stats()?);
            Ok(EXIT_OK)
        }

        Command::Remove { signature } => {
            let sig: Signature = signature
                .parse()
                .map_err(QueueError::Inval)?;
            let q = ProductQueue::open(queue_path, OpenFlags::default())?;
            q.delete_by_signature(&sig)?;
            println!("removed {sig}");
            Ok(EXIT_OK)
        }

        Command::ResetWriters { force } => {
            if !force {
                eprintln!("reset-writers requires --force (verify no live writer first)");
                return Ok(EXIT_FAILURE);
            }
            let q = ProductQueue::open(queue_path, OpenFlags::default())?;
            let before = q.force_reset_writers()?;
            q.close()?;
            println!("writer counter was {before}, now 0");
            Ok(EXIT_OK)
        }

        Command::ClearMvrt => {
            let q = ProductQueue::open(queue_path, OpenFlags::default())?;
            q.clear_min_vrt()?;
            println!("minimum virtual residence time cleared");
            Ok(EXIT_OK)
        }
    }
}

fn src_line(q: &ProductQueue, class: &ProductClass) -> Result<Option<String>, QueueError> {
    q.sequence(Direction::Gt, class, |info, _| {
        let (time, _) = q.get_cursor();
        format!(
            "{} {:>10} {:20} {:12} {}",
            info.signature, info.size, time.to_string(), info.feedtype.to_string(), info.ident
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!(u32::from_str_radix("0664", 8).unwrap(), 0o664);
        assert_eq!(u32::from_str_radix("600", 8).unwrap(), 0o600);
    }

    #[test]
    fn test_create_check_insert_cycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let qpath = dir.path().join("ctl.pq");

        let code = run(
            &qpath,
            Command::Create {
                bytes: 1 << 16,
                slots: 32,
                clobber: false,
                sparse: false,
                mode: "0600".to_string(),
            },
        )
        .expect("create");
        assert_eq!(code, EXIT_OK);

        let code = run(&qpath, Command::Check).expect("check");
        assert_eq!(code, EXIT_OK);

        let data = dir.path().join("prod.dat");
        std::fs::write(&data, b"payload").expect("write");
        let code = run(
            &qpath,
            Command::Insert {
                file: data.clone(),
                feedtype: "TEXT".to_string(),
                ident: Some("CTL1".to_string()),
            },
        )
        .expect("insert");
        assert_eq!(code, EXIT_OK);

        // Duplicate insert still succeeds (reported, exit 0).
        let code = run(
            &qpath,
            Command::Insert {
                file: data,
                feedtype: "TEXT".to_string(),
                ident: Some("CTL1".to_string()),
            },
        )
        .expect("dup insert");
        assert_eq!(code, EXIT_OK);

        let code = run(&qpath, Command::Stats).expect("stats");
        assert_eq!(code, EXIT_OK);
    }

    #[test]
    fn test_copy_between_queues() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("src.pq");
        let dst = dir.path().join("dst.pq");
        for path in [&src, &dst] {
            run(
                path,
                Command::Create {
                    bytes: 1 << 16,
                    slots: 32,
                    clobber: false,
                    sparse: false,
                    mode: "0600".to_string(),
                },
            )
            .expect("create");
        }
        let q = ProductQueue::open(&src, OpenFlags::default()).expect("open");
        for i in 0..5 {
            let p = Product::new(Feedtype::TEXT, &format!("c{i}"), "h", 0, vec![b'x'; 50]);
            q.insert_no_signal(&p).expect("insert");
        }
        q.close().expect("close");

        let code = run(&src, Command::Copy { dest: dst.clone() }).expect("copy");
        assert_eq!(code, EXIT_OK);
        let q = ProductQueue::open(&dst, OpenFlags::READONLY).expect("open dst");
        assert_eq!(q.stats().expect("stats").products, 5);
    }

    #[test]
    fn test_delete_refuses_non_queue() {
        let dir = tempfile::tempdir().expect("tempdir");
        let not_queue = dir.path().join("random.bin");
        std::fs::write(&not_queue, vec![0u8; 8192]).expect("write");
        assert!(run(&not_queue, Command::Delete).is_err());
        assert!(not_queue.exists(), "file must survive a refused delete");
    }
}
