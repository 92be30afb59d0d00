// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One downstream session: subscription, streaming, missed/backlog
//! service.
//!
//! Each session owns its own read-only queue handle, because the cursor is
//! per-handle state. The feeder thread streams matching products with
//! `sequence_lock` (the region stays pinned until the send completes); the
//! connection thread services missed-product and backlog requests. Writes
//! interleave through a shared stream guard.

use crate::mcast::SenderManager;
use crate::product::{ProductClass, Timestamp};
use crate::proto::{self, McastEndpoint, Message, ProtoError, PROTO_VERSION};
use crate::queue::{Direction, OpenFlags, ProductQueue, QueueError};
use parking_lot::Mutex;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Suspension interval at end-of-queue; short enough that teardown joins
/// promptly.
const FEED_SUSPEND_SECS: u32 = 5;

/// Session-scoped configuration handed down from the server.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub queue_path: PathBuf,
    /// Feeds this server offers; the subscription narrows to the overlap.
    pub offered: crate::product::Feedtype,
}

pub(crate) fn run_session(
    config: &SessionConfig,
    stream: TcpStream,
    session_id: u32,
    mcast: Option<&SenderManager>,
) -> Result<(), ProtoError> {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());
    let mut reader = stream.try_clone()?;
    let writer = Arc::new(Mutex::new(stream));
    let mut buf = Vec::new();

    // The session opens with exactly one Subscribe.
    let class = match proto::recv(&mut reader, &mut buf)? {
        Message::Subscribe { version, class } if version == PROTO_VERSION => {
            match class.compile() {
                Ok(compiled) => {
                    let narrowed = compiled.intersect_feed(config.offered);
                    if narrowed.specs.is_empty() {
                        proto::send(
                            &mut *writer.lock(),
                            &Message::BadReq {
                                reason: "no offered feed matches the request".to_string(),
                            },
                        )?;
                        return Ok(());
                    }
                    narrowed
                }
                Err(reason) => {
                    proto::send(&mut *writer.lock(), &Message::BadReq { reason })?;
                    return Ok(());
                }
            }
        }
        Message::Subscribe { version, .. } => {
            proto::send(
                &mut *writer.lock(),
                &Message::BadReq {
                    reason: format!("unsupported protocol version {version}"),
                },
            )?;
            return Err(ProtoError::Version(version));
        }
        other => {
            proto::send(
                &mut *writer.lock(),
                &Message::BadReq {
                    reason: format!("expected Subscribe, got {other:?}"),
                },
            )?;
            return Ok(());
        }
    };

    // Pair the subscription with a multicast endpoint when a sender
    // serves any of the subscribed feeds.
    let endpoint = mcast.and_then(|mgr| {
        match mgr.ensure_running(class.feed_union(), &config.queue_path.to_string_lossy()) {
            Ok(running) => Some(McastEndpoint {
                group: running.group,
                port: running.group_port,
                tcp_port: running.tcp_port,
            }),
            Err(e) => {
                log::warn!("session {session_id}: no multicast endpoint: {e}");
                None
            }
        }
    });

    proto::send(
        &mut *writer.lock(),
        &Message::SubscribeAck {
            session: session_id,
            mcast: endpoint,
        },
    )?;
    log::info!(
        "session {session_id} from {peer}: feed {} {} multicast",
        class.feed_union(),
        if endpoint.is_some() { "with" } else { "without" }
    );

    let done = Arc::new(AtomicBool::new(false));

    // Feeder: stream matching products from "now" (or the class window
    // start when it lies in the future of the queue's history).
    let feeder = {
        let done = done.clone();
        let writer = writer.clone();
        let class = class.clone();
        let queue_path = config.queue_path.clone();
        std::thread::spawn(move || {
            if let Err(e) = feed_loop(&queue_path, &class, &writer, &done) {
                log::info!("session {session_id}: feeder ended: {e}");
            }
            done.store(true, Ordering::Relaxed);
        })
    };

    // Request service on the connection thread.
    let result = serve_requests(
        config,
        &mut reader,
        &writer,
        &class,
        mcast,
        session_id,
        &done,
    );
    done.store(true, Ordering::Relaxed);
    // Unblock a feeder parked in suspend.
    crate::queue::wake_process_group();
    let _ = feeder.join();
    log::info!("session {session_id} from {peer} closed");
    result
}

fn feed_loop(
    queue_path: &std::path::Path,
    class: &ProductClass,
    writer: &Arc<Mutex<TcpStream>>,
    done: &Arc<AtomicBool>,
) -> Result<(), ProtoError> {
    let queue = ProductQueue::open(queue_path, OpenFlags::READONLY)
        .map_err(|e| ProtoError::Malformed(format!("queue open failed: {e}")))?;
    let start = if class.from > Timestamp::ZERO {
        class.from
    } else {
        Timestamp::now()
    };
    queue.set_cursor(start);

    while !done.load(Ordering::Relaxed) && !crate::process::signals::terminated() {
        match queue.sequence_lock(Direction::Gt, class, |info, data| {
            Message::DeliverProduct {
                info: info.clone(),
                data: data.to_vec(),
            }
        }) {
            Ok(Some((msg, offset))) => {
                let sent = proto::send(&mut *writer.lock(), &msg);
                queue.release(offset);
                sent?;
            }
            Ok(None) => {}
            Err(QueueError::End) => {
                queue.suspend(FEED_SUSPEND_SECS);
            }
            Err(e) => {
                return Err(ProtoError::Malformed(format!("sequencing failed: {e}")));
            }
        }
    }
    Ok(())
}

fn serve_requests(
    config: &SessionConfig,
    reader: &mut TcpStream,
    writer: &Arc<Mutex<TcpStream>>,
    class: &ProductClass,
    mcast: Option<&SenderManager>,
    session_id: u32,
    done: &Arc<AtomicBool>,
) -> Result<(), ProtoError> {
    let mut buf = Vec::new();
    loop {
        if done.load(Ordering::Relaxed) || crate::process::signals::terminated() {
            return Ok(());
        }
        match proto::recv(reader, &mut buf) {
            Ok(Message::RequestMissed { index }) => {
                serve_missed(config, writer, mcast, session_id, index)?;
            }
            Ok(Message::RequestBacklog { since }) => {
                log::info!("session {session_id}: backlog requested since {since}");
                serve_backlog(config, writer, class, since)?;
            }
            Ok(Message::Heartbeat) => {}
            Ok(other) => {
                log::debug!("session {session_id}: ignoring {other:?}");
            }
            Err(ProtoError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// Resolve a missed multicast index through the shared sent-log and ship
/// the product back over the unicast channel.
fn serve_missed(
    config: &SessionConfig,
    writer: &Arc<Mutex<TcpStream>>,
    mcast: Option<&SenderManager>,
    session_id: u32,
    index: u64,
) -> Result<(), ProtoError> {
    let Some(sig) = mcast.and_then(|m| m.registry().lookup_sent(index)) else {
        log::warn!("session {session_id}: missed index {index} not in the sent log");
        return Ok(());
    };
    let queue = ProductQueue::open(&config.queue_path, OpenFlags::READONLY)
        .map_err(|e| ProtoError::Malformed(format!("queue open failed: {e}")))?;
    match queue.process_by_signature(&sig, |info, data| Message::MissedProduct {
        index,
        info: info.clone(),
        data: data.to_vec(),
    }) {
        Ok(msg) => proto::send(&mut *writer.lock(), &msg),
        Err(QueueError::NotFound) => {
            // Already evicted; the downstream's backlog recovery covers it.
            log::info!("session {session_id}: missed index {index} already evicted");
            Ok(())
        }
        Err(e) => Err(ProtoError::Malformed(format!("missed lookup failed: {e}"))),
    }
}

/// Stream every matching product from `since` to the present, then mark
/// the end of the backlog.
fn serve_backlog(
    config: &SessionConfig,
    writer: &Arc<Mutex<TcpStream>>,
    class: &ProductClass,
    since: Timestamp,
) -> Result<(), ProtoError> {
    let queue = ProductQueue::open(&config.queue_path, OpenFlags::READONLY)
        .map_err(|e| ProtoError::Malformed(format!("queue open failed: {e}")))?;
    queue.set_cursor(since);
    let mut shipped = 0u64;
    loop {
        match queue.sequence_lock(Direction::Gt, class, |info, data| Message::DeliverProduct {
            info: info.clone(),
            data: data.to_vec(),
        }) {
            Ok(Some((msg, offset))) => {
                let sent = proto::send(&mut *writer.lock(), &msg);
                queue.release(offset);
                sent?;
                shipped += 1;
            }
            Ok(None) => {}
            Err(QueueError::End) => break,
            Err(e) => return Err(ProtoError::Malformed(format!("backlog scan failed: {e}"))),
        }
    }
    log::info!("backlog complete: {shipped} product(s)");
    proto::send(&mut *writer.lock(), &Message::EndBacklog)
}
