// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Downstream coordinator: one feed subscription end to end.
//!
//! Owns the three sub-tasks of a subscription: the multicast receiver
//! (fed by the transport's callbacks), the backstop requester, and the
//! once-per-session backlog recovery. The unicast control connection
//! carries the subscription, the streamed/backlog deliveries, and the
//! missed-product replies.
//!
//! An unrecoverable connection failure tears the session down; the owner
//! reconnects with exponential backoff.

use super::backlog::BacklogTracker;
use super::backstop::run_backstop;
use super::fiq::Fiq;
use super::fmtp::McastReceiver;
use super::session::{SessionMemory, SessionRecord};
use crate::process::signals;
use crate::product::{Product, ProductClass, Timestamp};
use crate::proto::{self, ClassSpec, Message, ProtoError, PROTO_VERSION};
use crate::queue::{OpenFlags, ProductQueue, QueueError};
use parking_lot::Mutex;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Reconnect backoff bounds.
const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(120);

/// One subscription's configuration.
#[derive(Debug, Clone)]
pub struct DownstreamConfig {
    /// Upstream control endpoint, `host:port`.
    pub upstream: String,
    pub class: ProductClass,
    pub queue_path: PathBuf,
    pub session_dir: PathBuf,
}

/// The coordinator for one subscription.
pub struct Coordinator {
    config: DownstreamConfig,
}

impl Coordinator {
    #[must_use]
    pub fn new(config: DownstreamConfig) -> Coordinator {
        Coordinator { config }
    }

    /// Reconnect loop: run sessions until terminated, backing off
    /// exponentially (with jitter) after failures.
    pub fn run_with_backoff(&self) {
        let mut backoff = BACKOFF_MIN;
        while !signals::terminated() {
            crate::logging::service_signals();
            let started = std::time::Instant::now();
            match self.run_session() {
                Ok(()) => return,
                Err(e) => {
                    log::warn!("session with {} ended: {e}", self.config.upstream);
                }
            }
            // A session that held up for a while earns a fresh backoff.
            if started.elapsed() > Duration::from_secs(60) {
                backoff = BACKOFF_MIN;
            }
            let jitter = Duration::from_millis(u64::from(fastrand_ms()));
            log::info!("reconnecting to {} in {:?}", self.config.upstream, backoff + jitter);
            std::thread::sleep(backoff + jitter);
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }

    /// Run one session to completion. `Ok` only on an orderly, signalled
    /// shutdown; any transport failure is an error so the owner retries.
    pub fn run_session(&self) -> Result<(), ProtoError> {
        let queue = Arc::new(
            ProductQueue::open(&self.config.queue_path, OpenFlags::THREADSAFE)
                .map_err(|e| ProtoError::Malformed(format!("queue open failed: {e}")))?,
        );

        let host = self
            .config
            .upstream
            .split(':')
            .next()
            .unwrap_or(&self.config.upstream);
        let feed = self.config.class.feed_union().to_string();
        let memory = SessionMemory::open(&self.config.session_dir, host, &feed)?;
        let mut record = memory.load()?;
        record.session_start = Timestamp::now();

        let stream = TcpStream::connect(&self.config.upstream)?;
        let mut reader = stream.try_clone()?;
        let writer = Arc::new(Mutex::new(stream));

        proto::send(
            &mut *writer.lock(),
            &Message::Subscribe {
                version: PROTO_VERSION,
                class: ClassSpec::from_class(&self.config.class),
            },
        )?;

        let mut buf = Vec::new();
        let mcast_endpoint = match proto::recv(&mut reader, &mut buf)? {
            Message::SubscribeAck { session, mcast } => {
                log::info!(
                    "subscribed to {} as session {session} ({})",
                    self.config.upstream,
                    mcast.map_or_else(|| "unicast only".to_string(), |ep| format!("multicast {}", ep.group))
                );
                mcast
            }
            Message::BadReq { reason } => {
                return Err(ProtoError::Malformed(format!("subscription refused: {reason}")));
            }
            other => {
                return Err(ProtoError::Malformed(format!("expected ack, got {other:?}")));
            }
        };

        // Multicast side: the transport drives the receiver's callbacks.
        // Without a multicast endpoint the FIQ stays empty and the
        // backstop thread idles until close.
        let fiq = Arc::new(Fiq::new());
        let receiver = Arc::new(McastReceiver::new(queue.clone(), fiq.clone()));
        let _ = mcast_endpoint; // transport wiring is the caller's seam
        let backstop = {
            let fiq = fiq.clone();
            let writer = writer.clone();
            std::thread::spawn(move || run_backstop(&fiq, &writer))
        };

        let result = self.read_loop(&queue, &mut reader, &writer, &memory, &mut record);

        fiq.close();
        let _ = backstop.join();
        drop(receiver);
        result
    }

    /// The session read loop: installs deliveries, drives backlog
    /// recovery, persists session memory.
    fn read_loop(
        &self,
        queue: &Arc<ProductQueue>,
        reader: &mut TcpStream,
        writer: &Arc<Mutex<TcpStream>>,
        memory: &SessionMemory,
        record: &mut SessionRecord,
    ) -> Result<(), ProtoError> {
        let mut backlog = BacklogTracker::new(record.last_time);
        let mut buf = Vec::new();

        loop {
            if signals::terminated() {
                return Ok(());
            }
            crate::logging::service_signals();

            let msg = match proto::recv(reader, &mut buf) {
                Ok(msg) => msg,
                Err(ProtoError::Closed) => {
                    return Err(ProtoError::Closed);
                }
                Err(e) => return Err(e),
            };

            match msg {
                Message::DeliverProduct { info, data } => {
                    self.install(queue, memory, record, &mut backlog, writer, info, data, true)?;
                }
                Message::MissedProduct { index, info, data } => {
                    log::info!("recovered missed index {index}: {}", info.ident);
                    self.install(queue, memory, record, &mut backlog, writer, info, data, false)?;
                }
                Message::EndBacklog => {
                    log::info!("backlog from {} complete", self.config.upstream);
                    backlog.on_end();
                }
                Message::Heartbeat => {}
                other => log::debug!("ignoring {other:?}"),
            }
        }
    }

    /// Install one delivered product; streamed deliveries signal waiting
    /// readers, backstop recoveries do not.
    #[allow(clippy::too_many_arguments)]
    fn install(
        &self,
        queue: &Arc<ProductQueue>,
        memory: &SessionMemory,
        record: &mut SessionRecord,
        backlog: &mut BacklogTracker,
        writer: &Arc<Mutex<TcpStream>>,
        info: crate::product::ProductInfo,
        data: Vec<u8>,
        signal: bool,
    ) -> Result<(), ProtoError> {
        let sig = info.signature;
        let product = Product { info, data };
        let installed = if signal {
            queue.insert(&product)
        } else {
            queue.insert_no_signal(&product)
        };
        match installed {
            Ok(_) => {
                memory.remember(record, sig, Timestamp::now());
                if let Some(since) = backlog.on_receipt() {
                    log::info!("requesting backlog since {since}");
                    proto::send(&mut *writer.lock(), &Message::RequestBacklog { since })?;
                }
                Ok(())
            }
            Err(QueueError::Dup) => {
                log::debug!("duplicate delivery {sig}");
                Ok(())
            }
            Err(e) => {
                // A full or failing queue is not the session's fault, but
                // there is no point pulling products we cannot store.
                Err(ProtoError::Malformed(format!("insertion failed: {e}")))
            }
        }
    }
}

/// Small jitter source; avoids synchronized reconnect stampedes without
/// pulling a full RNG into the dependency set.
fn fastrand_ms() -> u16 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 500) as u16
}
