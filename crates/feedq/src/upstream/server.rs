// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Upstream server: accepts subscriptions and hands each connection to a
//! session thread.

use super::session::{run_session, SessionConfig};
use crate::mcast::SenderManager;
use crate::process::signals;
use crate::product::Feedtype;
use std::io;
use std::net::{TcpListener, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Upstream server configuration.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub queue_path: PathBuf,
    pub bind: String,
    /// Feeds offered to downstreams.
    pub offered: Feedtype,
}

/// The upstream server. Each accepted connection becomes a session
/// thread; the accept loop ends when a termination signal arrives.
pub struct UpstreamServer {
    config: UpstreamConfig,
    next_session: AtomicU32,
}

impl UpstreamServer {
    #[must_use]
    pub fn new(config: UpstreamConfig) -> UpstreamServer {
        UpstreamServer {
            config,
            next_session: AtomicU32::new(1),
        }
    }

    /// Bind and serve until terminated.
    pub fn run(&self, mcast: Option<Arc<SenderManager>>) -> io::Result<()> {
        let addr = self
            .config
            .bind
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unresolvable bind address"))?;
        let listener = TcpListener::bind(addr)?;
        log::info!(
            "upstream server on {} serving {} from {}",
            listener.local_addr()?,
            self.config.offered,
            self.config.queue_path.display()
        );

        let session_config = SessionConfig {
            queue_path: self.config.queue_path.clone(),
            offered: self.config.offered,
        };

        for stream in listener.incoming() {
            if signals::terminated() {
                break;
            }
            crate::logging::service_signals();
            match stream {
                Ok(stream) => {
                    let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
                    let config = session_config.clone();
                    let mcast = mcast.clone();
                    std::thread::spawn(move || {
                        if let Err(e) =
                            run_session(&config, stream, session_id, mcast.as_deref())
                        {
                            log::warn!("session {session_id} failed: {e}");
                        }
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("accept failed: {e}");
                }
            }
        }
        Ok(())
    }
}
