// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast sender manager: one singleton sender child per feedtype.
//!
//! The manager holds the set of *potential* senders (registered, possibly
//! not running) with the invariant that no two entries conflict: feedtype
//! masks are disjoint, TCP endpoints distinct, multicast groups distinct.
//! `ensure_running` spawns the sender child on demand, reads the
//! OS-assigned retransmission port back over the child's stdout pipe, and
//! records the pid in the shared registry so every supervisor on the host
//! observes the same set.

use super::pidmap::{PidMap, RunningSender};
use crate::process::spawn;
use crate::product::Feedtype;
use parking_lot::Mutex;
use std::fmt;
use std::io::{self, BufRead, BufReader};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

/// How long `ensure_running` waits for the child's port report.
const PORT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A potential sender registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderInfo {
    /// Feeds this sender carries (must not overlap other entries).
    pub feedtype: Feedtype,
    /// Multicast group and UDP port.
    pub group: SocketAddrV4,
    /// TCP endpoint for block retransmission; port 0 lets the OS assign
    /// one, reported back through the pipe at spawn.
    pub tcp: SocketAddrV4,
}

/// Sender-manager failures.
#[derive(Debug)]
pub enum McastError {
    /// The registration conflicts with an existing entry.
    Conflict(String),
    /// No potential sender covers the feedtype.
    NoSender(Feedtype),
    /// The spawned child never reported its port.
    Handshake(String),
    Sys(io::Error),
}

impl fmt::Display for McastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict(reason) => write!(f, "conflicting sender registration: {reason}"),
            Self::NoSender(ft) => write!(f, "no potential sender for feed {ft}"),
            Self::Handshake(reason) => write!(f, "sender handshake failed: {reason}"),
            Self::Sys(e) => write!(f, "system error: {e}"),
        }
    }
}

impl std::error::Error for McastError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sys(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for McastError {
    fn from(e: io::Error) -> Self {
        McastError::Sys(e)
    }
}

/// The process-wide sender manager.
pub struct SenderManager {
    potential: Mutex<Vec<SenderInfo>>,
    map: PidMap,
    /// Program to exec for sender children (normally our own binary with
    /// the sender-child subcommand).
    child_program: String,
    child_args: Vec<String>,
}

impl SenderManager {
    /// Open the manager over the named shared registry segment.
    ///
    /// `child_program`/`child_args` form the sender-child command line;
    /// the feed, group, and queue arguments are appended per spawn.
    pub fn new(
        segment_name: &str,
        child_program: &str,
        child_args: Vec<String>,
    ) -> io::Result<SenderManager> {
        Ok(SenderManager {
            potential: Mutex::new(Vec::new()),
            map: PidMap::open(segment_name)?,
            child_program: child_program.to_string(),
            child_args,
        })
    }

    /// Register a potential sender.
    ///
    /// # Errors
    ///
    /// `Conflict` if the feedtype mask overlaps, the TCP endpoint
    /// duplicates, or the multicast group duplicates an existing entry.
    pub fn add_potential(&self, info: SenderInfo) -> Result<(), McastError> {
        let mut potential = self.potential.lock();
        for existing in potential.iter() {
            if existing.feedtype.intersects(info.feedtype) {
                return Err(McastError::Conflict(format!(
                    "feed {} overlaps registered {}",
                    info.feedtype, existing.feedtype
                )));
            }
            if existing.tcp == info.tcp && info.tcp.port() != 0 {
                return Err(McastError::Conflict(format!(
                    "TCP endpoint {} already registered",
                    info.tcp
                )));
            }
            if existing.group == info.group {
                return Err(McastError::Conflict(format!(
                    "multicast group {} already registered",
                    info.group
                )));
            }
        }
        log::info!(
            "potential sender: feed {} group {} tcp {}",
            info.feedtype,
            info.group,
            info.tcp
        );
        potential.push(info);
        Ok(())
    }

    /// Registered potential senders.
    #[must_use]
    pub fn potential(&self) -> Vec<SenderInfo> {
        self.potential.lock().clone()
    }

    /// Ensure a sender for the feedtype is running, spawning it if needed;
    /// returns the live entry with its OS-assigned TCP port.
    pub fn ensure_running(&self, feedtype: Feedtype, queue_path: &str) -> Result<RunningSender, McastError> {
        if let Some(running) = self.map.find_live(feedtype.bits()) {
            return Ok(running);
        }

        let info = {
            let potential = self.potential.lock();
            potential
                .iter()
                .find(|s| s.feedtype.intersects(feedtype))
                .cloned()
                .ok_or(McastError::NoSender(feedtype))?
        };

        let mut args = self.child_args.clone();
        args.extend_from_slice(&[
            "--feed".to_string(),
            info.feedtype.to_string(),
            "--group".to_string(),
            info.group.to_string(),
            "--queue".to_string(),
            queue_path.to_string(),
        ]);
        let mut child = spawn::spawn_piped(&self.child_program, &args)?;
        let pid = child.id() as i32;

        match read_port_report(&mut child) {
            Ok(tcp_port) => {
                self.map.record(
                    info.feedtype.bits(),
                    pid,
                    *info.group.ip(),
                    info.group.port(),
                    tcp_port,
                )?;
                log::info!(
                    "multicast sender for {} running as pid {pid}, tcp port {tcp_port}",
                    info.feedtype
                );
                Ok(RunningSender {
                    feedtype: info.feedtype.bits(),
                    pid,
                    group: *info.group.ip(),
                    group_port: info.group.port(),
                    tcp_port,
                })
            }
            Err(e) => {
                // The child is not usable without the handshake; tear it
                // down and make sure no half-recorded entry survives.
                spawn::terminate(pid);
                self.map.remove_pid(pid);
                let _ = child.wait();
                Err(McastError::Handshake(e.to_string()))
            }
        }
    }

    /// Supervisor hook for `SIGCHLD`: drop the registry entry of an exited
    /// child.
    pub fn terminated(&self, pid: i32) {
        if self.map.remove_pid(pid) {
            log::info!("multicast sender pid {pid} exited, entry removed");
        }
    }

    /// The shared registry, for missed-product resolution.
    #[must_use]
    pub fn registry(&self) -> &PidMap {
        &self.map
    }
}

/// Read the `PORT <n>` report from the child's stdout, bounded by the
/// handshake timeout.
fn read_port_report(child: &mut std::process::Child) -> io::Result<u16> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("child stdout not piped"))?;
    let mut reader = BufReader::new(stdout);
    let start = Instant::now();
    let mut line = String::new();
    // A blocking read is fine: the child's first action is the report. The
    // deadline guards against a child that wedges before printing.
    reader.read_line(&mut line)?;
    if start.elapsed() > PORT_HANDSHAKE_TIMEOUT {
        return Err(io::Error::new(io::ErrorKind::TimedOut, "port report late"));
    }
    let port = line
        .trim()
        .strip_prefix("PORT ")
        .and_then(|p| p.parse::<u16>().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad port report {line:?}"),
            )
        })?;
    Ok(port)
}

/// Conflict-free helper used by the server CLI to parse `--mcast`
/// definitions of the form `FEED@group:gport@tcphost:tport`.
pub fn parse_sender_spec(spec: &str) -> Result<SenderInfo, String> {
    let mut parts = spec.split('@');
    let feed = parts.next().ok_or("empty sender spec")?;
    let group = parts.next().ok_or("sender spec missing group")?;
    let tcp = parts.next().unwrap_or("0.0.0.0:0");
    if parts.next().is_some() {
        return Err(format!("too many '@' in sender spec {spec}"));
    }
    let feedtype: Feedtype = feed.parse()?;
    let group: SocketAddrV4 = group
        .parse()
        .map_err(|e| format!("bad group address {group}: {e}"))?;
    if !group.ip().is_multicast() {
        return Err(format!("{} is not a multicast address", group.ip()));
    }
    let tcp: SocketAddrV4 = tcp
        .parse()
        .map_err(|e| format!("bad TCP endpoint {tcp}: {e}"))?;
    Ok(SenderInfo {
        feedtype,
        group,
        tcp,
    })
}

/// Default multicast group layout: one group per feed bit under
/// 239.128.4.0/24, FMTP port 4100.
#[must_use]
pub fn default_group_for(feedtype: Feedtype) -> SocketAddrV4 {
    let bit = feedtype.bits().trailing_zeros().min(254) as u8;
    SocketAddrV4::new(Ipv4Addr::new(239, 128, 4, bit + 1), 4100)
}
