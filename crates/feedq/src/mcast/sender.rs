// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The multicast sender child.
//!
//! Spawned by the sender manager, one per feedtype. The child binds its
//! TCP retransmission listener first, reports the OS-assigned port on
//! stdout (`PORT <n>`), then walks the queue and hands matching products
//! to the data plane, recording each `(index, signature)` in the shared
//! registry so upstream sessions can resolve missed-product requests.
//!
//! The reliability protocol itself lives outside this crate; the data
//! plane here is the seam it plugs into.

use super::pidmap::PidMap;
use crate::process::signals;
use crate::product::{xdr, ProductClass, ProductInfo};
use crate::queue::{OpenFlags, ProductQueue, QueueError};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, UdpSocket};

/// Payload bytes per datagram block.
const BLOCK_SIZE: usize = 1400;

/// Where the data plane puts product bytes.
pub trait DataPlane {
    /// Ship one product, already in its canonical encoded form.
    fn send_product(&mut self, index: u64, info: &ProductInfo, encoded: &[u8]) -> io::Result<()>;
}

/// Minimal datagram data plane: each product travels as numbered blocks
/// `[index u64][block u32][nblocks u32][payload]`.
pub struct DatagramPlane {
    socket: UdpSocket,
    group: SocketAddrV4,
}

impl DatagramPlane {
    /// Open and configure the multicast send socket.
    pub fn new(group: SocketAddrV4, ttl: u32, interface: Ipv4Addr) -> io::Result<DatagramPlane> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_multicast_ttl_v4(ttl)?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_if_v4(&interface)?;
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
        Ok(DatagramPlane {
            socket: socket.into(),
            group,
        })
    }

    #[must_use]
    pub fn block_count(encoded_len: usize) -> u32 {
        (encoded_len.max(1)).div_ceil(BLOCK_SIZE) as u32
    }
}

impl DataPlane for DatagramPlane {
    fn send_product(&mut self, index: u64, _info: &ProductInfo, encoded: &[u8]) -> io::Result<()> {
        let nblocks = Self::block_count(encoded.len());
        let mut header = [0u8; 16];
        header[..8].copy_from_slice(&index.to_be_bytes());
        header[12..16].copy_from_slice(&nblocks.to_be_bytes());
        let mut datagram = Vec::with_capacity(16 + BLOCK_SIZE);
        for block in 0..nblocks {
            let start = block as usize * BLOCK_SIZE;
            let end = (start + BLOCK_SIZE).min(encoded.len());
            header[8..12].copy_from_slice(&block.to_be_bytes());
            datagram.clear();
            datagram.extend_from_slice(&header);
            datagram.extend_from_slice(&encoded[start..end]);
            self.socket.send_to(&datagram, SocketAddr::V4(self.group))?;
        }
        Ok(())
    }
}

/// Sender-child configuration.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub queue_path: std::path::PathBuf,
    pub class: ProductClass,
    pub group: SocketAddrV4,
    pub segment_name: String,
    pub ttl: u32,
    pub interface: Ipv4Addr,
}

/// Run the sender child to completion (SIGTERM ends it).
///
/// Binds the retransmission listener, reports its port, then streams
/// matching products from the queue into the data plane.
pub fn run_sender(config: &SenderConfig) -> Result<(), QueueError> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    let tcp_port = listener.local_addr()?.port();

    // The parent blocks on this line; it must go out before anything else.
    {
        let mut out = io::stdout().lock();
        writeln!(out, "PORT {tcp_port}")?;
        out.flush()?;
    }

    let registry = PidMap::open(&config.segment_name)?;
    let mut plane = DatagramPlane::new(config.group, config.ttl, config.interface)?;
    let queue = ProductQueue::open(&config.queue_path, OpenFlags::READONLY)?;
    queue.set_cursor(crate::product::Timestamp::now());

    log::info!(
        "multicast sender: group {} tcp {tcp_port} feed {}",
        config.group,
        config.class.feed_union()
    );

    let mut scratch = Vec::new();
    while !signals::terminated() {
        crate::logging::service_signals();
        let outcome = queue.sequence(crate::queue::Direction::Gt, &config.class, |info, data| {
            scratch.clear();
            scratch.resize(xdr::product_encoded_len(info), 0);
            match xdr::encode_product(info, data, &mut scratch) {
                Ok(n) => {
                    scratch.truncate(n);
                    Some(info.clone())
                }
                Err(e) => {
                    log::warn!("product {} failed to re-encode: {e}", info.ident);
                    None
                }
            }
        });
        match outcome {
            Ok(Some(Some(info))) => {
                let index = registry.next_index();
                if let Err(e) = plane.send_product(index, &info, &scratch) {
                    log::warn!("multicast send of {} failed: {e}", info.ident);
                    continue;
                }
                registry.record_sent(index, &info.signature);
                log::debug!("sent {} as index {index}", info.ident);
            }
            Ok(_) => {}
            Err(QueueError::End) => {
                queue.suspend(30);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
