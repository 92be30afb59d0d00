// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Backstop requester: turns missed-product indices into unicast
//! recovery requests.
//!
//! Runs on its own thread, draining the FIQ and sending `RequestMissed`
//! over the shared control connection. The replies come back on the
//! coordinator's read loop (which installs them without a wakeup signal);
//! this thread only produces requests.

use super::fiq::{Fiq, FiqError};
use crate::proto::{self, Message};
use parking_lot::Mutex;
use std::net::TcpStream;
use std::sync::Arc;

/// Drain the FIQ until it closes or the connection dies.
pub fn run_backstop(fiq: &Arc<Fiq>, writer: &Arc<Mutex<TcpStream>>) {
    loop {
        let index = match fiq.remove() {
            Ok(index) => index,
            Err(FiqError::Closed | FiqError::Empty) => {
                log::debug!("backstop requester: queue closed");
                return;
            }
        };
        log::info!("requesting missed product index {index}");
        if let Err(e) = proto::send(&mut *writer.lock(), &Message::RequestMissed { index }) {
            log::warn!("missed-product request for {index} failed: {e}");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_backstop_sends_requests_then_exits_on_close() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut buf = Vec::new();
            let mut got = Vec::new();
            while let Ok(msg) = proto::recv(&mut stream, &mut buf) {
                if let Message::RequestMissed { index } = msg {
                    got.push(index);
                }
            }
            got
        });

        let stream = TcpStream::connect(addr).expect("connect");
        let writer = Arc::new(Mutex::new(stream));
        let fiq = Arc::new(Fiq::new());
        fiq.add(4);
        fiq.add(9);
        fiq.close();

        run_backstop(&fiq, &writer);
        drop(writer); // closes the stream, ends the server read loop

        let got = server.join().expect("join");
        assert_eq!(got, vec![4, 9]);
    }
}
