// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! FIQ: the missed-product index queue.
//!
//! A thread-safe FIFO carrying product indices from the multicast
//! callback thread to the backstop requester. Closing the queue wakes a
//! blocked `remove` with `Closed` so the requester can drain and exit.

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;

/// Why a `remove` returned without an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiqError {
    /// The queue was closed and drained.
    Closed,
    /// `remove_no_wait` found the queue empty.
    Empty,
}

/// The missed-product index queue.
pub struct Fiq {
    tx: Mutex<Option<Sender<u64>>>,
    rx: Receiver<u64>,
}

impl Fiq {
    #[must_use]
    pub fn new() -> Fiq {
        let (tx, rx) = unbounded();
        Fiq {
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    /// Append an index. Silently dropped after close (the session is
    /// tearing down and the backstop no longer cares).
    pub fn add(&self, index: u64) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(index);
        }
    }

    /// Blocking removal of the oldest index.
    pub fn remove(&self) -> Result<u64, FiqError> {
        self.rx.recv().map_err(|_| FiqError::Closed)
    }

    /// Non-blocking removal.
    pub fn remove_no_wait(&self) -> Result<u64, FiqError> {
        self.rx.try_recv().map_err(|e| match e {
            TryRecvError::Empty => FiqError::Empty,
            TryRecvError::Disconnected => FiqError::Closed,
        })
    }

    /// Close the queue; pending indices remain removable, further adds
    /// are dropped, and a blocked `remove` returns `Closed` once drained.
    pub fn close(&self) {
        self.tx.lock().take();
    }

    /// Indices currently waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for Fiq {
    fn default() -> Self {
        Self::new()
    }
}
