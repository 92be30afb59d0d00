// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast receiver entry points.
//!
//! The reliability transport is an external collaborator; it drives
//! product reception through three callbacks:
//!
//! - `begin_product`: a product announcement arrived; reserve queue space
//!   (or report a duplicate so the transport drops the bytes)
//! - `end_product`: the last block arrived; validate and commit
//! - `missed_product`: the transport gave up on a product; discard any
//!   in-progress reservation and queue the index for the backstop
//!
//! The transport owns no queue state; everything it touches goes through
//! the reservation it is handed here.

use super::fiq::Fiq;
use crate::product::{xdr, Signature};
use crate::queue::{ProductQueue, QueueError, Reservation};
use parking_lot::Mutex;
use std::sync::Arc;

/// Outcome of `begin_product`, mirrored to the transport.
#[derive(Debug, PartialEq, Eq)]
pub enum BeginOutcome {
    /// Space reserved; stream the bytes.
    Accepted,
    /// Already have this product; drop the bytes.
    Duplicate,
    /// Reservation failed; treat as missed.
    Failed,
}

/// Reception statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReceiverStats {
    pub received: u64,
    pub duplicates: u64,
    pub missed: u64,
    pub discarded: u64,
}

struct InProgress {
    index: u64,
    reservation: Reservation,
}

/// The multicast-side receiver state for one subscription.
pub struct McastReceiver {
    queue: Arc<ProductQueue>,
    fiq: Arc<Fiq>,
    current: Mutex<Option<InProgress>>,
    stats: Mutex<ReceiverStats>,
}

impl McastReceiver {
    #[must_use]
    pub fn new(queue: Arc<ProductQueue>, fiq: Arc<Fiq>) -> McastReceiver {
        McastReceiver {
            queue,
            fiq,
            current: Mutex::new(None),
            stats: Mutex::new(ReceiverStats::default()),
        }
    }

    /// A product of `size` encoded bytes with the given signature is
    /// about to arrive. On `Accepted` the transport writes the bytes
    /// through [`McastReceiver::write_at`].
    pub fn begin_product(&self, index: u64, size: u32, signature: &Signature) -> BeginOutcome {
        let mut current = self.current.lock();
        if let Some(stale) = current.take() {
            // A new announcement before the previous product completed
            // means the transport abandoned it.
            log::debug!("abandoning half-received product index {}", stale.index);
            self.discard_stale(stale);
        }
        match self.queue.reserve(size, signature) {
            Ok(reservation) => {
                *current = Some(InProgress { index, reservation });
                BeginOutcome::Accepted
            }
            Err(QueueError::Dup) => {
                self.stats.lock().duplicates += 1;
                log::debug!("duplicate product {signature} at index {index}");
                BeginOutcome::Duplicate
            }
            Err(e) => {
                log::warn!("reservation for index {index} failed: {e}");
                self.fiq.add(index);
                self.stats.lock().missed += 1;
                BeginOutcome::Failed
            }
        }
    }

    /// Copy received bytes into the reserved region at `offset`.
    /// Returns false if no reservation is active or the range is out of
    /// bounds.
    pub fn write_at(&self, index: u64, offset: usize, bytes: &[u8]) -> bool {
        let mut current = self.current.lock();
        match current.as_mut() {
            Some(p) if p.index == index => {
                let window = p.reservation.data_mut();
                let end = offset + bytes.len();
                if end > window.len() {
                    return false;
                }
                window[offset..end].copy_from_slice(bytes);
                true
            }
            _ => false,
        }
    }

    /// The transport finished streaming the product: validate the decoded
    /// info header against the reservation and commit.
    ///
    /// A decode failure or size mismatch discards the region; it is not
    /// fatal to the session.
    pub fn end_product(&self, index: u64, duration_usecs: u64, retransmissions: u32) {
        let taken = {
            let mut current = self.current.lock();
            match current.take() {
                Some(p) if p.index == index => p,
                Some(other) => {
                    *current = Some(other);
                    log::warn!("end of product index {index} without a matching reservation");
                    return;
                }
                None => {
                    log::warn!("end of product index {index} without a reservation");
                    return;
                }
            }
        };
        match self.queue.commit(taken.reservation, true) {
            Ok(info) => {
                let mut stats = self.stats.lock();
                stats.received += 1;
                log::debug!(
                    "received {} via multicast ({duration_usecs}us, {retransmissions} retrans)",
                    info.ident
                );
            }
            Err(e) => {
                self.stats.lock().discarded += 1;
                log::warn!("commit of multicast product index {index} failed: {e}");
            }
        }
    }

    /// The transport gave up on a product; recover it over unicast.
    pub fn missed_product(&self, index: u64) {
        let stale = {
            let mut current = self.current.lock();
            match current.take() {
                Some(p) if p.index == index => Some(p),
                other => {
                    *current = other;
                    None
                }
            }
        };
        if let Some(p) = stale {
            self.discard_stale(p);
        }
        self.stats.lock().missed += 1;
        self.fiq.add(index);
    }

    /// Decode helper for transports that deliver whole products: verify
    /// the payload parses before handing it to `write_at`/`end_product`.
    pub fn validate_payload(bytes: &[u8]) -> Result<Signature, String> {
        match xdr::decode_product(bytes) {
            Ok((info, _)) => Ok(info.signature),
            Err(e) => Err(e.to_string()),
        }
    }

    #[must_use]
    pub fn stats(&self) -> ReceiverStats {
        *self.stats.lock()
    }

    fn discard_stale(&self, p: InProgress) {
        self.stats.lock().discarded += 1;
        if let Err(e) = self.queue.discard(p.reservation) {
            log::warn!("discard of abandoned index {} failed: {e}", p.index);
        }
    }
}
