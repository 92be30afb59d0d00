// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Full-queue consistency verification.
//!
//! Walks every structure and cross-checks the accounting invariants:
//!
//! 1. signature index <-> live regions is one-to-one
//! 2. reserved regions appear in no index
//! 3. live + reserved + free extents cover the data area exactly
//! 4. the time ring is sorted by `(insertion time, offset)` and holds
//!    exactly the live regions
//! 5. slot accounting: used + free-chain = slot capacity
//!
//! The operator `check` subcommand maps the verdict onto its exit codes;
//! a non-zero writer counter with no live writers is reported separately
//! so the operator can decide to force-clear it.

use super::layout::{SLOT_FREE, SLOT_LIVE, SLOT_RESERVED, NIL};
use super::{ProductQueue, Result};

/// Outcome of a verification walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckVerdict {
    /// Every invariant holds and no writer is recorded.
    Clean,
    /// Invariants hold but the writer counter is non-zero.
    WriterCountNonZero,
    /// At least one invariant is violated.
    Corrupt,
}

/// Detailed verification report.
#[derive(Debug)]
pub struct CheckReport {
    pub verdict: CheckVerdict,
    pub products: u64,
    pub reserved: u64,
    pub writer_count: u32,
    /// One line per violated invariant.
    pub issues: Vec<String>,
}

impl ProductQueue {
    /// Verify every queue invariant. Read-only: the walk runs under the
    /// shared header lock and never mutates the file.
    ///
    /// `expected_writers` is the number of writers the caller itself
    /// accounts for (1 when the checking handle is writable).
    pub fn verify(&self, expected_writers: u32) -> Result<CheckReport> {
        self.ensure_readable()?;
        let _guard = self.lock_header(false)?;
        let view = self.view();
        let h = view.header();
        let mut issues = Vec::new();

        let mut live = 0u64;
        let mut reserved = 0u64;
        let mut used_extent = 0u64;

        for (i, s) in view.slots().iter().enumerate() {
            match s.state {
                SLOT_FREE => {}
                SLOT_LIVE | SLOT_RESERVED => {
                    if s.offset + s.extent > h.byte_capacity {
                        issues.push(format!(
                            "slot {i}: region [{}, {}) exceeds the data area",
                            s.offset,
                            s.offset + s.extent
                        ));
                    }
                    used_extent += s.extent;
                    if s.state == SLOT_LIVE {
                        live += 1;
                        match view.sig_lookup(&s.signature) {
                            Some(found) if found == i as u32 => {}
                            Some(found) => issues.push(format!(
                                "slot {i}: signature resolves to slot {found}"
                            )),
                            None => issues.push(format!(
                                "slot {i}: live region missing from signature index"
                            )),
                        }
                    } else {
                        reserved += 1;
                    }
                }
                other => issues.push(format!("slot {i}: unknown state {other}")),
            }
        }

        if live != h.products {
            issues.push(format!(
                "header records {} products, slots hold {live}",
                h.products
            ));
        }
        if live + reserved != h.slots_used {
            issues.push(format!(
                "header records {} used slots, slots hold {}",
                h.slots_used,
                live + reserved
            ));
        }

        // Free-slot chain covers exactly the unused slots.
        let mut chain = 0u64;
        let mut cursor = h.slot_free_head;
        while cursor != NIL && chain <= h.slot_capacity {
            if view.slots()[cursor as usize].state != SLOT_FREE {
                issues.push(format!("free-slot chain passes through used slot {cursor}"));
                break;
            }
            chain += 1;
            cursor = view.slots()[cursor as usize].next_free;
        }
        if chain + h.slots_used != h.slot_capacity {
            issues.push(format!(
                "free-slot chain holds {chain} of {} unused slots",
                h.slot_capacity - h.slots_used
            ));
        }

        // Extent coverage.
        let free_extent = view.free_total();
        if used_extent != h.bytes_used {
            issues.push(format!(
                "header records {} bytes used, slots hold {used_extent}",
                h.bytes_used
            ));
        }
        if used_extent + free_extent != h.byte_capacity {
            issues.push(format!(
                "extents cover {} of {} data bytes",
                used_extent + free_extent,
                h.byte_capacity
            ));
        }

        // Time ring: exactly the live regions, sorted, no reserved ones.
        if h.ring_len != live {
            issues.push(format!(
                "time index holds {} entries for {live} live regions",
                h.ring_len
            ));
        }
        let mut prev = None;
        for pos in 0..h.ring_len {
            let slot = view.ring_slot(pos);
            if view.slots()[slot as usize].state != SLOT_LIVE {
                issues.push(format!("time index entry {pos} points at non-live slot {slot}"));
                continue;
            }
            let key = view.slot_key(slot);
            if let Some(p) = prev {
                if key < p {
                    issues.push(format!("time index out of order at position {pos}"));
                }
            }
            prev = Some(key);
        }

        // Signature table holds exactly live + reserved entries.
        let sig_count = view.sig_count();
        if sig_count != live + reserved {
            issues.push(format!(
                "signature index holds {sig_count} entries for {} regions",
                live + reserved
            ));
        }

        let verdict = if !issues.is_empty() {
            CheckVerdict::Corrupt
        } else if h.writer_count > expected_writers {
            CheckVerdict::WriterCountNonZero
        } else {
            CheckVerdict::Clean
        };

        Ok(CheckReport {
            verdict,
            products: live,
            reserved,
            writer_count: h.writer_count,
            issues,
        })
    }
}
