// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sequencer: cursor-driven, class-filtered iteration over live regions.
//!
//! Each open handle carries its own cursor, the `(insertion time, offset)`
//! key of the last examined region. The offset tie-break makes the order
//! total, so a reader that persists its cursor key resumes after a restart
//! without skipping or repeating a product.
//!
//! Examination always advances the cursor, match or not; a reader that
//! loops `sequence(Gt, ...)` therefore walks every live region exactly
//! once and ends with `End`, at which point it typically parks in
//! [`ProductQueue::suspend`] until a writer's commit raises `SIGCONT`.

use super::layout::SLOT_LIVE;
use super::timeindex::TimeKey;
use super::view::View;
use super::{CursorPos, ProductQueue, QueueError, Result};
use crate::process::signals;
use crate::product::{xdr, ProductClass, ProductInfo, Signature, Timestamp};

/// Cursor relation for [`ProductQueue::sequence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The newest region ordered strictly before the cursor.
    Lt,
    /// The first region at exactly the cursor time (offset tie-break
    /// applies).
    Eq,
    /// The first region ordered strictly after the cursor.
    Gt,
}

impl ProductQueue {
    /// Position the cursor at a time; the offset tie-break resets to zero.
    pub fn set_cursor(&self, time: Timestamp) {
        *self.cursor.lock() = CursorPos { time, offset: 0 };
    }

    /// Set the offset tie-break, e.g. to resume past a specific region
    /// among several with the same insertion time.
    pub fn set_cursor_offset(&self, offset: u64) {
        self.cursor.lock().offset = offset;
    }

    /// Current cursor key.
    pub fn get_cursor(&self) -> (Timestamp, u64) {
        let c = self.cursor.lock();
        (c.time, c.offset)
    }

    /// Position the cursor at a live product's own key.
    pub fn set_cursor_by_signature(&self, signature: &Signature) -> Result<()> {
        self.ensure_readable()?;
        let _guard = self.lock_header(false)?;
        let view = self.view();
        match view.sig_lookup(signature.as_bytes()) {
            Some(slot) if view.slots()[slot as usize].state == SLOT_LIVE => {
                let key = view.slot_key(slot);
                *self.cursor.lock() = CursorPos {
                    time: key.time,
                    offset: key.offset,
                };
                Ok(())
            }
            _ => Err(QueueError::NotFound),
        }
    }

    /// Examine the next region the direction selects and advance the
    /// cursor to it.
    ///
    /// If the region matches `class`, `f` runs over its decoded info and
    /// data and its return value comes back as `Some`; a region that fails
    /// the class filter yields `Ok(None)` with the cursor advanced past
    /// it. `End` when no region lies in the requested direction.
    pub fn sequence<R>(
        &self,
        direction: Direction,
        class: &ProductClass,
        f: impl FnOnce(&ProductInfo, &[u8]) -> R,
    ) -> Result<Option<R>> {
        match self.locate_and_pin(direction, class)? {
            Located::NoMatch => Ok(None),
            Located::Pinned { offset, extent } => {
                let result = self.run_over_region(offset, extent, f);
                self.unpin_region(offset);
                result.map(Some)
            }
        }
    }

    /// Like [`sequence`](Self::sequence), but a matched region stays
    /// pinned against eviction; the returned offset must eventually go to
    /// [`release`](Self::release).
    pub fn sequence_lock<R>(
        &self,
        direction: Direction,
        class: &ProductClass,
        f: impl FnOnce(&ProductInfo, &[u8]) -> R,
    ) -> Result<Option<(R, u64)>> {
        match self.locate_and_pin(direction, class)? {
            Located::NoMatch => Ok(None),
            Located::Pinned { offset, extent } => {
                match self.run_over_region(offset, extent, f) {
                    Ok(r) => Ok(Some((r, offset))),
                    Err(e) => {
                        self.unpin_region(offset);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Release a region pinned by [`sequence_lock`](Self::sequence_lock).
    pub fn release(&self, offset: u64) {
        self.unpin_region(offset);
    }

    /// Streaming read: sequence repeatedly until a region matches and `f`
    /// has run over it, or the end of the queue is reached.
    ///
    /// With `keep_locked` the matched region stays pinned and its offset
    /// is returned for a later [`release`](Self::release).
    pub fn next<R>(
        &self,
        reverse: bool,
        class: &ProductClass,
        keep_locked: bool,
        mut f: impl FnMut(&ProductInfo, &[u8]) -> R,
    ) -> Result<(R, Option<u64>)> {
        let direction = if reverse { Direction::Lt } else { Direction::Gt };
        loop {
            if keep_locked {
                if let Some((r, offset)) = self.sequence_lock(direction, class, &mut f)? {
                    return Ok((r, Some(offset)));
                }
            } else if let Some(r) = self.sequence(direction, class, &mut f)? {
                return Ok((r, None));
            }
        }
    }

    /// Sequence-and-delete: the matched region is removed from the queue.
    ///
    /// Skips regions pinned by readers. With `wait`, parks in
    /// [`suspend`](Self::suspend) at the end of the queue and retries when
    /// woken; otherwise `End` surfaces to the caller.
    pub fn seqdel(
        &self,
        direction: Direction,
        class: &ProductClass,
        wait: bool,
    ) -> Result<(ProductInfo, u64)> {
        self.ensure_writable()?;
        loop {
            let guard = self.lock_header(true)?;
            let view = self.view();
            match self.locate(&view, direction) {
                Err(QueueError::End) if wait => {
                    drop(guard);
                    self.suspend(30);
                    continue;
                }
                Err(e) => return Err(e),
                Ok(slot) => {
                    let key = view.slot_key(slot);
                    *self.cursor.lock() = CursorPos {
                        time: key.time,
                        offset: key.offset,
                    };
                    let (offset, extent) = {
                        let s = &view.slots()[slot as usize];
                        (s.offset, s.extent)
                    };
                    if !self.class_matches(&view, slot, class)? {
                        continue;
                    }
                    if self.region_is_pinned(offset, extent)? {
                        // A pinned match is left alone; the scan moves on.
                        continue;
                    }
                    let bytes = view.data(offset, extent);
                    let (info, _) = xdr::decode_product(bytes)
                        .map_err(|e| self.corrupt(format!("live region fails to decode: {e}")))?;
                    self.remove_live(&view, slot)?;
                    return Ok((info, extent));
                }
            }
        }
    }

    /// Position the cursor at the most recent region matching `class`.
    ///
    /// Returns the insertion time found; `End` when nothing matches.
    pub fn last(&self, class: &ProductClass) -> Result<Timestamp> {
        self.ensure_readable()?;
        let _guard = self.lock_header(false)?;
        let view = self.view();
        let len = view.ring_len();
        let mut pos = len;
        while pos > 0 {
            pos -= 1;
            let slot = view.ring_slot(pos);
            let key = view.slot_key(slot);
            if !class.time_matches(key.time) {
                continue;
            }
            if self.class_matches(&view, slot, class)? {
                *self.cursor.lock() = CursorPos {
                    time: key.time,
                    offset: key.offset,
                };
                return Ok(key.time);
            }
        }
        Err(QueueError::End)
    }

    /// Narrow `class.from` to the insertion time of the most recent
    /// matching region, so a subsequent subscription starts there.
    pub fn clss_setfrom(&self, class: &mut ProductClass) -> Result<()> {
        let time = self.last(class)?;
        class.from = time;
        Ok(())
    }

    /// Block until `SIGCONT` arrives (a producer committed) or `seconds`
    /// elapse; zero means no deadline. Returns true when woken by a
    /// signal. May return spuriously; callers re-check their condition.
    pub fn suspend(&self, seconds: u32) -> bool {
        signals::suspend(seconds, &[])
    }

    // ----- internals -----

    /// Find the slot the direction selects relative to the cursor.
    /// Shared or exclusive header lock held by the caller.
    fn locate(&self, view: &View, direction: Direction) -> Result<u32> {
        let cursor = *self.cursor.lock();
        let key = TimeKey {
            time: cursor.time,
            offset: cursor.offset,
        };
        let len = view.ring_len();
        let pos = match direction {
            Direction::Gt => {
                let p = view.ring_upper_bound(key);
                if p >= len {
                    return Err(QueueError::End);
                }
                p
            }
            Direction::Eq => {
                let p = view.ring_lower_bound(key);
                if p >= len || view.slot_key(view.ring_slot(p)).time != cursor.time {
                    return Err(QueueError::End);
                }
                p
            }
            Direction::Lt => {
                let p = view.ring_lower_bound(key);
                if p == 0 {
                    return Err(QueueError::End);
                }
                p - 1
            }
        };
        Ok(view.ring_slot(pos))
    }

    /// Full class check for a slot: time window, feedtype mask, identity
    /// regex (which requires decoding the region's info header).
    fn class_matches(&self, view: &View, slot: u32, class: &ProductClass) -> Result<bool> {
        let (key, feedtype, offset, extent) = {
            let s = &view.slots()[slot as usize];
            (
                view.slot_key(slot),
                crate::product::Feedtype(s.feedtype),
                s.offset,
                s.extent,
            )
        };
        if !class.time_matches(key.time) {
            return Ok(false);
        }
        if !class.feed_union().intersects(feedtype) {
            return Ok(false);
        }
        let bytes = view.data(offset, extent);
        let (info, _) = xdr::decode_info(bytes)
            .map_err(|e| self.corrupt(format!("live region fails to decode: {e}")))?;
        Ok(class.meta_matches(info.feedtype, &info.ident))
    }

    /// Locate, advance the cursor, apply the class filter, and pin a
    /// matching region before the header lock drops.
    fn locate_and_pin(&self, direction: Direction, class: &ProductClass) -> Result<Located> {
        self.ensure_readable()?;
        let _guard = self.lock_header(false)?;
        let view = self.view();
        let slot = self.locate(&view, direction)?;
        let key = view.slot_key(slot);
        *self.cursor.lock() = CursorPos {
            time: key.time,
            offset: key.offset,
        };
        if !self.class_matches(&view, slot, class)? {
            return Ok(Located::NoMatch);
        }
        let (offset, extent) = {
            let s = &view.slots()[slot as usize];
            (s.offset, s.extent)
        };
        self.pin_region(offset, extent)?;
        Ok(Located::Pinned { offset, extent })
    }

    /// Decode a pinned region and run the consumer callback outside the
    /// header lock.
    fn run_over_region<R>(
        &self,
        offset: u64,
        extent: u64,
        f: impl FnOnce(&ProductInfo, &[u8]) -> R,
    ) -> Result<R> {
        let view = self.view();
        let bytes = view.data(offset, extent);
        let (info, data) = xdr::decode_product(bytes)
            .map_err(|e| self.corrupt(format!("live region fails to decode: {e}")))?;
        Ok(f(&info, data))
    }
}

enum Located {
    NoMatch,
    Pinned { offset: u64, extent: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::product::{Feedtype, Product};
    use crate::queue::{CreateFlags, ProductQueue};

    fn queue(dir: &tempfile::TempDir, bytes: u64, slots: u64) -> ProductQueue {
        ProductQueue::create(dir.path().join("seq.pq"), bytes, slots, 0o600, CreateFlags::default())
            .expect("create queue")
    }

    fn insert(q: &ProductQueue, feed: Feedtype, ident: &str, body: &[u8]) -> ProductInfo {
        let p = Product::new(feed, ident, "seq.host", 0, body.to_vec());
        q.insert_no_signal(&p).expect("insert")
    }

    #[test]
    fn test_forward_scan_visits_all_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = queue(&dir, 1 << 18, 64);
        for i in 0..10 {
            insert(&q, Feedtype::TEXT, &format!("S{i:02}"), format!("body{i}").as_bytes());
        }

        q.set_cursor(Timestamp::ZERO);
        let class = ProductClass::everything();
        let mut seen = Vec::new();
        let mut last_time = Timestamp::ZERO;
        loop {
            match q.sequence(Direction::Gt, &class, |info, _| {
                (info.ident.clone(), info.arrival)
            }) {
                Ok(Some((ident, _))) => {
                    let (t, _) = q.get_cursor();
                    assert!(t >= last_time, "non-decreasing insertion order");
                    last_time = t;
                    seen.push(ident);
                }
                Ok(None) => {}
                Err(QueueError::End) => break,
                Err(e) => panic!("sequence failed: {e}"),
            }
        }
        assert_eq!(seen.len(), 10);
        assert_eq!(seen[0], "S00");
        assert_eq!(seen[9], "S09");
    }

    #[test]
    fn test_class_filter_advances_past_nonmatching() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = queue(&dir, 1 << 18, 64);
        insert(&q, Feedtype::TEXT, "T1", b"a");
        insert(&q, Feedtype::RADAR, "R1", b"b");
        insert(&q, Feedtype::TEXT, "T2", b"c");

        q.set_cursor(Timestamp::ZERO);
        let class = ProductClass::of(Feedtype::RADAR, ".*").expect("class");
        let mut matched = Vec::new();
        let mut examined = 0;
        loop {
            match q.sequence(Direction::Gt, &class, |info, _| info.ident.clone()) {
                Ok(Some(ident)) => {
                    matched.push(ident);
                    examined += 1;
                }
                Ok(None) => examined += 1,
                Err(QueueError::End) => break,
                Err(e) => panic!("sequence failed: {e}"),
            }
        }
        assert_eq!(examined, 3, "cursor advances over non-matching regions");
        assert_eq!(matched, vec!["R1"]);
    }

    #[test]
    fn test_regex_filter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = queue(&dir, 1 << 18, 64);
        insert(&q, Feedtype::GRID, "GFS F000", b"a");
        insert(&q, Feedtype::GRID, "NAM F000", b"b");
        insert(&q, Feedtype::GRID, "GFS F006", b"c");

        q.set_cursor(Timestamp::ZERO);
        let class = ProductClass::of(Feedtype::ANY, "^GFS").expect("class");
        let mut matched = Vec::new();
        loop {
            match q.sequence(Direction::Gt, &class, |info, _| info.ident.clone()) {
                Ok(Some(i)) => matched.push(i),
                Ok(None) => {}
                Err(QueueError::End) => break,
                Err(e) => panic!("{e}"),
            }
        }
        assert_eq!(matched, vec!["GFS F000", "GFS F006"]);
    }

    #[test]
    fn test_next_streams_to_first_match() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = queue(&dir, 1 << 18, 64);
        insert(&q, Feedtype::TEXT, "skip1", b"a");
        insert(&q, Feedtype::TEXT, "skip2", b"b");
        insert(&q, Feedtype::LIGHTNING, "strike", b"c");

        q.set_cursor(Timestamp::ZERO);
        let class = ProductClass::of(Feedtype::LIGHTNING, ".*").expect("class");
        let (ident, lock) = q
            .next(false, &class, false, |info, _| info.ident.clone())
            .expect("next");
        assert_eq!(ident, "strike");
        assert!(lock.is_none());
        assert!(matches!(
            q.next(false, &class, false, |info, _| info.ident.clone()),
            Err(QueueError::End)
        ));
    }

    #[test]
    fn test_sequence_lock_pins_against_eviction() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = ProductQueue::create(
            dir.path().join("seqlock.pq"),
            2048,
            8,
            0o600,
            CreateFlags::default(),
        )
        .expect("create");
        insert(&q, Feedtype::TEXT, "pinme", &vec![b'x'; 800]);
        insert(&q, Feedtype::TEXT, "other", &vec![b'y'; 800]);

        q.set_cursor(Timestamp::ZERO);
        let class = ProductClass::everything();
        let (ident, offset) = q
            .sequence_lock(Direction::Gt, &class, |info, _| info.ident.clone())
            .expect("sequence_lock")
            .expect("matched");
        assert_eq!(ident, "pinme");

        // The pinned region blocks insertion that would need its space.
        let p = Product::new(Feedtype::TEXT, "bump", "h", 0, vec![b'z'; 800]);
        assert!(matches!(q.insert_no_signal(&p), Err(QueueError::NoRoom)));

        q.release(offset);
        q.insert_no_signal(&p).expect("insert after release");
    }

    #[test]
    fn test_cursor_by_signature_and_eq() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = queue(&dir, 1 << 18, 64);
        insert(&q, Feedtype::TEXT, "A", b"a");
        let target = insert(&q, Feedtype::TEXT, "B", b"b");
        insert(&q, Feedtype::TEXT, "C", b"c");

        q.set_cursor_by_signature(&target.signature).expect("cursor");
        let class = ProductClass::everything();
        let got = q
            .sequence(Direction::Eq, &class, |info, _| info.ident.clone())
            .expect("sequence eq");
        assert_eq!(got, Some("B".to_string()));

        // Gt from B's key yields C.
        q.set_cursor_by_signature(&target.signature).expect("cursor");
        let got = q
            .sequence(Direction::Gt, &class, |info, _| info.ident.clone())
            .expect("sequence gt");
        assert_eq!(got, Some("C".to_string()));
    }

    #[test]
    fn test_reverse_scan() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = queue(&dir, 1 << 18, 64);
        insert(&q, Feedtype::TEXT, "one", b"a");
        insert(&q, Feedtype::TEXT, "two", b"b");
        insert(&q, Feedtype::TEXT, "three", b"c");

        q.set_cursor(Timestamp::MAX);
        let class = ProductClass::everything();
        let mut seen = Vec::new();
        loop {
            match q.sequence(Direction::Lt, &class, |info, _| info.ident.clone()) {
                Ok(Some(i)) => seen.push(i),
                Ok(None) => {}
                Err(QueueError::End) => break,
                Err(e) => panic!("{e}"),
            }
        }
        assert_eq!(seen, vec!["three", "two", "one"]);
    }

    #[test]
    fn test_last_and_setfrom() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = queue(&dir, 1 << 18, 64);
        insert(&q, Feedtype::TEXT, "t-old", b"a");
        insert(&q, Feedtype::RADAR, "r-mid", b"b");
        insert(&q, Feedtype::TEXT, "t-new", b"c");

        let mut class = ProductClass::of(Feedtype::RADAR, ".*").expect("class");
        let t = q.last(&class).expect("last");
        // Cursor sits on the radar product; Eq re-reads it.
        let got = q
            .sequence(Direction::Eq, &ProductClass::everything(), |info, _| {
                info.ident.clone()
            })
            .expect("eq");
        assert_eq!(got, Some("r-mid".to_string()));

        q.clss_setfrom(&mut class).expect("setfrom");
        assert_eq!(class.from, t);

        let none = ProductClass::of(Feedtype::EXP, ".*").expect("class");
        assert!(matches!(q.last(&none), Err(QueueError::End)));
    }

    #[test]
    fn test_seqdel_removes_matches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = queue(&dir, 1 << 18, 64);
        insert(&q, Feedtype::TEXT, "keep", b"a");
        insert(&q, Feedtype::RADAR, "toss", b"b");

        q.set_cursor(Timestamp::ZERO);
        let class = ProductClass::of(Feedtype::RADAR, ".*").expect("class");
        let (info, extent) = q.seqdel(Direction::Gt, &class, false).expect("seqdel");
        assert_eq!(info.ident, "toss");
        assert!(extent > 0);
        assert_eq!(q.stats().expect("stats").products, 1);

        q.set_cursor(Timestamp::ZERO);
        assert!(matches!(
            q.seqdel(Direction::Gt, &class, false),
            Err(QueueError::End)
        ));
    }

    #[test]
    fn test_empty_queue_sequences_end() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = queue(&dir, 1 << 16, 16);
        q.set_cursor(Timestamp::ZERO);
        let class = ProductClass::everything();
        assert!(matches!(
            q.sequence(Direction::Gt, &class, |_, _| ()),
            Err(QueueError::End)
        ));
        assert!(matches!(
            q.sequence(Direction::Lt, &class, |_, _| ()),
            Err(QueueError::End)
        ));
    }
}
