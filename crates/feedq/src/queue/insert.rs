// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Insertion engine: the two-phase reserve -> write -> commit-or-discard
//! protocol, duplicate detection, and oldest-first eviction.
//!
//! Protocol ordering inside a single writer:
//!
//! 1. take the exclusive header lock
//! 2. signature probe; a hit (live or pending) is `Dup`
//! 3. allocate a region, evicting oldest unlocked live regions as needed
//! 4. record the tentative signature -> region binding, slot RESERVED
//! 5. drop the header lock; the caller copies product bytes
//! 6. re-take the header lock; slot LIVE, stamp insertion time, index
//! 7. drop the lock, optionally wake the process group with SIGCONT
//!
//! Step 2 under the lock makes duplicate detection authoritative against
//! committed regions; step 4's tentative entry extends it to concurrent
//! reservations. A reserved region is invisible to sequencing and to
//! signature reads until step 6.

use super::layout::{region_extent, NIL, SLOT_LIVE, SLOT_RESERVED};
use super::locks;
use super::view::View;
use super::{ProductQueue, QueueError, Result};
use crate::product::{xdr, Product, ProductInfo, Signature, Timestamp};

/// A pending reservation: exclusive write access to one region.
///
/// The holder must eventually [`ProductQueue::commit`] or
/// [`ProductQueue::discard`] it. A reservation abandoned by a crashed
/// process is detected by its RESERVED slot state and released at the next
/// writable open.
#[derive(Debug)]
pub struct Reservation {
    pub(crate) slot: u32,
    pub(crate) offset: u64,
    pub(crate) extent: u64,
    pub(crate) size: u32,
    pub(crate) signature: Signature,
    ptr: *mut u8,
}

// SAFETY: the pointer targets the shared mapping, to which the reservation
// conveys exclusive write access for `size` bytes; moving that access to
// another thread is sound.
unsafe impl Send for Reservation {}

impl Reservation {
    /// Bytes reserved for the product's encoded form.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Region offset inside the data area (the cursor tie-break key).
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// The writable region window.
    ///
    /// Valid for the lifetime of the queue handle the reservation came
    /// from; the reservation protocol guarantees no other writer touches
    /// this range.
    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: ptr/size were derived from the mapping while the region
        // was reserved to this holder; see type-level contract.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size as usize) }
    }
}

impl ProductQueue {
    /// Reserve `size` bytes for a product with the given signature.
    ///
    /// # Errors
    ///
    /// - `Dup` -- the signature is already live or reserved
    /// - `TooBig` -- `size` exceeds the data-area capacity
    /// - `NoRoom` -- eviction is blocked because the oldest live regions
    ///   are all locked by readers
    pub fn reserve(&self, size: u32, signature: &Signature) -> Result<Reservation> {
        self.ensure_writable()?;
        let extent = region_extent(u64::from(size));
        if u64::from(size) > self.data_capacity() {
            return Err(QueueError::TooBig {
                size: u64::from(size),
                capacity: self.data_capacity(),
            });
        }

        let guard = self.lock_header(true)?;
        let view = self.view();

        if let Some(slot) = view.sig_lookup(signature.as_bytes()) {
            let state = view.slots()[slot as usize].state;
            if state == SLOT_LIVE || state == SLOT_RESERVED {
                log::debug!("reserve: duplicate signature {signature}");
                return Err(QueueError::Dup);
            }
        }

        // Slot exhaustion takes the same eviction path as byte
        // exhaustion: evict-oldest until both a slot and a fitting
        // extent exist.
        let (offset, got_extent) = loop {
            if view.header().slot_free_head == NIL {
                self.evict_oldest(&view)?;
                continue;
            }
            if let Some(got) = view.free_alloc(extent) {
                break got;
            }
            self.evict_oldest(&view)?;
        };

        let Some(slot) = self.take_slot(&view) else {
            // A free slot existed when the loop broke; losing it here
            // means the accounting is broken.
            return Err(self.corrupt("free-slot chain emptied underneath a reservation"));
        };

        {
            let s = &mut view.slots_mut()[slot as usize];
            s.offset = offset;
            s.extent = got_extent;
            s.signature = *signature.as_bytes();
            s.time_sec = 0;
            s.time_usec = 0;
            s.feedtype = 0;
            s.ident_len = 0;
            s.state = SLOT_RESERVED;
            s.next_free = NIL;
        }
        if !view.sig_insert(signature.as_bytes(), slot) {
            return Err(self.corrupt("signature table full"));
        }

        let h = view.header_mut();
        h.bytes_used += got_extent;
        update_watermarks(&view);
        drop(guard);

        // The region [offset, offset+extent) now belongs to this
        // reservation alone; data_mut() re-derives the slice from it.
        let ptr = self.view_data_ptr(offset);
        Ok(Reservation {
            slot,
            offset,
            extent: got_extent,
            size,
            signature: *signature,
            ptr,
        })
    }

    /// Commit a reservation: the region becomes live and visible.
    ///
    /// The region's XDR info header is decoded as a consistency check; an
    /// encoded form longer than the reservation is `TooBig` and the
    /// reservation is discarded. `signal` wakes the process group.
    pub fn commit(&self, res: Reservation, signal: bool) -> Result<ProductInfo> {
        self.ensure_writable()?;
        let guard = self.lock_header(true)?;
        let view = self.view();

        {
            let s = &view.slots()[res.slot as usize];
            if s.state != SLOT_RESERVED || s.offset != res.offset {
                return Err(QueueError::NotFound);
            }
        }

        // Decode the info header back out of the region; its size field is
        // the authoritative data length.
        let bytes = view.data(res.offset, u64::from(res.size));
        let info = match xdr::decode_info(bytes) {
            Ok((info, hdr_len)) => {
                let encoded = hdr_len as u64 + u64::from(info.size);
                if encoded > res.extent {
                    drop(guard);
                    let size = encoded;
                    self.discard(res)?;
                    return Err(QueueError::TooBig {
                        size,
                        capacity: self.data_capacity(),
                    });
                }
                info
            }
            Err(e) => {
                drop(guard);
                let reason = e.to_string();
                self.discard(res)?;
                return Err(QueueError::Inval(format!(
                    "region does not decode as a product: {reason}"
                )));
            }
        };

        // Stamp the insertion time under the lock. The clamp to the newest
        // indexed time keeps commit times non-decreasing even if the system
        // clock steps backwards.
        let mut now = Timestamp::now();
        if let Some(newest) = view.newest_time() {
            if now < newest {
                now = newest;
            }
        }

        {
            let s = &mut view.slots_mut()[res.slot as usize];
            s.time_sec = now.sec;
            s.time_usec = now.usec;
            s.feedtype = info.feedtype.bits();
            s.ident_len = info.ident.len() as u16;
            s.state = SLOT_LIVE;
        }
        view.ring_insert(res.slot);

        let h = view.header_mut();
        h.products += 1;
        h.mutation_count += 1;
        update_watermarks(&view);
        drop(guard);

        log::debug!(
            "committed {} ({} bytes, feed {})",
            info.ident,
            info.size,
            info.feedtype
        );
        if signal {
            signal_process_group();
        }
        Ok(info)
    }

    /// Release a reservation without committing. No signal is sent and the
    /// queue state is as if the reservation never happened.
    pub fn discard(&self, res: Reservation) -> Result<()> {
        self.ensure_writable()?;
        let _guard = self.lock_header(true)?;
        let view = self.view();

        {
            let s = &view.slots()[res.slot as usize];
            if s.state != SLOT_RESERVED || s.offset != res.offset {
                return Err(QueueError::NotFound);
            }
        }
        view.sig_remove(res.signature.as_bytes());
        self.put_slot(&view, res.slot);
        if !view.free_release(res.offset, res.extent) {
            return Err(self.corrupt("free table overflow on discard"));
        }
        let h = view.header_mut();
        h.bytes_used -= res.extent;
        update_watermarks(&view);
        Ok(())
    }

    /// One-shot insertion: reserve, encode, commit, and wake the group.
    pub fn insert(&self, product: &Product) -> Result<ProductInfo> {
        self.insert_internal(product, true)
    }

    /// One-shot insertion without the wakeup signal. Used by the backstop
    /// path, where waking every reader for each recovered product would
    /// stampede the host.
    pub fn insert_no_signal(&self, product: &Product) -> Result<ProductInfo> {
        self.insert_internal(product, false)
    }

    fn insert_internal(&self, product: &Product, signal: bool) -> Result<ProductInfo> {
        let total = xdr::product_encoded_len(&product.info);
        if total > u32::MAX as usize {
            return Err(QueueError::TooBig {
                size: total as u64,
                capacity: self.data_capacity(),
            });
        }
        let mut res = self.reserve(total as u32, &product.info.signature)?;
        if let Err(e) = xdr::encode_product(&product.info, &product.data, res.data_mut()) {
            let reason = e.to_string();
            self.discard(res)?;
            return Err(QueueError::Inval(reason));
        }
        self.commit(res, signal)
    }

    /// Remove a live product by signature.
    ///
    /// # Errors
    ///
    /// - `NotFound` -- no live region carries this signature
    /// - `Locked` -- a reader has the region pinned
    pub fn delete_by_signature(&self, signature: &Signature) -> Result<()> {
        self.ensure_writable()?;
        let _guard = self.lock_header(true)?;
        let view = self.view();

        let slot = match view.sig_lookup(signature.as_bytes()) {
            Some(s) if view.slots()[s as usize].state == SLOT_LIVE => s,
            _ => return Err(QueueError::NotFound),
        };
        let (offset, extent) = {
            let s = &view.slots()[slot as usize];
            (s.offset, s.extent)
        };
        if self.region_is_pinned(offset, extent)? {
            return Err(QueueError::Locked);
        }
        self.remove_live(&view, slot)?;
        Ok(())
    }

    /// Run `f` over a live product's info and bytes, holding the region
    /// pinned against eviction for the duration.
    pub fn process_by_signature<R>(
        &self,
        signature: &Signature,
        f: impl FnOnce(&ProductInfo, &[u8]) -> R,
    ) -> Result<R> {
        self.ensure_readable()?;
        let guard = self.lock_header(false)?;
        let view = self.view();

        let slot = match view.sig_lookup(signature.as_bytes()) {
            Some(s) if view.slots()[s as usize].state == SLOT_LIVE => s,
            _ => return Err(QueueError::NotFound),
        };
        let (offset, extent) = {
            let s = &view.slots()[slot as usize];
            (s.offset, s.extent)
        };
        self.pin_region(offset, extent)?;
        drop(guard);

        let result: Result<R> = (|| {
            let view = self.view();
            let bytes = view.data(offset, extent);
            let (info, data) = xdr::decode_product(bytes)
                .map_err(|e| self.corrupt(format!("live region fails to decode: {e}")))?;
            Ok(f(&info, data))
        })();
        self.unpin_region(offset);
        result
    }

    // ----- eviction -----

    /// Evict the oldest live region.
    ///
    /// Strictly oldest-first: if the oldest live region is locked by a
    /// reader, the insertion fails with `NoRoom` rather than evicting a
    /// younger region in its place. Callers depend on never losing a
    /// younger product while an older one is pinned.
    fn evict_oldest(&self, view: &View) -> Result<()> {
        if view.ring_len() == 0 {
            return Err(QueueError::NoRoom);
        }
        let slot = view.ring_slot(0);
        let (offset, extent, inserted) = {
            let s = &view.slots()[slot as usize];
            (
                s.offset,
                s.extent,
                Timestamp {
                    sec: s.time_sec,
                    usec: s.time_usec,
                },
            )
        };
        if self.region_is_pinned(offset, extent)? {
            log::warn!("insertion blocked: oldest live region at {offset} is locked");
            return Err(QueueError::NoRoom);
        }

        // Minimum virtual residence time: how briefly did the product we
        // are about to destroy live in the queue?
        let vrt = inserted.delta_usecs(Timestamp::now());
        let h = view.header_mut();
        if h.mvrt_set == 0 || vrt < h.mvrt_usecs {
            h.mvrt_usecs = vrt;
            h.mvrt_bytes = h.bytes_used;
            h.mvrt_slots = h.slots_used;
            h.mvrt_set = 1;
        }

        self.remove_live(view, slot)?;
        log::debug!("evicted region at {offset} ({extent} bytes, vrt {vrt}us)");
        Ok(())
    }

    /// Drop a live region out of every structure. Exclusive lock held.
    pub(crate) fn remove_live(&self, view: &View, slot: u32) -> Result<()> {
        let (offset, extent, sig) = {
            let s = &view.slots()[slot as usize];
            (s.offset, s.extent, s.signature)
        };
        view.sig_remove(&sig);
        if !view.ring_remove_slot(slot) {
            return Err(self.corrupt("live region missing from time index"));
        }
        self.put_slot(view, slot);
        if !view.free_release(offset, extent) {
            return Err(self.corrupt("free table overflow on removal"));
        }
        let h = view.header_mut();
        h.products -= 1;
        h.bytes_used -= extent;
        h.mutation_count += 1;
        update_watermarks(view);
        Ok(())
    }

    fn take_slot(&self, view: &View) -> Option<u32> {
        let head = view.header().slot_free_head;
        if head == NIL {
            return None;
        }
        let next = view.slots()[head as usize].next_free;
        let h = view.header_mut();
        h.slot_free_head = next;
        h.slots_used += 1;
        Some(head)
    }

    fn put_slot(&self, view: &View, slot: u32) {
        {
            let h = view.header();
            let s = &mut view.slots_mut()[slot as usize];
            s.state = super::layout::SLOT_FREE;
            s.next_free = h.slot_free_head;
        }
        let h = view.header_mut();
        h.slot_free_head = slot;
        h.slots_used -= 1;
    }

    // ----- region pinning -----

    /// Is the region pinned, either by this process or by a shared lock
    /// from another open file description?
    pub(crate) fn region_is_pinned(&self, offset: u64, extent: u64) -> Result<bool> {
        if self.pins.lock().contains_key(&offset) {
            return Ok(true);
        }
        if self.nolock() {
            return Ok(false);
        }
        let start = (self.layout().data_off + offset) as i64;
        let len = extent.max(1) as i64;
        // Probe with a non-blocking exclusive attempt; success means no
        // other description holds the region.
        if locks::lock_exclusive(self.lock_file(), start, len, false)? {
            locks::unlock(self.lock_file(), start, len)?;
            Ok(false)
        } else {
            Ok(true)
        }
    }

    /// Pin a region against eviction: in-process refcount plus a shared
    /// byte-range lock visible to other processes.
    pub(crate) fn pin_region(&self, offset: u64, extent: u64) -> Result<()> {
        let mut pins = self.pins.lock();
        let entry = pins
            .entry(offset)
            .or_insert(super::PinEntry { count: 0, extent });
        entry.count += 1;
        if entry.count == 1 && !self.nolock() {
            let start = (self.layout().data_off + offset) as i64;
            let len = extent.max(1) as i64;
            if let Err(e) = locks::lock_shared(self.lock_file(), start, len, true) {
                pins.remove(&offset);
                return Err(e.into());
            }
        }
        Ok(())
    }

    pub(crate) fn unpin_region(&self, offset: u64) {
        let mut pins = self.pins.lock();
        let extent = match pins.get_mut(&offset) {
            Some(entry) if entry.count > 1 => {
                entry.count -= 1;
                return;
            }
            Some(entry) => {
                let extent = entry.extent;
                pins.remove(&offset);
                extent
            }
            None => {
                log::warn!("unpin of region {offset} that is not pinned");
                return;
            }
        };
        if !self.nolock() {
            let start = (self.layout().data_off + offset) as i64;
            let len = extent.max(1) as i64;
            if let Err(e) = locks::unlock(self.lock_file(), start, len) {
                log::warn!("region unlock at {offset} failed: {e}");
            }
        }
    }

    fn view_data_ptr(&self, offset: u64) -> *mut u8 {
        self.view().data_mut(offset, 0).as_mut_ptr()
    }
}

/// Refresh the watermark counters after any accounting change. Exclusive
/// header lock held by the caller.
fn update_watermarks(view: &View) {
    let h = view.header_mut();
    h.max_products = h.max_products.max(h.products);
    h.max_bytes_used = h.max_bytes_used.max(h.bytes_used);
    h.max_free_regions = h.max_free_regions.max(h.free_count);
    let empty = h.slot_capacity - h.slots_used;
    h.min_empty_slots = h.min_empty_slots.min(empty);
}

/// Release reservations abandoned by dead writers. Called at writable open
/// with the exclusive header lock held; returns the count released.
pub(crate) fn recover_reservations(view: &View) -> usize {
    let mut recovered = Vec::new();
    for (i, s) in view.slots().iter().enumerate() {
        if s.state == SLOT_RESERVED {
            recovered.push((i as u32, s.offset, s.extent, s.signature));
        }
    }
    for &(slot, offset, extent, ref sig) in &recovered {
        view.sig_remove(sig);
        // Free the slot by hand; the chain surgery mirrors put_slot but
        // without a queue handle.
        {
            let h = view.header();
            let s = &mut view.slots_mut()[slot as usize];
            s.state = super::layout::SLOT_FREE;
            s.next_free = h.slot_free_head;
        }
        {
            let h = view.header_mut();
            h.slot_free_head = slot;
            h.slots_used -= 1;
            h.bytes_used -= extent;
        }
        if !view.free_release(offset, extent) {
            log::error!("recovery could not return region at {offset} to the free table");
        }
    }
    recovered.len()
}

/// Wake every process in our process group blocked in `suspend`.
pub(crate) fn signal_process_group() {
    // SAFETY: kill(0, SIGCONT) signals the caller's own process group;
    // SIGCONT's disposition in cooperating processes is a no-op handler
    // used purely as a wakeup.
    unsafe {
        libc::kill(0, libc::SIGCONT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::product::Feedtype;
    use crate::queue::{CreateFlags, OpenFlags};

    fn small_queue(dir: &tempfile::TempDir) -> ProductQueue {
        ProductQueue::create(
            dir.path().join("ins.pq"),
            1 << 16,
            32,
            0o600,
            CreateFlags::default(),
        )
        .expect("create queue")
    }

    fn product(ident: &str, data: &[u8]) -> Product {
        Product::new(Feedtype::TEXT, ident, "test.host", 0, data.to_vec())
    }

    #[test]
    fn test_insert_then_read_back_identical() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = small_queue(&dir);
        let p = product("A1", b"first product body");
        q.insert_no_signal(&p).expect("insert");
        let got = q
            .process_by_signature(&p.info.signature, |info, data| {
                (info.clone(), data.to_vec())
            })
            .expect("process");
        assert_eq!(got.0.ident, "A1");
        assert_eq!(got.0.signature, p.info.signature);
        assert_eq!(got.1, p.data);
    }

    #[test]
    fn test_duplicate_insert_rejected_and_state_unchanged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = small_queue(&dir);
        let p = product("A1", b"payload");
        q.insert_no_signal(&p).expect("insert");
        let before = q.stats().expect("stats");
        assert!(matches!(q.insert_no_signal(&p), Err(QueueError::Dup)));
        let after = q.stats().expect("stats");
        assert_eq!(before.products, after.products);
        assert_eq!(before.bytes_used, after.bytes_used);
    }

    #[test]
    fn test_reserve_discard_restores_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = small_queue(&dir);
        let before = q.stats().expect("stats");
        let sig = Signature::of(b"pending");
        let res = q.reserve(128, &sig).expect("reserve");
        // Reserved is invisible to reads but poisons duplicates.
        assert!(matches!(
            q.process_by_signature(&sig, |_, _| ()),
            Err(QueueError::NotFound)
        ));
        assert!(matches!(q.reserve(64, &sig), Err(QueueError::Dup)));
        q.discard(res).expect("discard");
        let after = q.stats().expect("stats");
        assert_eq!(before.products, after.products);
        assert_eq!(before.bytes_used, after.bytes_used);
        assert_eq!(before.empty_slots, after.empty_slots);
        // And the signature is insertable again.
        let res = q.reserve(64, &sig).expect("re-reserve");
        q.discard(res).expect("discard again");
    }

    #[test]
    fn test_dup_detection_across_two_handles() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("two.pq");
        let a = ProductQueue::create(&path, 1 << 16, 32, 0o600, CreateFlags::default())
            .expect("create");
        let b = ProductQueue::open(&path, OpenFlags::default()).expect("open");

        let sig = Signature::of(b"X");
        let res_a = a.reserve(500, &sig).expect("reserve via a");
        assert!(matches!(b.reserve(500, &sig), Err(QueueError::Dup)));
        a.discard(res_a).expect("discard");
        let res_b = b.reserve(500, &sig).expect("retry via b");
        b.discard(res_b).expect("discard");
    }

    #[test]
    fn test_delete_by_signature_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = small_queue(&dir);
        let before = q.stats().expect("stats");
        let p = product("D1", b"to delete");
        q.insert_no_signal(&p).expect("insert");
        q.delete_by_signature(&p.info.signature).expect("delete");
        let after = q.stats().expect("stats");
        assert_eq!(before.products, after.products);
        assert_eq!(before.bytes_used, after.bytes_used);
        assert!(matches!(
            q.delete_by_signature(&p.info.signature),
            Err(QueueError::NotFound)
        ));
    }

    #[test]
    fn test_too_big_rejected_regardless_of_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = small_queue(&dir);
        let cap = q.data_capacity();
        let sig = Signature::of(b"huge");
        let err = q.reserve((cap + 1) as u32, &sig).unwrap_err();
        assert!(matches!(err, QueueError::TooBig { .. }));
    }

    #[test]
    fn test_fill_evicts_exactly_oldest() {
        let dir = tempfile::tempdir().expect("tempdir");
        // Room for ~4 regions of 1000 encoded bytes in 4096.
        let q = ProductQueue::create(
            dir.path().join("evict.pq"),
            4096,
            32,
            0o600,
            CreateFlags::default(),
        )
        .expect("create");

        let mut sigs = Vec::new();
        for i in 0..4 {
            let p = product(&format!("P{i}"), &vec![b'x'; 900]);
            q.insert_no_signal(&p).expect("insert");
            sigs.push(p.info.signature);
        }
        assert_eq!(q.stats().expect("stats").products, 4);

        // A fifth insertion evicts only the oldest.
        let p = product("P4", &vec![b'y'; 900]);
        q.insert_no_signal(&p).expect("insert evicting");
        assert!(matches!(
            q.process_by_signature(&sigs[0], |_, _| ()),
            Err(QueueError::NotFound)
        ));
        for sig in &sigs[1..] {
            q.process_by_signature(sig, |_, _| ()).expect("survivor");
        }
        let st = q.stats().expect("stats");
        assert!(st.mvrt.is_some(), "eviction sets the MVRT block");
    }

    #[test]
    fn test_slot_exhaustion_evicts_oldest() {
        let dir = tempfile::tempdir().expect("tempdir");
        // Plenty of bytes, only 4 slots: the slot ring is the limit.
        let q = ProductQueue::create(
            dir.path().join("slots.pq"),
            1 << 16,
            4,
            0o600,
            CreateFlags::default(),
        )
        .expect("create");

        let mut sigs = Vec::new();
        for i in 0..4 {
            let p = product(&format!("S{i}"), b"tiny");
            q.insert_no_signal(&p).expect("insert");
            sigs.push(p.info.signature);
        }
        let p = product("S4", b"tiny5");
        q.insert_no_signal(&p).expect("insert past slot capacity");

        let st = q.stats().expect("stats");
        assert_eq!(st.products, 4);
        assert!(matches!(
            q.process_by_signature(&sigs[0], |_, _| ()),
            Err(QueueError::NotFound)
        ));
        q.process_by_signature(&sigs[1], |_, _| ()).expect("survivor");
    }

    #[test]
    fn test_locked_oldest_blocks_insertion() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = ProductQueue::create(
            dir.path().join("pin.pq"),
            2048,
            8,
            0o600,
            CreateFlags::default(),
        )
        .expect("create");

        let p0 = product("OLD", &vec![b'a'; 800]);
        let p1 = product("NEW", &vec![b'b'; 800]);
        q.insert_no_signal(&p0).expect("insert old");
        q.insert_no_signal(&p1).expect("insert new");

        // Pin the oldest; the next insertion must fail rather than evict
        // the younger region.
        let offset_extent = {
            let _g = q.lock_header(false).expect("lock");
            let v = q.view();
            let slot = v.sig_lookup(p0.info.signature.as_bytes()).expect("slot");
            let s = &v.slots()[slot as usize];
            (s.offset, s.extent)
        };
        q.pin_region(offset_extent.0, offset_extent.1).expect("pin");

        let p2 = product("BLOCKED", &vec![b'c'; 800]);
        assert!(matches!(q.insert_no_signal(&p2), Err(QueueError::NoRoom)));
        q.process_by_signature(&p1.info.signature, |_, _| ())
            .expect("younger region survived");

        q.unpin_region(offset_extent.0);
        q.insert_no_signal(&p2).expect("insert after unpin");
    }

    #[test]
    fn test_commit_size_mismatch_too_big() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = small_queue(&dir);
        let p = product("LIAR", b"12345678");
        let total = xdr::product_encoded_len(&p.info);
        // Reserve less than the encoded form claims.
        let mut res = q
            .reserve((total - 4) as u32, &p.info.signature)
            .expect("reserve short");
        let mut scratch = vec![0u8; total];
        xdr::encode_product(&p.info, &p.data, &mut scratch).expect("encode");
        let window = res.data_mut();
        let n = window.len();
        window.copy_from_slice(&scratch[..n]);
        let err = q.commit(res, false).unwrap_err();
        assert!(matches!(err, QueueError::TooBig { .. }));
        // Auto-discard: signature is free again.
        let res = q.reserve(64, &p.info.signature).expect("reserve after");
        q.discard(res).expect("discard");
    }

    #[test]
    fn test_recovery_releases_dead_reservation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("recover.pq");
        let q = ProductQueue::create(&path, 1 << 16, 16, 0o600, CreateFlags::default())
            .expect("create");
        let sig = Signature::of(b"abandoned");
        let res = q.reserve(256, &sig).expect("reserve");
        // Simulate a crash: leak the reservation and the handle.
        std::mem::forget(res);
        std::mem::forget(q);

        let q = ProductQueue::open(&path, OpenFlags::default()).expect("reopen");
        let st = q.stats().expect("stats");
        assert_eq!(st.products, 0);
        assert_eq!(st.bytes_used, 0);
        // The abandoned signature is usable again.
        let res = q.reserve(256, &sig).expect("reserve after recovery");
        q.discard(res).expect("discard");
    }

    #[test]
    fn test_insertion_time_monotone_per_writer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let q = small_queue(&dir);
        let mut last = Timestamp::ZERO;
        for i in 0..20 {
            let p = product(&format!("M{i}"), format!("body {i}").as_bytes());
            let info = q.insert_no_signal(&p).expect("insert");
            let t = {
                let _g = q.lock_header(false).expect("lock");
                let v = q.view();
                let slot = v.sig_lookup(info.signature.as_bytes()).expect("slot");
                v.slot_key(slot).time
            };
            assert!(t >= last, "commit times must be non-decreasing");
            last = t;
        }
    }
}
