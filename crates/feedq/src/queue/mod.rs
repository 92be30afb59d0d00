// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The product queue: a fixed-size, content-addressed, memory-mapped store
//! shared by every process of the pipeline.
//!
//! # Architecture
//!
//! ```text
//! +-----------+     reserve/commit      +--------------------+
//! | producers | ----------------------> |  queue file (mmap) |
//! +-----------+                         |  header | slots    |
//!       |  SIGCONT on commit            |  sigidx | timering |
//!       v                               |  free   | data     |
//! +-----------+     sequence/suspend    +--------------------+
//! | consumers | <----------------------          ^
//! +-----------+                                  |
//!               advisory byte-range locks -------+
//! ```
//!
//! Cross-process exclusion is an advisory byte-range lock over the header;
//! readers pin individual regions against eviction with shared range locks
//! tied to the open file description, so the kernel reclaims them if a
//! reader dies.

mod check;
mod freelist;
mod insert;
mod layout;
mod locks;
mod map;
mod sequence;
mod sigindex;
mod stats;
mod timeindex;
mod view;

pub use check::{CheckReport, CheckVerdict};
pub use insert::Reservation;
pub use layout::{Layout, MAGIC, PAGE_SIZE, REGION_ALIGN, VERSION};
pub use sequence::Direction;
pub use stats::{MvrtStats, QueueStats};
pub use timeindex::TimeKey;

use crate::product::Timestamp;
use layout::{Header, OLDEST_NONE_SEC, NIL, SLOT_FREE};
use map::FileMapping;
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use view::View;

/// Queue operation failures, classified the way callers react to them.
#[derive(Debug)]
pub enum QueueError {
    /// A product with this signature is already present (or reserved).
    Dup,
    /// Eviction cannot make room because every candidate region is locked.
    NoRoom,
    /// The product exceeds the data-area capacity.
    TooBig { size: u64, capacity: u64 },
    /// No such signature or region.
    NotFound,
    /// The target region is pinned by a reader.
    Locked,
    /// An invariant violation was detected; the queue handle is read-only
    /// until reopened.
    Corrupt(String),
    /// The writer counter was already zero at close.
    CorruptCount,
    /// Sequencer reached the end of the queue.
    End,
    /// Malformed argument (bad class, bad regex, read-only handle, ...).
    Inval(String),
    /// Operating-system failure.
    Sys(io::Error),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dup => write!(f, "duplicate product signature"),
            Self::NoRoom => write!(f, "no room: all evictable regions are locked"),
            Self::TooBig { size, capacity } => {
                write!(f, "product of {size} bytes exceeds queue capacity {capacity}")
            }
            Self::NotFound => write!(f, "no such product"),
            Self::Locked => write!(f, "region is locked by a reader"),
            Self::Corrupt(reason) => write!(f, "queue is corrupt: {reason}"),
            Self::CorruptCount => write!(f, "writer counter was already zero"),
            Self::End => write!(f, "end of queue"),
            Self::Inval(reason) => write!(f, "invalid argument: {reason}"),
            Self::Sys(e) => write!(f, "system error: {e}"),
        }
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sys(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for QueueError {
    fn from(e: io::Error) -> Self {
        QueueError::Sys(e)
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Flags for [`ProductQueue::create`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateFlags(pub u32);

impl CreateFlags {
    /// Replace an existing file instead of failing.
    pub const CLOBBER: CreateFlags = CreateFlags(1);
    /// Allocate the full file up front; the file never grows.
    pub const NOGROW: CreateFlags = CreateFlags(2);
    /// Leave unwritten blocks unallocated on supporting filesystems.
    pub const SPARSE: CreateFlags = CreateFlags(4);

    #[must_use]
    pub fn contains(self, other: CreateFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn union(self, other: CreateFlags) -> CreateFlags {
        CreateFlags(self.0 | other.0)
    }
}

/// Flags for [`ProductQueue::open`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    /// Open without write access; never counts as a writer.
    pub const READONLY: OpenFlags = OpenFlags(1);
    /// Serialize every queue operation behind a reentrant mutex.
    pub const THREADSAFE: OpenFlags = OpenFlags(2);
    /// Skip kernel advisory locking. Dangerous: only sound when outside
    /// coordination guarantees a single process.
    pub const NOLOCK: OpenFlags = OpenFlags(4);
    /// Map region-at-a-time instead of the whole file. Accepted for
    /// address-space-limited builds; on 64-bit targets the whole file is
    /// mapped regardless.
    pub const MAPRGNS: OpenFlags = OpenFlags(8);
    /// Copy-on-write mapping; writes stay process-local. Debug only.
    pub const PRIVATE: OpenFlags = OpenFlags(16);

    #[must_use]
    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn union(self, other: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | other.0)
    }
}

/// Reader cursor: the key of the last examined region.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CursorPos {
    pub time: Timestamp,
    pub offset: u64,
}

/// One pinned region: reference count plus the extent needed to release
/// the kernel byte-range lock.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PinEntry {
    pub count: usize,
    pub extent: u64,
}

/// A shared, persistent product queue handle.
pub struct ProductQueue {
    file: File,
    map: FileMapping,
    path: PathBuf,
    layout: Layout,
    writable: bool,
    nolock: bool,
    /// Set once an invariant violation is detected; all further write
    /// operations fail with `Corrupt` until the queue is reopened.
    poisoned: AtomicBool,
    /// In-process region pins. Advisory file locks on the same open
    /// description do not conflict with each other, so same-process
    /// pinning is tracked here alongside the kernel lock.
    pub(crate) pins: Mutex<HashMap<u64, PinEntry>>,
    pub(crate) cursor: Mutex<CursorPos>,
    ts_guard: Option<ReentrantMutex<()>>,
    closed: AtomicBool,
}

impl ProductQueue {
    /// Create a new queue file with the given data and slot capacities.
    ///
    /// Fails if the file exists unless `CLOBBER` is set. The created queue
    /// is open for writing (it counts as one writer until closed).
    pub fn create<P: AsRef<Path>>(
        path: P,
        byte_capacity: u64,
        slot_capacity: u64,
        mode_bits: u32,
        flags: CreateFlags,
    ) -> Result<ProductQueue> {
        let path = path.as_ref();
        if slot_capacity == 0 || slot_capacity > u64::from(u32::MAX - 1) {
            return Err(QueueError::Inval(format!(
                "slot capacity {slot_capacity} out of range"
            )));
        }
        if byte_capacity < REGION_ALIGN {
            return Err(QueueError::Inval(format!(
                "byte capacity {byte_capacity} below minimum {REGION_ALIGN}"
            )));
        }

        let layout = Layout::compute(byte_capacity, slot_capacity);

        let mut opts = OpenOptions::new();
        opts.read(true).write(true).mode(mode_bits);
        if flags.contains(CreateFlags::CLOBBER) {
            opts.create(true).truncate(true);
        } else {
            opts.create_new(true);
        }
        let file = opts.open(path)?;

        if flags.contains(CreateFlags::SPARSE) && !flags.contains(CreateFlags::NOGROW) {
            file.set_len(layout.total_size)?;
        } else {
            preallocate(&file, layout.total_size)?;
        }

        let map = FileMapping::new(&file, layout.total_size as usize, false, false)?;
        // SAFETY: the mapping covers layout.total_size bytes and no other
        // process can see the file before the header magic is written.
        let view = unsafe { View::new(map.as_ptr(), layout) };
        init_areas(&view);
        map.sync()?;

        log::info!(
            "created queue {} ({} data bytes, {} slots, {} total)",
            path.display(),
            byte_capacity,
            slot_capacity,
            layout.total_size
        );

        let queue = ProductQueue {
            file,
            map,
            path: path.to_path_buf(),
            layout,
            writable: true,
            nolock: false,
            poisoned: AtomicBool::new(false),
            pins: Mutex::new(HashMap::new()),
            cursor: Mutex::new(CursorPos {
                time: Timestamp::ZERO,
                offset: 0,
            }),
            ts_guard: None,
            closed: AtomicBool::new(false),
        };
        {
            let _guard = queue.lock_header(true)?;
            queue.view().header_mut().writer_count = 1;
        }
        Ok(queue)
    }

    /// Open an existing queue.
    ///
    /// A writable open increments the shared writer counter and runs crash
    /// recovery: reservations left behind by dead writers are released and
    /// their tentative signature entries removed.
    pub fn open<P: AsRef<Path>>(path: P, flags: OpenFlags) -> Result<ProductQueue> {
        let path = path.as_ref();
        let readonly = flags.contains(OpenFlags::READONLY);

        let file = if readonly {
            OpenOptions::new().read(true).open(path)?
        } else {
            OpenOptions::new().read(true).write(true).open(path)?
        };

        let header = read_header(&file)?;
        Layout::validate_header(&header).map_err(QueueError::Corrupt)?;
        let layout = Layout::from_header(&header);

        let file_len = file.metadata()?.len();
        if file_len < layout.total_size {
            return Err(QueueError::Corrupt(format!(
                "file is {file_len} bytes, layout needs {}",
                layout.total_size
            )));
        }

        let private = flags.contains(OpenFlags::PRIVATE);
        let map = FileMapping::new(&file, layout.total_size as usize, readonly && !private, private)?;

        let queue = ProductQueue {
            file,
            map,
            path: path.to_path_buf(),
            layout,
            writable: !readonly,
            nolock: flags.contains(OpenFlags::NOLOCK),
            poisoned: AtomicBool::new(false),
            pins: Mutex::new(HashMap::new()),
            cursor: Mutex::new(CursorPos {
                time: Timestamp::ZERO,
                offset: 0,
            }),
            ts_guard: flags
                .contains(OpenFlags::THREADSAFE)
                .then(|| ReentrantMutex::new(())),
            closed: AtomicBool::new(false),
        };

        if !readonly {
            let _guard = queue.lock_header(true)?;
            let view = queue.view();
            let recovered = insert::recover_reservations(&view);
            if recovered > 0 {
                log::warn!(
                    "queue {}: released {recovered} reservation(s) left by dead writers",
                    path.display()
                );
            }
            queue.quick_verify(&view)?;
            let h = view.header_mut();
            // A non-zero count here is either live concurrent writers or
            // a crashed one; `check` distinguishes them for the operator.
            log::debug!(
                "queue {}: writer count {} -> {}",
                path.display(),
                h.writer_count,
                h.writer_count + 1
            );
            h.writer_count += 1;
        } else {
            let _guard = queue.lock_header(false)?;
            queue.quick_verify(&queue.view())?;
        }

        Ok(queue)
    }

    /// Close the queue, decrementing the writer counter if it was open for
    /// writing. Returns `CorruptCount` if the counter was already zero.
    pub fn close(self) -> Result<()> {
        self.close_impl()
    }

    fn close_impl(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.writable {
            return Ok(());
        }
        let _guard = self.lock_header(true)?;
        let view = self.view();
        let h = view.header_mut();
        if h.writer_count == 0 {
            return Err(QueueError::CorruptCount);
        }
        h.writer_count -= 1;
        self.map.sync()?;
        Ok(())
    }

    /// File path this queue was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Data-area capacity in bytes.
    #[must_use]
    pub fn data_capacity(&self) -> u64 {
        self.layout.byte_capacity
    }

    /// Slot-ring capacity.
    #[must_use]
    pub fn slot_capacity(&self) -> u64 {
        self.layout.slot_capacity
    }

    /// Page granularity of the file layout.
    #[must_use]
    pub fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    /// Total mutations committed over the queue's lifetime. Readers use
    /// this to detect writer activity without touching the indices.
    pub fn mutation_count(&self) -> Result<u64> {
        let _guard = self.lock_header(false)?;
        Ok(self.view().header().mutation_count)
    }

    /// Insertion time of the oldest live region, if any.
    pub fn oldest_time(&self) -> Result<Option<Timestamp>> {
        let _guard = self.lock_header(false)?;
        let view = self.view();
        let h = view.header();
        if h.oldest_sec == OLDEST_NONE_SEC {
            Ok(None)
        } else {
            Ok(Some(Timestamp {
                sec: h.oldest_sec,
                usec: h.oldest_usec,
            }))
        }
    }

    /// Reset the minimum-virtual-residence-time block to "unset".
    ///
    /// The three companion values reset together.
    pub fn clear_min_vrt(&self) -> Result<()> {
        self.ensure_writable()?;
        let _guard = self.lock_header(true)?;
        let view = self.view();
        let h = view.header_mut();
        h.mvrt_set = 0;
        h.mvrt_usecs = 0;
        h.mvrt_bytes = 0;
        h.mvrt_slots = 0;
        Ok(())
    }

    /// Shared writer counter as currently recorded.
    pub fn writer_count(&self) -> Result<u32> {
        let _guard = self.lock_header(false)?;
        Ok(self.view().header().writer_count)
    }

    /// Forcibly zero the writer counter.
    ///
    /// Operator tool contract: only sound after verifying no live process
    /// has the queue open for writing.
    pub fn force_reset_writers(&self) -> Result<u32> {
        self.ensure_writable()?;
        let _guard = self.lock_header(true)?;
        let view = self.view();
        let h = view.header_mut();
        // This handle is itself a writer; the reset leaves our own count.
        let before = h.writer_count;
        h.writer_count = 1;
        Ok(before)
    }

    // ----- internal plumbing -----

    pub(crate) fn view(&self) -> View {
        // SAFETY: self.map covers self.layout.total_size bytes of a file
        // whose header validated against this layout; lock discipline is
        // enforced by the callers holding a HeaderGuard.
        unsafe { View::new(self.map.as_ptr(), self.layout) }
    }

    pub(crate) fn layout(&self) -> &Layout {
        &self.layout
    }

    pub(crate) fn lock_file(&self) -> &File {
        &self.file
    }

    pub(crate) fn nolock(&self) -> bool {
        self.nolock
    }

    /// Take the header lock. `exclusive` for any mutation of the header,
    /// indices, or allocator; shared for consistent reads.
    pub(crate) fn lock_header(&self, exclusive: bool) -> Result<HeaderGuard<'_>> {
        let ts = self.ts_guard.as_ref().map(parking_lot::ReentrantMutex::lock);
        if !self.nolock {
            if exclusive {
                locks::lock_exclusive(&self.file, 0, 1, true)?;
            } else {
                locks::lock_shared(&self.file, 0, 1, true)?;
            }
        }
        Ok(HeaderGuard {
            q: self,
            _ts: ts,
            locked: !self.nolock,
        })
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Relaxed) {
            return Err(QueueError::Corrupt("queue handle is poisoned".into()));
        }
        if !self.writable {
            return Err(QueueError::Inval("queue opened read-only".into()));
        }
        Ok(())
    }

    pub(crate) fn ensure_readable(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Relaxed) {
            return Err(QueueError::Corrupt("queue handle is poisoned".into()));
        }
        Ok(())
    }

    /// Record an invariant violation: poison the handle and build the error.
    pub(crate) fn corrupt(&self, reason: impl Into<String>) -> QueueError {
        let reason = reason.into();
        log::error!("queue {}: CORRUPT: {reason}", self.path.display());
        self.poisoned.store(true, Ordering::Relaxed);
        QueueError::Corrupt(reason)
    }

    /// Cheap cross-checks run at open time; the full walk lives in
    /// [`ProductQueue::verify`].
    fn quick_verify(&self, view: &View) -> Result<()> {
        let h = view.header();
        let free_total = view.free_total();
        if free_total + h.bytes_used != h.byte_capacity {
            return Err(QueueError::Corrupt(format!(
                "extent accounting: free {} + used {} != capacity {}",
                free_total, h.bytes_used, h.byte_capacity
            )));
        }
        if h.slots_used > h.slot_capacity || h.products > h.slots_used {
            return Err(QueueError::Corrupt(format!(
                "slot accounting: used {} live {} capacity {}",
                h.slots_used, h.products, h.slot_capacity
            )));
        }
        if h.ring_len != h.products {
            return Err(QueueError::Corrupt(format!(
                "time index holds {} entries for {} live regions",
                h.ring_len, h.products
            )));
        }
        Ok(())
    }
}

impl Drop for ProductQueue {
    fn drop(&mut self) {
        if let Err(e) = self.close_impl() {
            log::warn!("queue {}: close failed: {e}", self.path.display());
        }
    }
}

impl fmt::Debug for ProductQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProductQueue")
            .field("path", &self.path)
            .field("writable", &self.writable)
            .field("byte_capacity", &self.layout.byte_capacity)
            .field("slot_capacity", &self.layout.slot_capacity)
            .finish_non_exhaustive()
    }
}

/// Wake every cooperating process in our process group blocked in
/// [`ProductQueue::suspend`].
pub fn wake_process_group() {
    insert::signal_process_group();
}

/// RAII header lock; unlocks on drop.
pub(crate) struct HeaderGuard<'q> {
    q: &'q ProductQueue,
    _ts: Option<parking_lot::ReentrantMutexGuard<'q, ()>>,
    locked: bool,
}

impl Drop for HeaderGuard<'_> {
    fn drop(&mut self) {
        if self.locked {
            if let Err(e) = locks::unlock(&self.q.file, 0, 1) {
                log::warn!("queue {}: header unlock failed: {e}", self.q.path.display());
            }
        }
    }
}

/// Initialize all areas of a freshly created (zero-filled) queue file.
pub(crate) fn init_areas(view: &View) {
    let layout = view.layout;
    let h = view.header_mut();
    h.magic = MAGIC;
    h.version = VERSION;
    h.page_size = PAGE_SIZE as u32;
    h.byte_capacity = layout.byte_capacity;
    h.slot_capacity = layout.slot_capacity;
    h.sig_buckets = layout.sig_buckets;
    h.slots_off = layout.slots_off;
    h.sig_off = layout.sig_off;
    h.free_off = layout.free_off;
    h.ring_off = layout.ring_off;
    h.data_off = layout.data_off;
    h.total_size = layout.total_size;
    h.writer_count = 0;
    h.mutation_count = 0;
    h.slot_free_head = 0;
    h.slots_used = 0;
    h.free_count = 1;
    h.ring_head = 0;
    h.ring_len = 0;
    h.products = 0;
    h.bytes_used = 0;
    h.oldest_sec = OLDEST_NONE_SEC;
    h.oldest_usec = 0;
    h.max_products = 0;
    h.max_bytes_used = 0;
    h.max_free_regions = 1;
    h.min_empty_slots = layout.slot_capacity;
    h.mvrt_set = 0;
    h.mvrt_usecs = 0;
    h.mvrt_bytes = 0;
    h.mvrt_slots = 0;

    // Chain every slot on the free list.
    let slots = view.slots_mut();
    for (i, slot) in slots.iter_mut().enumerate() {
        slot.state = SLOT_FREE;
        slot.next_free = if i + 1 < layout.slot_capacity as usize {
            (i + 1) as u32
        } else {
            NIL
        };
    }

    // One free region spanning the whole data area.
    let free = view.free_table_mut();
    free[0].offset = 0;
    free[0].extent = layout.byte_capacity;
}

fn read_header(file: &File) -> Result<Header> {
    use std::io::Read;
    let mut buf = vec![0u8; std::mem::size_of::<Header>()];
    let mut f = file;
    f.read_exact(&mut buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            QueueError::Corrupt("file is shorter than a queue header".into())
        } else {
            QueueError::Sys(e)
        }
    })?;
    // SAFETY: Header is repr(C) plain-old-data and buf holds exactly
    // size_of::<Header>() bytes read from the file.
    Ok(unsafe { std::ptr::read_unaligned(buf.as_ptr().cast::<Header>()) })
}

fn preallocate(file: &File, len: u64) -> Result<()> {
    // SAFETY: fd is a valid descriptor opened read-write above;
    // posix_fallocate allocates without touching file contents.
    let ret = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len as libc::off_t) };
    match ret {
        0 => Ok(()),
        // Filesystems without fallocate support: fall back to set_len,
        // which leaves the file sparse but correctly sized.
        libc::EOPNOTSUPP | libc::ENOSYS => {
            file.set_len(len)?;
            Ok(())
        }
        errno => Err(QueueError::Sys(io::Error::from_raw_os_error(errno))),
    }
}
