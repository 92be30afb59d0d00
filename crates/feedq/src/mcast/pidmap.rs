// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared-memory registry of live multicast senders.
//!
//! A small POSIX shared-memory segment shared by every supervisor on the
//! host. It holds the `(feedtype -> pid, ports)` map plus a ring of the
//! most recently multicast `(product index, signature)` pairs, which the
//! upstream sessions use to resolve missed-product requests.
//!
//! Mutual exclusion is a pid-tagged spinlock: the owner field names the
//! process holding the lock, so a lock abandoned by a crash is detected
//! with `kill(pid, 0)` and stolen.

use crate::process::spawn::is_alive;
use crate::product::Signature;
use std::ffi::CString;
use std::io;
use std::net::Ipv4Addr;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

/// Capacity of the sender table.
pub const MAX_SENDERS: usize = 64;

/// Capacity of the sent-product ring.
pub const SENT_LOG_CAPACITY: usize = 4096;

const PIDMAP_MAGIC: u64 = 0x4651_5049_444d_0001; // "FQPIDM" v1

#[repr(C)]
struct PidMapHeader {
    magic: u64,
    /// Pid of the lock owner; 0 when free.
    lock: AtomicI32,
    _pad0: u32,
    /// Next write position in the sent ring (monotonic).
    sent_head: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SenderSlot {
    used: u8,
    _pad0: [u8; 3],
    feedtype: u32,
    pid: i32,
    /// FMTP data port (multicast UDP).
    group_port: u16,
    /// OS-assigned TCP retransmission port reported by the child.
    tcp_port: u16,
    /// Multicast group address.
    group: u32,
    _pad1: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SentSlot {
    index: u64,
    sig: [u8; 16],
}

/// A running sender as recorded in the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunningSender {
    pub feedtype: u32,
    pub pid: i32,
    pub group: Ipv4Addr,
    pub group_port: u16,
    pub tcp_port: u16,
}

fn segment_len() -> usize {
    std::mem::size_of::<PidMapHeader>()
        + MAX_SENDERS * std::mem::size_of::<SenderSlot>()
        + SENT_LOG_CAPACITY * std::mem::size_of::<SentSlot>()
}

/// The mapped registry segment.
pub struct PidMap {
    ptr: *mut u8,
    len: usize,
    name: String,
}

// SAFETY: all shared mutation happens under the pid-tagged spinlock; the
// pointer itself is valid for the mapping's lifetime in any thread.
unsafe impl Send for PidMap {}
unsafe impl Sync for PidMap {}

impl PidMap {
    /// Open the registry segment, creating and zero-initializing it on
    /// first use. Names follow POSIX shm rules (`/feedq_senders`).
    pub fn open(name: &str) -> io::Result<PidMap> {
        if !name.starts_with('/') || name[1..].contains('/') || name.len() > 255 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("bad segment name {name}"),
            ));
        }
        let c_name = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in segment name"))?;
        let len = segment_len();

        // SAFETY: c_name is a valid NUL-terminated string; O_CREAT|O_RDWR
        // opens or creates the segment with owner-only permissions.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: fd is valid from shm_open; sizing an already-sized
        // segment to the same length is a no-op.
        let ret = unsafe { libc::ftruncate(fd, len as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and unused after this error path.
            unsafe { libc::close(fd) };
            return Err(err);
        }

        // SAFETY: standard shared file mapping of len bytes; fd is valid
        // and can be closed once the mapping exists.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        // SAFETY: the mapping (if any) holds its own reference.
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let map = PidMap {
            ptr: ptr.cast::<u8>(),
            len,
            name: name.to_string(),
        };
        map.init_if_fresh();
        Ok(map)
    }

    /// Remove the segment from the namespace (existing mappings survive).
    pub fn unlink(name: &str) -> io::Result<()> {
        let c_name = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in segment name"))?;
        // SAFETY: shm_unlink only touches the filesystem namespace.
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(err);
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn header(&self) -> &PidMapHeader {
        // SAFETY: the segment begins with a PidMapHeader and outlives self.
        unsafe { &*self.ptr.cast::<PidMapHeader>() }
    }

    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self) -> &mut PidMapHeader {
        // SAFETY: as header(); mutation happens under the spinlock.
        unsafe { &mut *self.ptr.cast::<PidMapHeader>() }
    }

    #[allow(clippy::mut_from_ref)]
    fn senders(&self) -> &mut [SenderSlot] {
        // SAFETY: the sender table follows the header; bounds fixed by
        // segment_len().
        unsafe {
            std::slice::from_raw_parts_mut(
                self.ptr
                    .add(std::mem::size_of::<PidMapHeader>())
                    .cast::<SenderSlot>(),
                MAX_SENDERS,
            )
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn sent_log(&self) -> &mut [SentSlot] {
        // SAFETY: the sent ring follows the sender table.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.ptr
                    .add(
                        std::mem::size_of::<PidMapHeader>()
                            + MAX_SENDERS * std::mem::size_of::<SenderSlot>(),
                    )
                    .cast::<SentSlot>(),
                SENT_LOG_CAPACITY,
            )
        }
    }

    fn init_if_fresh(&self) {
        let _guard = self.lock();
        let h = self.header_mut();
        if h.magic != PIDMAP_MAGIC {
            for slot in self.senders().iter_mut() {
                slot.used = 0;
            }
            h.sent_head = 0;
            h.magic = PIDMAP_MAGIC;
        }
    }

    /// Take the registry lock, stealing it from a dead owner if needed.
    fn lock(&self) -> PidMapGuard<'_> {
        // SAFETY: getpid has no preconditions.
        let me = unsafe { libc::getpid() };
        let lock = &self.header().lock;
        loop {
            match lock.compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => break,
                Err(owner) => {
                    if owner != me && !is_alive(owner) {
                        // Owner died holding the lock; steal it.
                        if lock
                            .compare_exchange(owner, me, Ordering::Acquire, Ordering::Relaxed)
                            .is_ok()
                        {
                            log::warn!("stole sender-registry lock from dead pid {owner}");
                            break;
                        }
                    }
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
            }
        }
        PidMapGuard { map: self }
    }

    /// Record a running sender. Replaces a dead entry for the same
    /// feedtype.
    pub fn record(
        &self,
        feedtype: u32,
        pid: i32,
        group: Ipv4Addr,
        group_port: u16,
        tcp_port: u16,
    ) -> io::Result<()> {
        let _guard = self.lock();
        let senders = self.senders();
        let mut free = None;
        for i in 0..senders.len() {
            if senders[i].used != 0 && senders[i].feedtype == feedtype {
                senders[i].pid = pid;
                senders[i].group = u32::from(group);
                senders[i].group_port = group_port;
                senders[i].tcp_port = tcp_port;
                return Ok(());
            }
            if senders[i].used == 0 && free.is_none() {
                free = Some(i);
            }
        }
        match free {
            Some(i) => {
                let slot = &mut senders[i];
                slot.used = 1;
                slot.feedtype = feedtype;
                slot.pid = pid;
                slot.group = u32::from(group);
                slot.group_port = group_port;
                slot.tcp_port = tcp_port;
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "sender registry is full",
            )),
        }
    }

    /// Look up a live sender whose feedtype intersects `feedtype`.
    /// Stale entries (dead pid) are removed on the way.
    pub fn find_live(&self, feedtype: u32) -> Option<RunningSender> {
        let _guard = self.lock();
        for slot in self.senders().iter_mut() {
            if slot.used == 0 {
                continue;
            }
            if !is_alive(slot.pid) {
                log::debug!("dropping stale sender entry (pid {})", slot.pid);
                slot.used = 0;
                continue;
            }
            if slot.feedtype & feedtype != 0 {
                return Some(RunningSender {
                    feedtype: slot.feedtype,
                    pid: slot.pid,
                    group: Ipv4Addr::from(slot.group),
                    group_port: slot.group_port,
                    tcp_port: slot.tcp_port,
                });
            }
        }
        None
    }

    /// Remove the entry for a terminated child.
    pub fn remove_pid(&self, pid: i32) -> bool {
        let _guard = self.lock();
        for slot in self.senders().iter_mut() {
            if slot.used != 0 && slot.pid == pid {
                slot.used = 0;
                return true;
            }
        }
        false
    }

    /// Record a multicast-sent product for missed-request resolution.
    pub fn record_sent(&self, index: u64, sig: &Signature) {
        let _guard = self.lock();
        let pos = {
            let h = self.header_mut();
            let pos = (h.sent_head % SENT_LOG_CAPACITY as u64) as usize;
            h.sent_head += 1;
            pos
        };
        let log = self.sent_log();
        log[pos].index = index;
        log[pos].sig = *sig.as_bytes();
    }

    /// Resolve a multicast product index to its signature, if it is still
    /// in the ring.
    pub fn lookup_sent(&self, index: u64) -> Option<Signature> {
        let _guard = self.lock();
        let head = self.header().sent_head;
        let used = head.min(SENT_LOG_CAPACITY as u64) as usize;
        let log = self.sent_log();
        // Newest entries first; the ring is small and scans are rare.
        for i in 0..used {
            let pos = ((head - 1 - i as u64) % SENT_LOG_CAPACITY as u64) as usize;
            if log[pos].index == index {
                return Some(Signature(log[pos].sig));
            }
        }
        None
    }

    /// Next index the multicast sender should assign.
    pub fn next_index(&self) -> u64 {
        let _guard = self.lock();
        self.header().sent_head
    }
}

impl Drop for PidMap {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe the mapping created in open(); Drop
        // runs once.
        unsafe {
            libc::munmap(self.ptr.cast::<libc::c_void>(), self.len);
        }
    }
}

struct PidMapGuard<'a> {
    map: &'a PidMap,
}

impl Drop for PidMapGuard<'_> {
    fn drop(&mut self) {
        self.map.header().lock.store(0, Ordering::Release);
    }
}
