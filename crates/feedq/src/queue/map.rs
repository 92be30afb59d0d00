// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! File-backed shared memory mapping for the queue file.
//!
//! Every process sharing a queue maps the same file with `MAP_SHARED`, so
//! stores become visible to the others through the page cache. All
//! cross-reference inside the mapping is by byte offset; native pointers
//! never leave the process that computed them.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr;

/// A mapped queue file.
///
/// The mapping is unmapped on drop. Flushing to stable storage is explicit
/// via [`FileMapping::sync`].
pub struct FileMapping {
    ptr: *mut u8,
    len: usize,
    readonly: bool,
}

// SAFETY: the mapping points at shared memory that is by design accessed
// from multiple threads and processes. Mutual exclusion is provided by the
// queue's advisory file locks, not by the mapping itself.
unsafe impl Send for FileMapping {}
unsafe impl Sync for FileMapping {}

impl FileMapping {
    /// Map `len` bytes of `file` starting at offset zero.
    ///
    /// `readonly` maps with `PROT_READ` only; `private` requests a
    /// copy-on-write mapping (debugging aid: writes stay process-local).
    pub fn new(file: &File, len: usize, readonly: bool, private: bool) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty mapping"));
        }

        let prot = if readonly {
            libc::PROT_READ
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        let flags = if private {
            libc::MAP_PRIVATE
        } else {
            libc::MAP_SHARED
        };

        // SAFETY:
        // - First argument is null, letting the kernel choose the address
        // - len was checked non-zero above; mmap fails cleanly if too large
        // - prot/flags are valid combinations for a file mapping
        // - the fd comes from an open File that outlives this call; the
        //   mapping keeps its own reference to the file afterwards
        // - mmap returns MAP_FAILED on error (checked below)
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                prot,
                flags,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            ptr: ptr.cast::<u8>(),
            len,
            readonly,
        })
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Schedule writeback of the whole mapping (asynchronous).
    pub fn sync(&self) -> io::Result<()> {
        if self.readonly {
            return Ok(());
        }
        // SAFETY:
        // - self.ptr/self.len describe a live mapping created in new()
        // - MS_ASYNC schedules writeback without blocking
        let ret = unsafe { libc::msync(self.ptr.cast::<libc::c_void>(), self.len, libc::MS_ASYNC) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for FileMapping {
    fn drop(&mut self) {
        // SAFETY:
        // - self.ptr was returned by a successful mmap of exactly self.len
        //   bytes and has not been unmapped before (Drop runs once)
        unsafe {
            libc::munmap(self.ptr.cast::<libc::c_void>(), self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_map_and_write_visible_through_second_mapping() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("map.dat");
        let mut f = File::create(&path).expect("create");
        f.write_all(&[0u8; 8192]).expect("fill");
        drop(f);

        let f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .expect("open rw");
        let m1 = FileMapping::new(&f, 8192, false, false).expect("map rw");
        let m2 = FileMapping::new(&f, 8192, true, false).expect("map ro");

        // SAFETY: both mappings cover 8192 bytes of the same file; offsets
        // 0 and 4096 are in bounds.
        unsafe {
            *m1.as_ptr() = 0x5a;
            *m1.as_ptr().add(4096) = 0xa5;
            assert_eq!(*m2.as_ptr(), 0x5a);
            assert_eq!(*m2.as_ptr().add(4096), 0xa5);
        }
    }

    #[test]
    fn test_private_mapping_writes_stay_local() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("map.dat");
        std::fs::write(&path, [0u8; 4096]).expect("fill");

        let f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .expect("open rw");
        let shared = FileMapping::new(&f, 4096, false, false).expect("map shared");
        let private = FileMapping::new(&f, 4096, false, true).expect("map private");

        // SAFETY: both mappings are 4096 bytes; offset 0 is in bounds.
        unsafe {
            *private.as_ptr() = 7;
            assert_eq!(*shared.as_ptr(), 0);
        }
    }

    #[test]
    fn test_zero_length_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("map.dat");
        std::fs::write(&path, []).expect("create");
        let f = File::open(&path).expect("open");
        assert!(FileMapping::new(&f, 0, true, false).is_err());
    }
}
