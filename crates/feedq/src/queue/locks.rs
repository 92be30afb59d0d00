// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Advisory byte-range locks on the queue file.
//!
//! Open-file-description (`F_OFD_*`) locks are used throughout so that a
//! lock's lifetime is tied to the open file description: when a process
//! dies, the kernel releases everything it held, and no reader crash can
//! leave a region pinned against eviction forever.
//!
//! Two ranges are in play: byte 0 is the header lock (exclusive for
//! mutation, shared for consistent reads), and each region's byte range in
//! the data area carries shared reader locks that the eviction path probes
//! with a non-blocking exclusive attempt.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

fn flock_arg(typ: libc::c_short, start: i64, len: i64) -> libc::flock {
    // SAFETY: flock is a plain-old-data struct; zeroing is a valid initial
    // state and l_pid must be 0 for OFD locks.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = typ;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = start;
    fl.l_len = len;
    fl
}

fn fcntl_lock(file: &File, typ: libc::c_short, start: i64, len: i64, wait: bool) -> io::Result<bool> {
    let mut fl = flock_arg(typ, start, len);
    let cmd = if wait { libc::F_OFD_SETLKW } else { libc::F_OFD_SETLK };
    loop {
        // SAFETY: fd is a valid open descriptor for the queue file and fl
        // is a properly initialized flock struct.
        let ret = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &mut fl) };
        if ret == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN | libc::EACCES) if !wait => return Ok(false),
            _ => return Err(err),
        }
    }
}

/// Take the lock exclusively. With `wait == false`, returns `Ok(false)`
/// when another description holds a conflicting lock.
pub fn lock_exclusive(file: &File, start: i64, len: i64, wait: bool) -> io::Result<bool> {
    fcntl_lock(file, libc::F_WRLCK as libc::c_short, start, len, wait)
}

/// Take the lock shared.
pub fn lock_shared(file: &File, start: i64, len: i64, wait: bool) -> io::Result<bool> {
    fcntl_lock(file, libc::F_RDLCK as libc::c_short, start, len, wait)
}

/// Release a previously taken range.
pub fn unlock(file: &File, start: i64, len: i64) -> io::Result<()> {
    fcntl_lock(file, libc::F_UNLCK as libc::c_short, start, len, true).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    fn two_descriptions() -> (tempfile::TempDir, File, File) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("lock.dat");
        std::fs::write(&path, [0u8; 128]).expect("create");
        let a = OpenOptions::new().read(true).write(true).open(&path).expect("open a");
        let b = OpenOptions::new().read(true).write(true).open(&path).expect("open b");
        (dir, a, b)
    }

    #[test]
    fn test_exclusive_excludes_other_description() {
        let (_dir, a, b) = two_descriptions();
        assert!(lock_exclusive(&a, 0, 1, true).expect("lock a"));
        assert!(!lock_exclusive(&b, 0, 1, false).expect("try b"));
        unlock(&a, 0, 1).expect("unlock a");
        assert!(lock_exclusive(&b, 0, 1, false).expect("retry b"));
    }

    #[test]
    fn test_shared_locks_coexist_but_block_exclusive() {
        let (_dir, a, b) = two_descriptions();
        assert!(lock_shared(&a, 8, 16, true).expect("shared a"));
        assert!(lock_shared(&b, 8, 16, false).expect("shared b"));
        assert!(!lock_exclusive(&a, 8, 16, false).expect("excl over b's shared"));
        unlock(&b, 8, 16).expect("unlock b");
        // Our own shared lock upgrades once b is gone.
        assert!(lock_exclusive(&a, 8, 16, false).expect("upgrade a"));
    }

    #[test]
    fn test_disjoint_ranges_do_not_conflict() {
        let (_dir, a, b) = two_descriptions();
        assert!(lock_exclusive(&a, 0, 8, true).expect("lock a"));
        assert!(lock_exclusive(&b, 8, 8, false).expect("lock b"));
    }
}
