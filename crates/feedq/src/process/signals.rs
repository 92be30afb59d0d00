// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide signal discipline shared by every pipeline daemon.
//!
//! Handlers only set flags; the work happens at the daemons' next poll:
//!
//! - `SIGTERM`/`SIGINT`: finish the current product, close the queue, exit
//! - `SIGHUP`: reload configuration and reopen log destinations
//! - `SIGUSR1`: reopen the log destination (rotation)
//! - `SIGUSR2`: step the log verbosity one level, wrapping
//! - `SIGCONT`: no-op handler, used purely as a wakeup from [`suspend`]
//! - `SIGCHLD`: flag for the supervisor to reap
//! - `SIGPIPE`: ignored; write errors surface as `EPIPE`

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

static TERMINATE: AtomicBool = AtomicBool::new(false);
static RELOAD: AtomicBool = AtomicBool::new(false);
static ROTATE_LOG: AtomicBool = AtomicBool::new(false);
static CHILD_EXITED: AtomicBool = AtomicBool::new(false);
static VERBOSITY_BUMPS: AtomicU32 = AtomicU32::new(0);

extern "C" fn on_terminate(_sig: libc::c_int) {
    TERMINATE.store(true, Ordering::Relaxed);
}

extern "C" fn on_reload(_sig: libc::c_int) {
    RELOAD.store(true, Ordering::Relaxed);
    ROTATE_LOG.store(true, Ordering::Relaxed);
}

extern "C" fn on_rotate(_sig: libc::c_int) {
    ROTATE_LOG.store(true, Ordering::Relaxed);
}

extern "C" fn on_verbosity(_sig: libc::c_int) {
    VERBOSITY_BUMPS.fetch_add(1, Ordering::Relaxed);
}

extern "C" fn on_child(_sig: libc::c_int) {
    CHILD_EXITED.store(true, Ordering::Relaxed);
}

extern "C" fn on_wakeup(_sig: libc::c_int) {
    // Nothing: delivery alone interrupts blocking calls and wakes
    // sigtimedwait-based suspension.
}

fn set_handler(sig: libc::c_int, handler: extern "C" fn(libc::c_int)) {
    // SAFETY: sigaction is initialized field by field from a zeroed
    // struct; the handler is a plain extern "C" fn that only touches
    // atomics (async-signal-safe).
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler as usize;
        sa.sa_flags = 0;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(sig, &sa, std::ptr::null_mut());
    }
}

fn ignore(sig: libc::c_int) {
    // SAFETY: as set_handler, with the SIG_IGN disposition.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = libc::SIG_IGN;
        sa.sa_flags = 0;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(sig, &sa, std::ptr::null_mut());
    }
}

/// Install the shared dispositions. Call once, early in `main`.
pub fn install() {
    set_handler(libc::SIGTERM, on_terminate);
    set_handler(libc::SIGINT, on_terminate);
    set_handler(libc::SIGHUP, on_reload);
    set_handler(libc::SIGUSR1, on_rotate);
    set_handler(libc::SIGUSR2, on_verbosity);
    set_handler(libc::SIGCHLD, on_child);
    set_handler(libc::SIGCONT, on_wakeup);
    ignore(libc::SIGPIPE);
    // SIGALRM drives deadlines in blocking primitives; delivery just
    // interrupts, no state to keep.
    set_handler(libc::SIGALRM, on_wakeup);
}

/// Restore every disposition we install to the default. Used by fork
/// helpers before exec.
pub fn reset_to_default() {
    for sig in [
        libc::SIGTERM,
        libc::SIGINT,
        libc::SIGHUP,
        libc::SIGUSR1,
        libc::SIGUSR2,
        libc::SIGCHLD,
        libc::SIGCONT,
        libc::SIGPIPE,
        libc::SIGALRM,
    ] {
        // SAFETY: resetting to SIG_DFL is always valid.
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = libc::SIG_DFL;
            libc::sigemptyset(&mut sa.sa_mask);
            libc::sigaction(sig, &sa, std::ptr::null_mut());
        }
    }
}

/// Has a termination signal arrived?
#[must_use]
pub fn terminated() -> bool {
    TERMINATE.load(Ordering::Relaxed)
}

/// Consume a pending reload request (`SIGHUP`).
#[must_use]
pub fn take_reload() -> bool {
    RELOAD.swap(false, Ordering::Relaxed)
}

/// Consume a pending log-rotation request (`SIGUSR1` or `SIGHUP`).
#[must_use]
pub fn take_rotate_log() -> bool {
    ROTATE_LOG.swap(false, Ordering::Relaxed)
}

/// Consume pending verbosity bumps (`SIGUSR2` count since last call).
#[must_use]
pub fn take_verbosity_bumps() -> u32 {
    VERBOSITY_BUMPS.swap(0, Ordering::Relaxed)
}

/// Consume the child-exited flag (`SIGCHLD`).
#[must_use]
pub fn take_child_exited() -> bool {
    CHILD_EXITED.swap(false, Ordering::Relaxed)
}

/// Reap every exited child without blocking; returns their pids.
pub fn reap_children() -> Vec<libc::pid_t> {
    let mut reaped = Vec::new();
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: waitpid(-1, ..., WNOHANG) polls for any exited child and
        // never blocks.
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
        reaped.push(pid);
    }
    reaped
}

/// Block until `SIGCONT` (or one of `extra` signals) arrives, or until
/// `seconds` elapse; zero seconds means no deadline.
///
/// Returns true when a signal ended the wait. The caller's signal mask is
/// restored on return. Wakeups may be spurious relative to the condition
/// being awaited; callers re-check.
pub fn suspend(seconds: u32, extra: &[libc::c_int]) -> bool {
    // SAFETY: every libc call below operates on locals initialized here;
    // the original mask is restored before returning.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGCONT);
        for &sig in extra {
            libc::sigaddset(&mut set, sig);
        }

        let mut old: libc::sigset_t = std::mem::zeroed();
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut old);

        let woken = if seconds == 0 {
            let mut sig: libc::c_int = 0;
            libc::sigwait(&set, &mut sig) == 0
        } else {
            let timeout = libc::timespec {
                tv_sec: libc::time_t::from(seconds),
                tv_nsec: 0,
            };
            libc::sigtimedwait(&set, std::ptr::null_mut(), &timeout) >= 0
        };

        libc::pthread_sigmask(libc::SIG_SETMASK, &old, std::ptr::null_mut());
        woken
    }
}
