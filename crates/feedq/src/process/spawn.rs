// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Child-process spawning with the pipeline's fork discipline.
//!
//! Children start with default signal dispositions and, when the parent
//! runs as root, with privileges dropped to an unprivileged account. The
//! queue mapping is shared through the file, never through inherited
//! memory, so nothing else crosses the fork boundary.

use super::signals;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

/// Uid/gid the children drop to when the parent is root.
const UNPRIVILEGED_UID: libc::uid_t = 65534;
const UNPRIVILEGED_GID: libc::gid_t = 65534;

/// Build a `Command` that applies the fork discipline before exec:
/// default signal dispositions, and a privilege drop when running as root.
pub fn command(program: &str) -> Command {
    let mut cmd = Command::new(program);
    // SAFETY: the pre_exec closure runs in the forked child before exec
    // and only calls async-signal-safe functions (sigaction, setgid,
    // setuid).
    unsafe {
        cmd.pre_exec(|| {
            signals::reset_to_default();
            drop_privileges_raw()
        });
    }
    cmd
}

/// Spawn a supervised child whose stdout is a pipe back to the parent.
/// Used for the port handshake with multicast sender children.
pub fn spawn_piped(program: &str, args: &[String]) -> io::Result<std::process::Child> {
    command(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .spawn()
}

/// Drop root privileges; no-op when not root. Async-signal-safe.
fn drop_privileges_raw() -> io::Result<()> {
    // SAFETY: geteuid/setgid/setuid are async-signal-safe; the order
    // (group first) matters because setuid forfeits the right to setgid.
    unsafe {
        if libc::geteuid() != 0 {
            return Ok(());
        }
        if libc::setgid(UNPRIVILEGED_GID) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::setuid(UNPRIVILEGED_UID) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Send `SIGTERM` to a child process.
pub fn terminate(pid: libc::pid_t) {
    // SAFETY: signalling a specific pid we spawned; if it already exited
    // the call fails harmlessly with ESRCH.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
}

/// Is the process alive? `kill(pid, 0)` probes without signalling.
#[must_use]
pub fn is_alive(pid: libc::pid_t) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_spawn_piped_reads_child_output() {
        let mut child =
            spawn_piped("/bin/sh", &["-c".to_string(), "echo PORT 12345".to_string()])
                .expect("spawn");
        let mut out = String::new();
        child
            .stdout
            .take()
            .expect("stdout piped")
            .read_to_string(&mut out)
            .expect("read");
        let status = child.wait().expect("wait");
        assert!(status.success());
        assert_eq!(out.trim(), "PORT 12345");
    }

    #[test]
    fn test_is_alive_self_and_bogus() {
        // SAFETY: getpid has no preconditions.
        let me = unsafe { libc::getpid() };
        assert!(is_alive(me));
        assert!(!is_alive(-1));
        // Pid 0 would signal the group; is_alive must treat it as dead.
        assert!(!is_alive(0));
    }
}
