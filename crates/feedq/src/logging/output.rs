// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Logging output backends (stderr, reopenable file, syslog).
//!
//! The file backend appends and can reopen its path on demand, which is
//! how log rotation works: the operator moves the file aside and sends
//! `SIGUSR1`, and the daemon reopens a fresh file at the same path.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::OnceLock;

/// Output destination trait for formatted log lines.
pub trait Output: Send + Sync {
    /// Write one formatted line (no trailing newline).
    fn write(&self, level: log::Level, line: &str) -> io::Result<()>;

    /// Flush any buffered output.
    fn flush(&self) -> io::Result<()>;

    /// Reopen the destination if it has one (rotation support).
    fn reopen(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Stderr output.
pub struct StderrOutput;

impl Output for StderrOutput {
    fn write(&self, level: log::Level, line: &str) -> io::Result<()> {
        eprintln!("[{level:5}] {line}");
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        io::stderr().flush()
    }
}

/// Append-mode file output with reopen support.
pub struct FileOutput {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl FileOutput {
    pub fn new(path: &Path) -> io::Result<Self> {
        let file = Self::open_file(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    fn open_file(path: &Path) -> io::Result<std::fs::File> {
        OpenOptions::new().create(true).append(true).open(path)
    }
}

impl Output for FileOutput {
    fn write(&self, level: log::Level, line: &str) -> io::Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("file output mutex poisoned"))?;
        writeln!(file, "[{level:5}] {line}")
    }

    fn flush(&self) -> io::Result<()> {
        self.file
            .lock()
            .map_err(|_| io::Error::other("file output mutex poisoned"))?
            .flush()
    }

    fn reopen(&self) -> io::Result<()> {
        let fresh = Self::open_file(&self.path)?;
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("file output mutex poisoned"))?;
        *file = fresh;
        Ok(())
    }
}

/// Ident string handed to openlog; the pointer must stay valid for the
/// process lifetime, hence the static.
static SYSLOG_IDENT: OnceLock<CString> = OnceLock::new();

/// Syslog output via the libc interface.
pub struct SyslogOutput;

impl SyslogOutput {
    pub fn new(ident: &str) -> Self {
        let ident = SYSLOG_IDENT.get_or_init(|| {
            CString::new(ident).unwrap_or_else(|_| CString::new("feedq").expect("static ident"))
        });
        // SAFETY: the ident CString lives in a process-lifetime static, as
        // openlog requires; LOG_PID|LOG_NDELAY and LOG_DAEMON are valid
        // option/facility constants.
        unsafe {
            libc::openlog(ident.as_ptr(), libc::LOG_PID | libc::LOG_NDELAY, libc::LOG_DAEMON);
        }
        SyslogOutput
    }

    fn priority(level: log::Level) -> libc::c_int {
        match level {
            log::Level::Error => libc::LOG_ERR,
            log::Level::Warn => libc::LOG_WARNING,
            log::Level::Info => libc::LOG_INFO,
            log::Level::Debug | log::Level::Trace => libc::LOG_DEBUG,
        }
    }
}

impl Output for SyslogOutput {
    fn write(&self, level: log::Level, line: &str) -> io::Result<()> {
        let Ok(msg) = CString::new(line) else {
            return Ok(()); // interior NUL: drop rather than fail the caller
        };
        // SAFETY: "%s" with one matching string argument; both pointers
        // are valid NUL-terminated strings for the duration of the call.
        unsafe {
            libc::syslog(Self::priority(level), c"%s".as_ptr(), msg.as_ptr());
        }
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_output_appends_and_reopens() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.log");
        let out = FileOutput::new(&path).expect("create");
        out.write(log::Level::Info, "first").expect("write");
        out.flush().expect("flush");

        // Rotate: move the file aside, reopen, write again.
        let rotated = dir.path().join("out.log.1");
        std::fs::rename(&path, &rotated).expect("rotate");
        out.reopen().expect("reopen");
        out.write(log::Level::Warn, "second").expect("write");
        out.flush().expect("flush");

        let old = std::fs::read_to_string(&rotated).expect("read rotated");
        let new = std::fs::read_to_string(&path).expect("read new");
        assert!(old.contains("first"));
        assert!(new.contains("second"));
        assert!(!new.contains("first"));
    }

    #[test]
    fn test_stderr_output_does_not_fail() {
        let out = StderrOutput;
        assert!(out.write(log::Level::Debug, "stderr test line").is_ok());
        assert!(out.flush().is_ok());
    }
}
