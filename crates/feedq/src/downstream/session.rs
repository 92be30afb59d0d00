// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-subscription session memory.
//!
//! One small human-readable key/value file per `(upstream host, feed)`
//! records the last received product so a restarted downstream resumes
//! its backlog from where it stopped instead of re-requesting history.
//! Writes go through a temp file and rename, so the record is always
//! either the old or the new state.

use crate::product::{Signature, Timestamp};
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// The persisted session record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub last_signature: Option<Signature>,
    pub last_time: Option<Timestamp>,
    pub session_start: Timestamp,
}

impl SessionRecord {
    #[must_use]
    pub fn fresh() -> SessionRecord {
        SessionRecord {
            last_signature: None,
            last_time: None,
            session_start: Timestamp::now(),
        }
    }
}

/// Handle on one session-memory file.
pub struct SessionMemory {
    path: PathBuf,
}

impl SessionMemory {
    /// Session memory for a `(host, feed)` subscription under `dir`.
    /// The feed string is sanitized into the file name.
    pub fn open(dir: &Path, host: &str, feed: &str) -> io::Result<SessionMemory> {
        fs::create_dir_all(dir)?;
        let sane = |s: &str| -> String {
            s.chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                    c
                } else {
                    '_'
                })
                .collect()
        };
        let path = dir.join(format!("{}_{}.session", sane(host), sane(feed)));
        Ok(SessionMemory { path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record; a missing file is a fresh session.
    pub fn load(&self) -> io::Result<SessionRecord> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(SessionRecord::fresh());
            }
            Err(e) => return Err(e),
        };

        let mut record = SessionRecord::fresh();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "last-signature" => {
                    record.last_signature = value.parse().ok();
                }
                "last-time" => {
                    record.last_time = parse_time(value);
                }
                "session-start" => {
                    if let Some(t) = parse_time(value) {
                        record.session_start = t;
                    }
                }
                other => log::debug!("session memory: unknown key {other}"),
            }
        }
        Ok(record)
    }

    /// Persist the record atomically.
    pub fn store(&self, record: &SessionRecord) -> io::Result<()> {
        let mut text = String::new();
        let _ = writeln!(text, "# feedq session memory");
        if let Some(sig) = &record.last_signature {
            let _ = writeln!(text, "last-signature: {sig}");
        }
        if let Some(t) = &record.last_time {
            let _ = writeln!(text, "last-time: {} {}", t.sec, t.usec);
        }
        let _ = writeln!(
            text,
            "session-start: {} {}",
            record.session_start.sec, record.session_start.usec
        );

        let tmp = self.path.with_extension("session.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)
    }

    /// Record a received product (signature + insertion time) and persist.
    pub fn remember(&self, record: &mut SessionRecord, sig: Signature, time: Timestamp) {
        record.last_signature = Some(sig);
        record.last_time = Some(time);
        if let Err(e) = self.store(record) {
            log::warn!("session memory write to {} failed: {e}", self.path.display());
        }
    }
}

fn parse_time(value: &str) -> Option<Timestamp> {
    let mut parts = value.split_whitespace();
    let sec = parts.next()?.parse().ok()?;
    let usec = parts.next()?.parse().ok()?;
    Some(Timestamp { sec, usec })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_when_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mem = SessionMemory::open(dir.path(), "up.example.net", "RADAR").expect("open");
        let record = mem.load().expect("load");
        assert!(record.last_signature.is_none());
        assert!(record.last_time.is_none());
    }

    #[test]
    fn test_store_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mem = SessionMemory::open(dir.path(), "up.example.net", "RADAR|TEXT").expect("open");
        let record = SessionRecord {
            last_signature: Some(Signature::of(b"abc")),
            last_time: Some(Timestamp { sec: 1234, usec: 56 }),
            session_start: Timestamp { sec: 1000, usec: 0 },
        };
        mem.store(&record).expect("store");
        assert_eq!(mem.load().expect("load"), record);
    }

    #[test]
    fn test_remember_updates_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mem = SessionMemory::open(dir.path(), "h", "TEXT").expect("open");
        let mut record = SessionRecord::fresh();
        let sig = Signature::of(b"p1");
        mem.remember(&mut record, sig, Timestamp { sec: 7, usec: 8 });
        let loaded = mem.load().expect("load");
        assert_eq!(loaded.last_signature, Some(sig));
        assert_eq!(loaded.last_time, Some(Timestamp { sec: 7, usec: 8 }));
    }

    #[test]
    fn test_distinct_files_per_host_feed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = SessionMemory::open(dir.path(), "h1", "TEXT").expect("open");
        let b = SessionMemory::open(dir.path(), "h2", "TEXT").expect("open");
        let c = SessionMemory::open(dir.path(), "h1", "RADAR").expect("open");
        assert_ne!(a.path(), b.path());
        assert_ne!(a.path(), c.path());
    }

    #[test]
    fn test_garbage_lines_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mem = SessionMemory::open(dir.path(), "h", "TEXT").expect("open");
        std::fs::write(
            mem.path(),
            "# comment\nnot a kv line\nlast-time: bogus\nlast-signature: zz\n",
        )
        .expect("write");
        let record = mem.load().expect("load");
        assert!(record.last_signature.is_none());
        assert!(record.last_time.is_none());
    }
}
