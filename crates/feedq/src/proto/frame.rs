// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefix framing for the RPC control plane.
//!
//! TCP is a stream without message boundaries; every message travels as
//!
//! ```text
//! +----------------+------------------+
//! | Length (4B BE) | Message body     |
//! +----------------+------------------+
//! ```
//!
//! The length counts the body only. An oversized length is rejected
//! before any allocation, bounding memory per connection.

use std::io::{self, Read, Write};

/// Frame header size (4 bytes for length).
pub const FRAME_HEADER_SIZE: usize = 4;

/// Default maximum body size (64 MB, comfortably above the largest
/// deliverable product).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Write one framed message.
pub fn write_frame<W: Write>(w: &mut W, body: &[u8]) -> io::Result<()> {
    let len = u32::try_from(body.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame body too large"))?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(body)?;
    w.flush()
}

/// Read one framed message, reusing `buf` for the body.
///
/// Returns `Ok(None)` on clean EOF at a frame boundary; EOF inside a
/// frame is an error.
pub fn read_frame<R: Read>(r: &mut R, buf: &mut Vec<u8>, max_size: usize) -> io::Result<Option<usize>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match read_exact_or_eof(r, &mut header)? {
        ReadOutcome::Eof => return Ok(None),
        ReadOutcome::Full => {}
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > max_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit {max_size}"),
        ));
    }
    buf.resize(len, 0);
    r.read_exact(buf)?;
    Ok(Some(len))
}

enum ReadOutcome {
    Full,
    Eof,
}

/// read_exact, except a clean EOF before the first byte is reported
/// rather than erroring.
fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(ReadOutcome::Eof),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(ReadOutcome::Full)
}
