// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The ingest FIFO: fixed-size product-name-header records.
//!
//! A file-ingest daemon writes one record per arriving file into a named
//! FIFO; the ingest reader turns each record into a product insertion.
//! Records are in host byte order (producer and consumer share the
//! machine by construction) and carry the spool filename of the data.

use std::io::{self, Read};
use std::path::Path;

/// Fixed filename field length.
pub const FILENAME_LEN: usize = 128;

/// On-pipe record size.
pub const RECORD_SIZE: usize = std::mem::size_of::<RawRecord>();

#[repr(C)]
#[derive(Clone, Copy)]
struct RawRecord {
    pipe_insert_time: i64,
    ncf_rcv_time: i64,
    prod_type: i32,
    category: i32,
    code: i32,
    flags: i32,
    orig_seq: i32,
    _pad: i32,
    orig_rcv_time: i64,
    run_id: i32,
    orig_run_id: i32,
    filename: [u8; FILENAME_LEN],
}

/// A decoded product-name-header record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestRecord {
    pub pipe_insert_time: i64,
    pub ncf_rcv_time: i64,
    pub prod_type: i32,
    pub category: i32,
    pub code: i32,
    pub flags: i32,
    pub orig_seq: i32,
    pub orig_rcv_time: i64,
    pub run_id: i32,
    pub orig_run_id: i32,
    pub filename: String,
}

impl IngestRecord {
    /// Decode one record from its fixed-size wire form.
    pub fn decode(bytes: &[u8; RECORD_SIZE]) -> Result<IngestRecord, String> {
        // SAFETY: RawRecord is repr(C) plain-old-data of exactly
        // RECORD_SIZE bytes; any bit pattern is a valid value.
        let raw: RawRecord = unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast()) };
        let name_len = raw
            .filename
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FILENAME_LEN);
        let filename = std::str::from_utf8(&raw.filename[..name_len])
            .map_err(|_| "filename is not UTF-8".to_string())?
            .to_string();
        if filename.is_empty() {
            return Err("empty filename".to_string());
        }
        Ok(IngestRecord {
            pipe_insert_time: raw.pipe_insert_time,
            ncf_rcv_time: raw.ncf_rcv_time,
            prod_type: raw.prod_type,
            category: raw.category,
            code: raw.code,
            flags: raw.flags,
            orig_seq: raw.orig_seq,
            orig_rcv_time: raw.orig_rcv_time,
            run_id: raw.run_id,
            orig_run_id: raw.orig_run_id,
            filename,
        })
    }

    /// Encode into the fixed wire form (producer side and tests).
    pub fn encode(&self) -> Result<[u8; RECORD_SIZE], String> {
        if self.filename.len() >= FILENAME_LEN {
            return Err(format!(
                "filename of {} bytes exceeds field ({FILENAME_LEN})",
                self.filename.len()
            ));
        }
        let mut filename = [0u8; FILENAME_LEN];
        filename[..self.filename.len()].copy_from_slice(self.filename.as_bytes());
        let raw = RawRecord {
            pipe_insert_time: self.pipe_insert_time,
            ncf_rcv_time: self.ncf_rcv_time,
            prod_type: self.prod_type,
            category: self.category,
            code: self.code,
            flags: self.flags,
            orig_seq: self.orig_seq,
            _pad: 0,
            orig_rcv_time: self.orig_rcv_time,
            run_id: self.run_id,
            orig_run_id: self.orig_run_id,
            filename,
        };
        let mut out = [0u8; RECORD_SIZE];
        // SAFETY: RawRecord is plain-old-data of exactly RECORD_SIZE
        // bytes; writing its bytes into a correctly sized array.
        unsafe {
            std::ptr::write_unaligned(out.as_mut_ptr().cast(), raw);
        }
        Ok(out)
    }
}

/// Create the FIFO if it does not exist.
pub fn ensure_fifo(path: &Path, mode: u32) -> io::Result<()> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in path"))?;
    // SAFETY: c_path is a valid NUL-terminated path; mkfifo creates the
    // FIFO or fails with EEXIST, which we accept.
    let ret = unsafe { libc::mkfifo(c_path.as_ptr(), mode as libc::mode_t) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::AlreadyExists {
            return Err(err);
        }
    }
    Ok(())
}

/// Read records from the FIFO until EOF, invoking `handle` per record.
/// Malformed records are logged and skipped; a short trailing read ends
/// the stream.
pub fn read_records<R: Read>(
    reader: &mut R,
    mut handle: impl FnMut(IngestRecord),
) -> io::Result<u64> {
    let mut count = 0u64;
    let mut buf = [0u8; RECORD_SIZE];
    loop {
        let mut filled = 0;
        while filled < RECORD_SIZE {
            match reader.read(&mut buf[filled..]) {
                Ok(0) => {
                    if filled > 0 {
                        log::warn!("ingest pipe: {filled}-byte partial record at EOF");
                    }
                    return Ok(count);
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    if crate::process::signals::terminated() {
                        return Ok(count);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        match IngestRecord::decode(&buf) {
            Ok(record) => {
                handle(record);
                count += 1;
            }
            Err(e) => log::warn!("ingest pipe: skipping malformed record: {e}"),
        }
    }
}
