// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Product model: signatures, metadata, and the data-bearing product itself.
//!
//! A product is one unit of feed data. Its identity on the wire and in the
//! queue is the 16-byte MD5 signature over the data bytes; the identity
//! string is descriptive metadata and is *not* the duplicate key.

mod class;
mod feedtype;
pub mod xdr;

pub use class::{PatternSpec, ProductClass};
pub use feedtype::Feedtype;

use md5::{Digest, Md5};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum length of a product identity string (bytes).
pub const MAX_IDENT_LEN: usize = 255;

/// Maximum length of an origin hostname (bytes).
pub const MAX_ORIGIN_LEN: usize = 255;

/// Wall-clock timestamp with microsecond resolution.
///
/// Ordering is lexicographic on `(sec, usec)`. The `NONE` sentinel sorts
/// before every real timestamp and means "unset".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub sec: i64,
    pub usec: i32,
}

impl Timestamp {
    /// The "unset" sentinel (sorts before all real timestamps).
    pub const NONE: Timestamp = Timestamp {
        sec: i64::MIN,
        usec: 0,
    };

    /// The beginning of time as far as cursors are concerned.
    pub const ZERO: Timestamp = Timestamp { sec: 0, usec: 0 };

    /// The end of time (sorts after all real timestamps).
    pub const MAX: Timestamp = Timestamp {
        sec: i64::MAX,
        usec: 999_999,
    };

    /// Current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => Timestamp {
                sec: d.as_secs() as i64,
                usec: d.subsec_micros() as i32,
            },
            // Clock before the epoch: clamp to zero rather than panic.
            Err(_) => Timestamp::ZERO,
        }
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        *self == Timestamp::NONE
    }

    /// Seconds elapsed from `self` to `later`, saturating at zero.
    #[must_use]
    pub fn age_secs(&self, later: Timestamp) -> u64 {
        if later <= *self {
            return 0;
        }
        let mut sec = later.sec - self.sec;
        if later.usec < self.usec {
            sec -= 1;
        }
        sec.max(0) as u64
    }

    /// Difference `later - self` in whole microseconds, saturating at zero.
    #[must_use]
    pub fn delta_usecs(&self, later: Timestamp) -> u64 {
        if later <= *self {
            return 0;
        }
        let sec = (later.sec - self.sec) as u64;
        let usec = i64::from(later.usec) - i64::from(self.usec);
        (sec * 1_000_000).saturating_add_signed(usec)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "-")
        } else {
            write!(f, "{}.{:06}", self.sec, self.usec)
        }
    }
}

/// 16-byte MD5 product signature.
///
/// The signature is computed over the product *data bytes only* and is the
/// duplicate-detection key throughout the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(pub [u8; 16]);

impl Signature {
    /// Compute the signature of a data buffer.
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(data);
        let digest = hasher.finalize();
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest);
        Signature(out)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for Signature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(format!("signature must be 32 hex digits, got {}", s.len()));
        }
        let mut out = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).map_err(|_| "non-ASCII signature".to_string())?;
            out[i] = u8::from_str_radix(hex, 16).map_err(|e| format!("bad hex digit: {e}"))?;
        }
        Ok(Signature(out))
    }
}

/// Product metadata, carried in the XDR info header ahead of the data bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductInfo {
    /// Arrival time at the first ingest point.
    pub arrival: Timestamp,
    /// MD5 over the data bytes.
    pub signature: Signature,
    /// Hostname of the originating node.
    pub origin: String,
    /// Feed category bitmask.
    pub feedtype: Feedtype,
    /// Originator-assigned sequence number.
    pub seqno: u32,
    /// Identity string (descriptive; not the duplicate key).
    pub ident: String,
    /// Number of data bytes that follow the info header.
    pub size: u32,
}

impl ProductInfo {
    /// Validate the length limits the wire format imposes.
    pub fn validate(&self) -> Result<(), String> {
        if self.ident.len() > MAX_IDENT_LEN {
            return Err(format!(
                "identity too long: {} bytes (max {MAX_IDENT_LEN})",
                self.ident.len()
            ));
        }
        if self.origin.len() > MAX_ORIGIN_LEN {
            return Err(format!(
                "origin too long: {} bytes (max {MAX_ORIGIN_LEN})",
                self.origin.len()
            ));
        }
        Ok(())
    }
}

/// A complete product: info header plus data bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    pub info: ProductInfo,
    pub data: Vec<u8>,
}

impl Product {
    /// Build a product from raw data, computing the signature and stamping
    /// the arrival time with the current clock.
    #[must_use]
    pub fn new(feedtype: Feedtype, ident: &str, origin: &str, seqno: u32, data: Vec<u8>) -> Self {
        let info = ProductInfo {
            arrival: Timestamp::now(),
            signature: Signature::of(&data),
            origin: origin.to_string(),
            feedtype,
            seqno,
            ident: ident.to_string(),
            size: data.len() as u32,
        };
        Product { info, data }
    }
}
