// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! XDR encoding of product info and payloads.
//!
//! The canonical on-disk and on-wire form of a product is the XDR-encoded
//! info header immediately followed by the raw data bytes. XDR is big-endian
//! with every item padded to a 4-byte boundary.

use super::{Feedtype, ProductInfo, Signature, Timestamp, MAX_IDENT_LEN, MAX_ORIGIN_LEN};
use std::fmt;

/// XDR codec error.
#[derive(Debug)]
pub enum XdrError {
    /// Write past the end of the destination buffer.
    Overflow { offset: usize, need: usize },
    /// Read past the end of the source buffer.
    Truncated { offset: usize, need: usize },
    /// Decoded value violates a format constraint.
    Invalid(String),
}

impl fmt::Display for XdrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overflow { offset, need } => {
                write!(f, "XDR encode overflow at offset {offset} (need {need} bytes)")
            }
            Self::Truncated { offset, need } => {
                write!(f, "XDR input truncated at offset {offset} (need {need} bytes)")
            }
            Self::Invalid(reason) => write!(f, "invalid XDR value: {reason}"),
        }
    }
}

impl std::error::Error for XdrError {}

pub type XdrResult<T> = std::result::Result<T, XdrError>;

fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

macro_rules! impl_encode_be {
    ($name:ident, $type:ty, $size:expr) => {
        pub fn $name(&mut self, value: $type) -> XdrResult<()> {
            self.put_bytes(&value.to_be_bytes())
        }
    };
}

macro_rules! impl_decode_be {
    ($name:ident, $type:ty, $size:expr) => {
        pub fn $name(&mut self) -> XdrResult<$type> {
            let mut bytes = [0u8; $size];
            bytes.copy_from_slice(self.take($size)?);
            Ok(<$type>::from_be_bytes(bytes))
        }
    };
}

/// Bounds-checked XDR writer over a caller-supplied buffer.
pub struct XdrEncoder<'a> {
    buffer: &'a mut [u8],
    offset: usize,
}

impl<'a> XdrEncoder<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self { buffer, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    impl_encode_be!(put_u32, u32, 4);
    impl_encode_be!(put_i32, i32, 4);
    impl_encode_be!(put_i64, i64, 8);
    impl_encode_be!(put_u64, u64, 8);

    pub fn put_bytes(&mut self, data: &[u8]) -> XdrResult<()> {
        if self.offset + data.len() > self.buffer.len() {
            return Err(XdrError::Overflow {
                offset: self.offset,
                need: data.len(),
            });
        }
        self.buffer[self.offset..self.offset + data.len()].copy_from_slice(data);
        self.offset += data.len();
        Ok(())
    }

    /// Fixed-length opaque: bytes with trailing zero pad to a 4-byte boundary.
    pub fn put_opaque_fixed(&mut self, data: &[u8]) -> XdrResult<()> {
        self.put_bytes(data)?;
        self.put_pad(pad4(data.len()) - data.len())
    }

    /// Counted string: u32 length, bytes, zero pad.
    pub fn put_string(&mut self, s: &str) -> XdrResult<()> {
        self.put_u32(s.len() as u32)?;
        self.put_opaque_fixed(s.as_bytes())
    }

    fn put_pad(&mut self, n: usize) -> XdrResult<()> {
        if self.offset + n > self.buffer.len() {
            return Err(XdrError::Overflow {
                offset: self.offset,
                need: n,
            });
        }
        for b in &mut self.buffer[self.offset..self.offset + n] {
            *b = 0;
        }
        self.offset += n;
        Ok(())
    }
}

/// Bounds-checked XDR reader.
pub struct XdrDecoder<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl<'a> XdrDecoder<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.offset)
    }

    impl_decode_be!(get_u32, u32, 4);
    impl_decode_be!(get_i32, i32, 4);
    impl_decode_be!(get_i64, i64, 8);
    impl_decode_be!(get_u64, u64, 8);

    pub fn take(&mut self, len: usize) -> XdrResult<&'a [u8]> {
        if self.offset + len > self.buffer.len() {
            return Err(XdrError::Truncated {
                offset: self.offset,
                need: len,
            });
        }
        let slice = &self.buffer[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    pub fn get_opaque_fixed(&mut self, len: usize) -> XdrResult<&'a [u8]> {
        let data = self.take(len)?;
        let pad = pad4(len) - len;
        if pad > 0 {
            self.take(pad)?;
        }
        Ok(data)
    }

    pub fn get_string(&mut self, max_len: usize) -> XdrResult<String> {
        let len = self.get_u32()? as usize;
        if len > max_len {
            return Err(XdrError::Invalid(format!(
                "string of {len} bytes exceeds limit {max_len}"
            )));
        }
        let bytes = self.get_opaque_fixed(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| XdrError::Invalid("string is not UTF-8".into()))
    }
}

/// Encoded size of a product info header.
#[must_use]
pub fn info_encoded_len(info: &ProductInfo) -> usize {
    // arrival(8+4 -> padded 12+pad? see encode: i64 + i32 + i32 pad), sig 16,
    // origin, feedtype 4, seqno 4, ident, size 4.
    8 + 4 + 4 + 16 + 4 + pad4(info.origin.len()) + 4 + 4 + 4 + pad4(info.ident.len()) + 4
}

/// Total encoded size of a product (info header + data bytes).
#[must_use]
pub fn product_encoded_len(info: &ProductInfo) -> usize {
    info_encoded_len(info) + info.size as usize
}

/// Encode an info header at the front of `buf`; returns the bytes written.
pub fn encode_info(info: &ProductInfo, buf: &mut [u8]) -> XdrResult<usize> {
    info.validate().map_err(XdrError::Invalid)?;
    let mut enc = XdrEncoder::new(buf);
    enc.put_i64(info.arrival.sec)?;
    enc.put_i32(info.arrival.usec)?;
    enc.put_i32(0)?; // alignment slot, keeps the signature 8-aligned
    enc.put_opaque_fixed(info.signature.as_bytes())?;
    enc.put_string(&info.origin)?;
    enc.put_u32(info.feedtype.bits())?;
    enc.put_u32(info.seqno)?;
    enc.put_string(&info.ident)?;
    enc.put_u32(info.size)?;
    Ok(enc.offset())
}

/// Decode an info header from the front of `buf`; returns the info and the
/// number of header bytes consumed. The data bytes follow at that offset.
pub fn decode_info(buf: &[u8]) -> XdrResult<(ProductInfo, usize)> {
    let mut dec = XdrDecoder::new(buf);
    let sec = dec.get_i64()?;
    let usec = dec.get_i32()?;
    let _pad = dec.get_i32()?;
    let sig_bytes = dec.get_opaque_fixed(16)?;
    let mut sig = [0u8; 16];
    sig.copy_from_slice(sig_bytes);
    let origin = dec.get_string(MAX_ORIGIN_LEN)?;
    let feedtype = Feedtype(dec.get_u32()?);
    let seqno = dec.get_u32()?;
    let ident = dec.get_string(MAX_IDENT_LEN)?;
    let size = dec.get_u32()?;
    let info = ProductInfo {
        arrival: Timestamp { sec, usec },
        signature: Signature(sig),
        origin,
        feedtype,
        seqno,
        ident,
        size,
    };
    Ok((info, dec.offset()))
}

/// Encode a full product (info + data) into `buf`; returns bytes written.
pub fn encode_product(info: &ProductInfo, data: &[u8], buf: &mut [u8]) -> XdrResult<usize> {
    if data.len() != info.size as usize {
        return Err(XdrError::Invalid(format!(
            "info.size {} disagrees with data length {}",
            info.size,
            data.len()
        )));
    }
    let n = encode_info(info, buf)?;
    let end = n + data.len();
    if end > buf.len() {
        return Err(XdrError::Overflow {
            offset: n,
            need: data.len(),
        });
    }
    buf[n..end].copy_from_slice(data);
    Ok(end)
}

/// Decode a full product from `buf`.
pub fn decode_product(buf: &[u8]) -> XdrResult<(ProductInfo, &[u8])> {
    let (info, hdr_len) = decode_info(buf)?;
    let end = hdr_len + info.size as usize;
    if end > buf.len() {
        return Err(XdrError::Truncated {
            offset: hdr_len,
            need: info.size as usize,
        });
    }
    Ok((info, &buf[hdr_len..end]))
}
