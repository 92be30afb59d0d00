// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RPC control plane: framing and the version-7 message set.
//!
//! The control plane runs over TCP with length-prefixed frames; the data
//! plane is either these same frames (unicast delivery and backstop) or
//! multicast with an external reliability layer feeding the downstream
//! coordinator's callbacks.

pub mod frame;
mod wire;

pub use frame::{read_frame, write_frame, DEFAULT_MAX_MESSAGE_SIZE, FRAME_HEADER_SIZE};
pub use wire::{decode, deliver, encode, ClassSpec, McastEndpoint, Message, PROTO_VERSION};

use crate::product::xdr::XdrError;
use std::fmt;
use std::io;

/// Control-plane failures.
#[derive(Debug)]
pub enum ProtoError {
    /// Transport-level failure.
    Io(io::Error),
    /// Body fails to encode or decode.
    Xdr(XdrError),
    /// Message carries an unknown tag.
    UnknownTag(u32),
    /// Structurally valid XDR that violates a message constraint.
    Malformed(String),
    /// Peer speaks an unsupported protocol version.
    Version(u32),
    /// Peer closed the connection.
    Closed,
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "transport error: {e}"),
            Self::Xdr(e) => write!(f, "codec error: {e}"),
            Self::UnknownTag(tag) => write!(f, "unknown message tag {tag}"),
            Self::Malformed(reason) => write!(f, "malformed message: {reason}"),
            Self::Version(v) => write!(f, "unsupported protocol version {v}"),
            Self::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ProtoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Xdr(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ProtoError {
    fn from(e: io::Error) -> Self {
        ProtoError::Io(e)
    }
}

impl From<XdrError> for ProtoError {
    fn from(e: XdrError) -> Self {
        ProtoError::Xdr(e)
    }
}

/// Write one message as a frame.
pub fn send<W: io::Write>(w: &mut W, msg: &Message) -> Result<(), ProtoError> {
    let body = encode(msg)?;
    frame::write_frame(w, &body)?;
    Ok(())
}

/// Read one message; `Closed` on clean EOF.
pub fn recv<R: io::Read>(r: &mut R, buf: &mut Vec<u8>) -> Result<Message, ProtoError> {
    match frame::read_frame(r, buf, DEFAULT_MAX_MESSAGE_SIZE)? {
        None => Err(ProtoError::Closed),
        Some(len) => decode(&buf[..len]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_send_recv_over_stream() {
        let mut wire = Vec::new();
        send(&mut wire, &Message::Heartbeat).expect("send");
        send(&mut wire, &Message::RequestMissed { index: 5 }).expect("send");

        let mut r = Cursor::new(wire);
        let mut buf = Vec::new();
        assert_eq!(recv(&mut r, &mut buf).expect("recv"), Message::Heartbeat);
        assert_eq!(
            recv(&mut r, &mut buf).expect("recv"),
            Message::RequestMissed { index: 5 }
        );
        assert!(matches!(recv(&mut r, &mut buf), Err(ProtoError::Closed)));
    }
}
