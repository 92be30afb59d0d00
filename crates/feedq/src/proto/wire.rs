// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control-plane message set, protocol version 7.
//!
//! A message body is a u32 tag followed by the XDR-encoded payload.
//! Product payloads reuse the canonical product encoding, so a delivered
//! product's bytes are exactly what the queue stores.

use super::ProtoError;
use crate::product::xdr::{self, XdrDecoder, XdrEncoder};
use crate::product::{Feedtype, PatternSpec, Product, ProductClass, ProductInfo, Timestamp};
use std::net::Ipv4Addr;

/// Control-plane protocol version carried in `Subscribe`.
pub const PROTO_VERSION: u32 = 7;

const MSG_SUBSCRIBE: u32 = 1;
const MSG_SUBSCRIBE_ACK: u32 = 2;
const MSG_BAD_REQ: u32 = 3;
const MSG_REQUEST_MISSED: u32 = 4;
const MSG_REQUEST_BACKLOG: u32 = 5;
const MSG_DELIVER_PRODUCT: u32 = 6;
const MSG_MISSED_PRODUCT: u32 = 7;
const MSG_END_BACKLOG: u32 = 8;
const MSG_HEARTBEAT: u32 = 9;

const MAX_PATTERN_WIRE_LEN: usize = 512;
const MAX_REASON_LEN: usize = 256;
const MAX_CLASS_SPECS: u32 = 64;

/// Wire form of a product class: time window plus `(feedtype, pattern)`
/// pairs. Patterns travel as text; the receiver compiles them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassSpec {
    pub from: Timestamp,
    pub to: Timestamp,
    pub specs: Vec<(Feedtype, String)>,
}

impl ClassSpec {
    /// Capture a compiled class for the wire.
    #[must_use]
    pub fn from_class(class: &ProductClass) -> ClassSpec {
        ClassSpec {
            from: class.from,
            to: class.to,
            specs: class
                .specs
                .iter()
                .map(|s| (s.feedtype, s.pattern.clone()))
                .collect(),
        }
    }

    /// Compile into a matchable class.
    pub fn compile(&self) -> Result<ProductClass, String> {
        let mut specs = Vec::with_capacity(self.specs.len());
        for (feedtype, pattern) in &self.specs {
            specs.push(PatternSpec::new(*feedtype, pattern)?);
        }
        Ok(ProductClass {
            from: self.from,
            to: self.to,
            specs,
        })
    }

    fn encoded_len(&self) -> usize {
        // from + to (16 each) + count + per-spec (feedtype + string).
        16 + 16 + 4 + self.specs.iter().map(|(_, p)| 4 + 4 + (p.len() + 3) / 4 * 4).sum::<usize>()
    }
}

/// A multicast data-plane endpoint offered with a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McastEndpoint {
    /// Multicast group address.
    pub group: Ipv4Addr,
    /// Multicast UDP port.
    pub port: u16,
    /// Sender's TCP port for block retransmission.
    pub tcp_port: u16,
}

/// Control-plane messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Open a session for products matching the class.
    Subscribe { version: u32, class: ClassSpec },
    /// Session granted, with the multicast endpoint when one serves the
    /// subscribed feed.
    SubscribeAck {
        session: u32,
        mcast: Option<McastEndpoint>,
    },
    /// Subscription refused.
    BadReq { reason: String },
    /// Downstream asks for a product its multicast receiver missed.
    RequestMissed { index: u64 },
    /// Downstream asks for everything since its last received product.
    RequestBacklog { since: Timestamp },
    /// Streamed product (subscription and backlog path).
    DeliverProduct { info: ProductInfo, data: Vec<u8> },
    /// Reply to `RequestMissed`; installed without a wakeup signal.
    MissedProduct {
        index: u64,
        info: ProductInfo,
        data: Vec<u8>,
    },
    /// The backlog scan is complete.
    EndBacklog,
    /// Keep-alive.
    Heartbeat,
}

fn put_timestamp(enc: &mut XdrEncoder<'_>, t: Timestamp) -> Result<(), ProtoError> {
    enc.put_i64(t.sec)?;
    enc.put_i32(t.usec)?;
    enc.put_i32(0)?;
    Ok(())
}

fn get_timestamp(dec: &mut XdrDecoder<'_>) -> Result<Timestamp, ProtoError> {
    let sec = dec.get_i64()?;
    let usec = dec.get_i32()?;
    let _pad = dec.get_i32()?;
    Ok(Timestamp { sec, usec })
}

/// Encode a message into a frame body.
pub fn encode(msg: &Message) -> Result<Vec<u8>, ProtoError> {
    let cap = 4 + match msg {
        Message::Subscribe { class, .. } => 4 + class.encoded_len(),
        Message::SubscribeAck { .. } => 4 + 4 + 12,
        Message::BadReq { reason } => 4 + reason.len() + 8,
        Message::RequestMissed { .. } => 8,
        Message::RequestBacklog { .. } => 16,
        Message::DeliverProduct { info, .. } => xdr::product_encoded_len(info),
        Message::MissedProduct { info, .. } => 8 + xdr::product_encoded_len(info),
        Message::EndBacklog | Message::Heartbeat => 0,
    };
    let mut buf = vec![0u8; cap];
    let mut enc = XdrEncoder::new(&mut buf);

    match msg {
        Message::Subscribe { version, class } => {
            enc.put_u32(MSG_SUBSCRIBE)?;
            enc.put_u32(*version)?;
            put_timestamp(&mut enc, class.from)?;
            put_timestamp(&mut enc, class.to)?;
            enc.put_u32(class.specs.len() as u32)?;
            for (feedtype, pattern) in &class.specs {
                enc.put_u32(feedtype.bits())?;
                enc.put_string(pattern)?;
            }
        }
        Message::SubscribeAck { session, mcast } => {
            enc.put_u32(MSG_SUBSCRIBE_ACK)?;
            enc.put_u32(*session)?;
            match mcast {
                Some(ep) => {
                    enc.put_u32(1)?;
                    enc.put_u32(u32::from(ep.group))?;
                    enc.put_u32(u32::from(ep.port))?;
                    enc.put_u32(u32::from(ep.tcp_port))?;
                }
                None => enc.put_u32(0)?,
            }
        }
        Message::BadReq { reason } => {
            enc.put_u32(MSG_BAD_REQ)?;
            enc.put_string(reason)?;
        }
        Message::RequestMissed { index } => {
            enc.put_u32(MSG_REQUEST_MISSED)?;
            enc.put_u64(*index)?;
        }
        Message::RequestBacklog { since } => {
            enc.put_u32(MSG_REQUEST_BACKLOG)?;
            put_timestamp(&mut enc, *since)?;
        }
        Message::DeliverProduct { info, data } => {
            enc.put_u32(MSG_DELIVER_PRODUCT)?;
            let offset = enc.offset();
            let n = xdr::encode_product(info, data, &mut buf[offset..])?;
            buf.truncate(offset + n);
            return Ok(buf);
        }
        Message::MissedProduct { index, info, data } => {
            enc.put_u32(MSG_MISSED_PRODUCT)?;
            enc.put_u64(*index)?;
            let offset = enc.offset();
            let n = xdr::encode_product(info, data, &mut buf[offset..])?;
            buf.truncate(offset + n);
            return Ok(buf);
        }
        Message::EndBacklog => enc.put_u32(MSG_END_BACKLOG)?,
        Message::Heartbeat => enc.put_u32(MSG_HEARTBEAT)?,
    }
    let len = enc.offset();
    buf.truncate(len);
    Ok(buf)
}

/// Decode a frame body.
pub fn decode(body: &[u8]) -> Result<Message, ProtoError> {
    let mut dec = XdrDecoder::new(body);
    let tag = dec.get_u32()?;
    match tag {
        MSG_SUBSCRIBE => {
            let version = dec.get_u32()?;
            let from = get_timestamp(&mut dec)?;
            let to = get_timestamp(&mut dec)?;
            let count = dec.get_u32()?;
            if count > MAX_CLASS_SPECS {
                return Err(ProtoError::Malformed(format!(
                    "class carries {count} specs (limit {MAX_CLASS_SPECS})"
                )));
            }
            let mut specs = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let feedtype = Feedtype(dec.get_u32()?);
                let pattern = dec.get_string(MAX_PATTERN_WIRE_LEN)?;
                specs.push((feedtype, pattern));
            }
            Ok(Message::Subscribe {
                version,
                class: ClassSpec { from, to, specs },
            })
        }
        MSG_SUBSCRIBE_ACK => {
            let session = dec.get_u32()?;
            let mcast = if dec.get_u32()? != 0 {
                let group = Ipv4Addr::from(dec.get_u32()?);
                let port = dec.get_u32()?;
                let tcp_port = dec.get_u32()?;
                Some(McastEndpoint {
                    group,
                    port: port as u16,
                    tcp_port: tcp_port as u16,
                })
            } else {
                None
            };
            Ok(Message::SubscribeAck { session, mcast })
        }
        MSG_BAD_REQ => Ok(Message::BadReq {
            reason: dec.get_string(MAX_REASON_LEN)?,
        }),
        MSG_REQUEST_MISSED => Ok(Message::RequestMissed {
            index: dec.get_u64()?,
        }),
        MSG_REQUEST_BACKLOG => Ok(Message::RequestBacklog {
            since: get_timestamp(&mut dec)?,
        }),
        MSG_DELIVER_PRODUCT => {
            let (info, data) = xdr::decode_product(&body[dec.offset()..])?;
            Ok(Message::DeliverProduct {
                info,
                data: data.to_vec(),
            })
        }
        MSG_MISSED_PRODUCT => {
            let index = dec.get_u64()?;
            let (info, data) = xdr::decode_product(&body[dec.offset()..])?;
            Ok(Message::MissedProduct {
                index,
                info,
                data: data.to_vec(),
            })
        }
        MSG_END_BACKLOG => Ok(Message::EndBacklog),
        MSG_HEARTBEAT => Ok(Message::Heartbeat),
        other => Err(ProtoError::UnknownTag(other)),
    }
}

/// Build a `DeliverProduct` from an owned product.
#[must_use]
pub fn deliver(product: &Product) -> Message {
    Message::DeliverProduct {
        info: product.info.clone(),
        data: product.data.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_class() -> ClassSpec {
        ClassSpec {
            from: Timestamp { sec: 100, usec: 1 },
            to: Timestamp::MAX,
            specs: vec![
                (Feedtype::RADAR, "^NEXRAD".to_string()),
                (Feedtype::TEXT, ".*".to_string()),
            ],
        }
    }

    #[test]
    fn test_subscribe_roundtrip() {
        let msg = Message::Subscribe {
            version: PROTO_VERSION,
            class: sample_class(),
        };
        let body = encode(&msg).expect("encode");
        assert_eq!(decode(&body).expect("decode"), msg);
    }

    #[test]
    fn test_ack_roundtrip_with_and_without_endpoint() {
        let with = Message::SubscribeAck {
            session: 7,
            mcast: Some(McastEndpoint {
                group: Ipv4Addr::new(239, 128, 4, 1),
                port: 4100,
                tcp_port: 38800,
            }),
        };
        let without = Message::SubscribeAck {
            session: 8,
            mcast: None,
        };
        for msg in [with, without] {
            let body = encode(&msg).expect("encode");
            assert_eq!(decode(&body).expect("decode"), msg);
        }
    }

    #[test]
    fn test_product_delivery_roundtrip() {
        let p = Product::new(Feedtype::GRID, "GFS F120", "up.example", 9, b"grib".to_vec());
        let msg = deliver(&p);
        let body = encode(&msg).expect("encode");
        match decode(&body).expect("decode") {
            Message::DeliverProduct { info, data } => {
                assert_eq!(info, p.info);
                assert_eq!(data, p.data);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_missed_product_roundtrip() {
        let p = Product::new(Feedtype::TEXT, "SAUS44", "up.example", 3, b"obs".to_vec());
        let msg = Message::MissedProduct {
            index: 41,
            info: p.info.clone(),
            data: p.data.clone(),
        };
        let body = encode(&msg).expect("encode");
        assert_eq!(decode(&body).expect("decode"), msg);
    }

    #[test]
    fn test_plain_messages_roundtrip() {
        for msg in [
            Message::RequestMissed { index: 123 },
            Message::RequestBacklog {
                since: Timestamp { sec: 55, usec: 9 },
            },
            Message::EndBacklog,
            Message::Heartbeat,
            Message::BadReq {
                reason: "unsupported version".to_string(),
            },
        ] {
            let body = encode(&msg).expect("encode");
            assert_eq!(decode(&body).expect("decode"), msg);
        }
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let body = 0xdead_beefu32.to_be_bytes().to_vec();
        assert!(matches!(decode(&body), Err(ProtoError::UnknownTag(_))));
    }

    #[test]
    fn test_class_spec_compiles() {
        let class = sample_class().compile().expect("compile");
        assert!(class.meta_matches(Feedtype::RADAR, "NEXRAD3 KTLX"));
        assert!(!class.meta_matches(Feedtype::GRID, "NEXRAD3 KTLX"));
    }
}
