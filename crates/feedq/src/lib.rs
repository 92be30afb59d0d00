// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! feedq: a persistent, shared, memory-mapped product queue and the
//! multi-process pipeline around it.
//!
//! The queue buffers feed products between networked producers and
//! consumers. Producers reserve, write, and commit content-addressed
//! regions; consumers sequence through the queue by insertion time,
//! filtered by feedtype and identity pattern. Around the queue sit the
//! upstream RPC server, the downstream coordinator (multicast reception
//! with a unicast backstop), the multicast sender manager, the ingest
//! FIFO reader, and the per-product action dispatcher.
//!
//! # Crate map
//!
//! - [`queue`] -- the memory-mapped product queue: reservation protocol,
//!   eviction, sequencing, statistics, verification
//! - [`product`] -- product model, feedtype masks, classes, XDR codec
//! - [`proto`] -- framed RPC control plane, protocol version 7
//! - [`upstream`] -- subscription server
//! - [`downstream`] -- multicast + backstop coordinator
//! - [`mcast`] -- multicast sender manager and sender child
//! - [`dispatch`] -- pattern/action dispatcher
//! - [`ingest`] -- named-FIFO ingest of local files
//! - [`process`] -- signal discipline and child spawning
//! - [`logging`] -- the `log` backend with rotation support
//! - [`config`] -- constants and the environment contract

pub mod config;
pub mod dispatch;
pub mod downstream;
pub mod ingest;
pub mod logging;
pub mod mcast;
pub mod process;
pub mod product;
pub mod proto;
pub mod queue;
pub mod upstream;

pub use product::{Feedtype, Product, ProductClass, ProductInfo, Signature, Timestamp};
pub use queue::{CreateFlags, OpenFlags, ProductQueue, QueueError};
