// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast sender management: per-feedtype singleton sender children, a
//! shared-memory registry of the live set, and the sender child itself.

mod pidmap;
mod sender;
mod sender_mgr;

pub use pidmap::{PidMap, RunningSender, MAX_SENDERS, SENT_LOG_CAPACITY};
pub use sender::{run_sender, DataPlane, DatagramPlane, SenderConfig};
pub use sender_mgr::{
    default_group_for, parse_sender_spec, McastError, SenderInfo, SenderManager,
};

/// Default name of the host-wide sender registry segment.
pub const DEFAULT_SEGMENT: &str = "/feedq_senders";
