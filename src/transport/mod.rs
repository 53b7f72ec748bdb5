// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Seams between the protocol engine and the platform's sockets.
//!
//! The engine never owns real Bluetooth plumbing: it consumes framed byte
//! deliveries and emits framed byte packets. A `Platform` supplies listening
//! and connecting links and resolves service channels; every callback goes
//! through the manager's [`OppMailbox`](crate::manager::OppMailbox), so all
//! state stays on the protocol task.

pub mod tcp;

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use bytes::Bytes;

use crate::manager::OppMailbox;

/// Which carrier a listening socket serves. OPP listens on both at once and
/// keeps whichever accepts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Rfcomm,
    L2cap,
}

static LINK_IDS: AtomicU64 = AtomicU64::new(1);

/// Process-unique link identity, so late messages from a dead socket cannot
/// be mistaken for traffic of its successor.
pub fn next_link_id() -> u64 {
    LINK_IDS.fetch_add(1, Ordering::Relaxed)
}

/// One attached, bidirectional, reliable byte-message link.
pub trait Transport: Send {
    /// Identity used to match incoming mailbox posts to this link.
    fn id(&self) -> u64;

    /// Queue one framed packet for delivery.
    fn send(&self, data: Bytes) -> Result<()>;

    /// Tear the link down; a closed post follows through the mailbox.
    fn close(&self);

    fn is_alive(&self) -> bool;
}

/// Keeps a listening socket open; dropping the guard stops accepting.
pub trait ListenerGuard: Send {}

/// Socket and service-discovery services the engine consumes.
///
/// Channel resolution is observer-style, as on the platform this engine
/// descends from: results are posted to the mailbox, never returned inline.
pub trait Platform: Send + Sync {
    /// Open a listening socket for `kind`; accepted links arrive through the
    /// mailbox.
    fn listen(&self, kind: LinkKind, mailbox: OppMailbox) -> Result<Box<dyn ListenerGuard>>;

    /// Resolve the peer's Object Push channel; posts `service_channel`.
    fn get_service_channel(&self, address: &str, mailbox: OppMailbox) -> Result<()>;

    /// Refresh the peer's SDP records; posts `sdp_updated`.
    fn update_sdp_records(&self, address: &str, mailbox: OppMailbox) -> Result<()>;

    /// Connect out to `address` on `channel`; posts `connected` or
    /// `connect_failed`.
    fn connect(&self, address: &str, channel: i32, mailbox: OppMailbox) -> Result<()>;
}
