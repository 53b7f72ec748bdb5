// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// Wire-level failures produced while framing or parsing OBEX packets.
///
/// Every variant belongs to the `Malformed` error class: the session replies
/// `BadRequest`, drops the packet and stays open.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("packet too short: {0} bytes, need at least 3")]
    Truncated(usize),

    #[error("packet length field {0} is smaller than the 3-byte prefix")]
    BadPacketLength(u16),

    #[error("payload of {0} bytes does not fit the 2-byte packet length")]
    PacketOverflow(usize),

    #[error("header 0x{hi:02x} needs {need} bytes but only {have} remain")]
    HeaderOverrun { hi: u8, need: usize, have: usize },

    #[error("header 0x{hi:02x} carries length {len}, below its 3-byte prefix")]
    BadHeaderLength { hi: u8, len: usize },
}
