// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! OBEX packet framing: `op(1) | length(2, big-endian) | payload`.
//!
//! The 2-byte length counts the whole packet, prefix included. CONNECT
//! requests and replies carry four fixed field bytes in front of their
//! headers: `version(1) | flags(1) | max-packet(2)`.

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16,
};

use crate::models::common::CodecError;

/// Maximum OBEX packet size this end advertises in CONNECT traffic.
pub const MAX_PACKET_LENGTH: u16 = 0xFFFE;

/// Prefix of every OBEX packet: opcode plus the 2-byte length.
pub const PACKET_PREFIX: usize = 3;

/// Bytes of a PUT packet that are not body payload:
/// `[opcode:1][packet length:2][headerId:1][header length:2]`.
pub const PUT_HEADER_OVERHEAD: usize = 6;

/// OBEX protocol version 1.0, as encoded in CONNECT field bytes.
pub const OBEX_VERSION: u8 = 0x10;

/// Frame `payload` into a full packet with the given opcode byte.
pub fn frame(opcode: u8, payload: &[u8]) -> Result<Bytes, CodecError> {
    let total = payload.len() + PACKET_PREFIX;
    if total > u16::MAX as usize {
        return Err(CodecError::PacketOverflow(payload.len()));
    }

    let mut out = BytesMut::with_capacity(total);
    out.put_u8(opcode);
    out.put_u16(total as u16);
    out.extend_from_slice(payload);
    Ok(out.freeze())
}

/// Read the opcode byte and total packet length off the front of a delivery.
pub fn parse_packet_header(buf: &[u8]) -> Result<(u8, u16), CodecError> {
    if buf.len() < PACKET_PREFIX {
        return Err(CodecError::Truncated(buf.len()));
    }
    let total = u16::from_be_bytes([buf[1], buf[2]]);
    if (total as usize) < PACKET_PREFIX {
        return Err(CodecError::BadPacketLength(total));
    }
    Ok((buf[0], total))
}

/// Fixed field block of CONNECT requests and replies, IrOBEX 1.2 § 3.3.1.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, Eq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ConnectFields {
    pub version: u8,
    pub flags: u8,
    pub max_packet: U16<BigEndian>,
}

impl ConnectFields {
    pub const LEN: usize = 4;

    /// The field block this end sends: version 1.0, no flags, the
    /// compile-time max packet size.
    pub fn local() -> Self {
        Self {
            version: OBEX_VERSION,
            flags: 0,
            max_packet: U16::new(MAX_PACKET_LENGTH),
        }
    }

    /// View the first four payload bytes of a CONNECT packet.
    pub fn parse(payload: &[u8]) -> Result<&Self, CodecError> {
        let (fields, _rest) = Self::ref_from_prefix(payload)
            .map_err(|_| CodecError::Truncated(payload.len()))?;
        Ok(fields)
    }
}
