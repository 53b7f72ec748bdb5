// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Helpers for encoding / decoding the very first byte of every OBEX packet.
//!
//! The byte layout is defined by IrOBEX 1.2 § 3.3:
//!
//! ```text
//!  7   6   5   4   3   2   1   0      bit position
//! +---+---------------------------+
//! | F |        OPCODE (7 bits)    |  ← first packet octet
//! +---+---------------------------+
//! ```
//!
//! * **F** – *Final* flag. Marks the last packet of a multi-packet operation;
//!   response codes are emitted with it set except for replies to non-final
//!   requests.
//! * **OPCODE** – operation (request) or status (response) code.

use std::convert::TryFrom;

use thiserror::Error;

/// High bit of the opcode byte, IrOBEX "Final" flag.
pub const FINAL_BIT: u8 = 0x80;

/// Request opcodes the engine recognizes. `Put` is the only one where the
/// Final flag changes the code's identity (`Put` vs `PutFinal`).
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RequestCode {
    #[default]
    Connect = 0x80,
    Disconnect = 0x81,
    Put = 0x02,
    PutFinal = 0x82,
    Get = 0x03,
    GetFinal = 0x83,
    SetPath = 0x85,
    Abort = 0xFF,
}

impl RequestCode {
    #[inline]
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x80 => Self::Connect,
            0x81 => Self::Disconnect,
            0x02 => Self::Put,
            0x82 => Self::PutFinal,
            0x03 => Self::Get,
            0x83 => Self::GetFinal,
            0x85 => Self::SetPath,
            0xFF => Self::Abort,
            _ => return None,
        })
    }

    /// `true` for `Put`/`PutFinal`, the only multi-packet requests in OPP.
    #[inline]
    pub const fn is_put(self) -> bool {
        matches!(self, Self::Put | Self::PutFinal)
    }

    #[inline]
    pub const fn is_final(self) -> bool {
        (self as u8) & FINAL_BIT != 0
    }
}

/// Response codes the engine emits or expects, Final bit included.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Continue = 0x90,
    #[default]
    Success = 0xA0,
    BadRequest = 0xC0,
    Unauthorized = 0xC1,
    NotImplemented = 0xD1,
}

impl ResponseCode {
    #[inline]
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x90 => Self::Continue,
            0xA0 => Self::Success,
            0xC0 => Self::BadRequest,
            0xC1 => Self::Unauthorized,
            0xD1 => Self::NotImplemented,
            _ => return None,
        })
    }

    /// Raw status byte, with the Final bit cleared when replying to a
    /// non-final request.
    #[inline]
    pub const fn with_final(self, final_bit: bool) -> u8 {
        if final_bit {
            self as u8
        } else {
            (self as u8) & !FINAL_BIT
        }
    }
}

/// Returned when the opcode byte carries a code the engine does not know.
#[derive(Debug, Error)]
#[error("unknown OBEX opcode: 0x{0:02x}")]
pub struct UnknownOpcode(pub u8);

impl TryFrom<u8> for RequestCode {
    type Error = UnknownOpcode;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_u8(byte).ok_or(UnknownOpcode(byte))
    }
}

impl TryFrom<u8> for ResponseCode {
    type Error = UnknownOpcode;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_u8(byte).ok_or(UnknownOpcode(byte))
    }
}
