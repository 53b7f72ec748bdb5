// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Coalesces transport deliveries into complete OBEX packets.
//!
//! A PUT request may be split across several deliveries, and a stream
//! carrier may cut anywhere, including inside the 3-byte prefix, or hand
//! over more than one packet at once. A single push therefore yields zero
//! or more completed packets.

use bytes::{Bytes, BytesMut};

use crate::models::{
    common::CodecError,
    packet::{PACKET_PREFIX, parse_packet_header},
};

/// One fully reassembled OBEX packet, prefix included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletePacket {
    pub opcode: u8,
    pub packet: Bytes,
}

#[derive(Debug, Default)]
pub struct Reassembler {
    buf: BytesMut,
    total: Option<usize>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// No partial packet is buffered.
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drop any partial packet.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.total = None;
    }

    /// Feed one transport delivery, returning every packet it completed.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<CompletePacket>, CodecError> {
        self.buf.extend_from_slice(data);

        let mut done = Vec::new();
        loop {
            let total = match self.total {
                Some(total) => total,
                None => {
                    if self.buf.len() < PACKET_PREFIX {
                        break;
                    }
                    let (_op, total) = parse_packet_header(&self.buf)?;
                    self.total = Some(total as usize);
                    total as usize
                },
            };

            if self.buf.len() < total {
                break;
            }
            let packet = self.buf.split_to(total).freeze();
            self.total = None;
            done.push(CompletePacket { opcode: packet[0], packet });
        }

        Ok(done)
    }
}
