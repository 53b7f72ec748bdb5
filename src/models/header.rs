// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Typed OBEX headers, IrOBEX 1.2 § 2.1–2.2.
//!
//! The two high bits of every header identifier (`HI`) select the encoding:
//!
//! ```text
//! 0b00 – null-terminated UTF-16BE text, 2-byte length prefix
//! 0b01 – byte sequence, 2-byte length prefix
//! 0b10 – single byte value
//! 0b11 – 4-byte big-endian value
//! ```
//!
//! The 2-byte length of the variable encodings *includes* the 3-byte header
//! prefix itself. Unknown headers are carried through by length so a header
//! set re-encodes to the bytes it was parsed from.

use bytes::{BufMut, Bytes, BytesMut};

use crate::models::common::CodecError;

/// Header identifiers the engine emits or interprets.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderId {
    Name = 0x01,
    Type = 0x42,
    Length = 0xC3,
    Body = 0x48,
    EndOfBody = 0x49,
}

/// One decoded OBEX header. `Unknown` keeps the raw content of headers the
/// engine has no use for, so they survive a parse/encode round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObexHeader {
    Name(String),
    Type(String),
    Length(u32),
    Body(Bytes),
    EndOfBody(Bytes),
    Unknown { hi: u8, data: Bytes },
}

/// Ordered list of typed headers, as they appeared on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    headers: Vec<ObexHeader>,
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, header: ObexHeader) {
        self.headers.push(header);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObexHeader> {
        self.headers.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// First `Name` header, if any.
    pub fn name(&self) -> Option<&str> {
        self.headers.iter().find_map(|h| match h {
            ObexHeader::Name(n) => Some(n.as_str()),
            _ => None,
        })
    }

    /// First `Type` header, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.iter().find_map(|h| match h {
            ObexHeader::Type(t) => Some(t.as_str()),
            _ => None,
        })
    }

    /// First `Length` header, if any.
    pub fn length(&self) -> Option<u32> {
        self.headers.iter().find_map(|h| match h {
            ObexHeader::Length(len) => Some(*len),
            _ => None,
        })
    }

    /// Body content of this packet: `Body` or `EndOfBody`, whichever came
    /// first. OPP peers send exactly one per PUT.
    pub fn body(&self) -> Option<&Bytes> {
        self.headers.iter().find_map(|h| match h {
            ObexHeader::Body(b) | ObexHeader::EndOfBody(b) => Some(b),
            _ => None,
        })
    }

    /// Walk the header region of a packet, yielding typed headers.
    pub fn parse(buf: &[u8]) -> Result<Self, CodecError> {
        let mut set = Self::new();
        let mut i = 0usize;

        while i < buf.len() {
            let hi = buf[i];
            let left = buf.len() - i;

            match hi & 0xC0 {
                // Variable-length encodings: unicode text and byte sequence.
                0x00 | 0x40 => {
                    if left < 3 {
                        return Err(CodecError::HeaderOverrun { hi, need: 3, have: left });
                    }
                    let hlen = u16::from_be_bytes([buf[i + 1], buf[i + 2]]) as usize;
                    if hlen < 3 {
                        return Err(CodecError::BadHeaderLength { hi, len: hlen });
                    }
                    if hlen > left {
                        return Err(CodecError::HeaderOverrun { hi, need: hlen, have: left });
                    }
                    let content = &buf[i + 3..i + hlen];
                    set.push(match hi {
                        x if x == HeaderId::Name as u8 => {
                            ObexHeader::Name(decode_utf16be(content))
                        },
                        x if x == HeaderId::Type as u8 => {
                            ObexHeader::Type(decode_ascii(content))
                        },
                        x if x == HeaderId::Body as u8 => {
                            ObexHeader::Body(Bytes::copy_from_slice(content))
                        },
                        x if x == HeaderId::EndOfBody as u8 => {
                            ObexHeader::EndOfBody(Bytes::copy_from_slice(content))
                        },
                        _ => ObexHeader::Unknown {
                            hi,
                            data: Bytes::copy_from_slice(content),
                        },
                    });
                    i += hlen;
                },
                // Single byte value.
                0x80 => {
                    if left < 2 {
                        return Err(CodecError::HeaderOverrun { hi, need: 2, have: left });
                    }
                    set.push(ObexHeader::Unknown {
                        hi,
                        data: Bytes::copy_from_slice(&buf[i + 1..i + 2]),
                    });
                    i += 2;
                },
                // 4-byte big-endian value.
                _ => {
                    if left < 5 {
                        return Err(CodecError::HeaderOverrun { hi, need: 5, have: left });
                    }
                    let value = u32::from_be_bytes([
                        buf[i + 1],
                        buf[i + 2],
                        buf[i + 3],
                        buf[i + 4],
                    ]);
                    if hi == HeaderId::Length as u8 {
                        set.push(ObexHeader::Length(value));
                    } else {
                        set.push(ObexHeader::Unknown {
                            hi,
                            data: Bytes::copy_from_slice(&buf[i + 1..i + 5]),
                        });
                    }
                    i += 5;
                },
            }
        }

        Ok(set)
    }

    /// Append the wire form of every header to `out`, in order.
    pub fn encode_into(&self, out: &mut BytesMut) -> Result<(), CodecError> {
        for header in &self.headers {
            append_header(out, header)?;
        }
        Ok(())
    }
}

/// Append one header in wire form.
pub fn append_header(out: &mut BytesMut, header: &ObexHeader) -> Result<(), CodecError> {
    match header {
        ObexHeader::Name(name) => {
            let encoded = encode_utf16be(name);
            put_var_header(out, HeaderId::Name as u8, &encoded)?;
        },
        ObexHeader::Type(t) => {
            let mut encoded = Vec::with_capacity(t.len() + 1);
            encoded.extend_from_slice(t.as_bytes());
            encoded.push(0);
            put_var_header(out, HeaderId::Type as u8, &encoded)?;
        },
        ObexHeader::Length(len) => {
            out.put_u8(HeaderId::Length as u8);
            out.put_u32(*len);
        },
        ObexHeader::Body(body) => put_var_header(out, HeaderId::Body as u8, body)?,
        ObexHeader::EndOfBody(body) => {
            put_var_header(out, HeaderId::EndOfBody as u8, body)?
        },
        ObexHeader::Unknown { hi, data } => match hi & 0xC0 {
            0x00 | 0x40 => put_var_header(out, *hi, data)?,
            _ => {
                out.put_u8(*hi);
                out.extend_from_slice(data);
            },
        },
    }
    Ok(())
}

fn put_var_header(out: &mut BytesMut, hi: u8, content: &[u8]) -> Result<(), CodecError> {
    let hlen = content.len() + 3;
    if hlen > u16::MAX as usize {
        return Err(CodecError::PacketOverflow(content.len()));
    }
    out.put_u8(hi);
    out.put_u16(hlen as u16);
    out.extend_from_slice(content);
    Ok(())
}

/// UTF-16BE with a trailing U+0000 code unit, per IrOBEX name headers.
fn encode_utf16be(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity((s.len() + 1) * 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_be_bytes());
    }
    out.extend_from_slice(&[0, 0]);
    out
}

fn decode_utf16be(data: &[u8]) -> String {
    let mut units: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    while units.last() == Some(&0) {
        units.pop();
    }
    String::from_utf16_lossy(&units)
}

fn decode_ascii(data: &[u8]) -> String {
    let trimmed = match data.iter().position(|&b| b == 0) {
        Some(pos) => &data[..pos],
        None => data,
    };
    String::from_utf8_lossy(trimmed).into_owned()
}
