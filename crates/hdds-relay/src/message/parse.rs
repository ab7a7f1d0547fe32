// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire-to-[`Message`] parser.
//!
//! The parser walks the submessage stream once, producing one record per
//! submessage. Payloads at or below [`INLINE_DATA_MAX`] are copied into the
//! record; larger ones keep a window into the shared receive buffer so the
//! packet is never duplicated.
//!
//! Malformed input drops the whole message: no partial submessage list is
//! ever surfaced.

use crate::guid::GuidPrefix;
use crate::message::{
    entity_is_builtin, DataBuf, Message, SubmsgData, Submessage, SubmsgHeader, TrafficClass,
    INLINE_DATA_MAX, MIN_MESSAGE_SIZE, RTPS_HEADER_SIZE, RTPS_MAGIC, SMF_ENDIAN, SMID_INFO_TS,
    SMID_PAD, SUBMSG_HEADER_SIZE,
};

use std::fmt;

/// Parse failure categories, mirrored into per-connection counters by the
/// receive paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Shorter than header plus one submessage header.
    TooShort,
    /// Header magic is not `RTPS`.
    BadMagic,
    /// A declared submessage length exceeds the remaining buffer.
    LengthOverflow {
        /// Offending submessage id.
        id: u8,
    },
    /// A declared length is not a multiple of 4 for an id that requires it.
    BadAlignment {
        /// Offending submessage id.
        id: u8,
    },
    /// Submessage id outside the known set.
    UnknownSubmessage(u8),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::TooShort => write!(f, "message too short"),
            ParseError::BadMagic => write!(f, "bad RTPS magic"),
            ParseError::LengthOverflow { id } => {
                write!(f, "submessage 0x{:02x} length exceeds buffer", id)
            }
            ParseError::BadAlignment { id } => {
                write!(f, "submessage 0x{:02x} length not 4-aligned", id)
            }
            ParseError::UnknownSubmessage(id) => write!(f, "unknown submessage id 0x{:02x}", id),
        }
    }
}

impl std::error::Error for ParseError {}

const KNOWN_IDS: [u8; 13] = [
    0x01, 0x06, 0x07, 0x08, 0x09, 0x0c, 0x0d, 0x0e, 0x0f, 0x12, 0x13, 0x15, 0x16,
];

fn known_id(id: u8) -> bool {
    KNOWN_IDS.contains(&id)
}

#[cfg(target_endian = "little")]
const HOST_LITTLE: bool = true;
#[cfg(target_endian = "big")]
const HOST_LITTLE: bool = false;

/// Parse a received buffer into a [`Message`].
///
/// The buffer is handed in as a [`DataBuf`] so that large payloads can
/// reference it without copying.
pub fn parse_message(db: &DataBuf) -> Result<Message, ParseError> {
    let buf = db.as_slice();
    if buf.len() < MIN_MESSAGE_SIZE {
        return Err(ParseError::TooShort);
    }
    if buf[0..4] != RTPS_MAGIC {
        return Err(ParseError::BadMagic);
    }

    let version = (buf[4], buf[5]);
    let vendor = [buf[6], buf[7]];
    let guid_prefix = GuidPrefix::from_slice(&buf[8..20]).ok_or(ParseError::TooShort)?;

    let mut msg = Message {
        version,
        vendor,
        guid_prefix,
        submsgs: Vec::new(),
        traffic: TrafficClass::Meta,
        size: buf.len(),
    };

    let mut classified = false;
    let mut ofs = RTPS_HEADER_SIZE;
    while ofs + SUBMSG_HEADER_SIZE <= buf.len() {
        let id = buf[ofs];
        let flags = buf[ofs + 1];
        if !known_id(id) {
            return Err(ParseError::UnknownSubmessage(id));
        }
        let little = (flags & SMF_ENDIAN) != 0;
        let swap = little != HOST_LITTLE;
        let raw_len = if little {
            u16::from_le_bytes([buf[ofs + 2], buf[ofs + 3]])
        } else {
            u16::from_be_bytes([buf[ofs + 2], buf[ofs + 3]])
        };
        ofs += SUBMSG_HEADER_SIZE;

        let remaining = buf.len() - ofs;
        // Zero length means "rest of buffer", except for PAD and INFO_TS
        // where it genuinely means no payload.
        let len = if raw_len == 0 && id != SMID_PAD && id != SMID_INFO_TS {
            remaining
        } else {
            raw_len as usize
        };
        if len > remaining {
            return Err(ParseError::LengthOverflow { id });
        }
        if id != SMID_PAD && len % 4 != 0 {
            return Err(ParseError::BadAlignment { id });
        }

        let data = if len <= INLINE_DATA_MAX {
            SubmsgData::Owned(buf[ofs..ofs + len].to_vec())
        } else {
            SubmsgData::Shared {
                db: db.clone(),
                offset: ofs,
                len,
            }
        };
        let sm = Submessage {
            header: SubmsgHeader {
                id,
                flags,
                length: len as u16,
            },
            swap,
            data,
        };

        // The first entity-bearing submessage classifies the whole message:
        // builtin source entity -> META, anything else -> USER.
        if !classified {
            if let Some((_dst, src)) = sm.entity_ids() {
                msg.traffic = if entity_is_builtin(src) {
                    TrafficClass::Meta
                } else {
                    TrafficClass::User
                };
                classified = true;
            }
        }

        msg.submsgs.push(sm);
        ofs += len;
    }

    // Trailing bytes shorter than a submessage header are a framing error.
    if ofs != buf.len() {
        return Err(ParseError::TooShort);
    }
    Ok(msg)
}

// ============================================================================
// Tests
// ============================================================================
