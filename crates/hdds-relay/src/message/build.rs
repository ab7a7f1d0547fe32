// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! [`Message`]-to-wire serializer.
//!
//! The inverse of the parser: emits the RTPS header followed by each
//! submessage with its original wire flags. Payload bytes are written as-is;
//! only the length field follows the endian bit of the submessage flags.

use crate::message::{Message, SMF_ENDIAN, RTPS_MAGIC};

/// Serialize a message into a fresh buffer.
pub fn build_message(msg: &Message) -> Vec<u8> {
    let mut buf = Vec::with_capacity(msg.size);
    buf.extend_from_slice(&RTPS_MAGIC);
    buf.push(msg.version.0);
    buf.push(msg.version.1);
    buf.extend_from_slice(&msg.vendor);
    buf.extend_from_slice(msg.guid_prefix.as_bytes());

    for sm in &msg.submsgs {
        buf.push(sm.header.id);
        buf.push(sm.header.flags);
        let len = sm.data.len() as u16;
        if (sm.header.flags & SMF_ENDIAN) != 0 {
            buf.extend_from_slice(&len.to_le_bytes());
        } else {
            buf.extend_from_slice(&len.to_be_bytes());
        }
        buf.extend_from_slice(sm.data.as_slice());
    }
    buf
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::GuidPrefix;
    use crate::message::{parse_message, DataBuf, Submessage, SMID_INFO_DST, SMID_PAD};

    #[test]
    fn test_build_header() {
        let msg = Message::with_source(GuidPrefix::new([3; 12]));
        let buf = build_message(&msg);
        assert_eq!(buf.len(), 20);
        assert_eq!(&buf[0..4], b"RTPS");
        assert_eq!(buf[4], 2);
        assert_eq!(&buf[8..20], &[3u8; 12]);
    }

    #[test]
    fn test_build_then_parse() {
        let mut msg = Message::with_source(GuidPrefix::new([3; 12]));
        msg.push(Submessage::host_order(SMID_INFO_DST, 0, vec![8u8; 12]));
        msg.push(Submessage::host_order(SMID_PAD, 0, vec![]));

        let buf = build_message(&msg);
        let parsed = parse_message(&DataBuf::new(buf)).unwrap();

        assert_eq!(parsed.guid_prefix, msg.guid_prefix);
        assert_eq!(parsed.submsgs.len(), 2);
        assert_eq!(parsed.submsgs[0].data.as_slice(), &[8u8; 12]);
        assert!(!parsed.submsgs[0].swap);
    }
}
