// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! InfoSource and InfoReply payload codecs.
//!
//! InfoSource entries are chained: each relay hop appends one 20-octet entry
//! carrying the version, vendor and guid prefix of the header it rewrote, so
//! the full relay path stays reconstructible and loop detection can match
//! any hop against our own prefix.
//!
//! InfoReply carries one or two locator lists (unicast, and multicast when
//! the MULTICAST flag is set). List integers follow the submessage byte
//! order; locator addresses are plain octets.

use crate::guid::GuidPrefix;
use crate::locator::{Locator, LocatorList, MSG_LOCATOR_SIZE};
use crate::message::Submessage;

/// Wire size of one InfoSource chain entry.
pub const INFO_SOURCE_ENTRY_SIZE: usize = 20;

/// One hop record in an InfoSource chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InfoSourceEntry {
    /// Protocol version of the rewritten header.
    pub version: (u8, u8),
    /// Vendor id of the rewritten header.
    pub vendor: [u8; 2],
    /// Guid prefix of the rewritten header.
    pub prefix: GuidPrefix,
}

/// Parse an InfoSource payload into its chain entries.
///
/// Trailing bytes shorter than a full entry are ignored, matching the
/// tolerant read of chained payloads from other vendors.
pub fn parse_info_source(data: &[u8]) -> Vec<InfoSourceEntry> {
    let mut entries = Vec::new();
    let mut ofs = 0;
    while ofs + INFO_SOURCE_ENTRY_SIZE <= data.len() {
        // unused(4) version(2) vendor(2) prefix(12)
        let version = (data[ofs + 4], data[ofs + 5]);
        let vendor = [data[ofs + 6], data[ofs + 7]];
        let prefix = match GuidPrefix::from_slice(&data[ofs + 8..ofs + 20]) {
            Some(p) => p,
            None => break,
        };
        entries.push(InfoSourceEntry {
            version,
            vendor,
            prefix,
        });
        ofs += INFO_SOURCE_ENTRY_SIZE;
    }
    entries
}

/// Append one chain entry to an InfoSource payload buffer.
pub fn build_info_source(buf: &mut Vec<u8>, entry: &InfoSourceEntry) {
    buf.extend_from_slice(&[0u8; 4]);
    buf.push(entry.version.0);
    buf.push(entry.version.1);
    buf.extend_from_slice(&entry.vendor);
    buf.extend_from_slice(entry.prefix.as_bytes());
}

/// Locator lists recovered from an InfoReply payload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InfoReplyLists {
    /// Unicast reply locators.
    pub unicast: LocatorList,
    /// Multicast reply locators, present when the MULTICAST flag was set.
    pub multicast: Option<LocatorList>,
}

fn parse_locator_at(sm: &Submessage, ofs: usize) -> Option<Locator> {
    let data = sm.data.as_slice();
    if ofs + MSG_LOCATOR_SIZE > data.len() {
        return None;
    }
    let kind = sm.u32_at(ofs)?;
    let port = sm.u32_at(ofs + 4)?;
    let mut address = [0u8; 16];
    address.copy_from_slice(&data[ofs + 8..ofs + 24]);
    Some(Locator::new(kind, address, port))
}

/// Parse an InfoReply payload.
///
/// Returns `None` on any length inconsistency; a malformed InfoReply must
/// not poison the learned-locator cache.
pub fn parse_info_reply(sm: &Submessage, multicast: bool) -> Option<InfoReplyLists> {
    let data_len = sm.data.len();
    if data_len < 4 {
        return None;
    }
    let n_uc = sm.u32_at(0)? as usize;
    let mut need = 4 + n_uc * MSG_LOCATOR_SIZE;
    let n_mc = if multicast {
        if data_len < need + 4 {
            return None;
        }
        let n = sm.u32_at(need)? as usize;
        let mc_need = 4 + n * MSG_LOCATOR_SIZE;
        need += mc_need;
        n
    } else {
        0
    };
    if data_len < need {
        return None;
    }

    let mut unicast = LocatorList::new();
    let mut ofs = 4;
    for _ in 0..n_uc {
        unicast.push(parse_locator_at(sm, ofs)?);
        ofs += MSG_LOCATOR_SIZE;
    }
    let multicast = if multicast {
        let mut list = LocatorList::new();
        ofs += 4;
        for _ in 0..n_mc {
            list.push(parse_locator_at(sm, ofs)?);
            ofs += MSG_LOCATOR_SIZE;
        }
        Some(list)
    } else {
        None
    };
    Some(InfoReplyLists { unicast, multicast })
}

fn build_locator_list(buf: &mut Vec<u8>, locs: &[Locator]) {
    buf.extend_from_slice(&(locs.len() as u32).to_ne_bytes());
    for loc in locs {
        buf.extend_from_slice(&loc.kind.to_ne_bytes());
        buf.extend_from_slice(&loc.port.to_ne_bytes());
        buf.extend_from_slice(&loc.address);
    }
}

/// Build an InfoReply payload in host order. Returns the payload and whether
/// the MULTICAST flag must be set.
pub fn build_info_reply(unicast: &[Locator], multicast: Option<&[Locator]>) -> (Vec<u8>, bool) {
    let mut buf = Vec::with_capacity(
        4 + unicast.len() * MSG_LOCATOR_SIZE
            + multicast.map_or(0, |m| 4 + m.len() * MSG_LOCATOR_SIZE),
    );
    build_locator_list(&mut buf, unicast);
    if let Some(mc) = multicast {
        build_locator_list(&mut buf, mc);
        (buf, true)
    } else {
        (buf, false)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::LOCATOR_KIND_UDPV4;
    use crate::message::{SMF_MULTICAST, SMID_INFO_REPLY, SMID_INFO_SRC};

    fn udp4(a: [u8; 4], port: u32) -> Locator {
        let mut address = [0u8; 16];
        address[12..16].copy_from_slice(&a);
        Locator::new(LOCATOR_KIND_UDPV4, address, port)
    }

    #[test]
    fn test_info_source_chain_roundtrip() {
        let e1 = InfoSourceEntry {
            version: (2, 1),
            vendor: [0x01, 0x0F],
            prefix: GuidPrefix::new([1; 12]),
        };
        let e2 = InfoSourceEntry {
            version: (2, 3),
            vendor: [0x01, 0xAA],
            prefix: GuidPrefix::new([2; 12]),
        };

        let mut buf = Vec::new();
        build_info_source(&mut buf, &e1);
        build_info_source(&mut buf, &e2);
        assert_eq!(buf.len(), 2 * INFO_SOURCE_ENTRY_SIZE);

        let chain = parse_info_source(&buf);
        assert_eq!(chain, vec![e1, e2]);
    }

    #[test]
    fn test_info_source_ignores_trailing_partial() {
        let mut buf = Vec::new();
        build_info_source(
            &mut buf,
            &InfoSourceEntry {
                version: (2, 3),
                vendor: [0x01, 0xAA],
                prefix: GuidPrefix::new([1; 12]),
            },
        );
        buf.extend_from_slice(&[0u8; 8]);
        assert_eq!(parse_info_source(&buf).len(), 1);
    }

    #[test]
    fn test_info_reply_unicast_only() {
        let uc = vec![udp4([10, 0, 0, 1], 7410), udp4([10, 0, 0, 2], 7410)];
        let (payload, mcast) = build_info_reply(&uc, None);
        assert!(!mcast);
        assert_eq!(payload.len(), 4 + 2 * MSG_LOCATOR_SIZE);

        let sm = Submessage::host_order(SMID_INFO_REPLY, 0, payload);
        let lists = parse_info_reply(&sm, false).unwrap();
        assert_eq!(lists.unicast.len(), 2);
        assert!(lists.multicast.is_none());
        assert!(lists.unicast[0].addr_eq(&uc[0]));
        assert!(lists.unicast[1].addr_eq(&uc[1]));
    }

    #[test]
    fn test_info_reply_with_multicast() {
        let uc = vec![udp4([10, 0, 0, 1], 7410)];
        let mc = vec![udp4([239, 255, 0, 1], 7400)];
        let (payload, mcast) = build_info_reply(&uc, Some(&mc));
        assert!(mcast);

        let sm = Submessage::host_order(SMID_INFO_REPLY, SMF_MULTICAST, payload);
        let lists = parse_info_reply(&sm, true).unwrap();
        assert_eq!(lists.unicast.len(), 1);
        assert_eq!(lists.multicast.as_ref().unwrap().len(), 1);
        assert!(lists.multicast.unwrap()[0].addr_eq(&mc[0]));
    }

    #[test]
    fn test_info_reply_truncated_rejected() {
        let uc = vec![udp4([10, 0, 0, 1], 7410)];
        let (mut payload, _) = build_info_reply(&uc, None);
        payload.truncate(payload.len() - 4);
        let sm = Submessage::host_order(SMID_INFO_REPLY, 0, payload);
        assert!(parse_info_reply(&sm, false).is_none());
    }

    #[test]
    fn test_info_reply_claimed_count_exceeds_data() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&5u32.to_ne_bytes());
        let sm = Submessage::host_order(SMID_INFO_REPLY, 0, payload);
        assert!(parse_info_reply(&sm, false).is_none());
    }

    #[test]
    fn test_empty_info_reply() {
        let (payload, mcast) = build_info_reply(&[], None);
        assert!(!mcast);
        let sm = Submessage::host_order(SMID_INFO_SRC, 0, payload);
        let lists = parse_info_reply(&sm, false).unwrap();
        assert!(lists.unicast.is_empty());
    }
}
