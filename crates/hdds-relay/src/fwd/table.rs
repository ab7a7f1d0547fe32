// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Forwarding table.
//!
//! Keyed by GUID prefix, each entry carries four per-mode locator slots,
//! each with a *default* list (index 0, populated from discovery) and a
//! *learned* list (index 1, populated from received InfoReply submessages
//! or from source learning). Learned locators take precedence when present.
//!
//! Entries representing a multi-hop TCP child carry a `parent` prefix; their
//! own slots stay empty and lookups are answered from the parent, which is
//! the first-hop relay actually reachable from here.

use std::collections::HashMap;

use crate::discovery::ParticipantInfo;
use crate::guid::GuidPrefix;
use crate::locator::{list_add_kinds, list_add_unique, Locator, LocatorKind, LocatorList,
    LOCATOR_KINDS_ALL, LOCATOR_KINDS_UDP};
use crate::message::TrafficClass;

/// Traffic touches reset an entry's ttl to this many aging sweeps.
pub const MAX_FWD_TTL: u32 = 30;

/// Per-mode locator slot index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum Mode {
    /// Discovery/reliability multicast.
    MetaMcast = 0,
    /// Discovery/reliability unicast.
    MetaUcast = 1,
    /// Application multicast.
    UserMcast = 2,
    /// Application unicast.
    UserUcast = 3,
}

/// Number of modes.
pub const MODE_COUNT: usize = 4;

impl Mode {
    /// Mode for a traffic class and cast-ness.
    pub fn of(traffic: TrafficClass, mcast: bool) -> Mode {
        match (traffic, mcast) {
            (TrafficClass::Meta, true) => Mode::MetaMcast,
            (TrafficClass::Meta, false) => Mode::MetaUcast,
            (TrafficClass::User, true) => Mode::UserMcast,
            (TrafficClass::User, false) => Mode::UserUcast,
        }
    }

    /// The multicast mode of this mode's traffic class.
    pub fn mcast(self) -> Mode {
        match self {
            Mode::MetaMcast | Mode::MetaUcast => Mode::MetaMcast,
            Mode::UserMcast | Mode::UserUcast => Mode::UserMcast,
        }
    }

    /// The unicast mode of this mode's traffic class.
    pub fn ucast(self) -> Mode {
        match self {
            Mode::MetaMcast | Mode::MetaUcast => Mode::MetaUcast,
            Mode::UserMcast | Mode::UserUcast => Mode::UserUcast,
        }
    }

    /// Slot index.
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Entry flag: an InfoReply has been received for this prefix; learned
/// locators are authoritative and plain source-learning is refused.
pub const FTF_INFO_REPLY: u32 = 0x01;
/// Entry flag: subject to aging.
pub const FTF_AGE: u32 = 0x02;

/// Reachability of the prefix relative to this node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Reach {
    /// Reachable only through a relay.
    #[default]
    Relayed,
    /// Directly reachable (not through a relay).
    Local,
}

/// One forwarding-table entry.
#[derive(Clone, Debug)]
pub struct FtEntry {
    /// Keyed prefix.
    pub prefix: GuidPrefix,
    /// Per-mode locator lists: `[mode][0]` discovery defaults, `[mode][1]`
    /// learned.
    pub locs: [[LocatorList; 2]; MODE_COUNT],
    /// First-hop parent for multi-hop TCP children.
    pub parent: Option<GuidPrefix>,
    /// Number of children pointing at this entry.
    pub nchildren: u32,
    /// Remaining aging sweeps.
    pub ttl: u32,
    /// Non-zero marks an own participant of this node; frames aimed at it
    /// are delivered locally.
    pub id: u32,
    /// Direct vs relayed reachability.
    pub local: Reach,
    /// Union of locator kinds usable to reach this prefix.
    pub kinds: LocatorKind,
    /// `FTF_*` flags.
    pub flags: u32,
}

impl FtEntry {
    fn new(prefix: GuidPrefix, id: u32, flags: u32) -> Self {
        FtEntry {
            prefix,
            locs: Default::default(),
            parent: None,
            nchildren: 0,
            ttl: MAX_FWD_TTL,
            id,
            local: Reach::Relayed,
            kinds: 0,
            flags,
        }
    }

    /// True if an InfoReply pinned the learned locators.
    pub fn info_reply_seen(&self) -> bool {
        (self.flags & FTF_INFO_REPLY) != 0
    }

    /// Populate the default (index 0) locator slots from discovery data.
    ///
    /// On update, both slots of every mode are rebuilt from scratch. When
    /// the domain is secured, UDP slots are taken from the secure locator
    /// set instead of the cleartext ones.
    pub fn populate_locators(&mut self, pp: &ParticipantInfo, update: bool) {
        if update {
            for slot in &mut self.locs {
                slot[0].clear();
                slot[1].clear();
            }
        }

        let mut kinds = LOCATOR_KINDS_ALL;
        let mut ekinds: LocatorKind = 0;
        if pp.secure && !pp.sec_locs.is_empty() {
            list_add_kinds(
                &mut self.locs[Mode::MetaUcast.index()][0],
                &pp.sec_locs,
                LOCATOR_KINDS_UDP,
                false,
                &mut ekinds,
            );
            list_add_kinds(
                &mut self.locs[Mode::UserUcast.index()][0],
                &pp.sec_locs,
                LOCATOR_KINDS_UDP,
                false,
                &mut ekinds,
            );
            kinds &= !LOCATOR_KINDS_UDP;
        }
        list_add_kinds(
            &mut self.locs[Mode::MetaMcast.index()][0],
            &pp.meta_mcast,
            kinds,
            true,
            &mut ekinds,
        );
        list_add_kinds(
            &mut self.locs[Mode::MetaUcast.index()][0],
            &pp.meta_ucast,
            kinds,
            false,
            &mut ekinds,
        );
        list_add_kinds(
            &mut self.locs[Mode::UserMcast.index()][0],
            &pp.def_mcast,
            kinds,
            true,
            &mut ekinds,
        );
        list_add_kinds(
            &mut self.locs[Mode::UserUcast.index()][0],
            &pp.def_ucast,
            kinds,
            false,
            &mut ekinds,
        );
        self.kinds = ekinds;

        // Without any UDP locator the prefix cannot be directly reachable.
        if (self.kinds & LOCATOR_KINDS_UDP) == 0 {
            self.local = Reach::Relayed;
        }
    }
}

// ============================================================================
// Table
// ============================================================================

/// The forwarding table: prefix -> entry, with parent/child links and aging.
#[derive(Debug, Default)]
pub struct FwdTable {
    entries: HashMap<GuidPrefix, FtEntry>,
}

impl FwdTable {
    /// Empty table.
    pub fn new() -> Self {
        FwdTable::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry.
    pub fn lookup(&self, prefix: &GuidPrefix) -> Option<&FtEntry> {
        self.entries.get(prefix)
    }

    /// Look up an entry mutably.
    pub fn lookup_mut(&mut self, prefix: &GuidPrefix) -> Option<&mut FtEntry> {
        self.entries.get_mut(prefix)
    }

    /// Add an entry, replacing any existing one for the prefix.
    pub fn add(&mut self, prefix: GuidPrefix, id: u32, flags: u32) -> &mut FtEntry {
        self.entries
            .entry(prefix)
            .or_insert_with(|| FtEntry::new(prefix, id, flags))
    }

    /// Remove an entry. Children of the entry are removed with it.
    pub fn remove(&mut self, prefix: &GuidPrefix) -> Option<FtEntry> {
        let entry = self.entries.remove(prefix)?;
        if entry.nchildren > 0 {
            let children: Vec<GuidPrefix> = self
                .entries
                .values()
                .filter(|e| e.parent == Some(*prefix))
                .map(|e| e.prefix)
                .collect();
            for child in children {
                self.entries.remove(&child);
            }
        }
        if let Some(parent) = entry.parent {
            if let Some(pe) = self.entries.get_mut(&parent) {
                pe.nchildren = pe.nchildren.saturating_sub(1);
            }
        }
        Some(entry)
    }

    /// Link `child` under `parent`; the child's own slots stay empty and
    /// lookups are redirected.
    pub fn link_child(&mut self, child: &GuidPrefix, parent: &GuidPrefix) -> bool {
        if !self.entries.contains_key(parent) {
            return false;
        }
        let Some(ce) = self.entries.get_mut(child) else {
            return false;
        };
        if ce.parent.is_some() {
            return false;
        }
        ce.parent = Some(*parent);
        for slot in &mut ce.locs {
            slot[0].clear();
            slot[1].clear();
        }
        if let Some(pe) = self.entries.get_mut(parent) {
            pe.nchildren += 1;
        }
        true
    }

    /// Locators of an entry for one mode and slot, following the parent
    /// redirection for child entries.
    pub fn get_locators(&self, prefix: &GuidPrefix, mode: Mode, learned: bool) -> &[Locator] {
        let Some(entry) = self.entries.get(prefix) else {
            return &[];
        };
        let entry = match entry.parent {
            Some(parent) => match self.entries.get(&parent) {
                Some(pe) => pe,
                None => entry,
            },
            None => entry,
        };
        &entry.locs[mode.index()][usize::from(learned)]
    }

    /// Record a learned locator for a mode.
    pub fn add_locator(&mut self, prefix: &GuidPrefix, loc: &Locator, mode: Mode, learned: bool) {
        if let Some(entry) = self.entries.get_mut(prefix) {
            entry.kinds |= loc.kind;
            list_add_unique(&mut entry.locs[mode.index()][usize::from(learned)], loc.clone());
        }
    }

    /// Refresh an entry's ttl on traffic.
    pub fn touch(&mut self, prefix: &GuidPrefix) {
        if let Some(entry) = self.entries.get_mut(prefix) {
            entry.ttl = MAX_FWD_TTL;
        }
    }

    /// One aging sweep: decrement ttls, expire aged entries (and their
    /// children through `remove`).
    pub fn age_sweep(&mut self) -> usize {
        let expired: Vec<GuidPrefix> = self
            .entries
            .values_mut()
            .filter_map(|e| {
                if (e.flags & FTF_AGE) == 0 || e.id != 0 {
                    return None;
                }
                if e.ttl > 0 {
                    e.ttl -= 1;
                }
                (e.ttl == 0).then_some(e.prefix)
            })
            .collect();
        let n = expired.len();
        for prefix in expired {
            self.remove(&prefix);
        }
        n
    }

    /// Iterate entries.
    pub fn iter(&self) -> impl Iterator<Item = &FtEntry> {
        self.entries.values()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::LOCATOR_KIND_TCPV4;
    use crate::locator::LOCATOR_KIND_UDPV4;

    fn udp4(a: [u8; 4], port: u32) -> Locator {
        let mut address = [0u8; 16];
        address[12..16].copy_from_slice(&a);
        Locator::new(LOCATOR_KIND_UDPV4, address, port)
    }

    fn tcp4(a: [u8; 4], port: u32) -> Locator {
        let mut address = [0u8; 16];
        address[12..16].copy_from_slice(&a);
        Locator::new(LOCATOR_KIND_TCPV4, address, port)
    }

    fn prefix(n: u8) -> GuidPrefix {
        GuidPrefix::new([n; 12])
    }

    #[test]
    fn test_mode_mapping() {
        assert_eq!(Mode::of(TrafficClass::Meta, true), Mode::MetaMcast);
        assert_eq!(Mode::of(TrafficClass::User, false), Mode::UserUcast);
        assert_eq!(Mode::UserUcast.mcast(), Mode::UserMcast);
        assert_eq!(Mode::MetaMcast.ucast(), Mode::MetaUcast);
    }

    #[test]
    fn test_add_lookup_remove() {
        let mut t = FwdTable::new();
        t.add(prefix(1), 0, FTF_AGE);
        assert!(t.lookup(&prefix(1)).is_some());
        assert_eq!(t.len(), 1);
        t.remove(&prefix(1));
        assert!(t.is_empty());
    }

    #[test]
    fn test_learned_locator_precedence_slots() {
        let mut t = FwdTable::new();
        t.add(prefix(1), 0, FTF_AGE);
        t.add_locator(&prefix(1), &udp4([10, 0, 0, 1], 7410), Mode::MetaUcast, false);
        t.add_locator(&prefix(1), &udp4([10, 0, 0, 2], 7412), Mode::MetaUcast, true);

        let defaults = t.get_locators(&prefix(1), Mode::MetaUcast, false);
        let learned = t.get_locators(&prefix(1), Mode::MetaUcast, true);
        assert_eq!(defaults.len(), 1);
        assert_eq!(learned.len(), 1);
        assert_eq!(learned[0].port, 7412);
    }

    #[test]
    fn test_child_redirects_to_parent() {
        let mut t = FwdTable::new();
        t.add(prefix(1), 0, FTF_AGE);
        t.add_locator(&prefix(1), &tcp4([10, 0, 0, 1], 7500), Mode::MetaUcast, false);
        t.add(prefix(2), 0, FTF_AGE);
        t.add_locator(&prefix(2), &udp4([99, 0, 0, 1], 1), Mode::MetaUcast, false);

        assert!(t.link_child(&prefix(2), &prefix(1)));
        // Child slots were cleared; lookups answer from the parent.
        let locs = t.get_locators(&prefix(2), Mode::MetaUcast, false);
        assert_eq!(locs.len(), 1);
        assert_eq!(locs[0].port, 7500);
        assert_eq!(t.lookup(&prefix(1)).unwrap().nchildren, 1);
    }

    #[test]
    fn test_parent_removal_cascades() {
        let mut t = FwdTable::new();
        t.add(prefix(1), 0, FTF_AGE);
        t.add(prefix(2), 0, FTF_AGE);
        t.link_child(&prefix(2), &prefix(1));

        t.remove(&prefix(1));
        assert!(t.lookup(&prefix(2)).is_none());
        assert!(t.is_empty());
    }

    #[test]
    fn test_aging_expires_idle_entries() {
        let mut t = FwdTable::new();
        t.add(prefix(1), 0, FTF_AGE);
        t.add(prefix(2), 7, FTF_AGE); // own participant: never aged out

        for _ in 0..MAX_FWD_TTL - 1 {
            assert_eq!(t.age_sweep(), 0);
        }
        t.touch(&prefix(1));
        for _ in 0..MAX_FWD_TTL - 1 {
            assert_eq!(t.age_sweep(), 0);
        }
        assert_eq!(t.age_sweep(), 1);
        assert!(t.lookup(&prefix(1)).is_none());
        assert!(t.lookup(&prefix(2)).is_some());
    }

    #[test]
    fn test_populate_locators_from_discovery() {
        let mut t = FwdTable::new();
        let e = t.add(prefix(1), 0, FTF_AGE);
        let pp = ParticipantInfo {
            prefix: prefix(1),
            meta_ucast: vec![udp4([10, 0, 0, 1], 7410), tcp4([10, 0, 0, 1], 7500)],
            meta_mcast: vec![udp4([239, 255, 0, 1], 7400), tcp4([10, 0, 0, 1], 7501)],
            def_ucast: vec![udp4([10, 0, 0, 1], 7411)],
            ..Default::default()
        };
        e.populate_locators(&pp, false);

        assert_eq!(e.locs[Mode::MetaUcast.index()][0].len(), 2);
        // TCP never lands in a multicast slot.
        assert_eq!(e.locs[Mode::MetaMcast.index()][0].len(), 1);
        assert_eq!(e.kinds, LOCATOR_KIND_UDPV4 | LOCATOR_KIND_TCPV4);
    }

    #[test]
    fn test_populate_secure_prefers_secure_udp() {
        let mut t = FwdTable::new();
        let e = t.add(prefix(1), 0, FTF_AGE);
        let pp = ParticipantInfo {
            prefix: prefix(1),
            secure: true,
            sec_locs: vec![udp4([10, 0, 0, 1], 7510)],
            meta_ucast: vec![udp4([10, 0, 0, 1], 7410)],
            ..Default::default()
        };
        e.populate_locators(&pp, false);

        let meta_uc = &e.locs[Mode::MetaUcast.index()][0];
        assert_eq!(meta_uc.len(), 1);
        assert_eq!(meta_uc[0].port, 7510);
    }

    #[test]
    fn test_populate_update_rebuilds() {
        let mut t = FwdTable::new();
        let e = t.add(prefix(1), 0, FTF_AGE);
        let pp1 = ParticipantInfo {
            prefix: prefix(1),
            meta_ucast: vec![udp4([10, 0, 0, 1], 7410)],
            ..Default::default()
        };
        e.populate_locators(&pp1, false);
        let pp2 = ParticipantInfo {
            prefix: prefix(1),
            meta_ucast: vec![udp4([10, 0, 0, 9], 7410)],
            ..Default::default()
        };
        e.populate_locators(&pp2, true);

        let locs = &e.locs[Mode::MetaUcast.index()][0];
        assert_eq!(locs.len(), 1);
        assert_eq!(locs[0].address[12..16], [10, 0, 0, 9]);
    }
}
