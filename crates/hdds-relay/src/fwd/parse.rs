// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Destination derivation and GUID-prefix learning.
//!
//! One pass over the submessage stream collects remote destinations and the
//! local-delivery flag, while (on the inbound path) learning reply locators
//! from InfoReply submessages and from the frame's source address.
//!
//! Suppression rules:
//! - never send back to the connection handle the frame arrived on;
//! - a UDP-sourced frame is never echoed to a UDP destination
//!   (same-family suppression); TCP destinations stay eligible.

use crate::discovery::{DiscoveryView, ParticipantInfo};
use crate::fwd::table::{Mode, Reach, FTF_AGE, FTF_INFO_REPLY, MAX_FWD_TTL};
use crate::fwd::Forwarder;
use crate::guid::GuidPrefix;
use crate::locator::{
    list_add_filtered, Locator, LocatorKind, LocatorList, LOCATOR_KINDS_TCP, LOCATOR_KINDS_UDP,
};
use crate::message::{
    builtin_index, entity_is_builtin, parse_info_reply, parse_info_source, Message, Submessage,
    ENTITYID_SPDP_PARTICIPANT_WRITER, SMF_MULTICAST, SMID_ACKNACK, SMID_DATA, SMID_DATA_FRAG,
    SMID_INFO_DST, SMID_INFO_REPLY, SMID_INFO_SRC, SMID_NACK_FRAG,
};

/// Resolver from connection handles to the control-channel peer prefix.
///
/// The TCP transport knows which remote relay owns each data connection;
/// multi-hop learning uses this to link Nth-hop prefixes under their
/// first-hop parent.
pub trait TcpPeerView {
    /// Peer prefix of the control channel serving `handle`, if any.
    fn peer_prefix(&self, handle: u32) -> Option<GuidPrefix>;
}

/// A [`TcpPeerView`] that knows no peers; used on paths with no TCP
/// transport and in tests.
pub struct NoTcpPeers;

impl TcpPeerView for NoTcpPeers {
    fn peer_prefix(&self, _handle: u32) -> Option<GuidPrefix> {
        None
    }
}

/// Result of one derivation pass.
#[derive(Debug, Default)]
pub struct ParseOutcome {
    /// Remote destination locators (unicast preferred).
    pub remote: LocatorList,
    /// True if the message must also be delivered locally.
    pub local: bool,
}

impl Forwarder {
    /// Parse a message and derive all its destinations, optionally learning
    /// reply locators from it.
    ///
    /// Returns `None` when the message is recognised as a loop; the loop
    /// counters are updated and nothing may be delivered or relayed.
    pub(crate) fn parse_msg(
        &mut self,
        msg: &Message,
        src: Option<&Locator>,
        mode: Mode,
        learn: bool,
        disc: &dyn DiscoveryView,
        tcp_peers: &dyn TcpPeerView,
    ) -> Option<ParseOutcome> {
        let own = disc.own_prefix();
        let src_handle = src.map_or(0, |l| l.handle);
        let (suppress_kind, mut udp_src): (LocatorKind, bool) = match src {
            Some(l) if l.is_udp() => (LOCATOR_KINDS_UDP, true),
            _ => (0, false),
        };
        let mut as_local = udp_src;

        // Stop immediately if we sent this ourselves.
        let mut src_prefix = msg.guid_prefix;
        if learn && src_prefix == own {
            self.stats.msgs_looped += 1;
            log::trace!("[FWD] looped message (header)");
            return None;
        }

        let mut rem_uc = LocatorList::new();
        let mut rem_mc = LocatorList::new();
        let mut local = false;
        let mut got_dest = false;
        let mut learned = false;
        let mut src_p: Option<ParticipantInfo> = None;
        let mut src_p_resolved = false;
        let mut entry_seen = false;

        for sm in &msg.submsgs {
            match sm.header.id {
                SMID_INFO_DST => {
                    if learn && !entry_seen {
                        if let Some(e) = self.table.lookup(&src_prefix) {
                            as_local = e.local == Reach::Local;
                            entry_seen = true;
                        }
                    }
                    if let Some(prefix) = GuidPrefix::from_slice(sm.data.as_slice()) {
                        self.add_dest(
                            &mut rem_uc,
                            &mut rem_mc,
                            &mut local,
                            &prefix,
                            src_handle,
                            suppress_kind,
                            mode,
                            as_local,
                        );
                    }
                    got_dest = true;
                    self.stats.msgs_data_uc += 1;
                    self.stats.msgs_data_uco += u64::from(sm.header.length);
                    continue;
                }
                SMID_INFO_SRC => {
                    if learn {
                        let chain = parse_info_source(sm.data.as_slice());
                        if let Some(first) = chain.first() {
                            // The outermost header was rewritten by a relay;
                            // learning applies to the original source.
                            src_prefix = first.prefix;
                        }
                        if chain.iter().any(|e| e.prefix == own) {
                            self.stats.msgs_loopedi += 1;
                            log::trace!("[FWD] looped message (InfoSrc)");
                            return None;
                        }
                    }
                    continue;
                }
                SMID_INFO_REPLY => {
                    if learn {
                        self.learn_info_reply(sm, &src_prefix, &mut src_p, mode, disc, src_handle);
                        learned = true;
                        udp_src = false;
                        as_local = false;
                        continue;
                    }
                }
                _ => {}
            }

            if got_dest {
                // When learning, keep scanning for InfoReply/InfoSource.
                if learn && !learned {
                    continue;
                }
                break;
            }

            let Some((dst_eid, src_eid)) = sm.entity_ids() else {
                continue;
            };

            if sm.header.id == SMID_DATA || sm.header.id == SMID_DATA_FRAG {
                if dst_eid == 0 {
                    self.stats.msgs_data_mc += 1;
                    self.stats.msgs_data_mco += u64::from(sm.header.length);
                } else {
                    self.stats.msgs_data_uc += 1;
                    self.stats.msgs_data_uco += u64::from(sm.header.length);
                }
            }

            if !src_p_resolved {
                src_p = disc.participant(&src_prefix);
                src_p_resolved = true;
            }
            if learn && !entry_seen {
                if let Some(e) = self.table.lookup(&src_prefix) {
                    as_local = e.local == Reach::Local;
                    entry_seen = true;
                } else if udp_src {
                    // First sighting of a directly-reachable source.
                    let e = self.table.add(src_prefix, 0, FTF_AGE);
                    e.local = Reach::Local;
                    entry_seen = true;
                }
            }

            // SPDP special case: multicast discovery fans out to every
            // configured destination of the domain except the source.
            if src_eid == ENTITYID_SPDP_PARTICIPANT_WRITER {
                if learn && udp_src {
                    if let Some(e) = self.table.lookup_mut(&src_prefix) {
                        e.local = Reach::Local;
                    }
                }
                local = true;
                list_add_filtered(&mut rem_uc, &disc.dst_locators(), src_handle, suppress_kind);
                rem_mc = rem_uc.clone();
                break;
            }

            // Unknown source participant: just receive it, it is probably
            // discovery data.
            let Some(spinfo) = src_p.clone() else {
                local = true;
                self.stats.msgs_no_peer += 1;
                continue;
            };
            let Some(src_ep) = disc.endpoint(&spinfo.prefix, src_eid) else {
                self.stats.msgs_no_ep += 1;
                continue;
            };

            // ACKNACK/NACK_FRAG answer writers; everything else readers.
            let want_writers =
                sm.header.id == SMID_ACKNACK || sm.header.id == SMID_NACK_FRAG;
            for ep in disc.topic_endpoints(&src_ep.topic, want_writers) {
                if dst_eid != 0 && dst_eid != ep.entity_id {
                    continue;
                }
                if ep.local {
                    local = true;
                } else {
                    self.add_dest(
                        &mut rem_uc,
                        &mut rem_mc,
                        &mut local,
                        &ep.participant,
                        src_handle,
                        suppress_kind,
                        mode,
                        as_local,
                    );
                    self.stats.msgs_add_fwdest += 1;
                }
            }

            // Builtin endpoints additionally reach every peer advertising
            // the same builtin.
            if entity_is_builtin(src_eid) {
                if let Some(idx) = builtin_index(src_eid) {
                    let bit = 1u32 << idx;
                    for peer in disc.peers() {
                        let Some(pp) = disc.participant(&peer) else {
                            continue;
                        };
                        if (pp.builtins & bit) != 0 {
                            self.add_dest(
                                &mut rem_uc,
                                &mut rem_mc,
                                &mut local,
                                &peer,
                                src_handle,
                                suppress_kind,
                                mode,
                                as_local,
                            );
                            self.stats.msgs_add_fwdest += 1;
                        }
                    }
                }
            }
        }

        // Unicast destinations are preferred; the multicast set is only
        // used when no unicast locator was found.
        let remote = if rem_uc.is_empty() { rem_mc } else { rem_uc };

        if learn && !learned {
            if let Some(src_loc) = src {
                if src_loc.port != 0 {
                    self.learn_source(&src_prefix, src_p.as_ref(), mode, src_loc, disc, tcp_peers);
                }
            }
        }

        Some(ParseOutcome { remote, local })
    }

    /// Add the destination locators of one prefix, honoring locality and
    /// suppression.
    #[allow(clippy::too_many_arguments)]
    fn add_dest(
        &mut self,
        rem_uc: &mut LocatorList,
        rem_mc: &mut LocatorList,
        local: &mut bool,
        prefix: &GuidPrefix,
        src_handle: u32,
        suppress_kind: LocatorKind,
        mode: Mode,
        local_src: bool,
    ) {
        let Some(entry) = self.table.lookup(prefix) else {
            log::trace!("[FWD] add-dest: prefix {} not found", prefix);
            return;
        };
        if entry.id != 0 {
            // One of our own participants.
            *local = true;
            return;
        }
        if local_src && entry.local == Reach::Local {
            // Both sides are directly reachable; no relaying between them.
            return;
        }

        let mc_mode = mode.mcast();
        let uc_mode = mode.ucast();
        let mc_list = non_empty(
            self.table.get_locators(prefix, mc_mode, true),
            self.table.get_locators(prefix, mc_mode, false),
        );
        let uc_list = non_empty(
            self.table.get_locators(prefix, uc_mode, true),
            self.table.get_locators(prefix, uc_mode, false),
        );

        if uc_list.is_empty() && mc_list.is_empty() {
            log::trace!("[FWD] add-dest: no locators for {}", prefix);
            return;
        }
        let uc_src = if uc_list.is_empty() { mc_list } else { uc_list };
        let mc_src = if mc_list.is_empty() { uc_list } else { mc_list };
        let uc_src = uc_src.to_vec();
        let mc_src = mc_src.to_vec();
        list_add_filtered(rem_uc, &uc_src, src_handle, suppress_kind);
        list_add_filtered(rem_mc, &mc_src, src_handle, suppress_kind);
    }

    /// Cache InfoReply locator lists against the source prefix.
    fn learn_info_reply(
        &mut self,
        sm: &Submessage,
        prefix: &GuidPrefix,
        src_p: &mut Option<ParticipantInfo>,
        mode: Mode,
        disc: &dyn DiscoveryView,
        src_handle: u32,
    ) {
        let multicast = (sm.header.flags & SMF_MULTICAST) != 0;
        let Some(lists) = parse_info_reply(sm, multicast) else {
            return;
        };

        if src_p.is_none() {
            *src_p = disc.participant(prefix);
        }
        if self.table.lookup(prefix).is_none() {
            let entry = self.table.add(*prefix, 0, FTF_AGE);
            if let Some(pp) = src_p.as_ref() {
                entry.populate_locators(pp, false);
            }
        }
        let Some(entry) = self.table.lookup_mut(prefix) else {
            return;
        };
        if entry.parent.is_some() {
            return;
        }

        let rmode = mode.mcast();
        let tag = |mut l: Locator| {
            // Remember which connection taught us the route.
            l.handle = src_handle;
            l
        };
        if let Some(mc) = lists.multicast {
            if !mc.is_empty() {
                entry.locs[rmode.index()][1] = mc.into_iter().map(tag).collect();
            }
        }
        if !lists.unicast.is_empty() {
            entry.locs[rmode.ucast().index()][1] = lists.unicast.into_iter().map(tag).collect();
        }
        entry.flags |= FTF_INFO_REPLY;
        entry.ttl = MAX_FWD_TTL;
        log::trace!("[FWD] learned InfoReply locators for {}", prefix);
    }

    /// Learn a reply locator for the source prefix from the frame's source
    /// address.
    fn learn_source(
        &mut self,
        prefix: &GuidPrefix,
        src_p: Option<&ParticipantInfo>,
        mode: Mode,
        src: &Locator,
        disc: &dyn DiscoveryView,
        tcp_peers: &dyn TcpPeerView,
    ) {
        let pp = match src_p {
            Some(p) => Some(p.clone()),
            None => disc.participant(prefix),
        };

        let mut new_prefix = false;
        if self.table.lookup(prefix).is_none() {
            let entry = self.table.add(*prefix, 0, FTF_AGE);
            new_prefix = true;
            if let Some(pp) = pp.as_ref() {
                entry.populate_locators(pp, false);
            }
        } else {
            let entry = self.table.lookup(prefix).map(|e| (e.parent.is_some(), e.info_reply_seen()));
            if let Some((has_parent, info_reply)) = entry {
                if has_parent || info_reply {
                    // Learned routes from InfoReply overrule plain learning.
                    self.table.touch(prefix);
                    return;
                }
            }
        }

        self.table.touch(prefix);
        if pp.is_some() {
            // Only remember the locator if discovery advertised it.
            let known = self
                .table
                .get_locators(prefix, mode, false)
                .iter()
                .any(|def| def.addr_eq(src));
            if known {
                self.table.add_locator(prefix, src, mode, true);
            }
        } else {
            self.table.add_locator(prefix, src, mode, true);
        }

        if mode == Mode::MetaMcast && new_prefix {
            self.meta_mcast_learn(prefix, src, tcp_peers);
        }
    }

    /// First vs Nth hop classification for a newly learned SPDP prefix.
    ///
    /// A prefix arriving over TCP from a relay whose control-channel peer
    /// prefix differs (host octets, count field ignored) is an Nth-hop
    /// child: its locators are the parent's.
    fn meta_mcast_learn(
        &mut self,
        prefix: &GuidPrefix,
        src: &Locator,
        tcp_peers: &dyn TcpPeerView,
    ) {
        if (src.kind & LOCATOR_KINDS_TCP) == 0 {
            return;
        }
        let Some(peer) = tcp_peers.peer_prefix(src.handle) else {
            return;
        };
        if prefix.same_host(&peer) {
            // Count field is volatile across restarts on the same host;
            // matching host octets means this is still the 1st hop.
            return;
        }
        if self.table.lookup(&peer).is_none() {
            log::trace!("[FWD] nth-hop prefix {} but no parent entry", prefix);
            return;
        }
        self.table.link_child(prefix, &peer);
        log::trace!("[FWD] linked {} under first-hop {}", prefix, peer);
    }
}

/// First slice if non-empty, otherwise the fallback.
fn non_empty<'a>(primary: &'a [Locator], fallback: &'a [Locator]) -> &'a [Locator] {
    if primary.is_empty() {
        fallback
    } else {
        primary
    }
}
