// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relayed-message construction.
//!
//! A forwarded frame carries *our* prefix in the RTPS header (receivers
//! deduplicate by source), so the original provenance moves into an
//! InfoSource chain: the previous chain, if any, followed by one entry for
//! the header we are rewriting. When the frame can provoke replies
//! (HEARTBEAT, HEARTBEAT_FRAG, ACKNACK, NACK_FRAG) an InfoReply naming our
//! own reachable locators is prepended so those replies return to us.
//!
//! Payloads are never copied: submessage records share their data buffers
//! with the original message through refcount bumps.

use crate::discovery::DiscoveryView;
use crate::fwd::table::Mode;
use crate::fwd::Forwarder;
use crate::locator::{LocatorList, LOCATOR_KINDS_UDP};
use crate::message::{
    build_info_reply, build_info_source, InfoSourceEntry, Message, SMF_MULTICAST, SMID_ACKNACK,
    SMID_HEARTBEAT, SMID_HEARTBEAT_FRAG, SMID_INFO_REPLY, SMID_INFO_SRC, SMID_NACK_FRAG,
    Submessage,
};

impl Forwarder {
    /// Construct the relayed copy of `msg` for the given traffic mode.
    ///
    /// Returns `None` only when our own participant is unknown to
    /// discovery, in which case nothing can be relayed.
    pub(crate) fn build_relayed(
        &mut self,
        msg: &Message,
        mode: Mode,
        disc: &dyn DiscoveryView,
    ) -> Option<Message> {
        let own_prefix = disc.own_prefix();
        let Some(own) = disc.participant(&own_prefix) else {
            self.stats.fwd_nomem += 1;
            return None;
        };

        let mut out = Message::with_source(own_prefix);
        out.traffic = msg.traffic;

        // Copy all submessages except InfoSource and InfoReply, which are
        // re-emitted below. The first InfoSource is remembered so the chain
        // can be extended.
        let mut prev_chain: Option<&Submessage> = None;
        let mut add_info_reply = false;
        for sm in &msg.submsgs {
            match sm.header.id {
                SMID_INFO_SRC => {
                    if prev_chain.is_none() {
                        prev_chain = Some(sm);
                    }
                    continue;
                }
                SMID_INFO_REPLY => continue,
                SMID_HEARTBEAT | SMID_HEARTBEAT_FRAG | SMID_ACKNACK | SMID_NACK_FRAG => {
                    add_info_reply = true;
                }
                _ => {}
            }
            out.push(sm.clone());
        }

        // InfoSource: previous chain bytes, then the header we rewrote.
        let mut chain = Vec::new();
        if let Some(prev) = prev_chain {
            chain.extend_from_slice(prev.data.as_slice());
        }
        build_info_source(
            &mut chain,
            &InfoSourceEntry {
                version: msg.version,
                vendor: msg.vendor,
                prefix: msg.guid_prefix,
            },
        );
        out.push_front(Submessage::host_order(SMID_INFO_SRC, 0, chain));

        // InfoReply goes in front of the InfoSource only when a response is
        // expected.
        if add_info_reply {
            let (uc_list, mc_list) = reply_locators(&own, mode);
            let (payload, multicast) = build_info_reply(&uc_list, mc_list.as_deref());
            let flags = if multicast { SMF_MULTICAST } else { 0 };
            out.push_front(Submessage::host_order(SMID_INFO_REPLY, flags, payload));
        }

        Some(out)
    }
}

/// Our own reply locators for a traffic mode.
///
/// A secured participant publishes its secure unicast locators for the UDP
/// kinds instead of the cleartext ones, and no multicast list.
fn reply_locators(
    own: &crate::discovery::ParticipantInfo,
    mode: Mode,
) -> (LocatorList, Option<LocatorList>) {
    let meta = matches!(mode, Mode::MetaMcast | Mode::MetaUcast);
    if own.secure && !own.sec_locs.is_empty() {
        let base = if meta { &own.meta_ucast } else { &own.def_ucast };
        let mut list: LocatorList = base
            .iter()
            .filter(|l| (l.kind & LOCATOR_KINDS_UDP) == 0)
            .cloned()
            .collect();
        list.extend(
            own.sec_locs
                .iter()
                .filter(|l| (l.kind & LOCATOR_KINDS_UDP) != 0)
                .cloned(),
        );
        return (list, None);
    }
    if meta {
        let mc = (!own.meta_mcast.is_empty()).then(|| own.meta_mcast.clone());
        (own.meta_ucast.clone(), mc)
    } else {
        let mc = (!own.def_mcast.is_empty()).then(|| own.def_mcast.clone());
        (own.def_ucast.clone(), mc)
    }
}
