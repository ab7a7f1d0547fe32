// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Hybrid bridge/router forwarding engine.
//!
//! The forwarder relays RTPS frames between locally-reachable participants
//! and remote peers using three mechanisms:
//!
//! - GUID-prefix learning from received messages;
//! - SPDP frames are received locally *and* forwarded to every configured
//!   destination except the receiving one;
//! - meta/user data frames are routed by InfoDestination when present, and
//!   otherwise by deriving the interested participants from the discovery
//!   database.
//!
//! Every inbound message yields a decision: zero or more remote destination
//! locators (with a freshly constructed relayed copy) plus a local-delivery
//! flag. Loops are detected both directly (header prefix is ours) and
//! indirectly (our prefix appears in an InfoSource chain).

mod parse;
mod relay;
mod table;


pub use parse::{NoTcpPeers, ParseOutcome, TcpPeerView};
pub use table::{FtEntry, FwdTable, Mode, Reach, FTF_AGE, FTF_INFO_REPLY, MAX_FWD_TTL, MODE_COUNT};

use crate::discovery::DiscoveryView;
use crate::guid::GuidPrefix;
use crate::locator::{Locator, LocatorList, LOCF_MCAST};
use crate::message::{Message, SharedMessage, TrafficClass};

// ============================================================================
// Statistics
// ============================================================================

/// Global forwarder counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct FwdStats {
    /// Messages handed to the receive entry point.
    pub msgs_rxed: u64,
    /// Unicast data submessages seen.
    pub msgs_data_uc: u64,
    /// Unicast data octets seen.
    pub msgs_data_uco: u64,
    /// Multicast data submessages seen.
    pub msgs_data_mc: u64,
    /// Multicast data octets seen.
    pub msgs_data_mco: u64,
    /// Messages from a source participant unknown to discovery.
    pub msgs_no_peer: u64,
    /// Submessages whose source endpoint is unknown.
    pub msgs_no_ep: u64,
    /// Forward destinations added from endpoint matching.
    pub msgs_add_fwdest: u64,
    /// Messages relayed to remote destinations.
    pub msgs_fwded: u64,
    /// Messages delivered locally.
    pub msgs_local: u64,
    /// Messages with neither local nor remote destinations.
    pub msgs_no_dest: u64,
    /// Direct loops: header prefix was our own.
    pub msgs_looped: u64,
    /// Indirect loops: our prefix found in an InfoSource chain.
    pub msgs_loopedi: u64,
    /// Outbound messages sent after destination derivation.
    pub msgs_sent: u64,
    /// Outbound messages with no derivable destination.
    pub msgs_not_sent: u64,
    /// Outbound messages requested through the send hook.
    pub msgs_reqed: u64,
    /// Outbound messages bypassing derivation (handled locator).
    pub msgs_h_sent: u64,
    /// Allocation failures in the forward path.
    pub fwd_nomem: u64,
}

// ============================================================================
// Decisions
// ============================================================================

/// Outcome of the inbound entry point.
#[derive(Debug)]
pub struct RxDecision {
    /// Relayed copy and the locators to send it to, when any remote
    /// destination was derived.
    pub forward: Option<(LocatorList, Message)>,
    /// True if the original message must be delivered to the upper layer.
    pub local: bool,
}

/// One low-level send produced by the outbound entry point.
#[derive(Debug)]
pub struct SendAction {
    /// Destinations for this message.
    pub dests: LocatorList,
    /// The message, shared with the caller's queues.
    pub msg: SharedMessage,
}

// ============================================================================
// Forwarder
// ============================================================================

/// The forwarding engine for one domain.
#[derive(Debug, Default)]
pub struct Forwarder {
    table: FwdTable,
    stats: FwdStats,
}

/// Mode for a locator's flags and a message's traffic class.
pub fn fmode(loc_flags: u32, traffic: TrafficClass) -> Mode {
    Mode::of(traffic, (loc_flags & LOCF_MCAST) != 0)
}

impl Forwarder {
    /// Fresh forwarder with an empty table.
    pub fn new() -> Self {
        Forwarder::default()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> FwdStats {
        self.stats
    }

    /// The forwarding table (introspection and tests).
    pub fn table(&self) -> &FwdTable {
        &self.table
    }

    /// Mutable forwarding table access for the owning relay.
    pub fn table_mut(&mut self) -> &mut FwdTable {
        &mut self.table
    }

    /// Inbound entry point: learn from the message, derive destinations,
    /// and construct the relayed copy when remote destinations exist.
    pub fn receive(
        &mut self,
        msg: &Message,
        src: &Locator,
        disc: &dyn DiscoveryView,
        tcp_peers: &dyn TcpPeerView,
    ) -> RxDecision {
        self.stats.msgs_rxed += 1;
        let mode = fmode(src.flags, msg.traffic);
        log::trace!("[FWD] receive from {} mode {:?}", src, mode);

        let Some(outcome) = self.parse_msg(msg, Some(src), mode, true, disc, tcp_peers) else {
            return RxDecision {
                forward: None,
                local: false,
            };
        };

        let forward = if outcome.remote.is_empty() {
            None
        } else {
            self.stats.msgs_fwded += 1;
            self.build_relayed(msg, mode, disc)
                .map(|relayed| (outcome.remote, relayed))
        };
        if outcome.local {
            self.stats.msgs_local += 1;
        } else if forward.is_none() {
            self.stats.msgs_no_dest += 1;
        }
        RxDecision {
            forward,
            local: outcome.local,
        }
    }

    /// Outbound redirect: derive destinations for locally-originated
    /// messages aimed at an unhandled locator.
    ///
    /// A destination whose first locator carries a connection handle
    /// bypasses derivation entirely.
    pub fn send(
        &mut self,
        dest: &[Locator],
        msgs: &[SharedMessage],
        disc: &dyn DiscoveryView,
    ) -> Vec<SendAction> {
        let mut actions = Vec::new();
        let Some(first) = dest.first() else {
            return actions;
        };
        if first.handle != 0 {
            self.stats.msgs_h_sent += msgs.len() as u64;
            for msg in msgs {
                actions.push(SendAction {
                    dests: dest.to_vec(),
                    msg: msg.clone(),
                });
            }
            return actions;
        }

        for msg in msgs {
            self.stats.msgs_reqed += 1;
            let mode = fmode(first.flags, msg.traffic);
            let outcome = self.parse_msg(msg, None, mode, false, disc, &NoTcpPeers);
            match outcome {
                Some(o) if !o.remote.is_empty() => {
                    self.stats.msgs_sent += 1;
                    actions.push(SendAction {
                        dests: o.remote,
                        msg: msg.clone(),
                    });
                }
                _ => {
                    self.stats.msgs_not_sent += 1;
                    log::trace!("[FWD] no destinations for {:?} msg", mode);
                }
            }
        }
        actions
    }

    /// Seed or refresh a forwarding entry from discovery.
    pub fn participant_new(&mut self, pp: &crate::discovery::ParticipantInfo, update: bool) {
        let id = u32::from(pp.local);
        let entry = self.table.add(pp.prefix, id, FTF_AGE);
        entry.id = id;
        entry.populate_locators(pp, update);
        entry.ttl = MAX_FWD_TTL;
        log::debug!(
            "[FWD] participant {} {} (local={})",
            pp.prefix,
            if update { "updated" } else { "added" },
            pp.local
        );
    }

    /// Retire a participant's forwarding entry.
    pub fn participant_dispose(&mut self, prefix: &GuidPrefix) {
        self.table.remove(prefix);
        log::debug!("[FWD] participant {} disposed", prefix);
    }

    /// One aging sweep over the table.
    pub fn age_sweep(&mut self) -> usize {
        self.table.age_sweep()
    }

    /// Drop all reply locators learned through a given connection handle.
    ///
    /// Called when a control channel dies so stale learned routes do not
    /// outlive the transport they were learned on.
    pub fn forget_handle(&mut self, handle: u32) {
        let prefixes: Vec<GuidPrefix> = self.table.iter().map(|e| e.prefix).collect();
        for prefix in prefixes {
            if let Some(entry) = self.table.lookup_mut(&prefix) {
                for slot in &mut entry.locs {
                    slot[1].retain(|l| l.handle != handle);
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmode() {
        assert_eq!(fmode(LOCF_MCAST, TrafficClass::Meta), Mode::MetaMcast);
        assert_eq!(fmode(0, TrafficClass::Meta), Mode::MetaUcast);
        assert_eq!(fmode(LOCF_MCAST, TrafficClass::User), Mode::UserMcast);
        assert_eq!(fmode(0, TrafficClass::User), Mode::UserUcast);
    }
}
