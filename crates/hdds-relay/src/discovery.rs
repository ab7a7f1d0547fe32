// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Downward interface to discovery.
//!
//! The forwarder never owns discovery state. It asks, through
//! [`DiscoveryView`], whether a GUID prefix names a local participant, what
//! locators a participant advertised, and which endpoints match a topic.
//! The embedding stack keeps a [`DiscoveryStore`] current from its SPDP/SEDP
//! bookkeeping; tests populate one directly.

use std::collections::HashMap;

use crate::guid::GuidPrefix;
use crate::locator::LocatorList;
use crate::message::EntityId;

/// Everything the forwarder needs to know about one participant.
#[derive(Clone, Debug, Default)]
pub struct ParticipantInfo {
    /// Participant identity.
    pub prefix: GuidPrefix,
    /// True for participants living in this process.
    pub local: bool,
    /// Advertised builtin-endpoint bitmask (bit i =
    /// `BUILTIN_ENDPOINT_EIDS[i]` present).
    pub builtins: u32,
    /// Meta-traffic unicast locators.
    pub meta_ucast: LocatorList,
    /// Meta-traffic multicast locators.
    pub meta_mcast: LocatorList,
    /// Default (user) unicast locators.
    pub def_ucast: LocatorList,
    /// Default (user) multicast locators.
    pub def_mcast: LocatorList,
    /// Secure unicast locators, if the participant is secured.
    pub sec_locs: LocatorList,
    /// True if the domain requires the secure locator set.
    pub secure: bool,
}

/// One endpoint (reader or writer) known to discovery.
#[derive(Clone, Debug)]
pub struct EndpointInfo {
    /// Entity id within its participant.
    pub entity_id: EntityId,
    /// Owning participant.
    pub participant: GuidPrefix,
    /// True for endpoints living in this process.
    pub local: bool,
    /// Topic name.
    pub topic: String,
    /// Writer vs reader.
    pub writer: bool,
}

/// Read-only view of discovery state consumed by the forwarder.
pub trait DiscoveryView {
    /// Our own participant prefix.
    fn own_prefix(&self) -> GuidPrefix;

    /// Look up a participant by prefix.
    fn participant(&self, prefix: &GuidPrefix) -> Option<ParticipantInfo>;

    /// All remote peer participants.
    fn peers(&self) -> Vec<GuidPrefix>;

    /// Look up one endpoint of a participant.
    fn endpoint(&self, participant: &GuidPrefix, eid: EntityId) -> Option<EndpointInfo>;

    /// All endpoints on a topic, one side only.
    fn topic_endpoints(&self, topic: &str, writers: bool) -> Vec<EndpointInfo>;

    /// The configured SPDP fan-out destinations of the receiving domain.
    fn dst_locators(&self) -> LocatorList;
}

// ============================================================================
// DiscoveryStore
// ============================================================================

/// Concrete [`DiscoveryView`] backed by hash maps, kept current by the
/// embedding discovery implementation.
#[derive(Debug, Default)]
pub struct DiscoveryStore {
    own: GuidPrefix,
    participants: HashMap<GuidPrefix, ParticipantInfo>,
    endpoints: HashMap<(GuidPrefix, EntityId), EndpointInfo>,
    dst_locs: LocatorList,
}

impl DiscoveryStore {
    /// Create a store for the participant we represent.
    pub fn new(own: GuidPrefix) -> Self {
        DiscoveryStore {
            own,
            ..Default::default()
        }
    }

    /// Install or update a participant.
    pub fn upsert_participant(&mut self, info: ParticipantInfo) {
        self.participants.insert(info.prefix, info);
    }

    /// Remove a participant and all its endpoints.
    pub fn remove_participant(&mut self, prefix: &GuidPrefix) -> Option<ParticipantInfo> {
        self.endpoints.retain(|(p, _), _| p != prefix);
        self.participants.remove(prefix)
    }

    /// Install an endpoint.
    pub fn add_endpoint(&mut self, info: EndpointInfo) {
        self.endpoints
            .insert((info.participant, info.entity_id), info);
    }

    /// Remove an endpoint.
    pub fn remove_endpoint(&mut self, participant: &GuidPrefix, eid: EntityId) {
        self.endpoints.remove(&(*participant, eid));
    }

    /// Replace the SPDP fan-out destination set.
    pub fn set_dst_locators(&mut self, locs: LocatorList) {
        self.dst_locs = locs;
    }

    /// Mutable access to the SPDP fan-out destination set.
    pub fn dst_locators_mut(&mut self) -> &mut LocatorList {
        &mut self.dst_locs
    }

    /// Number of known participants.
    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }
}

impl DiscoveryView for DiscoveryStore {
    fn own_prefix(&self) -> GuidPrefix {
        self.own
    }

    fn participant(&self, prefix: &GuidPrefix) -> Option<ParticipantInfo> {
        self.participants.get(prefix).cloned()
    }

    fn peers(&self) -> Vec<GuidPrefix> {
        self.participants
            .values()
            .filter(|p| !p.local)
            .map(|p| p.prefix)
            .collect()
    }

    fn endpoint(&self, participant: &GuidPrefix, eid: EntityId) -> Option<EndpointInfo> {
        self.endpoints.get(&(*participant, eid)).cloned()
    }

    fn topic_endpoints(&self, topic: &str, writers: bool) -> Vec<EndpointInfo> {
        self.endpoints
            .values()
            .filter(|e| e.writer == writers && e.topic == topic)
            .cloned()
            .collect()
    }

    fn dst_locators(&self) -> LocatorList {
        self.dst_locs.clone()
    }
}

// ============================================================================
// Tests
// ============================================================================
