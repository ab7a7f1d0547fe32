// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport registry.
//!
//! Owns one transport descriptor per medium (UDP, TCP, DTLS, TLS), routes
//! outbound messages to the right one by locator kind and secure-overlay
//! selector, and tracks which locators are currently served.
//!
//! Address-set churn runs through a redundancy cycle instead of a rebuild:
//! `update_begin` marks every served locator of the affected families
//! redundant, `add_locator` clears the mark on still-valid ones, and
//! `update_end` tears down whatever stayed marked. Connection state on
//! surviving locators is untouched.

mod ports;

pub use ports::PortParams;

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;

use crate::locator::{
    Locator, LocatorKind, LocatorList, Scope, LOCATOR_KINDS_ALL, LOCATOR_KIND_UDPV4,
    LOCATOR_KIND_UDPV6, LOCF_MCAST, LOCF_META, LOCF_UCAST, SPROTO_DTLS, SPROTO_TLS,
};
use crate::message::SharedMessage;

// ============================================================================
// Transport trait
// ============================================================================

/// Runtime parameters a transport accepts through the registry.
#[derive(Clone, Debug)]
pub struct TransportParams {
    /// Transport enabled at all.
    pub enabled: bool,
    /// Cooperative suspend latch.
    pub suspended: bool,
    /// Upper bound on a single message.
    pub max_message_size: usize,
}

impl Default for TransportParams {
    fn default() -> Self {
        TransportParams {
            enabled: true,
            suspended: false,
            max_message_size: 64 * 1024,
        }
    }
}

/// One registered transport medium.
pub trait Transport {
    /// Kind mask this transport serves.
    fn kinds(&self) -> LocatorKind;

    /// Send messages to one destination locator.
    fn send(&mut self, dest: &Locator, msgs: &[SharedMessage]) -> io::Result<()>;

    /// Start serving a locator (bind/listen/join as appropriate).
    fn add_locator(&mut self, domain_id: u32, loc: &Locator, id: u32, serve: bool)
        -> io::Result<()>;

    /// Stop serving a locator.
    fn remove_locator(&mut self, id: u32, loc: &Locator);

    /// Apply updated parameters.
    fn set_params(&mut self, params: &TransportParams);

    /// Current parameters.
    fn params(&self) -> TransportParams;
}

/// Registry slot selector derived from a locator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportId {
    /// Cleartext UDP.
    Udp,
    /// Cleartext TCP.
    Tcp,
    /// DTLS-over-UDP overlay.
    Dtls,
    /// TLS-over-TCP overlay.
    Tls,
}

/// Route a locator to its transport slot: secure overlays first, then the
/// TCP kinds, UDP otherwise.
pub fn route(loc: &Locator) -> TransportId {
    match loc.sproto {
        SPROTO_DTLS => TransportId::Dtls,
        SPROTO_TLS => TransportId::Tls,
        _ if loc.is_tcp() => TransportId::Tcp,
        _ => TransportId::Udp,
    }
}

// ============================================================================
// Served locators
// ============================================================================

#[derive(Debug)]
struct Served {
    domain_id: u32,
    id: u32,
    locator: Locator,
    redundant: bool,
}

// ============================================================================
// Registry
// ============================================================================

/// The transport registry.
#[derive(Default)]
pub struct TransportRegistry {
    slots: HashMap<TransportId, Box<dyn Transport>>,
    served: Vec<Served>,
}

impl TransportRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        TransportRegistry::default()
    }

    /// Register a transport for a slot, replacing any previous one.
    pub fn register(&mut self, id: TransportId, transport: Box<dyn Transport>) {
        log::debug!("[MUX] transport {:?} registered", id);
        self.slots.insert(id, transport);
    }

    /// Unregister a transport slot.
    pub fn unregister(&mut self, id: TransportId) -> Option<Box<dyn Transport>> {
        log::debug!("[MUX] transport {:?} unregistered", id);
        self.slots.remove(&id)
    }

    /// True if a slot is occupied.
    pub fn has(&self, id: TransportId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Apply parameters to a slot.
    pub fn set_parameters(&mut self, id: TransportId, params: &TransportParams) {
        if let Some(t) = self.slots.get_mut(&id) {
            t.set_params(params);
        }
    }

    /// Read a slot's parameters.
    pub fn get_parameters(&self, id: TransportId) -> Option<TransportParams> {
        self.slots.get(&id).map(|t| t.params())
    }

    /// Low-level send: dispatch each destination to its transport.
    ///
    /// This is the path the forwarder re-enters after destination
    /// derivation; it never recurses into the forwarder.
    pub fn send_ll(&mut self, dests: &[Locator], msgs: &[SharedMessage]) {
        for dest in dests {
            let id = route(dest);
            match self.slots.get_mut(&id) {
                Some(t) => {
                    if let Err(e) = t.send(dest, msgs) {
                        log::debug!("[MUX] send via {:?} to {} failed: {}", id, dest, e);
                    }
                }
                None => log::debug!("[MUX] no transport for {} ({:?})", dest, id),
            }
        }
    }

    // ========================================================================
    // Served-locator bookkeeping
    // ========================================================================

    /// Begin an address-set update: mark served locators of the given
    /// families redundant. A zero mask means all families.
    pub fn update_begin(&mut self, families: LocatorKind) {
        let mask = if families == 0 {
            LOCATOR_KINDS_ALL
        } else {
            families
        };
        for s in &mut self.served {
            if (s.locator.kind & mask) != 0 {
                s.redundant = true;
            }
        }
    }

    /// Serve a locator. During an update cycle this clears the redundancy
    /// mark of an already-served locator instead of re-adding it.
    pub fn add_locator(
        &mut self,
        domain_id: u32,
        loc: &Locator,
        id: u32,
        serve: bool,
    ) -> io::Result<()> {
        if let Some(existing) = self
            .served
            .iter_mut()
            .find(|s| s.id == id && s.locator.addr_eq(loc))
        {
            existing.redundant = false;
            return Ok(());
        }

        if serve {
            let tid = route(loc);
            let Some(t) = self.slots.get_mut(&tid) else {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "no transport registered for locator kind",
                ));
            };
            t.add_locator(domain_id, loc, id, serve)?;
        }
        self.served.push(Served {
            domain_id,
            id,
            locator: loc.clone(),
            redundant: false,
        });
        log::debug!("[MUX] serving {} (id {})", loc, id);
        Ok(())
    }

    /// Stop serving a locator.
    pub fn remove_locator(&mut self, id: u32, loc: &Locator) {
        let before = self.served.len();
        self.served
            .retain(|s| !(s.id == id && s.locator.addr_eq(loc)));
        if self.served.len() != before {
            let tid = route(loc);
            if let Some(t) = self.slots.get_mut(&tid) {
                t.remove_locator(id, loc);
            }
            log::debug!("[MUX] stopped serving {} (id {})", loc, id);
        }
    }

    /// Finish an address-set update: remove everything still marked
    /// redundant.
    pub fn update_end(&mut self) -> usize {
        let stale: Vec<(u32, Locator)> = self
            .served
            .iter()
            .filter(|s| s.redundant)
            .map(|s| (s.id, s.locator.clone()))
            .collect();
        for (id, loc) in &stale {
            self.remove_locator(*id, loc);
        }
        stale.len()
    }

    /// Currently served locators.
    pub fn served_locators(&self) -> LocatorList {
        self.served.iter().map(|s| s.locator.clone()).collect()
    }

    /// Served locators for one domain.
    pub fn served_for_domain(&self, domain_id: u32) -> LocatorList {
        self.served
            .iter()
            .filter(|s| s.domain_id == domain_id)
            .map(|s| s.locator.clone())
            .collect()
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("slots", &self.slots.keys().collect::<Vec<_>>())
            .field("served", &self.served.len())
            .finish()
    }
}

// ============================================================================
// Locator gathering
// ============================================================================

/// Scope window for interface selection.
#[derive(Clone, Copy, Debug)]
pub struct ScopeRange {
    /// Most local acceptable scope.
    pub min: Scope,
    /// Least local acceptable scope.
    pub max: Scope,
}

impl Default for ScopeRange {
    fn default() -> Self {
        ScopeRange {
            min: Scope::Link,
            max: Scope::Global,
        }
    }
}

/// Gather the unicast and multicast locators of this host for a
/// participant, applying the port formulae and scope filters.
///
/// Returns `(unicast, multicast)` for meta traffic when `meta` is true,
/// user traffic otherwise.
pub fn gather_locators(
    params: &PortParams,
    domain_id: u32,
    participant_id: u32,
    meta: bool,
    kinds: LocatorKind,
    scope: ScopeRange,
) -> (LocatorList, LocatorList) {
    let mut uc = LocatorList::new();
    let mut mc = LocatorList::new();

    let uc_port = if meta {
        params.meta_ucast(domain_id, participant_id)
    } else {
        params.user_ucast(domain_id, participant_id)
    };
    let mc_port = if meta {
        params.meta_mcast(domain_id)
    } else {
        params.user_mcast(domain_id)
    };

    let flags = if meta { LOCF_META } else { 0 };
    if let Ok(ifaces) = local_ip_address::list_afinet_netifas() {
        for (_name, ip) in ifaces {
            let s = Scope::of_addr(&ip);
            if s < scope.min || s > scope.max {
                continue;
            }
            let want = match ip {
                IpAddr::V4(_) => LOCATOR_KIND_UDPV4,
                IpAddr::V6(_) => LOCATOR_KIND_UDPV6,
            };
            if (kinds & want) == 0 {
                continue;
            }
            let sa = std::net::SocketAddr::new(ip, uc_port as u16);
            let mut loc = Locator::from_socket_addr(&sa, false);
            loc.flags = flags | LOCF_UCAST;
            crate::locator::list_add_unique(&mut uc, loc);
        }
    }

    if (kinds & LOCATOR_KIND_UDPV4) != 0 {
        let mut address = [0u8; 16];
        address[12..16].copy_from_slice(&[239, 255, 0, 1]);
        let mut loc = Locator::new(LOCATOR_KIND_UDPV4, address, mc_port);
        loc.flags = flags | LOCF_MCAST;
        mc.push(loc);
    }
    if (kinds & LOCATOR_KIND_UDPV6) != 0 {
        let mut address = [0u8; 16];
        address[0] = 0xff;
        address[1] = 0x02;
        address[15] = 0x01;
        let mut loc = Locator::new(LOCATOR_KIND_UDPV6, address, mc_port);
        loc.flags = flags | LOCF_MCAST;
        mc.push(loc);
    }

    (uc, mc)
}

// ============================================================================
// Tests
// ============================================================================
