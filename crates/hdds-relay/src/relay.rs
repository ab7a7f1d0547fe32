// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The relay core instance.
//!
//! One [`Relay`] owns everything: configuration, the poll loop, the
//! transports, the forwarder and the discovery store. There are no process
//! globals; init and teardown are the constructor and `Drop`.
//!
//! Inbound flow: transport -> parser -> forwarder -> (relayed sends +
//! local delivery through the receive callback). Outbound flow: `send` ->
//! forwarder (when enabled) -> transport dispatch by locator kind.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use parking_lot::Mutex;

use crate::config::RelayConfig;
use crate::cx::CxHandle;
use crate::discovery::{DiscoveryStore, ParticipantInfo};
use crate::fwd::{Forwarder, FwdStats, TcpPeerView};
use crate::guid::GuidPrefix;
use crate::locator::Locator;
use crate::message::{parse_message, DataBuf, SharedMessage};
use crate::mux::{Transport, TransportId, TransportParams, TransportRegistry};
use crate::poller::{IoReady, Poller};
use crate::tcp::transport::{TcpEvents, TcpTransport};
use crate::tcp::{BridgeConfig, TcpAction};
use crate::timer::{secs, TimerId};
use crate::udp::UdpTransport;

/// Receive callback: `(domain_id, message, source locator)`. Ownership of
/// the message passes to the callback.
pub type RxCallback = Box<dyn FnMut(u32, SharedMessage, &Locator)>;

/// Timer owners within the relay loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayTimer {
    /// A TCP channel timer.
    Tcp(CxHandle),
    /// Forwarding-table aging sweep.
    FwdAge,
}

/// Interval between aging sweeps.
const AGE_SWEEP_TICKS: u64 = secs(1);

/// Shared-transport adapter: the registry and the relay both reach the
/// same transport instance.
struct Shared<T>(Rc<RefCell<T>>);

impl<T: Transport> Transport for Shared<T> {
    fn kinds(&self) -> crate::locator::LocatorKind {
        self.0.borrow().kinds()
    }

    fn send(&mut self, dest: &Locator, msgs: &[SharedMessage]) -> std::io::Result<()> {
        self.0.borrow_mut().send(dest, msgs)
    }

    fn add_locator(
        &mut self,
        domain_id: u32,
        loc: &Locator,
        id: u32,
        serve: bool,
    ) -> std::io::Result<()> {
        self.0.borrow_mut().add_locator(domain_id, loc, id, serve)
    }

    fn remove_locator(&mut self, id: u32, loc: &Locator) {
        self.0.borrow_mut().remove_locator(id, loc)
    }

    fn set_params(&mut self, params: &TransportParams) {
        self.0.borrow_mut().set_params(params)
    }

    fn params(&self) -> TransportParams {
        self.0.borrow().params()
    }
}

/// Peer-prefix view over the TCP transport for the forwarder.
struct TcpPeers<'a>(&'a TcpTransport);

impl TcpPeerView for TcpPeers<'_> {
    fn peer_prefix(&self, handle: u32) -> Option<GuidPrefix> {
        self.0.peer_prefix_of(handle)
    }
}

/// Event sink handed to the TCP transport during dispatch; buffers what
/// must flow back into the forwarder and the upper layer.
struct LoopSink<'a> {
    poller: &'a mut Poller<RelayTimer>,
    inbound: Vec<(DataBuf, Locator)>,
    cleared_handles: Vec<u32>,
}

impl TcpEvents for LoopSink<'_> {
    fn arm_timer(&mut self, cx: CxHandle, ticks: u64) -> TimerId {
        self.poller.arm_timer(ticks, RelayTimer::Tcp(cx))
    }

    fn cancel_timer(&mut self, id: TimerId) {
        self.poller.cancel_timer(id);
    }

    fn clear_reply_locators(&mut self, handle: u32) {
        self.cleared_handles.push(handle);
    }

    fn deliver_rtps(&mut self, data: DataBuf, src: &Locator) {
        self.inbound.push((data, src.clone()));
    }
}

// ============================================================================
// Relay
// ============================================================================

/// The core instance.
pub struct Relay {
    domain_id: u32,
    config: RelayConfig,
    poller: Poller<RelayTimer>,
    registry: TransportRegistry,
    udp: Rc<RefCell<UdpTransport>>,
    tcp: Rc<RefCell<TcpTransport>>,
    forwarder: Forwarder,
    disc: DiscoveryStore,
    rx: RxCallback,
    stats: std::sync::Arc<Mutex<FwdStats>>,
}

impl Relay {
    /// Build the core for a domain with the upper receive callback.
    pub fn new(
        domain_id: u32,
        own_prefix: GuidPrefix,
        config: RelayConfig,
        rx: RxCallback,
    ) -> std::io::Result<Self> {
        let mut poller = Poller::new()?;
        poller.arm_timer(AGE_SWEEP_TICKS, RelayTimer::FwdAge);

        let udp = Rc::new(RefCell::new(UdpTransport::new(Some(poller.registrar()?))));
        let bridge_cfg = BridgeConfig {
            own_prefix,
            public_addr: [0u8; 16],
            forward: config.forward,
            share: config.tcp_share,
        };
        let tcp = Rc::new(RefCell::new(TcpTransport::new(
            bridge_cfg,
            Some(poller.registrar()?),
        )));

        let mut registry = TransportRegistry::new();
        if config.udp_mode.usable() {
            registry.register(TransportId::Udp, Box::new(Shared(udp.clone())));
        }
        if config.tcp_mode.usable() {
            registry.register(TransportId::Tcp, Box::new(Shared(tcp.clone())));
        }

        Ok(Relay {
            domain_id,
            config,
            poller,
            registry,
            udp,
            tcp,
            forwarder: Forwarder::new(),
            disc: DiscoveryStore::new(own_prefix),
            rx,
            stats: std::sync::Arc::new(Mutex::new(FwdStats::default())),
        })
    }

    /// Shareable counter snapshot handle for monitoring threads.
    pub fn stats_handle(&self) -> std::sync::Arc<Mutex<FwdStats>> {
        self.stats.clone()
    }

    /// Configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Forwarder counters snapshot.
    pub fn fwd_stats(&self) -> FwdStats {
        self.forwarder.stats()
    }

    /// Discovery store (to be kept current by the embedding stack).
    pub fn discovery_mut(&mut self) -> &mut DiscoveryStore {
        &mut self.disc
    }

    /// Transport registry.
    pub fn registry_mut(&mut self) -> &mut TransportRegistry {
        &mut self.registry
    }

    // ========================================================================
    // Discovery-facing interface
    // ========================================================================

    /// Install or refresh a participant's forwarding entry.
    pub fn participant_new(&mut self, info: ParticipantInfo, update: bool) {
        self.disc.upsert_participant(info.clone());
        self.forwarder.participant_new(&info, update);
    }

    /// Retire a participant.
    pub fn participant_dispose(&mut self, prefix: &GuidPrefix) {
        self.disc.remove_participant(prefix);
        self.forwarder.participant_dispose(prefix);
    }

    /// Publish one of our own reachable locators.
    pub fn locator_add(&mut self, loc: &Locator, id: u32, serve: bool) -> std::io::Result<()> {
        self.registry.add_locator(self.domain_id, loc, id, serve)
    }

    /// Withdraw one of our own locators.
    pub fn locator_remove(&mut self, id: u32, loc: &Locator) {
        self.registry.remove_locator(id, loc);
    }

    /// Run a locator-set update cycle for the given kind families
    /// (0 = all).
    pub fn locators_update<F>(&mut self, families: crate::locator::LocatorKind, add: F)
    where
        F: FnOnce(&mut TransportRegistry),
    {
        self.registry.update_begin(families);
        add(&mut self.registry);
        let removed = self.registry.update_end();
        if removed > 0 {
            log::debug!("[MUX] update cycle retired {} locators", removed);
        }
    }

    /// Apply a named configuration parameter; address-affecting changes
    /// are reported so the caller can rerun `locators_update`.
    pub fn config_apply(&mut self, name: &str, value: &str) -> Result<bool, crate::config::ConfigError> {
        let needs_update = self.config.apply(name, value)?;
        self.apply_suspend_latches();
        Ok(needs_update)
    }

    fn apply_suspend_latches(&mut self) {
        for (id, suspended) in [
            (TransportId::Udp, self.config.udp_suspended),
            (TransportId::Tcp, self.config.tcp_suspended),
        ] {
            if let Some(mut params) = self.registry.get_parameters(id) {
                if params.suspended != suspended {
                    params.suspended = suspended;
                    self.registry.set_parameters(id, &params);
                }
            }
        }
    }

    /// Cooperatively suspend or resume the UDP transport.
    pub fn udp_suspend(&mut self, suspended: bool) {
        self.config.udp_suspended = suspended;
        self.apply_suspend_latches();
    }

    /// Cooperatively suspend or resume the TCP transport.
    pub fn tcp_suspend(&mut self, suspended: bool) {
        self.config.tcp_suspended = suspended;
        self.apply_suspend_latches();
    }

    // ========================================================================
    // Bridge management
    // ========================================================================

    /// Connect a control channel to a remote bridge server.
    pub fn bridge_connect(&mut self, addr: SocketAddr) -> CxHandle {
        let tcp = self.tcp.clone();
        let mut sink = LoopSink {
            poller: &mut self.poller,
            inbound: Vec::new(),
            cleared_handles: Vec::new(),
        };
        let h = tcp.borrow_mut().connect_control(addr, &mut sink);
        let LoopSink {
            poller: _,
            inbound,
            cleared_handles,
        } = sink;
        self.absorb(inbound, cleared_handles);
        h
    }

    /// Start the local bridge server.
    pub fn bridge_listen(&mut self, addr: SocketAddr) -> std::io::Result<()> {
        if self.config.tcp_private {
            log::debug!("[TCP] private mode, not starting bridge server");
            return Ok(());
        }
        self.tcp.borrow_mut().listen(addr)
    }

    // ========================================================================
    // Send path
    // ========================================================================

    /// Send messages to a destination locator set.
    ///
    /// With forwarding enabled the forwarder derives the real destinations
    /// first; a locator with a non-zero handle always bypasses derivation.
    pub fn send(&mut self, dests: &[Locator], msgs: &[SharedMessage]) {
        if self.config.forward {
            let actions = self.forwarder.send(dests, msgs, &self.disc);
            for action in actions {
                self.registry.send_ll(&action.dests, &[action.msg]);
            }
        } else {
            self.registry.send_ll(dests, msgs);
        }
        self.run_deferred_tcp();
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// Run one poll round and dispatch everything that became ready.
    pub fn run_once(&mut self) -> std::io::Result<()> {
        let (ready, fired) = self.poller.poll_once()?;
        for ev in ready {
            self.dispatch_io(ev);
        }
        for (_id, tag) in fired {
            self.dispatch_timer(tag);
        }
        self.run_deferred_tcp();
        Ok(())
    }

    /// Wake a blocked `run_once` from another thread.
    pub fn wake(&self) -> std::io::Result<()> {
        self.poller.wake()
    }

    fn dispatch_io(&mut self, ev: IoReady) {
        // UDP datagrams.
        let datagrams = self.udp.borrow_mut().recv_ready(ev.token);
        if !datagrams.is_empty() {
            for dg in datagrams {
                let mut src = Locator::from_socket_addr(&dg.source, false);
                src.flags = dg.locator.flags;
                src.handle = dg.locator.handle;
                self.process_inbound(dg.data, src);
            }
            return;
        }

        // TCP listener or connection.
        let tcp = self.tcp.clone();
        let is_listener = tcp.borrow().is_listener(ev.token);
        let mut sink = LoopSink {
            poller: &mut self.poller,
            inbound: Vec::new(),
            cleared_handles: Vec::new(),
        };
        if is_listener {
            tcp.borrow_mut().on_accept(ev.token, &mut sink);
        } else {
            tcp.borrow_mut()
                .on_ready(ev.token, ev.readable, ev.writable, &mut sink);
        }
        let LoopSink {
            poller: _,
            inbound,
            cleared_handles,
        } = sink;
        self.absorb(inbound, cleared_handles);
    }

    fn dispatch_timer(&mut self, tag: RelayTimer) {
        match tag {
            RelayTimer::Tcp(h) => {
                let tcp = self.tcp.clone();
                let mut sink = LoopSink {
                    poller: &mut self.poller,
                    inbound: Vec::new(),
                    cleared_handles: Vec::new(),
                };
                tcp.borrow_mut().on_timeout(h, &mut sink);
                let LoopSink {
                    poller: _,
                    inbound,
                    cleared_handles,
                } = sink;
                self.absorb(inbound, cleared_handles);
            }
            RelayTimer::FwdAge => {
                let expired = self.forwarder.age_sweep();
                if expired > 0 {
                    log::debug!("[FWD] aged out {} entries", expired);
                }
                self.poller.arm_timer(AGE_SWEEP_TICKS, RelayTimer::FwdAge);
            }
        }
    }

    /// Execute actions the TCP transport parked outside the event loop.
    fn run_deferred_tcp(&mut self) {
        let tcp = self.tcp.clone();
        let deferred: Vec<TcpAction> = tcp.borrow_mut().take_deferred();
        if deferred.is_empty() {
            return;
        }
        let mut sink = LoopSink {
            poller: &mut self.poller,
            inbound: Vec::new(),
            cleared_handles: Vec::new(),
        };
        tcp.borrow_mut().run_actions(deferred, &mut sink);
        let LoopSink {
            poller: _,
            inbound,
            cleared_handles,
        } = sink;
        self.absorb(inbound, cleared_handles);
    }

    /// Fold buffered sink output back into the forwarder and upper layer.
    fn absorb(&mut self, inbound: Vec<(DataBuf, Locator)>, cleared_handles: Vec<u32>) {
        for handle in cleared_handles {
            self.forwarder.forget_handle(handle);
        }
        for (data, src) in inbound {
            self.process_inbound(data, src);
        }
    }

    /// Parse one received buffer and route it.
    fn process_inbound(&mut self, data: DataBuf, src: Locator) {
        let msg = match parse_message(&data) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("[RELAY] dropping malformed message from {}: {}", src, e);
                return;
            }
        };

        if !self.config.forward {
            (self.rx)(self.domain_id, SharedMessage::new(msg), &src);
            return;
        }

        let decision = {
            let tcp = self.tcp.borrow();
            let peers = TcpPeers(&tcp);
            self.forwarder.receive(&msg, &src, &self.disc, &peers)
        };
        *self.stats.lock() = self.forwarder.stats();

        if let Some((dests, relayed)) = decision.forward {
            self.registry
                .send_ll(&dests, &[SharedMessage::new(relayed)]);
        }
        if decision.local {
            (self.rx)(self.domain_id, SharedMessage::new(msg), &src);
        }
        self.run_deferred_tcp();
    }

    /// Inject a received buffer as if it arrived from a transport (test
    /// and replay hook).
    pub fn inject(&mut self, data: Vec<u8>, src: Locator) {
        self.process_inbound(DataBuf::new(data), src);
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("domain_id", &self.domain_id)
            .field("forward", &self.config.forward)
            .field("table_entries", &self.forwarder.table().len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
