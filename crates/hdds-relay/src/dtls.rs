// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DTLS connection supervision.
//!
//! Per peer (identified by source address) one context walks
//! `SERVER_RX -> ACCEPT -> DATA` or `CONNECT -> DATA`. The handshake
//! engine itself sits behind [`SecureSession`]; this module owns what the
//! engine cannot: deterministic role election, the stateless cookie, the
//! bounded retransmit supervision and the idle watchdog.
//!
//! Two separate timers are used on purpose (the protocol-retransmit timer
//! and the idle timer), so a timeout can never be attributed to the wrong
//! concern.
//!
//! # Role election
//!
//! Both peers compare their smallest own locator with the peer's: the side
//! whose locator sorts first becomes server. The losing side pins itself
//! as client by setting `LOCF_FCLIENT` on the peer locator, so reconnects
//! after teardown keep the original orientation.

use crate::cx::CxSide;
use crate::locator::{Locator, LOCF_FCLIENT};
use crate::timer::secs;

// ============================================================================
// Constants
// ============================================================================

/// Idle watchdog: a context with no traffic in this window closes.
pub const DTLS_IDLE_TO: u64 = secs(25);

/// Bounded protocol-retransmit budget.
pub const DTLS_MAX_RETRIES: u32 = 2;

/// Cookie length (HMAC-SHA1 output).
pub const COOKIE_LEN: usize = 20;

// ============================================================================
// Secure session seam
// ============================================================================

/// Outcome of driving a handshake or I/O step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// Step finished.
    Done,
    /// Needs the socket readable.
    WantRead,
    /// Needs the socket writable.
    WantWrite,
    /// Unrecoverable; tear the connection down.
    Fatal,
}

/// The handshake/record engine a DTLS context drives.
///
/// Implementations wrap an actual TLS library session; tests use a
/// scripted mock.
pub trait SecureSession {
    /// Advance the handshake.
    fn handshake(&mut self) -> SessionStatus;

    /// True once the handshake completed.
    fn is_established(&self) -> bool;

    /// Decrypt application data into `buf`; `Done` with 0 bytes means no
    /// record is ready.
    fn read(&mut self, buf: &mut [u8]) -> (SessionStatus, usize);

    /// Encrypt and send application data; partial progress is reported in
    /// the byte count.
    fn write(&mut self, buf: &[u8]) -> (SessionStatus, usize);

    /// True while decrypted records are still buffered; the read loop must
    /// drain before yielding to the poll loop.
    fn pending(&self) -> bool;

    /// The engine's current retransmit deadline in ticks, if armed.
    fn retransmit_ticks(&self) -> Option<u64>;

    /// Tell the engine its retransmit deadline passed.
    fn on_retransmit(&mut self);
}

// ============================================================================
// Role election
// ============================================================================

/// Decide our side for a peer given our smallest own locator.
///
/// An `LOCF_FCLIENT` flag already present on the peer locator pins us as
/// client regardless of the comparison.
pub fn elect_role(own_smallest: &Locator, peer: &Locator) -> CxSide {
    if (peer.flags & LOCF_FCLIENT) != 0 {
        return CxSide::Client;
    }
    match own_smallest.cmp_addr(peer) {
        std::cmp::Ordering::Less => CxSide::Server,
        _ => CxSide::Client,
    }
}

/// Apply the post-election pinning: the client side marks the peer locator
/// so later reconnects keep the orientation.
pub fn pin_role(peer: &mut Locator, side: CxSide) {
    if side == CxSide::Client {
        peer.flags |= LOCF_FCLIENT;
    }
}

// ============================================================================
// Cookies
// ============================================================================

/// HelloVerifyRequest cookie generator: HMAC-SHA1 over the peer address
/// and port with a lazily created process-wide random secret.
#[derive(Default)]
pub struct CookieJar {
    key: Option<ring::hmac::Key>,
}

impl CookieJar {
    /// Empty jar; the secret is created on first use.
    pub fn new() -> Self {
        CookieJar::default()
    }

    fn key(&mut self) -> &ring::hmac::Key {
        self.key.get_or_insert_with(|| {
            let mut secret = [0u8; COOKIE_LEN];
            for b in &mut secret {
                *b = fastrand::u8(..);
            }
            ring::hmac::Key::new(ring::hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, &secret)
        })
    }

    fn material(addr: &[u8; 16], port: u32) -> [u8; 20] {
        let mut m = [0u8; 20];
        m[..16].copy_from_slice(addr);
        m[16..].copy_from_slice(&port.to_ne_bytes());
        m
    }

    /// Cookie for a peer address.
    pub fn generate(&mut self, addr: &[u8; 16], port: u32) -> [u8; COOKIE_LEN] {
        let tag = ring::hmac::sign(self.key(), &Self::material(addr, port));
        let mut cookie = [0u8; COOKIE_LEN];
        cookie.copy_from_slice(tag.as_ref());
        cookie
    }

    /// Verify a peer-echoed cookie.
    pub fn verify(&mut self, addr: &[u8; 16], port: u32, cookie: &[u8]) -> bool {
        ring::hmac::verify(self.key(), &Self::material(addr, port), cookie).is_ok()
    }
}

impl std::fmt::Debug for CookieJar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieJar")
            .field("initialized", &self.key.is_some())
            .finish()
    }
}

// ============================================================================
// Per-peer supervision FSM
// ============================================================================

/// DTLS context states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DtlsState {
    /// Server socket passively waiting for a ClientHello.
    ServerRx,
    /// Server-side handshake in progress.
    Accept,
    /// Client-side handshake in progress.
    Connect,
    /// Application data phase.
    Data,
}

/// Side effects requested by the supervision FSM.
#[derive(Debug, PartialEq, Eq)]
pub enum DtlsAction {
    /// Update the poll interest mask.
    PollMask {
        /// Interested in readable.
        read: bool,
        /// Interested in writable.
        write: bool,
    },
    /// Arm the protocol-retransmit timer.
    StartProtocolTimer {
        /// Delay in ticks.
        ticks: u64,
    },
    /// Disarm the protocol-retransmit timer.
    StopProtocolTimer,
    /// Re-arm the idle watchdog.
    RestartIdleTimer {
        /// Delay in ticks.
        ticks: u64,
    },
    /// Decrypted application data to hand to the message parser.
    Deliver(Vec<u8>),
    /// Tear the connection down.
    Close,
}

/// Supervision state for one peer connection.
#[derive(Debug)]
pub struct DtlsPeer<S> {
    state: DtlsState,
    session: S,
    retries: u32,
    /// Traffic seen since the idle timer was last armed.
    active: bool,
}

impl<S: SecureSession> DtlsPeer<S> {
    /// Supervise a new handshake; `server` picks ACCEPT vs CONNECT.
    pub fn new(session: S, server: bool) -> Self {
        DtlsPeer {
            state: if server { DtlsState::Accept } else { DtlsState::Connect },
            session,
            retries: DTLS_MAX_RETRIES,
            active: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> DtlsState {
        self.state
    }

    /// Access the underlying session.
    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    /// Drive the handshake after a poll event.
    pub fn advance_handshake(&mut self) -> Vec<DtlsAction> {
        if self.state == DtlsState::Data {
            return Vec::new();
        }
        match self.session.handshake() {
            SessionStatus::Done => {
                self.state = DtlsState::Data;
                self.retries = DTLS_MAX_RETRIES;
                log::debug!("[DTLS] handshake complete");
                vec![
                    DtlsAction::StopProtocolTimer,
                    DtlsAction::PollMask {
                        read: true,
                        write: false,
                    },
                    DtlsAction::RestartIdleTimer {
                        ticks: DTLS_IDLE_TO,
                    },
                ]
            }
            SessionStatus::WantRead => {
                let mut actions = vec![DtlsAction::PollMask {
                    read: true,
                    write: false,
                }];
                if let Some(ticks) = self.session.retransmit_ticks() {
                    actions.push(DtlsAction::StartProtocolTimer { ticks });
                }
                actions
            }
            SessionStatus::WantWrite => vec![DtlsAction::PollMask {
                read: true,
                write: true,
            }],
            SessionStatus::Fatal => {
                log::debug!("[DTLS] handshake failed");
                vec![DtlsAction::Close]
            }
        }
    }

    /// The protocol-retransmit timer fired.
    pub fn on_protocol_timeout(&mut self) -> Vec<DtlsAction> {
        if self.state == DtlsState::Data {
            return Vec::new();
        }
        if self.retries == 0 {
            log::debug!("[DTLS] handshake retransmit budget exhausted");
            return vec![DtlsAction::Close];
        }
        self.retries -= 1;
        self.session.on_retransmit();
        self.advance_handshake()
    }

    /// The idle watchdog fired: close if no traffic happened in the
    /// window, re-arm otherwise.
    pub fn on_idle_timeout(&mut self) -> Vec<DtlsAction> {
        if self.active {
            self.active = false;
            return vec![DtlsAction::RestartIdleTimer {
                ticks: DTLS_IDLE_TO,
            }];
        }
        log::debug!("[DTLS] idle window expired");
        vec![DtlsAction::Close]
    }

    /// Socket readable in the DATA state: drain every pending record to
    /// avoid starvation.
    pub fn on_readable(&mut self) -> Vec<DtlsAction> {
        if self.state != DtlsState::Data {
            return self.advance_handshake();
        }
        let mut actions = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (status, n) = self.session.read(&mut buf);
            match status {
                SessionStatus::Done if n > 0 => {
                    self.active = true;
                    actions.push(DtlsAction::Deliver(buf[..n].to_vec()));
                }
                SessionStatus::Done | SessionStatus::WantRead => break,
                SessionStatus::WantWrite => {
                    actions.push(DtlsAction::PollMask {
                        read: true,
                        write: true,
                    });
                    break;
                }
                SessionStatus::Fatal => {
                    actions.push(DtlsAction::Close);
                    return actions;
                }
            }
            if !self.session.pending() {
                break;
            }
        }
        actions
    }

    /// Send one message as a single record.
    pub fn send(&mut self, data: &[u8]) -> (Vec<DtlsAction>, usize) {
        if self.state != DtlsState::Data {
            return (Vec::new(), 0);
        }
        let (status, n) = self.session.write(data);
        let actions = match status {
            SessionStatus::Done => {
                self.active = true;
                vec![DtlsAction::PollMask {
                    read: true,
                    write: false,
                }]
            }
            SessionStatus::WantRead | SessionStatus::WantWrite => vec![DtlsAction::PollMask {
                read: true,
                write: true,
            }],
            SessionStatus::Fatal => vec![DtlsAction::Close],
        };
        (actions, n)
    }
}

// ============================================================================
// Per-peer context management
// ============================================================================

/// Factory producing handshake engines for new peers.
pub trait SessionFactory {
    /// Engine type.
    type Session: SecureSession;

    /// Engine for a server-role context.
    fn server(&mut self) -> Self::Session;

    /// Engine for a client-role context.
    fn client(&mut self) -> Self::Session;
}

/// Per-peer DTLS context registry.
///
/// The single DTLS server socket per family attracts traffic whose source
/// has no matching context; the first datagram from a new source elects
/// the role against our smallest own locator, pins the loser as client,
/// and instantiates the handshake context. Subsequent traffic from that
/// source lands on the existing context.
pub struct DtlsMux<F: SessionFactory> {
    factory: F,
    cookies: CookieJar,
    own_smallest: Locator,
    peers: std::collections::HashMap<([u8; 16], u32), DtlsPeer<F::Session>>,
}

impl<F: SessionFactory> DtlsMux<F> {
    /// Registry for a node whose smallest own locator is `own_smallest`.
    pub fn new(factory: F, own_smallest: Locator) -> Self {
        DtlsMux {
            factory,
            cookies: CookieJar::new(),
            own_smallest,
            peers: std::collections::HashMap::new(),
        }
    }

    /// The cookie jar for HelloVerifyRequest handling.
    pub fn cookies(&mut self) -> &mut CookieJar {
        &mut self.cookies
    }

    /// Number of live peer contexts.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Context for a source address, creating one on first contact.
    ///
    /// Returns the context and whether it was just created. The peer
    /// locator is updated with the FCLIENT pin when we elect client.
    pub fn peer_for(
        &mut self,
        peer: &mut Locator,
    ) -> (&mut DtlsPeer<F::Session>, bool) {
        let key = (peer.address, peer.port);
        let created = !self.peers.contains_key(&key);
        if created {
            let side = elect_role(&self.own_smallest, peer);
            pin_role(peer, side);
            let ctx = match side {
                CxSide::Server => DtlsPeer::new(self.factory.server(), true),
                CxSide::Client => DtlsPeer::new(self.factory.client(), false),
            };
            log::debug!("[DTLS] new peer {} as {:?}", peer, side);
            self.peers.insert(key, ctx);
        }
        (self.peers.get_mut(&key).expect("present"), created)
    }

    /// Existing context for a source address.
    pub fn peer(&mut self, addr: &[u8; 16], port: u32) -> Option<&mut DtlsPeer<F::Session>> {
        self.peers.get_mut(&(*addr, port))
    }

    /// Drop a peer context.
    pub fn close(&mut self, addr: &[u8; 16], port: u32) -> bool {
        self.peers.remove(&(*addr, port)).is_some()
    }
}

impl<F: SessionFactory> std::fmt::Debug for DtlsMux<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtlsMux")
            .field("peers", &self.peers.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::LOCATOR_KIND_UDPV4;
    use std::collections::VecDeque;

    fn udp4(a: [u8; 4], port: u32) -> Locator {
        let mut address = [0u8; 16];
        address[12..16].copy_from_slice(&a);
        Locator::new(LOCATOR_KIND_UDPV4, address, port)
    }

    /// Scripted session: pops one status per handshake step.
    #[derive(Default)]
    struct MockSession {
        script: VecDeque<SessionStatus>,
        established: bool,
        rx: VecDeque<Vec<u8>>,
        written: Vec<u8>,
        retransmits: u32,
        retransmit_ticks: Option<u64>,
    }

    impl SecureSession for MockSession {
        fn handshake(&mut self) -> SessionStatus {
            let s = self.script.pop_front().unwrap_or(SessionStatus::Done);
            if s == SessionStatus::Done {
                self.established = true;
            }
            s
        }

        fn is_established(&self) -> bool {
            self.established
        }

        fn read(&mut self, buf: &mut [u8]) -> (SessionStatus, usize) {
            match self.rx.pop_front() {
                Some(data) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    (SessionStatus::Done, n)
                }
                None => (SessionStatus::WantRead, 0),
            }
        }

        fn write(&mut self, buf: &[u8]) -> (SessionStatus, usize) {
            self.written.extend_from_slice(buf);
            (SessionStatus::Done, buf.len())
        }

        fn pending(&self) -> bool {
            !self.rx.is_empty()
        }

        fn retransmit_ticks(&self) -> Option<u64> {
            self.retransmit_ticks
        }

        fn on_retransmit(&mut self) {
            self.retransmits += 1;
        }
    }

    #[test]
    fn test_role_election_smaller_becomes_server() {
        let a = udp4([10, 0, 0, 1], 7400);
        let b = udp4([10, 0, 0, 2], 7400);

        // Viewpoint of A: own locator sorts first -> server.
        assert_eq!(elect_role(&a, &b), CxSide::Server);
        // Viewpoint of B: peer sorts first -> client.
        assert_eq!(elect_role(&b, &a), CxSide::Client);
    }

    #[test]
    fn test_role_election_port_breaks_tie() {
        let a = udp4([10, 0, 0, 1], 7400);
        let b = udp4([10, 0, 0, 1], 7410);
        assert_eq!(elect_role(&a, &b), CxSide::Server);
        assert_eq!(elect_role(&b, &a), CxSide::Client);
    }

    #[test]
    fn test_fclient_pin_survives_reconnect() {
        let a = udp4([10, 0, 0, 2], 7400); // we sort later -> client
        let mut peer = udp4([10, 0, 0, 1], 7400);

        let side = elect_role(&a, &peer);
        assert_eq!(side, CxSide::Client);
        pin_role(&mut peer, side);
        assert_ne!(peer.flags & LOCF_FCLIENT, 0);

        // Next attempt: even if addresses changed the pin keeps us client.
        let side2 = elect_role(&udp4([9, 0, 0, 1], 1), &peer);
        assert_eq!(side2, CxSide::Client);
    }

    #[test]
    fn test_cookie_roundtrip_and_peer_sensitivity() {
        let mut jar = CookieJar::new();
        let addr = [1u8; 16];
        let cookie = jar.generate(&addr, 7400);

        assert!(jar.verify(&addr, 7400, &cookie));
        assert!(!jar.verify(&addr, 7401, &cookie));
        assert!(!jar.verify(&[2u8; 16], 7400, &cookie));
        // Deterministic per peer while the secret lives.
        assert_eq!(cookie, jar.generate(&addr, 7400));
    }

    #[test]
    fn test_cookies_differ_between_processes() {
        let mut jar_a = CookieJar::new();
        let mut jar_b = CookieJar::new();
        let addr = [1u8; 16];
        assert_ne!(jar_a.generate(&addr, 7400), jar_b.generate(&addr, 7400));
    }

    #[test]
    fn test_handshake_completion_enters_data() {
        let mut session = MockSession::default();
        session.script.push_back(SessionStatus::WantRead);
        session.script.push_back(SessionStatus::Done);
        let mut peer = DtlsPeer::new(session, true);
        assert_eq!(peer.state(), DtlsState::Accept);

        let actions = peer.advance_handshake();
        assert!(actions.contains(&DtlsAction::PollMask {
            read: true,
            write: false
        }));
        assert_eq!(peer.state(), DtlsState::Accept);

        let actions = peer.advance_handshake();
        assert!(actions.contains(&DtlsAction::StopProtocolTimer));
        assert!(actions.contains(&DtlsAction::RestartIdleTimer {
            ticks: DTLS_IDLE_TO
        }));
        assert_eq!(peer.state(), DtlsState::Data);
    }

    #[test]
    fn test_retransmit_budget_bounded() {
        let mut session = MockSession::default();
        // Stay in WantRead forever.
        for _ in 0..10 {
            session.script.push_back(SessionStatus::WantRead);
        }
        let mut peer = DtlsPeer::new(session, false);
        assert_eq!(peer.state(), DtlsState::Connect);

        // Two retransmits are tolerated.
        for _ in 0..DTLS_MAX_RETRIES {
            let actions = peer.on_protocol_timeout();
            assert!(!actions.contains(&DtlsAction::Close));
        }
        // The next timeout tears down.
        let actions = peer.on_protocol_timeout();
        assert_eq!(actions, vec![DtlsAction::Close]);
        assert_eq!(peer.session_mut().retransmits, DTLS_MAX_RETRIES);
    }

    #[test]
    fn test_idle_watchdog_closes_quiet_peer() {
        let mut session = MockSession::default();
        session.script.push_back(SessionStatus::Done);
        let mut peer = DtlsPeer::new(session, true);
        peer.advance_handshake();

        // No traffic in the window: deterministic close.
        let actions = peer.on_idle_timeout();
        assert_eq!(actions, vec![DtlsAction::Close]);
    }

    #[test]
    fn test_idle_watchdog_rearms_on_traffic() {
        let mut session = MockSession::default();
        session.script.push_back(SessionStatus::Done);
        session.rx.push_back(vec![1, 2, 3]);
        let mut peer = DtlsPeer::new(session, true);
        peer.advance_handshake();

        let actions = peer.on_readable();
        assert!(actions.iter().any(|a| matches!(a, DtlsAction::Deliver(_))));

        let actions = peer.on_idle_timeout();
        assert_eq!(
            actions,
            vec![DtlsAction::RestartIdleTimer {
                ticks: DTLS_IDLE_TO
            }]
        );
        // A second quiet window closes.
        assert_eq!(peer.on_idle_timeout(), vec![DtlsAction::Close]);
    }

    #[test]
    fn test_read_drains_all_pending_records() {
        let mut session = MockSession::default();
        session.script.push_back(SessionStatus::Done);
        session.rx.push_back(vec![1]);
        session.rx.push_back(vec![2]);
        session.rx.push_back(vec![3]);
        let mut peer = DtlsPeer::new(session, true);
        peer.advance_handshake();

        let actions = peer.on_readable();
        let delivered: Vec<&DtlsAction> = actions
            .iter()
            .filter(|a| matches!(a, DtlsAction::Deliver(_)))
            .collect();
        assert_eq!(delivered.len(), 3);
    }

    #[test]
    fn test_send_before_data_refused() {
        let session = MockSession::default();
        let mut peer = DtlsPeer::new(session, false);
        let (actions, n) = peer.send(b"early");
        assert!(actions.is_empty());
        assert_eq!(n, 0);
    }

    #[test]
    fn test_send_in_data_state() {
        let mut session = MockSession::default();
        session.script.push_back(SessionStatus::Done);
        let mut peer = DtlsPeer::new(session, false);
        peer.advance_handshake();

        let (actions, n) = peer.send(b"record");
        assert_eq!(n, 6);
        assert!(actions.contains(&DtlsAction::PollMask {
            read: true,
            write: false
        }));
        assert_eq!(peer.session_mut().written, b"record");
    }

    struct MockFactory;

    impl SessionFactory for MockFactory {
        type Session = MockSession;

        fn server(&mut self) -> MockSession {
            MockSession::default()
        }

        fn client(&mut self) -> MockSession {
            MockSession::default()
        }
    }

    #[test]
    fn test_mux_creates_context_on_first_contact() {
        let own = udp4([10, 0, 0, 1], 7400);
        let mut mux = DtlsMux::new(MockFactory, own);

        let mut peer = udp4([10, 0, 0, 2], 7400);
        let (ctx, created) = mux.peer_for(&mut peer);
        assert!(created);
        // We sort first, so we are server and the peer is not pinned.
        assert_eq!(ctx.state(), DtlsState::Accept);
        assert_eq!(peer.flags & LOCF_FCLIENT, 0);
        assert_eq!(mux.peer_count(), 1);

        // Same source reuses the context.
        let (_, created) = mux.peer_for(&mut peer);
        assert!(!created);
        assert_eq!(mux.peer_count(), 1);
    }

    #[test]
    fn test_mux_elects_client_and_pins() {
        let own = udp4([10, 0, 0, 9], 7400);
        let mut mux = DtlsMux::new(MockFactory, own);

        let mut peer = udp4([10, 0, 0, 2], 7400);
        let (ctx, _) = mux.peer_for(&mut peer);
        assert_eq!(ctx.state(), DtlsState::Connect);
        assert_ne!(peer.flags & LOCF_FCLIENT, 0);

        // After teardown, the pin keeps the orientation.
        assert!(mux.close(&peer.address, peer.port));
        let (ctx, created) = mux.peer_for(&mut peer);
        assert!(created);
        assert_eq!(ctx.state(), DtlsState::Connect);
    }
}
