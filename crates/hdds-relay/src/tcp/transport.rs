// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket layer of the TCP bridge.
//!
//! Executes [`TcpAction`]s against real listeners and connections, feeds
//! received bytes through the frame reader, and routes the results: RPSC
//! frames to the channel FSMs, RTPS frames up to the message path - but
//! only once the carrying channel reached protocol-state DATA; anything
//! earlier is dropped.
//!
//! Partial writes park the remaining bytes as a per-connection fragment
//! and toggle writable interest; a queued `CxBindSuccess` is flushed ahead
//! of data when the socket becomes writable again.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr};

use mio::{Interest, Token};

use crate::cx::{CxHandle, CxMode, CxState, CxTable, CxType, ProtoState};
use crate::guid::GuidPrefix;
use crate::locator::{Locator, LocatorKind, LOCATOR_KINDS_TCP};
use crate::message::{build_message, DataBuf, SharedMessage};
use crate::mux::{Transport, TransportParams};
use crate::poller::{interest, Registrar};
use crate::tcp::frame::{encode_rtps_frame, TcpFrameReader, TcpInbound};
use crate::tcp::rpsc::parse_ctrl;
use crate::tcp::stream::BoxedStream;
use crate::tcp::{BridgeConfig, BridgeFsm, TcpAction, PENDING_TO};
use crate::timer::TimerId;

/// Read chunk per wake-up.
const READ_BUF: usize = 16 * 1024;

/// Callbacks the transport raises into its owner while executing actions.
pub trait TcpEvents {
    /// Arm a timer for a channel; the owner routes expiry back through
    /// [`TcpTransport::on_timeout`].
    fn arm_timer(&mut self, cx: CxHandle, ticks: u64) -> TimerId;

    /// Disarm a channel timer.
    fn cancel_timer(&mut self, id: TimerId);

    /// Reply locators learned through this connection handle are invalid.
    fn clear_reply_locators(&mut self, handle: u32);

    /// A complete RTPS message arrived on an open data channel.
    fn deliver_rtps(&mut self, data: DataBuf, src: &Locator);
}

/// The TCP bridge transport.
pub struct TcpTransport {
    params: TransportParams,
    registrar: Option<Registrar>,
    /// Connection records for every TCP/TLS channel.
    pub cxs: CxTable,
    fsm: BridgeFsm,
    listeners: HashMap<Token, mio::net::TcpListener>,
    streams: HashMap<CxHandle, BoxedStream>,
    tokens: HashMap<Token, CxHandle>,
    cx_tokens: HashMap<CxHandle, Token>,
    readers: HashMap<CxHandle, TcpFrameReader>,
    frags: HashMap<CxHandle, (Vec<u8>, usize)>,
    timers: HashMap<CxHandle, TimerId>,
    /// Actions produced outside an event dispatch (e.g. from `send`),
    /// executed on the next loop turn.
    deferred: Vec<TcpAction>,
}

impl TcpTransport {
    /// Transport with the given bridge configuration.
    pub fn new(cfg: BridgeConfig, registrar: Option<Registrar>) -> Self {
        TcpTransport {
            params: TransportParams::default(),
            registrar,
            cxs: CxTable::new(),
            fsm: BridgeFsm::new(cfg),
            listeners: HashMap::new(),
            streams: HashMap::new(),
            tokens: HashMap::new(),
            cx_tokens: HashMap::new(),
            readers: HashMap::new(),
            frags: HashMap::new(),
            timers: HashMap::new(),
            deferred: Vec::new(),
        }
    }

    /// The protocol engine (tests and introspection).
    pub fn fsm(&self) -> &BridgeFsm {
        &self.fsm
    }

    /// Channel handle registered under a poll token.
    pub fn cx_of(&self, token: Token) -> Option<CxHandle> {
        self.tokens.get(&token).copied()
    }

    /// True if the token belongs to one of our listeners.
    pub fn is_listener(&self, token: Token) -> bool {
        self.listeners.contains_key(&token)
    }

    /// Peer prefix of the control channel behind a connection handle.
    pub fn peer_prefix_of(&self, handle: u32) -> Option<GuidPrefix> {
        let control = self.fsm.control_of(&self.cxs, handle)?;
        self.fsm.peer_prefix(control)
    }

    /// Take actions parked by calls outside the event loop.
    pub fn take_deferred(&mut self) -> Vec<TcpAction> {
        std::mem::take(&mut self.deferred)
    }

    // ========================================================================
    // Listener
    // ========================================================================

    /// Start the bridge server on an address.
    pub fn listen(&mut self, addr: SocketAddr) -> io::Result<()> {
        let mut listener = mio::net::TcpListener::bind(addr)?;
        let token = match &self.registrar {
            Some(r) => r.register(&mut listener, Interest::READABLE)?,
            None => Token(usize::MAX - self.listeners.len()),
        };
        log::info!("[TCP] bridge server on {}", addr);
        self.listeners.insert(token, listener);
        Ok(())
    }

    /// Accept every pending connection on a readable listener.
    pub fn on_accept(&mut self, token: Token, sink: &mut dyn TcpEvents) {
        loop {
            let accepted = match self.listeners.get_mut(&token) {
                Some(l) => l.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = self.adopt_accepted(stream, peer, sink) {
                        log::debug!("[TCP] accept setup failed: {}", e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    log::debug!("[TCP] accept: {}", e);
                    return;
                }
            }
        }
    }

    fn adopt_accepted(
        &mut self,
        mut stream: mio::net::TcpStream,
        peer: SocketAddr,
        sink: &mut dyn TcpEvents,
    ) -> io::Result<()> {
        let h = self.cxs.alloc();
        let token = match &self.registrar {
            Some(r) => r.register(&mut stream, Interest::READABLE)?,
            None => Token(usize::MAX / 2 - h as usize),
        };
        {
            let cx = self.cxs.get_mut(h).expect("just allocated");
            cx.cx_type = CxType::Tcp;
            cx.cx_state = CxState::Open;
            cx.fd = fd_of(&stream);
            cx.fd_owner = true;
            cx.dst_addr = addr_octets(peer.ip());
            cx.dst_port = u32::from(peer.port());
        }
        self.tokens.insert(token, h);
        self.cx_tokens.insert(h, token);
        self.streams.insert(h, Box::new(stream));
        self.readers.insert(h, TcpFrameReader::default());
        // Recognition window: a connection that says nothing is dropped.
        let id = sink.arm_timer(h, PENDING_TO);
        self.timers.insert(h, id);
        log::debug!("[TCP] accepted {} as cx {}", peer, h);
        Ok(())
    }

    // ========================================================================
    // Channel setup
    // ========================================================================

    /// Open a client control channel toward a bridge server.
    pub fn connect_control(
        &mut self,
        addr: SocketAddr,
        sink: &mut dyn TcpEvents,
    ) -> CxHandle {
        let h = self.cxs.alloc();
        if let Some(cx) = self.cxs.get_mut(h) {
            cx.cx_type = CxType::Tcp;
        }
        let actions = self.fsm.start_client_control(
            &mut self.cxs,
            h,
            addr_octets(addr.ip()),
            u32::from(addr.port()),
        );
        self.run_actions(actions, sink);
        h
    }

    /// Open a data channel for a logical port behind an existing control
    /// channel.
    pub fn open_port(
        &mut self,
        control: CxHandle,
        port: u32,
        options: u8,
        sink: &mut dyn TcpEvents,
    ) -> CxHandle {
        let (h, actions) = self.fsm.open_data_tx(&mut self.cxs, control, port, options);
        self.run_actions(actions, sink);
        h
    }

    // ========================================================================
    // Event dispatch
    // ========================================================================

    /// A channel timer fired.
    pub fn on_timeout(&mut self, h: CxHandle, sink: &mut dyn TcpEvents) {
        self.timers.remove(&h);
        if self.cxs.get(h).is_some_and(|c| c.mode == CxMode::Root) {
            // Recognition window expired on a silent accepted connection.
            log::debug!("[TCP] cx {}: no first message, dropping", h);
            self.teardown(h, sink);
            return;
        }
        let actions = self.fsm.on_timeout(&mut self.cxs, h);
        self.run_actions(actions, sink);
    }

    /// Readiness on a connection token.
    pub fn on_ready(
        &mut self,
        token: Token,
        readable: bool,
        writable: bool,
        sink: &mut dyn TcpEvents,
    ) {
        let Some(h) = self.tokens.get(&token).copied() else {
            return;
        };
        if writable {
            self.on_writable(h, sink);
        }
        if readable {
            self.on_readable(h, sink);
        }
    }

    fn on_writable(&mut self, h: CxHandle, sink: &mut dyn TcpEvents) {
        let state = match self.cxs.get(h) {
            Some(cx) => cx.cx_state,
            None => return,
        };
        if state == CxState::Connect {
            // Non-blocking connect resolution.
            let err = self
                .streams
                .get(&h)
                .and_then(|s| s.take_error().ok().flatten());
            let actions = match err {
                None => self.fsm.on_connected(&mut self.cxs, h),
                Some(e) => {
                    log::debug!("[TCP] cx {}: connect failed: {}", h, e);
                    self.drop_socket(h);
                    self.fsm.on_control_connect_failed(&mut self.cxs, h)
                }
            };
            self.run_actions(actions, sink);
            return;
        }
        self.flush(h, sink);
    }

    fn on_readable(&mut self, h: CxHandle, sink: &mut dyn TcpEvents) {
        let mut buf = vec![0u8; READ_BUF];
        loop {
            let Some(stream) = self.streams.get_mut(&h) else {
                return;
            };
            match stream.read(&mut buf) {
                Ok(0) => {
                    log::debug!("[TCP] cx {}: peer closed", h);
                    self.disconnect(h, sink);
                    return;
                }
                Ok(n) => {
                    if let Some(cx) = self.cxs.get_mut(h) {
                        cx.stats.octets_rcvd += n as u64;
                        cx.stats.packets_rcvd += 1;
                    }
                    if let Some(reader) = self.readers.get_mut(&h) {
                        reader.feed(&buf[..n]);
                    }
                    if !self.drain_frames(h, sink) {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if let Some(cx) = self.cxs.get_mut(h) {
                        cx.stats.read_err += 1;
                    }
                    log::debug!("[TCP] cx {}: read error: {}", h, e);
                    self.disconnect(h, sink);
                    return;
                }
            }
        }
        self.drain_frames(h, sink);
    }

    /// Process buffered frames; false when the connection died doing so.
    fn drain_frames(&mut self, h: CxHandle, sink: &mut dyn TcpEvents) -> bool {
        loop {
            let frame = match self.readers.get_mut(&h) {
                Some(reader) => reader.next_frame(),
                None => return false,
            };
            match frame {
                Ok(Some(TcpInbound::Ctrl(bytes))) => {
                    // First traffic on a pending connection cancels its
                    // recognition timer.
                    if let Some(id) = self.timers.remove(&h) {
                        sink.cancel_timer(id);
                    }
                    match parse_ctrl(&bytes) {
                        Ok(info) => {
                            let actions = self.fsm.on_ctrl(&mut self.cxs, h, &info);
                            self.run_actions(actions, sink);
                            if !self.streams.contains_key(&h) {
                                return false;
                            }
                        }
                        Err(e) => {
                            if let Some(cx) = self.cxs.get_mut(h) {
                                cx.stats.read_err += 1;
                            }
                            log::debug!("[TCP] cx {}: bad control frame: {}", h, e);
                            // A broken control frame on a non-open FSM is
                            // fatal for the connection.
                            let open = self
                                .cxs
                                .get(h)
                                .is_some_and(|c| c.p_state == ProtoState::Data
                                    || c.p_state == ProtoState::Control);
                            if !open {
                                self.disconnect(h, sink);
                                return false;
                            }
                        }
                    }
                }
                Ok(Some(TcpInbound::Rtps(bytes))) => {
                    // Data gating: frames before DATA are dropped.
                    let (deliver, rx_cx) = self.data_target(h);
                    if deliver {
                        let locator = self.cx_locator(rx_cx);
                        sink.deliver_rtps(DataBuf::new(bytes), &locator);
                    } else {
                        log::trace!("[TCP] cx {}: RTPS before DATA dropped", h);
                    }
                }
                Ok(None) => return true,
                Err(e) => {
                    if let Some(cx) = self.cxs.get_mut(h) {
                        cx.stats.read_err += 1;
                    }
                    log::debug!("[TCP] cx {}: framing error: {}", h, e);
                    self.disconnect(h, sink);
                    return false;
                }
            }
        }
    }

    /// Whether RTPS received on `h` may be delivered, and on behalf of
    /// which channel (the paired Rx side on shared fds).
    fn data_target(&self, h: CxHandle) -> (bool, CxHandle) {
        let Some(cx) = self.cxs.get(h) else {
            return (false, h);
        };
        if cx.p_state == ProtoState::Data {
            if cx.paired != 0 {
                let paired = cx.paired;
                if self
                    .cxs
                    .get(paired)
                    .is_some_and(|p| p.p_state == ProtoState::Data && p.mode == CxMode::Data)
                {
                    // Frames on a shared fd belong to the receive side.
                    if cx.mode == CxMode::Data {
                        return (true, paired);
                    }
                }
            }
            return (cx.mode == CxMode::Data, h);
        }
        (false, h)
    }

    fn cx_locator(&self, h: CxHandle) -> Locator {
        match self.cxs.get(h) {
            Some(cx) => {
                let kind = if cx.dst_addr[..12] == [0u8; 12][..] {
                    crate::locator::LOCATOR_KIND_TCPV4
                } else {
                    crate::locator::LOCATOR_KIND_TCPV6
                };
                let mut loc = Locator::new(kind, cx.dst_addr, cx.dst_port);
                loc.handle = h;
                loc
            }
            None => Locator::new(crate::locator::LOCATOR_KIND_TCPV4, [0; 16], 0),
        }
    }

    // ========================================================================
    // Write path
    // ========================================================================

    /// Queue an RTPS message on a data channel and try to flush.
    pub fn queue_message(&mut self, h: CxHandle, msg: SharedMessage, sink: &mut dyn TcpEvents) {
        if let Some(cx) = self.cxs.get_mut(h) {
            cx.enqueue(msg);
        }
        self.flush(h, sink);
    }

    /// Flush the one-shot control reply, the pending fragment, then queued
    /// messages, in that order.
    fn flush(&mut self, h: CxHandle, sink: &mut dyn TcpEvents) {
        // Writes travel over the fd owner on shared channels.
        let via = match self.cxs.get(h) {
            Some(cx) if cx.paired != 0 && !cx.fd_owner => cx.paired,
            Some(_) => h,
            None => return,
        };

        // One-shot CxBindSuccess ahead of data.
        if let Some(frame) = self.cxs.get_mut(via).and_then(|c| c.cxbs_queued.take()) {
            if !self.write_bytes(via, frame, true, sink) {
                return;
            }
        }
        // Pending fragment.
        if let Some((frame, done)) = self.frags.remove(&via) {
            if !self.write_bytes_from(via, frame, done, sink) {
                return;
            }
        }
        // Queued messages; the gate is the channel's own state.
        loop {
            let ready = self
                .cxs
                .get(h)
                .is_some_and(|c| c.p_state == ProtoState::Data);
            if !ready {
                break;
            }
            let Some(msg) = self.cxs.get_mut(h).and_then(|c| c.dequeue()) else {
                break;
            };
            let wire = encode_rtps_frame(&build_message(&msg));
            if !self.write_bytes(via, wire, false, sink) {
                return;
            }
        }
        self.update_interest(via, false);
    }

    /// Write a frame from offset 0.
    fn write_bytes(
        &mut self,
        h: CxHandle,
        frame: Vec<u8>,
        is_cxbs: bool,
        sink: &mut dyn TcpEvents,
    ) -> bool {
        self.write_bytes_inner(h, frame, 0, is_cxbs, sink)
    }

    fn write_bytes_from(
        &mut self,
        h: CxHandle,
        frame: Vec<u8>,
        done: usize,
        sink: &mut dyn TcpEvents,
    ) -> bool {
        self.write_bytes_inner(h, frame, done, false, sink)
    }

    /// Returns false when the caller must stop flushing (blocked or dead).
    fn write_bytes_inner(
        &mut self,
        h: CxHandle,
        frame: Vec<u8>,
        mut done: usize,
        is_cxbs: bool,
        sink: &mut dyn TcpEvents,
    ) -> bool {
        let Some(stream) = self.streams.get_mut(&h) else {
            return false;
        };
        while done < frame.len() {
            match stream.write(&frame[done..]) {
                Ok(0) => {
                    self.disconnect(h, sink);
                    return false;
                }
                Ok(n) => {
                    done += n;
                    if let Some(cx) = self.cxs.get_mut(h) {
                        cx.stats.octets_sent += n as u64;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if is_cxbs {
                        // Put the one-shot back; it still goes first.
                        if let Some(cx) = self.cxs.get_mut(h) {
                            cx.cxbs_queued = Some(frame[done..].to_vec());
                        }
                    } else {
                        self.frags.insert(h, (frame, done));
                    }
                    self.update_interest(h, true);
                    return false;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if let Some(cx) = self.cxs.get_mut(h) {
                        cx.stats.write_err += 1;
                    }
                    log::debug!("[TCP] cx {}: write error: {}", h, e);
                    self.disconnect(h, sink);
                    return false;
                }
            }
        }
        if let Some(cx) = self.cxs.get_mut(h) {
            cx.stats.packets_sent += 1;
        }
        true
    }

    fn update_interest(&mut self, h: CxHandle, want_write: bool) {
        let (Some(stream), Some(&token)) = (self.streams.get(&h), self.cx_tokens.get(&h)) else {
            return;
        };
        let Some(r) = &self.registrar else {
            return;
        };
        #[cfg(unix)]
        {
            use std::os::unix::io::RawFd;
            let fd: RawFd = stream.as_raw_fd();
            if fd >= 0 {
                let mut source = mio::unix::SourceFd(&fd);
                if let Some(i) = interest(true, want_write) {
                    let _ = r.reregister(&mut source, token, i);
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = (stream, token, r, want_write);
        }
    }

    // ========================================================================
    // Action execution
    // ========================================================================

    /// Execute FSM actions.
    pub fn run_actions(&mut self, actions: Vec<TcpAction>, sink: &mut dyn TcpEvents) {
        for action in actions {
            match action {
                TcpAction::SendCtrl { cx, frame } => {
                    let via = match self.cxs.get(cx) {
                        Some(c) if c.paired != 0 && !c.fd_owner => c.paired,
                        _ => cx,
                    };
                    self.write_bytes(via, frame, false, sink);
                }
                TcpAction::Connect { cx, addr, port } => {
                    if let Err(e) = self.start_connect(cx, addr, port) {
                        log::debug!("[TCP] cx {}: connect: {}", cx, e);
                        let actions = self.fsm.on_control_connect_failed(&mut self.cxs, cx);
                        self.run_actions(actions, sink);
                    }
                }
                TcpAction::StartTimer { cx, ticks } => {
                    if let Some(old) = self.timers.remove(&cx) {
                        sink.cancel_timer(old);
                    }
                    let id = sink.arm_timer(cx, ticks);
                    self.timers.insert(cx, id);
                }
                TcpAction::StopTimer { cx } => {
                    if let Some(id) = self.timers.remove(&cx) {
                        sink.cancel_timer(id);
                    }
                }
                TcpAction::Close { cx } => {
                    self.teardown(cx, sink);
                }
                TcpAction::Pair { owner, other } => {
                    self.cxs.pair(owner, other);
                }
                TcpAction::ChannelUp { cx } => {
                    self.flush(cx, sink);
                }
                TcpAction::ClearReplyLocators { handle } => {
                    sink.clear_reply_locators(handle);
                }
            }
        }
    }

    fn start_connect(&mut self, h: CxHandle, addr: [u8; 16], port: u32) -> io::Result<()> {
        let sa = octets_to_addr(addr, port);
        let mut stream = mio::net::TcpStream::connect(sa)?;
        let token = match &self.registrar {
            Some(r) => r.register(&mut stream, Interest::READABLE | Interest::WRITABLE)?,
            None => Token(usize::MAX / 2 - h as usize),
        };
        if let Some(cx) = self.cxs.get_mut(h) {
            cx.fd = fd_of(&stream);
            cx.fd_owner = true;
            cx.cx_state = CxState::Connect;
        }
        self.tokens.insert(token, h);
        self.cx_tokens.insert(h, token);
        self.streams.insert(h, Box::new(stream));
        self.readers.insert(h, TcpFrameReader::default());
        Ok(())
    }

    /// Hard disconnect: report to the FSM (cascade) and tear down.
    fn disconnect(&mut self, h: CxHandle, sink: &mut dyn TcpEvents) {
        let mode = self.cxs.get(h).map(|c| c.mode);
        let actions = match mode {
            Some(CxMode::Control) => self.fsm.control_down(&mut self.cxs, h),
            Some(CxMode::Data) => self.fsm.close_data_channel(&mut self.cxs, h),
            _ => vec![TcpAction::Close { cx: h }],
        };
        self.run_actions(actions, sink);
        // control_down keeps client records alive for reconnect; sockets
        // still must go.
        self.drop_socket(h);
    }

    fn drop_socket(&mut self, h: CxHandle) {
        if let Some(token) = self.cx_tokens.remove(&h) {
            self.tokens.remove(&token);
        }
        if let Some(mut stream) = self.streams.remove(&h) {
            let owns = self.cxs.get(h).map_or(true, |c| c.fd_owner);
            if owns {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
        }
        self.readers.remove(&h);
        self.frags.remove(&h);
        if let Some(cx) = self.cxs.get_mut(h) {
            cx.fd = 0;
        }
    }

    /// Full teardown of a channel record.
    fn teardown(&mut self, h: CxHandle, sink: &mut dyn TcpEvents) {
        if let Some(id) = self.timers.remove(&h) {
            sink.cancel_timer(id);
        }
        // A client control record in WRetry survives for its reconnect
        // timer; everything else is freed.
        let keep = self
            .cxs
            .get(h)
            .is_some_and(|c| c.mode == CxMode::Control && c.cx_state == CxState::WRetry);
        self.drop_socket(h);
        if !keep {
            self.cxs.free(h);
        }
    }
}

impl Transport for TcpTransport {
    fn kinds(&self) -> LocatorKind {
        LOCATOR_KINDS_TCP
    }

    fn send(&mut self, dest: &Locator, msgs: &[SharedMessage]) -> io::Result<()> {
        if self.params.suspended || !self.params.enabled {
            return Ok(());
        }
        // A handled locator names its channel directly.
        let h = if dest.handle != 0 {
            Some(dest.handle)
        } else {
            self.cxs.find_by_dest(&dest.address, dest.port)
        };
        let Some(h) = h else {
            log::debug!("[TCP] no channel for {}", dest);
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no bridge channel for destination",
            ));
        };
        for msg in msgs {
            if let Some(cx) = self.cxs.get_mut(h) {
                cx.enqueue(msg.clone());
            }
        }
        // Flushing needs the event sink; defer to the next loop turn.
        self.deferred.push(TcpAction::ChannelUp { cx: h });
        Ok(())
    }

    fn add_locator(
        &mut self,
        _domain_id: u32,
        loc: &Locator,
        _id: u32,
        serve: bool,
    ) -> io::Result<()> {
        if !serve {
            return Ok(());
        }
        let Some(sa) = loc.to_socket_addr() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "locator is not addressable",
            ));
        };
        self.listen(sa)
    }

    fn remove_locator(&mut self, _id: u32, loc: &Locator) {
        let Some(sa) = loc.to_socket_addr() else {
            return;
        };
        let stale: Vec<Token> = self
            .listeners
            .iter()
            .filter(|(_, l)| l.local_addr().map(|a| a == sa).unwrap_or(false))
            .map(|(t, _)| *t)
            .collect();
        for token in stale {
            if let Some(mut l) = self.listeners.remove(&token) {
                if let Some(r) = &self.registrar {
                    let _ = r.deregister(&mut l);
                }
            }
        }
    }

    fn set_params(&mut self, params: &TransportParams) {
        self.params = params.clone();
    }

    fn params(&self) -> TransportParams {
        self.params.clone()
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("connections", &self.streams.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

fn addr_octets(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => {
            let mut a = [0u8; 16];
            a[12..16].copy_from_slice(&v4.octets());
            a
        }
        IpAddr::V6(v6) => v6.octets(),
    }
}

fn octets_to_addr(addr: [u8; 16], port: u32) -> SocketAddr {
    if addr[..12] == [0u8; 12][..] {
        let mut o = [0u8; 4];
        o.copy_from_slice(&addr[12..16]);
        SocketAddr::new(IpAddr::V4(o.into()), port as u16)
    } else {
        SocketAddr::new(IpAddr::V6(addr.into()), port as u16)
    }
}

#[cfg(unix)]
fn fd_of(stream: &mio::net::TcpStream) -> i32 {
    use std::os::unix::io::AsRawFd;
    stream.as_raw_fd()
}

#[cfg(not(unix))]
fn fd_of(_stream: &mio::net::TcpStream) -> i32 {
    0
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct NullSink {
        timers: u64,
        cleared: Vec<u32>,
        delivered: Vec<Vec<u8>>,
    }

    impl TcpEvents for NullSink {
        fn arm_timer(&mut self, _cx: CxHandle, _ticks: u64) -> TimerId {
            self.timers += 1;
            self.timers
        }

        fn cancel_timer(&mut self, _id: TimerId) {}

        fn clear_reply_locators(&mut self, handle: u32) {
            self.cleared.push(handle);
        }

        fn deliver_rtps(&mut self, data: DataBuf, _src: &Locator) {
            self.delivered.push(data.as_slice().to_vec());
        }
    }

    #[test]
    fn test_send_without_channel_fails() {
        let mut t = TcpTransport::new(BridgeConfig::default(), None);
        let loc = Locator::new(crate::locator::LOCATOR_KIND_TCPV4, [1; 16], 7500);
        let msg = SharedMessage::new(crate::message::Message::with_source(
            GuidPrefix::UNKNOWN,
        ));
        assert!(t.send(&loc, &[msg]).is_err());
    }

    #[test]
    fn test_send_on_handled_locator_queues_and_defers() {
        let mut t = TcpTransport::new(BridgeConfig::default(), None);
        let h = t.cxs.alloc();
        t.cxs.get_mut(h).unwrap().p_state = ProtoState::Data;

        let mut loc = Locator::new(crate::locator::LOCATOR_KIND_TCPV4, [1; 16], 7500);
        loc.handle = h;
        let msg = SharedMessage::new(crate::message::Message::with_source(
            GuidPrefix::UNKNOWN,
        ));
        t.send(&loc, &[msg]).unwrap();

        assert_eq!(t.cxs.get(h).unwrap().send_queue.len(), 1);
        let deferred = t.take_deferred();
        assert_eq!(deferred, vec![TcpAction::ChannelUp { cx: h }]);
        assert!(t.take_deferred().is_empty());
    }

    #[test]
    fn test_data_gating_before_data_state() {
        let t = TcpTransport::new(BridgeConfig::default(), None);
        let mut t = t;
        let h = t.cxs.alloc();
        t.cxs.get_mut(h).unwrap().mode = CxMode::Data;
        t.cxs.get_mut(h).unwrap().p_state = ProtoState::WCBindOk;

        let (deliver, _) = t.data_target(h);
        assert!(!deliver);

        t.cxs.get_mut(h).unwrap().p_state = ProtoState::Data;
        let (deliver, target) = t.data_target(h);
        assert!(deliver);
        assert_eq!(target, h);
    }

    #[test]
    fn test_data_target_shared_fd_routes_to_rx() {
        let mut t = TcpTransport::new(BridgeConfig::default(), None);
        let tx = t.cxs.alloc();
        let rx = t.cxs.alloc();
        for (h, _side) in [(tx, 0), (rx, 1)] {
            let cx = t.cxs.get_mut(h).unwrap();
            cx.mode = CxMode::Data;
            cx.p_state = ProtoState::Data;
        }
        t.cxs.get_mut(tx).unwrap().fd = 9;
        t.cxs.get_mut(tx).unwrap().fd_owner = true;
        t.cxs.pair(tx, rx);

        // Bytes arriving on the fd owner belong to the paired Rx side.
        let (deliver, target) = t.data_target(tx);
        assert!(deliver);
        assert_eq!(target, rx);
    }

    #[test]
    fn test_clear_reply_locators_on_control_down() {
        let mut t = TcpTransport::new(BridgeConfig::default(), None);
        let mut sink = NullSink::default();
        let h = t.cxs.alloc();
        {
            let cx = t.cxs.get_mut(h).unwrap();
            cx.mode = CxMode::Control;
            cx.cx_type = CxType::Tcp;
        }
        let actions = t.fsm.control_down(&mut t.cxs, h);
        t.run_actions(actions, &mut sink);
        assert_eq!(sink.cleared, vec![h]);
    }
}
