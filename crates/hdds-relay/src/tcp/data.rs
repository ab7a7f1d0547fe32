// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Data-channel state machines.
//!
//! A Tx channel binds an outbound RTPS logical port on the peer:
//! `IDLE -> WCONTROL -> WPORTOK -> WCXOK -> WCBINDOK -> DATA`. The cookie
//! minted by the server in `ServerLogicalPortSuccess` is echoed by the
//! client in `ConnectionBindRequest` on the data connection so the server
//! can associate the socket with the negotiated binding.
//!
//! When both sides advertise `SHARE`, a Tx/Rx pair travels over one fd:
//! the bind request is sent on the existing reverse connection instead of
//! opening a new one, and the pair is linked with a single fd owner.
//!
//! The Rx side is the symmetric counterpart, driven either by an inbound
//! `ConnectionBindRequest` (we are server) or by a `ClientLogicalPortRequest`
//! asking us to open the reverse channel (we are client).

use crate::cx::{CxHandle, CxMode, CxSide, CxState, CxTable, ProtoState};
use crate::tcp::rpsc::{
    CtrlBuilder, CtrlInfo, CtrlMsgKind, CAID_LOC_PORT, CERR_ALLOC_MISMATCH, CERR_BAD_REQUEST,
    PO_SHARE,
};
use crate::tcp::{
    BridgeFsm, DataState, PendingBinding, TcpAction, CLPREQ_RETRIES, CLPREQ_TO, CXBREQ_RETRIES,
    CXBREQ_TO, DATA_CONNECT_TO, SLPREQ_RETRIES, SLPREQ_TO,
};

impl BridgeFsm {
    /// Open a Tx data channel toward the peer behind `control`.
    ///
    /// Returns the new channel handle; the request is deferred until the
    /// control channel is up.
    pub fn open_data_tx(
        &mut self,
        cxs: &mut CxTable,
        control: CxHandle,
        port: u32,
        options: u8,
    ) -> (CxHandle, Vec<TcpAction>) {
        let h = cxs.alloc();
        let (dst_addr, dst_port, ctype) = match cxs.get(control) {
            Some(c) => (c.dst_addr, c.dst_port, c.cx_type),
            None => ([0; 16], 0, crate::cx::CxType::Tcp),
        };
        {
            let cx = cxs.get_mut(h).expect("just allocated");
            cx.mode = CxMode::Data;
            cx.side = CxSide::Client;
            cx.cx_type = ctype;
            cx.dst_addr = dst_addr;
            cx.dst_port = dst_port;
            cx.p_state = ProtoState::WControl;
        }
        cxs.attach_child(control, h);
        self.data_state.insert(h, DataState {
            port,
            options,
            cookie: None,
        });

        let ready = cxs.get(control).is_some_and(|c| c.p_state == ProtoState::Control);
        let actions = if ready {
            self.request_server_port(cxs, h)
        } else {
            Vec::new()
        };
        (h, actions)
    }

    /// The control channel reached CONTROL: release children parked in
    /// WCONTROL.
    pub fn on_control_ready(&mut self, cxs: &mut CxTable, control: CxHandle) -> Vec<TcpAction> {
        let waiting: Vec<CxHandle> = cxs
            .get(control)
            .map(|c| c.children.clone())
            .unwrap_or_default()
            .into_iter()
            .filter(|&ch| {
                cxs.get(ch)
                    .is_some_and(|c| c.p_state == ProtoState::WControl)
            })
            .collect();
        let mut actions = Vec::new();
        for ch in waiting {
            actions.extend(self.request_server_port(cxs, ch));
        }
        actions
    }

    /// Send (or resend) the ServerLogicalPortRequest for a Tx channel.
    fn request_server_port(&mut self, cxs: &mut CxTable, h: CxHandle) -> Vec<TcpAction> {
        let Some(control) = self.control_of(cxs, h) else {
            return Vec::new();
        };
        let Some(state) = self.data_state.get(&h).cloned() else {
            return Vec::new();
        };
        let transaction = self.transaction();
        self.pending_requests.insert(transaction, h);

        let mut options = state.options;
        if self.cfg.share {
            options |= PO_SHARE;
        }
        let mut b = CtrlBuilder::new(CtrlMsgKind::SLPortRequest, &transaction);
        b.logical_port(state.port).port_options(options);

        if let Some(cx) = cxs.get_mut(h) {
            cx.p_state = ProtoState::WPortOk;
            cx.retries = SLPREQ_RETRIES;
        }
        log::debug!("[TCP] CDT {}: ServerLogicalPortRequest port {}", h, state.port);
        vec![
            TcpAction::SendCtrl {
                cx: control,
                frame: b.finish(),
            },
            TcpAction::StartTimer {
                cx: h,
                ticks: SLPREQ_TO,
            },
        ]
    }

    /// Server replied to our logical-port request.
    pub(crate) fn on_slport_reply(
        &mut self,
        cxs: &mut CxTable,
        _ctrl: CxHandle,
        info: &CtrlInfo,
    ) -> Vec<TcpAction> {
        let Some(h) = self.pending_requests.remove(&info.transaction) else {
            return Vec::new();
        };
        if info.kind == Some(CtrlMsgKind::SLPortFail) {
            log::debug!("[TCP] CDT {}: port refused ({})", h, info.error_kind);
            return self.close_data_channel(cxs, h);
        }
        let Some(cookie) = info.cookie.clone() else {
            return self.close_data_channel(cxs, h);
        };
        if let Some(state) = self.data_state.get_mut(&h) {
            state.cookie = Some(cookie.clone());
        }

        let mut actions = vec![TcpAction::StopTimer { cx: h }];
        let shared = info.shared && self.cfg.share;
        if shared {
            if let Some(rx) = self.reverse_channel(cxs, h) {
                // Reuse the reverse fd: no new connection.
                actions.push(TcpAction::Pair { owner: rx, other: h });
                actions.extend(self.send_cx_bind(cxs, h, h, &cookie));
                return actions;
            }
        }

        // Dedicated data connection to the peer's server port.
        let (addr, port) = match cxs.get(h) {
            Some(cx) => (cx.dst_addr, cx.dst_port),
            None => return actions,
        };
        if let Some(cx) = cxs.get_mut(h) {
            cx.p_state = ProtoState::WCxOk;
            cx.cx_state = CxState::Connect;
        }
        actions.push(TcpAction::Connect { cx: h, addr, port });
        actions.push(TcpAction::StartTimer {
            cx: h,
            ticks: DATA_CONNECT_TO,
        });
        actions
    }

    /// The dedicated data connection is up: bind it to the cookie.
    pub fn on_data_connected(&mut self, cxs: &mut CxTable, h: CxHandle) -> Vec<TcpAction> {
        if cxs.get(h).map(|c| c.p_state) != Some(ProtoState::WCxOk) {
            return Vec::new();
        }
        if let Some(cx) = cxs.get_mut(h) {
            cx.cx_state = CxState::Open;
        }
        let Some(cookie) = self
            .data_state
            .get(&h)
            .and_then(|s| s.cookie.clone())
        else {
            return self.close_data_channel(cxs, h);
        };
        self.send_cx_bind(cxs, h, h, &cookie)
    }

    /// Emit a ConnectionBindRequest for channel `h` on connection `via`.
    fn send_cx_bind(
        &mut self,
        cxs: &mut CxTable,
        h: CxHandle,
        via: CxHandle,
        cookie: &[u8],
    ) -> Vec<TcpAction> {
        let transaction = self.transaction();
        self.pending_requests.insert(transaction, h);
        let mut b = CtrlBuilder::new(CtrlMsgKind::CxBindRequest, &transaction);
        b.cookie(cookie);
        if let Some(cx) = cxs.get_mut(h) {
            cx.p_state = ProtoState::WCBindOk;
            cx.retries = CXBREQ_RETRIES;
        }
        vec![
            TcpAction::SendCtrl {
                cx: via,
                frame: b.finish(),
            },
            TcpAction::StartTimer {
                cx: h,
                ticks: CXBREQ_TO,
            },
        ]
    }

    /// The server bound our data connection: the channel is live.
    pub(crate) fn on_cxbind_success(
        &mut self,
        cxs: &mut CxTable,
        h: CxHandle,
        info: &CtrlInfo,
    ) -> Vec<TcpAction> {
        let target = self.pending_requests.remove(&info.transaction).unwrap_or(h);
        let Some(cx) = cxs.get_mut(target) else {
            return Vec::new();
        };
        if cx.p_state != ProtoState::WCBindOk {
            return Vec::new();
        }
        cx.p_state = ProtoState::Data;
        cx.cx_state = CxState::Open;
        log::debug!("[TCP] CDT {}: data channel up", target);
        vec![
            TcpAction::StopTimer { cx: target },
            TcpAction::ChannelUp { cx: target },
        ]
    }

    // ========================================================================
    // Server side
    // ========================================================================

    /// A client asked us to open a logical port (we are server).
    pub(crate) fn on_slport_request(
        &mut self,
        cxs: &mut CxTable,
        control: CxHandle,
        info: &CtrlInfo,
    ) -> Vec<TcpAction> {
        if !info.has(CAID_LOC_PORT) {
            let mut b = CtrlBuilder::new(CtrlMsgKind::SLPortFail, &info.transaction);
            b.error(CERR_BAD_REQUEST);
            return vec![TcpAction::SendCtrl {
                cx: control,
                frame: b.finish(),
            }];
        }

        // The Rx record that will carry inbound RTPS once bound.
        let rx = cxs.alloc();
        {
            let cx = cxs.get_mut(rx).expect("just allocated");
            cx.mode = CxMode::Data;
            cx.side = CxSide::Server;
            cx.p_state = ProtoState::WCxOk;
        }
        cxs.attach_child(control, rx);
        self.data_state.insert(rx, DataState {
            port: info.port,
            options: info.port_options,
            cookie: None,
        });

        let shared = (info.port_options & PO_SHARE) != 0 && self.cfg.share;
        let cookie = self.mint_cookie();
        if let Some(state) = self.data_state.get_mut(&rx) {
            state.cookie = Some(cookie.clone());
        }
        self.register_binding(
            cookie.clone(),
            PendingBinding {
                port: info.port,
                options: info.port_options,
                control,
                rx_cx: rx,
                shared,
            },
        );

        let mut b = CtrlBuilder::new(CtrlMsgKind::SLPortSuccess, &info.transaction);
        b.cookie(&cookie)
            .allow_shared(shared)
            .guid_prefix(&self.cfg.own_prefix);
        log::debug!(
            "[TCP] CDR {}: logical port {} granted (shared={})",
            rx,
            info.port,
            shared
        );
        vec![TcpAction::SendCtrl {
            cx: control,
            frame: b.finish(),
        }]
    }

    /// A ConnectionBindRequest arrived on connection `h`.
    ///
    /// `h` is either a freshly accepted data connection or, when sharing,
    /// an already-open channel whose fd the peer reuses.
    pub(crate) fn on_cxbind_request(
        &mut self,
        cxs: &mut CxTable,
        h: CxHandle,
        info: &CtrlInfo,
    ) -> Vec<TcpAction> {
        let Some(cookie) = info.cookie.as_deref() else {
            let mut b = CtrlBuilder::new(CtrlMsgKind::CxBindFail, &info.transaction);
            b.error(CERR_BAD_REQUEST);
            return vec![
                TcpAction::SendCtrl {
                    cx: h,
                    frame: b.finish(),
                },
                TcpAction::Close { cx: h },
            ];
        };
        let Some(binding) = self.take_binding(cookie) else {
            let mut b = CtrlBuilder::new(CtrlMsgKind::CxBindFail, &info.transaction);
            b.error(CERR_ALLOC_MISMATCH);
            return vec![
                TcpAction::SendCtrl {
                    cx: h,
                    frame: b.finish(),
                },
                TcpAction::Close { cx: h },
            ];
        };

        let reply = CtrlBuilder::new(CtrlMsgKind::CxBindSuccess, &info.transaction).finish();
        let mut actions = Vec::new();

        let reused = h != binding.rx_cx && cxs.get(h).is_some_and(|c| c.p_state == ProtoState::Data);
        if binding.shared && reused {
            // The peer reuses an established channel's fd: the Rx record
            // pairs with it.
            if let Some(cx) = cxs.get_mut(binding.rx_cx) {
                cx.p_state = ProtoState::Data;
                cx.cx_state = CxState::Open;
            }
            actions.push(TcpAction::Pair {
                owner: h,
                other: binding.rx_cx,
            });
            actions.push(TcpAction::SendCtrl { cx: h, frame: reply });
            actions.push(TcpAction::ChannelUp { cx: binding.rx_cx });
            return actions;
        }

        // Dedicated connection: the accepted socket becomes the channel and
        // the placeholder is dropped.
        let (port, options) = (binding.port, binding.options);
        if let Some(cx) = cxs.get_mut(h) {
            cx.mode = CxMode::Data;
            cx.side = CxSide::Server;
            cx.p_state = ProtoState::Data;
            cx.cx_state = CxState::Open;
        }
        cxs.attach_child(binding.control, h);
        self.data_state.insert(h, DataState {
            port,
            options,
            cookie: Some(cookie.to_vec()),
        });
        if binding.rx_cx != h {
            self.data_state.remove(&binding.rx_cx);
            actions.push(TcpAction::Close { cx: binding.rx_cx });
        }
        actions.push(TcpAction::SendCtrl { cx: h, frame: reply });
        actions.push(TcpAction::ChannelUp { cx: h });
        log::debug!("[TCP] CDR {}: bound to logical port {}", h, port);
        actions
    }

    // ========================================================================
    // Reverse channels (ClientLogicalPort)
    // ========================================================================

    /// Ask the client behind `control` to open a reverse data channel
    /// toward us (we are server and cannot connect through its NAT).
    pub fn request_client_port(
        &mut self,
        cxs: &mut CxTable,
        control: CxHandle,
        port: u32,
        options: u8,
    ) -> (CxHandle, Vec<TcpAction>) {
        let rx = cxs.alloc();
        {
            let cx = cxs.get_mut(rx).expect("just allocated");
            cx.mode = CxMode::Data;
            cx.side = CxSide::Server;
            cx.p_state = ProtoState::WCxOk;
            cx.retries = CLPREQ_RETRIES;
        }
        cxs.attach_child(control, rx);
        let shared = self.cfg.share;
        let cookie = self.mint_cookie();
        self.data_state.insert(rx, DataState {
            port,
            options,
            cookie: Some(cookie.clone()),
        });
        self.register_binding(
            cookie.clone(),
            PendingBinding {
                port,
                options,
                control,
                rx_cx: rx,
                shared,
            },
        );

        let transaction = self.transaction();
        self.pending_requests.insert(transaction, rx);
        let mut b = CtrlBuilder::new(CtrlMsgKind::CLPortRequest, &transaction);
        let mut opts = options;
        if shared {
            opts |= PO_SHARE;
        }
        b.logical_port(port).cookie(&cookie).port_options(opts);
        (
            rx,
            vec![
                TcpAction::SendCtrl {
                    cx: control,
                    frame: b.finish(),
                },
                TcpAction::StartTimer {
                    cx: rx,
                    ticks: CLPREQ_TO,
                },
            ],
        )
    }

    /// The server asked us (client) to open a reverse data channel.
    pub(crate) fn on_clport_request(
        &mut self,
        cxs: &mut CxTable,
        control: CxHandle,
        info: &CtrlInfo,
    ) -> Vec<TcpAction> {
        let Some(cookie) = info.cookie.clone() else {
            let mut b = CtrlBuilder::new(CtrlMsgKind::CLPortFail, &info.transaction);
            b.error(CERR_BAD_REQUEST);
            return vec![TcpAction::SendCtrl {
                cx: control,
                frame: b.finish(),
            }];
        };
        let shared = (info.port_options & PO_SHARE) != 0 && self.cfg.share;

        let mut b = CtrlBuilder::new(CtrlMsgKind::CLPortSuccess, &info.transaction);
        b.allow_shared(shared).guid_prefix(&self.cfg.own_prefix);
        let mut actions = vec![TcpAction::SendCtrl {
            cx: control,
            frame: b.finish(),
        }];

        // The reverse channel we open toward the server.
        let h = cxs.alloc();
        let (dst_addr, dst_port, ctype) = match cxs.get(control) {
            Some(c) => (c.dst_addr, c.dst_port, c.cx_type),
            None => ([0; 16], 0, crate::cx::CxType::Tcp),
        };
        {
            let cx = cxs.get_mut(h).expect("just allocated");
            cx.mode = CxMode::Data;
            cx.side = CxSide::Client;
            cx.cx_type = ctype;
            cx.dst_addr = dst_addr;
            cx.dst_port = dst_port;
        }
        cxs.attach_child(control, h);
        self.data_state.insert(h, DataState {
            port: info.port,
            options: info.port_options,
            cookie: Some(cookie.clone()),
        });

        if shared {
            if let Some(tx) = self.reverse_channel(cxs, h) {
                actions.push(TcpAction::Pair { owner: tx, other: h });
                actions.extend(self.send_cx_bind(cxs, h, tx, &cookie));
                return actions;
            }
        }
        if let Some(cx) = cxs.get_mut(h) {
            cx.p_state = ProtoState::WCxOk;
            cx.cx_state = CxState::Connect;
        }
        actions.push(TcpAction::Connect {
            cx: h,
            addr: dst_addr,
            port: dst_port,
        });
        actions.push(TcpAction::StartTimer {
            cx: h,
            ticks: DATA_CONNECT_TO,
        });
        actions
    }

    // ========================================================================
    // Timeouts and teardown
    // ========================================================================

    /// Data-channel timer fired.
    pub fn on_data_timeout(&mut self, cxs: &mut CxTable, h: CxHandle) -> Vec<TcpAction> {
        let (p_state, retries, pending) = match cxs.get(h) {
            Some(cx) => (cx.p_state, cx.retries, !cx.send_queue.is_empty()),
            None => return Vec::new(),
        };
        match p_state {
            ProtoState::WPortOk => {
                if retries > 0 {
                    // Resend with a decremented budget; request_server_port
                    // resets it to the full allotment.
                    let actions = self.request_server_port(cxs, h);
                    if let Some(cx) = cxs.get_mut(h) {
                        cx.retries = retries - 1;
                    }
                    actions
                } else {
                    self.data_exhausted(cxs, h, pending)
                }
            }
            ProtoState::WCxOk => self.data_exhausted(cxs, h, pending),
            ProtoState::WCBindOk => {
                if retries > 0 {
                    let cookie = self
                        .data_state
                        .get(&h)
                        .and_then(|s| s.cookie.clone())
                        .unwrap_or_default();
                    let paired = cxs.get(h).map_or(0, |c| c.paired);
                    let via = if paired != 0 { paired } else { h };
                    let actions = self.send_cx_bind(cxs, h, via, &cookie);
                    if let Some(cx) = cxs.get_mut(h) {
                        cx.retries = retries - 1;
                    }
                    actions
                } else {
                    self.data_exhausted(cxs, h, pending)
                }
            }
            _ => Vec::new(),
        }
    }

    /// Retry budget exhausted: Finalize-then-close without pending
    /// outbound, reconnect with.
    fn data_exhausted(&mut self, cxs: &mut CxTable, h: CxHandle, pending: bool) -> Vec<TcpAction> {
        if pending {
            log::debug!("[TCP] CDT {}: retries exhausted, reconnecting", h);
            if let Some(cx) = cxs.get_mut(h) {
                cx.p_state = ProtoState::WControl;
                cx.cx_state = CxState::Closed;
            }
            if let Some(state) = self.data_state.get_mut(&h) {
                state.cookie = None;
            }
            let ready = self
                .control_of(cxs, h)
                .and_then(|c| cxs.get(c))
                .is_some_and(|c| c.p_state == ProtoState::Control);
            if ready {
                return self.request_server_port(cxs, h);
            }
            return Vec::new();
        }
        log::debug!("[TCP] CDT {}: retries exhausted, finalizing", h);
        let mut actions = vec![TcpAction::SendCtrl {
            cx: h,
            frame: CtrlBuilder::new(CtrlMsgKind::Finalize, &self.transaction()).finish(),
        }];
        actions.extend(self.close_data_channel(cxs, h));
        actions
    }

    /// Tear one data channel down.
    pub fn close_data_channel(&mut self, cxs: &mut CxTable, h: CxHandle) -> Vec<TcpAction> {
        self.data_state.remove(&h);
        self.bindings.retain(|_, b| b.rx_cx != h);
        if cxs.get(h).is_none() {
            return Vec::new();
        }
        vec![TcpAction::StopTimer { cx: h }, TcpAction::Close { cx: h }]
    }

    /// Find the established opposite-direction data channel under the same
    /// control channel, if any (for fd sharing).
    fn reverse_channel(&self, cxs: &CxTable, h: CxHandle) -> Option<CxHandle> {
        let control = self.control_of(cxs, h)?;
        let my_side = cxs.get(h)?.side;
        cxs.get(control)?
            .children
            .iter()
            .copied()
            .find(|&ch| {
                ch != h
                    && cxs.get(ch).is_some_and(|c| {
                        c.mode == CxMode::Data
                            && c.p_state == ProtoState::Data
                            && c.side != my_side
                            && c.paired == 0
                            && c.fd != 0
                    })
            })
    }
}
