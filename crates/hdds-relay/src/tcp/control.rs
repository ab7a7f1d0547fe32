// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control-channel state machine.
//!
//! The client walks `IDLE -> WCXOK -> WIBINDOK -> CONTROL`; the server
//! promotes an accepted connection to CONTROL on a valid
//! IdentityBindRequest. Once a control channel is down, every data child
//! is torn down first, learned reply locators are dropped, and the client
//! re-enters a randomised reconnect.

use crate::cx::{CxHandle, CxMode, CxSide, CxState, CxTable, ProtoState};
use crate::tcp::rpsc::{
    CtrlBuilder, CtrlInfo, CtrlMsgKind, CAID_GUID_PREFIX, CERR_BAD_REQUEST, CERR_UNSUPP_TRANSPORT,
};
use crate::tcp::{
    reconnect_delay, BridgeFsm, TcpAction, CCWAIT_TO, IDBREQ_RETRIES, IDBREQ_TO,
};

impl BridgeFsm {
    /// Start a client control channel toward a bridge server.
    pub fn start_client_control(
        &mut self,
        cxs: &mut CxTable,
        h: CxHandle,
        addr: [u8; 16],
        port: u32,
    ) -> Vec<TcpAction> {
        let Some(cx) = cxs.get_mut(h) else {
            return Vec::new();
        };
        cx.mode = CxMode::Control;
        cx.side = CxSide::Client;
        cx.cx_state = CxState::Connect;
        cx.p_state = ProtoState::WCxOk;
        cx.dst_addr = addr;
        cx.dst_port = port;
        log::debug!("[TCP] CC {}: connect to port {}", h, port);
        vec![
            TcpAction::Connect { cx: h, addr, port },
            TcpAction::StartTimer {
                cx: h,
                ticks: CCWAIT_TO,
            },
        ]
    }

    /// The control channel's TCP connect completed.
    pub fn on_control_connected(&mut self, cxs: &mut CxTable, h: CxHandle) -> Vec<TcpAction> {
        let transaction = self.transaction();
        let Some(cx) = cxs.get_mut(h) else {
            return Vec::new();
        };
        if cx.p_state != ProtoState::WCxOk {
            return Vec::new();
        }
        cx.cx_state = CxState::Open;
        cx.p_state = ProtoState::WIBindOk;
        cx.retries = IDBREQ_RETRIES;

        let mut b = CtrlBuilder::new(CtrlMsgKind::IdBindRequest, &transaction);
        b.locator(&self.cfg.public_addr)
            .forward(u32::from(self.cfg.forward))
            .guid_prefix(&self.cfg.own_prefix);
        self.pending_requests.insert(transaction, h);
        log::debug!("[TCP] CC {}: IdentityBindRequest", h);
        vec![
            TcpAction::SendCtrl {
                cx: h,
                frame: b.finish(),
            },
            TcpAction::StartTimer {
                cx: h,
                ticks: IDBREQ_TO,
            },
        ]
    }

    /// The control channel's TCP connect failed.
    pub fn on_control_connect_failed(&mut self, cxs: &mut CxTable, h: CxHandle) -> Vec<TcpAction> {
        self.schedule_reconnect(cxs, h)
    }

    /// Re-enter the randomised reconnect path (client only).
    pub(crate) fn schedule_reconnect(&mut self, cxs: &mut CxTable, h: CxHandle) -> Vec<TcpAction> {
        let Some(cx) = cxs.get_mut(h) else {
            return Vec::new();
        };
        if cx.side != CxSide::Client {
            return vec![TcpAction::Close { cx: h }];
        }
        cx.cx_state = CxState::WRetry;
        cx.p_state = ProtoState::Idle;
        let delay = reconnect_delay();
        log::debug!("[TCP] CC {}: reconnect in {} ticks", h, delay);
        vec![TcpAction::StartTimer { cx: h, ticks: delay }]
    }

    /// Control-channel timer fired; dispatch on the protocol state.
    pub fn on_control_timeout(&mut self, cxs: &mut CxTable, h: CxHandle) -> Vec<TcpAction> {
        let (p_state, retries) = match cxs.get(h) {
            Some(cx) => (cx.p_state, cx.retries),
            None => return Vec::new(),
        };
        match p_state {
            ProtoState::WCxOk => {
                // Connect took too long.
                let mut actions = vec![TcpAction::Close { cx: h }];
                actions.extend(self.schedule_reconnect(cxs, h));
                actions
            }
            ProtoState::WIBindOk => {
                if retries > 0 {
                    if let Some(cx) = cxs.get_mut(h) {
                        cx.retries -= 1;
                    }
                    let transaction = self.transaction();
                    let mut b = CtrlBuilder::new(CtrlMsgKind::IdBindRequest, &transaction);
                    b.locator(&self.cfg.public_addr)
                        .forward(u32::from(self.cfg.forward))
                        .guid_prefix(&self.cfg.own_prefix);
                    self.pending_requests.insert(transaction, h);
                    vec![
                        TcpAction::SendCtrl {
                            cx: h,
                            frame: b.finish(),
                        },
                        TcpAction::StartTimer {
                            cx: h,
                            ticks: IDBREQ_TO,
                        },
                    ]
                } else {
                    // Retries exhausted: best-effort Finalize, then down.
                    let mut actions = vec![TcpAction::SendCtrl {
                        cx: h,
                        frame: CtrlBuilder::new(CtrlMsgKind::Finalize, &self.transaction())
                            .finish(),
                    }];
                    actions.extend(self.control_down(cxs, h));
                    actions
                }
            }
            ProtoState::Idle => {
                // Reconnect timer: start over.
                let (addr, port) = match cxs.get(h) {
                    Some(cx) => (cx.dst_addr, cx.dst_port),
                    None => return Vec::new(),
                };
                self.start_client_control(cxs, h, addr, port)
            }
            _ => Vec::new(),
        }
    }

    /// A control message arrived on an established channel.
    pub fn on_ctrl(&mut self, cxs: &mut CxTable, h: CxHandle, info: &CtrlInfo) -> Vec<TcpAction> {
        let Some(kind) = info.kind else {
            return Vec::new();
        };
        match kind {
            CtrlMsgKind::IdBindRequest => self.on_idbind_request(cxs, h, info),
            CtrlMsgKind::IdBindSuccess => self.on_idbind_success(cxs, h, info),
            CtrlMsgKind::IdBindFail => {
                log::debug!("[TCP] CC {}: IdentityBind failed ({})", h, info.error_kind);
                self.control_down(cxs, h)
            }
            CtrlMsgKind::SLPortRequest => self.on_slport_request(cxs, h, info),
            CtrlMsgKind::SLPortSuccess | CtrlMsgKind::SLPortFail => {
                self.on_slport_reply(cxs, h, info)
            }
            CtrlMsgKind::CLPortRequest => self.on_clport_request(cxs, h, info),
            CtrlMsgKind::CLPortSuccess | CtrlMsgKind::CLPortFail => {
                self.pending_requests.remove(&info.transaction);
                Vec::new()
            }
            CtrlMsgKind::CxBindRequest => self.on_cxbind_request(cxs, h, info),
            CtrlMsgKind::CxBindSuccess => self.on_cxbind_success(cxs, h, info),
            CtrlMsgKind::CxBindFail => {
                self.pending_requests.remove(&info.transaction);
                self.close_data_channel(cxs, h)
            }
            CtrlMsgKind::Finalize => {
                log::debug!("[TCP] cx {}: Finalize received", h);
                match cxs.get(h).map(|c| c.mode) {
                    Some(CxMode::Control) => self.control_down(cxs, h),
                    _ => self.close_data_channel(cxs, h),
                }
            }
        }
    }

    /// Server side: promote an accepted connection to a control channel.
    fn on_idbind_request(
        &mut self,
        cxs: &mut CxTable,
        h: CxHandle,
        info: &CtrlInfo,
    ) -> Vec<TcpAction> {
        if !info.has(CAID_GUID_PREFIX) {
            let mut b = CtrlBuilder::new(CtrlMsgKind::IdBindFail, &info.transaction);
            b.error(CERR_BAD_REQUEST);
            return vec![
                TcpAction::SendCtrl {
                    cx: h,
                    frame: b.finish(),
                },
                TcpAction::Close { cx: h },
            ];
        }
        let Some(cx) = cxs.get_mut(h) else {
            return Vec::new();
        };
        if cx.cx_type != crate::cx::CxType::Tcp && cx.cx_type != crate::cx::CxType::TcpTls {
            let mut b = CtrlBuilder::new(CtrlMsgKind::IdBindFail, &info.transaction);
            b.error(CERR_UNSUPP_TRANSPORT);
            return vec![
                TcpAction::SendCtrl {
                    cx: h,
                    frame: b.finish(),
                },
                TcpAction::Close { cx: h },
            ];
        }
        cx.mode = CxMode::Control;
        cx.side = CxSide::Server;
        cx.cx_state = CxState::Open;
        cx.p_state = ProtoState::Control;
        if let Some(prefix) = info.prefix {
            cx.dst_prefix = Some(prefix);
            self.set_peer_prefix(h, prefix);
        }

        let mut b = CtrlBuilder::new(CtrlMsgKind::IdBindSuccess, &info.transaction);
        b.locator(&self.cfg.public_addr)
            .forward(u32::from(self.cfg.forward))
            .guid_prefix(&self.cfg.own_prefix);
        log::debug!("[TCP] CC {}: server control established", h);
        vec![TcpAction::SendCtrl {
            cx: h,
            frame: b.finish(),
        }]
    }

    /// Client side: the server accepted our identity.
    fn on_idbind_success(
        &mut self,
        cxs: &mut CxTable,
        h: CxHandle,
        info: &CtrlInfo,
    ) -> Vec<TcpAction> {
        self.pending_requests.remove(&info.transaction);
        let Some(cx) = cxs.get_mut(h) else {
            return Vec::new();
        };
        if cx.p_state != ProtoState::WIBindOk {
            return Vec::new();
        }
        cx.p_state = ProtoState::Control;
        if let Some(prefix) = info.prefix {
            cx.dst_prefix = Some(prefix);
            self.set_peer_prefix(h, prefix);
        }
        log::debug!("[TCP] CC {}: control established", h);
        let mut actions = vec![TcpAction::StopTimer { cx: h }];
        actions.extend(self.on_control_ready(cxs, h));
        actions
    }

    /// Tear a control channel down: data children first, learned reply
    /// locators cleared, and (client side) a reconnect scheduled.
    pub fn control_down(&mut self, cxs: &mut CxTable, h: CxHandle) -> Vec<TcpAction> {
        let children: Vec<CxHandle> = cxs.get(h).map(|c| c.children.clone()).unwrap_or_default();
        let mut actions = Vec::new();
        for child in children {
            actions.extend(self.close_data_channel(cxs, child));
        }
        actions.push(TcpAction::ClearReplyLocators { handle: h });
        self.forget_control(h);

        let is_client = cxs.get(h).is_some_and(|c| c.side == CxSide::Client);
        if is_client {
            actions.push(TcpAction::Close { cx: h });
            actions.extend(self.schedule_reconnect(cxs, h));
        } else {
            actions.push(TcpAction::Close { cx: h });
        }
        actions
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::GuidPrefix;
    use crate::tcp::rpsc::parse_ctrl;
    use crate::tcp::BridgeConfig;

    fn fsm() -> BridgeFsm {
        BridgeFsm::new(BridgeConfig {
            own_prefix: GuidPrefix::new([1; 12]),
            public_addr: [9; 16],
            forward: true,
            share: true,
        })
    }

    fn client_control(fsm: &mut BridgeFsm, cxs: &mut CxTable) -> (CxHandle, Vec<TcpAction>) {
        let h = cxs.alloc();
        cxs.get_mut(h).unwrap().cx_type = crate::cx::CxType::Tcp;
        let actions = fsm.start_client_control(cxs, h, [10; 16], 7500);
        (h, actions)
    }

    fn sent_frame(actions: &[TcpAction]) -> Vec<u8> {
        actions
            .iter()
            .find_map(|a| match a {
                TcpAction::SendCtrl { frame, .. } => Some(frame.clone()),
                _ => None,
            })
            .expect("a control frame was sent")
    }

    #[test]
    fn test_client_start_connects_and_arms_timer() {
        let mut f = fsm();
        let mut cxs = CxTable::new();
        let (h, actions) = client_control(&mut f, &mut cxs);

        assert!(matches!(actions[0], TcpAction::Connect { port: 7500, .. }));
        assert!(matches!(
            actions[1],
            TcpAction::StartTimer { ticks: CCWAIT_TO, .. }
        ));
        assert_eq!(cxs.get(h).unwrap().p_state, ProtoState::WCxOk);
    }

    #[test]
    fn test_connect_ok_sends_idbind() {
        let mut f = fsm();
        let mut cxs = CxTable::new();
        let (h, _) = client_control(&mut f, &mut cxs);

        let actions = f.on_control_connected(&mut cxs, h);
        let frame = sent_frame(&actions);
        let info = parse_ctrl(&frame).unwrap();
        assert_eq!(info.kind, Some(CtrlMsgKind::IdBindRequest));
        assert_eq!(info.prefix, Some(GuidPrefix::new([1; 12])));
        assert_eq!(info.forward, 1);
        assert_eq!(info.address, [9; 16]);
        assert_eq!(cxs.get(h).unwrap().p_state, ProtoState::WIBindOk);
        assert_eq!(cxs.get(h).unwrap().retries, IDBREQ_RETRIES);
    }

    #[test]
    fn test_idbind_success_reaches_control() {
        let mut f = fsm();
        let mut cxs = CxTable::new();
        let (h, _) = client_control(&mut f, &mut cxs);
        let actions = f.on_control_connected(&mut cxs, h);
        let req = parse_ctrl(&sent_frame(&actions)).unwrap();

        let mut reply = CtrlInfo {
            kind: Some(CtrlMsgKind::IdBindSuccess),
            transaction: req.transaction,
            ..Default::default()
        };
        reply.prefix = Some(GuidPrefix::new([7; 12]));

        let actions = f.on_ctrl(&mut cxs, h, &reply);
        assert!(actions.contains(&TcpAction::StopTimer { cx: h }));
        assert_eq!(cxs.get(h).unwrap().p_state, ProtoState::Control);
        assert_eq!(f.peer_prefix(h), Some(GuidPrefix::new([7; 12])));
    }

    #[test]
    fn test_idbind_timeout_retries_then_finalizes() {
        let mut f = fsm();
        let mut cxs = CxTable::new();
        let (h, _) = client_control(&mut f, &mut cxs);
        f.on_control_connected(&mut cxs, h);

        // Three retries resend the request.
        for i in 0..IDBREQ_RETRIES {
            let actions = f.on_control_timeout(&mut cxs, h);
            let info = parse_ctrl(&sent_frame(&actions)).unwrap();
            assert_eq!(info.kind, Some(CtrlMsgKind::IdBindRequest));
            assert_eq!(cxs.get(h).unwrap().retries, IDBREQ_RETRIES - 1 - i);
        }

        // Exhaustion: Finalize, close, reconnect scheduled.
        let actions = f.on_control_timeout(&mut cxs, h);
        let info = parse_ctrl(&sent_frame(&actions)).unwrap();
        assert_eq!(info.kind, Some(CtrlMsgKind::Finalize));
        assert!(actions.iter().any(|a| matches!(a, TcpAction::Close { .. })));
        assert!(actions
            .iter()
            .any(|a| matches!(a, TcpAction::ClearReplyLocators { .. })));
        assert_eq!(cxs.get(h).unwrap().cx_state, CxState::WRetry);
    }

    #[test]
    fn test_connect_failure_schedules_randomised_reconnect() {
        let mut f = fsm();
        let mut cxs = CxTable::new();
        let (h, _) = client_control(&mut f, &mut cxs);

        let actions = f.on_control_connect_failed(&mut cxs, h);
        match actions[0] {
            TcpAction::StartTimer { ticks, .. } => {
                assert!((crate::timer::secs(1)..crate::timer::secs(5)).contains(&ticks));
            }
            ref other => panic!("expected reconnect timer, got {:?}", other),
        }
        assert_eq!(cxs.get(h).unwrap().cx_state, CxState::WRetry);

        // The reconnect timer restarts the channel.
        let actions = f.on_control_timeout(&mut cxs, h);
        assert!(matches!(actions[0], TcpAction::Connect { .. }));
        assert_eq!(cxs.get(h).unwrap().p_state, ProtoState::WCxOk);
    }

    #[test]
    fn test_server_promotes_on_idbind_request() {
        let mut f = fsm();
        let mut cxs = CxTable::new();
        let h = cxs.alloc();
        cxs.get_mut(h).unwrap().cx_type = crate::cx::CxType::Tcp;

        let info = CtrlInfo {
            kind: Some(CtrlMsgKind::IdBindRequest),
            transaction: [3; 12],
            prefix: Some(GuidPrefix::new([7; 12])),
            pids: 1 << (CAID_GUID_PREFIX & 0xff),
            ..Default::default()
        };
        let actions = f.on_ctrl(&mut cxs, h, &info);
        let reply = parse_ctrl(&sent_frame(&actions)).unwrap();
        assert_eq!(reply.kind, Some(CtrlMsgKind::IdBindSuccess));
        assert_eq!(reply.transaction, [3; 12]);
        assert_eq!(reply.prefix, Some(GuidPrefix::new([1; 12])));

        let cx = cxs.get(h).unwrap();
        assert_eq!(cx.mode, CxMode::Control);
        assert_eq!(cx.p_state, ProtoState::Control);
        assert_eq!(cx.dst_prefix, Some(GuidPrefix::new([7; 12])));
    }

    #[test]
    fn test_idbind_request_without_prefix_fails() {
        let mut f = fsm();
        let mut cxs = CxTable::new();
        let h = cxs.alloc();
        cxs.get_mut(h).unwrap().cx_type = crate::cx::CxType::Tcp;

        let info = CtrlInfo {
            kind: Some(CtrlMsgKind::IdBindRequest),
            transaction: [3; 12],
            ..Default::default()
        };
        let actions = f.on_ctrl(&mut cxs, h, &info);
        let reply = parse_ctrl(&sent_frame(&actions)).unwrap();
        assert_eq!(reply.kind, Some(CtrlMsgKind::IdBindFail));
        assert_eq!(reply.error_kind, CERR_BAD_REQUEST);
        assert!(actions.iter().any(|a| matches!(a, TcpAction::Close { .. })));
    }

    #[test]
    fn test_control_down_cascades_children() {
        let mut f = fsm();
        let mut cxs = CxTable::new();
        let (h, _) = client_control(&mut f, &mut cxs);
        let d1 = cxs.alloc();
        let d2 = cxs.alloc();
        cxs.attach_child(h, d1);
        cxs.attach_child(h, d2);
        cxs.get_mut(d1).unwrap().mode = CxMode::Data;
        cxs.get_mut(d2).unwrap().mode = CxMode::Data;

        let actions = f.control_down(&mut cxs, h);
        let closed: Vec<CxHandle> = actions
            .iter()
            .filter_map(|a| match a {
                TcpAction::Close { cx } => Some(*cx),
                _ => None,
            })
            .collect();
        assert!(closed.contains(&d1));
        assert!(closed.contains(&d2));
        assert!(closed.contains(&h));
        assert!(actions
            .iter()
            .any(|a| matches!(a, TcpAction::ClearReplyLocators { handle } if *handle == h)));
    }
}
