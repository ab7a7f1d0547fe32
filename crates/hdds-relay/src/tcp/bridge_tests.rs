// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end bridge FSM tests: a client engine and a server engine with
//! their own connection tables, exchanging control frames as the sockets
//! would.

use crate::cx::{CxHandle, CxMode, CxState, CxTable, ProtoState};
use crate::guid::GuidPrefix;
use crate::tcp::rpsc::{parse_ctrl, CtrlMsgKind, PO_DATA, PO_SHARE, PO_UCAST};
use crate::tcp::{BridgeConfig, BridgeFsm, TcpAction};

const CLIENT_PREFIX: [u8; 12] = [0xC1; 12];
const SERVER_PREFIX: [u8; 12] = [0x51; 12];

struct Host {
    fsm: BridgeFsm,
    cxs: CxTable,
}

impl Host {
    fn new(prefix: [u8; 12], share: bool) -> Host {
        Host {
            fsm: BridgeFsm::new(BridgeConfig {
                own_prefix: GuidPrefix::new(prefix),
                public_addr: [7; 16],
                forward: true,
                share,
            }),
            cxs: CxTable::new(),
        }
    }

    fn alloc_tcp(&mut self) -> CxHandle {
        let h = self.cxs.alloc();
        self.cxs.get_mut(h).unwrap().cx_type = crate::cx::CxType::Tcp;
        h
    }
}

/// Pull all control frames out of an action list as (via-channel, frame).
fn ctrl_frames(actions: &[TcpAction]) -> Vec<(CxHandle, Vec<u8>)> {
    actions
        .iter()
        .filter_map(|a| match a {
            TcpAction::SendCtrl { cx, frame } => Some((*cx, frame.clone())),
            _ => None,
        })
        .collect()
}

/// Deliver frames from one host to the other over a channel mapping.
fn deliver(
    to: &mut Host,
    frames: Vec<(CxHandle, Vec<u8>)>,
    map: impl Fn(CxHandle) -> CxHandle,
) -> Vec<TcpAction> {
    let mut out = Vec::new();
    for (via, frame) in frames {
        let info = parse_ctrl(&frame).expect("well-formed control frame");
        out.extend(to.fsm.on_ctrl(&mut to.cxs, map(via), &info));
    }
    out
}

/// Establish a control channel pair; returns (client control, server
/// control) handles.
fn establish_control(client: &mut Host, server: &mut Host) -> (CxHandle, CxHandle) {
    let cc = client.alloc_tcp();
    let actions = client.fsm.start_client_control(&mut client.cxs, cc, [10; 16], 7500);
    assert!(matches!(actions[0], TcpAction::Connect { .. }));

    // Server accepts; the accepted record is the future control channel.
    let sc = server.alloc_tcp();

    // Client connect completes, IdentityBind flows.
    let actions = client.fsm.on_connected(&mut client.cxs, cc);
    let replies = deliver(server, ctrl_frames(&actions), |_| sc);
    let done = deliver(client, ctrl_frames(&replies), |_| cc);
    assert!(done.is_empty() || !ctrl_frames(&done).iter().any(|_| true));

    assert_eq!(client.cxs.get(cc).unwrap().p_state, ProtoState::Control);
    assert_eq!(server.cxs.get(sc).unwrap().p_state, ProtoState::Control);
    (cc, sc)
}

// ============================================================================
// Happy path: logical port setup
// ============================================================================

#[test]
fn test_logical_port_setup_happy_path() {
    let mut client = Host::new(CLIENT_PREFIX, true);
    let mut server = Host::new(SERVER_PREFIX, true);
    let (cc, sc) = establish_control(&mut client, &mut server);

    // Identity exchange recorded both peer prefixes.
    assert_eq!(
        client.fsm.peer_prefix(cc),
        Some(GuidPrefix::new(SERVER_PREFIX))
    );
    assert_eq!(
        server.fsm.peer_prefix(sc),
        Some(GuidPrefix::new(CLIENT_PREFIX))
    );

    // Client opens a Tx channel for logical port 7401.
    let (dt, actions) = client
        .fsm
        .open_data_tx(&mut client.cxs, cc, 7401, PO_DATA | PO_UCAST);
    assert_eq!(client.cxs.get(dt).unwrap().p_state, ProtoState::WPortOk);
    let frames = ctrl_frames(&actions);
    assert_eq!(frames.len(), 1);
    let req = parse_ctrl(&frames[0].1).unwrap();
    assert_eq!(req.kind, Some(CtrlMsgKind::SLPortRequest));
    assert_eq!(req.port, 7401);
    assert_ne!(req.port_options & PO_SHARE, 0);

    // Server grants the port with a cookie.
    let replies = deliver(&mut server, frames, |_| sc);
    assert_eq!(server.fsm.pending_bindings(), 1);
    let reply_frames = ctrl_frames(&replies);
    let grant = parse_ctrl(&reply_frames[0].1).unwrap();
    assert_eq!(grant.kind, Some(CtrlMsgKind::SLPortSuccess));
    assert!(grant.cookie.is_some());
    assert!(grant.shared);
    assert_eq!(grant.prefix, Some(GuidPrefix::new(SERVER_PREFIX)));

    // No reverse channel exists yet, so the client opens a dedicated
    // connection.
    let actions = deliver(&mut client, reply_frames, |_| cc);
    assert!(actions
        .iter()
        .any(|a| matches!(a, TcpAction::Connect { cx, .. } if *cx == dt)));
    assert_eq!(client.cxs.get(dt).unwrap().p_state, ProtoState::WCxOk);

    // The data connect completes; ConnectionBind flows on the new socket.
    let actions = client.fsm.on_connected(&mut client.cxs, dt);
    assert_eq!(client.cxs.get(dt).unwrap().p_state, ProtoState::WCBindOk);
    let bind_frames = ctrl_frames(&actions);
    let bind = parse_ctrl(&bind_frames[0].1).unwrap();
    assert_eq!(bind.kind, Some(CtrlMsgKind::CxBindRequest));

    // Server side: the request arrives on a freshly accepted connection.
    let sd = server.alloc_tcp();
    let replies = deliver(&mut server, bind_frames, |_| sd);
    assert_eq!(server.fsm.pending_bindings(), 0);
    assert_eq!(server.cxs.get(sd).unwrap().p_state, ProtoState::Data);
    assert!(replies
        .iter()
        .any(|a| matches!(a, TcpAction::ChannelUp { cx } if *cx == sd)));

    // Client receives the bind success: both sides in DATA.
    let done = deliver(&mut client, ctrl_frames(&replies), |_| dt);
    assert_eq!(client.cxs.get(dt).unwrap().p_state, ProtoState::Data);
    assert_eq!(client.cxs.get(dt).unwrap().cx_state, CxState::Open);
    assert!(done
        .iter()
        .any(|a| matches!(a, TcpAction::ChannelUp { cx } if *cx == dt)));
}

#[test]
fn test_cookie_mismatch_rejected() {
    let mut client = Host::new(CLIENT_PREFIX, false);
    let mut server = Host::new(SERVER_PREFIX, false);
    let (_cc, _sc) = establish_control(&mut client, &mut server);

    // A bind request with a cookie nobody minted.
    let sd = server.alloc_tcp();
    let mut b = crate::tcp::rpsc::CtrlBuilder::new(CtrlMsgKind::CxBindRequest, &[9; 12]);
    b.cookie(&[1, 2, 3, 4]);
    let info = parse_ctrl(&b.finish()).unwrap();
    let actions = server.fsm.on_cxbind_request(&mut server.cxs, sd, &info);

    let frames = ctrl_frames(&actions);
    let reply = parse_ctrl(&frames[0].1).unwrap();
    assert_eq!(reply.kind, Some(CtrlMsgKind::CxBindFail));
    assert_eq!(reply.error_kind, crate::tcp::rpsc::CERR_ALLOC_MISMATCH);
    assert!(actions
        .iter()
        .any(|a| matches!(a, TcpAction::Close { cx } if *cx == sd)));
}

#[test]
fn test_data_channel_waits_for_control() {
    let mut client = Host::new(CLIENT_PREFIX, true);
    let cc = client.alloc_tcp();
    client
        .fsm
        .start_client_control(&mut client.cxs, cc, [10; 16], 7500);

    // Channel opened before the control handshake finished: parked.
    let (dt, actions) = client.fsm.open_data_tx(&mut client.cxs, cc, 7401, PO_DATA);
    assert!(actions.is_empty());
    assert_eq!(client.cxs.get(dt).unwrap().p_state, ProtoState::WControl);

    // Control reaching CONTROL releases it.
    let mut server = Host::new(SERVER_PREFIX, true);
    let sc = server.alloc_tcp();
    let actions = client.fsm.on_connected(&mut client.cxs, cc);
    let replies = deliver(&mut server, ctrl_frames(&actions), |_| sc);
    let released = deliver(&mut client, ctrl_frames(&replies), |_| cc);

    assert_eq!(client.cxs.get(dt).unwrap().p_state, ProtoState::WPortOk);
    let frames = ctrl_frames(&released);
    assert_eq!(
        parse_ctrl(&frames[0].1).unwrap().kind,
        Some(CtrlMsgKind::SLPortRequest)
    );
}

#[test]
fn test_shared_reverse_channel_pairs() {
    let mut client = Host::new(CLIENT_PREFIX, true);
    let mut server = Host::new(SERVER_PREFIX, true);
    let (cc, _sc) = establish_control(&mut client, &mut server);

    // An established Rx channel from the peer already exists under the
    // control channel, with a live fd.
    let rx = client.cxs.alloc();
    {
        let cx = client.cxs.get_mut(rx).unwrap();
        cx.mode = CxMode::Data;
        cx.side = crate::cx::CxSide::Server;
        cx.p_state = ProtoState::Data;
        cx.fd = 42;
        cx.fd_owner = true;
    }
    client.cxs.attach_child(cc, rx);

    // Tx setup with sharing granted reuses the reverse fd instead of
    // connecting.
    let (dt, actions) = client
        .fsm
        .open_data_tx(&mut client.cxs, cc, 7401, PO_DATA | PO_UCAST);
    let replies = {
        // Fake the server grant directly.
        let cookie = vec![5u8; 8];
        let mut b = crate::tcp::rpsc::CtrlBuilder::new(
            CtrlMsgKind::SLPortSuccess,
            &parse_ctrl(&ctrl_frames(&actions)[0].1).unwrap().transaction,
        );
        b.cookie(&cookie)
            .allow_shared(true)
            .guid_prefix(&GuidPrefix::new(SERVER_PREFIX));
        let info = parse_ctrl(&b.finish()).unwrap();
        client.fsm.on_ctrl(&mut client.cxs, cc, &info)
    };

    assert!(replies
        .iter()
        .any(|a| matches!(a, TcpAction::Pair { owner, other } if *owner == rx && *other == dt)));
    assert!(!replies
        .iter()
        .any(|a| matches!(a, TcpAction::Connect { .. })));
    // The bind request travels on the shared channel.
    assert!(ctrl_frames(&replies)
        .iter()
        .any(|(via, f)| *via == dt
            && parse_ctrl(f).unwrap().kind == Some(CtrlMsgKind::CxBindRequest)));
    assert_eq!(client.cxs.get(dt).unwrap().p_state, ProtoState::WCBindOk);
}

#[test]
fn test_sharing_disabled_forces_dedicated_connection() {
    let mut client = Host::new(CLIENT_PREFIX, false);
    let mut server = Host::new(SERVER_PREFIX, false);
    let (cc, sc) = establish_control(&mut client, &mut server);

    let (dt, actions) = client
        .fsm
        .open_data_tx(&mut client.cxs, cc, 7401, PO_DATA | PO_UCAST | PO_SHARE);
    // The caller's SHARE bit still travels, but the server must not grant
    // sharing when it is disabled.
    let replies = deliver(&mut server, ctrl_frames(&actions), |_| sc);
    let grant = parse_ctrl(&ctrl_frames(&replies)[0].1).unwrap();
    assert!(!grant.shared);

    let actions = deliver(&mut client, ctrl_frames(&replies), |_| cc);
    assert!(actions
        .iter()
        .any(|a| matches!(a, TcpAction::Connect { cx, .. } if *cx == dt)));
}

// ============================================================================
// Reverse (ClientLogicalPort) path
// ============================================================================

#[test]
fn test_reverse_channel_request() {
    let mut client = Host::new(CLIENT_PREFIX, false);
    let mut server = Host::new(SERVER_PREFIX, false);
    let (cc, sc) = establish_control(&mut client, &mut server);

    // Server asks the client to open a reverse channel.
    let (rx, actions) = server
        .fsm
        .request_client_port(&mut server.cxs, sc, 7411, PO_DATA | PO_UCAST);
    let frames = ctrl_frames(&actions);
    let req = parse_ctrl(&frames[0].1).unwrap();
    assert_eq!(req.kind, Some(CtrlMsgKind::CLPortRequest));
    assert!(req.cookie.is_some());
    assert_eq!(req.port, 7411);

    // Client accepts and connects back toward the server.
    let replies = deliver(&mut client, frames, |_| cc);
    let reply_frames = ctrl_frames(&replies);
    let success = parse_ctrl(&reply_frames[0].1).unwrap();
    assert_eq!(success.kind, Some(CtrlMsgKind::CLPortSuccess));
    assert!(replies
        .iter()
        .any(|a| matches!(a, TcpAction::Connect { .. })));

    // Server keeps the placeholder Rx channel pending the bind.
    assert_eq!(server.cxs.get(rx).unwrap().p_state, ProtoState::WCxOk);
    assert_eq!(server.fsm.pending_bindings(), 1);
}

// ============================================================================
// Retry exhaustion
// ============================================================================

#[test]
fn test_slport_timeout_retries_then_finalizes() {
    let mut client = Host::new(CLIENT_PREFIX, true);
    let mut server = Host::new(SERVER_PREFIX, true);
    let (cc, _sc) = establish_control(&mut client, &mut server);

    let (dt, _) = client
        .fsm
        .open_data_tx(&mut client.cxs, cc, 7401, PO_DATA | PO_UCAST);

    // Two retries resend the request through the control channel.
    for _ in 0..crate::tcp::SLPREQ_RETRIES {
        let actions = client.fsm.on_timeout(&mut client.cxs, dt);
        let frames = ctrl_frames(&actions);
        assert_eq!(
            parse_ctrl(&frames[0].1).unwrap().kind,
            Some(CtrlMsgKind::SLPortRequest)
        );
    }

    // Exhaustion with an empty queue: Finalize then close.
    let actions = client.fsm.on_timeout(&mut client.cxs, dt);
    let frames = ctrl_frames(&actions);
    assert_eq!(
        parse_ctrl(&frames[0].1).unwrap().kind,
        Some(CtrlMsgKind::Finalize)
    );
    assert!(actions
        .iter()
        .any(|a| matches!(a, TcpAction::Close { cx } if *cx == dt)));
}

#[test]
fn test_exhaustion_with_pending_traffic_reconnects() {
    let mut client = Host::new(CLIENT_PREFIX, true);
    let mut server = Host::new(SERVER_PREFIX, true);
    let (cc, _sc) = establish_control(&mut client, &mut server);

    let (dt, _) = client
        .fsm
        .open_data_tx(&mut client.cxs, cc, 7401, PO_DATA | PO_UCAST);

    // Pending outbound traffic on the channel.
    let msg = std::sync::Arc::new(crate::message::Message::with_source(GuidPrefix::new(
        CLIENT_PREFIX,
    )));
    client.cxs.get_mut(dt).unwrap().enqueue(msg);

    // Burn the retry budget.
    for _ in 0..crate::tcp::SLPREQ_RETRIES {
        client.fsm.on_timeout(&mut client.cxs, dt);
    }
    let actions = client.fsm.on_timeout(&mut client.cxs, dt);

    // No Finalize, no Close: the channel re-requests the port.
    assert!(!actions
        .iter()
        .any(|a| matches!(a, TcpAction::Close { cx } if *cx == dt)));
    let frames = ctrl_frames(&actions);
    assert_eq!(
        parse_ctrl(&frames[0].1).unwrap().kind,
        Some(CtrlMsgKind::SLPortRequest)
    );
}
