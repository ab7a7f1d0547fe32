// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP bridge transport.
//!
//! Bridged peers keep one **control channel** speaking the RPSC protocol
//! and any number of **data channels** bound to RTPS logical ports. The
//! channel state machines live in [`control`] and [`data`]; this module
//! holds the shared vocabulary (actions, timeouts) and the socket-level
//! transport that executes FSM actions against real connections.
//!
//! # Channel states
//!
//! ```text
//! control:  IDLE -> WCXOK -> WIBINDOK -> CONTROL
//! data tx:  IDLE -> WCONTROL -> WPORTOK -> WCXOK -> WCBINDOK -> DATA
//! data rx:  IDLE -> WCXOK -> DATA            (driven by CLPortRequest)
//! ```
//!
//! All timeouts are expressed in 10 ms ticks; retry budgets follow the
//! table in the protocol description:
//!
//! | event                        | timeout | retries   |
//! |------------------------------|---------|-----------|
//! | control wait-for-connect     | 5 s     | unbounded |
//! | identity bind                | 2 s     | 3         |
//! | server logical port request  | 3 s     | 2         |
//! | client logical port request  | 2 s     | 2         |
//! | connection bind              | 2 s     | 2         |
//! | client reconnect delay       | 1-5 s   | unbounded |

pub mod control;
pub mod data;
pub mod frame;
pub mod rpsc;
pub mod stream;
pub mod transport;

#[cfg(test)]
mod bridge_tests;

pub use frame::{encode_rtps_frame, FrameError, TcpFrameReader, TcpInbound};
pub use rpsc::{CtrlBuilder, CtrlInfo, CtrlMsgKind, RpscError};

use std::collections::HashMap;

use crate::cx::{CxHandle, CxTable};
use crate::guid::GuidPrefix;
use crate::timer::secs;

// ============================================================================
// Timeouts and retry budgets (ticks)
// ============================================================================

/// Control-channel connect timeout.
pub const CCWAIT_TO: u64 = secs(5);
/// IdentityBind reply timeout.
pub const IDBREQ_TO: u64 = secs(2);
/// IdentityBind retries.
pub const IDBREQ_RETRIES: u32 = 3;
/// ServerLogicalPort reply timeout.
pub const SLPREQ_TO: u64 = secs(3);
/// ServerLogicalPort retries.
pub const SLPREQ_RETRIES: u32 = 2;
/// ClientLogicalPort reply timeout.
pub const CLPREQ_TO: u64 = secs(2);
/// ClientLogicalPort retries.
pub const CLPREQ_RETRIES: u32 = 2;
/// ConnectionBind reply timeout.
pub const CXBREQ_TO: u64 = secs(2);
/// ConnectionBind retries.
pub const CXBREQ_RETRIES: u32 = 2;
/// Data-channel connect timeout.
pub const DATA_CONNECT_TO: u64 = secs(2);
/// Pending-accept recognition timeout.
pub const PENDING_TO: u64 = secs(2);

/// Randomised client reconnect delay: 1-5 s.
pub fn reconnect_delay() -> u64 {
    secs(1) + fastrand::u64(..secs(4))
}

// ============================================================================
// FSM actions
// ============================================================================

/// Side effects requested by the channel FSMs; the transport executes them
/// against sockets, timers and the forwarding table.
#[derive(Debug, PartialEq, Eq)]
pub enum TcpAction {
    /// Write a control frame on a channel, ahead of queued data.
    SendCtrl {
        /// Channel.
        cx: CxHandle,
        /// Complete RPSC frame.
        frame: Vec<u8>,
    },
    /// Open a TCP connection for this channel.
    Connect {
        /// Channel.
        cx: CxHandle,
        /// Destination address.
        addr: [u8; 16],
        /// Destination port.
        port: u32,
    },
    /// Arm the channel's timer.
    StartTimer {
        /// Channel.
        cx: CxHandle,
        /// Delay in ticks.
        ticks: u64,
    },
    /// Disarm the channel's timer.
    StopTimer {
        /// Channel.
        cx: CxHandle,
    },
    /// Tear the channel down (socket close, handle free).
    Close {
        /// Channel.
        cx: CxHandle,
    },
    /// Share one fd between a channel pair; `owner` keeps ownership.
    Pair {
        /// fd-owning side.
        owner: CxHandle,
        /// Other side.
        other: CxHandle,
    },
    /// Channel reached its operational state; flush queued traffic.
    ChannelUp {
        /// Channel.
        cx: CxHandle,
    },
    /// Learned reply locators through this connection are now invalid.
    ClearReplyLocators {
        /// Connection handle.
        handle: u32,
    },
}

// ============================================================================
// Bridge configuration and shared FSM state
// ============================================================================

/// Static configuration of the bridge FSMs.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Our participant prefix, sent in IdentityBind exchanges.
    pub own_prefix: GuidPrefix,
    /// Public address advertised in IdentityBindRequest.
    pub public_addr: [u8; 16],
    /// We are willing to forward for peers.
    pub forward: bool,
    /// Allow sharing one fd between a Tx/Rx channel pair.
    pub share: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            own_prefix: GuidPrefix::UNKNOWN,
            public_addr: [0u8; 16],
            forward: true,
            share: true,
        }
    }
}

/// A data-channel binding negotiated over the control channel but not yet
/// bound to a socket; keyed by its cookie.
#[derive(Debug, Clone)]
pub struct PendingBinding {
    /// Logical port of the binding.
    pub port: u32,
    /// Requested port options.
    pub options: u8,
    /// Control channel the request travelled on.
    pub control: CxHandle,
    /// Server-side data channel record awaiting the bind.
    pub rx_cx: CxHandle,
    /// Sharing was granted.
    pub shared: bool,
}

/// The bridge protocol engine: control and data channel FSMs plus the
/// cookie registry. Pure state; all side effects are [`TcpAction`]s.
#[derive(Debug)]
pub struct BridgeFsm {
    /// Configuration.
    pub cfg: BridgeConfig,
    tx_counter: u32,
    cookie_counter: u64,
    bindings: HashMap<Vec<u8>, PendingBinding>,
    /// Peer prefix per control channel, learned from IdentityBind.
    peer_prefixes: HashMap<CxHandle, GuidPrefix>,
    /// Outstanding control requests awaiting a reply, by transaction id.
    pending_requests: HashMap<rpsc::TransactionId, CxHandle>,
    /// Per data-channel negotiation state.
    data_state: HashMap<CxHandle, DataState>,
}

/// Negotiation state of one data channel.
#[derive(Debug, Clone, Default)]
pub struct DataState {
    /// Logical RTPS port of the binding.
    pub port: u32,
    /// Requested port options.
    pub options: u8,
    /// Cookie identifying the binding, once assigned.
    pub cookie: Option<Vec<u8>>,
}

impl BridgeFsm {
    /// Engine with the given configuration.
    pub fn new(cfg: BridgeConfig) -> Self {
        BridgeFsm {
            cfg,
            tx_counter: 0,
            cookie_counter: 0,
            bindings: HashMap::new(),
            peer_prefixes: HashMap::new(),
            pending_requests: HashMap::new(),
            data_state: HashMap::new(),
        }
    }

    /// A TCP connect finished on a channel; dispatch by channel role.
    pub fn on_connected(&mut self, cxs: &mut CxTable, h: CxHandle) -> Vec<TcpAction> {
        match cxs.get(h).map(|c| c.mode) {
            Some(crate::cx::CxMode::Control) => self.on_control_connected(cxs, h),
            Some(crate::cx::CxMode::Data) => self.on_data_connected(cxs, h),
            _ => Vec::new(),
        }
    }

    /// A channel's timer fired; dispatch by channel role.
    pub fn on_timeout(&mut self, cxs: &mut CxTable, h: CxHandle) -> Vec<TcpAction> {
        match cxs.get(h).map(|c| c.mode) {
            Some(crate::cx::CxMode::Control) => self.on_control_timeout(cxs, h),
            Some(crate::cx::CxMode::Data) => self.on_data_timeout(cxs, h),
            _ => Vec::new(),
        }
    }

    /// Fresh transaction id.
    pub(crate) fn transaction(&mut self) -> rpsc::TransactionId {
        rpsc::next_transaction(&mut self.tx_counter)
    }

    /// Mint a cookie unique within this process.
    pub(crate) fn mint_cookie(&mut self) -> Vec<u8> {
        self.cookie_counter += 1;
        let mut cookie = Vec::with_capacity(12);
        cookie.extend_from_slice(&self.cookie_counter.to_ne_bytes());
        cookie.extend_from_slice(&fastrand::u32(..).to_ne_bytes());
        cookie
    }

    /// Register a pending binding under its cookie.
    pub(crate) fn register_binding(&mut self, cookie: Vec<u8>, binding: PendingBinding) {
        self.bindings.insert(cookie, binding);
    }

    /// Claim a pending binding by cookie.
    pub(crate) fn take_binding(&mut self, cookie: &[u8]) -> Option<PendingBinding> {
        self.bindings.remove(cookie)
    }

    /// Pending bindings count (introspection).
    pub fn pending_bindings(&self) -> usize {
        self.bindings.len()
    }

    /// Record the peer prefix learned on a control channel.
    pub(crate) fn set_peer_prefix(&mut self, control: CxHandle, prefix: GuidPrefix) {
        self.peer_prefixes.insert(control, prefix);
    }

    /// Peer prefix of a control channel.
    pub fn peer_prefix(&self, control: CxHandle) -> Option<GuidPrefix> {
        self.peer_prefixes.get(&control).copied()
    }

    /// Forget a control channel's learned peer prefix.
    pub(crate) fn forget_control(&mut self, control: CxHandle) {
        self.peer_prefixes.remove(&control);
        self.bindings.retain(|_, b| b.control != control);
    }

    /// Resolve the control channel governing a channel: itself when it is
    /// a control channel, its parent otherwise.
    pub(crate) fn control_of(&self, cxs: &CxTable, h: CxHandle) -> Option<CxHandle> {
        let cx = cxs.get(h)?;
        match cx.mode {
            crate::cx::CxMode::Control => Some(h),
            _ if cx.parent != 0 => Some(cx.parent),
            _ => None,
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
    fn test_reconnect_delay_bounds() {
        for _ in 0..100 {
            let d = reconnect_delay();
            assert!((secs(1)..secs(5)).contains(&d));
        }
    }

    #[test]
    fn test_cookie_uniqueness() {
        let mut fsm = BridgeFsm::new(BridgeConfig::default());
        let a = fsm.mint_cookie();
        let b = fsm.mint_cookie();
        assert_ne!(a, b);
        assert!(a.len() <= rpsc::MAX_COOKIE);
    }

    #[test]
    fn test_binding_registry() {
        let mut fsm = BridgeFsm::new(BridgeConfig::default());
        let cookie = fsm.mint_cookie();
        fsm.register_binding(
            cookie.clone(),
            PendingBinding {
                port: 7411,
                options: 0,
                control: 1,
                rx_cx: 2,
                shared: false,
            },
        );
        assert_eq!(fsm.pending_bindings(), 1);
        assert!(fsm.take_binding(&cookie).is_some());
        assert!(fsm.take_binding(&cookie).is_none());
    }

    #[test]
    fn test_forget_control_drops_bindings() {
        let mut fsm = BridgeFsm::new(BridgeConfig::default());
        fsm.set_peer_prefix(1, GuidPrefix::new([1; 12]));
        let cookie = fsm.mint_cookie();
        fsm.register_binding(
            cookie,
            PendingBinding {
                port: 1,
                options: 0,
                control: 1,
                rx_cx: 2,
                shared: false,
            },
        );
        fsm.forget_control(1);
        assert!(fsm.peer_prefix(1).is_none());
        assert_eq!(fsm.pending_bindings(), 0);
    }
}
