// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection table.
//!
//! Every socket or protocol connection is an [`IpCx`] slot in a handle
//! arena. Handles are small integers; handle 0 is reserved for "none" and
//! handles are reused after free. All cross-connection references
//! (parent, children, paired peer) are handles, never pointers, so teardown
//! can be table-mediated and cannot dangle.
//!
//! A *paired* pair shares one file descriptor: exactly one side owns it.
//! When the owner closes first, ownership (and any secure-session context)
//! migrates to the survivor.

use std::collections::VecDeque;

use crate::guid::GuidPrefix;
use crate::locator::Locator;
use crate::message::SharedMessage;

/// Connection handle; 0 means "none".
pub type CxHandle = u32;

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CxState {
    /// No connection.
    #[default]
    Closed,
    /// Server socket awaiting connections.
    Listen,
    /// Client-side authentication in progress.
    CAuth,
    /// Connection requested, not yet started.
    ConReq,
    /// TCP connect in progress.
    Connect,
    /// Waiting to retry a failed connect.
    WRetry,
    /// Server-side authentication in progress.
    SAuth,
    /// Connected and usable.
    Open,
}

/// Per-channel protocol states shared by the TCP control and data FSMs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProtoState {
    /// Nothing going on.
    #[default]
    Idle,
    /// Waiting until the control channel reaches `Control`.
    WControl,
    /// Waiting for TCP connect completion.
    WCxOk,
    /// IdentityBindRequest sent, awaiting reply.
    WIBindOk,
    /// Logical-port request sent, awaiting reply.
    WPortOk,
    /// ConnectionBindRequest sent, awaiting reply.
    WCBindOk,
    /// Control channel established.
    Control,
    /// Data channel established; RTPS frames may be carried.
    Data,
}

/// Transport type of a connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CxType {
    /// Plain UDP.
    #[default]
    Udp,
    /// DTLS over UDP.
    UdpDtls,
    /// Plain TCP.
    Tcp,
    /// TLS over TCP.
    TcpTls,
}

/// Role of a connection record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CxMode {
    /// Root listener (server socket).
    #[default]
    Root,
    /// Bridge control channel.
    Control,
    /// Bridge data channel.
    Data,
}

/// Which side of the connection we are.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CxSide {
    /// Accepting side.
    #[default]
    Server,
    /// Initiating side.
    Client,
}

/// Per-connection statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct CxStats {
    /// Octets sent.
    pub octets_sent: u64,
    /// Octets received.
    pub octets_rcvd: u64,
    /// Packets sent.
    pub packets_sent: u64,
    /// Packets received.
    pub packets_rcvd: u64,
    /// Read errors.
    pub read_err: u64,
    /// Write errors.
    pub write_err: u64,
    /// Reads that returned no data.
    pub empty_read: u64,
    /// Frames dropped as too short.
    pub too_short: u64,
    /// Allocation failures.
    pub nomem: u64,
    /// Messages currently queued for send.
    pub nqueued: u64,
}

/// One connection record.
#[derive(Debug, Default)]
pub struct IpCx {
    /// Own handle.
    pub handle: CxHandle,
    /// Locator served by this connection.
    pub locator: Option<Locator>,
    /// Destination address for point-to-point connections.
    pub dst_addr: [u8; 16],
    /// Destination port for point-to-point connections.
    pub dst_port: u32,
    /// Peer participant prefix, once learned.
    pub dst_prefix: Option<GuidPrefix>,
    /// File descriptor, 0 if none.
    pub fd: i32,
    /// True if this record owns (and must close) the fd.
    pub fd_owner: bool,
    /// Transport type.
    pub cx_type: CxType,
    /// Record role.
    pub mode: CxMode,
    /// Server or client side.
    pub side: CxSide,
    /// Connection lifecycle state.
    pub cx_state: CxState,
    /// FSM protocol state.
    pub p_state: ProtoState,
    /// Paired counterpart sharing our fd.
    pub paired: CxHandle,
    /// Parent record (listener or control channel).
    pub parent: CxHandle,
    /// Child records.
    pub children: Vec<CxHandle>,
    /// Pending outbound messages.
    pub send_queue: VecDeque<SharedMessage>,
    /// One-shot control reply waiting for writability; flushed ahead of
    /// queued data.
    pub cxbs_queued: Option<Vec<u8>>,
    /// FSM retry budget.
    pub retries: u32,
    /// True while a secure-session context is attached.
    pub has_sproto: bool,
    /// Marked during an address-set update; survivors clear it.
    pub redundant: bool,
    /// Statistics.
    pub stats: CxStats,
}

impl IpCx {
    /// Queue a message for send, bumping its user count.
    pub fn enqueue(&mut self, msg: SharedMessage) {
        self.send_queue.push_back(msg);
        self.stats.nqueued = self.send_queue.len() as u64;
    }

    /// Take the next queued message.
    pub fn dequeue(&mut self) -> Option<SharedMessage> {
        let msg = self.send_queue.pop_front();
        self.stats.nqueued = self.send_queue.len() as u64;
        msg
    }
}

// ============================================================================
// Table
// ============================================================================

/// Handle arena of connection records.
#[derive(Debug, Default)]
pub struct CxTable {
    // Slot 0 stays empty so handle 0 can mean "none".
    slots: Vec<Option<IpCx>>,
    free: Vec<CxHandle>,
}

impl CxTable {
    /// Empty table.
    pub fn new() -> Self {
        CxTable {
            slots: vec![None],
            free: Vec::new(),
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// True if no live connections.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate a slot and return its handle.
    pub fn alloc(&mut self) -> CxHandle {
        let handle = match self.free.pop() {
            Some(h) => h,
            None => {
                self.slots.push(None);
                (self.slots.len() - 1) as CxHandle
            }
        };
        let mut cx = IpCx {
            handle,
            ..Default::default()
        };
        cx.cx_state = CxState::Closed;
        self.slots[handle as usize] = Some(cx);
        handle
    }

    /// Borrow a record.
    pub fn get(&self, handle: CxHandle) -> Option<&IpCx> {
        if handle == 0 {
            return None;
        }
        self.slots.get(handle as usize)?.as_ref()
    }

    /// Borrow a record mutably.
    pub fn get_mut(&mut self, handle: CxHandle) -> Option<&mut IpCx> {
        if handle == 0 {
            return None;
        }
        self.slots.get_mut(handle as usize)?.as_mut()
    }

    /// Pair two records on a shared fd; `owner` keeps fd ownership.
    pub fn pair(&mut self, owner: CxHandle, other: CxHandle) -> bool {
        let Some(fd) = self.get(owner).map(|c| c.fd) else {
            return false;
        };
        let Some(o) = self.get_mut(other) else {
            return false;
        };
        o.paired = owner;
        o.fd = fd;
        o.fd_owner = false;
        if let Some(c) = self.get_mut(owner) {
            c.paired = other;
            c.fd_owner = true;
        }
        true
    }

    /// Detach a record from its paired peer.
    ///
    /// If the departing record owned the shared fd, ownership and any
    /// secure-session context migrate to the survivor; the caller must not
    /// close the fd. Returns the survivor's handle when migration happened.
    pub fn unpair(&mut self, handle: CxHandle) -> Option<CxHandle> {
        let (peer, was_owner, had_sproto) = {
            let cx = self.get(handle)?;
            (cx.paired, cx.fd_owner, cx.has_sproto)
        };
        if peer == 0 {
            return None;
        }
        if let Some(cx) = self.get_mut(handle) {
            cx.paired = 0;
            if was_owner {
                cx.fd_owner = false;
                cx.has_sproto = false;
            }
        }
        if let Some(p) = self.get_mut(peer) {
            p.paired = 0;
            if was_owner {
                p.fd_owner = true;
                if had_sproto {
                    p.has_sproto = true;
                }
                return Some(peer);
            }
        }
        None
    }

    /// Free a record, cleaning up every outgoing reference: the pending
    /// queue is drained, the parent's child list is fixed up, children are
    /// orphaned, and a paired peer inherits the fd.
    ///
    /// Returns the freed record so the caller can close the fd (when still
    /// owned) and release the locator.
    pub fn free(&mut self, handle: CxHandle) -> Option<IpCx> {
        self.unpair(handle);

        let cx = self.slots.get_mut(handle as usize)?.take()?;

        if cx.parent != 0 {
            if let Some(parent) = self.get_mut(cx.parent) {
                parent.children.retain(|&c| c != handle);
            }
        }
        for &child in &cx.children {
            if let Some(c) = self.get_mut(child) {
                c.parent = 0;
            }
        }
        self.free.push(handle);
        Some(cx)
    }

    /// Attach `child` under `parent`.
    pub fn attach_child(&mut self, parent: CxHandle, child: CxHandle) -> bool {
        if self.get(parent).is_none() {
            return false;
        }
        let Some(c) = self.get_mut(child) else {
            return false;
        };
        c.parent = parent;
        if let Some(p) = self.get_mut(parent) {
            if !p.children.contains(&child) {
                p.children.push(child);
            }
        }
        true
    }

    /// Handles of all live records.
    pub fn handles(&self) -> Vec<CxHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i as CxHandle))
            .collect()
    }

    /// Find the connection serving a locator address.
    pub fn find_by_locator(&self, loc: &Locator) -> Option<CxHandle> {
        self.slots.iter().flatten().find_map(|cx| {
            cx.locator
                .as_ref()
                .filter(|l| l.addr_eq(loc))
                .map(|_| cx.handle)
        })
    }

    /// Find a connection by destination address and port.
    pub fn find_by_dest(&self, addr: &[u8; 16], port: u32) -> Option<CxHandle> {
        self.slots
            .iter()
            .flatten()
            .find(|cx| cx.dst_addr == *addr && cx.dst_port == port)
            .map(|cx| cx.handle)
    }
}

// ============================================================================
// Tests
// ============================================================================
