// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP transport.
//!
//! One bound socket per served locator, registered with the shared poll
//! loop; multicast locators join their group on bind. Outbound traffic
//! leaves through a per-family send socket on an ephemeral port so that
//! served ports never double as send sources.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use mio::{Interest, Token};
use socket2::{Domain, Protocol, Socket, Type};

use crate::cx::CxStats;
use crate::locator::{Locator, LocatorKey, LocatorKind, LOCATOR_KINDS_UDP};
use crate::message::{build_message, DataBuf, SharedMessage};
use crate::mux::{Transport, TransportParams};
use crate::poller::Registrar;

/// Receive buffer size per datagram.
const RECV_BUF: usize = 64 * 1024;

/// One served UDP locator.
#[derive(Debug)]
struct UdpChannel {
    socket: mio::net::UdpSocket,
    locator: Locator,
    id: u32,
    stats: CxStats,
}

/// A datagram handed up to the parser.
#[derive(Debug)]
pub struct UdpDatagram {
    /// Packet bytes, shared so large payloads stay zero-copy.
    pub data: DataBuf,
    /// Sender address.
    pub source: SocketAddr,
    /// Locator the datagram arrived on.
    pub locator: Locator,
}

/// The UDP transport.
pub struct UdpTransport {
    params: TransportParams,
    registrar: Option<Registrar>,
    channels: HashMap<Token, UdpChannel>,
    by_key: HashMap<LocatorKey, Token>,
    send4: Option<UdpSocket>,
    send6: Option<UdpSocket>,
}

impl UdpTransport {
    /// Transport registered with the poll loop; pass `None` for a
    /// send-only instance.
    pub fn new(registrar: Option<Registrar>) -> Self {
        UdpTransport {
            params: TransportParams::default(),
            registrar,
            channels: HashMap::new(),
            by_key: HashMap::new(),
            send4: None,
            send6: None,
        }
    }

    fn bind_socket(loc: &Locator) -> io::Result<UdpSocket> {
        let Some(sa) = loc.to_socket_addr() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "locator is not addressable",
            ));
        };
        let domain = if sa.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;

        if loc.is_multicast() {
            // Bind the wildcard on the group port, then join the group.
            let wildcard: SocketAddr = if sa.is_ipv4() {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), sa.port())
            } else {
                SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), sa.port())
            };
            socket.bind(&wildcard.into())?;
            match sa.ip() {
                IpAddr::V4(group) => {
                    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
                    socket.set_multicast_loop_v4(true)?;
                }
                IpAddr::V6(group) => {
                    socket.join_multicast_v6(&group, 0)?;
                    socket.set_multicast_loop_v6(true)?;
                }
            }
        } else {
            socket.bind(&sa.into())?;
        }
        Ok(socket.into())
    }

    fn send_socket(&mut self, ipv4: bool) -> io::Result<&UdpSocket> {
        let slot = if ipv4 { &mut self.send4 } else { &mut self.send6 };
        if slot.is_none() {
            let bind: SocketAddr = if ipv4 { "0.0.0.0:0" } else { "[::]:0" }
                .parse()
                .expect("literal address");
            let socket = UdpSocket::bind(bind)?;
            socket.set_nonblocking(true)?;
            *slot = Some(socket);
        }
        Ok(slot.as_ref().expect("just created"))
    }

    /// Locator served by a poll token, if it is ours.
    pub fn locator_of(&self, token: Token) -> Option<Locator> {
        self.channels.get(&token).map(|c| c.locator.clone())
    }

    /// Drain every pending datagram on a readable channel.
    pub fn recv_ready(&mut self, token: Token) -> Vec<UdpDatagram> {
        let Some(ch) = self.channels.get_mut(&token) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut buf = vec![0u8; RECV_BUF];
        loop {
            match ch.socket.recv_from(&mut buf) {
                Ok((0, _)) => {
                    ch.stats.empty_read += 1;
                }
                Ok((n, source)) => {
                    ch.stats.packets_rcvd += 1;
                    ch.stats.octets_rcvd += n as u64;
                    out.push(UdpDatagram {
                        data: DataBuf::new(buf[..n].to_vec()),
                        source,
                        locator: ch.locator.clone(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    ch.stats.read_err += 1;
                    log::debug!("[UDP] recv on {}: {}", ch.locator, e);
                    break;
                }
            }
        }
        out
    }

    /// Statistics of a served locator.
    pub fn channel_stats(&self, loc: &Locator) -> Option<CxStats> {
        let token = self.by_key.get(&loc.key())?;
        self.channels.get(token).map(|c| c.stats)
    }

    /// Served locator count.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Transport for UdpTransport {
    fn kinds(&self) -> LocatorKind {
        LOCATOR_KINDS_UDP
    }

    fn send(&mut self, dest: &Locator, msgs: &[SharedMessage]) -> io::Result<()> {
        if self.params.suspended || !self.params.enabled {
            return Ok(());
        }
        let Some(sa) = dest.to_socket_addr() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "destination is not addressable",
            ));
        };
        let max = self.params.max_message_size;
        let socket = self.send_socket(sa.is_ipv4())?;
        for msg in msgs {
            let wire = build_message(msg);
            if wire.len() > max {
                log::debug!("[UDP] dropping {} B message for {}", wire.len(), dest);
                continue;
            }
            match socket.send_to(&wire, sa) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Datagram sockets shed load; drop and move on.
                    log::trace!("[UDP] send to {} would block", dest);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn add_locator(
        &mut self,
        _domain_id: u32,
        loc: &Locator,
        id: u32,
        serve: bool,
    ) -> io::Result<()> {
        if !serve {
            return Ok(());
        }
        if self.by_key.contains_key(&loc.key()) {
            return Ok(());
        }
        let socket = Self::bind_socket(loc)?;
        let mut msock = mio::net::UdpSocket::from_std(socket);
        let token = match &self.registrar {
            Some(r) => r.register(&mut msock, Interest::READABLE)?,
            None => Token(usize::MAX - self.channels.len()),
        };
        log::debug!("[UDP] bound {} (id {})", loc, id);
        self.by_key.insert(loc.key(), token);
        self.channels.insert(
            token,
            UdpChannel {
                socket: msock,
                locator: loc.clone(),
                id,
                stats: CxStats::default(),
            },
        );
        Ok(())
    }

    fn remove_locator(&mut self, id: u32, loc: &Locator) {
        let Some(token) = self.by_key.remove(&loc.key()) else {
            return;
        };
        if let Some(mut ch) = self.channels.remove(&token) {
            if ch.id == id || id == 0 {
                if let Some(r) = &self.registrar {
                    let _ = r.deregister(&mut ch.socket);
                }
                log::debug!("[UDP] released {} (id {})", loc, id);
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

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("channels", &self.channels.len())
            .field("suspended", &self.params.suspended)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
