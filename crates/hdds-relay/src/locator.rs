// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Locators: destination descriptors for RTPS traffic.
//!
//! A locator names a transport endpoint as `(kind, address, port)` plus usage
//! flags. Kinds are bit-combinable so that kind *masks* can express families
//! ("any UDP", "any IPv6") in suppression and filtering logic.
//!
//! The `handle` field, when non-zero, identifies the connection that
//! currently serves this locator in the connection table; sends to a handled
//! locator bypass destination derivation.

use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

// ============================================================================
// Locator kinds
// ============================================================================

/// Locator kind bitfield. A concrete locator carries exactly one bit; masks
/// combine several.
pub type LocatorKind = u32;

/// UDP over IPv4.
pub const LOCATOR_KIND_UDPV4: LocatorKind = 1;
/// UDP over IPv6.
pub const LOCATOR_KIND_UDPV6: LocatorKind = 2;
/// TCP over IPv4.
pub const LOCATOR_KIND_TCPV4: LocatorKind = 4;
/// TCP over IPv6.
pub const LOCATOR_KIND_TCPV6: LocatorKind = 8;

/// Any UDP kind.
pub const LOCATOR_KINDS_UDP: LocatorKind = LOCATOR_KIND_UDPV4 | LOCATOR_KIND_UDPV6;
/// Any TCP kind.
pub const LOCATOR_KINDS_TCP: LocatorKind = LOCATOR_KIND_TCPV4 | LOCATOR_KIND_TCPV6;
/// Any IPv4 kind.
pub const LOCATOR_KINDS_IPV4: LocatorKind = LOCATOR_KIND_UDPV4 | LOCATOR_KIND_TCPV4;
/// Any IPv6 kind.
pub const LOCATOR_KINDS_IPV6: LocatorKind = LOCATOR_KIND_UDPV6 | LOCATOR_KIND_TCPV6;
/// All kinds.
pub const LOCATOR_KINDS_ALL: LocatorKind = LOCATOR_KINDS_UDP | LOCATOR_KINDS_TCP;

// ============================================================================
// Locator flags
// ============================================================================

/// Meta (discovery/reliability) traffic.
pub const LOCF_META: u32 = 0x01;
/// User (application) traffic.
pub const LOCF_DATA: u32 = 0x02;
/// Unicast destination.
pub const LOCF_UCAST: u32 = 0x04;
/// Multicast destination.
pub const LOCF_MCAST: u32 = 0x08;
/// Secure overlay required.
pub const LOCF_SECURE: u32 = 0x10;
/// Locator names a server (listen) endpoint.
pub const LOCF_SERVER: u32 = 0x20;
/// This node is pinned as client for reconnects to this locator.
pub const LOCF_FCLIENT: u32 = 0x40;

// ============================================================================
// Secure overlay selector
// ============================================================================

/// No secure overlay: cleartext.
pub const SPROTO_NONE: u8 = 0;
/// DTLS over UDP.
pub const SPROTO_DTLS: u8 = 1;
/// TLS over TCP.
pub const SPROTO_TLS: u8 = 2;

/// Address scope, ordered from most to least local.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    /// Scope not determined.
    #[default]
    Unknown,
    /// Loopback.
    Node,
    /// Link-local.
    Link,
    /// Site-local / private ranges.
    Site,
    /// Organisation-local.
    Org,
    /// Globally routable.
    Global,
}

impl Scope {
    /// Classify an IP address.
    pub fn of_addr(addr: &IpAddr) -> Scope {
        match addr {
            IpAddr::V4(v4) => {
                if v4.is_loopback() {
                    Scope::Node
                } else if v4.is_link_local() {
                    Scope::Link
                } else if v4.is_private() {
                    Scope::Site
                } else {
                    Scope::Global
                }
            }
            IpAddr::V6(v6) => {
                if v6.is_loopback() {
                    Scope::Node
                } else if (v6.segments()[0] & 0xffc0) == 0xfe80 {
                    Scope::Link
                } else if (v6.segments()[0] & 0xfe00) == 0xfc00 {
                    Scope::Site
                } else {
                    Scope::Global
                }
            }
        }
    }
}

// ============================================================================
// Locator
// ============================================================================

/// Size of a locator on the wire (kind + port + address).
pub const MSG_LOCATOR_SIZE: usize = 24;

/// A destination descriptor: transport kind, 16-octet address, port, usage
/// flags, and an optional secure-overlay selector.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    /// Transport kind (exactly one `LOCATOR_KIND_*` bit).
    pub kind: LocatorKind,
    /// `LOCF_*` usage flags.
    pub flags: u32,
    /// 16-octet address; IPv4 is mapped into the last 4 octets.
    pub address: [u8; 16],
    /// Port number.
    pub port: u32,
    /// Address scope.
    pub scope: Scope,
    /// Secure overlay (`SPROTO_*`), 0 for cleartext.
    pub sproto: u8,
    /// Handle of the connection serving this locator, 0 if none.
    pub handle: u32,
}

impl Locator {
    /// Create a locator with no flags, scope or handle.
    pub fn new(kind: LocatorKind, address: [u8; 16], port: u32) -> Self {
        Locator {
            kind,
            flags: 0,
            address,
            port,
            scope: Scope::Unknown,
            sproto: SPROTO_NONE,
            handle: 0,
        }
    }

    /// Create a locator from a socket address and a kind family.
    ///
    /// `tcp` selects the TCP kinds; the IP version picks v4 vs v6.
    pub fn from_socket_addr(addr: &SocketAddr, tcp: bool) -> Self {
        let (kind, address) = match addr.ip() {
            IpAddr::V4(v4) => {
                let kind = if tcp { LOCATOR_KIND_TCPV4 } else { LOCATOR_KIND_UDPV4 };
                let mut a = [0u8; 16];
                a[12..16].copy_from_slice(&v4.octets());
                (kind, a)
            }
            IpAddr::V6(v6) => {
                let kind = if tcp { LOCATOR_KIND_TCPV6 } else { LOCATOR_KIND_UDPV6 };
                (kind, v6.octets())
            }
        };
        let mut loc = Locator::new(kind, address, u32::from(addr.port()));
        loc.scope = Scope::of_addr(&addr.ip());
        loc
    }

    /// Convert to a socket address, if the kind is address-shaped.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        let ip = if (self.kind & LOCATOR_KINDS_IPV4) != 0 {
            let mut o = [0u8; 4];
            o.copy_from_slice(&self.address[12..16]);
            IpAddr::V4(Ipv4Addr::from(o))
        } else if (self.kind & LOCATOR_KINDS_IPV6) != 0 {
            IpAddr::V6(Ipv6Addr::from(self.address))
        } else {
            return None;
        };
        Some(SocketAddr::new(ip, self.port as u16))
    }

    /// True if this is a multicast address for its family.
    pub fn is_multicast(&self) -> bool {
        if (self.kind & LOCATOR_KINDS_IPV4) != 0 {
            self.address[12] >= 224 && self.address[12] <= 239
        } else if (self.kind & LOCATOR_KINDS_IPV6) != 0 {
            self.address[0] == 0xff
        } else {
            false
        }
    }

    /// Address-level equality: kind, address and port. Flags, scope and
    /// handle are serving-state, not identity.
    pub fn addr_eq(&self, other: &Locator) -> bool {
        self.kind == other.kind && self.address == other.address && self.port == other.port
    }

    /// Identity key for maps.
    pub fn key(&self) -> LocatorKey {
        LocatorKey {
            kind: self.kind,
            address: self.address,
            port: self.port,
        }
    }

    /// Total order over `(address, port)` used for deterministic DTLS role
    /// election: the side whose smallest own locator sorts first becomes
    /// server.
    pub fn cmp_addr(&self, other: &Locator) -> Ordering {
        self.address
            .cmp(&other.address)
            .then(self.port.cmp(&other.port))
    }

    /// True if the kind is a UDP kind.
    pub fn is_udp(&self) -> bool {
        (self.kind & LOCATOR_KINDS_UDP) != 0
    }

    /// True if the kind is a TCP kind.
    pub fn is_tcp(&self) -> bool {
        (self.kind & LOCATOR_KINDS_TCP) != 0
    }
}

/// Map key identifying a locator by address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocatorKey {
    /// Transport kind.
    pub kind: LocatorKind,
    /// 16-octet address.
    pub address: [u8; 16],
    /// Port.
    pub port: u32,
}

fn kind_str(kind: LocatorKind) -> &'static str {
    match kind {
        LOCATOR_KIND_UDPV4 => "UDPv4",
        LOCATOR_KIND_UDPV6 => "UDPv6",
        LOCATOR_KIND_TCPV4 => "TCPv4",
        LOCATOR_KIND_TCPV6 => "TCPv6",
        _ => "?",
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_socket_addr() {
            Some(sa) => write!(f, "{}:{}", kind_str(self.kind), sa),
            None => write!(f, "{}:?:{}", kind_str(self.kind), self.port),
        }
    }
}

impl fmt::Debug for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)?;
        if self.handle != 0 {
            write!(f, "#{}", self.handle)?;
        }
        Ok(())
    }
}

// ============================================================================
// Locator lists
// ============================================================================

/// An ordered list of locators with address-level dedup.
pub type LocatorList = Vec<Locator>;

/// Append `loc` unless an address-equal locator is already present.
pub fn list_add_unique(list: &mut LocatorList, loc: Locator) -> bool {
    if list.iter().any(|l| l.addr_eq(&loc)) {
        return false;
    }
    list.push(loc);
    true
}

/// Copy locators from `src` into `dst`, skipping the source handle and any
/// kind in the suppression mask.
pub fn list_add_filtered(
    dst: &mut LocatorList,
    src: &[Locator],
    handle: u32,
    suppress_kind: LocatorKind,
) {
    for loc in src {
        if handle != 0 && loc.handle == handle {
            continue;
        }
        if suppress_kind != 0 && (loc.kind & suppress_kind) != 0 {
            continue;
        }
        list_add_unique(dst, loc.clone());
    }
}

/// Copy locators matching a kind mask, optionally excluding TCP for
/// multicast slots (TCP has no multicast).
pub fn list_add_kinds(
    dst: &mut LocatorList,
    src: &[Locator],
    kinds: LocatorKind,
    mcast: bool,
    seen_kinds: &mut LocatorKind,
) {
    for loc in src {
        if (loc.kind & kinds) == 0 {
            continue;
        }
        if mcast && loc.is_tcp() {
            continue;
        }
        *seen_kinds |= loc.kind;
        list_add_unique(dst, loc.clone());
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn udp4(a: [u8; 4], port: u32) -> Locator {
        let mut address = [0u8; 16];
        address[12..16].copy_from_slice(&a);
        Locator::new(LOCATOR_KIND_UDPV4, address, port)
    }

    #[test]
    fn test_socket_addr_roundtrip_v4() {
        let sa: SocketAddr = "192.168.1.10:7400".parse().unwrap();
        let loc = Locator::from_socket_addr(&sa, false);
        assert_eq!(loc.kind, LOCATOR_KIND_UDPV4);
        assert_eq!(loc.to_socket_addr(), Some(sa));
        assert_eq!(loc.scope, Scope::Site);
    }

    #[test]
    fn test_socket_addr_roundtrip_v6() {
        let sa: SocketAddr = "[fe80::1]:7410".parse().unwrap();
        let loc = Locator::from_socket_addr(&sa, true);
        assert_eq!(loc.kind, LOCATOR_KIND_TCPV6);
        assert_eq!(loc.to_socket_addr(), Some(sa));
        assert_eq!(loc.scope, Scope::Link);
    }

    #[test]
    fn test_multicast_detection() {
        assert!(udp4([239, 255, 0, 1], 7400).is_multicast());
        assert!(!udp4([192, 168, 0, 1], 7400).is_multicast());

        let sa: SocketAddr = "[ff02::1]:7400".parse().unwrap();
        assert!(Locator::from_socket_addr(&sa, false).is_multicast());
    }

    #[test]
    fn test_addr_eq_ignores_serving_state() {
        let mut a = udp4([10, 0, 0, 1], 7410);
        let mut b = udp4([10, 0, 0, 1], 7410);
        a.handle = 3;
        b.flags = LOCF_META | LOCF_UCAST;
        assert!(a.addr_eq(&b));
        assert!(!a.addr_eq(&udp4([10, 0, 0, 1], 7411)));
    }

    #[test]
    fn test_cmp_addr_ordering() {
        let a = udp4([10, 0, 0, 1], 7410);
        let b = udp4([10, 0, 0, 2], 7400);
        let c = udp4([10, 0, 0, 1], 7411);

        assert_eq!(a.cmp_addr(&b), Ordering::Less);
        assert_eq!(a.cmp_addr(&c), Ordering::Less);
        assert_eq!(b.cmp_addr(&a), Ordering::Greater);
        assert_eq!(a.cmp_addr(&a.clone()), Ordering::Equal);
    }

    #[test]
    fn test_list_add_unique() {
        let mut list = LocatorList::new();
        assert!(list_add_unique(&mut list, udp4([1, 2, 3, 4], 1)));
        assert!(!list_add_unique(&mut list, udp4([1, 2, 3, 4], 1)));
        assert!(list_add_unique(&mut list, udp4([1, 2, 3, 4], 2)));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_list_add_filtered_suppresses_handle_and_kind() {
        let mut src = vec![udp4([1, 1, 1, 1], 1), udp4([2, 2, 2, 2], 2)];
        src[0].handle = 7;
        let mut tcp = Locator::from_socket_addr(&"10.0.0.9:7500".parse().unwrap(), true);
        tcp.handle = 9;
        src.push(tcp);

        let mut dst = LocatorList::new();
        list_add_filtered(&mut dst, &src, 7, LOCATOR_KINDS_TCP);
        assert_eq!(dst.len(), 1);
        assert_eq!(dst[0].port, 2);
    }

    #[test]
    fn test_list_add_kinds_excludes_tcp_multicast() {
        let tcp = Locator::from_socket_addr(&"10.0.0.9:7500".parse().unwrap(), true);
        let udp = udp4([239, 255, 0, 1], 7400);
        let src = vec![tcp, udp];

        let mut dst = LocatorList::new();
        let mut kinds = 0;
        list_add_kinds(&mut dst, &src, LOCATOR_KINDS_ALL, true, &mut kinds);
        assert_eq!(dst.len(), 1);
        assert_eq!(kinds, LOCATOR_KIND_UDPV4);
    }

    #[test]
    fn test_scope_classification() {
        assert_eq!(Scope::of_addr(&"127.0.0.1".parse().unwrap()), Scope::Node);
        assert_eq!(Scope::of_addr(&"169.254.3.4".parse().unwrap()), Scope::Link);
        assert_eq!(Scope::of_addr(&"10.1.2.3".parse().unwrap()), Scope::Site);
        assert_eq!(Scope::of_addr(&"8.8.8.8".parse().unwrap()), Scope::Global);
        assert!(Scope::Node < Scope::Global);
    }
}
