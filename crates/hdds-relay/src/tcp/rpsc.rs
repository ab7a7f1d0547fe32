// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RPSC control-plane framing.
//!
//! Control messages on TCP bridge channels are framed as a fixed 24-octet
//! header followed by a TLV parameter block terminated by a sentinel:
//!
//! ```text
//! +------+-----+--------+-------------+------+--------+------------+
//! | RPSC | ver | vendor | transaction | kind | length | parameters |
//! | (4B) | (1) | (3B)   | (12B)       | (2B) | (2B)   |            |
//! +------+-----+--------+-------------+------+--------+------------+
//! ```
//!
//! All multi-octet integers are host-endian; RPSC does no byte-order
//! negotiation. Each message kind accepts a fixed parameter subset; a
//! parameter outside the subset, or an unknown non-vendor parameter id,
//! fails the message with `bad request`. Vendor-range ids (>= 0x8000) are
//! skipped.

use std::fmt;

use crate::guid::GuidPrefix;

/// RPSC protocol magic.
pub const RPSC_MAGIC: [u8; 4] = *b"RPSC";

/// Protocol version.
pub const RPSC_VERSION: u8 = 0x10;

/// Control header size.
pub const CTRL_HEADER_SIZE: usize = 24;

/// Maximum cookie length carried in a Cookie parameter.
pub const MAX_COOKIE: usize = 16;

/// 12-octet transaction id.
pub type TransactionId = [u8; 12];

// ============================================================================
// Message kinds
// ============================================================================

/// Request direction nibble.
pub const DIR_REQUEST: u16 = 0x0c;
/// Success-reply direction nibble.
pub const DIR_SUCCESS: u16 = 0x0d;
/// Fail-reply direction nibble.
pub const DIR_FAIL: u16 = 0x0e;

/// Control message kinds: `(direction << 8) | op`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum CtrlMsgKind {
    /// Identify a control channel.
    IdBindRequest = (DIR_REQUEST << 8) | 1,
    /// IdentityBind accepted.
    IdBindSuccess = (DIR_SUCCESS << 8) | 1,
    /// IdentityBind rejected.
    IdBindFail = (DIR_FAIL << 8) | 1,
    /// Ask the server to open a logical port.
    SLPortRequest = (DIR_REQUEST << 8) | 2,
    /// Server logical port granted.
    SLPortSuccess = (DIR_SUCCESS << 8) | 2,
    /// Server logical port refused.
    SLPortFail = (DIR_FAIL << 8) | 2,
    /// Ask the client to open a reverse data channel.
    CLPortRequest = (DIR_REQUEST << 8) | 3,
    /// Client logical port granted.
    CLPortSuccess = (DIR_SUCCESS << 8) | 3,
    /// Client logical port refused.
    CLPortFail = (DIR_FAIL << 8) | 3,
    /// Bind a data connection to a negotiated cookie.
    CxBindRequest = (DIR_REQUEST << 8) | 4,
    /// Connection bind accepted.
    CxBindSuccess = (DIR_SUCCESS << 8) | 4,
    /// Connection bind rejected.
    CxBindFail = (DIR_FAIL << 8) | 4,
    /// Orderly channel shutdown.
    Finalize = (DIR_REQUEST << 8) | 15,
}

impl CtrlMsgKind {
    /// Decode a wire kind.
    pub fn from_u16(v: u16) -> Option<CtrlMsgKind> {
        use CtrlMsgKind::*;
        Some(match v {
            x if x == IdBindRequest as u16 => IdBindRequest,
            x if x == IdBindSuccess as u16 => IdBindSuccess,
            x if x == IdBindFail as u16 => IdBindFail,
            x if x == SLPortRequest as u16 => SLPortRequest,
            x if x == SLPortSuccess as u16 => SLPortSuccess,
            x if x == SLPortFail as u16 => SLPortFail,
            x if x == CLPortRequest as u16 => CLPortRequest,
            x if x == CLPortSuccess as u16 => CLPortSuccess,
            x if x == CLPortFail as u16 => CLPortFail,
            x if x == CxBindRequest as u16 => CxBindRequest,
            x if x == CxBindSuccess as u16 => CxBindSuccess,
            x if x == CxBindFail as u16 => CxBindFail,
            x if x == Finalize as u16 => Finalize,
            _ => return None,
        })
    }
}

// ============================================================================
// Parameter ids
// ============================================================================

/// Error code.
pub const CAID_ERROR: u16 = 0x0009;
/// Unknown-attribute echo.
pub const CAID_UNKN_ATTR: u16 = 0x000a;
/// 128-bit locator address.
pub const CAID_LOCATOR: u16 = 0x3d01;
/// 32-bit logical port.
pub const CAID_LOC_PORT: u16 = 0x3d02;
/// Opaque connection cookie.
pub const CAID_CX_COOKIE: u16 = 0x3d04;
/// Port options bitfield.
pub const CAID_PORT_OPTIONS: u16 = 0x3d05;
/// Connection sharing accepted.
pub const CAID_ALLOW_SHARED: u16 = 0x3d06;
/// Endpoint can forward.
pub const CAID_FORWARD: u16 = 0x3d07;
/// GUID prefix.
pub const CAID_GUID_PREFIX: u16 = 0x3d08;
/// Parameter-block sentinel.
pub const CAID_SENTINEL: u16 = 0x0001;
/// Start of the vendor-specific id range (ignored on receive).
pub const CAID_VENDOR_MIN: u16 = 0x8000;

// Port options bits.
/// Carries user data.
pub const PO_DATA: u8 = 0x01;
/// Carries meta data.
pub const PO_META: u8 = 0x02;
/// Unicast traffic.
pub const PO_UCAST: u8 = 0x04;
/// Multicast traffic.
pub const PO_MCAST: u8 = 0x08;
/// Share with the reverse connection.
pub const PO_SHARE: u8 = 0x80;

// Error codes carried in the Error parameter.
/// Malformed request.
pub const CERR_BAD_REQUEST: u32 = 400;
/// Unknown attribute.
pub const CERR_UNKN_ATTR: u32 = 405;
/// Invalid port allocation.
pub const CERR_ALLOC_MISMATCH: u32 = 406;
/// Out of resources.
pub const CERR_OO_RESOURCES: u32 = 407;
/// Unsupported transport in an IdentityBind.
pub const CERR_UNSUPP_TRANSPORT: u32 = 415;
/// Connection already exists.
pub const CERR_EXISTS: u32 = 446;
/// Server error, try again later.
pub const CERR_SERVER_ERROR: u32 = 503;

fn pid_bit(id: u16) -> u32 {
    1u32 << (id & 0xff)
}

/// Allowed parameter subset for a message kind.
fn allowed_pids(kind: CtrlMsgKind) -> u32 {
    use CtrlMsgKind::*;
    match kind {
        IdBindRequest | IdBindSuccess => {
            pid_bit(CAID_LOCATOR) | pid_bit(CAID_FORWARD) | pid_bit(CAID_GUID_PREFIX)
        }
        SLPortRequest => pid_bit(CAID_LOC_PORT) | pid_bit(CAID_PORT_OPTIONS),
        SLPortSuccess => {
            pid_bit(CAID_CX_COOKIE) | pid_bit(CAID_ALLOW_SHARED) | pid_bit(CAID_GUID_PREFIX)
        }
        CLPortRequest => {
            pid_bit(CAID_LOC_PORT) | pid_bit(CAID_CX_COOKIE) | pid_bit(CAID_PORT_OPTIONS)
        }
        CLPortSuccess => pid_bit(CAID_ALLOW_SHARED) | pid_bit(CAID_GUID_PREFIX),
        CxBindRequest => pid_bit(CAID_CX_COOKIE),
        CxBindSuccess | Finalize => 0,
        IdBindFail | SLPortFail | CLPortFail | CxBindFail => {
            pid_bit(CAID_ERROR) | pid_bit(CAID_UNKN_ATTR)
        }
    }
}

// ============================================================================
// Parse
// ============================================================================

/// Control-message parse failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpscError {
    /// Not an RPSC frame and not RTPS either.
    InvalidMessage,
    /// Known magic but vendor-specific kind.
    VendorKind,
    /// Unknown message kind.
    UnknownKind,
    /// A length field is inconsistent.
    InvalidLength,
    /// Unknown or disallowed parameter id.
    InvalidParameter(u16),
}

impl fmt::Display for RpscError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpscError::InvalidMessage => write!(f, "invalid control message"),
            RpscError::VendorKind => write!(f, "vendor-specific message kind"),
            RpscError::UnknownKind => write!(f, "unknown message kind"),
            RpscError::InvalidLength => write!(f, "invalid length"),
            RpscError::InvalidParameter(id) => write!(f, "invalid parameter 0x{:04x}", id),
        }
    }
}

impl std::error::Error for RpscError {}

/// Parsed control message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CtrlInfo {
    /// Message kind.
    pub kind: Option<CtrlMsgKind>,
    /// Transaction id, echoed in replies.
    pub transaction: TransactionId,
    /// Bitmask of seen parameter ids.
    pub pids: u32,
    /// Error parameter.
    pub error_kind: u32,
    /// Port options parameter.
    pub port_options: u8,
    /// AllowShared parameter.
    pub shared: bool,
    /// Forward parameter.
    pub forward: u32,
    /// LogicalPort parameter.
    pub port: u32,
    /// Locator parameter.
    pub address: [u8; 16],
    /// Cookie parameter.
    pub cookie: Option<Vec<u8>>,
    /// GuidPrefix parameter.
    pub prefix: Option<GuidPrefix>,
}

impl CtrlInfo {
    /// True if a parameter was present.
    pub fn has(&self, id: u16) -> bool {
        (self.pids & pid_bit(id)) != 0
    }
}

fn u16_at(buf: &[u8], ofs: usize) -> u16 {
    u16::from_ne_bytes([buf[ofs], buf[ofs + 1]])
}

fn u32_at(buf: &[u8], ofs: usize) -> u32 {
    u32::from_ne_bytes([buf[ofs], buf[ofs + 1], buf[ofs + 2], buf[ofs + 3]])
}

/// Parse one complete control frame.
///
/// The caller has already consumed the stream framing; `buf` starts at the
/// RPSC magic and contains exactly one message.
pub fn parse_ctrl(buf: &[u8]) -> Result<CtrlInfo, RpscError> {
    if buf.len() < CTRL_HEADER_SIZE || buf[0..4] != RPSC_MAGIC || buf[4] != RPSC_VERSION {
        return Err(RpscError::InvalidMessage);
    }
    let raw_kind = u16_at(buf, 20);
    let total_len = u16_at(buf, 22) as usize;
    if CTRL_HEADER_SIZE + total_len > buf.len() {
        return Err(RpscError::InvalidLength);
    }
    if (raw_kind & 0x8000) != 0 {
        return Err(RpscError::VendorKind);
    }
    let Some(kind) = CtrlMsgKind::from_u16(raw_kind) else {
        return Err(RpscError::UnknownKind);
    };

    let mut info = CtrlInfo {
        kind: Some(kind),
        ..Default::default()
    };
    info.transaction.copy_from_slice(&buf[8..20]);

    let allowed = allowed_pids(kind);
    let mut ofs = CTRL_HEADER_SIZE;
    let end = CTRL_HEADER_SIZE + total_len;
    loop {
        if ofs + 4 > end {
            return Err(RpscError::InvalidLength);
        }
        let pid = u16_at(buf, ofs);
        let plen = u16_at(buf, ofs + 2) as usize;
        ofs += 4;
        if pid == CAID_SENTINEL {
            break;
        }
        if ofs + plen > end {
            return Err(RpscError::InvalidLength);
        }
        let value = &buf[ofs..ofs + plen];
        ofs += plen;

        if pid >= CAID_VENDOR_MIN {
            // Vendor-range parameters are skipped silently.
            continue;
        }
        if (allowed & pid_bit(pid)) == 0 {
            return Err(RpscError::InvalidParameter(pid));
        }
        info.pids |= pid_bit(pid);
        match pid {
            CAID_ERROR => {
                if plen != 4 {
                    return Err(RpscError::InvalidLength);
                }
                info.error_kind = u32_at(value, 0);
            }
            CAID_UNKN_ATTR => {
                if plen != 2 {
                    return Err(RpscError::InvalidLength);
                }
            }
            CAID_LOCATOR => {
                if plen != 16 {
                    return Err(RpscError::InvalidLength);
                }
                info.address.copy_from_slice(value);
            }
            CAID_LOC_PORT => {
                if plen != 4 {
                    return Err(RpscError::InvalidLength);
                }
                info.port = u32_at(value, 0);
            }
            CAID_CX_COOKIE => {
                if plen == 0 || plen > MAX_COOKIE {
                    return Err(RpscError::InvalidLength);
                }
                info.cookie = Some(value.to_vec());
            }
            CAID_PORT_OPTIONS => {
                if plen != 1 {
                    return Err(RpscError::InvalidLength);
                }
                info.port_options = value[0];
            }
            CAID_ALLOW_SHARED => {
                if plen != 1 {
                    return Err(RpscError::InvalidLength);
                }
                info.shared = value[0] != 0;
            }
            CAID_FORWARD => {
                if plen != 4 {
                    return Err(RpscError::InvalidLength);
                }
                info.forward = u32_at(value, 0);
            }
            CAID_GUID_PREFIX => {
                if plen != 12 {
                    return Err(RpscError::InvalidLength);
                }
                info.prefix = GuidPrefix::from_slice(value);
            }
            _ => return Err(RpscError::InvalidParameter(pid)),
        }
    }
    Ok(info)
}

// ============================================================================
// Build
// ============================================================================

/// Incremental control-message builder.
pub struct CtrlBuilder {
    buf: Vec<u8>,
}

impl CtrlBuilder {
    /// Start a message of the given kind and transaction.
    pub fn new(kind: CtrlMsgKind, transaction: &TransactionId) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&RPSC_MAGIC);
        buf.push(RPSC_VERSION);
        buf.extend_from_slice(&[0x01, 0xAA, 0x00]); // vendor id, 3 octets
        buf.extend_from_slice(transaction);
        buf.extend_from_slice(&(kind as u16).to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes()); // patched in finish()
        CtrlBuilder { buf }
    }

    fn param(&mut self, id: u16, value: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(&id.to_ne_bytes());
        self.buf.extend_from_slice(&(value.len() as u16).to_ne_bytes());
        self.buf.extend_from_slice(value);
        self
    }

    /// Locator address parameter.
    pub fn locator(&mut self, address: &[u8; 16]) -> &mut Self {
        self.param(CAID_LOCATOR, address)
    }

    /// Logical-port parameter.
    pub fn logical_port(&mut self, port: u32) -> &mut Self {
        self.param(CAID_LOC_PORT, &port.to_ne_bytes())
    }

    /// Cookie parameter.
    pub fn cookie(&mut self, cookie: &[u8]) -> &mut Self {
        self.param(CAID_CX_COOKIE, cookie)
    }

    /// Port-options parameter.
    pub fn port_options(&mut self, options: u8) -> &mut Self {
        self.param(CAID_PORT_OPTIONS, &[options])
    }

    /// AllowShared parameter.
    pub fn allow_shared(&mut self, shared: bool) -> &mut Self {
        self.param(CAID_ALLOW_SHARED, &[u8::from(shared)])
    }

    /// Forward parameter.
    pub fn forward(&mut self, forward: u32) -> &mut Self {
        self.param(CAID_FORWARD, &forward.to_ne_bytes())
    }

    /// GuidPrefix parameter.
    pub fn guid_prefix(&mut self, prefix: &GuidPrefix) -> &mut Self {
        self.param(CAID_GUID_PREFIX, prefix.as_bytes())
    }

    /// Error parameter.
    pub fn error(&mut self, code: u32) -> &mut Self {
        self.param(CAID_ERROR, &code.to_ne_bytes())
    }

    /// Terminate the parameter block and patch the length field.
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.extend_from_slice(&CAID_SENTINEL.to_ne_bytes());
        self.buf.extend_from_slice(&0u16.to_ne_bytes());
        let plen = (self.buf.len() - CTRL_HEADER_SIZE) as u16;
        self.buf[22..24].copy_from_slice(&plen.to_ne_bytes());
        self.buf
    }
}

/// Allocate a fresh transaction id: process counter mixed with random
/// octets.
pub fn next_transaction(counter: &mut u32) -> TransactionId {
    *counter = counter.wrapping_add(1);
    let mut t = [0u8; 12];
    t[0..4].copy_from_slice(&counter.to_ne_bytes());
    for b in &mut t[4..] {
        *b = fastrand::u8(..);
    }
    t
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const TX: TransactionId = [9u8; 12];

    #[test]
    fn test_kind_encoding() {
        assert_eq!(CtrlMsgKind::IdBindRequest as u16, 0x0c01);
        assert_eq!(CtrlMsgKind::SLPortSuccess as u16, 0x0d02);
        assert_eq!(CtrlMsgKind::CxBindFail as u16, 0x0e04);
        assert_eq!(CtrlMsgKind::Finalize as u16, 0x0c0f);
        assert_eq!(CtrlMsgKind::from_u16(0x0c01), Some(CtrlMsgKind::IdBindRequest));
        assert_eq!(CtrlMsgKind::from_u16(0x0c05), None);
    }

    #[test]
    fn test_idbind_roundtrip() {
        let prefix = GuidPrefix::new([3; 12]);
        let mut b = CtrlBuilder::new(CtrlMsgKind::IdBindRequest, &TX);
        b.locator(&[7u8; 16]).forward(1).guid_prefix(&prefix);
        let frame = b.finish();

        let info = parse_ctrl(&frame).unwrap();
        assert_eq!(info.kind, Some(CtrlMsgKind::IdBindRequest));
        assert_eq!(info.transaction, TX);
        assert_eq!(info.address, [7u8; 16]);
        assert_eq!(info.forward, 1);
        assert_eq!(info.prefix, Some(prefix));
        assert!(info.has(CAID_LOCATOR));
        assert!(info.has(CAID_GUID_PREFIX));
    }

    #[test]
    fn test_parameterless_message_accepted() {
        // Total parameter length 4: a lone sentinel.
        let frame = CtrlBuilder::new(CtrlMsgKind::Finalize, &TX).finish();
        assert_eq!(frame.len(), CTRL_HEADER_SIZE + 4);
        let info = parse_ctrl(&frame).unwrap();
        assert_eq!(info.kind, Some(CtrlMsgKind::Finalize));
        assert_eq!(info.pids, 0);
    }

    #[test]
    fn test_slport_roundtrip() {
        let mut b = CtrlBuilder::new(CtrlMsgKind::SLPortRequest, &TX);
        b.logical_port(7401).port_options(PO_DATA | PO_UCAST | PO_SHARE);
        let info = parse_ctrl(&b.finish()).unwrap();
        assert_eq!(info.port, 7401);
        assert_eq!(info.port_options, PO_DATA | PO_UCAST | PO_SHARE);
    }

    #[test]
    fn test_slport_success_roundtrip() {
        let mut b = CtrlBuilder::new(CtrlMsgKind::SLPortSuccess, &TX);
        b.cookie(&[1, 2, 3, 4]).allow_shared(true).guid_prefix(&GuidPrefix::new([5; 12]));
        let info = parse_ctrl(&b.finish()).unwrap();
        assert_eq!(info.cookie.as_deref(), Some(&[1u8, 2, 3, 4][..]));
        assert!(info.shared);
    }

    #[test]
    fn test_fail_roundtrip() {
        let mut b = CtrlBuilder::new(CtrlMsgKind::SLPortFail, &TX);
        b.error(CERR_OO_RESOURCES);
        let info = parse_ctrl(&b.finish()).unwrap();
        assert_eq!(info.error_kind, CERR_OO_RESOURCES);
    }

    #[test]
    fn test_unknown_parameter_fails() {
        let mut b = CtrlBuilder::new(CtrlMsgKind::CxBindRequest, &TX);
        b.param(0x3d7f, &[0u8; 4]);
        let err = parse_ctrl(&b.finish()).unwrap_err();
        assert_eq!(err, RpscError::InvalidParameter(0x3d7f));
    }

    #[test]
    fn test_disallowed_parameter_fails() {
        // Cookie is not in the IdentityBind subset.
        let mut b = CtrlBuilder::new(CtrlMsgKind::IdBindRequest, &TX);
        b.cookie(&[1, 2, 3]);
        assert!(matches!(
            parse_ctrl(&b.finish()),
            Err(RpscError::InvalidParameter(CAID_CX_COOKIE))
        ));
    }

    #[test]
    fn test_vendor_parameter_skipped() {
        let mut b = CtrlBuilder::new(CtrlMsgKind::CxBindRequest, &TX);
        b.param(0x8042, &[1, 2, 3, 4]).cookie(&[5, 6]);
        let info = parse_ctrl(&b.finish()).unwrap();
        assert_eq!(info.cookie.as_deref(), Some(&[5u8, 6][..]));
    }

    #[test]
    fn test_vendor_kind_rejected() {
        let mut frame = CtrlBuilder::new(CtrlMsgKind::Finalize, &TX).finish();
        frame[20..22].copy_from_slice(&0x8c01u16.to_ne_bytes());
        assert_eq!(parse_ctrl(&frame), Err(RpscError::VendorKind));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut frame = CtrlBuilder::new(CtrlMsgKind::Finalize, &TX).finish();
        frame[20..22].copy_from_slice(&0x0c07u16.to_ne_bytes());
        assert_eq!(parse_ctrl(&frame), Err(RpscError::UnknownKind));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut frame = CtrlBuilder::new(CtrlMsgKind::Finalize, &TX).finish();
        frame[0] = b'X';
        assert_eq!(parse_ctrl(&frame), Err(RpscError::InvalidMessage));
    }

    #[test]
    fn test_truncated_parameter_rejected() {
        let mut b = CtrlBuilder::new(CtrlMsgKind::CxBindRequest, &TX);
        b.cookie(&[1, 2, 3, 4]);
        let mut frame = b.finish();
        // Claim a longer parameter block than present.
        let plen = (frame.len() - CTRL_HEADER_SIZE + 8) as u16;
        frame[22..24].copy_from_slice(&plen.to_ne_bytes());
        assert_eq!(parse_ctrl(&frame), Err(RpscError::InvalidLength));
    }

    #[test]
    fn test_oversized_cookie_rejected() {
        let mut b = CtrlBuilder::new(CtrlMsgKind::CxBindRequest, &TX);
        b.param(CAID_CX_COOKIE, &[0u8; MAX_COOKIE + 1]);
        assert_eq!(parse_ctrl(&b.finish()), Err(RpscError::InvalidLength));
    }

    #[test]
    fn test_transaction_ids_distinct() {
        let mut counter = 0;
        let a = next_transaction(&mut counter);
        let b = next_transaction(&mut counter);
        assert_ne!(a, b);
        assert_eq!(counter, 2);
    }
}
