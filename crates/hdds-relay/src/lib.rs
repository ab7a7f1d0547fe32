// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # HDDS Relay - RTPS forwarding and transport multiplexing
//!
//! The wire-level message path of an RTPS bridge: parse binary messages
//! from many peers, learn routing state from the messages themselves,
//! relay frames between locally-reachable participants and remote peers,
//! and keep secure and cleartext transports multiplexed over one poll
//! loop.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                     Discovery / DCPS                         |
//! |        (receive callback, participant_new/dispose)           |
//! +--------------------------------------------------------------+
//! |  Forwarder     GUID-prefix learning, loop suppression,       |
//! |                InfoSource/InfoReply rewriting, aging table   |
//! +--------------------------------------------------------------+
//! |  Parser        RTPS header + submessage walk, zero-copy      |
//! |                payload windows into shared buffers           |
//! +--------------------------------------------------------------+
//! |  Mux           per-kind dispatch, locator update cycle       |
//! +--------------------------------------------------------------+
//! |  Transports    UDP | TCP bridge (RPSC) | DTLS | TLS          |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use hdds_relay::{GuidPrefix, Relay, RelayConfig};
//!
//! let mut relay = Relay::new(
//!     0,
//!     GuidPrefix::new([1; 12]),
//!     RelayConfig::from_env(),
//!     Box::new(|domain, msg, src| {
//!         println!("domain {}: {} submessages from {}", domain, msg.submsgs.len(), src);
//!     }),
//! )?;
//!
//! loop {
//!     relay.run_once()?;
//! }
//! # #[allow(unreachable_code)]
//! # Ok::<(), std::io::Error>(())
//! ```
//!
//! ## Concurrency model
//!
//! Single-threaded and cooperative: one `mio` poll serves every socket,
//! one timer wheel serves every protocol timer, and all state advances
//! inside `run_once`. Nothing here blocks.

/// Relay configuration and the named-parameter surface.
pub mod config;
/// Connection handle table and pairing.
pub mod cx;
/// Downward interface to discovery.
pub mod discovery;
/// DTLS supervision: role election, cookies, idle watchdog.
pub mod dtls;
/// The forwarding engine.
pub mod fwd;
/// GUID prefix handling.
pub mod guid;
/// Locators and locator lists.
pub mod locator;
/// RTPS message model, parser and builder.
pub mod message;
/// Transport registry and port formulae.
pub mod mux;
/// Poll loop and timer service.
pub mod poller;
/// The relay core instance.
pub mod relay;
/// TCP bridge: RPSC control plane and data channels.
pub mod tcp;
/// Tick-based timer wheel.
pub mod timer;
/// TLS tunnel for TCP bridge channels.
pub mod tls;
/// UDP transport.
pub mod udp;

pub use config::{ModeOption, RelayConfig, ServerSpec};
pub use discovery::{DiscoveryStore, DiscoveryView, EndpointInfo, ParticipantInfo};
pub use fwd::{Forwarder, FwdStats};
pub use guid::GuidPrefix;
pub use locator::{Locator, LocatorList};
pub use message::{Message, SharedMessage};
pub use relay::{Relay, RxCallback};
