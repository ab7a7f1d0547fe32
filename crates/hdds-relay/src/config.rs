// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay configuration.
//!
//! Programmatic and environment-driven configuration of the transport
//! stack. Every parameter can also be applied by name at runtime through
//! [`RelayConfig::apply`]; a change to an address-affecting parameter is
//! reported back so the owner can run the redundancy-marked locator update
//! cycle instead of rebuilding connections.
//!
//! Environment variables use the `HDDS_RELAY_` prefix with the parameter
//! name upper-cased: `HDDS_RELAY_TCP_SERVER`, `HDDS_RELAY_FORWARD`, ...

use std::fmt;

use crate::locator::Scope;
use crate::mux::{PortParams, ScopeRange};
use crate::tls::TlsSettings;

/// Tri-state transport mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ModeOption {
    /// Transport not used.
    Disabled,
    /// Transport available.
    #[default]
    Enabled,
    /// Transport preferred over its siblings.
    Preferred,
}

impl ModeOption {
    fn parse(v: &str) -> Option<ModeOption> {
        match v.to_ascii_lowercase().as_str() {
            "disabled" | "0" | "off" => Some(ModeOption::Disabled),
            "enabled" | "1" | "on" => Some(ModeOption::Enabled),
            "preferred" | "2" => Some(ModeOption::Preferred),
            _ => None,
        }
    }

    /// True unless disabled.
    pub fn usable(&self) -> bool {
        *self != ModeOption::Disabled
    }
}

fn parse_scope(v: &str) -> Option<Scope> {
    match v.to_ascii_lowercase().as_str() {
        "node" => Some(Scope::Node),
        "link" => Some(Scope::Link),
        "site" => Some(Scope::Site),
        "org" => Some(Scope::Org),
        "global" => Some(Scope::Global),
        _ => None,
    }
}

fn parse_scope_window(v: &str) -> Option<ScopeRange> {
    match v.split_once("..") {
        Some((min, max)) => Some(ScopeRange {
            min: parse_scope(min.trim())?,
            max: parse_scope(max.trim())?,
        }),
        None => {
            let s = parse_scope(v.trim())?;
            Some(ScopeRange { min: s, max: s })
        }
    }
}

/// One configured TCP server: `addr[:port]` or `name[:port]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerSpec {
    /// Host name or address literal.
    pub host: String,
    /// Explicit port, if any.
    pub port: Option<u16>,
}

impl ServerSpec {
    fn parse(v: &str) -> Option<ServerSpec> {
        let v = v.trim();
        if v.is_empty() {
            return None;
        }
        // IPv6 literals carry colons; only split on the last one and only
        // if the tail parses as a port.
        match v.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => match port.parse::<u16>() {
                Ok(p) => Some(ServerSpec {
                    host: host.trim_matches(&['[', ']'][..]).to_string(),
                    port: Some(p),
                }),
                Err(_) => Some(ServerSpec {
                    host: v.to_string(),
                    port: None,
                }),
            },
            _ => Some(ServerSpec {
                host: v.to_string(),
                port: None,
            }),
        }
    }
}

fn parse_server_list(v: &str) -> Vec<ServerSpec> {
    v.split(';').filter_map(ServerSpec::parse).collect()
}

impl fmt::Display for ServerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(p) => write!(f, "{}:{}", self.host, p),
            None => write!(f, "{}", self.host),
        }
    }
}

// ============================================================================
// RelayConfig
// ============================================================================

/// Complete relay configuration.
#[derive(Clone, Debug, Default)]
pub struct RelayConfig {
    /// IPv4 stack mode.
    pub ip_mode: ModeOption,
    /// IPv6 stack mode.
    pub ipv6_mode: ModeOption,
    /// UDP transport mode.
    pub udp_mode: ModeOption,
    /// TCP transport mode.
    pub tcp_mode: ModeOption,
    /// IPv4 interface scope window.
    pub ip_scope: ScopeRange,
    /// IPv6 interface scope window.
    pub ipv6_scope: ScopeRange,
    /// Interface address filter, if any.
    pub ip_address: Option<String>,
    /// Network filter, if any.
    pub ip_network: Option<String>,
    /// Local TCP server port; 0 for ephemeral.
    pub tcp_port: u16,
    /// Local secure TCP server port.
    pub tcp_sec_port: u16,
    /// Remote TCP servers.
    pub tcp_servers: Vec<ServerSpec>,
    /// Remote secure TCP servers.
    pub tcp_sec_servers: Vec<ServerSpec>,
    /// Publicly reachable address to advertise.
    pub tcp_public: Option<ServerSpec>,
    /// Suppress the local TCP server.
    pub tcp_private: bool,
    /// Forwarding engine enabled.
    pub forward: bool,
    /// Allow Tx/Rx data channels to share one fd.
    pub tcp_share: bool,
    /// UDP transport suspended (cooperative).
    pub udp_suspended: bool,
    /// TCP transport suspended (cooperative).
    pub tcp_suspended: bool,
    /// Port formula parameters.
    pub ports: PortParams,
    /// TLS material and policy.
    pub tls: TlsSettings,
}

impl RelayConfig {
    /// Defaults: both stacks enabled, forwarding on, sharing on.
    pub fn new() -> Self {
        RelayConfig {
            forward: true,
            tcp_share: true,
            ports: PortParams::default(),
            ..Default::default()
        }
    }

    /// Whether a parameter change affects the served address set and must
    /// run the locator update cycle.
    fn address_affecting(name: &str) -> bool {
        matches!(
            name,
            "IP_Mode"
                | "IPv6_Mode"
                | "UDP_Mode"
                | "TCP_Mode"
                | "IP_Scope"
                | "IPv6_Scope"
                | "IP_Address"
                | "IP_Network"
                | "TCP_Port"
                | "TCP_SecPort"
                | "TCP_Server"
                | "TCP_SecServer"
                | "TCP_Public"
                | "TCP_Private"
        )
    }

    /// Apply one named parameter.
    ///
    /// Returns `Ok(true)` when the change requires a locator update cycle,
    /// `Ok(false)` otherwise, and `Err` for an unknown name or unparsable
    /// value.
    pub fn apply(&mut self, name: &str, value: &str) -> Result<bool, ConfigError> {
        let bad = || ConfigError::BadValue {
            name: name.to_string(),
            value: value.to_string(),
        };
        match name {
            "IP_Mode" => self.ip_mode = ModeOption::parse(value).ok_or_else(bad)?,
            "IPv6_Mode" => self.ipv6_mode = ModeOption::parse(value).ok_or_else(bad)?,
            "UDP_Mode" => self.udp_mode = ModeOption::parse(value).ok_or_else(bad)?,
            "TCP_Mode" => self.tcp_mode = ModeOption::parse(value).ok_or_else(bad)?,
            "IP_Scope" => self.ip_scope = parse_scope_window(value).ok_or_else(bad)?,
            "IPv6_Scope" => self.ipv6_scope = parse_scope_window(value).ok_or_else(bad)?,
            "IP_Address" => self.ip_address = Some(value.to_string()),
            "IP_Network" => self.ip_network = Some(value.to_string()),
            "TCP_Port" => self.tcp_port = value.parse().map_err(|_| bad())?,
            "TCP_SecPort" => self.tcp_sec_port = value.parse().map_err(|_| bad())?,
            "TCP_Server" => self.tcp_servers = parse_server_list(value),
            "TCP_SecServer" => self.tcp_sec_servers = parse_server_list(value),
            "TCP_Public" => self.tcp_public = ServerSpec::parse(value),
            "TCP_Private" => self.tcp_private = parse_bool(value).ok_or_else(bad)?,
            "Forward" => self.forward = parse_bool(value).ok_or_else(bad)?,
            "TCP_Share" => self.tcp_share = parse_bool(value).ok_or_else(bad)?,
            _ => {
                return Err(ConfigError::UnknownParameter(name.to_string()));
            }
        }
        log::debug!("[CFG] {} = {}", name, value);
        Ok(Self::address_affecting(name))
    }

    /// Load every known parameter from `HDDS_RELAY_*` environment
    /// variables.
    pub fn from_env() -> Self {
        let mut cfg = RelayConfig::new();
        const NAMES: [&str; 16] = [
            "IP_Mode",
            "IPv6_Mode",
            "UDP_Mode",
            "TCP_Mode",
            "IP_Scope",
            "IPv6_Scope",
            "IP_Address",
            "IP_Network",
            "TCP_Port",
            "TCP_SecPort",
            "TCP_Server",
            "TCP_SecServer",
            "TCP_Public",
            "TCP_Private",
            "Forward",
            "TCP_Share",
        ];
        for name in NAMES {
            let var = format!("HDDS_RELAY_{}", name.to_ascii_uppercase());
            if let Ok(value) = std::env::var(&var) {
                if let Err(e) = cfg.apply(name, &value) {
                    log::warn!("[CFG] ignoring {}: {}", var, e);
                }
            }
        }
        cfg
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No parameter of this name.
    UnknownParameter(String),
    /// The value does not parse for the parameter.
    BadValue {
        /// Parameter name.
        name: String,
        /// Offending value.
        value: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::UnknownParameter(name) => write!(f, "unknown parameter {}", name),
            ConfigError::BadValue { name, value } => {
                write!(f, "bad value {:?} for {}", value, name)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!(ModeOption::parse("disabled"), Some(ModeOption::Disabled));
        assert_eq!(ModeOption::parse("Enabled"), Some(ModeOption::Enabled));
        assert_eq!(ModeOption::parse("preferred"), Some(ModeOption::Preferred));
        assert_eq!(ModeOption::parse("maybe"), None);
        assert!(!ModeOption::Disabled.usable());
        assert!(ModeOption::Preferred.usable());
    }

    #[test]
    fn test_scope_window_parse() {
        let w = parse_scope_window("link..global").unwrap();
        assert_eq!(w.min, Scope::Link);
        assert_eq!(w.max, Scope::Global);

        let w = parse_scope_window("site").unwrap();
        assert_eq!(w.min, Scope::Site);
        assert_eq!(w.max, Scope::Site);

        assert!(parse_scope_window("bogus..global").is_none());
    }

    #[test]
    fn test_server_list_parse() {
        let list = parse_server_list("10.0.0.1:7500;relay.example.com;10.0.0.2:7501");
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].host, "10.0.0.1");
        assert_eq!(list[0].port, Some(7500));
        assert_eq!(list[1].host, "relay.example.com");
        assert_eq!(list[1].port, None);
        assert_eq!(list[2].port, Some(7501));
    }

    #[test]
    fn test_server_spec_ipv6() {
        let spec = ServerSpec::parse("[fd00::1]:7500").unwrap();
        assert_eq!(spec.host, "fd00::1");
        assert_eq!(spec.port, Some(7500));
    }

    #[test]
    fn test_apply_reports_update_need() {
        let mut cfg = RelayConfig::new();
        assert_eq!(cfg.apply("TCP_Server", "10.0.0.1:7500"), Ok(true));
        assert_eq!(cfg.apply("Forward", "0"), Ok(false));
        assert!(!cfg.forward);
        assert_eq!(cfg.apply("TCP_Share", "off"), Ok(false));
        assert!(!cfg.tcp_share);
    }

    #[test]
    fn test_apply_unknown_and_bad_values() {
        let mut cfg = RelayConfig::new();
        assert!(matches!(
            cfg.apply("No_Such", "1"),
            Err(ConfigError::UnknownParameter(_))
        ));
        assert!(matches!(
            cfg.apply("TCP_Port", "notaport"),
            Err(ConfigError::BadValue { .. })
        ));
        assert!(matches!(
            cfg.apply("UDP_Mode", "sometimes"),
            Err(ConfigError::BadValue { .. })
        ));
    }

    #[test]
    fn test_defaults() {
        let cfg = RelayConfig::new();
        assert!(cfg.forward);
        assert!(cfg.tcp_share);
        assert!(!cfg.tcp_private);
        assert!(!cfg.tls.permissive);
        assert_eq!(cfg.ports.pb, 7400);
    }

    #[test]
    fn test_tcp_private_and_public() {
        let mut cfg = RelayConfig::new();
        cfg.apply("TCP_Private", "1").unwrap();
        assert!(cfg.tcp_private);
        cfg.apply("TCP_Public", "203.0.113.9:7500").unwrap();
        assert_eq!(cfg.tcp_public.as_ref().unwrap().host, "203.0.113.9");
    }
}
