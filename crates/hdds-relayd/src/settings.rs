// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Daemon settings.
//!
//! File-based (TOML) and flag-based configuration share one struct.

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Daemon failures.
#[derive(Debug, Error)]
pub enum RelaydError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("signal handler: {0}")]
    Signal(String),
}

/// Daemon settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Domain id to relay.
    #[serde(default)]
    pub domain: u32,

    /// Bridge server listen address.
    #[serde(default)]
    pub listen: Option<SocketAddr>,

    /// Remote bridge servers to connect to.
    #[serde(default)]
    pub servers: Vec<SocketAddr>,

    /// Forwarding engine enabled.
    #[serde(default = "default_true")]
    pub forward: bool,

    /// TCP connection sharing enabled.
    #[serde(default = "default_true")]
    pub share: bool,

    /// Statistics interval in seconds (0 disables).
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_stats_interval() -> u64 {
    30
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RelaydError> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Reject useless combinations early.
    pub fn validate(&self) -> Result<(), RelaydError> {
        if self.listen.is_none() && self.servers.is_empty() {
            return Err(RelaydError::Invalid(
                "neither a listen address nor any server is configured".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
