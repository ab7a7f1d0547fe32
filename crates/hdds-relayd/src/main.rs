// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HDDS relay daemon.
//!
//! Bridges RTPS traffic between a local UDP domain and remote peers over
//! TCP bridge channels.
//!
//! # Usage
//!
//! ```bash
//! # Relay domain 0, accepting bridge connections on 7500
//! hdds-relayd --domain 0 --listen 0.0.0.0:7500
//!
//! # Connect out to two bridge servers
//! hdds-relayd --domain 0 --server 198.51.100.7:7500 --server 198.51.100.8:7500
//!
//! # Using a configuration file
//! hdds-relayd --config relay.toml
//! ```

mod settings;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use hdds_relay::{GuidPrefix, Relay, RelayConfig};
use settings::{RelaydError, Settings};

/// HDDS RTPS relay daemon.
#[derive(Parser, Debug)]
#[command(name = "hdds-relayd")]
#[command(about = "HDDS RTPS relay daemon - bridges DDS domains across UDP and TCP")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML).
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Domain id to relay.
    #[arg(long, default_value = "0")]
    domain: u32,

    /// Bridge server listen address.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Remote bridge server (repeatable).
    #[arg(long)]
    server: Vec<SocketAddr>,

    /// Disable the forwarding engine (transport-only mode).
    #[arg(long)]
    no_forward: bool,

    /// Disable TCP connection sharing.
    #[arg(long)]
    no_share: bool,

    /// Statistics reporting interval in seconds (0 disables).
    #[arg(long, default_value = "30")]
    stats_interval: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();
    // The engine logs through the `log` facade.
    tracing_log::LogTracer::init().ok();

    if let Err(e) = run(args) {
        tracing::error!("fatal: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), RelaydError> {
    let settings = match &args.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings {
            domain: args.domain,
            listen: args.listen,
            servers: args.server.clone(),
            forward: !args.no_forward,
            share: !args.no_share,
            stats_interval_secs: args.stats_interval,
        },
    };
    settings.validate()?;

    let mut config = RelayConfig::from_env();
    config.forward = settings.forward;
    config.tcp_share = settings.share;

    let prefix = random_prefix();
    tracing::info!(
        "starting relay: domain {} prefix {} forward={}",
        settings.domain,
        prefix,
        settings.forward
    );

    let mut relay = Relay::new(
        settings.domain,
        prefix,
        config,
        Box::new(|domain, msg, src| {
            tracing::trace!(
                "local delivery: domain {} {} submessages from {}",
                domain,
                msg.submsgs.len(),
                src
            );
        }),
    )?;

    if let Some(listen) = settings.listen {
        relay.bridge_listen(listen)?;
    }
    for server in &settings.servers {
        let h = relay.bridge_connect(*server);
        tracing::info!("bridge client -> {} (cx {})", server, h);
    }

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::SeqCst);
    })
    .map_err(|e| RelaydError::Signal(e.to_string()))?;

    let stats_every = (settings.stats_interval_secs > 0)
        .then(|| Duration::from_secs(settings.stats_interval_secs));
    let mut last_stats = Instant::now();

    while running.load(Ordering::SeqCst) {
        relay.run_once()?;

        if let Some(every) = stats_every {
            if last_stats.elapsed() >= every {
                let s = relay.fwd_stats();
                tracing::info!(
                    "stats: rx={} fwd={} local={} no_dest={} loops={}/{}",
                    s.msgs_rxed,
                    s.msgs_fwded,
                    s.msgs_local,
                    s.msgs_no_dest,
                    s.msgs_looped,
                    s.msgs_loopedi
                );
                last_stats = Instant::now();
            }
        }
    }

    tracing::info!("shutting down");
    Ok(())
}

/// A fresh participant prefix for this relay process.
fn random_prefix() -> GuidPrefix {
    let mut octets = [0u8; 12];
    // Vendor-marked prefix: vendor id first, random host/process tail.
    octets[0] = 0x01;
    octets[1] = 0xAA;
    for b in &mut octets[2..] {
        *b = fastrand::u8(..);
    }
    GuidPrefix::new(octets)
}
