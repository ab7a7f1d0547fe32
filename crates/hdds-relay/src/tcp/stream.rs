// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stream abstraction for bridge channels.
//!
//! Unifies plain TCP and the TLS tunnel behind one trait so the channel
//! FSMs never know whether their bytes are encrypted. Implementations are
//! non-blocking; `WouldBlock` is the normal idle result.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};

#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};

/// Byte stream carried by a bridge channel.
pub trait CxStream: Read + Write + Send {
    /// Shut down the stream.
    fn shutdown(&mut self, how: Shutdown) -> io::Result<()>;

    /// Local address.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Peer address.
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Switch blocking mode.
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;

    /// Pending socket error, if any.
    fn take_error(&self) -> io::Result<Option<io::Error>>;

    /// True when reads/writes go through a TLS session.
    fn is_secure(&self) -> bool {
        false
    }

    /// Raw descriptor for poll registration.
    #[cfg(unix)]
    fn as_raw_fd(&self) -> RawFd;
}

impl CxStream for TcpStream {
    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        TcpStream::shutdown(self, how)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        TcpStream::take_error(self)
    }

    #[cfg(unix)]
    fn as_raw_fd(&self) -> RawFd {
        AsRawFd::as_raw_fd(self)
    }
}

impl CxStream for mio::net::TcpStream {
    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        mio::net::TcpStream::shutdown(self, how)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        mio::net::TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        mio::net::TcpStream::peer_addr(self)
    }

    fn set_nonblocking(&self, _nonblocking: bool) -> io::Result<()> {
        // mio streams are always non-blocking.
        Ok(())
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        mio::net::TcpStream::take_error(self)
    }

    #[cfg(unix)]
    fn as_raw_fd(&self) -> RawFd {
        AsRawFd::as_raw_fd(self)
    }
}

/// Boxed stream as stored in the transport.
pub type BoxedStream = Box<dyn CxStream>;

// ============================================================================
// Test mock
// ============================================================================


// ============================================================================
// Tests
// ============================================================================
