// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TLS tunnel for TCP bridge channels (feature `tcp-tls`).
//!
//! The bridge FSMs are identical over TLS; only the byte path changes.
//! Reads and writes go through a rustls session wrapped as a [`CxStream`],
//! so want-read/want-write surfaces as ordinary `WouldBlock` and the poll
//! loop needs no TLS awareness. A pending server-side handshake is bounded
//! by a 2 s timer at the accept path.
//!
//! Certificate material comes from the embedding security layer as file
//! paths. Accepting not-yet-valid or expired certificates is an explicit
//! configuration option and defaults to off.

use crate::timer::secs;

/// Pending-handshake bound on accepted connections.
pub const TLS_HANDSHAKE_TO: u64 = secs(2);

/// TLS material and policy, supplied by the security collaborator.
#[derive(Clone, Debug, Default)]
pub struct TlsSettings {
    /// PEM certificate chain file.
    pub cert_file: Option<String>,
    /// PEM private key file.
    pub key_file: Option<String>,
    /// PEM trust anchors file; system roots when unset.
    pub ca_file: Option<String>,
    /// Accept peers with invalid validity periods. Off by default; enable
    /// only for closed test networks.
    pub permissive: bool,
}

#[cfg(feature = "tcp-tls")]
pub use imp::{TlsAcceptor, TlsConnector, TlsError, TlsStream};

#[cfg(feature = "tcp-tls")]
mod imp {
    use super::TlsSettings;
    use crate::tcp::stream::CxStream;

    use std::fmt;
    use std::io::{self, Read, Write};
    use std::net::{Shutdown, SocketAddr};
    use std::sync::Arc;

    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};

    #[cfg(unix)]
    use std::os::unix::io::RawFd;

    /// TLS setup failures.
    #[derive(Debug)]
    pub enum TlsError {
        /// Certificate or key material unusable.
        Material(String),
        /// rustls rejected the configuration.
        Config(rustls::Error),
        /// Underlying I/O failure.
        Io(io::Error),
    }

    impl fmt::Display for TlsError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                TlsError::Material(msg) => write!(f, "TLS material: {}", msg),
                TlsError::Config(e) => write!(f, "TLS config: {}", e),
                TlsError::Io(e) => write!(f, "TLS I/O: {}", e),
            }
        }
    }

    impl std::error::Error for TlsError {}

    impl From<rustls::Error> for TlsError {
        fn from(e: rustls::Error) -> Self {
            TlsError::Config(e)
        }
    }

    impl From<io::Error> for TlsError {
        fn from(e: io::Error) -> Self {
            TlsError::Io(e)
        }
    }

    fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
        let data = std::fs::read(path)?;
        rustls_pemfile::certs(&mut data.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError::Material(format!("{}: {}", path, e)))
    }

    fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
        let data = std::fs::read(path)?;
        rustls_pemfile::private_key(&mut data.as_slice())
            .map_err(|e| TlsError::Material(format!("{}: {}", path, e)))?
            .ok_or_else(|| TlsError::Material(format!("{}: no private key", path)))
    }

    /// Certificate verifier that tolerates validity-period errors only.
    ///
    /// Chain and signature checks still run; `NotValidYet`/`Expired` are
    /// downgraded when the permissive option is set.
    #[derive(Debug)]
    struct PermissiveVerifier {
        inner: Arc<rustls::client::WebPkiServerVerifier>,
    }

    impl rustls::client::danger::ServerCertVerifier for PermissiveVerifier {
        fn verify_server_cert(
            &self,
            end_entity: &CertificateDer<'_>,
            intermediates: &[CertificateDer<'_>],
            server_name: &ServerName<'_>,
            ocsp_response: &[u8],
            now: rustls::pki_types::UnixTime,
        ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
            match self.inner.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            ) {
                Ok(v) => Ok(v),
                Err(rustls::Error::InvalidCertificate(
                    rustls::CertificateError::Expired | rustls::CertificateError::NotValidYet,
                )) => {
                    log::warn!("[TLS] accepting certificate outside validity period");
                    Ok(rustls::client::danger::ServerCertVerified::assertion())
                }
                Err(e) => Err(e),
            }
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            self.inner.verify_tls12_signature(message, cert, dss)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            self.inner.verify_tls13_signature(message, cert, dss)
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.inner.supported_verify_schemes()
        }
    }

    fn root_store(settings: &TlsSettings) -> Result<RootCertStore, TlsError> {
        let mut roots = RootCertStore::empty();
        if let Some(ca) = &settings.ca_file {
            for cert in load_certs(ca)? {
                roots
                    .add(cert)
                    .map_err(|e| TlsError::Material(format!("trust anchor: {}", e)))?;
            }
        }
        Ok(roots)
    }

    /// Shared per-process server context.
    pub struct TlsAcceptor {
        config: Arc<ServerConfig>,
    }

    impl TlsAcceptor {
        /// Build the server context from the configured material.
        pub fn new(settings: &TlsSettings) -> Result<Self, TlsError> {
            let certs = settings
                .cert_file
                .as_deref()
                .map(load_certs)
                .transpose()?
                .unwrap_or_default();
            let key = settings
                .key_file
                .as_deref()
                .map(load_key)
                .transpose()?
                .ok_or_else(|| TlsError::Material("server key required".into()))?;
            let config = ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key)?;
            Ok(TlsAcceptor {
                config: Arc::new(config),
            })
        }

        /// Start a server-side session on an accepted socket.
        pub fn accept<T: CxStream>(&self, sock: T) -> Result<TlsStream<T>, TlsError> {
            let conn = ServerConnection::new(self.config.clone())?;
            Ok(TlsStream {
                conn: rustls::Connection::Server(conn),
                sock,
            })
        }
    }

    /// Shared per-process client context.
    pub struct TlsConnector {
        config: Arc<ClientConfig>,
    }

    impl TlsConnector {
        /// Build the client context.
        pub fn new(settings: &TlsSettings) -> Result<Self, TlsError> {
            let roots = root_store(settings)?;
            let config = if settings.permissive {
                let inner = rustls::client::WebPkiServerVerifier::builder(Arc::new(roots))
                    .build()
                    .map_err(|e| TlsError::Material(format!("verifier: {}", e)))?;
                ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(PermissiveVerifier { inner }))
                    .with_no_client_auth()
            } else {
                ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            };
            Ok(TlsConnector {
                config: Arc::new(config),
            })
        }

        /// Start a client-side session on a connected socket.
        pub fn connect<T: CxStream>(
            &self,
            name: &str,
            sock: T,
        ) -> Result<TlsStream<T>, TlsError> {
            let server_name = ServerName::try_from(name.to_string())
                .map_err(|e| TlsError::Material(format!("server name: {}", e)))?;
            let conn = ClientConnection::new(self.config.clone(), server_name)?;
            Ok(TlsStream {
                conn: rustls::Connection::Client(conn),
                sock,
            })
        }
    }

    /// A TLS session over a [`CxStream`].
    ///
    /// Handshake progress happens inside `read`/`write`; want-read and
    /// want-write surface as `WouldBlock` on the corresponding call so the
    /// poll loop treats it like any non-blocking socket.
    pub struct TlsStream<T: CxStream> {
        conn: rustls::Connection,
        sock: T,
    }

    impl<T: CxStream> TlsStream<T> {
        /// True once the handshake is complete.
        pub fn is_established(&self) -> bool {
            !self.conn.is_handshaking()
        }

        /// Move buffered TLS records in both directions.
        fn pump(&mut self) -> io::Result<()> {
            while self.conn.wants_write() {
                match self.conn.write_tls(&mut self.sock) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e),
                }
            }
            if self.conn.wants_read() {
                match self.conn.read_tls(&mut self.sock) {
                    Ok(0) => {
                        return Err(io::ErrorKind::UnexpectedEof.into());
                    }
                    Ok(_) => {
                        self.conn
                            .process_new_packets()
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        }
    }

    impl<T: CxStream> Read for TlsStream<T> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.pump()?;
            match self.conn.reader().read(buf) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(e),
                Err(e) => Err(e),
            }
        }
    }

    impl<T: CxStream> Write for TlsStream<T> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = self.conn.writer().write(buf)?;
            self.pump()?;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.pump()?;
            self.sock.flush()
        }
    }

    impl<T: CxStream> CxStream for TlsStream<T> {
        fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
            self.conn.send_close_notify();
            let _ = self.pump();
            self.sock.shutdown(how)
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.sock.local_addr()
        }

        fn peer_addr(&self) -> io::Result<SocketAddr> {
            self.sock.peer_addr()
        }

        fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
            self.sock.set_nonblocking(nonblocking)
        }

        fn take_error(&self) -> io::Result<Option<io::Error>> {
            self.sock.take_error()
        }

        fn is_secure(&self) -> bool {
            true
        }

        #[cfg(unix)]
        fn as_raw_fd(&self) -> RawFd {
            self.sock.as_raw_fd()
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
