//! Authenticated control sessions and the handler seam they are delivered to.

use async_trait::async_trait;
use lantern_pki::{cert, fingerprint};
use std::net::SocketAddr;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tracing::{debug, info};

/// Who is on the other end of a control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Subject common name of the client certificate
    pub common_name: Option<String>,
    /// SHA-256 fingerprint of the client certificate (hex)
    pub fingerprint: String,
}

impl PeerIdentity {
    /// Identity of an already-verified client certificate.
    pub fn from_der(der: &[u8]) -> Self {
        match cert::parse_der(der) {
            Ok(details) => Self {
                common_name: details.common_name,
                fingerprint: details.fingerprint,
            },
            Err(_) => Self {
                common_name: None,
                fingerprint: fingerprint::sha256_hex(der),
            },
        }
    }
}

/// One mutually-authenticated connection on the control listener.
///
/// Only constructed after the TLS handshake verified the client certificate,
/// so every session is authenticated.
pub struct ControlSession {
    pub peer: PeerIdentity,
    pub remote_addr: SocketAddr,
    pub stream: TlsStream<TcpStream>,
}

impl std::fmt::Debug for ControlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSession")
            .field("peer", &self.peer)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// Receives authenticated control sessions.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    /// Handle one session; the connection closes when this returns.
    async fn handle(&self, session: ControlSession);
}

/// Default handler: logs the peer and reads until it hangs up.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

#[async_trait]
impl SessionHandler for LoggingHandler {
    async fn handle(&self, mut session: ControlSession) {
        info!(
            peer = session.peer.common_name.as_deref().unwrap_or("-"),
            fingerprint = fingerprint::short(&session.peer.fingerprint),
            remote = %session.remote_addr,
            "control session opened"
        );

        let mut buf = [0u8; 4096];
        let mut received = 0usize;
        loop {
            match session.stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => received += n,
                Err(e) => {
                    debug!(
                        remote = %session.remote_addr,
                        error = %e,
                        "control session read failed"
                    );
                    break;
                }
            }
        }

        info!(remote = %session.remote_addr, bytes = received, "control session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lantern_pki::CertificateProfile;

    #[test]
    fn test_peer_identity_from_certificate() {
        let profile = CertificateProfile {
            common_name: "peer-7".into(),
            ..CertificateProfile::default()
        };
        let key = profile.generate_key().unwrap();
        let pem = profile.self_signed(&key).unwrap();
        let der = cert::certificate_der_from_pem(&pem).unwrap();

        let peer = PeerIdentity::from_der(&der);
        assert_eq!(peer.common_name.as_deref(), Some("peer-7"));
        assert_eq!(peer.fingerprint, fingerprint::sha256_hex(&der));
    }

    #[test]
    fn test_peer_identity_tolerates_garbage() {
        let peer = PeerIdentity::from_der(b"nope");
        assert!(peer.common_name.is_none());
        assert_eq!(peer.fingerprint.len(), 64);
    }
}
