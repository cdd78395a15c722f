//! Error types for a Lantern node.

use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

use crate::bootstrap::IssuanceError;

/// Which listener a bind failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    /// Unauthenticated TLS endpoint that signs CSRs
    Issuance,
    /// Mutual-TLS endpoint for peer signalling
    Control,
    /// Local HTTP(S) forward proxy
    Proxy,
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Issuance => "issuance",
            Self::Control => "control",
            Self::Proxy => "proxy",
        })
    }
}

/// Errors that can occur in node operations.
#[derive(Error, Debug)]
pub enum NodeError {
    /// Identity could not be loaded or generated.
    #[error(transparent)]
    Identity(#[from] lantern_pki::PkiError),

    /// A listener failed to bind.
    #[error("{listener} listener failed to bind {addr}: {source}")]
    Listen {
        listener: ListenerKind,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// TLS configuration could not be built.
    #[error("tls error: {0}")]
    Tls(String),

    /// Configuration is invalid or missing required fields.
    #[error("config error: {0}")]
    Config(String),

    /// Sponsor certificate issuance failed.
    #[error(transparent)]
    Issuance(#[from] IssuanceError),

    /// Could not reach the destination of a proxied request.
    #[error("cannot reach {target}: {reason}")]
    UpstreamConnect { target: String, reason: String },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rustls::Error> for NodeError {
    fn from(err: rustls::Error) -> Self {
        Self::Tls(err.to_string())
    }
}

impl NodeError {
    pub(crate) fn listen(listener: ListenerKind, addr: SocketAddr, source: std::io::Error) -> Self {
        Self::Listen {
            listener,
            addr,
            source,
        }
    }
}
