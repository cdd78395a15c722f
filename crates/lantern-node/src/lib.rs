//! lantern-node: a peer in the Lantern overlay network.
//!
//! A node forwards HTTP(S) traffic for a local client and proves who it is
//! to other peers with a certificate a sponsor signed for it.
//!
//! # Architecture
//!
//! ```text
//!   local client ──▶ ProxyTunnel (:8080)   CONNECT relay / plain HTTP forward
//!
//!   peer ──TLS──▶ issuance listener (:16354)   POST /authenticate  CSR ─▶ cert
//!   peer ─mTLS─▶ control listener  (:16353)   trusted client certs only
//!
//!   TrustBootstrap ──▶ sponsor issuance listener, then replaces our cert
//! ```
//!
//! Startup is an explicit, ordered routine (see [`Node::start`]): identity,
//! listeners, bootstrap, proxy.

pub mod bootstrap;
pub mod config;
pub mod control;
pub mod error;
pub mod node;
pub mod proxy;
pub mod tls;

// Re-exports for convenience.
pub use bootstrap::{
    BootstrapOutcome, IssuanceError, SponsorEndpoints, TrustBootstrap, Verification,
};
pub use config::{NodeConfig, SponsorAddress};
pub use control::{
    ControlChannelServer, ControlSession, ListenerAddrs, LoggingHandler, PeerIdentity,
    RunningControlChannel, SessionHandler,
};
pub use error::{ListenerKind, NodeError};
pub use node::{Endpoints, Node, StartupError, StartupStage};
pub use proxy::{ProxyTunnel, RunningProxy, TunnelSession, TunnelState};

/// Result type for lantern-node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
