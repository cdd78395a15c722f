//! Control channel: the issuance listener and the mutual-TLS control listener.
//!
//! Both listeners serve the node's current certificate. The issuance listener
//! accepts any client and signs CSRs; the control listener rejects, during the
//! handshake, any client whose certificate does not chain to the trust set.

pub mod issuance;
pub mod session;

pub use session::{ControlSession, LoggingHandler, PeerIdentity, SessionHandler};

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use lantern_pki::{fingerprint, IdentityStore, TrustedCertificateSet};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::{ListenerKind, NodeError};
use crate::tls;

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Default bound on inbound TLS handshakes.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the two listeners bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerAddrs {
    pub issuance: SocketAddr,
    pub control: SocketAddr,
}

impl ListenerAddrs {
    /// Control on the configured port, issuance one above it.
    pub fn from_config(config: &NodeConfig) -> crate::Result<Self> {
        Ok(Self {
            issuance: config.issuance_addr()?,
            control: config.control_addr(),
        })
    }
}

/// The two TLS listeners sharing one identity.
pub struct ControlChannelServer {
    store: Arc<IdentityStore>,
    trusted: TrustedCertificateSet,
    handler: Arc<dyn SessionHandler>,
    handshake_timeout: Duration,
}

impl ControlChannelServer {
    pub fn new(
        store: Arc<IdentityStore>,
        trusted: TrustedCertificateSet,
        handler: Arc<dyn SessionHandler>,
    ) -> Self {
        Self {
            store,
            trusted,
            handler,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Bind the issuance listener, then the control listener, then start
    /// serving. If either bind fails nothing stays open.
    pub async fn start(self, addrs: ListenerAddrs) -> crate::Result<RunningControlChannel> {
        let provider = tls::provider();
        let issuance_tls = tls::issuance_server_config(self.store.clone(), &provider)?;
        let control_tls =
            tls::control_server_config(self.store.clone(), &self.trusted, &provider)?;

        let issuance = TcpListener::bind(addrs.issuance)
            .await
            .map_err(|e| NodeError::listen(ListenerKind::Issuance, addrs.issuance, e))?;
        let control = match TcpListener::bind(addrs.control).await {
            Ok(listener) => listener,
            Err(e) => {
                drop(issuance);
                return Err(NodeError::listen(ListenerKind::Control, addrs.control, e));
            }
        };

        let issuance_addr = issuance.local_addr()?;
        let control_addr = control.local_addr()?;
        info!(addr = %issuance_addr, "issuance listener bound");
        info!(
            addr = %control_addr,
            trusted = self.trusted.len(),
            "control listener bound"
        );

        let timeout = self.handshake_timeout;
        let tasks = vec![
            tokio::spawn(issuance_loop(
                issuance,
                TlsAcceptor::from(issuance_tls),
                self.store,
                timeout,
            )),
            tokio::spawn(control_loop(
                control,
                TlsAcceptor::from(control_tls),
                self.handler,
                timeout,
            )),
        ];

        Ok(RunningControlChannel {
            issuance_addr,
            control_addr,
            tasks,
        })
    }
}

/// Handle to started listeners. Dropping it stops accepting.
#[derive(Debug)]
pub struct RunningControlChannel {
    issuance_addr: SocketAddr,
    control_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningControlChannel {
    pub const fn issuance_addr(&self) -> SocketAddr {
        self.issuance_addr
    }

    pub const fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// Stop both accept loops. Connections already handed off keep running.
    pub fn shutdown(self) {
        info!(
            issuance = %self.issuance_addr,
            control = %self.control_addr,
            "control channel shutting down"
        );
    }
}

impl Drop for RunningControlChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn issuance_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    store: Arc<IdentityStore>,
    handshake_timeout: Duration,
) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "issuance accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let store = store.clone();
        tokio::spawn(async move {
            let Some(tls) = handshake(
                &acceptor,
                stream,
                remote,
                handshake_timeout,
                ListenerKind::Issuance,
            )
            .await
            else {
                return;
            };

            let service = service_fn(move |req| {
                let store = store.clone();
                async move { Ok::<_, Infallible>(issuance::handle(&store, remote, req).await) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(tls), service)
                .await
            {
                debug!(remote = %remote, error = %e, "issuance connection ended with error");
            }
        });
    }
}

async fn control_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handler: Arc<dyn SessionHandler>,
    handshake_timeout: Duration,
) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "control accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            let Some(tls) = handshake(
                &acceptor,
                stream,
                remote,
                handshake_timeout,
                ListenerKind::Control,
            )
            .await
            else {
                return;
            };

            let Some(peer) = tls
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|chain| chain.first())
                .map(|der| PeerIdentity::from_der(der.as_ref()))
            else {
                warn!(remote = %remote, "verified connection without a client certificate");
                return;
            };

            debug!(
                remote = %remote,
                fingerprint = fingerprint::short(&peer.fingerprint),
                "peer authenticated"
            );
            handler
                .handle(ControlSession {
                    peer,
                    remote_addr: remote,
                    stream: tls,
                })
                .await;
        });
    }
}

/// Run the TLS handshake under a deadline. Failures stay at debug level:
/// they are expected from untrusted peers and scanners.
async fn handshake(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
    remote: SocketAddr,
    timeout: Duration,
    listener: ListenerKind,
) -> Option<TlsStream<TcpStream>> {
    match tokio::time::timeout(timeout, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => Some(tls),
        Ok(Err(e)) => {
            debug!(listener = %listener, remote = %remote, error = %e, "tls handshake failed");
            None
        }
        Err(_) => {
            debug!(listener = %listener, remote = %remote, "tls handshake timed out");
            None
        }
    }
}
