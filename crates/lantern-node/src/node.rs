//! Ordered node startup.
//!
//! ```text
//! Configured -> IdentityReady -> ListenersReady -> BootstrapDone -> ProxyReady
//! ```
//!
//! Every stage but bootstrap is required; a failure aborts startup and drops
//! whatever was already listening.

use lantern_pki::{fingerprint, Identity, IdentityStore};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::bootstrap::{BootstrapOutcome, SponsorEndpoints, TrustBootstrap};
use crate::config::NodeConfig;
use crate::control::{ControlChannelServer, ListenerAddrs, RunningControlChannel, SessionHandler};
use crate::error::NodeError;
use crate::proxy::{ProxyTunnel, RunningProxy};

/// Startup milestones, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StartupStage {
    /// Listener and sponsor addresses resolved
    Configured,
    /// Key and certificate loaded or generated, trust set read
    IdentityReady,
    /// Issuance and control listeners bound
    ListenersReady,
    /// Sponsor bootstrap attempted
    BootstrapDone,
    /// Proxy bound
    ProxyReady,
}

impl fmt::Display for StartupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Configured => "configured",
            Self::IdentityReady => "identity ready",
            Self::ListenersReady => "listeners ready",
            Self::BootstrapDone => "bootstrap done",
            Self::ProxyReady => "proxy ready",
        })
    }
}

/// Startup stopped before reaching `stage`.
#[derive(Error, Debug)]
#[error("startup failed before {stage}: {source}")]
pub struct StartupError {
    pub stage: StartupStage,
    #[source]
    pub source: NodeError,
}

impl StartupError {
    fn at(stage: StartupStage) -> impl FnOnce(NodeError) -> Self {
        move |source| Self { stage, source }
    }
}

/// Every address a node binds or dials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub listeners: ListenerAddrs,
    pub proxy: SocketAddr,
    pub sponsor: Option<SponsorEndpoints>,
}

impl Endpoints {
    pub fn from_config(config: &NodeConfig) -> crate::Result<Self> {
        Ok(Self {
            listeners: ListenerAddrs::from_config(config)?,
            proxy: config.proxy_addr(),
            sponsor: config
                .sponsor
                .as_ref()
                .map(SponsorEndpoints::from_address)
                .transpose()?,
        })
    }
}

/// A running node.
pub struct Node {
    store: Arc<IdentityStore>,
    control: RunningControlChannel,
    proxy: RunningProxy,
    bootstrap: Option<BootstrapOutcome>,
}

impl Node {
    /// Start a node on the addresses in `config`.
    pub async fn start(
        config: &NodeConfig,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Self, StartupError> {
        let endpoints =
            Endpoints::from_config(config).map_err(StartupError::at(StartupStage::Configured))?;
        Self::start_at(config, endpoints, handler).await
    }

    /// Start a node on explicit addresses; `config` supplies everything else.
    pub async fn start_at(
        config: &NodeConfig,
        endpoints: Endpoints,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Self, StartupError> {
        info!(stage = %StartupStage::Configured, dir = %config.config_dir.display(), "startup");

        let store = IdentityStore::initialize(config.key_layout(), config.identity_options())
            .await
            .map(Arc::new)
            .map_err(|e| StartupError::at(StartupStage::IdentityReady)(e.into()))?;
        let trusted = store.load_trusted_certificates().await;
        info!(
            stage = %StartupStage::IdentityReady,
            fingerprint = fingerprint::short(store.identity().fingerprint()),
            trusted = trusted.len(),
            "startup"
        );

        let control = ControlChannelServer::new(store.clone(), trusted, handler)
            .with_handshake_timeout(config.timeouts.handshake())
            .start(endpoints.listeners)
            .await
            .map_err(StartupError::at(StartupStage::ListenersReady))?;
        info!(
            stage = %StartupStage::ListenersReady,
            issuance = %control.issuance_addr(),
            control = %control.control_addr(),
            "startup"
        );

        let bootstrap = match TrustBootstrap::new(store.clone(), &config.timeouts)
            .request_authentication(endpoints.sponsor.as_ref())
            .await
        {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(error = %e, "sponsor bootstrap failed, continuing self-signed");
                None
            }
        };
        info!(
            stage = %StartupStage::BootstrapDone,
            self_signed = store.identity().is_self_signed(),
            "startup"
        );

        let proxy = ProxyTunnel::new(config.timeouts.connect())
            .start_at(endpoints.proxy)
            .await
            .map_err(StartupError::at(StartupStage::ProxyReady))?;
        info!(stage = %StartupStage::ProxyReady, proxy = %proxy.local_addr(), "startup");

        Ok(Self {
            store,
            control,
            proxy,
            bootstrap,
        })
    }

    /// Current identity snapshot.
    pub fn identity(&self) -> Arc<Identity> {
        self.store.identity()
    }

    pub fn store(&self) -> &Arc<IdentityStore> {
        &self.store
    }

    pub const fn issuance_addr(&self) -> SocketAddr {
        self.control.issuance_addr()
    }

    pub const fn control_addr(&self) -> SocketAddr {
        self.control.control_addr()
    }

    pub const fn proxy_addr(&self) -> SocketAddr {
        self.proxy.local_addr()
    }

    /// `None` if a sponsor was configured and bootstrap failed.
    pub const fn bootstrap_outcome(&self) -> Option<&BootstrapOutcome> {
        self.bootstrap.as_ref()
    }

    /// Stop all listeners.
    pub fn shutdown(self) {
        self.proxy.shutdown();
        self.control.shutdown();
        info!("node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SponsorAddress;
    use crate::control::LoggingHandler;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    fn loopback() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    fn ephemeral() -> Endpoints {
        Endpoints {
            listeners: ListenerAddrs {
                issuance: loopback(),
                control: loopback(),
            },
            proxy: loopback(),
            sponsor: None,
        }
    }

    fn config_in(dir: &std::path::Path) -> NodeConfig {
        NodeConfig {
            config_dir: dir.to_path_buf(),
            ..NodeConfig::default()
        }
    }

    #[test]
    fn test_endpoints_from_config() {
        let config = NodeConfig {
            sponsor: Some(SponsorAddress {
                host: "sponsor.test".into(),
                port: 20000,
            }),
            ..NodeConfig::default()
        };
        let endpoints = Endpoints::from_config(&config).unwrap();
        assert_eq!(endpoints.listeners.issuance.port(), 16354);
        assert_eq!(endpoints.proxy.port(), 8080);
        assert_eq!(endpoints.sponsor.unwrap().issuance_port, 20001);
    }

    #[test]
    fn test_stage_order() {
        assert!(StartupStage::IdentityReady < StartupStage::ListenersReady);
        assert!(StartupStage::BootstrapDone < StartupStage::ProxyReady);
    }

    #[tokio::test]
    async fn test_standalone_startup() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::start_at(&config_in(dir.path()), ephemeral(), Arc::new(LoggingHandler))
            .await
            .unwrap();

        assert_eq!(node.bootstrap_outcome(), Some(&BootstrapOutcome::Standalone));
        assert!(node.identity().is_self_signed());
        assert_ne!(node.proxy_addr().port(), 0);
        node.shutdown();
    }

    #[tokio::test]
    async fn test_proxy_bind_failure_is_tagged() {
        let dir = tempfile::tempdir().unwrap();
        let squatter = TcpListener::bind(loopback()).await.unwrap();
        let endpoints = Endpoints {
            proxy: squatter.local_addr().unwrap(),
            ..ephemeral()
        };

        let err = Node::start_at(&config_in(dir.path()), endpoints, Arc::new(LoggingHandler))
            .await
            .err()
            .unwrap();
        assert_eq!(err.stage, StartupStage::ProxyReady);
        assert!(matches!(err.source, NodeError::Listen { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_sponsor_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let placeholder = TcpListener::bind(loopback()).await.unwrap();
        let port = placeholder.local_addr().unwrap().port();
        drop(placeholder);

        let mut config = config_in(dir.path());
        config.timeouts.connect_secs = 1;
        config.timeouts.issuance_secs = 1;
        let endpoints = Endpoints {
            sponsor: Some(SponsorEndpoints {
                host: "127.0.0.1".into(),
                issuance_port: port,
                control_port: port,
            }),
            ..ephemeral()
        };

        let node = Node::start_at(&config, endpoints, Arc::new(LoggingHandler))
            .await
            .unwrap();
        assert!(node.bootstrap_outcome().is_none());
        assert!(node.identity().is_self_signed());
    }
}
