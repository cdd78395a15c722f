//! Sponsor bootstrap: trade our self-signed certificate for one a sponsor
//! signed, so peers trusting the sponsor accept our control connections.
//!
//! ```text
//! node ──POST /authenticate (CSR)──▶ sponsor issuance (port+1)
//!      ◀──────── signed certificate ─┘
//! replace certificate (same key)
//! node ──mTLS hello (new cert)─────▶ sponsor control (port)   best effort
//! ```

use lantern_pki::{fingerprint, Identity, IdentityStore};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::config::{SponsorAddress, TimeoutSettings};
use crate::control::issuance::PEM_CONTENT_TYPE;
use crate::tls;

/// How long the verification connection waits for the sponsor to object to
/// our certificate after the handshake.
const VERIFY_GRACE: Duration = Duration::from_secs(1);

/// Why a sponsor did not give us a usable certificate.
#[derive(Error, Debug)]
pub enum IssuanceError {
    /// Connection, TLS or HTTP failure.
    #[error("sponsor {endpoint} unreachable: {reason}")]
    Transport { endpoint: String, reason: String },

    /// No answer within the issuance timeout.
    #[error("sponsor {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },

    /// The sponsor answered with a non-success status.
    #[error("sponsor rejected the request with HTTP {status}")]
    Rejected { status: u16 },

    /// The sponsor answered 2xx with nothing in it.
    #[error("sponsor returned an empty response")]
    EmptyResponse,

    /// The returned certificate could not replace ours.
    #[error("sponsor returned an unusable certificate: {0}")]
    InvalidCertificate(String),
}

/// A sponsor's two listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SponsorEndpoints {
    pub host: String,
    pub issuance_port: u16,
    pub control_port: u16,
}

impl SponsorEndpoints {
    /// Control on the configured port, issuance one above it.
    pub fn from_address(address: &SponsorAddress) -> crate::Result<Self> {
        Ok(Self {
            host: address.host.clone(),
            issuance_port: address.issuance_port()?,
            control_port: address.port,
        })
    }

    pub fn issuance_url(&self) -> String {
        format!("https://{}:{}/authenticate", self.url_host(), self.issuance_port)
    }

    fn url_host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

/// Result of presenting the new certificate to the sponsor's control listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Handshake completed and the sponsor kept the connection
    Accepted,
    /// The sponsor refused the certificate
    Rejected(String),
    /// Could not get as far as a handshake
    Unreachable(String),
}

impl fmt::Display for Verification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => f.write_str("accepted"),
            Self::Rejected(reason) => write!(f, "rejected: {reason}"),
            Self::Unreachable(reason) => write!(f, "unreachable: {reason}"),
        }
    }
}

/// What bootstrap did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// No sponsor; the certificate stays self-signed
    Standalone,
    /// Certificate replaced by a sponsor-issued one
    Sponsored {
        fingerprint: String,
        verification: Verification,
    },
}

/// Drives the sponsor certificate-signing exchange.
pub struct TrustBootstrap {
    store: Arc<IdentityStore>,
    connect_timeout: Duration,
    issuance_timeout: Duration,
}

impl TrustBootstrap {
    pub fn new(store: Arc<IdentityStore>, timeouts: &TimeoutSettings) -> Self {
        Self {
            store,
            connect_timeout: timeouts.connect(),
            issuance_timeout: timeouts.issuance(),
        }
    }

    /// Obtain a sponsor-signed certificate and install it.
    ///
    /// Without a sponsor this returns immediately and changes nothing. The
    /// verification connection afterwards never fails the call; its outcome
    /// is reported in [`BootstrapOutcome::Sponsored`].
    pub async fn request_authentication(
        &self,
        sponsor: Option<&SponsorEndpoints>,
    ) -> Result<BootstrapOutcome, IssuanceError> {
        let Some(sponsor) = sponsor else {
            info!("no sponsor configured, staying self-signed");
            return Ok(BootstrapOutcome::Standalone);
        };

        let current = self.store.identity();
        info!(
            sponsor = %sponsor.host,
            port = sponsor.issuance_port,
            fingerprint = fingerprint::short(current.fingerprint()),
            "requesting certificate from sponsor"
        );

        let issued = self.request_certificate(&current, sponsor).await?;
        let replaced = self
            .store
            .replace_certificate(&issued)
            .await
            .map_err(|e| IssuanceError::InvalidCertificate(e.to_string()))?;

        let verification = self.verify(&replaced, sponsor).await;
        match &verification {
            Verification::Accepted => {
                info!(sponsor = %sponsor.host, "sponsor accepted the new certificate");
            }
            other => {
                warn!(
                    sponsor = %sponsor.host,
                    outcome = %other,
                    "keeping certificate despite failed verification"
                );
            }
        }

        Ok(BootstrapOutcome::Sponsored {
            fingerprint: replaced.fingerprint().to_string(),
            verification,
        })
    }

    /// POST our CSR to the sponsor's issuance listener.
    async fn request_certificate(
        &self,
        identity: &Identity,
        sponsor: &SponsorEndpoints,
    ) -> Result<String, IssuanceError> {
        let endpoint = sponsor.issuance_url();
        let transport = |reason: String| IssuanceError::Transport {
            endpoint: endpoint.clone(),
            reason,
        };

        let client_identity =
            reqwest::Identity::from_pem(identity.key_and_certificate_pem().as_bytes())
                .map_err(|e| transport(format!("client identity: {e}")))?;

        // The sponsor's certificate cannot be checked before we trust it.
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .identity(client_identity)
            .danger_accept_invalid_certs(true)
            .connect_timeout(self.connect_timeout)
            .timeout(self.issuance_timeout)
            .build()
            .map_err(|e| transport(e.to_string()))?;

        let timed_out = || IssuanceError::Timeout {
            endpoint: endpoint.clone(),
            timeout: self.issuance_timeout,
        };
        let exchange = post_csr(&client, &endpoint, identity.csr_pem());
        let (status, body) = match tokio::time::timeout(self.issuance_timeout, exchange).await {
            Err(_) => return Err(timed_out()),
            Ok(Err(e)) if e.is_timeout() => return Err(timed_out()),
            Ok(Err(e)) => return Err(transport(error_chain(&e))),
            Ok(Ok(answer)) => answer,
        };

        if !status.is_success() {
            return Err(IssuanceError::Rejected {
                status: status.as_u16(),
            });
        }
        if body.trim().is_empty() {
            return Err(IssuanceError::EmptyResponse);
        }
        debug!(bytes = body.len(), "received certificate from sponsor");
        Ok(body)
    }

    /// Connect to the sponsor's control listener with the new certificate.
    async fn verify(&self, identity: &Identity, sponsor: &SponsorEndpoints) -> Verification {
        let config = match tls::peer_client_config(identity, &tls::provider()) {
            Ok(config) => config,
            Err(e) => return Verification::Rejected(format!("local tls config: {e}")),
        };
        let name = match tls::server_name(&sponsor.host) {
            Ok(name) => name,
            Err(e) => return Verification::Unreachable(e.to_string()),
        };

        let addr = (sponsor.host.as_str(), sponsor.control_port);
        let connect = TcpStream::connect(addr);
        let stream = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Verification::Unreachable(e.to_string()),
            Err(_) => return Verification::Unreachable("connect timed out".into()),
        };

        let connector = TlsConnector::from(config);
        let handshake = connector.connect(name, stream);
        let mut tls = match tokio::time::timeout(self.connect_timeout, handshake).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => return Verification::Rejected(e.to_string()),
            Err(_) => return Verification::Unreachable("handshake timed out".into()),
        };

        // In TLS 1.3 the server judges our certificate after we consider the
        // handshake done; a refusal shows up as an alert on the first read.
        let mut buf = [0u8; 1];
        let verdict = match tokio::time::timeout(VERIFY_GRACE, tls.read(&mut buf)).await {
            Ok(Err(e)) => Verification::Rejected(e.to_string()),
            Ok(Ok(_)) | Err(_) => Verification::Accepted,
        };

        if let Err(e) = tls.shutdown().await {
            debug!(error = %e, "verification connection shutdown");
        }
        verdict
    }
}

async fn post_csr(
    client: &reqwest::Client,
    endpoint: &str,
    csr_pem: &str,
) -> reqwest::Result<(reqwest::StatusCode, String)> {
    let response = client
        .post(endpoint)
        .header(reqwest::header::CONTENT_TYPE, PEM_CONTENT_TYPE)
        .body(csr_pem.to_string())
        .send()
        .await?;
    let status = response.status();
    Ok((status, response.text().await?))
}

/// Flatten an error and its sources into one line.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
