//! rustls configuration for the node's listeners and outbound peer connections.
//!
//! All configs use the ring provider explicitly. Server certificates come from
//! [`IdentityResolver`], which reads the identity store on every handshake, so
//! a replaced certificate takes effect for new connections only.

use lantern_pki::{fingerprint, Identity, IdentityStore, TrustedCertificateSet};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

use crate::error::NodeError;

/// The crypto provider every config in this crate is built with.
pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Certificate chain and signing key for one identity snapshot.
pub fn certified_key(
    identity: &Identity,
    provider: &CryptoProvider,
) -> crate::Result<CertifiedKey> {
    let key = provider
        .key_provider
        .load_private_key(private_key(identity))?;
    Ok(CertifiedKey::new(vec![certificate(identity)], key))
}

fn certificate(identity: &Identity) -> CertificateDer<'static> {
    CertificateDer::from(identity.certificate_der().to_vec())
}

fn private_key(identity: &Identity) -> PrivateKeyDer<'static> {
    PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(identity.private_key_der().to_vec()))
}

/// Serves whatever certificate the identity store currently holds.
pub struct IdentityResolver {
    store: Arc<IdentityStore>,
    provider: Arc<CryptoProvider>,
    cached: Mutex<Option<(String, Arc<CertifiedKey>)>>,
}

impl IdentityResolver {
    pub fn new(store: Arc<IdentityStore>, provider: Arc<CryptoProvider>) -> Self {
        Self {
            store,
            provider,
            cached: Mutex::new(None),
        }
    }

    fn current(&self) -> crate::Result<Arc<CertifiedKey>> {
        let identity = self.store.identity();
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some((fp, key)) = cached.as_ref() {
            if fp == identity.fingerprint() {
                return Ok(key.clone());
            }
        }

        let key = Arc::new(certified_key(&identity, &self.provider)?);
        debug!(
            fingerprint = fingerprint::short(identity.fingerprint()),
            "serving certificate"
        );
        *cached = Some((identity.fingerprint().to_string(), key.clone()));
        Ok(key)
    }
}

impl fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("fingerprint", &self.store.identity().fingerprint())
            .finish_non_exhaustive()
    }
}

impl ResolvesServerCert for IdentityResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match self.current() {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(error = %e, "no usable server certificate");
                None
            }
        }
    }
}

/// Issuance listener: server auth only, any client may connect.
pub fn issuance_server_config(
    store: Arc<IdentityStore>,
    provider: &Arc<CryptoProvider>,
) -> crate::Result<Arc<ServerConfig>> {
    let config = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(IdentityResolver::new(store, provider.clone())));
    Ok(Arc::new(config))
}

/// Control listener: client certificates must chain to `trusted` or to
/// this node's own certificate.
pub fn control_server_config(
    store: Arc<IdentityStore>,
    trusted: &TrustedCertificateSet,
    provider: &Arc<CryptoProvider>,
) -> crate::Result<Arc<ServerConfig>> {
    let roots = client_roots(&store.identity(), trusted);
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|e| NodeError::Tls(format!("client verifier: {e}")))?;

    let config = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_cert_resolver(Arc::new(IdentityResolver::new(store, provider.clone())));
    Ok(Arc::new(config))
}

/// Trust anchors for client verification.
pub fn client_roots(own: &Identity, trusted: &TrustedCertificateSet) -> RootCertStore {
    let mut roots = RootCertStore::empty();

    for entry in trusted.iter() {
        if let Err(e) = roots.add(CertificateDer::from(entry.details.der.clone())) {
            warn!(source = %entry.source, error = %e, "trusted certificate is not a usable anchor");
        }
    }
    if let Err(e) = roots.add(certificate(own)) {
        warn!(error = %e, "own certificate is not a usable anchor");
    }

    debug!(anchors = roots.len(), "built control listener trust store");
    roots
}

/// Client config for connecting to another node's listeners.
///
/// Presents `identity` as the client certificate. The server certificate is
/// not checked against any anchor, only its handshake signature.
pub fn peer_client_config(
    identity: &Identity,
    provider: &Arc<CryptoProvider>,
) -> crate::Result<Arc<ClientConfig>> {
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AnyServerCertificate {
            provider: provider.clone(),
        }))
        .with_client_auth_cert(vec![certificate(identity)], private_key(identity))?;
    Ok(Arc::new(config))
}

/// Server name for a host string; IP literals become IP names.
pub fn server_name(host: &str) -> crate::Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| NodeError::Tls(format!("invalid server name {host:?}: {e}")))
}

/// Accepts any server certificate; still checks handshake signatures.
#[derive(Debug)]
struct AnyServerCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AnyServerCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
