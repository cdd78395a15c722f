//! Node identity management.
//!
//! Each node owns one key pair for its whole life. The certificate over that
//! key starts out self-signed and may later be replaced by one a sponsor
//! issued; the key itself never changes, so a sponsor's binding stays valid.
//!
//! ```text
//! Uninitialized -> Loading -> Loaded ------------------------> Ready
//!                         \-> NotFound -> Generating -> Persisting -> Ready
//! ```

use chrono::{DateTime, Utc};
use rcgen::KeyPair;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use crate::cert::{self, CertificateDetails, CERTIFICATE_TAG};
use crate::error::{PkiError, Result};
use crate::fingerprint;
use crate::issuance::{CertificateProfile, Issuer};
use crate::layout::{write_atomic, KeyLayout};
use crate::trust::TrustedCertificateSet;

/// How the current identity came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityOrigin {
    /// Key and certificate read back from disk
    Loaded,
    /// Fresh key pair and self-signed certificate
    Generated,
    /// Loaded key with an expired certificate, re-issued self-signed
    Renewed,
    /// Certificate swapped for one issued by a sponsor
    Replaced,
}

/// A node's private key, certificate and certificate signing request.
///
/// Immutable; the store swaps whole snapshots.
pub struct Identity {
    key_pem: String,
    key_der: Vec<u8>,
    certificate_pem: String,
    csr_pem: String,
    details: CertificateDetails,
    origin: IdentityOrigin,
}

impl Identity {
    fn assemble(
        key_pair: &KeyPair,
        certificate_pem: String,
        csr_pem: String,
        origin: IdentityOrigin,
    ) -> Result<Self> {
        let details = cert::parse_pem(&certificate_pem)?;
        if details.spki != key_pair.public_key_der() {
            return Err(PkiError::CertificateMismatch);
        }

        Ok(Self {
            key_pem: key_pair.serialize_pem(),
            key_der: key_pair.serialize_der(),
            certificate_pem,
            csr_pem,
            details,
            origin,
        })
    }

    /// PEM-encoded PKCS#8 private key.
    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }

    /// DER-encoded PKCS#8 private key.
    pub fn private_key_der(&self) -> &[u8] {
        &self.key_der
    }

    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.details.der
    }

    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    /// Private key followed by certificate, the bundle TLS clients load.
    pub fn key_and_certificate_pem(&self) -> String {
        format!("{}{}", self.key_pem, self.certificate_pem)
    }

    pub fn details(&self) -> &CertificateDetails {
        &self.details
    }

    pub fn fingerprint(&self) -> &str {
        &self.details.fingerprint
    }

    pub fn common_name(&self) -> Option<&str> {
        self.details.common_name.as_deref()
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.details.not_after
    }

    pub const fn origin(&self) -> IdentityOrigin {
        self.origin
    }

    /// True until a sponsor-issued certificate replaces the self-signed one.
    pub fn is_self_signed(&self) -> bool {
        cert::is_self_signed(&self.details.der).unwrap_or(false)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("subject", &self.details.subject)
            .field("issuer", &self.details.issuer)
            .field("fingerprint", &self.details.fingerprint)
            .field("not_after", &self.details.not_after)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Inputs to [`IdentityStore::initialize`].
#[derive(Debug, Clone, Default)]
pub struct IdentityOptions {
    /// Shape of generated certificates
    pub profile: CertificateProfile,
    /// Extra authority certificates (PEM) to trust besides the trust directory
    pub authority_hints: Vec<String>,
}

/// Owner of the node's identity; the only thing allowed to change it.
pub struct IdentityStore {
    layout: KeyLayout,
    profile: CertificateProfile,
    authority_hints: Vec<String>,
    current: RwLock<Arc<Identity>>,
}

impl IdentityStore {
    /// Load the identity from disk, or generate and persist a new one.
    ///
    /// Any problem with the files on disk (missing, malformed, key and
    /// certificate disagreeing) leads to generation. Only generation or
    /// persistence failures are returned.
    pub async fn initialize(layout: KeyLayout, options: IdentityOptions) -> Result<Self> {
        info!("initializing keys");
        layout.ensure_dirs().await?;

        let identity = match load(&layout, &options.profile).await {
            Ok(identity) => identity,
            Err(e) => {
                info!(reason = %e, "key data not found on disk, creating");
                generate(&layout, &options.profile).await?
            }
        };

        info!(
            fingerprint = fingerprint::short(identity.fingerprint()),
            subject = %identity.details.subject,
            issuer = %identity.details.issuer,
            not_after = %identity.not_after(),
            origin = ?identity.origin(),
            "identity ready"
        );

        Ok(Self {
            layout,
            profile: options.profile,
            authority_hints: options.authority_hints,
            current: RwLock::new(Arc::new(identity)),
        })
    }

    /// Snapshot of the current identity.
    pub fn identity(&self) -> Arc<Identity> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub const fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    pub const fn profile(&self) -> &CertificateProfile {
        &self.profile
    }

    /// Issue a certificate for a peer's CSR or certificate, signed with this node's key.
    pub fn sign(&self, submission: &str) -> Result<String> {
        let identity = self.identity();
        let issuer = Issuer::from_pem(
            identity.certificate_pem(),
            identity.private_key_pem(),
            self.profile.validity_days,
        )?;
        issuer.sign(submission)
    }

    /// Swap in a certificate issued for this node's key.
    ///
    /// The file is replaced atomically before the in-memory snapshot; a
    /// certificate for any other key is refused and nothing changes.
    pub async fn replace_certificate(&self, certificate_pem: &str) -> Result<Arc<Identity>> {
        let der = cert::certificate_der_from_pem(certificate_pem)?;
        let normalized = pem::encode(&pem::Pem::new(CERTIFICATE_TAG, der));

        let current = self.identity();
        let key_pair = KeyPair::from_pem(current.private_key_pem())
            .map_err(|e| PkiError::InvalidCertificate(format!("identity key: {e}")))?;
        let replacement = Identity::assemble(
            &key_pair,
            normalized,
            current.csr_pem.clone(),
            IdentityOrigin::Replaced,
        )?;

        write_atomic(
            &self.layout.certificate(),
            replacement.certificate_pem(),
            false,
        )
        .await?;

        let replacement = Arc::new(replacement);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = replacement.clone();

        info!(
            fingerprint = fingerprint::short(replacement.fingerprint()),
            issuer = %replacement.details.issuer,
            not_after = %replacement.not_after(),
            "certificate replaced"
        );
        Ok(replacement)
    }

    /// Read the trust directory plus any authority hints.
    pub async fn load_trusted_certificates(&self) -> TrustedCertificateSet {
        let mut set = TrustedCertificateSet::load_dir(self.layout.trusted_dir()).await;
        for (i, hint) in self.authority_hints.iter().enumerate() {
            let source = format!("authority hint #{i}");
            if let Err(e) = set.add_pem(&source, hint.as_bytes()) {
                warn!(error = %e, "skipping authority hint");
            }
        }
        set
    }
}

/// Read key, certificate and CSR back from disk.
async fn load(layout: &KeyLayout, profile: &CertificateProfile) -> Result<Identity> {
    let key_path = layout.private_key();
    let key_pem = tokio::fs::read_to_string(&key_path)
        .await
        .map_err(|e| PkiError::load(&key_path, e))?;
    let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| PkiError::load(&key_path, e))?;

    let cert_path = layout.certificate();
    let certificate_pem = tokio::fs::read_to_string(&cert_path)
        .await
        .map_err(|e| PkiError::load(&cert_path, e))?;
    let details = cert::parse_pem(&certificate_pem).map_err(|e| PkiError::load(&cert_path, e))?;
    if details.spki != key_pair.public_key_der() {
        return Err(PkiError::load(&cert_path, PkiError::CertificateMismatch));
    }
    debug!("using key data from disk");

    // Re-derived pieces keep the subject the certificate already carries.
    let profile = CertificateProfile {
        common_name: details
            .common_name
            .clone()
            .unwrap_or_else(|| profile.common_name.clone()),
        ..profile.clone()
    };

    let csr_path = layout.csr();
    let csr_pem = match tokio::fs::read_to_string(&csr_path).await {
        Ok(csr) if rcgen::CertificateSigningRequestParams::from_pem(&csr).is_ok() => csr,
        _ => {
            warn!(
                path = %csr_path.display(),
                "certificate request missing or invalid, re-deriving"
            );
            let csr = profile.csr(&key_pair)?;
            write_atomic(&csr_path, &csr, false).await?;
            csr
        }
    };

    if details.is_expired() {
        warn!(
            not_after = %details.not_after,
            "certificate outside its validity window, re-issuing self-signed"
        );
        let renewed = profile.self_signed(&key_pair)?;
        write_atomic(&cert_path, &renewed, false).await?;
        return Identity::assemble(&key_pair, renewed, csr_pem, IdentityOrigin::Renewed);
    }

    Identity::assemble(&key_pair, certificate_pem, csr_pem, IdentityOrigin::Loaded)
}

/// Create a new key pair, self-signed certificate and CSR, and persist them.
async fn generate(layout: &KeyLayout, profile: &CertificateProfile) -> Result<Identity> {
    let key_pair = profile.generate_key()?;
    let certificate_pem = profile.self_signed(&key_pair)?;
    let csr_pem = profile.csr(&key_pair)?;
    let identity = Identity::assemble(
        &key_pair,
        certificate_pem,
        csr_pem,
        IdentityOrigin::Generated,
    )
    .map_err(|e| PkiError::IdentityGeneration(e.to_string()))?;

    debug!("persisting generated key data");
    write_atomic(&layout.private_key(), identity.private_key_pem(), true).await?;
    write_atomic(&layout.certificate(), identity.certificate_pem(), false).await?;
    write_atomic(&layout.csr(), identity.csr_pem(), false).await?;

    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_in(dir: &std::path::Path) -> IdentityStore {
        IdentityStore::initialize(KeyLayout::new(dir), IdentityOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_generate_then_load_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();

        let first = store_in(dir.path()).await.identity();
        assert_eq!(first.origin(), IdentityOrigin::Generated);
        assert!(first.is_self_signed());

        let second = store_in(dir.path()).await.identity();
        assert_eq!(second.origin(), IdentityOrigin::Loaded);
        assert_eq!(second.certificate_pem(), first.certificate_pem());
        assert_eq!(second.private_key_pem(), first.private_key_pem());
        assert_eq!(second.csr_pem(), first.csr_pem());
    }

    #[tokio::test]
    async fn test_certificate_matches_key() {
        let dir = tempfile::tempdir().unwrap();
        let identity = store_in(dir.path()).await.identity();

        let key = KeyPair::from_pem(identity.private_key_pem()).unwrap();
        assert_eq!(identity.details().spki, key.public_key_der());
        assert_eq!(identity.common_name(), Some("lantern"));
    }

    #[tokio::test]
    async fn test_malformed_files_regenerate() {
        let dir = tempfile::tempdir().unwrap();
        let original = store_in(dir.path()).await.identity();

        let layout = KeyLayout::new(dir.path());
        std::fs::write(layout.certificate(), "-----BEGIN CERTIFICATE-----\ngarbage").unwrap();

        let regenerated = store_in(dir.path()).await.identity();
        assert_eq!(regenerated.origin(), IdentityOrigin::Generated);
        assert_ne!(regenerated.private_key_pem(), original.private_key_pem());
    }

    #[tokio::test]
    async fn test_partial_set_regenerates() {
        let dir = tempfile::tempdir().unwrap();
        store_in(dir.path()).await;

        let layout = KeyLayout::new(dir.path());
        std::fs::remove_file(layout.private_key()).unwrap();

        let identity = store_in(dir.path()).await.identity();
        assert_eq!(identity.origin(), IdentityOrigin::Generated);
        assert!(layout.private_key().exists());
    }

    #[tokio::test]
    async fn test_mismatched_key_and_certificate_regenerate() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        store_in(a.path()).await;
        let other = store_in(b.path()).await.identity();

        let layout = KeyLayout::new(a.path());
        std::fs::write(layout.certificate(), other.certificate_pem()).unwrap();

        let identity = store_in(a.path()).await.identity();
        assert_eq!(identity.origin(), IdentityOrigin::Generated);
    }

    #[tokio::test]
    async fn test_missing_csr_is_rederived() {
        let dir = tempfile::tempdir().unwrap();
        let original = store_in(dir.path()).await.identity();

        let layout = KeyLayout::new(dir.path());
        std::fs::remove_file(layout.csr()).unwrap();

        let identity = store_in(dir.path()).await.identity();
        assert_eq!(identity.origin(), IdentityOrigin::Loaded);
        assert_eq!(identity.private_key_pem(), original.private_key_pem());
        assert!(identity.csr_pem().contains("CERTIFICATE REQUEST"));
        assert!(layout.csr().exists());
    }

    #[tokio::test]
    async fn test_expired_certificate_renewed_with_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let original = store_in(dir.path()).await.identity();

        let key = KeyPair::from_pem(original.private_key_pem()).unwrap();
        let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(10);
        params.not_after = time::OffsetDateTime::now_utc() - time::Duration::days(3);
        let stale = params.self_signed(&key).unwrap().pem();
        std::fs::write(KeyLayout::new(dir.path()).certificate(), stale).unwrap();

        let identity = store_in(dir.path()).await.identity();
        assert_eq!(identity.origin(), IdentityOrigin::Renewed);
        assert_eq!(identity.private_key_pem(), original.private_key_pem());
        assert!(!identity.details().is_expired());
    }

    #[tokio::test]
    async fn test_replace_with_sponsor_certificate() {
        let sponsor_dir = tempfile::tempdir().unwrap();
        let node_dir = tempfile::tempdir().unwrap();
        let sponsor = store_in(sponsor_dir.path()).await;
        let node = store_in(node_dir.path()).await;

        let before = node.identity();
        let issued = sponsor.sign(before.csr_pem()).unwrap();
        let after = node.replace_certificate(&issued).await.unwrap();

        assert_eq!(after.origin(), IdentityOrigin::Replaced);
        assert_ne!(after.fingerprint(), before.fingerprint());
        assert!(!after.is_self_signed());
        assert!(cert::verify_issued_by(
            after.certificate_pem(),
            sponsor.identity().certificate_pem()
        )
        .is_ok());

        // Survives a restart.
        let reloaded = store_in(node_dir.path()).await.identity();
        assert_eq!(reloaded.fingerprint(), after.fingerprint());
    }

    #[tokio::test]
    async fn test_replace_refuses_foreign_key() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let node = store_in(a.path()).await;
        let stranger = store_in(b.path()).await.identity();

        let on_disk = std::fs::read_to_string(node.layout().certificate()).unwrap();
        let err = node
            .replace_certificate(stranger.certificate_pem())
            .await
            .unwrap_err();

        assert!(matches!(err, PkiError::CertificateMismatch));
        assert_eq!(
            std::fs::read_to_string(node.layout().certificate()).unwrap(),
            on_disk
        );
        assert_eq!(node.identity().origin(), IdentityOrigin::Generated);
    }

    #[tokio::test]
    async fn test_trusted_certificates_include_hints() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let hint = store_in(other.path()).await.identity();

        let options = IdentityOptions {
            authority_hints: vec![hint.certificate_pem().to_string(), "junk".into()],
            ..IdentityOptions::default()
        };
        let store = IdentityStore::initialize(KeyLayout::new(dir.path()), options)
            .await
            .unwrap();

        let trusted = store.load_trusted_certificates().await;
        assert_eq!(trusted.len(), 1);
        assert!(trusted.contains(hint.fingerprint()));
    }
}
