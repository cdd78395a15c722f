//! Certificate construction: self-signed node certificates, CSRs, and
//! sponsor-side issuance of certificates for joining peers.
//!
//! A node is a one-node certificate authority for the peers it sponsors.
//! Issued certificates are end-entity certificates (not CAs) so they can be
//! presented directly in TLS handshakes; the sponsor's own certificate acts
//! as the trust anchor that verifies them.

use rcgen::{
    Certificate, CertificateParams, CertificateSigningRequestParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber, SubjectPublicKeyInfo,
};
use ring::rand::{SecureRandom, SystemRandom};
use tracing::debug;

use crate::cert;
use crate::error::{PkiError, Result};
use crate::KeyAlgorithm;

/// Organization name stamped into every subject we create.
pub const ORGANIZATION: &str = "Lantern";

/// Subject alternative names of a node certificate.
const NODE_SANS: [&str; 2] = ["localhost", "127.0.0.1"];

/// Longest certificate lifetime a profile may ask for.
pub const MAX_VALIDITY_DAYS: u32 = 365;

/// Allowance for clock skew between peers.
const BACKDATE: time::Duration = time::Duration::minutes(1);

/// What a node's certificates look like.
#[derive(Debug, Clone)]
pub struct CertificateProfile {
    /// Subject common name
    pub common_name: String,
    /// Key algorithm for newly generated key pairs
    pub algorithm: KeyAlgorithm,
    /// Validity of self-signed and issued certificates, in days
    pub validity_days: u32,
}

impl Default for CertificateProfile {
    fn default() -> Self {
        Self {
            common_name: String::from("lantern"),
            algorithm: KeyAlgorithm::default(),
            validity_days: 7,
        }
    }
}

impl CertificateProfile {
    /// Generate a fresh key pair for this profile.
    pub fn generate_key(&self) -> Result<KeyPair> {
        KeyPair::generate_for(self.algorithm.signature_algorithm())
            .map_err(|e| PkiError::IdentityGeneration(format!("key generation: {e}")))
    }

    /// Subject and SANs only. rcgen refuses serials and CA flags in a CSR.
    fn request_params(&self) -> Result<CertificateParams> {
        let sans = NODE_SANS.iter().map(ToString::to_string).collect::<Vec<_>>();
        let mut params = CertificateParams::new(sans)
            .map_err(|e| PkiError::IdentityGeneration(e.to_string()))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, self.common_name.as_str());
        dn.push(DnType::OrganizationName, ORGANIZATION);
        params.distinguished_name = dn;
        Ok(params)
    }

    /// Parameters for this node's own self-signed certificate.
    fn node_params(&self) -> Result<CertificateParams> {
        let mut params = self.request_params()?;
        apply_end_entity(&mut params, self.validity_days).ok_or_else(|| {
            PkiError::IdentityGeneration(format!(
                "validity of {} days is out of range",
                self.validity_days
            ))
        })?;
        Ok(params)
    }

    /// Build a self-signed certificate for `key_pair`. Returns PEM.
    pub fn self_signed(&self, key_pair: &KeyPair) -> Result<String> {
        let cert = self
            .node_params()?
            .self_signed(key_pair)
            .map_err(|e| PkiError::IdentityGeneration(format!("self-signing: {e}")))?;
        Ok(cert.pem())
    }

    /// Build a certificate signing request for `key_pair`. Returns PEM.
    pub fn csr(&self, key_pair: &KeyPair) -> Result<String> {
        self.request_params()?
            .serialize_request(key_pair)
            .and_then(|csr| csr.pem())
            .map_err(|e| PkiError::IdentityGeneration(format!("csr: {e}")))
    }
}

/// Mark params as a short-lived TLS end-entity certificate usable on both
/// sides of a mutual-TLS connection. `None` if the validity end overflows.
fn apply_end_entity(params: &mut CertificateParams, validity_days: u32) -> Option<()> {
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - BACKDATE;
    params.not_after = now.checked_add(time::Duration::days(i64::from(validity_days)))?;

    params.serial_number = random_serial();
    Some(())
}

/// 128-bit positive serial. `None` leaves the choice to rcgen.
fn random_serial() -> Option<SerialNumber> {
    let mut bytes = [0u8; 16];
    SystemRandom::new().fill(&mut bytes).ok()?;
    bytes[0] &= 0x7f;
    Some(SerialNumber::from_slice(&bytes))
}

/// The signing half of a node acting as a sponsor.
pub struct Issuer {
    certificate: Certificate,
    key_pair: KeyPair,
    validity_days: u32,
}

impl Issuer {
    /// Rebuild an issuer from this node's certificate and private key.
    ///
    /// Only the subject of `certificate_pem` matters: it becomes the issuer
    /// name of everything signed here.
    pub fn from_pem(certificate_pem: &str, key_pem: &str, validity_days: u32) -> Result<Self> {
        let key_pair =
            KeyPair::from_pem(key_pem).map_err(|e| PkiError::Signing(format!("issuer key: {e}")))?;
        let params = CertificateParams::from_ca_cert_pem(certificate_pem)
            .map_err(|e| PkiError::Signing(format!("issuer certificate: {e}")))?;
        let certificate = params
            .self_signed(&key_pair)
            .map_err(|e| PkiError::Signing(format!("issuer certificate: {e}")))?;

        Ok(Self {
            certificate,
            key_pair,
            validity_days,
        })
    }

    /// Issue a certificate for a PEM-encoded CSR or certificate.
    ///
    /// A CSR must carry a valid self-signature. A certificate is re-issued
    /// for its public key. Subject and SANs are taken from the submission;
    /// everything else is set by the issuer.
    pub fn sign(&self, submission: &str) -> Result<String> {
        let submission = submission.trim();
        if submission.is_empty() {
            return Err(PkiError::MalformedSubmission("empty submission".into()));
        }

        let blocks = pem::parse_many(submission)
            .map_err(|e| PkiError::MalformedSubmission(format!("not PEM: {e}")))?;
        match blocks.first().map(pem::Pem::tag) {
            Some("CERTIFICATE REQUEST" | "NEW CERTIFICATE REQUEST") => {
                self.sign_csr(submission)
            }
            Some("CERTIFICATE") => self.reissue(submission),
            Some(tag) => Err(PkiError::MalformedSubmission(format!(
                "expected a certificate request or certificate, got {tag}"
            ))),
            None => Err(PkiError::MalformedSubmission("no PEM block".into())),
        }
    }

    fn sign_csr(&self, submission: &str) -> Result<String> {
        let mut csr = CertificateSigningRequestParams::from_pem(submission)
            .map_err(|e| PkiError::MalformedSubmission(format!("invalid CSR: {e}")))?;

        self.end_entity(&mut csr.params)?;
        debug!(
            subject = ?csr.params.distinguished_name,
            validity_days = self.validity_days,
            "issuing certificate"
        );

        let cert = csr
            .signed_by(&self.certificate, &self.key_pair)
            .map_err(|e| PkiError::Signing(e.to_string()))?;
        Ok(cert.pem())
    }

    /// Issue a certificate for the key and subject of `submission`.
    fn reissue(&self, submission: &str) -> Result<String> {
        let details = cert::parse_pem(submission)
            .map_err(|e| PkiError::MalformedSubmission(format!("invalid certificate: {e}")))?;
        let public_key = SubjectPublicKeyInfo::from_der(&details.spki)
            .map_err(|e| PkiError::MalformedSubmission(format!("unsupported public key: {e}")))?;
        let submitted = CertificateParams::from_ca_cert_pem(submission)
            .map_err(|e| PkiError::MalformedSubmission(format!("invalid certificate: {e}")))?;

        let mut params = CertificateParams::default();
        params.distinguished_name = submitted.distinguished_name;
        params.subject_alt_names = submitted.subject_alt_names;
        self.end_entity(&mut params)?;
        debug!(
            subject = ?params.distinguished_name,
            validity_days = self.validity_days,
            "re-issuing submitted certificate"
        );

        let cert = params
            .signed_by(&public_key, &self.certificate, &self.key_pair)
            .map_err(|e| PkiError::Signing(e.to_string()))?;
        Ok(cert.pem())
    }

    fn end_entity(&self, params: &mut CertificateParams) -> Result<()> {
        apply_end_entity(params, self.validity_days).ok_or_else(|| {
            PkiError::Signing(format!(
                "validity of {} days is out of range",
                self.validity_days
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::PublicKeyData;

    fn issuer() -> (Issuer, String) {
        let profile = CertificateProfile {
            common_name: "sponsor".into(),
            ..CertificateProfile::default()
        };
        let key = profile.generate_key().unwrap();
        let cert_pem = profile.self_signed(&key).unwrap();
        let issuer = Issuer::from_pem(&cert_pem, &key.serialize_pem(), 3).unwrap();
        (issuer, cert_pem)
    }

    #[test]
    fn test_self_signed_node_certificate() {
        let profile = CertificateProfile::default();
        let key = profile.generate_key().unwrap();
        let pem = profile.self_signed(&key).unwrap();

        let details = cert::parse_pem(&pem).unwrap();
        assert_eq!(details.common_name.as_deref(), Some("lantern"));
        assert_eq!(details.spki, key.public_key_der());
        assert!(cert::is_self_signed(&details.der).unwrap());

        let lifetime = details.not_after - details.not_before;
        assert!(lifetime.num_days() >= 7 && lifetime.num_days() <= 8);
    }

    #[test]
    fn test_csr_roundtrip_through_issuer() {
        let (issuer, issuer_pem) = issuer();

        let joiner = CertificateProfile {
            common_name: "joiner".into(),
            ..CertificateProfile::default()
        };
        let key = joiner.generate_key().unwrap();
        let csr = joiner.csr(&key).unwrap();
        assert!(csr.contains("BEGIN CERTIFICATE REQUEST"));

        let issued = issuer.sign(&csr).unwrap();
        let details = cert::parse_pem(&issued).unwrap();

        assert_eq!(details.common_name.as_deref(), Some("joiner"));
        assert_eq!(details.spki, key.public_key_der());
        assert!(details.issuer.contains("sponsor"));
        assert!(!cert::is_self_signed(&details.der).unwrap());
        tokio_test::assert_ok!(cert::verify_issued_by(&issued, &issuer_pem));
    }

    #[test]
    fn test_csr_is_a_parseable_request() {
        let profile = CertificateProfile::default();
        let key = profile.generate_key().unwrap();
        let csr = profile.csr(&key).unwrap();

        let parsed = CertificateSigningRequestParams::from_pem(&csr).unwrap();
        assert_eq!(parsed.public_key.der_bytes(), key.der_bytes());
        assert!(parsed.params.serial_number.is_none());
        assert_eq!(parsed.params.is_ca, IsCa::NoCa);
    }

    #[test]
    fn test_out_of_range_validity_is_an_error() {
        let profile = CertificateProfile {
            validity_days: 4_000_000,
            ..CertificateProfile::default()
        };
        let key = profile.generate_key().unwrap();
        assert!(matches!(
            profile.self_signed(&key),
            Err(PkiError::IdentityGeneration(_))
        ));
        // The request carries no validity, so it still works.
        tokio_test::assert_ok!(profile.csr(&key));

        let cert_pem = CertificateProfile::default().self_signed(&key).unwrap();
        let issuer = Issuer::from_pem(&cert_pem, &key.serialize_pem(), 4_000_000).unwrap();
        let joiner_key = profile.generate_key().unwrap();
        let csr = profile.csr(&joiner_key).unwrap();
        assert!(matches!(issuer.sign(&csr), Err(PkiError::Signing(_))));
    }

    #[test]
    fn test_certificate_submission_is_reissued_for_its_key() {
        let (issuer, issuer_pem) = issuer();

        let peer = CertificateProfile {
            common_name: "peer".into(),
            ..CertificateProfile::default()
        };
        let key = peer.generate_key().unwrap();
        let submitted = peer.self_signed(&key).unwrap();

        let issued = issuer.sign(&submitted).unwrap();
        let details = cert::parse_pem(&issued).unwrap();
        assert_eq!(details.common_name.as_deref(), Some("peer"));
        assert_eq!(details.spki, key.public_key_der());
        assert!(details.issuer.contains("sponsor"));
        tokio_test::assert_ok!(cert::verify_issued_by(&issued, &issuer_pem));
    }

    #[test]
    fn test_sign_rejects_other_pem_kinds() {
        let (issuer, _) = issuer();
        let key = CertificateProfile::default().generate_key().unwrap();
        let err = issuer.sign(&key.serialize_pem()).unwrap_err();
        assert!(matches!(err, PkiError::MalformedSubmission(_)));
        assert!(err.to_string().contains("PRIVATE KEY"));
    }

    #[test]
    fn test_sign_rejects_garbage_and_empty() {
        let (issuer, _) = issuer();
        assert!(matches!(
            issuer.sign(""),
            Err(PkiError::MalformedSubmission(_))
        ));
        assert!(matches!(
            issuer.sign("hello there"),
            Err(PkiError::MalformedSubmission(_))
        ));
    }

    #[test]
    fn test_sign_rejects_truncated_csr() {
        let (issuer, _) = issuer();
        let profile = CertificateProfile::default();
        let key = profile.generate_key().unwrap();
        let csr = profile.csr(&key).unwrap();

        let truncated = &csr[..csr.len() / 2];
        assert!(issuer.sign(truncated).unwrap_err().is_client_error());
    }
}
