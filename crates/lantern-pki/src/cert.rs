//! X.509 certificate parsing helpers.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use x509_parser::certificate::X509Certificate;

use crate::error::{PkiError, Result};
use crate::fingerprint::sha256_hex;

/// PEM tag of an X.509 certificate block.
pub const CERTIFICATE_TAG: &str = "CERTIFICATE";

/// Facts extracted from a parsed certificate.
#[derive(Debug, Clone, Serialize)]
pub struct CertificateDetails {
    /// DER encoding
    #[serde(skip)]
    pub der: Vec<u8>,
    /// SHA-256 fingerprint of the DER bytes (hex)
    pub fingerprint: String,
    /// Subject distinguished name (human-readable)
    pub subject: String,
    /// Issuer distinguished name (human-readable)
    pub issuer: String,
    /// First subject common name, if any
    pub common_name: Option<String>,
    /// DER-encoded `SubjectPublicKeyInfo`
    #[serde(skip)]
    pub spki: Vec<u8>,
    /// Not valid before
    pub not_before: DateTime<Utc>,
    /// Not valid after
    pub not_after: DateTime<Utc>,
}

impl CertificateDetails {
    /// Whether the certificate is outside its validity window right now.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        let now = Utc::now();
        now > self.not_after || now < self.not_before
    }
}

/// Parse the first `CERTIFICATE` block of a PEM document.
pub fn parse_pem(pem_str: &str) -> Result<CertificateDetails> {
    let der = certificate_der_from_pem(pem_str)?;
    parse_der(&der)
}

/// Extract the DER bytes of the first `CERTIFICATE` block.
pub fn certificate_der_from_pem(pem_str: &str) -> Result<Vec<u8>> {
    let blocks =
        pem::parse_many(pem_str).map_err(|e| PkiError::InvalidCertificate(e.to_string()))?;
    blocks
        .into_iter()
        .find(|p| p.tag() == CERTIFICATE_TAG)
        .map(pem::Pem::into_contents)
        .ok_or_else(|| PkiError::InvalidCertificate("no CERTIFICATE block".into()))
}

/// Parse a single DER-encoded X.509 certificate.
pub fn parse_der(der: &[u8]) -> Result<CertificateDetails> {
    let cert = x509(der)?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(ToString::to_string);

    Ok(CertificateDetails {
        der: der.to_vec(),
        fingerprint: sha256_hex(der),
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        common_name,
        spki: cert.public_key().raw.to_vec(),
        not_before: asn1_to_utc(cert.validity().not_before),
        not_after: asn1_to_utc(cert.validity().not_after),
    })
}

/// Check that `cert_pem` carries a valid signature made by the key in `issuer_pem`.
pub fn verify_issued_by(cert_pem: &str, issuer_pem: &str) -> Result<()> {
    let cert_der = certificate_der_from_pem(cert_pem)?;
    let issuer_der = certificate_der_from_pem(issuer_pem)?;
    let cert = x509(&cert_der)?;
    let issuer = x509(&issuer_der)?;

    cert.verify_signature(Some(issuer.public_key()))
        .map_err(|e| PkiError::InvalidCertificate(format!("signature check failed: {e}")))
}

/// Whether the certificate verifies under its own public key.
pub fn is_self_signed(der: &[u8]) -> Result<bool> {
    let cert = x509(der)?;
    Ok(cert.verify_signature(None).is_ok())
}

fn x509(der: &[u8]) -> Result<X509Certificate<'_>> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| PkiError::InvalidCertificate(e.to_string()))?;
    Ok(cert)
}

/// Convert an ASN.1 `GeneralizedTime` / `UTCTime` to `DateTime<Utc>`.
fn asn1_to_utc(t: x509_parser::time::ASN1Time) -> DateTime<Utc> {
    Utc.timestamp_opt(t.timestamp(), 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_pem("not a certificate"),
            Err(PkiError::InvalidCertificate(_))
        ));
    }

    #[test]
    fn test_parse_rejects_non_certificate_block() {
        let key = rcgen::KeyPair::generate().unwrap();
        let err = parse_pem(&key.serialize_pem()).unwrap_err();
        assert!(err.to_string().contains("no CERTIFICATE block"));
    }

    #[test]
    fn test_parse_self_signed() {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["peer.test".to_string()]).unwrap();

        let details = parse_pem(&cert.pem()).unwrap();
        assert_eq!(details.der, cert.der().to_vec());
        assert_eq!(details.spki, key_pair.public_key_der());
        assert_eq!(details.fingerprint.len(), 64);
        assert!(is_self_signed(&details.der).unwrap());
        tokio_test::assert_ok!(verify_issued_by(&cert.pem(), &cert.pem()));
    }
}
