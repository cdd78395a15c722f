//! # lantern-pki
//!
//! Identity and trust for Lantern peers.
//!
//! ## Architecture
//!
//! ```text
//! SPONSOR NODE (one-node CA for the peers it introduces)
//!        │  signs CSR over TLS (issuance listener)
//!        ▼
//! JOINING NODE  key pair (never leaves disk)
//!               certificate: self-signed  ──replace──▶  sponsor-issued
//!               trusted/    certificates its control listener accepts
//! ```
//!
//! ## Security Model
//!
//! - A node's private key is generated once and never transmitted
//! - Certificate replacement keeps the key pair, so the sponsor's binding holds
//! - Certificates are short-lived (days); sponsors re-issue on demand
//! - Trust entries are validated once, at load time
//!
//! ## Example
//!
//! ```rust,ignore
//! use lantern_pki::{IdentityOptions, IdentityStore, KeyLayout};
//!
//! let layout = KeyLayout::new("/home/me/.lantern");
//! let store = IdentityStore::initialize(layout, IdentityOptions::default()).await?;
//! let issued = sponsor_store.sign(store.identity().csr_pem())?;
//! store.replace_certificate(&issued).await?;
//! ```

pub mod cert;
mod error;
pub mod fingerprint;
mod identity;
mod issuance;
mod layout;
mod trust;

pub use cert::CertificateDetails;
pub use error::{PkiError, Result};
pub use identity::{Identity, IdentityOptions, IdentityOrigin, IdentityStore};
pub use issuance::{CertificateProfile, Issuer, MAX_VALIDITY_DAYS, ORGANIZATION};
pub use layout::KeyLayout;
pub use trust::{TrustedCertificate, TrustedCertificateSet};

use serde::{Deserialize, Serialize};

/// Key algorithm choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAlgorithm {
    /// ECDSA with P-256 curve, comparable to 3072-bit RSA
    #[default]
    EcdsaP256,
    /// ECDSA with P-384 curve (higher security)
    EcdsaP384,
}

impl KeyAlgorithm {
    /// The rcgen signature algorithm for this key type.
    pub fn signature_algorithm(self) -> &'static rcgen::SignatureAlgorithm {
        match self {
            Self::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            Self::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_algorithm() {
        assert_eq!(KeyAlgorithm::default(), KeyAlgorithm::EcdsaP256);
        assert_eq!(
            KeyAlgorithm::EcdsaP256.signature_algorithm(),
            &rcgen::PKCS_ECDSA_P256_SHA256
        );
    }

    #[test]
    fn test_p384_keys_generate() {
        let profile = CertificateProfile {
            algorithm: KeyAlgorithm::EcdsaP384,
            ..CertificateProfile::default()
        };
        let key = profile.generate_key().unwrap();
        assert!(profile.self_signed(&key).is_ok());
    }
}
