//! Error types for identity and trust management.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for lantern-pki operations.
pub type Result<T> = std::result::Result<T, PkiError>;

/// Errors that can occur while managing a node's identity or trust set.
#[derive(Error, Debug)]
pub enum PkiError {
    /// Key pair or self-signed certificate could not be created.
    ///
    /// Fatal: a node cannot run without a key and certificate.
    #[error("identity generation failed: {0}")]
    IdentityGeneration(String),

    /// Key material on disk could not be used (missing, malformed, partial).
    #[error("cannot load {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    /// Writing key material to disk failed.
    #[error("cannot persist {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A peer submitted something that is not a valid, self-signed CSR.
    #[error("malformed submission: {0}")]
    MalformedSubmission(String),

    /// Signing a well-formed submission failed.
    #[error("signing failed: {0}")]
    Signing(String),

    /// Certificate could not be parsed or is otherwise unusable.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// Replacement certificate does not carry this node's public key.
    #[error("certificate public key does not match the identity key")]
    CertificateMismatch,

    /// A single entry of the trust directory was skipped.
    #[error("trusted certificate {path}: {reason}")]
    TrustedCertificateLoad { path: PathBuf, reason: String },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PkiError {
    pub(crate) fn load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Load {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn persist(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persist {
            path: path.into(),
            source,
        }
    }

    /// Returns true if the error is the caller's fault rather than ours.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::MalformedSubmission(_))
    }
}
