//! Trusted certificate set: the authorities whose signatures the control
//! listener accepts on client certificates.
//!
//! Entries are validated once, at load time. A bad file never poisons the
//! set; it is logged and skipped.

use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::cert::{self, CertificateDetails, CERTIFICATE_TAG};
use crate::error::PkiError;

/// A validated trust entry.
#[derive(Debug, Clone)]
pub struct TrustedCertificate {
    /// Where the certificate came from (file path or `hint`)
    pub source: String,
    /// Parsed certificate
    pub details: CertificateDetails,
}

/// Unordered set of trusted certificates, unique by fingerprint.
#[derive(Debug, Clone, Default)]
pub struct TrustedCertificateSet {
    entries: Vec<TrustedCertificate>,
    seen: HashSet<String>,
}

impl TrustedCertificateSet {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every file in `dir` independently.
    ///
    /// A missing or unreadable directory yields an empty set.
    pub async fn load_dir(dir: &Path) -> Self {
        let mut set = Self::new();

        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "unable to read trusted certificates");
                return set;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "stopped scanning trust directory");
                    break;
                }
            };

            let path = entry.path();
            if !entry.file_type().await.is_ok_and(|t| t.is_file()) {
                debug!(path = %path.display(), "skipping non-file trust entry");
                continue;
            }

            let added = match tokio::fs::read(&path).await {
                Ok(bytes) => set.add_pem(&path.display().to_string(), &bytes),
                Err(e) => Err(PkiError::TrustedCertificateLoad {
                    path: path.clone(),
                    reason: e.to_string(),
                }),
            };
            if let Err(e) = added {
                warn!(error = %e, "skipping trusted certificate");
            }
        }

        info!(count = set.len(), path = %dir.display(), "loaded trusted certificates");
        set
    }

    /// Add every certificate in a PEM document.
    ///
    /// Returns the number of new entries. Fails if the document holds no
    /// usable certificate at all.
    pub fn add_pem(&mut self, source: &str, pem_bytes: &[u8]) -> Result<usize, PkiError> {
        let reject = |reason: String| PkiError::TrustedCertificateLoad {
            path: source.into(),
            reason,
        };

        let blocks = pem::parse_many(pem_bytes).map_err(|e| reject(e.to_string()))?;
        let mut usable = 0;
        let mut added = 0;
        let mut last_problem = String::from("no CERTIFICATE block");

        for block in blocks.iter().filter(|b| b.tag() == CERTIFICATE_TAG) {
            let details = match cert::parse_der(block.contents()) {
                Ok(details) => details,
                Err(e) => {
                    last_problem = e.to_string();
                    continue;
                }
            };
            if details.is_expired() {
                last_problem = format!("expired on {}", details.not_after);
                continue;
            }

            usable += 1;
            if self.insert(TrustedCertificate {
                source: source.to_string(),
                details,
            }) {
                added += 1;
            }
        }

        if usable == 0 {
            return Err(reject(last_problem));
        }
        Ok(added)
    }

    /// Insert an entry; returns false if its fingerprint is already present.
    pub fn insert(&mut self, entry: TrustedCertificate) -> bool {
        if !self.seen.insert(entry.details.fingerprint.clone()) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.seen.contains(fingerprint)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrustedCertificate> {
        self.entries.iter()
    }

    /// DER encodings, for building a TLS root store.
    pub fn ders(&self) -> impl Iterator<Item = &[u8]> {
        self.entries.iter().map(|e| e.details.der.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
