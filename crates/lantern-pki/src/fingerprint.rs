//! SHA-256 certificate fingerprints via `ring::digest`.

use ring::digest::SHA256;

/// Compute SHA-256 of raw bytes (certificate DER data).
///
/// Returns lowercase hex-encoded digest.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = ring::digest::digest(&SHA256, data);
    hex::encode(digest.as_ref())
}

/// Shorten a fingerprint for log output.
#[must_use]
pub fn short(fingerprint: &str) -> &str {
    &fingerprint[..16.min(fingerprint.len())]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_short_fingerprint() {
        let fp = sha256_hex(b"");
        assert_eq!(short(&fp), "e3b0c44298fc1c14");
        assert_eq!(short("abc"), "abc");
    }
}
