//! On-disk layout of a node's key material.
//!
//! ```text
//! <config_dir>/keys/
//!   own/privatekey.pem
//!   own/certificate.pem
//!   own/csr.pem
//!   trusted/*            one certificate per file, names immaterial
//! ```

use std::path::{Path, PathBuf};

use crate::error::{PkiError, Result};

/// Paths of every file the identity store reads or writes.
#[derive(Debug, Clone)]
pub struct KeyLayout {
    own_dir: PathBuf,
    trusted_dir: PathBuf,
}

impl KeyLayout {
    /// Layout rooted at a node's configuration directory.
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        let keys = config_dir.as_ref().join("keys");
        Self {
            own_dir: keys.join("own"),
            trusted_dir: keys.join("trusted"),
        }
    }

    pub fn private_key(&self) -> PathBuf {
        self.own_dir.join("privatekey.pem")
    }

    pub fn certificate(&self) -> PathBuf {
        self.own_dir.join("certificate.pem")
    }

    pub fn csr(&self) -> PathBuf {
        self.own_dir.join("csr.pem")
    }

    pub fn trusted_dir(&self) -> &Path {
        &self.trusted_dir
    }

    /// Create the `own` and `trusted` directories if they don't exist.
    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.own_dir, &self.trusted_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| PkiError::persist(dir, e))?;
        }
        Ok(())
    }
}

/// Write `contents` to `path` by way of a sibling temp file and a rename.
///
/// A crash mid-write leaves the previous file intact. `private` restricts
/// the file to its owner on Unix.
pub(crate) async fn write_atomic(path: &Path, contents: &str, private: bool) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    if private {
        options.mode(0o600);
    }
    #[cfg(not(unix))]
    let _ = private;

    let write = async {
        use tokio::io::AsyncWriteExt;
        let mut file = options.open(&tmp).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, path).await
    };

    if let Err(e) = write.await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(PkiError::persist(path, e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = KeyLayout::new("/tmp/lantern");
        assert_eq!(
            layout.private_key(),
            PathBuf::from("/tmp/lantern/keys/own/privatekey.pem")
        );
        assert_eq!(
            layout.certificate(),
            PathBuf::from("/tmp/lantern/keys/own/certificate.pem")
        );
        assert_eq!(layout.csr(), PathBuf::from("/tmp/lantern/keys/own/csr.pem"));
        assert_eq!(
            layout.trusted_dir(),
            Path::new("/tmp/lantern/keys/trusted")
        );
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("certificate.pem");

        write_atomic(&path, "first", false).await.unwrap();
        write_atomic(&path, "second", false).await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        assert!(!dir.path().join("certificate.pem.tmp").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_private_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("privatekey.pem");
        write_atomic(&path, "secret", true).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
