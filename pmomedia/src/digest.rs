//! Vérification d'intégrité par MD5
//!
//! Le fichier est lu par blocs bornés ; chaque bloc est haché sur le pool
//! bloquant de tokio, le hasher faisant l'aller-retour avec le bloc.

use std::io;
use std::path::Path;

use md5::{Digest, Md5};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::error::{MediaError, Result};
use crate::store::MediaStore;

/// Digest rapporté quand la copie en transit est introuvable
pub const BROKEN_LINK: &str = "broken_link";

/// Résultat d'une vérification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub matched: bool,
    pub name: String,
    pub digest: String,
}

/// Digest attendu déduit du nom (`<digest>.mp4`)
pub fn digest_from_name(name: &str) -> &str {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(name);
    base.split('.').next().unwrap_or(base)
}

/// MD5 d'un fichier en hexadécimal minuscule
pub async fn file_md5(path: &Path, chunk_size: usize) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; chunk_size.max(1)];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        let chunk = buffer;
        let (returned_hasher, returned_chunk) = tokio::task::spawn_blocking(move || {
            hasher.update(&chunk[..read]);
            (hasher, chunk)
        })
        .await
        .map_err(|e| MediaError::Worker(e.to_string()))?;
        hasher = returned_hasher;
        buffer = returned_chunk;
    }

    Ok(format!("{:x}", hasher.finalize()))
}

impl MediaStore {
    /// Compare le MD5 de la copie en transit de `name` au digest attendu
    ///
    /// Sans digest attendu, il est déduit du nom de la ressource.
    /// Une copie absente donne `matched = false` et le digest [`BROKEN_LINK`].
    pub async fn verify(&self, name: &str, expected: Option<&str>) -> Result<Verification> {
        let _guard = self.locks.acquire(name).await;
        let expected = expected
            .unwrap_or_else(|| digest_from_name(name))
            .to_lowercase();

        let path = self.staging_path(name);
        let computed = match file_md5(&path, self.config.digest_chunk_size).await {
            Ok(digest) => digest,
            Err(MediaError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                warn!(name = %name, "Nothing to verify in staging area");
                return Ok(Verification {
                    matched: false,
                    name: name.to_string(),
                    digest: BROKEN_LINK.to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        let matched = computed == expected;
        if matched {
            debug!(name = %name, digest = %computed, "Digest verified");
        } else {
            warn!(name = %name, "Digest mismatch: expected {}, got {}", expected, computed);
        }

        Ok(Verification {
            matched,
            name: name.to_string(),
            digest: computed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    const HELLO_MD5: &str = "5eb63bbbe01eeed093cb22bb8f5acdc3";

    #[test]
    fn test_digest_from_name() {
        assert_eq!(digest_from_name("abc123.mp4"), "abc123");
        assert_eq!(digest_from_name("abc123.part.mp4"), "abc123");
        assert_eq!(digest_from_name("noext"), "noext");
    }

    #[tokio::test]
    async fn test_file_md5_small_chunks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello world").unwrap();

        assert_eq!(file_md5(&path, 3).await.unwrap(), HELLO_MD5);
        assert_eq!(file_md5(&path, 1024 * 1024).await.unwrap(), HELLO_MD5);
    }

    #[tokio::test]
    async fn test_verify_match_is_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path(), "http://localhost", Arc::default());
        std::fs::write(store.staging_path("clip.mp4"), b"hello world").unwrap();

        let result = store
            .verify("clip.mp4", Some(&HELLO_MD5.to_uppercase()))
            .await
            .unwrap();
        assert!(result.matched);
        assert_eq!(result.digest, HELLO_MD5);
        assert!(store.locks().is_free("clip.mp4"));
    }

    #[tokio::test]
    async fn test_verify_digest_from_name() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path(), "http://localhost", Arc::default());
        let name = format!("{}.mp4", HELLO_MD5);
        std::fs::write(store.staging_path(&name), b"hello world").unwrap();
        std::fs::write(store.staging_path("other.mp4"), b"hello world").unwrap();

        assert!(store.verify(&name, None).await.unwrap().matched);
        let mismatch = store.verify("other.mp4", None).await.unwrap();
        assert!(!mismatch.matched);
        assert_eq!(mismatch.digest, HELLO_MD5);
    }

    #[tokio::test]
    async fn test_verify_missing_file_is_broken_link() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path(), "http://localhost", Arc::default());

        let result = store.verify("ghost.mp4", Some(HELLO_MD5)).await.unwrap();
        assert_eq!(
            result,
            Verification {
                matched: false,
                name: "ghost.mp4".to_string(),
                digest: BROKEN_LINK.to_string(),
            }
        );
    }
}
