//! SHA-256 content hashes of SSTable files.

use crate::{BackupError, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Hex encoded SHA-256 of a file's content.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Whether `path` exists and hashes to `expected`.
pub fn matches_hash(path: &Path, expected: &str) -> io::Result<bool> {
    if !path.is_file() {
        return Ok(false);
    }
    Ok(hash_file(path)?.eq_ignore_ascii_case(expected))
}

/// [`matches_hash`] on the blocking pool.
pub async fn matches_hash_async(path: PathBuf, expected: String) -> Result<bool> {
    tokio::task::spawn_blocking(move || matches_hash(&path, &expected))
        .await
        .map_err(|e| BackupError::Io(io::Error::other(e)))?
        .map_err(BackupError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_hash_known_value() -> io::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc")?;

        assert_eq!(
            hash_file(&path)?,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(matches_hash(&path, "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD")?);
        assert!(!matches_hash(&dir.path().join("missing"), "00")?);
        Ok(())
    }

    #[tokio::test]
    async fn test_matches_hash_async() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"").unwrap();

        let empty = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855".to_string();
        assert!(matches_hash_async(path.clone(), empty).await.unwrap());
        assert!(!matches_hash_async(path, "00".into()).await.unwrap());
    }
}
