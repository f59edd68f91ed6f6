//! Content-addressed copies of the homepages the classifier judged.
//!
//! A candidate row records only the SHA-256 of the body it was judged on;
//! the bytes live here at `<domain>/<sha256>.html` so a reviewer can see
//! exactly what the judge saw.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvidence {
    pub sha256: String,
    pub path: PathBuf,
    pub bytes: usize,
    /// The same body was already on disk.
    pub existed: bool,
}

#[derive(Debug, Clone)]
pub struct EvidenceStore {
    root: PathBuf,
}

impl EvidenceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn path_for(&self, domain: &str, sha256: &str) -> PathBuf {
        self.root
            .join(domain_dir(domain))
            .join(format!("{sha256}.html"))
    }

    /// Write `body` once per (domain, hash). Concurrent writers of the same
    /// body race on a rename; the loser reports `existed`.
    pub async fn store_page(&self, domain: &str, body: &[u8]) -> anyhow::Result<StoredEvidence> {
        let sha256 = Self::sha256_hex(body);
        let path = self.path_for(domain, &sha256);
        let stored = |existed| StoredEvidence {
            sha256: sha256.clone(),
            path: path.clone(),
            bytes: body.len(),
            existed,
        };

        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(stored(true));
        }

        let dir = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating evidence directory {}", dir.display()))?;

        let temp = dir.join(format!(".{}.tmp", Uuid::new_v4().simple()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp)
            .await
            .with_context(|| format!("creating {}", temp.display()))?;
        file.write_all(body)
            .await
            .with_context(|| format!("writing {}", temp.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing {}", temp.display()))?;
        drop(file);

        match fs::rename(&temp, &path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) => {
                let _ = fs::remove_file(&temp).await;
                if err.kind() == ErrorKind::AlreadyExists {
                    return Ok(stored(true));
                }
                Err(err).with_context(|| format!("moving evidence into {}", path.display()))
            }
        }
    }

    /// Body previously stored for `domain` under `sha256`, if any.
    pub async fn load(&self, domain: &str, sha256: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.path_for(domain, sha256);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }
}

/// Domains become one path component; anything outside `[a-z0-9.-]` is
/// replaced so a hostile host name cannot leave the root.
fn domain_dir(domain: &str) -> String {
    let cleaned: String = domain
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '-' | '.') => c,
            _ => '_',
        })
        .collect();
    let cleaned = cleaned.replace("..", "_");
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_are_lowercase_hex_sha256() {
        assert_eq!(
            EvidenceStore::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn same_body_is_written_once_and_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = EvidenceStore::new(dir.path());

        let first = store.store_page("b.com", b"<html>same</html>").await.unwrap();
        let second = store.store_page("b.com", b"<html>same</html>").await.unwrap();
        assert!(!first.existed);
        assert!(second.existed);
        assert_eq!(first.path, second.path);
        assert!(first.path.starts_with(dir.path().join("b.com")));

        let loaded = store.load("b.com", &first.sha256).await.unwrap();
        assert_eq!(loaded.as_deref(), Some(&b"<html>same</html>"[..]));
        assert_eq!(store.load("b.com", "0000").await.unwrap(), None);
    }

    #[test]
    fn hostile_domains_stay_under_the_root() {
        let store = EvidenceStore::new("/var/evidence");
        let path = store.path_for("../../etc", "abc");
        assert!(path.starts_with("/var/evidence"));
        assert!(!path.to_string_lossy().contains(".."));
        assert_eq!(domain_dir("Blog.Example.COM"), "blog.example.com");
    }
}
