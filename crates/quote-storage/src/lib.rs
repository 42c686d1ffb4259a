//! Immutable catalog snapshot storage with atomic publication.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "quote-storage";

const SNAPSHOT_DIR: &str = "catalog";

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot {path} failed integrity check: expected {expected}, found {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },
}

/// Snapshot files are addressed by content hash and never rewritten; the
/// pointer to the live snapshot is replaced by temp-file rename.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn snapshot_relative_path(&self, content_hash: &str, extension: &str) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(SNAPSHOT_DIR).join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes immutably using a hash-addressed path and atomic temp-file rename.
    #[instrument(skip(self, bytes), fields(bytes = bytes.len()))]
    pub async fn store_bytes(&self, extension: &str, bytes: &[u8]) -> anyhow::Result<StoredSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.snapshot_relative_path(&content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
        {
            debug!(hash = %content_hash, "snapshot already stored");
            return Ok(StoredSnapshot {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let replaced = write_atomic(&absolute_path, bytes).await?;
        Ok(StoredSnapshot {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: replaced,
        })
    }

    /// Replace the named JSON pointer file in one rename.
    pub async fn publish<T: Serialize>(&self, name: &str, value: &T) -> anyhow::Result<PathBuf> {
        let path = self.root.join(name);
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing {name}"))?;
        write_atomic(&path, &bytes).await?;
        Ok(path)
    }

    pub async fn load_published<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<Option<T>> {
        let path = self.root.join(name);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let value = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(value))
    }

    /// Read a stored snapshot and check it still hashes to `expected_hash`.
    pub async fn read_verified(
        &self,
        relative_path: impl AsRef<Path>,
        expected_hash: &str,
    ) -> anyhow::Result<Vec<u8>> {
        let path = self.root.join(relative_path.as_ref());
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading snapshot {}", path.display()))?;
        let actual = Self::sha256_hex(&bytes);
        if actual != expected_hash {
            return Err(StoreError::HashMismatch {
                path: path.display().to_string(),
                expected: expected_hash.to_string(),
                actual,
            }
            .into());
        }
        Ok(bytes)
    }
}

/// Writes through a sibling temp file and renames it into place. Returns
/// `true` when another writer won the rename race.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let parent = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(false),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(&temp_path).await;
            Ok(true)
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[test]
    fn snapshot_hashing_is_stable() {
        let hash = SnapshotStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_writes_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());

        let first = store.store_bytes("parquet", b"PAR1same").await.expect("first store");
        let second = store.store_bytes("parquet", b"PAR1same").await.expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
        assert!(first.relative_path.starts_with("catalog"));
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Pointer {
        path: String,
        rows: usize,
    }

    #[tokio::test]
    async fn publish_replaces_pointer() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        assert!(store.load_published::<Pointer>("current.json").await.unwrap().is_none());

        store
            .publish("current.json", &Pointer { path: "a".into(), rows: 1 })
            .await
            .expect("first publish");
        store
            .publish("current.json", &Pointer { path: "b".into(), rows: 2 })
            .await
            .expect("second publish");

        let loaded: Pointer = store.load_published("current.json").await.unwrap().unwrap();
        assert_eq!(loaded, Pointer { path: "b".into(), rows: 2 });
    }

    #[tokio::test]
    async fn tampered_snapshot_fails_verification() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let stored = store.store_bytes("parquet", b"original").await.unwrap();

        let ok = store
            .read_verified(&stored.relative_path, &stored.content_hash)
            .await
            .unwrap();
        assert_eq!(ok, b"original");

        std::fs::write(&stored.absolute_path, b"tampered").unwrap();
        let err = store
            .read_verified(&stored.relative_path, &stored.content_hash)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<StoreError>().is_some());
    }
}
