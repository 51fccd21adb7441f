//! Content-addressed blob storage
//!
//! Content files, entity files and snapshot manifests all live here, keyed by
//! their hash. Blobs are laid out as `blobs/<first 4 chars>/<hash>` to keep
//! directories small.
//!
//! A blob's `stored_at` is the last time anything wrote or reused it. The
//! garbage collector only deletes a blob whose `stored_at` is still before its
//! cutoff at the moment of deletion, so a blob reused mid-sweep survives.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{CatalystError, Result};
use crate::types::Timestamp;

/// A blob present in storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub hash: String,
    /// When the blob was written, in epoch millis
    pub stored_at: Timestamp,
}

/// Blob storage collaborator
#[async_trait]
pub trait ContentStorage: Send + Sync {
    /// Store bytes under `hash`. Storing an existing hash only refreshes its `stored_at`.
    async fn store(&self, hash: &str, data: &[u8]) -> Result<()>;

    /// Refresh `stored_at` of an existing blob. Returns false when it is absent.
    async fn touch(&self, hash: &str) -> Result<bool>;

    async fn get(&self, hash: &str) -> Result<Option<Vec<u8>>>;

    async fn exists(&self, hash: &str) -> Result<bool>;

    /// Returns whether anything was removed
    async fn delete(&self, hash: &str) -> Result<bool>;

    /// Delete the blob only if its `stored_at` is at or before `cutoff`,
    /// checked atomically with the removal
    async fn delete_unless_newer(&self, hash: &str, cutoff: Timestamp) -> Result<bool>;

    async fn list(&self) -> Result<Vec<StoredBlob>>;
}

/// Filesystem blob storage
pub struct BlobStore {
    root_dir: PathBuf,
    /// Orders reuse and conditional deletion of the same blob
    lock: Mutex<()>,
}

impl BlobStore {
    pub async fn new<P: AsRef<Path>>(root_dir: P) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();
        fs::create_dir_all(root_dir.join("blobs")).await?;

        info!(path = %root_dir.display(), "Initialized blob store");

        Ok(Self {
            root_dir,
            lock: Mutex::new(()),
        })
    }

    /// SHA256 hash of data, `sha256-<hex>`
    pub fn compute_hash(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("sha256-{}", hex::encode(hasher.finalize()))
    }

    /// Check `data` against `hash` when the hash is one we can compute.
    ///
    /// Hashes in other formats are accepted as-is.
    pub fn verify(hash: &str, data: &[u8]) -> Result<()> {
        if !hash.starts_with("sha256-") {
            return Ok(());
        }
        let actual = Self::compute_hash(data);
        if actual != hash {
            return Err(CatalystError::HashMismatch {
                expected: hash.to_string(),
                actual,
            });
        }
        Ok(())
    }

    fn blob_path(&self, hash: &str) -> Result<PathBuf> {
        let valid = !hash.is_empty()
            && hash
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(CatalystError::Parse(format!("Invalid blob hash: {}", hash)));
        }
        let hash_part = hash.strip_prefix("sha256-").unwrap_or(hash);
        let subdir = &hash_part[..4.min(hash_part.len())];
        Ok(self.root_dir.join("blobs").join(subdir).join(hash))
    }
}

fn modified_millis(metadata: &std::fs::Metadata) -> Timestamp {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

/// Set the file's mtime to now. Returns false when the file does not exist.
async fn touch_file(path: &Path) -> Result<bool> {
    let file = match fs::OpenOptions::new().append(true).open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    file.into_std().await.set_modified(SystemTime::now())?;
    Ok(true)
}

#[async_trait]
impl ContentStorage for BlobStore {
    async fn store(&self, hash: &str, data: &[u8]) -> Result<()> {
        let blob_path = self.blob_path(hash)?;

        if self.touch(hash).await? {
            debug!(hash = %hash, "Blob already exists");
            return Ok(());
        }

        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write then rename so a crash never leaves a truncated blob under its hash
        let tmp_path = blob_path.with_extension("tmp");
        fs::write(&tmp_path, data).await?;
        {
            let _guard = self.lock.lock().await;
            fs::rename(&tmp_path, &blob_path).await?;
        }

        debug!(hash = %hash, size = data.len(), "Stored blob");
        Ok(())
    }

    async fn get(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.blob_path(hash)?).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, hash: &str) -> Result<bool> {
        Ok(fs::metadata(self.blob_path(hash)?).await.is_ok())
    }

    async fn touch(&self, hash: &str) -> Result<bool> {
        let blob_path = self.blob_path(hash)?;
        let _guard = self.lock.lock().await;
        touch_file(&blob_path).await
    }

    async fn delete(&self, hash: &str) -> Result<bool> {
        match fs::remove_file(self.blob_path(hash)?).await {
            Ok(()) => {
                debug!(hash = %hash, "Deleted blob");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_unless_newer(&self, hash: &str, cutoff: Timestamp) -> Result<bool> {
        let blob_path = self.blob_path(hash)?;
        let _guard = self.lock.lock().await;

        let stored_at = match fs::metadata(&blob_path).await {
            Ok(metadata) => modified_millis(&metadata),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if stored_at > cutoff {
            debug!(hash = %hash, stored_at, cutoff, "Blob reused, not deleting");
            return Ok(false);
        }
        self.delete(hash).await
    }

    async fn list(&self) -> Result<Vec<StoredBlob>> {
        let mut blobs = Vec::new();
        let mut subdirs = fs::read_dir(self.root_dir.join("blobs")).await?;

        while let Some(subdir) = subdirs.next_entry().await? {
            if !subdir.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(subdir.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.ends_with(".tmp") {
                    continue;
                }
                let stored_at = modified_millis(&entry.metadata().await?);
                blobs.push(StoredBlob {
                    hash: name,
                    stored_at,
                });
            }
        }

        Ok(blobs)
    }
}
