// File-based Blob Store Implementation
// Implements the BlobStore trait on a local directory tree. Object paths map
// directly onto the filesystem, so the upload layout `{kb_id}/{uuid}_{name}`
// becomes one directory per knowledge base.

use anyhow::{ensure, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

use crate::contracts::BlobStore;

pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create blob root: {}", root.display()))?;
        Ok(Self { root })
    }

    /// Resolve an object path, rejecting traversal outside the root.
    fn resolve(&self, object_path: &str) -> Result<PathBuf> {
        ensure!(!object_path.is_empty(), "Blob path cannot be empty");
        ensure!(
            !object_path.split('/').any(|seg| seg == ".." || seg.is_empty()),
            "Invalid blob path: {object_path}"
        );
        Ok(self.root.join(object_path))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create blob directory: {}", parent.display()))?;
        }

        // Write-then-rename so a crashed put never leaves a readable partial
        // object behind.
        let tmp = full.with_extension("part");
        fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("Failed to write blob: {}", full.display()))?;
        fs::rename(&tmp, &full)
            .await
            .with_context(|| format!("Failed to finalize blob: {}", full.display()))?;

        debug!(path = %path, size = bytes.len(), "Blob stored");
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path)?;
        fs::read(&full)
            .await
            .with_context(|| format!("Blob not readable: {path}"))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        match fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete blob: {path}")),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full = self.resolve(path)?;
        Ok(fs::try_exists(&full).await?)
    }
}

/// Production factory for the blob store.
pub async fn create_blob_store(root: impl AsRef<Path>) -> Result<Arc<dyn BlobStore>> {
    Ok(Arc::new(FileBlobStore::new(root).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_roundtrip() -> Result<()> {
        let dir = TempDir::new()?;
        let store = FileBlobStore::new(dir.path()).await?;

        store.put("7/abc_report.pdf", b"pdf bytes").await?;
        let bytes = store.get("7/abc_report.pdf").await?;
        assert_eq!(bytes, b"pdf bytes");
        assert!(store.exists("7/abc_report.pdf").await?);

        Ok(())
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() -> Result<()> {
        let dir = TempDir::new()?;
        let store = FileBlobStore::new(dir.path()).await?;

        store.put("testsets/1.csv", b"q,a\n").await?;
        store.delete("testsets/1.csv").await?;
        assert!(!store.exists("testsets/1.csv").await?);
        // Deleting again is not an error.
        store.delete("testsets/1.csv").await?;

        Ok(())
    }

    #[tokio::test]
    async fn test_missing_blob_is_error() -> Result<()> {
        let dir = TempDir::new()?;
        let store = FileBlobStore::new(dir.path()).await?;
        assert!(store.get("missing/blob").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_traversal_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let store = FileBlobStore::new(dir.path()).await?;
        assert!(store.put("../escape", b"x").await.is_err());
        assert!(store.get("a//b").await.is_err());
        Ok(())
    }
}
