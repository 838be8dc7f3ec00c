//! Local filesystem blob store (`file://` URIs).
//!
//! Puts are atomic: bytes land in a temp file beside the target and are
//! renamed into place, so concurrent readers never observe a partial blob.

use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;
use uuid::Uuid;

use super::BlobHead;
use super::BlobStore;
use super::BlobStoreError;

/// Blob store driver for `file://` URIs.
#[derive(Debug, Clone, Default)]
pub struct FileBlobStore;

impl FileBlobStore {
    /// Create a new filesystem driver.
    pub fn new() -> Self {
        Self
    }

    fn to_path(uri: &str) -> Result<PathBuf, BlobStoreError> {
        let path = uri
            .strip_prefix("file://")
            .ok_or_else(|| BlobStoreError::UnsupportedScheme { uri: uri.to_string() })?;
        Ok(PathBuf::from(path))
    }

    fn map_io(uri: &str, err: std::io::Error) -> BlobStoreError {
        match err.kind() {
            ErrorKind::NotFound => BlobStoreError::NotFound { uri: uri.to_string() },
            ErrorKind::PermissionDenied => BlobStoreError::PermissionDenied { uri: uri.to_string() },
            _ => BlobStoreError::Transient {
                uri: uri.to_string(),
                message: err.to_string(),
            },
        }
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn put(&self, uri: &str, data: Bytes, _content_type: &str) -> Result<(), BlobStoreError> {
        let path = Self::to_path(uri)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| Self::map_io(uri, e))?;
        }
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, &data).await.map_err(|e| BlobStoreError::WriteFailed {
            uri: uri.to_string(),
            message: e.to_string(),
        })?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| BlobStoreError::WriteFailed {
            uri: uri.to_string(),
            message: e.to_string(),
        })?;
        debug!(uri, size = data.len(), "blob written");
        Ok(())
    }

    async fn get(&self, uri: &str) -> Result<Bytes, BlobStoreError> {
        let path = Self::to_path(uri)?;
        let data = tokio::fs::read(&path).await.map_err(|e| Self::map_io(uri, e))?;
        Ok(Bytes::from(data))
    }

    async fn head(&self, uri: &str) -> Result<Option<BlobHead>, BlobStoreError> {
        let path = Self::to_path(uri)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(BlobHead {
                size: meta.len(),
                content_hash: None,
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::map_io(uri, e)),
        }
    }

    async fn list(&self, uri_prefix: &str) -> Result<Vec<String>, BlobStoreError> {
        let prefix_path = Self::to_path(uri_prefix)?;
        // The prefix may be a directory or a partial filename inside one.
        let dir = if prefix_path.is_dir() {
            prefix_path.clone()
        } else {
            match prefix_path.parent() {
                Some(parent) if parent.is_dir() => parent.to_path_buf(),
                _ => return Ok(Vec::new()),
            }
        };
        let mut files = Vec::new();
        collect_files(&dir, &mut files).map_err(|e| Self::map_io(uri_prefix, e))?;
        let mut uris: Vec<String> = files
            .into_iter()
            .filter_map(|p| p.to_str().map(|s| format!("file://{}", s)))
            .filter(|u| u.starts_with(uri_prefix))
            .collect();
        uris.sort();
        Ok(uris)
    }

    async fn delete(&self, uri: &str) -> Result<(), BlobStoreError> {
        let path = Self::to_path(uri)?;
        tokio::fs::remove_file(&path).await.map_err(|e| Self::map_io(uri, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn uri(dir: &TempDir, rest: &str) -> String {
        format!("file://{}/{}", dir.path().display(), rest)
    }

    #[tokio::test]
    async fn test_put_creates_parents_and_get_reads_back() {
        let dir = TempDir::new().unwrap();
        let store = FileBlobStore::new();
        let target = uri(&dir, "a/b/c.bin");
        store.put(&target, Bytes::from_static(b"abc"), "bytes").await.unwrap();
        assert_eq!(store.get(&target).await.unwrap(), Bytes::from_static(b"abc"));
    }

    #[tokio::test]
    async fn test_list_under_prefix() {
        let dir = TempDir::new().unwrap();
        let store = FileBlobStore::new();
        store.put(&uri(&dir, "r/one"), Bytes::new(), "bytes").await.unwrap();
        store.put(&uri(&dir, "r/two"), Bytes::new(), "bytes").await.unwrap();
        store.put(&uri(&dir, "elsewhere"), Bytes::new(), "bytes").await.unwrap();
        let listed = store.list(&uri(&dir, "r/")).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|u| u.contains("/r/")));
    }

    #[tokio::test]
    async fn test_head_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let store = FileBlobStore::new();
        assert!(store.head(&uri(&dir, "nope")).await.unwrap().is_none());
    }
}
