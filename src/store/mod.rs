//! Abstract blob storage.
//!
//! Everything the runner persists goes through the [`BlobStore`] trait:
//! opaque, immutable-by-convention byte blobs keyed by URI. Drivers are
//! registered per URI scheme at startup; the runner never assumes more
//! than eventual read-after-write on a single key.

mod control_cache;
mod fs;
mod memory;
mod registry;
mod retry;

use async_trait::async_trait;
use bytes::Bytes;
use snafu::Snafu;

pub use control_cache::ControlCache;
pub use fs::FileBlobStore;
pub use memory::MemoryBlobStore;
pub use registry::lookup_store;
pub use registry::register_driver;
pub use registry::DriverRegistry;
pub use retry::with_retries;

/// Errors from blob store operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BlobStoreError {
    /// No blob exists at the URI.
    #[snafu(display("blob not found: {uri}"))]
    NotFound {
        /// The URI that had no blob.
        uri: String,
    },

    /// The store rejected a write.
    #[snafu(display("write failed at {uri}: {message}"))]
    WriteFailed {
        /// The URI of the rejected write.
        uri: String,
        /// Store-reported reason.
        message: String,
    },

    /// The caller is not allowed to perform the operation.
    #[snafu(display("permission denied at {uri}"))]
    PermissionDenied {
        /// The URI of the denied operation.
        uri: String,
    },

    /// A retriable failure: network hiccup, throttling, partial read.
    #[snafu(display("transient storage error at {uri}: {message}"))]
    Transient {
        /// The URI of the failing operation.
        uri: String,
        /// Store-reported reason.
        message: String,
    },

    /// No driver is registered for the URI's scheme.
    #[snafu(display("no blob store driver for {uri}"))]
    UnsupportedScheme {
        /// The URI with an unknown scheme.
        uri: String,
    },
}

impl BlobStoreError {
    /// Whether the operation may succeed if repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Whether this is a plain missing-blob outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Metadata returned by [`BlobStore::head`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHead {
    /// Size of the blob in bytes.
    pub size: u64,
    /// Content hash, if the store tracks one (hex-encoded SHA-256).
    pub content_hash: Option<String>,
}

/// Opaque, addressable bytes.
///
/// Overwrites are allowed; no compare-and-swap is assumed. All methods
/// must be safe to retry.
#[async_trait]
pub trait BlobStore: Send + Sync + std::fmt::Debug {
    /// Store bytes at the URI, replacing any existing blob.
    async fn put(&self, uri: &str, data: Bytes, content_type: &str) -> Result<(), BlobStoreError>;

    /// Fetch the blob at the URI.
    async fn get(&self, uri: &str) -> Result<Bytes, BlobStoreError>;

    /// Check existence and size without fetching the payload.
    async fn head(&self, uri: &str) -> Result<Option<BlobHead>, BlobStoreError>;

    /// List the URIs of all blobs under a prefix, in lexicographic order.
    async fn list(&self, uri_prefix: &str) -> Result<Vec<String>, BlobStoreError>;

    /// Delete the blob at the URI.
    async fn delete(&self, uri: &str) -> Result<(), BlobStoreError>;
}

/// Join URI segments with single slashes, preserving the scheme.
pub fn join_uri<I, S>(base: &str, segments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = base.trim_end_matches('/').to_string();
    for segment in segments {
        let segment = segment.as_ref().trim_matches('/');
        if !segment.is_empty() {
            out.push('/');
            out.push_str(segment);
        }
    }
    out
}

/// Split a URI into its storage root (scheme + authority) and path segments.
///
/// Returns `None` when the URI carries no `scheme://` marker.
pub fn split_uri(uri: &str) -> Option<(String, Vec<String>)> {
    let scheme_end = uri.find("://")?;
    let after_scheme = &uri[scheme_end + 3..];
    let (authority, path) = match after_scheme.find('/') {
        Some(idx) => (&after_scheme[..idx], &after_scheme[idx + 1..]),
        None => (after_scheme, ""),
    };
    let root = format!("{}://{}", &uri[..scheme_end], authority);
    let segments = path.split('/').filter(|s| !s.is_empty()).map(String::from).collect();
    Some((root, segments))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_uri_trims_slashes() {
        assert_eq!(
            join_uri("memory://root/", ["a/", "/b", "c"]),
            "memory://root/a/b/c"
        );
    }

    #[test]
    fn test_join_uri_skips_empty_segments() {
        assert_eq!(join_uri("file:///tmp", ["", "x"]), "file:///tmp/x");
    }

    #[test]
    fn test_split_uri_roundtrip() {
        let (root, parts) = split_uri("memory://bucket/one/two/three").unwrap();
        assert_eq!(root, "memory://bucket");
        assert_eq!(parts, vec!["one", "two", "three"]);
        assert_eq!(join_uri(&root, &parts), "memory://bucket/one/two/three");
    }

    #[test]
    fn test_split_uri_rejects_bare_paths() {
        assert!(split_uri("/just/a/path").is_none());
    }
}
