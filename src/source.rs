//! Content-addressed large objects.
//!
//! Large values never ride inside an invocation or result envelope.
//! They are stored once at a content-addressed URI, referenced by hash,
//! and re-fetched (with verification) wherever the reference lands. A
//! hashref sidecar maps each hash to the URI holding its bytes, so a
//! reader only needs the hash to find the data.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::OnceLock;

use bytes::Bytes;
use serde::de;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use sha2::Digest;
use sha2::Sha256;
use tracing::debug;

use crate::constants::CAS_PREFIX;
use crate::constants::HASHREF_PREFIX;
use crate::constants::SHARED_PREFIX;
use crate::error::MuninnError;
use crate::humenc;
use crate::store::join_uri;
use crate::store::with_retries;
use crate::store::BlobStore;

/// SHA-256 content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash the given bytes.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex rendering of the digest.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the `sha256-<encoded>` rendering.
    pub fn parse(text: &str) -> Option<Self> {
        let encoded = text.strip_prefix("sha256-")?;
        let bytes = humenc::decode(encoded)?;
        let digest: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(digest))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256-{}", humenc::encode(&self.0))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).ok_or_else(|| de::Error::custom(format!("invalid content hash: {text}")))
    }
}

/// Reference to a content-addressed blob, embedded in values.
///
/// Equal `(hash, size)` implies equivalent bytes. The `uri` is filled
/// in on the result path, where the bytes are known to be uploaded;
/// argument references omit it so the canonical argument bytes depend
/// only on content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    /// Content hash of the referenced bytes.
    pub hash: ContentHash,
    /// Size of the referenced bytes.
    pub size: u64,
    /// Optional human-meaningful name, for diagnostics.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
    /// URI where the bytes are known to live, if already uploaded.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub uri: Option<String>,
}

/// Reference to a pipeline-scoped shared object.
///
/// Shared objects are uploaded once per pipeline lifetime and then
/// re-referenced by name; the hash pins the exact content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedRef {
    /// Name chosen at registration time.
    pub name: String,
    /// Content hash of the shared object's canonical encoding.
    pub hash: ContentHash,
}

/// A handle to large-object bytes on this machine.
///
/// Creating a `Source` registers its bytes in the process-local vault so
/// a later deferred upload can find them without re-reading the caller's
/// data structures.
#[derive(Debug, Clone)]
pub struct Source {
    source_ref: SourceRef,
}

enum VaultEntry {
    Inline(Bytes),
    File(PathBuf),
}

fn vault() -> &'static Mutex<HashMap<ContentHash, VaultEntry>> {
    static VAULT: OnceLock<Mutex<HashMap<ContentHash, VaultEntry>>> = OnceLock::new();
    VAULT.get_or_init(|| Mutex::new(HashMap::new()))
}

impl Source {
    /// Create a source from in-memory bytes.
    pub fn from_bytes(data: impl Into<Bytes>, name: Option<&str>) -> Self {
        let data = data.into();
        let hash = ContentHash::of(&data);
        let size = data.len() as u64;
        vault().lock().unwrap().entry(hash).or_insert(VaultEntry::Inline(data));
        Self {
            source_ref: SourceRef {
                hash,
                size,
                name: name.map(String::from),
                uri: None,
            },
        }
    }

    /// Create a source from a local file, hashing its contents.
    pub async fn from_file(path: impl Into<PathBuf>) -> Result<Self, MuninnError> {
        let path = path.into();
        let data = tokio::fs::read(&path).await.map_err(|e| MuninnError::Serialization {
            path: path.display().to_string(),
            reason: format!("cannot read source file: {e}"),
        })?;
        let hash = ContentHash::of(&data);
        let size = data.len() as u64;
        let name = path.file_name().and_then(|n| n.to_str()).map(String::from);
        vault().lock().unwrap().entry(hash).or_insert(VaultEntry::File(path));
        Ok(Self {
            source_ref: SourceRef { hash, size, name, uri: None },
        })
    }

    /// Wrap an existing reference (e.g. one returned from a remote call).
    pub fn from_ref(source_ref: SourceRef) -> Self {
        Self { source_ref }
    }

    /// The embeddable reference for this source.
    pub fn to_ref(&self) -> SourceRef {
        self.source_ref.clone()
    }
}

/// Look up locally-known bytes for a hash, if this process created them.
pub async fn local_bytes(hash: &ContentHash) -> Result<Option<Bytes>, MuninnError> {
    let path = {
        let entries = vault().lock().unwrap();
        match entries.get(hash) {
            Some(VaultEntry::Inline(data)) => return Ok(Some(data.clone())),
            Some(VaultEntry::File(path)) => path.clone(),
            None => return Ok(None),
        }
    };
    let data = tokio::fs::read(&path).await.map_err(|e| MuninnError::Serialization {
        path: path.display().to_string(),
        reason: format!("source file disappeared before upload: {e}"),
    })?;
    Ok(Some(Bytes::from(data)))
}

/// Content-addressed URI for a hash under a storage root.
pub fn content_uri(root: &str, hash: &ContentHash) -> String {
    join_uri(root, [CAS_PREFIX, hash.to_string().as_str()])
}

/// URI of the hashref sidecar for a hash under a storage root.
pub fn hashref_uri(root: &str, hash: &ContentHash) -> String {
    join_uri(root, [HASHREF_PREFIX, format!("{hash}.txt").as_str()])
}

/// URI of a pipeline-scoped shared object.
pub fn shared_uri(root: &str, pipeline_id: &str, shared: &SharedRef) -> String {
    join_uri(
        root,
        [SHARED_PREFIX, pipeline_id, format!("{}-{}", shared.name, shared.hash).as_str()],
    )
}

/// Upload source bytes to their content-addressed URI and write the
/// hashref sidecar. Skips the upload when the blob already exists with
/// the expected size.
pub async fn upload_source(
    store: &dyn BlobStore,
    root: &str,
    hash: &ContentHash,
    data: Bytes,
) -> Result<String, MuninnError> {
    let uri = content_uri(root, hash);
    let existing = with_retries("source-head", || store.head(&uri))
        .await
        .map_err(|source| MuninnError::Storage { uri: uri.clone(), source })?;
    match existing {
        Some(head) if head.size == data.len() as u64 => {
            debug!(uri = %uri, "source already uploaded");
        }
        _ => {
            with_retries("source-put", || store.put(&uri, data.clone(), "application/octet-stream"))
                .await
                .map_err(|source| MuninnError::Storage { uri: uri.clone(), source })?;
            debug!(uri = %uri, size = data.len(), "source uploaded");
        }
    }
    Ok(uri)
}

/// Write the hashref sidecar pointing at the URI holding the bytes.
pub async fn write_hashref(
    store: &dyn BlobStore,
    root: &str,
    hash: &ContentHash,
    target_uri: &str,
) -> Result<(), MuninnError> {
    let uri = hashref_uri(root, hash);
    with_retries("hashref-put", || {
        store.put(&uri, Bytes::from(target_uri.to_string()), "text/plain")
    })
    .await
    .map_err(|source| MuninnError::Storage { uri: uri.clone(), source })
}

/// Fetch and verify the bytes behind a source reference.
///
/// Resolution order: the reference's own URI, then the hashref sidecar,
/// then the deterministic content-addressed path. The bytes are always
/// re-hashed; a mismatch is corruption and fails the call.
pub async fn fetch_source(
    store: &dyn BlobStore,
    root: &str,
    source_ref: &SourceRef,
) -> Result<Bytes, MuninnError> {
    if let Some(data) = local_bytes(&source_ref.hash).await? {
        return Ok(data);
    }

    let uri = match &source_ref.uri {
        Some(uri) => uri.clone(),
        None => {
            let ref_uri = hashref_uri(root, &source_ref.hash);
            match with_retries("hashref-get", || store.get(&ref_uri)).await {
                Ok(target) => String::from_utf8_lossy(&target).trim().to_string(),
                Err(err) if err.is_not_found() => content_uri(root, &source_ref.hash),
                Err(source) => return Err(MuninnError::Storage { uri: ref_uri, source }),
            }
        }
    };

    let data = with_retries("source-get", || store.get(&uri))
        .await
        .map_err(|source| MuninnError::Storage { uri: uri.clone(), source })?;

    let actual = ContentHash::of(&data);
    if actual != source_ref.hash {
        return Err(MuninnError::HashMismatch {
            uri,
            expected: source_ref.hash.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBlobStore;

    const ROOT: &str = "memory://test";

    #[test]
    fn test_content_hash_display_roundtrip() {
        let hash = ContentHash::of(b"hello");
        assert_eq!(ContentHash::parse(&hash.to_string()), Some(hash));
    }

    #[tokio::test]
    async fn test_upload_then_fetch_verifies() {
        let store = MemoryBlobStore::new();
        let data = Bytes::from_static(b"big payload");
        let hash = ContentHash::of(&data);
        upload_source(&store, ROOT, &hash, data.clone()).await.unwrap();
        write_hashref(&store, ROOT, &hash, &content_uri(ROOT, &hash)).await.unwrap();

        // Clear vault knowledge by fetching via a foreign ref.
        let source_ref = SourceRef {
            hash,
            size: data.len() as u64,
            name: None,
            uri: Some(content_uri(ROOT, &hash)),
        };
        assert_eq!(fetch_source(&store, ROOT, &source_ref).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_corrupt_blob_is_hash_mismatch() {
        let store = MemoryBlobStore::new();
        let hash = ContentHash::of(b"original");
        let uri = content_uri(ROOT, &hash);
        store.put(&uri, Bytes::from_static(b"tampered"), "bytes").await.unwrap();
        let source_ref = SourceRef {
            hash,
            size: 8,
            name: None,
            uri: Some(uri),
        };
        let err = fetch_source(&store, ROOT, &source_ref).await.unwrap_err();
        assert!(matches!(err, MuninnError::HashMismatch { .. }));
    }

    #[tokio::test]
    async fn test_source_from_bytes_is_locally_resolvable() {
        let source = Source::from_bytes(Bytes::from_static(b"local data"), Some("demo"));
        let found = local_bytes(&source.to_ref().hash).await.unwrap();
        assert_eq!(found, Some(Bytes::from_static(b"local data")));
    }

    #[tokio::test]
    async fn test_upload_is_idempotent() {
        let store = MemoryBlobStore::new();
        let data = Bytes::from_static(b"dedup me");
        let hash = ContentHash::of(&data);
        let first = upload_source(&store, ROOT, &hash, data.clone()).await.unwrap();
        let second = upload_source(&store, ROOT, &hash, data).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
    }
}
