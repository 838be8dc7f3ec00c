//! Result probing.
//!
//! A call's outcome lives under `result/<run_id>` (or
//! `exception/<run_id>`); concurrent overlapping remotes may have left
//! several. Run ids sort by wall clock, so the newest-by-sort envelope
//! is "the" outcome; earlier ones are value-equal for pure functions
//! and simply ignored.

use crate::constants::EXCEPTION_DIR;
use crate::constants::RESULT_DIR;
use crate::envelope;
use crate::envelope::OutcomeKind;
use crate::envelope::ResultEnvelope;
use crate::error::MuninnError;
use crate::store::join_uri;
use crate::store::with_retries;
use crate::store::BlobStore;
use crate::store::ControlCache;
use crate::value::Value;

/// A located outcome envelope.
#[derive(Debug)]
pub struct FoundResult {
    /// The decoded envelope.
    pub envelope: ResultEnvelope,
    /// URI it was read from.
    pub uri: String,
}

impl FoundResult {
    /// Whether this outcome is an exception.
    pub fn is_error(&self) -> bool {
        self.envelope.kind == OutcomeKind::Err
    }

    /// Turn the outcome into the caller-visible result: the returned
    /// value, or the remote exception re-raised with its context.
    pub fn into_value(self) -> Result<Value, MuninnError> {
        match self.envelope.kind {
            OutcomeKind::Ok => self.envelope.value.ok_or(MuninnError::CorruptControlFile {
                uri: self.uri,
                reason: "ok envelope carries no value".to_string(),
            }),
            OutcomeKind::Err => {
                let error = self.envelope.error.ok_or_else(|| MuninnError::CorruptControlFile {
                    uri: self.uri.clone(),
                    reason: "err envelope carries no error".to_string(),
                })?;
                Err(MuninnError::RemoteException {
                    type_name: error.type_name,
                    message: error.message,
                    traceback: error.traceback,
                })
            }
        }
    }
}

async fn newest_under(
    store: &dyn BlobStore,
    cache: &ControlCache,
    memo_uri: &str,
    directory: &str,
) -> Result<Option<FoundResult>, MuninnError> {
    let prefix = join_uri(memo_uri, [directory]) + "/";
    let listed = with_retries("outcome-list", || store.list(&prefix))
        .await
        .map_err(|source| MuninnError::Storage {
            uri: prefix.clone(),
            source,
        })?;
    let Some(newest) = listed.into_iter().max() else {
        return Ok(None);
    };
    let data = cache
        .get_through(store, &newest)
        .await
        .map_err(|source| MuninnError::Storage {
            uri: newest.clone(),
            source,
        })?;
    let envelope = envelope::decode(&newest, &data)?;
    Ok(Some(FoundResult { envelope, uri: newest }))
}

/// Look for a committed outcome under a memo URI.
///
/// Results always win over exceptions. With `rerun_exceptions` set, a
/// found exception is ignored entirely so the call dispatches afresh.
pub async fn probe(
    store: &dyn BlobStore,
    cache: &ControlCache,
    memo_uri: &str,
    rerun_exceptions: bool,
) -> Result<Option<FoundResult>, MuninnError> {
    if let Some(found) = newest_under(store, cache, memo_uri, RESULT_DIR).await? {
        return Ok(Some(found));
    }
    if rerun_exceptions {
        return Ok(None);
    }
    newest_under(store, cache, memo_uri, EXCEPTION_DIR).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ExceptionRepr;
    use crate::metadata::InvocationMetadata;
    use crate::metadata::ResultMetadata;
    use crate::store::MemoryBlobStore;
    use bytes::Bytes;
    use chrono::Utc;

    const MEMO: &str = "memory://t/mops2-mpf/p/m--f/Hash";

    fn metadata() -> ResultMetadata {
        ResultMetadata::from_invocation(InvocationMetadata::new("p", "w"), Utc::now(), Utc::now())
    }

    async fn put_outcome(store: &MemoryBlobStore, directory: &str, run_id: &str, envelope: &ResultEnvelope) {
        let uri = join_uri(MEMO, [directory, run_id]);
        store.put(&uri, envelope::encode(envelope).unwrap(), "application/json").await.unwrap();
    }

    fn ok_envelope(value: i64) -> ResultEnvelope {
        ResultEnvelope::ok(Value::Int(value), metadata(), Vec::new())
    }

    #[tokio::test]
    async fn test_empty_probe_is_none() {
        let store = MemoryBlobStore::new();
        let cache = ControlCache::new(-1);
        assert!(probe(&store, &cache, MEMO, true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_newest_result_wins() {
        let store = MemoryBlobStore::new();
        let cache = ControlCache::new(-1);
        put_outcome(&store, RESULT_DIR, "2401010000-BoldBearCalmCrow", &ok_envelope(1)).await;
        put_outcome(&store, RESULT_DIR, "2501010000-BoldBearCalmCrow", &ok_envelope(2)).await;
        let found = probe(&store, &cache, MEMO, true).await.unwrap().unwrap();
        assert_eq!(found.into_value().unwrap(), Value::Int(2));
    }

    #[tokio::test]
    async fn test_exception_is_reraised() {
        let store = MemoryBlobStore::new();
        let cache = ControlCache::new(-1);
        let envelope = ResultEnvelope::err(
            ExceptionRepr {
                type_name: "ValueError".to_string(),
                message: "nope".to_string(),
                traceback: "remote line 1".to_string(),
            },
            metadata(),
        );
        put_outcome(&store, EXCEPTION_DIR, "2401010000-DeepHawkFastLynx", &envelope).await;

        let found = probe(&store, &cache, MEMO, false).await.unwrap().unwrap();
        assert!(found.is_error());
        let err = found.into_value().unwrap_err();
        match err {
            MuninnError::RemoteException { type_name, message, .. } => {
                assert_eq!(type_name, "ValueError");
                assert_eq!(message, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_rerun_exceptions_hides_exception() {
        let store = MemoryBlobStore::new();
        let cache = ControlCache::new(-1);
        let envelope = ResultEnvelope::err(
            ExceptionRepr {
                type_name: "ValueError".to_string(),
                message: "nope".to_string(),
                traceback: String::new(),
            },
            metadata(),
        );
        put_outcome(&store, EXCEPTION_DIR, "2401010000-DeepHawkFastLynx", &envelope).await;
        assert!(probe(&store, &cache, MEMO, true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_result_beats_exception() {
        let store = MemoryBlobStore::new();
        let cache = ControlCache::new(-1);
        put_outcome(&store, RESULT_DIR, "2401010000-BoldBearCalmCrow", &ok_envelope(7)).await;
        let exc = ResultEnvelope::err(
            ExceptionRepr {
                type_name: "ValueError".to_string(),
                message: "nope".to_string(),
                traceback: String::new(),
            },
            metadata(),
        );
        put_outcome(&store, EXCEPTION_DIR, "2501010000-DeepHawkFastLynx", &exc).await;
        let found = probe(&store, &cache, MEMO, false).await.unwrap().unwrap();
        assert!(!found.is_error());
    }

    #[tokio::test]
    async fn test_corrupt_envelope_is_reported() {
        let store = MemoryBlobStore::new();
        let cache = ControlCache::new(-1);
        let uri = join_uri(MEMO, [RESULT_DIR, "2401010000-BoldBearCalmCrow"]);
        store.put(&uri, Bytes::from_static(b"junk"), "application/json").await.unwrap();
        let err = probe(&store, &cache, MEMO, true).await.unwrap_err();
        assert!(matches!(err, MuninnError::CorruptControlFile { .. }));
    }
}
