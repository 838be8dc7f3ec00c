//! Scheme-to-driver registry.
//!
//! Drivers are registered once at startup and the table is frozen on
//! first lookup. Post-startup mutation is rejected so every component
//! in the process resolves URIs identically for the process lifetime.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;

use tracing::info;

use super::BlobStore;
use super::BlobStoreError;
use super::FileBlobStore;

/// Table of URI-scheme prefixes to blob store drivers.
pub struct DriverRegistry {
    pending: Mutex<BTreeMap<String, Arc<dyn BlobStore>>>,
    frozen: OnceLock<BTreeMap<String, Arc<dyn BlobStore>>>,
}

impl DriverRegistry {
    fn new() -> Self {
        let mut defaults: BTreeMap<String, Arc<dyn BlobStore>> = BTreeMap::new();
        defaults.insert("file://".to_string(), Arc::new(FileBlobStore::new()));
        Self {
            pending: Mutex::new(defaults),
            frozen: OnceLock::new(),
        }
    }

    fn global() -> &'static DriverRegistry {
        static REGISTRY: OnceLock<DriverRegistry> = OnceLock::new();
        REGISTRY.get_or_init(DriverRegistry::new)
    }

    fn register(&self, scheme_prefix: &str, driver: Arc<dyn BlobStore>) -> Result<(), BlobStoreError> {
        if self.frozen.get().is_some() {
            return Err(BlobStoreError::WriteFailed {
                uri: scheme_prefix.to_string(),
                message: "driver registry is frozen; register drivers before first use".to_string(),
            });
        }
        info!(scheme = scheme_prefix, "registered blob store driver");
        self.pending.lock().unwrap().insert(scheme_prefix.to_string(), driver);
        Ok(())
    }

    fn lookup(&self, uri: &str) -> Result<Arc<dyn BlobStore>, BlobStoreError> {
        let table = self.frozen.get_or_init(|| self.pending.lock().unwrap().clone());
        // Longest matching prefix wins so e.g. a test override of one
        // authority can coexist with the scheme-wide driver.
        table
            .iter()
            .filter(|(prefix, _)| uri.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, driver)| driver.clone())
            .ok_or_else(|| BlobStoreError::UnsupportedScheme { uri: uri.to_string() })
    }
}

/// Register a driver for a URI scheme prefix (e.g. `memory://`).
///
/// Fails once the registry has served its first lookup.
pub fn register_driver(scheme_prefix: &str, driver: Arc<dyn BlobStore>) -> Result<(), BlobStoreError> {
    DriverRegistry::global().register(scheme_prefix, driver)
}

/// Resolve the driver responsible for a URI.
pub fn lookup_store(uri: &str) -> Result<Arc<dyn BlobStore>, BlobStoreError> {
    DriverRegistry::global().lookup(uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    // The global registry is process-wide, so these tests use a private
    // instance instead of the global one.

    #[test]
    fn test_lookup_prefers_longest_prefix() {
        let registry = DriverRegistry::new();
        registry.register("file://special/", Arc::new(FileBlobStore::new())).unwrap();
        assert!(registry.lookup("file://special/x").is_ok());
        assert!(registry.lookup("file:///ordinary").is_ok());
    }

    #[test]
    fn test_registration_rejected_after_freeze() {
        let registry = DriverRegistry::new();
        let _ = registry.lookup("file:///x").unwrap();
        let err = registry.register("memory://", Arc::new(FileBlobStore::new())).unwrap_err();
        assert!(matches!(err, BlobStoreError::WriteFailed { .. }));
    }

    #[test]
    fn test_unknown_scheme_is_rejected() {
        let registry = DriverRegistry::new();
        let err = registry.lookup("gopher://nope").unwrap_err();
        assert!(matches!(err, BlobStoreError::UnsupportedScheme { .. }));
    }
}
