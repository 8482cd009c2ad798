use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::client::ClientConfig;
use tracing::{debug, trace};

use super::{build_client_config, TlsContextError};

/// Cache key for a client TLS context. Ordering is `verify` first, then the
/// certificate-authority path (derived field order).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SslContextKey {
    pub verify: bool,
    pub certificate_authority: String,
}

/// Shares TLS client contexts between backend connections.
///
/// Contexts are immutable once published; concurrent connections with the
/// same key receive the same `Arc`. Construction happens outside the lock
/// (trust-store loading can be slow) with a double-checked insert, so a
/// racing builder adopts the winner's context and discards its own. Failed
/// or non-cacheable builds are never published, which keeps a transient
/// failure from poisoning future lookups. Eviction is explicit only, never
/// time-based; callers invalidate entries when certificate material on disk
/// changes.
#[derive(Default)]
pub struct SslContextCache {
    contexts: Mutex<BTreeMap<SslContextKey, Arc<ClientConfig>>>,
}

impl SslContextCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_context(
        &self,
        verify: bool,
        certificate_authority: &str,
    ) -> Result<Arc<ClientConfig>, TlsContextError> {
        let key = SslContextKey {
            verify,
            certificate_authority: certificate_authority.to_string(),
        };

        {
            let contexts = self.contexts.lock();
            if let Some(context) = contexts.get(&key) {
                trace!(verify, ca = certificate_authority, "tls context cache hit");
                return Ok(context.clone());
            }
        }

        let built = build_client_config(verify, certificate_authority)?;

        let mut contexts = self.contexts.lock();
        if let Some(winner) = contexts.get(&key) {
            // Another connection built and published the same context while
            // we were outside the lock; adopt it.
            return Ok(winner.clone());
        }
        if built.cacheable {
            contexts.insert(key, built.config.clone());
        } else {
            debug!(
                verify,
                ca = certificate_authority,
                "tls context built but not cacheable; will rebuild on next use"
            );
        }
        Ok(built.config)
    }

    /// Drops the entry for one certificate configuration.
    pub fn remove_context(&self, verify: bool, certificate_authority: &str) {
        let key = SslContextKey {
            verify,
            certificate_authority: certificate_authority.to_string(),
        };
        self.contexts.lock().remove(&key);
    }

    /// Drops every cached context.
    pub fn clear(&self) {
        self.contexts.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn key_orders_by_verify_then_authority() {
        let a = SslContextKey {
            verify: false,
            certificate_authority: "zzz".to_string(),
        };
        let b = SslContextKey {
            verify: true,
            certificate_authority: "aaa".to_string(),
        };
        let c = SslContextKey {
            verify: true,
            certificate_authority: "bbb".to_string(),
        };
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn same_key_returns_the_same_shared_context() {
        let cache = SslContextCache::new();
        let first = cache.get_context(false, "").unwrap();
        let second = cache.get_context(false, "").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn different_keys_produce_different_contexts() {
        let cache = SslContextCache::new();
        let plain = cache.get_context(false, "").unwrap();

        let mut ca_file = tempfile::NamedTempFile::new().unwrap();
        // Not a valid certificate; the build must fail rather than cache.
        ca_file.write_all(b"not a pem").unwrap();
        let err = cache
            .get_context(true, ca_file.path().to_str().unwrap())
            .unwrap_err();
        assert!(matches!(err, TlsContextError::EmptyCa { .. }));

        // The failure did not get cached alongside the good entry.
        assert_eq!(cache.len(), 1);
        let again = cache.get_context(false, "").unwrap();
        assert!(Arc::ptr_eq(&plain, &again));
    }

    #[test]
    fn missing_authority_file_is_an_error_and_not_cached() {
        let cache = SslContextCache::new();
        let err = cache
            .get_context(true, "/does/not/exist.pem")
            .unwrap_err();
        assert!(matches!(err, TlsContextError::CaRead { .. }));
        assert!(cache.is_empty());

        // Retried fresh each time, not served from a poisoned entry.
        let err = cache
            .get_context(true, "/does/not/exist.pem")
            .unwrap_err();
        assert!(matches!(err, TlsContextError::CaRead { .. }));
    }

    #[test]
    fn eviction_is_explicit_only() {
        let cache = SslContextCache::new();
        let first = cache.get_context(false, "").unwrap();

        cache.remove_context(false, "");
        assert!(cache.is_empty());
        let rebuilt = cache.get_context(false, "").unwrap();
        assert!(!Arc::ptr_eq(&first, &rebuilt));

        cache.clear();
        assert!(cache.is_empty());
    }
}
