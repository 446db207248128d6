use crate::error::ConnectionError;
use once_cell::sync::Lazy;
use rustls::client::{ClientSessionMemoryCache, ClientSessionStore, Resumption};
use rustls::{ClientConfig, RootCertStore};
use std::fmt;
use std::sync::Arc;

const SHARED_CACHE_CAPACITY: usize = 100;

static SHARED_CACHE: Lazy<TlsSessionCache> =
    Lazy::new(|| TlsSessionCache::isolated(SHARED_CACHE_CAPACITY));

/// TLS session store used for handshake resumption.
///
/// Every connection built from the same cache (or a clone of it) can resume a
/// previous TLS session, which cuts repeat `wss://` handshakes to one round
/// trip. The store is internally synchronised by rustls.
#[derive(Clone)]
pub struct TlsSessionCache {
    store: Option<Arc<dyn ClientSessionStore>>,
}

impl TlsSessionCache {
    /// The process-wide cache shared by default across all connections
    pub fn shared() -> Self {
        SHARED_CACHE.clone()
    }

    /// A private cache holding up to `capacity` sessions
    pub fn isolated(capacity: usize) -> Self {
        Self {
            store: Some(Arc::new(ClientSessionMemoryCache::new(capacity))),
        }
    }

    /// No session resumption at all
    pub fn disabled() -> Self {
        Self { store: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Same underlying store
    pub fn shares_store_with(&self, other: &TlsSessionCache) -> bool {
        match (&self.store, &other.store) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub(crate) fn client_config(&self) -> Result<Arc<ClientConfig>, ConnectionError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };

        let mut config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ConnectionError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        config.resumption = match &self.store {
            Some(store) => Resumption::store(store.clone()),
            None => Resumption::disabled(),
        };

        Ok(Arc::new(config))
    }
}

impl Default for TlsSessionCache {
    fn default() -> Self {
        Self::shared()
    }
}

impl fmt::Debug for TlsSessionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSessionCache")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
