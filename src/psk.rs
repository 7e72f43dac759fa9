//! Remembering pre-shared keys and server parameters across connections
//!
//! A populated cache entry lets the next connection to the same server resume
//! its TLS session and, with the server's old transport parameters in hand,
//! send 0-RTT data before the handshake completes.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use tracing::trace;

use crate::crypto::CipherSuite;
use crate::transport_parameters::TransportParameters;

/// State cached from a previous connection, keyed by server name
#[derive(Debug, Clone)]
pub struct CachedPsk {
    /// Opaque resumption ticket issued by the server
    pub ticket: Bytes,
    /// Application protocol negotiated when the ticket was issued
    pub alpn: Option<Vec<u8>>,
    /// Cipher suite the ticket's PSK is bound to
    pub suite: CipherSuite,
    /// Snapshot of the server's transport parameters, bounding what early
    /// data may assume
    pub transport_parameters: TransportParameters,
}

/// Storage for resumption state, shared between connections
pub trait PskCache: Send + Sync {
    /// Fetch the entry for `server_name`, if any
    fn load(&self, server_name: &str) -> Option<CachedPsk>;
    /// Record a fresh entry for `server_name`, replacing any previous one
    fn store(&self, server_name: &str, psk: CachedPsk);
    /// Drop the entry for `server_name`
    fn remove(&self, server_name: &str);
}

/// `PskCache` implementation storing entries in process memory
#[derive(Debug, Default)]
pub struct InMemoryPskCache(Mutex<HashMap<String, CachedPsk>>);

impl InMemoryPskCache {
    /// Construct an empty cache
    pub fn new() -> Self {
        Self::default()
    }
}

impl PskCache for InMemoryPskCache {
    fn load(&self, server_name: &str) -> Option<CachedPsk> {
        let psk = self.0.lock().unwrap().get(server_name).cloned();
        trace!(%server_name, found = psk.is_some(), "loading psk");
        psk
    }

    fn store(&self, server_name: &str, psk: CachedPsk) {
        trace!(%server_name, "storing psk");
        self.0.lock().unwrap().insert(server_name.into(), psk);
    }

    fn remove(&self, server_name: &str) {
        trace!(%server_name, "removing psk");
        self.0.lock().unwrap().remove(server_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> CachedPsk {
        CachedPsk {
            ticket: Bytes::from_static(b"ticket"),
            alpn: Some(b"h3-17".to_vec()),
            suite: CipherSuite::Aes128Gcm,
            transport_parameters: TransportParameters::default(),
        }
    }

    #[test]
    fn roundtrip() {
        let cache = InMemoryPskCache::new();
        assert!(cache.load("example.com").is_none());
        cache.store("example.com", entry());
        let loaded = cache.load("example.com").unwrap();
        assert_eq!(loaded.ticket, Bytes::from_static(b"ticket"));
        assert_eq!(loaded.alpn.as_deref(), Some(&b"h3-17"[..]));
    }

    #[test]
    fn entries_are_per_server() {
        let cache = InMemoryPskCache::new();
        cache.store("a.example", entry());
        assert!(cache.load("b.example").is_none());
        cache.remove("a.example");
        assert!(cache.load("a.example").is_none());
    }
}
