//! Peer cache: known endpoints and public keys per PeerId.
//!
//! Every inbound or outbound exchange updates the cache. Entries are never
//! removed; the cache lives as long as the process and is bounded by the
//! number of conversation partners.

use crate::crypto::{KeyContainer, PeerId, PublicKey};
use crate::utils::{CryptoError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

/// Source of public keys for peers that are not cached yet
#[async_trait]
pub trait KeyFetcher: Send + Sync {
    /// Fetch `peer`'s public key, or `None` if no source has it
    async fn fetch_key(&self, peer: &PeerId) -> Option<PublicKey>;
}

/// A known peer
#[derive(Debug, Clone)]
pub struct Peer {
    /// Overlay address
    pub id: PeerId,
    /// Endpoints observed so far
    pub endpoints: HashSet<SocketAddr>,
    /// Key material, once resolved
    pub keys: Option<KeyContainer>,
}

impl Peer {
    fn new(id: PeerId) -> Self {
        Self {
            id,
            endpoints: HashSet::new(),
            keys: None,
        }
    }
}

/// Thread-safe map from PeerId to what is known about that peer
#[derive(Debug, Default)]
pub struct PeerCache {
    peers: Mutex<HashMap<PeerId, Peer>>,
}

impl PeerCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the entry for `peer`, creating an empty one if absent
    pub fn get_or_add(&self, peer: PeerId) -> Peer {
        self.peers
            .lock()
            .entry(peer)
            .or_insert_with(|| Peer::new(peer))
            .clone()
    }

    /// Record an endpoint for `peer`; returns true if it was new
    pub fn add_endpoint(&self, peer: PeerId, endpoint: SocketAddr) -> bool {
        let added = self
            .peers
            .lock()
            .entry(peer)
            .or_insert_with(|| Peer::new(peer))
            .endpoints
            .insert(endpoint);
        if added {
            log::debug!("Learned endpoint {} for {}", endpoint, peer);
        }
        added
    }

    /// Known endpoints of `peer`
    pub fn endpoints(&self, peer: &PeerId) -> Vec<SocketAddr> {
        self.peers
            .lock()
            .get(peer)
            .map(|p| p.endpoints.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every cached PeerId
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.lock().keys().copied().collect()
    }

    /// Number of cached peers
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Cache key material for `peer`. A key that is already resolved is kept.
    pub fn insert_keys(&self, peer: PeerId, keys: KeyContainer) {
        let mut peers = self.peers.lock();
        let entry = peers.entry(peer).or_insert_with(|| Peer::new(peer));
        if entry.keys.is_none() {
            entry.keys = Some(keys);
        }
    }

    /// Cached public key of `peer`, without any network round trip
    pub fn cached_key(&self, peer: &PeerId) -> Option<PublicKey> {
        self.peers
            .lock()
            .get(peer)
            .and_then(|p| p.keys.as_ref())
            .map(|keys| *keys.public())
    }

    /// Public key of `peer`, fetched through `fetcher` on a cache miss
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::KeyNotFound` if the key is neither cached nor
    /// available from the fetcher
    pub async fn resolve_key(&self, peer: &PeerId, fetcher: &dyn KeyFetcher) -> Result<PublicKey> {
        if let Some(key) = self.cached_key(peer) {
            return Ok(key);
        }

        let Some(key) = fetcher.fetch_key(peer).await else {
            return Err(CryptoError::KeyNotFound {
                peer_id: peer.to_string(),
            }
            .into());
        };

        self.insert_keys(*peer, KeyContainer::public_only(key));
        Ok(self.cached_key(peer).unwrap_or(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretKey;
    use crate::testing::StaticKeys;

    fn peer() -> PeerId {
        SecretKey::generate().public_key().peer_id()
    }

    #[test]
    fn test_get_or_add_creates_once() {
        let cache = PeerCache::new();
        let id = peer();

        assert!(cache.get_or_add(id).endpoints.is_empty());
        cache.add_endpoint(id, "10.0.0.5:6303".parse().unwrap());
        assert_eq!(cache.get_or_add(id).endpoints.len(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_add_endpoint_is_idempotent() {
        let cache = PeerCache::new();
        let id = peer();
        let endpoint: SocketAddr = "10.0.0.5:6303".parse().unwrap();

        assert!(cache.add_endpoint(id, endpoint));
        assert!(!cache.add_endpoint(id, endpoint));
        assert_eq!(cache.endpoints(&id), vec![endpoint]);
    }

    #[test]
    fn test_resolved_key_never_overwritten() {
        let cache = PeerCache::new();
        let first = SecretKey::generate().public_key();
        let second = SecretKey::generate().public_key();
        let id = first.peer_id();

        cache.insert_keys(id, KeyContainer::public_only(first));
        cache.insert_keys(id, KeyContainer::public_only(second));
        cache.get_or_add(id);

        assert_eq!(cache.cached_key(&id), Some(first));
    }

    #[tokio::test]
    async fn test_resolve_key_fetches_and_caches() {
        let cache = PeerCache::new();
        let key = SecretKey::generate().public_key();
        let fetcher = StaticKeys::with(&[key]);

        assert_eq!(cache.resolve_key(&key.peer_id(), &fetcher).await.unwrap(), key);
        assert_eq!(fetcher.fetches(), 1);

        cache.resolve_key(&key.peer_id(), &fetcher).await.unwrap();
        assert_eq!(fetcher.fetches(), 1);
    }

    #[tokio::test]
    async fn test_resolve_key_not_found() {
        let cache = PeerCache::new();
        let err = cache.resolve_key(&peer(), &StaticKeys::default()).await.unwrap_err();
        assert!(matches!(
            err,
            crate::utils::MessengerError::Crypto(CryptoError::KeyNotFound { .. })
        ));
    }
}
