//! Test doubles shared by the unit tests of several modules.

use crate::crypto::{PeerId, PublicKey};
use crate::network::dht::{Dht, RoutingTable};
use crate::network::nat::PortMapping;
use crate::network::peers::KeyFetcher;
use crate::utils::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Key source answering from a fixed set of keys
#[derive(Default)]
pub struct StaticKeys {
    keys: Mutex<HashMap<PeerId, PublicKey>>,
    fetches: AtomicUsize,
}

impl StaticKeys {
    pub fn with(keys: &[PublicKey]) -> Self {
        let source = Self::default();
        for key in keys {
            source.add(*key);
        }
        source
    }

    pub fn add(&self, key: PublicKey) {
        self.keys.lock().insert(key.peer_id(), key);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyFetcher for StaticKeys {
    async fn fetch_key(&self, peer: &PeerId) -> Option<PublicKey> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.keys.lock().get(peer).copied()
    }
}

/// In-memory DHT recording every call
#[derive(Default)]
pub struct FakeDht {
    endpoints: Mutex<HashMap<PeerId, Vec<SocketAddr>>>,
    table: Mutex<RoutingTable>,
    lookups: AtomicUsize,
    announced: Mutex<Vec<(PeerId, PortMapping)>>,
    merged: Mutex<Vec<Vec<u8>>>,
    stopped: AtomicBool,
}

impl FakeDht {
    pub fn set_endpoints(&self, peer: PeerId, endpoints: Vec<SocketAddr>) {
        self.endpoints.lock().insert(peer, endpoints);
    }

    pub fn set_table(&self, table: RoutingTable) {
        *self.table.lock() = table;
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn announced(&self) -> Vec<(PeerId, PortMapping)> {
        self.announced.lock().clone()
    }

    pub fn merged(&self) -> Vec<Vec<u8>> {
        self.merged.lock().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dht for FakeDht {
    async fn announce(&self, peer: &PeerId, mapping: PortMapping) -> Result<()> {
        self.announced.lock().push((*peer, mapping));
        Ok(())
    }

    async fn find_peers(&self, peer: &PeerId) -> Result<Vec<SocketAddr>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.endpoints.lock().get(peer).cloned().unwrap_or_default())
    }

    async fn routing_table(&self) -> Result<Vec<u8>> {
        self.table.lock().encode()
    }

    async fn merge_routing_table(&self, snapshot: &[u8]) -> Result<usize> {
        let table = RoutingTable::decode(snapshot)?;
        self.merged.lock().push(snapshot.to_vec());
        Ok(table.nodes.len())
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}
