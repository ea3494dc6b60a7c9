//! Bootstrap synchronization with rendezvous servers.
//!
//! Nodes that cannot reach each other's DHT yet exchange routing table
//! snapshots and public keys through plain HTTP rendezvous servers. Every
//! call in here is best-effort: a failure is logged and the loop moves on to
//! the next server or peer.

use crate::crypto::{LocalIdentity, PeerId, PublicKey};
use crate::network::dht::Dht;
use crate::network::nat::{NatTraversal, PortMapping};
use crate::network::peers::{KeyFetcher, PeerCache};
use crate::utils::{NetworkError, Result, ServerList, TimingConfig};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Content type used when publishing a public key
pub const KEY_CONTENT_TYPE: &str = "application/pgp-keys";

/// HTTP surface of a rendezvous server
#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// `POST /pk`: publish our public key
    async fn publish_key(&self, server: &str, key: &[u8]) -> Result<()>;

    /// `GET /pk?p=`: fetch a peer's public key
    async fn fetch_key(&self, server: &str, peer: &PeerId) -> Result<Vec<u8>>;

    /// `POST /nodes?p=`: push a signed snapshot; true on first registration
    async fn push_nodes(&self, server: &str, peer: &PeerId, snapshot: &[u8]) -> Result<bool>;

    /// `GET /nodes?p=`: pull a peer's last pushed snapshot
    async fn pull_nodes(&self, server: &str, peer: &PeerId) -> Result<Vec<u8>>;

    /// `GET /invite?p=&t=`: obtain an invite token valid for `expiry_hours`
    async fn invite(&self, server: &str, peer: &PeerId, expiry_hours: u32) -> Result<String>;
}

/// [`Rendezvous`] over HTTP(S)
#[derive(Clone)]
pub struct HttpRendezvous {
    client: Client,
}

impl HttpRendezvous {
    /// Create a client whose calls give up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("overlay-messenger/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    fn url(server: &str, path: &str) -> String {
        format!("{}/{}", server.trim_end_matches('/'), path)
    }

    async fn checked(server: &str, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(NetworkError::Rendezvous {
                server: server.to_string(),
                reason: format!("{} {}", status, text.trim()),
            }
            .into())
        }
    }
}

#[async_trait]
impl Rendezvous for HttpRendezvous {
    async fn publish_key(&self, server: &str, key: &[u8]) -> Result<()> {
        let response = self
            .client
            .post(Self::url(server, "pk"))
            .header(CONTENT_TYPE, KEY_CONTENT_TYPE)
            .body(key.to_vec())
            .send()
            .await?;
        Self::checked(server, response).await?;
        Ok(())
    }

    async fn fetch_key(&self, server: &str, peer: &PeerId) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(Self::url(server, "pk"))
            .query(&[("p", peer.to_string())])
            .send()
            .await?;
        Ok(Self::checked(server, response).await?.bytes().await?.to_vec())
    }

    async fn push_nodes(&self, server: &str, peer: &PeerId, snapshot: &[u8]) -> Result<bool> {
        let response = self
            .client
            .post(Self::url(server, "nodes"))
            .query(&[("p", peer.to_string())])
            .body(snapshot.to_vec())
            .send()
            .await?;
        let text = Self::checked(server, response).await?.text().await?;
        Ok(text.trim().eq_ignore_ascii_case("true"))
    }

    async fn pull_nodes(&self, server: &str, peer: &PeerId) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(Self::url(server, "nodes"))
            .query(&[("p", peer.to_string())])
            .send()
            .await?;
        Ok(Self::checked(server, response).await?.bytes().await?.to_vec())
    }

    async fn invite(&self, server: &str, peer: &PeerId, expiry_hours: u32) -> Result<String> {
        let response = self
            .client
            .get(Self::url(server, "invite"))
            .query(&[("p", peer.to_string()), ("t", expiry_hours.to_string())])
            .send()
            .await?;
        Ok(Self::checked(server, response).await?.text().await?.trim().to_string())
    }
}

/// Run one call that is allowed to fail.
///
/// Applies `timeout`, logs any failure at warn level and returns `Some` only
/// on success.
pub async fn best_effort<T, F>(operation: &str, server: &str, timeout: Duration, call: F) -> Option<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            log::warn!("{} via {} failed: {}", operation, server, e);
            None
        }
        Err(_) => {
            log::warn!("{} via {} timed out after {:?}", operation, server, timeout);
            None
        }
    }
}

/// Routing table snapshot signed by the node that pushed it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedSnapshot {
    /// Node that pushed the snapshot
    pub peer: PeerId,
    /// Serialized routing table
    pub nodes: Vec<u8>,
    /// Ed25519 signature over `peer || nodes`
    pub signature: Vec<u8>,
}

impl SignedSnapshot {
    /// Sign `nodes` as `identity`
    pub fn sign(identity: &LocalIdentity, nodes: Vec<u8>) -> Self {
        let peer = identity.peer_id();
        let signature = identity.sign(&Self::signed_bytes(&peer, &nodes)).to_vec();
        Self {
            peer,
            nodes,
            signature,
        }
    }

    /// Whether the signature verifies against `key`
    pub fn verify(&self, key: &PublicKey) -> bool {
        key.verify(&Self::signed_bytes(&self.peer, &self.nodes), &self.signature)
            .is_ok()
    }

    /// Serialize for the wire
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Parse from the wire
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn signed_bytes(peer: &PeerId, nodes: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(peer.as_bytes().len() + nodes.len());
        bytes.extend_from_slice(peer.as_bytes());
        bytes.extend_from_slice(nodes);
        bytes
    }
}

/// Pacing and timeouts of the sync loop
#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    /// Pause between cycles
    pub sync_interval: Duration,
    /// Pause between consecutive calls
    pub step_delay: Duration,
    /// Upper bound on one rendezvous call
    pub call_timeout: Duration,
}

impl From<&TimingConfig> for SyncSettings {
    fn from(timing: &TimingConfig) -> Self {
        Self {
            sync_interval: timing.sync_interval(),
            step_delay: timing.step_delay(),
            call_timeout: timing.http_timeout(),
        }
    }
}

/// What one cycle achieved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Servers visited
    pub servers: usize,
    /// Successful key publications
    pub keys_published: usize,
    /// Successful snapshot pushes
    pub pushes: usize,
    /// Pulled snapshots merged into the DHT
    pub merged: usize,
}

/// The bootstrap synchronization loop
pub struct BootstrapSync {
    identity: Arc<LocalIdentity>,
    peers: Arc<PeerCache>,
    dht: Arc<dyn Dht>,
    rendezvous: Arc<dyn Rendezvous>,
    servers: Arc<dyn ServerList>,
    settings: SyncSettings,
    mapping: watch::Receiver<PortMapping>,
    nat: Option<Arc<NatTraversal>>,
    key_published: Mutex<HashSet<String>>,
}

impl BootstrapSync {
    /// Create the loop; `mapping` follows the port mapping announced in the DHT
    pub fn new(
        identity: Arc<LocalIdentity>,
        peers: Arc<PeerCache>,
        dht: Arc<dyn Dht>,
        rendezvous: Arc<dyn Rendezvous>,
        servers: Arc<dyn ServerList>,
        settings: SyncSettings,
        mapping: watch::Receiver<PortMapping>,
    ) -> Self {
        Self {
            identity,
            peers,
            dht,
            rendezvous,
            servers,
            settings,
            mapping,
            nat: None,
            key_published: Mutex::new(HashSet::new()),
        }
    }

    /// Stop this port-forwarding client when the loop ends
    pub fn with_nat(mut self, nat: Arc<NatTraversal>) -> Self {
        self.nat = Some(nat);
        self
    }

    /// Run cycles until `cancel` fires, then stop the DHT and NAT client
    pub async fn run(&self, cancel: CancellationToken) {
        log::info!(
            "Bootstrap synchronization started, cycle every {:?}",
            self.settings.sync_interval
        );

        while !cancel.is_cancelled() {
            let report = self.run_cycle(&cancel).await;
            log::debug!("Sync cycle done: {:?}", report);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.sync_interval) => {}
            }
        }

        if let Err(e) = self.dht.stop().await {
            log::warn!("DHT engine did not stop cleanly: {}", e);
        }
        if let Some(nat) = &self.nat {
            nat.stop().await;
        }
        log::info!("Bootstrap synchronization stopped");
    }

    /// One pass over every configured server
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleReport {
        let own = self.identity.peer_id();
        let mut report = CycleReport::default();

        let mapping = *self.mapping.borrow();
        if let Err(e) = self.dht.announce(&own, mapping).await {
            log::warn!("DHT announce failed: {}", e);
        }

        let snapshot = match self.signed_snapshot().await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::warn!("Could not snapshot the DHT routing table: {}", e);
                None
            }
        };

        for server in self.servers.rendezvous_servers() {
            if cancel.is_cancelled() {
                break;
            }
            report.servers += 1;

            if let Some(snapshot) = &snapshot {
                let pushed = best_effort(
                    "Snapshot push",
                    &server,
                    self.settings.call_timeout,
                    self.rendezvous.push_nodes(&server, &own, snapshot),
                )
                .await;
                if let Some(first) = pushed {
                    report.pushes += 1;
                    if first {
                        log::info!("Registered with rendezvous server {}", server);
                    }
                }
                if !self.pace(cancel).await {
                    break;
                }
            }

            for peer in self.peers.peer_ids().into_iter().filter(|p| *p != own) {
                let pulled = best_effort(
                    "Snapshot pull",
                    &server,
                    self.settings.call_timeout,
                    self.rendezvous.pull_nodes(&server, &peer),
                )
                .await;
                if let Some(bytes) = pulled {
                    if self.merge_snapshot(&peer, &bytes).await {
                        report.merged += 1;
                    }
                }
                if !self.pace(cancel).await {
                    return report;
                }
            }

            if !self.key_published.lock().contains(&server) {
                let key = self.identity.public_key().to_bytes();
                let published = best_effort(
                    "Key publish",
                    &server,
                    self.settings.call_timeout,
                    self.rendezvous.publish_key(&server, &key),
                )
                .await;
                if published.is_some() {
                    self.key_published.lock().insert(server.clone());
                    report.keys_published += 1;
                }
                if !self.pace(cancel).await {
                    break;
                }
            }
        }

        report
    }

    /// Ask the servers in turn for an invite token
    pub async fn request_invite(&self, expiry_hours: u32) -> Result<String> {
        let own = self.identity.peer_id();
        for server in self.servers.rendezvous_servers() {
            let token = best_effort(
                "Invite request",
                &server,
                self.settings.call_timeout,
                self.rendezvous.invite(&server, &own, expiry_hours),
            )
            .await;
            if let Some(token) = token {
                return Ok(token);
            }
        }

        Err(NetworkError::Rendezvous {
            server: "*".to_string(),
            reason: "no rendezvous server issued an invite".to_string(),
        }
        .into())
    }

    async fn signed_snapshot(&self) -> Result<Vec<u8>> {
        let nodes = self.dht.routing_table().await?;
        SignedSnapshot::sign(&self.identity, nodes).encode()
    }

    async fn merge_snapshot(&self, peer: &PeerId, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return false;
        }

        let snapshot = match SignedSnapshot::decode(bytes) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("Discarding malformed snapshot of {}: {}", peer, e);
                return false;
            }
        };
        if snapshot.peer != *peer {
            log::warn!("Discarding snapshot of {} served for {}", snapshot.peer, peer);
            return false;
        }
        if let Some(key) = self.peers.cached_key(peer) {
            if !snapshot.verify(&key) {
                log::warn!("Discarding snapshot of {} with a bad signature", peer);
                return false;
            }
        }

        match self.dht.merge_routing_table(&snapshot.nodes).await {
            Ok(added) => {
                log::debug!("Merged {} DHT contacts from {}", added, peer);
                true
            }
            Err(e) => {
                log::warn!("Could not merge snapshot of {}: {}", peer, e);
                false
            }
        }
    }

    /// Sleep one step; false if cancelled meanwhile
    async fn pace(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.settings.step_delay) => true,
        }
    }
}

#[async_trait]
impl KeyFetcher for BootstrapSync {
    async fn fetch_key(&self, peer: &PeerId) -> Option<PublicKey> {
        for server in self.servers.rendezvous_servers() {
            let fetched = best_effort(
                "Key fetch",
                &server,
                self.settings.call_timeout,
                self.rendezvous.fetch_key(&server, peer),
            )
            .await;
            let Some(bytes) = fetched else {
                continue;
            };

            match PublicKey::from_bytes(&bytes) {
                Ok(key) if key.peer_id() == *peer => {
                    log::debug!("Fetched key of {} from {}", peer, server);
                    return Some(key);
                }
                Ok(key) => log::warn!(
                    "{} served key {} for {}, ignoring",
                    server,
                    key.peer_id(),
                    peer
                ),
                Err(e) => log::warn!("{} served a malformed key for {}: {}", server, peer, e),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretKey;
    use crate::network::dht::{KnownNode, RoutingTable};
    use crate::testing::FakeDht;
    use crate::utils::StaticServers;
    use std::collections::HashMap;

    /// Shared in-memory rendezvous server; servers listed in `down` fail
    #[derive(Default)]
    struct FakeRendezvous {
        down: HashSet<String>,
        keys: Mutex<HashMap<PeerId, Vec<u8>>>,
        nodes: Mutex<HashMap<PeerId, Vec<u8>>>,
        published: Mutex<Vec<String>>,
        pushes: Mutex<Vec<String>>,
    }

    impl FakeRendezvous {
        fn with_down(servers: &[&str]) -> Self {
            Self {
                down: servers.iter().map(|s| s.to_string()).collect(),
                ..Self::default()
            }
        }

        fn check(&self, server: &str) -> Result<()> {
            if self.down.contains(server) {
                return Err(NetworkError::Rendezvous {
                    server: server.to_string(),
                    reason: "connection refused".to_string(),
                }
                .into());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Rendezvous for FakeRendezvous {
        async fn publish_key(&self, server: &str, key: &[u8]) -> Result<()> {
            self.check(server)?;
            let key = PublicKey::from_bytes(key)?;
            self.keys.lock().insert(key.peer_id(), key.to_bytes().to_vec());
            self.published.lock().push(server.to_string());
            Ok(())
        }

        async fn fetch_key(&self, server: &str, peer: &PeerId) -> Result<Vec<u8>> {
            self.check(server)?;
            Ok(self.keys.lock().get(peer).cloned().unwrap_or_default())
        }

        async fn push_nodes(&self, server: &str, peer: &PeerId, snapshot: &[u8]) -> Result<bool> {
            self.check(server)?;
            self.pushes.lock().push(server.to_string());
            Ok(self.nodes.lock().insert(*peer, snapshot.to_vec()).is_none())
        }

        async fn pull_nodes(&self, server: &str, peer: &PeerId) -> Result<Vec<u8>> {
            self.check(server)?;
            Ok(self.nodes.lock().get(peer).cloned().unwrap_or_default())
        }

        async fn invite(&self, server: &str, peer: &PeerId, expiry_hours: u32) -> Result<String> {
            self.check(server)?;
            Ok(format!("{}-{}", peer, expiry_hours))
        }
    }

    fn settings() -> SyncSettings {
        SyncSettings {
            sync_interval: Duration::from_millis(20),
            step_delay: Duration::from_millis(1),
            call_timeout: Duration::from_secs(1),
        }
    }

    fn table(n: usize) -> RoutingTable {
        RoutingTable {
            nodes: (0..n)
                .map(|i| KnownNode {
                    node: vec![i as u8],
                    addresses: vec![format!("/ip4/10.0.0.{}/tcp/6303", i + 1)],
                })
                .collect(),
        }
    }

    struct Harness {
        identity: Arc<LocalIdentity>,
        peers: Arc<PeerCache>,
        dht: Arc<FakeDht>,
        sync: BootstrapSync,
    }

    fn harness(rendezvous: Arc<FakeRendezvous>, servers: &[&str]) -> Harness {
        let identity = Arc::new(LocalIdentity::ephemeral());
        let peers = Arc::new(PeerCache::new());
        peers.insert_keys(identity.peer_id(), identity.keys());
        let dht = Arc::new(FakeDht::default());
        let (_, port) = watch::channel(PortMapping::LocalOnly(6303));
        let servers = StaticServers(servers.iter().map(|s| s.to_string()).collect());
        let sync = BootstrapSync::new(
            identity.clone(),
            peers.clone(),
            dht.clone(),
            rendezvous,
            Arc::new(servers),
            settings(),
            port,
        );
        Harness {
            identity,
            peers,
            dht,
            sync,
        }
    }

    #[tokio::test]
    async fn test_key_published_once_per_server() {
        let rendezvous = Arc::new(FakeRendezvous::default());
        let h = harness(rendezvous.clone(), &["http://a", "http://b"]);
        let cancel = CancellationToken::new();

        let first = h.sync.run_cycle(&cancel).await;
        let second = h.sync.run_cycle(&cancel).await;

        assert_eq!(first.keys_published, 2);
        assert_eq!(second.keys_published, 0);
        assert_eq!(first.pushes, 2);
        assert_eq!(second.pushes, 2);
        assert_eq!(rendezvous.published.lock().len(), 2);
        assert_eq!(
            h.dht.announced(),
            vec![(h.identity.peer_id(), PortMapping::LocalOnly(6303)); 2]
        );
    }

    #[tokio::test]
    async fn test_failing_server_does_not_stop_cycle() {
        let rendezvous = Arc::new(FakeRendezvous::with_down(&["http://down"]));
        let h = harness(rendezvous.clone(), &["http://down", "http://up"]);

        let report = h.sync.run_cycle(&CancellationToken::new()).await;

        assert_eq!(report.servers, 2);
        assert_eq!(report.pushes, 1);
        assert_eq!(*rendezvous.pushes.lock(), vec!["http://up".to_string()]);
        assert_eq!(*rendezvous.published.lock(), vec!["http://up".to_string()]);
    }

    #[tokio::test]
    async fn test_pulled_snapshots_are_merged() {
        let rendezvous = Arc::new(FakeRendezvous::default());
        let alice = harness(rendezvous.clone(), &["http://a"]);
        let bob = harness(rendezvous.clone(), &["http://a"]);
        alice.dht.set_table(table(2));

        alice.sync.run_cycle(&CancellationToken::new()).await;
        bob.peers.get_or_add(alice.identity.peer_id());
        let report = bob.sync.run_cycle(&CancellationToken::new()).await;

        assert_eq!(report.merged, 1);
        let merged = bob.dht.merged();
        assert_eq!(RoutingTable::decode(&merged[0]).unwrap(), table(2));
    }

    #[tokio::test]
    async fn test_forged_snapshot_discarded_for_known_key() {
        let rendezvous = Arc::new(FakeRendezvous::default());
        let alice = harness(rendezvous.clone(), &["http://a"]);
        let bob = harness(rendezvous.clone(), &["http://a"]);
        let mallory = LocalIdentity::ephemeral();

        let mut forged = SignedSnapshot::sign(&mallory, table(1).encode().unwrap());
        forged.peer = alice.identity.peer_id();
        rendezvous
            .nodes
            .lock()
            .insert(alice.identity.peer_id(), forged.encode().unwrap());

        bob.peers
            .insert_keys(alice.identity.peer_id(), alice.identity.keys());
        let report = bob.sync.run_cycle(&CancellationToken::new()).await;

        assert_eq!(report.merged, 0);
        assert!(bob.dht.merged().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_key_checks_fingerprint() {
        let rendezvous = Arc::new(FakeRendezvous::default());
        let h = harness(rendezvous.clone(), &["http://down", "http://a"]);
        let target = SecretKey::generate().public_key();
        let other = SecretKey::generate().public_key();

        rendezvous
            .keys
            .lock()
            .insert(target.peer_id(), other.to_bytes().to_vec());
        assert_eq!(h.sync.fetch_key(&target.peer_id()).await, None);

        rendezvous
            .keys
            .lock()
            .insert(target.peer_id(), target.to_bytes().to_vec());
        assert_eq!(h.sync.fetch_key(&target.peer_id()).await, Some(target));
    }

    #[tokio::test]
    async fn test_request_invite() {
        let rendezvous = Arc::new(FakeRendezvous::with_down(&["http://down"]));
        let h = harness(rendezvous.clone(), &["http://down", "http://a"]);
        let token = h.sync.request_invite(24).await.unwrap();
        assert!(token.ends_with("-24"));

        let lonely = harness(rendezvous, &[]);
        assert!(lonely.sync.request_invite(24).await.is_err());
    }

    #[tokio::test]
    async fn test_run_stops_dht_on_cancel() {
        let rendezvous = Arc::new(FakeRendezvous::default());
        let h = Arc::new(harness(rendezvous, &["http://a"]));
        let cancel = CancellationToken::new();

        let task = {
            let h = h.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { h.sync.run(cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap();

        assert!(h.dht.is_stopped());
        assert!(!h.dht.announced().is_empty());
    }

    #[tokio::test]
    async fn test_best_effort_swallows_failures() {
        let ok = best_effort("op", "s", Duration::from_secs(1), async { Ok::<_, crate::MessengerError>(5) }).await;
        assert_eq!(ok, Some(5));

        let failed: Option<u8> = best_effort("op", "s", Duration::from_secs(1), async {
            Err(NetworkError::Timeout {
                operation: "op".to_string(),
            }
            .into())
        })
        .await;
        assert_eq!(failed, None);

        let slow: Option<u8> = best_effort("op", "s", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1)
        })
        .await;
        assert_eq!(slow, None);
    }
}
