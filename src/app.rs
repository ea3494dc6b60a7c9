//! Node lifecycle and component wiring.
//!
//! Components are built explicitly, leaf first: identity, peer cache, DHT
//! and NAT, bootstrap loop, then the message service. Shutdown runs in the
//! reverse direction: stop accepting sends, stop the DHT engine, stop the
//! port-forwarding client, release the message socket.

use crate::crypto::{IdentityStore, KeyContainer, LocalIdentity, PeerId, PublicKey};
use crate::network::{
    BootstrapSync, Dht, DhtEngine, DhtSettings, HttpRendezvous, IgdPortMapper, NatTraversal,
    NullDht, PeerCache, PortMapping, Rendezvous, SyncSettings,
};
use crate::storage::{FileStore, Store, UndeliveredStore};
use crate::transport::{Message, MessageService, Party, ServiceDeps, ServiceSettings};
use crate::utils::{ConfigFileServers, MessengerConfig, Result, ServerList, StaticServers};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A running overlay node
pub struct Node {
    identity: Arc<LocalIdentity>,
    peers: Arc<PeerCache>,
    bootstrap: Arc<BootstrapSync>,
    service: Arc<MessageService>,
    mapping: watch::Receiver<PortMapping>,
    cancel: CancellationToken,
    sync_task: JoinHandle<()>,
    nat_task: JoinHandle<()>,
    receive_task: JoinHandle<()>,
}

impl Node {
    /// Start a node storing its state under `config.storage.data_dir`.
    ///
    /// When `config_path` is given the rendezvous server list is re-read
    /// from that file on every sync cycle.
    pub async fn start(config: MessengerConfig, config_path: Option<PathBuf>) -> Result<Self> {
        config.validate()?;
        config.ensure_directories()?;

        let store = Arc::new(FileStore::new(&config.storage.data_dir));
        let rendezvous = Arc::new(HttpRendezvous::new(config.timing.http_timeout())?);
        let servers: Arc<dyn ServerList> = match config_path {
            Some(path) => Arc::new(ConfigFileServers::new(
                path,
                config.network.rendezvous_servers.clone(),
            )),
            None => Arc::new(StaticServers(config.network.rendezvous_servers.clone())),
        };

        Self::start_with(config, store, rendezvous, servers).await
    }

    /// Start a node on explicit collaborators
    pub async fn start_with(
        config: MessengerConfig,
        store: Arc<dyn Store>,
        rendezvous: Arc<dyn Rendezvous>,
        servers: Arc<dyn ServerList>,
    ) -> Result<Self> {
        let identity = IdentityStore::new(store.clone())
            .ensure_identity()
            .await
            .map_err(|e| {
                log::error!("Cannot establish the node identity: {}", e);
                e
            })?;
        log::info!("Starting node {}", identity.peer_id());

        let peers = Arc::new(PeerCache::new());
        peers.insert_keys(identity.peer_id(), identity.keys());

        let network = &config.network;
        let listen = SocketAddr::new(network.listen_address, network.listen_port);
        let cancel = CancellationToken::new();

        let dht: Arc<dyn Dht> = if network.enable_dht {
            let engine = DhtEngine::start(
                DhtSettings {
                    listen_address: network.listen_address,
                    listen_port: network.listen_port,
                    bootstrap_nodes: network.dht_bootstrap_nodes.clone(),
                    enable_upnp: network.enable_upnp,
                    query_timeout: config.timing.dht_query_timeout(),
                },
                &identity,
                store.clone(),
            )
            .await?;
            Arc::new(engine)
        } else {
            log::info!("DHT disabled, relying on known endpoints");
            Arc::new(NullDht)
        };

        let nat_wait = config.timing.nat_retry_wait();
        let mapper = IgdPortMapper::new(network.enable_upnp, nat_wait);
        let nat = Arc::new(NatTraversal::new(
            Arc::new(mapper),
            config.timing.nat_attempts,
            nat_wait,
        ));

        // Replaced once the message socket is bound and mapped
        let (mapping_tx, mapping) = watch::channel(PortMapping::LocalOnly(network.listen_port));
        let bootstrap = Arc::new(
            BootstrapSync::new(
                identity.clone(),
                peers.clone(),
                dht.clone(),
                rendezvous,
                servers,
                SyncSettings::from(&config.timing),
                mapping.clone(),
            )
            .with_nat(nat.clone()),
        );

        let undelivered = Arc::new(UndeliveredStore::load(store)?);
        let service = MessageService::bind(
            listen,
            ServiceDeps {
                identity: identity.clone(),
                peers: peers.clone(),
                dht,
                keys: bootstrap.clone(),
                undelivered,
            },
            ServiceSettings::from_config(&config),
            cancel.clone(),
        )
        .await?;

        let receive_task = tokio::spawn(service.clone().run());

        let local_port = service.local_addr()?.port();
        mapping_tx.send_replace(PortMapping::LocalOnly(local_port));
        let nat_task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { nat.run(local_port, mapping_tx, cancel).await })
        };

        let sync_task = {
            let bootstrap = bootstrap.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { bootstrap.run(cancel).await })
        };

        service.replay();
        log::info!("Node {} ready on {}", identity.peer_id(), service.local_addr()?);

        Ok(Self {
            identity,
            peers,
            bootstrap,
            service,
            mapping,
            cancel,
            sync_task,
            nat_task,
            receive_task,
        })
    }

    /// The local PeerId
    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    /// The local public key
    pub fn public_key(&self) -> PublicKey {
        *self.identity.public_key()
    }

    /// Endpoint of the message socket
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.service.local_addr()
    }

    /// Port advertised to peers outside the local network
    pub fn public_port(&self) -> u16 {
        self.mapping.borrow().public_port()
    }

    /// Current port mapping of the message socket
    pub fn port_mapping(&self) -> PortMapping {
        *self.mapping.borrow()
    }

    /// The message service
    pub fn service(&self) -> &Arc<MessageService> {
        &self.service
    }

    /// Remember a contact learned out of band, such as from an invite
    pub fn add_contact(&self, key: PublicKey, endpoints: &[SocketAddr]) -> PeerId {
        let peer = key.peer_id();
        self.peers.insert_keys(peer, KeyContainer::public_only(key));
        for endpoint in endpoints {
            self.peers.add_endpoint(peer, *endpoint);
        }
        peer
    }

    /// Compose a message from this node
    pub fn compose(&self, recipients: Vec<Party>, topic: Option<String>, content: &str) -> Message {
        Message::compose(self.service.local_party(), recipients, topic, content)
    }

    /// Send `message` to all its recipients
    pub fn send(&self, message: Message) -> Result<()> {
        self.service.send(message)
    }

    /// Send a direct text to `peer`; returns the call identifier
    pub fn send_text(&self, peer: PeerId, content: &str) -> Result<String> {
        let message = self.compose(vec![Party::new(peer, peer.to_string())], None, content);
        let call_id = message.id.clone();
        self.send(message)?;
        Ok(call_id)
    }

    /// Take the inbox; only the first call gets it
    pub fn take_inbox(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.service.take_inbox()
    }

    /// Obtain an invite token from the rendezvous servers
    pub async fn invite(&self, expiry_hours: u32) -> Result<String> {
        self.bootstrap.request_invite(expiry_hours).await
    }

    /// Stop the node, in order
    pub async fn shutdown(self) {
        log::info!("Shutting down node {}", self.identity.peer_id());
        self.service.stop_accepting();
        self.cancel.cancel();

        for (name, task) in [
            ("bootstrap", self.sync_task),
            ("port mapping", self.nat_task),
            ("receive", self.receive_task),
        ] {
            if let Err(e) = task.await {
                log::warn!("{} task ended abnormally: {}", name, e);
            }
        }

        drop(self.service);
        log::info!("Node stopped");
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("peer_id", &self.identity.peer_id())
            .field("public_port", &self.public_port())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::utils::MessengerError;
    use std::time::Duration;

    fn config(name: &str) -> MessengerConfig {
        let mut config = MessengerConfig::default();
        config.network.listen_address = "127.0.0.1".parse().unwrap();
        config.network.listen_port = 0;
        config.network.enable_dht = false;
        config.network.enable_upnp = false;
        config.identity.display_name = name.to_string();
        config.timing.retry_interval_ms = 50;
        config.timing.nat_retry_wait_secs = 0;
        config
    }

    async fn start(name: &str, store: Arc<MemoryStore>) -> Node {
        Node::start_with(
            config(name),
            store,
            Arc::new(HttpRendezvous::new(Duration::from_secs(1)).unwrap()),
            Arc::new(StaticServers::default()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_nodes_exchange_messages() {
        let alice = start("alice", Arc::new(MemoryStore::new())).await;
        let bob = start("bob", Arc::new(MemoryStore::new())).await;
        let mut inbox = bob.take_inbox().unwrap();

        let bob_id = alice.add_contact(bob.public_key(), &[bob.local_addr().unwrap()]);
        bob.add_contact(alice.public_key(), &[]);

        let call_id = alice.send_text(bob_id, "hello bob").unwrap();
        let message = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(message.id, call_id);
        assert_eq!(message.content, "hello bob");
        assert_eq!(message.sender.display_name, "alice");
        assert!(message.decrypted);

        alice.shutdown().await;
        bob.shutdown().await;
    }

    #[tokio::test]
    async fn test_identity_survives_restart() {
        let store = Arc::new(MemoryStore::new());
        let first = start("alice", store.clone()).await;
        let peer_id = first.peer_id();
        first.shutdown().await;

        let second = start("alice", store).await;
        assert_eq!(second.peer_id(), peer_id);
        assert!(second.take_inbox().is_some());
        assert!(second.take_inbox().is_none());
        second.shutdown().await;
    }

    #[tokio::test]
    async fn test_sends_refused_during_shutdown() {
        let node = start("alice", Arc::new(MemoryStore::new())).await;
        let service = node.service().clone();
        let own = node.peer_id();
        node.shutdown().await;

        let message = Message::compose(service.local_party(), vec![Party::new(own, "me")], None, "x");
        assert!(matches!(service.send(message), Err(MessengerError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_unmapped_node_advertises_bound_port() {
        let node = start("alice", Arc::new(MemoryStore::new())).await;
        let port = node.local_addr().unwrap().port();

        assert_eq!(node.port_mapping(), PortMapping::LocalOnly(port));
        assert_eq!(node.public_port(), port);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_invite_without_servers_fails() {
        let node = start("alice", Arc::new(MemoryStore::new())).await;
        assert!(node.invite(24).await.is_err());
        node.shutdown().await;
    }
}
