//! DHT engine adapter.
//!
//! Maps a PeerId to candidate endpoints through a Kademlia DHT. The PeerId is
//! treated like an info-hash: a node announces its endpoints under the
//! SHA-256 of its own PeerId, and anyone can look them up under the same key.
//!
//! [`DhtEngine`] runs a libp2p swarm with Kademlia and, when enabled, the
//! UPnP behaviour for its TCP listener on a dedicated task. Callers talk to
//! it through a command channel. The routing table is persisted on stop and
//! reloaded on start so the next run avoids a cold bootstrap.
//!
//! Announced endpoints are those of the UDP message socket: the gateway
//! mapping if there is one, and every routable interface address paired
//! with the local port.

use crate::crypto::{LocalIdentity, PeerId};
use crate::network::nat::PortMapping;
use crate::storage::{self, Store, DHT_TABLE_PATH};
use crate::utils::{MessengerError, NetworkError, Result};
use async_trait::async_trait;
use behaviour::{DhtBehaviour, DhtBehaviourEvent};
use futures::StreamExt;
use libp2p::kad::{self, store::MemoryStore, GetRecordOk, Mode, PeerRecord, QueryResult, Quorum};
use libp2p::multiaddr::Protocol;
use libp2p::swarm::{behaviour::toggle::Toggle, SwarmEvent};
use libp2p::{noise, tcp, upnp, yamux, Multiaddr, PeerId as NodeKey, Swarm, SwarmBuilder};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Capacity of the engine command queue
const COMMAND_QUEUE: usize = 64;

/// Operations the rest of the node needs from a DHT
#[async_trait]
pub trait Dht: Send + Sync {
    /// Announce where `peer` can be reached given its port `mapping`
    async fn announce(&self, peer: &PeerId, mapping: PortMapping) -> Result<()>;

    /// Candidate endpoints announced for `peer`
    async fn find_peers(&self, peer: &PeerId) -> Result<Vec<SocketAddr>>;

    /// Serialized snapshot of the routing table
    async fn routing_table(&self) -> Result<Vec<u8>>;

    /// Merge nodes from a serialized snapshot; returns how many were added
    async fn merge_routing_table(&self, snapshot: &[u8]) -> Result<usize>;

    /// Persist the routing table and stop the engine
    async fn stop(&self) -> Result<()>;
}

/// A DHT contact: libp2p node key and its addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownNode {
    /// Encoded libp2p peer id
    pub node: Vec<u8>,
    /// Multiaddrs in string form
    pub addresses: Vec<String>,
}

/// Portable routing table snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    /// Known contacts
    pub nodes: Vec<KnownNode>,
}

impl RoutingTable {
    /// Serialize the snapshot
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Parse a snapshot
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// DHT key under which `peer` announces itself
pub fn dht_key(peer: &PeerId) -> Vec<u8> {
    Sha256::digest(peer.as_bytes()).to_vec()
}

/// Convert a `/ip*/…/tcp/…` multiaddr into a socket address
pub fn socket_addr(addr: &Multiaddr) -> Option<SocketAddr> {
    let mut ip = None;
    let mut port = None;
    for protocol in addr.iter() {
        match protocol {
            Protocol::Ip4(a) => ip = Some(IpAddr::V4(a)),
            Protocol::Ip6(a) => ip = Some(IpAddr::V6(a)),
            Protocol::Tcp(p) => port = Some(p),
            _ => {}
        }
    }
    Some(SocketAddr::new(ip?, port?))
}

/// Split a `/ip4/…/tcp/…/p2p/…` multiaddr into node key and dial address
pub fn parse_bootstrap_node(node: &str) -> Result<(NodeKey, Multiaddr)> {
    let invalid = || NetworkError::InvalidAddress {
        address: node.to_string(),
    };
    let addr: Multiaddr = node.parse().map_err(|_| invalid())?;
    let key = match addr.iter().last() {
        Some(Protocol::P2p(key)) => key,
        _ => return Err(invalid().into()),
    };
    Ok((key, addr))
}

/// Endpoints to announce for a node bound to `bound` whose interfaces
/// report `interfaces`.
///
/// The gateway endpoint keeps its own port; interface addresses are paired
/// with the local port. Loopback is announced only by a node bound to
/// loopback, since anywhere else it names the looking-up node itself.
pub fn advertised_endpoints(mapping: PortMapping, interfaces: &[IpAddr], bound: IpAddr) -> Vec<SocketAddr> {
    let mut endpoints = Vec::new();
    if let Some(external) = mapping.external() {
        endpoints.push(external);
    }

    let loopback_only = bound.is_loopback();
    for ip in interfaces.iter().copied().chain(std::iter::once(bound)) {
        if !is_advertisable(ip, loopback_only) {
            continue;
        }
        let endpoint = SocketAddr::new(ip, mapping.local_port());
        if !endpoints.contains(&endpoint) {
            endpoints.push(endpoint);
        }
    }
    endpoints
}

fn is_advertisable(ip: IpAddr, loopback_only: bool) -> bool {
    if ip.is_unspecified() {
        return false;
    }
    if ip.is_loopback() {
        return loopback_only;
    }
    match ip {
        IpAddr::V4(v4) => !v4.is_link_local(),
        IpAddr::V6(v6) => v6.segments()[0] & 0xffc0 != 0xfe80,
    }
}

fn dht_error(operation: &str, err: impl std::fmt::Display) -> MessengerError {
    NetworkError::DhtFailure {
        operation: operation.to_string(),
        reason: err.to_string(),
    }
    .into()
}

/// A DHT that knows nothing, used when the DHT is disabled
#[derive(Debug, Default)]
pub struct NullDht;

#[async_trait]
impl Dht for NullDht {
    async fn announce(&self, _peer: &PeerId, _mapping: PortMapping) -> Result<()> {
        Ok(())
    }

    async fn find_peers(&self, _peer: &PeerId) -> Result<Vec<SocketAddr>> {
        Ok(Vec::new())
    }

    async fn routing_table(&self) -> Result<Vec<u8>> {
        RoutingTable::default().encode()
    }

    async fn merge_routing_table(&self, _snapshot: &[u8]) -> Result<usize> {
        Ok(0)
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

// Apart from the crate `Result` alias, which the derive would pick up
mod behaviour {
    use libp2p::kad::{self, store::MemoryStore};
    use libp2p::swarm::{behaviour::toggle::Toggle, NetworkBehaviour};
    use libp2p::upnp;

    #[derive(NetworkBehaviour)]
    pub(super) struct DhtBehaviour {
        pub(super) kademlia: kad::Behaviour<MemoryStore>,
        pub(super) upnp: Toggle<upnp::tokio::Behaviour>,
    }
}

enum Command {
    Announce {
        peer: PeerId,
        mapping: PortMapping,
        reply: oneshot::Sender<Result<()>>,
    },
    FindPeers {
        peer: PeerId,
        reply: oneshot::Sender<Vec<SocketAddr>>,
    },
    Snapshot {
        reply: oneshot::Sender<RoutingTable>,
    },
    Merge {
        table: RoutingTable,
        reply: oneshot::Sender<usize>,
    },
    Stop {
        reply: oneshot::Sender<RoutingTable>,
    },
}

/// Settings for starting a [`DhtEngine`]
#[derive(Debug, Clone)]
pub struct DhtSettings {
    /// Address the TCP listener binds to
    pub listen_address: IpAddr,
    /// Port the TCP listener binds to
    pub listen_port: u16,
    /// Multiaddrs (with `/p2p/` suffix) to seed a cold routing table
    pub bootstrap_nodes: Vec<String>,
    /// Map the TCP listener through the swarm's UPnP client
    pub enable_upnp: bool,
    /// Upper bound on a single lookup
    pub query_timeout: Duration,
}

/// Handle to the running libp2p Kademlia engine
pub struct DhtEngine {
    commands: mpsc::Sender<Command>,
    store: Arc<dyn Store>,
    task: Mutex<Option<JoinHandle<()>>>,
    query_timeout: Duration,
}

impl DhtEngine {
    /// Start the engine, restoring the routing table saved by the last run
    pub async fn start(
        settings: DhtSettings,
        identity: &LocalIdentity,
        store: Arc<dyn Store>,
    ) -> Result<Self> {
        let keypair = libp2p::identity::Keypair::ed25519_from_bytes(identity.secret_key().signing_bytes())
            .map_err(|e| dht_error("keypair", e))?;
        let enable_upnp = settings.enable_upnp;

        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(tcp::Config::default(), noise::Config::new, yamux::Config::default)
            .map_err(|e| dht_error("transport", e))?
            .with_behaviour(|key| {
                let local = key.public().to_peer_id();
                let mut kademlia = kad::Behaviour::new(local, MemoryStore::new(local));
                kademlia.set_mode(Some(Mode::Server));
                DhtBehaviour {
                    kademlia,
                    upnp: Toggle::from(enable_upnp.then(upnp::tokio::Behaviour::default)),
                }
            })
            .map_err(|e| dht_error("behaviour", e))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        let listen = Multiaddr::empty()
            .with(Protocol::from(settings.listen_address))
            .with(Protocol::Tcp(settings.listen_port));
        swarm
            .listen_on(listen)
            .map_err(|e| dht_error("listen", e))?;

        let mut seeded = 0;
        for node in &settings.bootstrap_nodes {
            match parse_bootstrap_node(node) {
                Ok((key, addr)) => {
                    swarm.behaviour_mut().kademlia.add_address(&key, addr);
                    seeded += 1;
                }
                Err(e) => log::warn!("Ignoring DHT bootstrap node: {}", e),
            }
        }

        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let mut state = EngineState {
            swarm,
            lookups: HashMap::new(),
            listen: Vec::new(),
            bound: settings.listen_address,
        };

        match storage::read_all(store.as_ref(), DHT_TABLE_PATH) {
            Ok(Some(bytes)) => match RoutingTable::decode(&bytes) {
                Ok(table) => seeded += state.merge(table),
                Err(e) => log::warn!("Discarding saved DHT routing table: {}", e),
            },
            Ok(None) => log::info!("No saved DHT routing table, cold start"),
            Err(e) => log::warn!("Could not read saved DHT routing table: {}", e),
        }
        if seeded > 0 {
            state.bootstrap();
        }

        let task = tokio::spawn(state.run(command_rx));
        log::info!(
            "DHT engine listening on {}:{} ({} seed nodes)",
            settings.listen_address,
            settings.listen_port,
            seeded
        );

        Ok(Self {
            commands,
            store,
            task: Mutex::new(Some(task)),
            query_timeout: settings.query_timeout,
        })
    }

    async fn request<T>(
        &self,
        operation: &str,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| dht_error(operation, "engine stopped"))?;
        response
            .await
            .map_err(|_| dht_error(operation, "engine dropped the request"))
    }
}

#[async_trait]
impl Dht for DhtEngine {
    async fn announce(&self, peer: &PeerId, mapping: PortMapping) -> Result<()> {
        let peer = *peer;
        self.request("announce", |reply| Command::Announce {
            peer,
            mapping,
            reply,
        })
        .await?
    }

    async fn find_peers(&self, peer: &PeerId) -> Result<Vec<SocketAddr>> {
        let peer = *peer;
        let lookup = self.request("find_peers", |reply| Command::FindPeers { peer, reply });
        tokio::time::timeout(self.query_timeout, lookup)
            .await
            .map_err(|_| NetworkError::Timeout {
                operation: format!("DHT lookup for {peer}"),
            })?
    }

    async fn routing_table(&self) -> Result<Vec<u8>> {
        self.request("snapshot", |reply| Command::Snapshot { reply })
            .await?
            .encode()
    }

    async fn merge_routing_table(&self, snapshot: &[u8]) -> Result<usize> {
        let table = RoutingTable::decode(snapshot)?;
        self.request("merge", |reply| Command::Merge { table, reply })
            .await
    }

    async fn stop(&self) -> Result<()> {
        let task = self.task.lock().take();
        let Some(task) = task else {
            return Ok(());
        };

        let table = self.request("stop", |reply| Command::Stop { reply }).await;
        if let Err(e) = task.await {
            log::warn!("DHT engine task ended abnormally: {}", e);
        }

        let table = table?;
        storage::write_all(self.store.as_ref(), DHT_TABLE_PATH, &table.encode()?)?;
        log::info!("DHT engine stopped, saved {} nodes", table.nodes.len());
        Ok(())
    }
}

struct EngineState {
    swarm: Swarm<DhtBehaviour>,
    lookups: HashMap<kad::QueryId, oneshot::Sender<Vec<SocketAddr>>>,
    listen: Vec<IpAddr>,
    bound: IpAddr,
}

impl EngineState {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Stop { reply }) => {
                        let _ = reply.send(self.snapshot());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = self.swarm.select_next_some() => self.handle_event(event),
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Announce {
                peer,
                mapping,
                reply,
            } => {
                let _ = reply.send(self.announce(&peer, mapping));
            }
            Command::FindPeers { peer, reply } => {
                let query = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .get_record(kad::RecordKey::new(&dht_key(&peer)));
                self.lookups.insert(query, reply);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Merge { table, reply } => {
                let added = self.merge(table);
                if added > 0 {
                    self.bootstrap();
                }
                let _ = reply.send(added);
            }
            Command::Stop { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn announce(&mut self, peer: &PeerId, mapping: PortMapping) -> Result<()> {
        let endpoints = advertised_endpoints(mapping, &self.listen, self.bound);
        let value = bincode::serialize(&endpoints)?;
        let record = kad::Record::new(kad::RecordKey::new(&dht_key(peer)), value);
        self.swarm
            .behaviour_mut()
            .kademlia
            .put_record(record, Quorum::One)
            .map_err(|e| dht_error("announce", e))?;
        log::debug!("Announced {} at {:?}", peer, endpoints);
        Ok(())
    }

    fn snapshot(&mut self) -> RoutingTable {
        let mut nodes = Vec::new();
        for bucket in self.swarm.behaviour_mut().kademlia.kbuckets() {
            for entry in bucket.iter() {
                nodes.push(KnownNode {
                    node: entry.node.key.preimage().to_bytes(),
                    addresses: entry.node.value.iter().map(ToString::to_string).collect(),
                });
            }
        }
        RoutingTable { nodes }
    }

    fn merge(&mut self, table: RoutingTable) -> usize {
        let local = *self.swarm.local_peer_id();
        let mut added = 0;
        for node in table.nodes {
            let Ok(key) = NodeKey::from_bytes(&node.node) else {
                continue;
            };
            if key == local {
                continue;
            }
            for address in node.addresses.iter().filter_map(|a| a.parse::<Multiaddr>().ok()) {
                self.swarm.behaviour_mut().kademlia.add_address(&key, address);
                added += 1;
            }
        }
        added
    }

    fn bootstrap(&mut self) {
        if let Err(e) = self.swarm.behaviour_mut().kademlia.bootstrap() {
            log::debug!("DHT bootstrap skipped: {}", e);
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<DhtBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                if let Some(endpoint) = socket_addr(&address) {
                    if !self.listen.contains(&endpoint.ip()) {
                        self.listen.push(endpoint.ip());
                    }
                }
            }
            SwarmEvent::Behaviour(DhtBehaviourEvent::Kademlia(event)) => self.handle_kademlia(event),
            SwarmEvent::Behaviour(DhtBehaviourEvent::Upnp(event)) => self.handle_upnp(event),
            _ => {}
        }
    }

    fn handle_kademlia(&mut self, event: kad::Event) {
        let kad::Event::OutboundQueryProgressed { id, result, .. } = event else {
            return;
        };
        match result {
            QueryResult::GetRecord(Ok(GetRecordOk::FoundRecord(PeerRecord { record, .. }))) => {
                if let Some(reply) = self.lookups.remove(&id) {
                    let endpoints: Vec<SocketAddr> =
                        bincode::deserialize(&record.value).unwrap_or_default();
                    let _ = reply.send(endpoints);
                }
            }
            QueryResult::GetRecord(Ok(_)) => {
                if let Some(reply) = self.lookups.remove(&id) {
                    let _ = reply.send(Vec::new());
                }
            }
            QueryResult::GetRecord(Err(e)) => {
                log::debug!("DHT lookup finished without record: {}", e);
                if let Some(reply) = self.lookups.remove(&id) {
                    let _ = reply.send(Vec::new());
                }
            }
            QueryResult::PutRecord(Err(e)) => log::debug!("DHT announce not replicated: {}", e),
            QueryResult::Bootstrap(Ok(ok)) => {
                log::debug!("DHT bootstrap step, {} remaining", ok.num_remaining);
            }
            _ => {}
        }
    }

    fn handle_upnp(&mut self, event: upnp::Event) {
        match event {
            upnp::Event::NewExternalAddr(addr) => log::info!("DHT listener mapped to {}", addr),
            upnp::Event::ExpiredExternalAddr(addr) => log::info!("DHT listener mapping {} expired", addr),
            upnp::Event::GatewayNotFound => log::info!("No UPnP gateway for the DHT listener"),
            upnp::Event::NonRoutableGateway => log::info!("UPnP gateway is not publicly routable"),
        }
    }
}
