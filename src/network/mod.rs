//! Network layer for peer discovery and connectivity.
//!
//! This module provides the peer cache, the DHT engine adapter, NAT
//! traversal and the bootstrap synchronization loop that seeds the DHT
//! through rendezvous servers.

pub mod bootstrap;
pub mod dht;
pub mod nat;
pub mod peers;

pub use bootstrap::{best_effort, BootstrapSync, HttpRendezvous, Rendezvous, SyncSettings};
pub use dht::{advertised_endpoints, Dht, DhtEngine, DhtSettings, NullDht};
pub use nat::{IgdPortMapper, NatTraversal, PortMapper, PortMapping};
pub use peers::{KeyFetcher, Peer, PeerCache};
