//! # Overlay Messenger
//!
//! A peer-to-peer, end-to-end encrypted messaging overlay. Each installation
//! is a node identified by a fingerprint of its own keypair. Nodes find each
//! other through a Kademlia DHT seeded via rendezvous servers, exchange
//! messages with a small request/response protocol over UDP, encrypt every
//! body point-to-point and relay messages for peers that are not directly
//! reachable.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use overlay_messenger::{MessengerConfig, Node};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MessengerConfig::default();
//!     let node = Node::start(config, None).await?;
//!     println!("running as {}", node.peer_id());
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! Components are built leaf first and handed to each other explicitly:
//!
//! - [`crypto`]: identity keypair, PeerId derivation and the body envelope
//! - [`storage`]: the byte-stream persistence contract and undelivered messages
//! - [`network`]: peer cache, DHT adapter, NAT traversal and bootstrap sync
//! - [`transport`]: wire protocol and the message relay state machine
//! - [`utils`]: configuration and error handling

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod crypto;
pub mod network;
pub mod storage;
pub mod transport;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use app::Node;
pub use crypto::{IdentityStore, KeyContainer, LocalIdentity, PeerId, PublicKey};
pub use transport::{Message, MessageService, Party};
pub use utils::{MessengerConfig, MessengerError, Result};

/// Version of the wire protocol
pub const PROTOCOL_VERSION: u32 = 1;

/// Default configuration values
pub mod defaults {
    /// Default port for the message socket and the DHT listener
    pub const DEFAULT_PORT: u16 = 6303;

    /// Default pause between bootstrap synchronization cycles
    pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;

    /// Default pause between consecutive rendezvous calls
    pub const DEFAULT_STEP_DELAY_MS: u64 = 500;

    /// Default interval between resends of an unacknowledged message
    pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 10_000;

    /// Default number of port mapping attempts
    pub const DEFAULT_NAT_ATTEMPTS: u32 = 3;
}
