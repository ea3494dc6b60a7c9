//! Transport layer for overlay messaging.
//!
//! This module provides the wire protocol and the message service that
//! delivers, acknowledges and relays messages over UDP.

pub mod protocol;
pub mod service;

pub use protocol::*;
pub use service::{MessageService, ServiceDeps, ServiceSettings};
