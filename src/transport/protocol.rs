//! Message protocol definitions and serialization.
//!
//! Application messages travel as a small request/response protocol: a
//! [`Request`] carries one recipient's copy of a message, a [`Response`]
//! acknowledges it hop by hop. Both are wrapped in [`WireMessage`] and sent as
//! one bincode-encoded UDP datagram.

use crate::crypto::PeerId;
use crate::utils::{ProtocolError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Protocol version carried in every datagram
pub const PROTOCOL_VERSION: u32 = crate::PROTOCOL_VERSION;

/// Largest payload a single UDP datagram can carry
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Topic reserved for control notices
pub const SYSTEM_TOPIC: &str = "#system";

/// Relays drop requests whose via trace reached this length
pub const MAX_HOPS: usize = 8;

/// A participant of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    /// Overlay address
    pub peer_id: PeerId,
    /// Human-readable name
    pub display_name: String,
}

impl Party {
    /// Create a party
    pub fn new(peer_id: PeerId, display_name: impl Into<String>) -> Self {
        Self {
            peer_id,
            display_name: display_name.into(),
        }
    }
}

/// An application message as composed locally or received off the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Call identifier; unique per sender and topic
    pub id: String,
    /// Topic name, `None` for direct conversations
    pub topic: Option<String>,
    /// Author
    pub sender: Party,
    /// Every recipient, in order
    pub recipients: Vec<Party>,
    /// Body text
    pub content: String,
    /// Time the author signed the message
    pub signed_on: DateTime<Utc>,
    /// Whether the body was decrypted and its signature verified
    pub decrypted: bool,
    /// Whether the message reached its destination
    pub delivered: bool,
}

impl Message {
    /// Compose a new outbound message with a fresh call identifier
    pub fn compose(
        sender: Party,
        recipients: Vec<Party>,
        topic: Option<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic,
            sender,
            recipients,
            content: content.into(),
            signed_on: Utc::now(),
            decrypted: false,
            delivered: false,
        }
    }

    /// Whether this message is a control notice
    pub fn is_system(&self) -> bool {
        self.topic.as_deref() == Some(SYSTEM_TOPIC)
    }
}

/// One recipient's copy of a message in flight
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Final recipient
    pub destination: PeerId,
    /// Routing topic
    pub topic: Option<String>,
    /// Call identifier, the retry and dedup correlation key
    pub call_id: String,
    /// Date the author signed the message
    pub date: DateTime<Utc>,
    /// Author
    pub from: Party,
    /// All recipients of the original message
    pub to: Vec<Party>,
    /// Stack of previous-hop endpoints, pushed by each relay
    pub via: Vec<SocketAddr>,
    /// Encrypted body, or plaintext when no key was available to the author
    pub body: Vec<u8>,
}

impl Request {
    /// Endpoint of the original author as observed by the first hop, when
    /// the request was relayed
    pub fn origin(&self) -> Option<SocketAddr> {
        self.via.first().copied()
    }
}

/// Response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    /// Delivered to the destination
    Ok,
    /// Taken over by a relay for forwarding
    Accepted,
}

/// Hop-by-hop acknowledgement of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Call identifier of the acknowledged request
    pub call_id: String,
    /// Peer whose copy is acknowledged
    pub peer: PeerId,
    /// Outcome
    pub status: StatusCode,
    /// Remaining back-route, copied from the request and popped per hop
    pub via: Vec<SocketAddr>,
    /// Endpoints observed while travelling back; the first is the responder's
    pub record_route: Vec<SocketAddr>,
}

impl Response {
    /// Acknowledge `request` on behalf of `peer`
    pub fn to_request(request: &Request, peer: PeerId, status: StatusCode) -> Self {
        Self {
            call_id: request.call_id.clone(),
            peer,
            status,
            via: request.via.clone(),
            record_route: Vec::new(),
        }
    }

    /// Endpoint of the responder, given the endpoint this response came from
    pub fn responder_endpoint(&self, source: SocketAddr) -> SocketAddr {
        self.record_route.first().copied().unwrap_or(source)
    }
}

/// Tagged datagram content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    /// A message copy travelling towards its destination
    Request(Request),
    /// An acknowledgement travelling back
    Response(Response),
}

#[derive(Serialize, Deserialize)]
struct Datagram {
    version: u32,
    message: WireMessage,
}

#[derive(Serialize)]
struct DatagramRef<'a> {
    version: u32,
    message: &'a WireMessage,
}

impl WireMessage {
    /// Serialize into one datagram
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = bincode::serialize(&DatagramRef {
            version: PROTOCOL_VERSION,
            message: self,
        })?;

        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_DATAGRAM_SIZE,
            }
            .into());
        }

        Ok(bytes)
    }

    /// Parse a datagram
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_DATAGRAM_SIZE,
            }
            .into());
        }

        let datagram: Datagram = bincode::deserialize(bytes)?;
        if datagram.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                version: datagram.version.to_string(),
            }
            .into());
        }

        Ok(datagram.message)
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretKey;

    fn peer() -> PeerId {
        SecretKey::generate().public_key().peer_id()
    }

    fn request() -> Request {
        let from = Party::new(peer(), "alice");
        let to = Party::new(peer(), "bob");
        Request {
            destination: to.peer_id,
            topic: Some("lunch".to_string()),
            call_id: "c1".to_string(),
            date: Utc::now(),
            from,
            to: vec![to],
            via: Vec::new(),
            body: b"sealed".to_vec(),
        }
    }

    #[test]
    fn test_request_serialization() {
        let wire = WireMessage::Request(request());
        let decoded = WireMessage::from_bytes(&wire.to_bytes().unwrap()).unwrap();
        assert_eq!(wire, decoded);
        assert_eq!(decoded.kind(), "request");
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(WireMessage::from_bytes(b"\x01\x02\x03").is_err());
        assert!(WireMessage::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let bytes = bincode::serialize(&Datagram {
            version: PROTOCOL_VERSION + 1,
            message: WireMessage::Request(request()),
        })
        .unwrap();
        assert!(WireMessage::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_message_size_limit() {
        let mut oversized = request();
        oversized.body = vec![0u8; MAX_DATAGRAM_SIZE];
        assert!(WireMessage::Request(oversized).to_bytes().is_err());
    }

    #[test]
    fn test_response_endpoints() {
        let direct: SocketAddr = "10.0.0.5:6303".parse().unwrap();
        let relay: SocketAddr = "10.0.0.9:6303".parse().unwrap();
        let mut response = Response::to_request(&request(), peer(), StatusCode::Ok);

        assert_eq!(response.responder_endpoint(direct), direct);
        response.record_route.push(direct);
        assert_eq!(response.responder_endpoint(relay), direct);
    }

    #[test]
    fn test_compose_and_system_topic() {
        let sender = Party::new(peer(), "alice");
        let first = Message::compose(sender.clone(), vec![], None, "hi");
        let second = Message::compose(sender.clone(), vec![], Some(SYSTEM_TOPIC.to_string()), "x");

        assert_ne!(first.id, second.id);
        assert!(!first.is_system());
        assert!(second.is_system());
        assert!(!first.delivered);
    }
}
