//! Error types and handling for the overlay messenger.
//!
//! Every layer has its own error enum; they are unified into
//! [`MessengerError`] so that `?` works across module boundaries. Only
//! identity failures are fatal. Everything raised by a single network call
//! is expected steady-state noise and is classified as recoverable.

use thiserror::Error;

/// Result type alias for the messenger library
pub type Result<T> = std::result::Result<T, MessengerError>;

/// Comprehensive error type for all messenger operations
#[derive(Error, Debug, Clone)]
pub enum MessengerError {
    /// The local identity could not be created or loaded
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Cryptographic operation errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Network and transport layer errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Configuration and I/O errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Protocol-level errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Persistence errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The node is shutting down and no longer accepts work
    #[error("Node is shutting down")]
    ShuttingDown,
}

/// Failures creating or loading the node's own keypair
#[derive(Error, Debug, Clone)]
pub enum IdentityError {
    /// Stored key material exists but cannot be decoded
    #[error("Corrupt identity key material: {reason}")]
    Corrupt {
        /// What failed to decode
        reason: String,
    },

    /// Key material could not be read from or written to the store
    #[error("Identity store unavailable: {reason}")]
    Unavailable {
        /// Underlying store failure
        reason: String,
    },
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone)]
pub enum CryptoError {
    /// Invalid key format or size
    #[error("Invalid key: {reason}")]
    InvalidKey {
        /// Why the key was rejected
        reason: String,
    },

    /// No public key is known for the peer, locally or on any rendezvous server
    #[error("Public key not found for peer {peer_id}")]
    KeyNotFound {
        /// Peer whose key is missing
        peer_id: String,
    },

    /// Signature verification failure
    #[error("Signature verification failed")]
    SignatureVerification,

    /// Encryption operation failure
    #[error("Encryption failed: {reason}")]
    Encryption {
        /// Cipher failure
        reason: String,
    },

    /// Decryption operation failure
    #[error("Decryption failed: {reason}")]
    Decryption {
        /// Cipher failure
        reason: String,
    },

    /// Key derivation failure
    #[error("Key derivation failed: {reason}")]
    KeyDerivation {
        /// HKDF failure
        reason: String,
    },
}

/// Network and transport layer errors
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// Sending to or binding an endpoint failed
    #[error("Transport error: {reason}")]
    Transport {
        /// Socket failure
        reason: String,
    },

    /// Timeout during network operation
    #[error("Network timeout: {operation}")]
    Timeout {
        /// Operation that ran out of time
        operation: String,
    },

    /// Invalid network address
    #[error("Invalid address: {address}")]
    InvalidAddress {
        /// The rejected address text
        address: String,
    },

    /// No endpoint is known for the peer
    #[error("No route to peer: {peer_id}")]
    NoRoute {
        /// Unreachable peer
        peer_id: String,
    },

    /// A rendezvous server call failed
    #[error("Rendezvous server {server} failed: {reason}")]
    Rendezvous {
        /// Server base URI
        server: String,
        /// Status or transport failure
        reason: String,
    },

    /// NAT traversal failure
    #[error("NAT traversal failed: {reason}")]
    NatTraversal {
        /// Gateway failure
        reason: String,
    },

    /// DHT operation failure
    #[error("DHT operation failed: {operation}: {reason}")]
    DhtFailure {
        /// Engine operation
        operation: String,
        /// Engine failure
        reason: String,
    },
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue {
        /// Configuration key
        field: String,
        /// Rejected value
        value: String,
    },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Missing file
        path: String,
    },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError {
        /// Parser message
        reason: String,
    },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Directory creation failure
    #[error("Failed to create directory: {path}")]
    DirectoryCreation {
        /// Directory that could not be created
        path: String,
    },
}

/// Protocol-level errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Unsupported protocol version
    #[error("Unsupported protocol version: {version}")]
    UnsupportedVersion {
        /// Version found on the wire
        version: String,
    },

    /// Invalid message format
    #[error("Invalid message format: {reason}")]
    InvalidMessage {
        /// Decoder message
        reason: String,
    },

    /// Message too large
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Encoded size
        size: usize,
        /// Allowed size
        max: usize,
    },

    /// Invalid peer identifier
    #[error("Invalid peer id: {value}")]
    InvalidPeerId {
        /// The rejected text
        value: String,
    },
}

/// Persistence errors
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// The store rejected a read or write
    #[error("Store access failed at {path}: {reason}")]
    Access {
        /// Store path
        path: String,
        /// Underlying I/O failure
        reason: String,
    },
}

impl MessengerError {
    /// Returns true if no messaging can proceed after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Identity(_))
    }

    /// Returns true if this error is expected noise that callers swallow and retry
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Crypto(CryptoError::KeyNotFound { .. }) | Self::Io(_)
        )
    }
}

impl From<std::io::Error> for MessengerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for MessengerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for MessengerError {
    fn from(err: bincode::Error) -> Self {
        Self::Protocol(ProtocolError::InvalidMessage {
            reason: err.to_string(),
        })
    }
}

impl From<reqwest::Error> for NetworkError {
    fn from(err: reqwest::Error) -> Self {
        let server = err
            .url()
            .map(|url| url.origin().ascii_serialization())
            .unwrap_or_else(|| "unknown".to_string());
        if err.is_timeout() {
            Self::Timeout {
                operation: format!("request to {server}"),
            }
        } else {
            Self::Rendezvous {
                server,
                reason: err.to_string(),
            }
        }
    }
}

impl From<reqwest::Error> for MessengerError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = MessengerError::Crypto(CryptoError::KeyNotFound {
            peer_id: "ab".repeat(20),
        });
        assert!(error.to_string().contains("Public key not found"));
    }

    #[test]
    fn test_error_recovery() {
        let timeout_error = MessengerError::Network(NetworkError::Timeout {
            operation: "connect".to_string(),
        });
        assert!(timeout_error.is_recoverable());
        assert!(!timeout_error.is_fatal());

        let crypto_error = MessengerError::Crypto(CryptoError::SignatureVerification);
        assert!(!crypto_error.is_recoverable());
    }

    #[test]
    fn test_identity_errors_are_fatal() {
        let error: MessengerError = IdentityError::Corrupt {
            reason: "short key".to_string(),
        }
        .into();
        assert!(error.is_fatal());
        assert!(!error.is_recoverable());
    }

    #[test]
    fn test_storage_error_names_path() {
        let error: MessengerError = StorageError::Access {
            path: "undelivered.bin".to_string(),
            reason: "disk full".to_string(),
        }
        .into();
        assert!(error.to_string().contains("undelivered.bin"));
        assert!(!error.is_fatal());
    }
}
