//! Node identity: keypairs, key containers and the PeerId fingerprint.
//!
//! A node owns one Ed25519 signing key and one X25519 key agreement key.
//! The two public halves travel together as a [`PublicKey`]; the node's
//! [`PeerId`] is the first 20 bytes of the SHA-256 digest of that encoding
//! and never changes once the keypair exists.

use crate::storage::{self, Store, IDENTITY_PATH};
use crate::utils::{CryptoError, IdentityError, ProtocolError, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SIGNATURE_LENGTH};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::OnceCell;
use x25519_dalek::{PublicKey as ExchangePublic, StaticSecret};

/// Length of a peer identifier in bytes
pub const PEER_ID_LENGTH: usize = 20;

/// Length of an encoded public key (signing half then exchange half)
pub const PUBLIC_KEY_LENGTH: usize = 64;

/// Length of an encoded secret key
pub const SECRET_KEY_LENGTH: usize = 64;

/// Version tag of the persisted keypair record
const IDENTITY_RECORD_VERSION: u8 = 1;

/// 20-byte fingerprint of a node's public key; the node's overlay address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; PEER_ID_LENGTH]);

impl PeerId {
    /// Wrap raw identifier bytes
    pub fn from_bytes(bytes: [u8; PEER_ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Fingerprint a public key
    pub fn fingerprint(public_key: &PublicKey) -> Self {
        let digest = Sha256::digest(public_key.to_bytes());
        let mut id = [0u8; PEER_ID_LENGTH];
        id.copy_from_slice(&digest[..PEER_ID_LENGTH]);
        Self(id)
    }

    /// Raw identifier bytes
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LENGTH] {
        &self.0
    }

    /// Lowercase hex form, as used on the wire and by rendezvous servers
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

impl FromStr for PeerId {
    type Err = crate::utils::MessengerError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ProtocolError::InvalidPeerId {
            value: s.to_string(),
        };
        let bytes = hex::decode(s.trim()).map_err(|_| invalid())?;
        let id: [u8; PEER_ID_LENGTH] = bytes.try_into().map_err(|_| invalid())?;
        Ok(Self(id))
    }
}

/// Public half of a node keypair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    signing: VerifyingKey,
    exchange: ExchangePublic,
}

impl PublicKey {
    /// Encode as 64 bytes: Ed25519 verifying key, then X25519 public key
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        let mut out = [0u8; PUBLIC_KEY_LENGTH];
        out[..32].copy_from_slice(self.signing.as_bytes());
        out[32..].copy_from_slice(self.exchange.as_bytes());
        out
    }

    /// Decode the 64-byte encoding
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` on a wrong length or an invalid curve point
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PUBLIC_KEY_LENGTH {
            return Err(CryptoError::InvalidKey {
                reason: format!(
                    "Invalid public key length: expected {}, got {}",
                    PUBLIC_KEY_LENGTH,
                    bytes.len()
                ),
            }
            .into());
        }
        let mut signing = [0u8; 32];
        signing.copy_from_slice(&bytes[..32]);
        let mut exchange = [0u8; 32];
        exchange.copy_from_slice(&bytes[32..]);

        let signing = VerifyingKey::from_bytes(&signing).map_err(|e| CryptoError::InvalidKey {
            reason: e.to_string(),
        })?;
        Ok(Self {
            signing,
            exchange: ExchangePublic::from(exchange),
        })
    }

    /// The PeerId this key fingerprints to
    pub fn peer_id(&self) -> PeerId {
        PeerId::fingerprint(self)
    }

    /// Key agreement half
    pub fn exchange(&self) -> &ExchangePublic {
        &self.exchange
    }

    /// Verify an Ed25519 signature made by the owner of this key
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let signature: [u8; SIGNATURE_LENGTH] = signature
            .try_into()
            .map_err(|_| CryptoError::SignatureVerification)?;
        self.signing
            .verify(message, &Signature::from_bytes(&signature))
            .map_err(|_| CryptoError::SignatureVerification.into())
    }
}

/// Private half of a node keypair
#[derive(Clone)]
pub struct SecretKey {
    signing: SigningKey,
    exchange: StaticSecret,
}

impl SecretKey {
    /// Generate a fresh random keypair
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
            exchange: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Rebuild from the two 32-byte secret scalars
    pub fn from_parts(signing: [u8; 32], exchange: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&signing),
            exchange: StaticSecret::from(exchange),
        }
    }

    /// Matching public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            signing: self.signing.verifying_key(),
            exchange: ExchangePublic::from(&self.exchange),
        }
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing.sign(message).to_bytes()
    }

    /// Key agreement half
    pub fn exchange(&self) -> &StaticSecret {
        &self.exchange
    }

    /// Raw Ed25519 secret, used to derive the DHT node key
    pub fn signing_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Public key material plus, for the local identity only, the private key
#[derive(Debug, Clone)]
pub struct KeyContainer {
    public: PublicKey,
    secret: Option<SecretKey>,
}

impl KeyContainer {
    /// Container for a remote peer's key
    pub fn public_only(public: PublicKey) -> Self {
        Self {
            public,
            secret: None,
        }
    }

    /// Container for the local identity
    pub fn with_secret(secret: SecretKey) -> Self {
        Self {
            public: secret.public_key(),
            secret: Some(secret),
        }
    }

    /// Public key
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Private key, present for the local identity only
    pub fn secret(&self) -> Option<&SecretKey> {
        self.secret.as_ref()
    }
}

/// The node's own identity, immutable once created
#[derive(Debug)]
pub struct LocalIdentity {
    peer_id: PeerId,
    secret: SecretKey,
    public: PublicKey,
}

impl LocalIdentity {
    /// Build from a secret key
    pub fn new(secret: SecretKey) -> Self {
        let public = secret.public_key();
        Self {
            peer_id: public.peer_id(),
            secret,
            public,
        }
    }

    /// Generate a throwaway identity that is never persisted
    pub fn ephemeral() -> Self {
        Self::new(SecretKey::generate())
    }

    /// Local PeerId
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Local public key
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Local private key
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    /// Full key container (public plus private)
    pub fn keys(&self) -> KeyContainer {
        KeyContainer::with_secret(self.secret.clone())
    }

    /// Sign with the local key
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.secret.sign(message)
    }
}

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    version: u8,
    signing: [u8; 32],
    exchange: [u8; 32],
}

/// Loads or creates the local keypair exactly once per process
pub struct IdentityStore {
    store: Arc<dyn Store>,
    identity: OnceCell<Arc<LocalIdentity>>,
}

impl IdentityStore {
    /// Create an identity store over a persistence backend
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            identity: OnceCell::new(),
        }
    }

    /// Load the persisted keypair, generating and persisting one if absent.
    ///
    /// Concurrent callers wait for the same initialization; later calls
    /// return the cached identity.
    ///
    /// # Errors
    ///
    /// Returns `IdentityError` if the keypair cannot be loaded or persisted.
    /// This is fatal for the node.
    pub async fn ensure_identity(&self) -> Result<Arc<LocalIdentity>> {
        self.identity
            .get_or_try_init(|| async { self.load_or_create().map(Arc::new) })
            .await
            .cloned()
    }

    /// The local PeerId, if the identity is ready
    pub fn peer_id(&self) -> Option<PeerId> {
        self.identity.get().map(|identity| identity.peer_id())
    }

    fn load_or_create(&self) -> Result<LocalIdentity> {
        let unavailable = |e: crate::utils::MessengerError| IdentityError::Unavailable {
            reason: e.to_string(),
        };

        if let Some(bytes) = storage::read_all(self.store.as_ref(), IDENTITY_PATH).map_err(unavailable)? {
            let stored: StoredIdentity =
                bincode::deserialize(&bytes).map_err(|e| IdentityError::Corrupt {
                    reason: e.to_string(),
                })?;
            if stored.version != IDENTITY_RECORD_VERSION {
                return Err(IdentityError::Corrupt {
                    reason: format!("unknown record version {}", stored.version),
                }
                .into());
            }
            let identity = LocalIdentity::new(SecretKey::from_parts(stored.signing, stored.exchange));
            log::info!("Loaded identity {}", identity.peer_id());
            return Ok(identity);
        }

        let secret = SecretKey::generate();
        let stored = StoredIdentity {
            version: IDENTITY_RECORD_VERSION,
            signing: secret.signing.to_bytes(),
            exchange: secret.exchange.to_bytes(),
        };
        let bytes = bincode::serialize(&stored).map_err(|e| IdentityError::Corrupt {
            reason: e.to_string(),
        })?;
        storage::write_all(self.store.as_ref(), IDENTITY_PATH, &bytes).map_err(unavailable)?;

        let identity = LocalIdentity::new(secret);
        log::info!("Generated new identity {}", identity.peer_id());
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileStore, MemoryStore};
    use tempfile::TempDir;

    #[test]
    fn test_public_key_encoding() {
        let secret = SecretKey::generate();
        let public = secret.public_key();
        let restored = PublicKey::from_bytes(&public.to_bytes()).unwrap();

        assert_eq!(public, restored);
        assert_eq!(public.peer_id(), restored.peer_id());
        assert!(PublicKey::from_bytes(&[1u8; 12]).is_err());
    }

    #[test]
    fn test_signature_verification() {
        let secret = SecretKey::generate();
        let signature = secret.sign(b"Hello, world!");

        assert!(secret.public_key().verify(b"Hello, world!", &signature).is_ok());
        assert!(secret.public_key().verify(b"Hello, universe!", &signature).is_err());
        assert!(secret.public_key().verify(b"Hello, world!", &signature[..10]).is_err());
    }

    #[test]
    fn test_peer_id_hex_form() {
        let peer_id = SecretKey::generate().public_key().peer_id();
        let text = peer_id.to_string();

        assert_eq!(text.len(), PEER_ID_LENGTH * 2);
        assert_eq!(text, text.to_lowercase());
        assert_eq!(text.parse::<PeerId>().unwrap(), peer_id);
        assert!("xyz".parse::<PeerId>().is_err());
        assert!("abcd".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_key_container() {
        let secret = SecretKey::generate();
        let local = KeyContainer::with_secret(secret.clone());
        let remote = KeyContainer::public_only(secret.public_key());

        assert!(local.secret().is_some());
        assert!(remote.secret().is_none());
        assert_eq!(local.public(), remote.public());
    }

    #[tokio::test]
    async fn test_identity_is_stable_across_initializations() {
        let store = Arc::new(MemoryStore::new());

        let first = IdentityStore::new(store.clone()).ensure_identity().await.unwrap();
        let second = IdentityStore::new(store.clone()).ensure_identity().await.unwrap();

        assert_eq!(first.peer_id(), second.peer_id());
        assert_eq!(first.public_key(), second.public_key());
    }

    #[tokio::test]
    async fn test_identity_cached_within_process() {
        let identities = IdentityStore::new(Arc::new(MemoryStore::new()));
        assert!(identities.peer_id().is_none());

        let first = identities.ensure_identity().await.unwrap();
        let second = identities.ensure_identity().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(identities.peer_id(), Some(first.peer_id()));
    }

    #[tokio::test]
    async fn test_identity_persisted_to_files() {
        let dir = TempDir::new().unwrap();
        let first = IdentityStore::new(Arc::new(FileStore::new(dir.path())))
            .ensure_identity()
            .await
            .unwrap();
        let second = IdentityStore::new(Arc::new(FileStore::new(dir.path())))
            .ensure_identity()
            .await
            .unwrap();

        assert_eq!(first.peer_id(), second.peer_id());
    }

    #[tokio::test]
    async fn test_corrupt_identity_is_fatal() {
        let store = MemoryStore::new();
        storage::write_all(&store, IDENTITY_PATH, b"garbage").unwrap();

        let err = IdentityStore::new(Arc::new(store)).ensure_identity().await.unwrap_err();
        assert!(err.is_fatal());
    }
}
