//! Point-to-point body encryption.
//!
//! Bodies are signed with the sender's Ed25519 key and then sealed to the
//! recipient's X25519 key using a fresh ephemeral key, HKDF-SHA256 and
//! ChaCha20-Poly1305:
//!
//! ```text
//! version (1) | ephemeral public (32) | nonce (12) | AEAD( signature (64) | body )
//! ```
//!
//! The signature covers the recipient's exchange key followed by the body,
//! so a sealed body cannot be re-addressed to someone else.

use crate::crypto::{PublicKey, SecretKey};
use crate::utils::{CryptoError, Result};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::SIGNATURE_LENGTH;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as ExchangePublic};

/// Envelope format version
pub const ENVELOPE_VERSION: u8 = 1;

const NONCE_LENGTH: usize = 12;
const HEADER_LENGTH: usize = 1 + 32 + NONCE_LENGTH;

/// HKDF info for the body key
const BODY_KEY_INFO: &[u8] = b"overlay-messenger/body-key/v1";

/// Encrypt `body` for `recipient` and sign it with `sender`
///
/// # Errors
///
/// Fails only if the recipient key is a low-order point
pub fn encrypt_and_sign(body: &[u8], recipient: &PublicKey, sender: &SecretKey) -> Result<Vec<u8>> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = ExchangePublic::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient.exchange());
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey {
            reason: "recipient exchange key is a low-order point".to_string(),
        }
        .into());
    }

    let key = derive_body_key(shared.as_bytes(), &ephemeral_public, recipient.exchange())?;
    let cipher = ChaCha20Poly1305::new(&key.into());
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

    let signature = sender.sign(&signed_bytes(recipient.exchange(), body));
    let mut plaintext = Vec::with_capacity(SIGNATURE_LENGTH + body.len());
    plaintext.extend_from_slice(&signature);
    plaintext.extend_from_slice(body);

    let mut header = Vec::with_capacity(HEADER_LENGTH);
    header.push(ENVELOPE_VERSION);
    header.extend_from_slice(ephemeral_public.as_bytes());

    let ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: &plaintext,
                aad: &header,
            },
        )
        .map_err(|_| CryptoError::Encryption {
            reason: "AEAD encryption failed".to_string(),
        })?;

    let mut out = header;
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open an envelope addressed to `own` and check the sender's signature.
///
/// Returns the body and whether the signature verified against `sender`.
///
/// # Errors
///
/// Returns `CryptoError::Decryption` if the envelope is malformed, sealed to
/// another key or tampered with
pub fn decrypt_and_verify(
    envelope: &[u8],
    sender: &PublicKey,
    own: &SecretKey,
) -> Result<(Vec<u8>, bool)> {
    let malformed = |reason: &str| CryptoError::Decryption {
        reason: reason.to_string(),
    };

    if envelope.len() < HEADER_LENGTH + SIGNATURE_LENGTH {
        return Err(malformed("envelope too short").into());
    }
    if envelope[0] != ENVELOPE_VERSION {
        return Err(malformed("unknown envelope version").into());
    }

    let mut ephemeral = [0u8; 32];
    ephemeral.copy_from_slice(&envelope[1..33]);
    let ephemeral_public = ExchangePublic::from(ephemeral);
    let nonce = Nonce::from_slice(&envelope[33..HEADER_LENGTH]);

    let own_exchange = ExchangePublic::from(own.exchange());
    let shared = own.exchange().diffie_hellman(&ephemeral_public);
    if !shared.was_contributory() {
        return Err(malformed("ephemeral key is a low-order point").into());
    }

    let key = derive_body_key(shared.as_bytes(), &ephemeral_public, &own_exchange)?;
    let cipher = ChaCha20Poly1305::new(&key.into());
    let plaintext = cipher
        .decrypt(
            nonce,
            Payload {
                msg: &envelope[HEADER_LENGTH..],
                aad: &envelope[..33],
            },
        )
        .map_err(|_| malformed("authentication failed"))?;

    if plaintext.len() < SIGNATURE_LENGTH {
        return Err(malformed("missing signature").into());
    }
    let (signature, body) = plaintext.split_at(SIGNATURE_LENGTH);
    let verified = sender
        .verify(&signed_bytes(&own_exchange, body), signature)
        .is_ok();

    Ok((body.to_vec(), verified))
}

fn signed_bytes(recipient: &ExchangePublic, body: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(32 + body.len());
    bytes.extend_from_slice(recipient.as_bytes());
    bytes.extend_from_slice(body);
    bytes
}

fn derive_body_key(
    shared: &[u8; 32],
    ephemeral: &ExchangePublic,
    recipient: &ExchangePublic,
) -> Result<[u8; 32]> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral.as_bytes());
    salt[32..].copy_from_slice(recipient.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut key = [0u8; 32];
    hkdf.expand(BODY_KEY_INFO, &mut key)
        .map_err(|_| CryptoError::KeyDerivation {
            reason: "HKDF expand failed".to_string(),
        })?;
    Ok(key)
}
