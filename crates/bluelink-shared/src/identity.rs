//! Device identity: one long-lived X25519 keypair per installation.
//!
//! The keypair is generated once and reused for every pairing. The public
//! key doubles as the device's cryptographic identity; its fingerprint and
//! the PIN derived from it let users verify a peer out of band.

use base64::{engine::general_purpose, Engine as _};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

use crate::constants::{FINGERPRINT_BYTES, KDF_CONTEXT_FINGERPRINT, PIN_DIGITS, PUBKEY_SIZE};
use crate::error::IdentityError;

/// The installation's long-lived elliptic-curve keypair.
#[derive(Clone)]
pub struct DeviceKeyPair {
    secret: StaticSecret,
}

/// Serializable format for storing/exporting the keypair.
#[derive(Serialize, Deserialize)]
pub struct KeyPairExport {
    pub secret_key: [u8; 32],
    pub public_key: [u8; 32],
}

impl DeviceKeyPair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Restore a keypair from secret key bytes.
    pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(secret),
        }
    }

    /// Restore a keypair from a serialized export.
    pub fn from_export(export: &KeyPairExport) -> Self {
        Self::from_secret_bytes(export.secret_key)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(&self.secret)
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public_key().to_bytes()
    }

    /// X25519 Diffie-Hellman against a peer public key. The caller passes
    /// the raw shared value through the session-key KDF before use.
    pub fn diffie_hellman(&self, peer_public: &PublicKey) -> SharedSecret {
        self.secret.diffie_hellman(peer_public)
    }

    /// Export for serialization.
    pub fn to_export(&self) -> KeyPairExport {
        KeyPairExport {
            secret_key: self.secret.to_bytes(),
            public_key: self.public_key_bytes(),
        }
    }
}

/// Parse raw public key bytes received from a peer.
pub fn parse_public_key(bytes: &[u8]) -> Result<PublicKey, IdentityError> {
    let arr: [u8; PUBKEY_SIZE] = bytes.try_into().map_err(|_| IdentityError::InvalidKeyBytes)?;
    Ok(PublicKey::from(arr))
}

/// Short stable digest of a public key, shown to users for visual identity
/// verification: first 8 bytes of a domain-separated BLAKE3 hash, base64.
pub fn fingerprint(public_key_bytes: &[u8; 32]) -> String {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_FINGERPRINT);
    hasher.update(public_key_bytes);
    let hash = hasher.finalize();
    general_purpose::STANDARD.encode(&hash.as_bytes()[..FINGERPRINT_BYTES])
}

/// Derive a 6-digit verification PIN from a fingerprint string. Both peers
/// compute it from the same fingerprint, so the digits match exactly when
/// the keys do.
pub fn pin_from_fingerprint(fp: &str) -> String {
    let chars: Vec<char> = fp.chars().collect();
    let mut pin = String::with_capacity(PIN_DIGITS);
    for i in 0..PIN_DIGITS {
        let c = chars.get(i).copied().unwrap_or('A');
        let digit = (c as u32 % 10) as u8 + b'0';
        pin.push(digit as char);
    }
    pin
}
