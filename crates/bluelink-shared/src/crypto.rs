//! Authenticated encryption and key derivation.
//!
//! Every payload crossing the radio (chat messages and file chunks) is
//! wrapped in an [`Envelope`]: a fresh random 24-byte nonce, the ciphertext,
//! and the Poly1305 tag. The envelope is self-describing; decryption needs
//! nothing but the session key and the envelope bytes.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::constants::{KDF_CONTEXT_SESSION_KEY, NONCE_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; 32];

/// One encrypted payload: nonce, ciphertext and authentication tag
/// (the tag is appended to `ciphertext` by the AEAD).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Flat byte encoding: nonce || ciphertext.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CryptoError> {
        if data.len() < NONCE_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(nonce_bytes);
        Ok(Self {
            nonce,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
pub fn seal(key: &SymmetricKey, plaintext: &[u8]) -> Result<Envelope, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = generate_nonce();

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(Envelope { nonce, ciphertext })
}

/// Verify the tag and decrypt. Any mismatch (tampering, wrong key,
/// corrupted nonce) yields [`CryptoError::DecryptionFailed`].
pub fn open(key: &SymmetricKey, envelope: &Envelope) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(XNonce::from_slice(&envelope.nonce), envelope.ciphertext.as_ref())
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// BLAKE3 KDF with domain separation: derive the symmetric session key from
/// a raw Diffie-Hellman shared value. The raw value is never used as a key.
pub fn derive_session_key(shared_secret: &[u8]) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_SESSION_KEY);
    hasher.update(shared_secret);
    let hash = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash.as_bytes()[..32]);
    key
}

/// Hex-encoded BLAKE3 digest of a byte slice.
pub fn digest_hex(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = generate_symmetric_key();
        let plaintext = b"hello over the radio";

        let envelope = seal(&key, plaintext).unwrap();
        let decrypted = open(&key, &envelope).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = generate_symmetric_key();
        let key2 = generate_symmetric_key();

        let envelope = seal(&key1, b"secret").unwrap();
        assert!(open(&key2, &envelope).is_err());
    }

    #[test]
    fn test_any_flipped_ciphertext_byte_fails() {
        let key = generate_symmetric_key();
        let envelope = seal(&key, b"important data").unwrap();

        for i in 0..envelope.ciphertext.len() {
            let mut tampered = envelope.clone();
            tampered.ciphertext[i] ^= 0xFF;
            assert!(open(&key, &tampered).is_err(), "byte {i} flip went undetected");
        }
    }

    #[test]
    fn test_corrupted_nonce_fails() {
        let key = generate_symmetric_key();
        let mut envelope = seal(&key, b"payload").unwrap();
        envelope.nonce[0] ^= 0x01;
        assert!(open(&key, &envelope).is_err());
    }

    #[test]
    fn test_envelope_bytes_roundtrip() {
        let key = generate_symmetric_key();
        let envelope = seal(&key, b"self describing").unwrap();

        let restored = Envelope::from_bytes(&envelope.to_bytes()).unwrap();
        assert_eq!(restored, envelope);
        assert_eq!(open(&key, &restored).unwrap(), b"self describing");
    }

    #[test]
    fn test_envelope_too_short_fails() {
        assert!(Envelope::from_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_session_key_derivation_deterministic() {
        let secret = [7u8; 32];
        assert_eq!(derive_session_key(&secret), derive_session_key(&secret));
    }

    #[test]
    fn test_session_key_differs_from_raw_secret() {
        let secret = [7u8; 32];
        assert_ne!(derive_session_key(&secret), secret);
    }

    #[test]
    fn test_digest_hex_idempotent() {
        let data = b"same bytes, same digest";
        assert_eq!(digest_hex(data), digest_hex(data));
        assert_ne!(digest_hex(data), digest_hex(b"different bytes"));
    }
}
