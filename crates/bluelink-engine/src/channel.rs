//! Authenticated encryption for everything that crosses a link.
//!
//! The [`SecureChannel`] owns every live [`Session`]. Payloads are sealed
//! with a fresh random nonce per operation; a failed tag verification
//! invalidates the peer's session on the spot, forcing re-pairing before any
//! further secure traffic.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use bluelink_shared::crypto::{self, Envelope, SymmetricKey};
use bluelink_shared::error::CryptoError;
use bluelink_shared::types::DeviceId;

use crate::error::ChannelError;
use crate::session::Session;

/// Owns the per-peer session map and performs all payload encryption.
#[derive(Default)]
pub struct SecureChannel {
    sessions: Mutex<HashMap<DeviceId, Session>>,
}

impl SecureChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a freshly derived session key for `peer`, replacing any
    /// previous session.
    pub fn install(&self, peer: DeviceId, key: SymmetricKey) {
        let mut sessions = self.sessions.lock().expect("session map poisoned");
        let replaced = sessions
            .insert(peer.clone(), Session::new(peer.clone(), key))
            .is_some();
        debug!(peer = %peer, replaced, "Session installed");
    }

    pub fn has_session(&self, peer: &DeviceId) -> bool {
        self.sessions
            .lock()
            .expect("session map poisoned")
            .contains_key(peer)
    }

    pub fn established_at(&self, peer: &DeviceId) -> Option<DateTime<Utc>> {
        self.sessions
            .lock()
            .expect("session map poisoned")
            .get(peer)
            .map(Session::established_at)
    }

    /// Drop the peer's session. Returns `true` if one existed.
    pub fn invalidate(&self, peer: &DeviceId) -> bool {
        let removed = self
            .sessions
            .lock()
            .expect("session map poisoned")
            .remove(peer)
            .is_some();
        if removed {
            debug!(peer = %peer, "Session invalidated");
        }
        removed
    }

    /// Seal `plaintext` for `peer` under its session key.
    pub fn encrypt(&self, peer: &DeviceId, plaintext: &[u8]) -> Result<Envelope, ChannelError> {
        let key = self.session_key(peer)?;
        Ok(crypto::seal(&key, plaintext)?)
    }

    /// Verify and open an envelope from `peer`.
    ///
    /// Any tag mismatch (tampering, wrong key, corrupted nonce) invalidates
    /// the session before the error is returned; the caller must re-pair.
    pub fn decrypt(&self, peer: &DeviceId, envelope: &Envelope) -> Result<Vec<u8>, ChannelError> {
        let key = self.session_key(peer)?;
        match crypto::open(&key, envelope) {
            Ok(plaintext) => Ok(plaintext),
            Err(CryptoError::DecryptionFailed) => {
                warn!(peer = %peer, "Authentication failed; invalidating session");
                self.invalidate(peer);
                Err(ChannelError::Crypto(CryptoError::DecryptionFailed))
            }
            Err(e) => Err(ChannelError::Crypto(e)),
        }
    }

    fn session_key(&self, peer: &DeviceId) -> Result<SymmetricKey, ChannelError> {
        self.sessions
            .lock()
            .expect("session map poisoned")
            .get(peer)
            .map(|s| *s.key())
            .ok_or(ChannelError::NoSession)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluelink_shared::crypto::generate_symmetric_key;

    fn channel_with_session() -> (SecureChannel, DeviceId, SymmetricKey) {
        let channel = SecureChannel::new();
        let peer = DeviceId::new();
        let key = generate_symmetric_key();
        channel.install(peer.clone(), key);
        (channel, peer, key)
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let (channel, peer, _) = channel_with_session();

        let envelope = channel.encrypt(&peer, b"payload").unwrap();
        assert_eq!(channel.decrypt(&peer, &envelope).unwrap(), b"payload");
        assert!(channel.has_session(&peer));
    }

    #[test]
    fn encrypt_without_session_fails() {
        let channel = SecureChannel::new();
        let peer = DeviceId::new();
        assert!(matches!(
            channel.encrypt(&peer, b"x"),
            Err(ChannelError::NoSession)
        ));
    }

    #[test]
    fn tampering_invalidates_the_session() {
        let (channel, peer, _) = channel_with_session();

        let mut envelope = channel.encrypt(&peer, b"payload").unwrap();
        envelope.ciphertext[0] ^= 0xFF;

        assert!(matches!(
            channel.decrypt(&peer, &envelope),
            Err(ChannelError::Crypto(CryptoError::DecryptionFailed))
        ));
        // Forced re-pairing: the session is gone, even for valid traffic.
        assert!(!channel.has_session(&peer));
        let fresh = channel.encrypt(&peer, b"more");
        assert!(matches!(fresh, Err(ChannelError::NoSession)));
    }

    #[test]
    fn repairing_replaces_the_session() {
        let (channel, peer, _) = channel_with_session();
        let old_envelope = channel.encrypt(&peer, b"old traffic").unwrap();

        channel.install(peer.clone(), generate_symmetric_key());

        // Traffic sealed under the old key no longer verifies.
        assert!(channel.decrypt(&peer, &old_envelope).is_err());
    }

    #[test]
    fn sessions_are_per_peer() {
        let (channel, alice, _) = channel_with_session();
        let bob = DeviceId::new();
        channel.install(bob.clone(), generate_symmetric_key());

        let envelope = channel.encrypt(&alice, b"for alice").unwrap();
        // Bob's key cannot open Alice's traffic; his session dies for it.
        assert!(channel.decrypt(&bob, &envelope).is_err());
        assert!(channel.has_session(&alice));
        assert!(!channel.has_session(&bob));
    }
}
