//! Session-key agreement.
//!
//! Each installation owns one long-lived X25519 keypair. Pairing with a
//! peer is a single Diffie-Hellman computation whose raw shared value is
//! passed through a 256-bit KDF; the raw output is never used as a key.
//! The wire choreography (hello/accept frames, timeout) lives in the
//! control loop; this type only computes.

use tracing::{debug, warn};

use bluelink_shared::crypto::{derive_session_key, SymmetricKey};
use bluelink_shared::identity::{self, DeviceKeyPair};

use crate::error::PairingError;

/// Result of a successful key exchange with a peer.
#[derive(Debug, Clone)]
pub struct PairingOutcome {
    /// Derived symmetric session key.
    pub session_key: SymmetricKey,
    /// Fingerprint of the peer's public key, for out-of-band verification.
    pub fingerprint: String,
    /// Six-digit PIN derived from the peer's fingerprint: the digits the
    /// peer's own screen shows. Matching digits confirm the key was not
    /// substituted in transit.
    pub pin: String,
}

/// Performs key exchanges with the installation's long-lived keypair.
pub struct PairingEngine {
    keypair: DeviceKeyPair,
}

impl PairingEngine {
    pub fn new(keypair: DeviceKeyPair) -> Self {
        Self { keypair }
    }

    /// Public key bytes to advertise in pairing frames.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.keypair.public_key_bytes()
    }

    /// Fingerprint of our own public key (what the peer will see).
    pub fn local_fingerprint(&self) -> String {
        identity::fingerprint(&self.keypair.public_key_bytes())
    }

    /// PIN shown on this device for the peer to compare against.
    pub fn local_pin(&self) -> String {
        identity::pin_from_fingerprint(&self.local_fingerprint())
    }

    /// Run the Diffie-Hellman exchange against `peer_public_key` and derive
    /// the session key.
    ///
    /// Fails with [`PairingError::MalformedKey`] on anything that is not a
    /// 32-byte X25519 key and with [`PairingError::DegenerateSecret`] when
    /// the computation produces no usable result (a low-order peer key).
    /// On failure the caller must not touch the secure channel; any prior
    /// session for the peer stays as it was.
    pub fn exchange(&self, peer_public_key: &[u8]) -> Result<PairingOutcome, PairingError> {
        let peer_public = identity::parse_public_key(peer_public_key).map_err(|_| {
            warn!(len = peer_public_key.len(), "Rejected malformed peer public key");
            PairingError::MalformedKey
        })?;

        let shared = self.keypair.diffie_hellman(&peer_public);
        if shared.as_bytes() == &[0u8; 32] {
            warn!("Key exchange produced an all-zero shared secret");
            return Err(PairingError::DegenerateSecret);
        }

        let session_key = derive_session_key(shared.as_bytes());
        let fingerprint = identity::fingerprint(peer_public.as_bytes());
        let pin = identity::pin_from_fingerprint(&fingerprint);

        debug!(fingerprint = %fingerprint, "Key exchange completed");

        Ok(PairingOutcome {
            session_key,
            fingerprint,
            pin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SecureChannel;
    use bluelink_shared::types::DeviceId;

    #[test]
    fn both_sides_derive_the_same_key() {
        let alice = PairingEngine::new(DeviceKeyPair::generate());
        let bob = PairingEngine::new(DeviceKeyPair::generate());

        let a = alice.exchange(&bob.public_key_bytes()).unwrap();
        let b = bob.exchange(&alice.public_key_bytes()).unwrap();

        assert_eq!(a.session_key, b.session_key);
    }

    #[test]
    fn each_side_sees_the_others_fingerprint() {
        let alice = PairingEngine::new(DeviceKeyPair::generate());
        let bob = PairingEngine::new(DeviceKeyPair::generate());

        let a = alice.exchange(&bob.public_key_bytes()).unwrap();
        assert_eq!(a.fingerprint, bob.local_fingerprint());
        // The PIN we derive is exactly what Bob's screen displays.
        assert_eq!(a.pin, bob.local_pin());
        assert_eq!(a.pin.len(), 6);
    }

    #[test]
    fn malformed_key_is_rejected() {
        let engine = PairingEngine::new(DeviceKeyPair::generate());
        assert!(matches!(
            engine.exchange(&[1u8; 16]),
            Err(PairingError::MalformedKey)
        ));
        assert!(matches!(engine.exchange(&[]), Err(PairingError::MalformedKey)));
    }

    #[test]
    fn zero_key_yields_degenerate_secret() {
        let engine = PairingEngine::new(DeviceKeyPair::generate());
        assert!(matches!(
            engine.exchange(&[0u8; 32]),
            Err(PairingError::DegenerateSecret)
        ));
    }

    #[test]
    fn failed_exchange_leaves_prior_session_untouched() {
        let engine = PairingEngine::new(DeviceKeyPair::generate());
        let channel = SecureChannel::new();
        let peer = DeviceId::new();

        let good = engine
            .exchange(&DeviceKeyPair::generate().public_key_bytes())
            .unwrap();
        channel.install(peer.clone(), good.session_key);
        let envelope = channel.encrypt(&peer, b"before").unwrap();

        assert!(engine.exchange(&[0u8; 32]).is_err());

        // No partial overwrite: the old session still decrypts.
        assert_eq!(channel.decrypt(&peer, &envelope).unwrap(), b"before");
    }
}
