//! Per-peer session state.

use chrono::{DateTime, Utc};

use bluelink_shared::crypto::SymmetricKey;
use bluelink_shared::types::DeviceId;

/// A live secure session with one peer.
///
/// Exists only after a successful key exchange and is owned exclusively by
/// [`crate::channel::SecureChannel`]; everything else refers to it through
/// channel calls. At most one session per peer: re-pairing replaces the
/// previous one.
#[derive(Clone)]
pub struct Session {
    peer: DeviceId,
    key: SymmetricKey,
    established_at: DateTime<Utc>,
}

impl Session {
    pub(crate) fn new(peer: DeviceId, key: SymmetricKey) -> Self {
        Self {
            peer,
            key,
            established_at: Utc::now(),
        }
    }

    pub fn peer(&self) -> &DeviceId {
        &self.peer
    }

    pub(crate) fn key(&self) -> &SymmetricKey {
        &self.key
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The key never appears in debug output or logs.
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("established_at", &self.established_at)
            .finish_non_exhaustive()
    }
}
