//! Per-peer link lifecycle.
//!
//! Tracks each peer through `Discovered -> Connecting -> Connected ->
//! ServiceReady`. A failed attempt is retried once; a second consecutive
//! failure surfaces a [`ConnectionError`] and returns the peer to
//! `Discovered`. A radio drop at any point also returns the peer to
//! `Discovered`; the owning control loop handles session and transfer
//! invalidation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bluelink_shared::constants::CONNECT_RETRIES;
use bluelink_shared::types::DeviceId;

use crate::adapter::{RadioAdapter, RadioLink};
use crate::error::ConnectionError;

/// Service endpoint for framed BlueLink traffic (serial-port profile).
const TRANSFER_SERVICE_UUID: &str = "00001101-0000-1000-8000-00805f9b34fb";

/// Connection state of a single peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Discovered,
    Connecting,
    Connected,
    ServiceReady,
}

struct PeerLink {
    state: LinkState,
    link: Option<Arc<dyn RadioLink>>,
}

/// Drives connection attempts and tracks every peer's link state.
pub struct ConnectionManager {
    adapter: Arc<dyn RadioAdapter>,
    connect_timeout: Duration,
    peers: Mutex<HashMap<DeviceId, PeerLink>>,
}

impl ConnectionManager {
    pub fn new(adapter: Arc<dyn RadioAdapter>, connect_timeout: Duration) -> Self {
        Self {
            adapter,
            connect_timeout,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Connect to `peer` at `address` and bind the transfer service.
    ///
    /// Each attempt is bounded by the connect timeout; one automatic retry
    /// follows a failed attempt. After a second consecutive failure the
    /// peer is back in `Discovered` and the error carries the last cause.
    pub async fn connect(
        &self,
        peer: &DeviceId,
        address: &str,
    ) -> Result<Arc<dyn RadioLink>, ConnectionError> {
        self.set_state(peer, LinkState::Connecting, None);

        let service = Uuid::parse_str(TRANSFER_SERVICE_UUID).expect("valid service uuid");
        let mut last_error = ConnectionError::Timeout;

        for attempt in 0..=CONNECT_RETRIES {
            match timeout(self.connect_timeout, self.adapter.connect(address)).await {
                Err(_) => {
                    warn!(peer = %peer, attempt, "Connection attempt timed out");
                    last_error = ConnectionError::Timeout;
                }
                Ok(Err(e)) => {
                    warn!(peer = %peer, attempt, error = %e, "Connection attempt failed");
                    last_error = e;
                }
                Ok(Ok(link)) => {
                    self.set_state(peer, LinkState::Connected, None);
                    match timeout(self.connect_timeout, link.bind_service(service)).await {
                        Ok(Ok(())) => {
                            self.set_state(peer, LinkState::ServiceReady, Some(Arc::clone(&link)));
                            info!(peer = %peer, addr = %address, "Link service-ready");
                            return Ok(link);
                        }
                        Ok(Err(e)) => {
                            warn!(peer = %peer, attempt, error = %e, "Service binding failed");
                            last_error = e;
                        }
                        Err(_) => {
                            warn!(peer = %peer, attempt, "Service binding timed out");
                            last_error = ConnectionError::Timeout;
                        }
                    }
                    self.set_state(peer, LinkState::Connecting, None);
                }
            }
        }

        self.set_state(peer, LinkState::Discovered, None);
        Err(ConnectionError::Failed(last_error.to_string()))
    }

    /// Record a radio drop. Returns `true` if the peer had an open link.
    pub fn on_disconnected(&self, peer: &DeviceId) -> bool {
        let mut peers = self.peers.lock().expect("connection state poisoned");
        match peers.get_mut(peer) {
            Some(entry)
                if matches!(entry.state, LinkState::Connected | LinkState::ServiceReady) =>
            {
                entry.state = LinkState::Discovered;
                entry.link = None;
                debug!(peer = %peer, "Peer link dropped");
                true
            }
            _ => false,
        }
    }

    /// Close the link deliberately and return the peer to `Discovered`.
    pub async fn disconnect(&self, peer: &DeviceId) {
        let link = {
            let mut peers = self.peers.lock().expect("connection state poisoned");
            peers.get_mut(peer).and_then(|entry| {
                entry.state = LinkState::Discovered;
                entry.link.take()
            })
        };
        if let Some(link) = link {
            link.close().await;
            debug!(peer = %peer, "Peer disconnected");
        }
    }

    pub fn state(&self, peer: &DeviceId) -> LinkState {
        self.peers
            .lock()
            .expect("connection state poisoned")
            .get(peer)
            .map(|entry| entry.state)
            .unwrap_or(LinkState::Discovered)
    }

    pub fn link(&self, peer: &DeviceId) -> Option<Arc<dyn RadioLink>> {
        self.peers
            .lock()
            .expect("connection state poisoned")
            .get(peer)
            .and_then(|entry| entry.link.clone())
    }

    pub fn connected_peers(&self) -> Vec<DeviceId> {
        self.peers
            .lock()
            .expect("connection state poisoned")
            .iter()
            .filter(|(_, entry)| entry.state == LinkState::ServiceReady)
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    fn set_state(&self, peer: &DeviceId, state: LinkState, link: Option<Arc<dyn RadioLink>>) {
        let mut peers = self.peers.lock().expect("connection state poisoned");
        let entry = peers.entry(peer.clone()).or_insert(PeerLink {
            state: LinkState::Discovered,
            link: None,
        });
        entry.state = state;
        entry.link = link;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackAdapter;

    fn manager(adapter: Arc<LoopbackAdapter>) -> ConnectionManager {
        ConnectionManager::new(adapter, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn connect_reaches_service_ready() {
        let adapter = Arc::new(LoopbackAdapter::new());
        let _remote = adapter.add_peer("aa:bb");
        let mgr = manager(Arc::clone(&adapter));
        let peer = DeviceId::new();

        let link = mgr.connect(&peer, "aa:bb").await.unwrap();
        assert_eq!(mgr.state(&peer), LinkState::ServiceReady);
        assert!(mgr.link(&peer).is_some());
        assert_eq!(mgr.connected_peers(), vec![peer.clone()]);

        link.send_frame(b"hello").await.unwrap();
    }

    #[tokio::test]
    async fn single_failure_is_retried() {
        let adapter = Arc::new(LoopbackAdapter::new());
        let _remote = adapter.add_peer("aa:bb");
        adapter.fail_next_connects(1);
        let mgr = manager(Arc::clone(&adapter));
        let peer = DeviceId::new();

        assert!(mgr.connect(&peer, "aa:bb").await.is_ok());
        assert_eq!(mgr.state(&peer), LinkState::ServiceReady);
    }

    #[tokio::test]
    async fn second_consecutive_failure_surfaces_error() {
        let adapter = Arc::new(LoopbackAdapter::new());
        let _remote = adapter.add_peer("aa:bb");
        adapter.fail_next_connects(2);
        let mgr = manager(Arc::clone(&adapter));
        let peer = DeviceId::new();

        let err = mgr.connect(&peer, "aa:bb").await.err().expect("should fail");
        assert!(matches!(err, ConnectionError::Failed(_)));
        assert_eq!(mgr.state(&peer), LinkState::Discovered);
        assert!(mgr.link(&peer).is_none());
    }

    #[tokio::test]
    async fn slow_attempts_time_out() {
        let adapter = Arc::new(LoopbackAdapter::new());
        let _remote = adapter.add_peer("aa:bb");
        adapter.delay_connects(Duration::from_secs(5));
        let dyn_adapter: Arc<dyn RadioAdapter> = Arc::clone(&adapter) as Arc<dyn RadioAdapter>;
        let mgr = ConnectionManager::new(dyn_adapter, Duration::from_millis(20));
        let peer = DeviceId::new();

        let err = mgr.connect(&peer, "aa:bb").await.err().expect("should fail");
        assert!(matches!(err, ConnectionError::Failed(_)));
        assert_eq!(mgr.state(&peer), LinkState::Discovered);
    }

    #[tokio::test]
    async fn deliberate_disconnect_closes_the_link() {
        let adapter = Arc::new(LoopbackAdapter::new());
        let remote = adapter.add_peer("aa:bb");
        let mgr = manager(Arc::clone(&adapter));
        let peer = DeviceId::new();

        mgr.connect(&peer, "aa:bb").await.unwrap();
        mgr.disconnect(&peer).await;

        assert_eq!(mgr.state(&peer), LinkState::Discovered);
        assert!(matches!(remote.recv_frame().await, Err(ConnectionError::Lost)));
    }

    #[tokio::test]
    async fn radio_drop_returns_peer_to_discovered() {
        let adapter = Arc::new(LoopbackAdapter::new());
        let _remote = adapter.add_peer("aa:bb");
        let mgr = manager(Arc::clone(&adapter));
        let peer = DeviceId::new();

        mgr.connect(&peer, "aa:bb").await.unwrap();
        assert!(mgr.on_disconnected(&peer));
        assert_eq!(mgr.state(&peer), LinkState::Discovered);
        assert!(mgr.link(&peer).is_none());

        // Already-discovered peers are a no-op.
        assert!(!mgr.on_disconnected(&peer));
    }
}
