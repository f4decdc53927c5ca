//! Bounded-window peer discovery.
//!
//! One scan may be active per adapter at a time; overlapping `start_scan`
//! calls are rejected. Advertisements are deduplicated by radio address and
//! normalized into [`DiscoveredPeer`] candidates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use bluelink_shared::types::DeviceId;

use crate::adapter::RadioAdapter;
use crate::error::DiscoveryError;
use crate::signal::signal_strength;

/// A candidate peer seen during scanning.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    /// Locally assigned identifier, stable per radio address.
    pub id: DeviceId,
    pub name: String,
    pub address: String,
    pub rssi: i16,
    /// Normalized signal strength in `[0, 100]`.
    pub signal_strength: u8,
    pub last_seen: DateTime<Utc>,
}

#[derive(Default)]
struct ScanState {
    scanning: bool,
    found: HashMap<String, DiscoveredPeer>,
}

/// Drives discovery scans against a [`RadioAdapter`].
pub struct DiscoveryScanner {
    adapter: Arc<dyn RadioAdapter>,
    scan_window: Duration,
    state: Arc<Mutex<ScanState>>,
    stop: Arc<Notify>,
}

impl DiscoveryScanner {
    pub fn new(adapter: Arc<dyn RadioAdapter>, scan_window: Duration) -> Self {
        Self {
            adapter,
            scan_window,
            state: Arc::new(Mutex::new(ScanState::default())),
            stop: Arc::new(Notify::new()),
        }
    }

    /// Begin a bounded-duration scan.
    ///
    /// Returns a stream of newly discovered candidates (repeat sightings
    /// update the candidate set but are not re-emitted). Fails with
    /// [`DiscoveryError::AlreadyScanning`] while a scan is active and with
    /// [`DiscoveryError::AdapterUnavailable`] if the radio cannot be
    /// powered on.
    pub async fn start_scan(&self) -> Result<mpsc::Receiver<DiscoveredPeer>, DiscoveryError> {
        {
            let mut state = self.state.lock().expect("scanner state poisoned");
            if state.scanning {
                return Err(DiscoveryError::AlreadyScanning);
            }
            state.scanning = true;
        }

        let adv_rx = match self.adapter.power_on().await {
            Ok(()) => self.adapter.advertisements().await,
            Err(e) => Err(e),
        };
        let mut adv_rx = match adv_rx {
            Ok(rx) => rx,
            Err(e) => {
                self.state.lock().expect("scanner state poisoned").scanning = false;
                warn!(error = %e, "Scan could not start");
                return Err(e);
            }
        };

        info!(window_secs = self.scan_window.as_secs_f64(), "Scan started");

        let (tx, rx) = mpsc::channel(64);
        let state = Arc::clone(&self.state);
        let stop = Arc::clone(&self.stop);
        let window = self.scan_window;

        tokio::spawn(async move {
            let deadline = tokio::time::sleep(window);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    _ = &mut deadline => {
                        debug!("Scan window elapsed");
                        break;
                    }
                    _ = stop.notified() => {
                        debug!("Scan stopped");
                        break;
                    }
                    adv = adv_rx.recv() => {
                        let Some(adv) = adv else { break };
                        let newly_found = {
                            let mut state = state.lock().expect("scanner state poisoned");
                            match state.found.get_mut(&adv.address) {
                                Some(peer) => {
                                    if let Some(name) = adv.name.clone() {
                                        peer.name = name;
                                    }
                                    peer.rssi = adv.rssi;
                                    peer.signal_strength = signal_strength(adv.rssi);
                                    peer.last_seen = Utc::now();
                                    None
                                }
                                None => {
                                    let peer = DiscoveredPeer {
                                        id: DeviceId::new(),
                                        name: adv
                                            .name
                                            .clone()
                                            .unwrap_or_else(|| "Unknown Device".to_string()),
                                        address: adv.address.clone(),
                                        rssi: adv.rssi,
                                        signal_strength: signal_strength(adv.rssi),
                                        last_seen: Utc::now(),
                                    };
                                    state.found.insert(adv.address.clone(), peer.clone());
                                    Some(peer)
                                }
                            }
                        };
                        if let Some(peer) = newly_found {
                            debug!(peer = %peer.id, addr = %peer.address, rssi = peer.rssi, "Peer discovered");
                            // Subscriber may be gone; keep filling the
                            // candidate set until the window closes.
                            let _ = tx.send(peer).await;
                        }
                    }
                }
            }

            state.lock().expect("scanner state poisoned").scanning = false;
        });

        Ok(rx)
    }

    /// Stop the active scan, if any. Idempotent.
    pub fn stop_scan(&self) {
        self.stop.notify_waiters();
    }

    pub fn is_scanning(&self) -> bool {
        self.state.lock().expect("scanner state poisoned").scanning
    }

    /// Snapshot of the current candidate set. Not a live reference.
    pub fn discovered(&self) -> Vec<DiscoveredPeer> {
        self.state
            .lock()
            .expect("scanner state poisoned")
            .found
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Advertisement;
    use crate::loopback::LoopbackAdapter;

    fn adv(address: &str, name: Option<&str>, rssi: i16) -> Advertisement {
        Advertisement {
            address: address.to_string(),
            name: name.map(str::to_string),
            rssi,
        }
    }

    #[tokio::test]
    async fn scan_fails_when_adapter_is_off() {
        let adapter = Arc::new(LoopbackAdapter::new().powered(false));
        let scanner = DiscoveryScanner::new(adapter, Duration::from_millis(50));

        let err = scanner.start_scan().await.err().expect("should fail");
        assert!(matches!(err, DiscoveryError::AdapterUnavailable(_)));
        assert!(!scanner.is_scanning());
        assert!(scanner.discovered().is_empty());
    }

    #[tokio::test]
    async fn advertisements_are_deduplicated_by_address() {
        let adapter = Arc::new(LoopbackAdapter::new());
        adapter.advertise(adv("aa:bb", Some("phone"), -60));
        adapter.advertise(adv("aa:bb", Some("phone"), -55));
        adapter.advertise(adv("cc:dd", None, -90));

        let scanner = DiscoveryScanner::new(adapter, Duration::from_millis(100));
        let mut rx = scanner.start_scan().await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(rx.recv().await.is_none());

        assert_eq!(first.address, "aa:bb");
        assert_eq!(second.address, "cc:dd");
        assert_eq!(second.name, "Unknown Device");

        let snapshot = scanner.discovered();
        assert_eq!(snapshot.len(), 2);
        let phone = snapshot.iter().find(|p| p.address == "aa:bb").unwrap();
        // Second sighting updated the reading, same candidate.
        assert_eq!(phone.rssi, -55);
        assert_eq!(phone.signal_strength, 90);
        assert_eq!(phone.id, first.id);
    }

    #[tokio::test]
    async fn overlapping_scans_are_rejected() {
        let adapter = Arc::new(LoopbackAdapter::new());
        let scanner = DiscoveryScanner::new(adapter, Duration::from_secs(5));

        let _rx = scanner.start_scan().await.unwrap();
        assert!(matches!(
            scanner.start_scan().await,
            Err(DiscoveryError::AlreadyScanning)
        ));

        scanner.stop_scan();
    }

    #[tokio::test]
    async fn stop_scan_is_idempotent() {
        let adapter = Arc::new(LoopbackAdapter::new());
        let scanner = DiscoveryScanner::new(adapter, Duration::from_secs(5));

        // No scan running: both calls are no-ops.
        scanner.stop_scan();
        scanner.stop_scan();

        let mut rx = scanner.start_scan().await.unwrap();
        scanner.stop_scan();
        scanner.stop_scan();

        assert!(rx.recv().await.is_none());
        assert!(!scanner.is_scanning());

        // A new scan can start after the previous one stopped.
        let _rx = scanner.start_scan().await.unwrap();
    }
}
