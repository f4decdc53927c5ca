//! In-memory radio used by tests.
//!
//! [`LoopbackAdapter`] plays the role of a platform backend: it serves a
//! scripted list of advertisements and hands out pre-wired [`LoopbackLink`]
//! halves on `connect`. Tests hold the remote half to act as the peer
//! device, and can script power state, connect failures and connect delays.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::adapter::{Advertisement, RadioAdapter, RadioLink};
use crate::error::{ConnectionError, DiscoveryError};

/// One half of an in-memory link. Create pairs with [`link_pair`].
pub struct LoopbackLink {
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
}

/// Create two connected link halves.
pub fn link_pair() -> (Arc<LoopbackLink>, Arc<LoopbackLink>) {
    link_pair_with_capacity(256)
}

/// Create two connected link halves with a bounded in-flight frame budget.
/// A capacity of 1 makes `send_frame` block until the peer reads, which
/// tests use to pin down exactly how far a sender has progressed.
pub fn link_pair_with_capacity(capacity: usize) -> (Arc<LoopbackLink>, Arc<LoopbackLink>) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    let a = Arc::new(LoopbackLink {
        tx: Mutex::new(Some(a_tx)),
        rx: tokio::sync::Mutex::new(a_rx),
    });
    let b = Arc::new(LoopbackLink {
        tx: Mutex::new(Some(b_tx)),
        rx: tokio::sync::Mutex::new(b_rx),
    });
    (a, b)
}

#[async_trait]
impl RadioLink for LoopbackLink {
    async fn bind_service(&self, _service: Uuid) -> Result<(), ConnectionError> {
        Ok(())
    }

    async fn send_frame(&self, data: &[u8]) -> Result<(), ConnectionError> {
        let tx = self
            .tx
            .lock()
            .expect("loopback sender poisoned")
            .clone()
            .ok_or(ConnectionError::Lost)?;
        tx.send(data.to_vec()).await.map_err(|_| ConnectionError::Lost)
    }

    async fn recv_frame(&self) -> Result<Vec<u8>, ConnectionError> {
        self.rx.lock().await.recv().await.ok_or(ConnectionError::Lost)
    }

    async fn close(&self) {
        self.tx.lock().expect("loopback sender poisoned").take();
        self.rx.lock().await.close();
    }
}

#[derive(Default)]
pub struct LoopbackAdapter {
    off: AtomicBool,
    adverts: Mutex<Vec<Advertisement>>,
    links: Mutex<HashMap<String, Arc<LoopbackLink>>>,
    fail_connects: AtomicU32,
    connect_delay: Mutex<Option<Duration>>,
}

impl LoopbackAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set the radio power state.
    pub fn powered(self, on: bool) -> Self {
        self.off.store(!on, Ordering::SeqCst);
        self
    }

    /// Script an advertisement to be delivered on the next scan.
    pub fn advertise(&self, adv: Advertisement) {
        self.adverts.lock().expect("adverts poisoned").push(adv);
    }

    /// Register a connectable device at `address` and return the remote
    /// half of its link for the test to drive.
    pub fn add_peer(&self, address: &str) -> Arc<LoopbackLink> {
        let (local, remote) = link_pair();
        self.links
            .lock()
            .expect("links poisoned")
            .insert(address.to_string(), local);
        remote
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Delay every connect attempt (for exercising timeouts).
    pub fn delay_connects(&self, delay: Duration) {
        *self.connect_delay.lock().expect("delay poisoned") = Some(delay);
    }
}

#[async_trait]
impl RadioAdapter for LoopbackAdapter {
    async fn power_on(&self) -> Result<(), DiscoveryError> {
        if self.off.load(Ordering::SeqCst) {
            return Err(DiscoveryError::AdapterUnavailable(
                "radio powered off".to_string(),
            ));
        }
        Ok(())
    }

    async fn advertisements(&self) -> Result<mpsc::Receiver<Advertisement>, DiscoveryError> {
        let scripted: Vec<Advertisement> =
            self.adverts.lock().expect("adverts poisoned").clone();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for adv in scripted {
                if tx.send(adv).await.is_err() {
                    return;
                }
            }
            // Keep the report stream open until the scanner stops listening,
            // like a real radio would.
            tx.closed().await;
        });
        Ok(rx)
    }

    async fn connect(&self, address: &str) -> Result<Arc<dyn RadioLink>, ConnectionError> {
        let delay = *self.connect_delay.lock().expect("delay poisoned");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failures = self.fail_connects.load(Ordering::SeqCst);
        if failures > 0 {
            self.fail_connects.store(failures - 1, Ordering::SeqCst);
            return Err(ConnectionError::Failed("simulated radio failure".to_string()));
        }

        let link = self
            .links
            .lock()
            .expect("links poisoned")
            .get(address)
            .cloned()
            .ok_or_else(|| ConnectionError::Failed(format!("no route to {address}")))?;
        Ok(link as Arc<dyn RadioLink>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn link_pair_carries_frames_both_ways() {
        let (a, b) = link_pair();

        a.send_frame(b"ping").await.unwrap();
        assert_eq!(b.recv_frame().await.unwrap(), b"ping");

        b.send_frame(b"pong").await.unwrap();
        assert_eq!(a.recv_frame().await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn closed_link_reports_lost() {
        let (a, b) = link_pair();

        a.close().await;
        assert!(matches!(b.recv_frame().await, Err(ConnectionError::Lost)));
        assert!(matches!(a.send_frame(b"x").await, Err(ConnectionError::Lost)));
        assert!(matches!(b.send_frame(b"x").await, Err(ConnectionError::Lost)));
    }
}
