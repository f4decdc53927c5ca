//! Platform radio abstraction.
//!
//! A backend (BlueZ, CoreBluetooth, WinRT, or the in-memory loopback used in
//! tests) implements [`RadioAdapter`] for discovery and dialing, and
//! [`RadioLink`] for framed I/O on an established connection. The engine
//! never talks to a platform API directly.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{ConnectionError, DiscoveryError};

/// A raw advertisement report as delivered by the radio.
#[derive(Debug, Clone)]
pub struct Advertisement {
    /// Radio address, unique per device.
    pub address: String,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Received signal strength in dBm.
    pub rssi: i16,
}

#[async_trait]
pub trait RadioAdapter: Send + Sync {
    /// Ensure the radio is powered and usable. Fails with
    /// [`DiscoveryError::AdapterUnavailable`] otherwise.
    async fn power_on(&self) -> Result<(), DiscoveryError>;

    /// Begin delivering advertisement reports. Scanning stops when the
    /// returned receiver is dropped.
    async fn advertisements(&self) -> Result<mpsc::Receiver<Advertisement>, DiscoveryError>;

    /// Dial the device at `address`. A single attempt; retry policy lives in
    /// the connection manager.
    async fn connect(&self, address: &str) -> Result<Arc<dyn RadioLink>, ConnectionError>;
}

#[async_trait]
pub trait RadioLink: Send + Sync {
    /// Bind the service endpoint used for framed traffic.
    async fn bind_service(&self, service: Uuid) -> Result<(), ConnectionError>;

    /// Write one frame. Suspends the issuing task only.
    async fn send_frame(&self, data: &[u8]) -> Result<(), ConnectionError>;

    /// Read the next frame. Returns [`ConnectionError::Lost`] once the link
    /// drops.
    async fn recv_frame(&self) -> Result<Vec<u8>, ConnectionError>;

    /// Tear the link down. Idempotent.
    async fn close(&self);
}
