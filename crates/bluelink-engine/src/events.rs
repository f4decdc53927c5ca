//! Typed command and event surface of the engine.
//!
//! The presentation layer sends [`EngineCommand`]s into the control loop and
//! consumes [`EngineEvent`]s from it; nothing else crosses the boundary.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use bluelink_radio::DiscoveredPeer;
use bluelink_shared::types::{DeviceId, MessageId, MessageStatus, TransferId, TransferStatus};

use crate::progress::ProgressUpdate;

/// Commands sent *into* the engine task.
#[derive(Debug)]
pub enum EngineCommand {
    /// Begin a bounded discovery scan.
    StartScan,
    /// Stop the active scan, if any.
    StopScan,
    /// Request a snapshot of the current candidate set.
    GetDiscovered(oneshot::Sender<Vec<DiscoveredPeer>>),
    /// Connect to a previously discovered peer.
    Connect(DeviceId),
    /// Run the key exchange with a connected peer.
    Pair(DeviceId),
    /// Send a file to a paired peer.
    SendFile { peer: DeviceId, path: PathBuf },
    PauseTransfer(TransferId),
    ResumeTransfer(TransferId),
    CancelTransfer(TransferId),
    /// Send a chat message to a paired peer.
    SendMessage { peer: DeviceId, content: String },
    /// Gracefully shut down the engine.
    Shutdown,
}

/// Notifications sent *from* the engine task to subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    PeerDiscovered(DiscoveredPeer),
    PeerConnected {
        peer: DeviceId,
    },
    PeerDisconnected {
        peer: DeviceId,
    },
    PairingCompleted {
        peer: DeviceId,
        /// Fingerprint of the peer's public key.
        fingerprint: String,
        /// Verification PIN; both devices display the same digits.
        pin: String,
    },
    PairingFailed {
        peer: DeviceId,
        reason: String,
    },
    /// The peer's session was invalidated (decryption failure); re-pairing
    /// is required before further secure traffic.
    SessionInvalidated {
        peer: DeviceId,
    },
    TransferProgress(ProgressUpdate),
    TransferStatusChanged {
        id: TransferId,
        status: TransferStatus,
        error: Option<String>,
    },
    MessageReceived {
        id: MessageId,
        peer: DeviceId,
        content: String,
        timestamp: DateTime<Utc>,
    },
    MessageStatusChanged {
        id: MessageId,
        status: MessageStatus,
    },
    /// A command failed; the cause is attached and the loop keeps running.
    Error {
        context: &'static str,
        message: String,
    },
}
