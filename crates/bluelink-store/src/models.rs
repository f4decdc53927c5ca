//! Domain model structs persisted in the local SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to a presentation layer over IPC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bluelink_shared::types::{MessageStatus, TransferStatus};

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// A known peer device. Created on first discovery or explicit add; the
/// record persists until explicitly removed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    /// Locally assigned UUID string.
    pub id: String,
    /// Display name as advertised (or set by the user).
    pub name: String,
    /// Radio address, unique per device.
    pub address: String,
    /// User-set trust flag. Never overwritten by re-discovery.
    pub trusted: bool,
    /// When the device was last seen over the radio.
    pub last_seen: DateTime<Utc>,
    /// Public-key fingerprint, present once the device has been paired.
    pub fingerprint: Option<String>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message. Immutable once persisted except for `status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Unique message identifier (UUID string).
    pub id: String,
    /// Order-independent peer-pair identifier.
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
}

// ---------------------------------------------------------------------------
// FileTransfer
// ---------------------------------------------------------------------------

/// Durable record of a file transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileTransfer {
    /// Unique transfer identifier (UUID string).
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub filename: String,
    /// Total size in bytes.
    pub size: i64,
    /// Hex BLAKE3 digest of the whole file as declared by the sender.
    pub checksum: String,
    /// Local path: source path when sending, output path when receiving.
    pub path: String,
    pub timestamp: DateTime<Utc>,
    pub status: TransferStatus,
}
