//! Wire frames exchanged over a radio link.
//!
//! Frames are bincode-encoded. Pairing frames carry public keys in the
//! clear (the key exchange authenticates the derived session, the
//! fingerprint/PIN authenticate the peer); everything after pairing rides
//! inside an AEAD [`Envelope`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::Envelope;
use crate::error::ProtocolError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Frame {
    /// Initiator's half of the key exchange.
    PairingHello {
        public_key: [u8; 32],
        device_name: String,
    },
    /// Responder's half of the key exchange.
    PairingAccept { public_key: [u8; 32] },
    /// An encrypted chat message (payload: bincode `ChatBody`).
    Chat { message_id: Uuid, envelope: Envelope },
    /// Announces an inbound file transfer. Metadata travels in the clear;
    /// `checksum` is the hex BLAKE3 digest of the complete file.
    FileOffer {
        transfer_id: Uuid,
        filename: String,
        size: u64,
        chunk_size: u32,
        total_chunks: u32,
        checksum: String,
    },
    /// One encrypted file chunk, numbered from 0.
    FileChunk {
        transfer_id: Uuid,
        index: u32,
        envelope: Envelope,
    },
    /// Sender-side abort notification.
    FileCancel { transfer_id: Uuid },
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}
