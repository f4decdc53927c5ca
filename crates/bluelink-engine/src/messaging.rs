//! Chat payloads.
//!
//! A chat message travels as a [`Frame::Chat`] whose envelope contains a
//! bincode-encoded [`ChatBody`]. Persistence and delivery-status handling
//! happen in the control loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bluelink_shared::crypto::Envelope;
use bluelink_shared::error::ProtocolError;
use bluelink_shared::types::DeviceId;

use crate::channel::SecureChannel;
use crate::error::ChannelError;

/// Plaintext content of a chat frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatBody {
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

impl ChatBody {
    pub fn new(content: String) -> Self {
        Self {
            content,
            sent_at: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Seal a chat body for `peer`.
pub fn seal_chat(
    channel: &SecureChannel,
    peer: &DeviceId,
    body: &ChatBody,
) -> Result<Envelope, ChannelError> {
    let bytes = body
        .encode()
        .map_err(|_| ChannelError::Crypto(bluelink_shared::error::CryptoError::EncryptionFailed))?;
    channel.encrypt(peer, &bytes)
}

/// Open and decode a chat envelope from `peer`.
pub fn open_chat(
    channel: &SecureChannel,
    peer: &DeviceId,
    envelope: &Envelope,
) -> Result<ChatBody, ChannelError> {
    let bytes = channel.decrypt(peer, envelope)?;
    ChatBody::decode(&bytes)
        .map_err(|_| ChannelError::Crypto(bluelink_shared::error::CryptoError::DecryptionFailed))
}
