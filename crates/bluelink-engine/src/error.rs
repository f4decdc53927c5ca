use thiserror::Error;

use bluelink_radio::ConnectionError;
use bluelink_shared::error::{CryptoError, ProtocolError};
use bluelink_shared::types::TransferStatus;

#[derive(Error, Debug)]
pub enum PairingError {
    #[error("Malformed peer public key")]
    MalformedKey,

    #[error("Key exchange produced no usable result")]
    DegenerateSecret,

    #[error("Pairing exchange timed out")]
    Timeout,

    #[error("Pairing protocol error: {0}")]
    Protocol(String),
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("No active session with peer; pairing required")]
    NoSession,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Transfer cancelled")]
    Aborted,

    #[error("Connection lost during transfer")]
    ConnectionLost,

    #[error("A transfer in this direction is already active for the peer")]
    AlreadyActive,

    #[error("Unknown transfer")]
    NotFound,

    #[error("Invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: TransferStatus,
        to: TransferStatus,
    },

    #[error("Only outbound transfers can be paused or resumed locally")]
    NotPausable,

    #[error("Chunk index {index} out of range ({total} chunks)")]
    ChunkOutOfRange { index: u32, total: u32 },

    #[error("Invalid file offer: {0}")]
    InvalidOffer(String),

    #[error("Secure channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Link error: {0}")]
    Link(#[from] ConnectionError),

    #[error("Wire error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("File error: {0}")]
    Io(#[from] std::io::Error),
}
