//! # bluelink-engine
//!
//! The pairing and secure chunked-transfer core: session-key derivation,
//! authenticated encryption of every payload, the resumable file-transfer
//! state machine, messaging, and the control loop that coordinates
//! discovery, connection, pairing and transfer progression for all peers.

pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod messaging;
pub mod pairing;
pub mod progress;
pub mod service;
pub mod session;
pub mod transfer;

pub use channel::SecureChannel;
pub use config::EngineConfig;
pub use error::{ChannelError, PairingError, TransferError};
pub use events::{EngineCommand, EngineEvent};
pub use pairing::{PairingEngine, PairingOutcome};
pub use progress::{ProgressUpdate, ThroughputMeter};
pub use service::spawn_engine;
pub use transfer::{Transfer, TransferEngine, TransferEvent};
