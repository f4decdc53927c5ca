//! The coordinating control loop, with a tokio mpsc command/event pattern.
//!
//! [`spawn_engine`] starts the loop in a dedicated tokio task. External code
//! communicates with it through typed command and event channels. Radio I/O
//! never blocks the loop: per-link readers, connection attempts, chunk
//! application and every frame send run as separate tasks that report back
//! over an internal channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bluelink_radio::{
    ConnectionManager, DiscoveredPeer, DiscoveryScanner, RadioAdapter, RadioLink,
};
use bluelink_shared::crypto::Envelope;
use bluelink_shared::identity::DeviceKeyPair;
use bluelink_shared::protocol::Frame;
use bluelink_shared::types::{
    ConversationId, DeviceId, MessageId, MessageStatus, TransferId, TransferStatus,
};
use bluelink_store::{Database, Device, FileTransfer, Message};

use crate::channel::SecureChannel;
use crate::config::EngineConfig;
use crate::error::{ChannelError, PairingError, TransferError};
use crate::events::{EngineCommand, EngineEvent};
use crate::messaging::{open_chat, seal_chat, ChatBody};
use crate::pairing::{PairingEngine, PairingOutcome};
use crate::transfer::{Transfer, TransferEngine, TransferEvent};

/// Messages from the loop's own worker tasks.
enum Internal {
    Discovered(DiscoveredPeer),
    Connected {
        peer: DeviceId,
        link: Arc<dyn RadioLink>,
    },
    ConnectFailed {
        peer: DeviceId,
        error: String,
    },
    FrameFrom {
        peer: DeviceId,
        frame: Frame,
    },
    LinkDropped {
        peer: DeviceId,
    },
    MessageSent {
        id: MessageId,
        result: Result<(), String>,
    },
    TransferAccepted {
        record: Transfer,
    },
    TransferRejected {
        error: String,
    },
    SessionInvalidated {
        peer: DeviceId,
    },
}

/// Spawn the engine control loop in a background tokio task.
///
/// Returns channels for sending commands and receiving events. Each service
/// object (scanner, connection manager, pairing engine, secure channel,
/// transfer engine) is an explicit value owned by the loop, holding only the
/// state it owns.
pub async fn spawn_engine(
    adapter: Arc<dyn RadioAdapter>,
    keypair: DeviceKeyPair,
    store: Option<Database>,
    config: EngineConfig,
) -> anyhow::Result<(mpsc::Sender<EngineCommand>, mpsc::Receiver<EngineEvent>)> {
    let (cmd_tx, cmd_rx) = mpsc::channel::<EngineCommand>(256);
    let (event_tx, event_rx) = mpsc::channel::<EngineEvent>(256);
    let (transfer_tx, transfer_rx) = mpsc::channel::<TransferEvent>(256);
    let (internal_tx, internal_rx) = mpsc::channel::<Internal>(256);

    let pairing = PairingEngine::new(keypair);
    // The local device id is the fingerprint of the installation key:
    // stable across runs, never colliding with discovered peer ids.
    let local_id = DeviceId(pairing.local_fingerprint());

    let scanner = DiscoveryScanner::new(Arc::clone(&adapter), config.scan_window);
    let connections = Arc::new(ConnectionManager::new(
        Arc::clone(&adapter),
        config.connect_timeout,
    ));
    let channel = Arc::new(SecureChannel::new());
    let transfers = Arc::new(TransferEngine::new(
        config.chunk_size,
        config.download_dir.clone(),
        transfer_tx,
    ));

    info!(device = %local_id, name = %config.device_name, "Engine starting");

    let engine_loop = EngineLoop {
        config,
        local_id,
        scanner,
        connections,
        pairing,
        channel,
        transfers,
        store,
        known_peers: HashMap::new(),
        pending_pairings: HashMap::new(),
        last_transfer_status: HashMap::new(),
        events: event_tx,
        internal_tx,
    };
    tokio::spawn(engine_loop.run(cmd_rx, internal_rx, transfer_rx));

    Ok((cmd_tx, event_rx))
}

struct EngineLoop {
    config: EngineConfig,
    local_id: DeviceId,
    scanner: DiscoveryScanner,
    connections: Arc<ConnectionManager>,
    pairing: PairingEngine,
    channel: Arc<SecureChannel>,
    transfers: Arc<TransferEngine>,
    store: Option<Database>,
    /// Candidate book from discovery: id -> last known advertisement.
    known_peers: HashMap<DeviceId, DiscoveredPeer>,
    /// Pairings we initiated, awaiting the peer's accept frame.
    pending_pairings: HashMap<DeviceId, Instant>,
    /// Latest status per transfer whose durable row may not exist yet; a
    /// fast transfer can reach a terminal state before its record lands.
    last_transfer_status: HashMap<TransferId, TransferStatus>,
    events: mpsc::Sender<EngineEvent>,
    internal_tx: mpsc::Sender<Internal>,
}

impl EngineLoop {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<EngineCommand>,
        mut internal_rx: mpsc::Receiver<Internal>,
        mut transfer_rx: mpsc::Receiver<TransferEvent>,
    ) {
        let mut sweep = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(EngineCommand::Shutdown) | None => {
                        info!("Engine shutting down");
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(internal) = internal_rx.recv() => self.handle_internal(internal).await,
                Some(event) = transfer_rx.recv() => self.handle_transfer_event(event).await,
                _ = sweep.tick() => self.sweep_pairings().await,
            }
        }
    }

    // -- commands ----------------------------------------------------------

    async fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::StartScan => match self.scanner.start_scan().await {
                Ok(mut found_rx) => {
                    let itx = self.internal_tx.clone();
                    tokio::spawn(async move {
                        while let Some(peer) = found_rx.recv().await {
                            if itx.send(Internal::Discovered(peer)).await.is_err() {
                                break;
                            }
                        }
                    });
                }
                Err(e) => self.emit_error("scan", e.to_string()).await,
            },
            EngineCommand::StopScan => self.scanner.stop_scan(),
            EngineCommand::GetDiscovered(reply) => {
                let _ = reply.send(self.scanner.discovered());
            }
            EngineCommand::Connect(peer) => self.connect(peer),
            EngineCommand::Pair(peer) => self.start_pairing(peer).await,
            EngineCommand::SendFile { peer, path } => self.send_file(peer, path).await,
            EngineCommand::PauseTransfer(id) => {
                if let Err(e) = self.transfers.pause(&id).await {
                    self.emit_error("pause", e.to_string()).await;
                }
            }
            EngineCommand::ResumeTransfer(id) => {
                if let Err(e) = self.transfers.resume(&id).await {
                    self.emit_error("resume", e.to_string()).await;
                }
            }
            EngineCommand::CancelTransfer(id) => {
                if let Err(e) = self.transfers.cancel(&id).await {
                    self.emit_error("cancel", e.to_string()).await;
                }
            }
            EngineCommand::SendMessage { peer, content } => self.send_message(peer, content).await,
            // Intercepted in run(); nothing to do here.
            EngineCommand::Shutdown => {}
        }
    }

    fn connect(&mut self, peer: DeviceId) {
        let Some(info) = self.known_peers.get(&peer) else {
            let itx = self.internal_tx.clone();
            tokio::spawn(async move {
                let _ = itx
                    .send(Internal::ConnectFailed {
                        peer,
                        error: "peer not in the discovered set".to_string(),
                    })
                    .await;
            });
            return;
        };
        let address = info.address.clone();
        let connections = Arc::clone(&self.connections);
        let itx = self.internal_tx.clone();
        tokio::spawn(async move {
            let message = match connections.connect(&peer, &address).await {
                Ok(link) => Internal::Connected { peer, link },
                Err(e) => Internal::ConnectFailed {
                    peer,
                    error: e.to_string(),
                },
            };
            let _ = itx.send(message).await;
        });
    }

    async fn start_pairing(&mut self, peer: DeviceId) {
        let Some(link) = self.connections.link(&peer) else {
            self.emit(EngineEvent::PairingFailed {
                peer,
                reason: "no open link; connect first".to_string(),
            })
            .await;
            return;
        };
        let hello = Frame::PairingHello {
            public_key: self.pairing.public_key_bytes(),
            device_name: self.config.device_name.clone(),
        };
        self.pending_pairings.insert(peer.clone(), Instant::now());
        self.spawn_send(peer, link, hello, None);
    }

    async fn send_file(&mut self, peer: DeviceId, path: std::path::PathBuf) {
        let Some(link) = self.connections.link(&peer) else {
            self.emit_error("send_file", "no open link to peer".to_string()).await;
            return;
        };
        if !self.channel.has_session(&peer) {
            self.emit_error("send_file", "no active session; pair first".to_string()).await;
            return;
        }
        let transfers = Arc::clone(&self.transfers);
        let channel = Arc::clone(&self.channel);
        let itx = self.internal_tx.clone();
        tokio::spawn(async move {
            let message = match transfers.start_send(peer, path, channel, link).await {
                Ok(record) => Internal::TransferAccepted { record },
                Err(e) => Internal::TransferRejected {
                    error: e.to_string(),
                },
            };
            let _ = itx.send(message).await;
        });
    }

    async fn send_message(&mut self, peer: DeviceId, content: String) {
        let id = MessageId::new();
        let body = ChatBody::new(content.clone());
        let conversation = ConversationId::between(&self.local_id, &peer);
        self.persist_message(&Message {
            id: id.to_string(),
            conversation_id: conversation.as_str().to_string(),
            sender_id: self.local_id.0.clone(),
            receiver_id: peer.0.clone(),
            content,
            timestamp: body.sent_at,
            status: MessageStatus::Sent,
        });
        self.emit(EngineEvent::MessageStatusChanged {
            id,
            status: MessageStatus::Sent,
        })
        .await;

        let Some(link) = self.connections.link(&peer) else {
            self.message_failed(id, "no open link to peer").await;
            return;
        };
        match seal_chat(&self.channel, &peer, &body) {
            Ok(envelope) => {
                let frame = Frame::Chat {
                    message_id: id.0,
                    envelope,
                };
                self.spawn_send(peer, link, frame, Some(id));
            }
            Err(e) => self.message_failed(id, &e.to_string()).await,
        }
    }

    // -- internal messages -------------------------------------------------

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Discovered(peer) => {
                self.known_peers.insert(peer.id.clone(), peer.clone());
                self.persist_device(&Device {
                    id: peer.id.0.clone(),
                    name: peer.name.clone(),
                    address: peer.address.clone(),
                    trusted: false,
                    last_seen: peer.last_seen,
                    fingerprint: None,
                });
                self.emit(EngineEvent::PeerDiscovered(peer)).await;
            }
            Internal::Connected { peer, link } => {
                self.spawn_reader(peer.clone(), link);
                self.emit(EngineEvent::PeerConnected { peer }).await;
            }
            Internal::ConnectFailed { peer, error } => {
                warn!(peer = %peer, error = %error, "Connect failed");
                self.emit_error("connect", error).await;
            }
            Internal::FrameFrom { peer, frame } => self.handle_frame(peer, frame).await,
            Internal::LinkDropped { peer } => {
                if self.connections.on_disconnected(&peer) {
                    self.channel.invalidate(&peer);
                    self.transfers
                        .fail_for_peer(&peer, &TransferError::ConnectionLost.to_string())
                        .await;
                    info!(peer = %peer, "Peer disconnected");
                    self.emit(EngineEvent::PeerDisconnected { peer }).await;
                }
            }
            Internal::MessageSent { id, result } => {
                let status = match result {
                    Ok(()) => MessageStatus::Delivered,
                    Err(e) => {
                        warn!(message = %id, error = %e, "Message delivery failed");
                        MessageStatus::Failed
                    }
                };
                self.persist_message_status(&id, status);
                self.emit(EngineEvent::MessageStatusChanged { id, status }).await;
            }
            Internal::TransferAccepted { record } => self.persist_transfer(&record),
            Internal::TransferRejected { error } => self.emit_error("send_file", error).await,
            Internal::SessionInvalidated { peer } => self.session_invalidated(peer).await,
        }
    }

    async fn handle_frame(&mut self, peer: DeviceId, frame: Frame) {
        match frame {
            Frame::PairingHello {
                public_key,
                device_name,
            } => {
                if let Some(info) = self.known_peers.get_mut(&peer) {
                    info.name = device_name;
                }
                match self.pairing.exchange(&public_key) {
                    Ok(outcome) => {
                        if let Some(link) = self.connections.link(&peer) {
                            let accept = Frame::PairingAccept {
                                public_key: self.pairing.public_key_bytes(),
                            };
                            self.spawn_send(peer.clone(), link, accept, None);
                        }
                        self.complete_pairing(peer, outcome).await;
                    }
                    Err(e) => {
                        self.emit(EngineEvent::PairingFailed {
                            peer,
                            reason: e.to_string(),
                        })
                        .await;
                    }
                }
            }
            Frame::PairingAccept { public_key } => {
                if self.pending_pairings.remove(&peer).is_none() {
                    warn!(peer = %peer, "Unsolicited pairing accept ignored");
                    return;
                }
                match self.pairing.exchange(&public_key) {
                    Ok(outcome) => self.complete_pairing(peer, outcome).await,
                    Err(e) => {
                        self.emit(EngineEvent::PairingFailed {
                            peer,
                            reason: e.to_string(),
                        })
                        .await;
                    }
                }
            }
            Frame::Chat {
                message_id,
                envelope,
            } => self.receive_chat(peer, message_id, envelope).await,
            Frame::FileOffer {
                transfer_id,
                filename,
                size,
                chunk_size,
                total_chunks,
                checksum,
            } => {
                let id = TransferId(transfer_id);
                match self
                    .transfers
                    .begin_receive(peer, id, &filename, size, chunk_size, total_chunks, checksum)
                    .await
                {
                    Ok(record) => self.persist_transfer(&record),
                    Err(e) => self.emit_error("receive", e.to_string()).await,
                }
            }
            Frame::FileChunk {
                transfer_id,
                index,
                envelope,
            } => self.receive_chunk(peer, TransferId(transfer_id), index, envelope),
            Frame::FileCancel { transfer_id } => {
                let id = TransferId(transfer_id);
                match self.transfers.cancel(&id).await {
                    Ok(()) | Err(TransferError::NotFound) => {}
                    Err(e) => warn!(transfer = %id, error = %e, "Remote cancel failed"),
                }
            }
        }
    }

    async fn receive_chat(&mut self, peer: DeviceId, message_id: Uuid, envelope: Envelope) {
        match open_chat(&self.channel, &peer, &envelope) {
            Ok(body) => {
                let id = MessageId(message_id);
                let conversation = ConversationId::between(&self.local_id, &peer);
                self.persist_message(&Message {
                    id: id.to_string(),
                    conversation_id: conversation.as_str().to_string(),
                    sender_id: peer.0.clone(),
                    receiver_id: self.local_id.0.clone(),
                    content: body.content.clone(),
                    timestamp: body.sent_at,
                    status: MessageStatus::Delivered,
                });
                self.emit(EngineEvent::MessageReceived {
                    id,
                    peer,
                    content: body.content,
                    timestamp: body.sent_at,
                })
                .await;
            }
            Err(ChannelError::NoSession) => {
                self.emit_error("message", "chat received without a session".to_string()).await;
            }
            Err(_) => self.session_invalidated(peer).await,
        }
    }

    fn receive_chunk(&self, peer: DeviceId, id: TransferId, index: u32, envelope: Envelope) {
        let transfers = Arc::clone(&self.transfers);
        let channel = Arc::clone(&self.channel);
        let itx = self.internal_tx.clone();
        tokio::spawn(async move {
            match transfers.apply_chunk(&id, index, &envelope, &channel).await {
                Ok(()) => {}
                Err(TransferError::Channel(_)) => {
                    let _ = itx.send(Internal::SessionInvalidated { peer }).await;
                }
                Err(TransferError::NotFound) => {
                    debug!(transfer = %id, index, "Chunk for unknown transfer dropped");
                }
                Err(e) => warn!(transfer = %id, index, error = %e, "Chunk apply failed"),
            }
        });
    }

    async fn complete_pairing(&mut self, peer: DeviceId, outcome: PairingOutcome) {
        self.channel.install(peer.clone(), outcome.session_key);
        if let Some(info) = self.known_peers.get(&peer) {
            self.persist_device(&Device {
                id: peer.0.clone(),
                name: info.name.clone(),
                address: info.address.clone(),
                trusted: false,
                last_seen: Utc::now(),
                fingerprint: Some(outcome.fingerprint.clone()),
            });
        }
        info!(peer = %peer, fingerprint = %outcome.fingerprint, "Pairing completed");
        self.emit(EngineEvent::PairingCompleted {
            peer,
            fingerprint: outcome.fingerprint,
            pin: outcome.pin,
        })
        .await;
    }

    async fn session_invalidated(&mut self, peer: DeviceId) {
        // The channel already dropped the session when decryption failed;
        // transfers riding on it fail rather than stall.
        warn!(peer = %peer, "Session invalidated; re-pairing required");
        self.transfers
            .fail_for_peer(&peer, "session invalidated by decryption failure")
            .await;
        self.emit(EngineEvent::SessionInvalidated { peer }).await;
    }

    async fn sweep_pairings(&mut self) {
        let timeout = self.config.pairing_timeout;
        let now = Instant::now();
        let expired: Vec<DeviceId> = self
            .pending_pairings
            .iter()
            .filter(|(_, started)| now.duration_since(**started) > timeout)
            .map(|(peer, _)| peer.clone())
            .collect();
        for peer in expired {
            self.pending_pairings.remove(&peer);
            self.emit(EngineEvent::PairingFailed {
                peer,
                reason: PairingError::Timeout.to_string(),
            })
            .await;
        }
    }

    // -- transfer events ---------------------------------------------------

    async fn handle_transfer_event(&mut self, event: TransferEvent) {
        match event {
            TransferEvent::Progress(update) => {
                self.emit(EngineEvent::TransferProgress(update)).await;
            }
            TransferEvent::StatusChanged {
                id, status, error, ..
            } => {
                let persisted = self.persist_transfer_status(&id, status);
                if status.is_terminal() && persisted {
                    self.last_transfer_status.remove(&id);
                } else {
                    self.last_transfer_status.insert(id, status);
                }
                self.emit(EngineEvent::TransferStatusChanged { id, status, error }).await;
            }
        }
    }

    // -- plumbing ----------------------------------------------------------

    /// Write one frame from a worker task so the loop never blocks on radio
    /// I/O. Delivery results for chat frames are reported back by id.
    fn spawn_send(
        &self,
        peer: DeviceId,
        link: Arc<dyn RadioLink>,
        frame: Frame,
        message: Option<MessageId>,
    ) {
        let itx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = match frame.encode() {
                Ok(bytes) => link.send_frame(&bytes).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match (message, result) {
                (Some(id), result) => {
                    let _ = itx.send(Internal::MessageSent { id, result }).await;
                }
                (None, Err(e)) => warn!(peer = %peer, error = %e, "Frame send failed"),
                (None, Ok(())) => {}
            }
        });
    }

    fn spawn_reader(&self, peer: DeviceId, link: Arc<dyn RadioLink>) {
        let itx = self.internal_tx.clone();
        tokio::spawn(async move {
            loop {
                match link.recv_frame().await {
                    Ok(bytes) => match Frame::decode(&bytes) {
                        Ok(frame) => {
                            if itx
                                .send(Internal::FrameFrom {
                                    peer: peer.clone(),
                                    frame,
                                })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => warn!(peer = %peer, error = %e, "Undecodable frame dropped"),
                    },
                    Err(_) => {
                        let _ = itx.send(Internal::LinkDropped { peer }).await;
                        break;
                    }
                }
            }
        });
    }

    async fn message_failed(&mut self, id: MessageId, reason: &str) {
        warn!(message = %id, reason, "Message not sent");
        self.persist_message_status(&id, MessageStatus::Failed);
        self.emit(EngineEvent::MessageStatusChanged {
            id,
            status: MessageStatus::Failed,
        })
        .await;
    }

    async fn emit(&mut self, event: EngineEvent) {
        let _ = self.events.send(event).await;
    }

    async fn emit_error(&mut self, context: &'static str, message: String) {
        warn!(context, message, "Engine command failed");
        self.emit(EngineEvent::Error { context, message }).await;
    }

    // -- persistence (audit copies; failures never stop the loop) ----------

    fn persist_device(&self, device: &Device) {
        if let Some(db) = &self.store {
            if let Err(e) = db.upsert_device(device) {
                warn!(device = %device.id, error = %e, "Device upsert failed");
            }
        }
    }

    fn persist_message(&self, message: &Message) {
        if let Some(db) = &self.store {
            if let Err(e) = db.insert_message(message) {
                warn!(message = %message.id, error = %e, "Message insert failed");
            }
        }
    }

    fn persist_message_status(&self, id: &MessageId, status: MessageStatus) {
        if let Some(db) = &self.store {
            if let Err(e) = db.update_message_status(&id.to_string(), status) {
                warn!(message = %id, error = %e, "Message status update failed");
            }
        }
    }

    fn persist_transfer(&mut self, record: &Transfer) {
        // The transfer may have progressed past the captured record while
        // its row was still in flight; the newest observed status wins.
        let status = self
            .last_transfer_status
            .remove(&record.id)
            .unwrap_or(record.status);
        let Some(db) = &self.store else { return };
        let (sender_id, receiver_id) = match record.direction {
            bluelink_shared::types::TransferDirection::Send => {
                (self.local_id.0.clone(), record.peer.0.clone())
            }
            bluelink_shared::types::TransferDirection::Receive => {
                (record.peer.0.clone(), self.local_id.0.clone())
            }
        };
        let row = FileTransfer {
            id: record.id.to_string(),
            sender_id,
            receiver_id,
            filename: record.filename.clone(),
            size: record.total_size as i64,
            checksum: record.expected_checksum.clone(),
            path: record.path.display().to_string(),
            timestamp: Utc::now(),
            status,
        };
        if let Err(e) = db.upsert_transfer(&row) {
            warn!(transfer = %row.id, error = %e, "Transfer upsert failed");
        }
    }

    /// Returns `true` once the status is durably recorded (or no store is
    /// attached); `false` means the transfer row does not exist yet.
    fn persist_transfer_status(&self, id: &TransferId, status: TransferStatus) -> bool {
        let Some(db) = &self.store else { return true };
        match db.update_transfer_status(&id.to_string(), status) {
            Ok(affected) => affected,
            Err(e) => {
                warn!(transfer = %id, error = %e, "Transfer status update failed");
                false
            }
        }
    }
}
