//! Chunked file transfer with pause, resume, cancel and end-to-end
//! integrity verification.
//!
//! Outbound: the whole-file checksum is computed before any chunk leaves,
//! the file is split into fixed chunks numbered from 0, each chunk is
//! sealed by the [`SecureChannel`] and delivered in order. The pause /
//! cancel signal is consulted between chunks, never mid-chunk, so in-flight
//! I/O finishes before teardown.
//!
//! Inbound: chunks may arrive in any order and are written at
//! `index * chunk_size`; a received-chunk bitmap tracks completion and the
//! checksum comparison runs exactly once, after the last chunk is applied.
//! On mismatch the partial output is deleted and the transfer fails.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use bluelink_radio::RadioLink;
use bluelink_shared::crypto::Envelope;
use bluelink_shared::protocol::Frame;
use bluelink_shared::types::{DeviceId, TransferDirection, TransferId, TransferStatus};

use crate::channel::SecureChannel;
use crate::error::TransferError;
use crate::progress::{ProgressUpdate, ThroughputMeter};

/// Throughput measurement window.
const PROGRESS_WINDOW: Duration = Duration::from_secs(3);

/// Number of chunks needed to carry `size` bytes.
pub fn chunk_count(size: u64, chunk_size: u32) -> u32 {
    if size == 0 {
        0
    } else {
        size.div_ceil(chunk_size as u64) as u32
    }
}

/// Hex BLAKE3 digest of a file, streamed in chunk-sized reads.
pub async fn file_checksum(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Bookkeeping record for one transfer.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub id: TransferId,
    pub direction: TransferDirection,
    pub peer: DeviceId,
    pub filename: String,
    pub total_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
    /// Highest contiguous acknowledged/received chunk count. Monotonically
    /// non-decreasing.
    pub acked: u32,
    pub status: TransferStatus,
    /// Sender-declared whole-file checksum.
    pub expected_checksum: String,
    /// Receiver-computed checksum, set once after the last chunk.
    pub computed_checksum: Option<String>,
    /// Source path (send) or output path (receive).
    pub path: PathBuf,
}

/// Cooperative control signal, consulted before each chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferSignal {
    Run,
    Pause,
    Cancel,
}

/// Events published to the control loop.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Progress(ProgressUpdate),
    StatusChanged {
        id: TransferId,
        peer: DeviceId,
        status: TransferStatus,
        error: Option<String>,
    },
}

enum SendOutcome {
    Completed,
    Cancelled,
}

struct ReceiveState {
    file: File,
    bitmap: ChunkBitmap,
    meter: ThroughputMeter,
    path: PathBuf,
    /// Set once the transfer reached an end state; late or duplicate chunks
    /// are ignored afterwards.
    finished: bool,
}

struct ActiveEntry {
    peer: DeviceId,
    direction: TransferDirection,
    record: Arc<Mutex<Transfer>>,
    signal: watch::Sender<TransferSignal>,
    receive: Option<Arc<tokio::sync::Mutex<ReceiveState>>>,
}

/// Drives every active transfer and enforces the state machine.
pub struct TransferEngine {
    chunk_size: u32,
    download_dir: PathBuf,
    events: mpsc::Sender<TransferEvent>,
    active: Mutex<HashMap<TransferId, ActiveEntry>>,
}

impl TransferEngine {
    pub fn new(chunk_size: u32, download_dir: PathBuf, events: mpsc::Sender<TransferEvent>) -> Self {
        Self {
            chunk_size,
            download_dir,
            events,
            active: Mutex::new(HashMap::new()),
        }
    }

    // -- outbound ----------------------------------------------------------

    /// Start sending `path` to `peer` over `link`.
    ///
    /// The whole-file checksum is computed up front and announced in the
    /// offer frame. At most one outbound transfer per peer may be active;
    /// a second request is rejected with [`TransferError::AlreadyActive`].
    ///
    /// Returns the initial transfer record.
    pub async fn start_send(
        self: &Arc<Self>,
        peer: DeviceId,
        path: PathBuf,
        channel: Arc<SecureChannel>,
        link: Arc<dyn RadioLink>,
    ) -> Result<Transfer, TransferError> {
        let meta = fs::metadata(&path).await?;
        let size = meta.len();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let total_chunks = chunk_count(size, self.chunk_size);

        // Checksum before any chunk is sent.
        let checksum = file_checksum(&path).await?;

        let id = TransferId::new();
        let record = Transfer {
            id,
            direction: TransferDirection::Send,
            peer: peer.clone(),
            filename: filename.clone(),
            total_size: size,
            chunk_size: self.chunk_size,
            total_chunks,
            acked: 0,
            status: TransferStatus::Pending,
            expected_checksum: checksum.clone(),
            computed_checksum: None,
            path,
        };
        let offer = Frame::FileOffer {
            transfer_id: id.0,
            filename,
            size,
            chunk_size: self.chunk_size,
            total_chunks,
            checksum,
        }
        .encode()?;

        let initial = record.clone();
        let (signal_tx, signal_rx) = watch::channel(TransferSignal::Run);
        self.register(ActiveEntry {
            peer: peer.clone(),
            direction: TransferDirection::Send,
            record: Arc::new(Mutex::new(record)),
            signal: signal_tx,
            receive: None,
        })?;
        self.emit_status(&id, &peer, TransferStatus::Pending, None).await;

        info!(transfer = %id, peer = %peer, bytes = size, chunks = total_chunks, "Sending file");

        if let Err(e) = link.send_frame(&offer).await {
            self.finish(&id, TransferStatus::Failed, Some(TransferError::ConnectionLost.to_string()))
                .await;
            return Err(e.into());
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run_send(id, signal_rx, channel, link).await });
        Ok(initial)
    }

    async fn run_send(
        self: Arc<Self>,
        id: TransferId,
        mut signal: watch::Receiver<TransferSignal>,
        channel: Arc<SecureChannel>,
        link: Arc<dyn RadioLink>,
    ) {
        match self.send_chunks(&id, &mut signal, &channel, &link).await {
            Ok(SendOutcome::Completed) => {
                self.finish(&id, TransferStatus::Completed, None).await;
            }
            Ok(SendOutcome::Cancelled) => {
                self.finish(&id, TransferStatus::Cancelled, Some(TransferError::Aborted.to_string()))
                    .await;
            }
            Err(e) => {
                self.finish(&id, TransferStatus::Failed, Some(e.to_string())).await;
            }
        }
    }

    async fn send_chunks(
        &self,
        id: &TransferId,
        signal: &mut watch::Receiver<TransferSignal>,
        channel: &SecureChannel,
        link: &Arc<dyn RadioLink>,
    ) -> Result<SendOutcome, TransferError> {
        let (peer, path, size, chunk_size, total_chunks) = {
            let record = self.record(id).ok_or(TransferError::NotFound)?;
            let r = record.lock().expect("transfer record poisoned");
            (r.peer.clone(), r.path.clone(), r.total_size, r.chunk_size, r.total_chunks)
        };

        // A cancel that landed before the first chunk skips the whole loop.
        if *signal.borrow() == TransferSignal::Cancel {
            self.notify_cancel(id, link).await;
            return Ok(SendOutcome::Cancelled);
        }

        self.transition(id, TransferStatus::InProgress, None).await?;

        let mut file = File::open(&path).await?;
        let mut meter = ThroughputMeter::new(PROGRESS_WINDOW);
        let mut buf = vec![0u8; chunk_size as usize];

        for index in 0..total_chunks {
            if wait_for_run(signal).await == TransferSignal::Cancel {
                self.notify_cancel(id, link).await;
                return Ok(SendOutcome::Cancelled);
            }

            let offset = index as u64 * chunk_size as u64;
            let len = (size - offset).min(chunk_size as u64) as usize;
            file.read_exact(&mut buf[..len]).await?;

            let envelope = channel.encrypt(&peer, &buf[..len])?;
            let frame = Frame::FileChunk {
                transfer_id: id.0,
                index,
                envelope,
            }
            .encode()?;
            link.send_frame(&frame)
                .await
                .map_err(|_| TransferError::ConnectionLost)?;

            // Chunk delivered: advance the acknowledged index.
            if let Some(record) = self.record(id) {
                record.lock().expect("transfer record poisoned").acked = index + 1;
                meter.record(len as u64);
                self.emit_progress(&record, &mut meter).await;
            } else {
                // Torn down concurrently (connection loss); stop quietly.
                return Err(TransferError::ConnectionLost);
            }
        }

        Ok(SendOutcome::Completed)
    }

    async fn notify_cancel(&self, id: &TransferId, link: &Arc<dyn RadioLink>) {
        if let Ok(bytes) = (Frame::FileCancel { transfer_id: id.0 }).encode() {
            // Best effort; the link may already be gone.
            let _ = link.send_frame(&bytes).await;
        }
    }

    /// Pause an outbound transfer. No new chunks are issued until resume;
    /// the acknowledged index is preserved.
    pub async fn pause(&self, id: &TransferId) -> Result<(), TransferError> {
        self.signal_send_only(id)?;
        self.transition(id, TransferStatus::Paused, None).await?;
        self.send_signal(id, TransferSignal::Pause);
        Ok(())
    }

    /// Resume a paused outbound transfer from the first unacknowledged
    /// chunk. Already-acknowledged chunks are never resent.
    pub async fn resume(&self, id: &TransferId) -> Result<(), TransferError> {
        self.signal_send_only(id)?;
        self.transition(id, TransferStatus::InProgress, None).await?;
        self.send_signal(id, TransferSignal::Run);
        Ok(())
    }

    /// Cancel a transfer. Outbound: the send task observes the flag at the
    /// next chunk boundary, notifies the peer and finalizes. Inbound: the
    /// partial output is discarded immediately.
    pub async fn cancel(&self, id: &TransferId) -> Result<(), TransferError> {
        let (direction, receive) = {
            let active = self.active.lock().expect("active map poisoned");
            let entry = active.get(id).ok_or(TransferError::NotFound)?;
            (entry.direction, entry.receive.clone())
        };
        match direction {
            TransferDirection::Send => {
                self.send_signal(id, TransferSignal::Cancel);
                Ok(())
            }
            TransferDirection::Receive => {
                if let Some(receive) = receive {
                    let mut st = receive.lock().await;
                    st.finished = true;
                    let _ = fs::remove_file(&st.path).await;
                }
                self.finish(id, TransferStatus::Cancelled, Some(TransferError::Aborted.to_string()))
                    .await;
                Ok(())
            }
        }
    }

    // -- inbound -----------------------------------------------------------

    /// Accept a file offer and prepare the output file. Returns the initial
    /// transfer record.
    #[allow(clippy::too_many_arguments)]
    pub async fn begin_receive(
        self: &Arc<Self>,
        peer: DeviceId,
        id: TransferId,
        filename: &str,
        size: u64,
        chunk_size: u32,
        total_chunks: u32,
        checksum: String,
    ) -> Result<Transfer, TransferError> {
        if chunk_size == 0 || chunk_count(size, chunk_size) != total_chunks {
            return Err(TransferError::InvalidOffer(format!(
                "{total_chunks} chunks of {chunk_size} bytes cannot carry {size} bytes"
            )));
        }

        // Only the final path component; an offer never chooses directories.
        let safe_name = Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download.bin".to_string());
        fs::create_dir_all(&self.download_dir).await?;
        let out_path = self.download_dir.join(safe_name);

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&out_path)
            .await?;
        file.set_len(size).await?;

        let record = Transfer {
            id,
            direction: TransferDirection::Receive,
            peer: peer.clone(),
            filename: filename.to_string(),
            total_size: size,
            chunk_size,
            total_chunks,
            acked: 0,
            status: TransferStatus::Pending,
            expected_checksum: checksum,
            computed_checksum: None,
            path: out_path.clone(),
        };

        let initial = record.clone();
        let (signal_tx, _signal_rx) = watch::channel(TransferSignal::Run);
        self.register(ActiveEntry {
            peer: peer.clone(),
            direction: TransferDirection::Receive,
            record: Arc::new(Mutex::new(record)),
            signal: signal_tx,
            receive: Some(Arc::new(tokio::sync::Mutex::new(ReceiveState {
                file,
                bitmap: ChunkBitmap::new(total_chunks),
                meter: ThroughputMeter::new(PROGRESS_WINDOW),
                path: out_path.clone(),
                finished: false,
            }))),
        })?;
        self.emit_status(&id, &peer, TransferStatus::Pending, None).await;

        info!(transfer = %id, peer = %peer, bytes = size, chunks = total_chunks, "Receiving file");

        if total_chunks == 0 {
            // A zero-length file is trivially complete, but the checksum is
            // still compared, exactly once.
            self.transition(&id, TransferStatus::InProgress, None).await?;
            let result = self.verify_and_complete(&id, &out_path).await;
            if let Err(e) = result {
                self.fail_transfer(&id, e.to_string()).await;
                return Err(e);
            }
        }

        Ok(initial)
    }

    /// Apply one received chunk. Out-of-order arrival is expected; each
    /// chunk lands at `index * chunk_size`.
    pub async fn apply_chunk(
        &self,
        id: &TransferId,
        index: u32,
        envelope: &Envelope,
        channel: &SecureChannel,
    ) -> Result<(), TransferError> {
        let result = self.apply_chunk_inner(id, index, envelope, channel).await;
        if let Err(ref e) = result {
            // Any failure, including a chunk that will not authenticate,
            // fails the whole transfer rather than dropping the chunk.
            self.fail_transfer(id, e.to_string()).await;
        }
        result
    }

    async fn apply_chunk_inner(
        &self,
        id: &TransferId,
        index: u32,
        envelope: &Envelope,
        channel: &SecureChannel,
    ) -> Result<(), TransferError> {
        let (peer, record, receive) = {
            let active = self.active.lock().expect("active map poisoned");
            let entry = active.get(id).ok_or(TransferError::NotFound)?;
            let receive = entry.receive.clone().ok_or(TransferError::NotFound)?;
            (entry.peer.clone(), Arc::clone(&entry.record), receive)
        };

        let plaintext = channel.decrypt(&peer, envelope)?;

        let mut st = receive.lock().await;
        if st.finished {
            return Ok(());
        }

        let (total_chunks, chunk_size, expected, status) = {
            let r = record.lock().expect("transfer record poisoned");
            (r.total_chunks, r.chunk_size, r.expected_checksum.clone(), r.status)
        };

        if index >= total_chunks {
            return Err(TransferError::ChunkOutOfRange {
                index,
                total: total_chunks,
            });
        }
        if st.bitmap.is_set(index) {
            debug!(transfer = %id, index, "Duplicate chunk ignored");
            return Ok(());
        }

        if status == TransferStatus::Pending {
            self.transition(id, TransferStatus::InProgress, None).await?;
        }

        st.file
            .seek(SeekFrom::Start(index as u64 * chunk_size as u64))
            .await?;
        st.file.write_all(&plaintext).await?;
        st.bitmap.set(index);

        {
            let mut r = record.lock().expect("transfer record poisoned");
            r.acked = st.bitmap.contiguous_prefix();
        }
        st.meter.record(plaintext.len() as u64);

        let ReceiveState { meter, .. } = &mut *st;
        self.emit_progress(&record, meter).await;

        if st.bitmap.is_complete() {
            st.finished = true;
            st.file.flush().await?;
            let path = st.path.clone();
            drop(st);
            self.verify_and_complete(id, &path).await?;
        }

        Ok(())
    }

    /// Compare the reassembled file against the declared checksum. Runs
    /// exactly once per transfer.
    async fn verify_and_complete(&self, id: &TransferId, path: &Path) -> Result<(), TransferError> {
        let record = self.record(id).ok_or(TransferError::NotFound)?;
        let expected = {
            let r = record.lock().expect("transfer record poisoned");
            r.expected_checksum.clone()
        };

        let actual = file_checksum(path).await?;
        record
            .lock()
            .expect("transfer record poisoned")
            .computed_checksum = Some(actual.clone());

        if actual == expected {
            self.finish(id, TransferStatus::Completed, None).await;
            Ok(())
        } else {
            Err(TransferError::ChecksumMismatch { expected, actual })
        }
    }

    // -- shared ------------------------------------------------------------

    /// Fail every active transfer with `peer` (connection loss). Partial
    /// inbound output is discarded; outbound tasks stop at the next chunk
    /// boundary.
    pub async fn fail_for_peer(&self, peer: &DeviceId, reason: &str) {
        let ids: Vec<TransferId> = {
            let active = self.active.lock().expect("active map poisoned");
            active
                .iter()
                .filter(|(_, e)| &e.peer == peer)
                .map(|(id, e)| {
                    let _ = e.signal.send(TransferSignal::Cancel);
                    *id
                })
                .collect()
        };
        for id in ids {
            warn!(transfer = %id, peer = %peer, reason, "Failing transfer");
            self.fail_transfer(&id, reason.to_string()).await;
        }
    }

    /// Current record for an active transfer, if any.
    pub fn snapshot(&self, id: &TransferId) -> Option<Transfer> {
        self.record(id)
            .map(|r| r.lock().expect("transfer record poisoned").clone())
    }

    pub fn has_active(&self, peer: &DeviceId, direction: TransferDirection) -> bool {
        self.active
            .lock()
            .expect("active map poisoned")
            .values()
            .any(|e| &e.peer == peer && e.direction == direction)
    }

    fn register(&self, entry: ActiveEntry) -> Result<(), TransferError> {
        let mut active = self.active.lock().expect("active map poisoned");
        if active
            .values()
            .any(|e| e.peer == entry.peer && e.direction == entry.direction)
        {
            return Err(TransferError::AlreadyActive);
        }
        let id = entry.record.lock().expect("transfer record poisoned").id;
        active.insert(id, entry);
        Ok(())
    }

    fn record(&self, id: &TransferId) -> Option<Arc<Mutex<Transfer>>> {
        self.active
            .lock()
            .expect("active map poisoned")
            .get(id)
            .map(|e| Arc::clone(&e.record))
    }

    fn signal_send_only(&self, id: &TransferId) -> Result<(), TransferError> {
        let active = self.active.lock().expect("active map poisoned");
        let entry = active.get(id).ok_or(TransferError::NotFound)?;
        if entry.direction != TransferDirection::Send {
            return Err(TransferError::NotPausable);
        }
        Ok(())
    }

    fn send_signal(&self, id: &TransferId, signal: TransferSignal) {
        if let Some(entry) = self.active.lock().expect("active map poisoned").get(id) {
            let _ = entry.signal.send(signal);
        }
    }

    async fn fail_transfer(&self, id: &TransferId, reason: String) {
        let receive = {
            let active = self.active.lock().expect("active map poisoned");
            match active.get(id) {
                Some(entry) => entry.receive.clone(),
                None => return,
            }
        };
        if let Some(receive) = receive {
            let mut st = receive.lock().await;
            st.finished = true;
            let _ = fs::remove_file(&st.path).await;
        }
        self.finish(id, TransferStatus::Failed, Some(reason)).await;
    }

    /// Validated non-terminal transition for an active transfer.
    async fn transition(
        &self,
        id: &TransferId,
        to: TransferStatus,
        error: Option<String>,
    ) -> Result<(), TransferError> {
        let (peer, record) = {
            let active = self.active.lock().expect("active map poisoned");
            let entry = active.get(id).ok_or(TransferError::NotFound)?;
            (entry.peer.clone(), Arc::clone(&entry.record))
        };
        {
            let mut r = record.lock().expect("transfer record poisoned");
            if !r.status.can_transition(to) {
                return Err(TransferError::InvalidTransition { from: r.status, to });
            }
            r.status = to;
        }
        self.emit_status(id, &peer, to, error).await;
        Ok(())
    }

    /// Terminal transition: removes the transfer from the active set.
    async fn finish(&self, id: &TransferId, status: TransferStatus, error: Option<String>) {
        let entry = {
            let mut active = self.active.lock().expect("active map poisoned");
            active.remove(id)
        };
        let Some(entry) = entry else { return };
        {
            let mut r = entry.record.lock().expect("transfer record poisoned");
            if r.status != status && !r.status.can_transition(status) {
                warn!(transfer = %id, from = ?r.status, to = ?status, "Irregular terminal transition");
            }
            r.status = status;
        }
        match &error {
            Some(reason) => warn!(transfer = %id, status = ?status, reason, "Transfer finished"),
            None => info!(transfer = %id, status = ?status, "Transfer finished"),
        }
        self.emit_status(id, &entry.peer, status, error).await;
    }

    async fn emit_status(
        &self,
        id: &TransferId,
        peer: &DeviceId,
        status: TransferStatus,
        error: Option<String>,
    ) {
        let _ = self
            .events
            .send(TransferEvent::StatusChanged {
                id: *id,
                peer: peer.clone(),
                status,
                error,
            })
            .await;
    }

    async fn emit_progress(&self, record: &Arc<Mutex<Transfer>>, meter: &mut ThroughputMeter) {
        let (id, percent, remaining, status) = {
            let r = record.lock().expect("transfer record poisoned");
            let percent = if r.total_chunks == 0 {
                100.0
            } else {
                r.acked as f64 / r.total_chunks as f64 * 100.0
            };
            let done = (r.acked as u64 * r.chunk_size as u64).min(r.total_size);
            (r.id, percent, r.total_size - done, r.status)
        };
        let update = ProgressUpdate {
            transfer_id: id,
            percent,
            throughput_bytes_per_sec: meter.rate(),
            eta_seconds: meter.eta(remaining),
            status,
        };
        let _ = self.events.send(TransferEvent::Progress(update)).await;
    }
}

/// Park until the signal reads `Run` or `Cancel`.
async fn wait_for_run(signal: &mut watch::Receiver<TransferSignal>) -> TransferSignal {
    loop {
        let current = *signal.borrow_and_update();
        match current {
            TransferSignal::Run | TransferSignal::Cancel => return current,
            TransferSignal::Pause => {
                if signal.changed().await.is_err() {
                    // Engine dropped the sender; treat as cancellation.
                    return TransferSignal::Cancel;
                }
            }
        }
    }
}

/// Tracks which chunk indices have been received.
struct ChunkBitmap {
    total: u32,
    bits: Vec<u64>,
}

impl ChunkBitmap {
    fn new(total: u32) -> Self {
        let words = (total as usize).div_ceil(64);
        Self {
            total,
            bits: vec![0u64; words],
        }
    }

    fn set(&mut self, index: u32) {
        if index < self.total {
            self.bits[(index / 64) as usize] |= 1u64 << (index % 64);
        }
    }

    fn is_set(&self, index: u32) -> bool {
        if index >= self.total {
            return false;
        }
        (self.bits[(index / 64) as usize] >> (index % 64)) & 1 == 1
    }

    fn received_count(&self) -> u32 {
        self.bits.iter().map(|w| w.count_ones()).sum()
    }

    fn is_complete(&self) -> bool {
        self.received_count() == self.total
    }

    /// Length of the contiguous received prefix, i.e. the highest
    /// contiguous received index plus one.
    fn contiguous_prefix(&self) -> u32 {
        for (w, word) in self.bits.iter().enumerate() {
            if *word != u64::MAX {
                let prefix = w as u32 * 64 + word.trailing_ones();
                return prefix.min(self.total);
            }
        }
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChannelError;
    use bluelink_radio::loopback::{link_pair, link_pair_with_capacity};
    use bluelink_shared::crypto::{digest_hex, generate_symmetric_key};

    #[test]
    fn chunk_count_matches_ceil_division() {
        assert_eq!(chunk_count(0, 65_536), 0);
        assert_eq!(chunk_count(1, 65_536), 1);
        assert_eq!(chunk_count(65_536, 65_536), 1);
        assert_eq!(chunk_count(65_537, 65_536), 2);
        // 200,000 bytes in 64 KiB chunks: 3 full + one partial of 3,392.
        assert_eq!(chunk_count(200_000, 65_536), 4);
        assert_eq!(200_000 - 3 * 65_536, 3_392);
    }

    #[test]
    fn bitmap_tracks_indices_and_prefix() {
        let mut bm = ChunkBitmap::new(130);
        assert!(!bm.is_complete());
        assert_eq!(bm.contiguous_prefix(), 0);

        bm.set(0);
        bm.set(2);
        assert_eq!(bm.received_count(), 2);
        assert_eq!(bm.contiguous_prefix(), 1);

        bm.set(1);
        assert_eq!(bm.contiguous_prefix(), 3);

        for i in 0..130 {
            bm.set(i);
        }
        assert!(bm.is_complete());
        assert_eq!(bm.contiguous_prefix(), 130);

        // Out-of-range indices are ignored.
        bm.set(500);
        assert!(!bm.is_set(500));
    }

    #[tokio::test]
    async fn checksum_is_idempotent_and_byte_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, vec![7u8; 100_000]).await.unwrap();

        let first = file_checksum(&path).await.unwrap();
        assert_eq!(first, file_checksum(&path).await.unwrap());

        // Flip one byte in the middle.
        let mut data = tokio::fs::read(&path).await.unwrap();
        data[50_000] ^= 1;
        tokio::fs::write(&path, data).await.unwrap();
        assert_ne!(first, file_checksum(&path).await.unwrap());
    }

    // -- helpers -----------------------------------------------------------

    struct Rig {
        engine: Arc<TransferEngine>,
        events: mpsc::Receiver<TransferEvent>,
        channel: Arc<SecureChannel>,
        peer: DeviceId,
        _dir: tempfile::TempDir,
    }

    fn rig(chunk_size: u32) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel(256);
        let engine = Arc::new(TransferEngine::new(
            chunk_size,
            dir.path().join("downloads"),
            tx,
        ));
        let channel = Arc::new(SecureChannel::new());
        let peer = DeviceId::new();
        channel.install(peer.clone(), generate_symmetric_key());
        Rig {
            engine,
            events: rx,
            channel,
            peer,
            _dir: dir,
        }
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn write_source(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        tokio::fs::write(&path, data).await.unwrap();
        path
    }

    /// Wait for the next terminal status event, skipping progress ticks.
    async fn next_terminal(
        events: &mut mpsc::Receiver<TransferEvent>,
    ) -> (TransferStatus, Option<String>) {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for transfer event")
                .expect("event channel closed")
            {
                TransferEvent::StatusChanged { status, error, .. } if status.is_terminal() => {
                    return (status, error)
                }
                _ => {}
            }
        }
    }

    async fn recv_frame(link: &Arc<bluelink_radio::loopback::LoopbackLink>) -> Frame {
        let bytes = tokio::time::timeout(Duration::from_secs(5), link.recv_frame())
            .await
            .expect("timed out waiting for frame")
            .expect("link closed");
        Frame::decode(&bytes).unwrap()
    }

    // -- send path ---------------------------------------------------------

    #[tokio::test]
    async fn send_delivers_offer_and_every_chunk_in_order() {
        let mut rig = rig(65_536);
        let data = patterned(200_000);
        let src = write_source(&rig._dir, "src.bin", &data).await;
        let (local, remote) = link_pair();

        let id = rig
            .engine
            .start_send(rig.peer.clone(), src, Arc::clone(&rig.channel), local)
            .await
            .unwrap()
            .id;

        let Frame::FileOffer {
            transfer_id,
            size,
            total_chunks,
            checksum,
            ..
        } = recv_frame(&remote).await
        else {
            panic!("expected offer first")
        };
        assert_eq!(transfer_id, id.0);
        assert_eq!(size, 200_000);
        assert_eq!(total_chunks, 4);

        let mut reassembled = Vec::new();
        for expected_index in 0..4 {
            let Frame::FileChunk { index, envelope, .. } = recv_frame(&remote).await else {
                panic!("expected chunk")
            };
            assert_eq!(index, expected_index);
            reassembled.extend(rig.channel.decrypt(&rig.peer, &envelope).unwrap());
        }
        assert_eq!(reassembled, data);
        assert_eq!(digest_hex(&reassembled), checksum);

        let (status, error) = next_terminal(&mut rig.events).await;
        assert_eq!(status, TransferStatus::Completed);
        assert!(error.is_none());
        assert!(rig.engine.snapshot(&id).is_none());
    }

    #[tokio::test]
    async fn pause_preserves_the_index_and_resume_never_resends() {
        let mut rig = rig(65_536);
        let data = patterned(200_000);
        let src = write_source(&rig._dir, "src.bin", &data).await;
        // Capacity 1: at most one frame is in flight past the signal check.
        let (local, remote) = link_pair_with_capacity(1);

        let id = rig
            .engine
            .start_send(rig.peer.clone(), src, Arc::clone(&rig.channel), local)
            .await
            .unwrap()
            .id;

        let Frame::FileOffer { .. } = recv_frame(&remote).await else {
            panic!("expected offer first")
        };

        // Consume the first chunk so the sender can progress, wait until at
        // least two chunks are acknowledged, then pause.
        let mut delivered = Vec::new();
        let Frame::FileChunk { index, .. } = recv_frame(&remote).await else {
            panic!("expected chunk")
        };
        delivered.push(index);
        while rig.engine.snapshot(&id).map(|t| t.acked).unwrap_or(0) < 2 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        rig.engine.pause(&id).await.unwrap();

        // Drain chunks that were already in flight when the pause landed.
        // The drain going quiet also proves nothing flows while paused.
        while let Ok(Ok(bytes)) =
            tokio::time::timeout(Duration::from_millis(100), remote.recv_frame()).await
        {
            if let Frame::FileChunk { index, .. } = Frame::decode(&bytes).unwrap() {
                delivered.push(index);
            }
        }

        let paused = rig.engine.snapshot(&id).expect("still active");
        assert_eq!(paused.status, TransferStatus::Paused);
        let acked_at_pause = paused.acked;
        assert!(acked_at_pause >= 2);
        assert_eq!(delivered.len(), acked_at_pause as usize);

        // Nothing further flows while paused (drained above proves quiet).
        rig.engine.resume(&id).await.unwrap();

        let mut after_resume = Vec::new();
        loop {
            match recv_frame(&remote).await {
                Frame::FileChunk { index, .. } => after_resume.push(index),
                other => panic!("unexpected frame {other:?}"),
            }
            if after_resume.len() == (4 - acked_at_pause) as usize {
                break;
            }
        }
        // Only the unacknowledged tail, in order, nothing resent.
        let expected: Vec<u32> = (acked_at_pause..4).collect();
        assert_eq!(after_resume, expected);

        let (status, _) = next_terminal(&mut rig.events).await;
        assert_eq!(status, TransferStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_stops_sending_and_notifies_the_peer() {
        let mut rig = rig(4_096);
        let data = patterned(1 << 20);
        let src = write_source(&rig._dir, "big.bin", &data).await;
        let (local, remote) = link_pair_with_capacity(1);

        let id = rig
            .engine
            .start_send(rig.peer.clone(), src, Arc::clone(&rig.channel), local)
            .await
            .unwrap()
            .id;
        let Frame::FileOffer { .. } = recv_frame(&remote).await else {
            panic!("expected offer first")
        };

        rig.engine.cancel(&id).await.unwrap();

        // Frames still flow until the task observes the flag at the next
        // chunk boundary; the stream must end with the cancel notice.
        let mut saw_cancel = false;
        while let Ok(Ok(bytes)) =
            tokio::time::timeout(Duration::from_millis(200), remote.recv_frame()).await
        {
            match Frame::decode(&bytes).unwrap() {
                Frame::FileCancel { transfer_id } => {
                    assert_eq!(transfer_id, id.0);
                    saw_cancel = true;
                    break;
                }
                Frame::FileChunk { .. } => {}
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert!(saw_cancel);

        let (status, error) = next_terminal(&mut rig.events).await;
        assert_eq!(status, TransferStatus::Cancelled);
        assert!(error.is_some());
        // Cancelling again: the transfer no longer exists.
        assert!(matches!(
            rig.engine.cancel(&id).await,
            Err(TransferError::NotFound)
        ));
    }

    #[tokio::test]
    async fn second_send_to_the_same_peer_is_rejected() {
        let mut rig = rig(1_024);
        let src = write_source(&rig._dir, "src.bin", &patterned(1 << 20)).await;
        let (local, _remote) = link_pair();

        let _id = rig
            .engine
            .start_send(
                rig.peer.clone(),
                src.clone(),
                Arc::clone(&rig.channel),
                Arc::clone(&local) as Arc<dyn RadioLink>,
            )
            .await
            .unwrap();

        let second = rig
            .engine
            .start_send(rig.peer.clone(), src, Arc::clone(&rig.channel), local)
            .await;
        assert!(matches!(second, Err(TransferError::AlreadyActive)));

        // The opposite direction is unaffected.
        assert!(!rig
            .engine
            .has_active(&rig.peer, TransferDirection::Receive));
        drop(rig.events);
    }

    #[tokio::test]
    async fn zero_length_file_completes_trivially() {
        let mut rig = rig(65_536);
        let src = write_source(&rig._dir, "empty.bin", &[]).await;
        let (local, remote) = link_pair();

        rig.engine
            .start_send(rig.peer.clone(), src, Arc::clone(&rig.channel), local)
            .await
            .unwrap();

        let Frame::FileOffer {
            total_chunks,
            size,
            checksum,
            ..
        } = recv_frame(&remote).await
        else {
            panic!("expected offer")
        };
        assert_eq!((size, total_chunks), (0, 0));

        let (status, _) = next_terminal(&mut rig.events).await;
        assert_eq!(status, TransferStatus::Completed);

        // Receiving the same offer is also trivially complete.
        let id = rig
            .engine
            .begin_receive(rig.peer.clone(), TransferId::new(), "empty.bin", 0, 65_536, 0, checksum)
            .await
            .unwrap()
            .id;
        let (status, _) = next_terminal(&mut rig.events).await;
        assert_eq!(status, TransferStatus::Completed);
        assert!(rig.engine.snapshot(&id).is_none());
    }

    // -- receive path ------------------------------------------------------

    struct Incoming {
        id: TransferId,
        data: Vec<u8>,
        chunk_size: u32,
        total_chunks: u32,
    }

    async fn offer_to(rig: &Rig, data: Vec<u8>, chunk_size: u32) -> Incoming {
        let total_chunks = chunk_count(data.len() as u64, chunk_size);
        let id = TransferId::new();
        rig.engine
            .begin_receive(
                rig.peer.clone(),
                id,
                "incoming.bin",
                data.len() as u64,
                chunk_size,
                total_chunks,
                digest_hex(&data),
            )
            .await
            .unwrap();
        Incoming {
            id,
            data,
            chunk_size,
            total_chunks,
        }
    }

    fn chunk_of(incoming: &Incoming, index: u32) -> &[u8] {
        let start = index as usize * incoming.chunk_size as usize;
        let end = (start + incoming.chunk_size as usize).min(incoming.data.len());
        &incoming.data[start..end]
    }

    #[tokio::test]
    async fn out_of_order_chunks_reassemble_by_index() {
        let mut rig = rig(65_536);
        let incoming = offer_to(&rig, patterned(200_000), 65_536).await;

        for index in [2u32, 0, 3, 1] {
            let envelope = rig
                .channel
                .encrypt(&rig.peer, chunk_of(&incoming, index))
                .unwrap();
            rig.engine
                .apply_chunk(&incoming.id, index, &envelope, &rig.channel)
                .await
                .unwrap();
        }

        let (status, error) = next_terminal(&mut rig.events).await;
        assert_eq!(status, TransferStatus::Completed);
        assert!(error.is_none());

        let written = tokio::fs::read(rig._dir.path().join("downloads/incoming.bin"))
            .await
            .unwrap();
        assert_eq!(written, incoming.data);
    }

    #[tokio::test]
    async fn duplicate_chunks_are_ignored() {
        let rig = rig(1_024);
        let incoming = offer_to(&rig, patterned(4_000), 1_024).await;

        let envelope = rig.channel.encrypt(&rig.peer, chunk_of(&incoming, 1)).unwrap();
        rig.engine
            .apply_chunk(&incoming.id, 1, &envelope, &rig.channel)
            .await
            .unwrap();
        let replay = rig.channel.encrypt(&rig.peer, chunk_of(&incoming, 1)).unwrap();
        rig.engine
            .apply_chunk(&incoming.id, 1, &replay, &rig.channel)
            .await
            .unwrap();

        let snapshot = rig.engine.snapshot(&incoming.id).unwrap();
        assert_eq!(snapshot.status, TransferStatus::InProgress);
        // Index 0 still missing: no contiguous progress yet.
        assert_eq!(snapshot.acked, 0);
    }

    #[tokio::test]
    async fn checksum_mismatch_deletes_output_and_fails() {
        let mut rig = rig(1_024);
        let mut incoming = offer_to(&rig, patterned(3_000), 1_024).await;
        // Corrupt one byte of what the sender will actually transmit; the
        // offer already declared the digest of the pristine data.
        incoming.data[1_500] ^= 1;

        let mut last = Ok(());
        for index in 0..incoming.total_chunks {
            let envelope = rig
                .channel
                .encrypt(&rig.peer, chunk_of(&incoming, index))
                .unwrap();
            last = rig
                .engine
                .apply_chunk(&incoming.id, index, &envelope, &rig.channel)
                .await;
        }
        assert!(matches!(last, Err(TransferError::ChecksumMismatch { .. })));

        let (status, error) = next_terminal(&mut rig.events).await;
        assert_eq!(status, TransferStatus::Failed);
        assert!(error.unwrap().contains("Checksum mismatch"));

        // Partial output is gone.
        assert!(!rig._dir.path().join("downloads/incoming.bin").exists());
    }

    #[tokio::test]
    async fn tampered_chunk_fails_the_whole_transfer() {
        let mut rig = rig(1_024);
        let incoming = offer_to(&rig, patterned(3_000), 1_024).await;

        let mut envelope = rig.channel.encrypt(&rig.peer, chunk_of(&incoming, 0)).unwrap();
        envelope.ciphertext[0] ^= 0xFF;

        let result = rig
            .engine
            .apply_chunk(&incoming.id, 0, &envelope, &rig.channel)
            .await;
        assert!(matches!(result, Err(TransferError::Channel(ChannelError::Crypto(_)))));

        let (status, _) = next_terminal(&mut rig.events).await;
        assert_eq!(status, TransferStatus::Failed);
        // The session died with it; re-pairing is required.
        assert!(!rig.channel.has_session(&rig.peer));
        assert!(!rig._dir.path().join("downloads/incoming.bin").exists());
    }

    #[tokio::test]
    async fn cancelled_receive_discards_partial_output() {
        let mut rig = rig(1_024);
        let incoming = offer_to(&rig, patterned(3_000), 1_024).await;

        let envelope = rig.channel.encrypt(&rig.peer, chunk_of(&incoming, 0)).unwrap();
        rig.engine
            .apply_chunk(&incoming.id, 0, &envelope, &rig.channel)
            .await
            .unwrap();

        rig.engine.cancel(&incoming.id).await.unwrap();

        let (status, _) = next_terminal(&mut rig.events).await;
        assert_eq!(status, TransferStatus::Cancelled);
        assert!(!rig._dir.path().join("downloads/incoming.bin").exists());

        // Inbound transfers cannot be paused, only cancelled.
        let late = offer_to(&rig, patterned(2_000), 1_024).await;
        assert!(matches!(
            rig.engine.pause(&late.id).await,
            Err(TransferError::NotPausable)
        ));
    }

    #[tokio::test]
    async fn connection_loss_fails_active_transfers() {
        let mut rig = rig(1_024);
        let incoming = offer_to(&rig, patterned(3_000), 1_024).await;

        let envelope = rig.channel.encrypt(&rig.peer, chunk_of(&incoming, 0)).unwrap();
        rig.engine
            .apply_chunk(&incoming.id, 0, &envelope, &rig.channel)
            .await
            .unwrap();

        rig.engine
            .fail_for_peer(&rig.peer, &TransferError::ConnectionLost.to_string())
            .await;

        let (status, error) = next_terminal(&mut rig.events).await;
        assert_eq!(status, TransferStatus::Failed);
        assert!(error.unwrap().contains("Connection lost"));
        assert!(!rig._dir.path().join("downloads/incoming.bin").exists());
        assert!(!rig.engine.has_active(&rig.peer, TransferDirection::Receive));
    }

    #[tokio::test]
    async fn malformed_offer_is_rejected() {
        let rig = rig(1_024);
        let result = rig
            .engine
            .begin_receive(
                rig.peer.clone(),
                TransferId::new(),
                "bad.bin",
                10_000,
                1_024,
                3, // should be 10
                "digest".to_string(),
            )
            .await;
        assert!(matches!(result, Err(TransferError::InvalidOffer(_))));
    }
}
