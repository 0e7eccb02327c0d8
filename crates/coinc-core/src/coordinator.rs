//! Site coordinator: owns the buffers, counter state, offset table, peer
//! link and session lifecycle, and exposes the handful of calls the UI
//! layer drives (`start_session`, `stop_session`, `set_pairs`, `tick`, …).
//!
//! Ownership is strictly one-way: the coordinator owns everything, peer
//! handlers hold only a `Weak` back-reference, and commands address buffers
//! and offset slots by index, never by pointer.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::buffer::TimestampBuffer;
use crate::correlator::{self, CorrelationParams, OffsetEstimate};
use crate::counter::{self, CorrelationPair, Endpoint, PairCount};
use crate::offsets::OffsetTable;
use crate::peer::PeerConnection;
use crate::protocol::{self, BatchEntry, SaveSettings, StreamingStart, TimestampBatch};
use crate::session::{Session, Tagger};
use crate::stats::{PairWindow, SinglesSnapshot, SinglesTracker};
use crate::tail::TailWorker;
use crate::transfer::FileTransferManager;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub window_ps: i64,
    pub buffer_duration_sec: f64,
    pub buffer_max_size: usize,
    pub data_dir: PathBuf,
    pub remote_subdir: String,
    /// Whether this site pushes TIMESTAMP_BATCH messages. Exactly one site
    /// should; it is explicit configuration, never inferred from site names.
    pub batch_sender: bool,
    pub file_chunk_bytes: usize,
    pub file_chunk_delay: Duration,
    pub inter_file_delay: Duration,
    pub live_fft: CorrelationParams,
}

/// One pair's row in a tick report.
#[derive(Debug, Clone, Serialize)]
pub struct PairTickEntry {
    pub pair: CorrelationPair,
    pub count: u64,
    pub window: Vec<u64>,
    pub window_mean: Option<f64>,
}

/// What a tick publishes to the UI layer.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub pairs: Vec<PairTickEntry>,
    pub singles: SinglesSnapshot,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    /// Back-reference for threads and peer handlers; set by `new_cyclic`.
    self_weak: Weak<Coordinator>,
    local_buffers: [Arc<TimestampBuffer>; 4],
    remote_buffers: [Arc<TimestampBuffer>; 4],
    pairs: Mutex<Vec<CorrelationPair>>,
    offsets: Arc<OffsetTable>,
    peer: Arc<PeerConnection>,
    transfer: Arc<FileTransferManager>,
    tagger: Arc<dyn Tagger>,
    session: Mutex<Option<Session>>,
    /// Acquisitions of the most recent session, kept past `stop_session`
    /// so the peer can still request the files afterwards.
    last_acquisitions: Mutex<Vec<crate::session::Acquisition>>,
    tail_stop: Mutex<Option<Arc<AtomicBool>>>,
    tail_handles: Mutex<Vec<JoinHandle<()>>>,
    windows: Mutex<HashMap<CorrelationPair, PairWindow>>,
    singles: Mutex<SinglesTracker>,
    /// Per-channel count of local events already shipped in a batch.
    last_sent: [AtomicU64; 4],
    /// Channels this site records when the peer does not say otherwise.
    default_save_channels: Mutex<Vec<u8>>,
    /// Peer's mirrored save-channel setting (display only).
    peer_save_channels: Mutex<Vec<u8>>,
    /// Peer's last COUNTER_DATA singles totals (display only).
    peer_counters: Mutex<[u64; 4]>,
}

fn make_buffers(duration_sec: f64, max_size: usize) -> [Arc<TimestampBuffer>; 4] {
    [1u8, 2, 3, 4].map(|ch| Arc::new(TimestampBuffer::new(ch, duration_sec, max_size)))
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        peer: Arc<PeerConnection>,
        tagger: Arc<dyn Tagger>,
    ) -> Arc<Self> {
        let offsets = Arc::new(OffsetTable::new());
        if let Err(e) = offsets.load(&config.data_dir.join("time_offsets.json")) {
            tracing::warn!("could not load offset table: {:#}", e);
        }
        let transfer = Arc::new(FileTransferManager::new(
            config.data_dir.join(&config.remote_subdir),
            config.file_chunk_bytes,
            config.file_chunk_delay,
            config.inter_file_delay,
        ));
        let coordinator = Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            local_buffers: make_buffers(config.buffer_duration_sec, config.buffer_max_size),
            remote_buffers: make_buffers(config.buffer_duration_sec, config.buffer_max_size),
            pairs: Mutex::new(Vec::new()),
            offsets,
            peer,
            transfer,
            tagger,
            session: Mutex::new(None),
            last_acquisitions: Mutex::new(Vec::new()),
            tail_stop: Mutex::new(None),
            tail_handles: Mutex::new(Vec::new()),
            windows: Mutex::new(HashMap::new()),
            singles: Mutex::new(SinglesTracker::new()),
            last_sent: Default::default(),
            default_save_channels: Mutex::new(vec![1, 2, 3, 4]),
            peer_save_channels: Mutex::new(Vec::new()),
            peer_counters: Mutex::new([0; 4]),
            config,
        });
        coordinator.register_peer_handlers();
        coordinator
    }

    pub fn peer(&self) -> &Arc<PeerConnection> {
        &self.peer
    }

    pub fn offsets(&self) -> &Arc<OffsetTable> {
        &self.offsets
    }

    pub fn transfer(&self) -> &Arc<FileTransferManager> {
        &self.transfer
    }

    // -- pair / offset configuration ----------------------------------------

    pub fn set_pairs(&self, pairs: Vec<CorrelationPair>) {
        let mut windows = self.windows.lock().unwrap();
        windows.retain(|pair, _| pairs.contains(pair));
        *self.pairs.lock().unwrap() = pairs;
    }

    pub fn pairs(&self) -> Vec<CorrelationPair> {
        self.pairs.lock().unwrap().clone()
    }

    /// Write one offset slot and persist the table.
    pub fn set_offset(&self, slot: usize, offset_ps: i64) {
        self.offsets.set(slot, offset_ps);
        if let Err(e) = self.offsets.save(&self.config.data_dir.join("time_offsets.json")) {
            tracing::warn!("could not persist offset table: {:#}", e);
        }
    }

    // -- session lifecycle ---------------------------------------------------

    /// Start a recording session and tell the peer to do the same.
    pub fn start_session(
        &self,
        duration: Option<Duration>,
        save_local_channels: Vec<u8>,
        save_remote_channels: Vec<u8>,
    ) -> Result<()> {
        self.begin_recording(duration, save_local_channels, true, save_remote_channels)
    }

    /// Stop the current session on both sites.
    pub fn stop_session(&self) {
        self.end_recording(true);
    }

    pub fn session_active(&self) -> bool {
        self.session.lock().unwrap().is_some()
    }

    fn begin_recording(
        &self,
        duration: Option<Duration>,
        save_local_channels: Vec<u8>,
        announce: bool,
        save_remote_channels: Vec<u8>,
    ) -> Result<()> {
        {
            let session = self.session.lock().unwrap();
            anyhow::ensure!(session.is_none(), "a session is already running");
        }

        for buffer in self.local_buffers.iter().chain(self.remote_buffers.iter()) {
            buffer.clear();
        }
        for sent in &self.last_sent {
            sent.store(0, Ordering::Release);
        }
        self.windows.lock().unwrap().clear();

        let acquisitions = self
            .tagger
            .arm(&save_local_channels)
            .context("failed to arm tagger")?;
        *self.last_acquisitions.lock().unwrap() = acquisitions.clone();

        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();
        for acq in &acquisitions {
            let Some(buffer) = acq
                .channel
                .checked_sub(1)
                .and_then(|i| self.local_buffers.get(i as usize))
            else {
                tracing::warn!("tagger returned unknown channel {}", acq.channel);
                continue;
            };
            let worker =
                TailWorker::new(acq.channel, acq.path.clone(), buffer.clone(), stop.clone());
            handles.push(worker.spawn());
        }
        *self.tail_stop.lock().unwrap() = Some(stop);
        *self.tail_handles.lock().unwrap() = handles;

        if announce {
            let payload = StreamingStart {
                duration_sec: duration.map(|d| d.as_secs_f64()),
                local_save_channels: save_remote_channels.clone(),
            };
            if !self.peer.send_command(
                protocol::STREAMING_START,
                serde_json::to_value(payload).unwrap_or(json!({})),
            ) {
                tracing::warn!("peer not reachable; session runs single-sited");
            }
        }

        *self.session.lock().unwrap() = Some(Session {
            started: Instant::now(),
            duration,
            local_save_channels: save_local_channels,
            remote_save_channels: save_remote_channels,
            acquisitions,
        });

        if duration.is_some() {
            let weak = self.self_weak.clone();
            std::thread::Builder::new()
                .name("session-timer".into())
                .spawn(move || auto_stop_loop(weak))
                .expect("failed to spawn session timer");
        }
        tracing::info!("session started (duration {:?})", duration);
        Ok(())
    }

    fn end_recording(&self, announce: bool) {
        let Some(session) = self.session.lock().unwrap().take() else {
            return;
        };
        if let Some(stop) = self.tail_stop.lock().unwrap().take() {
            stop.store(true, Ordering::Release);
        }
        for handle in self.tail_handles.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        if let Err(e) = self.tagger.disarm() {
            tracing::warn!("tagger disarm failed: {:#}", e);
        }
        if announce {
            self.peer.send_command(protocol::STREAMING_STOP, json!({}));
        }
        tracing::info!(
            "session stopped after {:.1}s",
            session.elapsed().as_secs_f64()
        );
    }

    // -- counting ------------------------------------------------------------

    /// One counting pass over every configured pair. Called at ~2 Hz by the
    /// embedding's scheduler.
    pub fn tick(&self) -> TickReport {
        let pairs = self.pairs();
        let counts: Vec<PairCount> = counter::count_pairs(
            &pairs,
            &self.local_buffers,
            &self.remote_buffers,
            &self.offsets,
            self.config.window_ps,
        );

        let mut windows = self.windows.lock().unwrap();
        let entries = counts
            .into_iter()
            .map(|pc| {
                let window = windows.entry(pc.pair).or_default();
                window.push(pc.count);
                PairTickEntry {
                    pair: pc.pair,
                    count: pc.count,
                    window: window.samples(),
                    window_mean: window.mean(),
                }
            })
            .collect();
        drop(windows);

        let singles = self.singles.lock().unwrap().snapshot(&self.local_buffers);
        if self.peer.is_connected() {
            self.peer.send_command(
                protocol::COUNTER_DATA,
                json!({ "counters": singles.totals }),
            );
        }
        TickReport { pairs: entries, singles }
    }

    /// Latest rolling windows without running a new count.
    pub fn get_counts(&self) -> Vec<PairTickEntry> {
        let windows = self.windows.lock().unwrap();
        self.pairs()
            .into_iter()
            .filter_map(|pair| {
                let window = windows.get(&pair)?;
                Some(PairTickEntry {
                    pair,
                    count: window.latest()?,
                    window: window.samples(),
                    window_mean: window.mean(),
                })
            })
            .collect()
    }

    /// Remote singles totals from the peer's last COUNTER_DATA.
    pub fn peer_counters(&self) -> [u64; 4] {
        *self.peer_counters.lock().unwrap()
    }

    // -- timestamp batching --------------------------------------------------

    /// Ship new local events to the peer. Only the configured batch sender
    /// does this; the dense site can reconstruct the sparse site's pairings
    /// but not vice versa.
    pub fn send_timestamps(&self) -> bool {
        if !self.config.batch_sender {
            return false;
        }
        let Some(batch) = self.build_batch() else {
            return false;
        };
        self.peer.send_command(
            protocol::TIMESTAMP_BATCH,
            serde_json::to_value(batch).unwrap_or(json!({})),
        )
    }

    /// Collect events appended since the previous batch, one entry per
    /// channel with anything new. Payloads are deflate level 1 over raw LE
    /// u64s: fast enough for 10 Hz and roughly halves the frame size.
    fn build_batch(&self) -> Option<TimestampBatch> {
        let mut timestamps = HashMap::new();
        for (idx, buffer) in self.local_buffers.iter().enumerate() {
            let total = buffer.events_total();
            let already = self.last_sent[idx].load(Ordering::Acquire);
            let fresh = total.saturating_sub(already) as usize;
            if fresh == 0 {
                continue;
            }
            let snapshot = buffer.snapshot();
            // Retention may have dropped part of the unsent backlog; send
            // whatever of it is still resident.
            let take = fresh.min(snapshot.len());
            let newest = &snapshot[snapshot.len() - take..];

            let mut raw = Vec::with_capacity(newest.len() * 8);
            for &ts in newest {
                raw.extend_from_slice(&(ts as u64).to_le_bytes());
            }
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(1));
            if encoder.write_all(&raw).is_err() {
                continue;
            }
            let Ok(compressed) = encoder.finish() else {
                continue;
            };
            timestamps.insert(
                (idx + 1).to_string(),
                BatchEntry { data: BASE64.encode(compressed), count: newest.len() },
            );
            self.last_sent[idx].store(total, Ordering::Release);
        }
        if timestamps.is_empty() {
            return None;
        }
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        Some(TimestampBatch { timestamps, time })
    }

    /// Unpack a peer batch into the remote buffers.
    fn apply_batch(&self, batch: &TimestampBatch) {
        for (channel_key, entry) in &batch.timestamps {
            let Ok(channel) = channel_key.parse::<usize>() else {
                tracing::warn!("batch for bad channel key {:?}", channel_key);
                continue;
            };
            let Some(buffer) = channel
                .checked_sub(1)
                .and_then(|i| self.remote_buffers.get(i))
            else {
                tracing::warn!("batch for out-of-range channel {}", channel);
                continue;
            };
            let compressed = match BASE64.decode(entry.data.as_bytes()) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("batch ch{}: bad base64: {}", channel, e);
                    continue;
                }
            };
            let mut raw = Vec::new();
            if let Err(e) = ZlibDecoder::new(compressed.as_slice()).read_to_end(&mut raw) {
                tracing::warn!("batch ch{}: inflate failed: {}", channel, e);
                continue;
            }
            let decoded = crate::records::decode_bare(&raw);
            if decoded.len() != entry.count {
                tracing::warn!(
                    "batch ch{}: count mismatch ({} decoded, {} declared)",
                    channel,
                    decoded.len(),
                    entry.count
                );
            }
            buffer.append_array(&decoded, None);
        }
    }

    // -- live offset calibration ---------------------------------------------

    /// Run the live-regime estimator for every offset slot the configured
    /// pairs reference (first pair per slot picks the endpoints). Reliable
    /// results are written into the slot and persisted.
    pub fn calibrate(&self) -> HashMap<usize, Result<OffsetEstimate, correlator::CorrelateError>> {
        let mut slot_endpoints: HashMap<usize, CorrelationPair> = HashMap::new();
        for pair in self.pairs() {
            slot_endpoints.entry(pair.offset_index).or_insert(pair);
        }

        let mut results = HashMap::new();
        for (slot, pair) in slot_endpoints {
            let a = self.endpoint_snapshot(pair.source_a, pair.channel_a);
            let b = self.endpoint_snapshot(pair.source_b, pair.channel_b);
            let estimate = correlator::estimate_offset(&a, &b, &self.config.live_fft);
            if let Ok(est) = &estimate {
                if est.reliable {
                    self.set_offset(slot, est.offset_ps);
                } else {
                    tracing::warn!(
                        "slot {}: estimate {} ps not reliable ({:?}), keeping old value",
                        slot + 1,
                        est.offset_ps,
                        est.confidence
                    );
                }
            }
            results.insert(slot, estimate);
        }
        results
    }

    fn endpoint_snapshot(&self, endpoint: Endpoint, channel: u8) -> Vec<i64> {
        let buffers = match endpoint {
            Endpoint::Local => &self.local_buffers,
            Endpoint::Remote => &self.remote_buffers,
        };
        channel
            .checked_sub(1)
            .and_then(|i| buffers.get(i as usize))
            .map(|b| b.snapshot())
            .unwrap_or_default()
    }

    // -- peer wiring ---------------------------------------------------------

    fn register_peer_handlers(&self) {
        let weak = self.self_weak.clone();

        let w = weak.clone();
        self.peer.register_handler(protocol::STREAMING_START, move |value| {
            let Some(this) = w.upgrade() else { return };
            let msg: StreamingStart = match serde_json::from_value(value.clone()) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!("malformed STREAMING_START: {}", e);
                    return;
                }
            };
            let channels = if msg.local_save_channels.is_empty() {
                this.default_save_channels.lock().unwrap().clone()
            } else {
                msg.local_save_channels
            };
            let duration = msg.duration_sec.map(Duration::from_secs_f64);
            if let Err(e) = this.begin_recording(duration, channels, false, Vec::new()) {
                tracing::warn!("peer-initiated session failed: {:#}", e);
            }
        });

        let w = weak.clone();
        self.peer.register_handler(protocol::STREAMING_STOP, move |_| {
            if let Some(this) = w.upgrade() {
                this.end_recording(false);
            }
        });

        let w = weak.clone();
        self.peer.register_handler(protocol::TIMESTAMP_BATCH, move |value| {
            let Some(this) = w.upgrade() else { return };
            match serde_json::from_value::<TimestampBatch>(value.clone()) {
                Ok(batch) => this.apply_batch(&batch),
                Err(e) => tracing::warn!("malformed TIMESTAMP_BATCH: {}", e),
            }
        });

        let w = weak.clone();
        self.peer.register_handler(protocol::COUNTER_DATA, move |value| {
            let Some(this) = w.upgrade() else { return };
            if let Some(counters) = value.get("counters").and_then(|c| c.as_array()) {
                let mut stored = this.peer_counters.lock().unwrap();
                for (slot, v) in stored.iter_mut().zip(counters) {
                    *slot = v.as_u64().unwrap_or(0);
                }
            }
        });

        let w = weak.clone();
        self.peer
            .register_handler(protocol::SAVE_SETTINGS_UPDATE, move |value| {
                let Some(this) = w.upgrade() else { return };
                if let Ok(msg) = serde_json::from_value::<SaveSettings>(value.clone()) {
                    // Mirror only: the peer is telling us about its own
                    // setting, not asking us to change ours.
                    *this.peer_save_channels.lock().unwrap() = msg.save_channels;
                }
            });

        let w = weak.clone();
        self.peer
            .register_handler(protocol::SAVE_SETTINGS_REQUEST, move |value| {
                let Some(this) = w.upgrade() else { return };
                if let Ok(msg) = serde_json::from_value::<SaveSettings>(value.clone()) {
                    tracing::info!("peer requests save channels {:?}", msg.save_channels);
                    *this.default_save_channels.lock().unwrap() = msg.save_channels;
                }
            });

        let w = weak.clone();
        self.peer
            .register_handler(protocol::FILE_TRANSFER_REQUEST, move |_| {
                let Some(this) = w.upgrade() else { return };
                let files = this.saved_files();
                let peer = this.peer.clone();
                let transfer = this.transfer.clone();
                // Chunk pacing sleeps; keep it off the receiver thread.
                std::thread::Builder::new()
                    .name("file-send".into())
                    .spawn(move || {
                        let send = |cmd: &str, payload: serde_json::Value| {
                            peer.send_command(cmd, payload)
                        };
                        transfer.handle_transfer_request(&files, &send);
                    })
                    .expect("failed to spawn file sender");
            });

        let w = weak.clone();
        self.peer.register_handler(protocol::FILE_TRANSFER_START, move |value| {
            if let Some(this) = w.upgrade() {
                this.transfer.handle_transfer_start(value);
            }
        });
        let w = weak.clone();
        self.peer.register_handler(protocol::FILE_TRANSFER_CHUNK, move |value| {
            if let Some(this) = w.upgrade() {
                this.transfer.handle_transfer_chunk(value);
            }
        });
        let w = weak.clone();
        self.peer.register_handler(protocol::FILE_TRANSFER_END, move |value| {
            if let Some(this) = w.upgrade() {
                this.transfer.handle_transfer_end(value);
            }
        });
        let w = weak;
        self.peer
            .register_handler(protocol::FILE_TRANSFER_COMPLETE, move |value| {
                if let Some(this) = w.upgrade() {
                    this.transfer.handle_transfer_complete(value);
                }
            });
    }

    /// Ask the peer for its saved files from the last session.
    pub fn request_remote_files(&self) -> bool {
        let peer = self.peer.clone();
        let send = move |cmd: &str, payload: serde_json::Value| peer.send_command(cmd, payload);
        self.transfer.request_remote_files(&send)
    }

    /// The non-empty files this site saved in its most recent session.
    fn saved_files(&self) -> Vec<(u8, PathBuf)> {
        let acquisitions = self.last_acquisitions.lock().unwrap().clone();
        acquisitions
            .into_iter()
            .filter(|acq| {
                std::fs::metadata(&acq.path).map(|m| m.len() > 0).unwrap_or(false)
            })
            .map(|acq| (acq.channel, acq.path))
            .collect()
    }

    /// Stop the session (if any) and close the peer link.
    pub fn shutdown(&self) {
        self.end_recording(false);
        self.peer.close();
    }
}

fn auto_stop_loop(weak: Weak<Coordinator>) {
    loop {
        std::thread::sleep(Duration::from_millis(200));
        let Some(coordinator) = weak.upgrade() else { return };
        let expired = {
            let session = coordinator.session.lock().unwrap();
            match session.as_ref() {
                Some(s) => s.expired(),
                None => return, // stopped by hand
            }
        };
        if expired {
            tracing::info!("session duration elapsed, stopping");
            coordinator.end_recording(true);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{PeerConfig, PeerMode};
    use crate::session::FileTagger;

    fn test_peer() -> Arc<PeerConnection> {
        Arc::new(PeerConnection::new(PeerConfig {
            mode: PeerMode::Server,
            server_ip: "127.0.0.1".into(),
            port: 0,
            psk: "test".into(),
            heartbeat_interval: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(3),
            connect_retries: 3,
        }))
    }

    fn test_coordinator(dir: &std::path::Path, batch_sender: bool) -> Arc<Coordinator> {
        let config = CoordinatorConfig {
            window_ps: 10_000,
            buffer_duration_sec: 1000.0,
            buffer_max_size: 100_000,
            data_dir: dir.to_path_buf(),
            remote_subdir: "remote".into(),
            batch_sender,
            file_chunk_bytes: 256 * 1024,
            file_chunk_delay: Duration::ZERO,
            inter_file_delay: Duration::ZERO,
            live_fft: CorrelationParams { tau_ps: 2048, fft_len: 1 << 14, shift_ps: 0 },
        };
        let tagger = Arc::new(FileTagger::new(dir.to_path_buf()));
        Coordinator::new(config, test_peer(), tagger)
    }

    fn pair_ll(channel_a: u8, channel_b: u8, offset_index: usize) -> CorrelationPair {
        CorrelationPair {
            source_a: Endpoint::Local,
            channel_a,
            source_b: Endpoint::Remote,
            channel_b,
            offset_index,
        }
    }

    #[test]
    fn test_tick_counts_and_windows() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = test_coordinator(dir.path(), false);
        coordinator.set_pairs(vec![pair_ll(1, 1, 0)]);

        coordinator.local_buffers[0].append_array(&[1_000, 50_000], None);
        coordinator.remote_buffers[0].append_array(&[2_000], None);

        let report = coordinator.tick();
        assert_eq!(report.pairs.len(), 1);
        assert_eq!(report.pairs[0].count, 1);
        assert_eq!(report.singles.totals[0], 2);

        let report = coordinator.tick();
        assert_eq!(report.pairs[0].window.len(), 2);

        let counts = coordinator.get_counts();
        assert_eq!(counts[0].count, 1);
    }

    #[test]
    fn test_batch_round_trip_between_sites() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let sender = test_coordinator(dir_a.path(), true);
        let receiver = test_coordinator(dir_b.path(), false);

        sender.local_buffers[1].append_array(&[10, 20, 30], None);
        let batch = sender.build_batch().expect("batch should have data");
        assert_eq!(batch.timestamps["2"].count, 3);

        receiver.apply_batch(&batch);
        assert_eq!(receiver.remote_buffers[1].snapshot(), vec![10, 20, 30]);

        // Nothing new → no batch.
        assert!(sender.build_batch().is_none());

        // New events only ship the delta.
        sender.local_buffers[1].append_array(&[40], None);
        let batch = sender.build_batch().unwrap();
        assert_eq!(batch.timestamps["2"].count, 1);
        receiver.apply_batch(&batch);
        assert_eq!(receiver.remote_buffers[1].snapshot(), vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_session_lifecycle_with_tail() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = test_coordinator(dir.path(), false);

        // Pre-create the channel file so the tail worker starts at its end.
        let path = dir.path().join("timestamps_ch1.bin");
        std::fs::write(&path, b"").unwrap();

        coordinator
            .start_session(None, vec![1], vec![1, 2])
            .unwrap();
        assert!(coordinator.session_active());
        assert!(coordinator.start_session(None, vec![1], vec![]).is_err());

        // Events appended by the "tagger" surface in the local buffer.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&crate::records::encode_record(123, 0));
        bytes.extend_from_slice(&crate::records::encode_record(456, 0));
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        std::io::Write::write_all(&mut f, &bytes).unwrap();
        drop(f);
        for _ in 0..100 {
            if coordinator.local_buffers[0].len() == 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(coordinator.local_buffers[0].snapshot(), vec![123, 456]);

        coordinator.stop_session();
        assert!(!coordinator.session_active());
    }

    #[test]
    fn test_auto_stop_after_duration() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = test_coordinator(dir.path(), false);
        coordinator
            .start_session(Some(Duration::from_millis(100)), vec![], vec![])
            .unwrap();
        assert!(coordinator.session_active());
        for _ in 0..100 {
            if !coordinator.session_active() {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(!coordinator.session_active());
    }

    #[test]
    fn test_calibrate_writes_reliable_slot() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = test_coordinator(dir.path(), false);
        coordinator.set_pairs(vec![pair_ll(1, 1, 2)]);

        // Shared Poisson-ish process with the remote clock 2.048 µs ahead.
        let mut t = 0i64;
        let mut local = Vec::new();
        for step in 0..4000 {
            t += 50_000_000 + (step % 13) * 1_000_000;
            local.push(t);
        }
        let offset = 2048 * 1000;
        let remote: Vec<i64> = local.iter().map(|ts| ts + offset).collect();
        coordinator.local_buffers[0].append_array(&local, None);
        coordinator.remote_buffers[0].append_array(&remote, None);

        let results = coordinator.calibrate();
        let estimate = results[&2].as_ref().expect("estimate should succeed");
        assert!((estimate.offset_ps - offset).abs() <= 2048);
        if estimate.reliable {
            assert_eq!(coordinator.offsets.get(2), Some(estimate.offset_ps));
        }

        // With the offset applied, the pair now counts coincidences.
        let report = coordinator.tick();
        assert!(report.pairs[0].count > 0);
    }
}
