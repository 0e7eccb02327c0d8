//! Chunked timestamp-file exchange between the sites.
//!
//! After a session the requesting site pulls the peer's saved per-channel
//! files. Files run to tens of MiB, far beyond a single frame, so they move
//! as START / CHUNK… / END per file with base64 payloads, paced to keep the
//! secure channel responsive, and a COMPLETE summary for the batch.
//! `transfer_id` keys concurrent transfers apart.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dashmap::DashMap;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::protocol::{
    self, FileTransferChunk, FileTransferComplete, FileTransferEnd, FileTransferStart,
};

/// The transport seam: `(command, payload) → delivered`. The coordinator
/// passes a closure over the peer connection; tests pass a recorder.
pub type SendFn<'a> = &'a (dyn Fn(&str, serde_json::Value) -> bool + Sync);

type StatusCallback = Box<dyn Fn(&str) + Send + Sync>;

struct IncomingTransfer {
    channel: u8,
    filename: String,
    size: u64,
    num_chunks: u64,
    chunks: std::collections::HashMap<u64, Vec<u8>>,
    started: Instant,
}

pub struct FileTransferManager {
    remote_dir: PathBuf,
    chunk_bytes: usize,
    chunk_delay: Duration,
    inter_file_delay: Duration,
    incoming: DashMap<String, IncomingTransfer>,
    status_cb: Mutex<Option<StatusCallback>>,
}

/// Chunks needed for `size` bytes at `chunk_bytes` per chunk.
pub fn chunk_count(size: u64, chunk_bytes: u64) -> u64 {
    size.div_ceil(chunk_bytes)
}

impl FileTransferManager {
    pub fn new(
        remote_dir: PathBuf,
        chunk_bytes: usize,
        chunk_delay: Duration,
        inter_file_delay: Duration,
    ) -> Self {
        Self {
            remote_dir,
            chunk_bytes,
            chunk_delay,
            inter_file_delay,
            incoming: DashMap::new(),
            status_cb: Mutex::new(None),
        }
    }

    pub fn set_status_callback<F>(&self, cb: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.status_cb.lock().unwrap() = Some(Box::new(cb));
    }

    fn status(&self, text: &str) {
        tracing::info!("{}", text);
        if let Some(cb) = self.status_cb.lock().unwrap().as_ref() {
            cb(text);
        }
    }

    /// Ask the peer for its saved files.
    pub fn request_remote_files(&self, send: SendFn) -> bool {
        self.status("requesting remote timestamp files");
        send(protocol::FILE_TRANSFER_REQUEST, json!({}))
    }

    // -- responder side ------------------------------------------------------

    /// Answer a FILE_TRANSFER_REQUEST: push every non-empty saved file, then
    /// a COMPLETE summary. `files` is (channel, path) for the channels this
    /// session persisted (temporary files are excluded by the caller).
    pub fn handle_transfer_request(&self, files: &[(u8, PathBuf)], send: SendFn) {
        let mut sent = 0usize;
        let mut last_error: Option<String> = None;
        for (channel, path) in files {
            if sent > 0 {
                // Let the receiver finish writing before the next file.
                std::thread::sleep(self.inter_file_delay);
            }
            match self.send_file_chunked(*channel, path, send) {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("failed to send {}: {:#}", path.display(), e);
                    last_error = Some(format!("{:#}", e));
                }
            }
        }
        let complete = FileTransferComplete {
            success: sent > 0,
            num_files: sent,
            error: if sent > 0 { None } else { last_error.or(Some("no files available".into())) },
        };
        send(
            protocol::FILE_TRANSFER_COMPLETE,
            serde_json::to_value(complete).unwrap_or(json!({})),
        );
        tracing::info!("file transfer finished, {} file(s) sent", sent);
    }

    /// Send one file. `Ok(false)` means the file was skipped (empty).
    fn send_file_chunked(&self, channel: u8, path: &Path, send: SendFn) -> anyhow::Result<bool> {
        let bytes = std::fs::read(path)?;
        if bytes.is_empty() {
            tracing::warn!("skipping empty file {}", path.display());
            return Ok(false);
        }
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("timestamps_ch{}.bin", channel));
        let size = bytes.len() as u64;
        let num_chunks = chunk_count(size, self.chunk_bytes as u64);
        let epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let transfer_id = format!("{}_{}_{}", channel, filename, epoch);

        tracing::info!(
            "sending {} ({} bytes) in {} chunks",
            filename,
            size,
            num_chunks
        );
        let start = FileTransferStart {
            transfer_id: transfer_id.clone(),
            channel,
            filename,
            size,
            num_chunks,
        };
        if !send(protocol::FILE_TRANSFER_START, serde_json::to_value(start)?) {
            anyhow::bail!("peer rejected FILE_TRANSFER_START");
        }

        for (index, chunk) in bytes.chunks(self.chunk_bytes).enumerate() {
            let msg = FileTransferChunk {
                transfer_id: transfer_id.clone(),
                chunk_index: index as u64,
                data: BASE64.encode(chunk),
            };
            if !send(protocol::FILE_TRANSFER_CHUNK, serde_json::to_value(msg)?) {
                anyhow::bail!("send failed at chunk {}/{}", index, num_chunks);
            }
            if !self.chunk_delay.is_zero() {
                std::thread::sleep(self.chunk_delay);
            }
        }

        let end = FileTransferEnd { transfer_id };
        if !send(protocol::FILE_TRANSFER_END, serde_json::to_value(end)?) {
            anyhow::bail!("peer rejected FILE_TRANSFER_END");
        }
        Ok(true)
    }

    // -- requester side ------------------------------------------------------

    pub fn handle_transfer_start(&self, value: &serde_json::Value) {
        let msg: FileTransferStart = match serde_json::from_value(value.clone()) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("malformed FILE_TRANSFER_START: {}", e);
                return;
            }
        };
        self.status(&format!(
            "receiving ch{}: {} ({} bytes, {} chunks)",
            msg.channel, msg.filename, msg.size, msg.num_chunks
        ));
        self.incoming.insert(
            msg.transfer_id.clone(),
            IncomingTransfer {
                channel: msg.channel,
                filename: msg.filename,
                size: msg.size,
                num_chunks: msg.num_chunks,
                chunks: std::collections::HashMap::new(),
                started: Instant::now(),
            },
        );
    }

    pub fn handle_transfer_chunk(&self, value: &serde_json::Value) {
        let msg: FileTransferChunk = match serde_json::from_value(value.clone()) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("malformed FILE_TRANSFER_CHUNK: {}", e);
                return;
            }
        };
        let Some(mut transfer) = self.incoming.get_mut(&msg.transfer_id) else {
            tracing::warn!("chunk for unknown transfer {}", msg.transfer_id);
            return;
        };
        let bytes = match BASE64.decode(msg.data.as_bytes()) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("chunk {} is not valid base64: {}", msg.chunk_index, e);
                return;
            }
        };
        transfer.chunks.insert(msg.chunk_index, bytes);
        let received = transfer.chunks.len() as u64;
        if received % 10 == 0 || received == transfer.num_chunks {
            tracing::debug!(
                "transfer {}: {}/{} chunks",
                msg.transfer_id,
                received,
                transfer.num_chunks
            );
        }
    }

    pub fn handle_transfer_end(&self, value: &serde_json::Value) {
        let msg: FileTransferEnd = match serde_json::from_value(value.clone()) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("malformed FILE_TRANSFER_END: {}", e);
                return;
            }
        };
        let Some((_, transfer)) = self.incoming.remove(&msg.transfer_id) else {
            tracing::warn!("END for unknown transfer {}", msg.transfer_id);
            self.status("file transfer aborted: unexpected END");
            return;
        };
        if transfer.chunks.len() as u64 != transfer.num_chunks {
            self.status(&format!(
                "file transfer incomplete: {}/{} chunks",
                transfer.chunks.len(),
                transfer.num_chunks
            ));
            return;
        }

        let mut data = Vec::with_capacity(transfer.size as usize);
        for index in 0..transfer.num_chunks {
            match transfer.chunks.get(&index) {
                Some(chunk) => data.extend_from_slice(chunk),
                None => {
                    self.status(&format!("file transfer missing chunk {}", index));
                    return;
                }
            }
        }
        if data.len() as u64 != transfer.size {
            self.status(&format!(
                "file transfer size mismatch: expected {}, got {}",
                transfer.size,
                data.len()
            ));
            return;
        }

        if let Err(e) = self.write_atomic(&transfer.filename, &data) {
            self.status(&format!("failed to save remote file: {:#}", e));
            return;
        }
        self.status(&format!(
            "saved ch{} file {} ({} bytes in {:.1}s)",
            transfer.channel,
            transfer.filename,
            transfer.size,
            transfer.started.elapsed().as_secs_f64()
        ));
    }

    pub fn handle_transfer_complete(&self, value: &serde_json::Value) {
        let msg: FileTransferComplete = match serde_json::from_value(value.clone()) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("malformed FILE_TRANSFER_COMPLETE: {}", e);
                return;
            }
        };
        if msg.success {
            self.status(&format!("transfer complete ({} files)", msg.num_files));
        } else {
            self.status(&format!(
                "transfer failed: {}",
                msg.error.as_deref().unwrap_or("unknown error")
            ));
        }
    }

    /// Write into the remote directory via a temp file so a crash mid-write
    /// never leaves a truncated file that looks valid.
    fn write_atomic(&self, filename: &str, data: &[u8]) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.remote_dir)?;
        // Keep only the final component; the peer does not get to pick paths.
        let safe_name = Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed.bin".into());
        let final_path = self.remote_dir.join(&safe_name);
        let tmp_path = self.remote_dir.join(format!("{}.part", safe_name));
        std::fs::write(&tmp_path, data)?;
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    /// Received files currently on disk, sorted by name.
    pub fn remote_files(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = std::fs::read_dir(&self.remote_dir)
            .into_iter()
            .flatten()
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|e| e == "bin"))
            .collect();
        out.sort();
        out
    }
}
