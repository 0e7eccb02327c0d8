//! File-tail workers feeding the local timestamp buffers.
//!
//! The tagger service appends 16-byte records to one file per recorded
//! channel during a session. A tail worker polls its file, reads whatever
//! appeared since the last poll (whole records only) and pushes it into the
//! channel's buffer. A tagger restart shows up as the file shrinking or
//! vanishing; the worker resumes from offset zero.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::buffer::TimestampBuffer;
use crate::records::RECORD_BYTES;

/// Poll cadence. Low enough that live counts lag the hardware by well under
/// a display tick.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Per-poll read ceiling.
const READ_CHUNK: usize = 256 * 1024;

pub struct TailWorker {
    pub channel: u8,
    pub path: PathBuf,
    buffer: Arc<TimestampBuffer>,
    stop: Arc<AtomicBool>,
}

impl TailWorker {
    pub fn new(
        channel: u8,
        path: PathBuf,
        buffer: Arc<TimestampBuffer>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self { channel, path, buffer, stop }
    }

    /// Start the worker thread. The initial offset is the file's current
    /// size truncated to a whole record, so bytes left over from a previous
    /// session are skipped.
    pub fn spawn(self) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name(format!("tail-ch{}", self.channel))
            .spawn(move || self.run())
            .expect("failed to spawn tail worker")
    }

    fn run(self) {
        let mut offset = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len() / RECORD_BYTES as u64 * RECORD_BYTES as u64,
            Err(_) => 0,
        };
        tracing::info!(
            "tail worker ch{} started on {} at offset {}",
            self.channel,
            self.path.display(),
            offset
        );

        let mut chunk = vec![0u8; READ_CHUNK];
        while !self.stop.load(Ordering::Acquire) {
            match self.poll(&mut chunk, offset) {
                Ok(advanced) => offset = advanced,
                Err(e) => {
                    tracing::debug!("tail ch{}: {} — resetting to offset 0", self.channel, e);
                    offset = 0;
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        tracing::info!("tail worker ch{} stopped", self.channel);
    }

    /// One poll: read up to `READ_CHUNK` whole records past `offset` and
    /// append them. Returns the new offset.
    fn poll(&self, chunk: &mut [u8], offset: u64) -> std::io::Result<u64> {
        let meta = std::fs::metadata(&self.path)?;
        if meta.len() < offset {
            // The tagger restarted and truncated the file.
            tracing::warn!(
                "tail ch{}: file shrank ({} < {}), rereading from start",
                self.channel,
                meta.len(),
                offset
            );
            return Ok(0);
        }
        let available = (meta.len() - offset) as usize;
        let want = available.min(chunk.len()) / RECORD_BYTES * RECORD_BYTES;
        if want == 0 {
            return Ok(offset);
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < want {
            let n = file.read(&mut chunk[read..want])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        // A short read can land mid-record; hand over whole records only.
        let whole = read / RECORD_BYTES * RECORD_BYTES;
        if whole > 0 {
            self.buffer.append_binary(&chunk[..whole], true);
        }
        Ok(offset + whole as u64)
    }
}
