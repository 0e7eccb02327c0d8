//! Simulated tagger service for development without hardware.
//!
//! Writes Poisson-distributed 16-byte timestamp records to the same
//! per-channel files the real tagger service would append to, at the same
//! 10 Hz cadence. Odd/even channel pairs (1,2) and (3,4) share one photon
//! stream with the even channel delayed by a configurable offset, so the
//! whole pipeline — tail readers, counting, offset estimation — can be
//! exercised end to end.

use anyhow::{Context, Result};
use coinc_core::records::{encode_record, PS_PER_SECOND};
use coinc_core::session::{Acquisition, Tagger};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Simulated time generated per batch (0.1 s, i.e. the 10 Hz stream rate).
const BATCH_PS: i64 = PS_PER_SECOND / 10;

pub struct MockTagger {
    data_dir: PathBuf,
    singles_rate_hz: f64,
    pair_offset_ps: i64,
    stop: Mutex<Option<Arc<AtomicBool>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl MockTagger {
    pub fn new(data_dir: PathBuf, singles_rate_hz: f64, pair_offset_ps: i64) -> Self {
        Self {
            data_dir,
            singles_rate_hz,
            pair_offset_ps,
            stop: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
        }
    }
}

impl Tagger for MockTagger {
    fn arm(&self, channels: &[u8]) -> Result<Vec<Acquisition>> {
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("cannot create {}", self.data_dir.display()))?;
        let stop = Arc::new(AtomicBool::new(false));
        let mut acquisitions = Vec::new();
        let mut handles = self.handles.lock().unwrap();

        for &channel in channels {
            let path = self.data_dir.join(format!("timestamps_ch{}.bin", channel));
            // Truncate: a fresh session starts a fresh file.
            std::fs::write(&path, b"")
                .with_context(|| format!("cannot create {}", path.display()))?;
            acquisitions.push(Acquisition { channel, path: path.clone() });

            // Channels of one simulated photon pair share a seed; the even
            // channel sees the same events later by `pair_offset_ps`.
            let seed = (channel as u64 + 1) / 2;
            let offset = if channel % 2 == 0 { self.pair_offset_ps } else { 0 };
            let rate = self.singles_rate_hz;
            let stop_flag = stop.clone();
            let handle = std::thread::Builder::new()
                .name(format!("mock-ch{}", channel))
                .spawn(move || generate_loop(path, seed, rate, offset, stop_flag))
                .expect("failed to spawn mock generator");
            handles.push(handle);
        }

        *self.stop.lock().unwrap() = Some(stop);
        tracing::info!(
            "mock tagger armed: {} channel(s) at {} Hz, pair offset {} ps",
            channels.len(),
            self.singles_rate_hz,
            self.pair_offset_ps
        );
        Ok(acquisitions)
    }

    fn disarm(&self) -> Result<()> {
        if let Some(stop) = self.stop.lock().unwrap().take() {
            stop.store(true, Ordering::Release);
        }
        for handle in self.handles.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        tracing::info!("mock tagger disarmed");
        Ok(())
    }
}

fn generate_loop(path: PathBuf, seed: u64, rate_hz: f64, offset_ps: i64, stop: Arc<AtomicBool>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mean_gap_ps = PS_PER_SECOND as f64 / rate_hz;
    let mut t: i64 = 0;
    let mut horizon: i64 = 0;
    // An event drawn past the batch horizon is held for the next batch.
    let mut pending: Option<i64> = None;

    while !stop.load(Ordering::Acquire) {
        horizon += BATCH_PS;
        let mut bytes = Vec::new();
        loop {
            let event = match pending.take() {
                Some(event) => event,
                None => {
                    let u: f64 = rng.gen_range(f64::EPSILON..1.0);
                    t += (-u.ln() * mean_gap_ps).max(1.0) as i64;
                    t
                }
            };
            if event >= horizon {
                pending = Some(event);
                break;
            }
            let shifted = event + offset_ps;
            if shifted < 0 {
                continue;
            }
            let ref_second = (shifted / PS_PER_SECOND) as u64;
            let ps_in_second = (shifted % PS_PER_SECOND) as u64;
            bytes.extend_from_slice(&encode_record(ps_in_second, ref_second));
        }
        if !bytes.is_empty() {
            match std::fs::OpenOptions::new().append(true).open(&path) {
                Ok(mut file) => {
                    if let Err(e) = file.write_all(&bytes) {
                        tracing::warn!("mock write failed: {}", e);
                    }
                }
                Err(e) => tracing::warn!("mock open failed: {}", e),
            }
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coinc_core::records::read_timestamp_file;

    #[test]
    fn test_mock_writes_paired_streams() {
        let dir = tempfile::tempdir().unwrap();
        let tagger = MockTagger::new(dir.path().to_path_buf(), 100_000.0, 5_000_000);
        let acqs = tagger.arm(&[1, 2]).unwrap();
        assert_eq!(acqs.len(), 2);

        std::thread::sleep(Duration::from_millis(350));
        tagger.disarm().unwrap();

        let (ch1, info1) = read_timestamp_file(&acqs[0].path).unwrap();
        let (ch2, _) = read_timestamp_file(&acqs[1].path).unwrap();
        assert!(info1.num_records > 0, "channel 1 produced no events");
        assert!(!ch2.is_empty(), "channel 2 produced no events");
        assert!(ch1.windows(2).all(|w| w[0] <= w[1]));

        // Shared stream: the delayed channel's events are the base events
        // plus the pair offset.
        let shifted: Vec<i64> = ch1.iter().map(|t| t + 5_000_000).collect();
        let common = ch2.iter().filter(|t| shifted.binary_search(t).is_ok()).count();
        assert!(common > 0, "no paired events between channels");
    }
}
