//! `pairsync run` — the site daemon.
//!
//! Brings up the peer link and a recording session, drives the 2 Hz
//! counting tick and the 10 Hz timestamp batching, and appends periodic
//! metrics snapshots as JSONL. Designed to run under systemd or in a tmux
//! session next to the tagger service.

use anyhow::Result;
use coinc_core::coordinator::{Coordinator, PairTickEntry};
use coinc_core::peer::{PeerConnection, PeerMode};
use coinc_core::session::{FileTagger, Tagger};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::SiteConfig;
use crate::mock::MockTagger;

/// Counting cadence (~2 Hz).
const TICK_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Serialize)]
struct LogEntry<'a> {
    ts: u64,
    started_at: u64,
    peer_connected: bool,
    singles_rates_hz: [f64; 4],
    singles_totals: [u64; 4],
    peer_counters: [u64; 4],
    pairs: &'a [PairTickEntry],
}

pub fn run(
    config: &SiteConfig,
    mock: bool,
    duration: Option<u64>,
    record_channels: Vec<u8>,
    interval_secs: u64,
    log_path: Option<PathBuf>,
) -> Result<()> {
    anyhow::ensure!(
        record_channels.iter().all(|c| (1..=4).contains(c)),
        "channels must be in 1..=4"
    );

    let peer = Arc::new(PeerConnection::new(config.peer_config()?));
    let tagger: Arc<dyn Tagger> = if mock {
        Arc::new(MockTagger::new(
            config.data_dir.clone(),
            config.mock.singles_rate_hz,
            config.mock.pair_offset_ps,
        ))
    } else {
        Arc::new(FileTagger::new(config.data_dir.clone()))
    };
    let coordinator = Coordinator::new(config.coordinator_config(), peer.clone(), tagger);
    coordinator.set_pairs(config.pairs.clone());

    // A server that cannot bind is dead on arrival; a client that cannot
    // reach its peer still counts locally and retries are the operator's
    // call (restart or reconnect from the UI).
    match config.peer_mode()? {
        PeerMode::Server => peer.start()?,
        PeerMode::Client => {
            if let Err(e) = peer.start() {
                tracing::warn!("peer unreachable, continuing standalone: {:#}", e);
            }
        }
    }

    eprintln!(
        "pairsync run — mode={}, channels {:?}, {} pair(s){}",
        config.mode,
        record_channels,
        config.pairs.len(),
        if mock { " [mock tagger]" } else { "" },
    );

    coordinator.start_session(
        duration.map(Duration::from_secs),
        record_channels.clone(),
        record_channels,
    )?;

    let started_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let batch_interval = Duration::from_secs_f64(config.timestamp_batch_interval_sec);
    let log_interval = Duration::from_secs(interval_secs.max(1));
    let mut next_tick = Instant::now();
    let mut next_batch = Instant::now();
    let mut next_log = Instant::now() + log_interval;
    let mut last_report = None;

    loop {
        std::thread::sleep(Duration::from_millis(50));
        let now = Instant::now();

        if now >= next_batch {
            coordinator.send_timestamps();
            next_batch = now + batch_interval;
        }
        if now >= next_tick {
            last_report = Some(coordinator.tick());
            next_tick = now + TICK_INTERVAL;
        }
        if now >= next_log {
            if let Some(report) = &last_report {
                let entry = LogEntry {
                    ts: SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs(),
                    started_at,
                    peer_connected: peer.is_connected(),
                    singles_rates_hz: report.singles.rates_hz,
                    singles_totals: report.singles.totals,
                    peer_counters: coordinator.peer_counters(),
                    pairs: &report.pairs,
                };
                write_entry(&log_path, &entry);
            }
            next_log = now + log_interval;
        }

        // A bounded session ends the run once the auto-stop fires.
        if duration.is_some() && !coordinator.session_active() {
            break;
        }
    }

    coordinator.shutdown();
    eprintln!("pairsync run finished");
    Ok(())
}

fn write_entry(log_path: &Option<PathBuf>, entry: &LogEntry) {
    let Ok(line) = serde_json::to_string(entry) else {
        return;
    };
    match log_path {
        Some(path) => {
            if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
                let _ = writeln!(file, "{}", line);
            }
        }
        None => println!("{}", line),
    }
}
