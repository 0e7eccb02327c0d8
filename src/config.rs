//! `site.toml` configuration for pairsync.

use anyhow::{Context, Result};
use coinc_core::correlator::CorrelationParams;
use coinc_core::coordinator::CoordinatorConfig;
use coinc_core::counter::{CorrelationPair, Endpoint};
use coinc_core::peer::{PeerConfig, PeerMode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level site configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SiteConfig {
    /// Peer role: "server" binds the public port, "client" dials it. The
    /// sites are otherwise symmetric.
    #[serde(default = "SiteConfig::default_mode")]
    pub mode: String,
    /// The server site's public address (client mode dials this).
    #[serde(default = "SiteConfig::default_address_server")]
    pub tc_address_server: String,
    /// The client site's address, kept for operator reference/display.
    #[serde(default = "SiteConfig::default_address_client")]
    pub tc_address_client: String,
    /// Address the server binds.
    #[serde(default = "SiteConfig::default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "SiteConfig::default_port")]
    pub port: u16,

    #[serde(default = "SiteConfig::default_heartbeat_interval_sec")]
    pub heartbeat_interval_sec: u64,
    #[serde(default = "SiteConfig::default_handshake_timeout_sec")]
    pub handshake_timeout_sec: u64,
    #[serde(default = "SiteConfig::default_connect_timeout_sec")]
    pub connect_timeout_sec: u64,
    #[serde(default = "SiteConfig::default_send_timeout_sec")]
    pub send_timeout_sec: u64,
    #[serde(default = "SiteConfig::default_connect_retries")]
    pub connect_retries: u32,

    /// Coincidence half-window ±w in picoseconds.
    #[serde(default = "SiteConfig::default_window_ps")]
    pub coincidence_window_ps: i64,
    #[serde(default = "SiteConfig::default_buffer_duration_sec")]
    pub timestamp_buffer_duration_sec: f64,
    #[serde(default = "SiteConfig::default_buffer_max_size")]
    pub timestamp_buffer_max_size: usize,
    #[serde(default = "SiteConfig::default_batch_interval_sec")]
    pub timestamp_batch_interval_sec: f64,
    /// Exactly one site pushes TIMESTAMP_BATCH messages — configured, not
    /// guessed from addresses or roles.
    #[serde(default)]
    pub batch_sender: bool,

    /// Pre-shared authentication secret; override in production.
    #[serde(default = "SiteConfig::default_psk")]
    pub psk: String,
    /// Root for saved timestamp files; `remote_subdir` below receives the
    /// peer's transferred files.
    #[serde(default = "SiteConfig::default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "SiteConfig::default_remote_subdir")]
    pub remote_subdir: String,

    #[serde(default = "SiteConfig::default_file_chunk_bytes")]
    pub file_chunk_bytes: usize,
    #[serde(default = "SiteConfig::default_file_chunk_delay_ms")]
    pub file_chunk_delay_ms: u64,
    #[serde(default = "SiteConfig::default_inter_file_delay_ms")]
    pub inter_file_delay_ms: u64,

    #[serde(default = "FftConfig::offline")]
    pub offline_fft: FftConfig,
    #[serde(default = "FftConfig::live")]
    pub live_fft: FftConfig,

    /// Detector pairs counted each tick.
    #[serde(default)]
    pub pairs: Vec<CorrelationPair>,

    /// Mock-tagger settings for `run --mock`.
    #[serde(default)]
    pub mock: MockConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FftConfig {
    pub tau_ps: u64,
    pub fft_len: usize,
    #[serde(default)]
    pub shift_ps: u64,
}

impl FftConfig {
    fn offline() -> Self {
        let p = CorrelationParams::offline();
        Self { tau_ps: p.tau_ps, fft_len: p.fft_len, shift_ps: p.shift_ps }
    }

    fn live() -> Self {
        let p = CorrelationParams::live();
        Self { tau_ps: p.tau_ps, fft_len: p.fft_len, shift_ps: p.shift_ps }
    }

    pub fn params(&self) -> CorrelationParams {
        CorrelationParams {
            tau_ps: self.tau_ps,
            fft_len: self.fft_len,
            shift_ps: self.shift_ps,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MockConfig {
    /// Singles rate per channel.
    #[serde(default = "MockConfig::default_rate_hz")]
    pub singles_rate_hz: f64,
    /// Planted offset between the channels of a simulated photon pair.
    #[serde(default = "MockConfig::default_pair_offset_ps")]
    pub pair_offset_ps: i64,
}

impl MockConfig {
    fn default_rate_hz() -> f64 { 10_000.0 }
    fn default_pair_offset_ps() -> i64 { 5_000_000 }
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            singles_rate_hz: Self::default_rate_hz(),
            pair_offset_ps: Self::default_pair_offset_ps(),
        }
    }
}

impl SiteConfig {
    fn default_mode() -> String { "server".into() }
    fn default_address_server() -> String { "148.6.27.28".into() }
    fn default_address_client() -> String { "172.26.34.114".into() }
    fn default_listen_addr() -> String { "0.0.0.0".into() }
    fn default_port() -> u16 { 27015 }
    fn default_heartbeat_interval_sec() -> u64 { 5 }
    fn default_handshake_timeout_sec() -> u64 { 30 }
    fn default_connect_timeout_sec() -> u64 { 10 }
    fn default_send_timeout_sec() -> u64 { 3 }
    fn default_connect_retries() -> u32 { 3 }
    fn default_window_ps() -> i64 { 10_000 }
    fn default_buffer_duration_sec() -> f64 { 12.0 }
    fn default_buffer_max_size() -> usize { 10_000_000 }
    fn default_batch_interval_sec() -> f64 { 0.1 }
    fn default_psk() -> String { "MPC320_SECURE_2025".into() }
    fn default_remote_subdir() -> String { "remote".into() }
    fn default_file_chunk_bytes() -> usize { 256 * 1024 }
    fn default_file_chunk_delay_ms() -> u64 { 10 }
    fn default_inter_file_delay_ms() -> u64 { 500 }

    fn default_data_dir() -> PathBuf {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Documents")
            .join("AgodSolt")
            .join("data")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }

    pub fn peer_mode(&self) -> Result<PeerMode> {
        match self.mode.as_str() {
            "server" => Ok(PeerMode::Server),
            "client" => Ok(PeerMode::Client),
            other => anyhow::bail!("mode must be \"server\" or \"client\", got {:?}", other),
        }
    }

    pub fn peer_config(&self) -> Result<PeerConfig> {
        let mode = self.peer_mode()?;
        let server_ip = match mode {
            PeerMode::Server => self.listen_addr.clone(),
            PeerMode::Client => self.tc_address_server.clone(),
        };
        Ok(PeerConfig {
            mode,
            server_ip,
            port: self.port,
            psk: self.psk.clone(),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_sec),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_sec),
            connect_timeout: Duration::from_secs(self.connect_timeout_sec),
            send_timeout: Duration::from_secs(self.send_timeout_sec),
            connect_retries: self.connect_retries,
        })
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            window_ps: self.coincidence_window_ps,
            buffer_duration_sec: self.timestamp_buffer_duration_sec,
            buffer_max_size: self.timestamp_buffer_max_size,
            data_dir: self.data_dir.clone(),
            remote_subdir: self.remote_subdir.clone(),
            batch_sender: self.batch_sender,
            file_chunk_bytes: self.file_chunk_bytes,
            file_chunk_delay: Duration::from_millis(self.file_chunk_delay_ms),
            inter_file_delay: Duration::from_millis(self.inter_file_delay_ms),
            live_fft: self.live_fft.params(),
        }
    }

    /// Returns a config matching the standard two-site deployment.
    pub fn default_example() -> Self {
        let mut cfg: Self = toml::from_str("").expect("defaults are valid");
        cfg.pairs = vec![
            CorrelationPair {
                source_a: Endpoint::Local,
                channel_a: 1,
                source_b: Endpoint::Remote,
                channel_b: 1,
                offset_index: 0,
            },
            CorrelationPair {
                source_a: Endpoint::Local,
                channel_a: 2,
                source_b: Endpoint::Remote,
                channel_b: 2,
                offset_index: 0,
            },
        ];
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_gets_defaults() {
        let cfg: SiteConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.mode, "server");
        assert_eq!(cfg.port, 27015);
        assert_eq!(cfg.coincidence_window_ps, 10_000);
        assert_eq!(cfg.timestamp_buffer_max_size, 10_000_000);
        assert_eq!(cfg.offline_fft.fft_len, 1 << 20);
        assert_eq!(cfg.offline_fft.shift_ps, 100_000_000_000);
        assert_eq!(cfg.live_fft.fft_len, 1 << 17);
        assert!(!cfg.batch_sender);
        assert!(cfg.pairs.is_empty());
    }

    #[test]
    fn test_example_round_trips_through_toml() {
        let example = SiteConfig::default_example();
        let text = toml::to_string_pretty(&example).unwrap();
        let parsed: SiteConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.pairs.len(), 2);
        assert_eq!(parsed.pairs[0].channel_a, 1);
        assert_eq!(parsed.psk, example.psk);
    }

    #[test]
    fn test_client_peer_config_dials_server_address() {
        let cfg: SiteConfig = toml::from_str(
            r#"
            mode = "client"
            tc_address_server = "203.0.113.5"
            port = 4500
            "#,
        )
        .unwrap();
        let peer = cfg.peer_config().unwrap();
        assert_eq!(peer.mode, PeerMode::Client);
        assert_eq!(peer.server_ip, "203.0.113.5");
        assert_eq!(peer.port, 4500);
    }

    #[test]
    fn test_bad_mode_rejected() {
        let cfg: SiteConfig = toml::from_str(r#"mode = "p2p""#).unwrap();
        assert!(cfg.peer_config().is_err());
    }
}
