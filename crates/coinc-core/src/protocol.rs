//! Peer wire protocol: command names and payload shapes.
//!
//! Application messages are JSON records with a string `command` field plus
//! command-specific fields, encrypted and newline-framed by the transport.
//! The five handshake-phase records (`type` field instead of `command`) are
//! the only plaintext traffic.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// Application commands (encrypted phase).
pub const HEARTBEAT: &str = "HEARTBEAT";
pub const STREAMING_START: &str = "STREAMING_START";
pub const STREAMING_STOP: &str = "STREAMING_STOP";
pub const TIMESTAMP_BATCH: &str = "TIMESTAMP_BATCH";
pub const COUNTER_DATA: &str = "COUNTER_DATA";
pub const OPTIMIZE_START: &str = "OPTIMIZE_START";
pub const OPTIMIZE_STOP: &str = "OPTIMIZE_STOP";
pub const STATUS_UPDATE: &str = "STATUS_UPDATE";
pub const PROGRESS_UPDATE: &str = "PROGRESS_UPDATE";
pub const SAVE_SETTINGS_UPDATE: &str = "SAVE_SETTINGS_UPDATE";
pub const SAVE_SETTINGS_REQUEST: &str = "SAVE_SETTINGS_REQUEST";
pub const FILE_TRANSFER_REQUEST: &str = "FILE_TRANSFER_REQUEST";
pub const FILE_TRANSFER_START: &str = "FILE_TRANSFER_START";
pub const FILE_TRANSFER_CHUNK: &str = "FILE_TRANSFER_CHUNK";
pub const FILE_TRANSFER_END: &str = "FILE_TRANSFER_END";
pub const FILE_TRANSFER_COMPLETE: &str = "FILE_TRANSFER_COMPLETE";

/// Handshake-phase plaintext record. Tagged by `type` rather than `command`
/// so the two phases cannot be confused on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Handshake {
    #[serde(rename = "PUBLIC_KEY")]
    PublicKey { public_key: String },
    #[serde(rename = "SESSION_KEY")]
    SessionKey { encrypted_key: String },
    #[serde(rename = "SESSION_KEY_ACK")]
    SessionKeyAck {},
    #[serde(rename = "AUTH_CHALLENGE")]
    AuthChallenge { challenge: String },
    #[serde(rename = "AUTH_RESPONSE")]
    AuthResponse { response: String },
}

/// STREAMING_START payload. `local_save_channels` names the channels the
/// *receiver* should persist — each site tells the other what to record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingStart {
    #[serde(default)]
    pub duration_sec: Option<f64>,
    #[serde(default)]
    pub local_save_channels: Vec<u8>,
}

/// One channel's slice of a TIMESTAMP_BATCH: base64(deflate(raw u64 LE
/// absolute picoseconds)) plus the decoded count for cross-checking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEntry {
    pub data: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampBatch {
    /// Channel number (as a string key, "1".."4") → payload.
    pub timestamps: HashMap<String, BatchEntry>,
    /// Sender's wall-clock seconds, for operator diagnostics only.
    pub time: f64,
}

/// Per-channel singles counters for the operator display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterData {
    pub counters: [u64; 4],
}

/// Paddle-subsystem commands are carried verbatim; the core dispatches them
/// to whatever handler the integration registers and interprets nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeCommand {
    pub row_index: usize,
    pub channel: u8,
    pub serial: String,
}

/// SAVE_SETTINGS_UPDATE mirrors the sender's own setting for display;
/// SAVE_SETTINGS_REQUEST asks the recipient to change its local setting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveSettings {
    pub save_channels: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransferStart {
    pub transfer_id: String,
    pub channel: u8,
    pub filename: String,
    pub size: u64,
    pub num_chunks: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransferChunk {
    pub transfer_id: String,
    pub chunk_index: u64,
    /// base64 of up to `file_chunk_bytes` raw file bytes.
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransferEnd {
    pub transfer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransferComplete {
    pub success: bool,
    pub num_files: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Build the on-wire JSON for a command: the payload object with the
/// `command` field spliced in.
pub fn envelope(command: &str, payload: serde_json::Value) -> serde_json::Value {
    let mut obj = match payload {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("payload".into(), other);
            map
        }
    };
    obj.insert("command".into(), serde_json::Value::String(command.into()));
    serde_json::Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_splices_command() {
        let v = envelope(
            STREAMING_START,
            serde_json::to_value(StreamingStart {
                duration_sec: Some(30.0),
                local_save_channels: vec![1, 2],
            })
            .unwrap(),
        );
        assert_eq!(v["command"], "STREAMING_START");
        assert_eq!(v["duration_sec"], 30.0);
        assert_eq!(v["local_save_channels"][1], 2);
    }

    #[test]
    fn test_handshake_tagging() {
        let msg = Handshake::PublicKey { public_key: "PEM".into() };
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains(r#""type":"PUBLIC_KEY""#));
        match serde_json::from_str::<Handshake>(&text).unwrap() {
            Handshake::PublicKey { public_key } => assert_eq!(public_key, "PEM"),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_streaming_start_defaults() {
        let v: StreamingStart = serde_json::from_str("{}").unwrap();
        assert!(v.duration_sec.is_none());
        assert!(v.local_save_channels.is_empty());
    }

    #[test]
    fn test_transfer_complete_omits_missing_error() {
        let msg = FileTransferComplete { success: true, num_files: 2, error: None };
        let text = serde_json::to_string(&msg).unwrap();
        assert!(!text.contains("error"));
    }
}
