//! Recording-session state and the tagger control seam.
//!
//! The hardware time tagger lives behind an external service that arms the
//! requested channels and appends their events to flat binary files. The
//! core only needs two things from it: start (yielding the per-channel file
//! paths to tail) and stop. Everything else about the hardware is someone
//! else's problem.

use anyhow::Result;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// One armed channel: where the tagger service is writing its events.
#[derive(Debug, Clone)]
pub struct Acquisition {
    pub channel: u8,
    pub path: PathBuf,
}

/// Control handle for the external tagger service.
pub trait Tagger: Send + Sync {
    /// Arm the given channels and return one acquisition per channel.
    fn arm(&self, channels: &[u8]) -> Result<Vec<Acquisition>>;
    /// Stop all acquisitions started by the last `arm`.
    fn disarm(&self) -> Result<()>;
}

/// Tagger stub for deployments where the tagger service is armed out of
/// band: reports pre-agreed file paths and never touches hardware.
pub struct FileTagger {
    data_dir: PathBuf,
}

impl FileTagger {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }
}

impl Tagger for FileTagger {
    fn arm(&self, channels: &[u8]) -> Result<Vec<Acquisition>> {
        Ok(channels
            .iter()
            .map(|&channel| Acquisition {
                channel,
                path: self.data_dir.join(format!("timestamps_ch{}.bin", channel)),
            })
            .collect())
    }

    fn disarm(&self) -> Result<()> {
        Ok(())
    }
}

/// One recording window, bounded by STREAMING_START / STREAMING_STOP.
#[derive(Debug, Clone)]
pub struct Session {
    pub started: Instant,
    pub duration: Option<Duration>,
    /// Channels this site persists.
    pub local_save_channels: Vec<u8>,
    /// Channels this site asked the peer to persist.
    pub remote_save_channels: Vec<u8>,
    pub acquisitions: Vec<Acquisition>,
}

impl Session {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn expired(&self) -> bool {
        self.duration.is_some_and(|d| self.started.elapsed() >= d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_tagger_paths() {
        let tagger = FileTagger::new(PathBuf::from("/data"));
        let acqs = tagger.arm(&[1, 3]).unwrap();
        assert_eq!(acqs.len(), 2);
        assert_eq!(acqs[0].path, PathBuf::from("/data/timestamps_ch1.bin"));
        assert_eq!(acqs[1].channel, 3);
        tagger.disarm().unwrap();
    }

    #[test]
    fn test_session_expiry() {
        let session = Session {
            started: Instant::now(),
            duration: Some(Duration::from_millis(1)),
            local_save_channels: vec![1],
            remote_save_channels: vec![],
            acquisitions: vec![],
        };
        std::thread::sleep(Duration::from_millis(5));
        assert!(session.expired());

        let unbounded = Session { duration: None, ..session };
        assert!(!unbounded.expired());
    }
}
