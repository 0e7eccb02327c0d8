//! The four-slot time-offset table.
//!
//! Each slot holds one scalar picosecond offset ("remote is ahead of local
//! by Δ") plus the wall-clock time it was last written. The counting tick
//! reads slots lock-free; the only writers are the operator and the live
//! calibrator. The table survives restarts as a small JSON record in the
//! data directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

pub const NUM_SLOTS: usize = 4;

#[derive(Default)]
struct Slot {
    offset_ps: AtomicI64,
    set: AtomicBool,
    updated: Mutex<Option<String>>,
}

#[derive(Default)]
pub struct OffsetTable {
    slots: [Slot; NUM_SLOTS],
}

/// On-disk form of one slot. Unset slots serialize with null fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffsetRecord {
    pub offset_ps: Option<i64>,
    pub updated: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OffsetFile {
    offsets: Vec<OffsetRecord>,
}

impl OffsetTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a slot, or `None` while it has never been set.
    pub fn get(&self, index: usize) -> Option<i64> {
        let slot = self.slots.get(index)?;
        if slot.set.load(Ordering::Acquire) {
            Some(slot.offset_ps.load(Ordering::Acquire))
        } else {
            None
        }
    }

    pub fn set(&self, index: usize, offset_ps: i64) {
        let Some(slot) = self.slots.get(index) else {
            return;
        };
        slot.offset_ps.store(offset_ps, Ordering::Release);
        slot.set.store(true, Ordering::Release);
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        *slot.updated.lock().unwrap() = Some(stamp);
        tracing::info!("offset slot {} set to {} ps", index + 1, offset_ps);
    }

    pub fn clear(&self, index: usize) {
        let Some(slot) = self.slots.get(index) else {
            return;
        };
        slot.set.store(false, Ordering::Release);
        *slot.updated.lock().unwrap() = None;
    }

    pub fn updated(&self, index: usize) -> Option<String> {
        self.slots.get(index)?.updated.lock().unwrap().clone()
    }

    pub fn records(&self) -> Vec<OffsetRecord> {
        (0..NUM_SLOTS)
            .map(|i| OffsetRecord {
                offset_ps: self.get(i),
                updated: self.updated(i),
            })
            .collect()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OffsetFile { offsets: self.records() };
        let text = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, text)
            .with_context(|| format!("failed to write offset table: {}", path.display()))?;
        tracing::info!("saved offset table to {}", path.display());
        Ok(())
    }

    /// Load a previously saved table. A missing file is not an error — the
    /// table simply starts empty.
    pub fn load(&self, path: &Path) -> Result<()> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        let file: OffsetFile = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse offset table: {}", path.display()))?;
        for (i, rec) in file.offsets.iter().take(NUM_SLOTS).enumerate() {
            if let Some(ps) = rec.offset_ps {
                self.slots[i].offset_ps.store(ps, Ordering::Release);
                self.slots[i].set.store(true, Ordering::Release);
                *self.slots[i].updated.lock().unwrap() = rec.updated.clone();
            }
        }
        tracing::info!("loaded offset table from {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_slots_read_none() {
        let table = OffsetTable::new();
        for i in 0..NUM_SLOTS {
            assert_eq!(table.get(i), None);
        }
        assert_eq!(table.get(99), None);
    }

    #[test]
    fn test_set_get_clear() {
        let table = OffsetTable::new();
        table.set(1, -5_000_000);
        assert_eq!(table.get(1), Some(-5_000_000));
        assert!(table.updated(1).is_some());
        table.clear(1);
        assert_eq!(table.get(1), None);
        assert!(table.updated(1).is_none());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("time_offsets.json");

        let table = OffsetTable::new();
        table.set(0, 103_000_000);
        table.set(3, -42);
        table.save(&path).unwrap();

        let restored = OffsetTable::new();
        restored.load(&path).unwrap();
        assert_eq!(restored.get(0), Some(103_000_000));
        assert_eq!(restored.get(1), None);
        assert_eq!(restored.get(2), None);
        assert_eq!(restored.get(3), Some(-42));
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let table = OffsetTable::new();
        table
            .load(Path::new("/nonexistent/dir/time_offsets.json"))
            .unwrap();
        assert_eq!(table.get(0), None);
    }
}
