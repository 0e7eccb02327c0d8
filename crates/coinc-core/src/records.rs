//! Binary timestamp record codec.
//!
//! The time tagger writes a flat stream of 16-byte records, each two
//! little-endian `u64`s: `(ps_in_second, ref_second)`. The absolute event
//! time is `ps_in_second + ref_second · 10¹²` picoseconds since the shared
//! GPS epoch. File sizes are always a multiple of 16; a trailing partial
//! record is noise and is dropped.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Bytes per on-disk record: `(ps_in_second, ref_second)` as two LE u64s.
pub const RECORD_BYTES: usize = 16;

/// Picoseconds per GPS second.
pub const PS_PER_SECOND: i64 = 1_000_000_000_000;

/// Absolute picoseconds representable in i64: ~9.2×10¹⁸ ps, i.e. an epoch
/// roughly 106 days long.
pub const MAX_ABSOLUTE_PS: i64 = i64::MAX;

/// Combine a record's two fields into absolute picoseconds.
///
/// The product is widened to i128 so an arbitrary `ref_second` (full-range
/// GPS epoch seconds included) never overflows; values past the i64
/// picosecond horizon saturate to [`MAX_ABSOLUTE_PS`] rather than wrap,
/// keeping the stream monotonic.
#[inline]
pub fn absolute_ps(ps_in_second: u64, ref_second: u64) -> i64 {
    let total = ps_in_second as i128 + ref_second as i128 * PS_PER_SECOND as i128;
    if total > MAX_ABSOLUTE_PS as i128 {
        MAX_ABSOLUTE_PS
    } else {
        total as i64
    }
}

/// Encode one record into its 16-byte wire/disk form.
#[inline]
pub fn encode_record(ps_in_second: u64, ref_second: u64) -> [u8; RECORD_BYTES] {
    let mut out = [0u8; RECORD_BYTES];
    out[..8].copy_from_slice(&ps_in_second.to_le_bytes());
    out[8..].copy_from_slice(&ref_second.to_le_bytes());
    out
}

/// Decode a byte slice of `(ps_in_second, ref_second)` records into absolute
/// picoseconds plus the ref-second stream. Trailing bytes that do not
/// complete a record are dropped.
pub fn decode_records(bytes: &[u8]) -> (Vec<i64>, Vec<u64>) {
    let whole = bytes.len() / RECORD_BYTES * RECORD_BYTES;
    if whole < bytes.len() {
        tracing::debug!(
            "dropping {} trailing bytes of a partial record",
            bytes.len() - whole
        );
    }
    let n = whole / RECORD_BYTES;
    let mut ts = Vec::with_capacity(n);
    let mut refs = Vec::with_capacity(n);
    for rec in bytes[..whole].chunks_exact(RECORD_BYTES) {
        let ps = u64::from_le_bytes(rec[..8].try_into().unwrap());
        let r = u64::from_le_bytes(rec[8..].try_into().unwrap());
        ts.push(absolute_ps(ps, r));
        refs.push(r);
    }
    (ts, refs)
}

/// Decode bare absolute-picosecond records (8 bytes each, no ref stream).
/// Used for peer-exchanged batches, which carry absolute values only.
pub fn decode_bare(bytes: &[u8]) -> Vec<i64> {
    let whole = bytes.len() / 8 * 8;
    if whole < bytes.len() {
        tracing::debug!("dropping {} trailing bytes of a partial value", bytes.len() - whole);
    }
    bytes[..whole]
        .chunks_exact(8)
        .map(|b| u64::from_le_bytes(b.try_into().unwrap()) as i64)
        .collect()
}

/// Metadata extracted while reading a timestamp file.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub file_size_bytes: u64,
    pub num_records: usize,
    /// Time covered first→last, in seconds.
    pub span_sec: f64,
    pub first_ps: i64,
    pub last_ps: i64,
    pub mean_rate_hz: f64,
    /// Count of adjacent records where time decreased. Nonzero values point
    /// at counter resets or a misconfigured tagger, not at a broken file.
    pub non_monotonic: usize,
}

/// Read a whole binary timestamp file into absolute picoseconds.
pub fn read_timestamp_file(path: &Path) -> Result<(Vec<i64>, FileInfo)> {
    let mut file = File::open(path)
        .with_context(|| format!("failed to open timestamp file: {}", path.display()))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .with_context(|| format!("failed to read timestamp file: {}", path.display()))?;

    let file_size_bytes = bytes.len() as u64;
    let (ts, _refs) = decode_records(&bytes);

    let non_monotonic = ts.windows(2).filter(|w| w[1] < w[0]).count();
    if non_monotonic > 0 {
        tracing::warn!(
            "{}: {} non-monotonic timestamp steps",
            path.display(),
            non_monotonic
        );
    }

    let (first_ps, last_ps) = match (ts.first(), ts.last()) {
        (Some(&f), Some(&l)) => (f, l),
        _ => (0, 0),
    };
    let span_sec = if ts.len() > 1 {
        (last_ps - first_ps) as f64 / PS_PER_SECOND as f64
    } else {
        0.0
    };
    let mean_rate_hz = if span_sec > 0.0 { ts.len() as f64 / span_sec } else { 0.0 };

    let info = FileInfo {
        file_size_bytes,
        num_records: ts.len(),
        span_sec,
        first_ps,
        last_ps,
        mean_rate_hz,
        non_monotonic,
    };
    tracing::info!(
        "{}: {} records, span {:.2}s, {:.0} Hz",
        path.display(),
        info.num_records,
        info.span_sec,
        info.mean_rate_hz
    );
    Ok((ts, info))
}

/// Read several files and merge their timestamps into one sorted stream.
///
/// Multi-channel offset searches combine every channel a site recorded: the
/// correlation peak is a cross-site property of the photon pairs, not of any
/// one detector, so the channels can be treated as a single stream.
pub fn merge_files(paths: &[&Path]) -> Result<Vec<i64>> {
    anyhow::ensure!(!paths.is_empty(), "no timestamp files given");
    let mut merged = Vec::new();
    for path in paths {
        let (ts, _) = read_timestamp_file(path)?;
        merged.extend(ts);
    }
    merged.sort_unstable();
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_record_round_trip() {
        // ps=500_000_000_000, ref=7 → 7_500_000_000_000 ps, and back.
        let bytes = encode_record(500_000_000_000, 7);
        let (ts, refs) = decode_records(&bytes);
        assert_eq!(ts, vec![7_500_000_000_000]);
        assert_eq!(refs, vec![7]);
        assert_eq!(encode_record(500_000_000_000, refs[0]), bytes);
    }

    #[test]
    fn test_trailing_partial_record_dropped() {
        let mut bytes = encode_record(100, 0).to_vec();
        bytes.extend_from_slice(&[0xAB; 5]);
        let (ts, refs) = decode_records(&bytes);
        assert_eq!(ts.len(), 1);
        assert_eq!(refs.len(), 1);
    }

    #[test]
    fn test_decode_bare() {
        let mut bytes = Vec::new();
        for v in [5u64, 10, 15] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes.push(0xFF); // partial
        assert_eq!(decode_bare(&bytes), vec![5, 10, 15]);
    }

    #[test]
    fn test_absolute_ps_large_ref_second() {
        // Ref seconds far beyond the mock's mod-1000 range stay exact as
        // long as the picosecond total fits i64 (~106 days of epoch).
        let t = absolute_ps(999_999_999_999, 9_000_000);
        assert_eq!(t, 999_999_999_999 + 9_000_000 * PS_PER_SECOND);
    }

    #[test]
    fn test_absolute_ps_saturates_past_horizon() {
        // Full-range epoch seconds (here: seconds since 1980) exceed the
        // i64 picosecond horizon; the conversion must clamp, not wrap or
        // panic, and must stay monotonic across the boundary.
        let clamped = absolute_ps(999_999_999_999, 1_400_000_000);
        assert_eq!(clamped, MAX_ABSOLUTE_PS);
        assert!(absolute_ps(0, 9_000_000) < clamped);
        assert_eq!(absolute_ps(u64::MAX, u64::MAX), MAX_ABSOLUTE_PS);
    }

    #[test]
    fn test_read_file_info() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timestamps_ch1.bin");
        let mut f = File::create(&path).unwrap();
        // Two events one second apart, then one out-of-order event.
        f.write_all(&encode_record(0, 10)).unwrap();
        f.write_all(&encode_record(0, 11)).unwrap();
        f.write_all(&encode_record(500, 10)).unwrap();
        drop(f);

        let (ts, info) = read_timestamp_file(&path).unwrap();
        assert_eq!(ts.len(), 3);
        assert_eq!(info.num_records, 3);
        assert_eq!(info.non_monotonic, 1);
        assert_eq!(info.file_size_bytes, 48);
    }

    #[test]
    fn test_merge_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = dir.path().join("a.bin");
        let p2 = dir.path().join("b.bin");
        std::fs::write(&p1, encode_record(300, 0)).unwrap();
        let mut b = encode_record(100, 0).to_vec();
        b.extend_from_slice(&encode_record(200, 0));
        std::fs::write(&p2, b).unwrap();

        let merged = merge_files(&[p1.as_path(), p2.as_path()]).unwrap();
        assert_eq!(merged, vec![100, 200, 300]);
    }
}
