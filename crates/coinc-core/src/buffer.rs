//! Per-channel timestamp ring buffer.
//!
//! One buffer per (site, channel). Producers are the file-tail worker for
//! local channels and the peer batch handler for remote ones; consumers take
//! point-in-time snapshots for coincidence counting. Storage is a
//! pre-allocated array with `start`/`end` cursors so a bulk append costs
//! O(new entries) — the resident prefix is only moved during compaction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::records;

/// Extra capacity beyond `max_size`, so that retention-trimmed space at the
/// front does not force a compaction on every append. Small buffers get
/// proportionally small headroom.
const HEADROOM: usize = 2_000_000;

fn headroom_for(max_size: usize) -> usize {
    HEADROOM.min(max_size)
}

struct Inner {
    ts: Vec<i64>,
    refs: Vec<u64>,
    /// Index of the first valid entry.
    start: usize,
    /// Index one past the last valid entry.
    end: usize,
}

pub struct TimestampBuffer {
    channel: u8,
    max_duration_sec: f64,
    max_size: usize,
    inner: Mutex<Inner>,
    /// Cumulative events ever appended, across retention and clears. Feeds
    /// the singles-rate display.
    total_appended: AtomicU64,
}

impl TimestampBuffer {
    pub fn new(channel: u8, max_duration_sec: f64, max_size: usize) -> Self {
        let cap = max_size + headroom_for(max_size);
        tracing::debug!(
            "timestamp buffer ch{}: max_duration={}s, capacity={}",
            channel,
            max_duration_sec,
            cap
        );
        Self {
            channel,
            max_duration_sec,
            max_size,
            inner: Mutex::new(Inner {
                ts: vec![0; cap],
                refs: vec![0; cap],
                start: 0,
                end: 0,
            }),
            total_appended: AtomicU64::new(0),
        }
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Append raw tagger bytes. `with_ref_index` selects the 16-byte
    /// `(ps_in_second, ref_second)` record form; otherwise bytes are bare
    /// absolute-picosecond u64s. Trailing partial records are dropped — the
    /// tail reader always hands over whole multiples of 16 bytes, so nothing
    /// needs to be carried across calls.
    pub fn append_binary(&self, bytes: &[u8], with_ref_index: bool) {
        if bytes.is_empty() {
            return;
        }
        if with_ref_index {
            let (ts, refs) = records::decode_records(bytes);
            self.append(&ts, Some(&refs));
        } else {
            let ts = records::decode_bare(bytes);
            self.append(&ts, None);
        }
    }

    /// Append already-decoded arrays (the peer batch path). A missing ref
    /// stream is filled with zeros.
    pub fn append_array(&self, ts_ps: &[i64], ref_seconds: Option<&[u64]>) {
        self.append(ts_ps, ref_seconds);
    }

    fn append(&self, ts_ps: &[i64], ref_seconds: Option<&[u64]>) {
        let n = ts_ps.len();
        if n == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.end > inner.start && ts_ps[0] < inner.ts[inner.end - 1] {
            tracing::debug!(
                "ch{}: non-monotonic append ({} < {})",
                self.channel,
                ts_ps[0],
                inner.ts[inner.end - 1]
            );
        }
        self.make_room(&mut inner, n);
        let end = inner.end;
        inner.ts[end..end + n].copy_from_slice(ts_ps);
        match ref_seconds {
            Some(refs) => inner.refs[end..end + n].copy_from_slice(refs),
            None => inner.refs[end..end + n].fill(0),
        }
        inner.end += n;
        self.retain(&mut inner);
        drop(inner);
        self.total_appended.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Ensure space for `needed` more entries. Three paths: tail room is
    /// already there; compact the live range to index 0; regrow.
    fn make_room(&self, inner: &mut Inner, needed: usize) {
        let cap = inner.ts.len();
        if inner.end + needed <= cap {
            return;
        }
        let live = inner.end - inner.start;
        if inner.start > 0 && live + needed <= cap {
            inner.ts.copy_within(inner.start..inner.end, 0);
            inner.refs.copy_within(inner.start..inner.end, 0);
            inner.start = 0;
            inner.end = live;
            return;
        }
        let new_cap = (cap * 2).max(live + needed + headroom_for(self.max_size));
        tracing::debug!("ch{}: regrowing buffer {} → {}", self.channel, cap, new_cap);
        let mut ts = vec![0i64; new_cap];
        let mut refs = vec![0u64; new_cap];
        ts[..live].copy_from_slice(&inner.ts[inner.start..inner.end]);
        refs[..live].copy_from_slice(&inner.refs[inner.start..inner.end]);
        inner.ts = ts;
        inner.refs = refs;
        inner.start = 0;
        inner.end = live;
    }

    /// Drop entries older than `max_duration_sec` behind the newest, then
    /// enforce the size cap. Both are O(log live): the duration cutoff is a
    /// binary search over the (sorted) live range.
    fn retain(&self, inner: &mut Inner) {
        let live = inner.end - inner.start;
        if live == 0 {
            return;
        }
        let cutoff = inner.ts[inner.end - 1]
            - (self.max_duration_sec * records::PS_PER_SECOND as f64) as i64;
        let trim = inner.ts[inner.start..inner.end].partition_point(|&t| t < cutoff);
        if trim > 0 {
            tracing::trace!("ch{}: aging out {} entries", self.channel, trim);
            inner.start += trim;
        }
        if inner.end - inner.start > self.max_size {
            inner.start = inner.end - self.max_size;
        }
    }

    /// Point-in-time copy of the valid range. Callers get a plain sorted
    /// array they can hold without blocking producers.
    pub fn snapshot(&self) -> Vec<i64> {
        let inner = self.inner.lock().unwrap();
        inner.ts[inner.start..inner.end].to_vec()
    }

    /// Snapshot including the ref-second stream.
    pub fn snapshot_with_refs(&self) -> (Vec<i64>, Vec<u64>) {
        let inner = self.inner.lock().unwrap();
        (
            inner.ts[inner.start..inner.end].to_vec(),
            inner.refs[inner.start..inner.end].to_vec(),
        )
    }

    /// Reset cursors; capacity is preserved.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.start = 0;
        inner.end = 0;
        tracing::debug!("ch{}: buffer cleared", self.channel);
    }

    /// Total events appended over the buffer's lifetime (monotonic; clears
    /// and retention do not rewind it).
    pub fn events_total(&self) -> u64 {
        self.total_appended.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.end - inner.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::encode_record;

    fn small_buffer() -> TimestampBuffer {
        // Tiny caps so the retention paths are exercised without megabytes.
        TimestampBuffer::new(1, 1.0, 100)
    }

    #[test]
    fn test_append_binary_snapshot() {
        let buf = small_buffer();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&encode_record(100, 0));
        bytes.extend_from_slice(&encode_record(200, 0));
        bytes.extend_from_slice(&encode_record(0, 1));
        buf.append_binary(&bytes, true);
        assert_eq!(buf.snapshot(), vec![100, 200, 1_000_000_000_000]);
    }

    #[test]
    fn test_partial_record_dropped() {
        let buf = small_buffer();
        let mut bytes = encode_record(42, 0).to_vec();
        bytes.extend_from_slice(&[1, 2, 3]);
        buf.append_binary(&bytes, true);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_duration_retention() {
        let buf = small_buffer();
        // First event 2 s before the second: the 1 s window must drop it.
        buf.append_array(&[0], None);
        buf.append_array(&[2 * records::PS_PER_SECOND], None);
        assert_eq!(buf.snapshot(), vec![2 * records::PS_PER_SECOND]);
    }

    #[test]
    fn test_size_cap() {
        let buf = TimestampBuffer::new(1, 1000.0, 10);
        let ts: Vec<i64> = (0..25).collect();
        buf.append_array(&ts, None);
        let snap = buf.snapshot();
        assert_eq!(snap.len(), 10);
        assert_eq!(snap[0], 15);
        assert_eq!(*snap.last().unwrap(), 24);
    }

    #[test]
    fn test_snapshot_nondecreasing_after_many_appends() {
        let buf = TimestampBuffer::new(2, 1000.0, 1000);
        for batch in 0..50 {
            let ts: Vec<i64> = (0..40).map(|i| batch * 40 + i).collect();
            buf.append_array(&ts, None);
        }
        let snap = buf.snapshot();
        assert!(snap.windows(2).all(|w| w[0] <= w[1]));
        assert!(snap.len() <= 1000);
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let buf = small_buffer();
        buf.append_array(&[1, 2, 3], None);
        buf.clear();
        assert!(buf.is_empty());
        buf.append_array(&[7], None);
        assert_eq!(buf.snapshot(), vec![7]);
    }

    #[test]
    fn test_refs_follow_timestamps() {
        let buf = small_buffer();
        buf.append_array(&[10, 20], Some(&[3, 4]));
        buf.append_array(&[30], None);
        let (ts, refs) = buf.snapshot_with_refs();
        assert_eq!(ts, vec![10, 20, 30]);
        assert_eq!(refs, vec![3, 4, 0]);
    }

    #[test]
    fn test_empty_append_is_noop() {
        let buf = small_buffer();
        buf.append_binary(&[], true);
        buf.append_array(&[], None);
        assert!(buf.is_empty());
    }
}
