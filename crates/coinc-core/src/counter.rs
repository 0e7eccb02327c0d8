//! Coincidence counting between sorted timestamp streams.
//!
//! A coincidence is a local/remote timestamp pair whose difference, after
//! subtracting the per-pair offset from the remote side, lies within
//! ±`window_ps`. A local event contributes at most once no matter how many
//! remote events share its window: a detected photon is a single physical
//! event, and at high accidental rates it would otherwise count itself
//! against every nearby accidental.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::buffer::TimestampBuffer;
use crate::offsets::OffsetTable;

/// Which site's buffer set a pair endpoint reads. A closed two-case sum —
/// there are exactly two sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Local,
    Remote,
}

/// A user-configured detector pairing: two (site, channel) endpoints plus
/// the index of the offset slot that aligns them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationPair {
    pub source_a: Endpoint,
    pub channel_a: u8,
    pub source_b: Endpoint,
    pub channel_b: u8,
    /// Selects one of the four configurable offset slots.
    pub offset_index: usize,
}

/// Count local events with at least one remote partner in
/// `[L[i] − w, L[i] + w]` after the remote stream is shifted back by
/// `offset_ps`. Both inputs must be sorted; the window is inclusive at both
/// ends. O(|L| log |R|) via two binary searches per local event.
pub fn count_coincidences(local: &[i64], remote: &[i64], offset_ps: i64, window_ps: i64) -> u64 {
    if local.is_empty() || remote.is_empty() {
        return 0;
    }
    let mut count = 0u64;
    for &l in local {
        // Bounds in the shifted remote frame, expressed against the raw
        // stream so no shifted copy is materialized.
        let lo = remote.partition_point(|&r| r - offset_ps < l - window_ps);
        let hi = remote.partition_point(|&r| r - offset_ps <= l + window_ps);
        if hi > lo {
            count += 1;
        }
    }
    count
}

/// All-(i,j) pair count over the same window. Not used for live counting
/// (it multi-counts accidentals); kept for offline SNR estimation against
/// the theoretical accidentals rate r_L · r_R · 2w · T.
pub fn count_all_matches(local: &[i64], remote: &[i64], offset_ps: i64, window_ps: i64) -> u64 {
    if local.is_empty() || remote.is_empty() {
        return 0;
    }
    let mut count = 0u64;
    for &l in local {
        let lo = remote.partition_point(|&r| r - offset_ps < l - window_ps);
        let hi = remote.partition_point(|&r| r - offset_ps <= l + window_ps);
        count += (hi - lo) as u64;
    }
    count
}

/// Cap on retained time differences in [`matched_differences`].
const MAX_DIFFERENCES: usize = 1_000_000;

/// Coincidence count plus a sample of `R'[j] − L[i]` differences for the
/// matched local events, for rendering a time-difference histogram. When the
/// matches exceed the retention cap the kept set is a uniform random sample.
pub fn matched_differences(
    local: &[i64],
    remote: &[i64],
    offset_ps: i64,
    window_ps: i64,
) -> (u64, Vec<i64>) {
    if local.is_empty() || remote.is_empty() {
        return (0, Vec::new());
    }
    let mut count = 0u64;
    let mut diffs = Vec::new();
    for &l in local {
        let lo = remote.partition_point(|&r| r - offset_ps < l - window_ps);
        let hi = remote.partition_point(|&r| r - offset_ps <= l + window_ps);
        if hi > lo {
            count += 1;
            for &r in &remote[lo..hi] {
                diffs.push((r - offset_ps) - l);
            }
        }
    }
    if diffs.len() > MAX_DIFFERENCES {
        let mut rng = rand::thread_rng();
        diffs.shuffle(&mut rng);
        diffs.truncate(MAX_DIFFERENCES);
        diffs.sort_unstable();
    }
    (count, diffs)
}

/// Per-pair result of one counting tick.
#[derive(Debug, Clone, Serialize)]
pub struct PairCount {
    pub pair: CorrelationPair,
    pub count: u64,
}

/// Evaluate every configured pair against the two buffer sets.
///
/// Each participating buffer is snapshotted exactly once per call; pairs
/// reuse the snapshots, so a tick observes one consistent point in time per
/// buffer. The offset is applied to the remote endpoint; a pair between two
/// same-site endpoints uses the slot as-is with side B treated as "remote".
pub fn count_pairs(
    pairs: &[CorrelationPair],
    local_buffers: &[std::sync::Arc<TimestampBuffer>; 4],
    remote_buffers: &[std::sync::Arc<TimestampBuffer>; 4],
    offsets: &OffsetTable,
    window_ps: i64,
) -> Vec<PairCount> {
    let mut snapshots: [[Option<Vec<i64>>; 4]; 2] = Default::default();
    let mut snap = |ep: Endpoint, ch: u8| -> Option<()> {
        let (set, bufs) = match ep {
            Endpoint::Local => (0, local_buffers),
            Endpoint::Remote => (1, remote_buffers),
        };
        let idx = ch.checked_sub(1)? as usize;
        if idx >= 4 {
            return None;
        }
        if snapshots[set][idx].is_none() {
            snapshots[set][idx] = Some(bufs[idx].snapshot());
        }
        Some(())
    };
    for p in pairs {
        let _ = snap(p.source_a, p.channel_a);
        let _ = snap(p.source_b, p.channel_b);
    }

    let lookup = |ep: Endpoint, ch: u8| -> &[i64] {
        let set = match ep {
            Endpoint::Local => 0,
            Endpoint::Remote => 1,
        };
        match ch
            .checked_sub(1)
            .and_then(|i| snapshots[set].get(i as usize))
            .and_then(|s| s.as_deref())
        {
            Some(s) => s,
            None => &[],
        }
    };

    pairs
        .iter()
        .map(|&pair| {
            let a = lookup(pair.source_a, pair.channel_a);
            let b = lookup(pair.source_b, pair.channel_b);
            let offset = offsets.get(pair.offset_index).unwrap_or(0);
            PairCount {
                pair,
                count: count_coincidences(a, b, offset, window_ps),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_coincidence() {
        // Remote ahead by 10 ps; w = 0 only matches with the right offset.
        let local = [1_000_000_000i64];
        let remote = [1_000_000_010i64];
        assert_eq!(count_coincidences(&local, &remote, 10, 0), 1);
        assert_eq!(count_coincidences(&local, &remote, 0, 0), 0);
    }

    #[test]
    fn test_at_most_once_per_local() {
        let local = [0i64];
        let remote = [-5i64, 0, 5];
        assert_eq!(count_coincidences(&local, &remote, 0, 10), 1);
        assert_eq!(count_all_matches(&local, &remote, 0, 10), 3);
    }

    #[test]
    fn test_translation_invariance() {
        let local = [100i64, 200, 300];
        let remote = [105i64, 205, 310];
        assert_eq!(count_coincidences(&local, &remote, 0, 6), 2);
        let shifted: Vec<i64> = remote.iter().map(|r| r + 1_000_000).collect();
        assert_eq!(count_coincidences(&local, &shifted, 1_000_000, 6), 2);
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(count_coincidences(&[], &[1, 2], 0, 10), 0);
        assert_eq!(count_coincidences(&[1, 2], &[], 0, 10), 0);
        assert_eq!(count_all_matches(&[], &[], 0, 10), 0);
    }

    #[test]
    fn test_window_inclusive_at_both_ends() {
        let local = [100i64];
        assert_eq!(count_coincidences(&local, &[90], 0, 10), 1);
        assert_eq!(count_coincidences(&local, &[110], 0, 10), 1);
        assert_eq!(count_coincidences(&local, &[89], 0, 10), 0);
        assert_eq!(count_coincidences(&local, &[111], 0, 10), 0);
    }

    #[test]
    fn test_count_bounded_by_local_len() {
        let local: Vec<i64> = (0..50).map(|i| i * 10).collect();
        let remote: Vec<i64> = (0..500).collect();
        assert!(count_coincidences(&local, &remote, 0, 100) <= local.len() as u64);
    }

    #[test]
    fn test_matched_differences_values() {
        let local = [1000i64];
        let remote = [995i64, 1003];
        let (count, diffs) = matched_differences(&local, &remote, 0, 10);
        assert_eq!(count, 1);
        assert_eq!(diffs, vec![-5, 3]);
    }

    #[test]
    fn test_count_pairs_uses_offset_slot() {
        use std::sync::Arc;
        let mk = || {
            [
                Arc::new(TimestampBuffer::new(1, 1000.0, 1000)),
                Arc::new(TimestampBuffer::new(2, 1000.0, 1000)),
                Arc::new(TimestampBuffer::new(3, 1000.0, 1000)),
                Arc::new(TimestampBuffer::new(4, 1000.0, 1000)),
            ]
        };
        let local = mk();
        let remote = mk();
        local[0].append_array(&[1_000_000], None);
        remote[1].append_array(&[1_005_000], None);

        let offsets = OffsetTable::new();
        offsets.set(2, 5_000);

        let pairs = [CorrelationPair {
            source_a: Endpoint::Local,
            channel_a: 1,
            source_b: Endpoint::Remote,
            channel_b: 2,
            offset_index: 2,
        }];
        let counts = count_pairs(&pairs, &local, &remote, &offsets, 100);
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].count, 1);

        // Unset slot falls back to 0 offset → out of window.
        let pairs = [CorrelationPair { offset_index: 3, ..pairs[0] }];
        let counts = count_pairs(&pairs, &local, &remote, &offsets, 100);
        assert_eq!(counts[0].count, 0);
    }
}
