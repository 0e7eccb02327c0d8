//! `pairsync inspect` — timestamp-file diagnostics.
//!
//! Quick integrity readout for one binary file: record count, time span,
//! mean rate, ordering violations, and trailing bytes that do not form a
//! whole record (a tagger service killed mid-write leaves those).

use anyhow::Result;
use coinc_core::records::{self, RECORD_BYTES};
use std::path::Path;

pub fn run(file: &Path) -> Result<()> {
    let size = std::fs::metadata(file)?.len();
    let trailing = size % RECORD_BYTES as u64;

    let (ts, info) = records::read_timestamp_file(file)?;

    println!("File:            {}", file.display());
    println!("Size:            {} bytes ({:.1} MiB)", size, size as f64 / (1024.0 * 1024.0));
    println!("Records:         {}", info.num_records);
    if trailing != 0 {
        println!("Trailing bytes:  {} (partial record, ignored)", trailing);
    }
    if info.num_records == 0 {
        println!("File holds no complete records.");
        return Ok(());
    }

    println!(
        "First event:     {} ps  (ref second {})",
        info.first_ps,
        info.first_ps / records::PS_PER_SECOND
    );
    println!(
        "Last event:      {} ps  (ref second {})",
        info.last_ps,
        info.last_ps / records::PS_PER_SECOND
    );
    println!("Span:            {:.3} s", info.span_sec);
    println!("Mean rate:       {:.0} Hz", info.mean_rate_hz);

    if info.non_monotonic == 0 {
        println!("Ordering:        monotonic");
    } else {
        println!(
            "Ordering:        {} decreasing steps — counter resets or wrong record format?",
            info.non_monotonic
        );
    }

    let preview: Vec<i64> = ts.iter().take(5).copied().collect();
    println!("Head:            {:?}", preview);
    Ok(())
}
