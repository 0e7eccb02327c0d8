//! FFT cross-correlation offset estimator.
//!
//! Finds the scalar clock offset between the two sites by binning each
//! site's timestamp stream into a length-N circular histogram and locating
//! the peak of the normalized circular cross-correlation. Runs offline on
//! saved files for the initial handshake and, with a reduced lag range, on
//! live buffers during a session.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use serde::Serialize;
use thiserror::Error;

/// Estimator failure modes callers must handle.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorrelateError {
    /// One or both input streams were empty.
    #[error("insufficient data")]
    InsufficientData,
    /// The correlation had zero variance (e.g. both histograms uniform).
    #[error("degenerate correlation")]
    DegenerateCorrelation,
}

/// Binning/FFT geometry. `fft_len` must be a power of two; the detectable
/// lag range is ±`fft_len · tau_ps / 2`.
#[derive(Debug, Clone, Copy)]
pub struct CorrelationParams {
    /// Histogram bin width in picoseconds.
    pub tau_ps: u64,
    /// Number of bins (power of two).
    pub fft_len: usize,
    /// Constant shift applied to every timestamp before binning. Rotates
    /// both histograms equally, steering where the peak lands so it stays
    /// clear of the wrap-around.
    pub shift_ps: u64,
}

impl CorrelationParams {
    /// Offline regime for initial offset discovery: ±8.6 ms lag range.
    pub fn offline() -> Self {
        Self { tau_ps: 2048, fft_len: 1 << 20, shift_ps: 100_000_000_000 }
    }

    /// Live in-session regime: ±268 µs lag range, 1 MB histograms.
    pub fn live() -> Self {
        Self { tau_ps: 4096, fft_len: 1 << 17, shift_ps: 0 }
    }

    /// Maximum unambiguous |offset| this geometry can report, in ps.
    pub fn max_lag_ps(&self) -> i64 {
        (self.fft_len as i64 / 2) * self.tau_ps as i64
    }
}

/// How trustworthy a correlation peak is, from its height in sigma and its
/// margin over the runner-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// A successful offset estimate.
#[derive(Debug, Clone, Serialize)]
pub struct OffsetEstimate {
    /// Offset in picoseconds: positive means the remote clock runs ahead.
    pub offset_ps: i64,
    pub peak_index: usize,
    /// Peak height in units of the correlation's standard deviation.
    pub peak_sigma: f64,
    pub second_peak_sigma: f64,
    /// `peak_sigma / second_peak_sigma`.
    pub peak_ratio: f64,
    pub confidence: Confidence,
    pub reliable: bool,
    /// The peak sits within 5% of the circular boundary — widen the search
    /// window (larger N) or move `shift_ps` before trusting the estimate.
    pub near_edge: bool,
}

/// Bin a timestamp stream into the circular histogram:
/// `bin = ((t + shift) / τ) mod N`.
pub fn build_histogram(timestamps: &[i64], params: &CorrelationParams) -> Vec<f64> {
    let mut hist = vec![0.0f64; params.fft_len];
    let tau = params.tau_ps as i64;
    let n = params.fft_len as i64;
    for &t in timestamps {
        let shifted = t + params.shift_ps as i64;
        let bin = (shifted / tau).rem_euclid(n) as usize;
        hist[bin] += 1.0;
    }
    hist
}

/// Normalized circular cross-correlation of two equal-length histograms:
/// `ifft(fft(a) · conj(fft(b))) / N`, then `(c − μ) / σ` with the sample
/// (N−1) standard deviation.
fn cross_correlate(hist_a: &[f64], hist_b: &[f64]) -> Result<Vec<f64>, CorrelateError> {
    let n = hist_a.len();
    debug_assert_eq!(n, hist_b.len());

    let mut planner = FftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(n);
    let inverse = planner.plan_fft_inverse(n);

    let mut a: Vec<Complex<f64>> = hist_a.iter().map(|&x| Complex::new(x, 0.0)).collect();
    let mut b: Vec<Complex<f64>> = hist_b.iter().map(|&x| Complex::new(x, 0.0)).collect();
    forward.process(&mut a);
    forward.process(&mut b);

    for (x, y) in a.iter_mut().zip(&b) {
        *x *= y.conj();
    }
    inverse.process(&mut a);

    // rustfft leaves the inverse unscaled; one more 1/N matches the
    // conventional ifft so the statistics below are size-independent.
    let scale = 1.0 / (n as f64 * n as f64);
    let corr: Vec<f64> = a.iter().map(|c| c.re * scale).collect();

    let mean = corr.iter().sum::<f64>() / n as f64;
    let var = corr.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
    let std = var.sqrt();
    if std == 0.0 || !std.is_finite() {
        return Err(CorrelateError::DegenerateCorrelation);
    }
    Ok(corr.iter().map(|c| (c - mean) / std).collect())
}

/// Estimate the offset between two timestamp streams.
///
/// Positive result: site B's (remote) clock is ahead; subtracting the offset
/// from remote timestamps aligns them with local ones.
pub fn estimate_offset(
    local: &[i64],
    remote: &[i64],
    params: &CorrelationParams,
) -> Result<OffsetEstimate, CorrelateError> {
    if local.is_empty() || remote.is_empty() {
        return Err(CorrelateError::InsufficientData);
    }

    let hist_local = build_histogram(local, params);
    let hist_remote = build_histogram(remote, params);
    // Operand order sets the sign: with the remote histogram first, a remote
    // clock running ahead peaks at a positive lag, matching the counter's
    // subtract-from-remote convention.
    let corr = cross_correlate(&hist_remote, &hist_local)?;

    let n = params.fft_len;
    let (peak_index, &peak_sigma) = corr
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .expect("correlation is non-empty");

    let second_peak_sigma = corr
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != peak_index)
        .map(|(_, &v)| v)
        .fold(f64::NEG_INFINITY, f64::max);

    let peak_ratio = if second_peak_sigma > 0.0 {
        peak_sigma / second_peak_sigma
    } else {
        f64::INFINITY
    };

    let (confidence, reliable) = if peak_sigma > 4.0 && peak_ratio > 1.5 {
        (Confidence::High, true)
    } else if peak_sigma > 3.0 && peak_ratio > 1.2 {
        (Confidence::Medium, true)
    } else {
        (Confidence::Low, false)
    };

    let edge = n / 20;
    let near_edge = peak_index < edge || peak_index > n - edge;
    if near_edge {
        tracing::warn!(
            "correlation peak at bin {} sits near the circular boundary (N={})",
            peak_index,
            n
        );
    }

    // A peak in the upper half of the circle is a negative lag.
    let tau = params.tau_ps as i64;
    let positive = tau * peak_index as i64;
    let negative = tau * (peak_index as i64 - n as i64);
    let offset_ps = if negative.abs() < positive.abs() { negative } else { positive };

    tracing::info!(
        "offset estimate: {} ps, peak {:.2}σ at bin {}, ratio {:.2}, {:?}",
        offset_ps,
        peak_sigma,
        peak_index,
        peak_ratio,
        confidence
    );

    Ok(OffsetEstimate {
        offset_ps,
        peak_index,
        peak_sigma,
        second_peak_sigma,
        peak_ratio,
        confidence,
        reliable,
        near_edge,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Poisson-ish stream: exponential inter-arrival times at `rate_hz`.
    fn poisson_stream(rng: &mut StdRng, rate_hz: f64, duration_sec: f64) -> Vec<i64> {
        let mean_gap_ps = 1e12 / rate_hz;
        let end = (duration_sec * 1e12) as i64;
        let mut t = 0i64;
        let mut out = Vec::new();
        loop {
            let u: f64 = rng.gen_range(f64::EPSILON..1.0);
            t += (-u.ln() * mean_gap_ps) as i64;
            if t >= end {
                break;
            }
            out.push(t);
        }
        out
    }

    fn small_params() -> CorrelationParams {
        CorrelationParams { tau_ps: 2048, fft_len: 1 << 14, shift_ps: 0 }
    }

    #[test]
    fn test_histogram_counts_all_events() {
        let params = small_params();
        let ts: Vec<i64> = (0..5000).map(|i| i * 7919).collect();
        let hist = build_histogram(&ts, &params);
        let total: f64 = hist.iter().sum();
        assert_eq!(total as usize, ts.len());
    }

    #[test]
    fn test_empty_input_rejected() {
        let params = small_params();
        assert_eq!(
            estimate_offset(&[], &[1, 2, 3], &params).unwrap_err(),
            CorrelateError::InsufficientData
        );
        assert_eq!(
            estimate_offset(&[1, 2, 3], &[], &params).unwrap_err(),
            CorrelateError::InsufficientData
        );
    }

    #[test]
    fn test_degenerate_correlation_rejected() {
        // A single event per side leaves the correlation flat once the two
        // delta histograms miss each other; uniform histograms degenerate.
        let params = CorrelationParams { tau_ps: 1, fft_len: 8, shift_ps: 0 };
        let local: Vec<i64> = (0..8).collect();
        let remote: Vec<i64> = (0..8).collect();
        // Every bin holds exactly one count → zero variance after ifft.
        assert_eq!(
            estimate_offset(&local, &remote, &params).unwrap_err(),
            CorrelateError::DegenerateCorrelation
        );
    }

    #[test]
    fn test_planted_positive_offset_recovered() {
        let mut rng = StdRng::seed_from_u64(7);
        let local = poisson_stream(&mut rng, 10_000.0, 3.0);
        let offset = 5_000_000i64; // remote ahead by 5 µs
        let mut remote: Vec<i64> = local.iter().map(|t| t + offset).collect();
        remote.extend(poisson_stream(&mut rng, 10_000.0, 3.0));
        remote.sort_unstable();

        let params = small_params();
        let est = estimate_offset(&local, &remote, &params).unwrap();
        assert!((est.offset_ps - offset).abs() <= params.tau_ps as i64);
        assert!(matches!(est.confidence, Confidence::High | Confidence::Medium));
        assert!(est.reliable);
    }

    #[test]
    fn test_planted_negative_offset_recovered() {
        let mut rng = StdRng::seed_from_u64(21);
        let base = poisson_stream(&mut rng, 10_000.0, 3.0);
        let offset = -3_000_000i64; // remote behind by 3 µs
        let local: Vec<i64> = base.iter().map(|t| t - offset).collect();
        let remote = base;

        let est = estimate_offset(&local, &remote, &small_params()).unwrap();
        assert!((est.offset_ps - offset).abs() <= small_params().tau_ps as i64);
    }

    #[test]
    fn test_peak_invariant_under_common_shift() {
        let mut rng = StdRng::seed_from_u64(3);
        let local = poisson_stream(&mut rng, 8_000.0, 2.0);
        // Whole-bin offset and shift so the peak index is exactly preserved.
        let remote: Vec<i64> = local.iter().map(|t| t + 488 * 2048).collect();

        let a = estimate_offset(&local, &remote, &small_params()).unwrap();
        let shifted = CorrelationParams { shift_ps: 24_414 * 2048, ..small_params() };
        let b = estimate_offset(&local, &remote, &shifted).unwrap();
        assert_eq!(a.peak_index, b.peak_index);
        assert_eq!(a.offset_ps, b.offset_ps);
    }

    #[test]
    fn test_zero_offset_peaks_at_bin_zero() {
        let mut rng = StdRng::seed_from_u64(11);
        let local = poisson_stream(&mut rng, 8_000.0, 2.0);
        let remote = local.clone();

        let est = estimate_offset(&local, &remote, &small_params()).unwrap();
        assert_eq!(est.peak_index, 0);
        assert_eq!(est.offset_ps, 0);
        assert!(est.near_edge); // bin 0 is on the boundary by definition
    }

    #[test]
    fn test_max_lag_range() {
        let p = CorrelationParams::live();
        assert_eq!(p.max_lag_ps(), (1 << 16) * 4096);
        let p = CorrelationParams::offline();
        assert_eq!(p.max_lag_ps(), (1 << 19) * 2048);
    }
}
