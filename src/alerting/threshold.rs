//! Adaptive cutoff selection.
//!
//! The cutoff is the (1 - contamination) quantile of the finite scores. When
//! too few samples exist for a stable quantile, or when configured, mean plus
//! one sample standard deviation is used instead. The chosen branch is
//! returned as a tagged value so callers can report it.

use std::fmt;

use crate::ThresholdMethod;

/// How the alert cutoff was derived.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdDecision {
    /// Linear-interpolated (1 - contamination) quantile.
    Quantile(f64),

    /// Mean plus one sample standard deviation.
    MeanStd(f64),

    /// No finite scores; nothing can be selected.
    Empty,
}

impl ThresholdDecision {
    /// The numeric cutoff. `Empty` is positive infinity.
    pub fn value(&self) -> f64 {
        match self {
            ThresholdDecision::Quantile(v) | ThresholdDecision::MeanStd(v) => *v,
            ThresholdDecision::Empty => f64::INFINITY,
        }
    }
}

impl fmt::Display for ThresholdDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThresholdDecision::Quantile(v) => write!(f, "quantile {:.6}", v),
            ThresholdDecision::MeanStd(v) => write!(f, "mean+std {:.6}", v),
            ThresholdDecision::Empty => write!(f, "empty (inf)"),
        }
    }
}

/// Decide the alert cutoff for `scores`.
///
/// # Arguments
/// * `scores` - Score column; non-finite values are ignored.
/// * `contamination` - Expected anomalous share, in (0, 1).
/// * `method` - Preferred method.
/// * `min_samples` - Fewer finite scores than this forces mean + std.
pub fn decide_threshold(
    scores: &[f64],
    contamination: f64,
    method: ThresholdMethod,
    min_samples: usize,
) -> ThresholdDecision {
    let mut finite: Vec<f64> = scores.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return ThresholdDecision::Empty;
    }

    match method {
        ThresholdMethod::Quantile if finite.len() >= min_samples => {
            finite.sort_by(f64::total_cmp);
            ThresholdDecision::Quantile(quantile_sorted(&finite, 1.0 - contamination))
        }
        ThresholdMethod::Quantile => {
            log::info!(
                "[ALERTS] Only {} finite scores (< {}); using mean + std instead of the quantile",
                finite.len(),
                min_samples
            );
            ThresholdDecision::MeanStd(mean_plus_std(&finite))
        }
        ThresholdMethod::MeanStd => ThresholdDecision::MeanStd(mean_plus_std(&finite)),
    }
}

/// Linear-interpolated quantile of an ascending, non-empty slice.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    let q = q.clamp(0.0, 1.0);
    let h = (sorted.len() - 1) as f64 * q;
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Mean plus one sample standard deviation. A single value has zero spread.
fn mean_plus_std(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return mean;
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    mean + var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantile_interpolates() {
        let sorted: Vec<f64> = (0..=10).map(f64::from).collect();
        assert!((quantile_sorted(&sorted, 0.95) - 9.5).abs() < 1e-12);
        assert_eq!(quantile_sorted(&sorted, 1.0), 10.0);
        assert_eq!(quantile_sorted(&[4.0], 0.5), 4.0);
    }

    #[test]
    fn test_empty_is_infinite() {
        let d = decide_threshold(&[], 0.05, ThresholdMethod::Quantile, 10);
        assert_eq!(d, ThresholdDecision::Empty);
        assert_eq!(d.value(), f64::INFINITY);

        let d = decide_threshold(&[f64::NAN], 0.05, ThresholdMethod::MeanStd, 10);
        assert_eq!(d, ThresholdDecision::Empty);
    }

    #[test]
    fn test_small_sample_falls_back() {
        let d = decide_threshold(&[1.0, 2.0, 3.0], 0.05, ThresholdMethod::Quantile, 10);
        // mean 2, sample std 1
        assert_eq!(d, ThresholdDecision::MeanStd(3.0));
    }

    #[test]
    fn test_mean_std_when_configured() {
        let scores: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let d = decide_threshold(&scores, 0.05, ThresholdMethod::MeanStd, 10);
        assert!(matches!(d, ThresholdDecision::MeanStd(_)));
    }

    #[test]
    fn test_single_value_has_no_spread() {
        let d = decide_threshold(&[0.7], 0.05, ThresholdMethod::MeanStd, 1);
        assert_eq!(d.value(), 0.7);
    }
}
