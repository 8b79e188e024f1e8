//! # Windowed Aggregator
//!
//! Rolling counts of a boolean behavioral flag per grouping key, over
//! several trailing time windows at once.
//!
//! Burstiness (failed logins per minute per host) needs a time-indexed
//! window: event density is irregular, so a fixed number of rows says nothing
//! about elapsed time.
//!
//! ## Semantics
//! For an observation at time T, the W-minute count is the sum of the flag
//! over every observation of the same group with timestamp in (T - W, T].
//! Observations sharing timestamp T are all included, whatever their input
//! order.
//!
//! Grouping is an explicit pass that builds one time-ordered series per key;
//! the window function only ever sees a single series, so counts cannot leak
//! between groups. A missing key is its own `unknown` group.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::fmt;

use crate::features::sessionize::UNKNOWN;

/// One point of a per-group time series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    /// Position of the source row in the input.
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Why a window could not be computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowError {
    /// Window length of zero minutes.
    EmptyWindow,

    /// Series timestamps go backwards at this position.
    NonMonotonic { position: usize },
}

impl fmt::Display for WindowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowError::EmptyWindow => write!(f, "window length is zero"),
            WindowError::NonMonotonic { position } => {
                write!(f, "timestamps decrease at series position {}", position)
            }
        }
    }
}

/// Rolling count (and optional rate) columns for one window size, aligned
/// with the input rows.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowColumn {
    pub window_minutes: u32,
    pub count_name: String,
    pub counts: Vec<f64>,
    pub rate_name: Option<String>,
    pub rates: Option<Vec<f64>>,
}

/// Column name of a rolling count.
pub fn count_column(prefix: &str, window_minutes: u32) -> String {
    format!("{}_count_{}m", prefix, window_minutes)
}

/// Column name of a rolling rate.
pub fn rate_column(prefix: &str, window_minutes: u32) -> String {
    format!("{}_rate_{}m", prefix, window_minutes)
}

/// Build one time-ordered series per distinct key.
///
/// `keys`, `timestamps` and `values` are parallel slices. Non-finite values
/// count as 0. Within a series, observations are ordered by timestamp and
/// then by input position.
pub fn group_series(
    keys: &[Option<&str>],
    timestamps: &[DateTime<Utc>],
    values: &[f64],
) -> BTreeMap<String, Vec<Observation>> {
    let mut groups: BTreeMap<String, Vec<Observation>> = BTreeMap::new();
    for (index, ((key, timestamp), value)) in keys.iter().zip(timestamps).zip(values).enumerate() {
        let key = key.filter(|k| !k.is_empty()).unwrap_or(UNKNOWN);
        let value = if value.is_finite() { *value } else { 0.0 };
        groups.entry(key.to_string()).or_default().push(Observation {
            index,
            timestamp: *timestamp,
            value,
        });
    }
    for series in groups.values_mut() {
        series.sort_by_key(|o| (o.timestamp, o.index));
    }
    groups
}

/// Trailing right-closed window sum over one time-ordered series.
///
/// Returns one sum per observation: the total of values with timestamp in
/// (T - window, T] for that observation's T.
pub fn trailing_sum(series: &[Observation], window: Duration) -> Result<Vec<f64>, WindowError> {
    if window <= Duration::zero() {
        return Err(WindowError::EmptyWindow);
    }
    if let Some(position) = series.windows(2).position(|w| w[1].timestamp < w[0].timestamp) {
        return Err(WindowError::NonMonotonic { position: position + 1 });
    }

    let mut prefix = Vec::with_capacity(series.len() + 1);
    prefix.push(0.0);
    for o in series {
        let last = prefix[prefix.len() - 1];
        prefix.push(last + o.value);
    }

    let mut sums = Vec::with_capacity(series.len());
    let mut left = 0usize;
    let mut right = 0usize;
    for o in series {
        // Extend past every observation sharing this timestamp.
        while right < series.len() && series[right].timestamp <= o.timestamp {
            right += 1;
        }
        let start = o.timestamp - window;
        while left < right && series[left].timestamp <= start {
            left += 1;
        }
        sums.push(prefix[right] - prefix[left]);
    }
    Ok(sums)
}

/// Computes rolling flag counts across several window sizes.
#[derive(Debug, Clone)]
pub struct WindowedAggregator {
    windows_minutes: Vec<u32>,
    emit_rates: bool,
}

impl WindowedAggregator {
    pub fn new(windows_minutes: &[u32], emit_rates: bool) -> Self {
        Self {
            windows_minutes: windows_minutes.to_vec(),
            emit_rates,
        }
    }

    /// Column names this aggregator produces for `prefix`, in output order.
    pub fn column_names(&self, prefix: &str) -> Vec<String> {
        let mut names = Vec::new();
        for &w in &self.windows_minutes {
            names.push(count_column(prefix, w));
            if self.emit_rates {
                names.push(rate_column(prefix, w));
            }
        }
        names
    }

    /// Rolling counts of `values` per key, one column set per window size.
    ///
    /// A window that fails to compute is zero-filled and logged; the other
    /// windows are unaffected.
    ///
    /// # Arguments
    /// * `prefix` - Column name prefix, e.g. `login_failed_host`.
    /// * `keys` - Grouping key per row; None is the `unknown` group.
    /// * `timestamps` - Event time per row.
    /// * `values` - Flag value per row.
    pub fn aggregate(
        &self,
        prefix: &str,
        keys: &[Option<&str>],
        timestamps: &[DateTime<Utc>],
        values: &[f64],
    ) -> Vec<WindowColumn> {
        let rows = keys.len().min(timestamps.len()).min(values.len());
        let groups = group_series(&keys[..rows], &timestamps[..rows], &values[..rows]);

        self.windows_minutes
            .iter()
            .map(|&w| {
                let counts = match window_counts(&groups, rows, w) {
                    Ok(counts) => counts,
                    Err(e) => {
                        log::warn!(
                            "[WINDOW] {} over {}m failed ({}), column zero-filled",
                            prefix, w, e
                        );
                        vec![0.0; rows]
                    }
                };
                let (rate_name, rates) = if self.emit_rates {
                    let secs = f64::from(w) * 60.0;
                    let rates = counts
                        .iter()
                        .map(|c| if secs > 0.0 { c / secs } else { 0.0 })
                        .collect();
                    (Some(rate_column(prefix, w)), Some(rates))
                } else {
                    (None, None)
                };
                WindowColumn {
                    window_minutes: w,
                    count_name: count_column(prefix, w),
                    counts,
                    rate_name,
                    rates,
                }
            })
            .collect()
    }
}

fn window_counts(
    groups: &BTreeMap<String, Vec<Observation>>,
    rows: usize,
    window_minutes: u32,
) -> Result<Vec<f64>, WindowError> {
    let window = Duration::minutes(i64::from(window_minutes));
    let mut counts = vec![0.0; rows];
    for series in groups.values() {
        let sums = trailing_sum(series, window)?;
        for (o, sum) in series.iter().zip(sums) {
            counts[o.index] = sum;
        }
    }
    Ok(counts)
}
