//! # Score Normalizer & Ensembler
//!
//! Fuses the scores of two independently trained detectors into one signal.
//!
//! Detector A drives the join: every A row with a usable score produces one
//! `EnsembleRecord`, paired with the B row nearest in time when one lies within
//! the configured tolerance. Each score is min-max normalized on its own,
//! oriented so larger means more anomalous, then combined with a weighted sum.
//!
//! ## Degradation
//! - A rows without a numeric score are dropped and counted.
//! - Unmatched A rows keep B's contribution at zero (filled before scaling).
//! - Constant or non-finite score vectors normalize to zeros.

pub mod normalize;

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use std::path::Path;

use crate::store::{self, value_to_f64, value_to_string, value_to_timestamp};
use crate::{EnsembleRecord, LoganomConfig, LoganomError, LoganomResult, Polarity, ScoreRecord, ScoringConfig};

/// Keys a detector may use for the event time.
const TIMESTAMP_KEYS: [&str; 2] = ["@timestamp", "timestamp"];

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a detector score table, reading the score from `column`.
///
/// Rows without a parseable timestamp are dropped with a warning. A row whose
/// score field is absent or non-numeric is kept with `score: None`.
pub fn load_score_table(path: &Path, column: &str) -> LoganomResult<Vec<ScoreRecord>> {
    if !path.exists() {
        return Err(LoganomError::MissingInput {
            stage: "ensemble",
            path: path.to_path_buf(),
        });
    }

    let table = store::read_jsonl::<Map<String, Value>>(path)?;
    let mut records = Vec::with_capacity(table.rows.len());
    let mut dropped = 0usize;
    for row in &table.rows {
        match score_record(row, column) {
            Some(record) => records.push(record),
            None => dropped += 1,
        }
    }

    if dropped > 0 {
        log::warn!(
            "[ENSEMBLE] {}: dropped {} rows with missing or unparseable timestamps",
            path.display(),
            dropped
        );
    }
    log::info!("[ENSEMBLE] Loaded {} score rows from {}", records.len(), path.display());
    Ok(records)
}

fn score_record(row: &Map<String, Value>, column: &str) -> Option<ScoreRecord> {
    let timestamp = TIMESTAMP_KEYS
        .iter()
        .find_map(|k| row.get(*k).and_then(value_to_timestamp))?;
    let text = |key: &str| row.get(key).and_then(value_to_string);

    Some(ScoreRecord {
        timestamp,
        host: text("host.name"),
        user: text("user.name"),
        source_ip: text("source.ip"),
        destination_ip: text("destination.ip"),
        session_id: row.get("session.id").and_then(Value::as_u64),
        score: row.get(column).and_then(value_to_f64),
    })
}

// ---------------------------------------------------------------------------
// Join
// ---------------------------------------------------------------------------

/// For each timestamp in `left`, the index of the nearest timestamp in
/// `right` within `tolerance` (inclusive).
///
/// `right` must be sorted ascending. When the nearest earlier and later
/// candidates are equally distant, the earlier one wins.
pub fn join_nearest(
    left: &[DateTime<Utc>],
    right: &[DateTime<Utc>],
    tolerance: Duration,
) -> Vec<Option<usize>> {
    left.iter()
        .map(|&t| {
            // Last index at or before t, first index at or after t.
            let after = right.partition_point(|r| *r < t);
            let before = right.partition_point(|r| *r <= t).checked_sub(1);

            let backward = before.map(|i| (i, t - right[i]));
            let forward = right.get(after).map(|r| (after, *r - t));

            let best = match (backward, forward) {
                (Some(b), Some(f)) => Some(if b.1 <= f.1 { b } else { f }),
                (b, f) => b.or(f),
            };
            best.filter(|(_, d)| *d <= tolerance).map(|(i, _)| i)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Fusion
// ---------------------------------------------------------------------------

/// Fusion parameters lifted from `ScoringConfig`.
#[derive(Debug, Clone, Copy)]
pub struct FusionWeights {
    pub weight_a: f64,
    pub weight_b: f64,
    pub polarity_a: Polarity,
    pub polarity_b: Polarity,
    pub tolerance: Duration,
}

impl From<&ScoringConfig> for FusionWeights {
    fn from(config: &ScoringConfig) -> Self {
        Self {
            weight_a: config.weight_a,
            weight_b: config.weight_b,
            polarity_a: config.polarity_a,
            polarity_b: config.polarity_b,
            tolerance: crate::duration_from_secs(config.join_tolerance_secs).unwrap_or(Duration::MAX),
        }
    }
}

/// Join and fuse two detector tables.
///
/// Output is ordered by A timestamp; identity columns come from A, falling
/// back to the matched B row.
pub fn fuse(a: Vec<ScoreRecord>, mut b: Vec<ScoreRecord>, weights: &FusionWeights) -> Vec<EnsembleRecord> {
    if weights.polarity_a == Polarity::LowerIsAnomalous && weights.polarity_b == Polarity::LowerIsAnomalous {
        log::warn!("[ENSEMBLE] Both detectors are flipped (lower_is_anomalous); check the polarity settings");
    }

    let total = a.len();
    let mut a: Vec<(ScoreRecord, f64)> = a
        .into_iter()
        .filter_map(|r| match r.score {
            Some(s) if s.is_finite() => Some((r, s)),
            _ => None,
        })
        .collect();
    if a.len() < total {
        log::warn!(
            "[ENSEMBLE] Dropped {} detector A rows without a numeric score",
            total - a.len()
        );
    }
    a.sort_by_key(|(r, _)| r.timestamp);

    b.retain(|r| r.score.is_some_and(f64::is_finite));
    b.sort_by_key(|r| r.timestamp);

    let left: Vec<_> = a.iter().map(|(r, _)| r.timestamp).collect();
    let right: Vec<_> = b.iter().map(|r| r.timestamp).collect();
    let matches = join_nearest(&left, &right, weights.tolerance);

    let raw_a: Vec<f64> = a.iter().map(|(_, s)| *s).collect();
    let raw_b: Vec<Option<f64>> = matches
        .iter()
        .map(|m| m.and_then(|i| b[i].score))
        .collect();
    let filled_b: Vec<f64> = raw_b.iter().map(|s| s.unwrap_or(0.0)).collect();

    let norm_a = normalize::min_max(&raw_a);
    let norm_b = normalize::min_max(&filled_b);
    let flip_a = weights.polarity_a == Polarity::LowerIsAnomalous;
    let flip_b = weights.polarity_b == Polarity::LowerIsAnomalous;

    let unmatched = matches.iter().filter(|m| m.is_none()).count();
    if unmatched > 0 {
        log::info!(
            "[ENSEMBLE] {} of {} rows had no detector B partner within {}s",
            unmatched,
            a.len(),
            weights.tolerance.num_seconds()
        );
    }

    a.into_iter()
        .enumerate()
        .map(|(i, (record, score_a))| {
            let partner = matches[i].map(|j| &b[j]);
            let pick = |own: Option<String>, other: Option<&Option<String>>| {
                own.or_else(|| other.and_then(|o| o.clone()))
            };
            let ensemble_score = weights.weight_a * normalize::orient(norm_a[i], flip_a)
                + weights.weight_b * normalize::orient(norm_b[i], flip_b);

            EnsembleRecord {
                timestamp: record.timestamp,
                host: pick(record.host, partner.map(|p| &p.host)),
                user: pick(record.user, partner.map(|p| &p.user)),
                source_ip: pick(record.source_ip, partner.map(|p| &p.source_ip)),
                destination_ip: pick(record.destination_ip, partner.map(|p| &p.destination_ip)),
                session_id: record.session_id.or_else(|| partner.and_then(|p| p.session_id)),
                score_a,
                score_b: raw_b[i],
                score_a_norm: norm_a[i],
                score_b_norm: norm_b[i],
                ensemble_score,
            }
        })
        .collect()
}

/// Load both detector tables, fuse them and write the ensemble table.
///
/// # Returns
/// The fused records, also persisted at `config.ensemble_path()`.
pub fn build_ensemble(config: &LoganomConfig) -> LoganomResult<Vec<EnsembleRecord>> {
    let a = load_score_table(&config.score_a_path(), &config.scoring.score_a_column)?;
    let b = load_score_table(&config.score_b_path(), &config.scoring.score_b_column)?;

    let records = fuse(a, b, &FusionWeights::from(&config.scoring));

    let out = config.ensemble_path();
    store::write_jsonl(&out, &records)?;
    log::info!("[ENSEMBLE] Wrote {} ensemble rows to {}", records.len(), out.display());
    Ok(records)
}

/// Read a previously written ensemble table.
pub fn load_ensemble(path: &Path) -> LoganomResult<Vec<EnsembleRecord>> {
    if !path.exists() {
        return Err(LoganomError::MissingInput {
            stage: "alerts",
            path: path.to_path_buf(),
        });
    }
    Ok(store::read_jsonl::<EnsembleRecord>(path)?.rows)
}
