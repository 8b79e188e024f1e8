//! # Feature Builder
//!
//! Turns normalized events into one schema-complete `FeatureRow` per event.
//!
//! The corpus is processed one calendar day at a time to bound memory:
//! each day is read, sessionized, windowed and entropy-scored, written to its
//! own partition, and a bounded random sample of it is appended to a combined
//! table for fast iteration.
//!
//! ## Failure policy
//! - Rows with unparseable timestamps are dropped and counted.
//! - A day that cannot be read, or has no usable rows, is skipped with a
//!   logged reason; the remaining days still build.
//! - Zero usable days still produce an empty, schema-valid table.

pub mod entropy;
pub mod flags;
pub mod sessionize;
pub mod windowing;

use chrono::{Duration, NaiveDate};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::store;
use crate::{Event, FeatureConfig, FeatureRow, GeneralConfig, LoganomError, LoganomResult};
use windowing::WindowedAggregator;

/// Bumped whenever the column set or its meaning changes.
pub const FEATURE_SCHEMA_VERSION: u32 = 1;

/// Character entropy of the most informative text field.
pub const TEXT_ENTROPY: &str = "text_entropy";

/// Mean entropy of the whitespace tokens of that same field.
pub const TEXT_TOKEN_ENTROPY: &str = "text_token_entropy";

pub const SAMPLE_FILE: &str = "features_sample.jsonl";
pub const SCHEMA_FILE: &str = "schema.json";
pub const PARTITION_FILE: &str = "part.jsonl";

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// The declared numeric columns of a feature table, in order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeatureSchema {
    pub version: u32,
    pub columns: Vec<String>,
}

impl FeatureSchema {
    /// Columns implied by a feature configuration: each flag, the two entropy
    /// columns, then one window column family per (flag, group, window).
    pub fn from_config(config: &FeatureConfig) -> Self {
        let aggregator = WindowedAggregator::new(&config.window_minutes, config.emit_rates);
        let mut columns: Vec<String> = Vec::new();
        let mut push = |name: String| {
            if !columns.contains(&name) {
                columns.push(name);
            }
        };

        for flag in &config.flags {
            push(flag.name.clone());
        }
        push(TEXT_ENTROPY.to_string());
        push(TEXT_TOKEN_ENTROPY.to_string());
        for flag in &config.flags {
            for field in &config.group_by {
                for name in aggregator.column_names(&window_prefix(&flag.name, field.label())) {
                    push(name);
                }
            }
        }

        Self {
            version: FEATURE_SCHEMA_VERSION,
            columns,
        }
    }

    /// Zero-fill every declared column that is absent or non-finite.
    /// Returns how many values were filled.
    pub fn complete(&self, features: &mut BTreeMap<String, f64>) -> usize {
        let mut filled = 0;
        for column in &self.columns {
            let value = features.entry(column.clone()).or_insert(f64::NAN);
            if !value.is_finite() {
                *value = 0.0;
                filled += 1;
            }
        }
        filled
    }

    /// Check that a row carries every declared column with a finite value.
    pub fn validate(&self, row: &FeatureRow) -> LoganomResult<()> {
        for column in &self.columns {
            match row.features.get(column) {
                None => {
                    return Err(LoganomError::Schema(format!(
                        "v{} row at {} is missing column {}",
                        self.version, row.timestamp, column
                    )))
                }
                Some(v) if !v.is_finite() => {
                    return Err(LoganomError::Schema(format!(
                        "v{} row at {} has non-finite {} = {}",
                        self.version, row.timestamp, column, v
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    pub fn write(&self, path: &Path) -> LoganomResult<()> {
        store::ensure_parent(path)?;
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn read(path: &Path) -> LoganomResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

fn window_prefix(flag: &str, group: &str) -> String {
    format!("{}_{}", flag, group)
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Outcome of a full feature build.
#[derive(Debug, Clone, Default)]
pub struct FeatureBuildSummary {
    pub days_built: usize,
    pub days_skipped: usize,
    pub rows: usize,
    pub dropped_rows: usize,
    pub malformed_lines: usize,
    pub sample_rows: usize,
    pub partitions: Vec<PathBuf>,
    /// Partitions from an earlier build with no usable day this time.
    pub pruned_partitions: usize,
    pub sample_path: PathBuf,
    pub schema_path: PathBuf,
}

/// Rows built for one batch of events.
#[derive(Debug, Clone)]
pub struct BuiltRows {
    pub rows: Vec<FeatureRow>,

    /// First session id not used by this batch.
    pub next_session_id: u64,
}

/// Per-day feature pipeline: sessionize, flag, window, entropy.
pub struct FeatureBuilder {
    config: FeatureConfig,
    schema: FeatureSchema,
    aggregator: WindowedAggregator,
}

impl FeatureBuilder {
    pub fn new(config: &FeatureConfig) -> Self {
        Self {
            config: config.clone(),
            schema: FeatureSchema::from_config(config),
            aggregator: WindowedAggregator::new(&config.window_minutes, config.emit_rates),
        }
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    /// Build feature rows for one batch of events.
    ///
    /// Session ids start at `first_session_id`. Output rows are ordered by
    /// timestamp, then session id.
    pub fn build_rows(&self, mut events: Vec<Event>, first_session_id: u64) -> BuiltRows {
        let timeout =
            crate::duration_from_secs(self.config.session_timeout_secs).unwrap_or(Duration::MAX);
        let session_ids = sessionize::sessionize(&mut events, timeout, first_session_id);
        let next_session_id = session_ids.iter().max().map_or(first_session_id, |m| m + 1);

        let timestamps: Vec<_> = events.iter().map(|e| e.timestamp).collect();
        let mut features: Vec<BTreeMap<String, f64>> = events
            .iter()
            .map(|event| {
                let mut row = BTreeMap::new();
                let text = entropy::informative_text(
                    event.command_line.as_deref(),
                    event.message.as_deref(),
                );
                row.insert(TEXT_ENTROPY.to_string(), entropy::shannon_entropy(text));
                row.insert(
                    TEXT_TOKEN_ENTROPY.to_string(),
                    entropy::avg_token_entropy(text.unwrap_or_default().split_whitespace()),
                );
                row
            })
            .collect();

        for flag in &self.config.flags {
            let values: Vec<f64> = events.iter().map(|e| flag.evaluate(e)).collect();
            for (row, value) in features.iter_mut().zip(&values) {
                row.insert(flag.name.clone(), *value);
            }

            for field in &self.config.group_by {
                let keys: Vec<Option<&str>> = events.iter().map(|e| e.group_value(*field)).collect();
                let prefix = window_prefix(&flag.name, field.label());
                for column in self.aggregator.aggregate(&prefix, &keys, &timestamps, &values) {
                    for (row, count) in features.iter_mut().zip(&column.counts) {
                        row.insert(column.count_name.clone(), *count);
                    }
                    if let (Some(name), Some(rates)) = (&column.rate_name, &column.rates) {
                        for (row, rate) in features.iter_mut().zip(rates) {
                            row.insert(name.clone(), *rate);
                        }
                    }
                }
            }
        }

        let mut rows: Vec<FeatureRow> = events
            .into_iter()
            .zip(session_ids)
            .zip(features)
            .map(|((event, session_id), mut values)| {
                self.schema.complete(&mut values);
                FeatureRow {
                    timestamp: event.timestamp,
                    host: event.host,
                    user: event.user,
                    source_ip: event.source_ip,
                    destination_ip: event.destination_ip,
                    session_id,
                    features: values,
                }
            })
            .collect();
        rows.sort_by_key(|r| (r.timestamp, r.session_id));

        BuiltRows {
            rows,
            next_session_id,
        }
    }

    /// Build the feature table for every event partition under
    /// `general.events_dir`, writing per-day partitions, the combined sample
    /// and the schema under `general.features_dir`.
    pub fn build(&self, general: &GeneralConfig) -> LoganomResult<FeatureBuildSummary> {
        let features_dir = &general.features_dir;
        std::fs::create_dir_all(features_dir)?;

        let schema_path = features_dir.join(SCHEMA_FILE);
        self.schema.write(&schema_path)?;

        let sample_path = features_dir.join(SAMPLE_FILE);
        store::write_jsonl::<FeatureRow>(&sample_path, &[])?;

        let mut summary = FeatureBuildSummary {
            sample_path: sample_path.clone(),
            schema_path,
            ..Default::default()
        };

        let partitions = store::list_event_partitions(&general.events_dir)?;
        let mut rng = StdRng::seed_from_u64(self.config.sample_seed);
        let mut next_session_id = 1u64;

        for (date, files) in &partitions {
            match self.build_day(*date, files, next_session_id, &mut rng, features_dir, &sample_path) {
                Ok(day) => {
                    next_session_id = day.next_session_id;
                    summary.days_built += 1;
                    summary.rows += day.rows;
                    summary.dropped_rows += day.dropped;
                    summary.malformed_lines += day.malformed;
                    summary.sample_rows += day.sampled;
                    summary.partitions.push(day.path);
                }
                Err(e) => {
                    log::warn!("[FEATURES] Skipping day {}: {}", date, e);
                    summary.days_skipped += 1;
                }
            }
        }

        summary.pruned_partitions = prune_stale_partitions(features_dir, &summary.partitions)?;

        if summary.days_built == 0 {
            log::warn!(
                "[FEATURES] No usable event days under {}; wrote an empty feature table",
                general.events_dir.display()
            );
        }
        log::info!(
            "[FEATURES] Built {} rows over {} days ({} skipped, {} rows dropped); sample of {} rows at {}",
            summary.rows,
            summary.days_built,
            summary.days_skipped,
            summary.dropped_rows,
            summary.sample_rows,
            summary.sample_path.display(),
        );

        Ok(summary)
    }

    fn build_day(
        &self,
        date: NaiveDate,
        files: &[PathBuf],
        first_session_id: u64,
        rng: &mut StdRng,
        features_dir: &Path,
        sample_path: &Path,
    ) -> LoganomResult<DayOutcome> {
        let batch = store::read_events(files)?;
        if batch.dropped > 0 {
            log::warn!(
                "[FEATURES] {}: dropped {} rows with missing or unparseable timestamps",
                date, batch.dropped
            );
        }
        if batch.events.is_empty() {
            return Err(LoganomError::Store(format!(
                "no parseable events in {} file(s)",
                files.len()
            )));
        }

        let built = self.build_rows(batch.events, first_session_id);
        for row in &built.rows {
            self.schema.validate(row)?;
        }

        let path = store::partition_dir(features_dir, date).join(PARTITION_FILE);
        store::write_jsonl(&path, &built.rows)?;

        let sample = sample_rows(&built.rows, self.config.sample_rows_per_day, rng);
        store::append_jsonl(sample_path, &sample)?;

        log::info!(
            "[FEATURES] {}: {} rows -> {} ({} sampled)",
            date,
            built.rows.len(),
            path.display(),
            sample.len()
        );

        Ok(DayOutcome {
            path,
            rows: built.rows.len(),
            dropped: batch.dropped,
            malformed: batch.malformed,
            sampled: sample.len(),
            next_session_id: built.next_session_id,
        })
    }
}

struct DayOutcome {
    path: PathBuf,
    rows: usize,
    dropped: usize,
    malformed: usize,
    sampled: usize,
    next_session_id: u64,
}

/// Uniform sample without replacement of up to `limit` rows, kept in their
/// original order.
fn sample_rows<'a>(rows: &'a [FeatureRow], limit: usize, rng: &mut StdRng) -> Vec<&'a FeatureRow> {
    if rows.len() <= limit {
        return rows.iter().collect();
    }
    let mut picked = rand::seq::index::sample(rng, rows.len(), limit).into_vec();
    picked.sort_unstable();
    picked.into_iter().map(|i| &rows[i]).collect()
}

/// Load a feature table and check every row against the schema.
///
/// Rows that violate the schema are skipped with a warning.
pub fn load_feature_table(path: &Path, schema: &FeatureSchema) -> LoganomResult<Vec<FeatureRow>> {
    if !path.exists() {
        return Err(LoganomError::MissingInput {
            stage: "features",
            path: path.to_path_buf(),
        });
    }
    let table = store::read_jsonl::<FeatureRow>(path)?;
    let mut rows = Vec::with_capacity(table.rows.len());
    for row in table.rows {
        match schema.validate(&row) {
            Ok(()) => rows.push(row),
            Err(e) => log::warn!("[FEATURES] {}: {}", path.display(), e),
        }
    }
    Ok(rows)
}

/// Remove feature partitions under `features_dir` that the current build
/// did not write, so skipped or deleted days leave no stale table behind.
fn prune_stale_partitions(features_dir: &Path, written: &[PathBuf]) -> LoganomResult<usize> {
    let mut pruned = 0;
    for entry in std::fs::read_dir(features_dir)? {
        let dir = entry?.path();
        let is_partition = dir.is_dir()
            && dir
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(store::parse_partition_name)
                .is_some();
        let table = dir.join(PARTITION_FILE);
        if !is_partition || !table.is_file() || written.contains(&table) {
            continue;
        }
        std::fs::remove_file(&table)?;
        log::warn!("[FEATURES] Removed stale partition {}", table.display());
        pruned += 1;
    }
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn failed_login(secs: i64, host: &str) -> Event {
        let mut e = Event::at(at(secs));
        e.host = Some(host.to_string());
        e.user = Some("alice".to_string());
        e.event_code = Some("4625".to_string());
        e.source_ip = Some("10.0.0.5".to_string());
        e.destination_ip = Some("10.0.0.1".to_string());
        e.transport = Some("tcp".to_string());
        e
    }

    fn config() -> FeatureConfig {
        FeatureConfig {
            window_minutes: vec![1, 5],
            ..FeatureConfig::default()
        }
    }

    #[test]
    fn test_schema_columns() {
        let schema = FeatureSchema::from_config(&config());
        assert_eq!(schema.version, FEATURE_SCHEMA_VERSION);
        assert_eq!(&schema.columns[..4], &["login_failed", "conn_suspicious", TEXT_ENTROPY, TEXT_TOKEN_ENTROPY]);
        // 2 flags x 2 groups x 2 windows x (count + rate)
        assert_eq!(schema.columns.len(), 4 + 16);
        assert!(schema.columns.contains(&"login_failed_host_count_5m".to_string()));
        assert!(schema.columns.contains(&"conn_suspicious_user_rate_1m".to_string()));
    }

    #[test]
    fn test_complete_zero_fills() {
        let schema = FeatureSchema::from_config(&config());
        let mut values = BTreeMap::new();
        values.insert(TEXT_ENTROPY.to_string(), f64::NAN);
        let filled = schema.complete(&mut values);
        assert_eq!(filled, schema.columns.len());
        assert!(values.values().all(|v| *v == 0.0));
    }

    #[test]
    fn test_validate_rejects_missing_column() {
        let schema = FeatureSchema::from_config(&config());
        let row = FeatureRow {
            timestamp: at(0),
            host: None,
            user: None,
            source_ip: None,
            destination_ip: None,
            session_id: 1,
            features: BTreeMap::new(),
        };
        assert!(matches!(schema.validate(&row), Err(LoganomError::Schema(_))));
    }

    #[test]
    fn test_build_rows_end_to_end_counts() {
        let builder = FeatureBuilder::new(&config());
        let events = vec![failed_login(90, "h1"), failed_login(0, "h1"), failed_login(30, "h1")];
        let built = builder.build_rows(events, 1);

        assert_eq!(built.rows.len(), 3);
        let counts: Vec<f64> = built
            .rows
            .iter()
            .map(|r| r.feature("login_failed_host_count_1m").unwrap())
            .collect();
        assert_eq!(counts, vec![1.0, 2.0, 1.0]);

        let five: Vec<f64> = built
            .rows
            .iter()
            .map(|r| r.feature("login_failed_host_count_5m").unwrap())
            .collect();
        assert_eq!(five, vec![1.0, 2.0, 3.0]);

        // Same 4-tuple, gaps <= 120s: one session.
        assert!(built.rows.iter().all(|r| r.session_id == 1));
        assert_eq!(built.next_session_id, 2);

        for row in &built.rows {
            builder.schema().validate(row).unwrap();
        }
    }

    #[test]
    fn test_host_and_user_counts_are_separate_columns() {
        let builder = FeatureBuilder::new(&config());
        let mut other_user = failed_login(10, "h2");
        other_user.user = Some("alice".to_string());
        let built = builder.build_rows(vec![failed_login(0, "h1"), other_user], 1);

        let last = &built.rows[1];
        assert_eq!(last.feature("login_failed_host_count_1m"), Some(1.0));
        assert_eq!(last.feature("login_failed_user_count_1m"), Some(2.0));
    }

    #[test]
    fn test_entropy_falls_back_to_message() {
        let builder = FeatureBuilder::new(&config());
        let mut with_message = Event::at(at(0));
        with_message.message = Some("abcd".to_string());
        let mut with_cmd = Event::at(at(1));
        with_cmd.command_line = Some("ab".to_string());
        with_cmd.message = Some("abcdefgh".to_string());

        let built = builder.build_rows(vec![with_message, with_cmd], 1);
        assert!((built.rows[0].feature(TEXT_ENTROPY).unwrap() - 2.0).abs() < 1e-12);
        assert!((built.rows[1].feature(TEXT_ENTROPY).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_batch() {
        let builder = FeatureBuilder::new(&config());
        let built = builder.build_rows(vec![], 7);
        assert!(built.rows.is_empty());
        assert_eq!(built.next_session_id, 7);
    }

    #[test]
    fn test_sample_is_bounded_and_ordered() {
        let builder = FeatureBuilder::new(&config());
        let events: Vec<Event> = (0..50).map(|i| failed_login(i * 10, "h1")).collect();
        let built = builder.build_rows(events, 1);
        let mut rng = StdRng::seed_from_u64(42);
        let sample = sample_rows(&built.rows, 10, &mut rng);
        assert_eq!(sample.len(), 10);
        assert!(sample.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_build_with_no_events_writes_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let general = GeneralConfig {
            data_dir: dir.path().to_path_buf(),
            events_dir: dir.path().join("events"),
            features_dir: dir.path().join("features"),
            scores_dir: dir.path().join("scores"),
            logs_dir: dir.path().join("logs"),
        };
        let builder = FeatureBuilder::new(&config());
        let summary = builder.build(&general).unwrap();

        assert_eq!(summary.days_built, 0);
        assert!(summary.sample_path.exists());
        assert_eq!(store::count_lines(&summary.sample_path).unwrap(), 0);
        let schema = FeatureSchema::read(&summary.schema_path).unwrap();
        assert_eq!(&schema, builder.schema());
    }

    #[test]
    fn test_bad_day_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let general = GeneralConfig {
            data_dir: dir.path().to_path_buf(),
            events_dir: dir.path().join("events"),
            features_dir: dir.path().join("features"),
            scores_dir: dir.path().join("scores"),
            logs_dir: dir.path().join("logs"),
        };
        store::write_partitioned_events(&[failed_login(0, "h1")], &general.events_dir, "evtx").unwrap();
        let bad = general.events_dir.join("evtx").join("dt=2024-03-02").join("part.jsonl");
        std::fs::create_dir_all(bad.parent().unwrap()).unwrap();
        std::fs::write(&bad, "{\"@timestamp\": \"garbage\"}\nnot json\n").unwrap();

        let summary = FeatureBuilder::new(&config()).build(&general).unwrap();
        assert_eq!(summary.days_built, 1);
        assert_eq!(summary.days_skipped, 1);
        assert_eq!(summary.rows, 1);

        let schema = FeatureSchema::from_config(&config());
        let rows = load_feature_table(&summary.sample_path, &schema).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_rebuild_prunes_days_no_longer_built() {
        let dir = tempfile::tempdir().unwrap();
        let general = GeneralConfig {
            data_dir: dir.path().to_path_buf(),
            events_dir: dir.path().join("events"),
            features_dir: dir.path().join("features"),
            scores_dir: dir.path().join("scores"),
            logs_dir: dir.path().join("logs"),
        };
        let mut next_day = failed_login(0, "h1");
        next_day.timestamp = next_day.timestamp + Duration::days(1);
        store::write_partitioned_events(&[failed_login(0, "h1"), next_day], &general.events_dir, "evtx")
            .unwrap();

        let builder = FeatureBuilder::new(&config());
        let first = builder.build(&general).unwrap();
        assert_eq!(first.partitions.len(), 2);
        assert_eq!(first.pruned_partitions, 0);

        std::fs::remove_dir_all(general.events_dir.join("evtx").join("dt=2024-03-02")).unwrap();
        let second = builder.build(&general).unwrap();
        assert_eq!(second.days_built, 1);
        assert_eq!(second.pruned_partitions, 1);
        assert!(first.partitions[0].exists());
        assert!(!first.partitions[1].exists());
    }
}
