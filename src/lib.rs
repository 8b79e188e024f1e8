//! # loganom - Core Library
//!
//! Batch anomaly pipeline for normalized security logs.
//!
//! loganom turns normalized security events into per-entity behavioral
//! features, fuses the scores of two independently trained detectors into a
//! single ensemble signal, selects a bounded set of high-priority alerts with
//! an adaptive threshold, and evaluates those alerts against a declarative
//! response policy with an append-only audit trail.
//!
//! ## Pipeline
//! ```text
//! events -> features (sessionize + windowing + entropy)
//!        -> [detector A, detector B: external]
//!        -> ensemble -> alerts -> response -> audit log
//! ```
//!
//! ## Design Philosophy
//! - **Degrade, don't drop.** Malformed rows and days are skipped with a logged
//!   reason; numeric degeneracy maps to neutral values; only a missing
//!   prerequisite stops a stage.
//! - **One config, passed down.** Every component receives its settings from a
//!   single `LoganomConfig` built once per run.
//! - **Append only.** The audit log is never truncated or rewritten.

pub mod alerting;
pub mod custody;
pub mod features;
pub mod response;
pub mod scoring;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::features::flags::FlagRule;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Unified error type for loganom.
#[derive(Error, Debug)]
pub enum LoganomError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Schema violation: {0}")]
    Schema(String),

    #[error("Policy error: {0}")]
    Policy(String),

    #[error("Response error: {0}")]
    Response(String),

    /// A stage prerequisite (feature table, detector scores, ...) does not exist.
    #[error("{stage}: required input not found: {}", path.display())]
    MissingInput { stage: &'static str, path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type LoganomResult<T> = Result<T, LoganomError>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Top-level configuration for a loganom run.
///
/// Loaded from `loganom.toml` in the working directory or a path supplied via
/// CLI flag. Every section falls back to its defaults when omitted.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoganomConfig {
    /// Data directory layout.
    pub general: GeneralConfig,

    /// Feature builder settings.
    pub features: FeatureConfig,

    /// Detector score fusion settings.
    pub scoring: ScoringConfig,

    /// Threshold and alert selection settings.
    pub alerting: AlertingConfig,

    /// Response engine settings.
    pub response: ResponseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Root of all persisted pipeline data.
    pub data_dir: PathBuf,

    /// Normalized events, partitioned as `<source>/dt=YYYY-MM-DD/*.jsonl`.
    pub events_dir: PathBuf,

    /// Feature tables (per-day partitions, combined sample, schema).
    pub features_dir: PathBuf,

    /// Detector score tables and the ensemble table.
    pub scores_dir: PathBuf,

    /// Run logs.
    pub logs_dir: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            events_dir: PathBuf::from("./data/events"),
            features_dir: PathBuf::from("./data/features"),
            scores_dir: PathBuf::from("./data/scores"),
            logs_dir: PathBuf::from("./data/logs"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Inactivity gap (seconds) after which a flow starts a new session.
    pub session_timeout_secs: u64,

    /// Trailing window sizes in minutes for rolling flag counts.
    pub window_minutes: Vec<u32>,

    /// Entity fields each flag is windowed over, independently.
    pub group_by: Vec<GroupField>,

    /// Emit `<flag>_<group>_rate_<w>m` columns next to the counts.
    pub emit_rates: bool,

    /// Upper bound on rows kept from each day for the combined sample.
    pub sample_rows_per_day: usize,

    /// Seed for the per-day sample so repeated builds are identical.
    pub sample_seed: u64,

    /// Declared boolean behavioral flags.
    pub flags: Vec<FlagRule>,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: 120,
            window_minutes: vec![1, 5, 15],
            group_by: vec![GroupField::Host, GroupField::User],
            emit_rates: true,
            sample_rows_per_day: 100_000,
            sample_seed: 42,
            flags: features::flags::default_flag_rules(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Detector A score table, relative to `scores_dir`.
    pub score_a_file: PathBuf,

    /// Detector B score table, relative to `scores_dir`.
    pub score_b_file: PathBuf,

    /// Name of the score field in detector A rows.
    pub score_a_column: String,

    /// Name of the score field in detector B rows.
    pub score_b_column: String,

    /// Weight of detector A in the fused score.
    pub weight_a: f64,

    /// Weight of detector B in the fused score. Weights need not sum to 1.
    pub weight_b: f64,

    /// Native score convention of detector A.
    pub polarity_a: Polarity,

    /// Native score convention of detector B.
    pub polarity_b: Polarity,

    /// Maximum timestamp distance (seconds) for pairing A and B rows.
    pub join_tolerance_secs: u64,

    /// Ensemble output table, relative to `scores_dir`.
    pub output_file: PathBuf,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            score_a_file: PathBuf::from("scores.jsonl"),
            score_b_file: PathBuf::from("lstm_scores.jsonl"),
            score_a_column: "anom.score".to_string(),
            score_b_column: "lstm.mse".to_string(),
            weight_a: 0.5,
            weight_b: 0.5,
            polarity_a: Polarity::LowerIsAnomalous,
            polarity_b: Polarity::HigherIsAnomalous,
            join_tolerance_secs: 60,
            output_file: PathBuf::from("ensemble_scores.jsonl"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    /// Expected share of anomalous records; the cutoff is its upper quantile.
    pub contamination: f64,

    /// Maximum number of alerts selected per run.
    pub top_n: usize,

    /// Preferred threshold method.
    pub threshold_method: ThresholdMethod,

    /// Below this many finite scores the quantile is considered unstable and
    /// mean + one standard deviation is used instead.
    pub min_quantile_samples: usize,

    /// Which ensemble column alerts are ranked by.
    pub score_column: ScoreColumn,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            contamination: 0.05,
            top_n: 10,
            threshold_method: ThresholdMethod::Quantile,
            min_quantile_samples: 10,
            score_column: ScoreColumn::EnsembleScore,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseConfig {
    /// Record action descriptions without invoking anything.
    pub dry_run: bool,

    /// Policy document (YAML, TOML or JSON). Missing file = built-in default rule.
    pub policy_path: PathBuf,

    /// Append-only NDJSON audit log.
    pub audit_log_path: PathBuf,

    /// Timeout for `webhook` actions.
    pub webhook_timeout_secs: u64,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            policy_path: PathBuf::from("./config/policy.yaml"),
            audit_log_path: PathBuf::from("./data/logs/actions.jsonl"),
            webhook_timeout_secs: 5,
        }
    }
}

impl LoganomConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> LoganomResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: LoganomConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default configuration to a TOML file.
    pub fn write_default(path: &Path) -> LoganomResult<()> {
        let config = Self::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| LoganomError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings no stage can honor.
    pub fn validate(&self) -> LoganomResult<()> {
        let c = self.alerting.contamination;
        if !(c > 0.0 && c < 1.0) {
            return Err(LoganomError::Config(format!(
                "alerting.contamination must be in (0, 1), got {}",
                c
            )));
        }
        if self.alerting.top_n == 0 {
            return Err(LoganomError::Config("alerting.top_n must be at least 1".to_string()));
        }
        if let Some(w) = self.features.window_minutes.iter().find(|w| **w == 0) {
            return Err(LoganomError::Config(format!(
                "features.window_minutes contains an empty window ({}m)",
                w
            )));
        }
        if self.features.session_timeout_secs == 0 {
            return Err(LoganomError::Config(
                "features.session_timeout_secs must be positive".to_string(),
            ));
        }
        for (name, secs) in [
            ("features.session_timeout_secs", self.features.session_timeout_secs),
            ("scoring.join_tolerance_secs", self.scoring.join_tolerance_secs),
        ] {
            if duration_from_secs(secs).is_none() {
                return Err(LoganomError::Config(format!(
                    "{} is out of range, got {}",
                    name, secs
                )));
            }
        }
        for (name, w) in [("weight_a", self.scoring.weight_a), ("weight_b", self.scoring.weight_b)] {
            if !w.is_finite() || w < 0.0 {
                return Err(LoganomError::Config(format!(
                    "scoring.{} must be a non-negative number, got {}",
                    name, w
                )));
            }
        }
        Ok(())
    }

    pub fn score_a_path(&self) -> PathBuf {
        self.general.scores_dir.join(&self.scoring.score_a_file)
    }

    pub fn score_b_path(&self) -> PathBuf {
        self.general.scores_dir.join(&self.scoring.score_b_file)
    }

    pub fn ensemble_path(&self) -> PathBuf {
        self.general.scores_dir.join(&self.scoring.output_file)
    }
}

/// Seconds from configuration as a chrono duration. `None` when the value
/// is beyond what chrono can represent.
pub fn duration_from_secs(secs: u64) -> Option<chrono::Duration> {
    i64::try_from(secs).ok().and_then(chrono::Duration::try_seconds)
}

/// Native score convention of a detector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// Larger raw score = more anomalous.
    HigherIsAnomalous,

    /// Larger raw score = less anomalous; flipped before fusion.
    LowerIsAnomalous,
}

/// Threshold method preference for alert selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMethod {
    /// (1 - contamination) quantile of the score distribution.
    Quantile,

    /// Mean plus one sample standard deviation.
    MeanStd,
}

/// Entity field a behavioral flag can be windowed over.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum GroupField {
    Host,
    User,
    SourceIp,
    DestinationIp,
    ProcessName,
}

impl GroupField {
    /// Short label used in feature column names.
    pub fn label(&self) -> &'static str {
        match self {
            GroupField::Host => "host",
            GroupField::User => "user",
            GroupField::SourceIp => "src",
            GroupField::DestinationIp => "dst",
            GroupField::ProcessName => "process",
        }
    }
}

/// Named numeric column of an ensemble record that rules and alert
/// selection can read. Dotted names used by older policy files are accepted.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScoreColumn {
    #[default]
    #[serde(alias = "ensemble.score")]
    EnsembleScore,
    #[serde(alias = "anom.score")]
    ScoreA,
    #[serde(alias = "lstm.mse")]
    ScoreB,
    ScoreANorm,
    ScoreBNorm,
}

impl ScoreColumn {
    pub fn name(&self) -> &'static str {
        match self {
            ScoreColumn::EnsembleScore => "ensemble_score",
            ScoreColumn::ScoreA => "score_a",
            ScoreColumn::ScoreB => "score_b",
            ScoreColumn::ScoreANorm => "score_a_norm",
            ScoreColumn::ScoreBNorm => "score_b_norm",
        }
    }
}

// ---------------------------------------------------------------------------
// Core Types
// ---------------------------------------------------------------------------

/// One normalized security observation.
///
/// Produced by upstream collectors and never mutated here. Every field except
/// the timestamp is optional because sources differ in what they record.
/// Serialized with ECS-style keys so partitions written by `ingest` are read
/// back unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,

    #[serde(rename = "host.name", default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(rename = "user.name", default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(rename = "source.ip", default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,

    #[serde(rename = "source.port", default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<u16>,

    #[serde(rename = "destination.ip", default, skip_serializing_if = "Option::is_none")]
    pub destination_ip: Option<String>,

    #[serde(rename = "destination.port", default, skip_serializing_if = "Option::is_none")]
    pub destination_port: Option<u16>,

    #[serde(rename = "network.transport", default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,

    #[serde(rename = "process.name", default, skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,

    #[serde(rename = "process.command_line", default, skip_serializing_if = "Option::is_none")]
    pub command_line: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(rename = "event.code", default, skip_serializing_if = "Option::is_none")]
    pub event_code: Option<String>,

    #[serde(rename = "event.outcome", default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

impl Event {
    /// An event carrying only a timestamp. Convenient base for builders.
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            host: None,
            user: None,
            source_ip: None,
            source_port: None,
            destination_ip: None,
            destination_port: None,
            transport: None,
            process_name: None,
            command_line: None,
            message: None,
            event_code: None,
            outcome: None,
        }
    }

    /// Value of an entity field used for windowed grouping.
    pub fn group_value(&self, field: GroupField) -> Option<&str> {
        match field {
            GroupField::Host => self.host.as_deref(),
            GroupField::User => self.user.as_deref(),
            GroupField::SourceIp => self.source_ip.as_deref(),
            GroupField::DestinationIp => self.destination_ip.as_deref(),
            GroupField::ProcessName => self.process_name.as_deref(),
        }
    }
}

/// One schema-complete feature vector per event.
///
/// Identity columns are typed fields; numeric features live in a name-keyed
/// map whose key set is fixed by `features::FeatureSchema` and checked at
/// every stage boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureRow {
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,

    #[serde(rename = "host.name", default)]
    pub host: Option<String>,

    #[serde(rename = "user.name", default)]
    pub user: Option<String>,

    #[serde(rename = "source.ip", default)]
    pub source_ip: Option<String>,

    #[serde(rename = "destination.ip", default)]
    pub destination_ip: Option<String>,

    #[serde(rename = "session.id")]
    pub session_id: u64,

    #[serde(flatten)]
    pub features: BTreeMap<String, f64>,
}

impl FeatureRow {
    pub fn feature(&self, name: &str) -> Option<f64> {
        self.features.get(name).copied()
    }
}

/// A detector's scalar anomaly score for one event, plus the identity
/// columns the detector passed through.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreRecord {
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,

    #[serde(rename = "host.name", default)]
    pub host: Option<String>,

    #[serde(rename = "user.name", default)]
    pub user: Option<String>,

    #[serde(rename = "source.ip", default)]
    pub source_ip: Option<String>,

    #[serde(rename = "destination.ip", default)]
    pub destination_ip: Option<String>,

    #[serde(rename = "session.id", default)]
    pub session_id: Option<u64>,

    /// None when the detector produced no score for this row.
    pub score: Option<f64>,
}

/// Fused output of two detector scores for one event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnsembleRecord {
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,

    #[serde(rename = "host.name", default)]
    pub host: Option<String>,

    #[serde(rename = "user.name", default)]
    pub user: Option<String>,

    #[serde(rename = "source.ip", default)]
    pub source_ip: Option<String>,

    #[serde(rename = "destination.ip", default)]
    pub destination_ip: Option<String>,

    #[serde(rename = "session.id", default)]
    pub session_id: Option<u64>,

    /// Detector A raw score.
    pub score_a: f64,

    /// Detector B raw score; None when no B row was within tolerance.
    pub score_b: Option<f64>,

    /// Min-max normalized A score, before any polarity flip.
    pub score_a_norm: f64,

    /// Min-max normalized B score (unmatched rows filled with 0 first).
    pub score_b_norm: f64,

    pub ensemble_score: f64,
}

impl EnsembleRecord {
    /// Read a named score column. A missing raw value reads as 0.0.
    pub fn value(&self, column: ScoreColumn) -> f64 {
        match column {
            ScoreColumn::EnsembleScore => self.ensemble_score,
            ScoreColumn::ScoreA => self.score_a,
            ScoreColumn::ScoreB => self.score_b.unwrap_or(0.0),
            ScoreColumn::ScoreANorm => self.score_a_norm,
            ScoreColumn::ScoreBNorm => self.score_b_norm,
        }
    }
}

/// An ensemble record selected by adaptive thresholding.
///
/// Recomputed every run; never persisted as mutable state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    #[serde(flatten)]
    pub record: EnsembleRecord,

    /// The cutoff that selected this record.
    pub threshold: f64,
}
