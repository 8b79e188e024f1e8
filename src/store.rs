//! # Partitioned Table Store
//!
//! Newline-delimited JSON tables on the local filesystem.
//!
//! ## Layout
//! ```text
//! events/<source>/dt=YYYY-MM-DD/*.jsonl   normalized events, per source and day
//! features/dt=YYYY-MM-DD/part.jsonl      feature rows, per day
//! features/features_sample.jsonl         bounded combined sample
//! scores/*.jsonl                         detector and ensemble score tables
//! ```
//!
//! Reading is forgiving: a malformed line is skipped and counted, never fatal.
//! Raw event decoding accepts numbers or strings for codes and ports and
//! normalizes every timestamp to UTC, dropping rows whose timestamp cannot be
//! parsed.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::{Event, LoganomError, LoganomResult};

/// Prefix of a date partition directory name.
const PARTITION_PREFIX: &str = "dt=";

/// Naive layouts accepted after RFC 3339. Interpreted as UTC.
const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
];

/// Offset layouts RFC 3339 rejects (e.g. `+0000` without a colon).
const OFFSET_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"];

// ---------------------------------------------------------------------------
// Generic NDJSON tables
// ---------------------------------------------------------------------------

/// Rows decoded from one NDJSON file.
#[derive(Debug)]
pub struct JsonlTable<T> {
    pub rows: Vec<T>,

    /// Lines that were not valid JSON for `T`.
    pub malformed: usize,
}

/// Read every line of an NDJSON file as `T`.
///
/// Blank lines are ignored. Lines that fail to decode are logged with their
/// line number and counted in `malformed`.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> LoganomResult<JsonlTable<T>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut rows = Vec::new();
    let mut malformed = 0usize;

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(trimmed) {
            Ok(row) => rows.push(row),
            Err(e) => {
                malformed += 1;
                log::warn!(
                    "[STORE] {}:{} skipped malformed line: {}",
                    path.display(),
                    idx + 1,
                    e
                );
            }
        }
    }

    Ok(JsonlTable { rows, malformed })
}

/// Write rows to an NDJSON file, replacing any previous content.
pub fn write_jsonl<T: Serialize>(path: &Path, rows: &[T]) -> LoganomResult<()> {
    ensure_parent(path)?;
    let file = File::create(path)?;
    write_rows(file, rows)
}

/// Append rows to an NDJSON file, creating it if needed.
pub fn append_jsonl<T: Serialize>(path: &Path, rows: &[T]) -> LoganomResult<()> {
    ensure_parent(path)?;
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    write_rows(file, rows)
}

fn write_rows<T: Serialize>(file: File, rows: &[T]) -> LoganomResult<()> {
    let mut writer = BufWriter::new(file);
    for row in rows {
        serde_json::to_writer(&mut writer, row)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Create the parent directory of `path` if it does not exist.
pub fn ensure_parent(path: &Path) -> LoganomResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Number of non-blank lines in a file; 0 when it does not exist.
pub fn count_lines(path: &Path) -> LoganomResult<usize> {
    if !path.exists() {
        return Ok(0);
    }
    let reader = BufReader::new(File::open(path)?);
    let mut count = 0;
    for line in reader.lines() {
        if !line?.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

// ---------------------------------------------------------------------------
// Date partitions
// ---------------------------------------------------------------------------

/// Directory of one date partition under `base`.
pub fn partition_dir(base: &Path, date: NaiveDate) -> PathBuf {
    base.join(format!("{}{}", PARTITION_PREFIX, date.format("%Y-%m-%d")))
}

/// Date of a `dt=YYYY-MM-DD` directory name.
pub fn parse_partition_name(name: &str) -> Option<NaiveDate> {
    let date = name.strip_prefix(PARTITION_PREFIX)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// Discover event partitions: every `<source>/dt=YYYY-MM-DD/*.jsonl` file
/// under `events_dir`, grouped by date across sources.
///
/// A missing `events_dir` yields no partitions. Directories whose name is not
/// a valid date partition are skipped with a warning.
pub fn list_event_partitions(events_dir: &Path) -> LoganomResult<BTreeMap<NaiveDate, Vec<PathBuf>>> {
    let mut partitions: BTreeMap<NaiveDate, Vec<PathBuf>> = BTreeMap::new();

    if !events_dir.exists() {
        log::warn!("[STORE] Events directory {} does not exist", events_dir.display());
        return Ok(partitions);
    }

    for source in sorted_entries(events_dir)? {
        if !source.is_dir() {
            continue;
        }
        for part in sorted_entries(&source)? {
            if !part.is_dir() {
                continue;
            }
            let name = part.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            let Some(date) = parse_partition_name(name) else {
                log::warn!("[STORE] Skipping {}: not a dt=YYYY-MM-DD partition", part.display());
                continue;
            };
            for file in sorted_entries(&part)? {
                if file.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                    partitions.entry(date).or_default().push(file);
                }
            }
        }
    }

    Ok(partitions)
}

fn sorted_entries(dir: &Path) -> LoganomResult<Vec<PathBuf>> {
    let mut entries = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect::<Vec<_>>();
    entries.sort();
    Ok(entries)
}

/// Events decoded from a set of partition files.
#[derive(Debug, Default)]
pub struct EventBatch {
    pub events: Vec<Event>,

    /// Rows dropped because their timestamp was missing or unparseable.
    pub dropped: usize,

    /// Lines that were not JSON objects.
    pub malformed: usize,
}

/// Read and normalize every event in `files`.
pub fn read_events(files: &[PathBuf]) -> LoganomResult<EventBatch> {
    let mut batch = EventBatch::default();
    for file in files {
        let table = read_jsonl::<RawEvent>(file)?;
        batch.malformed += table.malformed;
        for raw in table.rows {
            match raw.normalize() {
                Some(event) => batch.events.push(event),
                None => batch.dropped += 1,
            }
        }
    }
    Ok(batch)
}

/// Write events into `<events_dir>/<source>/dt=YYYY-MM-DD/part.jsonl`,
/// one partition per UTC calendar date. Existing partitions for those dates
/// are replaced. Returns the written partition files.
pub fn write_partitioned_events(
    events: &[Event],
    events_dir: &Path,
    source: &str,
) -> LoganomResult<Vec<PathBuf>> {
    let mut by_date: BTreeMap<NaiveDate, Vec<&Event>> = BTreeMap::new();
    for event in events {
        by_date.entry(event.timestamp.date_naive()).or_default().push(event);
    }

    let mut written = Vec::with_capacity(by_date.len());
    for (date, mut day) in by_date {
        day.sort_by_key(|e| e.timestamp);
        let path = partition_dir(&events_dir.join(source), date).join("part.jsonl");
        write_jsonl(&path, &day)?;
        log::info!("[STORE] Wrote {} events to {}", day.len(), path.display());
        written.push(path);
    }
    Ok(written)
}

/// Outcome of ingesting one raw event file.
#[derive(Debug, Clone, Default)]
pub struct IngestSummary {
    pub events: usize,
    pub dropped: usize,
    pub malformed: usize,
    pub partitions: Vec<PathBuf>,
}

/// Normalize a raw NDJSON event file and write it into date partitions
/// under `<events_dir>/<source>/`.
pub fn ingest_file(path: &Path, events_dir: &Path, source: &str) -> LoganomResult<IngestSummary> {
    if !path.exists() {
        return Err(LoganomError::MissingInput {
            stage: "ingest",
            path: path.to_path_buf(),
        });
    }
    if source.is_empty() || source.contains(['/', '\\']) || source.starts_with(PARTITION_PREFIX) {
        return Err(LoganomError::Store(format!("invalid source name '{}'", source)));
    }

    let batch = read_events(&[path.to_path_buf()])?;
    if batch.dropped > 0 {
        log::warn!(
            "[STORE] {}: dropped {} rows with missing or unparseable timestamps",
            path.display(),
            batch.dropped
        );
    }
    let partitions = write_partitioned_events(&batch.events, events_dir, source)?;

    Ok(IngestSummary {
        events: batch.events.len(),
        dropped: batch.dropped,
        malformed: batch.malformed,
        partitions,
    })
}

// ---------------------------------------------------------------------------
// Raw event decoding
// ---------------------------------------------------------------------------

/// A raw event row as collectors write it. Every field is loosely typed;
/// `normalize` turns it into a typed `Event`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "@timestamp", alias = "timestamp", default)]
    pub timestamp: Option<Value>,

    #[serde(rename = "host.name", default)]
    pub host: Option<Value>,

    #[serde(rename = "user.name", default)]
    pub user: Option<Value>,

    #[serde(rename = "source.ip", default)]
    pub source_ip: Option<Value>,

    #[serde(rename = "source.port", default)]
    pub source_port: Option<Value>,

    #[serde(rename = "destination.ip", default)]
    pub destination_ip: Option<Value>,

    #[serde(rename = "destination.port", default)]
    pub destination_port: Option<Value>,

    #[serde(rename = "network.transport", default)]
    pub transport: Option<Value>,

    #[serde(rename = "process.name", default)]
    pub process_name: Option<Value>,

    #[serde(rename = "process.command_line", default)]
    pub command_line: Option<Value>,

    #[serde(default)]
    pub message: Option<Value>,

    #[serde(rename = "event.code", default)]
    pub event_code: Option<Value>,

    #[serde(rename = "event.outcome", default)]
    pub outcome: Option<Value>,
}

impl RawEvent {
    /// Convert to a typed event. Returns None when the timestamp is missing
    /// or cannot be parsed.
    pub fn normalize(self) -> Option<Event> {
        let timestamp = self.timestamp.as_ref().and_then(value_to_timestamp)?;
        Some(Event {
            timestamp,
            host: self.host.as_ref().and_then(value_to_string),
            user: self.user.as_ref().and_then(value_to_string),
            source_ip: self.source_ip.as_ref().and_then(value_to_string),
            source_port: self.source_port.as_ref().and_then(value_to_port),
            destination_ip: self.destination_ip.as_ref().and_then(value_to_string),
            destination_port: self.destination_port.as_ref().and_then(value_to_port),
            transport: self.transport.as_ref().and_then(value_to_string),
            process_name: self.process_name.as_ref().and_then(value_to_string),
            command_line: self.command_line.as_ref().and_then(value_to_string),
            message: self.message.as_ref().and_then(value_to_string),
            event_code: self.event_code.as_ref().and_then(value_to_string),
            outcome: self.outcome.as_ref().and_then(value_to_string),
        })
    }
}

/// Render a scalar JSON value as a string. Null, empty strings and
/// containers yield None.
pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Read a port from a number or numeric string (`4444`, `"4444"`, `4444.0`).
pub fn value_to_port(value: &Value) -> Option<u16> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if n.fract() == 0.0 && (0.0..=u16::MAX as f64).contains(&n) {
        Some(n as u16)
    } else {
        None
    }
}

/// Read a number from a JSON number or numeric string. Non-finite and
/// non-numeric values yield None.
pub fn value_to_f64(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Timestamp from a string (see `parse_timestamp`) or epoch seconds.
pub fn value_to_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => from_epoch_secs(n.as_f64()?),
        _ => None,
    }
}

/// Normalize a timestamp string to UTC.
///
/// Accepts RFC 3339 (any offset), `+HHMM` offsets, naive date-times
/// (assumed UTC) and bare epoch seconds.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    s.parse::<f64>().ok().and_then(from_epoch_secs)
}

fn from_epoch_secs(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
}
