//! # Audit Log
//!
//! Append-only newline-delimited JSON record of every executed or simulated
//! response action. The file is opened in append mode on every write and is
//! never truncated or rewritten.
//!
//! Appends from a single process are ordered. Deployments that run several
//! responders against one file must serialize them (one writer process).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::policy::Action;
use crate::{store, LoganomResult};

/// One immutable audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Evaluation time, shared by every record of one run.
    pub time: DateTime<Utc>,
    pub dry_run: bool,
    pub rule: String,

    /// Timestamp of the alerted event.
    pub alert_ts: DateTime<Utc>,

    /// Value of the rule's score column.
    pub score: f64,
    pub action: Action,
    pub return_code: i32,
    pub output: String,
}

/// Writer for the append-only audit file.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single line.
    pub fn append(&self, record: &AuditRecord) -> LoganomResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        store::ensure_parent(&self.path)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        // One write per record keeps each line whole under O_APPEND.
        file.write_all(line.as_bytes())?;
        file.flush()?;

        log::debug!(
            "[AUDIT] {} | {} | rc={} | {}",
            record.rule,
            record.action.kind,
            record.return_code,
            record.output
        );
        Ok(())
    }

    /// Number of records written so far. A missing file has none.
    pub fn count(&self) -> LoganomResult<usize> {
        store::count_lines(&self.path)
    }

    /// Read every record back, skipping lines that do not parse.
    pub fn read_all(&self) -> LoganomResult<Vec<AuditRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        Ok(store::read_jsonl::<AuditRecord>(&self.path)?.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(rule: &str) -> AuditRecord {
        AuditRecord {
            time: Utc::now(),
            dry_run: true,
            rule: rule.to_string(),
            alert_ts: Utc::now(),
            score: 0.97,
            action: Action::new("powershell", "sfc /scannow"),
            return_code: 0,
            output: "DRY-RUN powershell: sfc /scannow".to_string(),
        }
    }

    #[test]
    fn test_append_preserves_existing_records() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(&dir.path().join("logs").join("actions.jsonl"));
        assert_eq!(log.count().unwrap(), 0);

        log.append(&record("first")).unwrap();
        let reopened = AuditLog::new(log.path());
        reopened.append(&record("second")).unwrap();

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].rule, "first");
        assert_eq!(records[1].rule, "second");
    }

    #[test]
    fn test_each_append_is_one_terminated_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(&dir.path().join("actions.jsonl"));
        for rule in ["a", "b", "c"] {
            log.append(&record(rule)).unwrap();
        }

        let body = std::fs::read_to_string(log.path()).unwrap();
        assert!(body.ends_with('\n'));
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in lines {
            let parsed: AuditRecord = serde_json::from_str(line).unwrap();
            assert_eq!(parsed.return_code, 0);
        }
    }

    #[test]
    fn test_wire_format() {
        let value = serde_json::to_value(record("r")).unwrap();
        let keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
        for key in ["time", "dry_run", "rule", "alert_ts", "score", "action", "return_code", "output"] {
            assert!(keys.contains(&key), "missing {}", key);
        }
        assert_eq!(value["action"]["type"], "powershell");
        assert_eq!(value["action"]["command"], "sfc /scannow");
    }
}
