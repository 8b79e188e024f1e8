//! # Response Engine
//!
//! Evaluates every alert against every policy rule, in declaration order,
//! and runs the actions of matching rules.
//!
//! Per (alert, rule) pair:
//! ```text
//! Unevaluated -> [condition holds?] -> Matched -> for each action:
//!     Executed | Simulated -> Recorded (rc = 0) | Recorded-with-error (rc != 0)
//! ```
//!
//! Each executed or simulated action appends exactly one audit record. A
//! failing action is recorded and never retried; it does not stop the
//! remaining actions, rules or alerts. Two modes:
//! - **dry-run** (default): actions are described, never invoked
//! - **apply**: actions run as external processes or HTTP calls

pub mod audit;
pub mod executor;
pub mod policy;

use chrono::Utc;
use std::time::Duration;

use crate::{Alert, LoganomResult, ResponseConfig};
use audit::{AuditLog, AuditRecord};
use policy::Policy;

/// What one response run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseSummary {
    pub alerts: usize,
    pub matched_rules: usize,
    pub records_written: usize,
    pub failed_actions: usize,
}

pub struct ResponseEngine {
    policy: Policy,
    audit: AuditLog,
    dry_run: bool,
    webhook_timeout: Duration,
}

impl ResponseEngine {
    pub fn new(policy: Policy, config: &ResponseConfig) -> Self {
        Self {
            policy,
            audit: AuditLog::new(&config.audit_log_path),
            dry_run: config.dry_run,
            webhook_timeout: Duration::from_secs(config.webhook_timeout_secs),
        }
    }

    /// Load the policy named by `config` (or the default rule) and build an engine.
    pub fn from_config(config: &ResponseConfig) -> LoganomResult<Self> {
        Ok(Self::new(Policy::load(&config.policy_path)?, config))
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Evaluate `alerts` against the policy and record every action taken.
    ///
    /// # Returns
    /// Counts of matched rules, audit records and failed actions. Only an
    /// audit write failure is an error.
    pub fn respond(&self, alerts: &[Alert]) -> LoganomResult<ResponseSummary> {
        let mut summary = ResponseSummary {
            alerts: alerts.len(),
            ..Default::default()
        };
        if alerts.is_empty() {
            log::info!("[RESPONSE] No alerts to evaluate; nothing recorded");
            return Ok(summary);
        }

        let now = Utc::now();
        log::info!(
            "[RESPONSE] Evaluating {} alerts against {} rules ({})",
            alerts.len(),
            self.policy.rules.len(),
            if self.dry_run { "dry-run" } else { "apply" }
        );

        for alert in alerts {
            for rule in &self.policy.rules {
                let (score, matched) = rule.evaluate(alert);
                if !matched {
                    continue;
                }
                summary.matched_rules += 1;

                for action in &rule.actions {
                    let outcome = executor::execute(action, alert, self.dry_run, self.webhook_timeout);
                    if outcome.return_code != 0 {
                        summary.failed_actions += 1;
                        log::warn!(
                            "[RESPONSE] '{}' {} '{}' failed (rc={}): {}",
                            rule.name,
                            action.kind,
                            action.command,
                            outcome.return_code,
                            outcome.output
                        );
                    }

                    self.audit.append(&AuditRecord {
                        time: now,
                        dry_run: self.dry_run,
                        rule: rule.name.clone(),
                        alert_ts: alert.record.timestamp,
                        score,
                        action: action.clone(),
                        return_code: outcome.return_code,
                        output: outcome.output,
                    })?;
                    summary.records_written += 1;
                }
            }
        }

        log::info!(
            "[RESPONSE] {} rule matches, {} audit records appended to {} ({} failed)",
            summary.matched_rules,
            summary.records_written,
            self.audit.path().display(),
            summary.failed_actions
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EnsembleRecord, ScoreColumn};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use super::policy::{Action, Condition, Rule};

    fn alert(i: i64, score: f64) -> Alert {
        Alert {
            record: EnsembleRecord {
                timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + ChronoDuration::seconds(i),
                host: None,
                user: None,
                source_ip: None,
                destination_ip: None,
                session_id: None,
                score_a: 0.0,
                score_b: None,
                score_a_norm: 0.0,
                score_b_norm: 0.0,
                ensemble_score: score,
            },
            threshold: 0.5,
        }
    }

    fn rule(name: &str, gte: f64, actions: Vec<Action>) -> Rule {
        Rule {
            name: name.to_string(),
            condition: Condition {
                score_column: ScoreColumn::EnsembleScore,
                gte: Some(gte),
                lte: None,
            },
            actions,
        }
    }

    fn config(dir: &std::path::Path, dry_run: bool) -> ResponseConfig {
        ResponseConfig {
            dry_run,
            policy_path: dir.join("policy.yaml"),
            audit_log_path: dir.join("actions.jsonl"),
            webhook_timeout_secs: 1,
        }
    }

    #[test]
    fn test_record_count_doubles_on_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let policy = Policy {
            rules: vec![
                rule("high", 0.9, vec![Action::new("shell", "a"), Action::new("shell", "b")]),
                rule("any", 0.0, vec![Action::new("shell", "c")]),
            ],
        };
        let engine = ResponseEngine::new(policy, &config(dir.path(), true));
        let alerts = vec![alert(0, 0.95), alert(1, 0.5), alert(2, 0.99)];

        // 2 high matches x 2 actions + 3 any matches x 1 action
        let first = engine.respond(&alerts).unwrap();
        assert_eq!(first.records_written, 7);
        assert_eq!(first.matched_rules, 5);
        assert_eq!(engine.audit_log().count().unwrap(), 7);

        engine.respond(&alerts).unwrap();
        assert_eq!(engine.audit_log().count().unwrap(), 14);
    }

    #[test]
    fn test_records_follow_declaration_order() {
        let dir = tempfile::tempdir().unwrap();
        let policy = Policy {
            rules: vec![
                rule("first", 0.0, vec![Action::new("shell", "1"), Action::new("shell", "2")]),
                rule("second", 0.0, vec![Action::new("shell", "3")]),
            ],
        };
        let engine = ResponseEngine::new(policy, &config(dir.path(), true));
        engine.respond(&[alert(0, 1.0)]).unwrap();

        let records = engine.audit_log().read_all().unwrap();
        let commands: Vec<&str> = records.iter().map(|r| r.action.command.as_str()).collect();
        assert_eq!(commands, vec!["1", "2", "3"]);
        assert!(records.iter().all(|r| r.time == records[0].time && r.dry_run));
        assert_eq!(records[0].output, "DRY-RUN shell: 1");
    }

    #[test]
    fn test_failed_action_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        let policy = Policy {
            rules: vec![rule(
                "mixed",
                0.0,
                vec![Action::new("teleport", "x"), Action::new("webhook", "not-a-url")],
            )],
        };
        let engine = ResponseEngine::new(policy, &config(dir.path(), false));
        let summary = engine.respond(&[alert(0, 1.0), alert(1, 1.0)]).unwrap();

        assert_eq!(summary.records_written, 4);
        assert_eq!(summary.failed_actions, 4);
        let records = engine.audit_log().read_all().unwrap();
        assert!(records.iter().all(|r| r.return_code == 1 && r.output.starts_with("ERROR:")));
    }

    #[test]
    fn test_no_alerts_appends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ResponseEngine::from_config(&config(dir.path(), true)).unwrap();
        let summary = engine.respond(&[]).unwrap();
        assert_eq!(summary, ResponseSummary::default());
        assert!(!engine.audit_log().path().exists());
    }

    #[test]
    fn test_default_policy_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ResponseEngine::from_config(&config(dir.path(), true)).unwrap();
        let summary = engine.respond(&[alert(0, 0.94), alert(1, 0.95)]).unwrap();
        assert_eq!(summary.matched_rules, 1);
        assert_eq!(summary.records_written, 3);
    }
}
