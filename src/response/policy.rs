//! # Response Policy
//!
//! Declarative condition-to-action rules evaluated against each alert.
//!
//! ```yaml
//! rules:
//!   - name: Pause Windows Update on high anomaly
//!     condition: { score_column: ensemble_score, gte: 0.95 }
//!     actions:
//!       - { type: powershell, command: net stop wuauserv }
//! ```
//!
//! The document may be YAML, TOML or JSON, chosen by file extension.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{Alert, LoganomError, LoganomResult, ScoreColumn};

/// Ordered list of rules. Order is significant: rules and their actions run
/// in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,

    #[serde(default)]
    pub condition: Condition,

    #[serde(default)]
    pub actions: Vec<Action>,
}

/// Inclusive bounds on one score column. An absent bound is unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(default, alias = "score_col")]
    pub score_column: ScoreColumn,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gte: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lte: Option<f64>,
}

impl Condition {
    /// Whether `value` satisfies every configured bound.
    pub fn holds(&self, value: f64) -> bool {
        self.gte.map_or(true, |lo| value >= lo) && self.lte.map_or(true, |hi| value <= hi)
    }
}

/// One response step. `kind` is kept as written so unknown types reach the
/// audit log instead of failing the whole policy load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, alias = "cmd")]
    pub command: String,
}

impl Action {
    pub fn new(kind: &str, command: &str) -> Self {
        Self {
            kind: kind.to_string(),
            command: command.to_string(),
        }
    }
}

impl Rule {
    /// The value this rule's condition reads from `alert`, and whether it matches.
    pub fn evaluate(&self, alert: &Alert) -> (f64, bool) {
        let value = alert.record.value(self.condition.score_column);
        (value, self.condition.holds(value))
    }
}

impl Policy {
    /// Load a policy document, or the built-in default when `path` does not
    /// exist.
    pub fn load(path: &Path) -> LoganomResult<Self> {
        if !path.exists() {
            log::info!(
                "[RESPONSE] No policy at {}; using the built-in default rule",
                path.display()
            );
            return Ok(default_policy());
        }

        let content = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let policy: Policy = match ext.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&content)?,
            "toml" => toml::from_str(&content)?,
            "json" => serde_json::from_str(&content)?,
            other => {
                return Err(LoganomError::Policy(format!(
                    "{}: unsupported policy format '{}' (expected yaml, toml or json)",
                    path.display(),
                    other
                )))
            }
        };

        policy.validate()?;
        log::info!(
            "[RESPONSE] Loaded {} rules from {}",
            policy.rules.len(),
            path.display()
        );
        Ok(policy)
    }

    /// Reject rules whose bounds can never hold.
    pub fn validate(&self) -> LoganomResult<()> {
        for rule in &self.rules {
            if let (Some(lo), Some(hi)) = (rule.condition.gte, rule.condition.lte) {
                if lo > hi {
                    return Err(LoganomError::Policy(format!(
                        "rule '{}': gte {} is above lte {}",
                        rule.name, lo, hi
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Used when no policy document exists.
pub fn default_policy() -> Policy {
    Policy {
        rules: vec![Rule {
            name: "Pause Windows Update on high anomaly".to_string(),
            condition: Condition {
                score_column: ScoreColumn::EnsembleScore,
                gte: Some(0.95),
                lte: None,
            },
            actions: vec![
                Action::new("powershell", "net stop wuauserv"),
                Action::new("powershell", "dism /online /cleanup-image /scanhealth"),
                Action::new("powershell", "sfc /scannow"),
            ],
        }],
    }
}
