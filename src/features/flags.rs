//! Declared boolean behavioral flags.
//!
//! A flag fires when ANY of its conditions holds: an exact event code, an
//! outcome string (case-insensitive), or a destination port.

use serde::{Deserialize, Serialize};

use crate::Event;

/// One named flag rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlagRule {
    /// Feature column name of the flag (e.g. `login_failed`).
    pub name: String,

    #[serde(default)]
    pub event_codes: Vec<String>,

    /// Compared case-insensitively.
    #[serde(default)]
    pub outcomes: Vec<String>,

    #[serde(default)]
    pub destination_ports: Vec<u16>,
}

impl FlagRule {
    /// 1.0 when any condition matches the event, otherwise 0.0.
    pub fn evaluate(&self, event: &Event) -> f64 {
        let code = event.event_code.as_deref().map(str::trim);
        let code_hit = code.is_some_and(|c| self.event_codes.iter().any(|e| e == c));

        let outcome_hit = event.outcome.as_deref().is_some_and(|o| {
            let o = o.trim();
            self.outcomes.iter().any(|e| e.eq_ignore_ascii_case(o))
        });

        let port_hit = event
            .destination_port
            .is_some_and(|p| self.destination_ports.contains(&p));

        if code_hit || outcome_hit || port_hit {
            1.0
        } else {
            0.0
        }
    }
}

/// The built-in flags: failed authentication and suspicious connections.
pub fn default_flag_rules() -> Vec<FlagRule> {
    vec![
        FlagRule {
            name: "login_failed".to_string(),
            event_codes: vec!["4625".to_string()],
            outcomes: vec!["failure".to_string()],
            destination_ports: vec![],
        },
        FlagRule {
            name: "conn_suspicious".to_string(),
            event_codes: vec![],
            outcomes: vec!["S0".to_string()],
            destination_ports: vec![4444],
        },
    ]
}
