//! # Threshold & Alert Selector
//!
//! Picks a bounded set of high-priority records from the ensemble table.
//!
//! Every record whose configured score column is at or above the adaptive
//! cutoff qualifies; qualifying records are ranked by descending score (ties
//! keep timestamp order) and capped at `top_n`.

pub mod threshold;

use crate::{Alert, AlertingConfig, EnsembleRecord};
use threshold::ThresholdDecision;

/// Alerts selected in one run, plus how the cutoff was chosen.
#[derive(Debug, Clone)]
pub struct AlertSet {
    pub alerts: Vec<Alert>,
    pub decision: ThresholdDecision,

    /// Records at or above the cutoff before the top-N cap.
    pub qualifying: usize,
}

impl AlertSet {
    pub fn threshold(&self) -> f64 {
        self.decision.value()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}

/// Select alerts from `records`.
pub fn select_alerts(records: &[EnsembleRecord], config: &AlertingConfig) -> AlertSet {
    let column = config.score_column;
    let scores: Vec<f64> = records.iter().map(|r| r.value(column)).collect();
    let decision = threshold::decide_threshold(
        &scores,
        config.contamination,
        config.threshold_method,
        config.min_quantile_samples,
    );
    let cutoff = decision.value();

    let mut selected: Vec<&EnsembleRecord> = records
        .iter()
        .zip(&scores)
        .filter(|(_, s)| s.is_finite() && **s >= cutoff)
        .map(|(r, _)| r)
        .collect();
    let qualifying = selected.len();

    selected.sort_by_key(|r| r.timestamp);
    selected.sort_by(|x, y| y.value(column).total_cmp(&x.value(column)));
    selected.truncate(config.top_n);

    let alerts: Vec<Alert> = selected
        .into_iter()
        .map(|r| Alert {
            record: r.clone(),
            threshold: cutoff,
        })
        .collect();

    if records.is_empty() {
        log::info!("[ALERTS] Empty score table; no alerts");
    } else {
        log::info!(
            "[ALERTS] {} by {}: {} of {} records qualify, {} selected (top {})",
            decision,
            column.name(),
            qualifying,
            records.len(),
            alerts.len(),
            config.top_n
        );
    }

    AlertSet {
        alerts,
        decision,
        qualifying,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ScoreColumn, ThresholdMethod};
    use chrono::{Duration, TimeZone, Utc};

    fn record(i: i64, score: f64) -> EnsembleRecord {
        EnsembleRecord {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::seconds(i),
            host: None,
            user: None,
            source_ip: None,
            destination_ip: None,
            session_id: None,
            score_a: score,
            score_b: None,
            score_a_norm: 0.0,
            score_b_norm: 0.0,
            ensemble_score: score,
        }
    }

    fn config(top_n: usize) -> AlertingConfig {
        AlertingConfig {
            top_n,
            ..AlertingConfig::default()
        }
    }

    #[test]
    fn test_qualifying_share_matches_contamination() {
        let records: Vec<_> = (0..1000).map(|i| record(i, i as f64 / 1000.0)).collect();
        let set = select_alerts(&records, &config(1000));
        assert!(matches!(set.decision, ThresholdDecision::Quantile(_)));
        // 5% of 1000, within one sample of interpolation slack.
        assert!((49..=51).contains(&set.qualifying), "got {}", set.qualifying);
    }

    #[test]
    fn test_top_n_cap_and_order() {
        let records: Vec<_> = (0..200).map(|i| record(i, (i % 50) as f64)).collect();
        let set = select_alerts(&records, &config(3));
        assert_eq!(set.alerts.len(), 3);
        let scores: Vec<f64> = set.alerts.iter().map(|a| a.record.ensemble_score).collect();
        assert_eq!(scores, vec![49.0, 49.0, 49.0]);
        // Ties keep timestamp order.
        assert!(set.alerts.windows(2).all(|w| w[0].record.timestamp < w[1].record.timestamp));
        assert!(set.alerts.iter().all(|a| a.threshold == set.threshold()));
    }

    #[test]
    fn test_empty_input() {
        let set = select_alerts(&[], &config(10));
        assert!(set.is_empty());
        assert_eq!(set.threshold(), f64::INFINITY);
    }

    #[test]
    fn test_alternate_score_column() {
        let mut records: Vec<_> = (0..20).map(|i| record(i, 0.0)).collect();
        records[7].score_a = 100.0;
        let cfg = AlertingConfig {
            score_column: ScoreColumn::ScoreA,
            threshold_method: ThresholdMethod::MeanStd,
            ..config(5)
        };
        let set = select_alerts(&records, &cfg);
        assert_eq!(set.alerts.len(), 1);
        assert_eq!(set.alerts[0].record.score_a, 100.0);
    }
}
