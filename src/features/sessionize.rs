//! # Sessionizer
//!
//! Reconstructs logical network sessions from unordered flow records.
//!
//! Records sharing (source address, destination address, protocol) belong to
//! the same session until the gap since the previous record on that key
//! exceeds the inactivity timeout. Missing transport fields are replaced with
//! the `unknown` sentinel so every record can be keyed.
//!
//! Direction is not collapsed: A->B and B->A are separate session lineages.

use chrono::{DateTime, Duration, Utc};

use crate::Event;

/// Sentinel for a missing transport field.
pub const UNKNOWN: &str = "unknown";

/// Grouping key of a flow: (source address, destination address, protocol).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FlowKey {
    pub source: String,
    pub destination: String,
    pub protocol: String,
}

impl FlowKey {
    pub fn new(source: Option<&str>, destination: Option<&str>, protocol: Option<&str>) -> Self {
        Self {
            source: source.unwrap_or(UNKNOWN).to_string(),
            destination: destination.unwrap_or(UNKNOWN).to_string(),
            protocol: protocol.unwrap_or(UNKNOWN).to_string(),
        }
    }
}

/// A record the sessionizer can place into a session.
pub trait Flow {
    fn flow_key(&self) -> FlowKey;

    /// When the record was observed. None always starts a new session.
    fn observed_at(&self) -> Option<DateTime<Utc>>;
}

impl Flow for Event {
    fn flow_key(&self) -> FlowKey {
        FlowKey::new(
            self.source_ip.as_deref(),
            self.destination_ip.as_deref(),
            self.transport.as_deref(),
        )
    }

    fn observed_at(&self) -> Option<DateTime<Utc>> {
        Some(self.timestamp)
    }
}

/// Assign session identifiers.
///
/// Sorts `records` in place by (flow key, timestamp) so every flow
/// sharing a key is contiguous, then scans once. Returns one id per record,
/// aligned with the new order. Ids start at `first_id` and increase by one
/// for each new session.
///
/// # Arguments
/// * `records` - Flow records in any order. Reordered by this call.
/// * `timeout` - Inactivity gap that closes a session. A gap equal to the
///   timeout stays in the session.
/// * `first_id` - Identifier of the first session produced.
pub fn sessionize<T: Flow>(records: &mut [T], timeout: Duration, first_id: u64) -> Vec<u64> {
    let mut keyed: Vec<(FlowKey, Option<DateTime<Utc>>, usize)> = records
        .iter()
        .enumerate()
        .map(|(i, r)| (r.flow_key(), r.observed_at(), i))
        .collect();
    keyed.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));

    let order: Vec<usize> = keyed.iter().map(|k| k.2).collect();
    apply_permutation(records, &order);

    let mut ids = Vec::with_capacity(keyed.len());
    let mut current = first_id;
    let mut last: Option<(&FlowKey, Option<DateTime<Utc>>)> = None;

    for (key, at, _) in &keyed {
        let new_session = match (last, at) {
            (None, _) => true,
            (Some((last_key, _)), _) if last_key != key => true,
            (Some((_, Some(prev))), Some(now)) => *now - prev > timeout,
            _ => true,
        };
        if new_session && last.is_some() {
            current += 1;
        }
        ids.push(current);
        last = Some((key, *at));
    }

    log::debug!(
        "[SESSION] {} records grouped into {} sessions",
        ids.len(),
        if ids.is_empty() { 0 } else { current - first_id + 1 }
    );
    ids
}

/// Reorder `items` so that position `i` holds the element previously at
/// `order[i]`.
fn apply_permutation<T>(items: &mut [T], order: &[usize]) {
    let mut placed = vec![false; items.len()];
    for start in 0..items.len() {
        if placed[start] {
            continue;
        }
        let mut i = start;
        loop {
            placed[i] = true;
            let src = order[i];
            if src == start {
                break;
            }
            items.swap(i, src);
            i = src;
        }
    }
}
