//! Pass/fail decision over a finished run's [`Report`].

use std::collections::BTreeMap;

use evcheck_ledger::{OrderMismatch, Report};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerdictRules {
    /// Accepted/received bookkeeping only applies when this run sent events.
    pub sender_enabled: bool,
    pub max_duplicates_percentage: Option<u64>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunFailure {
    #[error("no events were accepted")]
    NothingAccepted,

    #[error("lost events by partition key: {0:?}")]
    LostEvents(BTreeMap<String, Vec<String>>),

    #[error("accepted count {accepted} does not match received count {received}")]
    CountMismatch { accepted: u64, received: u64 },

    #[error("duplicate percentage {actual} exceeds configured maximum {max}")]
    TooManyDuplicates { actual: u64, max: u64 },

    #[error("received order differs from sent order in partitions: {0:?}")]
    OrderViolated(Vec<String>),
}

/// First failed rule, checked in a fixed order; `Ok` when the run is clean.
pub fn evaluate(report: &Report, rules: VerdictRules) -> Result<(), RunFailure> {
    let accepted = report.metrics.accepted_count;
    let received = report.received_count as u64;

    if rules.sender_enabled && accepted == 0 {
        return Err(RunFailure::NothingAccepted);
    }
    if report.lost_count > 0 {
        return Err(RunFailure::LostEvents(
            report.lost_events_by_partition_key.clone(),
        ));
    }
    if rules.sender_enabled && accepted != received {
        return Err(RunFailure::CountMismatch { accepted, received });
    }
    if let (Some(max), Some(actual)) = (
        rules.max_duplicates_percentage,
        report.duplicate_percentage(),
    ) {
        if actual > max {
            return Err(RunFailure::TooManyDuplicates { actual, max });
        }
    }
    if !report.order_violations.is_empty() {
        return Err(RunFailure::OrderViolated(
            report.order_violations.keys().cloned().collect(),
        ));
    }
    Ok(())
}

/// One line per partition whose order broke, for the log.
pub fn describe_order_violations(violations: &BTreeMap<String, OrderMismatch>) -> Vec<String> {
    violations
        .iter()
        .map(|(pk, m)| {
            format!(
                "partition {pk}: position {} expected {} got {}",
                m.position, m.expected, m.actual
            )
        })
        .collect()
}
