//! Turn a ledger snapshot into a [`Report`].
//!
//! Per partition of the sent side:
//! - received identifiers are split into first occurrences and repeats,
//! - lost = sent identifiers never received,
//! - non-empty results are recorded, empty ones omitted.
//!
//! Without ordering mode every list is sorted ascending so reports are
//! reproducible; with it, arrival order is kept.

use std::collections::{BTreeMap, HashSet};

use evcheck_core::Metrics;
use serde::Serialize;

use crate::ledger::{LedgerSnapshot, PartitionLog};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Also compare received order against sent order per partition.
    pub verify_order: bool,
}

/// First position where a partition's received order diverges from its
/// sent order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderMismatch {
    pub position: usize,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub lost_count: usize,
    #[serde(rename = "lostEvents")]
    pub lost_events_by_partition_key: PartitionLog,
    pub duplicate_count: usize,
    /// Every repeat delivery, one entry per extra occurrence.
    #[serde(rename = "duplicateEvents")]
    pub duplicate_events_by_partition_key: PartitionLog,
    /// Distinct identifiers received, duplicates excluded.
    pub received_count: usize,
    #[serde(skip)]
    pub received_events_by_partition_key: PartitionLog,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub order_violations: BTreeMap<String, OrderMismatch>,
    pub terminated: bool,
    pub metrics: Metrics,
}

impl Report {
    /// `100 * duplicates / (duplicates + received)`, truncated to whole
    /// percentage points. `None` when nothing was received.
    pub fn duplicate_percentage(&self) -> Option<u64> {
        if self.received_count == 0 {
            return None;
        }
        let dup = self.duplicate_count as u64;
        Some(100 * dup / (dup + self.received_count as u64))
    }
}

/// Split `received` into first occurrences and repeats, keeping order.
pub fn split_duplicates(received: &[String]) -> (Vec<String>, Vec<String>) {
    let mut seen = HashSet::with_capacity(received.len());
    let mut unique = Vec::with_capacity(received.len());
    let mut duplicates = Vec::new();
    for id in received {
        if seen.insert(id.as_str()) {
            unique.push(id.clone());
        } else {
            duplicates.push(id.clone());
        }
    }
    (unique, duplicates)
}

/// Sent identifiers absent from `received_unique`, each reported once.
fn lost_events(sent: &[String], received_unique: &[String], ordered: bool) -> Vec<String> {
    let received: HashSet<&str> = received_unique.iter().map(String::as_str).collect();
    let mut reported = HashSet::new();
    let mut lost: Vec<String> = sent
        .iter()
        .filter(|id| !received.contains(id.as_str()) && reported.insert(id.as_str()))
        .cloned()
        .collect();
    if !ordered {
        lost.sort();
    }
    lost
}

fn order_mismatch(sent: &[String], received_unique: &[String]) -> Option<OrderMismatch> {
    let sent_set: HashSet<&str> = sent.iter().map(String::as_str).collect();
    let received_set: HashSet<&str> = received_unique.iter().map(String::as_str).collect();

    let mut seen = HashSet::new();
    let expected = sent
        .iter()
        .filter(|id| received_set.contains(id.as_str()) && seen.insert(id.as_str()));
    let actual = received_unique
        .iter()
        .filter(|id| sent_set.contains(id.as_str()));

    expected
        .zip(actual)
        .enumerate()
        .find(|(_, (e, a))| e != a)
        .map(|(position, (e, a))| OrderMismatch {
            position,
            expected: e.clone(),
            actual: a.clone(),
        })
}

pub fn reconcile(snapshot: &LedgerSnapshot, options: ReconcileOptions) -> Report {
    let ordered = snapshot.ordered;
    let mut report = Report {
        terminated: snapshot.terminated,
        metrics: snapshot.metrics.clone(),
        ..Report::default()
    };

    for (pk, sent) in &snapshot.sent {
        let (mut received, mut duplicates) = snapshot
            .received
            .get(pk)
            .map(|r| split_duplicates(r))
            .unwrap_or_default();

        if ordered && options.verify_order {
            if let Some(mismatch) = order_mismatch(sent, &received) {
                report.order_violations.insert(pk.clone(), mismatch);
            }
        }

        let lost = lost_events(sent, &received, ordered);
        if !ordered {
            received.sort();
            duplicates.sort();
        }

        if !lost.is_empty() {
            report.lost_count += lost.len();
            report.lost_events_by_partition_key.insert(pk.clone(), lost);
        }
        if !duplicates.is_empty() {
            report.duplicate_count += duplicates.len();
            report
                .duplicate_events_by_partition_key
                .insert(pk.clone(), duplicates);
        }
        if !received.is_empty() {
            report.received_count += received.len();
            report
                .received_events_by_partition_key
                .insert(pk.clone(), received);
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use evcheck_core::UNKNOWN_PARTITION_KEY;
    use proptest::prelude::*;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn log(entries: Vec<(&str, Vec<&str>)>) -> PartitionLog {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), ids(&v)))
            .collect()
    }

    fn snapshot(
        ordered: bool,
        sent: Vec<(&str, Vec<&str>)>,
        received: Vec<(&str, Vec<&str>)>,
    ) -> LedgerSnapshot {
        LedgerSnapshot {
            ordered,
            sent: log(sent),
            received: log(received),
            terminated: true,
            metrics: Metrics::default(),
        }
    }

    #[test]
    fn test_happy_path() {
        let snap = snapshot(
            false,
            vec![(UNKNOWN_PARTITION_KEY, vec!["1", "2", "3"])],
            vec![(UNKNOWN_PARTITION_KEY, vec!["3", "1", "2"])],
        );
        let report = reconcile(&snap, ReconcileOptions::default());
        assert_eq!(report.lost_count, 0);
        assert_eq!(report.duplicate_count, 0);
        assert_eq!(report.received_count, 3);
        assert!(report.lost_events_by_partition_key.is_empty());
        assert!(report.duplicate_events_by_partition_key.is_empty());
        assert!(report.terminated);
    }

    #[test]
    fn test_duplicate_delivery() {
        let snap = snapshot(
            false,
            vec![(UNKNOWN_PARTITION_KEY, vec!["1", "2"])],
            vec![(UNKNOWN_PARTITION_KEY, vec!["1", "1", "2"])],
        );
        let report = reconcile(&snap, ReconcileOptions::default());
        assert_eq!(
            report.duplicate_events_by_partition_key[UNKNOWN_PARTITION_KEY],
            ids(&["1"])
        );
        assert_eq!(report.duplicate_count, 1);
        assert_eq!(report.received_count, 2);
        assert_eq!(report.lost_count, 0);
    }

    #[test]
    fn test_loss() {
        let snap = snapshot(false, vec![("p1", vec!["a", "b"])], vec![("p1", vec!["a"])]);
        let report = reconcile(&snap, ReconcileOptions::default());
        assert_eq!(report.lost_events_by_partition_key["p1"], ids(&["b"]));
        assert_eq!(report.lost_count, 1);
    }

    #[test]
    fn test_partitions_reconcile_independently() {
        let snap = snapshot(
            true,
            vec![("0", vec!["a", "b", "c"]), ("1", vec!["x", "y"])],
            vec![("0", vec!["a", "c"]), ("1", vec!["x", "y"])],
        );
        let report = reconcile(&snap, ReconcileOptions::default());
        assert_eq!(report.lost_events_by_partition_key.len(), 1);
        assert_eq!(report.lost_events_by_partition_key["0"], ids(&["b"]));
        assert_eq!(report.received_events_by_partition_key["1"], ids(&["x", "y"]));
        assert_eq!(report.received_count, 4);
        assert_eq!(report.lost_count, 1);
    }

    #[test]
    fn test_partition_with_nothing_received() {
        let snap = snapshot(false, vec![("p", vec!["b", "a"])], vec![]);
        let report = reconcile(&snap, ReconcileOptions::default());
        assert_eq!(report.lost_events_by_partition_key["p"], ids(&["a", "b"]));
        assert!(report.received_events_by_partition_key.is_empty());
        assert_eq!(report.duplicate_percentage(), None);
    }

    #[test]
    fn test_ordered_keeps_sent_order_for_lost() {
        let snap = snapshot(true, vec![("0", vec!["c", "a", "b"])], vec![("0", vec!["a"])]);
        let report = reconcile(&snap, ReconcileOptions::default());
        assert_eq!(report.lost_events_by_partition_key["0"], ids(&["c", "b"]));
    }

    #[test]
    fn test_split_duplicates_preserves_counts() {
        let raw = ids(&["a", "b", "a", "c", "b", "a"]);
        let (unique, dups) = split_duplicates(&raw);
        assert_eq!(unique, ids(&["a", "b", "c"]));
        assert_eq!(dups, ids(&["a", "b", "a"]));
        assert_eq!(unique.len() + dups.len(), raw.len());
        let distinct: HashSet<_> = unique.iter().collect();
        assert_eq!(distinct.len(), unique.len());
    }

    #[test]
    fn test_lost_is_set_difference() {
        let sent = ids(&["1", "2", "3", "4"]);
        for received in [ids(&["1", "2", "3", "4", "5"]), ids(&["4", "3", "2", "1"])] {
            assert!(lost_events(&sent, &received, false).is_empty());
        }
        assert_eq!(lost_events(&sent, &ids(&["2", "4"]), false), ids(&["1", "3"]));
    }

    #[test]
    fn test_duplicate_percentage() {
        let mut report = Report::default();
        assert_eq!(report.duplicate_percentage(), None);

        report.duplicate_count = 5;
        report.received_count = 95;
        assert_eq!(report.duplicate_percentage(), Some(5));

        report.duplicate_count = 1;
        report.received_count = 2;
        assert_eq!(report.duplicate_percentage(), Some(33));
    }

    #[test]
    fn test_order_verification() {
        let snap = snapshot(
            true,
            vec![("0", vec!["a", "b", "c"]), ("1", vec!["x", "y", "z"])],
            vec![("0", vec!["a", "c", "b"]), ("1", vec!["x", "x", "z"])],
        );
        let report = reconcile(&snap, ReconcileOptions { verify_order: true });
        assert_eq!(report.order_violations.len(), 1);
        assert_eq!(
            report.order_violations["0"],
            OrderMismatch {
                position: 1,
                expected: "b".into(),
                actual: "c".into(),
            }
        );
        // partition 1 lost "y" but what arrived is in order
        assert_eq!(report.lost_events_by_partition_key["1"], ids(&["y"]));
    }

    #[test]
    fn test_order_verification_off_by_default() {
        let snap = snapshot(true, vec![("0", vec!["a", "b"])], vec![("0", vec!["b", "a"])]);
        let report = reconcile(&snap, ReconcileOptions::default());
        assert!(report.order_violations.is_empty());
    }

    #[test]
    fn test_report_field_names() {
        let snap = snapshot(false, vec![("p1", vec!["a", "b"])], vec![("p1", vec!["a", "a"])]);
        let json = serde_json::to_value(reconcile(&snap, ReconcileOptions::default())).unwrap();
        for field in [
            "lostCount",
            "lostEvents",
            "duplicateCount",
            "duplicateEvents",
            "receivedCount",
            "terminated",
            "metrics",
        ] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
        assert!(json.get("receivedEvents").is_none());
        assert!(json.get("orderViolations").is_none());
        assert_eq!(json["lostEvents"]["p1"][0], "b");
    }

    fn small_ids() -> impl Strategy<Value = Vec<String>> {
        proptest::collection::vec((0u8..20).prop_map(|n| n.to_string()), 0..40)
    }

    proptest! {
        #[test]
        fn test_split_duplicates_partitions_input(raw in small_ids()) {
            let (unique, dups) = split_duplicates(&raw);
            prop_assert_eq!(unique.len() + dups.len(), raw.len());

            let distinct: HashSet<&String> = raw.iter().collect();
            prop_assert_eq!(unique.len(), distinct.len());
            prop_assert_eq!(unique.iter().collect::<HashSet<_>>(), distinct);

            // first occurrences keep arrival order
            let mut seen = HashSet::new();
            let firsts: Vec<&String> = raw.iter().filter(|id| seen.insert(*id)).collect();
            prop_assert_eq!(unique.iter().collect::<Vec<_>>(), firsts);

            for id in &unique {
                let total = raw.iter().filter(|r| *r == id).count();
                let repeats = dups.iter().filter(|d| *d == id).count();
                prop_assert_eq!(repeats, total - 1);
            }
        }

        #[test]
        fn test_lost_is_sent_minus_received(sent in small_ids(), received in small_ids()) {
            let snap = LedgerSnapshot {
                ordered: false,
                sent: PartitionLog::from([("p".to_string(), sent.clone())]),
                received: PartitionLog::from([("p".to_string(), received.clone())]),
                terminated: true,
                metrics: Metrics::default(),
            };
            let report = reconcile(&snap, ReconcileOptions::default());

            let received_set: HashSet<&String> = received.iter().collect();
            let mut lost: Vec<String> = sent
                .iter()
                .filter(|id| !received_set.contains(id))
                .cloned()
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            lost.sort();

            prop_assert_eq!(report.lost_count, lost.len());
            prop_assert_eq!(
                report.lost_events_by_partition_key.get("p").cloned().unwrap_or_default(),
                lost
            );
            prop_assert_eq!(report.received_count, received_set.len());
            prop_assert_eq!(report.duplicate_count, received.len() - received_set.len());
        }

        #[test]
        fn test_in_order_delivery_never_flags_order(
            keep in proptest::collection::vec(any::<bool>(), 0..30),
            repeats in proptest::collection::vec(0usize..30, 0..10),
        ) {
            let sent: Vec<String> = (0..keep.len()).map(|i| format!("e{i}")).collect();
            let mut received: Vec<String> = sent
                .iter()
                .zip(&keep)
                .filter(|(_, k)| **k)
                .map(|(id, _)| id.clone())
                .collect();
            let delivered = received.clone();
            for i in repeats {
                if let Some(id) = delivered.get(i) {
                    received.push(id.clone());
                }
            }
            let snap = LedgerSnapshot {
                ordered: true,
                sent: PartitionLog::from([("0".to_string(), sent)]),
                received: PartitionLog::from([("0".to_string(), received)]),
                terminated: true,
                metrics: Metrics::default(),
            };
            let report = reconcile(&snap, ReconcileOptions { verify_order: true });
            prop_assert!(report.order_violations.is_empty());
        }
    }
}
