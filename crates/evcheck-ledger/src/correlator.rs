//! Pairs proposals with transport acceptances.
//!
//! Proposals are recorded when a request is handed to the load generator,
//! acceptances when its response comes back 2xx. The two arrive on
//! separate channels in either order; an event is forwarded to the sent
//! side of the ledger once both halves have been seen, and never twice.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use evcheck_core::{
    AcceptedSignal, AttackStats, HarnessError, HarnessResult, Metrics, ObservedEvent,
    ProposedRecord,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Pairing {
    /// Proposed, acceptance not seen yet.
    pending: HashMap<String, ProposedRecord>,
    /// Accepted, proposal not seen yet.
    confirmed: HashSet<String>,
    proposed: u64,
    matched: u64,
    malformed: u64,
}

/// End-of-run correlator state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationSummary {
    pub proposed_count: u64,
    /// Finalised events, each both proposed and accepted.
    pub accepted_count: u64,
    pub malformed_signals: u64,
    pub unmatched_proposals: Vec<String>,
    pub unmatched_acceptances: Vec<String>,
}

impl CorrelationSummary {
    /// Combine with the load generator's raw statistics.
    pub fn into_metrics(self, stats: AttackStats) -> Metrics {
        Metrics {
            proposed_count: self.proposed_count,
            accepted_count: self.accepted_count,
            malformed_signals: self.malformed_signals,
            unmatched_proposals: self.unmatched_proposals.len() as u64,
            unmatched_acceptances: self.unmatched_acceptances.len() as u64,
            metrics: stats,
        }
    }
}

/// Both correlation maps behind one lock. Matching removes the identifier
/// under the lock, so each identifier is finalised at most once no matter
/// how the two streams interleave.
#[derive(Debug, Default)]
pub struct Correlator {
    state: Mutex<Pairing>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Pairing> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a proposal. Returns the finalised event if its acceptance
    /// already arrived.
    pub fn propose(&self, record: ProposedRecord) -> Option<ObservedEvent> {
        let mut state = self.lock();
        if record.id.is_empty() {
            state.malformed += 1;
            return None;
        }
        state.proposed += 1;
        if state.confirmed.remove(&record.id) {
            state.matched += 1;
            return Some(record.into());
        }
        state.pending.insert(record.id.clone(), record);
        None
    }

    /// Record an acceptance. Returns the finalised event if its proposal
    /// already arrived.
    pub fn accept(&self, signal: AcceptedSignal) -> Option<ObservedEvent> {
        let mut state = self.lock();
        if signal.id.is_empty() {
            state.malformed += 1;
            return None;
        }
        if let Some(record) = state.pending.remove(&signal.id) {
            state.matched += 1;
            return Some(record.into());
        }
        state.confirmed.insert(signal.id);
        None
    }

    pub fn summary(&self) -> CorrelationSummary {
        let state = self.lock();
        let mut unmatched_proposals: Vec<String> = state.pending.keys().cloned().collect();
        let mut unmatched_acceptances: Vec<String> = state.confirmed.iter().cloned().collect();
        unmatched_proposals.sort();
        unmatched_acceptances.sort();
        CorrelationSummary {
            proposed_count: state.proposed,
            accepted_count: state.matched,
            malformed_signals: state.malformed,
            unmatched_proposals,
            unmatched_acceptances,
        }
    }
}

// ---------------------------------------------------------------------------
// Channel plumbing
// ---------------------------------------------------------------------------

/// Producer ends handed to the attack loop. Dropping both ends the run.
#[derive(Debug)]
pub struct CorrelatorInputs {
    pub proposed: mpsc::Sender<ProposedRecord>,
    pub accepted: mpsc::Sender<AcceptedSignal>,
}

/// Completion handle for the two correlator loops.
#[derive(Debug)]
pub struct CorrelatorTask {
    correlator: Arc<Correlator>,
    proposals: JoinHandle<()>,
    acceptances: JoinHandle<()>,
}

/// Spawn the correlator loops. Finalised events go to `sent`; both input
/// channels get `capacity` slots.
pub fn spawn_correlator(
    sent: mpsc::Sender<ObservedEvent>,
    capacity: usize,
) -> (CorrelatorInputs, CorrelatorTask) {
    let correlator = Arc::new(Correlator::new());
    let (proposed_tx, mut proposed_rx) = mpsc::channel::<ProposedRecord>(capacity.max(1));
    let (accepted_tx, mut accepted_rx) = mpsc::channel::<AcceptedSignal>(capacity.max(1));

    let proposals = {
        let correlator = correlator.clone();
        let sent = sent.clone();
        tokio::spawn(async move {
            while let Some(record) = proposed_rx.recv().await {
                if let Some(event) = correlator.propose(record) {
                    forward(&sent, event).await;
                }
            }
            debug!("proposal stream closed");
        })
    };

    let acceptances = {
        let correlator = correlator.clone();
        tokio::spawn(async move {
            while let Some(signal) = accepted_rx.recv().await {
                if let Some(event) = correlator.accept(signal) {
                    forward(&sent, event).await;
                }
            }
            debug!("acceptance stream closed");
        })
    };

    (
        CorrelatorInputs {
            proposed: proposed_tx,
            accepted: accepted_tx,
        },
        CorrelatorTask {
            correlator,
            proposals,
            acceptances,
        },
    )
}

async fn forward(sent: &mpsc::Sender<ObservedEvent>, event: ObservedEvent) {
    if let Err(e) = sent.send(event).await {
        warn!(id = %e.0.id, "sent channel closed, finalised event dropped");
    }
}

impl CorrelatorTask {
    /// Wait for both input channels to be closed and drained. The sent
    /// sender held by the loops is released before this returns.
    pub async fn finish(self) -> HarnessResult<CorrelationSummary> {
        for handle in [self.proposals, self.acceptances] {
            handle
                .await
                .map_err(|e| HarnessError::Lifecycle(format!("correlator loop failed: {e}")))?;
        }
        let summary = self.correlator.summary();
        if !summary.unmatched_proposals.is_empty() || !summary.unmatched_acceptances.is_empty() {
            warn!(
                unmatched_proposals = summary.unmatched_proposals.len(),
                unmatched_acceptances = summary.unmatched_acceptances.len(),
                "correlator finished with unmatched signals"
            );
        }
        if summary.malformed_signals > 0 {
            warn!(
                malformed = summary.malformed_signals,
                "correlator rejected signals with empty identifiers"
            );
        }
        Ok(summary)
    }
}
