use std::sync::Arc;

use evcheck_core::{HarnessError, HarnessResult, ObservedEvent, Side};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::ledger::Ledger;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub inserted: u64,
    /// Events dropped for an empty identifier.
    pub rejected: u64,
}

/// Completion handle for one feeder loop.
#[derive(Debug)]
pub struct Feeder {
    side: Side,
    handle: JoinHandle<FeedStats>,
}

impl Feeder {
    /// Drain `rx` into one side of `ledger` until every sender is dropped.
    pub fn spawn(ledger: Arc<Ledger>, side: Side, mut rx: mpsc::Receiver<ObservedEvent>) -> Self {
        let handle = tokio::spawn(async move {
            let mut stats = FeedStats::default();
            while let Some(event) = rx.recv().await {
                match ledger.insert(side, &event.id, event.partition_key.as_deref()) {
                    Ok(()) => stats.inserted += 1,
                    Err(e) => {
                        warn!(%side, "dropping event: {e}");
                        stats.rejected += 1;
                    }
                }
            }
            debug!(%side, inserted = stats.inserted, "feeder drained");
            stats
        });
        Self { side, handle }
    }

    /// Resolves once the channel is closed and fully drained.
    pub async fn drained(self) -> HarnessResult<FeedStats> {
        self.handle
            .await
            .map_err(|e| HarnessError::Lifecycle(format!("{} feeder failed: {e}", self.side)))
    }
}
