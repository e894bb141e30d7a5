use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use evcheck_core::{HarnessError, HarnessResult, Metrics, Side, UNKNOWN_PARTITION_KEY};
use tracing::debug;

/// Per-partition identifier sequences in arrival order.
pub type PartitionLog = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Bucket events by their partition key instead of a single bucket.
    pub ordered: bool,
}

#[derive(Debug, Default)]
struct Books {
    sent: HashMap<String, Vec<String>>,
    received: HashMap<String, Vec<String>>,
    terminated: bool,
    metrics: Metrics,
}

/// Sent and received identifiers for one run, bucketed by partition key.
///
/// Identifiers are appended as observed; duplicates are kept since duplicate
/// delivery is one of the measured properties.
#[derive(Debug, Default)]
pub struct Ledger {
    config: LedgerConfig,
    books: RwLock<Books>,
}

/// Read-only copy of a ledger, detached from the live maps.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    pub ordered: bool,
    pub sent: PartitionLog,
    pub received: PartitionLog,
    pub terminated: bool,
    pub metrics: Metrics,
}

impl Ledger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            books: RwLock::new(Books::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Books> {
        self.books.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Books> {
        self.books.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn partition_of<'a>(&self, partition_key: Option<&'a str>) -> &'a str {
        match partition_key {
            Some(pk) if self.config.ordered => pk,
            _ => UNKNOWN_PARTITION_KEY,
        }
    }

    pub fn insert(&self, side: Side, id: &str, partition_key: Option<&str>) -> HarnessResult<()> {
        if id.is_empty() {
            return Err(HarnessError::EmptyIdentifier);
        }
        let pk = self.partition_of(partition_key);
        let mut books = self.write();
        let store = match side {
            Side::Sent => &mut books.sent,
            Side::Received => &mut books.received,
        };
        match store.get_mut(pk) {
            Some(ids) => ids.push(id.to_string()),
            None => {
                debug!(%side, partition = pk, "new partition");
                let mut ids = Vec::with_capacity(100);
                ids.push(id.to_string());
                store.insert(pk.to_string(), ids);
            }
        }
        Ok(())
    }

    pub fn insert_sent(&self, id: &str, partition_key: Option<&str>) -> HarnessResult<()> {
        self.insert(Side::Sent, id, partition_key)
    }

    pub fn insert_received(&self, id: &str, partition_key: Option<&str>) -> HarnessResult<()> {
        self.insert(Side::Received, id, partition_key)
    }

    /// Received identifiers across all partitions, duplicates included.
    pub fn received_count(&self) -> usize {
        self.read().received.values().map(Vec::len).sum()
    }

    pub fn sent_count(&self) -> usize {
        self.read().sent.values().map(Vec::len).sum()
    }

    /// Record the final attack metrics. Must be called once, after both
    /// feeders have drained.
    pub fn mark_terminated(&self, metrics: Metrics) -> HarnessResult<()> {
        let mut books = self.write();
        if books.terminated {
            return Err(HarnessError::Lifecycle(
                "ledger already marked terminated".into(),
            ));
        }
        books.terminated = true;
        books.metrics = metrics;
        Ok(())
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let books = self.read();
        let copy = |m: &HashMap<String, Vec<String>>| {
            m.iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<PartitionLog>()
        };
        LedgerSnapshot {
            ordered: self.config.ordered,
            sent: copy(&books.sent),
            received: copy(&books.received),
            terminated: books.terminated,
            metrics: books.metrics.clone(),
        }
    }
}
