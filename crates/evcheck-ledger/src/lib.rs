pub mod correlator;
pub mod feeder;
pub mod ledger;
pub mod reconcile;

pub use correlator::{
    spawn_correlator, CorrelationSummary, Correlator, CorrelatorInputs, CorrelatorTask,
};
pub use feeder::{FeedStats, Feeder};
pub use ledger::{Ledger, LedgerConfig, LedgerSnapshot, PartitionLog};
pub use reconcile::{reconcile, split_duplicates, OrderMismatch, ReconcileOptions, Report};
