pub mod codec;
pub mod error;
pub mod event;
pub mod load;
pub mod metrics;
pub mod recorder;
pub mod shutdown;

pub use codec::{EncodedEvent, EventCodec};
pub use error::{HarnessError, HarnessResult};
pub use event::{
    AcceptedSignal, Event, ObservedEvent, ProposedRecord, Side, BENCHMARK_TIMESTAMP_ATTRIBUTE,
    PARTITION_KEY_ATTRIBUTE, UNKNOWN_PARTITION_KEY,
};
pub use load::{LoadGenerator, Target, Targeter};
pub use metrics::{AttackResult, AttackStats, ByteSummary, LatencySummary, Metrics};
pub use recorder::{LatencyRecorder, RecorderSnapshot};
pub use shutdown::{Shutdown, ShutdownListener};
