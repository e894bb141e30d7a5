use std::sync::Arc;

use tokio::sync::mpsc;
use ulid::Ulid;

use evcheck_core::{
    Event, EventCodec, HarnessError, HarnessResult, ProposedRecord, Target, Targeter,
};

/// Request header carrying the event identifier, read back from each
/// attack result to raise the acceptance signal.
pub const EVENT_ID_HEADER: &str = "Event-Id";

type IdSource = Box<dyn Fn() -> Ulid + Send + Sync>;

/// Builds one fresh event per request and records it as proposed.
pub struct EventTargeter {
    url: String,
    num_partition_keys: Option<u8>,
    codec: Arc<dyn EventCodec>,
    proposed: mpsc::Sender<ProposedRecord>,
    new_id: IdSource,
}

impl EventTargeter {
    /// `num_partition_keys` enables ordering mode: each event gets a
    /// partition key drawn uniformly from `0..n`.
    pub fn new(
        url: impl Into<String>,
        num_partition_keys: Option<u8>,
        codec: Arc<dyn EventCodec>,
        proposed: mpsc::Sender<ProposedRecord>,
    ) -> Self {
        Self {
            url: url.into(),
            num_partition_keys,
            codec,
            proposed,
            new_id: Box::new(Ulid::new),
        }
    }

    pub fn with_id_source(mut self, new_id: impl Fn() -> Ulid + Send + Sync + 'static) -> Self {
        self.new_id = Box::new(new_id);
        self
    }

    fn build_event(&self) -> Event {
        let ulid = (self.new_id)();
        let mut event = Event::new(ulid.to_string()).stamped();
        if let Some(n) = self.num_partition_keys.filter(|n| *n > 0) {
            event.partition_key = Some((ulid.random() % u128::from(n)).to_string());
        }
        event
    }
}

impl Targeter for EventTargeter {
    /// Must be called off the async runtime: the proposal is handed over
    /// with a blocking send.
    fn next_target(&self) -> HarnessResult<Target> {
        let event = self.build_event();
        let encoded = self.codec.encode(&event)?;

        let target = Target {
            method: "POST".into(),
            url: self.url.clone(),
            headers: vec![
                ("Content-Type".into(), encoded.content_type),
                (EVENT_ID_HEADER.into(), event.id.clone()),
            ],
            body: encoded.body,
        };

        self.proposed
            .blocking_send(ProposedRecord::from(&event))
            .map_err(|_| HarnessError::Lifecycle("proposal channel closed".into()))?;

        Ok(target)
    }
}
