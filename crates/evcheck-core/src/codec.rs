use std::collections::BTreeMap;

use crate::error::HarnessResult;
use crate::event::Event;

/// Wire body plus the content type it must be sent with.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedEvent {
    pub content_type: String,
    pub body: Vec<u8>,
}

pub trait EventCodec: Send + Sync {
    fn encode(&self, event: &Event) -> HarnessResult<EncodedEvent>;

    /// `attributes` holds header-borne event attributes keyed by their
    /// lowercase name without the transport prefix.
    fn decode(
        &self,
        content_type: Option<&str>,
        attributes: &BTreeMap<String, String>,
        body: &[u8],
    ) -> HarnessResult<Event>;
}
