use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use evcheck_core::{
    EncodedEvent, Event, EventCodec, HarnessError, HarnessResult, BENCHMARK_TIMESTAMP_ATTRIBUTE,
    PARTITION_KEY_ATTRIBUTE,
};

pub const STRUCTURED_CONTENT_TYPE: &str = "application/cloudevents+json";
pub const SPEC_VERSION: &str = "1.0";

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct WireEvent {
    specversion: String,
    id: String,
    source: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    datacontenttype: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    partitionkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    benchmarktimestamp: Option<String>,
}

fn parse_timestamp(raw: Option<&str>) -> HarnessResult<Option<i64>> {
    raw.map(|v| {
        v.parse::<i64>().map_err(|e| {
            HarnessError::Codec(format!("invalid {BENCHMARK_TIMESTAMP_ATTRIBUTE} {v:?}: {e}"))
        })
    })
    .transpose()
}

/// JSON event codec. Encodes in structured mode; decodes both structured
/// bodies and binary mode, where attributes travel as headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEventCodec;

impl JsonEventCodec {
    fn decode_structured(&self, body: &[u8]) -> HarnessResult<Event> {
        let wire: WireEvent = serde_json::from_slice(body)
            .map_err(|e| HarnessError::Codec(format!("malformed event body: {e}")))?;
        if wire.id.is_empty() {
            return Err(HarnessError::Codec("event id is empty".into()));
        }
        Ok(Event {
            benchmark_timestamp: parse_timestamp(wire.benchmarktimestamp.as_deref())?,
            id: wire.id,
            source: wire.source,
            event_type: wire.event_type,
            partition_key: wire.partitionkey,
            data: wire.data,
        })
    }

    fn decode_binary(
        &self,
        content_type: Option<&str>,
        attributes: &BTreeMap<String, String>,
        body: &[u8],
    ) -> HarnessResult<Event> {
        let required = |name: &str| {
            attributes
                .get(name)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| HarnessError::Codec(format!("missing attribute {name}")))
        };
        required("specversion")?;

        let data = if body.is_empty() {
            Value::Null
        } else if content_type.is_some_and(|ct| ct.contains("json")) {
            serde_json::from_slice(body)
                .map_err(|e| HarnessError::Codec(format!("malformed event data: {e}")))?
        } else {
            Value::String(String::from_utf8_lossy(body).into_owned())
        };

        Ok(Event {
            id: required("id")?,
            source: required("source")?,
            event_type: required("type")?,
            partition_key: attributes.get(PARTITION_KEY_ATTRIBUTE).cloned(),
            benchmark_timestamp: parse_timestamp(
                attributes
                    .get(BENCHMARK_TIMESTAMP_ATTRIBUTE)
                    .map(String::as_str),
            )?,
            data,
        })
    }
}

impl EventCodec for JsonEventCodec {
    fn encode(&self, event: &Event) -> HarnessResult<EncodedEvent> {
        let wire = WireEvent {
            specversion: SPEC_VERSION.into(),
            id: event.id.clone(),
            source: event.source.clone(),
            event_type: event.event_type.clone(),
            datacontenttype: (!event.data.is_null()).then(|| "application/json".to_string()),
            data: event.data.clone(),
            partitionkey: event.partition_key.clone(),
            benchmarktimestamp: event.benchmark_timestamp.map(|t| t.to_string()),
        };
        Ok(EncodedEvent {
            content_type: STRUCTURED_CONTENT_TYPE.into(),
            body: serde_json::to_vec(&wire)?,
        })
    }

    fn decode(
        &self,
        content_type: Option<&str>,
        attributes: &BTreeMap<String, String>,
        body: &[u8],
    ) -> HarnessResult<Event> {
        let structured = content_type.is_some_and(|ct| ct.starts_with(STRUCTURED_CONTENT_TYPE));
        if structured || !attributes.contains_key("id") {
            self.decode_structured(body)
        } else {
            self.decode_binary(content_type, attributes, body)
        }
    }
}
