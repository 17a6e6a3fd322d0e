//! Event encoding and decoding.
//!
//! Domain events use adjacently tagged serde (`#[serde(tag = "type",
//! content = "data")]`). [`encode_event`] splits such a value into an
//! [`EventPayload`] (type tag plus JSON data); an [`EventCodec`] then turns
//! the payload and its commit headers into wire bytes, and back.
//!
//! No network I/O occurs here.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::error::CodecError;
use crate::metadata::Headers;
use crate::stream::{EventData, RecordedEvent};

/// Type tag plus JSON body of one domain event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPayload {
    pub event_type: String,
    pub data: Value,
}

impl EventPayload {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }
}

/// Split an adjacently tagged domain event into an [`EventPayload`].
///
/// # Arguments
///
/// * `event` - The domain event. Must serialize to `{"type": ..., "data": ...}`
///   (the `data` field is absent for unit variants).
///
/// # Errors
///
/// [`CodecError::Serialize`] if serialization fails, [`CodecError::Untagged`]
/// if the value is not a tagged object.
pub fn encode_event<E: Serialize>(event: &E) -> Result<EventPayload, CodecError> {
    let value = serde_json::to_value(event).map_err(CodecError::Serialize)?;
    let Value::Object(mut obj) = value else {
        return Err(CodecError::Untagged);
    };
    let Some(Value::String(event_type)) = obj.remove("type") else {
        return Err(CodecError::Untagged);
    };
    let data = obj.remove("data").unwrap_or(Value::Null);
    Ok(EventPayload { event_type, data })
}

/// An event successfully decoded from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub event_id: Uuid,
    pub event_number: u64,
    pub original_event_number: u64,
    pub event_type: String,
    pub data: Value,
    pub metadata: Headers,
}

impl DecodedEvent {
    /// Reassemble the adjacently tagged form and deserialize it as `E`.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the type tag is unknown to `E` or the
    /// data does not match the variant.
    pub fn to_domain<E: DeserializeOwned>(&self) -> serde_json::Result<E> {
        let tagged = if self.data.is_null() {
            serde_json::json!({ "type": self.event_type })
        } else {
            serde_json::json!({ "type": self.event_type, "data": self.data })
        };
        serde_json::from_value(tagged)
    }

    /// Look up a metadata header.
    pub fn header(&self, name: &str) -> Option<&Value> {
        self.metadata.get(name)
    }
}

/// An event that could not be decoded.
///
/// Keeps the raw payload so the failure can be reported with its original
/// bytes; such events are never silently discarded.
#[derive(Debug)]
pub struct FailedEvent {
    pub event_id: Uuid,
    pub event_number: u64,
    pub original_event_number: u64,
    pub event_type: String,
    pub data: Vec<u8>,
    /// Best-effort parse of the metadata; empty if it was unreadable.
    pub metadata: Headers,
    pub error: CodecError,
}

/// Decoded event, or the failure with its raw payload.
pub type DeserializationResult = Result<DecodedEvent, FailedEvent>;

/// Position of a deserialization result in the stream it was read from.
pub(crate) fn original_event_number(result: &DeserializationResult) -> u64 {
    match result {
        Ok(event) => event.original_event_number,
        Err(failed) => failed.original_event_number,
    }
}

/// Pluggable wire codec for events and their headers.
pub trait EventCodec: Send + Sync + 'static {
    /// Produce the wire form of one event.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the payload or headers cannot be encoded.
    fn serialize(
        &self,
        event_id: Uuid,
        payload: &EventPayload,
        headers: &Headers,
    ) -> Result<EventData, CodecError>;

    /// Decode a stored record. Never panics; failures come back as
    /// [`FailedEvent`].
    fn deserialize(&self, recorded: &RecordedEvent) -> DeserializationResult;
}

/// JSON codec: data and headers are stored as UTF-8 JSON documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl EventCodec for JsonCodec {
    fn serialize(
        &self,
        event_id: Uuid,
        payload: &EventPayload,
        headers: &Headers,
    ) -> Result<EventData, CodecError> {
        let data = serde_json::to_vec(&payload.data).map_err(CodecError::Serialize)?;
        let metadata = serde_json::to_vec(headers).map_err(CodecError::Serialize)?;
        Ok(EventData {
            event_id,
            event_type: payload.event_type.clone(),
            is_json: true,
            data,
            metadata,
        })
    }

    fn deserialize(&self, recorded: &RecordedEvent) -> DeserializationResult {
        let metadata = parse_headers(&recorded.metadata);
        let fail = |error: CodecError, metadata: Headers| FailedEvent {
            event_id: recorded.event_id,
            event_number: recorded.event_number,
            original_event_number: recorded.original_event_number,
            event_type: recorded.event_type.clone(),
            data: recorded.data.clone(),
            metadata,
            error,
        };

        let metadata = match metadata {
            Ok(headers) => headers,
            Err(source) => {
                return Err(fail(
                    CodecError::Deserialize {
                        event_type: recorded.event_type.clone(),
                        source,
                    },
                    Headers::new(),
                ));
            }
        };

        if !recorded.is_json {
            return Err(fail(
                CodecError::NotJson(recorded.event_type.clone()),
                metadata,
            ));
        }

        let data = if recorded.data.is_empty() {
            Value::Null
        } else {
            match serde_json::from_slice(&recorded.data) {
                Ok(value) => value,
                Err(source) => {
                    return Err(fail(
                        CodecError::Deserialize {
                            event_type: recorded.event_type.clone(),
                            source,
                        },
                        metadata,
                    ));
                }
            }
        };

        Ok(DecodedEvent {
            event_id: recorded.event_id,
            event_number: recorded.event_number,
            original_event_number: recorded.original_event_number,
            event_type: recorded.event_type.clone(),
            data,
            metadata,
        })
    }
}

/// Parse metadata bytes as a JSON object; empty bytes are an empty bag.
fn parse_headers(bytes: &[u8]) -> serde_json::Result<Headers> {
    if bytes.is_empty() {
        return Ok(Headers::new());
    }
    serde_json::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::CounterEvent;
    use serde_json::json;

    fn recorded(event_type: &str, is_json: bool, data: &[u8], metadata: &[u8]) -> RecordedEvent {
        RecordedEvent {
            event_id: Uuid::new_v4(),
            stream: "counter-c-1".into(),
            event_number: 2,
            original_stream: "counter-c-1".into(),
            original_event_number: 2,
            event_type: event_type.into(),
            is_json,
            data: data.to_vec(),
            metadata: metadata.to_vec(),
            recorded_at: 0,
        }
    }

    #[test]
    fn encode_event_with_data() {
        let payload = encode_event(&CounterEvent::Added { amount: 5 }).expect("encode");
        assert_eq!(payload.event_type, "Added");
        assert_eq!(payload.data, json!({"amount": 5}));
    }

    #[test]
    fn encode_unit_variant_has_null_data() {
        let payload = encode_event(&CounterEvent::Incremented).expect("encode");
        assert_eq!(payload.event_type, "Incremented");
        assert!(payload.data.is_null());
    }

    #[test]
    fn encode_untagged_value_is_rejected() {
        let err = encode_event(&42u32).unwrap_err();
        assert!(matches!(err, CodecError::Untagged), "got: {err}");
    }

    #[test]
    fn json_codec_writes_headers_and_data() {
        let mut headers = Headers::new();
        headers.insert("CommitId".into(), json!("c-1"));
        let id = Uuid::new_v4();

        let data = JsonCodec
            .serialize(id, &EventPayload::new("Added", json!({"amount": 1})), &headers)
            .expect("serialize");

        assert_eq!(data.event_id, id);
        assert_eq!(data.event_type, "Added");
        assert!(data.is_json);
        let meta: Value = serde_json::from_slice(&data.metadata).expect("metadata json");
        assert_eq!(meta["CommitId"], "c-1");
    }

    #[test]
    fn decoded_event_converts_back_to_domain() {
        let rec = recorded("Added", true, br#"{"amount":3}"#, br#"{"AggregateId":"c-1"}"#);
        let decoded = JsonCodec.deserialize(&rec).expect("decode");

        assert_eq!(decoded.header("AggregateId"), Some(&json!("c-1")));
        let event: CounterEvent = decoded.to_domain().expect("domain event");
        assert_eq!(event, CounterEvent::Added { amount: 3 });
    }

    #[test]
    fn empty_data_decodes_to_unit_variant() {
        let rec = recorded("Incremented", true, b"", b"");
        let decoded = JsonCodec.deserialize(&rec).expect("decode");
        assert!(decoded.metadata.is_empty());
        let event: CounterEvent = decoded.to_domain().expect("domain event");
        assert_eq!(event, CounterEvent::Incremented);
    }

    #[test]
    fn malformed_data_keeps_raw_payload_and_metadata() {
        let rec = recorded("Added", true, b"{not json", br#"{"PartitionKey":"A"}"#);
        let failed = JsonCodec.deserialize(&rec).unwrap_err();

        assert_eq!(failed.data, b"{not json");
        assert_eq!(failed.metadata["PartitionKey"], "A");
        assert_eq!(failed.original_event_number, 2);
        assert!(matches!(failed.error, CodecError::Deserialize { .. }));
    }

    #[test]
    fn malformed_metadata_is_a_failure() {
        let rec = recorded("Added", true, br#"{"amount":1}"#, b"\xff\xfe");
        let failed = JsonCodec.deserialize(&rec).unwrap_err();
        assert!(failed.metadata.is_empty());
    }

    #[test]
    fn binary_event_is_not_decoded() {
        let rec = recorded("Blob", false, b"\x00\x01", b"");
        let failed = JsonCodec.deserialize(&rec).unwrap_err();
        assert!(matches!(failed.error, CodecError::NotJson(ref t) if t == "Blob"));
    }
}
