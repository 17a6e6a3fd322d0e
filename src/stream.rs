//! The stream store boundary: an ordered, per-stream append-only log with
//! optimistic-concurrency writes, paged forward reads, and live
//! subscriptions.
//!
//! [`StreamStore`] is the seam the repository and the dispatcher talk to.
//! [`EsClient`](crate::EsClient) implements it over gRPC and
//! [`InMemoryStreamStore`](crate::InMemoryStreamStore) in process.

use std::fmt;
use std::pin::Pin;

use tokio_stream::Stream;
use uuid::Uuid;

use crate::error::StoreError;

/// Event type used for link records that point at an event in another stream.
pub const LINK_EVENT_TYPE: &str = "$>";

/// Expected stream version for optimistic concurrency.
///
/// A stream's version is the number of events it holds, so `Exact(n)` means
/// "exactly `n` events have been written so far".
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ExpectedVersion {
    /// Accept any current stream version (no concurrency check).
    Any,
    /// The stream must not contain any events yet.
    NoStream,
    /// The stream must hold exactly this many events.
    Exact(u64),
}

impl ExpectedVersion {
    /// Whether a stream currently holding `current` events satisfies this
    /// expectation.
    pub fn matches(self, current: u64) -> bool {
        match self {
            Self::Any => true,
            Self::NoStream => current == 0,
            Self::Exact(v) => v == current,
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any"),
            Self::NoStream => f.write_str("no stream"),
            Self::Exact(v) => write!(f, "{v}"),
        }
    }
}

/// A serialized event ready to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct EventData {
    pub event_id: Uuid,
    pub event_type: String,
    pub is_json: bool,
    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
}

impl EventData {
    /// Build a link record pointing at event `event_number` of `stream`.
    ///
    /// Stores that resolve links substitute the target event when the link
    /// is read with `resolve_links = true`.
    pub fn link_to(stream: &str, event_number: u64) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: LINK_EVENT_TYPE.to_string(),
            is_json: false,
            data: format!("{event_number}@{stream}").into_bytes(),
            metadata: Vec::new(),
        }
    }
}

/// An event as stored, including its position.
///
/// `stream`/`event_number` identify the event itself. `original_stream` /
/// `original_event_number` identify the record that was actually read,
/// which differs from the former only for resolved links.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub event_id: Uuid,
    pub stream: String,
    pub event_number: u64,
    pub original_stream: String,
    pub original_event_number: u64,
    pub event_type: String,
    pub is_json: bool,
    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
    /// Milliseconds since the Unix epoch.
    pub recorded_at: u64,
}

impl RecordedEvent {
    /// Parse the `"{number}@{stream}"` target of a link record.
    pub fn link_target(&self) -> Option<(u64, &str)> {
        if self.event_type != LINK_EVENT_TYPE {
            return None;
        }
        let text = std::str::from_utf8(&self.data).ok()?;
        let (number, stream) = text.split_once('@')?;
        Some((number.parse().ok()?, stream))
    }
}

/// Outcome of a forward read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Success,
    StreamNotFound,
    StreamDeleted,
}

/// One page of a forward read.
#[derive(Debug, Clone)]
pub struct StreamSlice {
    pub status: ReadStatus,
    pub events: Vec<RecordedEvent>,
    /// Event number to start the next page from.
    pub next_event_number: u64,
    pub is_end_of_stream: bool,
}

impl StreamSlice {
    /// An empty, terminal slice with the given status.
    pub fn empty(status: ReadStatus, from: u64) -> Self {
        Self {
            status,
            events: Vec::new(),
            next_event_number: from,
            is_end_of_stream: true,
        }
    }
}

/// Result of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    /// Stream version after the write.
    pub next_expected_version: u64,
}

/// A live subscription: yields events in stream order and ends (or yields an
/// error) when the subscription is dropped.
pub type EventSubscription = Pin<Box<dyn Stream<Item = Result<RecordedEvent, StoreError>> + Send>>;

/// Client-side view of an ordered, append-only stream store.
#[tonic::async_trait]
pub trait StreamStore: Send + Sync + 'static {
    /// Append `events` atomically if the stream matches `expected`.
    ///
    /// # Errors
    ///
    /// [`StoreError::WrongExpectedVersion`] on a version mismatch,
    /// [`StoreError::StreamDeleted`] if the stream was deleted.
    async fn append_to_stream(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<WriteResult, StoreError>;

    /// Open a multi-write transaction. The expected version is checked when
    /// the transaction is opened.
    async fn start_transaction(
        &self,
        stream: &str,
        expected: ExpectedVersion,
    ) -> Result<Box<dyn StreamTransaction>, StoreError>;

    /// Read up to `count` events starting at `start`.
    ///
    /// Missing and deleted streams are reported through
    /// [`StreamSlice::status`], not as errors.
    async fn read_stream_forward(
        &self,
        stream: &str,
        start: u64,
        count: u64,
        resolve_links: bool,
    ) -> Result<StreamSlice, StoreError>;

    /// Subscribe to `stream`, delivering every event after `last_checkpoint`
    /// (or from the beginning when `None`) and then live appends.
    async fn subscribe_from(
        &self,
        stream: &str,
        last_checkpoint: Option<u64>,
        resolve_links: bool,
    ) -> Result<EventSubscription, StoreError>;
}

/// A pending multi-write transaction against one stream.
#[tonic::async_trait]
pub trait StreamTransaction: Send {
    async fn write(&mut self, events: Vec<EventData>) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<WriteResult, StoreError>;
}

/// Qualify `base` with `context`, leaving it unchanged for an empty context.
///
/// # Examples
///
/// ```
/// use streamfold_es::stream_name;
///
/// assert_eq!(stream_name("", "order-123"), "order-123");
/// assert_eq!(stream_name("tenant-a", "order-123"), "tenant-a-order-123");
/// ```
pub fn stream_name(context: &str, base: &str) -> String {
    if context.is_empty() {
        base.to_string()
    } else {
        format!("{context}-{base}")
    }
}

/// Deterministic stream name for one aggregate instance.
///
/// # Examples
///
/// ```
/// use streamfold_es::aggregate_stream_name;
///
/// assert_eq!(aggregate_stream_name("order", "123", ""), "order-123");
/// ```
pub fn aggregate_stream_name(aggregate_type: &str, id: &str, context: &str) -> String {
    stream_name(context, &format!("{aggregate_type}-{id}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_version_matching() {
        assert!(ExpectedVersion::Any.matches(0));
        assert!(ExpectedVersion::Any.matches(42));
        assert!(ExpectedVersion::NoStream.matches(0));
        assert!(!ExpectedVersion::NoStream.matches(1));
        assert!(ExpectedVersion::Exact(3).matches(3));
        assert!(!ExpectedVersion::Exact(3).matches(4));
    }

    #[test]
    fn expected_version_display() {
        assert_eq!(ExpectedVersion::Any.to_string(), "any");
        assert_eq!(ExpectedVersion::NoStream.to_string(), "no stream");
        assert_eq!(ExpectedVersion::Exact(7).to_string(), "7");
    }

    #[test]
    fn link_target_parses_number_and_stream() {
        let link = EventData::link_to("order-1", 4);
        let recorded = RecordedEvent {
            event_id: link.event_id,
            stream: "pm-orders".into(),
            event_number: 0,
            original_stream: "pm-orders".into(),
            original_event_number: 0,
            event_type: link.event_type,
            is_json: false,
            data: link.data,
            metadata: Vec::new(),
            recorded_at: 0,
        };
        assert_eq!(recorded.link_target(), Some((4, "order-1")));
    }

    #[test]
    fn non_link_has_no_target() {
        let recorded = RecordedEvent {
            event_id: Uuid::new_v4(),
            stream: "s".into(),
            event_number: 0,
            original_stream: "s".into(),
            original_event_number: 0,
            event_type: "Placed".into(),
            is_json: true,
            data: b"4@other".to_vec(),
            metadata: Vec::new(),
            recorded_at: 0,
        };
        assert_eq!(recorded.link_target(), None);
    }

    #[test]
    fn aggregate_stream_names_are_deterministic() {
        assert_eq!(aggregate_stream_name("order", "123", ""), "order-123");
        assert_eq!(
            aggregate_stream_name("order", "123", "eu"),
            aggregate_stream_name("order", "123", "eu")
        );
        assert_ne!(
            aggregate_stream_name("order", "123", "eu"),
            aggregate_stream_name("order", "123", "us")
        );
    }
}
