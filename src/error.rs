//! Crate-level error types for the stream store boundary, the event codec,
//! and the aggregate repository.

use crate::stream::ExpectedVersion;

/// Boxed error used at the processing-chain and handler seams, where the
/// concrete error type belongs to the caller.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned by a [`StreamStore`](crate::StreamStore) implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The stream was not at the version the writer expected.
    ///
    /// `actual` carries the stream's current version when the store reports
    /// it; remote stores may omit it.
    #[error("wrong expected version for stream '{stream}': expected {expected}, actual {}", DisplayVersion::of(.actual))]
    WrongExpectedVersion {
        stream: String,
        expected: ExpectedVersion,
        actual: Option<u64>,
    },

    /// The stream has been deleted and accepts neither reads nor writes.
    #[error("stream '{0}' has been deleted")]
    StreamDeleted(String),

    /// A live subscription ended, either by the server or the transport.
    #[error("subscription to '{stream}' dropped: {reason}")]
    SubscriptionDropped { stream: String, reason: String },

    /// The server sent a record this client cannot interpret.
    #[error("malformed record from store: {0}")]
    Protocol(String),

    /// gRPC call failed.
    #[error("gRPC error: {0}")]
    Grpc(Box<tonic::Status>),

    /// Channel could not be established.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Local I/O failure (checkpoint files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tonic::Status> for StoreError {
    fn from(status: tonic::Status) -> Self {
        Self::Grpc(Box::new(status))
    }
}

/// Formats an optional version as a number or `unknown`.
struct DisplayVersion(Option<u64>);

impl DisplayVersion {
    fn of(version: &Option<u64>) -> Self {
        Self(*version)
    }
}

impl std::fmt::Display for DisplayVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(v) => write!(f, "{v}"),
            None => f.write_str("unknown"),
        }
    }
}

/// Error produced while encoding or decoding events.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// A value could not be serialized to JSON.
    #[error("failed to serialize event: {0}")]
    Serialize(#[source] serde_json::Error),

    /// Stored bytes could not be parsed back into JSON.
    #[error("failed to deserialize event '{event_type}': {source}")]
    Deserialize {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// The record is flagged as non-JSON, which this codec cannot read.
    #[error("event '{0}' is not JSON encoded")]
    NotJson(String),

    /// A domain event did not serialize to an adjacently tagged object.
    #[error("domain event must serialize to an object with a string \"type\" field")]
    Untagged,
}

/// Error returned by the aggregate repository.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// Replay produced a version different from the one requested.
    #[error(
        "aggregate {aggregate_type} '{id}' replayed to version {actual}, but version {requested} was requested"
    )]
    AggregateVersion {
        aggregate_type: &'static str,
        id: String,
        requested: u64,
        actual: u64,
    },

    /// A concurrent writer appended events that conflict with ours.
    #[error("conflicting events in stream '{stream}': expected version {expected}, found {actual}")]
    ConflictingEvents {
        stream: String,
        expected: ExpectedVersion,
        actual: u64,
    },

    /// The stream was deleted; loading or saving cannot proceed.
    #[error("stream '{0}' has been deleted")]
    StreamDeleted(String),

    /// A stored record could not be decoded while replaying.
    #[error("failed to decode event {event_number} of stream '{stream}': {source}")]
    Decode {
        stream: String,
        event_number: u64,
        #[source]
        source: CodecError,
    },

    /// Encoding outgoing events failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Any other store failure.
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for RepositoryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::StreamDeleted(stream) => Self::StreamDeleted(stream),
            other => Self::Store(other),
        }
    }
}
