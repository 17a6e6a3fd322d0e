//! [`StreamStore`] over gRPC, talking to a `streamstore.v1` server.
//!
//! Wraps the tonic client from [`crate::proto`] and converts between wire
//! messages and the crate's own types, so the repository and the dispatcher
//! never see tonic internals.
//!
//! Error conventions of the server: a version mismatch is
//! `FAILED_PRECONDITION` with the current version in the `actual-version`
//! response metadata; writing to or subscribing to a deleted stream is
//! `NOT_FOUND`.

use std::fmt;

use tokio_stream::StreamExt;
use tonic::transport::Channel;
use uuid::Uuid;

use crate::error::StoreError;
use crate::proto;
use crate::proto::stream_store_client::StreamStoreClient;
use crate::proto::subscribe_response::Content;
use crate::stream::{
    EventData, EventSubscription, ExpectedVersion, ReadStatus, RecordedEvent, StreamSlice,
    StreamStore, StreamTransaction, WriteResult,
};

/// Response metadata key carrying the stream's current version on a
/// version mismatch.
pub const ACTUAL_VERSION_METADATA: &str = "actual-version";

fn expected_to_proto(expected: ExpectedVersion) -> proto::ExpectedVersion {
    let kind = match expected {
        ExpectedVersion::Any => proto::expected_version::Kind::Any(proto::Empty {}),
        ExpectedVersion::NoStream => proto::expected_version::Kind::NoStream(proto::Empty {}),
        ExpectedVersion::Exact(v) => proto::expected_version::Kind::Exact(v),
    };
    proto::ExpectedVersion { kind: Some(kind) }
}

/// Convert an [`EventData`] into the wire `ProposedEvent`.
pub fn to_proto_event(data: &EventData) -> proto::ProposedEvent {
    proto::ProposedEvent {
        event_id: data.event_id.to_string(),
        event_type: data.event_type.clone(),
        is_json: data.is_json,
        data: data.data.clone(),
        metadata: data.metadata.clone(),
    }
}

impl TryFrom<proto::RecordedEvent> for RecordedEvent {
    type Error = StoreError;

    fn try_from(recorded: proto::RecordedEvent) -> Result<Self, Self::Error> {
        let event_id = Uuid::parse_str(&recorded.event_id).map_err(|e| {
            StoreError::Protocol(format!("invalid event id '{}': {e}", recorded.event_id))
        })?;
        Ok(Self {
            event_id,
            stream: recorded.stream,
            event_number: recorded.event_number,
            original_stream: recorded.original_stream,
            original_event_number: recorded.original_event_number,
            event_type: recorded.event_type,
            is_json: recorded.is_json,
            data: recorded.data,
            metadata: recorded.metadata,
            recorded_at: recorded.recorded_at,
        })
    }
}

fn read_status(status: i32) -> Result<ReadStatus, StoreError> {
    match proto::ReadStatus::try_from(status) {
        Ok(proto::ReadStatus::Success) => Ok(ReadStatus::Success),
        Ok(proto::ReadStatus::StreamNotFound) => Ok(ReadStatus::StreamNotFound),
        Ok(proto::ReadStatus::StreamDeleted) => Ok(ReadStatus::StreamDeleted),
        Err(_) => Err(StoreError::Protocol(format!("unknown read status {status}"))),
    }
}

/// Map a failed write or subscribe call onto the store error vocabulary.
fn status_error(stream: &str, expected: Option<ExpectedVersion>, status: tonic::Status) -> StoreError {
    match (status.code(), expected) {
        (tonic::Code::FailedPrecondition, Some(expected)) => {
            let actual = status
                .metadata()
                .get(ACTUAL_VERSION_METADATA)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            StoreError::WrongExpectedVersion {
                stream: stream.to_string(),
                expected,
                actual,
            }
        }
        (tonic::Code::NotFound, _) => StoreError::StreamDeleted(stream.to_string()),
        _ => status.into(),
    }
}

/// gRPC stream store client.
///
/// Clone is cheap: the underlying channel is a shared connection pool.
///
/// # Examples
///
/// ```no_run
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// use std::sync::Arc;
/// use streamfold_es::{EsClient, Repository};
///
/// let client = EsClient::connect("http://127.0.0.1:2113").await?;
/// let repository = Repository::builder(Arc::new(client)).build();
/// # let _ = repository;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct EsClient {
    inner: StreamStoreClient<Channel>,
}

impl fmt::Debug for EsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EsClient").finish_non_exhaustive()
    }
}

impl EsClient {
    /// Connect to a stream store at `endpoint`, e.g. `http://127.0.0.1:2113`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Transport`] if the channel cannot be established.
    pub async fn connect(endpoint: &str) -> Result<Self, StoreError> {
        let inner = StreamStoreClient::connect(endpoint.to_string()).await?;
        tracing::info!(endpoint, "connected to stream store");
        Ok(Self { inner })
    }

    /// Wrap an already configured channel (TLS, timeouts, lazy connect).
    pub fn from_channel(channel: Channel) -> Self {
        Self {
            inner: StreamStoreClient::new(channel),
        }
    }
}

#[tonic::async_trait]
impl StreamStore for EsClient {
    async fn append_to_stream(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<WriteResult, StoreError> {
        let request = proto::AppendRequest {
            stream: stream.to_string(),
            expected_version: Some(expected_to_proto(expected)),
            events: events.iter().map(to_proto_event).collect(),
        };
        let response = self
            .inner
            .clone()
            .append(request)
            .await
            .map_err(|s| status_error(stream, Some(expected), s))?
            .into_inner();
        Ok(WriteResult {
            next_expected_version: response.next_expected_version,
        })
    }

    async fn start_transaction(
        &self,
        stream: &str,
        expected: ExpectedVersion,
    ) -> Result<Box<dyn StreamTransaction>, StoreError> {
        let request = proto::StartTransactionRequest {
            stream: stream.to_string(),
            expected_version: Some(expected_to_proto(expected)),
        };
        let response = self
            .inner
            .clone()
            .start_transaction(request)
            .await
            .map_err(|s| status_error(stream, Some(expected), s))?
            .into_inner();
        tracing::debug!(
            stream,
            transaction_id = response.transaction_id,
            "transaction started"
        );
        Ok(Box::new(GrpcTransaction {
            client: self.inner.clone(),
            stream: stream.to_string(),
            expected,
            transaction_id: response.transaction_id,
        }))
    }

    async fn read_stream_forward(
        &self,
        stream: &str,
        start: u64,
        count: u64,
        resolve_links: bool,
    ) -> Result<StreamSlice, StoreError> {
        let request = proto::ReadStreamRequest {
            stream: stream.to_string(),
            from_event_number: start,
            max_count: count,
            resolve_links,
        };
        let response = self.inner.clone().read_stream_forward(request).await?.into_inner();
        let status = read_status(response.status)?;
        let events = response
            .events
            .into_iter()
            .map(RecordedEvent::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StreamSlice {
            status,
            events,
            next_event_number: response.next_event_number,
            is_end_of_stream: response.is_end_of_stream,
        })
    }

    async fn subscribe_from(
        &self,
        stream: &str,
        last_checkpoint: Option<u64>,
        resolve_links: bool,
    ) -> Result<EventSubscription, StoreError> {
        let request = proto::SubscribeRequest {
            stream: stream.to_string(),
            last_checkpoint,
            resolve_links,
        };
        let responses = self
            .inner
            .clone()
            .subscribe(request)
            .await
            .map_err(|s| status_error(stream, None, s))?
            .into_inner();

        let name = stream.to_string();
        let events = responses.filter_map(move |response| match response {
            Ok(proto::SubscribeResponse {
                content: Some(Content::Event(recorded)),
            }) => Some(RecordedEvent::try_from(recorded)),
            Ok(proto::SubscribeResponse {
                content: Some(Content::CaughtUp(_)),
            }) => {
                tracing::debug!(stream = %name, "subscription caught up");
                None
            }
            Ok(proto::SubscribeResponse { content: None }) => None,
            Err(status) => Some(Err(StoreError::SubscriptionDropped {
                stream: name.clone(),
                reason: status.message().to_string(),
            })),
        });
        Ok(Box::pin(events))
    }
}

/// Server-side transaction handle.
struct GrpcTransaction {
    client: StreamStoreClient<Channel>,
    stream: String,
    expected: ExpectedVersion,
    transaction_id: u64,
}

#[tonic::async_trait]
impl StreamTransaction for GrpcTransaction {
    async fn write(&mut self, events: Vec<EventData>) -> Result<(), StoreError> {
        let request = proto::TransactionWriteRequest {
            transaction_id: self.transaction_id,
            events: events.iter().map(to_proto_event).collect(),
        };
        self.client
            .transaction_write(request)
            .await
            .map_err(|s| status_error(&self.stream, Some(self.expected), s))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<WriteResult, StoreError> {
        let mut this = *self;
        let request = proto::CommitTransactionRequest {
            transaction_id: this.transaction_id,
        };
        let response = this
            .client
            .commit_transaction(request)
            .await
            .map_err(|s| status_error(&this.stream, Some(this.expected), s))?
            .into_inner();
        Ok(WriteResult {
            next_expected_version: response.next_expected_version,
        })
    }
}
