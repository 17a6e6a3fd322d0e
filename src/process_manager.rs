//! Process managers: long-running workflow handlers fed by the dispatcher.
//!
//! A process manager subscribes to one stream. The
//! [`ProcessManagerDispatcher`](crate::ProcessManagerDispatcher) batches the
//! events arriving on it, splits each batch into partitions by a key found
//! in the event headers, and hands every partition to a [`ProcessingChain`]
//! as a [`PartitionRequest`]. Failures are reported through an
//! [`ExceptionSink`] into the error stream instead of stopping the
//! subscription.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::BoxError;
use crate::event::{DecodedEvent, EventCodec, EventPayload, FailedEvent, JsonCodec};
use crate::metadata::{AGGREGATE_ID_HEADER, ActionMetadata, Headers, PARTITION_KEY_HEADER};
use crate::repository::{Repository, UnitOfWork};
use crate::stream::{ExpectedVersion, StreamStore};

/// Header naming the process manager that produced a commit or a failure.
pub const PROCESS_MANAGER_HEADER: &str = "ProcessManager";

/// A workflow handler driven by the dispatcher.
///
/// # Contract
///
/// - [`name`](ProcessManager::name) is unique per dispatcher and doubles as
///   the checkpoint key.
/// - [`handle`](ProcessManager::handle) is called once per event, in stream
///   order within a partition. Returning an error reports the event to the
///   error stream; the remaining events are still handled.
#[tonic::async_trait]
pub trait ProcessManager: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// The stream to subscribe to. Defaults to the name.
    fn stream(&self) -> &str {
        self.name()
    }

    /// React to one event, loading and changing aggregates through `uow`.
    async fn handle(&self, event: &DecodedEvent, uow: &mut UnitOfWork) -> Result<(), BoxError>;
}

/// Ambient values copied into every [`PartitionRequest`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Environment {
    values: HashMap<String, Value>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

/// Derives the partition key of an event from its headers.
pub trait PartitionKeyFinder: Send + Sync + 'static {
    fn find(&self, headers: &Headers) -> Option<String>;
}

impl<F> PartitionKeyFinder for F
where
    F: Fn(&Headers) -> Option<String> + Send + Sync + 'static,
{
    fn find(&self, headers: &Headers) -> Option<String> {
        self(headers)
    }
}

/// Takes the first of a list of headers that is present.
///
/// The default looks at `PartitionKey`, then `AggregateId`, so events of one
/// aggregate stay in order relative to each other.
#[derive(Debug, Clone)]
pub struct HeaderPartitionKey {
    headers: Vec<String>,
}

impl HeaderPartitionKey {
    pub fn new<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for HeaderPartitionKey {
    fn default() -> Self {
        Self::new([PARTITION_KEY_HEADER, AGGREGATE_ID_HEADER])
    }
}

impl PartitionKeyFinder for HeaderPartitionKey {
    fn find(&self, headers: &Headers) -> Option<String> {
        self.headers
            .iter()
            .find_map(|name| match headers.get(name)? {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            })
    }
}

/// One partition of one batch, handed to the processing chain.
pub struct PartitionRequest {
    /// Request-scoped copy of the dispatcher environment.
    pub environment: Environment,
    pub process_manager: Arc<dyn ProcessManager>,
    /// The partition's events, in arrival order.
    pub events: Vec<DecodedEvent>,
    /// Empty for events without a derivable key.
    pub partition_key: String,
    pub on_exception: ExceptionSink,
}

impl fmt::Debug for PartitionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionRequest")
            .field("process_manager", &self.process_manager.name())
            .field("partition_key", &self.partition_key)
            .field("events", &self.events.len())
            .finish_non_exhaustive()
    }
}

/// Downstream handler of partitions. Errors are reported for every event of
/// the partition.
#[tonic::async_trait]
pub trait ProcessingChain: Send + Sync + 'static {
    async fn process(&self, request: PartitionRequest) -> Result<(), BoxError>;
}

#[tonic::async_trait]
impl<F, Fut> ProcessingChain for F
where
    F: Fn(PartitionRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn process(&self, request: PartitionRequest) -> Result<(), BoxError> {
        self(request).await
    }
}

/// Processing chain that runs each partition in its own unit of work.
///
/// Calls [`ProcessManager::handle`] for every event, reporting individual
/// failures through the exception sink, then saves all changes under one
/// commit stamped with `ProcessManager` and `PartitionKey` headers.
#[derive(Debug, Clone)]
pub struct RepositoryChain {
    repository: Repository,
}

impl RepositoryChain {
    pub fn new(repository: Repository) -> Self {
        Self { repository }
    }
}

#[tonic::async_trait]
impl ProcessingChain for RepositoryChain {
    async fn process(&self, request: PartitionRequest) -> Result<(), BoxError> {
        let name = request.process_manager.name().to_string();
        let metadata = ActionMetadata::default()
            .with_entry(PROCESS_MANAGER_HEADER, name.clone().into())
            .with_entry(PARTITION_KEY_HEADER, request.partition_key.clone().into());

        let mut uow = self.repository.unit_of_work();
        for event in &request.events {
            if let Err(e) = request.process_manager.handle(event, &mut uow).await {
                tracing::warn!(
                    process_manager = %name,
                    event_number = event.original_event_number,
                    error = %e,
                    "process manager failed to handle event"
                );
                request.on_exception.report(event, &e).await;
            }
        }
        let commit_id = uow.save_changes(&metadata).await?;
        tracing::debug!(
            process_manager = %name,
            partition_key = %request.partition_key,
            commit_id = %commit_id,
            events = request.events.len(),
            "partition processed"
        );
        Ok(())
    }
}

/// Durable record of a failed event, appended to the error stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessManagerFailed {
    pub process_manager: String,
    pub error: String,
    pub event_id: Uuid,
    pub event_type: String,
    pub event_number: u64,
    /// The original payload: JSON as-is, anything else as lossy text.
    pub payload: Value,
    pub metadata: Headers,
    pub failed_at: DateTime<Utc>,
}

impl ProcessManagerFailed {
    fn from_decoded(
        process_manager: &str,
        event: &DecodedEvent,
        error: &(dyn fmt::Display + Sync),
    ) -> Self {
        Self {
            process_manager: process_manager.to_string(),
            error: error.to_string(),
            event_id: event.event_id,
            event_type: event.event_type.clone(),
            event_number: event.original_event_number,
            payload: event.data.clone(),
            metadata: event.metadata.clone(),
            failed_at: Utc::now(),
        }
    }

    fn from_failed(process_manager: &str, event: &FailedEvent) -> Self {
        let payload = serde_json::from_slice(&event.data).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&event.data).into_owned())
        });
        Self {
            process_manager: process_manager.to_string(),
            error: event.error.to_string(),
            event_id: event.event_id,
            event_type: event.event_type.clone(),
            event_number: event.original_event_number,
            payload,
            metadata: event.metadata.clone(),
            failed_at: Utc::now(),
        }
    }
}

/// Best-effort writer of [`ProcessManagerFailed`] records.
#[derive(Clone)]
pub struct ErrorStreamWriter {
    store: Arc<dyn StreamStore>,
    codec: Arc<dyn EventCodec>,
    stream: String,
}

impl fmt::Debug for ErrorStreamWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorStreamWriter")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl ErrorStreamWriter {
    pub fn new(store: Arc<dyn StreamStore>, stream: impl Into<String>) -> Self {
        Self {
            store,
            codec: Arc::new(JsonCodec),
            stream: stream.into(),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn EventCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Report an event the codec could not decode.
    pub async fn report_undecodable(&self, process_manager: &str, event: &FailedEvent) {
        tracing::warn!(
            process_manager,
            event_number = event.original_event_number,
            event_type = %event.event_type,
            error = %event.error,
            "undecodable event"
        );
        self.write(ProcessManagerFailed::from_failed(process_manager, event))
            .await;
    }

    /// Report an event whose processing failed.
    pub async fn report(
        &self,
        process_manager: &str,
        event: &DecodedEvent,
        error: &(dyn fmt::Display + Sync),
    ) {
        self.write(ProcessManagerFailed::from_decoded(process_manager, event, error))
            .await;
    }

    /// Append `record`. Failures are logged and swallowed.
    async fn write(&self, record: ProcessManagerFailed) {
        let body = match serde_json::to_value(&record) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "cannot encode failure record");
                return;
            }
        };
        let mut headers = Headers::new();
        headers.insert(
            PROCESS_MANAGER_HEADER.to_string(),
            Value::String(record.process_manager.clone()),
        );
        let data = match self.codec.serialize(
            Uuid::new_v4(),
            &EventPayload::new("ProcessManagerFailed", body),
            &headers,
        ) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(error = %e, "cannot encode failure record");
                return;
            }
        };
        if let Err(e) = self
            .store
            .append_to_stream(&self.stream, ExpectedVersion::Any, vec![data])
            .await
        {
            tracing::error!(
                stream = %self.stream,
                process_manager = %record.process_manager,
                event_number = record.event_number,
                error = %e,
                "failed to append to error stream"
            );
        }
    }
}

/// Exception callback handed to the processing chain with each partition.
#[derive(Debug, Clone)]
pub struct ExceptionSink {
    writer: ErrorStreamWriter,
    process_manager: String,
}

impl ExceptionSink {
    pub fn new(writer: ErrorStreamWriter, process_manager: impl Into<String>) -> Self {
        Self {
            writer,
            process_manager: process_manager.into(),
        }
    }

    pub async fn report(&self, event: &DecodedEvent, error: &(dyn fmt::Display + Sync)) {
        self.writer
            .report(&self.process_manager, event, error)
            .await;
    }
}
