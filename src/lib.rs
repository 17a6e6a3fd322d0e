//! Event-sourced aggregates and process managers on top of a remote stream
//! store.
//!
//! A [`Repository`] loads aggregates by replaying their stream and saves new
//! events with optimistic concurrency, retrying when the concurrent events
//! do not conflict. A [`UnitOfWork`] tracks everything loaded during one
//! piece of work and saves it together. The [`ProcessManagerDispatcher`]
//! subscribes process managers to their streams and feeds them events in
//! batches, partitioned by key.

mod aggregate;
mod backoff;
mod checkpoint;
mod client;
mod config;
mod conflict;
mod dispatcher;
mod error;
mod event;
mod memory;
mod metadata;
mod process_manager;
pub mod proto;
mod repository;
mod stream;
mod timeout;

pub use aggregate::{Aggregate, AggregateRoot, LoadedAggregate, SharedAggregate};
pub use backoff::{BackoffPolicy, ExponentialBackoff, FixedBackoff};
pub use checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpoints};
pub use client::{ACTUAL_VERSION_METADATA, EsClient, to_proto_event};
pub use config::{DEFAULT_READ_PAGE_SIZE, DEFAULT_WRITE_PAGE_SIZE, DispatcherConfig, RepositoryConfig};
pub use conflict::{AlwaysConflict, ConflictChecker, EventTypeConflicts, NeverConflict};
pub use dispatcher::{ProcessManagerDispatcher, ProcessManagerDispatcherBuilder, SubscriptionState};
pub use error::{BoxError, CodecError, RepositoryError, StoreError};
pub use event::{
    DecodedEvent, DeserializationResult, EventCodec, EventPayload, FailedEvent, JsonCodec,
    encode_event,
};
pub use memory::InMemoryStreamStore;
pub use metadata::{
    AGGREGATE_ID_HEADER, AGGREGATE_TYPE_HEADER, ActionMetadata, CAUSED_BY_HEADER,
    COMMAND_ID_HEADER, COMMIT_ID_HEADER, CONTEXT_HEADER, Headers, PARTITION_KEY_HEADER,
};
pub use process_manager::{
    Environment, ErrorStreamWriter, ExceptionSink, HeaderPartitionKey, PROCESS_MANAGER_HEADER,
    PartitionKeyFinder, PartitionRequest, ProcessManager, ProcessManagerFailed, ProcessingChain,
    RepositoryChain,
};
pub use repository::{
    AggregateLoadedObserver, ChangeObserver, Repository, RepositoryBuilder,
    UnitOfWork,
};
pub use stream::{
    EventData, EventSubscription, ExpectedVersion, LINK_EVENT_TYPE, ReadStatus, RecordedEvent,
    StreamSlice, StreamStore, StreamTransaction, WriteResult, aggregate_stream_name, stream_name,
};
pub use timeout::{
    DelayedAppendTimeouts, TimeoutRequested, TimeoutRequestor, TimeoutStreamRequestor,
};
