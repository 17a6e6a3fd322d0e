//! Aggregate trait and the [`AggregateRoot`] wrapper that tracks identity,
//! version and uncommitted events.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::error::RepositoryError;
use crate::metadata::ActionMetadata;
use crate::repository::Repository;
use crate::stream::aggregate_stream_name;

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state.
/// State is built by folding domain events through the [`apply`](Aggregate::apply) method.
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) must be a pure decision function: no I/O, no side effects.
///   It validates a command against the current state and returns zero or more events.
/// - [`apply`](Aggregate::apply) must be a pure, total function.
/// - `DomainEvent` must use `#[serde(tag = "type", content = "data")]`.
pub trait Aggregate: Default + Send + Sync + 'static {
    /// Identifies this aggregate type (e.g. "order"). Used in stream names
    /// and the `AggregateType` commit header.
    const AGGREGATE_TYPE: &'static str;

    /// The set of commands this aggregate can handle.
    type Command: Send + 'static;

    /// The set of events this aggregate can produce and apply.
    type DomainEvent: serde::Serialize
        + serde::de::DeserializeOwned
        + Send
        + Sync
        + Clone
        + 'static;

    /// Command rejection / validation error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate a command against the current state and produce events.
    fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error>;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::DomainEvent) -> Self;
}

/// An aggregate shared within a unit of work. Two loads of the same id
/// return clones of the same `Arc`.
pub type SharedAggregate<A> = Arc<tokio::sync::Mutex<AggregateRoot<A>>>;

/// Identity plus version of a loaded or attached aggregate, passed to
/// aggregate-loaded observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedAggregate {
    pub aggregate_type: &'static str,
    pub id: String,
    pub context: String,
    pub version: u64,
}

/// Key of the unit-of-work identity map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct TrackingKey {
    pub(crate) aggregate_type: &'static str,
    pub(crate) context: String,
    pub(crate) id: String,
}

/// An aggregate instance together with its identity, version and the events
/// it produced since it was loaded.
///
/// `version` counts every event applied, replayed or recorded, so
/// `version - uncommitted().len()` is the stream version the instance was
/// loaded at.
pub struct AggregateRoot<A: Aggregate> {
    id: String,
    context: String,
    stream: String,
    version: u64,
    state: A,
    uncommitted: Vec<A::DomainEvent>,
    attached: AttachSink,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// A fresh, empty aggregate with no context.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_context(id, "")
    }

    /// A fresh, empty aggregate in `context`.
    pub fn with_context(id: impl Into<String>, context: impl Into<String>) -> Self {
        let id = id.into();
        let context = context.into();
        let stream = aggregate_stream_name(A::AGGREGATE_TYPE, &id, &context);
        Self::on_stream(id, context, stream)
    }

    /// A fresh aggregate persisted to an explicitly named stream.
    pub(crate) fn on_stream(id: String, context: String, stream: String) -> Self {
        Self {
            id,
            context,
            stream,
            version: 0,
            state: A::default(),
            uncommitted: Vec::new(),
            attached: AttachSink::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    /// Name of the stream this aggregate is persisted to.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    /// Events recorded since the last successful save.
    pub fn uncommitted(&self) -> &[A::DomainEvent] {
        &self.uncommitted
    }

    pub fn has_changes(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    /// The stream version this instance was loaded at.
    pub fn originating_version(&self) -> u64 {
        self.version - self.uncommitted.len() as u64
    }

    /// Run a command and record the events it produces.
    ///
    /// # Returns
    ///
    /// The number of events recorded.
    ///
    /// # Errors
    ///
    /// Returns the aggregate's own error if the command is rejected; nothing
    /// is recorded in that case.
    pub fn execute(&mut self, cmd: A::Command) -> Result<usize, A::Error> {
        let events = self.state.handle(cmd)?;
        let count = events.len();
        for event in events {
            self.record(event);
        }
        Ok(count)
    }

    /// Apply `event` and buffer it for the next save.
    pub fn record(&mut self, event: A::DomainEvent) {
        self.apply(&event);
        self.uncommitted.push(event);
    }

    /// Attach a newly created aggregate so it is saved and announced along
    /// with this one.
    ///
    /// If this aggregate is tracked by a unit of work, the child joins that
    /// unit of work immediately: later loads of its id return it and the
    /// aggregate-loaded observers see it now. Otherwise it joins together
    /// with this aggregate.
    ///
    /// # Returns
    ///
    /// A shared handle to the child; the unit of work tracks the same
    /// instance.
    pub fn attach<B: Aggregate>(&mut self, child: AggregateRoot<B>) -> SharedAggregate<B> {
        let grandchildren = child.attached.clone();
        let (entry, shared) = AttachedAggregate::new(child);
        self.attached.push(entry);
        grandchildren.forward_to(&self.attached);
        shared
    }

    /// Advance past a historical event. `None` marks an event whose type is
    /// unknown to this aggregate: the version moves, the state does not.
    pub(crate) fn replay(&mut self, event: Option<&A::DomainEvent>) {
        match event {
            Some(event) => self.apply(event),
            None => self.version += 1,
        }
    }

    pub(crate) fn mark_committed(&mut self) {
        self.uncommitted.clear();
    }

    pub(crate) fn attach_sink(&self) -> &AttachSink {
        &self.attached
    }

    pub(crate) fn tracking_key(&self) -> TrackingKey {
        TrackingKey {
            aggregate_type: A::AGGREGATE_TYPE,
            context: self.context.clone(),
            id: self.id.clone(),
        }
    }

    pub(crate) fn describe(&self) -> LoadedAggregate {
        LoadedAggregate {
            aggregate_type: A::AGGREGATE_TYPE,
            id: self.id.clone(),
            context: self.context.clone(),
            version: self.version,
        }
    }

    fn apply(&mut self, event: &A::DomainEvent) {
        self.state = std::mem::take(&mut self.state).apply(event);
        self.version += 1;
    }
}

impl<A: Aggregate + std::fmt::Debug> std::fmt::Debug for AggregateRoot<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateRoot")
            .field("stream", &self.stream)
            .field("version", &self.version)
            .field("uncommitted", &self.uncommitted.len())
            .field("state", &self.state)
            .finish()
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased view of a tracked aggregate, so one unit of work can hold
/// aggregates of any type.
pub(crate) trait TrackedAggregate: Send + Sync {
    /// The underlying `SharedAggregate<A>`, for downcasting.
    fn as_any(&self) -> &(dyn Any + Send + Sync);

    /// Save pending changes. Resolves to `true` if anything was written.
    fn save<'a>(
        &'a self,
        repository: &'a Repository,
        commit_id: Uuid,
        metadata: &'a ActionMetadata,
    ) -> BoxFuture<'a, Result<bool, RepositoryError>>;
}

impl<A: Aggregate> TrackedAggregate for SharedAggregate<A> {
    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn save<'a>(
        &'a self,
        repository: &'a Repository,
        commit_id: Uuid,
        metadata: &'a ActionMetadata,
    ) -> BoxFuture<'a, Result<bool, RepositoryError>> {
        Box::pin(async move {
            let mut root = self.lock().await;
            if !root.has_changes() {
                return Ok(false);
            }
            repository.save(&mut root, commit_id, metadata).await?;
            Ok(true)
        })
    }
}

/// An aggregate handed to a unit of work without being loaded.
pub(crate) struct AttachedAggregate {
    pub(crate) key: TrackingKey,
    pub(crate) loaded: LoadedAggregate,
    pub(crate) aggregate: Box<dyn TrackedAggregate>,
}

impl AttachedAggregate {
    /// Wrap `root` for tracking, returning the entry and the shared handle
    /// it tracks.
    pub(crate) fn new<A: Aggregate>(root: AggregateRoot<A>) -> (Self, SharedAggregate<A>) {
        let key = root.tracking_key();
        let loaded = root.describe();
        let shared: SharedAggregate<A> = Arc::new(tokio::sync::Mutex::new(root));
        let entry = Self {
            key,
            loaded,
            aggregate: Box::new(shared.clone()),
        };
        (entry, shared)
    }
}

pub(crate) type AttachObserver = Arc<dyn Fn(&LoadedAggregate) + Send + Sync>;

/// Where [`AggregateRoot::attach`] hands children off.
///
/// A standalone root keeps its children pending in its own sink. Once the
/// root is attached to a parent or tracked by a unit of work, its sink
/// forwards to the parent's (or the unit of work's) and moves anything
/// pending along. Entries travel the chain to its end; the first sink with
/// an observer announces them on the way.
#[derive(Clone, Default)]
pub(crate) struct AttachSink {
    state: Arc<Mutex<SinkState>>,
}

#[derive(Default)]
struct SinkState {
    pending: Vec<AttachedAggregate>,
    forward: Option<AttachSink>,
    observer: Option<AttachObserver>,
}

impl AttachSink {
    /// A sink announcing everything through `observer`, then forwarding it
    /// to `target`.
    pub(crate) fn announcing(target: &AttachSink, observer: AttachObserver) -> Self {
        Self {
            state: Arc::new(Mutex::new(SinkState {
                pending: Vec::new(),
                forward: Some(target.clone()),
                observer: Some(observer),
            })),
        }
    }

    pub(crate) fn push(&self, entry: AttachedAggregate) {
        self.deliver(entry, false);
    }

    fn deliver(&self, entry: AttachedAggregate, announced: bool) {
        let (observer, forward) = {
            let state = self.lock();
            let observer = if announced { None } else { state.observer.clone() };
            (observer, state.forward.clone())
        };
        if let Some(observer) = &observer {
            observer(&entry.loaded);
        }
        let announced = announced || observer.is_some();
        match forward {
            Some(next) => next.deliver(entry, announced),
            None => self.lock().pending.push(entry),
        }
    }

    /// From now on send everything to `target`, starting with what is
    /// pending here.
    pub(crate) fn forward_to(&self, target: &AttachSink) {
        if Arc::ptr_eq(&self.state, &target.state) {
            return;
        }
        let pending = {
            let mut state = self.lock();
            state.forward = Some(target.clone());
            std::mem::take(&mut state.pending)
        };
        for entry in pending {
            target.push(entry);
        }
    }

    /// Drain the entries that reached this sink.
    pub(crate) fn take_pending(&self) -> Vec<AttachedAggregate> {
        std::mem::take(&mut self.lock().pending)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkState> {
        self.state.lock().expect("attach sink lock poisoned")
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::Aggregate;
    use serde::{Deserialize, Serialize};

    /// A simple counter aggregate used as a test fixture.
    #[derive(Debug, Clone, Default, PartialEq)]
    pub(crate) struct Counter {
        pub value: u64,
    }

    pub(crate) enum CounterCommand {
        Increment,
        Decrement,
        Add(u64),
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    pub(crate) enum CounterEvent {
        Incremented,
        Decremented,
        Added { amount: u64 },
    }

    #[derive(Debug, thiserror::Error)]
    pub(crate) enum CounterError {
        #[error("cannot decrement: counter is already zero")]
        AlreadyZero,
    }

    impl Aggregate for Counter {
        const AGGREGATE_TYPE: &'static str = "counter";

        type Command = CounterCommand;
        type DomainEvent = CounterEvent;
        type Error = CounterError;

        fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error> {
            match cmd {
                CounterCommand::Increment => Ok(vec![CounterEvent::Incremented]),
                CounterCommand::Decrement => {
                    if self.value == 0 {
                        return Err(CounterError::AlreadyZero);
                    }
                    Ok(vec![CounterEvent::Decremented])
                }
                CounterCommand::Add(n) => Ok(vec![CounterEvent::Added { amount: n }]),
            }
        }

        fn apply(mut self, event: &Self::DomainEvent) -> Self {
            match event {
                CounterEvent::Incremented => self.value += 1,
                CounterEvent::Decremented => self.value -= 1,
                CounterEvent::Added { amount } => self.value += amount,
            }
            self
        }
    }

    /// A second aggregate type, attached by counters in tests.
    #[derive(Debug, Clone, Default, PartialEq)]
    pub(crate) struct Audit {
        pub entries: Vec<String>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    pub(crate) enum AuditEvent {
        Noted { text: String },
    }

    impl Aggregate for Audit {
        const AGGREGATE_TYPE: &'static str = "audit";

        type Command = String;
        type DomainEvent = AuditEvent;
        type Error = std::convert::Infallible;

        fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error> {
            Ok(vec![AuditEvent::Noted { text: cmd }])
        }

        fn apply(mut self, event: &Self::DomainEvent) -> Self {
            let AuditEvent::Noted { text } = event;
            self.entries.push(text.clone());
            self
        }
    }
}
