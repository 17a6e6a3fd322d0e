//! Aggregate repository: replays aggregates from their streams and saves
//! their uncommitted events with optimistic concurrency and automatic
//! conflict resolution.
//!
//! [`Repository`] is cheap to clone and shared by every caller. Each
//! request or message works through its own [`UnitOfWork`], which keeps the
//! identity map of aggregates loaded or attached so far.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::aggregate::{
    Aggregate, AggregateRoot, AttachSink, AttachedAggregate, LoadedAggregate, SharedAggregate,
    TrackedAggregate, TrackingKey,
};
use crate::config::RepositoryConfig;
use crate::conflict::{ConflictChecker, ConflictPolicies};
use crate::error::{CodecError, RepositoryError, StoreError};
use crate::event::{DecodedEvent, EventCodec, JsonCodec, encode_event};
use crate::metadata::{
    AGGREGATE_ID_HEADER, AGGREGATE_TYPE_HEADER, ActionMetadata, CAUSED_BY_HEADER,
    COMMAND_ID_HEADER, CONTEXT_HEADER, Headers,
};
use crate::stream::{EventData, ExpectedVersion, ReadStatus, RecordedEvent, StreamStore, stream_name};
use crate::timeout::{DelayedAppendTimeouts, TimeoutRequestor};

/// Callback fired whenever an aggregate is loaded into, or attached to, a
/// unit of work.
pub type AggregateLoadedObserver = Arc<dyn Fn(&LoadedAggregate, &ActionMetadata) + Send + Sync>;

/// Notified after every successful write made through the repository.
pub trait ChangeObserver: Send + Sync + 'static {
    fn changes_saved(&self, stream: &str, events: &[EventData], headers: &Headers);
}

/// Loads and saves aggregates against a [`StreamStore`].
///
/// Built with [`Repository::builder`]. `Clone` is cheap: all state is
/// behind an `Arc`.
#[derive(Clone)]
pub struct Repository {
    inner: Arc<RepositoryInner>,
}

struct RepositoryInner {
    store: Arc<dyn StreamStore>,
    codec: Arc<dyn EventCodec>,
    conflicts: ConflictPolicies,
    timeouts: Arc<dyn TimeoutRequestor>,
    loaded_observers: Vec<AggregateLoadedObserver>,
    change_observers: Vec<Arc<dyn ChangeObserver>>,
    config: RepositoryConfig,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("conflicts", &self.inner.conflicts)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Repository {
    /// Start configuring a repository over `store`.
    pub fn builder(store: Arc<dyn StreamStore>) -> RepositoryBuilder {
        RepositoryBuilder::new(store)
    }

    /// Open a fresh unit of work with an empty identity map.
    pub fn unit_of_work(&self) -> UnitOfWork {
        UnitOfWork {
            repository: self.clone(),
            tracked: HashMap::new(),
            order: Vec::new(),
            inbox: AttachSink::default(),
            command: None,
        }
    }

    pub fn store(&self) -> &Arc<dyn StreamStore> {
        &self.inner.store
    }

    pub fn codec(&self) -> &Arc<dyn EventCodec> {
        &self.inner.codec
    }

    /// Replay an aggregate from its stream, bypassing any unit of work.
    ///
    /// # Arguments
    ///
    /// * `id` - Aggregate id.
    /// * `version` - Replay exactly this many events, or the whole stream
    ///   when `None`.
    /// * `metadata` - Supplies the aggregate context.
    ///
    /// # Errors
    ///
    /// * [`RepositoryError::AggregateVersion`] if an explicit `version` could
    ///   not be reached.
    /// * [`RepositoryError::StreamDeleted`] if the stream was deleted.
    /// * [`RepositoryError::Decode`] if a stored record cannot be decoded.
    pub async fn load_aggregate<A: Aggregate>(
        &self,
        id: &str,
        version: Option<u64>,
        metadata: &ActionMetadata,
    ) -> Result<AggregateRoot<A>, RepositoryError> {
        let root = AggregateRoot::<A>::with_context(id, metadata.context());
        self.replay(root, version).await
    }

    /// Replay `root` from its stream, up to `version` events if given.
    async fn replay<A: Aggregate>(
        &self,
        mut root: AggregateRoot<A>,
        version: Option<u64>,
    ) -> Result<AggregateRoot<A>, RepositoryError> {
        let stream = root.stream().to_string();
        let span = tracing::debug_span!("load", aggregate_type = A::AGGREGATE_TYPE, stream = %stream);
        async move {
            let records = self.read_events(&stream, 0, version).await?;
            for record in &records {
                let decoded = self.decode(&stream, record)?;
                match decoded.to_domain::<A::DomainEvent>() {
                    Ok(event) => root.replay(Some(&event)),
                    Err(e) => {
                        tracing::debug!(
                            event_type = %decoded.event_type,
                            error = %e,
                            "event not understood by aggregate, skipping"
                        );
                        root.replay(None);
                    }
                }
            }
            if let Some(requested) = version {
                if root.version() != requested {
                    return Err(RepositoryError::AggregateVersion {
                        aggregate_type: A::AGGREGATE_TYPE,
                        id: root.id().to_string(),
                        requested,
                        actual: root.version(),
                    });
                }
            }
            tracing::debug!(version = root.version(), "aggregate replayed");
            Ok(root)
        }
        .instrument(span)
        .await
    }

    /// Replay any stream into decoded events.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::StreamDeleted`] or [`RepositoryError::Decode`].
    pub async fn load_stream(&self, stream: &str) -> Result<Vec<DecodedEvent>, RepositoryError> {
        let records = self.read_events(stream, 0, None).await?;
        records
            .iter()
            .map(|record| self.decode(stream, record))
            .collect()
    }

    /// Persist the uncommitted events of `root`.
    ///
    /// The expected version is the version `root` was loaded at ("any" for
    /// a brand-new aggregate) unless `metadata` carries an explicit one. On
    /// a version mismatch the events written concurrently are read back and
    /// handed to the conflict checker for the aggregate type; if they are
    /// compatible the append is retried against the new stream version.
    ///
    /// # Errors
    ///
    /// * [`RepositoryError::ConflictingEvents`] if the concurrent events
    ///   conflict, or the configured attempt limit is reached. Nothing is
    ///   written and the uncommitted events are kept.
    /// * [`RepositoryError::StreamDeleted`] if the stream was deleted.
    pub async fn save<A: Aggregate>(
        &self,
        root: &mut AggregateRoot<A>,
        commit_id: Uuid,
        metadata: &ActionMetadata,
    ) -> Result<(), RepositoryError> {
        if !root.has_changes() {
            return Ok(());
        }
        let stream = root.stream().to_string();
        let span = tracing::debug_span!(
            "save",
            aggregate_type = A::AGGREGATE_TYPE,
            stream = %stream,
            commit_id = %commit_id
        );

        async move {
            let mut headers = metadata.commit_headers(commit_id);
            headers.insert(AGGREGATE_TYPE_HEADER.to_string(), A::AGGREGATE_TYPE.into());
            headers.insert(CONTEXT_HEADER.to_string(), root.context().into());
            headers.insert(AGGREGATE_ID_HEADER.to_string(), root.id().into());

            let new_events = self.encode_all(root.uncommitted(), &headers)?;
            let originating = root.originating_version();
            let mut expected = metadata.expected_version().unwrap_or(if originating == 0 {
                ExpectedVersion::Any
            } else {
                ExpectedVersion::Exact(originating)
            });
            let checker = self.inner.conflicts.for_type(A::AGGREGATE_TYPE);

            let mut attempt = 1u32;
            loop {
                match self.write_events(&stream, expected, &new_events).await {
                    Ok(()) => break,
                    Err(StoreError::WrongExpectedVersion { actual, .. }) => {
                        expected = self
                            .resolve_conflict(
                                &stream,
                                expected,
                                actual,
                                &new_events,
                                checker.as_ref(),
                                metadata,
                                attempt,
                            )
                            .await?;
                        attempt += 1;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            root.mark_committed();
            tracing::debug!(
                event_count = new_events.len(),
                version = root.version(),
                attempts = attempt,
                "aggregate saved"
            );
            self.notify_changes(&stream, &new_events, &headers);
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Decide whether a failed append may be retried.
    ///
    /// # Returns
    ///
    /// The expected version to retry with.
    #[allow(clippy::too_many_arguments)]
    async fn resolve_conflict(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        reported: Option<u64>,
        new_events: &[EventData],
        checker: &dyn ConflictChecker,
        metadata: &ActionMetadata,
        attempt: u32,
    ) -> Result<ExpectedVersion, RepositoryError> {
        let from = match expected {
            ExpectedVersion::Exact(v) => v,
            ExpectedVersion::Any | ExpectedVersion::NoStream => 0,
        };
        let stored = self.read_events(stream, from, None).await?;
        let current = stored
            .iter()
            .map(|e| e.original_event_number + 1)
            .max()
            .or(reported)
            .unwrap_or(from);

        let exhausted = self
            .inner
            .config
            .max_save_attempts
            .is_some_and(|max| attempt >= max);
        // Nothing newer than our expectation means the stream is behind us,
        // which no retry can fix.
        if stored.is_empty() || exhausted || checker.has_conflicts(new_events, &stored, metadata) {
            tracing::info!(
                expected = %expected,
                actual = current,
                concurrent = stored.len(),
                exhausted,
                "conflicting concurrent write"
            );
            return Err(RepositoryError::ConflictingEvents {
                stream: stream.to_string(),
                expected,
                actual: current,
            });
        }

        tracing::debug!(
            expected = %expected,
            actual = current,
            concurrent = stored.len(),
            "concurrent write is compatible, retrying"
        );
        Ok(ExpectedVersion::Exact(current))
    }

    /// Append raw events to `stream` in one attempt. Expected version is
    /// "any" unless `metadata` sets one.
    ///
    /// # Errors
    ///
    /// A version mismatch surfaces as [`RepositoryError::Store`] wrapping
    /// [`StoreError::WrongExpectedVersion`]; there is no retry.
    pub async fn save_to_stream<E: Serialize + Sync>(
        &self,
        stream: &str,
        events: &[E],
        commit_id: Uuid,
        metadata: &ActionMetadata,
    ) -> Result<(), RepositoryError> {
        let headers = metadata.commit_headers(commit_id);
        let expected = metadata.expected_version().unwrap_or(ExpectedVersion::Any);
        self.append_raw(stream, events, &headers, expected).await
    }

    /// Like [`save_to_stream`](Self::save_to_stream), with the stream name
    /// qualified by `context` and a `Context` header on every event.
    pub async fn save_to_context_stream<E: Serialize + Sync>(
        &self,
        stream: &str,
        events: &[E],
        commit_id: Uuid,
        context: &str,
        metadata: &ActionMetadata,
    ) -> Result<(), RepositoryError> {
        let mut headers = metadata.commit_headers(commit_id);
        headers.insert(CONTEXT_HEADER.to_string(), context.into());
        let expected = metadata.expected_version().unwrap_or(ExpectedVersion::Any);
        self.append_raw(&stream_name(context, stream), events, &headers, expected)
            .await
    }

    /// Append raw events to exactly `stream` with expected version "any",
    /// stamping a `Context` header.
    pub async fn save_to_named_stream<E: Serialize + Sync>(
        &self,
        stream: &str,
        events: &[E],
        commit_id: Uuid,
        context: &str,
        metadata: &ActionMetadata,
    ) -> Result<(), RepositoryError> {
        let mut headers = metadata.commit_headers(commit_id);
        headers.insert(CONTEXT_HEADER.to_string(), context.into());
        self.append_raw(stream, events, &headers, ExpectedVersion::Any)
            .await
    }

    /// Ask the timeout requestor to deliver `event` into `stream` at `at`.
    ///
    /// # Errors
    ///
    /// Encoding failures, or whatever the requestor reports.
    pub async fn request_timeout<E: Serialize + Sync>(
        &self,
        stream: &str,
        event: &E,
        commit_id: Uuid,
        at: DateTime<Utc>,
        metadata: &ActionMetadata,
    ) -> Result<(), RepositoryError> {
        let headers = metadata.commit_headers(commit_id);
        let payload = encode_event(event)?;
        let data = self
            .inner
            .codec
            .serialize(Uuid::new_v4(), &payload, &headers)?;
        self.inner
            .timeouts
            .request_timeout(stream, commit_id, data, at, &headers)
            .await?;
        Ok(())
    }

    async fn append_raw<E: Serialize + Sync>(
        &self,
        stream: &str,
        events: &[E],
        headers: &Headers,
        expected: ExpectedVersion,
    ) -> Result<(), RepositoryError> {
        let data = self.encode_all(events, headers)?;
        self.write_events(stream, expected, &data).await?;
        self.notify_changes(stream, &data, headers);
        Ok(())
    }

    fn encode_all<E: Serialize>(
        &self,
        events: &[E],
        headers: &Headers,
    ) -> Result<Vec<EventData>, CodecError> {
        events
            .iter()
            .map(|event| {
                let payload = encode_event(event)?;
                self.inner
                    .codec
                    .serialize(Uuid::new_v4(), &payload, headers)
            })
            .collect()
    }

    fn decode(&self, stream: &str, record: &RecordedEvent) -> Result<DecodedEvent, RepositoryError> {
        self.inner
            .codec
            .deserialize(record)
            .map_err(|failed| RepositoryError::Decode {
                stream: stream.to_string(),
                event_number: failed.event_number,
                source: failed.error,
            })
    }

    /// Write `events` in one append, or page them through a transaction when
    /// there are at least `write_page_size` of them. Empty input is a no-op.
    async fn write_events(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: &[EventData],
    ) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let page_size = self.inner.config.write_page_size.max(1);
        if events.len() < page_size {
            self.inner
                .store
                .append_to_stream(stream, expected, events.to_vec())
                .await?;
            return Ok(());
        }

        tracing::debug!(
            stream,
            event_count = events.len(),
            page_size,
            "writing through transaction"
        );
        let mut transaction = self.inner.store.start_transaction(stream, expected).await?;
        for page in events.chunks(page_size) {
            transaction.write(page.to_vec()).await?;
        }
        transaction.commit().await?;
        Ok(())
    }

    /// Read `stream` forward from `from`, stopping before event `to` (if
    /// given) or at the end of the stream. A missing stream reads as empty.
    async fn read_events(
        &self,
        stream: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<RecordedEvent>, StoreError> {
        let page_size = self.inner.config.read_page_size.max(1);
        let mut events = Vec::new();
        let mut next = from;
        loop {
            let count = match to {
                Some(to) => page_size.min(to.saturating_sub(next)),
                None => page_size,
            };
            if count == 0 {
                break;
            }
            let slice = self
                .inner
                .store
                .read_stream_forward(stream, next, count, false)
                .await?;
            match slice.status {
                ReadStatus::Success => {}
                ReadStatus::StreamNotFound => break,
                ReadStatus::StreamDeleted => {
                    return Err(StoreError::StreamDeleted(stream.to_string()));
                }
            }
            let exhausted = slice.is_end_of_stream || slice.events.is_empty();
            next = slice.next_event_number;
            events.extend(slice.events);
            if exhausted || to.is_some_and(|to| next >= to) {
                break;
            }
        }
        Ok(events)
    }

    fn notify_loaded(&self, loaded: &LoadedAggregate, metadata: &ActionMetadata) {
        for observer in &self.inner.loaded_observers {
            observer(loaded, metadata);
        }
    }

    fn notify_changes(&self, stream: &str, events: &[EventData], headers: &Headers) {
        for observer in &self.inner.change_observers {
            observer.changes_saved(stream, events, headers);
        }
    }
}

/// Builder for [`Repository`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use streamfold_es::{InMemoryStreamStore, NeverConflict, Repository};
///
/// let repository = Repository::builder(Arc::new(InMemoryStreamStore::new()))
///     .conflict_policy("cart", NeverConflict)
///     .on_aggregate_loaded(|loaded, _meta| println!("loaded {}", loaded.id))
///     .build();
/// # let _ = repository;
/// ```
pub struct RepositoryBuilder {
    store: Arc<dyn StreamStore>,
    codec: Arc<dyn EventCodec>,
    conflicts: ConflictPolicies,
    timeouts: Option<Arc<dyn TimeoutRequestor>>,
    loaded_observers: Vec<AggregateLoadedObserver>,
    change_observers: Vec<Arc<dyn ChangeObserver>>,
    config: RepositoryConfig,
}

impl RepositoryBuilder {
    fn new(store: Arc<dyn StreamStore>) -> Self {
        Self {
            store,
            codec: Arc::new(JsonCodec),
            conflicts: ConflictPolicies::default(),
            timeouts: None,
            loaded_observers: Vec::new(),
            change_observers: Vec::new(),
            config: RepositoryConfig::default(),
        }
    }

    /// Replace the default [`JsonCodec`].
    pub fn codec(mut self, codec: Arc<dyn EventCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Use `checker` for aggregates of `aggregate_type`.
    pub fn conflict_policy(
        mut self,
        aggregate_type: impl Into<String>,
        checker: impl ConflictChecker,
    ) -> Self {
        self.conflicts = self.conflicts.with_policy(aggregate_type, checker);
        self
    }

    /// Replace the default in-process [`DelayedAppendTimeouts`].
    pub fn timeouts(mut self, timeouts: Arc<dyn TimeoutRequestor>) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    /// Register an aggregate-loaded observer.
    pub fn on_aggregate_loaded(
        mut self,
        observer: impl Fn(&LoadedAggregate, &ActionMetadata) + Send + Sync + 'static,
    ) -> Self {
        self.loaded_observers.push(Arc::new(observer));
        self
    }

    /// Register a change observer.
    pub fn on_changes_saved(mut self, observer: impl ChangeObserver) -> Self {
        self.change_observers.push(Arc::new(observer));
        self
    }

    pub fn config(mut self, config: RepositoryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Repository {
        let timeouts = self
            .timeouts
            .unwrap_or_else(|| Arc::new(DelayedAppendTimeouts::new(self.store.clone())));
        Repository {
            inner: Arc::new(RepositoryInner {
                store: self.store,
                codec: self.codec,
                conflicts: self.conflicts,
                timeouts,
                loaded_observers: self.loaded_observers,
                change_observers: self.change_observers,
                config: self.config,
            }),
        }
    }
}

/// The command a unit of work runs on behalf of.
#[derive(Debug, Clone)]
struct AttachedCommand {
    command_id: Uuid,
    caused_by: String,
}

/// Identity map and change tracker for one logical operation.
///
/// Aggregates loaded or attached here are tracked until
/// [`save_changes`](Self::save_changes) or
/// [`throw_away_changes`](Self::throw_away_changes). Not meant to be
/// shared between concurrent tasks; every method that touches the identity
/// map takes `&mut self`.
///
/// Callers must release any aggregate lock guards before calling
/// `save_changes`, which locks every tracked aggregate in turn.
pub struct UnitOfWork {
    repository: Repository,
    tracked: HashMap<TrackingKey, Box<dyn TrackedAggregate>>,
    order: Vec<TrackingKey>,
    /// Children attached to tracked aggregates, waiting to join `tracked`.
    inbox: AttachSink,
    command: Option<AttachedCommand>,
}

impl UnitOfWork {
    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    /// Load the latest version of an aggregate.
    ///
    /// Returns the tracked instance if this unit of work already loaded or
    /// attached the same aggregate; otherwise replays its stream and starts
    /// tracking it.
    ///
    /// # Errors
    ///
    /// See [`Repository::load_aggregate`].
    pub async fn load<A: Aggregate>(
        &mut self,
        id: &str,
        metadata: &ActionMetadata,
    ) -> Result<SharedAggregate<A>, RepositoryError> {
        self.drain_attached();
        let key = key_for::<A>(id, metadata);
        if let Some(shared) = self.cached::<A>(&key) {
            return Ok(shared);
        }
        let root = self
            .repository
            .load_aggregate::<A>(id, None, metadata)
            .await?;
        Ok(self.track(root, metadata))
    }

    /// Load an aggregate at exactly `version`.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::AggregateVersion`] if replay (or the already
    /// tracked instance) ends at a different version.
    pub async fn load_version<A: Aggregate>(
        &mut self,
        id: &str,
        version: u64,
        metadata: &ActionMetadata,
    ) -> Result<SharedAggregate<A>, RepositoryError> {
        self.drain_attached();
        let key = key_for::<A>(id, metadata);
        if let Some(shared) = self.cached::<A>(&key) {
            let actual = shared.lock().await.version();
            if actual != version {
                return Err(RepositoryError::AggregateVersion {
                    aggregate_type: A::AGGREGATE_TYPE,
                    id: id.to_string(),
                    requested: version,
                    actual,
                });
            }
            return Ok(shared);
        }
        let root = self
            .repository
            .load_aggregate::<A>(id, Some(version), metadata)
            .await?;
        Ok(self.track(root, metadata))
    }

    /// Load process state persisted to an explicitly named stream.
    pub async fn load_process_state<A: Aggregate>(
        &mut self,
        stream: &str,
        id: &str,
        metadata: &ActionMetadata,
    ) -> Result<SharedAggregate<A>, RepositoryError> {
        self.drain_attached();
        let key = key_for::<A>(id, metadata);
        if let Some(shared) = self.cached::<A>(&key) {
            return Ok(shared);
        }
        let root = AggregateRoot::<A>::on_stream(
            id.to_string(),
            metadata.context().to_string(),
            stream.to_string(),
        );
        let root = self.repository.replay(root, None).await?;
        Ok(self.track(root, metadata))
    }

    /// Track an aggregate that was created rather than loaded.
    ///
    /// An already tracked aggregate with the same identity is replaced.
    pub fn attach<A: Aggregate>(
        &mut self,
        root: AggregateRoot<A>,
        metadata: &ActionMetadata,
    ) -> SharedAggregate<A> {
        self.drain_attached();
        self.track(root, metadata)
    }

    /// Attach a command; a fresh command id and `caused_by` are stamped on
    /// every commit made by [`save_changes`](Self::save_changes). Attaching
    /// another command replaces the previous one.
    ///
    /// # Returns
    ///
    /// The generated command id.
    pub fn attach_command(&mut self, caused_by: impl Into<String>) -> Uuid {
        let command_id = Uuid::new_v4();
        self.command = Some(AttachedCommand {
            command_id,
            caused_by: caused_by.into(),
        });
        command_id
    }

    /// Number of tracked aggregates, transitively attached ones included.
    pub fn tracked_count(&mut self) -> usize {
        self.drain_attached();
        self.tracked.len()
    }

    /// Save one aggregate. See [`Repository::save`].
    pub async fn save<A: Aggregate>(
        &self,
        aggregate: &SharedAggregate<A>,
        commit_id: Uuid,
        metadata: &ActionMetadata,
    ) -> Result<(), RepositoryError> {
        let metadata = self.commit_metadata(metadata);
        let mut root = aggregate.lock().await;
        self.repository.save(&mut root, commit_id, &metadata).await
    }

    /// Save every tracked aggregate that has uncommitted events under one
    /// fresh commit id, in the order they were tracked.
    ///
    /// # Returns
    ///
    /// The commit id used.
    ///
    /// # Errors
    ///
    /// Stops at the first failing save; aggregates saved before it stay
    /// saved.
    pub async fn save_changes(&mut self, metadata: &ActionMetadata) -> Result<Uuid, RepositoryError> {
        self.drain_attached();
        let commit_id = Uuid::new_v4();
        let metadata = self.commit_metadata(metadata);
        let mut saved = 0usize;
        for key in &self.order {
            if let Some(tracked) = self.tracked.get(key) {
                if tracked.save(&self.repository, commit_id, &metadata).await? {
                    saved += 1;
                }
            }
        }
        tracing::debug!(commit_id = %commit_id, saved, "unit of work saved");
        Ok(commit_id)
    }

    /// Forget every tracked aggregate and attached command.
    pub fn throw_away_changes(&mut self) {
        self.tracked.clear();
        self.order.clear();
        self.inbox.take_pending();
        self.command = None;
    }

    /// See [`Repository::request_timeout`].
    pub async fn request_timeout<E: Serialize + Sync>(
        &self,
        stream: &str,
        event: &E,
        commit_id: Uuid,
        at: DateTime<Utc>,
        metadata: &ActionMetadata,
    ) -> Result<(), RepositoryError> {
        self.repository
            .request_timeout(stream, event, commit_id, at, metadata)
            .await
    }

    fn cached<A: Aggregate>(&self, key: &TrackingKey) -> Option<SharedAggregate<A>> {
        self.tracked
            .get(key)?
            .as_any()
            .downcast_ref::<SharedAggregate<A>>()
            .cloned()
    }

    /// Start tracking `root`, and route whatever gets attached to it into
    /// this unit of work from now on.
    fn track<A: Aggregate>(
        &mut self,
        root: AggregateRoot<A>,
        metadata: &ActionMetadata,
    ) -> SharedAggregate<A> {
        let children = root.attach_sink().clone();
        let (entry, shared) = AttachedAggregate::new(root);
        self.repository.notify_loaded(&entry.loaded, metadata);
        self.insert(entry);

        let repository = self.repository.clone();
        let metadata = metadata.clone();
        let announcing = AttachSink::announcing(
            &self.inbox,
            Arc::new(move |loaded: &LoadedAggregate| repository.notify_loaded(loaded, &metadata)),
        );
        children.forward_to(&announcing);
        self.drain_attached();
        shared
    }

    fn insert(&mut self, entry: AttachedAggregate) {
        match self.tracked.insert(entry.key.clone(), entry.aggregate) {
            None => self.order.push(entry.key),
            Some(_) => tracing::warn!(
                aggregate_type = entry.key.aggregate_type,
                id = %entry.key.id,
                "tracked aggregate replaced by a newly attached instance"
            ),
        }
    }

    /// Move aggregates attached since the last call into the identity map.
    fn drain_attached(&mut self) {
        for entry in self.inbox.take_pending() {
            self.insert(entry);
        }
    }

    fn commit_metadata(&self, metadata: &ActionMetadata) -> ActionMetadata {
        match &self.command {
            Some(command) => metadata
                .clone()
                .with_entry(COMMAND_ID_HEADER, command.command_id.to_string().into())
                .with_entry(CAUSED_BY_HEADER, command.caused_by.clone().into()),
            None => metadata.clone(),
        }
    }
}

fn key_for<A: Aggregate>(id: &str, metadata: &ActionMetadata) -> TrackingKey {
    TrackingKey {
        aggregate_type: A::AGGREGATE_TYPE,
        context: metadata.context().to_string(),
        id: id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Audit, Counter, CounterCommand, CounterEvent};
    use crate::conflict::{EventTypeConflicts, NeverConflict};
    use crate::memory::InMemoryStreamStore;
    use crate::metadata::COMMIT_ID_HEADER;
    use crate::stream::{EventSubscription, StreamSlice, StreamTransaction, WriteResult};
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Delegates to an in-memory store and records what the repository asks
    /// of it.
    #[derive(Default)]
    struct RecordingStore {
        inner: InMemoryStreamStore,
        expected: Mutex<Vec<ExpectedVersion>>,
        reads: AtomicU32,
    }

    impl RecordingStore {
        fn expected_versions(&self) -> Vec<ExpectedVersion> {
            self.expected.lock().expect("lock").clone()
        }
    }

    #[tonic::async_trait]
    impl StreamStore for RecordingStore {
        async fn append_to_stream(
            &self,
            stream: &str,
            expected: ExpectedVersion,
            events: Vec<EventData>,
        ) -> Result<WriteResult, StoreError> {
            self.expected.lock().expect("lock").push(expected);
            self.inner.append_to_stream(stream, expected, events).await
        }

        async fn start_transaction(
            &self,
            stream: &str,
            expected: ExpectedVersion,
        ) -> Result<Box<dyn StreamTransaction>, StoreError> {
            self.expected.lock().expect("lock").push(expected);
            self.inner.start_transaction(stream, expected).await
        }

        async fn read_stream_forward(
            &self,
            stream: &str,
            start: u64,
            count: u64,
            resolve_links: bool,
        ) -> Result<StreamSlice, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner
                .read_stream_forward(stream, start, count, resolve_links)
                .await
        }

        async fn subscribe_from(
            &self,
            stream: &str,
            last_checkpoint: Option<u64>,
            resolve_links: bool,
        ) -> Result<EventSubscription, StoreError> {
            self.inner
                .subscribe_from(stream, last_checkpoint, resolve_links)
                .await
        }
    }

    fn repository(store: &InMemoryStreamStore) -> Repository {
        Repository::builder(Arc::new(store.clone())).build()
    }

    /// Append `n` Incremented events to a counter stream directly.
    async fn seed(store: &InMemoryStreamStore, id: &str, n: usize) {
        let repo = repository(store);
        let events = vec![CounterEvent::Incremented; n];
        repo.save_to_stream(
            &format!("counter-{id}"),
            &events,
            Uuid::new_v4(),
            &ActionMetadata::default(),
        )
        .await
        .expect("seed");
    }

    #[tokio::test]
    async fn replay_yields_version_and_state() {
        let store = InMemoryStreamStore::new();
        seed(&store, "c-1", 5).await;

        let root = repository(&store)
            .load_aggregate::<Counter>("c-1", None, &ActionMetadata::default())
            .await
            .expect("load");

        assert_eq!(root.version(), 5);
        assert_eq!(root.state().value, 5);
        assert!(!root.has_changes());
    }

    #[tokio::test]
    async fn replay_spans_multiple_pages() {
        let store = InMemoryStreamStore::new();
        seed(&store, "c-1", 7).await;
        let repo = Repository::builder(Arc::new(store.clone()))
            .config(RepositoryConfig {
                read_page_size: 2,
                ..RepositoryConfig::default()
            })
            .build();

        let root = repo
            .load_aggregate::<Counter>("c-1", None, &ActionMetadata::default())
            .await
            .expect("load");

        assert_eq!(root.version(), 7);
        assert_eq!(root.state().value, 7);
    }

    #[tokio::test]
    async fn missing_stream_loads_empty_aggregate() {
        let store = InMemoryStreamStore::new();
        let root = repository(&store)
            .load_aggregate::<Counter>("nobody", None, &ActionMetadata::default())
            .await
            .expect("load");
        assert_eq!(root.version(), 0);
    }

    #[tokio::test]
    async fn deleted_stream_fails_load() {
        let store = InMemoryStreamStore::new();
        store.delete_stream("counter-c-1");

        let err = repository(&store)
            .load_aggregate::<Counter>("c-1", None, &ActionMetadata::default())
            .await
            .unwrap_err();

        assert!(matches!(err, RepositoryError::StreamDeleted(ref s) if s == "counter-c-1"));
    }

    #[tokio::test]
    async fn save_then_load_roundtrip() {
        let store = InMemoryStreamStore::new();
        seed(&store, "order-123", 3).await;
        let recording = Arc::new(RecordingStore {
            inner: store.clone(),
            ..RecordingStore::default()
        });
        let repo = Repository::builder(recording.clone()).build();
        let meta = ActionMetadata::default();

        let mut root = repo
            .load_aggregate::<Counter>("order-123", None, &meta)
            .await
            .expect("load");
        assert_eq!(root.version(), 3);
        root.execute(CounterCommand::Add(2)).expect("add");

        repo.save(&mut root, Uuid::new_v4(), &meta).await.expect("save");

        assert_eq!(recording.expected_versions(), vec![ExpectedVersion::Exact(3)]);
        assert_eq!(root.version(), 4);
        assert!(!root.has_changes());

        let reloaded = repo
            .load_aggregate::<Counter>("order-123", None, &meta)
            .await
            .expect("reload");
        assert_eq!(reloaded.version(), 4);
        assert_eq!(reloaded.state().value, 5);
    }

    #[tokio::test]
    async fn new_aggregate_saves_with_any() {
        let store = InMemoryStreamStore::new();
        let recording = Arc::new(RecordingStore {
            inner: store.clone(),
            ..RecordingStore::default()
        });
        let repo = Repository::builder(recording.clone()).build();

        let mut root = AggregateRoot::<Counter>::new("fresh");
        root.execute(CounterCommand::Increment).expect("inc");
        repo.save(&mut root, Uuid::new_v4(), &ActionMetadata::default())
            .await
            .expect("save");

        assert_eq!(recording.expected_versions(), vec![ExpectedVersion::Any]);
        assert_eq!(store.stream_version("counter-fresh"), 1);
    }

    #[tokio::test]
    async fn save_without_changes_writes_nothing() {
        let store = InMemoryStreamStore::new();
        let mut root = AggregateRoot::<Counter>::new("idle");

        repository(&store)
            .save(&mut root, Uuid::new_v4(), &ActionMetadata::default())
            .await
            .expect("save");

        assert_eq!(store.append_calls(), 0);
        assert_eq!(store.transaction_calls(), 0);
    }

    #[tokio::test]
    async fn commit_headers_are_stamped_on_every_event() {
        let store = InMemoryStreamStore::new();
        let repo = repository(&store);
        let commit_id = Uuid::new_v4();
        let meta = ActionMetadata::default()
            .with_entry("UserId", json!("u-7"))
            .with_context("eu");

        let mut root = AggregateRoot::<Counter>::with_context("c-1", "eu");
        root.execute(CounterCommand::Increment).expect("inc");
        root.execute(CounterCommand::Add(3)).expect("add");
        repo.save(&mut root, commit_id, &meta).await.expect("save");

        let records = store.events("eu-counter-c-1");
        assert_eq!(records.len(), 2);
        for record in &records {
            let headers: Headers = serde_json::from_slice(&record.metadata).expect("headers");
            assert_eq!(headers[COMMIT_ID_HEADER], json!(commit_id.to_string()));
            assert_eq!(headers[AGGREGATE_TYPE_HEADER], "counter");
            assert_eq!(headers[AGGREGATE_ID_HEADER], "c-1");
            assert_eq!(headers[CONTEXT_HEADER], "eu");
            assert_eq!(headers["UserId"], "u-7");
        }
    }

    #[tokio::test]
    async fn large_saves_are_paged_through_a_transaction() {
        let store = InMemoryStreamStore::new();
        let repo = Repository::builder(Arc::new(store.clone()))
            .config(RepositoryConfig {
                write_page_size: 3,
                ..RepositoryConfig::default()
            })
            .build();
        let meta = ActionMetadata::default();

        let mut small = AggregateRoot::<Counter>::new("small");
        small.record(CounterEvent::Incremented);
        small.record(CounterEvent::Incremented);
        repo.save(&mut small, Uuid::new_v4(), &meta).await.expect("small save");
        assert_eq!(store.append_calls(), 1);
        assert_eq!(store.transaction_calls(), 0);

        let mut large = AggregateRoot::<Counter>::new("large");
        for _ in 0..7 {
            large.record(CounterEvent::Incremented);
        }
        repo.save(&mut large, Uuid::new_v4(), &meta).await.expect("large save");
        assert_eq!(store.append_calls(), 1, "no extra single-shot append");
        assert_eq!(store.transaction_calls(), 1);
        assert_eq!(store.stream_version("counter-large"), 7);
    }

    #[tokio::test]
    async fn compatible_concurrent_writes_both_succeed() {
        let store = InMemoryStreamStore::new();
        seed(&store, "c-1", 3).await;
        let repo = Repository::builder(Arc::new(store.clone()))
            .conflict_policy("counter", NeverConflict)
            .build();
        let meta = ActionMetadata::default();

        let mut first = repo.load_aggregate::<Counter>("c-1", None, &meta).await.expect("load");
        let mut second = repo.load_aggregate::<Counter>("c-1", None, &meta).await.expect("load");
        first.execute(CounterCommand::Increment).expect("inc");
        second.execute(CounterCommand::Add(2)).expect("add");
        second.execute(CounterCommand::Increment).expect("inc");

        repo.save(&mut first, Uuid::new_v4(), &meta).await.expect("first save");
        repo.save(&mut second, Uuid::new_v4(), &meta).await.expect("second save");

        assert_eq!(store.stream_version("counter-c-1"), 3 + 1 + 2);
        assert!(!second.has_changes());
        let reloaded = repo.load_aggregate::<Counter>("c-1", None, &meta).await.expect("reload");
        assert_eq!(reloaded.state().value, 3 + 1 + 2 + 1);
    }

    #[tokio::test]
    async fn conflicting_concurrent_write_fails_and_leaves_stream() {
        let store = InMemoryStreamStore::new();
        seed(&store, "c-1", 3).await;
        let repo = repository(&store);
        let meta = ActionMetadata::default();

        let mut first = repo.load_aggregate::<Counter>("c-1", None, &meta).await.expect("load");
        let mut second = repo.load_aggregate::<Counter>("c-1", None, &meta).await.expect("load");
        first.execute(CounterCommand::Increment).expect("inc");
        second.execute(CounterCommand::Increment).expect("inc");
        repo.save(&mut first, Uuid::new_v4(), &meta).await.expect("first save");

        let err = repo
            .save(&mut second, Uuid::new_v4(), &meta)
            .await
            .unwrap_err();

        match err {
            RepositoryError::ConflictingEvents {
                stream,
                expected,
                actual,
            } => {
                assert_eq!(stream, "counter-c-1");
                assert_eq!(expected, ExpectedVersion::Exact(3));
                assert_eq!(actual, 4);
            }
            other => panic!("expected ConflictingEvents, got: {other}"),
        }
        assert_eq!(store.stream_version("counter-c-1"), 4);
        assert!(second.has_changes(), "failed save keeps the buffer");
    }

    #[tokio::test]
    async fn type_aware_policy_decides_per_event_type() {
        let store = InMemoryStreamStore::new();
        seed(&store, "c-1", 1).await;
        let repo = Repository::builder(Arc::new(store.clone()))
            .conflict_policy(
                "counter",
                EventTypeConflicts::default().conflicting("Decremented", "Added"),
            )
            .build();
        let meta = ActionMetadata::default();

        let mut adder = repo.load_aggregate::<Counter>("c-1", None, &meta).await.expect("load");
        let mut incrementer = repo.load_aggregate::<Counter>("c-1", None, &meta).await.expect("load");
        let mut decrementer = repo.load_aggregate::<Counter>("c-1", None, &meta).await.expect("load");
        adder.execute(CounterCommand::Add(4)).expect("add");
        incrementer.execute(CounterCommand::Increment).expect("inc");
        decrementer.execute(CounterCommand::Decrement).expect("dec");

        repo.save(&mut adder, Uuid::new_v4(), &meta).await.expect("adder");
        repo.save(&mut incrementer, Uuid::new_v4(), &meta)
            .await
            .expect("increment does not conflict with add");
        let err = repo
            .save(&mut decrementer, Uuid::new_v4(), &meta)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::ConflictingEvents { .. }), "got: {err}");
    }

    #[tokio::test]
    async fn attempt_limit_bounds_the_retry_loop() {
        let store = InMemoryStreamStore::new();
        seed(&store, "c-1", 1).await;
        let repo = Repository::builder(Arc::new(store.clone()))
            .conflict_policy("counter", NeverConflict)
            .config(RepositoryConfig {
                max_save_attempts: Some(1),
                ..RepositoryConfig::default()
            })
            .build();
        let meta = ActionMetadata::default();

        let mut stale = repo.load_aggregate::<Counter>("c-1", None, &meta).await.expect("load");
        seed(&store, "c-1", 1).await;
        stale.execute(CounterCommand::Increment).expect("inc");

        let err = repo.save(&mut stale, Uuid::new_v4(), &meta).await.unwrap_err();
        assert!(matches!(err, RepositoryError::ConflictingEvents { actual: 2, .. }), "got: {err}");
    }

    #[tokio::test]
    async fn explicit_expected_version_overrides_derived_one() {
        let store = InMemoryStreamStore::new();
        seed(&store, "c-1", 2).await;
        let repo = repository(&store);

        let mut root = AggregateRoot::<Counter>::new("c-1");
        root.execute(CounterCommand::Increment).expect("inc");
        let meta = ActionMetadata::default().with_expected_version(ExpectedVersion::NoStream);

        let err = repo.save(&mut root, Uuid::new_v4(), &meta).await.unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::ConflictingEvents {
                expected: ExpectedVersion::NoStream,
                actual: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unit_of_work_returns_same_instance_without_second_replay() {
        let store = InMemoryStreamStore::new();
        seed(&store, "c-1", 2).await;
        let recording = Arc::new(RecordingStore {
            inner: store.clone(),
            ..RecordingStore::default()
        });
        let repo = Repository::builder(recording.clone()).build();
        let meta = ActionMetadata::default();
        let mut uow = repo.unit_of_work();

        let first = uow.load::<Counter>("c-1", &meta).await.expect("first load");
        let reads_after_first = recording.reads.load(Ordering::SeqCst);
        let second = uow.load::<Counter>("c-1", &meta).await.expect("second load");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(recording.reads.load(Ordering::SeqCst), reads_after_first);
        assert_eq!(uow.tracked_count(), 1);
    }

    #[tokio::test]
    async fn load_version_checks_requested_version() {
        let store = InMemoryStreamStore::new();
        seed(&store, "c-1", 3).await;
        let repo = repository(&store);
        let meta = ActionMetadata::default();

        let err = repo
            .unit_of_work()
            .load_version::<Counter>("c-1", 5, &meta)
            .await
            .unwrap_err();
        assert!(
            matches!(err, RepositoryError::AggregateVersion { requested: 5, actual: 3, .. }),
            "got: {err}"
        );

        let mut uow = repo.unit_of_work();
        let at_two = uow.load_version::<Counter>("c-1", 2, &meta).await.expect("v2");
        assert_eq!(at_two.lock().await.state().value, 2);
    }

    #[tokio::test]
    async fn unknown_event_types_advance_version_only() {
        let store = InMemoryStreamStore::new();
        let repo = repository(&store);
        repo.save_to_stream(
            "counter-c-1",
            &[json!({"type": "Renamed", "data": {"name": "x"}})],
            Uuid::new_v4(),
            &ActionMetadata::default(),
        )
        .await
        .expect("foreign event");
        seed(&store, "c-1", 1).await;

        let root = repo
            .load_aggregate::<Counter>("c-1", None, &ActionMetadata::default())
            .await
            .expect("load");
        assert_eq!(root.version(), 2);
        assert_eq!(root.state().value, 1);
    }

    #[tokio::test]
    async fn save_changes_saves_transitively_attached_aggregates() {
        let store = InMemoryStreamStore::new();
        let loaded = Arc::new(Mutex::new(Vec::new()));
        let seen = loaded.clone();
        let repo = Repository::builder(Arc::new(store.clone()))
            .on_aggregate_loaded(move |agg, _| {
                seen.lock().expect("lock").push(format!("{}:{}", agg.aggregate_type, agg.id));
            })
            .build();
        let meta = ActionMetadata::default();
        let mut uow = repo.unit_of_work();

        let counter = uow.load::<Counter>("c-1", &meta).await.expect("load");
        {
            let mut root = counter.lock().await;
            root.execute(CounterCommand::Increment).expect("inc");
            let audit = root.attach(AggregateRoot::<Audit>::new("a-1"));
            audit.lock().await.execute("counter bumped".into()).expect("note");
        }

        uow.save_changes(&meta).await.expect("save changes");

        assert_eq!(store.stream_version("counter-c-1"), 1);
        assert_eq!(store.stream_version("audit-a-1"), 1);
        assert_eq!(uow.tracked_count(), 2);
        assert_eq!(
            *loaded.lock().expect("lock"),
            vec!["counter:c-1".to_string(), "audit:a-1".to_string()]
        );

        // The attached aggregate is now part of the identity map.
        let audit = uow.load::<Audit>("a-1", &meta).await.expect("cached audit");
        assert_eq!(audit.lock().await.state().entries, vec!["counter bumped".to_string()]);
    }

    #[tokio::test]
    async fn attached_aggregate_joins_unit_of_work_at_attach_time() {
        let store = InMemoryStreamStore::new();
        let loaded = Arc::new(Mutex::new(Vec::new()));
        let seen = loaded.clone();
        let repo = Repository::builder(Arc::new(store.clone()))
            .on_aggregate_loaded(move |agg, _| seen.lock().expect("lock").push(agg.id.clone()))
            .build();
        let meta = ActionMetadata::default();
        let mut uow = repo.unit_of_work();

        let counter = uow.load::<Counter>("c-1", &meta).await.expect("load");
        let attached = {
            let mut root = counter.lock().await;
            root.attach(AggregateRoot::<Audit>::new("a-1"))
        };
        attached.lock().await.execute("from attach".into()).expect("note");
        assert_eq!(*loaded.lock().expect("lock"), vec!["c-1", "a-1"]);

        let reloaded = uow.load::<Audit>("a-1", &meta).await.expect("load attached");
        assert!(Arc::ptr_eq(&attached, &reloaded));
        reloaded.lock().await.execute("from load".into()).expect("note");

        uow.save_changes(&meta).await.expect("save changes");

        assert_eq!(store.stream_version("audit-a-1"), 2);
        assert_eq!(loaded.lock().expect("lock").len(), 2);
    }

    #[tokio::test]
    async fn attached_command_is_stamped_on_commits() {
        let store = InMemoryStreamStore::new();
        let repo = repository(&store);
        let meta = ActionMetadata::default();
        let mut uow = repo.unit_of_work();

        let command_id = uow.attach_command("api");
        let mut root = AggregateRoot::<Counter>::new("c-9");
        root.execute(CounterCommand::Increment).expect("inc");
        uow.attach(root, &meta);
        uow.save_changes(&meta).await.expect("save");

        let records = store.events("counter-c-9");
        let headers: Headers = serde_json::from_slice(&records[0].metadata).expect("headers");
        assert_eq!(headers[COMMAND_ID_HEADER], json!(command_id.to_string()));
        assert_eq!(headers[CAUSED_BY_HEADER], "api");
    }

    #[tokio::test]
    async fn throw_away_changes_discards_tracking() {
        let store = InMemoryStreamStore::new();
        let repo = repository(&store);
        let meta = ActionMetadata::default();
        let mut uow = repo.unit_of_work();

        let counter = uow.load::<Counter>("c-1", &meta).await.expect("load");
        counter
            .lock()
            .await
            .execute(CounterCommand::Increment)
            .expect("inc");
        uow.attach_command("api");

        uow.throw_away_changes();
        uow.save_changes(&meta).await.expect("save nothing");

        assert_eq!(uow.tracked_count(), 0);
        assert!(uow.command.is_none());
        assert_eq!(store.stream_version("counter-c-1"), 0);
    }

    #[tokio::test]
    async fn process_state_loads_from_named_stream() {
        let store = InMemoryStreamStore::new();
        let repo = repository(&store);
        repo.save_to_stream(
            "shipping-process-7",
            &[CounterEvent::Added { amount: 9 }],
            Uuid::new_v4(),
            &ActionMetadata::default(),
        )
        .await
        .expect("seed");

        let mut uow = repo.unit_of_work();
        let state = uow
            .load_process_state::<Counter>("shipping-process-7", "7", &ActionMetadata::default())
            .await
            .expect("load");
        let mut root = state.lock().await;
        assert_eq!(root.stream(), "shipping-process-7");
        assert_eq!(root.state().value, 9);

        root.execute(CounterCommand::Increment).expect("inc");
        drop(root);
        uow.save_changes(&ActionMetadata::default()).await.expect("save");
        assert_eq!(store.stream_version("shipping-process-7"), 2);
    }

    #[tokio::test]
    async fn raw_stream_saves_honour_context_and_expected_version() {
        let store = InMemoryStreamStore::new();
        let repo = repository(&store);
        let events = [CounterEvent::Incremented];
        let strict = ActionMetadata::default().with_expected_version(ExpectedVersion::Exact(5));

        let err = repo
            .save_to_stream("log", &events, Uuid::new_v4(), &strict)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::Store(StoreError::WrongExpectedVersion { .. })
        ));

        repo.save_to_named_stream("log", &events, Uuid::new_v4(), "eu", &strict)
            .await
            .expect("named stream ignores expected version");
        repo.save_to_context_stream("log", &events, Uuid::new_v4(), "eu", &ActionMetadata::default())
            .await
            .expect("context stream");

        assert_eq!(store.stream_version("log"), 1);
        let qualified = store.events("eu-log");
        assert_eq!(qualified.len(), 1);
        let headers: Headers = serde_json::from_slice(&qualified[0].metadata).expect("headers");
        assert_eq!(headers[CONTEXT_HEADER], "eu");
    }

    #[tokio::test]
    async fn change_observers_see_every_write() {
        struct Counting(Arc<AtomicU32>);
        impl ChangeObserver for Counting {
            fn changes_saved(&self, _stream: &str, events: &[EventData], headers: &Headers) {
                assert!(headers.contains_key(COMMIT_ID_HEADER));
                self.0.fetch_add(events.len() as u32, Ordering::SeqCst);
            }
        }

        let store = InMemoryStreamStore::new();
        let count = Arc::new(AtomicU32::new(0));
        let repo = Repository::builder(Arc::new(store.clone()))
            .on_changes_saved(Counting(count.clone()))
            .build();

        let mut root = AggregateRoot::<Counter>::new("c-1");
        root.execute(CounterCommand::Increment).expect("inc");
        repo.save(&mut root, Uuid::new_v4(), &ActionMetadata::default())
            .await
            .expect("save");
        repo.save_to_stream(
            "log",
            &[CounterEvent::Incremented, CounterEvent::Incremented],
            Uuid::new_v4(),
            &ActionMetadata::default(),
        )
        .await
        .expect("raw save");

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn request_timeout_stamps_commit_id() {
        struct Capture(Mutex<Vec<(String, Uuid, Headers)>>);

        #[tonic::async_trait]
        impl TimeoutRequestor for Capture {
            async fn request_timeout(
                &self,
                stream: &str,
                commit_id: Uuid,
                _event: EventData,
                _at: DateTime<Utc>,
                headers: &Headers,
            ) -> Result<(), StoreError> {
                self.0
                    .lock()
                    .expect("lock")
                    .push((stream.to_string(), commit_id, headers.clone()));
                Ok(())
            }
        }

        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        let repo = Repository::builder(Arc::new(InMemoryStreamStore::new()))
            .timeouts(capture.clone())
            .build();
        let commit_id = Uuid::new_v4();

        repo.request_timeout(
            "order-123",
            &CounterEvent::Incremented,
            commit_id,
            Utc::now(),
            &ActionMetadata::default().with_entry("UserId", json!("u-1")),
        )
        .await
        .expect("request");

        let requests = capture.0.lock().expect("lock");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "order-123");
        assert_eq!(requests[0].1, commit_id);
        assert_eq!(requests[0].2[COMMIT_ID_HEADER], json!(commit_id.to_string()));
        assert_eq!(requests[0].2["UserId"], "u-1");
    }
}
