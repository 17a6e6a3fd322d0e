//! In-process [`StreamStore`] for tests and embedding.
//!
//! Streams live in a `HashMap` behind a mutex; live subscriptions are fed
//! from a broadcast channel of appended records. The store also exposes a
//! few fault-injection hooks (dropping subscriptions, refusing new ones)
//! so resubscription logic can be exercised without a server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::StoreError;
use crate::stream::{
    EventData, EventSubscription, ExpectedVersion, ReadStatus, RecordedEvent, StreamSlice,
    StreamStore, StreamTransaction, WriteResult,
};

/// Capacity of the live-append broadcast; slower subscribers are dropped.
const LIVE_BUFFER: usize = 4096;

/// Thread-safe in-memory stream store. Clone is cheap and shares state.
#[derive(Clone)]
pub struct InMemoryStreamStore {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    appended: broadcast::Sender<RecordedEvent>,
    drops: broadcast::Sender<String>,
    refuse_subscriptions: AtomicU32,
    subscribe_calls: AtomicU32,
    appends: AtomicU32,
    transactions: AtomicU32,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, StoredStream>,
}

#[derive(Default)]
struct StoredStream {
    events: Vec<RecordedEvent>,
    deleted: bool,
}

impl InMemoryStreamStore {
    #[must_use]
    pub fn new() -> Self {
        let (appended, _) = broadcast::channel(LIVE_BUFFER);
        let (drops, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                appended,
                drops,
                refuse_subscriptions: AtomicU32::new(0),
                subscribe_calls: AtomicU32::new(0),
                appends: AtomicU32::new(0),
                transactions: AtomicU32::new(0),
            }),
        }
    }

    /// Current version (event count) of `stream`.
    pub fn stream_version(&self, stream: &str) -> u64 {
        let state = self.lock();
        state
            .streams
            .get(stream)
            .map_or(0, |s| s.events.len() as u64)
    }

    /// Every raw record of `stream`, links unresolved.
    pub fn events(&self, stream: &str) -> Vec<RecordedEvent> {
        let state = self.lock();
        state
            .streams
            .get(stream)
            .map(|s| s.events.clone())
            .unwrap_or_default()
    }

    /// Mark `stream` deleted. Reads report it, writes fail.
    pub fn delete_stream(&self, stream: &str) {
        let mut state = self.lock();
        state.streams.entry(stream.to_string()).or_default().deleted = true;
    }

    /// End every open subscription with a drop carrying `reason`.
    pub fn drop_subscriptions(&self, reason: impl Into<String>) {
        let _ = self.inner.drops.send(reason.into());
    }

    /// Make the next `count` subscribe attempts fail.
    pub fn refuse_next_subscriptions(&self, count: u32) {
        self.inner.refuse_subscriptions.store(count, Ordering::SeqCst);
    }

    /// Number of subscribe attempts so far, refused ones included.
    pub fn subscribe_calls(&self) -> u32 {
        self.inner.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Number of single-shot appends performed.
    pub fn append_calls(&self) -> u32 {
        self.inner.appends.load(Ordering::SeqCst)
    }

    /// Number of transactions opened.
    pub fn transaction_calls(&self) -> u32 {
        self.inner.transactions.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .expect("in-memory store lock poisoned")
    }

    /// Append under the lock and broadcast the new records.
    fn write(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<WriteResult, StoreError> {
        let mut state = self.lock();
        let stored = state.streams.entry(stream.to_string()).or_default();
        if stored.deleted {
            return Err(StoreError::StreamDeleted(stream.to_string()));
        }
        let current = stored.events.len() as u64;
        if !expected.matches(current) {
            return Err(StoreError::WrongExpectedVersion {
                stream: stream.to_string(),
                expected,
                actual: Some(current),
            });
        }
        let recorded_at = chrono::Utc::now().timestamp_millis().max(0) as u64;
        for (offset, event) in events.into_iter().enumerate() {
            let number = current + offset as u64;
            let record = RecordedEvent {
                event_id: event.event_id,
                stream: stream.to_string(),
                event_number: number,
                original_stream: stream.to_string(),
                original_event_number: number,
                event_type: event.event_type,
                is_json: event.is_json,
                data: event.data,
                metadata: event.metadata,
                recorded_at,
            };
            stored.events.push(record.clone());
            // No receivers is fine.
            let _ = self.inner.appended.send(record);
        }
        Ok(WriteResult {
            next_expected_version: stored.events.len() as u64,
        })
    }

    /// Relay backlog and live appends of `stream` into `tx` until dropped.
    async fn forward(
        self,
        stream: String,
        backlog: Vec<RecordedEvent>,
        mut next: u64,
        resolve_links: bool,
        mut live: broadcast::Receiver<RecordedEvent>,
        mut drops: broadcast::Receiver<String>,
        tx: mpsc::UnboundedSender<Result<RecordedEvent, StoreError>>,
    ) {
        for event in backlog {
            next = event.original_event_number + 1;
            if tx.send(Ok(event)).is_err() {
                return;
            }
        }
        loop {
            tokio::select! {
                reason = drops.recv() => {
                    let reason = reason.unwrap_or_else(|_| "store closed".to_string());
                    let _ = tx.send(Err(StoreError::SubscriptionDropped { stream, reason }));
                    return;
                }
                received = live.recv() => match received {
                    Ok(event) => {
                        if event.original_stream != stream || event.original_event_number < next {
                            continue;
                        }
                        next = event.original_event_number + 1;
                        let event = if resolve_links {
                            self.lock().resolve(event)
                        } else {
                            event
                        };
                        if tx.send(Ok(event)).is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        let reason = format!("subscriber lagged by {skipped} events");
                        let _ = tx.send(Err(StoreError::SubscriptionDropped { stream, reason }));
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                _ = tx.closed() => return,
            }
        }
    }
}

impl Default for InMemoryStreamStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryStreamStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let streams = self.lock().streams.len();
        f.debug_struct("InMemoryStreamStore")
            .field("streams", &streams)
            .finish()
    }
}

impl State {
    fn slice(&self, stream: &str, start: u64, count: u64, resolve_links: bool) -> StreamSlice {
        let Some(stored) = self.streams.get(stream) else {
            return StreamSlice::empty(ReadStatus::StreamNotFound, start);
        };
        if stored.deleted {
            return StreamSlice::empty(ReadStatus::StreamDeleted, start);
        }
        let len = stored.events.len() as u64;
        let from = start.min(len);
        let to = start.saturating_add(count).min(len);
        let events = stored.events[from as usize..to as usize]
            .iter()
            .cloned()
            .map(|e| if resolve_links { self.resolve(e) } else { e })
            .collect();
        StreamSlice {
            status: ReadStatus::Success,
            events,
            next_event_number: to.max(start),
            is_end_of_stream: to >= len,
        }
    }

    /// Substitute a link record with its target, keeping the link's position
    /// as the original position. Dangling links are returned unchanged.
    fn resolve(&self, record: RecordedEvent) -> RecordedEvent {
        let Some((number, target)) = record.link_target() else {
            return record;
        };
        let Some(event) = self
            .streams
            .get(target)
            .and_then(|s| s.events.get(number as usize))
        else {
            return record;
        };
        RecordedEvent {
            original_stream: record.original_stream,
            original_event_number: record.original_event_number,
            ..event.clone()
        }
    }
}

struct MemoryTransaction {
    store: InMemoryStreamStore,
    stream: String,
    opened_at: u64,
    pending: Vec<EventData>,
}

#[tonic::async_trait]
impl StreamTransaction for MemoryTransaction {
    async fn write(&mut self, events: Vec<EventData>) -> Result<(), StoreError> {
        self.pending.extend(events);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<WriteResult, StoreError> {
        let this = *self;
        this.store.write(
            &this.stream,
            ExpectedVersion::Exact(this.opened_at),
            this.pending,
        )
    }
}

#[tonic::async_trait]
impl StreamStore for InMemoryStreamStore {
    #[tracing::instrument(skip(self, events), fields(event_count = events.len()))]
    async fn append_to_stream(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<WriteResult, StoreError> {
        self.inner.appends.fetch_add(1, Ordering::SeqCst);
        self.write(stream, expected, events)
    }

    async fn start_transaction(
        &self,
        stream: &str,
        expected: ExpectedVersion,
    ) -> Result<Box<dyn StreamTransaction>, StoreError> {
        self.inner.transactions.fetch_add(1, Ordering::SeqCst);
        let opened_at = {
            let state = self.lock();
            let stored = state.streams.get(stream);
            if stored.is_some_and(|s| s.deleted) {
                return Err(StoreError::StreamDeleted(stream.to_string()));
            }
            let current = stored.map_or(0, |s| s.events.len() as u64);
            if !expected.matches(current) {
                return Err(StoreError::WrongExpectedVersion {
                    stream: stream.to_string(),
                    expected,
                    actual: Some(current),
                });
            }
            current
        };
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            stream: stream.to_string(),
            opened_at,
            pending: Vec::new(),
        }))
    }

    async fn read_stream_forward(
        &self,
        stream: &str,
        start: u64,
        count: u64,
        resolve_links: bool,
    ) -> Result<StreamSlice, StoreError> {
        Ok(self.lock().slice(stream, start, count, resolve_links))
    }

    async fn subscribe_from(
        &self,
        stream: &str,
        last_checkpoint: Option<u64>,
        resolve_links: bool,
    ) -> Result<EventSubscription, StoreError> {
        self.inner.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .inner
            .refuse_subscriptions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(StoreError::SubscriptionDropped {
                stream: stream.to_string(),
                reason: "subscription refused".to_string(),
            });
        }

        let start = last_checkpoint.map_or(0, |n| n + 1);
        // Subscribe to live appends under the lock so nothing falls between
        // the backlog snapshot and the live feed.
        let (backlog, live, drops) = {
            let state = self.lock();
            let live = self.inner.appended.subscribe();
            let drops = self.inner.drops.subscribe();
            let slice = state.slice(stream, start, u64::MAX, resolve_links);
            if slice.status == ReadStatus::StreamDeleted {
                return Err(StoreError::StreamDeleted(stream.to_string()));
            }
            (slice.events, live, drops)
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.clone().forward(
            stream.to_string(),
            backlog,
            start,
            resolve_links,
            live,
            drops,
            tx,
        ));
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}
