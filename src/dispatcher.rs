//! Process manager dispatcher: one resilient live subscription per process
//! manager, feeding a batching and partitioning pipeline.
//!
//! Each registered [`ProcessManager`] gets a supervisor task that reads the
//! manager's checkpoint, subscribes to its stream from there and waits for
//! the subscription to drop or for shutdown. Arriving events are decoded
//! immediately and buffered; a batch is flushed when it reaches
//! [`DispatcherConfig::max_batch_size`] or when
//! [`DispatcherConfig::batch_window`] has passed since its first event.
//! Every batch is split into partitions by a key found in the event headers
//! and each partition is handed to the [`ProcessingChain`].
//!
//! ```text
//! Unsubscribed -> Subscribing -> Live -> (Dropped -> Subscribing)* -> ShutDown
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::Instrument;

use crate::backoff::{BackoffPolicy, FixedBackoff};
use crate::checkpoint::{CheckpointStore, InMemoryCheckpoints};
use crate::config::DispatcherConfig;
use crate::error::StoreError;
use crate::event::{
    DecodedEvent, DeserializationResult, EventCodec, JsonCodec, original_event_number,
};
use crate::process_manager::{
    Environment, ErrorStreamWriter, ExceptionSink, HeaderPartitionKey, PartitionKeyFinder,
    PartitionRequest, ProcessManager, ProcessingChain,
};
use crate::stream::{EventSubscription, StreamStore};

/// Lifecycle of one process manager's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Registered, dispatcher not started.
    Unsubscribed,
    /// Reading the checkpoint and opening the subscription, or waiting to
    /// retry after a failed attempt.
    Subscribing,
    Live,
    /// The store ended the subscription; a resubscription follows.
    Dropped,
    ShutDown,
}

/// Runs every registered process manager against its stream.
///
/// Built with [`ProcessManagerDispatcher::builder`]. `Clone` is cheap and
/// every clone controls the same dispatcher.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use streamfold_es::{
///     DispatcherConfig, InMemoryStreamStore, ProcessManagerDispatcher, Repository,
///     RepositoryChain,
/// };
/// # use streamfold_es::{BoxError, DecodedEvent, ProcessManager, UnitOfWork};
/// # struct Billing;
/// # #[tonic::async_trait]
/// # impl ProcessManager for Billing {
/// #     fn name(&self) -> &str { "billing" }
/// #     async fn handle(&self, _: &DecodedEvent, _: &mut UnitOfWork) -> Result<(), BoxError> { Ok(()) }
/// # }
///
/// # async fn run() {
/// let store = Arc::new(InMemoryStreamStore::new());
/// let repository = Repository::builder(store.clone()).build();
/// let dispatcher = ProcessManagerDispatcher::builder(store, RepositoryChain::new(repository))
///     .config(DispatcherConfig::from_env())
///     .process_manager(Billing)
///     .build();
///
/// dispatcher.start();
/// // ...
/// dispatcher.shutdown().await;
/// # }
/// ```
#[derive(Clone)]
pub struct ProcessManagerDispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn StreamStore>,
    codec: Arc<dyn EventCodec>,
    checkpoints: Arc<dyn CheckpointStore>,
    chain: Arc<dyn ProcessingChain>,
    partition_keys: Arc<dyn PartitionKeyFinder>,
    errors: ErrorStreamWriter,
    backoff: Arc<dyn BackoffPolicy>,
    environment: Environment,
    config: DispatcherConfig,
    process_managers: Vec<Arc<dyn ProcessManager>>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    subscriptions: Mutex<HashMap<String, ProcessManagerSubscription>>,
    states: Mutex<HashMap<String, SubscriptionState>>,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessManagerDispatcher {
    /// Start configuring a dispatcher reading from `store` and handing
    /// partitions to `chain`.
    pub fn builder(
        store: Arc<dyn StreamStore>,
        chain: impl ProcessingChain,
    ) -> ProcessManagerDispatcherBuilder {
        ProcessManagerDispatcherBuilder::new(store, Arc::new(chain))
    }

    /// Spawn one supervisor per process manager.
    ///
    /// Must be called from within a tokio runtime. Calling it again while
    /// running is a no-op; a dispatcher that was shut down cannot be
    /// restarted.
    pub fn start(&self) {
        if *self.inner.shutdown_tx.borrow() {
            tracing::warn!("dispatcher was shut down, not starting");
            return;
        }
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut supervisors = self
            .inner
            .supervisors
            .lock()
            .expect("supervisor lock poisoned");
        for pm in &self.inner.process_managers {
            let shutdown_rx = self.inner.shutdown_tx.subscribe();
            supervisors.push(tokio::spawn(supervise(
                self.inner.clone(),
                pm.clone(),
                shutdown_rx,
            )));
        }
        tracing::info!(
            process_managers = self.inner.process_managers.len(),
            "dispatcher started"
        );
    }

    /// Stop every subscription and wait for the supervisors to exit.
    ///
    /// Batches already handed to the processing chain run to completion;
    /// events buffered but not yet flushed are dropped; they are redelivered
    /// from the checkpoint the next time the process managers run.
    pub async fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.shutdown_tx.send_replace(true);

        let subscriptions: Vec<_> = self
            .inner
            .subscriptions
            .lock()
            .expect("subscription table lock poisoned")
            .drain()
            .map(|(_, subscription)| subscription)
            .collect();
        for subscription in subscriptions {
            subscription.close().await;
        }

        let supervisors = std::mem::take(
            &mut *self
                .inner
                .supervisors
                .lock()
                .expect("supervisor lock poisoned"),
        );
        for supervisor in supervisors {
            if let Err(e) = supervisor.await {
                tracing::error!(error = %e, "process manager supervisor panicked");
            }
        }

        for pm in &self.inner.process_managers {
            self.inner.set_state(pm.name(), SubscriptionState::ShutDown);
        }
        tracing::info!("dispatcher shut down");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Current state of the named process manager, `None` if it is not
    /// registered.
    pub fn state(&self, name: &str) -> Option<SubscriptionState> {
        self.inner
            .states
            .lock()
            .expect("state lock poisoned")
            .get(name)
            .copied()
    }
}

impl Inner {
    fn set_state(&self, name: &str, state: SubscriptionState) {
        tracing::debug!(process_manager = name, ?state, "subscription state");
        self.states
            .lock()
            .expect("state lock poisoned")
            .insert(name.to_string(), state);
    }

    fn take_subscription(&self, name: &str) -> Option<ProcessManagerSubscription> {
        self.subscriptions
            .lock()
            .expect("subscription table lock poisoned")
            .remove(name)
    }

    /// Put `subscription` in the table, or hand it back if the dispatcher
    /// stopped in the meantime.
    fn register(
        &self,
        name: &str,
        subscription: ProcessManagerSubscription,
    ) -> Option<ProcessManagerSubscription> {
        let mut table = self
            .subscriptions
            .lock()
            .expect("subscription table lock poisoned");
        if !self.running.load(Ordering::Acquire) {
            return Some(subscription);
        }
        table.insert(name.to_string(), subscription);
        None
    }

    async fn subscribe(
        self: &Arc<Self>,
        pm: &Arc<dyn ProcessManager>,
    ) -> Result<(ProcessManagerSubscription, oneshot::Receiver<String>), StoreError> {
        let checkpoint = self.checkpoints.last_event(pm.name()).await?;
        let events = self
            .store
            .subscribe_from(pm.stream(), checkpoint, self.config.resolve_links)
            .await?;
        tracing::info!(from_checkpoint = ?checkpoint, "subscribed");
        Ok(ProcessManagerSubscription::start(
            self.clone(),
            pm.clone(),
            events,
        ))
    }

    /// Report undecodable events, fan the rest out by partition, then
    /// record the batch's last event number.
    async fn dispatch_batch(&self, pm: &Arc<dyn ProcessManager>, batch: Vec<DeserializationResult>) {
        let Some(last) = batch.iter().map(original_event_number).max() else {
            return;
        };
        let name = pm.name();
        let batch_len = batch.len();

        let mut partitions: Vec<(String, Vec<DecodedEvent>)> = Vec::new();
        let mut slots: HashMap<String, usize> = HashMap::new();
        for result in batch {
            match result {
                Ok(event) => {
                    let key = self.partition_keys.find(&event.metadata).unwrap_or_default();
                    let slot = *slots.entry(key.clone()).or_insert_with(|| {
                        partitions.push((key, Vec::new()));
                        partitions.len() - 1
                    });
                    partitions[slot].1.push(event);
                }
                Err(failed) => self.errors.report_undecodable(name, &failed).await,
            }
        }

        let partition_count = partitions.len();
        let mut tasks = JoinSet::new();
        for (partition_key, events) in partitions {
            let chain = self.chain.clone();
            let sink = ExceptionSink::new(self.errors.clone(), name);
            let request = PartitionRequest {
                environment: self.environment.clone(),
                process_manager: pm.clone(),
                events: events.clone(),
                partition_key: partition_key.clone(),
                on_exception: sink.clone(),
            };
            tasks.spawn(async move {
                if let Err(e) = chain.process(request).await {
                    tracing::warn!(
                        partition_key = %partition_key,
                        events = events.len(),
                        error = %e,
                        "partition failed"
                    );
                    for event in &events {
                        sink.report(event, &e).await;
                    }
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "partition task panicked");
            }
        }

        if self.config.record_checkpoints {
            if let Err(e) = self.checkpoints.record(name, last).await {
                tracing::error!(event_number = last, error = %e, "failed to record checkpoint");
            }
        }
        tracing::debug!(
            events = batch_len,
            partitions = partition_count,
            last_event_number = last,
            "batch dispatched"
        );
    }
}

/// Supervisor loop for one process manager. Exits on shutdown.
async fn supervise(
    inner: Arc<Inner>,
    pm: Arc<dyn ProcessManager>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let name = pm.name().to_string();
    let span = tracing::info_span!("process_manager", name = %name, stream = %pm.stream());

    async move {
        let mut attempt = 0u32;
        while inner.running.load(Ordering::Acquire) {
            inner.set_state(&name, SubscriptionState::Subscribing);
            if let Some(existing) = inner.take_subscription(&name) {
                existing.close().await;
            }

            match inner.subscribe(&pm).await {
                Ok((subscription, dropped_rx)) => {
                    attempt = 0;
                    if let Some(rejected) = inner.register(&name, subscription) {
                        rejected.close().await;
                        break;
                    }
                    inner.set_state(&name, SubscriptionState::Live);

                    tokio::select! {
                        reason = dropped_rx => {
                            let reason = reason.unwrap_or_else(|_| "subscription closed".to_string());
                            inner.set_state(&name, SubscriptionState::Dropped);
                            tracing::warn!(reason = %reason, "subscription dropped, resubscribing");
                        }
                        () = shutdown_requested(&mut shutdown_rx) => break,
                    }
                }
                Err(e) => {
                    let delay = inner.backoff.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "subscribe failed, will retry"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        () = shutdown_requested(&mut shutdown_rx) => break,
                    }
                }
            }
        }
        tracing::debug!("supervisor exiting");
    }
    .instrument(span)
    .await
}

/// Resolves once shutdown is signalled, or the dispatcher is gone.
async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

/// One open subscription: a feeder task decoding store events into a
/// channel, and a batcher task cutting that channel into batches.
struct ProcessManagerSubscription {
    feeder: JoinHandle<()>,
    batcher: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl ProcessManagerSubscription {
    /// Spawn both tasks. The receiver resolves with the drop reason once the
    /// store ends the subscription.
    fn start(
        inner: Arc<Inner>,
        pm: Arc<dyn ProcessManager>,
        mut events: EventSubscription,
    ) -> (Self, oneshot::Receiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (dropped_tx, dropped_rx) = oneshot::channel();
        let codec = inner.codec.clone();

        let feeder = tokio::spawn(async move {
            let reason = loop {
                match events.next().await {
                    Some(Ok(record)) => {
                        if tx.send(codec.deserialize(&record)).is_err() {
                            break "batcher stopped".to_string();
                        }
                    }
                    Some(Err(e)) => break e.to_string(),
                    None => break "subscription ended".to_string(),
                }
            };
            drop(tx);
            let _ = dropped_tx.send(reason);
        });

        let (stop, mut stop_rx) = watch::channel(false);
        let max_batch_size = inner.config.max_batch_size.max(1);
        let batch_window = inner.config.batch_window;
        let batcher = tokio::spawn(async move {
            let batches =
                UnboundedReceiverStream::new(rx).chunks_timeout(max_batch_size, batch_window);
            tokio::pin!(batches);
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    batch = batches.next() => match batch {
                        Some(batch) => inner.dispatch_batch(&pm, batch).await,
                        None => break,
                    },
                }
            }
        });

        (
            Self {
                feeder,
                batcher,
                stop,
            },
            dropped_rx,
        )
    }

    /// Stop reading, let an in-flight batch finish, discard the rest.
    async fn close(self) {
        self.feeder.abort();
        let _ = self.stop.send(true);
        if let Err(e) = self.batcher.await {
            if e.is_panic() {
                tracing::error!(error = %e, "batcher task panicked");
            }
        }
    }
}

/// Builder for [`ProcessManagerDispatcher`].
pub struct ProcessManagerDispatcherBuilder {
    store: Arc<dyn StreamStore>,
    chain: Arc<dyn ProcessingChain>,
    codec: Arc<dyn EventCodec>,
    checkpoints: Arc<dyn CheckpointStore>,
    partition_keys: Arc<dyn PartitionKeyFinder>,
    backoff: Arc<dyn BackoffPolicy>,
    environment: Environment,
    config: DispatcherConfig,
    process_managers: Vec<Arc<dyn ProcessManager>>,
}

impl ProcessManagerDispatcherBuilder {
    fn new(store: Arc<dyn StreamStore>, chain: Arc<dyn ProcessingChain>) -> Self {
        Self {
            store,
            chain,
            codec: Arc::new(JsonCodec),
            checkpoints: Arc::new(InMemoryCheckpoints::new()),
            partition_keys: Arc::new(HeaderPartitionKey::default()),
            backoff: Arc::new(FixedBackoff::default()),
            environment: Environment::new(),
            config: DispatcherConfig::default(),
            process_managers: Vec::new(),
        }
    }

    /// Register a process manager. A second one with the same name is
    /// ignored.
    pub fn process_manager(mut self, pm: impl ProcessManager) -> Self {
        if self.process_managers.iter().any(|p| p.name() == pm.name()) {
            tracing::warn!(name = pm.name(), "duplicate process manager ignored");
            return self;
        }
        self.process_managers.push(Arc::new(pm));
        self
    }

    pub fn codec(mut self, codec: Arc<dyn EventCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Replace the default process-local [`InMemoryCheckpoints`].
    pub fn checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    pub fn partition_keys(mut self, finder: impl PartitionKeyFinder) -> Self {
        self.partition_keys = Arc::new(finder);
        self
    }

    /// Delay policy between failed subscription attempts. Default: a fixed
    /// 500 ms.
    pub fn backoff(mut self, backoff: impl BackoffPolicy) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> ProcessManagerDispatcher {
        let errors = ErrorStreamWriter::new(self.store.clone(), self.config.error_stream.clone())
            .with_codec(self.codec.clone());
        let states = self
            .process_managers
            .iter()
            .map(|pm| (pm.name().to_string(), SubscriptionState::Unsubscribed))
            .collect();
        let (shutdown_tx, _) = watch::channel(false);
        ProcessManagerDispatcher {
            inner: Arc::new(Inner {
                store: self.store,
                codec: self.codec,
                checkpoints: self.checkpoints,
                chain: self.chain,
                partition_keys: self.partition_keys,
                errors,
                backoff: self.backoff,
                environment: self.environment,
                config: self.config,
                process_managers: self.process_managers,
                running: AtomicBool::new(false),
                shutdown_tx,
                subscriptions: Mutex::new(HashMap::new()),
                states: Mutex::new(states),
                supervisors: Mutex::new(Vec::new()),
            }),
        }
    }
}
