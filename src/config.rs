//! Tuning knobs for the repository and the process manager dispatcher.

use std::time::Duration;

/// Default number of events read per page during replay.
pub const DEFAULT_READ_PAGE_SIZE: u64 = 500;

/// Batches of this many events or more are written through a transaction.
pub const DEFAULT_WRITE_PAGE_SIZE: usize = 500;

/// Configuration for the [`Repository`](crate::Repository).
///
/// # Examples
///
/// ```
/// use streamfold_es::RepositoryConfig;
///
/// let config = RepositoryConfig {
///     max_save_attempts: Some(10),
///     ..RepositoryConfig::default()
/// };
/// assert_eq!(config.read_page_size, 500);
/// ```
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Events requested per forward read while replaying a stream.
    ///
    /// Default: 500.
    pub read_page_size: u64,

    /// Write threshold and page size. Fewer events are appended in one call;
    /// more are written in pages of this size inside a transaction.
    ///
    /// Default: 500.
    pub write_page_size: usize,

    /// Upper bound on append attempts in one save, counting the first.
    ///
    /// `None` retries for as long as concurrent writes keep being judged
    /// non-conflicting. Default: `None`.
    pub max_save_attempts: Option<u32>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            read_page_size: DEFAULT_READ_PAGE_SIZE,
            write_page_size: DEFAULT_WRITE_PAGE_SIZE,
            max_save_attempts: None,
        }
    }
}

/// Configuration for the [`ProcessManagerDispatcher`](crate::ProcessManagerDispatcher).
///
/// All fields have defaults via [`DispatcherConfig::default()`];
/// [`DispatcherConfig::from_env()`] overrides them from the environment.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum time a batch stays open, measured from its first event.
    ///
    /// Default: 1 second. Env: `BATCH_DISPATCHER_WAIT_SECONDS`.
    pub batch_window: Duration,

    /// A batch is flushed as soon as it holds this many events.
    ///
    /// Default: 256. Env: `BATCH_DISPATCHER_EVENTS_PER_BATCH`.
    pub max_batch_size: usize,

    /// Stream receiving `ProcessManagerFailed` records.
    ///
    /// Default: `process-manager-errors`. Env: `ERROR_STREAM`.
    pub error_stream: String,

    /// Whether subscriptions resolve link records to their targets.
    ///
    /// Default: `true`.
    pub resolve_links: bool,

    /// Whether the dispatcher records the last event of each handled batch
    /// in the checkpoint store. Disable when the processing chain manages
    /// checkpoints itself.
    ///
    /// Default: `true`.
    pub record_checkpoints: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_secs(1),
            max_batch_size: 256,
            error_stream: "process-manager-errors".to_string(),
            resolve_links: true,
            record_checkpoints: true,
        }
    }
}

impl DispatcherConfig {
    /// Load from process environment variables, falling back to defaults
    /// for missing or unparsable values.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup, falling back to defaults for
    /// missing or unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let batch_window = lookup("BATCH_DISPATCHER_WAIT_SECONDS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.batch_window);
        let max_batch_size = lookup("BATCH_DISPATCHER_EVENTS_PER_BATCH")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.max_batch_size);
        let error_stream = lookup("ERROR_STREAM")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.error_stream);

        let config = Self {
            batch_window,
            max_batch_size,
            error_stream,
            ..defaults
        };
        tracing::debug!(
            batch_window_ms = config.batch_window.as_millis() as u64,
            max_batch_size = config.max_batch_size,
            error_stream = %config.error_stream,
            "dispatcher config loaded"
        );
        config
    }
}
