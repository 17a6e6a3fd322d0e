//! Checkpoint stores: where each process manager remembers the last event
//! number it handled, so a resubscription resumes right after it.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Persists the last processed event number per process manager.
#[tonic::async_trait]
pub trait CheckpointStore: Send + Sync + 'static {
    /// The last event number recorded for `name`, or `None` if it has
    /// never processed anything.
    async fn last_event(&self, name: &str) -> Result<Option<u64>, StoreError>;

    /// Record `event_number` as processed by `name`.
    async fn record(&self, name: &str, event_number: u64) -> Result<(), StoreError>;
}

/// Process-local checkpoints. Recorded positions only move forward.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpoints {
    positions: Arc<Mutex<HashMap<String, u64>>>,
}

impl InMemoryCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a position, as if `name` had already processed `event_number`.
    pub fn with_position(self, name: impl Into<String>, event_number: u64) -> Self {
        self.lock().insert(name.into(), event_number);
        self
    }

    /// Synchronous read, for tests and diagnostics.
    pub fn position(&self, name: &str) -> Option<u64> {
        self.lock().get(name).copied()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.positions.lock().expect("checkpoint lock poisoned")
    }
}

#[tonic::async_trait]
impl CheckpointStore for InMemoryCheckpoints {
    async fn last_event(&self, name: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.position(name))
    }

    async fn record(&self, name: &str, event_number: u64) -> Result<(), StoreError> {
        let mut positions = self.lock();
        let position = positions.entry(name.to_string()).or_insert(event_number);
        *position = (*position).max(event_number);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    last_event_number: u64,
}

/// Checkpoints kept on disk as `<dir>/<name>/checkpoint.json`.
///
/// Writes go to a temporary file that is then renamed over the checkpoint,
/// so a crash never leaves a half-written file behind. A corrupt file is
/// logged and treated as missing, which replays the stream from the start.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory holding the checkpoint of `name`. The name must be a single
    /// plain path component.
    fn checkpoint_dir(&self, name: &str) -> Result<PathBuf, StoreError> {
        let plain = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\', '\0']);
        if !plain {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("process manager name {name:?} is not a valid checkpoint directory"),
            )
            .into());
        }
        Ok(self.dir.join(name))
    }
}

fn save_checkpoint(dir: &Path, checkpoint: &CheckpointFile) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join("checkpoint.json");
    let tmp_path = dir.join("checkpoint.json.tmp");
    let json = serde_json::to_string_pretty(checkpoint).map_err(io::Error::other)?;
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

fn load_checkpoint(dir: &Path) -> io::Result<Option<CheckpointFile>> {
    let path = dir.join("checkpoint.json");
    match std::fs::read_to_string(&path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "corrupt process manager checkpoint, replaying from start"
                );
                Ok(None)
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[tonic::async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn last_event(&self, name: &str) -> Result<Option<u64>, StoreError> {
        let dir = self.checkpoint_dir(name)?;
        let loaded = tokio::task::spawn_blocking(move || load_checkpoint(&dir))
            .await
            .map_err(io::Error::other)??;
        Ok(loaded.map(|c| c.last_event_number))
    }

    async fn record(&self, name: &str, event_number: u64) -> Result<(), StoreError> {
        let dir = self.checkpoint_dir(name)?;
        let checkpoint = CheckpointFile {
            last_event_number: event_number,
        };
        tokio::task::spawn_blocking(move || save_checkpoint(&dir, &checkpoint))
            .await
            .map_err(io::Error::other)??;
        Ok(())
    }
}
