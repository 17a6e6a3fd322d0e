//! Action metadata and commit header names.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stream::ExpectedVersion;

/// Key/value header bag serialized into each event's metadata bytes.
pub type Headers = serde_json::Map<String, Value>;

/// Header carrying the client-generated commit id.
pub const COMMIT_ID_HEADER: &str = "CommitId";
/// Header carrying the aggregate type tag.
pub const AGGREGATE_TYPE_HEADER: &str = "AggregateType";
/// Header carrying the aggregate id.
pub const AGGREGATE_ID_HEADER: &str = "AggregateId";
/// Header carrying the aggregate or stream context.
pub const CONTEXT_HEADER: &str = "Context";
/// Header carrying the id of a command attached to the unit of work.
pub const COMMAND_ID_HEADER: &str = "CommandId";
/// Header naming what caused an attached command.
pub const CAUSED_BY_HEADER: &str = "CausedBy";
/// Header used by default to partition dispatched events.
pub const PARTITION_KEY_HEADER: &str = "PartitionKey";

/// Immutable bag of key/value pairs attached to a load or save call.
///
/// Entries are copied into the commit headers of every event written with
/// this metadata. An explicit expected version overrides the one the
/// repository would derive from the aggregate.
///
/// # Examples
///
/// ```
/// use streamfold_es::{ActionMetadata, ExpectedVersion};
/// use serde_json::json;
///
/// let meta = ActionMetadata::default()
///     .with_entry("UserId", json!("user-42"))
///     .with_context("tenant-a")
///     .with_expected_version(ExpectedVersion::Exact(3));
///
/// assert_eq!(meta.entry("UserId"), Some(&json!("user-42")));
/// assert_eq!(meta.context(), "tenant-a");
/// assert_eq!(meta.expected_version(), Some(ExpectedVersion::Exact(3)));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionMetadata {
    entries: Headers,
    expected_version: Option<ExpectedVersion>,
    context: Option<String>,
}

impl ActionMetadata {
    /// Add (or replace) an entry.
    ///
    /// # Arguments
    ///
    /// * `key` - Header name.
    /// * `value` - Any JSON value.
    ///
    /// # Returns
    ///
    /// The updated `ActionMetadata`.
    pub fn with_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.entries.insert(key.into(), value);
        self
    }

    /// Set an explicit expected version, overriding the derived one.
    pub fn with_expected_version(mut self, expected: ExpectedVersion) -> Self {
        self.expected_version = Some(expected);
        self
    }

    /// Set the aggregate context (logical namespace / tenant tag).
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn entry(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> &Headers {
        &self.entries
    }

    pub fn expected_version(&self) -> Option<ExpectedVersion> {
        self.expected_version
    }

    /// The context, or `""` when none is set.
    pub fn context(&self) -> &str {
        self.context.as_deref().unwrap_or_default()
    }

    /// Copy the entries into a fresh header bag stamped with `commit_id`.
    pub(crate) fn commit_headers(&self, commit_id: uuid::Uuid) -> Headers {
        let mut headers = self.entries.clone();
        headers.insert(
            COMMIT_ID_HEADER.to_string(),
            Value::String(commit_id.to_string()),
        );
        headers
    }
}
