//! Scheduling events for future delivery into a stream.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::{EventCodec, EventPayload, JsonCodec};
use crate::metadata::{COMMIT_ID_HEADER, Headers};
use crate::stream::{EventData, ExpectedVersion, StreamStore};

/// Schedules delivery of an event into a stream no earlier than a deadline.
#[tonic::async_trait]
pub trait TimeoutRequestor: Send + Sync + 'static {
    /// Register the request. Returns once it is scheduled, not delivered.
    ///
    /// # Arguments
    ///
    /// * `stream` - Stream the event is delivered to.
    /// * `commit_id` - Commit id of the requesting unit of work.
    /// * `event` - The serialized event to deliver.
    /// * `at` - Earliest delivery time.
    /// * `headers` - Commit headers of the request.
    async fn request_timeout(
        &self,
        stream: &str,
        commit_id: Uuid,
        event: EventData,
        at: DateTime<Utc>,
        headers: &Headers,
    ) -> Result<(), StoreError>;
}

/// In-process timer: a tokio task sleeps until the deadline, then appends
/// the event with expected version "any".
///
/// Pending timeouts do not survive a restart.
#[derive(Clone)]
pub struct DelayedAppendTimeouts {
    store: Arc<dyn StreamStore>,
}

impl DelayedAppendTimeouts {
    pub fn new(store: Arc<dyn StreamStore>) -> Self {
        Self { store }
    }
}

#[tonic::async_trait]
impl TimeoutRequestor for DelayedAppendTimeouts {
    async fn request_timeout(
        &self,
        stream: &str,
        commit_id: Uuid,
        event: EventData,
        at: DateTime<Utc>,
        _headers: &Headers,
    ) -> Result<(), StoreError> {
        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        let store = self.store.clone();
        let stream = stream.to_string();
        tracing::debug!(
            stream = %stream,
            commit_id = %commit_id,
            delay_ms = delay.as_millis() as u64,
            "timeout scheduled"
        );
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = store
                .append_to_stream(&stream, ExpectedVersion::Any, vec![event])
                .await
            {
                tracing::error!(
                    stream = %stream,
                    commit_id = %commit_id,
                    error = %e,
                    "failed to deliver timeout"
                );
            }
        });
        Ok(())
    }
}

/// Durable record of a timeout request, consumed by an external scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutRequested {
    pub target_stream: String,
    pub commit_id: Uuid,
    pub deliver_at: DateTime<Utc>,
    pub event_id: Uuid,
    pub event_type: String,
    pub is_json: bool,
    /// Raw event data; JSON payloads are embedded as JSON, others as text.
    pub data: serde_json::Value,
    pub headers: Headers,
}

/// Appends a [`TimeoutRequested`] record to a scheduler stream and leaves
/// delivery to whoever consumes that stream.
#[derive(Clone)]
pub struct TimeoutStreamRequestor {
    store: Arc<dyn StreamStore>,
    codec: Arc<dyn EventCodec>,
    stream: String,
}

impl TimeoutStreamRequestor {
    pub fn new(store: Arc<dyn StreamStore>, stream: impl Into<String>) -> Self {
        Self {
            store,
            codec: Arc::new(JsonCodec),
            stream: stream.into(),
        }
    }

    /// Replace the codec used for the scheduler records.
    pub fn with_codec(mut self, codec: Arc<dyn EventCodec>) -> Self {
        self.codec = codec;
        self
    }
}

#[tonic::async_trait]
impl TimeoutRequestor for TimeoutStreamRequestor {
    async fn request_timeout(
        &self,
        stream: &str,
        commit_id: Uuid,
        event: EventData,
        at: DateTime<Utc>,
        headers: &Headers,
    ) -> Result<(), StoreError> {
        let data = if event.is_json {
            serde_json::from_slice(&event.data).unwrap_or(serde_json::Value::Null)
        } else {
            serde_json::Value::String(String::from_utf8_lossy(&event.data).into_owned())
        };
        let request = TimeoutRequested {
            target_stream: stream.to_string(),
            commit_id,
            deliver_at: at,
            event_id: event.event_id,
            event_type: event.event_type,
            is_json: event.is_json,
            data,
            headers: headers.clone(),
        };
        let body = serde_json::to_value(&request)
            .map_err(|e| StoreError::Protocol(format!("cannot encode timeout request: {e}")))?;
        let mut record_headers = Headers::new();
        record_headers.insert(
            COMMIT_ID_HEADER.to_string(),
            serde_json::Value::String(commit_id.to_string()),
        );
        let record = self
            .codec
            .serialize(
                Uuid::new_v4(),
                &EventPayload::new("TimeoutRequested", body),
                &record_headers,
            )
            .map_err(|e| StoreError::Protocol(e.to_string()))?;
        self.store
            .append_to_stream(&self.stream, ExpectedVersion::Any, vec![record])
            .await?;
        Ok(())
    }
}
