/// Activity emission: audit-facing records for lifecycle transitions.
use crate::payload::{self, Payload};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Activity verbs emitted by the pipeline.
pub mod verbs {
    pub const NOTIFICATION_CREATED: &str = "notification.created";
    pub const NOTIFICATION_DELIVERED: &str = "notification.delivered";
    pub const NOTIFICATION_FAILED: &str = "notification.failed";
    /// Preference denial; a skipped delivery is not an error
    pub const NOTIFICATION_SKIPPED: &str = "notification.skipped";
    pub const INBOX_DELIVERED: &str = "inbox.delivered";
}

/// One audit record. The metadata map carries the sanitized context
/// plus per-delivery fields (template, recipient, provider, locale,
/// status, error).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub verb: String,
    pub actor_id: String,
    pub user_id: String,
    pub tenant_id: String,
    pub object_type: String,
    pub object_id: String,
    pub channel: String,
    pub definition_code: String,
    pub recipients: Vec<String>,
    pub metadata: Payload,
    pub occurred_at: DateTime<Utc>,
}

impl ActivityEvent {
    pub fn new(verb: &str, object_type: &str, object_id: impl std::fmt::Display) -> Self {
        Self {
            verb: verb.to_string(),
            actor_id: String::new(),
            user_id: String::new(),
            tenant_id: String::new(),
            object_type: object_type.to_string(),
            object_id: object_id.to_string(),
            channel: String::new(),
            definition_code: String::new(),
            recipients: Vec::new(),
            metadata: Payload::new(),
            occurred_at: Utc::now(),
        }
    }

    /// Attach the event context, sanitized: attachment keys never
    /// leave the pipeline through activity emission.
    pub fn with_context(mut self, context: &Payload) -> Self {
        self.metadata.insert(
            "context".to_string(),
            Value::Object(payload::sanitize_context(context)),
        );
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata
            .insert(key.to_string(), Value::String(value.into()));
        self
    }
}

/// Sink for activity events. Emission failures are swallowed by
/// callers; a sink must never take the pipeline down.
#[async_trait]
pub trait ActivitySink: Send + Sync {
    async fn emit(&self, event: ActivityEvent) -> crate::errors::DispatchResult<()>;
}

/// In-memory sink; the test suites assert against its records.
#[derive(Default)]
pub struct MemoryActivitySink {
    events: Mutex<Vec<ActivityEvent>>,
}

impl MemoryActivitySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ActivityEvent> {
        self.events.lock().clone()
    }

    pub fn verbs(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.verb.clone()).collect()
    }

    /// Activity records for one event id.
    pub fn for_object(&self, object_id: &Uuid) -> Vec<ActivityEvent> {
        let wanted = object_id.to_string();
        self.events
            .lock()
            .iter()
            .filter(|e| e.object_id == wanted)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ActivitySink for MemoryActivitySink {
    async fn emit(&self, event: ActivityEvent) -> crate::errors::DispatchResult<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Sink that forwards activity to the tracing subscriber. Useful for
/// hosts that have no audit store wired up.
#[derive(Default, Debug, Clone, Copy)]
pub struct LogActivitySink;

#[async_trait]
impl ActivitySink for LogActivitySink {
    async fn emit(&self, event: ActivityEvent) -> crate::errors::DispatchResult<()> {
        tracing::info!(
            verb = %event.verb,
            object_type = %event.object_type,
            object_id = %event.object_id,
            channel = %event.channel,
            definition = %event.definition_code,
            "activity"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_sink_records_events() {
        let sink = MemoryActivitySink::new();
        let id = Uuid::new_v4();
        sink.emit(ActivityEvent::new(
            verbs::NOTIFICATION_CREATED,
            "notification_event",
            id,
        ))
        .await
        .unwrap();
        sink.emit(
            ActivityEvent::new(verbs::NOTIFICATION_DELIVERED, "notification_message", id)
                .with_meta("recipient", "user@example.com"),
        )
        .await
        .unwrap();

        assert_eq!(
            sink.verbs(),
            vec![verbs::NOTIFICATION_CREATED, verbs::NOTIFICATION_DELIVERED]
        );
        assert_eq!(sink.for_object(&id).len(), 2);
    }

    #[test]
    fn context_attachment_is_sanitized() {
        let context = json!({
            "name": "Rosa",
            "attachments": ["secret.pdf"],
            "channel_attachments": { "email": ["other.pdf"] }
        })
        .as_object()
        .unwrap()
        .clone();

        let event = ActivityEvent::new(verbs::NOTIFICATION_FAILED, "notification_event", "x")
            .with_context(&context);
        let ctx = event.metadata["context"].as_object().unwrap();
        assert!(ctx.contains_key("name"));
        assert!(!ctx.contains_key("attachments"));
        assert!(!ctx.contains_key("channel_attachments"));
    }
}
