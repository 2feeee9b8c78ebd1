/// Boundary traits consumed by the engine. Each is a small capability
/// abstraction; concrete transports and stores live outside this crate.
use crate::errors::DispatchResult;
use crate::model::NotificationMessage;
use crate::payload::Payload;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Opaque job queue for scheduled and digest payloads. Everything past
/// `enqueue` is outside this engine's semantics.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn enqueue(&self, payload: Payload) -> DispatchResult<()>;
}

/// Realtime broadcast for inbox deliveries.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(
        &self,
        cancel: &CancellationToken,
        topic: &str,
        payload: Payload,
    ) -> DispatchResult<()>;
}

/// Stores inbox messages for in-application consumption. Inbox routes
/// short-circuit the messenger loop and land here instead.
#[async_trait]
pub trait InboxDeliverer: Send + Sync {
    async fn deliver(
        &self,
        cancel: &CancellationToken,
        message: &NotificationMessage,
    ) -> DispatchResult<()>;
}

/// Turns raw attachment values from the payload into whatever handles
/// the adapters expect (paths, signed URLs, upload ids).
#[async_trait]
pub trait AttachmentResolver: Send + Sync {
    async fn resolve(&self, attachments: &[Value]) -> DispatchResult<Vec<String>>;
}

/// In-memory queue; tests assert against its captured payloads.
#[derive(Default)]
pub struct MemoryQueue {
    payloads: Mutex<Vec<Payload>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn payloads(&self) -> Vec<Payload> {
        self.payloads.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.payloads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.lock().is_empty()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(&self, payload: Payload) -> DispatchResult<()> {
        self.payloads.lock().push(payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_queue_captures_payloads() {
        let queue = MemoryQueue::new();
        assert!(queue.is_empty());

        let payload = json!({ "kind": "digest", "event_id": "abc" })
            .as_object()
            .unwrap()
            .clone();
        queue.enqueue(payload).await.unwrap();

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.payloads()[0]["kind"], "digest");
    }
}
