/// Event intake: validates and persists the event record, hands it to
/// the dispatcher, and reconciles the event status afterwards.
use crate::activity::{verbs, ActivityEvent, ActivitySink};
use crate::dispatcher::{DispatchOptions, Dispatcher};
use crate::errors::{DispatchError, DispatchResult};
use crate::model::{EventStatus, NotificationEvent};
use crate::payload::{self, Payload};
use crate::repository::EventRepository;
use crate::traits::Queue;
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The intake manager.
pub struct EventManager {
    events: Arc<dyn EventRepository>,
    dispatcher: Dispatcher,
    activity: Option<Arc<dyn ActivitySink>>,
    queue: Option<Arc<dyn Queue>>,
    dispatch_enabled: bool,
}

impl EventManager {
    pub fn new(events: Arc<dyn EventRepository>, dispatcher: Dispatcher) -> Self {
        Self {
            events,
            dispatcher,
            activity: None,
            queue: None,
            dispatch_enabled: true,
        }
    }

    pub fn with_activity_sink(mut self, sink: Arc<dyn ActivitySink>) -> Self {
        self.activity = Some(sink);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn dispatch_enabled(mut self, enabled: bool) -> Self {
        self.dispatch_enabled = enabled;
        self
    }

    /// Accept an event: persist it in `pending`, emit the created
    /// activity, and dispatch. A future `scheduled_at` hands the event
    /// to the queue instead of dispatching inline.
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        mut event: NotificationEvent,
        opts: &DispatchOptions,
    ) -> DispatchResult<()> {
        if event.definition_code.trim().is_empty() {
            return Err(DispatchError::InvalidInput(
                "event definition_code must be non-empty".to_string(),
            ));
        }
        if event.recipients.is_empty() {
            return Err(DispatchError::InvalidInput(
                "event needs at least one recipient".to_string(),
            ));
        }

        let now = Utc::now();
        if event.scheduled_at.is_none() {
            event.scheduled_at = Some(now);
        }
        event.status = EventStatus::Pending;

        self.events.create(event.clone()).await?;
        self.emit(event_activity(&event, verbs::NOTIFICATION_CREATED, None))
            .await;

        if let (Some(queue), Some(scheduled_at)) = (&self.queue, event.scheduled_at) {
            if scheduled_at > now {
                queue.enqueue(queue_payload(&event, "scheduled")?).await?;
                debug!(event_id = %event.id, scheduled_at = %scheduled_at, "event enqueued for later delivery");
                return Ok(());
            }
        }

        if !self.dispatch_enabled {
            debug!(event_id = %event.id, "dispatching disabled; event left pending");
            return Ok(());
        }

        match self.dispatcher.dispatch(cancel, &event, opts).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // The dispatcher may not share our event repository;
                // make the failed status stick regardless.
                if let Err(update_err) = self
                    .events
                    .update_status(&event.id, EventStatus::Failed)
                    .await
                {
                    warn!(event_id = %event.id, error = %update_err, "event status update failed");
                }
                self.emit(event_activity(
                    &event,
                    verbs::NOTIFICATION_FAILED,
                    Some(&e.to_string()),
                ))
                .await;
                Err(e)
            }
        }
    }

    /// Queue the event for digest aggregation downstream. Aggregation
    /// itself lives past the queue boundary.
    pub async fn enqueue_digest(&self, event: &NotificationEvent) -> DispatchResult<()> {
        let queue = self.queue.as_ref().ok_or_else(|| {
            DispatchError::InvalidInput("no queue configured for digest hand-off".to_string())
        })?;
        queue.enqueue(queue_payload(event, "digest")?).await
    }

    async fn emit(&self, activity: ActivityEvent) {
        if let Some(sink) = &self.activity {
            if let Err(e) = sink.emit(activity).await {
                debug!(error = %e, "activity emission failed");
            }
        }
    }
}

fn event_activity(event: &NotificationEvent, verb: &str, error: Option<&str>) -> ActivityEvent {
    let mut activity = ActivityEvent::new(verb, "notification_event", event.id);
    activity.actor_id = event.actor_id.clone();
    activity.tenant_id = event.tenant_id.clone();
    activity.definition_code = event.definition_code.clone();
    activity.recipients = event.recipients.clone();
    let mut activity = activity.with_context(&event.context);
    if let Some(error) = error {
        activity = activity.with_meta("error", error);
    }
    activity
}

fn queue_payload(event: &NotificationEvent, kind: &str) -> DispatchResult<Payload> {
    let mut body = Payload::new();
    payload::set_string(&mut body, "kind", kind);
    payload::set_string(&mut body, "event_id", event.id.to_string());
    body.insert("event".to_string(), serde_json::to_value(event)?);
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NotificationEvent;
    use serde_json::{json, Value};

    #[test]
    fn queue_payload_carries_event_snapshot() {
        let mut event = NotificationEvent::new("welcome", vec!["user@example.com".into()]);
        event.context = json!({ "name": "Rosa" }).as_object().unwrap().clone();
        let body = queue_payload(&event, "digest").unwrap();
        assert_eq!(body["kind"], "digest");
        assert_eq!(body["event_id"], Value::String(event.id.to_string()));
        assert_eq!(body["event"]["definition_code"], "welcome");
    }
}
