/// Repository contracts for the engine's entities, plus the in-memory
/// implementations used by tests and single-process hosts. Missing
/// records surface as the `not_found` sentinel; stores never invent
/// defaults.
use crate::errors::{DispatchError, DispatchResult};
use crate::model::{
    normalize_key, DeliveryAttempt, EventStatus, MessageStatus, NotificationDefinition,
    NotificationEvent, NotificationMessage,
};
use crate::preferences::{NotificationPreference, SubjectType};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

/// Pagination for list operations. `limit == 0` means no limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    pub offset: usize,
    pub limit: usize,
}

/// One page of results plus the unpaged total.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

fn paginate<T: Clone>(items: &[T], opts: ListOptions) -> Page<T> {
    let total = items.len();
    let start = opts.offset.min(total);
    let end = if opts.limit == 0 {
        total
    } else {
        (start + opts.limit).min(total)
    };
    Page {
        items: items[start..end].to_vec(),
        total,
    }
}

/// Catalog of notification definitions, keyed by code.
#[async_trait]
pub trait DefinitionRepository: Send + Sync {
    async fn create(&self, definition: NotificationDefinition) -> DispatchResult<()>;
    async fn update(&self, definition: NotificationDefinition) -> DispatchResult<()>;
    async fn get(&self, code: &str) -> DispatchResult<NotificationDefinition>;
    async fn list(&self, opts: ListOptions) -> DispatchResult<Page<NotificationDefinition>>;
}

/// Event records and their status transitions.
#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn create(&self, event: NotificationEvent) -> DispatchResult<()>;
    async fn get(&self, id: &Uuid) -> DispatchResult<NotificationEvent>;
    async fn update_status(&self, id: &Uuid, status: EventStatus) -> DispatchResult<()>;
    async fn list(&self, opts: ListOptions) -> DispatchResult<Page<NotificationEvent>>;
}

/// Messages and their append-only delivery attempts.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn create(&self, message: NotificationMessage) -> DispatchResult<()>;
    async fn update_status(&self, id: &Uuid, status: MessageStatus) -> DispatchResult<()>;
    async fn get(&self, id: &Uuid) -> DispatchResult<NotificationMessage>;
    async fn list_by_event(&self, event_id: &Uuid) -> DispatchResult<Vec<NotificationMessage>>;
    async fn record_attempt(&self, attempt: DeliveryAttempt) -> DispatchResult<()>;
    async fn attempts(&self, message_id: &Uuid) -> DispatchResult<Vec<DeliveryAttempt>>;
}

/// Template variant storage keyed by the normalized
/// `(code, channel, locale)` tuple. `save` is a revision-guarded
/// upsert: stale revisions are dropped, not an error.
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn save(&self, variant: crate::model::NotificationTemplate) -> DispatchResult<()>;
    async fn get(
        &self,
        code: &str,
        channel: &str,
        locale: &str,
    ) -> DispatchResult<crate::model::NotificationTemplate>;
    async fn list_by_code(
        &self,
        code: &str,
        opts: ListOptions,
    ) -> DispatchResult<Page<crate::model::NotificationTemplate>>;
}

/// Scoped preference records. `find` returns every record stored for a
/// subject; wildcard matching happens in the evaluator.
#[async_trait]
pub trait PreferenceRepository: Send + Sync {
    async fn upsert(&self, preference: NotificationPreference) -> DispatchResult<()>;
    async fn find(
        &self,
        subject_type: SubjectType,
        subject_id: &str,
    ) -> DispatchResult<Vec<NotificationPreference>>;
}

/// In-memory definition catalog.
#[derive(Default)]
pub struct MemoryDefinitionRepository {
    definitions: RwLock<HashMap<String, NotificationDefinition>>,
}

impl MemoryDefinitionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefinitionRepository for MemoryDefinitionRepository {
    async fn create(&self, definition: NotificationDefinition) -> DispatchResult<()> {
        let code = normalize_key(&definition.code);
        if code.is_empty() {
            return Err(DispatchError::InvalidInput(
                "definition code must be non-empty".to_string(),
            ));
        }
        let mut definitions = self.definitions.write();
        if definitions.contains_key(&code) {
            return Err(DispatchError::InvalidInput(format!(
                "definition already exists: {}",
                code
            )));
        }
        definitions.insert(code, definition);
        Ok(())
    }

    async fn update(&self, definition: NotificationDefinition) -> DispatchResult<()> {
        let code = normalize_key(&definition.code);
        let mut definitions = self.definitions.write();
        if !definitions.contains_key(&code) {
            return Err(DispatchError::not_found(format!("definition {}", code)));
        }
        definitions.insert(code, definition);
        Ok(())
    }

    async fn get(&self, code: &str) -> DispatchResult<NotificationDefinition> {
        self.definitions
            .read()
            .get(&normalize_key(code))
            .cloned()
            .ok_or_else(|| DispatchError::not_found(format!("definition {}", code)))
    }

    async fn list(&self, opts: ListOptions) -> DispatchResult<Page<NotificationDefinition>> {
        let definitions = self.definitions.read();
        let mut items: Vec<_> = definitions.values().cloned().collect();
        items.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(paginate(&items, opts))
    }
}

/// In-memory event store.
#[derive(Default)]
pub struct MemoryEventRepository {
    events: RwLock<Vec<NotificationEvent>>,
}

impl MemoryEventRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventRepository for MemoryEventRepository {
    async fn create(&self, event: NotificationEvent) -> DispatchResult<()> {
        self.events.write().push(event);
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> DispatchResult<NotificationEvent> {
        self.events
            .read()
            .iter()
            .find(|e| e.id == *id)
            .cloned()
            .ok_or_else(|| DispatchError::not_found(format!("event {}", id)))
    }

    async fn update_status(&self, id: &Uuid, status: EventStatus) -> DispatchResult<()> {
        let mut events = self.events.write();
        match events.iter_mut().find(|e| e.id == *id) {
            Some(event) => {
                event.status = status;
                Ok(())
            }
            None => Err(DispatchError::not_found(format!("event {}", id))),
        }
    }

    async fn list(&self, opts: ListOptions) -> DispatchResult<Page<NotificationEvent>> {
        let events = self.events.read();
        Ok(paginate(&events, opts))
    }
}

/// In-memory message store with attempt history.
#[derive(Default)]
pub struct MemoryMessageRepository {
    messages: RwLock<Vec<NotificationMessage>>,
    attempts: RwLock<Vec<DeliveryAttempt>>,
}

impl MemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every attempt recorded so far, in insertion order.
    pub fn all_attempts(&self) -> Vec<DeliveryAttempt> {
        self.attempts.read().clone()
    }
}

#[async_trait]
impl MessageRepository for MemoryMessageRepository {
    async fn create(&self, message: NotificationMessage) -> DispatchResult<()> {
        self.messages.write().push(message);
        Ok(())
    }

    async fn update_status(&self, id: &Uuid, status: MessageStatus) -> DispatchResult<()> {
        let mut messages = self.messages.write();
        match messages.iter_mut().find(|m| m.id == *id) {
            Some(message) => {
                message.status = status;
                Ok(())
            }
            None => Err(DispatchError::not_found(format!("message {}", id))),
        }
    }

    async fn get(&self, id: &Uuid) -> DispatchResult<NotificationMessage> {
        self.messages
            .read()
            .iter()
            .find(|m| m.id == *id)
            .cloned()
            .ok_or_else(|| DispatchError::not_found(format!("message {}", id)))
    }

    async fn list_by_event(&self, event_id: &Uuid) -> DispatchResult<Vec<NotificationMessage>> {
        Ok(self
            .messages
            .read()
            .iter()
            .filter(|m| m.event_id == *event_id)
            .cloned()
            .collect())
    }

    async fn record_attempt(&self, attempt: DeliveryAttempt) -> DispatchResult<()> {
        self.attempts.write().push(attempt);
        Ok(())
    }

    async fn attempts(&self, message_id: &Uuid) -> DispatchResult<Vec<DeliveryAttempt>> {
        Ok(self
            .attempts
            .read()
            .iter()
            .filter(|a| a.message_id == *message_id)
            .cloned()
            .collect())
    }
}

/// In-memory preference store. Upserts replace the record with the
/// same `(subject_type, subject_id, definition_code, channel)` tuple.
#[derive(Default)]
pub struct MemoryPreferenceRepository {
    preferences: RwLock<Vec<NotificationPreference>>,
}

impl MemoryPreferenceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous insert for fixtures.
    pub fn insert(&self, preference: NotificationPreference) {
        let mut preferences = self.preferences.write();
        preferences.retain(|p| {
            !(p.subject_type == preference.subject_type
                && p.subject_id == preference.subject_id
                && normalize_key(&p.definition_code) == normalize_key(&preference.definition_code)
                && normalize_key(&p.channel) == normalize_key(&preference.channel))
        });
        preferences.push(preference);
    }
}

#[async_trait]
impl PreferenceRepository for MemoryPreferenceRepository {
    async fn upsert(&self, preference: NotificationPreference) -> DispatchResult<()> {
        self.insert(preference);
        Ok(())
    }

    async fn find(
        &self,
        subject_type: SubjectType,
        subject_id: &str,
    ) -> DispatchResult<Vec<NotificationPreference>> {
        Ok(self
            .preferences
            .read()
            .iter()
            .filter(|p| p.subject_type == subject_type && p.subject_id == subject_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn definition_create_get_update() {
        let repo = MemoryDefinitionRepository::new();
        let definition = NotificationDefinition {
            code: "Welcome".into(),
            name: "Welcome".into(),
            channels: vec!["email".into()],
            ..Default::default()
        };
        repo.create(definition.clone()).await.unwrap();

        // Lookup is key-normalized.
        let fetched = repo.get(" WELCOME ").await.unwrap();
        assert_eq!(fetched.name, "Welcome");

        assert!(repo.create(definition.clone()).await.is_err());

        let mut updated = definition.clone();
        updated.name = "Welcome v2".into();
        repo.update(updated).await.unwrap();
        assert_eq!(repo.get("welcome").await.unwrap().name, "Welcome v2");

        let missing = repo.get("absent").await.unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn event_status_transitions() {
        let repo = MemoryEventRepository::new();
        let event = NotificationEvent::new("welcome", vec!["user@example.com".into()]);
        let id = event.id;
        repo.create(event).await.unwrap();

        assert_eq!(repo.get(&id).await.unwrap().status, EventStatus::Pending);
        repo.update_status(&id, EventStatus::Processed).await.unwrap();
        assert_eq!(repo.get(&id).await.unwrap().status, EventStatus::Processed);

        let missing = repo.update_status(&Uuid::new_v4(), EventStatus::Failed).await;
        assert!(missing.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn attempts_are_append_only_and_scoped() {
        let repo = MemoryMessageRepository::new();
        let message_id = Uuid::new_v4();
        for n in 1..=3u32 {
            repo.record_attempt(DeliveryAttempt {
                message_id,
                adapter: "console".into(),
                status: crate::model::AttemptStatus::Failed,
                error: Some(format!("attempt {} refused", n)),
                payload: Default::default(),
            })
            .await
            .unwrap();
        }
        repo.record_attempt(DeliveryAttempt {
            message_id: Uuid::new_v4(),
            adapter: "console".into(),
            status: crate::model::AttemptStatus::Succeeded,
            error: None,
            payload: Default::default(),
        })
        .await
        .unwrap();

        let attempts = repo.attempts(&message_id).await.unwrap();
        assert_eq!(attempts.len(), 3);
        assert!(attempts
            .iter()
            .enumerate()
            .all(|(i, a)| a.error.as_deref() == Some(&*format!("attempt {} refused", i + 1))));
    }

    #[tokio::test]
    async fn preference_upsert_replaces_same_tuple() {
        let repo = MemoryPreferenceRepository::new();
        repo.upsert(
            NotificationPreference::new(SubjectType::User, "user@example.com")
                .for_channel("email")
                .enabled(true),
        )
        .await
        .unwrap();
        repo.upsert(
            NotificationPreference::new(SubjectType::User, "user@example.com")
                .for_channel("email")
                .enabled(false),
        )
        .await
        .unwrap();

        let records = repo.find(SubjectType::User, "user@example.com").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].enabled, Some(false));
    }

    #[test]
    fn pagination_window() {
        let items: Vec<u32> = (0..10).collect();
        let page = paginate(&items, ListOptions { offset: 2, limit: 3 });
        assert_eq!(page.items, vec![2, 3, 4]);
        assert_eq!(page.total, 10);

        let unlimited = paginate(&items, ListOptions::default());
        assert_eq!(unlimited.items.len(), 10);

        let past_end = paginate(&items, ListOptions { offset: 20, limit: 5 });
        assert!(past_end.items.is_empty());
        assert_eq!(past_end.total, 10);
    }
}
