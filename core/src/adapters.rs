/// Messenger adapters: the contract a channel implementation provides,
/// and the registry the dispatcher selects candidates from.
use crate::errors::DispatchResult;
use crate::model::ChannelSpec;
use crate::payload::Payload;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What an adapter advertises it can handle.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Capabilities {
    /// Channel types the adapter serves (e.g. `["email"]`)
    pub channels: Vec<String>,
    /// Formats the adapter accepts (e.g. `["text/plain", "text/html"]`)
    pub formats: Vec<String>,
}

/// The message handed to an adapter for one delivery attempt.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub id: Uuid,
    pub channel: String,
    pub provider: String,
    pub subject: String,
    pub body: String,
    pub to: String,
    pub attachments: Vec<String>,
    /// Carries `event_id`, `definition_code`, and the persisted
    /// message metadata (existing keys win)
    pub metadata: Payload,
    pub locale: String,
    /// Resolved credentials keyed by secret key, or `None` when the
    /// adapter is expected to use ambient credentials
    pub credentials: Option<HashMap<String, Vec<u8>>>,
}

/// A channel adapter. Returning an error triggers the dispatcher's
/// retry/fallback handling.
#[async_trait]
pub trait Messenger: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    async fn send(&self, cancel: &CancellationToken, message: &OutboundMessage)
        -> DispatchResult<()>;
}

/// Maps route keys to ordered candidate lists. Keys are either
/// `channel_type` or `channel_type:provider`; lookups by bare channel
/// type collect every provider for that type in insertion order.
#[derive(Default)]
pub struct AdapterRegistry {
    // Insertion-ordered; a Vec keeps "all providers for a type" stable.
    entries: RwLock<Vec<(String, Vec<Arc<dyn Messenger>>)>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a messenger under a route key. Repeated registration
    /// under one key appends to that key's candidate list.
    pub fn register(&self, key: &str, messenger: Arc<dyn Messenger>) {
        let key = ChannelSpec::parse(key).registry_key();
        let mut entries = self.entries.write();
        if let Some((_, list)) = entries.iter_mut().find(|(k, _)| *k == key) {
            list.push(messenger);
        } else {
            entries.push((key, vec![messenger]));
        }
    }

    /// Exact-key lookup (`channel_type:provider` or bare type).
    pub fn get(&self, key: &str) -> Vec<Arc<dyn Messenger>> {
        let key = ChannelSpec::parse(key).registry_key();
        self.entries
            .read()
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, list)| list.clone())
            .unwrap_or_default()
    }

    /// Every messenger serving a channel type, across providers, in
    /// insertion order.
    pub fn get_by_channel(&self, channel_type: &str) -> Vec<Arc<dyn Messenger>> {
        let channel_type = ChannelSpec::parse(channel_type).channel_type;
        let prefix = format!("{}:", channel_type);
        self.entries
            .read()
            .iter()
            .filter(|(k, _)| *k == channel_type || k.starts_with(&prefix))
            .flat_map(|(_, list)| list.iter().cloned())
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.read().iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeMessenger {
        name: String,
    }

    #[async_trait]
    impl Messenger for FakeMessenger {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                channels: vec!["email".into()],
                formats: vec!["text/plain".into()],
            }
        }

        async fn send(
            &self,
            _cancel: &CancellationToken,
            _message: &OutboundMessage,
        ) -> DispatchResult<()> {
            Ok(())
        }
    }

    fn fake(name: &str) -> Arc<dyn Messenger> {
        Arc::new(FakeMessenger { name: name.into() })
    }

    #[test]
    fn exact_and_channel_lookup() {
        let registry = AdapterRegistry::new();
        registry.register("email:console", fake("console"));
        registry.register("email:smtp", fake("smtp"));
        registry.register("email", fake("default"));
        registry.register("sms:twilio", fake("twilio"));

        let exact = registry.get("email:smtp");
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].name(), "smtp");

        let by_channel: Vec<_> = registry
            .get_by_channel("email")
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        assert_eq!(by_channel, vec!["console", "smtp", "default"]);

        assert!(registry.get("push").is_empty());
        assert!(registry.get_by_channel("push").is_empty());
    }

    #[test]
    fn repeated_registration_appends() {
        let registry = AdapterRegistry::new();
        registry.register("email", fake("first"));
        registry.register("email", fake("second"));
        let list = registry.get("email");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name(), "first");
        assert_eq!(list[1].name(), "second");
    }

    #[test]
    fn keys_are_normalized() {
        let registry = AdapterRegistry::new();
        registry.register("Email:Console", fake("console"));
        assert_eq!(registry.keys(), vec!["email:console"]);
        assert_eq!(registry.get("email:console").len(), 1);
    }
}
