/// Secure-link resolution: a pluggable builder plus store/observer
/// hooks, each with a strict/lenient failure policy. The resolver
/// always produces a usable set of URLs, starting from whatever the
/// delivery payload already carries.
use crate::errors::{DispatchError, DispatchResult};
use crate::payload::{self, keys, Payload};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

/// Failure handling for one hook: strict propagates, lenient logs and
/// carries on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPolicy {
    Strict,
    Lenient,
}

impl HookPolicy {
    /// Parse a policy string; empty or unrecognized values normalize
    /// to `fallback`.
    pub fn parse(raw: &str, fallback: HookPolicy) -> HookPolicy {
        match raw.trim().to_lowercase().as_str() {
            "strict" => HookPolicy::Strict,
            "lenient" => HookPolicy::Lenient,
            _ => fallback,
        }
    }
}

/// Per-hook policies with the documented defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkPolicies {
    pub builder: HookPolicy,
    pub store: HookPolicy,
    pub observer: HookPolicy,
}

impl Default for LinkPolicies {
    fn default() -> Self {
        Self {
            builder: HookPolicy::Strict,
            store: HookPolicy::Lenient,
            observer: HookPolicy::Lenient,
        }
    }
}

/// One persisted link record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRecord {
    pub url: String,
    pub channel: String,
    pub recipient: String,
    pub message_id: Uuid,
    pub definition: String,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Payload,
}

/// The resolved URL set for one delivery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolvedLinks {
    #[serde(default)]
    pub action_url: String,
    #[serde(default)]
    pub manifest_url: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub metadata: Payload,
    #[serde(default)]
    pub records: Vec<LinkRecord>,
}

impl ResolvedLinks {
    /// `action_url` inherits the generic URL when unset.
    pub fn normalize(&mut self) {
        if self.action_url.trim().is_empty() && !self.url.trim().is_empty() {
            self.action_url = self.url.clone();
        }
    }

    /// Overlay builder output: non-empty fields override, records
    /// replace wholesale when the builder supplied any.
    pub fn merge_from(&mut self, built: ResolvedLinks) {
        if !built.action_url.trim().is_empty() {
            self.action_url = built.action_url;
        }
        if !built.manifest_url.trim().is_empty() {
            self.manifest_url = built.manifest_url;
        }
        if !built.url.trim().is_empty() {
            self.url = built.url;
        }
        for (key, value) in built.metadata {
            self.metadata.insert(key, value);
        }
        if !built.records.is_empty() {
            self.records = built.records;
        }
    }

    pub fn has_any_url(&self) -> bool {
        !self.action_url.trim().is_empty()
            || !self.manifest_url.trim().is_empty()
            || !self.url.trim().is_empty()
    }
}

/// What a builder receives for one delivery. The payload is a deep
/// clone; builders can annotate it freely without touching the
/// delivery's own state.
#[derive(Debug, Clone, Default)]
pub struct LinkRequest {
    pub event_id: Uuid,
    pub definition: String,
    pub recipient: String,
    pub channel: String,
    pub provider: String,
    pub template_code: String,
    pub message_id: Uuid,
    pub locale: String,
    pub payload: Payload,
    /// Baseline URLs extracted from the payload before the builder runs
    pub resolved_urls: ResolvedLinks,
}

/// Observer notification: the request and the final resolved set.
#[derive(Debug, Clone)]
pub struct LinkNotice {
    pub request: LinkRequest,
    pub resolved: ResolvedLinks,
}

/// Builds secure links for one delivery.
#[async_trait]
pub trait LinkBuilder: Send + Sync {
    async fn build(
        &self,
        cancel: &CancellationToken,
        request: &LinkRequest,
    ) -> DispatchResult<ResolvedLinks>;
}

/// Persists resolved link records.
#[async_trait]
pub trait LinkStore: Send + Sync {
    async fn save(&self, cancel: &CancellationToken, records: &[LinkRecord]) -> DispatchResult<()>;
}

/// Notified after every resolution.
#[async_trait]
pub trait LinkObserver: Send + Sync {
    async fn on_links_resolved(
        &self,
        cancel: &CancellationToken,
        notice: &LinkNotice,
    ) -> DispatchResult<()>;
}

/// In-memory link store.
#[derive(Default)]
pub struct MemoryLinkStore {
    records: RwLock<Vec<LinkRecord>>,
}

impl MemoryLinkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LinkRecord> {
        self.records.read().clone()
    }
}

#[async_trait]
impl LinkStore for MemoryLinkStore {
    async fn save(&self, _cancel: &CancellationToken, records: &[LinkRecord]) -> DispatchResult<()> {
        self.records.write().extend_from_slice(records);
        Ok(())
    }
}

/// Outcome of one resolution.
#[derive(Debug, Clone)]
pub struct LinkResolution {
    pub links: ResolvedLinks,
    /// False when no builder ran (absent or leniently failed)
    pub builder_ok: bool,
}

/// The resolution pipeline.
#[derive(Clone, Default)]
pub struct LinkResolver {
    builder: Option<Arc<dyn LinkBuilder>>,
    store: Option<Arc<dyn LinkStore>>,
    observer: Option<Arc<dyn LinkObserver>>,
    policies: LinkPolicies,
}

impl LinkResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builder(mut self, builder: Arc<dyn LinkBuilder>) -> Self {
        self.builder = Some(builder);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn LinkStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn LinkObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_policies(mut self, policies: LinkPolicies) -> Self {
        self.policies = policies;
        self
    }

    /// Extract the baseline URL set from a delivery payload: the
    /// well-known keys, overlaid with `channel_overrides.<channel>`,
    /// then normalized.
    pub fn baseline(payload_map: &Payload, channel: &str) -> ResolvedLinks {
        let mut links = ResolvedLinks {
            action_url: payload::get_string(payload_map, keys::ACTION_URL).unwrap_or_default(),
            manifest_url: payload::get_string(payload_map, keys::MANIFEST_URL).unwrap_or_default(),
            url: payload::get_string(payload_map, keys::URL).unwrap_or_default(),
            ..Default::default()
        };
        if let Some(overrides) = payload::channel_overrides(payload_map, channel) {
            if let Some(v) = payload::get_string(overrides, keys::ACTION_URL) {
                links.action_url = v;
            }
            if let Some(v) = payload::get_string(overrides, keys::MANIFEST_URL) {
                links.manifest_url = v;
            }
            if let Some(v) = payload::get_string(overrides, keys::URL) {
                links.url = v;
            }
        }
        links.normalize();
        links
    }

    /// Run the builder (if any) against the request's baseline and
    /// produce the final URL set. Strict builder failures abort the
    /// delivery; lenient ones fall back to the baseline.
    pub async fn resolve(
        &self,
        cancel: &CancellationToken,
        request: &LinkRequest,
    ) -> DispatchResult<LinkResolution> {
        let mut links = request.resolved_urls.clone();
        let mut builder_ok = false;

        if let Some(builder) = &self.builder {
            match builder.build(cancel, request).await {
                Ok(built) => {
                    links.merge_from(built);
                    builder_ok = true;
                }
                Err(e) => match self.policies.builder {
                    HookPolicy::Strict => {
                        return Err(match e {
                            DispatchError::BuilderError(_) => e,
                            other => DispatchError::BuilderError(other.to_string()),
                        });
                    }
                    HookPolicy::Lenient => {
                        warn!(
                            definition = %request.definition,
                            recipient = %request.recipient,
                            error = %e,
                            "link builder failed; continuing with baseline links"
                        );
                    }
                },
            }
        }

        links.normalize();
        if links.records.is_empty() {
            links.records = Self::synthesize_records(&links, request);
        }

        Ok(LinkResolution { links, builder_ok })
    }

    /// One record per distinct non-empty URL, tagged with which key it
    /// came from.
    fn synthesize_records(links: &ResolvedLinks, request: &LinkRequest) -> Vec<LinkRecord> {
        let candidates = [
            ("action", links.action_url.as_str()),
            ("manifest", links.manifest_url.as_str()),
            ("url", links.url.as_str()),
        ];
        let mut seen = std::collections::HashSet::new();
        let mut records = Vec::new();
        for (link_key, url) in candidates {
            let url = url.trim();
            if url.is_empty() || !seen.insert(url.to_string()) {
                continue;
            }
            let mut metadata = Payload::new();
            metadata.insert("link_key".to_string(), Value::String(link_key.to_string()));
            records.push(LinkRecord {
                url: url.to_string(),
                channel: request.channel.clone(),
                recipient: request.recipient.clone(),
                message_id: request.message_id,
                definition: request.definition.clone(),
                expires_at: None,
                metadata,
            });
        }
        records
    }

    /// Run the store and observer hooks for a finished resolution.
    pub async fn apply_hooks(
        &self,
        cancel: &CancellationToken,
        request: &LinkRequest,
        resolved: &ResolvedLinks,
    ) -> DispatchResult<()> {
        if let Some(store) = &self.store {
            if !resolved.records.is_empty() {
                if let Err(e) = store.save(cancel, &resolved.records).await {
                    match self.policies.store {
                        HookPolicy::Strict => return Err(e),
                        HookPolicy::Lenient => {
                            warn!(error = %e, "link store failed; records not persisted");
                        }
                    }
                }
            }
        }

        if let Some(observer) = &self.observer {
            let notice = LinkNotice {
                request: request.clone(),
                resolved: resolved.clone(),
            };
            if let Err(e) = observer.on_links_resolved(cancel, &notice).await {
                match self.policies.observer {
                    HookPolicy::Strict => return Err(e),
                    HookPolicy::Lenient => {
                        warn!(error = %e, "link observer failed");
                    }
                }
            }
        }

        Ok(())
    }

    /// Write resolved URLs back into the delivery payload so rendering
    /// and adapter metadata see them.
    pub fn apply_to_payload(payload_map: &mut Payload, resolved: &ResolvedLinks) {
        if !resolved.action_url.trim().is_empty() {
            payload::set_string(payload_map, keys::ACTION_URL, resolved.action_url.clone());
        }
        if !resolved.manifest_url.trim().is_empty() {
            payload::set_string(
                payload_map,
                keys::MANIFEST_URL,
                resolved.manifest_url.clone(),
            );
        }
        if !resolved.url.trim().is_empty() {
            payload::set_string(payload_map, keys::URL, resolved.url.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request_with_baseline(baseline: ResolvedLinks) -> LinkRequest {
        LinkRequest {
            event_id: Uuid::new_v4(),
            definition: "welcome".into(),
            recipient: "user@example.com".into(),
            channel: "email".into(),
            message_id: Uuid::new_v4(),
            resolved_urls: baseline,
            ..Default::default()
        }
    }

    struct FixedBuilder {
        links: ResolvedLinks,
    }

    #[async_trait]
    impl LinkBuilder for FixedBuilder {
        async fn build(
            &self,
            _cancel: &CancellationToken,
            _request: &LinkRequest,
        ) -> DispatchResult<ResolvedLinks> {
            Ok(self.links.clone())
        }
    }

    struct FailingBuilder;

    #[async_trait]
    impl LinkBuilder for FailingBuilder {
        async fn build(
            &self,
            _cancel: &CancellationToken,
            _request: &LinkRequest,
        ) -> DispatchResult<ResolvedLinks> {
            Err(DispatchError::StorageError("signing service down".into()))
        }
    }

    struct FailingStore;

    #[async_trait]
    impl LinkStore for FailingStore {
        async fn save(
            &self,
            _cancel: &CancellationToken,
            _records: &[LinkRecord],
        ) -> DispatchResult<()> {
            Err(DispatchError::StorageError("disk full".into()))
        }
    }

    #[test]
    fn baseline_reads_keys_and_channel_overrides() {
        let map = json!({
            "url": "https://g.example",
            "manifest_url": "https://m.example",
            "channel_overrides": {
                "email": { "url": "https://email.example" }
            }
        })
        .as_object()
        .unwrap()
        .clone();

        let links = LinkResolver::baseline(&map, "email");
        assert_eq!(links.url, "https://email.example");
        assert_eq!(links.manifest_url, "https://m.example");
        // Normalization copies the generic URL into the action slot.
        assert_eq!(links.action_url, "https://email.example");

        let other = LinkResolver::baseline(&map, "sms");
        assert_eq!(other.url, "https://g.example");
    }

    #[tokio::test]
    async fn no_builder_uses_baseline_and_synthesizes_records() {
        let resolver = LinkResolver::new();
        let baseline = ResolvedLinks {
            url: "https://g.example".into(),
            manifest_url: "https://m.example".into(),
            ..Default::default()
        };
        let mut baseline = baseline;
        baseline.normalize();
        let request = request_with_baseline(baseline);

        let resolution = resolver
            .resolve(&CancellationToken::new(), &request)
            .await
            .unwrap();
        assert!(!resolution.builder_ok);
        // action == url after normalization, so two distinct URLs remain.
        assert_eq!(resolution.links.records.len(), 2);
        let keys: Vec<_> = resolution
            .links
            .records
            .iter()
            .map(|r| r.metadata["link_key"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(keys, vec!["action", "manifest"]);
    }

    #[tokio::test]
    async fn builder_fields_override_and_records_replace() {
        let built = ResolvedLinks {
            action_url: "https://signed.example/a".into(),
            records: vec![LinkRecord {
                url: "https://signed.example/a".into(),
                channel: "email".into(),
                recipient: "user@example.com".into(),
                message_id: Uuid::new_v4(),
                definition: "welcome".into(),
                expires_at: None,
                metadata: Payload::new(),
            }],
            ..Default::default()
        };
        let resolver = LinkResolver::new().with_builder(Arc::new(FixedBuilder { links: built }));

        let request = request_with_baseline(ResolvedLinks {
            action_url: "https://base.example/a".into(),
            manifest_url: "https://base.example/m".into(),
            ..Default::default()
        });

        let resolution = resolver
            .resolve(&CancellationToken::new(), &request)
            .await
            .unwrap();
        assert!(resolution.builder_ok);
        assert_eq!(resolution.links.action_url, "https://signed.example/a");
        // Baseline field survives where the builder stayed silent.
        assert_eq!(resolution.links.manifest_url, "https://base.example/m");
        assert_eq!(resolution.links.records.len(), 1);
    }

    #[tokio::test]
    async fn strict_builder_failure_aborts() {
        let resolver = LinkResolver::new().with_builder(Arc::new(FailingBuilder));
        let request = request_with_baseline(ResolvedLinks::default());

        let err = resolver
            .resolve(&CancellationToken::new(), &request)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::BuilderError(_)));
    }

    #[tokio::test]
    async fn lenient_builder_failure_keeps_baseline() {
        let resolver = LinkResolver::new()
            .with_builder(Arc::new(FailingBuilder))
            .with_policies(LinkPolicies {
                builder: HookPolicy::Lenient,
                ..Default::default()
            });
        let mut baseline = ResolvedLinks {
            url: "https://base.example".into(),
            ..Default::default()
        };
        baseline.normalize();
        let request = request_with_baseline(baseline);

        let resolution = resolver
            .resolve(&CancellationToken::new(), &request)
            .await
            .unwrap();
        assert!(!resolution.builder_ok);
        assert_eq!(resolution.links.action_url, "https://base.example");
    }

    #[tokio::test]
    async fn store_hook_persists_records_and_lenient_failures_are_swallowed() {
        let store = Arc::new(MemoryLinkStore::new());
        let resolver = LinkResolver::new().with_store(store.clone());
        let request = request_with_baseline(ResolvedLinks::default());
        let resolved = ResolvedLinks {
            action_url: "https://a.example".into(),
            records: LinkResolver::synthesize_records(
                &ResolvedLinks {
                    action_url: "https://a.example".into(),
                    ..Default::default()
                },
                &request,
            ),
            ..Default::default()
        };

        resolver
            .apply_hooks(&CancellationToken::new(), &request, &resolved)
            .await
            .unwrap();
        assert_eq!(store.records().len(), 1);

        // Lenient store failure does not abort.
        let failing = LinkResolver::new().with_store(Arc::new(FailingStore));
        failing
            .apply_hooks(&CancellationToken::new(), &request, &resolved)
            .await
            .unwrap();

        // Strict store failure does.
        let strict = LinkResolver::new()
            .with_store(Arc::new(FailingStore))
            .with_policies(LinkPolicies {
                store: HookPolicy::Strict,
                ..Default::default()
            });
        assert!(strict
            .apply_hooks(&CancellationToken::new(), &request, &resolved)
            .await
            .is_err());
    }

    #[test]
    fn resolved_urls_are_written_back_to_the_payload() {
        let mut map = Payload::new();
        LinkResolver::apply_to_payload(
            &mut map,
            &ResolvedLinks {
                action_url: "https://a.example".into(),
                url: "https://g.example".into(),
                ..Default::default()
            },
        );
        assert_eq!(map["action_url"], "https://a.example");
        assert_eq!(map["url"], "https://g.example");
        assert!(!map.contains_key("manifest_url"));
    }
}
