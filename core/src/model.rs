/// Domain entities for the Herald notification engine.
use crate::payload::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lower-case and trim an identifier before it is used as a lookup key.
pub fn normalize_key(value: &str) -> String {
    value.trim().to_lowercase()
}

/// A channel route, parsed from `channel` or `channel:provider`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Delivery medium, normalized (e.g. `email`, `sms`, `inbox`)
    pub channel_type: String,
    /// Optional provider qualifier (e.g. `twilio` in `sms:twilio`)
    pub provider: Option<String>,
}

impl ChannelSpec {
    /// Parse a channel string. The channel type is normalized; inbox
    /// spellings (`in-app`, `inapp`, `in_app`) collapse to `inbox` so
    /// nothing downstream has to recognize variants.
    pub fn parse(raw: &str) -> Self {
        let (channel_type, provider) = match raw.split_once(':') {
            Some((channel, provider)) => (channel, Some(provider)),
            None => (raw, None),
        };
        let channel_type = match normalize_key(channel_type).as_str() {
            "in-app" | "inapp" | "in_app" => "inbox".to_string(),
            other => other.to_string(),
        };
        let provider = provider
            .map(normalize_key)
            .filter(|p| !p.is_empty());
        Self {
            channel_type,
            provider,
        }
    }

    /// True when this route targets the in-application inbox.
    pub fn is_inbox(&self) -> bool {
        self.channel_type == "inbox"
    }

    /// Registry key: `channel_type:provider` when a provider is set,
    /// bare `channel_type` otherwise.
    pub fn registry_key(&self) -> String {
        match &self.provider {
            Some(provider) => format!("{}:{}", self.channel_type, provider),
            None => self.channel_type.clone(),
        }
    }
}

impl std::fmt::Display for ChannelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.registry_key())
    }
}

/// A named notification type: default channels, template bindings,
/// and free-form metadata/policy maps.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationDefinition {
    /// Stable identifier, unique across the catalog
    pub code: String,
    /// Human-readable name
    pub name: String,
    /// Ordered channel routes (`channel` or `channel:provider`)
    pub channels: Vec<String>,
    /// Ordered `channel:template_code` bindings
    pub template_keys: Vec<String>,
    /// Free-form metadata merged into delivery payloads
    #[serde(default)]
    pub metadata: Payload,
    /// Free-form policy map
    #[serde(default)]
    pub policy: Payload,
}

impl NotificationDefinition {
    /// Resolve the template code for one channel type: walk the
    /// `channel:code` bindings matching on channel type alone
    /// (provider qualifiers on the binding are ignored); fall back to
    /// the first binding's code, then to the definition code.
    pub fn template_code_for(&self, channel_type: &str) -> String {
        let wanted = normalize_key(channel_type);
        for entry in &self.template_keys {
            if let Some((channel, code)) = entry.split_once(':') {
                let channel = ChannelSpec::parse(channel).channel_type;
                if channel == wanted && !code.trim().is_empty() {
                    return code.trim().to_string();
                }
            }
        }
        if let Some(first) = self.template_keys.first() {
            if let Some((_, code)) = first.split_once(':') {
                if !code.trim().is_empty() {
                    return code.trim().to_string();
                }
            }
        }
        self.code.clone()
    }
}

/// Placeholder schema attached to a template variant: required names
/// must resolve through the render data; optional names are advisory.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TemplateSchema {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
}

impl TemplateSchema {
    /// De-duplicate both lists case-insensitively, preserving the
    /// first spelling seen.
    pub fn sanitized(&self) -> Self {
        fn dedup(names: &[String]) -> Vec<String> {
            let mut seen = std::collections::HashSet::new();
            let mut out = Vec::new();
            for name in names {
                let trimmed = name.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if seen.insert(trimmed.to_lowercase()) {
                    out.push(trimmed.to_string());
                }
            }
            out
        }
        Self {
            required: dedup(&self.required),
            optional: dedup(&self.optional),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty() && self.optional.is_empty()
    }
}

/// Where a template variant's content comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TemplateSource {
    /// Subject and body live inline on the variant.
    Inline,
    /// Snapshot of a foreign template system; `kind` names it and the
    /// payload carries whatever that system needs to re-render.
    Foreign {
        kind: String,
        #[serde(default)]
        payload: Payload,
    },
}

impl Default for TemplateSource {
    fn default() -> Self {
        TemplateSource::Inline
    }
}

impl TemplateSource {
    /// Non-empty foreign kind, or empty string for inline variants.
    pub fn kind(&self) -> &str {
        match self {
            TemplateSource::Inline => "",
            TemplateSource::Foreign { kind, .. } => kind,
        }
    }
}

/// One template variant: the `(code, channel, locale)` tuple plus its
/// renderable content and revision counter.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationTemplate {
    pub code: String,
    pub channel: String,
    pub locale: String,
    pub subject: String,
    pub body: String,
    /// MIME-like format hint (`text/plain`, `text/html`, ...)
    pub format: String,
    /// Monotonic, starts at 1 on create
    pub revision: u64,
    #[serde(default)]
    pub schema: TemplateSchema,
    #[serde(default)]
    pub source: TemplateSource,
    #[serde(default)]
    pub metadata: Payload,
}

impl NotificationTemplate {
    /// Normalize the identity tuple in place.
    pub fn normalize(&mut self) {
        self.code = normalize_key(&self.code);
        self.channel = normalize_key(&self.channel);
        self.locale = normalize_key(&self.locale);
    }

    /// A variant is renderable when it carries inline content or names
    /// a foreign source.
    pub fn has_content(&self) -> bool {
        (!self.subject.trim().is_empty() && !self.body.trim().is_empty())
            || !self.source.kind().trim().is_empty()
    }
}

/// Lifecycle states for a notification event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A business-level notification event: who gets told what, with what
/// context. Created in `pending`; only the dispatcher moves it on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: Uuid,
    pub definition_code: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub actor_id: String,
    /// Opaque recipient addresses, ordered
    pub recipients: Vec<String>,
    #[serde(default)]
    pub context: Payload,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub status: EventStatus,
}

impl NotificationEvent {
    pub fn new(definition_code: impl Into<String>, recipients: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            definition_code: definition_code.into(),
            tenant_id: String::new(),
            actor_id: String::new(),
            recipients,
            context: Payload::new(),
            scheduled_at: None,
            status: EventStatus::Pending,
        }
    }
}

/// Delivery states for a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Delivered,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One rendered message for one `(event, channel, recipient)` tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub id: Uuid,
    pub event_id: Uuid,
    pub channel: String,
    pub locale: String,
    pub subject: String,
    pub body: String,
    pub receiver: String,
    pub status: MessageStatus,
    #[serde(default)]
    pub metadata: Payload,
    #[serde(default)]
    pub action_url: String,
    #[serde(default)]
    pub manifest_url: String,
    #[serde(default)]
    pub url: String,
}

/// Outcome of one adapter attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Succeeded,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::Failed => "failed",
        }
    }
}

/// Append-only record of one delivery attempt against one adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub message_id: Uuid,
    /// Provider/adapter name that handled the attempt
    pub adapter: String,
    pub status: AttemptStatus,
    pub error: Option<String>,
    /// Includes the 1-based attempt index under `attempt`
    #[serde(default)]
    pub payload: Payload,
}
