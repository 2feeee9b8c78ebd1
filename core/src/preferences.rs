/// Recipient preference records and the scope-ordered evaluator that
/// turns them into an allow/deny decision for one delivery.
use crate::errors::DispatchResult;
use crate::model::{normalize_key, ChannelSpec};
use crate::payload;
use crate::repository::PreferenceRepository;
use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Who a preference record belongs to, ordered by descending priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
    User,
    Tenant,
    System,
}

impl SubjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectType::User => "user",
            SubjectType::Tenant => "tenant",
            SubjectType::System => "system",
        }
    }
}

/// A do-not-disturb window in subject-local minutes of day. The window
/// may wrap midnight (`start > end`). The locale tag is retained for
/// UI display; evaluation uses the stored UTC offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuietHours {
    /// Window start, minutes from local midnight (0..1440)
    pub start_minute: u32,
    /// Window end, exclusive, minutes from local midnight (0..1440)
    pub end_minute: u32,
    /// Subject timezone as a UTC offset in minutes
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default)]
    pub locale: Option<String>,
}

impl QuietHours {
    /// True when `timestamp` falls inside the window.
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        let local = timestamp + Duration::minutes(self.utc_offset_minutes as i64);
        let minute = local.hour() * 60 + local.minute();
        if self.start_minute <= self.end_minute {
            minute >= self.start_minute && minute < self.end_minute
        } else {
            // Wraps midnight: 22:00-06:00 covers late evening and early morning.
            minute >= self.start_minute || minute < self.end_minute
        }
    }
}

/// One stored preference record. Empty `definition_code` or `channel`
/// act as wildcards; at most one record exists per
/// `(subject_type, subject_id, definition_code, channel)` tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPreference {
    pub subject_type: SubjectType,
    pub subject_id: String,
    #[serde(default)]
    pub definition_code: String,
    #[serde(default)]
    pub channel: String,
    pub enabled: Option<bool>,
    pub provider: Option<String>,
    pub quiet_hours: Option<QuietHours>,
    pub subscription_filter: Option<Vec<String>>,
}

impl NotificationPreference {
    pub fn new(subject_type: SubjectType, subject_id: impl Into<String>) -> Self {
        Self {
            subject_type,
            subject_id: subject_id.into(),
            definition_code: String::new(),
            channel: String::new(),
            enabled: None,
            provider: None,
            quiet_hours: None,
            subscription_filter: None,
        }
    }

    pub fn for_definition(mut self, definition_code: impl Into<String>) -> Self {
        self.definition_code = definition_code.into();
        self
    }

    pub fn for_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn provider_override(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Does this record apply to `(definition_code, channel_type)`?
    /// Empty stored fields match anything.
    fn matches(&self, definition_code: &str, channel_type: &str) -> bool {
        let def_ok = self.definition_code.is_empty()
            || normalize_key(&self.definition_code) == normalize_key(definition_code);
        let chan_ok = self.channel.is_empty()
            || ChannelSpec::parse(&self.channel).channel_type == channel_type;
        def_ok && chan_ok
    }

    /// Merge precedence within one scope: definition match outranks
    /// channel match, both outrank wildcards.
    fn specificity(&self) -> u8 {
        (u8::from(!self.definition_code.is_empty()) << 1) | u8::from(!self.channel.is_empty())
    }
}

/// One scope to consult, in the order the caller wants them applied.
/// The dispatcher builds `[user?, tenant?, system]`.
#[derive(Debug, Clone)]
pub struct ScopeSelector {
    pub kind: SubjectType,
    pub subject_id: String,
}

/// Input to one evaluation.
#[derive(Debug, Clone, Default)]
pub struct EvaluationRequest {
    pub definition_code: String,
    /// `channel` or `channel:provider`
    pub channel: String,
    /// Priority order: highest first
    pub scopes: Vec<ScopeSelector>,
    /// Topics the event belongs to, matched against subscription filters
    pub subscriptions: Vec<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    OptOut,
    SubscriptionFilter,
    QuietHours,
    ChannelOverride,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::OptOut => "opt_out",
            DecisionReason::SubscriptionFilter => "subscription_filter",
            DecisionReason::QuietHours => "quiet_hours",
            DecisionReason::ChannelOverride => "channel_override",
        }
    }
}

/// The merged record after scope overlay, exposed to UI tooling as a
/// path-addressable capability rather than a lifetime-bound handle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreferenceResolver {
    merged: Value,
}

impl PreferenceResolver {
    fn from_merged(merged: &MergedPreference) -> Self {
        Self {
            merged: serde_json::to_value(merged).unwrap_or(Value::Null),
        }
    }

    /// Dotted-path lookup over the merged record
    /// (`resolve("quiet_hours.start_minute")`).
    pub fn resolve(&self, path: &str) -> Option<Value> {
        let map = self.merged.as_object()?;
        payload::get_path(map, path).cloned()
    }

    /// JSON-schema shaped description of the merged record for UI
    /// tooling.
    pub fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "enabled": { "type": "boolean" },
                "provider": { "type": "string" },
                "quiet_hours": {
                    "type": "object",
                    "properties": {
                        "start_minute": { "type": "integer", "minimum": 0, "maximum": 1439 },
                        "end_minute": { "type": "integer", "minimum": 0, "maximum": 1439 },
                        "utc_offset_minutes": { "type": "integer" },
                        "locale": { "type": "string" }
                    }
                },
                "subscription_filter": {
                    "type": "array",
                    "items": { "type": "string" }
                }
            }
        })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
struct MergedPreference {
    enabled: Option<bool>,
    provider: Option<String>,
    quiet_hours: Option<QuietHours>,
    subscription_filter: Option<Vec<String>>,
}

impl MergedPreference {
    fn overlay(&mut self, record: &NotificationPreference) {
        if record.enabled.is_some() {
            self.enabled = record.enabled;
        }
        if record.provider.is_some() {
            self.provider = record.provider.clone();
        }
        if record.quiet_hours.is_some() {
            self.quiet_hours = record.quiet_hours.clone();
        }
        if record.subscription_filter.is_some() {
            self.subscription_filter = record.subscription_filter.clone();
        }
    }
}

/// The evaluation outcome handed back to the dispatcher.
#[derive(Debug, Clone)]
pub struct PreferenceDecision {
    pub allowed: bool,
    pub reason: Option<DecisionReason>,
    /// Provider override when the merged record redirects the channel
    pub provider: Option<String>,
    pub resolver: PreferenceResolver,
    /// Human-readable merge steps, for diagnostics
    pub trace: Vec<String>,
}

impl PreferenceDecision {
    pub fn reason_str(&self) -> &'static str {
        self.reason.map(|r| r.as_str()).unwrap_or("")
    }
}

/// Merges scoped preference records (user over tenant over system) and
/// applies the decision rules.
pub struct PreferenceEvaluator {
    repository: Arc<dyn PreferenceRepository>,
}

impl PreferenceEvaluator {
    pub fn new(repository: Arc<dyn PreferenceRepository>) -> Self {
        Self { repository }
    }

    pub async fn evaluate(&self, request: &EvaluationRequest) -> DispatchResult<PreferenceDecision> {
        let spec = ChannelSpec::parse(&request.channel);
        let mut merged = MergedPreference::default();
        let mut trace = Vec::new();

        // scopes[] arrives highest-priority first; overlay lowest first
        // so later (higher) writes win.
        for scope in request.scopes.iter().rev() {
            let mut records = self
                .repository
                .find(scope.kind, &scope.subject_id)
                .await?
                .into_iter()
                .filter(|r| r.matches(&request.definition_code, &spec.channel_type))
                .collect::<Vec<_>>();
            records.sort_by_key(NotificationPreference::specificity);
            for record in &records {
                trace.push(format!(
                    "{}/{}: def={} channel={} enabled={:?} provider={:?}",
                    scope.kind.as_str(),
                    scope.subject_id,
                    if record.definition_code.is_empty() {
                        "*"
                    } else {
                        &record.definition_code
                    },
                    if record.channel.is_empty() {
                        "*"
                    } else {
                        &record.channel
                    },
                    record.enabled,
                    record.provider,
                ));
                merged.overlay(record);
            }
        }

        let resolver = PreferenceResolver::from_merged(&merged);

        if merged.enabled == Some(false) {
            return Ok(PreferenceDecision {
                allowed: false,
                reason: Some(DecisionReason::OptOut),
                provider: None,
                resolver,
                trace,
            });
        }

        if let Some(filter) = &merged.subscription_filter {
            let disjoint = !filter.iter().any(|topic| {
                request
                    .subscriptions
                    .iter()
                    .any(|s| normalize_key(s) == normalize_key(topic))
            });
            if disjoint {
                return Ok(PreferenceDecision {
                    allowed: false,
                    reason: Some(DecisionReason::SubscriptionFilter),
                    provider: None,
                    resolver,
                    trace,
                });
            }
        }

        if let (Some(quiet), Some(timestamp)) = (&merged.quiet_hours, request.timestamp) {
            if quiet.contains(timestamp) {
                return Ok(PreferenceDecision {
                    allowed: false,
                    reason: Some(DecisionReason::QuietHours),
                    provider: None,
                    resolver,
                    trace,
                });
            }
        }

        if let Some(provider) = merged
            .provider
            .as_deref()
            .map(normalize_key)
            .filter(|p| !p.is_empty())
        {
            if spec.provider.as_deref() != Some(provider.as_str()) {
                return Ok(PreferenceDecision {
                    allowed: true,
                    reason: Some(DecisionReason::ChannelOverride),
                    provider: Some(provider),
                    resolver,
                    trace,
                });
            }
        }

        Ok(PreferenceDecision {
            allowed: true,
            reason: None,
            provider: None,
            resolver,
            trace,
        })
    }
}
