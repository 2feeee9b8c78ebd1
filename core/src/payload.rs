/// Dynamic payload trees shared across the delivery pipeline.
/// A payload is a string-keyed JSON tree; every hand-off across a
/// boundary (link builder, activity sink, adapter metadata) works on a
/// deep clone so one delivery can never mutate a sibling's state.
use serde_json::{Map, Value};

/// String-keyed heterogeneous tree used for event context, delivery
/// payloads, and metadata maps.
pub type Payload = Map<String, Value>;

/// Well-known payload keys recognized by the pipeline.
pub mod keys {
    pub const RECIPIENT: &str = "recipient";
    pub const CHANNEL: &str = "channel";
    pub const PROVIDER: &str = "provider";
    pub const DEFINITION: &str = "definition";
    pub const ATTACHMENTS: &str = "attachments";
    pub const CHANNEL_ATTACHMENTS: &str = "channel_attachments";
    pub const CHANNEL_OVERRIDES: &str = "channel_overrides";
    pub const LOCALE: &str = "locale";
    pub const SUBSCRIPTIONS: &str = "subscriptions";

    pub const URL: &str = "url";
    pub const ACTION_URL: &str = "action_url";
    pub const MANIFEST_URL: &str = "manifest_url";

    pub const SUBJECT: &str = "subject";
    pub const BODY: &str = "body";
    pub const HTML_BODY: &str = "html_body";
    pub const TEXT_BODY: &str = "text_body";
    pub const CTA_LABEL: &str = "cta_label";
    pub const ICON: &str = "icon";
    pub const BADGE: &str = "badge";

    /// Override fields copied from `channel_overrides.<channel>` onto a
    /// delivery payload before rendering.
    pub const PAYLOAD_OVERRIDE_FIELDS: &[&str] =
        &[CTA_LABEL, ICON, BADGE, URL, ACTION_URL, MANIFEST_URL];

    /// Override fields applied to the persisted message after rendering.
    pub const MESSAGE_OVERRIDE_FIELDS: &[&str] =
        &[SUBJECT, BODY, HTML_BODY, TEXT_BODY, ICON, BADGE, CTA_LABEL];

    /// The three URL keys, in link-merge precedence order.
    pub const URL_KEYS: &[&str] = &[ACTION_URL, MANIFEST_URL, URL];
}

/// Look up a dotted path through nested maps. Returns `None` when any
/// segment is missing or a non-terminal segment is not an object.
pub fn get_path<'a>(payload: &'a Payload, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = payload.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// True when `path` resolves through the tree to a non-null value.
/// This is the lookup schema validation runs for required placeholders.
pub fn has_field(payload: &Payload, path: &str) -> bool {
    matches!(get_path(payload, path), Some(value) if !value.is_null())
}

/// Fetch a non-empty string at `key`, trimming surrounding whitespace.
pub fn get_string(payload: &Payload, key: &str) -> Option<String> {
    match payload.get(key) {
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        _ => None,
    }
}

/// Set a string value, overwriting whatever was there.
pub fn set_string(payload: &mut Payload, key: &str, value: impl Into<String>) {
    payload.insert(key.to_string(), Value::String(value.into()));
}

/// The nested override map for one channel, if present:
/// `payload["channel_overrides"][channel]` as an object.
pub fn channel_overrides<'a>(payload: &'a Payload, channel: &str) -> Option<&'a Payload> {
    payload
        .get(keys::CHANNEL_OVERRIDES)?
        .as_object()?
        .get(channel)?
        .as_object()
}

/// Copy recognized override string fields for `channel` onto the payload.
pub fn apply_channel_overrides(payload: &mut Payload, channel: &str) {
    let overrides: Vec<(String, Value)> = match channel_overrides(payload, channel) {
        Some(map) => keys::PAYLOAD_OVERRIDE_FIELDS
            .iter()
            .filter_map(|field| {
                map.get(*field)
                    .filter(|v| v.as_str().is_some_and(|s| !s.trim().is_empty()))
                    .map(|v| (field.to_string(), v.clone()))
            })
            .collect(),
        None => return,
    };
    for (key, value) in overrides {
        payload.insert(key, value);
    }
}

/// Strip keys that must never leave the pipeline through activity
/// emission: raw attachments and per-channel attachment maps.
pub fn sanitize_context(context: &Payload) -> Payload {
    let mut cleaned = context.clone();
    cleaned.remove(keys::ATTACHMENTS);
    cleaned.remove(keys::CHANNEL_ATTACHMENTS);
    cleaned
}

/// Extract the attachments list for a delivery: the top-level
/// `attachments` value, overridden by `channel_attachments.<channel>`
/// when present. Values are kept opaque (strings or objects) for the
/// attachment resolver to interpret.
pub fn extract_attachments(payload: &Payload, channel_type: &str) -> Vec<Value> {
    let mut attachments: Vec<Value> = match payload.get(keys::ATTACHMENTS) {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    };
    if let Some(per_channel) = payload
        .get(keys::CHANNEL_ATTACHMENTS)
        .and_then(Value::as_object)
    {
        if let Some(Value::Array(items)) = per_channel.get(channel_type) {
            attachments = items.clone();
        }
    }
    attachments
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().expect("object literal").clone()
    }

    #[test]
    fn dotted_path_lookup() {
        let p = payload(json!({
            "user": { "name": "Rosa", "address": { "city": "Lisbon" } },
            "amount": 10,
            "missing_value": null,
        }));

        assert!(has_field(&p, "user.name"));
        assert!(has_field(&p, "user.address.city"));
        assert!(has_field(&p, "amount"));
        assert!(!has_field(&p, "user.email"));
        assert!(!has_field(&p, "missing_value"));
        assert!(!has_field(&p, "amount.cents"));
    }

    #[test]
    fn string_accessors_trim_and_reject_empty() {
        let p = payload(json!({ "locale": "  pt-BR  ", "empty": "   ", "num": 3 }));
        assert_eq!(get_string(&p, "locale").as_deref(), Some("pt-BR"));
        assert_eq!(get_string(&p, "empty"), None);
        assert_eq!(get_string(&p, "num"), None);
    }

    #[test]
    fn channel_override_application() {
        let mut p = payload(json!({
            "cta_label": "base",
            "channel_overrides": {
                "email": {
                    "cta_label": "Open email",
                    "icon": "bell",
                    "badge": "",
                    "subject": "rendered separately"
                }
            }
        }));
        apply_channel_overrides(&mut p, "email");
        assert_eq!(get_string(&p, "cta_label").as_deref(), Some("Open email"));
        assert_eq!(get_string(&p, "icon").as_deref(), Some("bell"));
        // Empty override values never clobber the payload.
        assert!(!p.contains_key("badge"));
        // Subject/body overrides land on the message, not the payload.
        assert!(!p.contains_key("subject"));
    }

    #[test]
    fn sanitize_removes_attachment_keys() {
        let p = payload(json!({
            "name": "Rosa",
            "attachments": ["a.pdf"],
            "channel_attachments": { "email": ["b.pdf"] }
        }));
        let cleaned = sanitize_context(&p);
        assert!(cleaned.contains_key("name"));
        assert!(!cleaned.contains_key("attachments"));
        assert!(!cleaned.contains_key("channel_attachments"));
    }

    #[test]
    fn attachment_extraction_prefers_channel_specific() {
        let p = payload(json!({
            "attachments": ["base.pdf"],
            "channel_attachments": { "email": ["email.pdf"] }
        }));
        assert_eq!(extract_attachments(&p, "email"), vec![json!("email.pdf")]);
        assert_eq!(extract_attachments(&p, "sms"), vec![json!("base.pdf")]);
    }
}
