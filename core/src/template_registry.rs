/// In-memory template variant registry. Many readers resolve
/// concurrently; writers serialize on upsert, and upserts are
/// revision-guarded so a stale write never clobbers a newer variant.
use crate::errors::{DispatchError, DispatchResult};
use crate::model::{normalize_key, NotificationTemplate};
use crate::repository::{ListOptions, Page, TemplateRepository};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Variant identity: the normalized `(code, channel, locale)` tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariantKey {
    pub code: String,
    pub channel: String,
    pub locale: String,
}

impl VariantKey {
    pub fn new(code: &str, channel: &str, locale: &str) -> Self {
        Self {
            code: normalize_key(code),
            channel: normalize_key(channel),
            locale: normalize_key(locale),
        }
    }

    pub fn of(variant: &NotificationTemplate) -> Self {
        Self::new(&variant.code, &variant.channel, &variant.locale)
    }
}

impl std::fmt::Display for VariantKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.code, self.channel, self.locale)
    }
}

/// The registry proper.
#[derive(Default)]
pub struct TemplateRegistry {
    variants: RwLock<HashMap<VariantKey, NotificationTemplate>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a variant. Returns false (and leaves the
    /// stored variant untouched) when the incoming revision is
    /// strictly lower than the stored one.
    pub fn upsert(&self, mut variant: NotificationTemplate) -> bool {
        variant.normalize();
        let key = VariantKey::of(&variant);
        let mut variants = self.variants.write();
        if let Some(existing) = variants.get(&key) {
            if variant.revision < existing.revision {
                return false;
            }
        }
        variants.insert(key, variant);
        true
    }

    pub fn get(&self, code: &str, channel: &str, locale: &str) -> Option<NotificationTemplate> {
        self.variants
            .read()
            .get(&VariantKey::new(code, channel, locale))
            .cloned()
    }

    pub fn remove(&self, code: &str, channel: &str, locale: &str) -> Option<NotificationTemplate> {
        self.variants
            .write()
            .remove(&VariantKey::new(code, channel, locale))
    }

    /// All variants for one code, ordered by `(channel, locale)`.
    pub fn list_by_code(&self, code: &str) -> Vec<NotificationTemplate> {
        let code = normalize_key(code);
        let variants = self.variants.read();
        let mut items: Vec<_> = variants
            .values()
            .filter(|v| v.code == code)
            .cloned()
            .collect();
        items.sort_by(|a, b| (a.channel.as_str(), a.locale.as_str())
            .cmp(&(b.channel.as_str(), b.locale.as_str())));
        items
    }

    pub fn len(&self) -> usize {
        self.variants.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.read().is_empty()
    }
}

#[async_trait]
impl TemplateRepository for TemplateRegistry {
    async fn save(&self, variant: NotificationTemplate) -> DispatchResult<()> {
        // Stale revisions are silently dropped per the upsert contract.
        self.upsert(variant);
        Ok(())
    }

    async fn get(
        &self,
        code: &str,
        channel: &str,
        locale: &str,
    ) -> DispatchResult<NotificationTemplate> {
        TemplateRegistry::get(self, code, channel, locale).ok_or_else(|| {
            DispatchError::not_found(format!(
                "template {}",
                VariantKey::new(code, channel, locale)
            ))
        })
    }

    async fn list_by_code(
        &self,
        code: &str,
        opts: ListOptions,
    ) -> DispatchResult<Page<NotificationTemplate>> {
        let items = TemplateRegistry::list_by_code(self, code);
        let total = items.len();
        let start = opts.offset.min(total);
        let end = if opts.limit == 0 {
            total
        } else {
            (start + opts.limit).min(total)
        };
        Ok(Page {
            items: items[start..end].to_vec(),
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(code: &str, channel: &str, locale: &str, revision: u64) -> NotificationTemplate {
        NotificationTemplate {
            code: code.into(),
            channel: channel.into(),
            locale: locale.into(),
            subject: format!("subject r{}", revision),
            body: "body".into(),
            revision,
            ..Default::default()
        }
    }

    #[test]
    fn identity_is_normalized() {
        let registry = TemplateRegistry::new();
        assert!(registry.upsert(variant(" Welcome ", "Email", "EN", 1)));
        assert!(registry.get("welcome", "email", "en").is_some());
        assert!(registry.get("WELCOME", " email", "En").is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stale_revisions_are_dropped() {
        let registry = TemplateRegistry::new();
        assert!(registry.upsert(variant("welcome", "email", "en", 3)));
        assert!(!registry.upsert(variant("welcome", "email", "en", 2)));
        assert_eq!(
            registry.get("welcome", "email", "en").unwrap().revision,
            3
        );

        // Equal revision replaces in place.
        assert!(registry.upsert(variant("welcome", "email", "en", 3)));
        // Higher revision advances.
        assert!(registry.upsert(variant("welcome", "email", "en", 4)));
        assert_eq!(
            registry.get("welcome", "email", "en").unwrap().revision,
            4
        );
    }

    #[test]
    fn list_by_code_orders_variants() {
        let registry = TemplateRegistry::new();
        registry.upsert(variant("welcome", "sms", "en", 1));
        registry.upsert(variant("welcome", "email", "pt", 1));
        registry.upsert(variant("welcome", "email", "en", 1));
        registry.upsert(variant("other", "email", "en", 1));

        let listed = registry.list_by_code("welcome");
        let keys: Vec<_> = listed
            .iter()
            .map(|v| format!("{}:{}", v.channel, v.locale))
            .collect();
        assert_eq!(keys, vec!["email:en", "email:pt", "sms:en"]);
    }

    #[tokio::test]
    async fn repository_contract_reports_not_found() {
        let registry = TemplateRegistry::new();
        let err = TemplateRepository::get(&registry, "missing", "email", "en")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
