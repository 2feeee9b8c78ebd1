/// The template service: repository + cache + renderer behind one
/// facade, owning normalization, revision bookkeeping, the locale
/// fallback chain, and schema validation.
use crate::errors::{DispatchError, DispatchResult};
use crate::model::{normalize_key, NotificationTemplate, TemplateSchema, TemplateSource};
use crate::payload::{self, Payload};
use crate::repository::{ListOptions, Page, TemplateRepository};
use crate::template_renderer::TemplateRenderer;
use handlebars::HelperDef;
use moka::future::Cache;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Maps a locale to the locales to try after it (`es-MX -> [es, en]`).
pub trait LocaleFallbackResolver: Send + Sync {
    fn fallbacks(&self, locale: &str) -> Vec<String>;
}

/// Table-driven fallback resolver.
#[derive(Default)]
pub struct StaticLocaleFallbacks {
    table: std::collections::HashMap<String, Vec<String>>,
}

impl StaticLocaleFallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chain(mut self, locale: &str, chain: &[&str]) -> Self {
        self.table.insert(
            normalize_key(locale),
            chain.iter().map(|l| l.to_string()).collect(),
        );
        self
    }
}

impl LocaleFallbackResolver for StaticLocaleFallbacks {
    fn fallbacks(&self, locale: &str) -> Vec<String> {
        self.table
            .get(&normalize_key(locale))
            .cloned()
            .unwrap_or_default()
    }
}

/// Input for `create` and `update`.
#[derive(Debug, Clone, Default)]
pub struct TemplateInput {
    pub code: String,
    pub channel: String,
    pub locale: String,
    pub subject: String,
    pub body: String,
    pub format: String,
    pub schema: TemplateSchema,
    pub source: TemplateSource,
    pub metadata: Payload,
}

/// Input for `render`.
#[derive(Debug, Clone, Default)]
pub struct RenderRequest {
    pub code: String,
    pub channel: String,
    /// Requested locale; empty lets the chain decide
    pub locale: String,
    pub data: Payload,
}

/// Output of `render`.
#[derive(Debug, Clone)]
pub struct RenderedTemplate {
    pub subject: String,
    pub body: String,
    /// The locale of the variant that actually rendered
    pub locale: String,
    pub revision: u64,
    pub metadata: Payload,
    pub source: TemplateSource,
    /// True iff the resolved locale differs from the requested one
    pub used_fallback: bool,
}

/// Builder for [`TemplateService`].
pub struct TemplateServiceBuilder {
    repository: Arc<dyn TemplateRepository>,
    default_locale: String,
    cache_ttl: Duration,
    locale_key: String,
    fallback_resolver: Option<Arc<dyn LocaleFallbackResolver>>,
}

impl TemplateServiceBuilder {
    pub fn default_locale(mut self, locale: &str) -> Self {
        self.default_locale = locale.to_string();
        self
    }

    /// TTL for the variant cache; zero disables caching entirely.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Key under which the effective locale is injected into render data.
    pub fn locale_key(mut self, key: &str) -> Self {
        self.locale_key = key.to_string();
        self
    }

    pub fn fallback_resolver(mut self, resolver: Arc<dyn LocaleFallbackResolver>) -> Self {
        self.fallback_resolver = Some(resolver);
        self
    }

    pub fn build(self) -> TemplateService {
        let cache = if self.cache_ttl.is_zero() {
            None
        } else {
            Some(
                Cache::builder()
                    .time_to_live(self.cache_ttl)
                    .max_capacity(10_000)
                    .build(),
            )
        };
        TemplateService {
            repository: self.repository,
            renderer: TemplateRenderer::new(),
            cache,
            default_locale: normalize_key(&self.default_locale),
            locale_key: self.locale_key,
            fallback_resolver: self.fallback_resolver,
        }
    }
}

/// The service proper.
pub struct TemplateService {
    repository: Arc<dyn TemplateRepository>,
    renderer: TemplateRenderer,
    cache: Option<Cache<String, Arc<NotificationTemplate>>>,
    default_locale: String,
    locale_key: String,
    fallback_resolver: Option<Arc<dyn LocaleFallbackResolver>>,
}

impl TemplateService {
    pub fn builder(repository: Arc<dyn TemplateRepository>) -> TemplateServiceBuilder {
        TemplateServiceBuilder {
            repository,
            default_locale: "en".to_string(),
            cache_ttl: Duration::from_secs(60),
            locale_key: payload::keys::LOCALE.to_string(),
            fallback_resolver: None,
        }
    }

    fn validate(input: &TemplateInput) -> DispatchResult<()> {
        if input.code.trim().is_empty()
            || input.channel.trim().is_empty()
            || input.locale.trim().is_empty()
        {
            return Err(DispatchError::InvalidInput(
                "template code, channel, and locale must be non-empty".to_string(),
            ));
        }
        let has_inline = !input.subject.trim().is_empty() && !input.body.trim().is_empty();
        let has_source = !input.source.kind().trim().is_empty();
        if !has_inline && !has_source {
            return Err(DispatchError::InvalidInput(
                "template needs subject and body, or a foreign source".to_string(),
            ));
        }
        Ok(())
    }

    fn variant_from(input: TemplateInput, revision: u64) -> NotificationTemplate {
        let mut variant = NotificationTemplate {
            code: input.code,
            channel: input.channel,
            locale: input.locale,
            subject: input.subject,
            body: input.body,
            format: input.format,
            revision,
            schema: input.schema.sanitized(),
            source: input.source,
            metadata: input.metadata,
        };
        variant.normalize();
        variant
    }

    fn cache_key(code: &str, channel: &str, locale: &str) -> String {
        format!(
            "templates:{}:{}:{}",
            normalize_key(code),
            normalize_key(channel),
            normalize_key(locale)
        )
    }

    /// Create a new variant at revision 1.
    pub async fn create(&self, input: TemplateInput) -> DispatchResult<NotificationTemplate> {
        Self::validate(&input)?;
        let variant = Self::variant_from(input, 1);
        self.repository.save(variant.clone()).await?;
        self.cache_put(&variant).await;
        Ok(variant)
    }

    /// Update an existing variant, bumping its revision. Fails with
    /// `not_found` when no current variant exists for the tuple.
    pub async fn update(&self, input: TemplateInput) -> DispatchResult<NotificationTemplate> {
        Self::validate(&input)?;
        let current = self
            .repository
            .get(&input.code, &input.channel, &input.locale)
            .await?;
        let variant = Self::variant_from(input, current.revision + 1);
        self.repository.save(variant.clone()).await?;
        self.cache_put(&variant).await;
        Ok(variant)
    }

    async fn cache_put(&self, variant: &NotificationTemplate) {
        if let Some(cache) = &self.cache {
            let key = Self::cache_key(&variant.code, &variant.channel, &variant.locale);
            cache.insert(key, Arc::new(variant.clone())).await;
        }
    }

    /// Single-tuple fetch through the cache. A repository miss returns
    /// `None`; any other repository failure propagates.
    async fn fetch(
        &self,
        code: &str,
        channel: &str,
        locale: &str,
    ) -> DispatchResult<Option<Arc<NotificationTemplate>>> {
        let key = Self::cache_key(code, channel, locale);
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(&key).await {
                return Ok(Some(hit));
            }
        }
        match self.repository.get(code, channel, locale).await {
            Ok(variant) => {
                let variant = Arc::new(variant);
                if let Some(cache) = &self.cache {
                    cache.insert(key, variant.clone()).await;
                }
                Ok(Some(variant))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The ordered locale chain for a request: requested locale,
    /// resolver fallbacks, service default, then `en`; each appended
    /// only when not already present.
    fn locale_chain(&self, requested: &str) -> Vec<String> {
        let mut chain: Vec<String> = Vec::new();
        let mut push = |locale: String| {
            if !locale.is_empty() && !chain.contains(&locale) {
                chain.push(locale);
            }
        };
        let requested = normalize_key(requested);
        push(requested.clone());
        if let Some(resolver) = &self.fallback_resolver {
            if !requested.is_empty() {
                for fallback in resolver.fallbacks(&requested) {
                    push(normalize_key(&fallback));
                }
            }
        }
        push(self.default_locale.clone());
        push("en".to_string());
        chain
    }

    /// Walk the chain; the first locale with a variant wins.
    async fn lookup(
        &self,
        code: &str,
        channel: &str,
        locale: &str,
    ) -> DispatchResult<Arc<NotificationTemplate>> {
        for candidate in self.locale_chain(locale) {
            if let Some(variant) = self.fetch(code, channel, &candidate).await? {
                return Ok(variant);
            }
        }
        Err(DispatchError::TemplateNotFound {
            code: normalize_key(code),
            channel: normalize_key(channel),
            locale: normalize_key(locale),
        })
    }

    /// Fetch a variant, applying the locale fallback chain.
    pub async fn get(
        &self,
        code: &str,
        channel: &str,
        locale: &str,
    ) -> DispatchResult<NotificationTemplate> {
        Ok((*self.lookup(code, channel, locale).await?).clone())
    }

    pub async fn list_by_code(
        &self,
        code: &str,
        opts: ListOptions,
    ) -> DispatchResult<Page<NotificationTemplate>> {
        self.repository.list_by_code(code, opts).await
    }

    /// Register helpers visible to subsequent renders.
    pub fn register_helpers(&self, helpers: Vec<(String, Box<dyn HelperDef + Send + Sync>)>) {
        for (name, helper) in helpers {
            self.renderer.register_helper(&name, helper);
        }
    }

    /// Resolve, schema-validate, and render one variant.
    pub async fn render(&self, request: RenderRequest) -> DispatchResult<RenderedTemplate> {
        let variant = self
            .lookup(&request.code, &request.channel, &request.locale)
            .await?;

        let missing: Vec<String> = variant
            .schema
            .required
            .iter()
            .filter(|path| !payload::has_field(&request.data, path))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(DispatchError::SchemaError { missing });
        }

        // Templates can reach the effective locale through the data map.
        let mut data = request.data.clone();
        data.insert(
            self.locale_key.clone(),
            Value::String(variant.locale.clone()),
        );

        let (subject, body) =
            self.renderer
                .render_pair(&variant.subject, &variant.body, &Value::Object(data))?;

        let requested = normalize_key(&request.locale);
        let used_fallback = requested != variant.locale;
        if used_fallback {
            debug!(
                code = %variant.code,
                channel = %variant.channel,
                requested = %requested,
                resolved = %variant.locale,
                "template locale fell back"
            );
        }

        Ok(RenderedTemplate {
            subject,
            body,
            locale: variant.locale.clone(),
            revision: variant.revision,
            metadata: variant.metadata.clone(),
            source: variant.source.clone(),
            used_fallback,
        })
    }
}
