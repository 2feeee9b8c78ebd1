// Herald: notification dispatch engine
// Core library providing the delivery pipeline and its supporting
// subsystems: templates, preferences, links, secrets, and adapters.

pub mod activity;
pub mod adapters;
pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod event_manager;
pub mod links;
pub mod model;
pub mod payload;
pub mod preferences;
pub mod repository;
pub mod secrets;
pub mod template_registry;
pub mod template_renderer;
pub mod template_service;
pub mod traits;

// Re-export commonly used types
pub use errors::{DispatchError, DispatchResult};

pub use model::{
    AttemptStatus, ChannelSpec, DeliveryAttempt, EventStatus, MessageStatus,
    NotificationDefinition, NotificationEvent, NotificationMessage, NotificationTemplate,
    TemplateSchema, TemplateSource,
};

pub use payload::{keys, Payload};

pub use config::{
    DispatcherConfig, EngineConfig, InboxConfig, LocalizationConfig, RealtimeConfig,
    TemplatesConfig,
};

pub use adapters::{AdapterRegistry, Capabilities, Messenger, OutboundMessage};

pub use dispatcher::{DispatchOptions, Dispatcher, DispatcherBuilder};

pub use event_manager::EventManager;

pub use template_registry::{TemplateRegistry, VariantKey};

pub use template_renderer::TemplateRenderer;

pub use template_service::{
    LocaleFallbackResolver, RenderRequest, RenderedTemplate, StaticLocaleFallbacks,
    TemplateInput, TemplateService, TemplateServiceBuilder,
};

pub use preferences::{
    DecisionReason, EvaluationRequest, NotificationPreference, PreferenceDecision,
    PreferenceEvaluator, PreferenceResolver, QuietHours, ScopeSelector, SubjectType,
};

pub use links::{
    HookPolicy, LinkBuilder, LinkNotice, LinkObserver, LinkPolicies, LinkRecord, LinkRequest,
    LinkResolution, LinkResolver, LinkStore, MemoryLinkStore, ResolvedLinks,
};

pub use secrets::{
    MemorySecretsResolver, SecretEntry, SecretReference, SecretScope, SecretsResolver,
};

pub use activity::{
    verbs, ActivityEvent, ActivitySink, LogActivitySink, MemoryActivitySink,
};

pub use backoff::{Backoff, ExponentialBackoff, NoBackoff};

pub use traits::{AttachmentResolver, Broadcaster, InboxDeliverer, MemoryQueue, Queue};

pub use repository::{
    DefinitionRepository, EventRepository, ListOptions, MemoryDefinitionRepository,
    MemoryEventRepository, MemoryMessageRepository, MemoryPreferenceRepository,
    MessageRepository, Page, PreferenceRepository, TemplateRepository,
};
