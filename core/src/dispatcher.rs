/// The dispatcher: fans one event out into per-channel, per-recipient
/// delivery jobs, gates each on recipient preferences, resolves links,
/// renders templates, and drives the adapter loop with bounded
/// retries. Jobs run on a fixed worker set pulling from a bounded
/// queue; per-job failures are collected and surfaced as one
/// aggregate error, never cancelling sibling deliveries.
use crate::activity::{verbs, ActivityEvent, ActivitySink};
use crate::adapters::{AdapterRegistry, Messenger, OutboundMessage};
use crate::backoff::{Backoff, ExponentialBackoff};
use crate::errors::{DispatchError, DispatchResult};
use crate::links::{LinkRequest, LinkResolver};
use crate::model::{
    AttemptStatus, ChannelSpec, DeliveryAttempt, EventStatus, MessageStatus,
    NotificationDefinition, NotificationEvent, NotificationMessage,
};
use crate::payload::{self, keys, Payload};
use crate::preferences::{EvaluationRequest, PreferenceEvaluator, ScopeSelector, SubjectType};
use crate::repository::{DefinitionRepository, EventRepository, MessageRepository};
use crate::secrets::{SecretReference, SecretScope, SecretsResolver};
use crate::template_service::{RenderRequest, TemplateService};
use crate::traits::{AttachmentResolver, Broadcaster, InboxDeliverer};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Channel routes to use instead of the definition's defaults
    pub channels: Vec<String>,
    /// Locale override for rendering
    pub locale: Option<String>,
}

/// One unit of fan-out: a `(channel, recipient)` pair plus the
/// template code and render locale resolved for it.
#[derive(Debug, Clone)]
struct DeliveryJob {
    channel: String,
    recipient: String,
    template_code: String,
    locale: String,
}

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    dispatcher: Dispatcher,
}

impl DispatcherBuilder {
    pub fn max_workers(mut self, workers: usize) -> Self {
        self.dispatcher.max_workers = workers.max(1);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.dispatcher.max_retries = retries;
        self
    }

    pub fn env_fallback_allowlist(mut self, allowlist: Vec<String>) -> Self {
        self.dispatcher.env_fallback_allowlist = allowlist;
        self
    }

    pub fn realtime_enabled(mut self, enabled: bool) -> Self {
        self.dispatcher.realtime_enabled = enabled;
        self
    }

    pub fn message_repository(mut self, repo: Arc<dyn MessageRepository>) -> Self {
        self.dispatcher.messages = Some(repo);
        self
    }

    pub fn event_repository(mut self, repo: Arc<dyn EventRepository>) -> Self {
        self.dispatcher.events = Some(repo);
        self
    }

    pub fn preference_evaluator(mut self, evaluator: Arc<PreferenceEvaluator>) -> Self {
        self.dispatcher.preferences = Some(evaluator);
        self
    }

    pub fn link_resolver(mut self, resolver: LinkResolver) -> Self {
        self.dispatcher.links = Arc::new(resolver);
        self
    }

    pub fn secrets_resolver(mut self, resolver: Arc<dyn SecretsResolver>) -> Self {
        self.dispatcher.secrets = Some(resolver);
        self
    }

    pub fn attachment_resolver(mut self, resolver: Arc<dyn AttachmentResolver>) -> Self {
        self.dispatcher.attachments = Some(resolver);
        self
    }

    pub fn inbox_deliverer(mut self, inbox: Arc<dyn InboxDeliverer>) -> Self {
        self.dispatcher.inbox = Some(inbox);
        self
    }

    pub fn broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.dispatcher.broadcaster = Some(broadcaster);
        self
    }

    pub fn activity_sink(mut self, sink: Arc<dyn ActivitySink>) -> Self {
        self.dispatcher.activity = Some(sink);
        self
    }

    pub fn backoff(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.dispatcher.backoff = backoff;
        self
    }

    /// Apply the dispatcher-relevant settings from an engine config.
    pub fn with_config(self, config: &crate::config::EngineConfig) -> Self {
        self.max_workers(config.dispatcher.max_workers)
            .max_retries(config.dispatcher.max_retries)
            .env_fallback_allowlist(config.dispatcher.env_fallback_allowlist.clone())
            .realtime_enabled(config.realtime.enabled)
    }

    pub fn build(self) -> Dispatcher {
        self.dispatcher
    }
}

/// The dispatcher proper. Cheap to clone; every collaborator sits
/// behind an `Arc`.
#[derive(Clone)]
pub struct Dispatcher {
    max_workers: usize,
    max_retries: u32,
    env_fallback_allowlist: Vec<String>,
    realtime_enabled: bool,
    definitions: Arc<dyn DefinitionRepository>,
    templates: Arc<TemplateService>,
    adapters: Arc<AdapterRegistry>,
    messages: Option<Arc<dyn MessageRepository>>,
    events: Option<Arc<dyn EventRepository>>,
    preferences: Option<Arc<PreferenceEvaluator>>,
    links: Arc<LinkResolver>,
    secrets: Option<Arc<dyn SecretsResolver>>,
    attachments: Option<Arc<dyn AttachmentResolver>>,
    inbox: Option<Arc<dyn InboxDeliverer>>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
    activity: Option<Arc<dyn ActivitySink>>,
    backoff: Arc<dyn Backoff>,
}

impl Dispatcher {
    pub fn builder(
        definitions: Arc<dyn DefinitionRepository>,
        templates: Arc<TemplateService>,
        adapters: Arc<AdapterRegistry>,
    ) -> DispatcherBuilder {
        DispatcherBuilder {
            dispatcher: Dispatcher {
                max_workers: 4,
                max_retries: 3,
                env_fallback_allowlist: Vec::new(),
                realtime_enabled: false,
                definitions,
                templates,
                adapters,
                messages: None,
                events: None,
                preferences: None,
                links: Arc::new(LinkResolver::new()),
                secrets: None,
                attachments: None,
                inbox: None,
                broadcaster: None,
                activity: None,
                backoff: Arc::new(ExponentialBackoff::default()),
            },
        }
    }

    /// Fan the event out and wait for every delivery job. Returns an
    /// error iff at least one job failed; the event status is updated
    /// to `processed` or `failed` accordingly.
    pub async fn dispatch(
        &self,
        cancel: &CancellationToken,
        event: &NotificationEvent,
        opts: &DispatchOptions,
    ) -> DispatchResult<()> {
        let definition = match self.definitions.get(&event.definition_code).await {
            Ok(d) => d,
            Err(e) if e.is_not_found() => {
                return Err(DispatchError::DefinitionNotFound(
                    event.definition_code.clone(),
                ))
            }
            Err(e) => return Err(e),
        };

        let channels = if opts.channels.is_empty() {
            definition.channels.clone()
        } else {
            opts.channels.clone()
        };
        if channels.is_empty() {
            return Err(DispatchError::InvalidInput(
                "no channels to deliver on".to_string(),
            ));
        }
        if event.recipients.is_empty() {
            return Err(DispatchError::InvalidInput(
                "event has no recipients".to_string(),
            ));
        }

        // Render locale: call option, else the event context, else
        // empty and the template service's chain decides.
        let locale = opts
            .locale
            .clone()
            .filter(|l| !l.trim().is_empty())
            .or_else(|| payload::get_string(&event.context, keys::LOCALE))
            .unwrap_or_default();

        let jobs: Vec<DeliveryJob> = channels
            .iter()
            .flat_map(|channel| {
                let template_code = definition
                    .template_code_for(&ChannelSpec::parse(channel).channel_type);
                event.recipients.iter().map({
                    let channel = channel.clone();
                    let locale = locale.clone();
                    move |recipient| DeliveryJob {
                        channel: channel.clone(),
                        recipient: recipient.clone(),
                        template_code: template_code.clone(),
                        locale: locale.clone(),
                    }
                })
            })
            .collect();

        let total = jobs.len();
        let worker_count = self.max_workers.min(total).max(1);
        debug!(
            event_id = %event.id,
            jobs = total,
            workers = worker_count,
            "dispatching notification event"
        );

        let (job_tx, job_rx) = mpsc::channel::<DeliveryJob>(total);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, mut result_rx) =
            mpsc::channel::<(DeliveryJob, DispatchResult<()>)>(total);

        let mut handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let this = self.clone();
            let cancel = cancel.clone();
            let event = event.clone();
            let definition = definition.clone();
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let job = { job_rx.lock().await.recv().await };
                    let Some(job) = job else { break };
                    // Cancellation is checked between jobs; an already
                    // cancelled context reports instead of processing.
                    let result = if cancel.is_cancelled() {
                        Err(DispatchError::Cancelled)
                    } else {
                        this.process_delivery(&cancel, &event, &definition, &job).await
                    };
                    if result_tx.send((job, result)).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);

        for job in jobs {
            // Queue capacity equals the job count, so enqueueing never
            // blocks on consumers.
            let _ = job_tx.send(job).await;
        }
        drop(job_tx);

        futures::future::join_all(handles).await;

        let mut errors = Vec::new();
        while let Some((job, result)) = result_rx.recv().await {
            if let Err(e) = result {
                error!(
                    event_id = %event.id,
                    channel = %job.channel,
                    recipient = %job.recipient,
                    error = %e,
                    "delivery job failed"
                );
                errors.push(format!("{} -> {}: {}", job.channel, job.recipient, e));
            }
        }

        let failed = !errors.is_empty();
        if let Some(events) = &self.events {
            let status = if failed {
                EventStatus::Failed
            } else {
                EventStatus::Processed
            };
            if let Err(e) = events.update_status(&event.id, status).await {
                warn!(event_id = %event.id, error = %e, "event status update failed");
            }
        }

        if failed {
            Err(DispatchError::DeliveryAggregate {
                failed: errors.len(),
                total,
                errors,
            })
        } else {
            Ok(())
        }
    }

    /// One delivery job, start to finish.
    async fn process_delivery(
        &self,
        cancel: &CancellationToken,
        event: &NotificationEvent,
        definition: &NotificationDefinition,
        job: &DeliveryJob,
    ) -> DispatchResult<()> {
        let spec = ChannelSpec::parse(&job.channel);

        // Preference gate. A deny is a skipped delivery, not an error.
        let mut preferred_provider: Option<String> = None;
        if let Some(evaluator) = &self.preferences {
            let mut scopes = vec![ScopeSelector {
                kind: SubjectType::User,
                subject_id: job.recipient.clone(),
            }];
            if !event.tenant_id.is_empty() {
                scopes.push(ScopeSelector {
                    kind: SubjectType::Tenant,
                    subject_id: event.tenant_id.clone(),
                });
            }
            scopes.push(ScopeSelector {
                kind: SubjectType::System,
                subject_id: "default".to_string(),
            });

            let decision = evaluator
                .evaluate(&EvaluationRequest {
                    definition_code: definition.code.clone(),
                    channel: job.channel.clone(),
                    scopes,
                    subscriptions: subscriptions_from(&event.context),
                    timestamp: Some(Utc::now()),
                })
                .await?;
            if !decision.allowed {
                info!(
                    event_id = %event.id,
                    channel = %job.channel,
                    recipient = %job.recipient,
                    reason = decision.reason_str(),
                    "delivery skipped by preference"
                );
                self.emit(
                    self.activity_for(event, job, &spec, verbs::NOTIFICATION_SKIPPED, "skipped")
                        .with_meta("reason", decision.reason_str()),
                )
                .await;
                return Ok(());
            }
            preferred_provider = decision.provider;
        }

        let message_id = Uuid::new_v4();
        let effective_provider = preferred_provider
            .clone()
            .or_else(|| spec.provider.clone());

        // Payload assembly. The event context is cloned twice: once as
        // the working payload, once untouched for baseline link
        // extraction and message-level overrides.
        let base_payload = event.context.clone();
        let mut delivery_payload = event.context.clone();
        let raw_attachments = payload::extract_attachments(&delivery_payload, &spec.channel_type);

        payload::set_string(&mut delivery_payload, keys::RECIPIENT, &job.recipient);
        payload::set_string(&mut delivery_payload, keys::CHANNEL, &job.channel);
        payload::set_string(
            &mut delivery_payload,
            keys::PROVIDER,
            effective_provider.clone().unwrap_or_default(),
        );
        payload::set_string(&mut delivery_payload, keys::DEFINITION, &definition.code);
        for (key, value) in &definition.metadata {
            // Event context wins over definition metadata.
            delivery_payload
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        payload::apply_channel_overrides(&mut delivery_payload, &spec.channel_type);

        // Link resolution against the baseline from the untouched context.
        let link_request = LinkRequest {
            event_id: event.id,
            definition: definition.code.clone(),
            recipient: job.recipient.clone(),
            channel: job.channel.clone(),
            provider: effective_provider.clone().unwrap_or_default(),
            template_code: job.template_code.clone(),
            message_id,
            locale: job.locale.clone(),
            payload: delivery_payload.clone(),
            resolved_urls: LinkResolver::baseline(&base_payload, &spec.channel_type),
        };
        let resolution = match self.links.resolve(cancel, &link_request).await {
            Ok(resolution) => resolution,
            Err(e) => {
                self.emit(
                    self.activity_for(event, job, &spec, verbs::NOTIFICATION_FAILED, "failed")
                        .with_meta("error", e.to_string()),
                )
                .await;
                return Err(e);
            }
        };
        LinkResolver::apply_to_payload(&mut delivery_payload, &resolution.links);

        // Render.
        let rendered = match self
            .templates
            .render(RenderRequest {
                code: job.template_code.clone(),
                channel: spec.channel_type.clone(),
                locale: job.locale.clone(),
                data: delivery_payload.clone(),
            })
            .await
        {
            Ok(rendered) => rendered,
            Err(e) => {
                self.emit(
                    self.activity_for(event, job, &spec, verbs::NOTIFICATION_FAILED, "failed")
                        .with_meta("error", e.to_string()),
                )
                .await;
                return Err(e);
            }
        };

        // Build and persist the message record.
        let mut message = NotificationMessage {
            id: message_id,
            event_id: event.id,
            channel: job.channel.clone(),
            locale: rendered.locale.clone(),
            subject: rendered.subject,
            body: rendered.body,
            receiver: job.recipient.clone(),
            status: MessageStatus::Pending,
            metadata: Payload::new(),
            action_url: resolution.links.action_url.clone(),
            manifest_url: resolution.links.manifest_url.clone(),
            url: resolution.links.url.clone(),
        };
        if let Some(overrides) = payload::channel_overrides(&base_payload, &spec.channel_type) {
            if let Some(subject) = payload::get_string(overrides, keys::SUBJECT) {
                message.subject = subject;
            }
            if let Some(body) = payload::get_string(overrides, keys::BODY) {
                message.body = body;
            }
            for field in [
                keys::HTML_BODY,
                keys::TEXT_BODY,
                keys::ICON,
                keys::BADGE,
                keys::CTA_LABEL,
            ] {
                if let Some(value) = payload::get_string(overrides, field) {
                    payload::set_string(&mut message.metadata, field, value);
                }
            }
        }
        if let Some(repo) = &self.messages {
            repo.create(message.clone()).await?;
        }

        // Link hooks run once the message exists.
        self.links
            .apply_hooks(cancel, &link_request, &resolution.links)
            .await?;

        // Inbox routes short-circuit the messenger loop.
        if spec.is_inbox() {
            return self.deliver_inbox(cancel, event, job, &spec, message).await;
        }

        // Messenger selection: one exact route, by preference order.
        let candidates = match (&preferred_provider, &spec.provider) {
            (Some(provider), _) => self
                .adapters
                .get(&format!("{}:{}", spec.channel_type, provider)),
            (None, Some(provider)) => self
                .adapters
                .get(&format!("{}:{}", spec.channel_type, provider)),
            (None, None) => self.adapters.get_by_channel(&spec.channel_type),
        };
        if candidates.is_empty() {
            let route = preferred_provider
                .map(|p| format!("{}:{}", spec.channel_type, p))
                .unwrap_or_else(|| spec.registry_key());
            let err = DispatchError::AdapterNotFound(route);
            self.finish_message(event, job, &spec, message, Err(&err)).await;
            return Err(err);
        }

        // Attachments resolve once per delivery.
        let attachments = match &self.attachments {
            Some(resolver) => resolver.resolve(&raw_attachments).await?,
            None => raw_attachments
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        };

        // Adapter loop: each candidate gets its own retry budget; the
        // first success wins.
        let mut last_error: Option<DispatchError> = None;
        let mut delivered = false;
        for candidate in candidates {
            if cancel.is_cancelled() {
                last_error = Some(DispatchError::Cancelled);
                break;
            }
            let provider_name = effective_provider
                .clone()
                .unwrap_or_else(|| candidate.name().to_string());

            let credentials = match self
                .resolve_secrets(&spec.channel_type, &provider_name, &job.recipient, &event.tenant_id)
                .await
            {
                Ok(credentials) => credentials,
                Err(e) => {
                    warn!(
                        channel = %job.channel,
                        provider = %provider_name,
                        error = %e,
                        "secret resolution failed for candidate"
                    );
                    last_error = Some(e);
                    continue;
                }
            };

            let mut metadata = Payload::new();
            payload::set_string(&mut metadata, "event_id", event.id.to_string());
            payload::set_string(&mut metadata, "definition_code", &definition.code);
            for (key, value) in &message.metadata {
                metadata.entry(key.clone()).or_insert_with(|| value.clone());
            }

            let outbound = OutboundMessage {
                id: message.id,
                channel: spec.channel_type.clone(),
                provider: provider_name.clone(),
                subject: message.subject.clone(),
                body: message.body.clone(),
                to: job.recipient.clone(),
                attachments: attachments.clone(),
                metadata,
                locale: message.locale.clone(),
                credentials,
            };

            match self
                .deliver_with_retries(cancel, candidate.as_ref(), &provider_name, &outbound)
                .await
            {
                Ok(()) => {
                    delivered = true;
                    break;
                }
                Err(e) => {
                    last_error = Some(e);
                }
            }
        }

        if delivered {
            self.finish_message(event, job, &spec, message, Ok(())).await;
            Ok(())
        } else {
            let err = last_error.unwrap_or_else(|| DispatchError::DeliveryFailed {
                adapter: spec.registry_key(),
                reason: "no delivery attempted".to_string(),
            });
            self.finish_message(event, job, &spec, message, Err(&err)).await;
            Err(err)
        }
    }

    /// Deliver through the inbox deliverer and broadcast when realtime
    /// is on.
    async fn deliver_inbox(
        &self,
        cancel: &CancellationToken,
        event: &NotificationEvent,
        job: &DeliveryJob,
        spec: &ChannelSpec,
        message: NotificationMessage,
    ) -> DispatchResult<()> {
        let Some(inbox) = &self.inbox else {
            let err = DispatchError::AdapterNotFound("inbox".to_string());
            self.finish_message(event, job, spec, message, Err(&err)).await;
            return Err(err);
        };

        match inbox.deliver(cancel, &message).await {
            Ok(()) => {
                if self.realtime_enabled {
                    if let Some(broadcaster) = &self.broadcaster {
                        let topic = format!("inbox:{}", message.receiver);
                        let mut body = Payload::new();
                        payload::set_string(&mut body, "message_id", message.id.to_string());
                        payload::set_string(&mut body, keys::SUBJECT, message.subject.clone());
                        payload::set_string(&mut body, keys::CHANNEL, message.channel.clone());
                        if let Err(e) = broadcaster.broadcast(cancel, &topic, body).await {
                            warn!(topic = %topic, error = %e, "inbox broadcast failed");
                        }
                    }
                }
                self.emit(
                    self.activity_for(event, job, spec, verbs::INBOX_DELIVERED, "delivered"),
                )
                .await;
                self.finish_message(event, job, spec, message, Ok(())).await;
                Ok(())
            }
            Err(e) => {
                self.finish_message(event, job, spec, message, Err(&e)).await;
                Err(e)
            }
        }
    }

    /// Retry loop for one candidate adapter. Every attempt is recorded;
    /// the backoff sleep is cancellable against the ambient context.
    async fn deliver_with_retries(
        &self,
        cancel: &CancellationToken,
        adapter: &dyn Messenger,
        provider_name: &str,
        outbound: &OutboundMessage,
    ) -> DispatchResult<()> {
        let mut last_error = String::from("retries disabled");
        for attempt in 1..=self.max_retries {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            // Per-attempt copy: adapters never see a message another
            // attempt could still be holding.
            let message = outbound.clone();
            match adapter.send(cancel, &message).await {
                Ok(()) => {
                    self.record_attempt(outbound.id, provider_name, attempt, None).await;
                    return Ok(());
                }
                Err(e) => {
                    debug!(
                        adapter = adapter.name(),
                        attempt,
                        error = %e,
                        "delivery attempt failed"
                    );
                    last_error = e.to_string();
                    self.record_attempt(outbound.id, provider_name, attempt, Some(&last_error))
                        .await;
                    if attempt < self.max_retries {
                        let delay = self.backoff.next(attempt);
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
        Err(DispatchError::DeliveryFailed {
            adapter: adapter.name().to_string(),
            reason: last_error,
        })
    }

    async fn record_attempt(
        &self,
        message_id: Uuid,
        provider_name: &str,
        attempt: u32,
        error: Option<&str>,
    ) {
        let Some(repo) = &self.messages else { return };
        let mut attempt_payload = Payload::new();
        attempt_payload.insert("attempt".to_string(), Value::from(attempt));
        let record = DeliveryAttempt {
            message_id,
            adapter: provider_name.to_string(),
            status: if error.is_some() {
                AttemptStatus::Failed
            } else {
                AttemptStatus::Succeeded
            },
            error: error.map(str::to_string),
            payload: attempt_payload,
        };
        if let Err(e) = repo.record_attempt(record).await {
            warn!(message_id = %message_id, error = %e, "attempt record failed");
        }
    }

    /// Flip the message to its terminal status and emit the final
    /// activity record.
    async fn finish_message(
        &self,
        event: &NotificationEvent,
        job: &DeliveryJob,
        spec: &ChannelSpec,
        mut message: NotificationMessage,
        outcome: Result<(), &DispatchError>,
    ) {
        let (status, verb, label) = match outcome {
            Ok(()) => (MessageStatus::Delivered, verbs::NOTIFICATION_DELIVERED, "delivered"),
            Err(_) => (MessageStatus::Failed, verbs::NOTIFICATION_FAILED, "failed"),
        };
        message.status = status;
        if let Some(repo) = &self.messages {
            if let Err(e) = repo.update_status(&message.id, status).await {
                warn!(message_id = %message.id, error = %e, "message status update failed");
            }
        }
        let mut activity = self
            .activity_for(event, job, spec, verb, label)
            .with_meta("locale", message.locale.clone());
        if let Err(e) = outcome {
            activity = activity.with_meta("error", e.to_string());
        }
        self.emit(activity).await;
    }

    fn activity_for(
        &self,
        event: &NotificationEvent,
        job: &DeliveryJob,
        spec: &ChannelSpec,
        verb: &str,
        status: &str,
    ) -> ActivityEvent {
        let mut activity = ActivityEvent::new(verb, "notification", event.id);
        activity.actor_id = event.actor_id.clone();
        activity.user_id = job.recipient.clone();
        activity.tenant_id = event.tenant_id.clone();
        activity.channel = spec.registry_key();
        activity.definition_code = event.definition_code.clone();
        activity.recipients = event.recipients.clone();
        activity
            .with_context(&event.context)
            .with_meta("template", job.template_code.clone())
            .with_meta("recipient", job.recipient.clone())
            .with_meta(
                keys::PROVIDER,
                spec.provider.clone().unwrap_or_default(),
            )
            .with_meta("status", status)
    }

    async fn emit(&self, activity: ActivityEvent) {
        if let Some(sink) = &self.activity {
            if let Err(e) = sink.emit(activity).await {
                debug!(error = %e, "activity emission failed");
            }
        }
    }

    /// Resolve adapter credentials: user, then tenant, then system
    /// scope, all under the `default` key. A full miss falls back to
    /// ambient credentials only for allowlisted subjects.
    async fn resolve_secrets(
        &self,
        channel_type: &str,
        provider: &str,
        recipient: &str,
        tenant_id: &str,
    ) -> DispatchResult<Option<HashMap<String, Vec<u8>>>> {
        let Some(resolver) = &self.secrets else {
            return Ok(None);
        };

        let mut refs = vec![SecretReference::new(
            SecretScope::User,
            recipient,
            channel_type,
            provider,
            "default",
        )];
        if !tenant_id.is_empty() {
            refs.push(SecretReference::new(
                SecretScope::Tenant,
                tenant_id,
                channel_type,
                provider,
                "default",
            ));
        }
        refs.push(SecretReference::new(
            SecretScope::System,
            "default",
            channel_type,
            provider,
            "default",
        ));

        let found = resolver.resolve(&refs).await?;
        for reference in &refs {
            if let Some(entry) = found.get(reference) {
                let mut credentials = HashMap::new();
                credentials.insert("default".to_string(), entry.data.clone());
                return Ok(Some(credentials));
            }
        }

        let allowlisted = self
            .env_fallback_allowlist
            .iter()
            .any(|subject| subject == recipient || (!tenant_id.is_empty() && subject == tenant_id));
        if allowlisted {
            // Ambient credentials: the adapter reads its own environment.
            return Ok(None);
        }
        Err(DispatchError::SecretUnavailable(format!(
            "{}:{} for {}",
            channel_type, provider, recipient
        )))
    }
}

fn subscriptions_from(context: &Payload) -> Vec<String> {
    match context.get(keys::SUBSCRIPTIONS) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NotificationDefinition;
    use serde_json::json;

    #[test]
    fn subscriptions_parse_from_context() {
        let context = json!({ "subscriptions": ["billing", 7, "alerts"] })
            .as_object()
            .unwrap()
            .clone();
        assert_eq!(subscriptions_from(&context), vec!["billing", "alerts"]);
        assert!(subscriptions_from(&Payload::new()).is_empty());
    }

    #[test]
    fn builder_clamps_worker_count() {
        let definitions = Arc::new(crate::repository::MemoryDefinitionRepository::new());
        let templates = Arc::new(
            TemplateService::builder(Arc::new(crate::template_registry::TemplateRegistry::new()))
                .build(),
        );
        let dispatcher = Dispatcher::builder(definitions, templates, Arc::new(AdapterRegistry::new()))
            .max_workers(0)
            .build();
        assert_eq!(dispatcher.max_workers, 1);
    }

    #[test]
    fn config_settings_flow_into_the_builder() {
        let config = crate::config::EngineConfig::from_toml_str(
            r#"
            [dispatcher]
            max_retries = 7
            max_workers = 2
            env_fallback_allowlist = ["ops@example.com"]

            [realtime]
            enabled = true
            "#,
        )
        .unwrap();

        let definitions = Arc::new(crate::repository::MemoryDefinitionRepository::new());
        let templates = Arc::new(
            TemplateService::builder(Arc::new(crate::template_registry::TemplateRegistry::new()))
                .build(),
        );
        let dispatcher = Dispatcher::builder(definitions, templates, Arc::new(AdapterRegistry::new()))
            .with_config(&config)
            .build();
        assert_eq!(dispatcher.max_retries, 7);
        assert_eq!(dispatcher.max_workers, 2);
        assert_eq!(dispatcher.env_fallback_allowlist, vec!["ops@example.com"]);
        assert!(dispatcher.realtime_enabled);
    }

    #[test]
    fn fan_out_is_channels_times_recipients() {
        let definition = NotificationDefinition {
            code: "welcome".into(),
            channels: vec!["email".into(), "sms:twilio".into()],
            ..Default::default()
        };
        let recipients = vec!["a@example.com".to_string(), "b@example.com".to_string()];
        let jobs: Vec<(String, String)> = definition
            .channels
            .iter()
            .flat_map(|c| recipients.iter().map(move |r| (c.clone(), r.clone())))
            .collect();
        assert_eq!(jobs.len(), 4);
    }
}
