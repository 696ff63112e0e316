//! Channel Inbound Pipeline (spec.md §1, §4; the Core).
//!
//! Wires every component together: an inbound `Envelope` from any
//! registered channel plugin runs through account resolution, the policy
//! gate, pairing, the debouncer, routing, session recording, the agent
//! dispatcher, surface formatting, and finally delivery back over the
//! originating plugin. This is the one piece of §9's "cyclic plugin
//! references core helpers" coupling note: plugins only ever see
//! `inbound_tx`; everything downstream of that channel lives here, in one
//! place, so each plugin stays replaceable in isolation.

use crate::account::AccountResolver;
use crate::commands::{command_token, is_control_command, AccessGroupEvaluator, AllowAllEvaluator};
use crate::config::Config;
use crate::debounce::{skip_debounce, DebounceKey, InboundDebouncer};
use crate::dispatch::{AgentDispatcher, DispatchRequest};
use crate::error::Result;
use crate::format::{format_for_surface, SurfaceProfile, TableMode};
use crate::media::MediaFetcher;
use crate::pairing::{build_pairing_reply, PairingStore};
use crate::policy::{Decision, PolicyGate};
use crate::registry::{ChannelPlugin, ChannelPluginRegistry, OutboundResponse};
use crate::route::RouteResolver;
use crate::session::SessionStore;
use crate::{now_ms, AccountConfig, ChatType, DeliveryContext, Envelope, SessionEntry};

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Everything an inbound envelope needs resolved before it can be
/// delivered to an agent, built once per process and shared across every
/// channel plugin's inbound task.
pub struct InboundPipeline {
    config: Arc<Config>,
    registry: Arc<ChannelPluginRegistry>,
    dispatcher: Arc<AgentDispatcher<crate::agent_process::ProcessAgentRunner>>,
    evaluator: Arc<dyn AccessGroupEvaluator>,
    media_fetcher: Arc<MediaFetcher>,
    debouncer: Arc<InboundDebouncer>,
    session_stores: Mutex<HashMap<String, Arc<SessionStore>>>,
    pairing_stores: Mutex<HashMap<String, Arc<PairingStore>>>,
    /// Carries `command_authorized` across a debounce flush, since
    /// `Envelope` (spec.md §3) has no such field of its own -- only text is
    /// spec'd to survive coalescing via concatenation, so this context
    /// rides alongside the debouncer keyed identically and is consumed
    /// exactly once, at flush time.
    pending_authorization: Mutex<HashMap<DebounceKey, Option<bool>>>,
}

impl InboundPipeline {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<ChannelPluginRegistry>,
        dispatcher: Arc<AgentDispatcher<crate::agent_process::ProcessAgentRunner>>,
        evaluator: Arc<dyn AccessGroupEvaluator>,
    ) -> Self {
        let media_fetcher = Arc::new(MediaFetcher::new(config.media_dir()));
        Self {
            config,
            registry,
            dispatcher,
            evaluator,
            media_fetcher,
            debouncer: Arc::new(InboundDebouncer::new()),
            session_stores: Mutex::new(HashMap::new()),
            pairing_stores: Mutex::new(HashMap::new()),
            pending_authorization: Mutex::new(HashMap::new()),
        }
    }

    /// Drains `rx` until every sender has dropped, running each envelope
    /// through `handle_envelope`. One of these runs for the lifetime of the
    /// process, fed by every channel plugin's `inbound_tx`.
    pub async fn run(self: Arc<Self>, mut rx: tokio::sync::mpsc::Receiver<Envelope>) {
        while let Some(envelope) = rx.recv().await {
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(error) = this.handle_envelope(envelope).await {
                    error!(%error, "inbound envelope processing failed");
                }
            });
        }
    }

    async fn pairing_store_for(&self, channel: &str) -> Arc<PairingStore> {
        let mut stores = self.pairing_stores.lock().await;
        if let Some(store) = stores.get(channel) {
            return Arc::clone(store);
        }
        let store = Arc::new(PairingStore::new(self.config.pairing_store_path(channel)));
        stores.insert(channel.to_string(), Arc::clone(&store));
        store
    }

    async fn session_store_for(&self, agent_id: &str) -> Arc<SessionStore> {
        let mut stores = self.session_stores.lock().await;
        if let Some(store) = stores.get(agent_id) {
            return Arc::clone(store);
        }
        let path = self.config.session_store_dir().join(format!("{agent_id}.json"));
        let store = Arc::new(SessionStore::new(path));
        stores.insert(agent_id.to_string(), Arc::clone(&store));
        store
    }

    /// Runs one inbound envelope through account resolution and the policy
    /// gate (spec.md §4.1, §4.2), then either issues a pairing reply, drops
    /// it, or hands it to the debouncer.
    async fn handle_envelope(self: Arc<Self>, envelope: Envelope) -> Result<()> {
        let channel = envelope.channel.clone();
        let plugin = self.registry.get(&channel)?;

        let Some(base) = self.config.channel(&channel) else {
            warn!(%channel, "inbound message for a channel with no configuration; dropping");
            return Ok(());
        };

        let resolver = AccountResolver::new(channel.as_ref());
        let resolved = resolver.resolve_account(&base, &envelope.account_id)?;
        let account_config = resolved.account.config;

        let pairing_store = self.pairing_store_for(&channel).await;
        let durable_allow = pairing_store.read_allow_from_store(&channel).await?;
        let mut effective_allow_from = account_config.allow_from.clone();
        effective_allow_from.extend(durable_allow);

        let has_control_command = envelope
            .text
            .as_deref()
            .map(is_control_command)
            .unwrap_or(false);

        let is_authorized = if has_control_command {
            let evaluator: &dyn AccessGroupEvaluator = if self.config.use_access_groups() {
                self.evaluator.as_ref()
            } else {
                &AllowAllEvaluator
            };
            let command = envelope.text.as_deref().and_then(command_token).unwrap_or("");
            Some(
                evaluator
                    .authorize(&channel, &envelope.account_id, &envelope.sender.id, command)
                    .await,
            )
        } else {
            None
        };

        let decision = PolicyGate::evaluate(
            &account_config,
            &effective_allow_from,
            &account_config.group_allow_from,
            &envelope.sender.id,
            envelope.chat_type,
            has_control_command,
            is_authorized,
        );

        match decision {
            Decision::Drop => {
                debug!(%channel, sender = %envelope.sender.id, "policy gate dropped inbound message");
                Ok(())
            }
            Decision::RequirePairing => {
                self.handle_pairing(&plugin, &pairing_store, &envelope).await
            }
            Decision::Allow { command_authorized } => {
                self.admit(envelope, &account_config, command_authorized).await
            }
        }
    }

    /// Issues a pairing reply exactly once per unapproved `(channel, id)`
    /// (spec.md §4.4, P9).
    async fn handle_pairing(
        &self,
        plugin: &Arc<dyn ChannelPlugin>,
        pairing_store: &PairingStore,
        envelope: &Envelope,
    ) -> Result<()> {
        let upsert = pairing_store
            .upsert_pairing_request(&envelope.channel, &envelope.sender.id, now_ms(), None)
            .await?;

        if !upsert.created {
            return Ok(());
        }

        let id_line = format!(
            "Your {} user id: {}",
            plugin.meta().label,
            envelope.sender.id
        );
        let reply = build_pairing_reply(&envelope.channel, &id_line, &upsert.request.code);

        if let Err(error) = plugin
            .respond(
                &envelope.account_id,
                &envelope.sender.id,
                ChatType::Direct,
                OutboundResponse {
                    text: reply,
                    media_urls: Vec::new(),
                },
            )
            .await
        {
            warn!(%error, channel = %envelope.channel, "failed to deliver pairing reply");
        }
        Ok(())
    }

    /// Message cleared the policy gate. Bypasses the debouncer for media,
    /// control commands, or empty text (spec.md §4.3); otherwise coalesces
    /// with any other messages arriving in the same debounce window before
    /// continuing to routing and dispatch.
    async fn admit(
        self: Arc<Self>,
        envelope: Envelope,
        account_config: &AccountConfig,
        command_authorized: Option<bool>,
    ) -> Result<()> {
        let window = Duration::from_millis(account_config.debounce_ms);

        if window.is_zero() || skip_debounce(&envelope, is_control_command) {
            return self.process_admitted(envelope, command_authorized).await;
        }

        let key = DebounceKey::from_envelope(&envelope);
        {
            let mut pending = self.pending_authorization.lock().await;
            pending.insert(key.clone(), command_authorized);
        }

        let this = Arc::clone(&self);
        let flush_key = key.clone();
        self.debouncer
            .push(
                key,
                envelope,
                window,
                Arc::new(move |merged| {
                    let this = Arc::clone(&this);
                    let flush_key = flush_key.clone();
                    tokio::spawn(async move {
                        let command_authorized = {
                            let mut pending = this.pending_authorization.lock().await;
                            pending.remove(&flush_key).flatten()
                        };
                        if let Err(error) = this.process_admitted(merged, command_authorized).await {
                            error!(%error, "failed to process debounced inbound message");
                        }
                    });
                }),
            )
            .await;
        Ok(())
    }

    /// Routes, records the session, dispatches to the agent, formats the
    /// reply for the originating surface, and delivers it (spec.md §4.5,
    /// §4.6, §4.8, §4.9).
    async fn process_admitted(
        &self,
        envelope: Envelope,
        command_authorized: Option<bool>,
    ) -> Result<()> {
        let plugin = self.registry.get(&envelope.channel)?;
        let agent_id = self.config.agent_process().agent_id.clone();
        let route_resolver = RouteResolver::new(agent_id.clone());
        let route = route_resolver.resolve(&envelope.channel, &envelope.account_id, &envelope.peer());

        let session_store = self.session_store_for(&agent_id).await;
        let now = now_ms();
        let session_key = route.session_key.clone();
        let chat_type = envelope.chat_type;
        let entry_agent_id = agent_id.clone();
        session_store
            .update(
                &session_key,
                now,
                move || SessionEntry::new(session_key.clone(), entry_agent_id.clone(), now),
                move |entry| {
                    entry.chat_type = Some(chat_type);
                },
            )
            .await?;

        let base = self.config.channel(&envelope.channel);
        let media_max_mb = base.as_ref().map(|b| b.config.media_max_mb).unwrap_or(20);

        let mut media_path = None;
        let mut media_type = None;
        let mut media_url = None;
        if let Some(attachment) = envelope.attachments.first() {
            match self.media_fetcher.fetch(attachment, media_max_mb).await {
                Ok(fetched) => {
                    media_path = Some(fetched.path.display().to_string());
                    media_type = Some(fetched.mime);
                    media_url = Some(attachment.url_or_id.clone());
                }
                Err(error) => {
                    warn!(%error, channel = %envelope.channel, "media fetch failed, continuing without it");
                }
            }
        }

        let message = self.prefix_timestamp(envelope.text.clone());
        let to = envelope.peer().id().to_string();

        let delivery = DeliveryContext {
            from: envelope.sender.id.clone(),
            to: to.clone(),
            session_key: route.session_key.clone(),
            account_id: envelope.account_id.clone(),
            chat_type: envelope.chat_type,
            conversation_label: envelope.group_name.clone(),
            sender_name: envelope.sender.display_name.clone(),
            sender_id: envelope.sender.id.clone(),
            command_authorized,
            provider: None,
            surface: envelope.channel.clone(),
            message_sid: envelope.message_id.clone(),
            media_path,
            media_type,
            media_url,
            originating_channel: envelope.channel.clone(),
            originating_to: to,
        };

        let request = DispatchRequest {
            route,
            delivery: delivery.clone(),
            message,
            idempotency_key: envelope.message_id.clone(),
            label: None,
            spawned_by: None,
        };

        let mut payload_stream = self.dispatcher.dispatch(&request).await;
        let profile = surface_profile(&envelope.channel);
        let block_streaming = plugin.capabilities().block_streaming;
        let mut aborted = false;
        let mut errored = false;

        let mut buffer = crate::blocks::BlockBuffer::new(block_streaming);
        'stream: while let Some(payload) = payload_stream.next().await {
            errored = errored || (payload.is_final() && payload.error);
            let media_urls = payload.media_urls.clone();
            let blocks = if payload.is_final() {
                buffer.finish(media_urls)
            } else if let Some(text) = &payload.text {
                buffer.push(text, media_urls)
            } else {
                Vec::new()
            };

            for block in &blocks {
                let text = block.text.clone().unwrap_or_default();
                let formatted = format_for_surface(&text, &profile);

                let outcome = crate::delivery::deliver(
                    &plugin,
                    &envelope.account_id,
                    &delivery.to,
                    envelope.chat_type,
                    &formatted.chunks,
                    block.media_urls.clone(),
                )
                .await;

                if let crate::delivery::DeliveryOutcome::Aborted { error, .. } = outcome {
                    warn!(%error, channel = %envelope.channel, "delivery aborted mid-reply");
                    aborted = true;
                    break 'stream;
                }
            }

            if payload.is_final() {
                break;
            }
        }
        let aborted = aborted || errored;

        if aborted {
            let now = now_ms();
            let entry_agent_id = agent_id.clone();
            let session_key = delivery.session_key.clone();
            if let Err(error) = session_store
                .update(
                    &session_key,
                    now,
                    move || SessionEntry::new(session_key.clone(), entry_agent_id.clone(), now),
                    |entry| entry.aborted_last_run = Some(true),
                )
                .await
            {
                warn!(%error, "failed to record aborted_last_run on session entry");
            }
        }

        Ok(())
    }

    /// Prefixes inbound text with `[Weekday YYYY-MM-DD HH:mm TZ]` when an
    /// operator timezone is configured (spec.md §6
    /// `agents.defaults.userTimezone`).
    fn prefix_timestamp(&self, text: Option<String>) -> Option<String> {
        let text = text?;
        let Some(tz) = self.config.user_timezone() else {
            return Some(text);
        };
        let now = chrono::Utc::now().with_timezone(&tz);
        let prefix = now.format("[%A %Y-%m-%d %H:%M %Z]");
        Some(format!("{prefix} {text}"))
    }
}

/// Per-surface chunking/table/style parameters (spec.md §4.8, §6
/// capabilities). Limits are the conservative published maximums for each
/// transport's single-message text payload; Signal is the one surface
/// whose rich text is modeled as out-of-band `StyleRange`s rather than
/// inline markup.
fn surface_profile(channel: &str) -> SurfaceProfile {
    match channel {
        "discord" => SurfaceProfile {
            max_chunk_len: 2000,
            table_mode: TableMode::Code,
            uses_style_ranges: false,
        },
        "slack" => SurfaceProfile {
            max_chunk_len: 4000,
            table_mode: TableMode::Code,
            uses_style_ranges: false,
        },
        "signal" => SurfaceProfile {
            max_chunk_len: 2000,
            table_mode: TableMode::Compact,
            uses_style_ranges: true,
        },
        "sms" => SurfaceProfile {
            max_chunk_len: 1500,
            table_mode: TableMode::Drop,
            uses_style_ranges: false,
        },
        _ => SurfaceProfile {
            max_chunk_len: 4000,
            table_mode: TableMode::Compact,
            uses_style_ranges: false,
        },
    }
}
