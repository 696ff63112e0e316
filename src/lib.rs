//! Channel Inbound Pipeline and Reply Dispatcher.
//!
//! A multi-surface agent gateway core: receives messages from heterogeneous
//! chat transports, routes each to an LLM-backed agent, and returns the
//! reply back over the originating surface. See `DESIGN.md` for the
//! module-by-module design notes.

pub mod account;
pub mod agent_process;
pub mod blocks;
pub mod channels;
pub mod commands;
pub mod config;
pub mod debounce;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod format;
pub mod media;
pub mod pairing;
pub mod pipeline;
pub mod policy;
pub mod registry;
pub mod route;
pub mod session;
pub mod supervisor;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Current wall-clock time in milliseconds since the Unix epoch, the unit
/// every timestamp in this crate's data model uses.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Channel identifier type (e.g. "discord", "slack", "mezon").
pub type ChannelTag = Arc<str>;

/// Account identifier within a channel.
pub type AccountId = Arc<str>;

/// Agent identifier the dispatcher routes to.
pub type AgentId = Arc<str>;

/// Whether a conversation is a direct message or a group chat.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    Direct,
    Group,
}

impl std::fmt::Display for ChatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatType::Direct => write!(f, "direct"),
            ChatType::Group => write!(f, "group"),
        }
    }
}

/// A tagged conversation target: a direct peer or a group.
///
/// `{kind: direct | group, id: string}`. For direct, `id` is the
/// channel-local recipient identity; for group, `id` is the group identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Peer {
    Direct { id: String },
    Group { id: String },
}

impl Peer {
    pub fn id(&self) -> &str {
        match self {
            Peer::Direct { id } | Peer::Group { id } => id,
        }
    }

    pub fn chat_type(&self) -> ChatType {
        match self {
            Peer::Direct { .. } => ChatType::Direct,
            Peer::Group { .. } => ChatType::Group,
        }
    }
}

/// An inbound attachment reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    /// Either a fetchable URL or an opaque platform-local id.
    pub url_or_id: String,
    pub mime: String,
    pub size: Option<u64>,
}

/// Normalized inbound message, common across all transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: ChannelTag,
    pub account_id: AccountId,
    /// Surface-unique message id, when the transport provides one.
    pub message_id: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub sender: Sender,
    pub chat_type: ChatType,
    pub group_id: Option<String>,
    pub group_name: Option<String>,
    /// Text after mention resolution. `None` for attachment-only messages.
    pub text: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Original transport payload, opaque to the core.
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl Envelope {
    pub fn peer(&self) -> Peer {
        match self.chat_type {
            ChatType::Direct => Peer::Direct {
                id: self.sender.id.clone(),
            },
            ChatType::Group => Peer::Group {
                id: self
                    .group_id
                    .clone()
                    .unwrap_or_else(|| self.sender.id.clone()),
            },
        }
    }

    pub fn has_media(&self) -> bool {
        !self.attachments.is_empty()
    }
}

/// An opaque sender identity plus an optional display name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    pub display_name: Option<String>,
}

/// DM admission policy for an account.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DmPolicy {
    Pairing,
    Allowlist,
    Open,
    Disabled,
}

/// Group admission policy for an account.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GroupPolicy {
    Open,
    Allowlist,
    Disabled,
}

/// Per-account channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub dm_policy: DmPolicy,
    pub group_policy: GroupPolicy,
    #[serde(default)]
    pub allow_from: Vec<String>,
    #[serde(default)]
    pub group_allow_from: Vec<String>,
    #[serde(default = "default_media_max_mb")]
    pub media_max_mb: u64,
    /// Per-channel debounce window, in milliseconds. 0 disables debouncing.
    #[serde(default)]
    pub debounce_ms: u64,
    /// Extra channel-specific knobs not modeled explicitly: a
    /// forward-compatible extension point for settings new transports need
    /// without a schema change.
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_media_max_mb() -> u64 {
    20
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            dm_policy: DmPolicy::Pairing,
            group_policy: GroupPolicy::Disabled,
            allow_from: Vec::new(),
            group_allow_from: Vec::new(),
            media_max_mb: default_media_max_mb(),
            debounce_ms: 0,
            extra: HashMap::new(),
        }
    }
}

/// A fully-resolved account: id, enabled status, credentials, and config.
#[derive(Debug, Clone)]
pub struct Account {
    pub account_id: AccountId,
    pub enabled: bool,
    pub credentials: Credentials,
    pub config: AccountConfig,
}

/// Resolved credential plus where it came from.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub token: Option<String>,
    pub source: CredentialSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Env,
    Config,
    ConfigFile,
    None,
}

/// Durable `(channel, id) -> {code, createdAt, approvedAt}` pairing record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingRequest {
    pub channel: ChannelTag,
    pub id: String,
    pub code: String,
    pub created_at: i64,
    pub approved_at: Option<i64>,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
}

/// Per-conversation session record.
///
/// Explicit optionals for the well-known fields, plus `extra` for
/// forward-compatible keys the agent layer introduces without this crate
/// needing to know.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_key: String,
    pub session_id: String,
    pub agent_id: AgentId,
    pub updated_at: i64,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub context_tokens: Option<u64>,
    pub model: Option<String>,
    pub model_override: Option<String>,
    pub provider_override: Option<String>,
    pub thinking_level: Option<String>,
    pub verbose_level: Option<String>,
    pub reasoning_level: Option<String>,
    pub elevated_level: Option<String>,
    pub response_usage: Option<serde_json::Value>,
    pub group_activation: Option<bool>,
    pub system_sent: Option<bool>,
    pub aborted_last_run: Option<bool>,
    pub skills_snapshot: Option<serde_json::Value>,
    pub send_policy: Option<String>,
    pub cli_session_ids: Option<serde_json::Value>,
    pub claude_cli_session_id: Option<String>,
    pub chat_type: Option<ChatType>,
    pub label: Option<String>,
    pub spawned_by: Option<String>,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl SessionEntry {
    /// A freshly-created entry for a session key seen for the first time.
    pub fn new(session_key: impl Into<String>, agent_id: AgentId, now_ms: i64) -> Self {
        Self {
            session_key: session_key.into(),
            session_id: uuid::Uuid::new_v4().to_string(),
            agent_id,
            updated_at: now_ms,
            input_tokens: None,
            output_tokens: None,
            total_tokens: None,
            context_tokens: None,
            model: None,
            model_override: None,
            provider_override: None,
            thinking_level: None,
            verbose_level: None,
            reasoning_level: None,
            elevated_level: None,
            response_usage: None,
            group_activation: None,
            system_sent: None,
            aborted_last_run: None,
            skills_snapshot: None,
            send_policy: None,
            cli_session_ids: None,
            claude_cli_session_id: None,
            chat_type: None,
            label: None,
            spawned_by: None,
            extra: HashMap::new(),
        }
    }
}

/// Marker on a `ReplyPayload` distinguishing an incremental chunk from the
/// terminal one: exactly one `Final` reaches the caller per inbound message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMarker {
    Partial,
    Final,
}

/// A payload emitted by the agent dispatcher's reply stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub text: Option<String>,
    #[serde(default)]
    pub media_urls: Vec<String>,
    pub marker: ReplyMarker,
    /// Set when this `final` payload resulted from a stream error that
    /// should be surfaced to the user rather than silently dropped.
    #[serde(default)]
    pub error: bool,
}

impl ReplyPayload {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            media_urls: Vec::new(),
            marker: ReplyMarker::Partial,
            error: false,
        }
    }

    pub fn r#final(text: Option<String>, media_urls: Vec<String>) -> Self {
        Self {
            text,
            media_urls,
            marker: ReplyMarker::Final,
            error: false,
        }
    }

    pub fn final_error(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            media_urls: Vec::new(),
            marker: ReplyMarker::Final,
            error: true,
        }
    }

    pub fn is_final(&self) -> bool {
        self.marker == ReplyMarker::Final
    }
}

/// Resolved routing decision: the same `(channel, accountId, peer)` triple
/// always resolves to the same `Route`.
#[derive(Debug, Clone)]
pub struct Route {
    pub agent_id: AgentId,
    pub account_id: AccountId,
    pub session_key: String,
    pub main_session_key: String,
}

/// The sole object passed to the agent layer end-to-end.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    pub from: String,
    pub to: String,
    pub session_key: String,
    pub account_id: AccountId,
    pub chat_type: ChatType,
    pub conversation_label: Option<String>,
    pub sender_name: Option<String>,
    pub sender_id: String,
    pub command_authorized: Option<bool>,
    pub provider: Option<String>,
    pub surface: ChannelTag,
    pub message_sid: Option<String>,
    pub media_path: Option<String>,
    pub media_type: Option<String>,
    pub media_url: Option<String>,
    pub originating_channel: ChannelTag,
    pub originating_to: String,
}
