//! Channel Plugin Registry and plugin contract (spec.md §4.1, §6; C1).

use crate::account::ResolvedAccount;
use crate::error::{ChannelError, Result};
use crate::{AccountId, ChannelTag, ChatType, Envelope};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What a channel plugin supports (spec.md §6 `capabilities`).
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub direct: bool,
    pub group: bool,
    pub media: bool,
    pub reactions: bool,
    pub block_streaming: bool,
}

/// Plugin metadata (spec.md §6 `meta`).
#[derive(Debug, Clone)]
pub struct ChannelMeta {
    pub label: &'static str,
    pub aliases: &'static [&'static str],
    pub order: i32,
}

/// Lifecycle status delta a running account reports back to the supervisor
/// (spec.md §4.1 `ctx.setStatus`).
#[derive(Debug, Clone, Default)]
pub struct StatusDelta {
    pub last_inbound_at: Option<i64>,
    pub last_outbound_at: Option<i64>,
    pub last_error: Option<String>,
    pub running: Option<bool>,
}

/// Context handed to `gateway.startAccount` (spec.md §6 `ctx`).
pub struct AccountContext {
    pub account_id: AccountId,
    pub account: ResolvedAccount,
    pub abort: CancellationToken,
    pub inbound_tx: mpsc::Sender<Envelope>,
    pub status_tx: mpsc::Sender<StatusDelta>,
}

impl AccountContext {
    pub async fn set_status(&self, delta: StatusDelta) {
        let _ = self.status_tx.send(delta).await;
    }
}

/// Every transport implements this contract (spec.md §6).
///
/// `start_account` MUST: establish transport connections, install an inbound
/// handler, honor `ctx.abort` by releasing all resources and returning, and
/// report lifecycle deltas via `ctx.set_status`.
#[async_trait]
pub trait ChannelPlugin: Send + Sync {
    /// Unique plugin id, e.g. "discord", "slack", "mezon".
    fn id(&self) -> &'static str;

    fn meta(&self) -> ChannelMeta;

    fn capabilities(&self) -> Capabilities;

    /// Start a single account's connection. Runs until `ctx.abort` fires or
    /// the transport disconnects unrecoverably.
    async fn start_account(&self, ctx: AccountContext) -> Result<()>;

    /// Send a response to `to` on this channel/account.
    async fn respond(
        &self,
        account_id: &AccountId,
        to: &str,
        chat_type: ChatType,
        response: OutboundResponse,
    ) -> Result<()>;

    /// Start (and, on drop/second call, refresh) a typing indicator. Errors
    /// are logged and swallowed by the caller per spec.md §4.8.
    async fn start_typing(&self, _account_id: &AccountId, _to: &str, _chat_type: ChatType) -> Result<()> {
        Ok(())
    }
}

/// An outbound reply payload ready for a transport to render (after
/// surface formatting). See `format` and `delivery` modules.
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    pub text: String,
    pub media_urls: Vec<String>,
}

/// Holds the set of active channel plugins keyed by id (spec.md §4.1, C1).
#[derive(Default)]
pub struct ChannelPluginRegistry {
    plugins: HashMap<&'static str, Arc<dyn ChannelPlugin>>,
}

impl ChannelPluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn ChannelPlugin>) {
        self.plugins.insert(plugin.id(), plugin);
    }

    pub fn get(&self, channel: &str) -> Result<Arc<dyn ChannelPlugin>> {
        self.plugins
            .get(channel)
            .cloned()
            .ok_or_else(|| ChannelError::NotRegistered(channel.to_string()).into())
    }

    pub fn ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.plugins.keys().copied()
    }

    pub fn plugins(&self) -> impl Iterator<Item = &Arc<dyn ChannelPlugin>> {
        self.plugins.values()
    }
}
