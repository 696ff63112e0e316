//! Discord channel plugin using `serenity`.
//!
//! Grounded in the teacher's `DiscordAdapter` (`messaging/discord.rs`):
//! same gateway-intents set, same "ignore our own messages" and
//! no-guild-id-means-DM rules. Generalized from a single-bot adapter into a
//! `ChannelPlugin` that serves multiple accounts (one serenity client per
//! account, tracked in `accounts`), since spec.md §4.1 models every channel
//! as potentially multi-account.

use crate::error::{ChannelError, Result};
use crate::registry::{
    AccountContext, Capabilities, ChannelMeta, ChannelPlugin, OutboundResponse, StatusDelta,
};
use crate::{now_ms, AccountId, Attachment, ChatType, Envelope, Sender};

use async_trait::async_trait;
use serenity::all::{
    ChannelId, Context as SerenityContext, EventHandler, GatewayIntents, Http, Message, Ready,
    UserId,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

struct AccountState {
    http: Arc<Http>,
    bot_user_id: UserId,
}

/// Discord channel plugin. One `serenity::Client` gateway connection is
/// spawned per account inside `start_account`; `respond`/`start_typing`
/// look up the connected account's `Http` handle by id.
#[derive(Default)]
pub struct DiscordPlugin {
    accounts: Arc<RwLock<HashMap<AccountId, AccountState>>>,
}

impl DiscordPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    async fn account_http(&self, account_id: &AccountId) -> Result<Arc<Http>> {
        self.accounts
            .read()
            .await
            .get(account_id)
            .map(|s| s.http.clone())
            .ok_or_else(|| {
                ChannelError::AccountNotConfigured {
                    channel: "discord".into(),
                    account_id: account_id.to_string(),
                }
                .into()
            })
    }
}

#[async_trait]
impl ChannelPlugin for DiscordPlugin {
    fn id(&self) -> &'static str {
        "discord"
    }

    fn meta(&self) -> ChannelMeta {
        ChannelMeta {
            label: "Discord",
            aliases: &["disc"],
            order: 10,
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            direct: true,
            group: true,
            media: true,
            reactions: true,
            block_streaming: true,
        }
    }

    async fn start_account(&self, ctx: AccountContext) -> Result<()> {
        let token = ctx.account.account.credentials.token.clone().ok_or_else(|| {
            ChannelError::Credentials(format!(
                "no token configured for discord account {}",
                ctx.account_id
            ))
        })?;

        let handler = Handler {
            account_id: ctx.account_id.clone(),
            inbound_tx: ctx.inbound_tx.clone(),
            status_tx: ctx.status_tx.clone(),
            accounts: self.accounts.clone(),
        };

        let intents = GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT
            | GatewayIntents::GUILDS;

        let mut client = serenity::Client::builder(&token, intents)
            .event_handler(handler)
            .await
            .map_err(|e| ChannelError::Transport(format!("failed to build discord client: {e}")))?;

        let shard_manager = client.shard_manager.clone();

        tokio::select! {
            result = client.start() => {
                self.accounts.write().await.remove(&ctx.account_id);
                if let Err(error) = result {
                    ctx.set_status(StatusDelta {
                        last_error: Some(error.to_string()),
                        running: Some(false),
                        ..Default::default()
                    })
                    .await;
                    return Err(ChannelError::Transport(format!("discord gateway error: {error}")).into());
                }
            }
            _ = ctx.abort.cancelled() => {
                shard_manager.shutdown_all().await;
                self.accounts.write().await.remove(&ctx.account_id);
            }
        }

        ctx.set_status(StatusDelta {
            running: Some(false),
            ..Default::default()
        })
        .await;
        Ok(())
    }

    async fn respond(
        &self,
        account_id: &AccountId,
        to: &str,
        chat_type: ChatType,
        response: OutboundResponse,
    ) -> Result<()> {
        let http = self.account_http(account_id).await?;
        let channel_id = resolve_channel(&http, to, chat_type).await?;

        if !response.text.trim().is_empty() {
            channel_id
                .say(&http, &response.text)
                .await
                .map_err(|e| ChannelError::Transport(format!("discord send failed: {e}")))?;
        }
        for url in &response.media_urls {
            channel_id
                .say(&http, url)
                .await
                .map_err(|e| ChannelError::Transport(format!("discord media send failed: {e}")))?;
        }
        Ok(())
    }

    async fn start_typing(&self, account_id: &AccountId, to: &str, chat_type: ChatType) -> Result<()> {
        let http = self.account_http(account_id).await?;
        let channel_id = resolve_channel(&http, to, chat_type).await?;
        // `start_typing` returns a guard that stops the indicator on drop;
        // spec.md §4.8 requires no explicit stop signal (server timeout),
        // so dropping it immediately after firing one typing event is fine.
        let _typing = channel_id.start_typing(&http);
        Ok(())
    }
}

async fn resolve_channel(http: &Http, to: &str, chat_type: ChatType) -> Result<ChannelId> {
    match chat_type {
        ChatType::Direct => {
            let user_id: UserId = to
                .parse::<u64>()
                .map_err(|_| ChannelError::Transport(format!("invalid discord user id {to}")))?
                .into();
            let dm = user_id
                .create_dm_channel(http)
                .await
                .map_err(|e| ChannelError::Transport(format!("failed to open discord DM: {e}")))?;
            Ok(dm.id)
        }
        ChatType::Group => Ok(to
            .parse::<u64>()
            .map_err(|_| ChannelError::Transport(format!("invalid discord channel id {to}")))?
            .into()),
    }
}

struct Handler {
    account_id: AccountId,
    inbound_tx: mpsc::Sender<Envelope>,
    status_tx: mpsc::Sender<StatusDelta>,
    accounts: Arc<RwLock<HashMap<AccountId, AccountState>>>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: SerenityContext, ready: Ready) {
        info!(channel = "discord", account_id = %self.account_id, bot = %ready.user.name, "discord connected");
        self.accounts.write().await.insert(
            self.account_id.clone(),
            AccountState {
                http: ctx.http.clone(),
                bot_user_id: ready.user.id,
            },
        );
        let _ = self
            .status_tx
            .send(StatusDelta {
                running: Some(true),
                ..Default::default()
            })
            .await;
    }

    async fn message(&self, _ctx: SerenityContext, message: Message) {
        let bot_user_id = self
            .accounts
            .read()
            .await
            .get(&self.account_id)
            .map(|s| s.bot_user_id);
        if bot_user_id == Some(message.author.id) || message.author.bot {
            return;
        }

        let now = now_ms();
        let chat_type = if message.guild_id.is_none() {
            ChatType::Direct
        } else {
            ChatType::Group
        };

        let envelope = Envelope {
            channel: "discord".into(),
            account_id: self.account_id.clone(),
            message_id: Some(message.id.to_string()),
            timestamp: now,
            sender: Sender {
                id: message.author.id.to_string(),
                display_name: Some(message.author.name.clone()),
            },
            chat_type,
            group_id: matches!(chat_type, ChatType::Group).then(|| message.channel_id.to_string()),
            group_name: None,
            text: (!message.content.is_empty()).then(|| message.content.clone()),
            attachments: message
                .attachments
                .iter()
                .map(|a| Attachment {
                    url_or_id: a.url.clone(),
                    mime: a
                        .content_type
                        .clone()
                        .unwrap_or_else(|| "application/octet-stream".into()),
                    size: Some(a.size as u64),
                })
                .collect(),
            raw: serde_json::Value::Null,
        };

        let _ = self
            .status_tx
            .send(StatusDelta {
                last_inbound_at: Some(now),
                ..Default::default()
            })
            .await;
        if let Err(error) = self.inbound_tx.send(envelope).await {
            warn!(%error, "discord inbound channel closed, dropping message");
        }
    }
}
