//! Generic websocket/webhook-style channel plugin for Mezon, Signal, and
//! SMS.
//!
//! spec.md §1 lists these transports alongside Slack/Discord but this
//! core's spec does not define their wire protocols. Grounded in the
//! teacher's "inject, don't own a read loop" shape (`messaging/webhook.rs`,
//! `messaging/webchat.rs`): a thin adapter around a JSON-over-websocket
//! inbound feed plus an HTTP POST outbound sink, configured per account via
//! `AccountConfig.extra["ws_url"]` / `extra["send_url"]`. One `GenericPlugin`
//! instance backs one channel id; the gateway registers three (mezon,
//! signal, sms) with different ids/labels.

use crate::error::{ChannelError, Result};
use crate::registry::{
    AccountContext, Capabilities, ChannelMeta, ChannelPlugin, OutboundResponse, StatusDelta,
};
use crate::{now_ms, AccountId, Attachment, ChatType, Envelope, Sender};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{info, warn};

const RECONNECT_BACKOFF: std::time::Duration = std::time::Duration::from_secs(2);

/// Wire shape for an inbound event on the generic websocket feed.
#[derive(Debug, Deserialize)]
struct WireInbound {
    id: Option<String>,
    from: String,
    display_name: Option<String>,
    chat_type: WireChatType,
    group_id: Option<String>,
    group_name: Option<String>,
    text: Option<String>,
    #[serde(default)]
    attachments: Vec<WireAttachment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum WireChatType {
    Direct,
    Group,
}

#[derive(Debug, Deserialize)]
struct WireAttachment {
    url: String,
    mime: String,
    size: Option<u64>,
}

/// Wire shape for an outbound send request posted to `send_url`.
#[derive(Debug, Serialize)]
struct WireOutbound<'a> {
    to: &'a str,
    chat_type: &'static str,
    text: &'a str,
    media_urls: &'a [String],
}

pub struct GenericPlugin {
    id: &'static str,
    label: &'static str,
    http: reqwest::Client,
    accounts: Arc<RwLock<HashMap<AccountId, String>>>,
}

impl GenericPlugin {
    pub fn new(id: &'static str, label: &'static str) -> Self {
        Self {
            id,
            label,
            http: reqwest::Client::new(),
            accounts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn mezon() -> Self {
        Self::new("mezon", "Mezon")
    }

    pub fn signal() -> Self {
        Self::new("signal", "Signal")
    }

    pub fn sms() -> Self {
        Self::new("sms", "SMS")
    }
}

#[async_trait]
impl ChannelPlugin for GenericPlugin {
    fn id(&self) -> &'static str {
        self.id
    }

    fn meta(&self) -> ChannelMeta {
        ChannelMeta {
            label: self.label,
            aliases: &[],
            order: 30,
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            direct: true,
            group: self.id != "sms",
            media: true,
            reactions: false,
            block_streaming: false,
        }
    }

    async fn start_account(&self, ctx: AccountContext) -> Result<()> {
        let ws_url = ctx
            .account
            .account
            .config
            .extra
            .get("ws_url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ChannelError::AccountNotConfigured {
                    channel: self.id.to_string(),
                    account_id: ctx.account_id.to_string(),
                }
            })?
            .to_string();

        let send_url = ctx
            .account
            .account
            .config
            .extra
            .get("send_url")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("{ws_url}/send"));
        self.accounts
            .write()
            .await
            .insert(ctx.account_id.clone(), send_url);

        ctx.set_status(StatusDelta {
            running: Some(true),
            ..Default::default()
        })
        .await;

        loop {
            if ctx.abort.is_cancelled() {
                break;
            }

            let connect = tokio_tungstenite::connect_async(&ws_url);
            let stream = tokio::select! {
                result = connect => result,
                _ = ctx.abort.cancelled() => break,
            };

            let (mut socket, _response) = match stream {
                Ok(pair) => pair,
                Err(error) => {
                    warn!(channel = self.id, account_id = %ctx.account_id, %error, "connect failed, retrying");
                    ctx.set_status(StatusDelta {
                        last_error: Some(error.to_string()),
                        ..Default::default()
                    })
                    .await;
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                    continue;
                }
            };
            info!(channel = self.id, account_id = %ctx.account_id, "connected");

            loop {
                let next = tokio::select! {
                    item = socket.next() => item,
                    _ = ctx.abort.cancelled() => {
                        let _ = socket.close(None).await;
                        self.accounts.write().await.remove(&ctx.account_id);
                        ctx.set_status(StatusDelta { running: Some(false), ..Default::default() }).await;
                        return Ok(());
                    }
                };

                match next {
                    Some(Ok(WsMessage::Text(text))) => {
                        self.handle_wire_message(&ctx, &text).await;
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = socket.send(WsMessage::Pong(payload)).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        warn!(channel = self.id, account_id = %ctx.account_id, %error, "websocket error");
                        break;
                    }
                    None => {
                        warn!(channel = self.id, account_id = %ctx.account_id, "websocket closed, reconnecting");
                        break;
                    }
                }
            }

            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }

        self.accounts.write().await.remove(&ctx.account_id);
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
        let send_url = self
            .accounts
            .read()
            .await
            .get(account_id)
            .cloned()
            .ok_or_else(|| {
                ChannelError::AccountNotConfigured {
                    channel: self.id.to_string(),
                    account_id: account_id.to_string(),
                }
            })?;

        let body = WireOutbound {
            to,
            chat_type: match chat_type {
                ChatType::Direct => "direct",
                ChatType::Group => "group",
            },
            text: &response.text,
            media_urls: &response.media_urls,
        };

        self.http
            .post(send_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::Transport(format!("{} send failed: {e}", self.id)))?;
        Ok(())
    }
}

impl GenericPlugin {
    async fn handle_wire_message(&self, ctx: &AccountContext, raw: &str) {
        let wire: WireInbound = match serde_json::from_str(raw) {
            Ok(w) => w,
            Err(error) => {
                warn!(channel = self.id, %error, "malformed inbound payload, dropping");
                return;
            }
        };

        let now = now_ms();
        let chat_type = match wire.chat_type {
            WireChatType::Direct => ChatType::Direct,
            WireChatType::Group => ChatType::Group,
        };

        let envelope = Envelope {
            channel: self.id.into(),
            account_id: ctx.account_id.clone(),
            message_id: wire.id,
            timestamp: now,
            sender: Sender {
                id: wire.from,
                display_name: wire.display_name,
            },
            chat_type,
            group_id: wire.group_id,
            group_name: wire.group_name,
            text: wire.text,
            attachments: wire
                .attachments
                .into_iter()
                .map(|a| Attachment {
                    url_or_id: a.url,
                    mime: a.mime,
                    size: a.size,
                })
                .collect(),
            raw: serde_json::Value::Null,
        };

        let _ = ctx
            .status_tx
            .send(StatusDelta {
                last_inbound_at: Some(now),
                ..Default::default()
            })
            .await;
        if let Err(error) = ctx.inbound_tx.send(envelope).await {
            warn!(channel = self.id, %error, "inbound channel closed, dropping message");
        }
    }
}
