//! Slack channel plugin using `slack-morphism` Socket Mode.
//!
//! Grounded in the teacher's `SlackAdapter` (`messaging/slack.rs`): same
//! socket-mode callback wiring (`SlackSocketModeListenerCallbacks`), same
//! DM-channel-id-starts-with-`D` convention for telling DMs from channel
//! messages apart, same shared-client-for-REST / dedicated-client-for-the-
//! socket pattern. Generalized into a multi-account `ChannelPlugin`: each
//! account's bot token plus its app-level token (read from
//! `AccountConfig.extra["slack_app_token"]`, since spec.md §9's Open
//! Question on Slack credential precedence leaves that shape
//! unspecified) gets its own socket-mode listener.

use crate::error::{ChannelError, Result};
use crate::registry::{
    AccountContext, Capabilities, ChannelMeta, ChannelPlugin, OutboundResponse, StatusDelta,
};
use crate::{now_ms, AccountId, ChatType, Envelope, Sender};

use async_trait::async_trait;
use slack_morphism::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

type HyperConnector = SlackClientHyperConnector<
    slack_morphism::hyper_tokio::SlackTlsHttpsConnector,
>;
type HyperClient = SlackClient<HyperConnector>;

struct AccountState {
    client: Arc<HyperClient>,
    token: SlackApiToken,
    bot_user_id: String,
}

struct SocketState {
    account_id: AccountId,
    inbound_tx: mpsc::Sender<Envelope>,
    status_tx: mpsc::Sender<StatusDelta>,
    bot_user_id: String,
}

/// Slack channel plugin, one socket-mode listener per connected account.
#[derive(Default)]
pub struct SlackPlugin {
    accounts: Arc<RwLock<HashMap<AccountId, AccountState>>>,
}

impl SlackPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    async fn account_state(&self, account_id: &AccountId) -> Result<(Arc<HyperClient>, SlackApiToken)> {
        self.accounts
            .read()
            .await
            .get(account_id)
            .map(|s| (s.client.clone(), s.token.clone()))
            .ok_or_else(|| {
                ChannelError::AccountNotConfigured {
                    channel: "slack".into(),
                    account_id: account_id.to_string(),
                }
                .into()
            })
    }
}

#[async_trait]
impl ChannelPlugin for SlackPlugin {
    fn id(&self) -> &'static str {
        "slack"
    }

    fn meta(&self) -> ChannelMeta {
        ChannelMeta {
            label: "Slack",
            aliases: &[],
            order: 20,
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            direct: true,
            group: true,
            media: true,
            reactions: true,
            block_streaming: false,
        }
    }

    async fn start_account(&self, ctx: AccountContext) -> Result<()> {
        let bot_token = ctx.account.account.credentials.token.clone().ok_or_else(|| {
            ChannelError::Credentials(format!("no bot token configured for slack account {}", ctx.account_id))
        })?;
        let app_token = ctx
            .account
            .account
            .config
            .extra
            .get("slack_app_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ChannelError::Credentials(format!(
                    "no slack_app_token configured for slack account {}",
                    ctx.account_id
                ))
            })?
            .to_string();

        let client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new()
                .map_err(|e| ChannelError::Transport(format!("failed to build slack connector: {e}")))?,
        ));
        let token = SlackApiToken::new(SlackApiTokenValue(bot_token.clone()));
        let session = client.open_session(&token);
        let auth = session
            .auth_test()
            .await
            .map_err(|e| ChannelError::Credentials(format!("slack auth.test failed: {e}")))?;
        let bot_user_id = auth.user_id.0.clone();

        self.accounts.write().await.insert(
            ctx.account_id.clone(),
            AccountState {
                client: client.clone(),
                token: token.clone(),
                bot_user_id: bot_user_id.clone(),
            },
        );

        let socket_state = Arc::new(SocketState {
            account_id: ctx.account_id.clone(),
            inbound_tx: ctx.inbound_tx.clone(),
            status_tx: ctx.status_tx.clone(),
            bot_user_id,
        });

        let callbacks = SlackSocketModeListenerCallbacks::new().with_push_events(handle_push_event);

        let listener_client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new()
                .map_err(|e| ChannelError::Transport(format!("failed to build slack socket connector: {e}")))?,
        ));
        let listener_environment = Arc::new(
            SlackClientEventsListenerEnvironment::new(listener_client)
                .with_error_handler(slack_error_handler)
                .with_user_state(socket_state),
        );
        let listener = SlackClientSocketModeListener::new(
            &SlackClientSocketModeConfig::new(),
            listener_environment,
            callbacks,
        );
        let app_api_token = SlackApiToken::new(SlackApiTokenValue(app_token));

        listener
            .listen_for(&app_api_token)
            .await
            .map_err(|e| ChannelError::Transport(format!("slack socket mode connect failed: {e}")))?;

        ctx.set_status(StatusDelta {
            running: Some(true),
            ..Default::default()
        })
        .await;

        tokio::select! {
            exit_code = listener.serve() => {
                info!(channel = "slack", account_id = %ctx.account_id, exit_code, "slack socket mode listener stopped");
            }
            _ = ctx.abort.cancelled() => {
                listener.shutdown().await;
            }
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
        _chat_type: ChatType,
        response: OutboundResponse,
    ) -> Result<()> {
        let (client, token) = self.account_state(account_id).await?;
        let session = client.open_session(&token);

        if !response.text.trim().is_empty() {
            let req = SlackApiChatPostMessageRequest::new(
                to.into(),
                SlackMessageContent::new().with_text(response.text.clone()),
            );
            session
                .chat_post_message(&req)
                .await
                .map_err(|e| ChannelError::Transport(format!("slack send failed: {e}")))?;
        }
        for url in &response.media_urls {
            let req = SlackApiChatPostMessageRequest::new(
                to.into(),
                SlackMessageContent::new().with_text(url.clone()),
            );
            session
                .chat_post_message(&req)
                .await
                .map_err(|e| ChannelError::Transport(format!("slack media send failed: {e}")))?;
        }
        Ok(())
    }
}

fn slack_error_handler(
    err: Box<dyn std::error::Error + Send + Sync>,
    _client: Arc<HyperClient>,
    _states: SlackClientEventsUserState,
) -> http::StatusCode {
    warn!(error = %err, "slack socket mode error");
    http::StatusCode::OK
}

async fn handle_push_event(
    event: SlackPushEventCallback,
    _client: Arc<HyperClient>,
    states: SlackClientEventsUserState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let SlackEventCallbackBody::Message(msg_event) = event.event else {
        return Ok(());
    };
    // Edits/deletes/bot_message subtypes are not new inbound content.
    if msg_event.subtype.is_some() {
        return Ok(());
    }

    let state_guard = states.read().await;
    let Some(state) = state_guard.get_user_state::<Arc<SocketState>>() else {
        return Ok(());
    };

    let Some(sender_id) = msg_event.sender.user.as_ref().map(|u| u.0.clone()) else {
        return Ok(());
    };
    if sender_id == state.bot_user_id {
        return Ok(());
    }

    let channel_id = msg_event
        .origin
        .channel
        .as_ref()
        .map(|c| c.0.clone())
        .unwrap_or_default();
    let chat_type = if channel_id.starts_with('D') {
        ChatType::Direct
    } else {
        ChatType::Group
    };
    let text = msg_event
        .content
        .as_ref()
        .and_then(|c| c.text.clone())
        .filter(|t| !t.trim().is_empty());

    let now = now_ms();
    let envelope = Envelope {
        channel: "slack".into(),
        account_id: state.account_id.clone(),
        message_id: Some(msg_event.origin.ts.0.clone()),
        timestamp: now,
        sender: Sender {
            id: sender_id,
            display_name: None,
        },
        chat_type,
        group_id: matches!(chat_type, ChatType::Group).then(|| channel_id.clone()),
        group_name: None,
        text,
        attachments: Vec::new(),
        raw: serde_json::Value::Null,
    };

    let _ = state
        .status_tx
        .send(StatusDelta {
            last_inbound_at: Some(now),
            ..Default::default()
        })
        .await;
    if let Err(error) = state.inbound_tx.send(envelope).await {
        warn!(%error, "slack inbound channel closed, dropping message");
    }
    Ok(())
}
