//! Delivery Backchannel (spec.md §4.8; C12).
//!
//! Drives a channel plugin's outbound surface: starts a typing indicator,
//! sends formatted chunks strictly in order, appends a trailing
//! media-urls-only message when needed, and retries a failed chunk once
//! with a bounded backoff before aborting the rest of the delivery with an
//! error marker (spec.md P6: chunks for one reply are never reordered or
//! interleaved with another reply's chunks).

use crate::registry::{ChannelPlugin, OutboundResponse};
use crate::{AccountId, ChatType};

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Outcome of delivering one reply's worth of chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Every chunk (and the trailing media message, if any) sent.
    Delivered { chunks_sent: usize },
    /// A chunk failed even after one retry; delivery stopped at
    /// `chunks_sent` and the caller should surface an error to the user.
    Aborted { chunks_sent: usize, error: String },
}

/// Sends a sequence of already-formatted text chunks plus optional
/// trailing media URLs to `to`, in strict order, on behalf of `plugin`.
///
/// `chunks` must already be chunked to the surface's limit (see `format`
/// module); this function does not re-split them.
pub async fn deliver(
    plugin: &Arc<dyn ChannelPlugin>,
    account_id: &AccountId,
    to: &str,
    chat_type: ChatType,
    chunks: &[String],
    media_urls: Vec<String>,
) -> DeliveryOutcome {
    if let Err(error) = plugin.start_typing(account_id, to, chat_type).await {
        // Typing indicator failures are never fatal to delivery (spec.md
        // §4.8): log and continue.
        warn!(channel = plugin.id(), %to, %error, "typing indicator failed");
    }

    let mut chunks_sent = 0;

    for chunk_text in chunks {
        let response = OutboundResponse {
            text: chunk_text.clone(),
            media_urls: Vec::new(),
        };

        match send_with_retry(plugin, account_id, to, chat_type, response).await {
            Ok(()) => chunks_sent += 1,
            Err(error) => {
                return DeliveryOutcome::Aborted {
                    chunks_sent,
                    error: error.to_string(),
                };
            }
        }
    }

    if !media_urls.is_empty() {
        let response = OutboundResponse {
            text: String::new(),
            media_urls: media_urls.clone(),
        };
        match send_with_retry(plugin, account_id, to, chat_type, response).await {
            Ok(()) => chunks_sent += 1,
            Err(error) => {
                return DeliveryOutcome::Aborted {
                    chunks_sent,
                    error: error.to_string(),
                };
            }
        }
    }

    DeliveryOutcome::Delivered { chunks_sent }
}

async fn send_with_retry(
    plugin: &Arc<dyn ChannelPlugin>,
    account_id: &AccountId,
    to: &str,
    chat_type: ChatType,
    response: OutboundResponse,
) -> crate::Result<()> {
    match plugin.respond(account_id, to, chat_type, response.clone()).await {
        Ok(()) => Ok(()),
        Err(first_error) => {
            warn!(channel = plugin.id(), %to, error = %first_error, "delivery failed, retrying once");
            tokio::time::sleep(MAX_RETRY_BACKOFF).await;
            plugin.respond(account_id, to, chat_type, response).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AccountContext, Capabilities, ChannelMeta};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingPlugin {
        sent: Mutex<Vec<String>>,
        fail_first_n: AtomicUsize,
    }

    #[async_trait]
    impl ChannelPlugin for RecordingPlugin {
        fn id(&self) -> &'static str {
            "test"
        }

        fn meta(&self) -> ChannelMeta {
            ChannelMeta {
                label: "Test",
                aliases: &[],
                order: 0,
            }
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                direct: true,
                group: false,
                media: true,
                reactions: false,
                block_streaming: true,
            }
        }

        async fn start_account(&self, _ctx: AccountContext) -> crate::Result<()> {
            Ok(())
        }

        async fn respond(
            &self,
            _account_id: &AccountId,
            _to: &str,
            _chat_type: ChatType,
            response: OutboundResponse,
        ) -> crate::Result<()> {
            if self.fail_first_n.load(Ordering::SeqCst) > 0 {
                self.fail_first_n.fetch_sub(1, Ordering::SeqCst);
                return Err(crate::error::ChannelError::Transport("simulated".into()).into());
            }
            self.sent.lock().unwrap().push(response.text);
            Ok(())
        }
    }

    #[tokio::test]
    async fn delivers_chunks_in_order() {
        let plugin: Arc<dyn ChannelPlugin> = Arc::new(RecordingPlugin {
            sent: Mutex::new(Vec::new()),
            fail_first_n: AtomicUsize::new(0),
        });

        let chunks = vec!["one".to_string(), "two".to_string(), "three".to_string()];
        let outcome = deliver(
            &plugin,
            &AccountId::from("default"),
            "u1",
            ChatType::Direct,
            &chunks,
            vec![],
        )
        .await;

        assert_eq!(outcome, DeliveryOutcome::Delivered { chunks_sent: 3 });
    }

    #[tokio::test]
    async fn retries_once_then_succeeds() {
        let plugin: Arc<dyn ChannelPlugin> = Arc::new(RecordingPlugin {
            sent: Mutex::new(Vec::new()),
            fail_first_n: AtomicUsize::new(1),
        });

        let chunks = vec!["only".to_string()];
        let outcome = deliver(
            &plugin,
            &AccountId::from("default"),
            "u1",
            ChatType::Direct,
            &chunks,
            vec![],
        )
        .await;

        assert_eq!(outcome, DeliveryOutcome::Delivered { chunks_sent: 1 });
    }

    #[tokio::test]
    async fn aborts_after_exhausted_retry() {
        let plugin: Arc<dyn ChannelPlugin> = Arc::new(RecordingPlugin {
            sent: Mutex::new(Vec::new()),
            fail_first_n: AtomicUsize::new(5),
        });

        let chunks = vec!["one".to_string(), "two".to_string()];
        let outcome = deliver(
            &plugin,
            &AccountId::from("default"),
            "u1",
            ChatType::Direct,
            &chunks,
            vec![],
        )
        .await;

        match outcome {
            DeliveryOutcome::Aborted { chunks_sent, .. } => assert_eq!(chunks_sent, 0),
            other => panic!("expected Aborted, got {other:?}"),
        }
    }
}
