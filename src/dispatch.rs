//! Agent Dispatcher (spec.md §4.6; C9).
//!
//! Invokes the configured agent runner for a route, consumes its streamed
//! reply payloads, de-duplicates repeated idempotency keys within a bounded
//! window, and classifies failures per spec.md §7 so callers know whether
//! to retry, drop, or surface an error to the user.

use crate::error::{Classify, DispatchError, ErrorKind, Result};
use crate::{DeliveryContext, ReplyPayload, Route};

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use moka::future::Cache;
use std::time::Duration;

/// Default window within which a repeated idempotency key is treated as a
/// duplicate invocation rather than a fresh run (spec.md §4.6).
pub const DEFAULT_IDEMPOTENCY_WINDOW: Duration = Duration::from_secs(600);

/// What the dispatcher hands an agent runner to produce a reply (spec.md
/// §6 `agentCommand({message, agentId, sessionKey, idempotencyKey, label?,
/// spawnedBy?})`).
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub route: Route,
    pub delivery: DeliveryContext,
    /// The normalized inbound text (post-debounce merge). `None` for
    /// attachment-only turns.
    pub message: Option<String>,
    /// Caller-supplied key used for duplicate-invocation suppression, e.g.
    /// the inbound envelope's `message_id` when the transport provides one.
    pub idempotency_key: Option<String>,
    pub label: Option<String>,
    pub spawned_by: Option<String>,
}

/// Implemented once per agent backend (e.g. a CLI subprocess runner, an
/// HTTP-streaming backend). Mirrors the teacher's agent-runner trait shape:
/// a single async entry point returning a boxed stream of payloads.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, request: &DispatchRequest) -> Result<BoxStream<'static, Result<ReplyPayload>>>;
}

/// Drives one `AgentRunner` invocation end to end.
pub struct AgentDispatcher<R: AgentRunner> {
    runner: R,
    idempotency: Cache<String, ()>,
}

impl<R: AgentRunner> AgentDispatcher<R> {
    pub fn new(runner: R) -> Self {
        Self::with_window(runner, DEFAULT_IDEMPOTENCY_WINDOW)
    }

    pub fn with_window(runner: R, window: Duration) -> Self {
        Self {
            runner,
            idempotency: Cache::builder().time_to_live(window).build(),
        }
    }

    /// Runs `request` against the agent, returning its reply payloads as a
    /// live stream so a caller can format-and-deliver each block as soon as
    /// it arrives instead of waiting for the whole reply (spec.md §4.6
    /// block-buffered streaming). Yields nothing, without invoking the
    /// runner, if `request.idempotency_key` was already seen within the
    /// window (spec.md §4.6 duplicate suppression).
    ///
    /// On a mid-stream error, yields a synthetic `final` error payload
    /// (spec.md §4.6, §7 `UserSurface`) rather than propagating the error,
    /// since partial output the agent already produced should still reach
    /// the user.
    pub async fn dispatch(&self, request: &DispatchRequest) -> BoxStream<'static, ReplyPayload> {
        if let Some(key) = &request.idempotency_key
            && self.idempotency.get(key).await.is_some()
        {
            return stream::empty().boxed();
        }

        let inner = match self.runner.run(request).await {
            Ok(stream) => stream,
            Err(error) => {
                return stream::once(async move { dispatch_error_payload(error) }).boxed();
            }
        };

        let idempotency = self.idempotency.clone();
        let idempotency_key = request.idempotency_key.clone();

        stream::unfold(
            DispatchState {
                inner,
                done: false,
            },
            move |mut state| {
                let idempotency = idempotency.clone();
                let idempotency_key = idempotency_key.clone();
                async move {
                    if state.done {
                        return None;
                    }
                    let (payload, done) = match state.inner.next().await {
                        Some(Ok(payload)) => {
                            let done = payload.is_final();
                            (payload, done)
                        }
                        Some(Err(error)) => (dispatch_error_payload(error), true),
                        None => (
                            ReplyPayload::final_error(
                                "the agent ended its reply without a final marker",
                            ),
                            true,
                        ),
                    };
                    if done {
                        state.done = true;
                        if let Some(key) = idempotency_key {
                            idempotency.insert(key, ()).await;
                        }
                    }
                    Some((payload, state))
                }
            },
        )
        .boxed()
    }
}

struct DispatchState {
    inner: BoxStream<'static, Result<ReplyPayload>>,
    done: bool,
}

fn dispatch_error_payload(error: crate::Error) -> ReplyPayload {
    match error.kind() {
        ErrorKind::Transient => {
            ReplyPayload::final_error("the agent is temporarily unavailable, please try again")
        }
        ErrorKind::UserSurface => ReplyPayload::final_error(error.to_string()),
        _ => ReplyPayload::final_error("the agent could not complete this request"),
    }
}

/// Resolves the `DispatchError::RouteUnresolved` case up front, before an
/// `AgentRunner` is even invoked, e.g. when a channel/account has no agent
/// binding configured.
pub fn require_route(channel: &str, account_id: &str, route: Option<Route>) -> Result<Route> {
    route.ok_or_else(|| {
        DispatchError::RouteUnresolved {
            channel: channel.to_string(),
            account_id: account_id.to_string(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AccountId, AgentId, ChannelTag, ChatType};
    use futures::stream;

    fn route() -> Route {
        Route {
            agent_id: AgentId::from("main"),
            account_id: AccountId::from("default"),
            session_key: "k1".into(),
            main_session_key: "k1".into(),
        }
    }

    fn delivery() -> DeliveryContext {
        DeliveryContext {
            from: "u1".into(),
            to: "u1".into(),
            session_key: "k1".into(),
            account_id: AccountId::from("default"),
            chat_type: ChatType::Direct,
            conversation_label: None,
            sender_name: None,
            sender_id: "u1".into(),
            command_authorized: None,
            provider: None,
            surface: ChannelTag::from("mezon"),
            message_sid: None,
            media_path: None,
            media_type: None,
            media_url: None,
            originating_channel: ChannelTag::from("mezon"),
            originating_to: "u1".into(),
        }
    }

    struct ScriptedRunner {
        payloads: Vec<ReplyPayload>,
    }

    #[async_trait]
    impl AgentRunner for ScriptedRunner {
        async fn run(
            &self,
            _request: &DispatchRequest,
        ) -> Result<BoxStream<'static, Result<ReplyPayload>>> {
            let items: Vec<Result<ReplyPayload>> =
                self.payloads.clone().into_iter().map(Ok).collect();
            Ok(stream::iter(items).boxed())
        }
    }

    #[tokio::test]
    async fn dispatch_collects_stream_until_final() {
        let runner = ScriptedRunner {
            payloads: vec![
                ReplyPayload::partial("part 1"),
                ReplyPayload::r#final(Some("done".into()), vec![]),
            ],
        };
        let dispatcher = AgentDispatcher::new(runner);
        let request = DispatchRequest {
            route: route(),
            delivery: delivery(),
            message: Some("hello".into()),
            idempotency_key: None,
            label: None,
            spawned_by: None,
        };

        let payloads: Vec<ReplyPayload> = dispatcher.dispatch(&request).await.collect().await;
        assert_eq!(payloads.len(), 2);
        assert!(payloads.last().unwrap().is_final());
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_is_suppressed() {
        let runner = ScriptedRunner {
            payloads: vec![ReplyPayload::r#final(Some("done".into()), vec![])],
        };
        let dispatcher = AgentDispatcher::new(runner);
        let request = DispatchRequest {
            route: route(),
            delivery: delivery(),
            message: Some("hello".into()),
            idempotency_key: Some("msg-1".into()),
            label: None,
            spawned_by: None,
        };

        let first: Vec<ReplyPayload> = dispatcher.dispatch(&request).await.collect().await;
        assert_eq!(first.len(), 1);

        let second: Vec<ReplyPayload> = dispatcher.dispatch(&request).await.collect().await;
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn mid_stream_error_emits_final_error_payload() {
        struct FailingRunner;
        #[async_trait]
        impl AgentRunner for FailingRunner {
            async fn run(
                &self,
                _request: &DispatchRequest,
            ) -> Result<BoxStream<'static, Result<ReplyPayload>>> {
                let items: Vec<Result<ReplyPayload>> = vec![
                    Ok(ReplyPayload::partial("part 1")),
                    Err(DispatchError::StreamError("boom".into()).into()),
                ];
                Ok(stream::iter(items).boxed())
            }
        }

        let dispatcher = AgentDispatcher::new(FailingRunner);
        let request = DispatchRequest {
            route: route(),
            delivery: delivery(),
            message: Some("hello".into()),
            idempotency_key: None,
            label: None,
            spawned_by: None,
        };

        let payloads: Vec<ReplyPayload> = dispatcher.dispatch(&request).await.collect().await;
        let last = payloads.last().unwrap();
        assert!(last.is_final());
        assert!(last.error);
    }

    #[tokio::test]
    async fn dispatch_yields_payloads_incrementally_before_the_stream_completes() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<ReplyPayload>>();

        struct ChannelRunner {
            rx: tokio::sync::Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<Result<ReplyPayload>>>>,
        }

        #[async_trait]
        impl AgentRunner for ChannelRunner {
            async fn run(
                &self,
                _request: &DispatchRequest,
            ) -> Result<BoxStream<'static, Result<ReplyPayload>>> {
                let rx = self.rx.lock().await.take().unwrap();
                Ok(tokio_stream::wrappers::UnboundedReceiverStream::new(rx).boxed())
            }
        }

        let dispatcher = AgentDispatcher::new(ChannelRunner {
            rx: tokio::sync::Mutex::new(Some(rx)),
        });
        let request = DispatchRequest {
            route: route(),
            delivery: delivery(),
            message: Some("hello".into()),
            idempotency_key: None,
            label: None,
            spawned_by: None,
        };

        let mut payload_stream = dispatcher.dispatch(&request).await;

        tx.send(Ok(ReplyPayload::partial("part 1"))).unwrap();
        let first = payload_stream.next().await.unwrap();
        assert!(!first.is_final());

        tx.send(Ok(ReplyPayload::r#final(Some("done".into()), vec![])))
            .unwrap();
        let second = payload_stream.next().await.unwrap();
        assert!(second.is_final());

        assert!(payload_stream.next().await.is_none());
    }
}
