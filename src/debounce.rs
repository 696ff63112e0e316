//! Inbound Debouncer (spec.md §4.3; C5).
//!
//! Coalesces bursts of rapid-fire messages from the same conversation into
//! a single flush, grounded in the teacher's channel-level retrigger
//! coalescing (`RETRIGGER_DEBOUNCE_MS` / `MAX_RETRIGGERS_PER_TURN` in
//! `agent/channel.rs`), adapted here into a general-purpose per-key timer.

use crate::Envelope;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Duration;

/// Identifies one coalescing queue: a single conversation from a single
/// sender on one account (spec.md §4.3 key).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DebounceKey {
    pub channel: String,
    pub account_id: String,
    pub conversation_id: String,
    pub sender_peer_id: String,
}

impl DebounceKey {
    pub fn from_envelope(envelope: &Envelope) -> Self {
        let peer = envelope.peer();
        Self {
            channel: envelope.channel.to_string(),
            account_id: envelope.account_id.to_string(),
            conversation_id: peer.id().to_string(),
            sender_peer_id: envelope.sender.id.clone(),
        }
    }
}

/// Returns true when `envelope` must bypass debouncing entirely (spec.md
/// §4.3): it carries media, looks like a control command, or has no text
/// to merge.
pub fn skip_debounce(envelope: &Envelope, is_control_command: impl Fn(&str) -> bool) -> bool {
    if envelope.has_media() {
        return true;
    }
    match &envelope.text {
        None => true,
        Some(text) if text.trim().is_empty() => true,
        Some(text) => is_control_command(text),
    }
}

/// Merges a queued burst of envelopes into one (spec.md §4.3 flush
/// semantics): texts are concatenated with newlines in arrival order, and
/// every other field is taken from the last entry in the burst.
pub fn merge_envelopes(mut queued: Vec<Envelope>) -> Envelope {
    assert!(!queued.is_empty(), "merge_envelopes requires at least one envelope");
    let last = queued.pop().expect("checked non-empty above");

    let mut texts: Vec<String> = queued
        .iter()
        .filter_map(|e| e.text.clone())
        .filter(|t| !t.trim().is_empty())
        .collect();
    if let Some(last_text) = &last.text {
        if !last_text.trim().is_empty() {
            texts.push(last_text.clone());
        }
    }

    let merged_text = if texts.is_empty() { None } else { Some(texts.join("\n")) };

    Envelope {
        text: merged_text,
        ..last
    }
}

type FlushHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

struct QueueState {
    buffered: Vec<Envelope>,
    generation: u64,
}

/// Coalesces bursts of inbound messages per `DebounceKey` with a
/// configurable window, then invokes a flush handler with the merged
/// envelope (spec.md §4.3).
///
/// Each key has a single active timer at a time (single-writer-per-key
/// guarantee): a new arrival for a key that already has a pending timer
/// resets that timer rather than starting a second one, implemented via a
/// generation counter checked after the sleep completes.
pub struct InboundDebouncer {
    queues: Mutex<HashMap<DebounceKey, QueueState>>,
}

impl InboundDebouncer {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueues `envelope` under `key`, (re)starting the debounce timer.
    /// When the timer fires without being preempted by a later arrival,
    /// `on_flush` runs once with the merged envelope for that burst.
    pub async fn push(
        self: &Arc<Self>,
        key: DebounceKey,
        envelope: Envelope,
        window: Duration,
        on_flush: FlushHandler,
    ) {
        let generation = {
            let mut queues = self.queues.lock().await;
            let state = queues.entry(key.clone()).or_insert_with(|| QueueState {
                buffered: Vec::new(),
                generation: 0,
            });
            state.buffered.push(envelope);
            state.generation += 1;
            state.generation
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            this.maybe_flush(key, generation, on_flush).await;
        });
    }

    async fn maybe_flush(&self, key: DebounceKey, generation: u64, on_flush: FlushHandler) {
        let burst = {
            let mut queues = self.queues.lock().await;
            let Some(state) = queues.get_mut(&key) else {
                return;
            };
            if state.generation != generation {
                // A later arrival reset the timer; this firing is stale.
                return;
            }
            let burst = std::mem::take(&mut state.buffered);
            queues.remove(&key);
            burst
        };

        if burst.is_empty() {
            return;
        }
        let merged = merge_envelopes(burst);
        on_flush(merged);
    }
}

impl Default for InboundDebouncer {
    fn default() -> Self {
        Self::new()
    }
}

/// Channel-style façade over `InboundDebouncer` for callers that prefer an
/// mpsc handoff instead of a closure callback.
pub struct DebounceChannel {
    debouncer: Arc<InboundDebouncer>,
    tx: mpsc::Sender<Envelope>,
}

impl DebounceChannel {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            Self {
                debouncer: Arc::new(InboundDebouncer::new()),
                tx,
            },
            rx,
        )
    }

    pub async fn push(&self, key: DebounceKey, envelope: Envelope, window: Duration) {
        let tx = self.tx.clone();
        self.debouncer
            .push(
                key,
                envelope,
                window,
                Arc::new(move |merged| {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let _ = tx.send(merged).await;
                    });
                }),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Attachment, ChatType, Sender};

    fn make_envelope(text: &str, ts: i64) -> Envelope {
        Envelope {
            channel: "mezon".into(),
            account_id: "default".into(),
            message_id: Some(format!("m{ts}")),
            timestamp: ts,
            sender: Sender {
                id: "u1".into(),
                display_name: None,
            },
            chat_type: ChatType::Direct,
            group_id: None,
            group_name: None,
            text: Some(text.to_string()),
            attachments: Vec::new(),
            raw: serde_json::Value::Null,
        }
    }

    #[test]
    fn skip_debounce_true_for_media() {
        let mut envelope = make_envelope("hello", 1);
        envelope.attachments.push(Attachment {
            url_or_id: "x".into(),
            mime: "image/png".into(),
            size: None,
        });
        assert!(skip_debounce(&envelope, |_| false));
    }

    #[test]
    fn skip_debounce_true_for_control_command() {
        let envelope = make_envelope("/reset", 1);
        assert!(skip_debounce(&envelope, |t| t.starts_with('/')));
    }

    #[test]
    fn skip_debounce_false_for_plain_text() {
        let envelope = make_envelope("hello", 1);
        assert!(!skip_debounce(&envelope, |_| false));
    }

    #[test]
    fn merge_concatenates_text_in_order_and_keeps_last_nontext_fields() {
        let mut e1 = make_envelope("first", 1);
        let mut e2 = make_envelope("second", 2);
        e2.group_name = Some("kept".into());
        e1.group_name = Some("dropped".into());

        let merged = merge_envelopes(vec![e1, e2]);
        assert_eq!(merged.text.as_deref(), Some("first\nsecond"));
        assert_eq!(merged.group_name.as_deref(), Some("kept"));
        assert_eq!(merged.timestamp, 2);
    }

    #[tokio::test]
    async fn flush_fires_once_after_window_with_merged_text() {
        let debouncer = Arc::new(InboundDebouncer::new());
        let key = DebounceKey {
            channel: "mezon".into(),
            account_id: "default".into(),
            conversation_id: "u1".into(),
            sender_peer_id: "u1".into(),
        };

        let (tx, mut rx) = mpsc::channel::<Envelope>(4);
        let handler: FlushHandler = Arc::new(move |merged| {
            let tx = tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(merged).await;
            });
        });

        debouncer
            .push(key.clone(), make_envelope("a", 1), Duration::from_millis(20), handler.clone())
            .await;
        debouncer
            .push(key.clone(), make_envelope("b", 2), Duration::from_millis(20), handler)
            .await;

        let flushed = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("should flush within timeout")
            .expect("channel should yield a value");

        assert_eq!(flushed.text.as_deref(), Some("a\nb"));
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .is_err(), "should not flush a second time for the same burst");
    }
}
