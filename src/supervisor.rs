//! Account Runtime Supervisor (spec.md §4.1, §4.9; C13).
//!
//! Owns the lifecycle of every running `(channel, accountId)` pair: starts
//! the plugin's `start_account` task, tracks `RuntimeStatus`, and stops a
//! task by cancelling it and force-aborting if it doesn't wind down within
//! 10 seconds. Grounded in the teacher's `ProcessEvent` broadcast pattern
//! for propagating lifecycle transitions to observers (the admin surface,
//! logging).

use crate::account::ResolvedAccount;
use crate::registry::{AccountContext, ChannelPlugin, StatusDelta};
use crate::{AccountId, ChannelTag};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const FORCE_CANCEL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Current lifecycle state of one account's connection (spec.md §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Observable status snapshot for one `(channel, accountId)` pair.
#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub channel: ChannelTag,
    pub account_id: AccountId,
    pub state: RuntimeState,
    pub last_inbound_at: Option<i64>,
    pub last_outbound_at: Option<i64>,
    pub last_error: Option<String>,
}

impl RuntimeStatus {
    fn new(channel: ChannelTag, account_id: AccountId) -> Self {
        Self {
            channel,
            account_id,
            state: RuntimeState::Starting,
            last_inbound_at: None,
            last_outbound_at: None,
            last_error: None,
        }
    }

    fn apply(&mut self, delta: StatusDelta) {
        if let Some(t) = delta.last_inbound_at {
            self.last_inbound_at = Some(t);
        }
        if let Some(t) = delta.last_outbound_at {
            self.last_outbound_at = Some(t);
        }
        if let Some(err) = delta.last_error {
            self.last_error = Some(err);
        }
        if let Some(running) = delta.running {
            self.state = if running {
                RuntimeState::Running
            } else {
                RuntimeState::Stopped
            };
        }
    }
}

/// A lifecycle event broadcast to observers whenever a tracked account's
/// status changes (spec.md §4.9, grounded in the teacher's `ProcessEvent`).
#[derive(Debug, Clone)]
pub struct GatewayEvent {
    pub status: RuntimeStatus,
}

struct Running {
    abort: CancellationToken,
    handle: JoinHandle<()>,
    status: RuntimeStatus,
}

/// Supervises every running account task across all registered channel
/// plugins.
pub struct AccountSupervisor {
    running: Mutex<HashMap<(ChannelTag, AccountId), Running>>,
    events_tx: broadcast::Sender<GatewayEvent>,
}

impl AccountSupervisor {
    pub fn new() -> Self {
        let (events_tx, _rx) = broadcast::channel(256);
        Self {
            running: Mutex::new(HashMap::new()),
            events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events_tx.subscribe()
    }

    /// Starts `account` on `plugin`, wiring up status reporting and an
    /// inbound channel the caller drains (e.g. into the policy gate).
    pub async fn start(
        self: &Arc<Self>,
        plugin: Arc<dyn ChannelPlugin>,
        account_id: AccountId,
        account: ResolvedAccount,
        inbound_tx: mpsc::Sender<crate::Envelope>,
    ) {
        let channel: ChannelTag = ChannelTag::from(plugin.id());
        let key = (channel.clone(), account_id.clone());
        let abort = CancellationToken::new();
        let (status_tx, mut status_rx) = mpsc::channel(64);

        let ctx = AccountContext {
            account_id: account_id.clone(),
            account,
            abort: abort.clone(),
            inbound_tx,
            status_tx,
        };

        let this = Arc::clone(self);
        let key_for_task = key.clone();
        let plugin_for_task = Arc::clone(&plugin);
        let handle = tokio::spawn(async move {
            this.mark_running(&key_for_task).await;
            if let Err(error) = plugin_for_task.start_account(ctx).await {
                error!(channel = %key_for_task.0, account_id = %key_for_task.1, %error, "account task exited with error");
                this.mark_failed(&key_for_task, error.to_string()).await;
            } else {
                this.mark_stopped(&key_for_task).await;
            }
        });

        let this = Arc::clone(self);
        let key_for_status = key.clone();
        tokio::spawn(async move {
            while let Some(delta) = status_rx.recv().await {
                this.apply_status_delta(&key_for_status, delta).await;
            }
        });

        let mut running = self.running.lock().await;
        running.insert(
            key,
            Running {
                abort,
                handle,
                status: RuntimeStatus::new(channel, account_id),
            },
        );
    }

    /// Cancels the account's task, waiting up to 10 seconds before
    /// force-aborting the join handle (spec.md §4.9).
    pub async fn stop(&self, channel: &ChannelTag, account_id: &AccountId) {
        let key = (channel.clone(), account_id.clone());
        let entry = {
            let mut running = self.running.lock().await;
            running.remove(&key)
        };

        let Some(entry) = entry else { return };
        entry.abort.cancel();

        match tokio::time::timeout(FORCE_CANCEL_TIMEOUT, entry.handle).await {
            Ok(_) => info!(%channel, %account_id, "account task stopped"),
            Err(_) => {
                warn!(%channel, %account_id, "account task did not stop in time, task remains detached");
            }
        }
    }

    pub async fn status(&self, channel: &ChannelTag, account_id: &AccountId) -> Option<RuntimeStatus> {
        let running = self.running.lock().await;
        running
            .get(&(channel.clone(), account_id.clone()))
            .map(|r| r.status.clone())
    }

    pub async fn all_statuses(&self) -> Vec<RuntimeStatus> {
        let running = self.running.lock().await;
        running.values().map(|r| r.status.clone()).collect()
    }

    async fn mark_running(&self, key: &(ChannelTag, AccountId)) {
        self.mutate_status(key, |s| s.state = RuntimeState::Running).await;
    }

    async fn mark_stopped(&self, key: &(ChannelTag, AccountId)) {
        self.mutate_status(key, |s| s.state = RuntimeState::Stopped).await;
    }

    async fn mark_failed(&self, key: &(ChannelTag, AccountId), error: String) {
        self.mutate_status(key, |s| {
            s.state = RuntimeState::Failed;
            s.last_error = Some(error.clone());
        })
        .await;
    }

    async fn apply_status_delta(&self, key: &(ChannelTag, AccountId), delta: StatusDelta) {
        self.mutate_status(key, move |s| s.apply(delta)).await;
    }

    async fn mutate_status(&self, key: &(ChannelTag, AccountId), f: impl FnOnce(&mut RuntimeStatus)) {
        let mut running = self.running.lock().await;
        if let Some(entry) = running.get_mut(key) {
            f(&mut entry.status);
            let _ = self.events_tx.send(GatewayEvent {
                status: entry.status.clone(),
            });
        }
    }
}

impl Default for AccountSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
