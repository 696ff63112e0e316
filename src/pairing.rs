//! Durable Pairing Store (spec.md §4.4; C4).
//!
//! Persists `(channel, id) -> {code, createdAt, approvedAt}` pairing
//! requests and a durable per-channel allowlist, grounded in the teacher's
//! atomic write-to-temp-then-rename pattern used for its own on-disk JSON
//! records.

use crate::error::{Result, StoreError};
use crate::{ChannelTag, PairingRequest};

use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// On-disk shape of the pairing store file.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct PairingFile {
    /// Keyed by `"{channel}:{id}"`.
    #[serde(default)]
    requests: HashMap<String, PairingRequest>,
    /// Keyed by channel, each an approved-id allowlist.
    #[serde(default)]
    allow_from: HashMap<String, Vec<String>>,
}

fn request_key(channel: &str, id: &str) -> String {
    format!("{channel}:{id}")
}

/// Outcome of `upsert_pairing_request` (spec.md §4.4
/// `upsertPairingRequest({channel, id, meta}) -> {code, created}`).
#[derive(Debug, Clone)]
pub struct PairingUpsert {
    pub request: PairingRequest,
    /// True only the first time this `(channel, id)` was seen; a caller
    /// uses this to guarantee exactly one pairing reply is sent (P9).
    pub created: bool,
}

/// A durable, file-backed pairing request store. One store instance is
/// shared across all channels and accounts; concurrent access within the
/// process is serialized by an internal mutex, and cross-process safety
/// comes from atomic temp-file-then-rename writes (spec.md I2-adjacent
/// durability requirement).
pub struct PairingStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PairingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read(&self) -> Result<PairingFile> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                if bytes.is_empty() {
                    return Ok(PairingFile::default());
                }
                serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Read(format!("malformed pairing store: {e}")).into())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PairingFile::default()),
            Err(e) => Err(StoreError::Read(e.to_string()).into()),
        }
    }

    async fn write(&self, file: &PairingFile) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::Write(e.to_string()))?;

        let tmp_path = parent.join(format!(
            ".{}.tmp.{}",
            self.path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("pairing"),
            uuid::Uuid::new_v4()
        ));

        let bytes = serde_json::to_vec_pretty(file)
            .map_err(|e| StoreError::Write(format!("serialize pairing store: {e}")))?;
        tokio::fs::write(&tmp_path, &bytes)
            .await
            .map_err(|e| StoreError::Write(e.to_string()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| StoreError::Write(e.to_string()))?;
        Ok(())
    }

    /// Generates a fresh numeric pairing code and upserts a pending request
    /// for `(channel, id)`. If a pending (unapproved) request already
    /// exists, its code is reused rather than regenerated, so repeated DMs
    /// from the same unknown sender see a stable code (spec.md §4.4,
    /// single-reply guarantee P9 depends on this being idempotent for the
    /// unapproved case).
    pub async fn upsert_pairing_request(
        &self,
        channel: &ChannelTag,
        id: &str,
        now_ms: i64,
        meta: Option<serde_json::Value>,
    ) -> Result<PairingUpsert> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        let key = request_key(channel, id);

        if let Some(existing) = file.requests.get(&key) {
            if existing.approved_at.is_none() {
                return Ok(PairingUpsert {
                    request: existing.clone(),
                    created: false,
                });
            }
        }

        let request = PairingRequest {
            channel: channel.clone(),
            id: id.to_string(),
            code: generate_code(),
            created_at: now_ms,
            approved_at: None,
            meta,
        };
        file.requests.insert(key, request.clone());
        self.write(&file).await?;
        Ok(PairingUpsert {
            request,
            created: true,
        })
    }

    /// Marks a pending request approved and adds `id` to the channel's
    /// durable allowlist. Returns `StoreError::NotFound` if no such request
    /// exists.
    pub async fn approve(&self, channel: &ChannelTag, id: &str, now_ms: i64) -> Result<PairingRequest> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        let key = request_key(channel, id);

        let request = file
            .requests
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        request.approved_at = Some(now_ms);
        let approved = request.clone();

        let allow_list = file.allow_from.entry(channel.to_string()).or_default();
        if !allow_list.iter().any(|entry| entry == id) {
            allow_list.push(id.to_string());
        }

        self.write(&file).await?;
        Ok(approved)
    }

    /// Approves by matching `code` against any pending request on `channel`,
    /// for admin-side "approve by code" flows. Returns `None` if no pending
    /// request on this channel carries that code.
    pub async fn approve_by_code(
        &self,
        channel: &ChannelTag,
        code: &str,
        now_ms: i64,
    ) -> Result<Option<PairingRequest>> {
        let id = {
            let _guard = self.lock.lock().await;
            let file = self.read().await?;
            file.requests
                .values()
                .find(|r| r.channel.as_ref() == channel.as_ref() && r.code == code && r.approved_at.is_none())
                .map(|r| r.id.clone())
        };

        match id {
            Some(id) => Ok(Some(self.approve(channel, &id, now_ms).await?)),
            None => Ok(None),
        }
    }

    /// Reads the effective durable allowlist for a channel (spec.md §4.2:
    /// "effective allowFrom = configured allowFrom ∪ durable pairing
    /// allowlist").
    pub async fn read_allow_from_store(&self, channel: &ChannelTag) -> Result<Vec<String>> {
        let file = self.read().await?;
        Ok(file.allow_from.get(channel.as_ref()).cloned().unwrap_or_default())
    }

    /// Deletes a pending or approved request, without touching the durable
    /// allowlist (used to let an admin revoke and re-trigger pairing).
    pub async fn delete_request(&self, channel: &ChannelTag, id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        file.requests.remove(&request_key(channel, id));
        self.write(&file).await?;
        Ok(())
    }
}

fn generate_code() -> String {
    let mut rng = rand::rng();
    format!("{:06}", rng.random_range(0..1_000_000u32))
}

/// Builds the per-channel pairing reply text sent back to an unpaired DM
/// sender (spec.md §4.4, S1: `buildPairingReply("mezon", "Your Mezon user
/// id: 1833682843671203840", <code>)`).
pub fn build_pairing_reply(channel: &str, id_line: &str, code: &str) -> String {
    format!(
        "This is a private assistant. To request access:\n\n{id_line}\nPairing code: {code}\n\nShare this code with the operator to get approved."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn channel(name: &str) -> ChannelTag {
        ChannelTag::from(name)
    }

    #[tokio::test]
    async fn upsert_is_idempotent_while_pending() {
        let dir = tempdir().unwrap();
        let store = PairingStore::new(dir.path().join("pairing.json"));
        let ch = channel("mezon");

        let first = store.upsert_pairing_request(&ch, "u1", 1000, None).await.unwrap();
        let second = store.upsert_pairing_request(&ch, "u1", 2000, None).await.unwrap();

        assert_eq!(first.request.code, second.request.code);
        assert_eq!(second.request.created_at, 1000);
        assert!(first.created);
        assert!(!second.created, "second upsert for a still-pending request must not report created");
    }

    #[tokio::test]
    async fn approve_adds_to_durable_allowlist() {
        let dir = tempdir().unwrap();
        let store = PairingStore::new(dir.path().join("pairing.json"));
        let ch = channel("mezon");

        store.upsert_pairing_request(&ch, "u1", 1000, None).await.unwrap();
        store.approve(&ch, "u1", 2000).await.unwrap();

        let allow_from = store.read_allow_from_store(&ch).await.unwrap();
        assert_eq!(allow_from, vec!["u1".to_string()]);
    }

    #[tokio::test]
    async fn approve_unknown_request_errors() {
        let dir = tempdir().unwrap();
        let store = PairingStore::new(dir.path().join("pairing.json"));
        let ch = channel("mezon");

        let result = store.approve(&ch, "ghost", 2000).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn approve_by_code_matches_pending_code() {
        let dir = tempdir().unwrap();
        let store = PairingStore::new(dir.path().join("pairing.json"));
        let ch = channel("mezon");

        let request = store.upsert_pairing_request(&ch, "u1", 1000, None).await.unwrap().request;
        let approved = store
            .approve_by_code(&ch, &request.code, 2000)
            .await
            .unwrap()
            .expect("code should match");

        assert_eq!(approved.id, "u1");
        assert!(approved.approved_at.is_some());
    }

    #[test]
    fn pairing_reply_matches_scenario_shape() {
        let reply = build_pairing_reply(
            "mezon",
            "Your Mezon user id: 1833682843671203840",
            "482913",
        );
        assert!(reply.contains("Your Mezon user id: 1833682843671203840"));
        assert!(reply.contains("482913"));
    }
}
