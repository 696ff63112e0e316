//! Session Store (spec.md §4.5, §6; C7).
//!
//! A hash-tagged JSON record store with optimistic concurrency: every read
//! returns a content hash alongside the record, and every write must quote
//! the hash it read to succeed, retried with jittered backoff on conflict
//! (I5, I6). Grounded in the teacher's `TaskStore::create` retry-on-UNIQUE
//! pattern, adapted from a SQL unique-constraint race to a JSON-file CAS
//! race since this store has no database underneath it.

use crate::error::{Result, StoreError};
use crate::SessionEntry;

use moka::future::Cache;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const MAX_CAS_RETRIES: u32 = 5;
const CAS_BACKOFF_BASE_MS: u64 = 20;

/// Content hash of a session entry's serialized form, truncated to 16
/// bytes hex per spec.md §6 (`hash: string`).
pub fn content_hash(entry: &SessionEntry) -> Result<String> {
    let bytes = serde_json::to_vec(entry)
        .map_err(|e| StoreError::Other(anyhow::anyhow!("serialize session entry: {e}")))?;
    let digest = Sha256::digest(&bytes);
    Ok(hex::encode(&digest[..16]))
}

/// A session entry paired with the hash it was read at, so callers can
/// `patch` against exactly this version (spec.md §6).
#[derive(Debug, Clone)]
pub struct Hashed<T> {
    pub value: T,
    pub hash: String,
}

/// File-backed session store keyed by `session_key`. One JSON file per
/// store path holds the whole map, written atomically (write-to-temp +
/// rename) so readers never observe a partial write.
pub struct SessionStore {
    path: PathBuf,
    write_lock: Mutex<()>,
    cache: Cache<String, SessionEntry>,
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct StoreFile {
    #[serde(default)]
    entries: std::collections::HashMap<String, SessionEntry>,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_idle(Duration::from_secs(3600))
                .build(),
        }
    }

    async fn read_file(&self) -> Result<StoreFile> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                if bytes.is_empty() {
                    return Ok(StoreFile::default());
                }
                serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Read(format!("malformed session store: {e}")).into())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreFile::default()),
            Err(e) => Err(StoreError::Read(e.to_string()).into()),
        }
    }

    async fn write_file(&self, file: &StoreFile) -> Result<()> {
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
                .unwrap_or("sessions"),
            uuid::Uuid::new_v4()
        ));

        let bytes = serde_json::to_vec_pretty(file)
            .map_err(|e| StoreError::Write(format!("serialize session store: {e}")))?;
        tokio::fs::write(&tmp_path, &bytes)
            .await
            .map_err(|e| StoreError::Write(e.to_string()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| StoreError::Write(e.to_string()))?;
        Ok(())
    }

    /// Reads the current entry for `session_key`, or `None` if absent. The
    /// read-through cache is populated on read and invalidated on write, so
    /// repeat reads within the same process skip the filesystem.
    pub async fn read(&self, session_key: &str) -> Result<Option<Hashed<SessionEntry>>> {
        if let Some(cached) = self.cache.get(session_key).await {
            let hash = content_hash(&cached)?;
            return Ok(Some(Hashed { value: cached, hash }));
        }

        let file = self.read_file().await?;
        match file.entries.get(session_key) {
            Some(entry) => {
                self.cache.insert(session_key.to_string(), entry.clone()).await;
                let hash = content_hash(entry)?;
                Ok(Some(Hashed {
                    value: entry.clone(),
                    hash,
                }))
            }
            None => Ok(None),
        }
    }

    /// Applies `mutator` to the current entry for `session_key` (creating
    /// one via `make_default` if none exists yet), retrying on CAS
    /// conflict up to `MAX_CAS_RETRIES` times with jittered backoff
    /// (spec.md I5, I6; grounded in the teacher's `TaskStore::create`
    /// retry-on-UNIQUE-violation loop).
    ///
    /// `mutator` receives a mutable reference to the working copy; it must
    /// not change `session_key` or `session_id`. `updated_at` is always set
    /// to `now_ms` after the mutator runs, monotonically (I6): if the
    /// existing record's `updated_at` is already >= `now_ms`, it is bumped
    /// by one millisecond instead of going backwards.
    pub async fn update<F>(
        &self,
        session_key: &str,
        now_ms: i64,
        make_default: impl Fn() -> SessionEntry,
        mut mutator: F,
    ) -> Result<SessionEntry>
    where
        F: FnMut(&mut SessionEntry),
    {
        let mut attempt = 0;
        loop {
            let _guard = self.write_lock.lock().await;
            let mut file = self.read_file().await?;
            let mut entry = file
                .entries
                .get(session_key)
                .cloned()
                .unwrap_or_else(|| make_default());
            let expected_hash = content_hash(&entry)?;

            mutator(&mut entry);
            entry.updated_at = if entry.updated_at >= now_ms {
                entry.updated_at + 1
            } else {
                now_ms
            };

            let current_hash = file
                .entries
                .get(session_key)
                .map(content_hash)
                .transpose()?
                .unwrap_or_else(|| expected_hash.clone());

            if current_hash != expected_hash {
                drop(_guard);
                attempt += 1;
                if attempt >= MAX_CAS_RETRIES {
                    return Err(StoreError::Conflict {
                        expected: expected_hash,
                        actual: current_hash,
                    }
                    .into());
                }
                self.backoff(attempt).await;
                continue;
            }

            file.entries.insert(session_key.to_string(), entry.clone());
            self.write_file(&file).await?;
            self.cache.insert(session_key.to_string(), entry.clone()).await;
            return Ok(entry);
        }
    }

    /// Applies a sparse JSON patch against a specific previously-read hash
    /// (spec.md §6 `patch(baseHash, partial)`). Fails with
    /// `StoreError::Conflict` immediately (no retry) if the stored entry's
    /// current hash no longer matches `base_hash` -- callers that want
    /// retry-on-conflict should use `update` instead, which re-reads.
    pub async fn patch(
        &self,
        session_key: &str,
        base_hash: &str,
        partial: serde_json::Value,
        now_ms: i64,
    ) -> Result<SessionEntry> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.read_file().await?;
        let entry = file
            .entries
            .get(session_key)
            .ok_or_else(|| StoreError::NotFound(session_key.to_string()))?;

        let actual_hash = content_hash(entry)?;
        if actual_hash != base_hash {
            return Err(StoreError::Conflict {
                expected: base_hash.to_string(),
                actual: actual_hash,
            }
            .into());
        }

        let mut merged = serde_json::to_value(entry)
            .map_err(|e| StoreError::Other(anyhow::anyhow!("serialize entry for patch: {e}")))?;
        merge_json(&mut merged, &partial);
        let mut updated: SessionEntry = serde_json::from_value(merged)
            .map_err(|e| StoreError::Other(anyhow::anyhow!("deserialize patched entry: {e}")))?;
        updated.updated_at = now_ms.max(entry.updated_at + 1);

        file.entries.insert(session_key.to_string(), updated.clone());
        self.write_file(&file).await?;
        self.cache.insert(session_key.to_string(), updated.clone()).await;
        Ok(updated)
    }

    async fn backoff(&self, attempt: u32) {
        let jitter_ms = rand::rng().random_range(0..CAS_BACKOFF_BASE_MS);
        let delay = Duration::from_millis(CAS_BACKOFF_BASE_MS * attempt as u64 + jitter_ms);
        tokio::time::sleep(delay).await;
    }
}

fn merge_json(base: &mut serde_json::Value, patch: &serde_json::Value) {
    if let (Some(base_obj), Some(patch_obj)) = (base.as_object_mut(), patch.as_object()) {
        for (key, value) in patch_obj {
            base_obj.insert(key.clone(), value.clone());
        }
    }
}

/// Shared handle into a `SessionStore`.
pub type SharedSessionStore = Arc<SessionStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn default_entry(session_key: &str) -> SessionEntry {
        SessionEntry::new(session_key, crate::AgentId::from("main"), 0)
    }

    #[tokio::test]
    async fn update_creates_then_mutates_preserving_untouched_fields() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions.json"));

        store
            .update(
                "k1",
                1000,
                || default_entry("k1"),
                |entry| entry.model = Some("claude".into()),
            )
            .await
            .unwrap();

        let after_second = store
            .update(
                "k1",
                2000,
                || default_entry("k1"),
                |entry| entry.thinking_level = Some("high".into()),
            )
            .await
            .unwrap();

        // Field preservation across concurrent-style updates (I5).
        assert_eq!(after_second.model.as_deref(), Some("claude"));
        assert_eq!(after_second.thinking_level.as_deref(), Some("high"));
    }

    #[tokio::test]
    async fn updated_at_is_monotonic_even_with_non_increasing_now() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions.json"));

        let first = store
            .update("k1", 5000, || default_entry("k1"), |_| {})
            .await
            .unwrap();
        let second = store
            .update("k1", 5000, || default_entry("k1"), |_| {})
            .await
            .unwrap();

        assert!(second.updated_at > first.updated_at);
    }

    #[tokio::test]
    async fn patch_conflicts_on_stale_hash() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions.json"));

        store
            .update("k1", 1000, || default_entry("k1"), |_| {})
            .await
            .unwrap();
        let read = store.read("k1").await.unwrap().unwrap();

        // Mutate again so the stored hash moves on.
        store
            .update("k1", 2000, || default_entry("k1"), |e| e.model = Some("x".into()))
            .await
            .unwrap();

        let result = store
            .patch("k1", &read.hash, serde_json::json!({"model": "y"}), 3000)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn patch_succeeds_against_current_hash() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions.json"));

        store
            .update("k1", 1000, || default_entry("k1"), |_| {})
            .await
            .unwrap();
        let read = store.read("k1").await.unwrap().unwrap();

        let patched = store
            .patch("k1", &read.hash, serde_json::json!({"model": "claude-x"}), 2000)
            .await
            .unwrap();

        assert_eq!(patched.model.as_deref(), Some("claude-x"));
    }

    #[test]
    fn content_hash_is_16_bytes_hex() {
        let entry = default_entry("k1");
        let hash = content_hash(&entry).unwrap();
        assert_eq!(hash.len(), 32); // 16 bytes hex-encoded
    }
}
