//! Media Fetcher (spec.md §4.7, §5; C8).
//!
//! Downloads inbound attachments to local disk under the account's
//! `mediaMaxMb` cap, with a bounded fetch timeout, so the agent layer can
//! read media from a plain filesystem path rather than re-fetching a
//! transport URL.

use crate::error::{ChannelError, Result};
use crate::Attachment;

use std::path::{Path, PathBuf};
use std::time::Duration;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// A fetched attachment, saved to `path` with its resolved MIME type.
#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub path: PathBuf,
    pub mime: String,
    pub size: u64,
}

/// Fetches attachments referenced by URL, enforcing `media_max_mb` and a
/// fixed 30-second timeout per spec.md §5.
pub struct MediaFetcher {
    client: reqwest::Client,
    dest_dir: PathBuf,
}

impl MediaFetcher {
    pub fn new(dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .expect("reqwest client should build with static config"),
            dest_dir: dest_dir.into(),
        }
    }

    /// Downloads `attachment` if it is URL-addressable, rejecting payloads
    /// larger than `media_max_mb`. Attachments that only carry an opaque
    /// platform-local id (no fetchable URL) are the channel plugin's
    /// responsibility to resolve before calling this; such cases return
    /// `ChannelError::Transport`.
    pub async fn fetch(&self, attachment: &Attachment, media_max_mb: u64) -> Result<FetchedMedia> {
        if !looks_like_url(&attachment.url_or_id) {
            return Err(ChannelError::Transport(format!(
                "attachment {} is not URL-addressable; plugin must resolve it first",
                attachment.url_or_id
            ))
            .into());
        }

        let response = self
            .client
            .get(&attachment.url_or_id)
            .send()
            .await
            .map_err(|e| ChannelError::Transport(format!("media fetch failed: {e}")))?;

        if let Some(len) = response.content_length()
            && len > media_max_mb * 1024 * 1024
        {
            return Err(ChannelError::Transport(format!(
                "attachment exceeds {media_max_mb}MB cap ({len} bytes)"
            ))
            .into());
        }

        let mime = attachment.mime.clone();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ChannelError::Transport(format!("media read failed: {e}")))?;

        if bytes.len() as u64 > media_max_mb * 1024 * 1024 {
            return Err(ChannelError::Transport(format!(
                "attachment exceeds {media_max_mb}MB cap ({} bytes)",
                bytes.len()
            ))
            .into());
        }

        tokio::fs::create_dir_all(&self.dest_dir)
            .await
            .map_err(|e| ChannelError::Transport(format!("media dest dir: {e}")))?;

        let extension = extension_for_mime(&mime);
        let file_name = format!("{}{extension}", uuid::Uuid::new_v4());
        let path = self.dest_dir.join(file_name);
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| ChannelError::Transport(format!("media write failed: {e}")))?;

        Ok(FetchedMedia {
            path,
            mime,
            size: bytes.len() as u64,
        })
    }
}

fn looks_like_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/png" => ".png",
        "image/jpeg" => ".jpg",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "audio/mpeg" => ".mp3",
        "audio/ogg" => ".ogg",
        "video/mp4" => ".mp4",
        "application/pdf" => ".pdf",
        _ => "",
    }
}

/// Whether `path`'s extension is recognized by `extension_for_mime`, for
/// callers building `DeliveryContext.media_type` off an existing file.
pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("png") => Some("image/png"),
        Some("jpg") | Some("jpeg") => Some("image/jpeg"),
        Some("gif") => Some("image/gif"),
        Some("webp") => Some("image/webp"),
        Some("mp3") => Some("audio/mpeg"),
        Some("ogg") => Some("audio/ogg"),
        Some("mp4") => Some("video/mp4"),
        Some("pdf") => Some("application/pdf"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_url_attachments_without_network_access() {
        // Synchronous sanity check on the guard clause; the network path
        // itself is exercised by integration-style tests elsewhere.
        assert!(!looks_like_url("platform-local-id-123"));
        assert!(looks_like_url("https://example.com/a.png"));
    }

    #[test]
    fn extension_and_mime_roundtrip_known_types() {
        assert_eq!(extension_for_mime("image/png"), ".png");
        assert_eq!(mime_for_path(Path::new("foo.png")), Some("image/png"));
    }
}
