//! Reply Block Buffer (spec.md §4.6; C10).
//!
//! Segments a stream of text deltas into discrete blocks at blank-line,
//! code-fence, and heading boundaries, emitting a `partial` payload per
//! completed block and exactly one `final` at stream end (P5). When a
//! channel plugin doesn't support block streaming, buffers everything and
//! releases it as a single `final` instead.

use crate::{ReplyMarker, ReplyPayload};

/// Accumulates streamed text and segments it into blocks.
pub struct BlockBuffer {
    /// Whether the target surface supports incremental `partial` sends
    /// (spec.md §6 `capabilities.blockStreaming`). When false, everything
    /// is held until `finish`.
    block_streaming: bool,
    pending: String,
    /// Media urls carried by deltas that haven't completed a block yet;
    /// attached to whichever block completes next (spec.md §4.6 "media urls
    /// produced by the agent are emitted with the block in which they
    /// appear" -- not only with the terminal payload).
    pending_media: Vec<String>,
    emitted_any: bool,
    in_code_fence: bool,
}

impl BlockBuffer {
    pub fn new(block_streaming: bool) -> Self {
        Self {
            block_streaming,
            pending: String::new(),
            pending_media: Vec::new(),
            emitted_any: false,
            in_code_fence: false,
        }
    }

    /// Feeds a text delta and any media urls carried alongside it in,
    /// returning any complete blocks ready to emit as `partial` payloads.
    /// Returns an empty vec when `block_streaming` is false, or when no
    /// boundary has been reached yet; the media is held until the block it
    /// arrived with is emitted.
    pub fn push(&mut self, delta: &str, media_urls: Vec<String>) -> Vec<ReplyPayload> {
        self.pending.push_str(delta);
        self.pending_media.extend(media_urls);
        if !self.block_streaming {
            return Vec::new();
        }
        self.drain_complete_blocks()
    }

    /// Finalizes the stream: emits everything still buffered as the
    /// `final` payload (P5: exactly one `final`, regardless of how many
    /// `partial`s preceded it), plus `media_urls` and any media still
    /// pending from deltas that never completed a block of their own.
    pub fn finish(mut self, media_urls: Vec<String>) -> Vec<ReplyPayload> {
        let mut out = if self.block_streaming {
            self.drain_complete_blocks()
        } else {
            Vec::new()
        };

        let remainder = self.pending.trim();
        let final_text = if remainder.is_empty() {
            None
        } else {
            Some(remainder.to_string())
        };

        let mut final_media = std::mem::take(&mut self.pending_media);
        final_media.extend(media_urls);

        out.push(ReplyPayload {
            text: final_text,
            media_urls: final_media,
            marker: ReplyMarker::Final,
            error: false,
        });
        out
    }

    fn drain_complete_blocks(&mut self) -> Vec<ReplyPayload> {
        let mut emitted = Vec::new();
        loop {
            match find_boundary(&self.pending, &mut self.in_code_fence) {
                Some(split_at) => {
                    let block: String = self.pending.drain(..split_at).collect();
                    let block = block.trim();
                    if !block.is_empty() {
                        emitted.push(ReplyPayload::partial(block.to_string()));
                        self.emitted_any = true;
                    }
                }
                None => break,
            }
        }
        // The media accumulated across this call's deltas belongs with
        // whichever block just completed, not with a block emitted on some
        // later call.
        if let Some(last) = emitted.last_mut() {
            if !self.pending_media.is_empty() {
                last.media_urls = std::mem::take(&mut self.pending_media);
            }
        }
        emitted
    }
}

/// Finds the end offset of the next complete block in `buffer`, or `None`
/// if no boundary has appeared yet. A boundary is a blank line (two
/// consecutive newlines) outside of an open code fence, or the line
/// immediately following a closing ``` fence, or a markdown heading line
/// followed by a newline. `in_code_fence` is threaded through calls so
/// fence state survives across pushes.
fn find_boundary(buffer: &str, in_code_fence: &mut bool) -> Option<usize> {
    let bytes = buffer.as_bytes();
    let mut i = 0;
    let mut line_start = 0;

    while i < bytes.len() {
        if bytes[i] == b'\n' {
            let line = &buffer[line_start..i];
            let trimmed = line.trim_start();
            if trimmed.starts_with("```") {
                *in_code_fence = !*in_code_fence;
                if !*in_code_fence {
                    return Some(i + 1);
                }
            } else if !*in_code_fence {
                if line.is_empty() && i > 0 {
                    return Some(i + 1);
                }
                if trimmed.starts_with('#') && i + 1 < bytes.len() {
                    return Some(i + 1);
                }
            }
            line_start = i + 1;
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_streaming_surface_holds_everything_for_final() {
        let mut buffer = BlockBuffer::new(false);
        let partials = buffer.push("hello\n\nworld\n\n", vec![]);
        assert!(partials.is_empty());

        let finished = buffer.finish(vec![]);
        assert_eq!(finished.len(), 1);
        assert!(finished[0].is_final());
        assert_eq!(finished[0].text.as_deref(), Some("hello\n\nworld"));
    }

    #[test]
    fn streaming_surface_emits_partial_at_blank_line_boundary() {
        let mut buffer = BlockBuffer::new(true);
        let partials = buffer.push("first paragraph\n\nsecond paragraph still streaming", vec![]);

        assert_eq!(partials.len(), 1);
        assert_eq!(partials[0].text.as_deref(), Some("first paragraph"));
        assert_eq!(partials[0].marker, ReplyMarker::Partial);
    }

    #[test]
    fn exactly_one_final_regardless_of_partial_count() {
        let mut buffer = BlockBuffer::new(true);
        let mut finals = 0;
        let mut partials = 0;

        for chunk in buffer.push("a\n\nb\n\nc", vec![]) {
            assert!(!chunk.is_final());
            partials += 1;
        }

        for payload in buffer.finish(vec!["https://example.com/x.png".into()]) {
            if payload.is_final() {
                finals += 1;
                assert_eq!(payload.media_urls, vec!["https://example.com/x.png".to_string()]);
            } else {
                partials += 1;
            }
        }

        assert_eq!(finals, 1);
        assert!(partials >= 2);
    }

    #[test]
    fn media_on_a_partial_block_is_attached_to_that_block_not_the_final() {
        let mut buffer = BlockBuffer::new(true);
        let partials = buffer.push(
            "first paragraph\n\n",
            vec!["https://example.com/a.png".into()],
        );

        assert_eq!(partials.len(), 1);
        assert_eq!(
            partials[0].media_urls,
            vec!["https://example.com/a.png".to_string()]
        );

        let finished = buffer.finish(vec![]);
        assert_eq!(finished.len(), 1);
        assert!(finished[0].media_urls.is_empty());
    }

    #[test]
    fn media_with_no_completed_block_carries_to_finish() {
        let mut buffer = BlockBuffer::new(true);
        let partials = buffer.push("still streaming", vec!["https://example.com/b.png".into()]);
        assert!(partials.is_empty());

        let finished = buffer.finish(vec![]);
        assert_eq!(finished.len(), 1);
        assert_eq!(
            finished[0].media_urls,
            vec!["https://example.com/b.png".to_string()]
        );
    }

    #[test]
    fn code_fence_boundary_is_not_split_mid_fence() {
        let mut buffer = BlockBuffer::new(true);
        let partials = buffer.push("```rust\nfn main() {}\n```\n", vec![]);
        assert_eq!(partials.len(), 1);
        assert!(partials[0].text.as_ref().unwrap().contains("```rust"));
        assert!(partials[0].text.as_ref().unwrap().trim_end().ends_with("```"));
    }
}
