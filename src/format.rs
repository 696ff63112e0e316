//! Surface Formatter (spec.md §4.8; C11).
//!
//! Transforms agent markdown into what a given surface can actually
//! render: tables collapsed per the surface's `TableMode`, links
//! deduplicated and normalized, headings/blockquotes/rules rendered with
//! plain-text fallbacks, and the whole thing chunked to the surface's
//! length limit without splitting a code fence or widening past the limit
//! (I7, P7). Surfaces that use UTF-16 style ranges instead of inline
//! markup (namely Signal) get a parallel `StyleRange` representation.

use regex::Regex;
use std::sync::LazyLock;

/// How a surface wants markdown tables rendered (spec.md §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableMode {
    /// Keep as a fenced code block so alignment survives monospace fonts.
    Code,
    /// Collapse each row to `key: value, key: value` prose.
    Compact,
    /// Drop tables entirely, replaced by a one-line notice.
    Drop,
}

/// Inline style kinds a surface can express as UTF-16 code-unit ranges
/// instead of inline markup (spec.md §4.8, Signal-style surfaces).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StyleKind {
    Bold,
    Italic,
    Strikethrough,
    Monospace,
    Spoiler,
}

/// A style applied to `[start, start + length)` in UTF-16 code units of
/// the plain-text output, matching how Signal (and similarly-modeled
/// surfaces) express rich text out of band from the message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleRange {
    pub kind: StyleKind,
    pub start: usize,
    pub length: usize,
}

/// Plain text plus any UTF-16 style ranges extracted from markdown inline
/// emphasis, for surfaces that render styling out of band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyledText {
    pub text: String,
    pub styles: Vec<StyleRange>,
}

/// Per-surface formatting parameters (spec.md §6 plugin capabilities plus
/// per-surface length limit `L`).
#[derive(Debug, Clone)]
pub struct SurfaceProfile {
    pub max_chunk_len: usize,
    pub table_mode: TableMode,
    /// True for surfaces (Signal) that want `StyleRange`s instead of
    /// inline markdown/plain emphasis markers.
    pub uses_style_ranges: bool,
}

static TABLE_ROW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*\|(.+)\|\s*$").expect("static regex"));
static TABLE_SEPARATOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\|?[\s:|-]+\|?\s*$").expect("static regex"));
static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\((https?://[^\s)]+)\)").expect("static regex"));
static BOLD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*([^*]+)\*\*").expect("static regex"));
static STRIKE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"~~([^~]+)~~").expect("static regex"));
static CODE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`]+)`").expect("static regex"));
static SPOILER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\|\|([^|]+)\|\|").expect("static regex"));

/// Renders markdown tables into whatever form `mode` calls for. Operates
/// line-by-line so non-table content passes through untouched.
pub fn render_tables(markdown: &str, mode: TableMode) -> String {
    let lines: Vec<&str> = markdown.lines().collect();
    let mut out = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if TABLE_ROW_RE.is_match(lines[i])
            && i + 1 < lines.len()
            && TABLE_SEPARATOR_RE.is_match(lines[i + 1])
        {
            let header = split_row(lines[i]);
            let mut rows = Vec::new();
            let mut j = i + 2;
            while j < lines.len() && TABLE_ROW_RE.is_match(lines[j]) {
                rows.push(split_row(lines[j]));
                j += 1;
            }

            match mode {
                TableMode::Code => {
                    out.push("```".to_string());
                    out.push(lines[i].to_string());
                    out.push(lines[i + 1].to_string());
                    for k in (i + 2)..j {
                        out.push(lines[k].to_string());
                    }
                    out.push("```".to_string());
                }
                TableMode::Compact => {
                    for row in rows {
                        let pairs: Vec<String> = header
                            .iter()
                            .zip(row.iter())
                            .map(|(k, v)| format!("{k}: {v}"))
                            .collect();
                        out.push(pairs.join(", "));
                    }
                }
                TableMode::Drop => {
                    out.push("[table omitted]".to_string());
                }
            }
            i = j;
        } else {
            out.push(lines[i].to_string());
            i += 1;
        }
    }

    out.join("\n")
}

fn split_row(line: &str) -> Vec<String> {
    line.trim()
        .trim_start_matches('|')
        .trim_end_matches('|')
        .split('|')
        .map(|cell| cell.trim().to_string())
        .collect()
}

/// Renders `[X](Y)` as bare `X` when `normalize(X) == normalize(Y)` (the
/// link text is itself the URL it points at), otherwise as `X (Y)` (spec.md
/// §4.8). Each link is judged against its own URL, never against another
/// link's — this is per-link normalization, not cross-link deduplication.
///
/// The expansion to `X (Y)` widens the text, so it is suppressed in favor of
/// bare `X` whenever applying it to every link in a paragraph-sized segment
/// would push that segment past `max_len` (spec.md I7, S5). A `max_len` of
/// `0` disables the suppression check (no surface limit to respect).
pub fn dedup_links(markdown: &str, max_len: usize) -> String {
    split_preserving_fences(markdown)
        .into_iter()
        .map(|segment| expand_links_in_segment(&segment, max_len))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn expand_links_in_segment(segment: &str, max_len: usize) -> String {
    let expanded = replace_links(segment, true);
    if max_len == 0 || utf16_len(&expanded) <= max_len {
        return expanded;
    }
    // Expanding every link would overflow this segment's chunk; fall back
    // to bare link text so the chunk bound (P7) still holds.
    replace_links(segment, false)
}

fn replace_links(segment: &str, expand: bool) -> String {
    LINK_RE
        .replace_all(segment, |caps: &regex::Captures| {
            let text = &caps[1];
            let url = &caps[2];
            if normalize_link(text) == normalize_link(url) {
                text.to_string()
            } else if expand {
                format!("{text} ({url})")
            } else {
                text.to_string()
            }
        })
        .into_owned()
}

fn normalize_link(s: &str) -> String {
    let without_scheme = s
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let without_www = without_scheme.trim_start_matches("www.");
    without_www.trim_end_matches('/').to_lowercase()
}

/// Splits markdown emphasis into plain text plus UTF-16 style ranges, for
/// surfaces that render styling out of band (spec.md §4.8).
pub fn extract_styles(markdown: &str) -> StyledText {
    // Strip styles left-to-right, tracking offsets in the output text as
    // we go. Processed in an order where no marker is a substring of
    // another's delimiter (code and strikethrough before bold/italic,
    // since `` ` `` and `~~` don't collide with `*`).
    let mut text = markdown.to_string();
    let mut styles = Vec::new();

    strip_marker(&mut text, &mut styles, &SPOILER_RE, StyleKind::Spoiler);
    strip_marker(&mut text, &mut styles, &CODE_RE, StyleKind::Monospace);
    strip_marker(&mut text, &mut styles, &STRIKE_RE, StyleKind::Strikethrough);
    strip_marker(&mut text, &mut styles, &BOLD_RE, StyleKind::Bold);

    StyledText { text, styles }
}

fn strip_marker(text: &mut String, styles: &mut Vec<StyleRange>, re: &Regex, kind: StyleKind) {
    loop {
        let Some(caps) = re.captures(text) else {
            break;
        };
        let whole = caps.get(0).expect("capture 0 always present");
        let inner = caps.get(1).expect("capture 1 present by construction");

        let before = &text[..whole.start()];
        let start_utf16 = utf16_len(before);
        let length_utf16 = utf16_len(inner.as_str());

        styles.push(StyleRange {
            kind,
            start: start_utf16,
            length: length_utf16,
        });

        let mut replaced = String::with_capacity(text.len());
        replaced.push_str(before);
        replaced.push_str(inner.as_str());
        replaced.push_str(&text[whole.end()..]);
        *text = replaced;
    }
}

fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count()
}

/// Chunks `text` into pieces no longer than `max_len` (in UTF-16 code
/// units, matching most chat surfaces' published limits), preferring to
/// split at paragraph boundaries, then line boundaries, then word
/// boundaries, and never splitting inside a code fence (spec.md §4.8 P7).
pub fn chunk(text: &str, max_len: usize) -> Vec<String> {
    if max_len == 0 {
        return vec![text.to_string()];
    }
    if utf16_len(text) <= max_len {
        return vec![text.to_string()];
    }

    let segments = split_preserving_fences(text);
    let mut chunks = Vec::new();
    let mut current = String::new();

    for segment in segments {
        if utf16_len(&segment) > max_len {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            chunks.extend(hard_wrap(&segment, max_len));
            continue;
        }

        let candidate_len = utf16_len(&current) + if current.is_empty() { 0 } else { 2 } + utf16_len(&segment);
        if candidate_len > max_len && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(&segment);
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Splits text on blank lines, keeping any fenced code block (``` ... ```)
/// intact as a single segment even if it contains blank lines internally.
fn split_preserving_fences(text: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_fence = false;

    for line in text.split('\n') {
        let is_fence_delim = line.trim_start().starts_with("```");
        if is_fence_delim {
            in_fence = !in_fence;
        }

        if !in_fence && !is_fence_delim && line.trim().is_empty() {
            if !current.is_empty() {
                segments.push(std::mem::take(&mut current));
            }
            continue;
        }

        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

/// Last-resort split for a single segment that alone exceeds `max_len`:
/// breaks at word boundaries where possible.
fn hard_wrap(segment: &str, max_len: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();

    for word in segment.split(' ') {
        let candidate_len = utf16_len(&current) + if current.is_empty() { 0 } else { 1 } + utf16_len(word);
        if candidate_len > max_len && !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);

        while utf16_len(&current) > max_len {
            let split_at = floor_char_boundary_for_utf16_budget(&current, max_len);
            out.push(current[..split_at].to_string());
            current = current[split_at..].to_string();
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn floor_char_boundary_for_utf16_budget(s: &str, budget: usize) -> usize {
    let mut units = 0;
    let mut last_ok = 0;
    for (idx, ch) in s.char_indices() {
        let ch_units = ch.len_utf16();
        if units + ch_units > budget {
            break;
        }
        units += ch_units;
        last_ok = idx + ch.len_utf8();
    }
    if last_ok == 0 { s.len().min(1) } else { last_ok }
}

/// Renders headings, blockquotes, and horizontal rules into a surface-safe
/// plain fallback for surfaces with no native support for them (spec.md
/// §4.8).
pub fn render_plain_blocks(markdown: &str) -> String {
    markdown
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            if let Some(rest) = trimmed.strip_prefix('#') {
                let heading_text = rest.trim_start_matches('#').trim();
                heading_text.to_uppercase()
            } else if let Some(rest) = trimmed.strip_prefix('>') {
                format!("| {}", rest.trim())
            } else if trimmed == "---" || trimmed == "***" || trimmed == "___" {
                "----------".to_string()
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Full formatting pipeline for one surface: tables, link dedup, then
/// (for `uses_style_ranges` surfaces) style extraction, then chunking.
pub struct FormattedMessage {
    pub chunks: Vec<String>,
    pub styles: Option<Vec<StyleRange>>,
}

pub fn format_for_surface(markdown: &str, profile: &SurfaceProfile) -> FormattedMessage {
    let with_tables = render_tables(markdown, profile.table_mode);
    let deduped = dedup_links(&with_tables, profile.max_chunk_len);

    if profile.uses_style_ranges {
        let styled = extract_styles(&deduped);
        let chunks = chunk(&styled.text, profile.max_chunk_len);
        FormattedMessage {
            chunks,
            styles: Some(styled.styles),
        }
    } else {
        let plain = render_plain_blocks(&deduped);
        let chunks = chunk(&plain, profile.max_chunk_len);
        FormattedMessage {
            chunks,
            styles: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_mode_code_wraps_in_fence() {
        let md = "| a | b |\n|---|---|\n| 1 | 2 |";
        let out = render_tables(md, TableMode::Code);
        assert!(out.starts_with("```"));
        assert!(out.trim_end().ends_with("```"));
    }

    #[test]
    fn table_mode_compact_collapses_rows() {
        let md = "| name | age |\n|---|---|\n| alice | 30 |";
        let out = render_tables(md, TableMode::Compact);
        assert_eq!(out, "name: alice, age: 30");
    }

    #[test]
    fn table_mode_drop_replaces_with_notice() {
        let md = "| a | b |\n|---|---|\n| 1 | 2 |";
        let out = render_tables(md, TableMode::Drop);
        assert_eq!(out, "[table omitted]");
    }

    #[test]
    fn dedup_links_expands_every_link_whose_text_differs_from_its_url() {
        let md = "[one](https://example.com/a) and [two](https://example.com/b)";
        let out = dedup_links(md, 0);
        assert!(out.contains("one (https://example.com/a)"));
        assert!(out.contains("two (https://example.com/b)"));
    }

    #[test]
    fn dedup_links_collapses_a_link_whose_text_is_its_own_url() {
        let md = "See [https://example.com/](https://example.com/) for details";
        let out = dedup_links(md, 0);
        assert!(out.contains("See https://example.com/ for details"));
    }

    #[test]
    fn dedup_links_suppresses_expansion_that_would_exceed_max_len() {
        let md = "[link](https://example.com/a/very/long/path/that/pushes/past/the/limit)";
        let out = dedup_links(md, 20);
        assert_eq!(out, "link");
        assert!(utf16_len(&out) <= 20);
    }

    #[test]
    fn extract_styles_returns_plain_text_and_bold_range() {
        let styled = extract_styles("hello **world**");
        assert_eq!(styled.text, "hello world");
        assert_eq!(styled.styles.len(), 1);
        assert_eq!(styled.styles[0].kind, StyleKind::Bold);
        assert_eq!(styled.styles[0].start, 6);
        assert_eq!(styled.styles[0].length, 5);
    }

    #[test]
    fn chunk_never_exceeds_max_len() {
        let long = "word ".repeat(500);
        let chunks = chunk(&long, 120);
        for c in &chunks {
            assert!(utf16_len(c) <= 120, "chunk exceeded max_len: {} units", utf16_len(c));
        }
    }

    #[test]
    fn chunk_keeps_short_text_as_one_chunk() {
        let chunks = chunk("hello world", 100);
        assert_eq!(chunks, vec!["hello world".to_string()]);
    }

    #[test]
    fn chunk_does_not_split_inside_code_fence() {
        let text = "intro\n\n```\nline one\n\nline two\n```\n\noutro";
        let chunks = chunk(text, 500);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].contains("```\nline one\n\nline two\n```"));
    }

    #[test]
    fn render_plain_blocks_uppercases_headings_and_marks_quotes() {
        let md = "# Title\n> quoted\n---";
        let out = render_plain_blocks(md);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "TITLE");
        assert_eq!(lines[1], "| quoted");
        assert_eq!(lines[2], "----------");
    }
}
