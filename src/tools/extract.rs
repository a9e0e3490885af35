//! Plain-text extraction from fetched pages.

use regex::Regex;
use std::sync::OnceLock;

fn block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?is)<!--.*?-->|<(script|style|noscript|svg|head|template)\b[^>]*>.*?</(script|style|noscript|svg|head|template)\s*>",
        )
        .unwrap_or_else(|_| Regex::new("$^").unwrap())
    })
}

fn break_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)<(br|/p|/div|/li|/h[1-6]|/tr|/section|/article)\b[^>]*>")
            .unwrap_or_else(|_| Regex::new("$^").unwrap())
    })
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]*>").unwrap_or_else(|_| Regex::new("$^").unwrap()))
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Collapse runs of blank space while keeping paragraph breaks.
fn normalize_whitespace(text: &str) -> String {
    let mut lines = Vec::new();
    let mut blank_run = false;
    for line in text.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            if !blank_run && !lines.is_empty() {
                lines.push(String::new());
            }
            blank_run = true;
        } else {
            lines.push(collapsed);
            blank_run = false;
        }
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

/// Extract readable text from a response body; `None` when nothing remains.
pub fn extract_text(body: &str, is_html: bool) -> Option<String> {
    let text = if is_html {
        let without_blocks = block_regex().replace_all(body, " ");
        let with_breaks = break_regex().replace_all(&without_blocks, "\n");
        let without_tags = tag_regex().replace_all(&with_breaks, " ");
        decode_entities(&without_tags)
    } else {
        body.to_string()
    };

    let normalized = normalize_whitespace(&text);
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Cut `text` at `max_chars` characters and append an explicit marker.
pub fn truncate_with_marker(text: String, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text;
    }
    let mut cut = crate::util::truncate_str(&text, max_chars).to_string();
    cut.push_str("\n\n[Truncated: full page was longer]");
    cut
}
