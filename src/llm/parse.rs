//! Lenient parsing of structured model output.
//!
//! Models asked for JSON still wrap it in fences, prose, or an extra
//! object layer. We build a handful of deterministic candidates and take
//! the first one that deserializes.

use crate::util::truncate_str;

const MAX_ERROR_CONTENT_LEN: usize = 200;

fn push_unique_candidate(candidates: &mut Vec<String>, candidate: impl Into<String>) {
    let candidate = candidate.into();
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return;
    }
    if !candidates.iter().any(|existing| existing == trimmed) {
        candidates.push(trimmed.to_string());
    }
}

fn strip_markdown_fences(content: &str) -> Option<String> {
    let trimmed = content.trim();
    let without_open = trimmed.strip_prefix("```")?;
    let after_header = match without_open.find('\n') {
        Some(newline_idx) => &without_open[newline_idx + 1..],
        None => without_open,
    };
    let end_idx = after_header.rfind("```")?;
    Some(after_header[..end_idx].trim().to_string())
}

fn unwrap_outer_wrapper(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.len() < 3 || !(trimmed.starts_with('{') && trimmed.ends_with('}')) {
        return None;
    }
    let inner = &trimmed[1..trimmed.len() - 1];
    if inner.trim_start().starts_with('{') {
        Some(inner.trim().to_string())
    } else {
        None
    }
}

fn extract_balanced_json_from(content: &str, start: usize) -> Option<String> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in content[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(ch) {
                    return None;
                }
                if stack.is_empty() {
                    let end = start + offset + ch.len_utf8();
                    return Some(content[start..end].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Balanced `{...}` fragments in order of appearance.
fn extract_object_candidates(content: &str, max_candidates: usize) -> Vec<String> {
    let mut out = Vec::new();
    for (idx, ch) in content.char_indices() {
        if out.len() >= max_candidates {
            break;
        }
        if ch == '{' {
            if let Some(candidate) = extract_balanced_json_from(content, idx) {
                push_unique_candidate(&mut out, candidate);
            }
        }
    }
    out
}

pub fn parse_structured_content<T>(content: &str) -> anyhow::Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let mut candidates = Vec::new();
    push_unique_candidate(&mut candidates, content);
    if let Some(stripped) = strip_markdown_fences(content) {
        push_unique_candidate(&mut candidates, stripped);
    }

    let mut idx = 0usize;
    while idx < candidates.len() && idx < 8 {
        let current = candidates[idx].clone();
        for extracted in extract_object_candidates(&current, 4) {
            push_unique_candidate(&mut candidates, extracted);
        }
        if let Some(unwrapped) = unwrap_outer_wrapper(&current) {
            push_unique_candidate(&mut candidates, unwrapped);
        }
        idx += 1;
    }

    let mut last_err: Option<String> = None;
    for candidate in candidates {
        match serde_json::from_str::<T>(&candidate) {
            Ok(data) => return Ok(data),
            Err(err) => last_err = Some(err.to_string()),
        }
    }

    Err(anyhow::anyhow!(
        "Failed to parse structured response: {}\nContent: {}",
        last_err.unwrap_or_else(|| "empty response".to_string()),
        truncate_str(content, MAX_ERROR_CONTENT_LEN)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        verdict: String,
    }

    #[test]
    fn test_parse_plain_json() {
        let parsed: Sample = parse_structured_content(r#"{"verdict": "plausible"}"#).unwrap();
        assert_eq!(parsed.verdict, "plausible");
    }

    #[test]
    fn test_parse_fenced_json() {
        let content = "```json\n{\"verdict\": \"suspect\"}\n```";
        let parsed: Sample = parse_structured_content(content).unwrap();
        assert_eq!(parsed.verdict, "suspect");
    }

    #[test]
    fn test_parse_json_after_prose() {
        let content = "Here is my verdict: {\"verdict\": \"incorrect\", \"note\": \"a } in a string\"} thanks";
        let parsed: Sample = parse_structured_content(content).unwrap();
        assert_eq!(parsed.verdict, "incorrect");
    }

    #[test]
    fn test_parse_double_wrapped_object() {
        let content = r#"{{"verdict": "unverifiable"}}"#;
        let parsed: Sample = parse_structured_content(content).unwrap();
        assert_eq!(parsed.verdict, "unverifiable");
    }

    #[test]
    fn test_parse_failure_reports_preview() {
        let err = parse_structured_content::<Sample>("I could not decide.").unwrap_err();
        assert!(err.to_string().contains("I could not decide."));
        assert!(parse_structured_content::<Sample>("").is_err());
    }
}
