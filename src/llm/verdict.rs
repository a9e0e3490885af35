//! Phase B: structured verdict extraction.

use super::client::{ChatBackend, ChatRequest, Message, ResponseFormat};
use super::models::UsageAccumulator;
use super::parse::parse_structured_content;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerdictLabel {
    VerifiedHigh,
    VerifiedLow,
    Plausible,
    Unverifiable,
    Suspect,
    Incorrect,
}

impl VerdictLabel {
    pub const ALL: [VerdictLabel; 6] = [
        VerdictLabel::VerifiedHigh,
        VerdictLabel::VerifiedLow,
        VerdictLabel::Plausible,
        VerdictLabel::Unverifiable,
        VerdictLabel::Suspect,
        VerdictLabel::Incorrect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictLabel::VerifiedHigh => "verified-high",
            VerdictLabel::VerifiedLow => "verified-low",
            VerdictLabel::Plausible => "plausible",
            VerdictLabel::Unverifiable => "unverifiable",
            VerdictLabel::Suspect => "suspect",
            VerdictLabel::Incorrect => "incorrect",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace(['_', ' '], "-");
        Self::ALL.into_iter().find(|label| label.as_str() == normalized)
    }
}

impl fmt::Display for VerdictLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Fetched and read directly
    Verified,
    /// Only mentioned inside another source
    Reported,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub url: String,
    pub supports_claim: bool,
    pub provenance: Provenance,
}

/// Structured verdict. Every field may be absent after a degraded parse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub verdict: Option<VerdictLabel>,
    pub rationale: Option<String>,
    pub sources: Vec<Source>,
}

/// Phase B result. `raw` is kept only when structured parsing failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub verdict: Verdict,
    pub raw: Option<String>,
}

impl Extraction {
    pub fn is_degraded(&self) -> bool {
        self.raw.is_some()
    }
}

#[derive(Deserialize)]
struct VerdictWire {
    #[serde(default)]
    verdict: Option<String>,
    #[serde(default)]
    rationale: Option<String>,
    #[serde(default)]
    sources: Vec<SourceWire>,
}

#[derive(Deserialize)]
struct SourceWire {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    supports_claim: Option<bool>,
    #[serde(default)]
    provenance: Option<String>,
}

pub fn verdict_schema() -> serde_json::Value {
    let labels: Vec<&str> = VerdictLabel::ALL.iter().map(|l| l.as_str()).collect();
    serde_json::json!({
        "type": "object",
        "properties": {
            "verdict": {"type": "string", "enum": labels},
            "rationale": {"type": "string"},
            "sources": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "url": {"type": "string"},
                        "supports_claim": {"type": "boolean"},
                        "provenance": {"type": "string", "enum": ["verified", "reported"]}
                    },
                    "required": ["url", "supports_claim", "provenance"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["verdict", "rationale", "sources"],
        "additionalProperties": false
    })
}

fn verdict_request() -> String {
    let schema = serde_json::to_string_pretty(&verdict_schema()).unwrap_or_default();
    format!(
        "Based on your investigation, please provide your final verdict as JSON. \
         Use this exact schema:\n\n{schema}\n\n\
         Mark a source \"verified\" only if you fetched it yourself; sources you only \
         saw cited elsewhere are \"reported\".\nRespond with only valid JSON matching the schema."
    )
}

fn normalize_url(url: &str) -> &str {
    url.trim().trim_end_matches('/')
}

/// Parse the model's structured output, degrading instead of failing.
///
/// Sources claimed as `verified` whose URL is not in `fetched_urls` are
/// downgraded to `reported`.
pub fn parse_verdict(content: &str, fetched_urls: &BTreeSet<String>) -> Extraction {
    let wire = match parse_structured_content::<VerdictWire>(content) {
        Ok(wire) => wire,
        Err(err) => {
            tracing::warn!(error = %err, "Verdict response could not be parsed");
            return Extraction {
                verdict: Verdict::default(),
                raw: Some(content.to_string()),
            };
        }
    };

    let label = wire.verdict.as_deref().and_then(VerdictLabel::parse);
    if label.is_none() {
        tracing::warn!(verdict = ?wire.verdict, "Verdict label missing or outside the closed set");
    }

    let fetched: BTreeSet<&str> = fetched_urls.iter().map(|u| normalize_url(u)).collect();
    let sources = wire
        .sources
        .into_iter()
        .filter_map(|s| {
            let url = s.url.filter(|u| !u.trim().is_empty())?;
            let claimed_verified = s
                .provenance
                .as_deref()
                .is_some_and(|p| p.trim().eq_ignore_ascii_case("verified"));
            let provenance = if claimed_verified && fetched.contains(normalize_url(&url)) {
                Provenance::Verified
            } else {
                if claimed_verified {
                    tracing::warn!(url = %url, "Source marked verified was never fetched; downgrading to reported");
                }
                Provenance::Reported
            };
            Some(Source {
                url,
                supports_claim: s.supports_claim.unwrap_or(false),
                provenance,
            })
        })
        .collect();

    let verdict = Verdict {
        verdict: label,
        rationale: wire.rationale.filter(|r| !r.trim().is_empty()),
        sources,
    };
    // A JSON body that yielded nothing usable still counts as degraded
    let raw = if verdict == Verdict::default() {
        Some(content.to_string())
    } else {
        None
    };
    Extraction { verdict, raw }
}

/// Append the verdict request to the transcript and make one structured,
/// tool-less call.
pub async fn extract_verdict(
    backend: &dyn ChatBackend,
    model: &str,
    transcript: &[Message],
    fetched_urls: &BTreeSet<String>,
    usage: &UsageAccumulator,
) -> anyhow::Result<Extraction> {
    let mut messages = transcript.to_vec();
    messages.push(Message::user(verdict_request()));

    let reply = backend
        .chat(ChatRequest {
            model,
            messages: &messages,
            tools: None,
            response_format: Some(ResponseFormat::json_schema("verdict", verdict_schema())),
        })
        .await
        .context("Verdict extraction call failed")?;
    usage.record(&reply.usage, reply.id.as_deref());

    let content = reply.content.unwrap_or_default();
    Ok(parse_verdict(&content, fetched_urls))
}
