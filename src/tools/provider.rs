//! `search` and `fetch` primitives over a local search service and the open web.
//!
//! Neither primitive fails: transport problems come back as data (an error
//! hit for search, an `error: <reason>` string for fetch) so the model can
//! read them and adapt.

use super::extract::{extract_text, truncate_with_marker};
use super::ratelimit::RateLimiter;
use crate::config::Config;
use crate::util::truncate;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const USER_AGENT: &str = concat!("sift-fanout/", env!("CARGO_PKG_VERSION"));
const MAX_ERROR_DETAIL_CHARS: usize = 200;
const MAX_REDIRECTS: usize = 10;

/// Why a fetch produced no text. `Display` is the reason string the model sees.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("blocked_domain")]
    BlockedDomain,
    #[error("invalid_url")]
    InvalidUrl,
    #[error("timeout")]
    Timeout,
    #[error("http_{0}")]
    Http(u16),
    #[error("extraction_empty")]
    ExtractionEmpty,
    #[error("request_failed ({0})")]
    Request(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SearchError {
    #[error("search service timed out")]
    Timeout,
    #[error("search service is unreachable at {0}")]
    Unreachable(String),
    #[error("search service returned HTTP {0}")]
    Status(u16),
    #[error("search service returned invalid JSON")]
    InvalidJson,
    #[error("search request failed ({0})")]
    Request(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// One entry of a search response as handed to the model.
///
/// An empty list means zero results; a failed search is a single `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SearchHit {
    Result(SearchResult),
    Error { error: String },
}

impl SearchHit {
    pub fn is_error(&self) -> bool {
        matches!(self, SearchHit::Error { .. })
    }
}

/// Externally maintained list of domains that must never be fetched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockList {
    domains: BTreeSet<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BlockEntry {
    Bare(String),
    Detailed { domain: String },
}

#[derive(Deserialize)]
struct BlockListFile {
    #[serde(default)]
    domains: Option<Vec<BlockEntry>>,
}

impl BlockList {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            domains: domains
                .into_iter()
                .map(|d| d.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    /// Load `domains:` entries from YAML. A missing file is an empty list.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read blocked domains {}", path.display()))?;
        let parsed: Option<BlockListFile> = serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid blocked domains file {}", path.display()))?;
        let entries = parsed.and_then(|f| f.domains).unwrap_or_default();
        Ok(Self::new(entries.into_iter().map(|entry| match entry {
            BlockEntry::Bare(domain) => domain,
            BlockEntry::Detailed { domain } => domain,
        })))
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Exact host match or any subdomain of a listed domain.
    pub fn is_blocked(&self, url: &str) -> bool {
        if self.domains.is_empty() {
            return false;
        }
        let Ok(parsed) = Url::parse(url.trim()) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.domains.iter().any(|domain| {
            host == *domain
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub search_url: String,
    pub search_timeout: Duration,
    pub fetch_timeout: Duration,
    pub fetch_max_chars: usize,
    pub search_max_results: usize,
}

impl ToolSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            search_url: config.search_url.clone(),
            search_timeout: Duration::from_secs(config.search_timeout_secs),
            fetch_timeout: Duration::from_secs(config.fetch_timeout_secs),
            fetch_max_chars: config.fetch_max_chars,
            search_max_results: config.search_max_results,
        }
    }
}

#[derive(Deserialize)]
struct SearxResponse {
    #[serde(default)]
    results: Vec<SearxResult>,
}

#[derive(Deserialize)]
struct SearxResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
}

pub struct ToolProvider {
    http: reqwest::Client,
    settings: ToolSettings,
    blocklist: BlockList,
    limiter: Arc<RateLimiter>,
}

impl ToolProvider {
    pub fn new(
        settings: ToolSettings,
        blocklist: BlockList,
        limiter: Arc<RateLimiter>,
    ) -> anyhow::Result<Self> {
        let redirect_blocklist = blocklist.clone();
        let redirects = reqwest::redirect::Policy::custom(move |attempt| {
            if redirect_blocklist.is_blocked(attempt.url().as_str()) {
                attempt.stop()
            } else if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.error("too many redirects")
            } else {
                attempt.follow()
            }
        });
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(redirects)
            .build()
            .context("Failed to build HTTP client for tools")?;
        Ok(Self {
            http,
            settings,
            blocklist,
            limiter,
        })
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn blocklist(&self) -> &BlockList {
        &self.blocklist
    }

    /// Search the local search service, at most `search_max_results` hits.
    pub async fn search(&self, query: &str) -> Vec<SearchHit> {
        match self.try_search(query).await {
            Ok(hits) => hits,
            Err(err) => vec![SearchHit::Error {
                error: err.to_string(),
            }],
        }
    }

    async fn try_search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError> {
        let classify = |err: reqwest::Error| {
            if err.is_timeout() {
                SearchError::Timeout
            } else if err.is_connect() {
                SearchError::Unreachable(self.settings.search_url.clone())
            } else {
                SearchError::Request(truncate(&err.to_string(), MAX_ERROR_DETAIL_CHARS))
            }
        };

        self.limiter.acquire().await;
        let response = self
            .http
            .get(&self.settings.search_url)
            .query(&[("q", query), ("format", "json")])
            .timeout(self.settings.search_timeout)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Status(status.as_u16()));
        }
        let body = response.text().await.map_err(classify)?;
        let parsed: SearxResponse =
            serde_json::from_str(&body).map_err(|_| SearchError::InvalidJson)?;

        Ok(parsed
            .results
            .into_iter()
            .filter(|r| !self.blocklist.is_blocked(&r.url))
            .take(self.settings.search_max_results)
            .map(|r| {
                SearchHit::Result(SearchResult {
                    title: r.title,
                    url: r.url,
                    snippet: r.content,
                })
            })
            .collect())
    }

    /// Fetch a page and return its text, or `error: <reason>`.
    pub async fn fetch(&self, url: &str) -> String {
        match self.fetch_text(url).await {
            Ok(text) => text,
            Err(err) => format!("error: {err}"),
        }
    }

    /// Typed variant of [`ToolProvider::fetch`].
    ///
    /// The blocklist is consulted before the rate limiter or any socket.
    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        if self.blocklist.is_blocked(url) {
            return Err(FetchError::BlockedDomain);
        }
        let parsed = Url::parse(url.trim()).map_err(|_| FetchError::InvalidUrl)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl);
        }

        let classify = |err: reqwest::Error| {
            if err.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Request(truncate(&err.to_string(), MAX_ERROR_DETAIL_CHARS))
            }
        };

        self.limiter.acquire().await;
        let response = self
            .http
            .get(parsed)
            .timeout(self.settings.fetch_timeout)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if status.is_redirection() && self.redirects_to_blocked(&response) {
            return Err(FetchError::BlockedDomain);
        }
        if !status.is_success() {
            return Err(FetchError::Http(status.as_u16()));
        }

        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| {
                let ct = ct.to_ascii_lowercase();
                ct.contains("html") || ct.contains("xml")
            })
            .unwrap_or(true);
        let body = response.text().await.map_err(classify)?;

        let text = extract_text(&body, is_html).ok_or(FetchError::ExtractionEmpty)?;
        Ok(truncate_with_marker(text, self.settings.fetch_max_chars))
    }

    /// The redirect policy stops in front of blocked hosts; this tells that
    /// stop apart from an ordinary unfollowed 3xx.
    fn redirects_to_blocked(&self, response: &reqwest::Response) -> bool {
        response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|location| response.url().join(location).ok())
            .is_some_and(|next| self.blocklist.is_blocked(next.as_str()))
    }
}
