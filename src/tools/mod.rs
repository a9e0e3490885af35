//! Tool definitions and dispatch for the investigation phase.
//!
//! The model sees exactly two tools, `search` and `fetch`. Dispatch never
//! fails: malformed arguments, unknown tools and panics inside a primitive
//! all come back as an `error: ...` string the model can read.

pub mod extract;
pub mod provider;
pub mod ratelimit;

pub use provider::{BlockList, FetchError, SearchError, SearchHit, SearchResult, ToolProvider, ToolSettings};
pub use ratelimit::RateLimiter;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use thiserror::Error;

pub const TOOL_NAMES: [&str; 2] = ["search", "fetch"];

/// Tool definitions for the LLM
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: &'static str,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: serde_json::Value,
}

/// A tool call from the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn default_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Raw JSON string, exactly as the model produced it
    pub arguments: String,
}

/// Result of executing a tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: String,
    /// Set when a `fetch` returned page text (not an error)
    pub fetched_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("invalid arguments for {tool}: {detail}")]
    InvalidArguments { tool: String, detail: String },
    #[error("unknown tool '{0}'; valid tools are: search, fetch")]
    UnknownTool(String),
    #[error("tool {tool} failed: {detail}")]
    Panicked { tool: String, detail: String },
}

/// The two primitives behind the tool schema.
pub trait ToolExecutor: Send + Sync {
    fn search<'a>(&'a self, query: &'a str) -> BoxFuture<'a, Vec<SearchHit>>;
    /// Page text, or the reason none was obtained.
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String, FetchError>>;
}

impl ToolExecutor for ToolProvider {
    fn search<'a>(&'a self, query: &'a str) -> BoxFuture<'a, Vec<SearchHit>> {
        Box::pin(ToolProvider::search(self, query))
    }

    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String, FetchError>> {
        Box::pin(self.fetch_text(url))
    }
}

pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            tool_type: "function",
            function: FunctionDefinition {
                name: "search",
                description: "Search the web. Returns up to 10 results with title, url and snippet.",
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "Search query"
                        }
                    },
                    "required": ["query"]
                }),
            },
        },
        ToolDefinition {
            tool_type: "function",
            function: FunctionDefinition {
                name: "fetch",
                description: "Fetch a web page and return its text content. Sources you fetch yourself count as verified.",
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "url": {
                            "type": "string",
                            "description": "Absolute http(s) URL to fetch"
                        }
                    },
                    "required": ["url"]
                }),
            },
        },
    ]
}

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
}

#[derive(Deserialize)]
struct FetchArgs {
    url: String,
}

enum ParsedCall {
    Search(String),
    Fetch(String),
}

fn parse_call(name: &str, arguments: &str) -> Result<ParsedCall, DispatchError> {
    let invalid = |err: serde_json::Error| DispatchError::InvalidArguments {
        tool: name.to_string(),
        detail: err.to_string(),
    };
    // Some models send "" for argument-less calls; treat it as an empty object
    let arguments = if arguments.trim().is_empty() {
        "{}"
    } else {
        arguments
    };

    match name {
        "search" => serde_json::from_str::<SearchArgs>(arguments)
            .map(|a| ParsedCall::Search(a.query))
            .map_err(invalid),
        "fetch" => serde_json::from_str::<FetchArgs>(arguments)
            .map(|a| ParsedCall::Fetch(a.url))
            .map_err(invalid),
        other => Err(DispatchError::UnknownTool(other.to_string())),
    }
}

fn panic_detail(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

/// Run one named tool with raw JSON arguments. Always returns a string.
pub async fn dispatch(tools: &dyn ToolExecutor, name: &str, arguments: &str) -> String {
    dispatch_inner(tools, name, arguments).await.0
}

async fn dispatch_inner(
    tools: &dyn ToolExecutor,
    name: &str,
    arguments: &str,
) -> (String, Option<String>) {
    let parsed = match parse_call(name, arguments) {
        Ok(parsed) => parsed,
        Err(err) => return (format!("error: {err}"), None),
    };

    let outcome = match parsed {
        ParsedCall::Search(query) => {
            AssertUnwindSafe(async {
                let hits = tools.search(&query).await;
                let content = serde_json::to_string(&hits).unwrap_or_else(|_| "[]".to_string());
                (content, None)
            })
            .catch_unwind()
            .await
        }
        ParsedCall::Fetch(url) => {
            AssertUnwindSafe(async {
                match tools.fetch(&url).await {
                    Ok(text) => (text, Some(url.clone())),
                    Err(err) => (format!("error: {err}"), None),
                }
            })
            .catch_unwind()
            .await
        }
    };

    outcome.unwrap_or_else(|payload| {
        let err = DispatchError::Panicked {
            tool: name.to_string(),
            detail: panic_detail(payload),
        };
        tracing::warn!(tool = name, error = %err, "Tool primitive panicked");
        (format!("error: {err}"), None)
    })
}

/// Dispatch a model tool call and correlate the result with its id.
pub async fn dispatch_call(tools: &dyn ToolExecutor, call: &ToolCall) -> ToolResult {
    let (content, fetched_url) =
        dispatch_inner(tools, &call.function.name, &call.function.arguments).await;
    ToolResult {
        tool_call_id: call.id.clone(),
        content,
        fetched_url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubTools;

    impl ToolExecutor for StubTools {
        fn search<'a>(&'a self, query: &'a str) -> BoxFuture<'a, Vec<SearchHit>> {
            Box::pin(async move {
                vec![SearchHit::Result(SearchResult {
                    title: format!("About {query}"),
                    url: "https://example.com/a".to_string(),
                    snippet: String::new(),
                })]
            })
        }

        fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String, FetchError>> {
            Box::pin(async move {
                if url.contains("boom") {
                    panic!("connection pool poisoned");
                }
                if url.contains("blocked") {
                    return Err(FetchError::BlockedDomain);
                }
                if url.contains("status-page") {
                    return Ok("error: 0 incidents reported today".to_string());
                }
                Ok(format!("text of {url}"))
            })
        }
    }

    #[test]
    fn test_tool_definition_serialization() {
        let tools = tool_definitions();
        let names: Vec<&str> = tools.iter().map(|t| t.function.name).collect();
        assert_eq!(names, TOOL_NAMES.to_vec());

        let json = serde_json::to_string(&tools[1]).unwrap();
        assert!(json.contains("\"type\":\"function\""));
        assert!(json.contains("\"url\""));
    }

    #[tokio::test]
    async fn test_dispatch_unknown_tool_lists_valid_tools() {
        let result = dispatch(&StubTools, "unknown_tool", "{}").await;
        assert!(result.starts_with("error:"));
        assert!(result.contains("search"));
        assert!(result.contains("fetch"));
    }

    #[tokio::test]
    async fn test_dispatch_reports_parse_errors() {
        let result = dispatch(&StubTools, "search", "not-json").await;
        assert!(result.starts_with("error: invalid arguments for search"));

        let missing = dispatch(&StubTools, "fetch", "{}").await;
        assert!(missing.contains("invalid arguments for fetch"));
    }

    #[tokio::test]
    async fn test_dispatch_search_serializes_hits() {
        let result = dispatch(&StubTools, "search", r#"{"query": "Q42"}"#).await;
        let hits: Vec<SearchHit> = serde_json::from_str(&result).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(result.contains("About Q42"));
    }

    #[tokio::test]
    async fn test_dispatch_catches_panics() {
        let result = dispatch(&StubTools, "fetch", r#"{"url": "https://boom.example"}"#).await;
        assert!(result.starts_with("error: tool fetch failed"));
        assert!(result.contains("connection pool poisoned"));
    }

    #[tokio::test]
    async fn test_dispatch_call_tracks_fetched_urls() {
        let ok = ToolCall {
            id: "call_1".to_string(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: "fetch".to_string(),
                arguments: r#"{"url": "https://example.com/a"}"#.to_string(),
            },
        };
        let result = dispatch_call(&StubTools, &ok).await;
        assert_eq!(result.tool_call_id, "call_1");
        assert_eq!(result.fetched_url.as_deref(), Some("https://example.com/a"));

        let mut blocked = ok.clone();
        blocked.function.arguments = r#"{"url": "https://blocked.example"}"#.to_string();
        let result = dispatch_call(&StubTools, &blocked).await;
        assert_eq!(result.content, "error: blocked_domain");
        assert_eq!(result.fetched_url, None);
    }

    #[tokio::test]
    async fn test_page_text_resembling_an_error_still_counts_as_fetched() {
        let call = ToolCall {
            id: "call_2".to_string(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: "fetch".to_string(),
                arguments: r#"{"url": "https://status-page.example/"}"#.to_string(),
            },
        };
        let result = dispatch_call(&StubTools, &call).await;
        assert_eq!(result.content, "error: 0 incidents reported today");
        assert_eq!(result.fetched_url.as_deref(), Some("https://status-page.example/"));
    }
}
