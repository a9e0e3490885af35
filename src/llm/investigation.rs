//! Phase A: the tool-calling investigation loop.
//!
//! The model drives: each turn it either asks for tools or stops. Every
//! model behavior maps to a terminal state; only backend failures are
//! returned as errors.

use super::client::{ChatBackend, ChatRequest, FinishReason, Message};
use super::models::UsageAccumulator;
use crate::tools::{dispatch_call, tool_definitions, ToolExecutor};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;

/// Share of the context window above which a warning is logged.
const CONTEXT_WARN_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestigationStatus {
    /// The model stopped asking for tools
    Natural,
    /// Turn budget ran out while tools were still being requested
    Budget,
    /// Output was cut off by a length limit
    Truncated,
    /// The item's deadline passed between turns
    Cancelled,
}

impl InvestigationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvestigationStatus::Natural => "natural",
            InvestigationStatus::Budget => "budget",
            InvestigationStatus::Truncated => "truncated",
            InvestigationStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InvestigationSettings {
    pub max_turns: usize,
    pub context_limit: u64,
}

#[derive(Debug, Clone)]
pub struct Investigation {
    pub messages: Vec<Message>,
    pub status: InvestigationStatus,
    pub turns: usize,
    /// URLs whose page text the model actually received
    pub fetched_urls: BTreeSet<String>,
}

pub struct Investigator<'a> {
    pub backend: &'a dyn ChatBackend,
    pub tools: &'a dyn ToolExecutor,
    pub model: &'a str,
    pub settings: InvestigationSettings,
}

impl Investigator<'_> {
    /// Run the loop from a fresh conversation seeded with the system prompt
    /// and the work-item context.
    pub async fn run(
        &self,
        system_prompt: &str,
        edit_context: &str,
        usage: &UsageAccumulator,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Investigation> {
        let definitions = tool_definitions();
        let mut messages = vec![Message::system(system_prompt), Message::user(edit_context)];
        let mut fetched_urls = BTreeSet::new();
        let mut warned_context = false;
        let mut turns = 0;

        let finish = |messages: Vec<Message>, status, turns, fetched_urls| Investigation {
            messages,
            status,
            turns,
            fetched_urls,
        };

        while turns < self.settings.max_turns {
            if cancel.is_cancelled() {
                tracing::warn!(model = self.model, turn = turns, "Investigation cancelled");
                return Ok(finish(messages, InvestigationStatus::Cancelled, turns, fetched_urls));
            }
            turns += 1;

            let reply = self
                .backend
                .chat(ChatRequest {
                    model: self.model,
                    messages: &messages,
                    tools: Some(&definitions),
                    response_format: None,
                })
                .await
                .with_context(|| format!("Investigation turn {turns} failed"))?;

            usage.record(&reply.usage, reply.id.as_deref());
            if !warned_context {
                warned_context = self.check_context(usage.total_tokens(), turns);
            }

            match reply.finish_reason {
                FinishReason::Length => {
                    tracing::warn!(
                        model = self.model,
                        turn = turns,
                        dropped_tool_calls = reply.tool_calls.len(),
                        "Model output truncated by length limit"
                    );
                    // Calls cut off mid-turn are never answered, so they stay out of the transcript
                    messages.push(Message::assistant(reply.content, Vec::new()));
                    return Ok(finish(messages, InvestigationStatus::Truncated, turns, fetched_urls));
                }
                _ if !reply.tool_calls.is_empty() => {
                    let calls = reply.tool_calls.clone();
                    messages.push(Message::assistant(reply.content, reply.tool_calls));
                    for call in &calls {
                        tracing::debug!(
                            model = self.model,
                            turn = turns,
                            tool = %call.function.name,
                            arguments = %call.function.arguments,
                            "Dispatching tool call"
                        );
                        let result = dispatch_call(self.tools, call).await;
                        if let Some(url) = result.fetched_url {
                            fetched_urls.insert(url);
                        }
                        messages.push(Message::tool(result.tool_call_id, result.content));
                    }
                }
                finish_reason => {
                    if let FinishReason::Other(reason) = &finish_reason {
                        tracing::warn!(
                            model = self.model,
                            turn = turns,
                            finish_reason = %reason,
                            "Unexpected finish reason; treating as a natural stop"
                        );
                    }
                    messages.push(Message::assistant(reply.content, Vec::new()));
                    return Ok(finish(messages, InvestigationStatus::Natural, turns, fetched_urls));
                }
            }
        }

        tracing::warn!(model = self.model, turns, "Turn budget exhausted");
        Ok(finish(messages, InvestigationStatus::Budget, turns, fetched_urls))
    }

    /// Returns true once a warning has been emitted.
    fn check_context(&self, total_tokens: u64, turn: usize) -> bool {
        let limit = self.settings.context_limit;
        if limit == 0 {
            return false;
        }
        let ratio = total_tokens as f64 / limit as f64;
        if ratio > CONTEXT_WARN_RATIO {
            tracing::warn!(
                model = self.model,
                turn,
                tokens = total_tokens,
                limit,
                "Context window {:.0}% used",
                ratio * 100.0
            );
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::ChatReply;
    use crate::llm::models::Usage;
    use crate::tools::{FetchError, FunctionCall, SearchHit, ToolCall};
    use futures::future::BoxFuture;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedBackend {
        replies: Mutex<VecDeque<ChatReply>>,
        requests: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<ChatReply>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    impl ChatBackend for ScriptedBackend {
        fn chat<'a>(&'a self, request: ChatRequest<'a>) -> BoxFuture<'a, anyhow::Result<ChatReply>> {
            self.requests.lock().unwrap().push(request.messages.to_vec());
            let next = self.replies.lock().unwrap().pop_front();
            Box::pin(async move { next.ok_or_else(|| anyhow::anyhow!("connection refused")) })
        }
    }

    struct EchoTools;

    impl ToolExecutor for EchoTools {
        fn search<'a>(&'a self, _query: &'a str) -> BoxFuture<'a, Vec<SearchHit>> {
            Box::pin(async { Vec::new() })
        }

        fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String, FetchError>> {
            Box::pin(async move { Ok(format!("contents of {url}")) })
        }
    }

    fn tool_call(id: &str, name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        }
    }

    fn reply(finish: FinishReason, calls: Vec<ToolCall>, usage: Usage) -> ChatReply {
        ChatReply {
            id: Some(format!("gen-{}", usage.prompt_tokens)),
            content: if calls.is_empty() { Some("done".to_string()) } else { None },
            tool_calls: calls,
            finish_reason: finish,
            usage,
        }
    }

    fn investigator<'a>(backend: &'a ScriptedBackend, max_turns: usize) -> Investigator<'a> {
        Investigator {
            backend,
            tools: &EchoTools,
            model: "test/model",
            settings: InvestigationSettings {
                max_turns,
                context_limit: 100_000,
            },
        }
    }

    #[tokio::test]
    async fn test_two_turn_investigation_correlates_tool_result() {
        let backend = ScriptedBackend::new(vec![
            reply(
                FinishReason::ToolCalls,
                vec![tool_call("call_1", "fetch", r#"{"url":"https://example.com/a"}"#)],
                Usage::new(100, 10),
            ),
            reply(FinishReason::Stop, Vec::new(), Usage::new(200, 20)),
        ]);
        let usage = UsageAccumulator::new();
        let result = investigator(&backend, 15)
            .run("system", "edit", &usage, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, InvestigationStatus::Natural);
        assert_eq!(result.turns, 2);
        let tool_messages: Vec<&Message> =
            result.messages.iter().filter(|m| m.role == "tool").collect();
        assert_eq!(tool_messages.len(), 1);
        assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(
            tool_messages[0].content.as_deref(),
            Some("contents of https://example.com/a")
        );
        assert!(result.fetched_urls.contains("https://example.com/a"));

        let snap = usage.snapshot();
        assert_eq!(snap.prompt_tokens, 300);
        assert_eq!(snap.completion_tokens, 30);
        assert_eq!(snap.response_ids, vec!["gen-100".to_string(), "gen-200".to_string()]);

        // second request saw the assistant call followed by its result
        let second = &backend.requests.lock().unwrap()[1];
        assert_eq!(second.len(), 4);
        assert_eq!(second[2].role, "assistant");
        assert_eq!(second[3].role, "tool");
    }

    #[tokio::test]
    async fn test_budget_exhaustion() {
        let replies = (0..3)
            .map(|i| {
                reply(
                    FinishReason::ToolCalls,
                    vec![tool_call(&format!("call_{i}"), "search", r#"{"query":"x"}"#)],
                    Usage::new(10 + i, 1),
                )
            })
            .collect();
        let backend = ScriptedBackend::new(replies);
        let result = investigator(&backend, 3)
            .run("s", "e", &UsageAccumulator::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, InvestigationStatus::Budget);
        assert_eq!(result.turns, 3);
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn test_truncation_keeps_partial_transcript() {
        let backend = ScriptedBackend::new(vec![
            reply(
                FinishReason::ToolCalls,
                vec![tool_call("call_1", "search", r#"{"query":"x"}"#)],
                Usage::new(10, 1),
            ),
            ChatReply {
                id: None,
                content: Some("partial anal".to_string()),
                tool_calls: Vec::new(),
                finish_reason: FinishReason::Length,
                usage: Usage::new(20, 2),
            },
        ]);
        let result = investigator(&backend, 15)
            .run("s", "e", &UsageAccumulator::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, InvestigationStatus::Truncated);
        assert_eq!(
            result.messages.last().and_then(|m| m.content.as_deref()),
            Some("partial anal")
        );
        assert_eq!(result.messages.len(), 5);
    }

    #[tokio::test]
    async fn test_truncated_tool_call_turn_leaves_no_unanswered_calls() {
        let backend = ScriptedBackend::new(vec![ChatReply {
            id: None,
            content: Some("Let me fetch".to_string()),
            tool_calls: vec![tool_call("call_1", "fetch", r#"{"url":"https://example.com/a"}"#)],
            finish_reason: FinishReason::Length,
            usage: Usage::new(20, 2),
        }]);
        let result = investigator(&backend, 15)
            .run("s", "e", &UsageAccumulator::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, InvestigationStatus::Truncated);
        assert_eq!(backend.calls(), 1);

        let last = result.messages.last().unwrap();
        assert_eq!(last.role, "assistant");
        assert_eq!(last.content.as_deref(), Some("Let me fetch"));
        assert!(result.messages.iter().all(|m| m.tool_calls.is_none()));
        assert!(result.messages.iter().all(|m| m.role != "tool"));
        assert!(result.fetched_urls.is_empty());
    }

    #[test]
    fn test_context_warning_threshold() {
        let backend = ScriptedBackend::new(Vec::new());
        let engine = investigator(&backend, 15);
        assert!(engine.check_context(80_001, 1));
        assert!(engine.check_context(96_000, 1));
        assert!(!engine.check_context(80_000, 1));
        assert!(!engine.check_context(10, 1));

        let unknown = Investigator {
            settings: InvestigationSettings {
                max_turns: 15,
                context_limit: 0,
            },
            ..investigator(&backend, 15)
        };
        assert!(!unknown.check_context(1_000_000, 1));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_turn() {
        let backend = ScriptedBackend::new(Vec::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = investigator(&backend, 15)
            .run("s", "e", &UsageAccumulator::new(), &cancel)
            .await
            .unwrap();
        assert_eq!(result.status, InvestigationStatus::Cancelled);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_unexpected_finish_reason_is_natural() {
        let backend = ScriptedBackend::new(vec![reply(
            FinishReason::Other("content_filter".to_string()),
            Vec::new(),
            Usage::new(95_000, 1_000),
        )]);
        let result = investigator(&backend, 15)
            .run("s", "e", &UsageAccumulator::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, InvestigationStatus::Natural);
    }

    #[tokio::test]
    async fn test_backend_failure_propagates() {
        let backend = ScriptedBackend::new(Vec::new());
        let err = investigator(&backend, 15)
            .run("s", "e", &UsageAccumulator::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("connection refused"));
    }
}
