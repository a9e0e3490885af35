use crate::util::sanitize_file_component;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// API usage information from OpenRouter
#[derive(Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Point-in-time copy of an accumulator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub response_ids: Vec<String>,
}

impl UsageSnapshot {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Running token counts for one pipeline run.
///
/// Shared between the pipeline task and the scheduler so a timed-out item
/// can still report what it had consumed when it was abandoned.
#[derive(Debug, Default)]
pub struct UsageAccumulator {
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    response_ids: Mutex<Vec<String>>,
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one backend response. Counts only ever grow.
    pub fn record(&self, usage: &Usage, response_id: Option<&str>) {
        self.prompt_tokens
            .fetch_add(usage.prompt_tokens, Ordering::SeqCst);
        self.completion_tokens
            .fetch_add(usage.completion_tokens, Ordering::SeqCst);
        if let Some(id) = response_id.filter(|id| !id.is_empty()) {
            let mut ids = self
                .response_ids
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            ids.push(id.to_string());
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens.load(Ordering::SeqCst) + self.completion_tokens.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        let response_ids = self
            .response_ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        UsageSnapshot {
            prompt_tokens: self.prompt_tokens.load(Ordering::SeqCst),
            completion_tokens: self.completion_tokens.load(Ordering::SeqCst),
            response_ids,
        }
    }
}

/// Short file-safe name for a model id: last `/` segment, sanitized.
pub fn model_slug(model: &str) -> String {
    let last = model.rsplit('/').next().unwrap_or(model);
    sanitize_file_component(last)
}
