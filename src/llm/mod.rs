//! Model backend: OpenRouter client, the two evaluation phases, and cost lookup.

pub mod client;
pub mod cost;
pub mod investigation;
pub mod models;
pub mod parse;
pub mod verdict;

pub use client::{
    ChatBackend, ChatReply, ChatRequest, CostSource, FinishReason, GenerationCost, Message,
    OpenRouterClient, RetryPolicy,
};
pub use cost::{lookup_cost, CostRecord};
pub use investigation::{Investigation, InvestigationSettings, InvestigationStatus, Investigator};
pub use models::{model_slug, Usage, UsageAccumulator, UsageSnapshot};
pub use verdict::{extract_verdict, Extraction, Provenance, Source, Verdict, VerdictLabel};
