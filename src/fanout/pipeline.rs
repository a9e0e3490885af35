use crate::config::Config;
use crate::context::build_edit_context;
use crate::llm::{
    extract_verdict, lookup_cost, ChatBackend, CostRecord, CostSource, Extraction,
    InvestigationSettings, InvestigationStatus, Investigator, UsageAccumulator, UsageSnapshot,
};
use crate::snapshot::EditRecord;
use crate::tools::ToolExecutor;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything one (edit, model) evaluation produced.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub investigation: InvestigationStatus,
    pub turns: usize,
    /// Absent when the run was cancelled before Phase B
    pub extraction: Option<Extraction>,
    pub usage: UsageSnapshot,
    pub cost: Option<CostRecord>,
}

/// Shared collaborators for every work item of a run.
pub struct Pipeline {
    backend: Arc<dyn ChatBackend>,
    costs: Arc<dyn CostSource>,
    tools: Arc<dyn ToolExecutor>,
    system_prompt: String,
    config: Config,
}

impl Pipeline {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        costs: Arc<dyn CostSource>,
        tools: Arc<dyn ToolExecutor>,
        system_prompt: String,
        config: Config,
    ) -> Self {
        Self {
            backend,
            costs,
            tools,
            system_prompt,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Investigation, verdict extraction, then cost lookup for one work item.
    ///
    /// `usage` is updated after every backend response so a caller that
    /// stops waiting can still report consumption so far.
    pub async fn run_single_verdict(
        &self,
        edit: &EditRecord,
        model: &str,
        usage: &UsageAccumulator,
        cancel: &CancellationToken,
    ) -> anyhow::Result<PipelineOutput> {
        let edit_context = build_edit_context(edit);
        let investigator = Investigator {
            backend: self.backend.as_ref(),
            tools: self.tools.as_ref(),
            model,
            settings: InvestigationSettings {
                max_turns: self.config.max_turns,
                context_limit: self.config.context_limit(model),
            },
        };
        let investigation = investigator
            .run(&self.system_prompt, &edit_context, usage, cancel)
            .await?;

        if investigation.status == InvestigationStatus::Cancelled {
            return Ok(PipelineOutput {
                investigation: investigation.status,
                turns: investigation.turns,
                extraction: None,
                usage: usage.snapshot(),
                cost: None,
            });
        }

        let extraction = extract_verdict(
            self.backend.as_ref(),
            model,
            &investigation.messages,
            &investigation.fetched_urls,
            usage,
        )
        .await?;

        let snapshot = usage.snapshot();
        let cost = if cancel.is_cancelled() {
            None
        } else {
            lookup_cost(
                self.costs.as_ref(),
                &snapshot.response_ids,
                Duration::from_millis(self.config.cost_settle_delay_ms),
            )
            .await
        };

        Ok(PipelineOutput {
            investigation: investigation.status,
            turns: investigation.turns,
            extraction: Some(extraction),
            usage: snapshot,
            cost,
        })
    }
}
