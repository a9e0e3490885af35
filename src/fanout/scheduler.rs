use super::pipeline::{Pipeline, PipelineOutput};
use super::timeout::{run_with_timeout, Timed};
use crate::llm::{model_slug, UsageAccumulator, UsageSnapshot, VerdictLabel};
use crate::snapshot::{build_execution_order, EditRecord, WorkKey};
use crate::store::{Checkpoint, RecordStatus, VerdictRecord, VerdictStore};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// End-of-run counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub completed: usize,
    pub skipped: usize,
    pub timed_out: usize,
    pub errors: usize,
}

impl RunSummary {
    /// Items a re-run of the same command would pick up.
    pub fn retryable(&self) -> usize {
        self.errors
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} items: {} completed, {} skipped (checkpoint), {} timed out, {} errors",
            self.total, self.completed, self.skipped, self.timed_out, self.errors
        )
    }
}

/// A verdict file or checkpoint could not be written. Continuing would
/// pay for work whose results cannot be kept, so the run stops here.
#[derive(Debug, thiserror::Error)]
#[error("Run stopped at {item}: {reason} ({summary})")]
pub struct RunAborted {
    pub item: String,
    pub reason: String,
    pub summary: RunSummary,
}

enum ItemOutcome {
    Completed(Option<VerdictLabel>),
    TimedOut,
}

enum ItemError {
    /// The evaluation itself failed; the item is retried on the next run
    Pipeline(anyhow::Error),
    /// Results were produced but could not be persisted
    Persist(anyhow::Error),
}

/// Identity of the work item being written.
struct ItemMeta<'a> {
    edit_id: &'a str,
    edit: &'a EditRecord,
    model: &'a str,
}

/// Sequential driver over the interleaved (edit, model) plan.
pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    checkpoint: Checkpoint,
    store: VerdictStore,
    item_timeout: Duration,
    run_id: String,
}

impl Scheduler {
    pub fn new(
        pipeline: Arc<Pipeline>,
        checkpoint: Checkpoint,
        store: VerdictStore,
        item_timeout: Duration,
    ) -> Self {
        Self {
            pipeline,
            checkpoint,
            store,
            item_timeout,
            run_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Process every work item in order. Evaluation failures are counted
    /// and the loop moves on; a failure to persist results stops the run.
    pub async fn run(
        &mut self,
        edits: &[EditRecord],
        models: &[String],
    ) -> Result<RunSummary, RunAborted> {
        let order = build_execution_order(edits, models);
        let mut summary = RunSummary {
            total: order.len(),
            ..RunSummary::default()
        };

        for (idx, (edit, model)) in order.into_iter().enumerate() {
            let Some(edit_id) = edit.id() else {
                tracing::error!(model = %model, title = edit.title(), "Edit has no id; skipping");
                summary.errors += 1;
                continue;
            };
            let key = WorkKey::new(edit_id.clone(), model.clone());
            if self.checkpoint.contains(&key) {
                summary.skipped += 1;
                continue;
            }

            let meta = ItemMeta {
                edit_id: &edit_id,
                edit,
                model,
            };
            let label = format!(
                "[{}/{}] {} {}",
                idx + 1,
                summary.total,
                edit.title(),
                model_slug(model)
            );

            match self.process(&meta, key).await {
                Ok(ItemOutcome::Completed(verdict)) => {
                    summary.completed += 1;
                    let shown = verdict.map(|v| v.as_str().to_uppercase());
                    println!("{label}... {}", shown.as_deref().unwrap_or("NO VERDICT"));
                }
                Ok(ItemOutcome::TimedOut) => {
                    summary.timed_out += 1;
                    println!("{label}... TIMEOUT");
                }
                Err(ItemError::Persist(err)) => {
                    summary.errors += 1;
                    let reason = format!("{err:#}");
                    tracing::error!(edit_id = %edit_id, model = %model, error = %reason, "Failed to persist results; stopping run");
                    println!("{label}... ERROR");
                    return Err(RunAborted {
                        item: WorkKey::new(edit_id.clone(), model.as_str()).to_string(),
                        reason,
                        summary,
                    });
                }
                Err(ItemError::Pipeline(err)) => {
                    summary.errors += 1;
                    let detail = format!("{err:#}");
                    tracing::error!(edit_id = %edit_id, model = %model, error = %detail, "Work item failed");
                    println!("{label}... ERROR");
                    let record = self.error_record(&meta, &err);
                    if let Err(write_err) = self.store.write(&record) {
                        tracing::warn!(edit_id = %edit_id, model = %model, error = %write_err, "Failed to write error record");
                    }
                }
            }
        }

        Ok(summary)
    }

    async fn process(
        &mut self,
        meta: &ItemMeta<'_>,
        key: WorkKey,
    ) -> Result<ItemOutcome, ItemError> {
        tracing::info!(edit_id = meta.edit_id, model = meta.model, "Starting work item");

        let pipeline = self.pipeline.clone();
        let edit = meta.edit.clone();
        let model = meta.model.to_string();
        let usage = Arc::new(UsageAccumulator::new());
        let task_usage = usage.clone();

        let timed = run_with_timeout(
            move |cancel| async move {
                pipeline
                    .run_single_verdict(&edit, &model, &task_usage, &cancel)
                    .await
            },
            self.item_timeout,
        )
        .await
        .map_err(ItemError::Pipeline)?;

        let (record, outcome) = match timed {
            Timed::Completed(output) => {
                let verdict = output.extraction.as_ref().and_then(|e| e.verdict.verdict);
                (self.completed_record(meta, output), ItemOutcome::Completed(verdict))
            }
            Timed::TimedOut => {
                tracing::warn!(
                    edit_id = meta.edit_id,
                    model = meta.model,
                    timeout_secs = self.item_timeout.as_secs(),
                    "Work item timed out; abandoning it"
                );
                (self.timeout_record(meta, usage.snapshot()), ItemOutcome::TimedOut)
            }
        };

        // Verdict file first: a crash in between leaves an orphan file,
        // never a checkpoint entry without one.
        self.store.write(&record).map_err(ItemError::Persist)?;
        self.checkpoint
            .mark_completed(key)
            .map_err(ItemError::Persist)?;
        Ok(outcome)
    }

    fn base_record(&self, meta: &ItemMeta<'_>, status: RecordStatus) -> VerdictRecord {
        VerdictRecord {
            run_id: self.run_id.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            edit_id: meta.edit_id.to_string(),
            title: meta.edit.title().to_string(),
            property: meta.edit.property().map(str::to_string),
            model: meta.model.to_string(),
            status,
            investigation: None,
            turns: 0,
            verdict: None,
            rationale: None,
            sources: Vec::new(),
            raw_verdict: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost_usd: None,
            timeout: false,
            error: None,
        }
    }

    fn completed_record(&self, meta: &ItemMeta<'_>, output: PipelineOutput) -> VerdictRecord {
        let mut record = self.base_record(meta, RecordStatus::Completed);
        record.investigation = Some(output.investigation);
        record.turns = output.turns;
        record.prompt_tokens = output.usage.prompt_tokens;
        record.completion_tokens = output.usage.completion_tokens;

        if let Some(extraction) = output.extraction {
            record.verdict = extraction.verdict.verdict;
            record.rationale = extraction.verdict.rationale;
            record.sources = extraction.verdict.sources;
            record.raw_verdict = extraction.raw;
        }
        if let Some(cost) = output.cost {
            // Billing counts are authoritative when present
            if let Some(prompt) = cost.prompt_tokens {
                record.prompt_tokens = prompt;
            }
            if let Some(completion) = cost.completion_tokens {
                record.completion_tokens = completion;
            }
            record.cost_usd = cost.cost_usd;
        }
        record
    }

    fn timeout_record(&self, meta: &ItemMeta<'_>, usage: UsageSnapshot) -> VerdictRecord {
        let mut record = self.base_record(meta, RecordStatus::Timeout);
        record.timeout = true;
        record.prompt_tokens = usage.prompt_tokens;
        record.completion_tokens = usage.completion_tokens;
        record
    }

    fn error_record(&self, meta: &ItemMeta<'_>, err: &anyhow::Error) -> VerdictRecord {
        let mut record = self.base_record(meta, RecordStatus::Error);
        record.error = Some(format!("{err:#}"));
        record
    }
}

/// What a run would do, computed without touching any backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub edits: usize,
    pub models: usize,
    pub total: usize,
    pub already_done: usize,
}

pub fn plan_run(edits: &[EditRecord], models: &[String], checkpoint: &Checkpoint) -> RunPlan {
    let order = build_execution_order(edits, models);
    let already_done = order
        .iter()
        .filter(|(edit, model)| {
            edit.id()
                .is_some_and(|id| checkpoint.contains(&WorkKey::new(id, model.as_str())))
        })
        .count();
    RunPlan {
        edits: edits.len(),
        models: models.len(),
        total: order.len(),
        already_done,
    }
}
