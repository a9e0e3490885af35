//! Batch orchestration: interleaved scheduling, per-item timeout,
//! checkpointing, and the run summary.

pub mod pipeline;
pub mod scheduler;
pub mod timeout;


pub use pipeline::{Pipeline, PipelineOutput};
pub use scheduler::{plan_run, RunAborted, RunPlan, RunSummary, Scheduler};
pub use timeout::{run_with_timeout, Timed};
