use crate::llm::{model_slug, InvestigationStatus, Source, VerdictLabel};
use crate::util::{sanitize_file_component, write_atomic};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Completed,
    Timeout,
    Error,
}

/// One output record per work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictRecord {
    pub run_id: String,
    pub timestamp: String,
    pub edit_id: String,
    pub title: String,
    pub property: Option<String>,
    pub model: String,
    pub status: RecordStatus,
    pub investigation: Option<InvestigationStatus>,
    pub turns: usize,
    pub verdict: Option<VerdictLabel>,
    pub rationale: Option<String>,
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_verdict: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: Option<f64>,
    pub timeout: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Verdict output directory. File names are deterministic per work item
/// so a re-run overwrites rather than appends.
#[derive(Debug, Clone)]
pub struct VerdictStore {
    dir: PathBuf,
}

impl VerdictStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, edit_id: &str, model: &str) -> PathBuf {
        self.dir.join(format!(
            "{}-{}.json",
            sanitize_file_component(edit_id),
            model_slug(model)
        ))
    }

    pub fn write(&self, record: &VerdictRecord) -> anyhow::Result<PathBuf> {
        let path = self.path_for(&record.edit_id, &record.model);
        let content = serde_json::to_string_pretty(record)?;
        write_atomic(&path, &content)
            .with_context(|| format!("Failed to write verdict {}", path.display()))?;
        Ok(path)
    }
}
