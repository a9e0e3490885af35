//! Input snapshot of candidate edits and the (edit, model) work-item plan.
//!
//! Edit records are produced by the ingestion pipeline and treated as opaque
//! payloads: only the stable id and a handful of display fields are read here.

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;

/// One immutable edit record from the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EditRecord {
    fields: Map<String, Value>,
}

impl EditRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Stable identifier (`rcid`, falling back to `id`), normalized to a string.
    pub fn id(&self) -> Option<String> {
        ["rcid", "id"]
            .iter()
            .filter_map(|key| self.fields.get(*key))
            .find_map(scalar_to_string)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key).filter(|v| !v.is_null())
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Nested string lookup, e.g. `["parsed_edit", "property"]`.
    pub fn str_at(&self, path: &[&str]) -> Option<&str> {
        let (first, rest) = path.split_first()?;
        let mut current = self.get(first)?;
        for key in rest {
            current = current.get(*key).filter(|v| !v.is_null())?;
        }
        current.as_str()
    }

    pub fn title(&self) -> &str {
        self.str_field("title").unwrap_or("?")
    }

    pub fn property(&self) -> Option<&str> {
        self.str_at(&["parsed_edit", "property"])
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SnapshotFile {
    Wrapped { edits: Vec<EditRecord> },
    Bare(Vec<EditRecord>),
}

/// Load the snapshot (YAML or JSON), keeping the first `limit` edits.
///
/// Every edit must carry a stable id; later duplicates of an id are dropped.
pub fn load_snapshot(path: &Path, limit: Option<usize>) -> anyhow::Result<Vec<EditRecord>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
    let parsed: SnapshotFile = serde_yaml::from_str(&content)
        .with_context(|| format!("Invalid snapshot {}", path.display()))?;
    let edits = match parsed {
        SnapshotFile::Wrapped { edits } => edits,
        SnapshotFile::Bare(edits) => edits,
    };

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(edits.len());
    for (idx, edit) in edits.into_iter().enumerate() {
        let id = edit
            .id()
            .ok_or_else(|| anyhow!("Snapshot edit #{} has no rcid/id", idx + 1))?;
        if !seen.insert(id.clone()) {
            tracing::warn!(edit_id = %id, "Duplicate edit id in snapshot; keeping first");
            continue;
        }
        out.push(edit);
    }

    if let Some(limit) = limit {
        out.truncate(limit);
    }
    Ok(out)
}

/// Unique key of a work item: one edit evaluated by one model.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkKey {
    pub edit_id: String,
    pub model: String,
}

impl WorkKey {
    pub fn new(edit_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            edit_id: edit_id.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.edit_id, self.model)
    }
}

/// Interleave edits and models so every model has equal edit coverage at
/// any prefix: `(e1,m1)..(e1,mM), (e2,m1)..`.
pub fn build_execution_order<'a, E, M>(edits: &'a [E], models: &'a [M]) -> Vec<(&'a E, &'a M)> {
    let mut pairs = Vec::with_capacity(edits.len() * models.len());
    for edit in edits {
        for model in models {
            pairs.push((edit, model));
        }
    }
    pairs
}
