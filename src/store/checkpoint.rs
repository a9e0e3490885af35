use crate::snapshot::WorkKey;
use crate::util::write_atomic;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointFile {
    #[serde(default)]
    completed: Vec<WorkKey>,
}

/// Durable set of completed work items.
///
/// The whole set is rewritten after every completed item.
#[derive(Debug)]
pub struct Checkpoint {
    path: PathBuf,
    completed: BTreeSet<WorkKey>,
}

impl Checkpoint {
    /// Load the checkpoint at `path`; a missing file is an empty set.
    ///
    /// An unreadable file is moved aside to `<path>.corrupt` and the run
    /// starts from an empty set (items are re-run, never lost).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let completed = match read_completed(path)? {
            Ok(completed) => completed,
            Err(err) => {
                let aside = corrupt_path(path);
                tracing::warn!(
                    path = %path.display(),
                    moved_to = %aside.display(),
                    error = %err,
                    "Checkpoint is corrupt; starting from an empty set"
                );
                fs::rename(path, &aside).with_context(|| {
                    format!("Failed to move corrupt checkpoint {}", path.display())
                })?;
                BTreeSet::new()
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            completed,
        })
    }

    /// Read-only variant of [`Checkpoint::load`] for planning: a corrupt
    /// file is reported and treated as empty but left where it is.
    pub fn peek(path: &Path) -> anyhow::Result<Self> {
        let completed = match read_completed(path)? {
            Ok(completed) => completed,
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "Checkpoint is corrupt; a real run would move it aside and start over"
                );
                BTreeSet::new()
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            completed,
        })
    }

    pub fn contains(&self, key: &WorkKey) -> bool {
        self.completed.contains(key)
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &WorkKey> {
        self.completed.iter()
    }

    /// Add `key` and persist the full set before returning.
    /// On a failed write the in-memory set is left as it was.
    pub fn mark_completed(&mut self, key: WorkKey) -> anyhow::Result<()> {
        if !self.completed.insert(key.clone()) {
            return Ok(());
        }
        if let Err(err) = self.save() {
            self.completed.remove(&key);
            return Err(err);
        }
        Ok(())
    }

    fn save(&self) -> anyhow::Result<()> {
        let file = CheckpointFile {
            completed: self.completed.iter().cloned().collect(),
        };
        let content = serde_json::to_string_pretty(&file)?;
        write_atomic(&self.path, &content)
            .with_context(|| format!("Failed to write checkpoint {}", self.path.display()))
    }
}

/// Outer error: the file exists but cannot be read. Inner error: it does
/// not parse.
fn read_completed(
    path: &Path,
) -> anyhow::Result<Result<BTreeSet<WorkKey>, serde_json::Error>> {
    if !path.exists() {
        return Ok(Ok(BTreeSet::new()));
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read checkpoint {}", path.display()))?;
    Ok(serde_json::from_str::<CheckpointFile>(&content)
        .map(|file| file.completed.into_iter().collect()))
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".corrupt");
    PathBuf::from(name)
}
