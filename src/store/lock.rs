use anyhow::Context;
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Exclusive lock on `<state>.lock`, held for the duration of a run.
pub struct RunLock {
    file: fs::File,
    path: PathBuf,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl RunLock {
    /// Take the lock next to `state_path`, failing fast if another run has it.
    pub fn acquire(state_path: &Path) -> anyhow::Result<Self> {
        let mut name = state_path.as_os_str().to_owned();
        name.push(".lock");
        let path = PathBuf::from(name);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false) // Lock file content doesn't matter, just the lock
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Self { file, path }),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Err(anyhow::anyhow!(
                "Another run is using {} (lock held on {})",
                state_path.display(),
                path.display()
            )),
            Err(err) => Err(err.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
