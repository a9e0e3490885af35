//! Durable run state: the checkpoint, verdict files, and the run lock.

pub mod checkpoint;
pub mod lock;
pub mod verdicts;

pub use checkpoint::Checkpoint;
pub use lock::RunLock;
pub use verdicts::{RecordStatus, VerdictRecord, VerdictStore};
