use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Outcome of a deadline-bounded execution.
#[derive(Debug, PartialEq, Eq)]
pub enum Timed<T> {
    Completed(T),
    TimedOut,
}

impl<T> Timed<T> {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Timed::TimedOut)
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Timed::Completed(value) => Some(value),
            Timed::TimedOut => None,
        }
    }
}

/// Run `task` on its own tokio task and wait at most `limit` for it.
///
/// On timeout the task is abandoned, not aborted: it keeps running in the
/// background, and its cancellation token is cancelled so it can stop at
/// the next turn boundary. An error returned by the task is passed through;
/// a panic becomes an error.
pub async fn run_with_timeout<F, Fut, T>(task: F, limit: Duration) -> anyhow::Result<Timed<T>>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(task(cancel.clone()));

    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(result)) => result.map(Timed::Completed),
        Ok(Err(join_err)) => Err(anyhow::anyhow!("Pipeline task failed: {}", join_err)),
        Err(_) => {
            cancel.cancel();
            Ok(Timed::TimedOut)
        }
    }
}
