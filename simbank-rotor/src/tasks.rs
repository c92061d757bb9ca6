//! Bounded task groups and scoped timing.
//!
//! Every stage of a rotation step does the same thing: spawn one task per
//! unit of work (pool, modem), wait for all of them, read the results. That
//! idiom lives here once instead of three times.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Spawn one task per future and join them all, preserving input order.
///
/// A full barrier: returns only once every task finished. Panicked tasks
/// are logged and omitted from the results; one broken modem handler must
/// not take the stage down with it.
pub async fn join_all<F, T>(label: &str, work: Vec<F>) -> Vec<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let handles: Vec<_> = work.into_iter().map(tokio::spawn).collect();
    futures::future::join_all(handles)
        .await
        .into_iter()
        .filter_map(|joined| match joined {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(label, "task failed: {e}");
                None
            }
        })
        .collect()
}

/// Sleep that respects shutdown; returns `false` when cancelled.
pub async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Logs the elapsed time of the scope it guards.
pub struct ScopedTimer {
    label: String,
    started: Instant,
}

impl ScopedTimer {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            started: Instant::now(),
        }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        debug!(
            label = %self.label,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "stage complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn results_come_back_in_input_order() {
        let futures: Vec<_> = (0..8)
            .map(|n| async move {
                // Later inputs finish first; order must still hold.
                tokio::time::sleep(std::time::Duration::from_millis(8 - n)).await;
                n
            })
            .collect();
        let results = join_all("test", futures).await;
        assert_eq!(results, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn a_panicking_task_is_dropped_not_propagated() {
        let futures = vec![
            Box::pin(async { 1u32 }) as std::pin::Pin<Box<dyn Future<Output = u32> + Send>>,
            Box::pin(async { panic!("broken modem") }),
            Box::pin(async { 3u32 }),
        ];
        let results = join_all("test", futures).await;
        assert_eq!(results, vec![1, 3]);
    }

    #[tokio::test]
    async fn empty_input_joins_immediately() {
        let results = join_all("test", Vec::<std::future::Ready<u8>>::new()).await;
        assert!(results.is_empty());
    }
}
