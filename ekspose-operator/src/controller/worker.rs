//! Worker loop: pull a key, reconcile it, feed the outcome back to the queue.

use super::reconciler::{ReconcileOutcome, Reconciler};
use crate::queue::WorkQueue;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay before a worker that died unexpectedly is started again.
pub const WORKER_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Process one key.
///
/// Returns `false` when the worker should stop: the queue is shut down and
/// drained, or `stop` was cancelled before a key became available.
pub async fn process_next_item(
    queue: &WorkQueue<String>,
    reconciler: &Reconciler,
    stop: &CancellationToken,
) -> bool {
    let key = tokio::select! {
        biased;
        _ = stop.cancelled() => return false,
        key = queue.get() => key,
    };
    let Some(key) = key else {
        return false;
    };

    let outcome = AssertUnwindSafe(reconciler.reconcile(&key))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| ReconcileOutcome::Failed("reconciler panicked".to_string()));

    match &outcome {
        ReconcileOutcome::Applied | ReconcileOutcome::DeletedCascade => {
            debug!(key = %key, outcome = %outcome, "Reconciled");
            queue.forget(&key);
        }
        ReconcileOutcome::NotFoundTransient => {
            debug!(key = %key, "Key dropped");
        }
        ReconcileOutcome::Failed(reason) => {
            warn!(
                key = %key,
                reason = %reason,
                requeues = queue.num_requeues(&key),
                "Reconcile failed, retrying with backoff"
            );
            queue.add_rate_limited(key.clone());
        }
    }
    queue.done(&key);
    true
}

async fn worker_loop(queue: Arc<WorkQueue<String>>, reconciler: Reconciler, stop: CancellationToken) {
    while process_next_item(&queue, &reconciler, &stop).await {}
}

/// Run worker `id` until `stop` fires or the queue shuts down.
///
/// A worker task that dies is started again after [`WORKER_RESTART_DELAY`].
pub async fn run_worker(
    id: usize,
    queue: Arc<WorkQueue<String>>,
    reconciler: Reconciler,
    stop: CancellationToken,
) {
    info!(worker = id, queue = %queue.name(), "Worker started");

    loop {
        let handle = tokio::spawn(worker_loop(
            Arc::clone(&queue),
            reconciler.clone(),
            stop.clone(),
        ));
        if let Err(e) = handle.await {
            error!(worker = id, error = %e, "Worker died");
        }

        if stop.is_cancelled() || queue.is_shutting_down() {
            break;
        }

        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(WORKER_RESTART_DELAY) => {
                info!(worker = id, "Restarting worker");
            }
        }
    }

    info!(worker = id, "Worker stopped");
}
