//! Worker loop: pop a key, sync it, settle it back into the queue.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use metrics::counter;
use rekon_core::{ObjectKey, SyncOutcome};
use rekon_queue::WorkQueue;
use tracing::{debug, error, warn};

use crate::reconciler::{ReconcileError, Reconciler};

pub(crate) async fn run_worker(
    id: usize,
    queue: Arc<WorkQueue<ObjectKey>>,
    reconciler: Arc<dyn Reconciler>,
    sync_timeout: Duration,
) {
    debug!(worker = id, "worker started");
    while let Some(key) = queue.get().await {
        process_item(&queue, reconciler.as_ref(), key, sync_timeout).await;
    }
    debug!(worker = id, "worker stopped");
}

fn panic_message(p: &(dyn Any + Send)) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// One sync attempt for `key`; always ends with `done(key)`.
pub(crate) async fn process_item(
    queue: &WorkQueue<ObjectKey>,
    reconciler: &dyn Reconciler,
    key: ObjectKey,
    sync_timeout: Duration,
) {
    let attempt = tokio::time::timeout(sync_timeout, reconciler.sync(&key));
    let result = match AssertUnwindSafe(attempt).catch_unwind().await {
        Ok(Ok(res)) => res,
        Ok(Err(_elapsed)) => Err(ReconcileError::Timeout(sync_timeout)),
        Err(payload) => Err(ReconcileError::Panicked(panic_message(payload.as_ref()))),
    };

    match result {
        Ok(SyncOutcome::Synced) => queue.forget(&key),
        Ok(SyncOutcome::Requeue) => {
            debug!(key = %key, "sync asked for requeue");
            queue.add_rate_limited(key.clone());
        }
        Err(e) => {
            counter!("rekon_sync_errors_total", 1u64);
            if matches!(e, ReconcileError::Panicked(_)) {
                error!(key = %key, error = %e, "sync panicked; requeueing");
            } else {
                warn!(key = %key, error = %e, retries = queue.num_requeues(&key), "sync failed; requeueing with backoff");
            }
            queue.add_rate_limited(key.clone());
        }
    }
    queue.done(&key);
}
