//! Rekon controller: turns watch notifications into deduplicated, rate-limited
//! sync work and runs it on a fixed pool of workers.
//!
//! Flow: informer events -> [`ChangeFilter`] -> [`WorkQueue`] -> workers -> [`Reconciler`].
//! Each key is synced by at most one worker at a time; failures come back
//! through the queue's rate limiter instead of a full resync.

#![forbid(unsafe_code)]

pub mod config;
pub mod filter;
pub mod reconciler;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use kube::core::DynamicObject;
use metrics::counter;
use rekon_core::ObjectKey;
use rekon_kubehub::{key_of, EventHandler, EventSource, ResourceClient, Store};
use rekon_queue::WorkQueue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub use config::ControllerConfig;
pub use filter::ChangeFilter;
pub use reconciler::{Deleter, NoopDeleter, ObjectReconciler, ReconcileError, Reconciler};

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("caches did not sync within {0:?}")]
    CacheSync(Duration),
}

/// Feeds the queue from informer callbacks.
struct EnqueueHandler {
    queue: Arc<WorkQueue<ObjectKey>>,
    filter: ChangeFilter,
    grace_period: Duration,
    /// Set when no periodic resync is registered to deliver new objects.
    enqueue_adds: bool,
}

impl EnqueueHandler {
    fn key(&self, obj: &DynamicObject) -> Option<ObjectKey> {
        match key_of(obj) {
            Ok(k) => Some(k),
            Err(e) => {
                // Unkeyable objects can never be looked up again; the event is lost.
                error!(error = %e, uid = ?obj.metadata.uid, "couldn't get key for object; dropping event");
                counter!("rekon_dropped_events_total", 1u64);
                None
            }
        }
    }
}

impl EventHandler for EnqueueHandler {
    fn on_add(&self, obj: &Arc<DynamicObject>) {
        if !self.enqueue_adds {
            // Creations are picked up by the periodic resync.
            trace!(name = ?obj.metadata.name, "add observed");
            return;
        }
        if let Some(key) = self.key(obj) {
            debug!(key = %key, "add enqueue");
            self.queue.add(key);
        }
    }

    fn on_update(&self, old: &Arc<DynamicObject>, new: &Arc<DynamicObject>) {
        if !self.filter.should_resync(old, new) {
            return;
        }
        if let Some(key) = self.key(new) {
            debug!(key = %key, "update enqueue");
            self.queue.add(key);
        }
    }

    fn on_delete(&self, obj: &Arc<DynamicObject>) {
        if let Some(key) = self.key(obj) {
            debug!(key = %key, grace_ms = self.grace_period.as_millis() as u64, "delete enqueue");
            self.queue.add_after(key, self.grace_period);
        }
    }

    fn on_resync(&self, obj: &Arc<DynamicObject>) {
        if let Some(key) = self.key(obj) {
            self.queue.add(key);
        }
    }
}

/// One controller instance: a queue, a cache handle and a sync function.
pub struct Controller {
    queue: Arc<WorkQueue<ObjectKey>>,
    store: Store,
    reconciler: Arc<dyn Reconciler>,
    config: ControllerConfig,
}

impl Controller {
    /// Wire the default [`ObjectReconciler`] to `source`.
    pub fn new(
        client: Arc<dyn ResourceClient>,
        source: &mut dyn EventSource,
        deleter: Arc<dyn Deleter>,
        config: ControllerConfig,
    ) -> Self {
        let reconciler = ObjectReconciler::new(source.store(), client, deleter)
            .with_finalizer(config.finalizer.clone())
            .with_observed_generation(config.observed_generation);
        Self::with_reconciler(source, Arc::new(reconciler), config)
    }

    /// Wire a custom sync function to `source`.
    pub fn with_reconciler(source: &mut dyn EventSource, reconciler: Arc<dyn Reconciler>, config: ControllerConfig) -> Self {
        let queue = Arc::new(WorkQueue::new(config.name.clone(), config.rate_limiter()));
        let handler = EnqueueHandler {
            queue: Arc::clone(&queue),
            filter: ChangeFilter::new(config.spec_fields.clone()),
            grace_period: config.grace_period,
            enqueue_adds: config.resync.is_zero(),
        };
        if config.resync.is_zero() {
            warn!(controller = %config.name, "resync disabled; enqueueing creations directly");
        }
        source.add_event_handler(Arc::new(handler), config.resync);
        Self { queue, store: source.store(), reconciler, config }
    }

    pub fn queue(&self) -> Arc<WorkQueue<ObjectKey>> {
        Arc::clone(&self.queue)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Wait for the cache, start `workers` workers and block until `shutdown`.
    ///
    /// A cache that fails to sync in time is logged and the workers start
    /// anyway, unless `strict_cache_sync` is set. On shutdown the queue stops
    /// handing out keys; syncs already running are awaited.
    pub async fn run(self, workers: usize, shutdown: CancellationToken) -> Result<(), ControllerError> {
        info!(controller = %self.config.name, workers, "starting controller");

        let synced = tokio::select! {
            _ = shutdown.cancelled() => {
                self.queue.shut_down();
                info!(controller = %self.config.name, "shut down before caches synced");
                return Ok(());
            }
            r = tokio::time::timeout(self.config.cache_sync_timeout, self.store.wait_for_sync()) => r.is_ok(),
        };
        if !synced {
            if self.config.strict_cache_sync {
                self.queue.shut_down();
                error!(timeout = ?self.config.cache_sync_timeout, "failed to wait for caches to sync");
                return Err(ControllerError::CacheSync(self.config.cache_sync_timeout));
            }
            error!(timeout = ?self.config.cache_sync_timeout, "failed to wait for caches to sync; starting workers anyway");
        }

        let handles: Vec<_> = (0..workers.max(1))
            .map(|id| {
                tokio::spawn(worker::run_worker(
                    id,
                    Arc::clone(&self.queue),
                    Arc::clone(&self.reconciler),
                    self.config.sync_timeout,
                ))
            })
            .collect();

        shutdown.cancelled().await;
        info!(controller = %self.config.name, "shutting down controller");
        self.queue.shut_down();
        for res in futures::future::join_all(handles).await {
            if let Err(e) = res {
                error!(error = %e, "worker task failed");
            }
        }
        info!(controller = %self.config.name, "controller stopped");
        Ok(())
    }
}
