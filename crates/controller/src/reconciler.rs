//! Sync function: drive one object toward its desired state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::core::DynamicObject;
use metrics::{counter, histogram};
use rekon_core::{KeyError, ObjectKey, SyncOutcome};
use rekon_kubehub::{ClientError, ResourceClient, Store};
use serde_json::json;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),
    #[error("api call failed: {0}")]
    Client(#[from] ClientError),
    #[error("cleanup of dependents failed: {0:#}")]
    Cleanup(anyhow::Error),
    #[error("sync timed out after {0:?}")]
    Timeout(Duration),
    #[error("sync panicked: {0}")]
    Panicked(String),
}

/// Removes resources owned by an object that is being deleted.
#[async_trait::async_trait]
pub trait Deleter: Send + Sync {
    /// Delete what `obj` owns. Returns how many dependents are still present.
    async fn delete_dependents(&self, obj: &DynamicObject) -> anyhow::Result<usize>;
}

/// Deleter for kinds without dependents.
pub struct NoopDeleter;

#[async_trait::async_trait]
impl Deleter for NoopDeleter {
    async fn delete_dependents(&self, _obj: &DynamicObject) -> anyhow::Result<usize> {
        Ok(0)
    }
}

#[async_trait::async_trait]
pub trait Reconciler: Send + Sync {
    async fn sync(&self, key: &ObjectKey) -> Result<SyncOutcome, ReconcileError>;

    /// Sync a key given in its rendered `namespace/name` form.
    async fn sync_str(&self, raw: &str) -> Result<SyncOutcome, ReconcileError> {
        let key: ObjectKey = raw.parse()?;
        self.sync(&key).await
    }
}

/// Reconciler reading from the informer cache and acting through a [`ResourceClient`].
pub struct ObjectReconciler {
    store: Store,
    client: Arc<dyn ResourceClient>,
    deleter: Arc<dyn Deleter>,
    finalizer: Option<String>,
    observed_generation: bool,
}

fn has_finalizer(obj: &DynamicObject, finalizer: &str) -> bool {
    obj.metadata.finalizers.as_ref().is_some_and(|f| f.iter().any(|x| x == finalizer))
}

impl ObjectReconciler {
    pub fn new(store: Store, client: Arc<dyn ResourceClient>, deleter: Arc<dyn Deleter>) -> Self {
        Self { store, client, deleter, finalizer: None, observed_generation: false }
    }

    pub fn with_finalizer(mut self, finalizer: Option<String>) -> Self {
        self.finalizer = finalizer;
        self
    }

    pub fn with_observed_generation(mut self, on: bool) -> Self {
        self.observed_generation = on;
        self
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<SyncOutcome, ReconcileError> {
        let Some(obj) = self.store.get(key) else {
            info!(key = %key, "object has been deleted");
            return Ok(SyncOutcome::Synced);
        };
        if obj.metadata.deletion_timestamp.is_some() {
            return self.finalize(key, &obj).await;
        }
        if let Some(f) = &self.finalizer {
            if !has_finalizer(&obj, f) {
                let mut finalizers = obj.metadata.finalizers.clone().unwrap_or_default();
                finalizers.push(f.clone());
                self.patch_finalizers(key, &obj, finalizers).await?;
                debug!(key = %key, finalizer = %f, "finalizer added");
            }
        }
        if self.observed_generation {
            self.record_generation(key, &obj).await?;
        }
        debug!(key = %key, "in sync");
        Ok(SyncOutcome::Synced)
    }

    async fn finalize(&self, key: &ObjectKey, obj: &DynamicObject) -> Result<SyncOutcome, ReconcileError> {
        let remaining = self.deleter.delete_dependents(obj).await.map_err(ReconcileError::Cleanup)?;
        if remaining > 0 {
            info!(key = %key, remaining, "dependents still terminating");
            return Ok(SyncOutcome::Requeue);
        }
        if let Some(f) = &self.finalizer {
            if has_finalizer(obj, f) {
                let finalizers: Vec<String> = obj
                    .metadata
                    .finalizers
                    .iter()
                    .flatten()
                    .filter(|x| *x != f)
                    .cloned()
                    .collect();
                self.patch_finalizers(key, obj, finalizers).await?;
                info!(key = %key, finalizer = %f, "cleanup finished; finalizer removed");
            }
        }
        Ok(SyncOutcome::Synced)
    }

    async fn patch_finalizers(&self, key: &ObjectKey, obj: &DynamicObject, finalizers: Vec<String>) -> Result<(), ClientError> {
        // resourceVersion makes the list replacement conditional on what we read.
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": obj.metadata.resource_version,
            }
        });
        self.client.patch(key, &patch).await?;
        Ok(())
    }

    async fn record_generation(&self, key: &ObjectKey, obj: &DynamicObject) -> Result<(), ClientError> {
        let Some(generation) = obj.metadata.generation else { return Ok(()) };
        let observed = obj.data.pointer("/status/observedGeneration").and_then(|v| v.as_i64());
        if observed == Some(generation) {
            return Ok(());
        }
        self.client.patch_status(key, &json!({ "status": { "observedGeneration": generation } })).await?;
        debug!(key = %key, generation, "observed generation recorded");
        Ok(())
    }
}

#[async_trait::async_trait]
impl Reconciler for ObjectReconciler {
    async fn sync(&self, key: &ObjectKey) -> Result<SyncOutcome, ReconcileError> {
        let started = Instant::now();
        let res = match self.reconcile(key).await {
            // Gone between the cache read and the write: nothing left to do.
            Err(ReconcileError::Client(e)) if e.is_not_found() => {
                info!(key = %key, "object disappeared during sync");
                Ok(SyncOutcome::Synced)
            }
            other => other,
        };
        let elapsed = started.elapsed();
        histogram!("rekon_sync_duration_ms", elapsed.as_secs_f64() * 1000.0);
        let outcome = match &res {
            Ok(SyncOutcome::Synced) => "synced",
            Ok(SyncOutcome::Requeue) => "requeue",
            Err(_) => "error",
        };
        counter!("rekon_syncs_total", 1u64, "outcome" => outcome);
        info!(key = %key, elapsed_ms = elapsed.as_millis() as u64, outcome, "finished syncing");
        res
    }
}
