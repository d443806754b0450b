//! Informer: list+watch into the [`Store`] and fan out change notifications.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::{Stream, TryStreamExt};
use kube::{
    api::Api,
    core::DynamicObject,
    runtime::watcher::{self, Event},
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    key_of,
    store::{Snapshot, Store},
    strip_managed_fields,
};

/// Consumer of change notifications. Calls arrive sequentially from one task.
pub trait EventHandler: Send + Sync {
    fn on_add(&self, obj: &Arc<DynamicObject>);
    fn on_update(&self, old: &Arc<DynamicObject>, new: &Arc<DynamicObject>);
    fn on_delete(&self, obj: &Arc<DynamicObject>);
    /// Periodic re-delivery of a cached object. Defaults to an update with no change.
    fn on_resync(&self, obj: &Arc<DynamicObject>) {
        self.on_update(obj, obj);
    }
}

/// Something handlers can subscribe to, backed by a readable cache.
pub trait EventSource {
    /// Register `handler`; a non-zero `resync` re-delivers every cached object at that interval.
    fn add_event_handler(&mut self, handler: Arc<dyn EventHandler>, resync: Duration);
    fn store(&self) -> Store;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InformerConfig {
    /// Upper bound for the retry delay after a failed watch.
    pub watch_backoff_max: Duration,
    pub label_selector: Option<String>,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self { watch_backoff_max: Duration::from_secs(30), label_selector: None }
    }
}

struct Registration {
    handler: Arc<dyn EventHandler>,
    resync: Option<Duration>,
    next_resync: Option<Instant>,
}

/// Applies watch events to the store and notifies handlers, pairing each
/// update with the previously cached version.
#[derive(Default)]
pub struct Dispatcher {
    store: Store,
    handlers: Vec<Registration>,
}

impl Dispatcher {
    pub fn new(store: Store) -> Self {
        Self { store, handlers: Vec::new() }
    }

    pub fn dispatch(&self, event: Event<DynamicObject>) {
        match event {
            Event::Applied(obj) => self.applied(obj),
            Event::Deleted(obj) => self.deleted(obj),
            Event::Restarted(list) => self.restarted(list),
        }
    }

    fn applied(&self, mut obj: DynamicObject) {
        strip_managed_fields(&mut obj);
        let obj = Arc::new(obj);
        match self.store.apply(Arc::clone(&obj)) {
            Ok(Some(old)) => {
                counter!("rekon_informer_events_total", 1u64, "kind" => "update");
                for r in &self.handlers {
                    r.handler.on_update(&old, &obj);
                }
            }
            Ok(None) => {
                counter!("rekon_informer_events_total", 1u64, "kind" => "add");
                for r in &self.handlers {
                    r.handler.on_add(&obj);
                }
            }
            Err(e) => warn!(error = %e, "dropping watch event for object without usable key"),
        }
    }

    fn deleted(&self, mut obj: DynamicObject) {
        strip_managed_fields(&mut obj);
        match key_of(&obj) {
            Ok(key) => {
                self.store.delete(&key);
            }
            Err(e) => debug!(error = %e, "delete event for object without usable key"),
        }
        counter!("rekon_informer_events_total", 1u64, "kind" => "delete");
        // Handlers decide themselves what to do with keyless objects.
        let obj = Arc::new(obj);
        for r in &self.handlers {
            r.handler.on_delete(&obj);
        }
    }

    /// Replace the cache with a fresh list in one publish, then notify from
    /// the difference between the old and new contents.
    fn restarted(&self, list: Vec<DynamicObject>) {
        debug!(count = list.len(), "watch restart");
        let mut next = Snapshot::default();
        for mut obj in list {
            strip_managed_fields(&mut obj);
            match key_of(&obj) {
                Ok(key) => {
                    next.insert(key, Arc::new(obj));
                }
                Err(e) => warn!(error = %e, "dropping listed object without usable key"),
            }
        }
        let prev = self.store.replace_all(next);
        let current = self.store.snapshot();

        // Objects that vanished while we were disconnected.
        for (key, last) in prev.iter() {
            if current.contains_key(key) {
                continue;
            }
            counter!("rekon_informer_events_total", 1u64, "kind" => "delete");
            for r in &self.handlers {
                r.handler.on_delete(last);
            }
        }
        for (key, obj) in current.iter() {
            match prev.get(key) {
                Some(old) => {
                    counter!("rekon_informer_events_total", 1u64, "kind" => "update");
                    for r in &self.handlers {
                        r.handler.on_update(old, obj);
                    }
                }
                None => {
                    counter!("rekon_informer_events_total", 1u64, "kind" => "add");
                    for r in &self.handlers {
                        r.handler.on_add(obj);
                    }
                }
            }
        }
        if !self.store.has_synced() {
            info!(objects = current.len(), "initial list complete; cache synced");
            self.store.mark_synced();
        }
    }

    /// Re-deliver every cached object to every handler with resync enabled.
    pub fn resync(&self) {
        let objs = self.store.list();
        for r in self.handlers.iter().filter(|r| r.resync.is_some()) {
            for obj in &objs {
                r.handler.on_resync(obj);
            }
        }
    }

    /// Resync the handlers whose period elapsed at `now`.
    pub fn resync_due(&mut self, now: Instant) {
        let mut objs: Option<Vec<Arc<DynamicObject>>> = None;
        for r in &mut self.handlers {
            let (Some(period), Some(at)) = (r.resync, r.next_resync) else { continue };
            if at > now {
                continue;
            }
            let objs = objs.get_or_insert_with(|| self.store.list());
            debug!(objects = objs.len(), "periodic resync");
            counter!("rekon_informer_resyncs_total", 1u64);
            for obj in objs.iter() {
                r.handler.on_resync(obj);
            }
            r.next_resync = Some(now + period);
        }
    }

    /// Shortest resync period among the registered handlers.
    pub fn resync_period(&self) -> Option<Duration> {
        self.handlers.iter().filter_map(|r| r.resync).min()
    }
}

impl EventSource for Dispatcher {
    fn add_event_handler(&mut self, handler: Arc<dyn EventHandler>, resync: Duration) {
        let resync = (!resync.is_zero()).then_some(resync);
        let next_resync = resync.map(|p| Instant::now() + p);
        self.handlers.push(Registration { handler, resync, next_resync });
    }

    fn store(&self) -> Store {
        self.store.clone()
    }
}

/// Watches one collection and drives a [`Dispatcher`].
pub struct Informer {
    api: Api<DynamicObject>,
    config: InformerConfig,
    dispatcher: Dispatcher,
}

impl Informer {
    pub fn new(api: Api<DynamicObject>, config: InformerConfig) -> Self {
        Self { api, config, dispatcher: Dispatcher::new(Store::new()) }
    }

    /// Run list+watch until `shutdown` fires. Watch errors are retried with
    /// exponential backoff capped at `watch_backoff_max`; a watch stream that
    /// ends on its own is an error, since the cache would silently go stale.
    pub async fn run(mut self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut cfg = watcher::Config::default();
        if let Some(sel) = &self.config.label_selector {
            cfg = cfg.labels(sel);
        }
        let stream = watcher::watcher(self.api.clone(), cfg);
        info!(label_selector = ?self.config.label_selector, "informer started");
        let res = pump(&mut self.dispatcher, &self.config, stream, shutdown).await;
        info!("informer stopped");
        res
    }
}

/// Feed `stream` into `dispatcher`, ticking periodic resync alongside.
async fn pump<S>(
    dispatcher: &mut Dispatcher,
    config: &InformerConfig,
    stream: S,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    S: Stream<Item = Result<Event<DynamicObject>, watcher::Error>>,
{
    futures::pin_mut!(stream);

    let resync_enabled = dispatcher.resync_period().is_some();
    let tick = dispatcher.resync_period().unwrap_or(Duration::from_secs(1)).max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let floor = Duration::from_millis(500);
    let mut backoff = floor;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = ticker.tick(), if resync_enabled => {
                if dispatcher.store.has_synced() {
                    dispatcher.resync_due(Instant::now());
                }
            }
            ev = stream.try_next() => match ev {
                Ok(Some(ev)) => {
                    backoff = floor;
                    dispatcher.dispatch(ev);
                }
                Ok(None) => {
                    warn!("watcher stream ended");
                    return Err(anyhow!("watch stream ended unexpectedly"));
                }
                Err(e) => {
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "watch failed; retrying");
                    counter!("rekon_informer_watch_errors_total", 1u64);
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(config.watch_backoff_max.max(floor));
                }
            }
        }
    }
}

impl EventSource for Informer {
    fn add_event_handler(&mut self, handler: Arc<dyn EventHandler>, resync: Duration) {
        self.dispatcher.add_event_handler(handler, resync);
    }

    fn store(&self) -> Store {
        self.dispatcher.store()
    }
}
