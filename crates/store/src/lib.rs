//! Recon store: in-RAM cache mirror, lister and informer fan-out of watch events

#![forbid(unsafe_code)]

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::{Stream, StreamExt};
use kube::core::DynamicObject;
use kube::runtime::watcher::Event;
use metrics::counter;
use recon_core::{key_for, DeletedObject, EventHandler, Notification, ObjectKey, Tombstone};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio::time::{Instant, Interval};
use tracing::{debug, info, warn};

type Items = FxHashMap<ObjectKey, Arc<DynamicObject>>;

/// Local mirror of watched objects keyed by `namespace/name`. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct CacheMirror {
    items: Arc<RwLock<Items>>,
}

impl CacheMirror {
    pub fn new() -> Self { Self::default() }

    pub fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<DynamicObject>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    pub fn len(&self) -> usize { self.items.read().unwrap_or_else(PoisonError::into_inner).len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Keys in sorted order.
    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<_> = self.items.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Objects sorted by key.
    pub fn list(&self) -> Vec<(ObjectKey, Arc<DynamicObject>)> {
        let mut out: Vec<_> = self
            .items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn upsert(&self, key: ObjectKey, obj: Arc<DynamicObject>) -> Option<Arc<DynamicObject>> {
        self.items.write().unwrap_or_else(PoisonError::into_inner).insert(key, obj)
    }

    fn remove(&self, key: &ObjectKey) -> Option<Arc<DynamicObject>> {
        self.items.write().unwrap_or_else(PoisonError::into_inner).remove(key)
    }

    fn replace(&self, next: Items) -> Items {
        std::mem::replace(&mut *self.items.write().unwrap_or_else(PoisonError::into_inner), next)
    }
}

/// Point-in-time reads served from the mirror, no network access.
pub trait Lister: Send + Sync {
    /// `Ok(None)` when the object is not in the mirror.
    fn get(&self, namespace: Option<&str>, name: &str) -> anyhow::Result<Option<Arc<DynamicObject>>>;
}

impl Lister for CacheMirror {
    fn get(&self, namespace: Option<&str>, name: &str) -> anyhow::Result<Option<Arc<DynamicObject>>> {
        Ok(self.get_by_key(&ObjectKey::new(namespace, name)))
    }
}

/// Applies watch events to a [`CacheMirror`] and fans the resulting changes out to handlers.
pub struct Informer {
    mirror: CacheMirror,
    handlers: RwLock<Vec<Arc<dyn EventHandler<DynamicObject>>>>,
    synced_tx: watch::Sender<bool>,
}

impl Default for Informer {
    fn default() -> Self { Self::new() }
}

impl Informer {
    pub fn new() -> Self {
        let (synced_tx, _) = watch::channel(false);
        Self { mirror: CacheMirror::new(), handlers: RwLock::new(Vec::new()), synced_tx }
    }

    pub fn mirror(&self) -> CacheMirror { self.mirror.clone() }

    /// Register a handler. Objects already mirrored are replayed to it as adds.
    pub fn add_event_handler(&self, handler: Arc<dyn EventHandler<DynamicObject>>) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        for (_, obj) in self.mirror.list() {
            handler.on_add(obj);
        }
        handlers.push(handler);
    }

    /// True once the first full list has been applied.
    pub fn has_synced(&self) -> bool { *self.synced_tx.borrow() }

    pub fn subscribe_synced(&self) -> watch::Receiver<bool> { self.synced_tx.subscribe() }

    fn notify(&self, n: Notification<DynamicObject>) {
        counter!("informer_events_total", 1u64, "kind" => n.kind());
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner).clone();
        for h in handlers {
            n.clone().dispatch(h.as_ref());
        }
    }

    fn keyed(obj: &DynamicObject) -> Option<ObjectKey> {
        match key_for(obj) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(error = %e, "dropping watch event for object without identity");
                None
            }
        }
    }

    /// Apply one watch event.
    pub fn apply(&self, ev: Event<DynamicObject>) {
        match ev {
            Event::Applied(o) => self.applied(o),
            Event::Deleted(o) => self.deleted(o),
            Event::Restarted(list) => self.restarted(list),
        }
    }

    fn applied(&self, obj: DynamicObject) {
        let Some(key) = Self::keyed(&obj) else { return };
        let new = Arc::new(obj);
        match self.mirror.upsert(key, Arc::clone(&new)) {
            Some(old) => self.notify(Notification::Update { old, new }),
            None => self.notify(Notification::Add(new)),
        }
    }

    fn deleted(&self, obj: DynamicObject) {
        let Some(key) = Self::keyed(&obj) else { return };
        self.mirror.remove(&key);
        self.notify(Notification::Delete(DeletedObject::Live(Arc::new(obj))));
    }

    fn restarted(&self, list: Vec<DynamicObject>) {
        debug!(count = list.len(), "relist");
        let mut next = Items::default();
        let mut order = Vec::with_capacity(list.len());
        for obj in list {
            let Some(key) = Self::keyed(&obj) else { continue };
            order.push(key.clone());
            next.insert(key, Arc::new(obj));
        }
        let mut previous = self.mirror.replace(next.clone());

        for key in order {
            let Some(new) = next.remove(&key) else { continue };
            match previous.remove(&key) {
                Some(old) => self.notify(Notification::Update { old, new }),
                None => self.notify(Notification::Add(new)),
            }
        }
        let mut vanished: Vec<_> = previous.into_iter().collect();
        vanished.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, last_known) in vanished {
            self.notify(Notification::Delete(DeletedObject::Tombstone(Tombstone { key, last_known })));
        }

        if !self.synced_tx.send_replace(true) {
            info!(objects = self.mirror.len(), "cache mirror synced");
        }
    }

    /// Replay every mirrored object as an update onto itself.
    pub fn resync(&self) {
        let items = self.mirror.list();
        debug!(count = items.len(), "resync");
        for (_, obj) in items {
            self.notify(Notification::Update { old: Arc::clone(&obj), new: obj });
        }
    }
}

async fn tick(resync: &mut Option<Interval>) {
    match resync {
        Some(iv) => {
            iv.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Drive `informer` from a watch stream until the stream ends or `stop` flips to true.
///
/// Stream errors are logged and skipped; the stream is expected to back off on its own.
pub async fn run_informer<S, E>(
    stream: S,
    informer: Arc<Informer>,
    resync_period: Option<Duration>,
    mut stop: watch::Receiver<bool>,
) where
    S: Stream<Item = Result<Event<DynamicObject>, E>> + Send,
    E: std::fmt::Display,
{
    futures::pin_mut!(stream);
    let mut resync = resync_period
        .filter(|p| !p.is_zero())
        .map(|p| tokio::time::interval_at(Instant::now() + p, p));
    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            ev = stream.next() => match ev {
                Some(Ok(ev)) => informer.apply(ev),
                Some(Err(e)) => warn!(error = %e, "watch error"),
                None => {
                    warn!("watch stream ended");
                    break;
                }
            },
            _ = tick(&mut resync) => informer.resync(),
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    info!("informer stopped");
}

/// Wait up to `bound` for the mirror's first full list. False on timeout or if the informer went away.
pub async fn wait_for_cache_sync(mut synced: watch::Receiver<bool>, bound: Duration) -> bool {
    matches!(tokio::time::timeout(bound, synced.wait_for(|s| *s)).await, Ok(Ok(_)))
}
