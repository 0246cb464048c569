//! Recon controller: turns cache mirror notifications into queued keys and drives
//! idempotent reconciliation of each key until it succeeds.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use kube::core::DynamicObject;
use recon_core::{deletion_key_for, key_for, resource_version, DeletedObject, EventHandler, Notification, ObjectKey};
use recon_queue::WorkQueue;
use recon_store::{Informer, Lister};
use tokio::sync::watch;
use tracing::{debug, info, warn};

mod error;
mod lifecycle;
mod worker;

pub use error::{handle_error, ControllerError};
pub use lifecycle::LifecycleState;

/// Domain half of a sync: bring one object to its desired state.
///
/// Called with the current cached object, possibly many times for the same state;
/// implementations must be idempotent. An error schedules a retry with backoff.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, key: &ObjectKey, obj: Arc<DynamicObject>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Queue name, used as log and metrics label.
    pub name: String,
    /// Upper bound on the initial cache sync wait.
    pub cache_sync_timeout: Duration,
    /// Drop a key after this many consecutive failures. `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { name: "crontab-controller".to_string(), cache_sync_timeout: Duration::from_secs(60), max_retries: None }
    }
}

/// Result of a successful sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Reconciled,
    /// Object is gone from the cache; deletion is complete.
    NotFound,
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncOutcome::Reconciled => "reconciled",
            SyncOutcome::NotFound => "not_found",
        })
    }
}

pub struct Controller {
    config: ControllerConfig,
    queue: WorkQueue<ObjectKey>,
    lister: Arc<dyn Lister>,
    reconciler: Arc<dyn Reconciler>,
    state: watch::Sender<LifecycleState>,
}

impl Controller {
    pub fn new(config: ControllerConfig, lister: Arc<dyn Lister>, reconciler: Arc<dyn Reconciler>) -> Arc<Self> {
        let queue = WorkQueue::with_default_rate_limiter(config.name.clone());
        Self::with_queue(config, queue, lister, reconciler)
    }

    pub fn with_queue(
        config: ControllerConfig,
        queue: WorkQueue<ObjectKey>,
        lister: Arc<dyn Lister>,
        reconciler: Arc<dyn Reconciler>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(LifecycleState::Created);
        info!(queue = %config.name, "setting up controller");
        Arc::new(Self { config, queue, lister, reconciler, state })
    }

    /// Controller reading from `informer`'s mirror and subscribed to its notifications.
    pub fn for_informer(config: ControllerConfig, informer: &Informer, reconciler: Arc<dyn Reconciler>) -> Arc<Self> {
        let controller = Self::new(config, Arc::new(informer.mirror()), reconciler);
        informer.add_event_handler(controller.clone());
        controller
    }

    pub fn queue(&self) -> &WorkQueue<ObjectKey> { &self.queue }

    pub fn config(&self) -> &ControllerConfig { &self.config }

    /// Normalize any notification into a queued key.
    pub fn handle_notification(&self, n: Notification<DynamicObject>) {
        let kind = n.kind();
        let key = match &n {
            Notification::Add(obj) => key_for(&**obj),
            Notification::Update { old, new } => {
                if resource_version(&**old) == resource_version(&**new) {
                    debug!(rv = ?resource_version(&**new), "resource version unchanged; update ignored");
                    return;
                }
                key_for(&**new)
            }
            Notification::Delete(obj) => deletion_key_for(obj),
        };
        match key {
            Ok(key) => {
                debug!(key = %key, event = kind, "enqueue");
                self.queue.add(key);
            }
            Err(source) => handle_error(&ControllerError::MalformedEvent { kind, source }),
        }
    }

    /// Resolve `key` against the cache and reconcile it.
    ///
    /// A key missing from the cache is a finished deletion and counts as success.
    pub async fn sync_handler(&self, key: &ObjectKey) -> Result<SyncOutcome, ControllerError> {
        let (namespace, name) = key.split().map_err(ControllerError::InvalidKey)?;
        let obj = self
            .lister
            .get(namespace, name)
            .map_err(|source| ControllerError::Lister { key: key.clone(), source })?;
        let Some(obj) = obj else {
            warn!(key = %key, "object deleted");
            return Ok(SyncOutcome::NotFound);
        };
        debug!(key = %key, rv = ?resource_version(&*obj), "try to process");
        self.reconciler
            .reconcile(key, obj)
            .await
            .map_err(|source| ControllerError::Reconcile { key: key.clone(), source })?;
        Ok(SyncOutcome::Reconciled)
    }
}

impl EventHandler<DynamicObject> for Controller {
    fn on_add(&self, obj: Arc<DynamicObject>) { self.handle_notification(Notification::Add(obj)) }

    fn on_update(&self, old: Arc<DynamicObject>, new: Arc<DynamicObject>) {
        self.handle_notification(Notification::Update { old, new })
    }

    fn on_delete(&self, obj: DeletedObject<DynamicObject>) { self.handle_notification(Notification::Delete(obj)) }
}
