//! Recon core types: object identity keys, key extraction and change notifications

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use kube::Resource;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("object has no metadata.name")]
    MissingName,
    #[error("unexpected key format: {0:?}")]
    Malformed(String),
}

/// Identity of one resource object: `namespace/name`, or just `name` when cluster-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => Self(format!("{}/{}", ns, name)),
            _ => Self(name.to_string()),
        }
    }

    /// Wrap a raw key as-is. Malformed input is only reported by [`ObjectKey::split`].
    pub fn from_raw(raw: impl Into<String>) -> Self { Self(raw.into()) }

    pub fn as_str(&self) -> &str { &self.0 }

    /// Split into `(namespace, name)`; `None` namespace for cluster-scoped keys.
    pub fn split(&self) -> Result<(Option<&str>, &str), KeyError> {
        let mut parts = self.0.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, _) => Ok((None, name)),
            (Some(ns), Some(name), None) => Ok((Some(ns), name)),
            _ => Err(KeyError::Malformed(self.0.clone())),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl FromStr for ObjectKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = Self::from_raw(s);
        key.split()?;
        Ok(key)
    }
}

/// Last known state of an object whose deletion was observed only indirectly
/// (it vanished between two full lists).
#[derive(Debug, Clone)]
pub struct Tombstone<K> {
    pub key: ObjectKey,
    pub last_known: Arc<K>,
}

/// Payload of a delete notification.
#[derive(Debug, Clone)]
pub enum DeletedObject<K> {
    Live(Arc<K>),
    Tombstone(Tombstone<K>),
}

impl<K> DeletedObject<K> {
    pub fn object(&self) -> &Arc<K> {
        match self {
            DeletedObject::Live(o) => o,
            DeletedObject::Tombstone(t) => &t.last_known,
        }
    }
}

/// A single change observed on the cache mirror.
#[derive(Debug, Clone)]
pub enum Notification<K> {
    Add(Arc<K>),
    Update { old: Arc<K>, new: Arc<K> },
    Delete(DeletedObject<K>),
}

impl<K> Notification<K> {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Add(_) => "add",
            Notification::Update { .. } => "update",
            Notification::Delete(_) => "delete",
        }
    }

    /// Route to the matching callback of `handler`.
    pub fn dispatch(self, handler: &dyn EventHandler<K>) {
        match self {
            Notification::Add(o) => handler.on_add(o),
            Notification::Update { old, new } => handler.on_update(old, new),
            Notification::Delete(d) => handler.on_delete(d),
        }
    }
}

/// Subscriber to cache mirror changes. Callbacks must not block.
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, obj: Arc<K>);
    fn on_update(&self, old: Arc<K>, new: Arc<K>);
    fn on_delete(&self, obj: DeletedObject<K>);
}

/// Key of a live object.
pub fn key_for<K: Resource>(obj: &K) -> Result<ObjectKey, KeyError> {
    let meta = obj.meta();
    let name = meta.name.as_deref().ok_or(KeyError::MissingName)?;
    Ok(ObjectKey::new(meta.namespace.as_deref(), name))
}

/// Key of a deleted object; tombstones carry their key already.
pub fn deletion_key_for<K: Resource>(obj: &DeletedObject<K>) -> Result<ObjectKey, KeyError> {
    match obj {
        DeletedObject::Live(o) => key_for(&**o),
        DeletedObject::Tombstone(t) => Ok(t.key.clone()),
    }
}

pub fn resource_version<K: Resource>(obj: &K) -> Option<&str> {
    obj.meta().resource_version.as_deref()
}

pub mod prelude {
    pub use super::{
        deletion_key_for, key_for, resource_version, DeletedObject, EventHandler, KeyError, Notification, ObjectKey,
        Tombstone,
    };
}
