use std::time::Duration;

use metrics::counter;
use recon_core::{KeyError, ObjectKey};
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("timed out after {0:?} waiting for cache sync")]
    CacheSyncTimeout(Duration),
    #[error("malformed {kind} event: {source}")]
    MalformedEvent {
        kind: &'static str,
        #[source]
        source: KeyError,
    },
    #[error("invalid key in queue: {0}")]
    InvalidKey(#[source] KeyError),
    #[error("reading {key} from cache: {source:#}")]
    Lister {
        key: ObjectKey,
        #[source]
        source: anyhow::Error,
    },
    #[error("sync {key}: {source:#}")]
    Reconcile {
        key: ObjectKey,
        #[source]
        source: anyhow::Error,
    },
    #[error("sync {key} panicked: {message}")]
    Panicked { key: ObjectKey, message: String },
    #[error("worker task failed: {0}")]
    Worker(#[source] tokio::task::JoinError),
}

impl ControllerError {
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerError::CacheSyncTimeout(_) => "cache_sync_timeout",
            ControllerError::MalformedEvent { .. } => "malformed_event",
            ControllerError::InvalidKey(_) => "invalid_key",
            ControllerError::Lister { .. } => "lister",
            ControllerError::Reconcile { .. } => "reconcile",
            ControllerError::Panicked { .. } => "panic",
            ControllerError::Worker(_) => "worker",
        }
    }
}

/// Process-wide sink for errors that are handled locally and never propagate.
pub fn handle_error(err: &ControllerError) {
    counter!("controller_handled_errors_total", 1u64, "kind" => err.kind());
    error!(error = %err, kind = err.kind(), "handled error");
}
