use std::fmt;
use std::sync::Arc;

use recon_store::wait_for_cache_sync;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::{handle_error, Controller, ControllerError};

/// Controller phases, in the only order they can occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Created,
    CacheSyncing,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Created => "created",
            LifecycleState::CacheSyncing => "cache_syncing",
            LifecycleState::Running => "running",
            LifecycleState::ShuttingDown => "shutting_down",
            LifecycleState::Stopped => "stopped",
        })
    }
}

// Resolves once `stop` reads true or its sender is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) { let _ = stop.wait_for(|s| *s).await; }

impl Controller {
    pub fn state(&self) -> LifecycleState { *self.state.borrow() }

    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> { self.state.subscribe() }

    fn transition(&self, next: LifecycleState) {
        let prev = self.state.send_replace(next);
        info!(queue = %self.config.name, from = %prev, to = %next, "controller state changed");
    }

    /// Wait for the cache to sync, run `workers` workers until `stop` fires, then drain and join them.
    ///
    /// Errors only when the cache does not sync within the configured bound; no worker is started then.
    /// At least one worker always runs; a `workers` of 0 is raised to 1.
    pub async fn run(
        self: Arc<Self>,
        workers: usize,
        synced: watch::Receiver<bool>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), ControllerError> {
        info!(queue = %self.config.name, workers, "starting controller");
        self.transition(LifecycleState::CacheSyncing);

        let bound = self.config.cache_sync_timeout;
        let synced_in_time = tokio::select! {
            ok = wait_for_cache_sync(synced, bound) => Some(ok),
            _ = stopped(&mut stop) => None,
        };
        match synced_in_time {
            Some(true) => info!(queue = %self.config.name, "cache sync completed"),
            Some(false) => {
                error!(queue = %self.config.name, timeout = ?bound, "cache did not sync; refusing to start workers");
                self.queue.shut_down();
                self.transition(LifecycleState::Stopped);
                return Err(ControllerError::CacheSyncTimeout(bound));
            }
            None => {
                info!(queue = %self.config.name, "stop requested before cache sync");
                self.queue.shut_down();
                self.transition(LifecycleState::Stopped);
                return Ok(());
            }
        }

        self.transition(LifecycleState::Running);
        if workers == 0 {
            warn!(queue = %self.config.name, "worker count 0 raised to 1");
        }
        let mut pool = JoinSet::new();
        for id in 0..workers.max(1) {
            let controller = Arc::clone(&self);
            pool.spawn(async move { controller.run_worker(id).await });
        }

        stopped(&mut stop).await;
        self.transition(LifecycleState::ShuttingDown);
        self.queue.shut_down();
        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                handle_error(&ControllerError::Worker(e));
            }
        }
        self.transition(LifecycleState::Stopped);
        Ok(())
    }
}
