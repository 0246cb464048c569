use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures::FutureExt;
use metrics::{counter, histogram};
use recon_core::ObjectKey;
use tracing::{debug, info, warn};

use crate::{handle_error, Controller, ControllerError};

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Controller {
    pub(crate) async fn run_worker(&self, id: usize) {
        debug!(worker = id, "worker started");
        while self.process_next_item().await {}
        debug!(worker = id, "worker stopped");
    }

    /// Take one key off the queue and dispatch it. False once the queue is shut down.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else { return false };
        self.dispatch(&key).await;
        self.queue.done(&key);
        true
    }

    async fn dispatch(&self, key: &ObjectKey) {
        if let Err(e) = key.split() {
            self.queue.forget(key);
            handle_error(&ControllerError::InvalidKey(e));
            return;
        }

        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.sync_handler(key)).catch_unwind().await;
        histogram!("reconcile_duration_ms", started.elapsed().as_secs_f64() * 1000.0);

        match outcome {
            Ok(Ok(result)) => {
                counter!("reconcile_total", 1u64, "result" => "success");
                self.queue.forget(key);
                info!(key = %key, outcome = %result, "successfully synced");
            }
            Ok(Err(e)) => {
                counter!("reconcile_total", 1u64, "result" => "error");
                handle_error(&e);
                self.requeue(key);
            }
            Err(payload) => {
                counter!("controller_panics_total", 1u64);
                counter!("reconcile_total", 1u64, "result" => "panic");
                handle_error(&ControllerError::Panicked { key: key.clone(), message: panic_message(&*payload) });
                self.requeue(key);
            }
        }
    }

    fn requeue(&self, key: &ObjectKey) {
        let failures = self.queue.num_requeues(key);
        match self.config.max_retries {
            Some(max) if failures >= max => {
                warn!(key = %key, failures, "retry limit reached; dropping key");
                self.queue.forget(key);
            }
            _ => self.queue.add_rate_limited(key.clone()),
        }
    }
}
