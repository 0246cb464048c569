use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use recon_controller::{Controller, ControllerConfig};
use recon_store::Informer;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

mod crontab;

use crontab::CronTabReconciler;

#[derive(Parser, Debug)]
#[command(name = "reconctl", version, about = "Level-based CronTab controller")]
struct Cli {
    /// GVK key to reconcile, e.g. "stable.example.com/v1beta1/CronTab"
    #[arg(long, env = "RECON_GVK", default_value = "stable.example.com/v1beta1/CronTab")]
    gvk: String,

    /// Restrict the watch to one namespace (default: all namespaces)
    #[arg(long = "ns", env = "RECON_NAMESPACE")]
    namespace: Option<String>,

    /// Number of parallel workers
    #[arg(long, env = "RECON_WORKERS", default_value_t = 1)]
    workers: usize,

    /// Replay every cached object this often (0 disables)
    #[arg(long = "resync-secs", env = "RECON_RESYNC_SECS", default_value_t = 30)]
    resync_secs: u64,

    /// Give up starting if the initial list does not finish in time
    #[arg(long = "cache-sync-timeout-secs", env = "RECON_CACHE_SYNC_TIMEOUT_SECS", default_value_t = 60)]
    cache_sync_timeout_secs: u64,

    /// Drop a key after this many consecutive failures (default: retry forever)
    #[arg(long = "max-retries", env = "RECON_MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Path to a kubeconfig file (default: inferred, then in-cluster)
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Work queue name used in logs and metrics
    #[arg(long = "queue-name", env = "RECON_QUEUE_NAME", default_value = "crontab-controller")]
    queue_name: String,
}

fn init_tracing() {
    let env = std::env::var("RECON_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RECON_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid RECON_METRICS_ADDR; expected host:port");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// First `next_signal` flips the returned stop channel; the second one runs `on_force`.
fn stop_on_signals<F, Fut>(mut next_signal: F, on_force: impl FnOnce() + Send + 'static) -> watch::Receiver<bool>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        next_signal().await;
        info!("shutdown signal received; draining workers (repeat to force exit)");
        let _ = stop_tx.send(true);
        next_signal().await;
        warn!("second shutdown signal; exiting immediately");
        on_force();
    });
    stop_rx
}

fn setup_signal_handler() -> watch::Receiver<bool> { stop_on_signals(shutdown_signal, || std::process::exit(1)) }

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    info!(gvk = %cli.gvk, ns = ?cli.namespace, workers = cli.workers, "reconctl starting");

    let client = recon_kubehub::client(cli.kubeconfig.as_deref()).await.context("error init k8s client")?;
    let api = recon_kubehub::api_for(client, &cli.gvk, cli.namespace.as_deref()).await?;
    let stop = setup_signal_handler();

    let informer = Arc::new(Informer::new());
    let config = ControllerConfig {
        name: cli.queue_name.clone(),
        cache_sync_timeout: Duration::from_secs(cli.cache_sync_timeout_secs),
        max_retries: cli.max_retries,
    };
    let controller = Controller::for_informer(config, &informer, Arc::new(CronTabReconciler));

    let resync = (cli.resync_secs > 0).then(|| Duration::from_secs(cli.resync_secs));
    let watcher_handle =
        tokio::spawn(recon_kubehub::start_informer(api, Arc::clone(&informer), resync, stop.clone()));

    let result = controller.run(cli.workers, informer.subscribe_synced(), stop).await;
    watcher_handle.abort();
    if let Err(e) = result {
        error!(error = %e, "error running controller");
        return Err(e).context("running crontab controller");
    }
    info!("controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::{mpsc, oneshot, Mutex};

    #[tokio::test]
    async fn first_signal_stops_and_second_forces_exit() {
        let (sig_tx, sig_rx) = mpsc::unbounded_channel::<()>();
        let sig_rx = Arc::new(Mutex::new(sig_rx));
        let next_signal = move || {
            let sig_rx = Arc::clone(&sig_rx);
            async move {
                sig_rx.lock().await.recv().await;
            }
        };
        let (forced_tx, mut forced_rx) = oneshot::channel::<()>();
        let mut stop = stop_on_signals(next_signal, move || {
            let _ = forced_tx.send(());
        });
        assert!(!*stop.borrow());

        sig_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), stop.wait_for(|s| *s)).await.unwrap().unwrap();
        assert!(forced_rx.try_recv().is_err());

        sig_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), forced_rx).await.unwrap().unwrap();
    }
}
