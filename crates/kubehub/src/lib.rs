//! Recon kubehub – client setup, discovery and list+watch wiring into the informer

#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Config,
};
use recon_store::{run_informer, Informer};
use tokio::sync::watch;
use tracing::info;

/// Build a client from an explicit kubeconfig path, or infer one (kubeconfig, then in-cluster).
pub async fn client(kubeconfig: Option<&Path>) -> Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default()).await?
        }
        None => Config::infer().await.context("inferring kube config")?,
    };
    Client::try_from(config).context("building kube client")
}

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: String::new(),
            version: version.to_string(),
            kind: kind.to_string(),
        }),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Resolve a GVK key to a dynamic API, scoped to `namespace` when the kind is namespaced.
pub async fn api_for(client: Client, gvk_key: &str, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
    let api = match (namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
        _ => Api::all_with(client, &ar),
    };
    Ok(api)
}

fn strip_managed_fields(obj: &mut DynamicObject) { obj.metadata.managed_fields = None; }

fn slim(ev: Event<DynamicObject>) -> Event<DynamicObject> {
    match ev {
        Event::Applied(mut o) => {
            strip_managed_fields(&mut o);
            Event::Applied(o)
        }
        Event::Deleted(mut o) => {
            strip_managed_fields(&mut o);
            Event::Deleted(o)
        }
        Event::Restarted(mut list) => {
            list.iter_mut().for_each(strip_managed_fields);
            Event::Restarted(list)
        }
    }
}

/// List+watch `api` into `informer` until `stop` flips. Watch failures back off and reconnect.
pub async fn start_informer(
    api: Api<DynamicObject>,
    informer: Arc<Informer>,
    resync_period: Option<Duration>,
    stop: watch::Receiver<bool>,
) {
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff().map_ok(slim);
    info!(resync_secs = resync_period.map(|p| p.as_secs()), "watcher started");
    run_informer(stream, informer, resync_period, stop).await;
}
