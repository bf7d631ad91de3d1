//! Process wiring: kube-backed stores, one queue and watcher per kind, and the
//! worker pools that drain them until shutdown.

use std::sync::Arc;

use helmop_api::{ReleaseEngine, RepositoryEngine};
use helmop_core::{HelmRelease, HelmRepository, ObjectKey};
use helmop_kubehub::{watch_into, ConfigMapArtifacts, KubeEvents, KubeSecrets, KubeStore};
use helmop_queue::{spawn_ticker, spawn_workers, WorkQueue};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{ArtifactCache, Metrics, ReleaseReconciler, RepositoryReconciler, DEFAULT_CONFLICT_ATTEMPTS};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Workers per resource kind.
    pub workers: usize,
    /// Watch a single namespace instead of the whole cluster.
    pub namespace: Option<String>,
    pub conflict_attempts: u32,
    /// Reporting controller name on events.
    pub controller_name: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { workers: 4, namespace: None, conflict_attempts: DEFAULT_CONFLICT_ATTEMPTS, controller_name: "helm-operator".into() }
    }
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Run both reconcilers against the cluster until `token` is cancelled, then
/// wait for in-flight passes to finish.
pub async fn run<E>(client: Client, engine: Arc<E>, cfg: ControllerConfig, metrics: Arc<Metrics>, token: CancellationToken) -> anyhow::Result<()>
where
    E: RepositoryEngine + ReleaseEngine + 'static,
{
    let repo_store = Arc::new(KubeStore::<HelmRepository>::new(client.clone()));
    let release_store = Arc::new(KubeStore::<HelmRelease>::new(client.clone()));
    let events = Arc::new(KubeEvents::new(client.clone(), &cfg.controller_name));
    let artifacts = ArtifactCache::new(Arc::new(ConfigMapArtifacts::new(client.clone())), engine.clone(), metrics.clone());

    let repositories = Arc::new(RepositoryReconciler::new(
        repo_store.clone(),
        Arc::new(KubeSecrets::new(client.clone())),
        engine.clone(),
        artifacts.clone(),
        events.clone(),
        metrics.clone(),
        token.clone(),
        cfg.conflict_attempts,
    ));
    let releases = Arc::new(ReleaseReconciler::new(
        release_store,
        repo_store,
        engine,
        artifacts,
        events,
        metrics,
        token.clone(),
        cfg.conflict_attempts,
    ));

    let repo_queue: Arc<WorkQueue<ObjectKey>> = Arc::new(WorkQueue::new("helmrepository"));
    let release_queue: Arc<WorkQueue<ObjectKey>> = Arc::new(WorkQueue::new("helmrelease"));
    let ns = cfg.namespace.as_deref();

    let mut handles = vec![
        tokio::spawn(watch_into(api::<HelmRepository>(&client, ns), "HelmRepository", repo_queue.clone(), token.clone())),
        tokio::spawn(watch_into(api::<HelmRelease>(&client, ns), "HelmRelease", release_queue.clone(), token.clone())),
        spawn_ticker(repo_queue.clone(), token.clone()),
        spawn_ticker(release_queue.clone(), token.clone()),
    ];
    handles.extend(spawn_workers(repo_queue, repositories, cfg.workers, token.clone()));
    handles.extend(spawn_workers(release_queue, releases, cfg.workers, token.clone()));
    info!(workers = cfg.workers, namespace = ?cfg.namespace, "controller started");

    token.cancelled().await;
    info!("shutdown requested, draining workers");
    futures::future::join_all(handles).await;
    info!("controller stopped");
    Ok(())
}
