#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;

use helmop_api::MockEngine;
use helmop_controller::{ArtifactCache, Metrics, ReleaseReconciler, RepositoryReconciler};
use helmop_core::conditions::{self, Condition, ConditionType};
use helmop_core::{HelmRelease, HelmReleaseSpec, HelmRepository, HelmRepositorySpec, HelmRepositoryStatus, ObjectKey};
use helmop_kubehub::{MemoryArtifacts, MemorySecrets, MemoryStore, RecordingEvents};
use tokio_util::sync::CancellationToken;

pub struct Harness {
    pub repos: Arc<MemoryStore<HelmRepository>>,
    pub releases: Arc<MemoryStore<HelmRelease>>,
    pub secrets: Arc<MemorySecrets>,
    pub artifacts: Arc<MemoryArtifacts>,
    pub engine: Arc<MockEngine>,
    pub events: Arc<RecordingEvents>,
    pub repository: RepositoryReconciler,
    pub release: ReleaseReconciler,
    pub token: CancellationToken,
}

impl Harness {
    pub fn new() -> Self {
        let repos = Arc::new(MemoryStore::<HelmRepository>::new());
        let releases = Arc::new(MemoryStore::<HelmRelease>::new());
        let secrets = Arc::new(MemorySecrets::new());
        let artifacts = Arc::new(MemoryArtifacts::new());
        let engine = Arc::new(MockEngine::new());
        let events = Arc::new(RecordingEvents::new());
        let metrics = Arc::new(Metrics::new());
        let token = CancellationToken::new();
        let cache = ArtifactCache::new(artifacts.clone(), engine.clone(), metrics.clone());
        let repository = RepositoryReconciler::new(
            repos.clone(),
            secrets.clone(),
            engine.clone(),
            cache.clone(),
            events.clone(),
            metrics.clone(),
            token.clone(),
            5,
        );
        let release = ReleaseReconciler::new(releases.clone(), repos.clone(), engine.clone(), cache, events.clone(), metrics, token.clone(), 5);
        Self { repos, releases, secrets, artifacts, engine, events, repository, release, token }
    }

    pub fn add_repository(&self, namespace: &str, name: &str, spec: HelmRepositorySpec) -> ObjectKey {
        let mut r = HelmRepository::new(name, spec);
        r.metadata.namespace = Some(namespace.into());
        r.metadata.uid = Some(format!("uid-{}", name));
        self.repos.insert(r);
        ObjectKey::new(namespace, name)
    }

    /// A repository that already reports Ready.
    pub fn add_ready_repository(&self, namespace: &str, name: &str, spec: HelmRepositorySpec) -> ObjectKey {
        let mut r = HelmRepository::new(name, spec);
        r.metadata.namespace = Some(namespace.into());
        r.metadata.uid = Some(format!("uid-{}", name));
        let mut st = HelmRepositoryStatus::default();
        conditions::set(&mut st.conditions, Condition::ready(helmop_core::Reason::SyncCompleted, "ok"));
        r.status = Some(st);
        self.repos.insert(r);
        ObjectKey::new(namespace, name)
    }

    pub fn add_release(&self, namespace: &str, name: &str, yaml: &str) -> ObjectKey {
        let spec: HelmReleaseSpec = serde_yaml::from_str(yaml).expect("release spec yaml");
        let mut r = HelmRelease::new(name, spec);
        r.metadata.namespace = Some(namespace.into());
        self.releases.insert(r);
        ObjectKey::new(namespace, name)
    }

    pub fn repository(&self, key: &ObjectKey) -> HelmRepository { self.repos.snapshot(key).expect("repository exists") }
    pub fn release_obj(&self, key: &ObjectKey) -> HelmRelease { self.releases.snapshot(key).expect("release exists") }

    pub fn engine_calls(&self) -> Vec<String> { self.engine.calls() }

    /// Close the retry window of the last failure.
    pub fn elapse_repository_backoff(&self, key: &ObjectKey) {
        let mut r = self.repository(key);
        if let Some(w) = r.status.as_mut().and_then(|st| st.retry.as_mut()) {
            w.not_before = Utc::now() - chrono::Duration::seconds(1);
        }
        self.repos.insert(r);
    }

    pub fn elapse_release_backoff(&self, key: &ObjectKey) {
        let mut r = self.release_obj(key);
        if let Some(w) = r.status.as_mut().and_then(|st| st.retry.as_mut()) {
            w.not_before = Utc::now() - chrono::Duration::seconds(1);
        }
        self.releases.insert(r);
    }
}

pub fn condition<'a>(conds: &'a [Condition], ty: ConditionType) -> &'a Condition {
    conditions::find(conds, ty).unwrap_or_else(|| panic!("missing {} condition in {:?}", ty, conds))
}

pub fn repo_spec(url: &str) -> HelmRepositorySpec { HelmRepositorySpec { url: url.into(), ..Default::default() } }
