//! Cached chart default values, one ConfigMap per (repository, chart, version).
//!
//! Artifacts are derived data: owned by their repository, labelled so a sweep can
//! find them, and regenerated whenever the engine reports different defaults.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use helmop_api::{CallContext, ChartRef, PackageInfo, RepositoryEngine};
use helmop_core::names::{artifact_name, sanitize_label_value};
use helmop_core::{HelmRepository, RepositoryKind};
use helmop_kubehub::{Artifact, ArtifactStore};
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use crate::Metrics;

pub const LABEL_OWNED: &str = "ketches.cn/owned";
pub const LABEL_REPOSITORY: &str = "helm-operator.ketches.cn/repository";
pub const LABEL_CHART: &str = "helm-operator.ketches.cn/chart";
pub const LABEL_VERSION: &str = "helm-operator.ketches.cn/version";
pub const VALUES_KEY: &str = "values.yaml";
/// RFC 3339 time the values were last written; retention counts from here.
pub const ANNOTATION_WRITTEN: &str = "helm-operator.ketches.cn/written-at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Materialized {
    Created,
    Updated,
    Unchanged,
}

#[derive(Clone)]
pub struct ArtifactCache {
    store: Arc<dyn ArtifactStore>,
    engine: Arc<dyn RepositoryEngine>,
    metrics: Arc<Metrics>,
}

/// Chart reference inside a repository, in the form the engine resolves.
pub fn repository_chart_ref(repo: &HelmRepository, chart: &str, version: Option<&str>) -> ChartRef {
    let name = match repo.spec.kind() {
        RepositoryKind::Registry => format!("{}/{}", repo.spec.url.trim_end_matches('/'), chart),
        RepositoryKind::Index => format!("{}/{}", repo.name_any(), chart),
    };
    ChartRef { name, repo_url: None, version: version.map(str::to_string) }
}

fn written_at(a: &Artifact) -> Option<DateTime<Utc>> {
    a.annotations
        .get(ANNOTATION_WRITTEN)
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .or(a.created)
}

fn selector_for(repo: &HelmRepository) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_OWNED.to_string(), "true".to_string()),
        (LABEL_REPOSITORY.to_string(), sanitize_label_value(&repo.name_any())),
    ])
}

impl ArtifactCache {
    pub fn new(store: Arc<dyn ArtifactStore>, engine: Arc<dyn RepositoryEngine>, metrics: Arc<Metrics>) -> Self {
        Self { store, engine, metrics }
    }

    /// Ensure the artifact for one chart version holds the engine's current defaults.
    pub async fn materialize(&self, cx: &CallContext, repo: &HelmRepository, chart: &str, version: &str) -> anyhow::Result<Materialized> {
        let namespace = repo.namespace().unwrap_or_default();
        let repo_name = repo.name_any();
        let name = artifact_name(&repo_name, chart, version);
        let values = self
            .engine
            .package_default_values(cx, &repository_chart_ref(repo, chart, Some(version)))
            .await
            .with_context(|| format!("fetching default values of {}/{} {}", repo_name, chart, version))?;

        let mut labels = selector_for(repo);
        labels.insert(LABEL_CHART.to_string(), sanitize_label_value(chart));
        labels.insert(LABEL_VERSION.to_string(), sanitize_label_value(version));
        let artifact = Artifact {
            namespace: namespace.clone(),
            name: name.clone(),
            labels,
            annotations: BTreeMap::from([(ANNOTATION_WRITTEN.to_string(), Utc::now().to_rfc3339())]),
            data: BTreeMap::from([(VALUES_KEY.to_string(), values)]),
            owner: repo.controller_owner_ref(&()),
            created: None,
        };

        let outcome = match self.store.get(&namespace, &name).await? {
            Some(cur) if cur.data == artifact.data && cur.labels == artifact.labels => Materialized::Unchanged,
            Some(_) => {
                self.store.replace(&artifact).await?;
                Materialized::Updated
            }
            None => match self.store.create(&artifact).await {
                Ok(()) => Materialized::Created,
                // lost a race with another writer
                Err(e) if e.is_conflict() => {
                    self.store.replace(&artifact).await?;
                    Materialized::Updated
                }
                Err(e) => return Err(e.into()),
            },
        };
        if outcome != Materialized::Unchanged {
            self.metrics.configmaps_generated(&repo_name, 1);
            debug!(artifact = %name, ?outcome, "values artifact written");
        }
        Ok(outcome)
    }

    /// Materialize the newest version of every package. Individual failures are
    /// logged and counted, never fatal. Returns (written, failed).
    pub async fn materialize_latest(&self, cx: &CallContext, repo: &HelmRepository, packages: &[PackageInfo]) -> (usize, usize) {
        let (mut written, mut failed) = (0, 0);
        for pkg in packages {
            let Some(newest) = pkg.versions.first() else { continue };
            if cx.is_cancelled() {
                break;
            }
            match self.materialize(cx, repo, &pkg.name, &newest.version).await {
                Ok(Materialized::Unchanged) => {}
                Ok(_) => written += 1,
                Err(e) => {
                    failed += 1;
                    warn!(repo = %repo.name_any(), chart = %pkg.name, error = %format!("{:#}", e), "values artifact failed");
                }
            }
        }
        (written, failed)
    }

    /// Delete this repository's artifacts last written more than `retention`
    /// before `now`. Artifacts without the annotation age from creation.
    pub async fn sweep(&self, repo: &HelmRepository, retention: Duration, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let namespace = repo.namespace().unwrap_or_default();
        let cutoff = now - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(7));
        let mut removed = 0;
        for a in self.store.list(&namespace, &selector_for(repo)).await? {
            if written_at(&a).map(|w| w < cutoff).unwrap_or(false) {
                self.store.delete(&namespace, &a.name).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            self.metrics.configmaps_cleaned(&repo.name_any(), removed);
            info!(repo = %repo.name_any(), removed, "expired values artifacts removed");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helmop_api::{MockEngine, PackageVersion};
    use helmop_core::HelmRepositorySpec;
    use helmop_kubehub::MemoryArtifacts;
    use tokio_util::sync::CancellationToken;

    fn repo(name: &str) -> HelmRepository {
        let mut r = HelmRepository::new(name, HelmRepositorySpec { url: "https://charts.example.com".into(), ..Default::default() });
        r.metadata.namespace = Some("infra".into());
        r.metadata.uid = Some("uid-1".into());
        r
    }

    fn cx() -> CallContext { CallContext::new(CancellationToken::new(), Duration::from_secs(5)) }

    fn backdate(store: &MemoryArtifacts, name: &str, at: DateTime<Utc>) {
        store.set_created("infra", name, at);
        store.set_annotation("infra", name, ANNOTATION_WRITTEN, &at.to_rfc3339());
    }

    fn cache() -> (ArtifactCache, Arc<MemoryArtifacts>, Arc<MockEngine>) {
        let store = Arc::new(MemoryArtifacts::new());
        let engine = Arc::new(MockEngine::new());
        (ArtifactCache::new(store.clone(), engine.clone(), Arc::new(Metrics::new())), store, engine)
    }

    #[tokio::test]
    async fn materialize_creates_then_tracks_changes() {
        let (cache, store, engine) = cache();
        let r = repo("acme");
        engine.set_default_values("web", "1.2.0", "replicas: 1\n");

        assert_eq!(cache.materialize(&cx(), &r, "web", "1.2.0").await.unwrap(), Materialized::Created);
        assert_eq!(cache.materialize(&cx(), &r, "web", "1.2.0").await.unwrap(), Materialized::Unchanged);
        engine.set_default_values("web", "1.2.0", "replicas: 2\n");
        assert_eq!(cache.materialize(&cx(), &r, "web", "1.2.0").await.unwrap(), Materialized::Updated);

        let a = store.get("infra", "helm-values-acme-web-1-2-0").await.unwrap().unwrap();
        assert_eq!(a.data[VALUES_KEY], "replicas: 2\n");
        assert_eq!(a.labels[LABEL_OWNED], "true");
        assert_eq!(a.labels[LABEL_VERSION], "1.2.0");
        assert_eq!(a.owner.as_ref().map(|o| o.kind.as_str()), Some("HelmRepository"));
    }

    #[tokio::test]
    async fn latest_only_takes_newest_version() {
        let (cache, store, _engine) = cache();
        let v = |s: &str| PackageVersion { version: s.into(), ..Default::default() };
        let pkgs = vec![
            PackageInfo { name: "api".into(), description: String::new(), versions: vec![v("2.0.0"), v("1.0.0")] },
            PackageInfo { name: "empty".into(), description: String::new(), versions: vec![] },
        ];
        assert_eq!(cache.materialize_latest(&cx(), &repo("acme"), &pkgs).await, (1, 0));
        let names: Vec<_> = store.all().into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["helm-values-acme-api-2-0-0"]);
    }

    #[tokio::test]
    async fn sweep_is_age_based_and_scoped_to_repository() {
        let (cache, store, _engine) = cache();
        let (a, b) = (repo("acme"), repo("other"));
        cache.materialize(&cx(), &a, "old", "1.0.0").await.unwrap();
        cache.materialize(&cx(), &a, "new", "1.0.0").await.unwrap();
        cache.materialize(&cx(), &b, "old", "1.0.0").await.unwrap();
        let long_ago = Utc::now() - chrono::Duration::hours(200);
        backdate(&store, "helm-values-acme-old-1-0-0", long_ago);
        backdate(&store, "helm-values-other-old-1-0-0", long_ago);

        let removed = cache.sweep(&a, Duration::from_secs(168 * 3600), Utc::now()).await.unwrap();
        assert_eq!(removed, 1);
        let mut left: Vec<_> = store.all().into_iter().map(|a| a.name).collect();
        left.sort();
        assert_eq!(left, vec!["helm-values-acme-new-1-0-0", "helm-values-other-old-1-0-0"]);
    }

    #[tokio::test]
    async fn rewritten_artifact_is_not_expired() {
        let (cache, store, engine) = cache();
        let r = repo("acme");
        engine.set_default_values("web", "1.0.0", "replicas: 1\n");
        cache.materialize(&cx(), &r, "web", "1.0.0").await.unwrap();
        backdate(&store, "helm-values-acme-web-1-0-0", Utc::now() - chrono::Duration::hours(200));

        engine.set_default_values("web", "1.0.0", "replicas: 2\n");
        assert_eq!(cache.materialize(&cx(), &r, "web", "1.0.0").await.unwrap(), Materialized::Updated);
        assert_eq!(cache.sweep(&r, Duration::from_secs(168 * 3600), Utc::now()).await.unwrap(), 0);

        // legacy artifacts without the annotation still age from creation
        let name = "helm-values-acme-web-1-0-0";
        let mut a = store.get("infra", name).await.unwrap().unwrap();
        a.annotations.clear();
        store.replace(&a).await.unwrap();
        store.set_created("infra", name, Utc::now() - chrono::Duration::hours(200));
        assert_eq!(cache.sweep(&r, Duration::from_secs(168 * 3600), Utc::now()).await.unwrap(), 1);
    }
}
