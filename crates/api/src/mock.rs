//! In-memory engine with scripted failures and call recording.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value as Json;

use crate::*;

#[derive(Default)]
struct State {
    repos: BTreeMap<String, RepositoryEntry>,
    index_syncs: BTreeMap<String, u32>,
    packages: BTreeMap<String, Vec<PackageInfo>>,
    defaults: BTreeMap<String, String>,
    releases: BTreeMap<(String, String), ReleaseInfo>,
    calls: Vec<String>,
    failures: HashMap<String, VecDeque<EngineError>>,
    latency: Option<Duration>,
}

/// In-memory engine implementing both traits. Records every call that started
/// (`"<op> <arg>"`), and fails the next call of an operation on demand.
#[derive(Default)]
pub struct MockEngine {
    state: Mutex<State>,
}

fn bare_chart(name: &str) -> &str { name.rsplit('/').next().unwrap_or(name) }

fn parse_values(text: &str) -> EngineResult<Json> {
    helmop_values::parse(text).map_err(|e| EngineError::Failed(format!("{:#}", e)))
}

impl MockEngine {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(|p| p.into_inner()) }

    pub fn set_packages(&self, repository: &str, packages: Vec<PackageInfo>) {
        self.lock().packages.insert(repository.to_string(), packages);
    }

    pub fn set_default_values(&self, chart: &str, version: &str, yaml: &str) {
        self.lock().defaults.insert(format!("{}@{}", chart, version), yaml.to_string());
    }

    pub fn seed_release(&self, info: ReleaseInfo) {
        self.lock().releases.insert((info.namespace.clone(), info.name.clone()), info);
    }

    pub fn seed_repository(&self, name: &str, url: &str) {
        let entry = RepositoryEntry { name: name.into(), url: url.into(), registry: false, credentials: Default::default() };
        self.lock().repos.insert(name.to_string(), entry);
    }

    /// Fail the next call of `op` (e.g. `"install"`) with `err`. Queued errors are
    /// consumed in order.
    pub fn fail_next(&self, op: &str, err: EngineError) {
        self.lock().failures.entry(op.to_string()).or_default().push_back(err);
    }

    /// Delay every call after it has been recorded.
    pub fn set_latency(&self, latency: Duration) { self.lock().latency = Some(latency); }

    pub fn calls(&self) -> Vec<String> { self.lock().calls.clone() }

    pub fn count(&self, op: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.split(' ').next() == Some(op)).count()
    }

    pub fn release(&self, namespace: &str, name: &str) -> Option<ReleaseInfo> {
        self.lock().releases.get(&(namespace.to_string(), name.to_string())).cloned()
    }

    pub fn registered(&self, name: &str) -> Option<RepositoryEntry> { self.lock().repos.get(name).cloned() }

    pub fn index_syncs(&self, name: &str) -> u32 { self.lock().index_syncs.get(name).copied().unwrap_or(0) }

    async fn begin(&self, op: &str, arg: &str) -> EngineResult<()> {
        let (failure, latency) = {
            let mut s = self.lock();
            s.calls.push(format!("{} {}", op, arg));
            let failure = s.failures.get_mut(op).and_then(|q| q.pop_front());
            (failure, s.latency)
        };
        if let Some(d) = latency {
            tokio::time::sleep(d).await;
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn resolve_version(&self, chart: &ChartRef) -> String {
        if let Some(v) = chart.version.as_deref().filter(|v| !v.is_empty()) {
            return v.to_string();
        }
        let s = self.lock();
        let bare = bare_chart(&chart.name);
        s.packages
            .values()
            .flatten()
            .find(|p| p.name == bare)
            .and_then(|p| p.versions.first())
            .map(|v| v.version.clone())
            .unwrap_or_else(|| "0.1.0".to_string())
    }

    fn defaults_for(&self, chart: &str, version: &str) -> String {
        self.lock().defaults.get(&format!("{}@{}", bare_chart(chart), version)).cloned().unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl RepositoryEngine for MockEngine {
    async fn add_repository(&self, cx: &CallContext, entry: &RepositoryEntry) -> EngineResult<()> {
        cx.run(async {
            self.begin("repo_add", &entry.name).await?;
            self.lock().repos.insert(entry.name.clone(), entry.clone());
            Ok(())
        })
        .await
    }

    async fn sync_repository_index(&self, cx: &CallContext, name: &str) -> EngineResult<()> {
        cx.run(async {
            self.begin("repo_update", name).await?;
            let mut s = self.lock();
            if !s.repos.contains_key(name) {
                return Err(EngineError::NotFound(format!("no repo named {:?}", name)));
            }
            *s.index_syncs.entry(name.to_string()).or_default() += 1;
            Ok(())
        })
        .await
    }

    async fn remove_repository(&self, cx: &CallContext, name: &str) -> EngineResult<()> {
        cx.run(async {
            self.begin("repo_remove", name).await?;
            match self.lock().repos.remove(name) {
                Some(_) => Ok(()),
                None => Err(EngineError::NotFound(format!("no repo named {:?}", name))),
            }
        })
        .await
    }

    async fn list_repositories(&self, cx: &CallContext) -> EngineResult<Vec<String>> {
        cx.run(async {
            self.begin("repo_list", "").await?;
            Ok(self.lock().repos.keys().cloned().collect())
        })
        .await
    }

    async fn list_packages(&self, cx: &CallContext, repository: &str) -> EngineResult<Vec<PackageInfo>> {
        cx.run(async {
            self.begin("search", repository).await?;
            let s = self.lock();
            if !s.repos.contains_key(repository) {
                return Err(EngineError::NotFound(format!("no repo named {:?}", repository)));
            }
            Ok(s.packages.get(repository).cloned().unwrap_or_default())
        })
        .await
    }

    async fn package_default_values(&self, cx: &CallContext, chart: &ChartRef) -> EngineResult<String> {
        cx.run(async {
            self.begin("show_values", &chart.name).await?;
            let version = self.resolve_version(chart);
            Ok(self.defaults_for(&chart.name, &version))
        })
        .await
    }
}

#[async_trait::async_trait]
impl ReleaseEngine for MockEngine {
    async fn get(&self, cx: &CallContext, name: &str, namespace: &str) -> EngineResult<Option<ReleaseInfo>> {
        cx.run(async {
            self.begin("get", name).await?;
            Ok(self.release(namespace, name))
        })
        .await
    }

    async fn install(&self, cx: &CallContext, req: &InstallRequest) -> EngineResult<ReleaseInfo> {
        cx.run(async {
            self.begin("install", &req.release).await?;
            let values = parse_values(&req.values)?;
            let version = self.resolve_version(&req.chart);
            let original_values = parse_values(&self.defaults_for(&req.chart.name, &version))?;
            let key = (req.namespace.clone(), req.release.clone());
            let mut s = self.lock();
            if s.releases.contains_key(&key) && !req.replace {
                return Err(EngineError::Failed("cannot re-use a name that is still in use".into()));
            }
            let now = Utc::now();
            let info = ReleaseInfo {
                name: req.release.clone(),
                namespace: req.namespace.clone(),
                revision: 1,
                status: "deployed".into(),
                first_deployed: Some(now),
                last_deployed: Some(now),
                description: "Install complete".into(),
                chart_name: bare_chart(&req.chart.name).to_string(),
                chart_version: version,
                app_version: String::new(),
                values,
                original_values,
            };
            s.releases.insert(key, info.clone());
            Ok(info)
        })
        .await
    }

    async fn upgrade(&self, cx: &CallContext, req: &UpgradeRequest) -> EngineResult<ReleaseInfo> {
        cx.run(async {
            self.begin("upgrade", &req.release).await?;
            let values = parse_values(&req.values)?;
            let version = self.resolve_version(&req.chart);
            let original_values = parse_values(&self.defaults_for(&req.chart.name, &version))?;
            let mut s = self.lock();
            let cur = s
                .releases
                .get_mut(&(req.namespace.clone(), req.release.clone()))
                .ok_or_else(|| EngineError::Failed(format!("{:?} has no deployed releases", req.release)))?;
            cur.revision += 1;
            cur.status = "deployed".into();
            cur.last_deployed = Some(Utc::now());
            cur.description = "Upgrade complete".into();
            cur.chart_name = bare_chart(&req.chart.name).to_string();
            cur.chart_version = version;
            cur.values = values;
            cur.original_values = original_values;
            Ok(cur.clone())
        })
        .await
    }

    async fn uninstall(&self, cx: &CallContext, req: &UninstallRequest) -> EngineResult<()> {
        cx.run(async {
            self.begin("uninstall", &req.release).await?;
            match self.lock().releases.remove(&(req.namespace.clone(), req.release.clone())) {
                Some(_) => Ok(()),
                None => Err(EngineError::NotFound(format!("release {:?}", req.release))),
            }
        })
        .await
    }

    async fn rollback(&self, cx: &CallContext, req: &RollbackRequest) -> EngineResult<()> {
        cx.run(async {
            self.begin("rollback", &req.release).await?;
            let mut s = self.lock();
            let cur = s
                .releases
                .get_mut(&(req.namespace.clone(), req.release.clone()))
                .ok_or_else(|| EngineError::NotFound(format!("release {:?}", req.release)))?;
            let target = if req.revision > 0 { req.revision } else { (cur.revision - 1).max(1) };
            cur.revision += 1;
            cur.status = "deployed".into();
            cur.description = format!("Rollback to {}", target);
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn cx() -> CallContext { CallContext::new(CancellationToken::new(), Duration::from_secs(5)) }

    fn install_req(name: &str, values: &str) -> InstallRequest {
        InstallRequest {
            release: name.into(),
            namespace: "apps".into(),
            chart: ChartRef { name: "bitnami/nginx".into(), repo_url: None, version: Some("1.2.3".into()) },
            values: values.into(),
            create_namespace: false,
            wait: true,
            wait_for_jobs: true,
            timeout: Duration::from_secs(60),
            skip_crds: false,
            replace: false,
            disable_hooks: false,
        }
    }

    #[tokio::test]
    async fn install_then_get_reports_chart_and_values() {
        let engine = MockEngine::new();
        engine.set_default_values("nginx", "1.2.3", "replicas: 1\n");
        let info = engine.install(&cx(), &install_req("web", "replicas: 3\n")).await.unwrap();
        assert_eq!(info.chart(), "nginx-1.2.3");
        assert_eq!(info.values, serde_json::json!({"replicas": 3}));
        assert_eq!(info.original_values, serde_json::json!({"replicas": 1}));
        let got = engine.get(&cx(), "web", "apps").await.unwrap().unwrap();
        assert_eq!(got.revision, 1);
        assert_eq!(engine.calls(), vec!["install web", "get web"]);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let engine = MockEngine::new();
        engine.fail_next("install", EngineError::Failed("boom".into()));
        assert!(engine.install(&cx(), &install_req("web", "")).await.is_err());
        assert!(engine.install(&cx(), &install_req("web", "")).await.is_ok());
        assert_eq!(engine.count("install"), 2);
    }

    #[tokio::test]
    async fn cancelled_context_records_no_call() {
        let engine = MockEngine::new();
        let token = CancellationToken::new();
        token.cancel();
        let cx = CallContext::new(token, Duration::from_secs(1));
        assert!(matches!(engine.list_repositories(&cx).await, Err(EngineError::Cancelled)));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn uninstall_missing_release_is_not_found() {
        let engine = MockEngine::new();
        let req = UninstallRequest {
            release: "ghost".into(),
            namespace: "apps".into(),
            timeout: Duration::from_secs(1),
            disable_hooks: false,
            keep_history: false,
        };
        let err = engine.uninstall(&cx(), &req).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
