//! helmop engine: the `helm` binary behind [`RepositoryEngine`] and [`ReleaseEngine`].
//!
//! Every call spawns one helm process bounded by the caller's [`CallContext`];
//! the child is killed when the call is cancelled or times out. Secrets travel
//! over stdin (`--password-stdin`, `--values -`), never on the command line.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use helmop_api::{
    CallContext, ChartRef, EngineError, EngineResult, InstallRequest, PackageInfo, PackageVersion, ReleaseEngine, ReleaseInfo,
    RepositoryEngine, RepositoryEntry, RollbackRequest, UninstallRequest, UpgradeRequest,
};
use metrics::{counter, histogram};
use serde::Deserialize;
use serde_json::Value as Json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct HelmCliConfig {
    /// Path or name of the helm executable.
    pub binary: PathBuf,
    /// `HELM_REPOSITORY_CONFIG`, when not the helm default.
    pub repository_config: Option<PathBuf>,
    /// `HELM_REPOSITORY_CACHE`, when not the helm default.
    pub repository_cache: Option<PathBuf>,
    /// Where inline TLS material from secrets is written.
    pub data_dir: PathBuf,
}

impl Default for HelmCliConfig {
    fn default() -> Self {
        Self { binary: PathBuf::from("helm"), repository_config: None, repository_cache: None, data_dir: std::env::temp_dir().join("helmop") }
    }
}

pub struct HelmCli {
    cfg: HelmCliConfig,
}

fn secs(d: Duration) -> String { format!("{}s", d.as_secs().max(1)) }

fn push_flag(args: &mut Vec<String>, on: bool, flag: &str) {
    if on { args.push(flag.to_string()); }
}

fn chart_args(args: &mut Vec<String>, chart: &ChartRef) {
    args.push(chart.name.clone());
    if let Some(v) = chart.version.as_deref().filter(|v| !v.is_empty()) {
        args.extend(["--version".to_string(), v.to_string()]);
    }
    if let Some(u) = chart.repo_url.as_deref().filter(|u| !u.is_empty()) {
        args.extend(["--repo".to_string(), u.to_string()]);
    }
}

pub fn install_args(req: &InstallRequest) -> Vec<String> {
    let mut a = vec!["install".to_string(), req.release.clone()];
    chart_args(&mut a, &req.chart);
    a.extend(["--namespace".into(), req.namespace.clone(), "--values".into(), "-".into(), "--timeout".into(), secs(req.timeout)]);
    push_flag(&mut a, req.create_namespace, "--create-namespace");
    push_flag(&mut a, req.wait, "--wait");
    push_flag(&mut a, req.wait_for_jobs, "--wait-for-jobs");
    push_flag(&mut a, req.skip_crds, "--skip-crds");
    push_flag(&mut a, req.replace, "--replace");
    push_flag(&mut a, req.disable_hooks, "--no-hooks");
    a.extend(["--output".into(), "json".into()]);
    a
}

pub fn upgrade_args(req: &UpgradeRequest) -> Vec<String> {
    let mut a = vec!["upgrade".to_string(), req.release.clone()];
    chart_args(&mut a, &req.chart);
    a.extend(["--namespace".into(), req.namespace.clone(), "--values".into(), "-".into(), "--timeout".into(), secs(req.timeout)]);
    push_flag(&mut a, req.wait, "--wait");
    push_flag(&mut a, req.wait_for_jobs, "--wait-for-jobs");
    push_flag(&mut a, req.force, "--force");
    push_flag(&mut a, req.reset_values, "--reset-values");
    push_flag(&mut a, req.reuse_values, "--reuse-values");
    push_flag(&mut a, req.cleanup_on_fail, "--cleanup-on-fail");
    push_flag(&mut a, req.disable_hooks, "--no-hooks");
    if req.max_history > 0 {
        a.extend(["--history-max".into(), req.max_history.to_string()]);
    }
    // helm 3 has no pod-recreation flag; `recreate` is accepted and ignored
    a.extend(["--output".into(), "json".into()]);
    a
}

pub fn uninstall_args(req: &UninstallRequest) -> Vec<String> {
    let mut a = vec!["uninstall".to_string(), req.release.clone(), "--namespace".into(), req.namespace.clone(), "--timeout".into(), secs(req.timeout)];
    push_flag(&mut a, req.disable_hooks, "--no-hooks");
    push_flag(&mut a, req.keep_history, "--keep-history");
    a
}

pub fn rollback_args(req: &RollbackRequest) -> Vec<String> {
    let mut a = vec!["rollback".to_string(), req.release.clone()];
    if req.revision > 0 {
        a.push(req.revision.to_string());
    }
    a.extend(["--namespace".into(), req.namespace.clone(), "--timeout".into(), secs(req.timeout)]);
    push_flag(&mut a, req.wait, "--wait");
    push_flag(&mut a, req.cleanup_on_fail, "--cleanup-on-fail");
    push_flag(&mut a, req.force, "--force");
    push_flag(&mut a, req.disable_hooks, "--no-hooks");
    a
}

// ---- helm JSON shapes ----

#[derive(Debug, Deserialize)]
struct RawRelease {
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    version: i32,
    #[serde(default)]
    info: RawInfo,
    #[serde(default)]
    chart: Option<RawChart>,
    #[serde(default)]
    config: Option<Json>,
}

#[derive(Debug, Default, Deserialize)]
struct RawInfo {
    #[serde(default)]
    first_deployed: Option<DateTime<Utc>>,
    #[serde(default)]
    last_deployed: Option<DateTime<Utc>>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct RawChart {
    metadata: RawChartMeta,
    #[serde(default)]
    values: Option<Json>,
}

#[derive(Debug, Deserialize)]
struct RawChartMeta {
    name: String,
    #[serde(default)]
    version: String,
    #[serde(default, rename = "appVersion")]
    app_version: String,
}

/// The slice of a cached `<repo>-index.yaml` that search output lacks.
#[derive(Debug, Default, Deserialize)]
struct RawIndex {
    #[serde(default)]
    entries: BTreeMap<String, Vec<RawIndexEntry>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawIndexEntry {
    version: String,
    #[serde(default)]
    app_version: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    digest: String,
}

#[derive(Debug, Deserialize)]
struct RawSearchHit {
    name: String,
    version: String,
    #[serde(default)]
    app_version: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct RawRepo {
    name: String,
}

fn empty_if_null(v: Option<Json>) -> Json {
    match v {
        None | Some(Json::Null) => Json::Object(serde_json::Map::new()),
        Some(v) => v,
    }
}

pub fn parse_release(json: &str) -> anyhow::Result<ReleaseInfo> {
    let raw: RawRelease = serde_json::from_str(json).context("parsing helm release JSON")?;
    let (chart_name, chart_version, app_version, original_values) = match raw.chart {
        Some(c) => (c.metadata.name, c.metadata.version, c.metadata.app_version, empty_if_null(c.values)),
        None => (String::new(), String::new(), String::new(), empty_if_null(None)),
    };
    Ok(ReleaseInfo {
        name: raw.name,
        namespace: raw.namespace,
        revision: raw.version,
        status: raw.info.status,
        first_deployed: raw.info.first_deployed,
        last_deployed: raw.info.last_deployed,
        description: raw.info.description,
        chart_name,
        chart_version,
        app_version,
        values: empty_if_null(raw.config),
        original_values,
    })
}

/// Group `helm search repo --versions` hits of one repository by chart, keeping
/// helm's newest-first version order and stripping the `<repo>/` prefix.
pub fn parse_search(repository: &str, json: &str) -> anyhow::Result<Vec<PackageInfo>> {
    let hits: Vec<RawSearchHit> = serde_json::from_str(json).context("parsing helm search JSON")?;
    let prefix = format!("{}/", repository);
    let mut out: Vec<PackageInfo> = Vec::new();
    for h in hits {
        let Some(name) = h.name.strip_prefix(&prefix) else { continue };
        let version = PackageVersion { version: h.version, app_version: h.app_version, description: h.description.clone(), created: None, digest: String::new() };
        match out.iter_mut().find(|p| p.name == name) {
            Some(p) => p.versions.push(version),
            None => out.push(PackageInfo { name: name.to_string(), description: h.description, versions: vec![version] }),
        }
    }
    Ok(out)
}

/// Fill digest, creation time, appVersion and description of every listed
/// version from the repository's cached index. Versions the index does not
/// know are left as search reported them.
pub fn merge_index(packages: &mut [PackageInfo], index_yaml: &str) -> anyhow::Result<()> {
    let index: RawIndex = serde_yaml::from_str(index_yaml).context("parsing repository index")?;
    for p in packages.iter_mut() {
        let Some(entries) = index.entries.get(&p.name) else { continue };
        for v in p.versions.iter_mut() {
            let Some(e) = entries.iter().find(|e| e.version == v.version) else { continue };
            v.digest = e.digest.clone();
            v.created = e.created.as_deref().and_then(|t| DateTime::parse_from_rfc3339(t).ok()).map(|t| t.with_timezone(&Utc));
            if !e.app_version.is_empty() {
                v.app_version = e.app_version.clone();
            }
            if !e.description.is_empty() {
                v.description = e.description.clone();
            }
        }
        if p.description.is_empty() {
            p.description = p.versions.first().map(|v| v.description.clone()).unwrap_or_default();
        }
    }
    Ok(())
}

fn failure(op: &str, stderr: &str) -> EngineError {
    let msg = stderr.trim().trim_start_matches("Error: ").to_string();
    let lower = msg.to_lowercase();
    if lower.contains("release: not found") || lower.contains("no repo named") {
        return EngineError::NotFound(msg);
    }
    EngineError::Failed(format!("helm {}: {}", op, msg))
}

impl HelmCli {
    pub fn new(cfg: HelmCliConfig) -> Self { Self { cfg } }

    /// Configured repository cache, else whatever helm resolves it to.
    async fn repository_cache(&self, cx: &CallContext) -> Option<PathBuf> {
        if let Some(p) = &self.cfg.repository_cache {
            return Some(p.clone());
        }
        let out = self.helm(cx, vec!["env".into(), "HELM_REPOSITORY_CACHE".into()], None).await.ok()?;
        Some(PathBuf::from(out.trim())).filter(|p| !p.as_os_str().is_empty())
    }

    /// Run helm with `args`, optionally feeding `stdin`; returns stdout.
    async fn helm(&self, cx: &CallContext, args: Vec<String>, stdin: Option<String>) -> EngineResult<String> {
        let op = args.first().cloned().unwrap_or_default();
        let t0 = Instant::now();
        let res = cx
            .run(async {
                let mut cmd = Command::new(&self.cfg.binary);
                cmd.args(&args)
                    .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true);
                if let Some(p) = &self.cfg.repository_config { cmd.env("HELM_REPOSITORY_CONFIG", p); }
                if let Some(p) = &self.cfg.repository_cache { cmd.env("HELM_REPOSITORY_CACHE", p); }
                debug!(op = %op, args = ?redact(&args), "helm exec");
                let mut child = cmd.spawn()?;
                if let (Some(input), Some(mut pipe)) = (stdin.as_deref(), child.stdin.take()) {
                    pipe.write_all(input.as_bytes()).await?;
                    pipe.shutdown().await?;
                }
                let out = child.wait_with_output().await?;
                if out.status.success() {
                    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
                } else {
                    Err(failure(&op, &String::from_utf8_lossy(&out.stderr)))
                }
            })
            .await;
        histogram!("helmop_helm_exec_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op.clone());
        if let Err(e) = &res {
            counter!("helmop_helm_exec_errors_total", 1u64, "op" => op.clone());
            if !e.is_not_found() { warn!(op = %op, error = %e, "helm failed"); }
        }
        res
    }

    async fn write_pem(&self, repo: &str, file: &str, pem: &str) -> EngineResult<String> {
        let dir = self.cfg.data_dir.join("tls").join(repo);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(file);
        tokio::fs::write(&path, pem.as_bytes()).await?;
        Ok(path_str(&path))
    }

    /// TLS flags, materializing inline PEM blocks to files first.
    async fn tls_args(&self, entry: &RepositoryEntry) -> EngineResult<Vec<String>> {
        let c = &entry.credentials;
        let mut a = Vec::new();
        push_flag(&mut a, c.insecure_skip_verify, if entry.registry { "--insecure" } else { "--insecure-skip-tls-verify" });
        for (flag, file, path, pem) in [
            ("--ca-file", "ca.crt", &c.ca_file, &c.ca_pem),
            ("--cert-file", "tls.crt", &c.cert_file, &c.cert_pem),
            ("--key-file", "tls.key", &c.key_file, &c.key_pem),
        ] {
            let resolved = match (pem, path) {
                (Some(p), _) => Some(self.write_pem(&entry.name, file, p).await?),
                (None, Some(p)) => Some(p.clone()),
                (None, None) => None,
            };
            if let Some(p) = resolved {
                a.extend([flag.to_string(), p]);
            }
        }
        Ok(a)
    }
}

fn path_str(p: &Path) -> String { p.to_string_lossy().into_owned() }

/// Hide values following credential flags in logs.
fn redact(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut hide = false;
    for a in args {
        out.push(if hide { "***".to_string() } else { a.clone() });
        hide = a == "--username";
    }
    out
}

fn registry_host(url: &str) -> &str {
    let rest = url.trim_start_matches("oci://");
    rest.split('/').next().unwrap_or(rest)
}

#[async_trait::async_trait]
impl RepositoryEngine for HelmCli {
    async fn add_repository(&self, cx: &CallContext, entry: &RepositoryEntry) -> EngineResult<()> {
        let c = &entry.credentials;
        let password = c.password.clone().filter(|p| !p.is_empty());
        if entry.registry {
            // registries have no index; only credentials need registering
            let Some(user) = c.username.as_deref().filter(|u| !u.is_empty()) else { return Ok(()) };
            let mut args = vec!["registry".to_string(), "login".into(), registry_host(&entry.url).to_string(), "--username".into(), user.to_string()];
            if password.is_some() { args.push("--password-stdin".into()); }
            args.extend(self.tls_args(entry).await?);
            self.helm(cx, args, password).await?;
            return Ok(());
        }
        let mut args = vec!["repo".to_string(), "add".into(), entry.name.clone(), entry.url.clone(), "--force-update".into()];
        if let Some(user) = c.username.as_deref().filter(|u| !u.is_empty()) {
            args.extend(["--username".to_string(), user.to_string()]);
            if password.is_some() { args.push("--password-stdin".into()); }
        }
        args.extend(self.tls_args(entry).await?);
        self.helm(cx, args, password).await?;
        Ok(())
    }

    async fn sync_repository_index(&self, cx: &CallContext, name: &str) -> EngineResult<()> {
        self.helm(cx, vec!["repo".into(), "update".into(), name.to_string()], None).await?;
        Ok(())
    }

    async fn remove_repository(&self, cx: &CallContext, name: &str) -> EngineResult<()> {
        self.helm(cx, vec!["repo".into(), "remove".into(), name.to_string()], None).await?;
        let tls = self.cfg.data_dir.join("tls").join(name);
        if tls.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&tls).await {
                warn!(repo = name, error = %e, "failed to remove tls material");
            }
        }
        Ok(())
    }

    async fn list_repositories(&self, cx: &CallContext) -> EngineResult<Vec<String>> {
        match self.helm(cx, vec!["repo".into(), "list".into(), "--output".into(), "json".into()], None).await {
            Ok(out) => {
                let repos: Vec<RawRepo> = serde_json::from_str(&out).map_err(|e| EngineError::Failed(format!("parsing helm repo list: {}", e)))?;
                Ok(repos.into_iter().map(|r| r.name).collect())
            }
            Err(EngineError::Failed(msg)) if msg.contains("no repositories") => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn list_packages(&self, cx: &CallContext, repository: &str) -> EngineResult<Vec<PackageInfo>> {
        let args = vec!["search".into(), "repo".into(), format!("{}/", repository), "--versions".into(), "--output".into(), "json".into()];
        let out = self.helm(cx, args, None).await?;
        let mut packages = parse_search(repository, &out).map_err(|e| EngineError::Failed(format!("{:#}", e)))?;
        let Some(cache) = self.repository_cache(cx).await else { return Ok(packages) };
        let path = cache.join(format!("{}-index.yaml", repository));
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => {
                if let Err(e) = merge_index(&mut packages, &text) {
                    warn!(repo = repository, path = %path.display(), error = %format!("{:#}", e), "repository index unreadable");
                }
            }
            Err(e) => debug!(repo = repository, path = %path.display(), error = %e, "no cached repository index"),
        }
        Ok(packages)
    }

    async fn package_default_values(&self, cx: &CallContext, chart: &ChartRef) -> EngineResult<String> {
        let mut args = vec!["show".to_string(), "values".into()];
        chart_args(&mut args, chart);
        self.helm(cx, args, None).await
    }
}

#[async_trait::async_trait]
impl ReleaseEngine for HelmCli {
    async fn get(&self, cx: &CallContext, name: &str, namespace: &str) -> EngineResult<Option<ReleaseInfo>> {
        let args = vec!["status".into(), name.to_string(), "--namespace".into(), namespace.to_string(), "--output".into(), "json".into()];
        match self.helm(cx, args, None).await {
            Ok(out) => parse_release(&out).map(Some).map_err(|e| EngineError::Failed(format!("{:#}", e))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn install(&self, cx: &CallContext, req: &InstallRequest) -> EngineResult<ReleaseInfo> {
        let out = self.helm(cx, install_args(req), Some(req.values.clone())).await?;
        parse_release(&out).map_err(|e| EngineError::Failed(format!("{:#}", e)))
    }

    async fn upgrade(&self, cx: &CallContext, req: &UpgradeRequest) -> EngineResult<ReleaseInfo> {
        let out = self.helm(cx, upgrade_args(req), Some(req.values.clone())).await?;
        parse_release(&out).map_err(|e| EngineError::Failed(format!("{:#}", e)))
    }

    async fn uninstall(&self, cx: &CallContext, req: &UninstallRequest) -> EngineResult<()> {
        self.helm(cx, uninstall_args(req), None).await.map(|_| ())
    }

    async fn rollback(&self, cx: &CallContext, req: &RollbackRequest) -> EngineResult<()> {
        self.helm(cx, rollback_args(req), None).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chart() -> ChartRef { ChartRef { name: "bitnami/nginx".into(), repo_url: None, version: Some("15.0.1".into()) } }

    #[test]
    fn install_flags_follow_request() {
        let req = InstallRequest {
            release: "web".into(),
            namespace: "apps".into(),
            chart: chart(),
            values: "a: 1".into(),
            create_namespace: true,
            wait: true,
            wait_for_jobs: false,
            timeout: Duration::from_secs(600),
            skip_crds: true,
            replace: false,
            disable_hooks: true,
        };
        let a = install_args(&req);
        assert_eq!(&a[..5], &["install", "web", "bitnami/nginx", "--version", "15.0.1"]);
        for f in ["--create-namespace", "--wait", "--skip-crds", "--no-hooks", "600s"] {
            assert!(a.iter().any(|x| x == f), "missing {f}: {a:?}");
        }
        assert!(!a.iter().any(|x| x == "--wait-for-jobs"));
        assert!(!a.iter().any(|x| x == "a: 1"), "values must go over stdin");
    }

    #[test]
    fn upgrade_and_rollback_flags() {
        let req = UpgradeRequest {
            release: "web".into(),
            namespace: "apps".into(),
            chart: ChartRef { name: "nginx".into(), repo_url: Some("https://charts.example.com".into()), version: None },
            values: String::new(),
            wait: false,
            wait_for_jobs: false,
            timeout: Duration::from_secs(90),
            force: true,
            reset_values: false,
            reuse_values: true,
            recreate: true,
            max_history: 10,
            cleanup_on_fail: true,
            disable_hooks: false,
        };
        let a = upgrade_args(&req);
        let joined = a.join(" ");
        assert!(joined.contains("--repo https://charts.example.com"));
        assert!(joined.contains("--history-max 10"));
        assert!(joined.contains("--force") && joined.contains("--reuse-values") && joined.contains("--cleanup-on-fail"));
        assert!(!joined.contains("--version"));

        let rb = RollbackRequest {
            release: "web".into(),
            namespace: "apps".into(),
            revision: 0,
            timeout: Duration::from_secs(300),
            wait: true,
            cleanup_on_fail: true,
            force: false,
            disable_hooks: false,
        };
        assert_eq!(&rollback_args(&rb)[..3], &["rollback", "web", "--namespace"]);
        assert_eq!(&rollback_args(&RollbackRequest { revision: 3, ..rb })[..3], &["rollback", "web", "3"]);
    }

    #[test]
    fn parses_status_json() {
        let json = r#"{
            "name": "web", "namespace": "apps", "version": 4,
            "info": {"first_deployed": "2024-05-01T10:00:00.123456789Z", "last_deployed": "2024-05-02T10:00:00Z",
                     "description": "Upgrade complete", "status": "deployed"},
            "chart": {"metadata": {"name": "nginx", "version": "15.0.1", "appVersion": "1.25.3"}, "values": {"replicaCount": 1}},
            "config": {"replicaCount": 3}
        }"#;
        let r = parse_release(json).unwrap();
        assert_eq!(r.chart(), "nginx-15.0.1");
        assert_eq!(r.revision, 4);
        assert_eq!(r.values, serde_json::json!({"replicaCount": 3}));
        assert_eq!(r.original_values, serde_json::json!({"replicaCount": 1}));
        assert!(r.first_deployed.is_some());

        let bare = r#"{"name": "web", "namespace": "apps", "version": 1, "info": {"status": "deployed"}, "config": null}"#;
        assert_eq!(parse_release(bare).unwrap().values, serde_json::json!({}));
    }

    #[test]
    fn search_hits_group_by_chart() {
        let json = r#"[
            {"name": "acme/api", "version": "2.0.0", "app_version": "2", "description": "API"},
            {"name": "acme/api", "version": "1.9.0", "app_version": "1.9", "description": "API"},
            {"name": "acme/web", "version": "0.3.0", "app_version": "", "description": "Web"},
            {"name": "other/web", "version": "9.9.9", "app_version": "", "description": "elsewhere"}
        ]"#;
        let pkgs = parse_search("acme", json).unwrap();
        assert_eq!(pkgs.len(), 2);
        assert_eq!(pkgs[0].name, "api");
        assert_eq!(pkgs[0].versions.iter().map(|v| v.version.as_str()).collect::<Vec<_>>(), vec!["2.0.0", "1.9.0"]);
    }

    #[test]
    fn index_fills_version_metadata() {
        let json = r#"[
            {"name": "acme/api", "version": "2.0.0", "app_version": "2", "description": "API"},
            {"name": "acme/api", "version": "1.9.0", "app_version": "1.9", "description": "API"}
        ]"#;
        let index = r#"
apiVersion: v1
entries:
  api:
    - name: api
      version: 2.0.0
      appVersion: "2.0"
      description: API server
      created: "2024-05-01T10:00:00.123456789+02:00"
      digest: 3f5b0c
      urls: [https://charts.acme.io/api-2.0.0.tgz]
    - name: api
      version: 1.9.0
      digest: 9a1e77
generated: "2024-05-01T10:00:00Z"
"#;
        let mut pkgs = parse_search("acme", json).unwrap();
        merge_index(&mut pkgs, index).unwrap();
        let newest = &pkgs[0].versions[0];
        assert_eq!((newest.digest.as_str(), newest.app_version.as_str(), newest.description.as_str()), ("3f5b0c", "2.0", "API server"));
        assert_eq!(newest.created.unwrap().to_rfc3339(), "2024-05-01T08:00:00.123456789+00:00");
        let older = &pkgs[0].versions[1];
        assert_eq!((older.digest.as_str(), older.app_version.as_str()), ("9a1e77", "1.9"));
        assert!(older.created.is_none());

        assert!(merge_index(&mut pkgs, "entries: [not, a, map]").is_err());
    }

    #[test]
    fn stderr_maps_to_typed_errors() {
        assert!(failure("status", "Error: release: not found\n").is_not_found());
        assert!(failure("repo", "Error: no repo named \"x\" found").is_not_found());
        let e = failure("install", "Error: INSTALLATION FAILED: timed out waiting for the condition");
        assert!(matches!(e, EngineError::Failed(ref m) if m.starts_with("helm install: INSTALLATION FAILED")));
    }

    #[test]
    fn registry_host_and_redaction() {
        assert_eq!(registry_host("oci://ghcr.io/acme/charts"), "ghcr.io");
        let r = redact(&["repo".into(), "--username".into(), "bob".into(), "--force-update".into()]);
        assert_eq!(r, vec!["repo", "--username", "***", "--force-update"]);
    }

    #[tokio::test]
    async fn missing_binary_surfaces_io_error() {
        let cli = HelmCli::new(HelmCliConfig { binary: PathBuf::from("/nonexistent/helm"), ..Default::default() });
        let cx = CallContext::new(tokio_util::sync::CancellationToken::new(), Duration::from_secs(5));
        let err = cli.list_repositories(&cx).await.unwrap_err();
        assert!(matches!(err, EngineError::Io(_)), "{err:?}");
    }
}
