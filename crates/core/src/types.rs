//! Declared resource kinds: `HelmRepository` and `HelmRelease`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;
use crate::duration::{parse_duration, parse_or};
use crate::ObjectKey;

pub const API_GROUP: &str = "helm-operator.ketches.cn";
pub const REPOSITORY_FINALIZER: &str = "helm-operator.ketches.cn/repository-finalizer";
pub const RELEASE_FINALIZER: &str = "helm-operator.ketches.cn/release-finalizer";

pub const DEFAULT_REPOSITORY_INTERVAL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_REPOSITORY_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(168 * 3600);
pub const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_UPGRADE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_UNINSTALL_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_ROLLBACK_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_HISTORY: i32 = 10;
/// Failure records kept on a release status, newest last.
pub const MAX_FAILURE_RECORDS: usize = 10;

static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(https?|oci)://.+").expect("static regex"));

fn yes() -> bool { true }
fn default_max_history() -> i32 { DEFAULT_MAX_HISTORY }

// ---- HelmRepository ----

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "helm-operator.ketches.cn",
    version = "v1alpha1",
    kind = "HelmRepository",
    plural = "helmrepositories",
    shortname = "hrepo",
    namespaced,
    status = "HelmRepositoryStatus",
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".spec.url"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].message"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HelmRepositorySpec {
    /// Index URL (`http(s)://`) or registry reference (`oci://`).
    pub url: String,
    /// `helm` (default) or `oci`.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub repo_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<RepositoryAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default)]
    pub suspend: bool,
    /// `disabled` (default), `on-demand` or `lazy`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values_config_map_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values_config_map_retention: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<BasicAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Secret with `username` and `password` keys; overrides inline values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    /// Secret with `ca.crt`, `tls.crt` and `tls.key` keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HelmRepositoryStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub charts: Vec<ChartInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<RepositoryStats>,
    #[serde(default)]
    pub observed_generation: i64,
    /// Failed sync passes since the last success; drives retry backoff.
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryWindow>,
}

/// Left by a failed pass: no retry before `not_before` while the spec is still
/// at `generation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryWindow {
    pub generation: i64,
    pub not_before: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChartInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<ChartVersion>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChartVersion {
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryStats {
    pub total_charts: u32,
    pub total_versions: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryKind {
    /// Generic index served over HTTP(S).
    Index,
    /// OCI registry; no index to sync.
    Registry,
}

/// When per-version default values are copied into cache artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    Disabled,
    /// Only the version a release actually deploys.
    OnDemand,
    /// Newest version of every package at sync time.
    Lazy,
}

impl CachePolicy {
    pub fn parse(raw: Option<&str>) -> Result<Self, String> {
        match raw.map(str::trim) {
            None | Some("") | Some("disabled") => Ok(CachePolicy::Disabled),
            Some("on-demand") => Ok(CachePolicy::OnDemand),
            Some("lazy") => Ok(CachePolicy::Lazy),
            Some(other) => Err(format!("unknown valuesConfigMapPolicy {:?} (expected disabled, on-demand or lazy)", other)),
        }
    }
}

impl HelmRepositorySpec {
    pub fn kind(&self) -> RepositoryKind {
        let oci = matches!(self.repo_type.as_deref(), Some("oci")) || self.url.starts_with("oci://");
        if oci { RepositoryKind::Registry } else { RepositoryKind::Index }
    }

    /// Sync period; unset or unparsable values fall back to 30m.
    pub fn interval(&self) -> Duration {
        parse_or(self.interval.as_deref(), DEFAULT_REPOSITORY_INTERVAL).unwrap_or(DEFAULT_REPOSITORY_INTERVAL)
    }

    pub fn timeout(&self) -> Duration {
        parse_or(self.timeout.as_deref(), DEFAULT_REPOSITORY_TIMEOUT).unwrap_or(DEFAULT_REPOSITORY_TIMEOUT)
    }

    pub fn retention(&self) -> Duration {
        parse_or(self.values_config_map_retention.as_deref(), DEFAULT_RETENTION).unwrap_or(DEFAULT_RETENTION)
    }

    pub fn cache_policy(&self) -> CachePolicy { CachePolicy::parse(self.values_config_map_policy.as_deref()).unwrap_or(CachePolicy::Disabled) }

    /// Structural checks the reconciler refuses to act without.
    pub fn validate(&self) -> Result<(), String> {
        if self.url.trim().is_empty() {
            return Err("spec.url is required".into());
        }
        if !URL_RE.is_match(&self.url) {
            return Err(format!("spec.url {:?} must start with http://, https:// or oci://", self.url));
        }
        match self.repo_type.as_deref() {
            None | Some("") | Some("helm") | Some("oci") => {}
            Some(other) => return Err(format!("spec.type {:?} must be helm or oci", other)),
        }
        for (field, value) in [
            ("interval", &self.interval),
            ("timeout", &self.timeout),
            ("valuesConfigMapRetention", &self.values_config_map_retention),
        ] {
            if let Some(v) = value.as_deref().filter(|v| !v.trim().is_empty()) {
                parse_duration(v).map_err(|e| format!("spec.{}: {}", field, e))?;
            }
        }
        CachePolicy::parse(self.values_config_map_policy.as_deref()).map(|_| ())
    }
}

// ---- HelmRelease ----

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "helm-operator.ketches.cn",
    version = "v1alpha1",
    kind = "HelmRelease",
    plural = "helmreleases",
    shortname = "hrel",
    namespaced,
    status = "HelmReleaseStatus",
    printcolumn = r#"{"name":"Chart","type":"string","jsonPath":".spec.chart.name"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.chart.version"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].message"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseSpec {
    pub chart: ChartSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<ReleaseTarget>,
    /// YAML overlay merged over the chart defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<InstallSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<UpgradeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uninstall: Option<UninstallSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default)]
    pub suspend: bool,
    /// Other releases that must be Ready first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<DependencyReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChartSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<RepositoryReference>,
    #[serde(default, rename = "repositoryURL", skip_serializing_if = "Option::is_none")]
    pub repository_url: Option<String>,
    #[serde(default, rename = "ociRepository", skip_serializing_if = "Option::is_none")]
    pub oci_repository: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub create_namespace: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstallSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default = "yes")]
    pub wait: bool,
    #[serde(default = "yes")]
    pub wait_for_jobs: bool,
    #[serde(default, rename = "skipCRDs")]
    pub skip_crds: bool,
    #[serde(default)]
    pub replace: bool,
    #[serde(default)]
    pub disable_hooks: bool,
}

impl Default for InstallSpec {
    fn default() -> Self {
        Self { timeout: None, wait: true, wait_for_jobs: true, skip_crds: false, replace: false, disable_hooks: false }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default = "yes")]
    pub wait: bool,
    #[serde(default = "yes")]
    pub wait_for_jobs: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub reset_values: bool,
    #[serde(default)]
    pub reuse_values: bool,
    #[serde(default)]
    pub recreate: bool,
    #[serde(default = "default_max_history")]
    pub max_history: i32,
    #[serde(default = "yes")]
    pub cleanup_on_fail: bool,
    #[serde(default)]
    pub disable_hooks: bool,
}

impl Default for UpgradeSpec {
    fn default() -> Self {
        Self {
            timeout: None,
            wait: true,
            wait_for_jobs: true,
            force: false,
            reset_values: false,
            reuse_values: false,
            recreate: false,
            max_history: DEFAULT_MAX_HISTORY,
            cleanup_on_fail: true,
            disable_hooks: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UninstallSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default)]
    pub disable_hooks: bool,
    #[serde(default)]
    pub keep_history: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RollbackSpec {
    #[serde(default)]
    pub enabled: bool,
    /// 0 means the previous revision.
    #[serde(default)]
    pub to_revision: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default = "yes")]
    pub wait: bool,
    #[serde(default = "yes")]
    pub cleanup_on_fail: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub disable_hooks: bool,
}

impl Default for RollbackSpec {
    fn default() -> Self {
        Self { enabled: false, to_revision: 0, timeout: None, wait: true, cleanup_on_fail: true, force: false, disable_hooks: false }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DependencyReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_release: Option<HelmReleaseInfo>,
    /// Spec as of the last successful install or upgrade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_configuration: Option<HelmReleaseSpec>,
    /// Chart default values of the deployed chart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_values: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FailureRecord>,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryWindow>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseInfo {
    pub name: String,
    pub namespace: String,
    pub revision: i32,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_deployed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_deployed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// `<chart>-<version>`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chart: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub time: DateTime<Utc>,
    pub reason: String,
    pub message: String,
}

/// Where the chart for a release comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChartSource {
    /// A `HelmRepository` resource, resolved and gated on its readiness.
    Repository(ObjectKey),
    /// Direct index URL, no repository resource involved.
    Url(String),
    /// Full `oci://` chart reference.
    Oci(String),
}

impl HelmReleaseSpec {
    pub fn release_name<'a>(&'a self, own_name: &'a str) -> &'a str {
        self.release.as_ref().and_then(|r| r.name.as_deref()).filter(|s| !s.is_empty()).unwrap_or(own_name)
    }

    pub fn release_namespace<'a>(&'a self, own_namespace: &'a str) -> &'a str {
        self.release.as_ref().and_then(|r| r.namespace.as_deref()).filter(|s| !s.is_empty()).unwrap_or(own_namespace)
    }

    pub fn create_namespace(&self) -> bool { self.release.as_ref().map(|r| r.create_namespace).unwrap_or(false) }

    pub fn desired_version(&self) -> Option<&str> { self.chart.version.as_deref().filter(|v| !v.is_empty()) }

    /// Values overlay text, empty when unset.
    pub fn values_text(&self) -> &str { self.values.as_deref().unwrap_or("") }

    pub fn chart_source(&self, own_namespace: &str) -> Option<ChartSource> {
        if let Some(r) = self.chart.repository.as_ref().filter(|r| !r.name.is_empty()) {
            let ns = r.namespace.as_deref().filter(|s| !s.is_empty()).unwrap_or(own_namespace);
            return Some(ChartSource::Repository(ObjectKey::new(ns, r.name.clone())));
        }
        if let Some(u) = self.chart.repository_url.as_deref().filter(|s| !s.is_empty()) {
            return Some(ChartSource::Url(u.to_string()));
        }
        self.chart.oci_repository.as_deref().filter(|s| !s.is_empty()).map(|o| ChartSource::Oci(o.to_string()))
    }

    /// Requeue period after convergence; unset or invalid means none.
    pub fn interval(&self) -> Option<Duration> {
        self.interval.as_deref().filter(|s| !s.trim().is_empty()).and_then(|s| parse_duration(s).ok())
    }

    pub fn dependencies(&self, own_namespace: &str) -> Vec<ObjectKey> {
        self.depends_on
            .iter()
            .map(|d| ObjectKey::new(d.namespace.as_deref().filter(|s| !s.is_empty()).unwrap_or(own_namespace), d.name.clone()))
            .collect()
    }

    pub fn install_opts(&self) -> InstallSpec { self.install.clone().unwrap_or_default() }
    pub fn upgrade_opts(&self) -> UpgradeSpec { self.upgrade.clone().unwrap_or_default() }
    pub fn uninstall_opts(&self) -> UninstallSpec { self.uninstall.clone().unwrap_or_default() }
    pub fn rollback_opts(&self) -> RollbackSpec { self.rollback.clone().unwrap_or_default() }

    pub fn validate(&self) -> Result<(), String> {
        if self.chart.name.trim().is_empty() {
            return Err("spec.chart.name is required".into());
        }
        if self.chart_source("").is_none() {
            return Err("one of spec.chart.repository, spec.chart.repositoryURL or spec.chart.ociRepository is required".into());
        }
        Ok(())
    }
}

fn timeout_or(raw: Option<&str>, default: Duration) -> Duration { parse_or(raw, default).unwrap_or(default) }

impl InstallSpec {
    pub fn timeout(&self) -> Duration { timeout_or(self.timeout.as_deref(), DEFAULT_INSTALL_TIMEOUT) }
}
impl UpgradeSpec {
    pub fn timeout(&self) -> Duration { timeout_or(self.timeout.as_deref(), DEFAULT_UPGRADE_TIMEOUT) }
}
impl UninstallSpec {
    pub fn timeout(&self) -> Duration { timeout_or(self.timeout.as_deref(), DEFAULT_UNINSTALL_TIMEOUT) }
}
impl RollbackSpec {
    pub fn timeout(&self) -> Duration { timeout_or(self.timeout.as_deref(), DEFAULT_ROLLBACK_TIMEOUT) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(url: &str) -> HelmRepositorySpec { HelmRepositorySpec { url: url.into(), ..Default::default() } }

    #[test]
    fn repository_validation() {
        assert!(repo("https://charts.example.com").validate().is_ok());
        assert!(repo("oci://ghcr.io/acme/charts").validate().is_ok());
        assert!(repo("").validate().is_err());
        assert!(repo("ftp://x").validate().is_err());

        let mut r = repo("https://x");
        r.interval = Some("every day".into());
        assert!(r.validate().unwrap_err().contains("interval"));

        let mut r = repo("https://x");
        r.values_config_map_policy = Some("eager".into());
        assert!(r.validate().is_err());

        let mut r = repo("https://x");
        r.repo_type = Some("git".into());
        assert!(r.validate().is_err());
    }

    #[test]
    fn repository_defaults() {
        let r = repo("https://x");
        assert_eq!(r.interval(), DEFAULT_REPOSITORY_INTERVAL);
        assert_eq!(r.timeout(), DEFAULT_REPOSITORY_TIMEOUT);
        assert_eq!(r.retention(), DEFAULT_RETENTION);
        assert_eq!(r.cache_policy(), CachePolicy::Disabled);
        assert_eq!(r.kind(), RepositoryKind::Index);
        assert_eq!(repo("oci://r/c").kind(), RepositoryKind::Registry);
    }

    #[test]
    fn release_spec_defaults_from_empty_yaml() {
        let spec: HelmReleaseSpec = serde_yaml::from_str("chart:\n  name: nginx\n  repositoryURL: https://x\nupgrade: {}\n").unwrap();
        let up = spec.upgrade_opts();
        assert!(up.wait && up.wait_for_jobs && up.cleanup_on_fail);
        assert_eq!(up.max_history, 10);
        assert_eq!(up.timeout(), DEFAULT_UPGRADE_TIMEOUT);
        assert!(spec.install_opts().wait);
        assert!(!spec.rollback_opts().enabled);
        assert_eq!(spec.release_name("web"), "web");
        assert_eq!(spec.release_namespace("apps"), "apps");
        assert_eq!(spec.interval(), None);
    }

    #[test]
    fn chart_source_precedence() {
        let mut spec = HelmReleaseSpec::default();
        spec.chart.name = "nginx".into();
        assert!(spec.validate().is_err());
        spec.chart.oci_repository = Some("oci://r/nginx".into());
        assert_eq!(spec.chart_source("apps"), Some(ChartSource::Oci("oci://r/nginx".into())));
        spec.chart.repository = Some(RepositoryReference { name: "bitnami".into(), namespace: None });
        assert_eq!(spec.chart_source("apps"), Some(ChartSource::Repository(ObjectKey::new("apps", "bitnami"))));
        assert!(spec.validate().is_ok());
    }
}
