//! helmop engine API façade.
//!
//! Reconcilers consume the package engine through two narrow traits so a
//! repository reconciler never sees release operations and vice versa. Every call
//! carries a [`CallContext`] that bounds it by a timeout and a shared cancellation
//! token. [`MockEngine`] is an in-memory implementation of both for tests.

#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;

pub use helmop_core::EngineError;

mod mock;
pub use mock::MockEngine;

pub type EngineResult<T> = Result<T, EngineError>;

/// Deadline and cancellation for one engine call.
#[derive(Debug, Clone)]
pub struct CallContext {
    cancel: CancellationToken,
    timeout: Duration,
}

impl CallContext {
    pub fn new(cancel: CancellationToken, timeout: Duration) -> Self { Self { cancel, timeout } }

    /// Same cancellation scope, different deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self { Self { cancel: self.cancel.clone(), timeout } }

    pub fn timeout(&self) -> Duration { self.timeout }
    pub fn is_cancelled(&self) -> bool { self.cancel.is_cancelled() }
    pub fn token(&self) -> &CancellationToken { &self.cancel }

    /// Drive `fut` to completion unless the deadline passes or the token fires.
    /// Nothing is polled once cancellation has been requested.
    pub async fn run<T, F>(&self, fut: F) -> EngineResult<T>
    where
        F: Future<Output = EngineResult<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
            res = tokio::time::timeout(self.timeout, fut) => match res {
                Ok(v) => v,
                Err(_) => Err(EngineError::Timeout(self.timeout)),
            },
        }
    }
}

// ---- repositories ----

/// Resolved credentials for a repository. Never persisted to status.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RepositoryCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub insecure_skip_verify: bool,
    /// Paths on the controller host.
    pub ca_file: Option<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    /// Inline PEM material read from a secret.
    pub ca_pem: Option<String>,
    pub cert_pem: Option<String>,
    pub key_pem: Option<String>,
}

impl std::fmt::Debug for RepositoryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryCredentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("ca", &(self.ca_file.is_some() || self.ca_pem.is_some()))
            .field("client_cert", &(self.cert_file.is_some() || self.cert_pem.is_some()))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryEntry {
    /// Registration name; charts resolve as `<name>/<chart>`.
    pub name: String,
    pub url: String,
    pub registry: bool,
    pub credentials: RepositoryCredentials,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageVersion {
    pub version: String,
    pub app_version: String,
    pub description: String,
    pub created: Option<DateTime<Utc>>,
    pub digest: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    pub description: String,
    /// Newest first.
    pub versions: Vec<PackageVersion>,
}

/// Chart reference as the engine understands it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartRef {
    /// `<repo>/<chart>`, a bare chart name with `repo_url`, or an `oci://` reference.
    pub name: String,
    pub repo_url: Option<String>,
    pub version: Option<String>,
}

#[async_trait::async_trait]
pub trait RepositoryEngine: Send + Sync {
    /// Register or update a repository; idempotent.
    async fn add_repository(&self, cx: &CallContext, entry: &RepositoryEntry) -> EngineResult<()>;
    /// Download a fresh index for a registered repository.
    async fn sync_repository_index(&self, cx: &CallContext, name: &str) -> EngineResult<()>;
    async fn remove_repository(&self, cx: &CallContext, name: &str) -> EngineResult<()>;
    /// Names of locally registered repositories.
    async fn list_repositories(&self, cx: &CallContext) -> EngineResult<Vec<String>>;
    /// Packages of a synced repository, versions newest first.
    async fn list_packages(&self, cx: &CallContext, repository: &str) -> EngineResult<Vec<PackageInfo>>;
    /// Default values document of one chart version, as YAML.
    async fn package_default_values(&self, cx: &CallContext, chart: &ChartRef) -> EngineResult<String>;
}

// ---- releases ----

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub name: String,
    pub namespace: String,
    pub revision: i32,
    pub status: String,
    pub first_deployed: Option<DateTime<Utc>>,
    pub last_deployed: Option<DateTime<Utc>>,
    pub description: String,
    pub chart_name: String,
    pub chart_version: String,
    pub app_version: String,
    /// User-supplied values of the deployed revision.
    pub values: Json,
    /// Chart default values of the deployed revision.
    pub original_values: Json,
}

impl ReleaseInfo {
    /// `<chart>-<version>`, the form used in observed status.
    pub fn chart(&self) -> String { format!("{}-{}", self.chart_name, self.chart_version) }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstallRequest {
    pub release: String,
    pub namespace: String,
    pub chart: ChartRef,
    /// YAML overlay.
    pub values: String,
    pub create_namespace: bool,
    pub wait: bool,
    pub wait_for_jobs: bool,
    pub timeout: Duration,
    pub skip_crds: bool,
    pub replace: bool,
    pub disable_hooks: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpgradeRequest {
    pub release: String,
    pub namespace: String,
    pub chart: ChartRef,
    pub values: String,
    pub wait: bool,
    pub wait_for_jobs: bool,
    pub timeout: Duration,
    pub force: bool,
    pub reset_values: bool,
    pub reuse_values: bool,
    pub recreate: bool,
    pub max_history: i32,
    pub cleanup_on_fail: bool,
    pub disable_hooks: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UninstallRequest {
    pub release: String,
    pub namespace: String,
    pub timeout: Duration,
    pub disable_hooks: bool,
    pub keep_history: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RollbackRequest {
    pub release: String,
    pub namespace: String,
    /// 0 rolls back to the previous revision.
    pub revision: i32,
    pub timeout: Duration,
    pub wait: bool,
    pub cleanup_on_fail: bool,
    pub force: bool,
    pub disable_hooks: bool,
}

#[async_trait::async_trait]
pub trait ReleaseEngine: Send + Sync {
    /// Current release state; `Ok(None)` when no such release exists.
    async fn get(&self, cx: &CallContext, name: &str, namespace: &str) -> EngineResult<Option<ReleaseInfo>>;
    async fn install(&self, cx: &CallContext, req: &InstallRequest) -> EngineResult<ReleaseInfo>;
    async fn upgrade(&self, cx: &CallContext, req: &UpgradeRequest) -> EngineResult<ReleaseInfo>;
    /// `Err(EngineError::NotFound)` when the release is already gone.
    async fn uninstall(&self, cx: &CallContext, req: &UninstallRequest) -> EngineResult<()>;
    async fn rollback(&self, cx: &CallContext, req: &RollbackRequest) -> EngineResult<()>;
}
