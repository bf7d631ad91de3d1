//! `HelmRelease` reconciler: gate on dependencies, then install, upgrade or leave
//! the deployed release alone, depending on what the engine reports.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use chrono::Utc;
use helmop_api::{
    CallContext, ChartRef, EngineError, InstallRequest, ReleaseEngine, ReleaseInfo, RollbackRequest, UninstallRequest, UpgradeRequest,
};
use helmop_core::conditions::{self, Condition, ConditionType, Reason};
use helmop_core::error::is_engine_cancelled;
use helmop_core::{
    classify, Action, CachePolicy, ChartSource, ClassifiedError, ErrorCategory, FailureRecord, HelmRelease, HelmReleaseInfo,
    HelmReleaseSpec, HelmReleaseStatus, HelmRepository, ObjectKey, MAX_FAILURE_RECORDS, RELEASE_FINALIZER,
};
use helmop_kubehub::{EventKind, EventSink, ResourceStore};
use helmop_queue::Reconcile;
use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifacts::repository_chart_ref;
use crate::{backoff_remaining, retry_window, with_conflict_retry, ArtifactCache, Metrics, ReconcileError, Write, CONFIG_ERROR_REQUEUE, DEPENDENCY_REQUEUE};

/// Why the deployed release must be upgraded, or `None` when it already matches.
/// Checked in order: chart version, values overlay, last-applied baseline.
pub fn needs_upgrade(spec: &HelmReleaseSpec, deployed: &ReleaseInfo, baseline: Option<&HelmReleaseSpec>) -> Option<String> {
    if let Some(want) = spec.desired_version() {
        if !deployed.chart().ends_with(&format!("-{}", want)) {
            return Some(format!("chart version changed from {} to {}", deployed.chart_version, want));
        }
    }
    if !helmop_values::equal_to_tree(spec.values_text(), &deployed.values) {
        let summary = helmop_values::parse(spec.values_text())
            .map(|desired| helmop_values::diff_summary(&desired, &deployed.values).to_string())
            .unwrap_or_else(|_| "unparsable".to_string());
        return Some(format!("values changed ({})", summary));
    }
    if let Some(base) = baseline {
        if base.chart != spec.chart || !helmop_values::equal(base.values_text(), spec.values_text()) {
            return Some("spec changed since last apply".to_string());
        }
    }
    None
}

fn observed(info: &ReleaseInfo) -> HelmReleaseInfo {
    HelmReleaseInfo {
        name: info.name.clone(),
        namespace: info.namespace.clone(),
        revision: info.revision,
        status: info.status.clone(),
        first_deployed: info.first_deployed,
        last_deployed: info.last_deployed,
        description: info.description.clone(),
        chart: info.chart(),
        app_version: info.app_version.clone(),
    }
}

fn oci_chart(reference: &str, chart: &str) -> String {
    let base = reference.trim_end_matches('/');
    if base.rsplit('/').next() == Some(chart) { base.to_string() } else { format!("{}/{}", base, chart) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Install,
    Upgrade,
}

impl Operation {
    fn as_str(&self) -> &'static str {
        match self {
            Operation::Install => "install",
            Operation::Upgrade => "upgrade",
        }
    }
    fn started(&self) -> Reason {
        match self {
            Operation::Install => Reason::InstallStarted,
            Operation::Upgrade => Reason::UpgradeStarted,
        }
    }
    fn completed(&self) -> Reason {
        match self {
            Operation::Install => Reason::InstallCompleted,
            Operation::Upgrade => Reason::UpgradeCompleted,
        }
    }
    fn failed(&self) -> Reason {
        match self {
            Operation::Install => Reason::InstallFailed,
            Operation::Upgrade => Reason::UpgradeFailed,
        }
    }
}

pub struct ReleaseReconciler {
    store: Arc<dyn ResourceStore<HelmRelease>>,
    repositories: Arc<dyn ResourceStore<HelmRepository>>,
    engine: Arc<dyn ReleaseEngine>,
    artifacts: ArtifactCache,
    events: Arc<dyn EventSink>,
    metrics: Arc<Metrics>,
    token: CancellationToken,
    conflict_attempts: u32,
}

impl ReleaseReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ResourceStore<HelmRelease>>,
        repositories: Arc<dyn ResourceStore<HelmRepository>>,
        engine: Arc<dyn ReleaseEngine>,
        artifacts: ArtifactCache,
        events: Arc<dyn EventSink>,
        metrics: Arc<Metrics>,
        token: CancellationToken,
        conflict_attempts: u32,
    ) -> Self {
        Self { store, repositories, engine, artifacts, events, metrics, token, conflict_attempts }
    }

    fn cx(&self, timeout: Duration) -> CallContext { CallContext::new(self.token.clone(), timeout) }

    async fn patch_status<F>(&self, key: &ObjectKey, mut f: F) -> Result<Option<HelmRelease>, ReconcileError>
    where
        F: FnMut(&mut HelmReleaseStatus) + Send,
    {
        with_conflict_retry(&*self.store, key, Write::Status, self.conflict_attempts, |r: &mut HelmRelease| {
            f(r.status.get_or_insert_with(Default::default))
        })
        .await
    }

    async fn event(&self, rel: &HelmRelease, kind: EventKind, reason: Reason, message: &str) {
        self.events.publish(&rel.object_ref(&()), kind, reason.as_str(), message).await;
    }

    /// Record a failure on status. Retryable errors back off per category and
    /// attempt; everything else waits a fixed five minutes. Shutdown is not a
    /// failure and leaves status untouched.
    async fn fail(&self, key: &ObjectKey, rel: &HelmRelease, reason: Reason, err: ClassifiedError, fixed: bool) -> anyhow::Result<Action> {
        if is_engine_cancelled(&err.source) {
            info!(release = %key, "pass interrupted by shutdown");
            return Ok(Action::await_change());
        }
        let message = err.to_string();
        warn!(release = %key, reason = %reason, category = err.category.as_str(), error = %message, "release reconcile failed");
        self.event(rel, EventKind::Warning, reason, &message).await;
        let now = Utc::now();
        let generation = rel.metadata.generation.unwrap_or_default();
        let msg = message.clone();
        let mut delay = CONFIG_ERROR_REQUEUE;
        self.patch_status(key, |st| {
            conditions::set(&mut st.conditions, Condition::failed(reason, msg.clone()));
            conditions::set(&mut st.conditions, Condition::not_ready(reason, msg.clone()));
            conditions::resolve(&mut st.conditions, ConditionType::Progressing, reason, msg.clone());
            st.failures.push(FailureRecord { time: now, reason: reason.as_str().to_string(), message: msg.clone() });
            let overflow = st.failures.len().saturating_sub(MAX_FAILURE_RECORDS);
            st.failures.drain(..overflow);
            st.consecutive_failures = st.consecutive_failures.saturating_add(1);
            delay = if fixed || !err.retryable { CONFIG_ERROR_REQUEUE } else { err.delay_for_attempt(st.consecutive_failures) };
            st.retry = Some(retry_window(generation, delay, now));
        })
        .await?;
        Ok(Action::requeue(delay))
    }

    fn config_error(msg: String) -> ClassifiedError {
        ClassifiedError { category: ErrorCategory::Validation, retry_after: CONFIG_ERROR_REQUEUE, retryable: false, source: anyhow!(msg) }
    }

    async fn handle_deletion(&self, key: &ObjectKey, rel: &HelmRelease) -> anyhow::Result<Action> {
        if !rel.finalizers().iter().any(|f| f == RELEASE_FINALIZER) {
            return Ok(Action::await_change());
        }
        let own_ns = rel.namespace().unwrap_or_default();
        let own_name = rel.name_any();
        let opts = rel.spec.uninstall_opts();
        let req = UninstallRequest {
            release: rel.spec.release_name(&own_name).to_string(),
            namespace: rel.spec.release_namespace(&own_ns).to_string(),
            timeout: opts.timeout(),
            disable_hooks: opts.disable_hooks,
            keep_history: opts.keep_history,
        };
        let t0 = Instant::now();
        match self.engine.uninstall(&self.cx(req.timeout), &req).await {
            Ok(()) => {
                self.metrics.release_operation("uninstall", true, t0.elapsed());
                info!(release = %key, "release uninstalled");
            }
            Err(e) if e.is_not_found() => debug!(release = %key, "release already gone"),
            Err(e) if e.is_cancelled() => {
                info!(release = %key, "uninstall interrupted by shutdown; finalizer kept");
                return Ok(Action::await_change());
            }
            Err(e) => {
                self.metrics.release_operation("uninstall", false, t0.elapsed());
                warn!(release = %key, error = %e, "uninstall failed; removing finalizer anyway");
                self.event(rel, EventKind::Warning, Reason::UninstallFailed, &e.to_string()).await;
            }
        }
        with_conflict_retry(&*self.store, key, Write::Object, self.conflict_attempts, |r: &mut HelmRelease| {
            r.metadata.finalizers.get_or_insert_with(Vec::new).retain(|f| f != RELEASE_FINALIZER);
        })
        .await?;
        Ok(Action::await_change())
    }

    async fn ensure_finalizer(&self, key: &ObjectKey, rel: HelmRelease) -> anyhow::Result<Option<HelmRelease>> {
        if rel.finalizers().iter().any(|f| f == RELEASE_FINALIZER) {
            return Ok(Some(rel));
        }
        let updated = with_conflict_retry(&*self.store, key, Write::Object, self.conflict_attempts, |r: &mut HelmRelease| {
            let fins = r.metadata.finalizers.get_or_insert_with(Vec::new);
            if !fins.iter().any(|f| f == RELEASE_FINALIZER) {
                fins.push(RELEASE_FINALIZER.to_string());
            }
        })
        .await?;
        Ok(updated)
    }

    /// Repository and `dependsOn` readiness. Returns the resolved repository for
    /// repository-sourced charts, or a message naming the first unmet dependency.
    async fn check_dependencies(&self, rel: &HelmRelease) -> anyhow::Result<Result<Option<HelmRepository>, String>> {
        let own_ns = rel.namespace().unwrap_or_default();
        let mut repository = None;
        if let Some(ChartSource::Repository(rk)) = rel.spec.chart_source(&own_ns) {
            match self.repositories.get(&rk).await? {
                None => return Ok(Err(format!("HelmRepository {} not found", rk))),
                Some(r) if !conditions::is_true(r.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default(), ConditionType::Ready) => {
                    return Ok(Err(format!("HelmRepository {} is not ready", rk)));
                }
                Some(r) => repository = Some(r),
            }
        }
        for dk in rel.spec.dependencies(&own_ns) {
            match self.store.get(&dk).await? {
                None => return Ok(Err(format!("dependency HelmRelease {} not found", dk))),
                Some(d) if !conditions::is_true(d.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default(), ConditionType::Ready) => {
                    return Ok(Err(format!("dependency HelmRelease {} is not ready", dk)));
                }
                Some(_) => {}
            }
        }
        Ok(Ok(repository))
    }

    fn chart_ref(rel: &HelmRelease, repository: Option<&HelmRepository>) -> ChartRef {
        let spec = &rel.spec;
        let version = spec.desired_version().map(str::to_string);
        let own_ns = rel.namespace().unwrap_or_default();
        match (spec.chart_source(&own_ns), repository) {
            (Some(ChartSource::Repository(_)), Some(repo)) => repository_chart_ref(repo, &spec.chart.name, spec.desired_version()),
            (Some(ChartSource::Url(url)), _) => ChartRef { name: spec.chart.name.clone(), repo_url: Some(url), version },
            (Some(ChartSource::Oci(oci)), _) => ChartRef { name: oci_chart(&oci, &spec.chart.name), repo_url: None, version },
            _ => ChartRef { name: spec.chart.name.clone(), repo_url: None, version },
        }
    }

    async fn apply(
        &self,
        key: &ObjectKey,
        rel: &HelmRelease,
        op: Operation,
        chart: ChartRef,
        why: Option<String>,
        repository: Option<&HelmRepository>,
    ) -> anyhow::Result<Action> {
        if self.token.is_cancelled() {
            info!(release = %key, op = op.as_str(), "not started, shutting down");
            return Ok(Action::await_change());
        }
        let own_ns = rel.namespace().unwrap_or_default();
        let own_name = rel.name_any();
        let spec = &rel.spec;
        let release = spec.release_name(&own_name).to_string();
        let namespace = spec.release_namespace(&own_ns).to_string();
        let started_msg = match &why {
            Some(w) => format!("upgrading {}: {}", release, w),
            None => format!("installing {} from {}", release, chart.name),
        };
        self.patch_status(key, |st| {
            conditions::set(&mut st.conditions, Condition::progressing(op.started(), started_msg.clone()));
        })
        .await?;
        self.event(rel, EventKind::Normal, op.started(), &started_msg).await;

        let t0 = Instant::now();
        let res: Result<ReleaseInfo, EngineError> = match op {
            Operation::Install => {
                let o = spec.install_opts();
                let req = InstallRequest {
                    release: release.clone(),
                    namespace: namespace.clone(),
                    chart,
                    values: spec.values_text().to_string(),
                    create_namespace: spec.create_namespace(),
                    wait: o.wait,
                    wait_for_jobs: o.wait_for_jobs,
                    timeout: o.timeout(),
                    skip_crds: o.skip_crds,
                    replace: o.replace,
                    disable_hooks: o.disable_hooks,
                };
                self.engine.install(&self.cx(req.timeout), &req).await
            }
            Operation::Upgrade => {
                let o = spec.upgrade_opts();
                let req = UpgradeRequest {
                    release: release.clone(),
                    namespace: namespace.clone(),
                    chart,
                    values: spec.values_text().to_string(),
                    wait: o.wait,
                    wait_for_jobs: o.wait_for_jobs,
                    timeout: o.timeout(),
                    force: o.force,
                    reset_values: o.reset_values,
                    reuse_values: o.reuse_values,
                    recreate: o.recreate,
                    max_history: o.max_history,
                    cleanup_on_fail: o.cleanup_on_fail,
                    disable_hooks: o.disable_hooks,
                };
                self.engine.upgrade(&self.cx(req.timeout), &req).await
            }
        };
        self.metrics.release_operation(op.as_str(), res.is_ok(), t0.elapsed());

        let info = match res {
            Ok(info) => info,
            Err(e) if e.is_cancelled() => {
                info!(release = %key, op = op.as_str(), "interrupted by shutdown");
                return Ok(Action::await_change());
            }
            Err(e) => {
                let err = classify(e.into());
                self.metrics.release_error(op.as_str(), err.category.as_str());
                if op == Operation::Upgrade && spec.rollback_opts().enabled {
                    self.roll_back(key, rel, &release, &namespace).await;
                }
                return self.fail(key, rel, op.failed(), err, false).await;
            }
        };

        let generation = rel.metadata.generation.unwrap_or_default();
        let message = format!("{} {} revision {} ({})", op.as_str(), release, info.revision, info.chart());
        let helm_release = observed(&info);
        let original = helmop_values::to_yaml(&info.original_values).ok();
        let applied = spec.clone();
        let msg = message.clone();
        self.patch_status(key, |st| {
            st.helm_release = Some(helm_release.clone());
            st.last_applied_configuration = Some(applied.clone());
            st.original_values = original.clone();
            st.observed_generation = generation;
            st.consecutive_failures = 0;
            st.retry = None;
            conditions::set(&mut st.conditions, Condition::ready(op.completed(), msg.clone()));
            conditions::set(&mut st.conditions, Condition::released(op.completed(), msg.clone()));
            conditions::resolve(&mut st.conditions, ConditionType::Progressing, op.completed(), msg.clone());
            conditions::resolve(&mut st.conditions, ConditionType::Failed, op.completed(), msg.clone());
        })
        .await?;
        self.event(rel, EventKind::Normal, op.completed(), &message).await;
        info!(release = %key, op = op.as_str(), revision = info.revision, chart = %info.chart(), took_ms = t0.elapsed().as_millis() as u64, "release applied");

        if let Some(repo) = repository.filter(|r| r.spec.cache_policy() == CachePolicy::OnDemand) {
            let cx = self.cx(repo.spec.timeout());
            if let Err(e) = self.artifacts.materialize(&cx, repo, &spec.chart.name, &info.chart_version).await {
                warn!(release = %key, error = %format!("{:#}", e), "on-demand values artifact failed");
            }
        }
        Ok(spec.interval().map(Action::requeue).unwrap_or_else(Action::await_change))
    }

    async fn roll_back(&self, key: &ObjectKey, rel: &HelmRelease, release: &str, namespace: &str) {
        let o = rel.spec.rollback_opts();
        let req = RollbackRequest {
            release: release.to_string(),
            namespace: namespace.to_string(),
            revision: o.to_revision,
            timeout: o.timeout(),
            wait: o.wait,
            cleanup_on_fail: o.cleanup_on_fail,
            force: o.force,
            disable_hooks: o.disable_hooks,
        };
        match self.engine.rollback(&self.cx(req.timeout), &req).await {
            Ok(()) => {
                self.metrics.rollback(true);
                info!(release = %key, to_revision = req.revision, "rolled back after failed upgrade");
                self.event(rel, EventKind::Normal, Reason::RollbackCompleted, &format!("rolled back {}", release)).await;
            }
            Err(e) => {
                self.metrics.rollback(false);
                warn!(release = %key, error = %e, "rollback failed");
                self.event(rel, EventKind::Warning, Reason::RollbackFailed, &e.to_string()).await;
            }
        }
    }

    /// Deployed state already matches: refresh what the engine reports.
    async fn refresh(&self, key: &ObjectKey, rel: &HelmRelease, info: &ReleaseInfo) -> anyhow::Result<Action> {
        let generation = rel.metadata.generation.unwrap_or_default();
        let helm_release = observed(info);
        let msg = format!("release {} is up to date at revision {}", info.name, info.revision);
        self.patch_status(key, |st| {
            st.helm_release = Some(helm_release.clone());
            st.observed_generation = generation;
            st.consecutive_failures = 0;
            st.retry = None;
            if !conditions::is_true(&st.conditions, ConditionType::Ready) {
                conditions::set(&mut st.conditions, Condition::ready(Reason::UpgradeCompleted, msg.clone()));
            }
            conditions::resolve(&mut st.conditions, ConditionType::Progressing, Reason::UpgradeCompleted, msg.clone());
            conditions::resolve(&mut st.conditions, ConditionType::Failed, Reason::UpgradeCompleted, msg.clone());
        })
        .await?;
        debug!(release = %key, revision = info.revision, "release up to date");
        Ok(rel.spec.interval().map(Action::requeue).unwrap_or_else(Action::await_change))
    }

    pub async fn reconcile_key(&self, key: &ObjectKey) -> anyhow::Result<Action> {
        if self.token.is_cancelled() {
            debug!(release = %key, "shutting down, pass skipped");
            return Ok(Action::await_change());
        }
        let Some(rel) = self.store.get(key).await? else {
            debug!(release = %key, "release gone");
            return Ok(Action::await_change());
        };
        if rel.meta().deletion_timestamp.is_some() {
            return self.handle_deletion(key, &rel).await;
        }
        let Some(rel) = self.ensure_finalizer(key, rel).await? else { return Ok(Action::await_change()) };

        let window = rel.status.as_ref().and_then(|st| st.retry.as_ref());
        if let Some(wait) = backoff_remaining(window, rel.metadata.generation.unwrap_or_default(), Utc::now()) {
            debug!(release = %key, wait_ms = wait.as_millis() as u64, "backing off after failure");
            return Ok(Action::requeue(wait));
        }

        if let Err(msg) = rel.spec.validate() {
            return self.fail(key, &rel, Reason::ConfigurationError, Self::config_error(msg), true).await;
        }
        if let Err(e) = helmop_values::parse(rel.spec.values_text()) {
            return self.fail(key, &rel, Reason::ConfigurationError, Self::config_error(format!("spec.values: {:#}", e)), true).await;
        }

        if rel.spec.suspend {
            self.patch_status(key, |st| {
                conditions::set(&mut st.conditions, Condition::not_ready(Reason::ReleaseSuspended, "release is suspended"));
            })
            .await?;
            return Ok(Action::await_change());
        }

        let repository = match self.check_dependencies(&rel).await? {
            Ok(r) => r,
            Err(msg) => {
                debug!(release = %key, reason = %msg, "waiting for dependencies");
                self.patch_status(key, |st| {
                    conditions::set(&mut st.conditions, Condition::failed(Reason::DependencyNotReady, msg.clone()));
                    conditions::set(&mut st.conditions, Condition::not_ready(Reason::DependencyNotReady, msg.clone()));
                })
                .await?;
                return Ok(Action::requeue(DEPENDENCY_REQUEUE));
            }
        };

        let own_ns = rel.namespace().unwrap_or_default();
        let own_name = rel.name_any();
        let release = rel.spec.release_name(&own_name).to_string();
        let namespace = rel.spec.release_namespace(&own_ns).to_string();
        let chart = Self::chart_ref(&rel, repository.as_ref());

        let lookup_timeout = rel.spec.install_opts().timeout();
        let current = match self.engine.get(&self.cx(lookup_timeout), &release, &namespace).await {
            Ok(c) => c,
            Err(e) if e.is_not_found() => None,
            Err(e) => return self.fail(key, &rel, Reason::InstallFailed, classify(e.into()), false).await,
        };

        match current {
            None => self.apply(key, &rel, Operation::Install, chart, None, repository.as_ref()).await,
            Some(info) => {
                let baseline = rel.status.as_ref().and_then(|s| s.last_applied_configuration.as_ref());
                match needs_upgrade(&rel.spec, &info, baseline) {
                    Some(why) => self.apply(key, &rel, Operation::Upgrade, chart, Some(why), repository.as_ref()).await,
                    None => self.refresh(key, &rel, &info).await,
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Reconcile<ObjectKey> for ReleaseReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> anyhow::Result<Action> {
        let t0 = Instant::now();
        let res = self.reconcile_key(key).await;
        self.metrics.reconciled("HelmRelease", res.is_ok(), t0.elapsed());
        res
    }
}
