//! `HelmRepository` reconciler: register the source with the engine, refresh its
//! index on an interval, publish the chart catalogue in status and keep the
//! values-artifact cache in line with the repository's policy.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use helmop_api::{CallContext, PackageInfo, RepositoryCredentials, RepositoryEngine, RepositoryEntry};
use helmop_core::conditions::{self, Condition, ConditionType, Reason};
use helmop_core::error::is_engine_cancelled;
use helmop_core::{
    classify, Action, CachePolicy, ChartInfo, ChartVersion, ClassifiedError, ErrorCategory, HelmRepository, HelmRepositoryStatus, ObjectKey,
    RepositoryKind, RepositoryStats, REPOSITORY_FINALIZER,
};
use helmop_kubehub::{EventKind, EventSink, ResourceStore, SecretSource};
use helmop_queue::Reconcile;
use kube::{Resource, ResourceExt};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{backoff_remaining, retry_window, with_conflict_retry, ArtifactCache, Metrics, ReconcileError, Write, CONFIG_ERROR_REQUEUE};

/// Whether a sync pass is due: never synced, unknown to the engine, or the
/// interval has elapsed since the last sync.
pub fn should_sync(last_sync: Option<DateTime<Utc>>, interval: Duration, now: DateTime<Utc>, registered: bool) -> bool {
    match last_sync {
        None => true,
        Some(_) if !registered => true,
        Some(_) => next_sync_delay(last_sync, interval, now).is_zero(),
    }
}

/// Time until the next sync is due, never negative.
pub fn next_sync_delay(last_sync: Option<DateTime<Utc>>, interval: Duration, now: DateTime<Utc>) -> Duration {
    let Some(last) = last_sync else { return Duration::ZERO };
    let interval = chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::zero());
    (last + interval - now).to_std().unwrap_or(Duration::ZERO)
}

fn catalogue(packages: &[PackageInfo]) -> (Vec<ChartInfo>, RepositoryStats) {
    let charts: Vec<ChartInfo> = packages
        .iter()
        .map(|p| ChartInfo {
            name: p.name.clone(),
            description: p.description.clone(),
            versions: p
                .versions
                .iter()
                .map(|v| ChartVersion { version: v.version.clone(), app_version: v.app_version.clone(), created: v.created, digest: v.digest.clone() })
                .collect(),
        })
        .collect();
    let stats = RepositoryStats { total_charts: charts.len() as u32, total_versions: charts.iter().map(|c| c.versions.len() as u32).sum() };
    (charts, stats)
}

fn secret_text(data: &std::collections::BTreeMap<String, Vec<u8>>, key: &str) -> Option<String> {
    data.get(key).map(|b| String::from_utf8_lossy(b).into_owned()).filter(|s| !s.is_empty())
}

pub struct RepositoryReconciler {
    store: Arc<dyn ResourceStore<HelmRepository>>,
    secrets: Arc<dyn SecretSource>,
    engine: Arc<dyn RepositoryEngine>,
    artifacts: ArtifactCache,
    events: Arc<dyn EventSink>,
    metrics: Arc<Metrics>,
    /// Names the engine has registered; `None` until first loaded.
    registrations: RwLock<Option<BTreeSet<String>>>,
    token: CancellationToken,
    conflict_attempts: u32,
}

impl RepositoryReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ResourceStore<HelmRepository>>,
        secrets: Arc<dyn SecretSource>,
        engine: Arc<dyn RepositoryEngine>,
        artifacts: ArtifactCache,
        events: Arc<dyn EventSink>,
        metrics: Arc<Metrics>,
        token: CancellationToken,
        conflict_attempts: u32,
    ) -> Self {
        Self { store, secrets, engine, artifacts, events, metrics, registrations: RwLock::new(None), token, conflict_attempts }
    }

    fn cx(&self, timeout: Duration) -> CallContext { CallContext::new(self.token.clone(), timeout) }

    /// Drop the cached registration list; the next lookup reloads it.
    pub async fn invalidate_registrations(&self) { *self.registrations.write().await = None; }

    async fn is_registered(&self, cx: &CallContext, name: &str) -> bool {
        if let Some(set) = self.registrations.read().await.as_ref() {
            if set.contains(name) {
                return true;
            }
        }
        // miss: reload, the engine may have been reset underneath us
        match self.engine.list_repositories(cx).await {
            Ok(names) => {
                let set: BTreeSet<String> = names.into_iter().collect();
                let found = set.contains(name);
                *self.registrations.write().await = Some(set);
                found
            }
            Err(e) => {
                debug!(repo = name, error = %e, "listing registrations failed");
                false
            }
        }
    }

    async fn note_registered(&self, name: &str, present: bool) {
        let mut g = self.registrations.write().await;
        if let Some(set) = g.as_mut() {
            if present {
                set.insert(name.to_string());
            } else {
                set.remove(name);
            }
        }
    }

    async fn patch_status<F>(&self, key: &ObjectKey, mut f: F) -> Result<Option<HelmRepository>, ReconcileError>
    where
        F: FnMut(&mut HelmRepositoryStatus) + Send,
    {
        with_conflict_retry(&*self.store, key, Write::Status, self.conflict_attempts, |r: &mut HelmRepository| {
            f(r.status.get_or_insert_with(Default::default))
        })
        .await
    }

    async fn event(&self, repo: &HelmRepository, kind: EventKind, reason: Reason, message: &str) {
        self.events.publish(&repo.object_ref(&()), kind, reason.as_str(), message).await;
    }

    async fn resolve_credentials(&self, repo: &HelmRepository) -> anyhow::Result<RepositoryCredentials> {
        let own_ns = repo.namespace().unwrap_or_default();
        let mut creds = RepositoryCredentials::default();
        let Some(auth) = repo.spec.auth.as_ref() else { return Ok(creds) };
        if let Some(basic) = auth.basic.as_ref() {
            creds.username = basic.username.clone();
            creds.password = basic.password.clone();
            if let Some(sr) = basic.secret_ref.as_ref() {
                let ns = sr.namespace.as_deref().filter(|s| !s.is_empty()).unwrap_or(&own_ns);
                let data = self.secrets.get(ns, &sr.name).await?.ok_or_else(|| anyhow!("auth secret {}/{} not found", ns, sr.name))?;
                creds.username = secret_text(&data, "username").or(creds.username);
                creds.password = secret_text(&data, "password").or(creds.password);
            }
        }
        if let Some(tls) = auth.tls.as_ref() {
            creds.insecure_skip_verify = tls.insecure_skip_verify;
            creds.ca_file = tls.ca_file.clone();
            creds.cert_file = tls.cert_file.clone();
            creds.key_file = tls.key_file.clone();
            if let Some(sr) = tls.secret_ref.as_ref() {
                let ns = sr.namespace.as_deref().filter(|s| !s.is_empty()).unwrap_or(&own_ns);
                let data = self.secrets.get(ns, &sr.name).await?.ok_or_else(|| anyhow!("tls secret {}/{} not found", ns, sr.name))?;
                creds.ca_pem = secret_text(&data, "ca.crt");
                creds.cert_pem = secret_text(&data, "tls.crt");
                creds.key_pem = secret_text(&data, "tls.key");
            }
        }
        Ok(creds)
    }

    async fn handle_deletion(&self, key: &ObjectKey, repo: &HelmRepository) -> anyhow::Result<Action> {
        if !repo.finalizers().iter().any(|f| f == REPOSITORY_FINALIZER) {
            return Ok(Action::await_change());
        }
        let name = repo.name_any();
        match self.engine.remove_repository(&self.cx(repo.spec.timeout()), &name).await {
            Ok(()) => info!(repo = %key, "repository unregistered"),
            Err(e) if e.is_not_found() => debug!(repo = %key, "repository was not registered"),
            Err(e) if e.is_cancelled() => {
                info!(repo = %key, "unregister interrupted by shutdown; finalizer kept");
                return Ok(Action::await_change());
            }
            Err(e) => warn!(repo = %key, error = %e, "unregistering repository failed"),
        }
        self.note_registered(&name, false).await;
        with_conflict_retry(&*self.store, key, Write::Object, self.conflict_attempts, |r: &mut HelmRepository| {
            r.metadata.finalizers.get_or_insert_with(Vec::new).retain(|f| f != REPOSITORY_FINALIZER);
        })
        .await?;
        Ok(Action::await_change())
    }

    async fn ensure_finalizer(&self, key: &ObjectKey, repo: HelmRepository) -> anyhow::Result<Option<HelmRepository>> {
        if repo.finalizers().iter().any(|f| f == REPOSITORY_FINALIZER) {
            return Ok(Some(repo));
        }
        let updated = with_conflict_retry(&*self.store, key, Write::Object, self.conflict_attempts, |r: &mut HelmRepository| {
            let fins = r.metadata.finalizers.get_or_insert_with(Vec::new);
            if !fins.iter().any(|f| f == REPOSITORY_FINALIZER) {
                fins.push(REPOSITORY_FINALIZER.to_string());
            }
        })
        .await?;
        Ok(updated)
    }

    /// Record a failed pass and pick the requeue: fixed for configuration and
    /// non-retryable errors, category backoff otherwise. The retry time lands in
    /// status so later passes for the same generation wait it out.
    async fn fail(&self, key: &ObjectKey, repo: &HelmRepository, reason: Reason, err: ClassifiedError, fixed: bool) -> anyhow::Result<Action> {
        if is_engine_cancelled(&err.source) {
            info!(repo = %key, "sync interrupted by shutdown");
            return Ok(Action::await_change());
        }
        let message = err.to_string();
        self.metrics.repository_sync_error(&repo.name_any(), err.category.as_str());
        warn!(repo = %key, reason = %reason, category = err.category.as_str(), error = %message, "repository reconcile failed");
        self.event(repo, EventKind::Warning, reason, &message).await;
        let msg = message.clone();
        let now = Utc::now();
        let generation = repo.metadata.generation.unwrap_or_default();
        let mut delay = CONFIG_ERROR_REQUEUE;
        self.patch_status(key, |st| {
            conditions::set(&mut st.conditions, Condition::failed(reason, msg.clone()));
            conditions::set(&mut st.conditions, Condition::not_ready(reason, msg.clone()));
            conditions::resolve(&mut st.conditions, ConditionType::Syncing, reason, msg.clone());
            st.consecutive_failures = st.consecutive_failures.saturating_add(1);
            delay = if fixed || !err.retryable { CONFIG_ERROR_REQUEUE } else { err.delay_for_attempt(st.consecutive_failures) };
            st.retry = Some(retry_window(generation, delay, now));
        })
        .await?;
        Ok(Action::requeue(delay))
    }

    async fn sync(&self, key: &ObjectKey, repo: &HelmRepository) -> anyhow::Result<Action> {
        let name = repo.name_any();
        let started = Instant::now();
        let cx = self.cx(repo.spec.timeout());
        if cx.is_cancelled() {
            info!(repo = %key, "sync skipped, shutting down");
            return Ok(Action::await_change());
        }
        self.patch_status(key, |st| {
            conditions::set(&mut st.conditions, Condition::syncing(Reason::SyncStarted, "synchronizing repository index"));
        })
        .await?;
        self.event(repo, EventKind::Normal, Reason::SyncStarted, &format!("syncing {}", repo.spec.url)).await;

        let credentials = match self.resolve_credentials(repo).await {
            Ok(c) => c,
            Err(e) => {
                self.metrics.repository_synced(&name, false, started.elapsed());
                let err = ClassifiedError { category: ErrorCategory::Auth, retry_after: CONFIG_ERROR_REQUEUE, retryable: true, source: e };
                return self.fail(key, repo, Reason::AuthenticationFailed, err, true).await;
            }
        };
        let kind = repo.spec.kind();
        let entry = RepositoryEntry { name: name.clone(), url: repo.spec.url.clone(), registry: kind == RepositoryKind::Registry, credentials };

        let fetched = async {
            self.engine.add_repository(&cx, &entry).await?;
            self.note_registered(&name, true).await;
            if kind == RepositoryKind::Registry {
                return Ok::<_, anyhow::Error>(None);
            }
            self.engine.sync_repository_index(&cx, &name).await?;
            Ok(Some(self.engine.list_packages(&cx, &name).await?))
        }
        .await;
        let packages = match fetched {
            Ok(p) => p,
            Err(e) if is_engine_cancelled(&e) => {
                info!(repo = %key, "sync interrupted by shutdown");
                return Ok(Action::await_change());
            }
            Err(e) => {
                self.metrics.repository_synced(&name, false, started.elapsed());
                return self.fail(key, repo, Reason::SyncFailed, classify(e), false).await;
            }
        };

        if let Some(pkgs) = packages.as_deref() {
            if repo.spec.cache_policy() == CachePolicy::Lazy {
                let (written, failed) = self.artifacts.materialize_latest(&cx, repo, pkgs).await;
                debug!(repo = %key, written, failed, "lazy values artifacts");
            }
        }

        let now = Utc::now();
        let generation = repo.metadata.generation.unwrap_or_default();
        let (charts, stats) = catalogue(packages.as_deref().unwrap_or_default());
        let message = match &packages {
            Some(_) => format!("synced {} charts ({} versions)", stats.total_charts, stats.total_versions),
            None => "registry repository registered".to_string(),
        };
        self.metrics.charts_discovered(&name, stats.total_charts as usize);
        let msg = message.clone();
        self.patch_status(key, |st| {
            if packages.is_some() {
                st.charts = charts.clone();
                st.stats = Some(stats.clone());
            }
            st.last_sync_time = Some(now);
            st.observed_generation = generation;
            st.consecutive_failures = 0;
            st.retry = None;
            conditions::set(&mut st.conditions, Condition::ready(Reason::SyncCompleted, msg.clone()));
            conditions::resolve(&mut st.conditions, ConditionType::Syncing, Reason::SyncCompleted, msg.clone());
            conditions::resolve(&mut st.conditions, ConditionType::Failed, Reason::SyncCompleted, msg.clone());
        })
        .await?;
        self.metrics.repository_synced(&name, true, started.elapsed());
        self.event(repo, EventKind::Normal, Reason::SyncCompleted, &message).await;

        if let Err(e) = self.artifacts.sweep(repo, repo.spec.retention(), now).await {
            warn!(repo = %key, error = %format!("{:#}", e), "values artifact sweep failed");
        }
        info!(repo = %key, charts = stats.total_charts, took_ms = started.elapsed().as_millis() as u64, "repository synced");
        Ok(Action::requeue(repo.spec.interval()))
    }

    pub async fn reconcile_key(&self, key: &ObjectKey) -> anyhow::Result<Action> {
        if self.token.is_cancelled() {
            debug!(repo = %key, "shutting down, pass skipped");
            return Ok(Action::await_change());
        }
        let Some(repo) = self.store.get(key).await? else {
            debug!(repo = %key, "repository gone");
            return Ok(Action::await_change());
        };
        if repo.meta().deletion_timestamp.is_some() {
            return self.handle_deletion(key, &repo).await;
        }
        let Some(repo) = self.ensure_finalizer(key, repo).await? else { return Ok(Action::await_change()) };

        let status = repo.status.clone().unwrap_or_default();
        let generation = repo.metadata.generation.unwrap_or_default();
        if let Some(wait) = backoff_remaining(status.retry.as_ref(), generation, Utc::now()) {
            debug!(repo = %key, wait_ms = wait.as_millis() as u64, "backing off after failure");
            return Ok(Action::requeue(wait));
        }

        if let Err(msg) = repo.spec.validate() {
            let err = ClassifiedError {
                category: ErrorCategory::Validation,
                retry_after: CONFIG_ERROR_REQUEUE,
                retryable: false,
                source: anyhow!(msg),
            };
            return self.fail(key, &repo, Reason::ConfigurationError, err, true).await;
        }

        if repo.spec.suspend {
            self.patch_status(key, |st| {
                conditions::set(&mut st.conditions, Condition::not_ready(Reason::Suspended, "repository is suspended"));
            })
            .await?;
            return Ok(Action::await_change());
        }

        let registered = self.is_registered(&self.cx(repo.spec.timeout()), &repo.name_any()).await;
        let interval = repo.spec.interval();
        let now = Utc::now();
        // spec changes and failed passes past their backoff retry without waiting out the interval
        let pending = status.consecutive_failures > 0 || status.observed_generation != generation;
        if !pending && !should_sync(status.last_sync_time, interval, now, registered) {
            let wait = next_sync_delay(status.last_sync_time, interval, now);
            debug!(repo = %key, wait_s = wait.as_secs(), "sync not due");
            return Ok(Action::requeue(wait));
        }
        self.sync(key, &repo).await
    }
}

#[async_trait::async_trait]
impl Reconcile<ObjectKey> for RepositoryReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> anyhow::Result<Action> {
        let t0 = Instant::now();
        let res = self.reconcile_key(key).await;
        self.metrics.reconciled("HelmRepository", res.is_ok(), t0.elapsed());
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helmop_api::PackageVersion;

    #[test]
    fn overdue_repository_syncs_immediately() {
        let now = Utc::now();
        let last = Some(now - chrono::Duration::hours(2));
        let hour = Duration::from_secs(3600);
        assert!(should_sync(last, hour, now, true));
        assert_eq!(next_sync_delay(last, hour, now), Duration::ZERO);
    }

    #[test]
    fn recent_sync_waits_for_remaining_interval() {
        let now = Utc::now();
        let last = Some(now - chrono::Duration::minutes(20));
        let hour = Duration::from_secs(3600);
        assert!(!should_sync(last, hour, now, true));
        assert_eq!(next_sync_delay(last, hour, now), Duration::from_secs(40 * 60));
        // unknown to the engine: sync regardless
        assert!(should_sync(last, hour, now, false));
        assert!(should_sync(None, hour, now, true));
    }

    #[test]
    fn catalogue_counts_versions() {
        let v = |s: &str| PackageVersion { version: s.into(), ..Default::default() };
        let pkgs = vec![
            PackageInfo { name: "a".into(), description: "A".into(), versions: vec![v("2"), v("1")] },
            PackageInfo { name: "b".into(), description: String::new(), versions: vec![v("1")] },
        ];
        let (charts, stats) = catalogue(&pkgs);
        assert_eq!(charts[0].versions[0].version, "2");
        assert_eq!((stats.total_charts, stats.total_versions), (2, 3));
    }
}
