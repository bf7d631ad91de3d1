#![forbid(unsafe_code)]

mod common;

use std::time::Duration;

use common::{condition, repo_spec, Harness};
use helmop_api::EngineError;
use helmop_core::conditions::{ConditionStatus, ConditionType};
use helmop_core::{Action, ObjectKey, MAX_FAILURE_RECORDS, RELEASE_FINALIZER};
use helmop_kubehub::{ArtifactStore, ResourceStore};

const WEB: &str = r#"
chart:
  name: nginx
  version: "15.0.0"
  repository:
    name: bitnami
release:
  namespace: web
  createNamespace: true
values: |
  a: 1
  b: 2
interval: 10m
"#;

fn with_ready_repo() -> Harness {
    let h = Harness::new();
    h.add_ready_repository("apps", "bitnami", repo_spec("https://charts.bitnami.com/bitnami"));
    h
}

async fn installed(h: &Harness) -> ObjectKey {
    let key = h.add_release("apps", "frontend", WEB);
    h.release.reconcile_key(&key).await.unwrap();
    key
}

/// Apply a spec edit the way a user would, bumping the generation.
async fn edit(h: &Harness, key: &ObjectKey, f: impl FnOnce(&mut helmop_core::HelmReleaseSpec)) {
    let mut rel = h.release_obj(key);
    f(&mut rel.spec);
    h.releases.update(&rel).await.unwrap();
}

#[tokio::test]
async fn invalid_release_fails_without_engine_calls() {
    let h = Harness::new();
    let key = h.add_release("apps", "orphan", "chart:\n  name: nginx\n");

    let action = h.release.reconcile_key(&key).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(300)));
    assert!(h.engine_calls().is_empty(), "{:?}", h.engine_calls());
    let st = h.release_obj(&key).status.unwrap();
    assert_eq!(condition(&st.conditions, ConditionType::Failed).reason, "ConfigurationError");
}

#[tokio::test]
async fn unparsable_values_are_a_configuration_error() {
    let h = with_ready_repo();
    let key = h.add_release("apps", "frontend", "chart:\n  name: nginx\n  repository:\n    name: bitnami\nvalues: \"- just\\n- a list\"\n");

    let action = h.release.reconcile_key(&key).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(300)));
    assert!(h.engine_calls().is_empty());
    let st = h.release_obj(&key).status.unwrap();
    assert_eq!(condition(&st.conditions, ConditionType::Failed).reason, "ConfigurationError");
}

#[tokio::test]
async fn suspended_release_is_left_alone() {
    let h = with_ready_repo();
    let key = h.add_release("apps", "frontend", &format!("{}suspend: true\n", WEB));

    assert_eq!(h.release.reconcile_key(&key).await.unwrap(), Action::AwaitChange);
    assert!(h.engine_calls().is_empty());
    let st = h.release_obj(&key).status.unwrap();
    let ready = condition(&st.conditions, ConditionType::Ready);
    assert_eq!((ready.status, ready.reason.as_str()), (ConditionStatus::False, "ReleaseSuspended"));
}

#[tokio::test]
async fn unready_repository_blocks_release() {
    let h = Harness::new();
    h.add_repository("apps", "bitnami", repo_spec("https://charts.bitnami.com/bitnami"));
    let key = h.add_release("apps", "frontend", WEB);

    assert_eq!(h.release.reconcile_key(&key).await.unwrap(), Action::requeue(Duration::from_secs(60)));
    assert!(h.engine_calls().is_empty());
    let st = h.release_obj(&key).status.unwrap();
    let failed = condition(&st.conditions, ConditionType::Failed);
    assert_eq!(failed.reason, "DependencyNotReady");
    assert!(failed.message.contains("apps/bitnami"), "{}", failed.message);
}

#[tokio::test]
async fn unready_depends_on_blocks_release() {
    let h = with_ready_repo();
    h.add_release("apps", "database", "chart:\n  name: postgresql\n  repository:\n    name: bitnami\n");
    let key = h.add_release("apps", "frontend", &format!("{}dependsOn:\n  - name: database\n", WEB));

    assert_eq!(h.release.reconcile_key(&key).await.unwrap(), Action::requeue(Duration::from_secs(60)));
    assert_eq!(h.engine.count("install"), 0);

    // once the dependency converges the release proceeds
    h.release.reconcile_key(&ObjectKey::new("apps", "database")).await.unwrap();
    h.release.reconcile_key(&key).await.unwrap();
    assert!(h.engine.release("web", "frontend").is_some());
}

#[tokio::test]
async fn direct_url_release_skips_repository_gate() {
    let h = Harness::new();
    let key = h.add_release("apps", "podinfo", "chart:\n  name: podinfo\n  repositoryURL: https://stefanprodan.github.io/podinfo\n");

    assert_eq!(h.release.reconcile_key(&key).await.unwrap(), Action::AwaitChange);
    assert!(h.engine.release("apps", "podinfo").is_some());
}

#[tokio::test]
async fn install_records_release_and_baseline() {
    let h = with_ready_repo();
    h.engine.set_default_values("nginx", "15.0.0", "replicaCount: 1\n");
    let key = h.add_release("apps", "frontend", WEB);

    let action = h.release.reconcile_key(&key).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(600)));
    assert!(h.engine.calls().contains(&"install frontend".to_string()));

    let rel = h.release_obj(&key);
    assert!(rel.metadata.finalizers.clone().unwrap_or_default().iter().any(|f| f == RELEASE_FINALIZER));
    let st = rel.status.unwrap();
    assert_eq!(condition(&st.conditions, ConditionType::Ready).reason, "InstallCompleted");
    assert_eq!(condition(&st.conditions, ConditionType::Released).status, ConditionStatus::True);
    assert_eq!(condition(&st.conditions, ConditionType::Progressing).status, ConditionStatus::False);
    let info = st.helm_release.unwrap();
    assert_eq!((info.namespace.as_str(), info.revision, info.chart.as_str()), ("web", 1, "nginx-15.0.0"));
    assert_eq!(st.last_applied_configuration.as_ref(), Some(&rel.spec));
    assert_eq!(st.original_values.as_deref(), Some("replicaCount: 1\n"));
    assert_eq!(st.observed_generation, 1);
    let reasons = h.events.reasons();
    assert!(reasons.contains(&"InstallStarted".to_string()) && reasons.contains(&"InstallCompleted".to_string()));
}

#[tokio::test]
async fn reordered_values_do_not_upgrade() {
    let h = with_ready_repo();
    let key = installed(&h).await;
    edit(&h, &key, |s| s.values = Some("b: 2\na: 1\n".into())).await;

    h.release.reconcile_key(&key).await.unwrap();
    assert_eq!(h.engine.count("upgrade"), 0);
    let st = h.release_obj(&key).status.unwrap();
    assert_eq!(st.observed_generation, 2);
    assert_eq!(condition(&st.conditions, ConditionType::Ready).status, ConditionStatus::True);
}

#[tokio::test]
async fn version_bump_upgrades() {
    let h = with_ready_repo();
    let key = installed(&h).await;
    edit(&h, &key, |s| s.chart.version = Some("15.1.0".into())).await;

    h.release.reconcile_key(&key).await.unwrap();
    assert_eq!(h.engine.count("upgrade"), 1);
    let started = h.events.events().into_iter().find(|e| e.reason == "UpgradeStarted").unwrap();
    assert!(started.message.contains("15.1.0"), "{}", started.message);
    let st = h.release_obj(&key).status.unwrap();
    assert_eq!(st.helm_release.unwrap().chart, "nginx-15.1.0");
    assert_eq!(condition(&st.conditions, ConditionType::Ready).reason, "UpgradeCompleted");
}

#[tokio::test]
async fn values_drift_upgrades() {
    let h = with_ready_repo();
    let key = installed(&h).await;
    edit(&h, &key, |s| s.values = Some("a: 1\nb: 3\n".into())).await;

    h.release.reconcile_key(&key).await.unwrap();
    assert_eq!(h.engine.count("upgrade"), 1);
    let deployed = h.engine.release("web", "frontend").unwrap();
    assert_eq!(deployed.values, serde_json::json!({"a": 1, "b": 3}));
}

#[tokio::test]
async fn failed_upgrade_rolls_back_and_stays_failed() {
    let h = with_ready_repo();
    let key = h.add_release("apps", "frontend", &format!("{}rollback:\n  enabled: true\n", WEB));
    h.release.reconcile_key(&key).await.unwrap();
    edit(&h, &key, |s| s.chart.version = Some("16.0.0".into())).await;
    h.engine.fail_next("upgrade", EngineError::Failed("UPGRADE FAILED: post-upgrade hooks failed".into()));

    let action = h.release.reconcile_key(&key).await.unwrap();
    assert_eq!(h.engine.count("rollback"), 1);
    assert!(h.events.reasons().contains(&"RollbackCompleted".to_string()));
    let st = h.release_obj(&key).status.unwrap();
    assert_eq!(condition(&st.conditions, ConditionType::Failed).reason, "UpgradeFailed");
    assert_eq!(condition(&st.conditions, ConditionType::Ready).status, ConditionStatus::False);
    assert_eq!(st.failures.len(), 1);
    assert_eq!(st.consecutive_failures, 1);
    // unknown category: 30s base with 10% jitter
    let wait = action.requeue_after().unwrap();
    assert!(wait >= Duration::from_secs(27) && wait <= Duration::from_secs(33), "{wait:?}");
}

#[tokio::test]
async fn install_network_failure_is_retried_with_backoff() {
    let h = with_ready_repo();
    let key = h.add_release("apps", "frontend", WEB);
    h.engine.fail_next("install", EngineError::Failed("dial tcp 10.96.0.1:443: connect: connection refused".into()));

    let wait = h.release.reconcile_key(&key).await.unwrap().requeue_after().unwrap();
    assert!(wait >= Duration::from_secs(4) && wait <= Duration::from_secs(6), "{wait:?}");
    let st = h.release_obj(&key).status.unwrap();
    assert_eq!(condition(&st.conditions, ConditionType::Failed).reason, "InstallFailed");
    assert!(st.retry.is_some());

    // woken early by a status-only update: no second install inside the window
    let held = h.release.reconcile_key(&key).await.unwrap().requeue_after().unwrap();
    assert!(held <= wait, "{held:?}");
    assert_eq!(h.engine.count("install"), 1);
    assert_eq!(h.release_obj(&key).status.unwrap().failures.len(), 1);

    h.elapse_release_backoff(&key);
    h.release.reconcile_key(&key).await.unwrap();
    assert_eq!(h.engine.count("install"), 2);
    let st = h.release_obj(&key).status.unwrap();
    assert_eq!(condition(&st.conditions, ConditionType::Ready).reason, "InstallCompleted");
    assert!(st.retry.is_none());
}

#[tokio::test]
async fn spec_edit_during_backoff_runs_immediately() {
    let h = with_ready_repo();
    let key = h.add_release("apps", "frontend", WEB);
    h.engine.fail_next("install", EngineError::Failed("chart \"nginx\" version \"15.0.0\" not found".into()));
    h.release.reconcile_key(&key).await.unwrap();

    edit(&h, &key, |s| s.chart.version = Some("15.1.0".into())).await;
    h.release.reconcile_key(&key).await.unwrap();
    assert_eq!(h.engine.count("install"), 2);
    assert_eq!(h.release_obj(&key).status.unwrap().helm_release.unwrap().chart, "nginx-15.1.0");
}

#[tokio::test]
async fn failure_log_is_bounded() {
    let h = with_ready_repo();
    let key = h.add_release("apps", "frontend", WEB);
    for i in 0..(MAX_FAILURE_RECORDS + 3) {
        h.engine.fail_next("install", EngineError::Failed(format!("boom {}", i)));
        h.release.reconcile_key(&key).await.unwrap();
        h.elapse_release_backoff(&key);
    }
    let st = h.release_obj(&key).status.unwrap();
    assert_eq!(st.failures.len(), MAX_FAILURE_RECORDS);
    assert_eq!(st.failures.last().unwrap().message, format!("boom {}", MAX_FAILURE_RECORDS + 2));
    assert_eq!(st.failures[0].message, "boom 3");
}

#[tokio::test]
async fn uninstall_error_still_removes_finalizer() {
    let h = with_ready_repo();
    let key = installed(&h).await;
    h.engine.fail_next("uninstall", EngineError::Failed("context deadline exceeded".into()));

    h.releases.delete(&key);
    assert_eq!(h.release.reconcile_key(&key).await.unwrap(), Action::AwaitChange);
    assert!(h.releases.snapshot(&key).is_none());
    assert!(h.events.reasons().contains(&"UninstallFailed".to_string()));
}

#[tokio::test]
async fn deletion_during_shutdown_keeps_release_and_finalizer() {
    let h = with_ready_repo();
    let key = installed(&h).await;
    h.token.cancel();

    h.releases.delete(&key);
    assert_eq!(h.release.reconcile_key(&key).await.unwrap(), Action::AwaitChange);
    let rel = h.releases.snapshot(&key).expect("object kept until uninstall runs");
    assert!(rel.metadata.finalizers.unwrap_or_default().iter().any(|f| f == RELEASE_FINALIZER));
    assert!(h.engine.release("web", "frontend").is_some());
    assert_eq!(h.engine.count("uninstall"), 0);
}

#[tokio::test]
async fn uninstall_cut_short_keeps_finalizer() {
    let h = with_ready_repo();
    let key = installed(&h).await;
    h.engine.fail_next("uninstall", EngineError::Cancelled);

    h.releases.delete(&key);
    h.release.reconcile_key(&key).await.unwrap();
    assert!(h.releases.snapshot(&key).is_some());
    assert!(!h.events.reasons().contains(&"UninstallFailed".to_string()));

    h.release.reconcile_key(&key).await.unwrap();
    assert!(h.releases.snapshot(&key).is_none());
    assert!(h.engine.release("web", "frontend").is_none());
}

#[tokio::test]
async fn shutdown_mid_upgrade_records_nothing() {
    let h = with_ready_repo();
    let key = h.add_release("apps", "frontend", &format!("{}rollback:\n  enabled: true\n", WEB));
    h.release.reconcile_key(&key).await.unwrap();
    edit(&h, &key, |s| s.chart.version = Some("16.0.0".into())).await;
    h.engine.fail_next("upgrade", EngineError::Cancelled);

    assert_eq!(h.release.reconcile_key(&key).await.unwrap(), Action::AwaitChange);
    assert_eq!(h.engine.count("rollback"), 0);
    let st = h.release_obj(&key).status.unwrap();
    assert!(st.failures.is_empty());
    assert_eq!(st.consecutive_failures, 0);
    assert_eq!(condition(&st.conditions, ConditionType::Failed).status, ConditionStatus::False);
}

#[tokio::test]
async fn deletion_of_missing_release_succeeds() {
    let h = with_ready_repo();
    let key = installed(&h).await;
    // removed behind our back
    h.engine.fail_next("uninstall", EngineError::NotFound("release: not found".into()));

    h.releases.delete(&key);
    h.release.reconcile_key(&key).await.unwrap();
    assert!(h.releases.snapshot(&key).is_none());
    assert!(!h.events.reasons().contains(&"UninstallFailed".to_string()));
}

#[tokio::test]
async fn on_demand_policy_caches_deployed_version() {
    let h = Harness::new();
    let mut spec = repo_spec("https://charts.bitnami.com/bitnami");
    spec.values_config_map_policy = Some("on-demand".into());
    h.add_ready_repository("apps", "bitnami", spec);
    h.engine.set_default_values("nginx", "15.0.0", "replicaCount: 1\n");

    installed(&h).await;
    let a = h.artifacts.get("apps", "helm-values-bitnami-nginx-15-0-0").await.unwrap().unwrap();
    assert_eq!(a.data["values.yaml"], "replicaCount: 1\n");
}
