use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

/// Controller metric series. Built once at startup and shared by both reconcilers;
/// recording goes through whatever recorder the binary installed.
#[derive(Debug, Default)]
pub struct Metrics {
    _priv: (),
}

impl Metrics {
    pub fn new() -> Self {
        describe_histogram!("helm_repository_sync_duration_seconds", Unit::Seconds, "Time spent syncing a repository");
        describe_counter!("helm_repository_sync_total", "Repository sync passes by result");
        describe_counter!("helm_repository_sync_errors_total", "Repository sync failures by error category");
        describe_gauge!("helm_repository_charts_discovered", "Charts listed by the last successful sync");
        describe_histogram!("helm_release_operation_duration_seconds", Unit::Seconds, "Time spent in release engine operations");
        describe_counter!("helm_release_operation_total", "Release engine operations by result");
        describe_counter!("helm_release_operation_errors_total", "Release operation failures by error category");
        describe_counter!("helm_release_rollbacks_total", "Automatic rollbacks after failed upgrades");
        describe_counter!("helm_chart_configmaps_generated_total", "Default-values artifacts created or updated");
        describe_counter!("helm_chart_configmaps_cleaned_total", "Default-values artifacts removed by retention");
        describe_counter!("helm_operator_reconcile_total", "Reconcile passes by kind and result");
        describe_histogram!("helm_operator_reconcile_duration_seconds", Unit::Seconds, "Reconcile pass duration");
        describe_counter!("helm_operator_reconcile_errors_total", "Reconcile passes that returned an error");
        Self { _priv: () }
    }

    pub fn reconciled(&self, kind: &'static str, ok: bool, took: Duration) {
        let result = if ok { "success" } else { "error" };
        counter!("helm_operator_reconcile_total", 1u64, "kind" => kind, "result" => result);
        histogram!("helm_operator_reconcile_duration_seconds", took.as_secs_f64(), "kind" => kind);
        if !ok {
            counter!("helm_operator_reconcile_errors_total", 1u64, "kind" => kind);
        }
    }

    pub fn repository_synced(&self, repository: &str, ok: bool, took: Duration) {
        let result = if ok { "success" } else { "error" };
        counter!("helm_repository_sync_total", 1u64, "repository" => repository.to_string(), "result" => result);
        histogram!("helm_repository_sync_duration_seconds", took.as_secs_f64(), "repository" => repository.to_string());
    }

    pub fn repository_sync_error(&self, repository: &str, category: &'static str) {
        counter!("helm_repository_sync_errors_total", 1u64, "repository" => repository.to_string(), "category" => category);
    }

    pub fn charts_discovered(&self, repository: &str, charts: usize) {
        gauge!("helm_repository_charts_discovered", charts as f64, "repository" => repository.to_string());
    }

    pub fn release_operation(&self, op: &'static str, ok: bool, took: Duration) {
        let result = if ok { "success" } else { "error" };
        counter!("helm_release_operation_total", 1u64, "operation" => op, "result" => result);
        histogram!("helm_release_operation_duration_seconds", took.as_secs_f64(), "operation" => op);
    }

    pub fn release_error(&self, op: &'static str, category: &'static str) {
        counter!("helm_release_operation_errors_total", 1u64, "operation" => op, "category" => category);
    }

    pub fn rollback(&self, ok: bool) {
        counter!("helm_release_rollbacks_total", 1u64, "result" => if ok { "success" } else { "error" });
    }

    pub fn configmaps_generated(&self, repository: &str, n: usize) {
        if n > 0 {
            counter!("helm_chart_configmaps_generated_total", n as u64, "repository" => repository.to_string());
        }
    }

    pub fn configmaps_cleaned(&self, repository: &str, n: usize) {
        if n > 0 {
            counter!("helm_chart_configmaps_cleaned_total", n as u64, "repository" => repository.to_string());
        }
    }
}
