//! helmop controller: convergence logic for `HelmRepository` and `HelmRelease`.
//!
//! Each reconciler loads the declared object, decides the next step, drives the
//! engine through [`helmop_api`] traits and records the outcome in status with a
//! bounded conflict-retry loop. [`run`] wires them to kube watches and a worker pool.

#![forbid(unsafe_code)]

pub mod artifacts;
mod error;
pub mod release;
pub mod repository;
mod retry;
mod runner;
mod telemetry;

pub use artifacts::{ArtifactCache, Materialized};
pub use error::ReconcileError;
pub use telemetry::Metrics;
pub use release::{needs_upgrade, ReleaseReconciler};
pub use repository::{next_sync_delay, should_sync, RepositoryReconciler};
pub use retry::{backoff_remaining, retry_window, with_conflict_retry, Write, DEFAULT_CONFLICT_ATTEMPTS};
pub use runner::{run, ControllerConfig};

use std::time::Duration;

/// Requeue for errors that will not heal on their own (bad spec, missing secret).
pub const CONFIG_ERROR_REQUEUE: Duration = Duration::from_secs(5 * 60);
/// Requeue while a release waits for its dependencies.
pub const DEPENDENCY_REQUEUE: Duration = Duration::from_secs(60);
