//! helmop core types: the two declared resource kinds, the condition model,
//! error classification with per-category backoff, and artifact naming.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod classify;
pub mod conditions;
pub mod duration;
pub mod error;
pub mod names;
pub mod types;

pub use classify::{classify, BackoffProfile, ClassifiedError, ErrorCategory};
pub use conditions::{Condition, ConditionStatus, ConditionType, Reason};
pub use duration::parse_duration;
pub use error::{EngineError, StoreError};
pub use types::*;

/// Namespaced identity of a declared resource; the unit of work for queues.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Key for a kube object; cluster-scoped objects get an empty namespace.
    pub fn of<K: kube::Resource>(obj: &K) -> Self {
        let meta = obj.meta();
        Self {
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// What a reconcile pass asks of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Run again after the given delay (zero means as soon as possible).
    Requeue(Duration),
    /// Wait for the next change notification; no timer.
    AwaitChange,
}

impl Action {
    pub fn requeue(after: Duration) -> Self { Action::Requeue(after) }
    pub fn await_change() -> Self { Action::AwaitChange }

    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Action::Requeue(d) => Some(*d),
            Action::AwaitChange => None,
        }
    }
}

pub mod prelude {
    pub use super::{
        Action, ClassifiedError, Condition, ConditionStatus, ConditionType, EngineError, ErrorCategory, HelmRelease,
        HelmRepository, ObjectKey, Reason, StoreError,
    };
}
