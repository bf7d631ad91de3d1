//! helmop kubehub: the declarative-store boundary.
//!
//! Reconcilers see the cluster only through the traits here: typed object reads
//! and writes with optimistic concurrency, secret reads, derived-artifact storage,
//! and event publication. Each has a kube-backed and an in-memory implementation.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt::Debug;

use chrono::{DateTime, Utc};
use helmop_core::{ObjectKey, StoreError};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{de::DeserializeOwned, Serialize};

mod kube_impl;
mod memory;
mod watch;

pub use kube_impl::{ConfigMapArtifacts, KubeEvents, KubeSecrets, KubeStore};
pub use memory::{MemoryArtifacts, MemorySecrets, MemoryStore, RecordedEvent, RecordingEvents};
pub use watch::{watch_into, ChangeFilter};

pub type StoreResult<T> = Result<T, StoreError>;

/// Typed object access for one resource kind.
#[async_trait::async_trait]
pub trait ResourceStore<K>: Send + Sync
where
    K: kube::Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> StoreResult<Option<K>>;
    /// Replace metadata and spec. Fails with `Conflict` on a stale resourceVersion.
    async fn update(&self, obj: &K) -> StoreResult<K>;
    /// Replace the status subresource. Fails with `Conflict` on a stale resourceVersion.
    async fn update_status(&self, obj: &K) -> StoreResult<K>;
}

/// Read access to secret data.
#[async_trait::async_trait]
pub trait SecretSource: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<BTreeMap<String, Vec<u8>>>>;
}

/// A derived, regenerable object (a ConfigMap holding chart default values).
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub namespace: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub data: BTreeMap<String, String>,
    pub owner: Option<OwnerReference>,
    /// Set by the store on creation.
    pub created: Option<DateTime<Utc>>,
}

#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<Artifact>>;
    /// Fails with `Conflict` when an artifact of that name already exists.
    async fn create(&self, artifact: &Artifact) -> StoreResult<()>;
    async fn replace(&self, artifact: &Artifact) -> StoreResult<()>;
    /// Artifacts in `namespace` carrying every label in `selector`.
    async fn list(&self, namespace: &str, selector: &BTreeMap<String, String>) -> StoreResult<Vec<Artifact>>;
    /// Deleting a missing artifact succeeds.
    async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// Best-effort notifications attached to a resource.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, target: &ObjectReference, kind: EventKind, reason: &str, message: &str);
}

fn label_selector(selector: &BTreeMap<String, String>) -> String {
    selector.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_is_comma_joined_in_key_order() {
        let mut sel = BTreeMap::new();
        sel.insert("b".to_string(), "2".to_string());
        sel.insert("a".to_string(), "1".to_string());
        assert_eq!(label_selector(&sel), "a=1,b=2");
    }
}
