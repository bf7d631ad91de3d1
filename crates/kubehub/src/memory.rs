//! In-memory store, secrets, artifacts and events for tests and local runs.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use helmop_core::{ObjectKey, StoreError};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as Json;

use crate::{Artifact, ArtifactStore, EventKind, EventSink, ResourceStore, SecretSource, StoreResult};

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|p| p.into_inner()) }

fn json_err(e: serde_json::Error) -> StoreError { StoreError::Other(anyhow!(e)) }

struct StoreState {
    objects: BTreeMap<ObjectKey, Json>,
    next_rv: u64,
    pending_conflicts: u32,
    writes: u64,
    status_writes: u64,
}

/// Object store with API-server-like write semantics: resourceVersion checks,
/// generation bumps on spec change, status-only status writes, and removal of
/// deleted objects once their finalizers are gone.
pub struct MemoryStore<K> {
    state: Mutex<StoreState>,
    _kind: std::marker::PhantomData<fn() -> K>,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            state: Mutex::new(StoreState { objects: BTreeMap::new(), next_rv: 1, pending_conflicts: 0, writes: 0, status_writes: 0 }),
            _kind: std::marker::PhantomData,
        }
    }
}

fn rv_of(v: &Json) -> Option<&str> { v.pointer("/metadata/resourceVersion").and_then(|x| x.as_str()) }

fn set_meta(v: &mut Json, field: &str, value: Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.insert(field.to_string(), value);
    }
}

impl<K> MemoryStore<K>
where
    K: kube::Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new() -> Self { Self::default() }

    /// Create or overwrite an object, assigning resourceVersion and generation.
    pub fn insert(&self, obj: K) -> K {
        let key = ObjectKey::of(&obj);
        let mut s = locked(&self.state);
        let mut v = match serde_json::to_value(&obj) {
            Ok(v) => v,
            Err(_) => return obj,
        };
        let rv = s.next_rv;
        s.next_rv += 1;
        set_meta(&mut v, "resourceVersion", Json::String(rv.to_string()));
        if v.pointer("/metadata/generation").is_none() {
            set_meta(&mut v, "generation", Json::from(1));
        }
        let out = serde_json::from_value(v.clone()).unwrap_or(obj);
        s.objects.insert(key, v);
        out
    }

    pub fn snapshot(&self, key: &ObjectKey) -> Option<K> {
        locked(&self.state).objects.get(key).and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Mimic a delete request: objects with finalizers get a deletion timestamp,
    /// others disappear.
    pub fn delete(&self, key: &ObjectKey) {
        let mut s = locked(&self.state);
        let has_finalizers = s
            .objects
            .get(key)
            .and_then(|v| v.pointer("/metadata/finalizers"))
            .and_then(|f| f.as_array())
            .map(|f| !f.is_empty())
            .unwrap_or(false);
        if !has_finalizers {
            s.objects.remove(key);
            return;
        }
        let rv = s.next_rv;
        s.next_rv += 1;
        if let Some(v) = s.objects.get_mut(key) {
            let ts = serde_json::to_value(Time(Utc::now())).unwrap_or(Json::Null);
            set_meta(v, "deletionTimestamp", ts);
            set_meta(v, "resourceVersion", Json::String(rv.to_string()));
        }
    }

    /// Fail the next `n` writes with a conflict.
    pub fn inject_conflicts(&self, n: u32) { locked(&self.state).pending_conflicts = n; }

    pub fn writes(&self) -> u64 { locked(&self.state).writes }
    pub fn status_writes(&self) -> u64 { locked(&self.state).status_writes }

    fn write(&self, obj: &K, status_only: bool) -> StoreResult<K> {
        let key = ObjectKey::of(obj);
        let incoming = serde_json::to_value(obj).map_err(json_err)?;
        let mut s = locked(&self.state);
        if s.pending_conflicts > 0 {
            s.pending_conflicts -= 1;
            return Err(StoreError::Conflict(format!("{} was modified concurrently", key)));
        }
        let cur = s.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if let Some(rv) = rv_of(&incoming) {
            if Some(rv) != rv_of(&cur) {
                return Err(StoreError::Conflict(format!("{}: resourceVersion {} is stale", key, rv)));
            }
        }
        let mut next = if status_only {
            let mut next = cur.clone();
            if let Some(obj) = next.as_object_mut() {
                obj.insert("status".into(), incoming.get("status").cloned().unwrap_or(Json::Null));
            }
            next
        } else {
            let mut next = incoming.clone();
            if let Some(obj) = next.as_object_mut() {
                match cur.get("status") {
                    Some(st) => { obj.insert("status".into(), st.clone()); }
                    None => { obj.remove("status"); }
                }
            }
            let gen = cur.pointer("/metadata/generation").and_then(|g| g.as_i64()).unwrap_or(1);
            let bumped = if incoming.get("spec") != cur.get("spec") { gen + 1 } else { gen };
            set_meta(&mut next, "generation", Json::from(bumped));
            if let Some(ts) = cur.pointer("/metadata/deletionTimestamp").cloned() {
                set_meta(&mut next, "deletionTimestamp", ts);
            }
            next
        };
        let rv = s.next_rv;
        s.next_rv += 1;
        set_meta(&mut next, "resourceVersion", Json::String(rv.to_string()));
        if status_only { s.status_writes += 1; } else { s.writes += 1; }

        let deleting = next.pointer("/metadata/deletionTimestamp").map(|t| !t.is_null()).unwrap_or(false);
        let finalizers_left = next.pointer("/metadata/finalizers").and_then(|f| f.as_array()).map(|f| !f.is_empty()).unwrap_or(false);
        let out: K = serde_json::from_value(next.clone()).map_err(json_err)?;
        if deleting && !finalizers_left {
            s.objects.remove(&key);
        } else {
            s.objects.insert(key, next);
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl<K> ResourceStore<K> for MemoryStore<K>
where
    K: kube::Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> StoreResult<Option<K>> { Ok(self.snapshot(key)) }
    async fn update(&self, obj: &K) -> StoreResult<K> { self.write(obj, false) }
    async fn update_status(&self, obj: &K) -> StoreResult<K> { self.write(obj, true) }
}

#[derive(Default)]
pub struct MemorySecrets {
    secrets: Mutex<BTreeMap<(String, String), BTreeMap<String, Vec<u8>>>>,
}

impl MemorySecrets {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&self, namespace: &str, name: &str, data: &[(&str, &str)]) {
        let map = data.iter().map(|(k, v)| (k.to_string(), v.as_bytes().to_vec())).collect();
        locked(&self.secrets).insert((namespace.to_string(), name.to_string()), map);
    }
}

#[async_trait::async_trait]
impl SecretSource for MemorySecrets {
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<BTreeMap<String, Vec<u8>>>> {
        Ok(locked(&self.secrets).get(&(namespace.to_string(), name.to_string())).cloned())
    }
}

#[derive(Default)]
pub struct MemoryArtifacts {
    items: Mutex<BTreeMap<(String, String), Artifact>>,
}

impl MemoryArtifacts {
    pub fn new() -> Self { Self::default() }

    pub fn all(&self) -> Vec<Artifact> { locked(&self.items).values().cloned().collect() }

    /// Backdate an artifact, for retention tests.
    pub fn set_created(&self, namespace: &str, name: &str, at: DateTime<Utc>) {
        if let Some(a) = locked(&self.items).get_mut(&(namespace.to_string(), name.to_string())) {
            a.created = Some(at);
        }
    }

    pub fn set_annotation(&self, namespace: &str, name: &str, key: &str, value: &str) {
        if let Some(a) = locked(&self.items).get_mut(&(namespace.to_string(), name.to_string())) {
            a.annotations.insert(key.to_string(), value.to_string());
        }
    }
}

#[async_trait::async_trait]
impl ArtifactStore for MemoryArtifacts {
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<Artifact>> {
        Ok(locked(&self.items).get(&(namespace.to_string(), name.to_string())).cloned())
    }

    async fn create(&self, artifact: &Artifact) -> StoreResult<()> {
        let mut items = locked(&self.items);
        let key = (artifact.namespace.clone(), artifact.name.clone());
        if items.contains_key(&key) {
            return Err(StoreError::Conflict(format!("configmap {:?} already exists", artifact.name)));
        }
        let mut a = artifact.clone();
        a.created = Some(Utc::now());
        items.insert(key, a);
        Ok(())
    }

    async fn replace(&self, artifact: &Artifact) -> StoreResult<()> {
        let mut items = locked(&self.items);
        let key = (artifact.namespace.clone(), artifact.name.clone());
        let created = items.get(&key).and_then(|a| a.created).ok_or_else(|| StoreError::NotFound(artifact.name.clone()))?;
        let mut a = artifact.clone();
        a.created = Some(created);
        items.insert(key, a);
        Ok(())
    }

    async fn list(&self, namespace: &str, selector: &BTreeMap<String, String>) -> StoreResult<Vec<Artifact>> {
        Ok(locked(&self.items)
            .values()
            .filter(|a| a.namespace == namespace && selector.iter().all(|(k, v)| a.labels.get(k) == Some(v)))
            .cloned()
            .collect())
    }

    async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()> {
        locked(&self.items).remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub object: String,
    pub kind: EventKind,
    pub reason: String,
    pub message: String,
}

#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    pub fn new() -> Self { Self::default() }
    pub fn events(&self) -> Vec<RecordedEvent> { locked(&self.events).clone() }
    pub fn reasons(&self) -> Vec<String> { locked(&self.events).iter().map(|e| e.reason.clone()).collect() }
}

#[async_trait::async_trait]
impl EventSink for RecordingEvents {
    async fn publish(&self, target: &ObjectReference, kind: EventKind, reason: &str, message: &str) {
        let object = format!("{}/{}", target.namespace.clone().unwrap_or_default(), target.name.clone().unwrap_or_default());
        locked(&self.events).push(RecordedEvent { object, kind, reason: reason.to_string(), message: message.to_string() });
    }
}
