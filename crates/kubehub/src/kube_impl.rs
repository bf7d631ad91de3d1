use std::collections::BTreeMap;
use std::fmt::Debug;
use std::marker::PhantomData;

use anyhow::anyhow;
use helmop_core::{ObjectKey, StoreError};
use k8s_openapi::api::core::v1::{ConfigMap, ObjectReference, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::{label_selector, Artifact, ArtifactStore, EventKind, EventSink, ResourceStore, SecretSource, StoreResult};

fn map_err(e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(ae.message),
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(ae.message),
        other => StoreError::Other(anyhow!(other)),
    }
}

/// Typed store for a namespaced kind, backed by the API server.
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    pub fn new(client: Client) -> Self { Self { client, _kind: PhantomData } }
}

impl<K> KubeStore<K>
where
    K: kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
{
    fn api(&self, namespace: &str) -> Api<K> { Api::namespaced(self.client.clone(), namespace) }

    fn target(obj: &K) -> StoreResult<(String, String)> {
        let meta = obj.meta();
        let name = meta.name.clone().ok_or_else(|| StoreError::Other(anyhow!("object missing metadata.name")))?;
        let ns = meta.namespace.clone().ok_or_else(|| StoreError::Other(anyhow!("object missing metadata.namespace")))?;
        Ok((ns, name))
    }
}

#[async_trait::async_trait]
impl<K> ResourceStore<K> for KubeStore<K>
where
    K: kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, key: &ObjectKey) -> StoreResult<Option<K>> {
        self.api(&key.namespace).get_opt(&key.name).await.map_err(map_err)
    }

    async fn update(&self, obj: &K) -> StoreResult<K> {
        let (ns, name) = Self::target(obj)?;
        self.api(&ns).replace(&name, &PostParams::default(), obj).await.map_err(map_err)
    }

    async fn update_status(&self, obj: &K) -> StoreResult<K> {
        let (ns, name) = Self::target(obj)?;
        let body = serde_json::to_vec(obj).map_err(|e| StoreError::Other(anyhow!(e)))?;
        self.api(&ns).replace_status(&name, &PostParams::default(), body).await.map_err(map_err)
    }
}

pub struct KubeSecrets {
    client: Client,
}

impl KubeSecrets {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl SecretSource for KubeSecrets {
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<BTreeMap<String, Vec<u8>>>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get_opt(name).await.map_err(map_err)?;
        Ok(secret.map(|s| s.data.unwrap_or_default().into_iter().map(|(k, v)| (k, v.0)).collect()))
    }
}

/// Artifacts stored as ConfigMaps.
pub struct ConfigMapArtifacts {
    client: Client,
}

impl ConfigMapArtifacts {
    pub fn new(client: Client) -> Self { Self { client } }

    fn api(&self, namespace: &str) -> Api<ConfigMap> { Api::namespaced(self.client.clone(), namespace) }
}

fn to_config_map(a: &Artifact) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(a.name.clone()),
            namespace: Some(a.namespace.clone()),
            labels: Some(a.labels.clone()),
            annotations: Some(a.annotations.clone()).filter(|m| !m.is_empty()),
            owner_references: a.owner.clone().map(|o| vec![o]),
            ..Default::default()
        },
        data: Some(a.data.clone()),
        ..Default::default()
    }
}

fn from_config_map(cm: ConfigMap) -> Artifact {
    Artifact {
        namespace: cm.metadata.namespace.unwrap_or_default(),
        name: cm.metadata.name.unwrap_or_default(),
        labels: cm.metadata.labels.unwrap_or_default(),
        annotations: cm.metadata.annotations.unwrap_or_default(),
        data: cm.data.unwrap_or_default(),
        owner: cm.metadata.owner_references.and_then(|o| o.into_iter().find(|r| r.controller == Some(true))),
        created: cm.metadata.creation_timestamp.map(|t| t.0),
    }
}

#[async_trait::async_trait]
impl ArtifactStore for ConfigMapArtifacts {
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<Artifact>> {
        Ok(self.api(namespace).get_opt(name).await.map_err(map_err)?.map(from_config_map))
    }

    async fn create(&self, artifact: &Artifact) -> StoreResult<()> {
        self.api(&artifact.namespace).create(&PostParams::default(), &to_config_map(artifact)).await.map_err(map_err)?;
        Ok(())
    }

    async fn replace(&self, artifact: &Artifact) -> StoreResult<()> {
        let api = self.api(&artifact.namespace);
        let mut cm = to_config_map(artifact);
        // replace needs the live resourceVersion
        if let Some(live) = api.get_opt(&artifact.name).await.map_err(map_err)? {
            cm.metadata.resource_version = live.metadata.resource_version;
        }
        api.replace(&artifact.name, &PostParams::default(), &cm).await.map_err(map_err)?;
        Ok(())
    }

    async fn list(&self, namespace: &str, selector: &BTreeMap<String, String>) -> StoreResult<Vec<Artifact>> {
        let lp = ListParams::default().labels(&label_selector(selector));
        let list = self.api(namespace).list(&lp).await.map_err(map_err)?;
        Ok(list.items.into_iter().map(from_config_map).collect())
    }

    async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()> {
        match self.api(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(map_err(e)),
        }
    }
}

/// Events published through the kube events API.
pub struct KubeEvents {
    client: Client,
    reporter: Reporter,
}

impl KubeEvents {
    pub fn new(client: Client, controller: &str) -> Self {
        let instance = std::env::var("HOSTNAME").ok();
        Self { client, reporter: Reporter { controller: controller.to_string(), instance } }
    }
}

#[async_trait::async_trait]
impl EventSink for KubeEvents {
    async fn publish(&self, target: &ObjectReference, kind: EventKind, reason: &str, message: &str) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), target.clone());
        let type_ = match kind {
            EventKind::Normal => EventType::Normal,
            EventKind::Warning => EventType::Warning,
        };
        let ev = Event { type_, reason: reason.to_string(), note: Some(message.to_string()), action: "Reconcile".to_string(), secondary: None };
        match recorder.publish(ev).await {
            Ok(()) => debug!(object = ?target.name, reason, "event published"),
            Err(e) => warn!(object = ?target.name, reason, error = %e, "event publish failed"),
        }
    }
}
