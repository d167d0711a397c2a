//! Cluster state client
//!
//! [`ClusterClient`] is the seam between the sync logic and the Kubernetes API.
//! [`KubeCluster`] implements it with dynamic objects and server-side apply,
//! resolving API resources through discovery.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::{self, ApiResource, Scope},
    Api, Client,
};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{object_identity, LiveResource, ManagedApp, ResourceKey, TRACKING_LABEL};

/// Kinds listed for every application so orphans are found after a restart
pub const DEFAULT_TRACKED_KINDS: &[(&str, &str)] = &[
    ("v1", "Namespace"),
    ("v1", "ServiceAccount"),
    ("v1", "ConfigMap"),
    ("v1", "Secret"),
    ("v1", "PersistentVolumeClaim"),
    ("v1", "Service"),
    ("apps/v1", "Deployment"),
    ("apps/v1", "StatefulSet"),
    ("apps/v1", "DaemonSet"),
    ("batch/v1", "Job"),
    ("batch/v1", "CronJob"),
    ("networking.k8s.io/v1", "Ingress"),
    ("rbac.authorization.k8s.io/v1", "Role"),
    ("rbac.authorization.k8s.io/v1", "RoleBinding"),
];

/// Read and write access to cluster objects
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Objects of one kind across all namespaces matching `label_selector`
    async fn list(&self, api_version: &str, kind: &str, label_selector: &str)
        -> Result<Vec<LiveResource>>;

    /// One object, `None` when absent
    async fn get(&self, api_version: &str, key: &ResourceKey) -> Result<Option<LiveResource>>;

    /// Create or update an object with server-side apply
    async fn apply(&self, api_version: &str, object: &Value) -> Result<LiveResource>;

    /// Delete an object; deleting an absent object succeeds
    async fn delete(&self, api_version: &str, key: &ResourceKey) -> Result<()>;

    /// Whether a kind is namespaced, `None` when the API server does not serve it
    async fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<Option<bool>>;
}

/// Every live object carrying the app's tracking label, for the given kinds.
///
/// Kinds the API server does not serve are skipped.
pub async fn fetch_live(
    cluster: &dyn ClusterClient,
    app: &ManagedApp,
    kinds: &BTreeSet<(String, String)>,
) -> Result<Vec<LiveResource>> {
    let selector = app.tracking_selector();
    let tracking = app.tracking_value();
    let mut live = Vec::new();
    for (api_version, kind) in kinds {
        match cluster.list(api_version, kind, &selector).await {
            Ok(objects) => live.extend(
                objects
                    .into_iter()
                    .filter(|o| o.label(TRACKING_LABEL) == Some(tracking.as_str())),
            ),
            Err(Error::NotFound(_)) => {
                debug!(api_version = %api_version, kind = %kind, "Kind not served, skipping");
            }
            Err(e) => return Err(e),
        }
    }
    live.sort_by(|a, b| a.key.cmp(&b.key));
    live.dedup_by(|a, b| a.key == b.key);
    Ok(live)
}

/// Split `group/version` (or core `version`)
pub fn parse_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// [`ClusterClient`] backed by the Kubernetes API
pub struct KubeCluster {
    client: Client,
    field_manager: String,
    force_conflicts: bool,
    resources: RwLock<HashMap<(String, String), (ApiResource, bool)>>,
}

impl KubeCluster {
    pub fn new(client: Client, field_manager: impl Into<String>, force_conflicts: bool) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
            force_conflicts,
            resources: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve and cache the API resource of a kind
    async fn resource(&self, api_version: &str, kind: &str) -> Result<(ApiResource, bool)> {
        let cache_key = (api_version.to_string(), kind.to_string());
        if let Some(found) = self.resources.read().await.get(&cache_key) {
            return Ok(found.clone());
        }

        let (group, version) = parse_api_version(api_version);
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let (ar, caps) = discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| match e {
                kube::Error::Discovery(d) => {
                    Error::NotFound(format!("{}/{}: {}", api_version, kind, d))
                }
                other => Error::from_kube(other, &format!("{}/{}", api_version, kind)),
            })?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);

        self.resources
            .write()
            .await
            .insert(cache_key, (ar.clone(), namespaced));
        Ok((ar, namespaced))
    }

    async fn api_for(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.resource(api_version, kind).await?;
        Ok(match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }
}

/// Convert a dynamic object, filling in the type meta list responses omit
fn to_live(obj: DynamicObject, api_version: &str, kind: &str) -> Result<Option<LiveResource>> {
    let mut value = serde_json::to_value(&obj)?;
    if let Some(map) = value.as_object_mut() {
        map.entry("apiVersion")
            .or_insert_with(|| Value::String(api_version.to_string()));
        map.entry("kind")
            .or_insert_with(|| Value::String(kind.to_string()));
    }
    Ok(LiveResource::from_object(value))
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        label_selector: &str,
    ) -> Result<Vec<LiveResource>> {
        let api = self.api_for(api_version, kind, None).await?;
        let params = ListParams::default().labels(label_selector);
        let list = api
            .list(&params)
            .await
            .map_err(|e| Error::from_kube(e, &format!("list {}", kind)))?;

        let mut live = Vec::with_capacity(list.items.len());
        for obj in list.items {
            if let Some(resource) = to_live(obj, api_version, kind)? {
                live.push(resource);
            }
        }
        Ok(live)
    }

    async fn get(&self, api_version: &str, key: &ResourceKey) -> Result<Option<LiveResource>> {
        let api = self
            .api_for(api_version, &key.kind, key.namespace.as_deref())
            .await?;
        match api.get_opt(&key.name).await {
            Ok(Some(obj)) => to_live(obj, api_version, &key.kind),
            Ok(None) => Ok(None),
            Err(e) => Err(Error::from_kube(e, &key.to_string())),
        }
    }

    async fn apply(&self, api_version: &str, object: &Value) -> Result<LiveResource> {
        let (_, key) = object_identity(object)
            .ok_or_else(|| Error::manifest("<apply>", "object has no apiVersion, kind or name"))?;
        let api = self
            .api_for(api_version, &key.kind, key.namespace.as_deref())
            .await?;

        let mut params = PatchParams::apply(&self.field_manager);
        if self.force_conflicts {
            params = params.force();
        }
        let applied = api
            .patch(&key.name, &params, &Patch::Apply(object))
            .await
            .map_err(|e| Error::from_kube(e, &key.to_string()))?;

        debug!(key = %key, "Applied object");
        to_live(applied, api_version, &key.kind)?
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn delete(&self, api_version: &str, key: &ResourceKey) -> Result<()> {
        let api = self
            .api_for(api_version, &key.kind, key.namespace.as_deref())
            .await?;
        match api.delete(&key.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) => match Error::from_kube(e, &key.to_string()) {
                Error::NotFound(_) => {
                    warn!(key = %key, "Object already gone");
                    Ok(())
                }
                other => Err(other),
            },
        }
    }

    async fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<Option<bool>> {
        match self.resource(api_version, kind).await {
            Ok((_, namespaced)) => Ok(Some(namespaced)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_api_version() {
        assert_eq!(parse_api_version("v1"), ("", "v1"));
        assert_eq!(parse_api_version("apps/v1"), ("apps", "v1"));
        assert_eq!(
            parse_api_version("networking.k8s.io/v1"),
            ("networking.k8s.io", "v1")
        );
    }
}
