//! In-memory source and cluster collaborators
//!
//! `MemoryCluster` mimics the parts of API server behavior the sync logic
//! depends on: defaulted fields, server metadata, rollout status for
//! workloads, and injectable per-object failures.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

use super::cluster::ClusterClient;
use super::source::{normalize_source_path, SourceRepository};
use crate::error::{Error, Result};
use crate::model::{object_identity, LiveResource, ResourceKey, SourceRef};

// ============================================================================
// Source
// ============================================================================

#[derive(Default)]
struct RepoState {
    refs: HashMap<String, String>,
    commits: HashMap<String, BTreeMap<String, Vec<u8>>>,
}

/// Versioned file tree per repository URL
#[derive(Default)]
pub struct MemorySource {
    repos: Mutex<HashMap<String, RepoState>>,
    unavailable: AtomicBool,
    counter: AtomicU64,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit a full file tree to `branch`, returning the new commit id.
    /// Commits to `main` also move `HEAD`.
    pub async fn commit(&self, repo_url: &str, branch: &str, files: &[(&str, &str)]) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let commit = format!("{:040x}", n);
        let tree = files
            .iter()
            .map(|(path, content)| (path.to_string(), content.as_bytes().to_vec()))
            .collect();

        let mut repos = self.repos.lock().await;
        let repo = repos.entry(repo_url.to_string()).or_default();
        repo.commits.insert(commit.clone(), tree);
        repo.refs.insert(branch.to_string(), commit.clone());
        if branch == "main" || !repo.refs.contains_key("HEAD") {
            repo.refs.insert("HEAD".to_string(), commit.clone());
        }
        commit
    }

    /// Simulate an unreachable remote
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self, repo_url: &str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::source_unavailable(format!(
                "{} is unreachable",
                repo_url
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SourceRepository for MemorySource {
    async fn resolve(&self, source: &SourceRef) -> Result<String> {
        self.check_available(&source.repo_url)?;
        let repos = self.repos.lock().await;
        let repo = repos.get(&source.repo_url).ok_or_else(|| {
            Error::source_unavailable(format!("repository {} not found", source.repo_url))
        })?;
        if let Some(commit) = repo.refs.get(&source.target_revision) {
            return Ok(commit.clone());
        }
        if repo.commits.contains_key(&source.target_revision) {
            return Ok(source.target_revision.clone());
        }
        Err(Error::source_unavailable(format!(
            "revision '{}' not found in {}",
            source.target_revision, source.repo_url
        )))
    }

    async fn list_files(&self, source: &SourceRef, revision: &str) -> Result<Vec<String>> {
        self.check_available(&source.repo_url)?;
        let root = normalize_source_path(&source.path);
        let repos = self.repos.lock().await;
        let tree = repos
            .get(&source.repo_url)
            .and_then(|r| r.commits.get(revision))
            .ok_or_else(|| Error::source_unavailable(format!("commit {} not found", revision)))?;
        Ok(tree
            .keys()
            .filter(|p| root.is_empty() || p.starts_with(&format!("{}/", root)))
            .cloned()
            .collect())
    }

    async fn get(&self, source: &SourceRef, revision: &str, path: &str) -> Result<Vec<u8>> {
        self.check_available(&source.repo_url)?;
        let repos = self.repos.lock().await;
        repos
            .get(&source.repo_url)
            .and_then(|r| r.commits.get(revision))
            .and_then(|t| t.get(path))
            .cloned()
            .ok_or_else(|| {
                Error::source_unavailable(format!("{} not found at {}", path, revision))
            })
    }
}

// ============================================================================
// Cluster
// ============================================================================

/// Failure returned for writes to one object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InjectedFailure {
    Forbidden,
    Invalid,
    Conflict,
}

/// Write issued against the cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterCall {
    Apply(ResourceKey),
    Delete(ResourceKey),
}

#[derive(Default)]
struct ClusterState {
    objects: BTreeMap<ResourceKey, Value>,
    /// Failure and remaining count (`None` = every time)
    failures: HashMap<ResourceKey, (InjectedFailure, Option<u32>)>,
    calls: Vec<ClusterCall>,
    unreachable: bool,
    apply_delay: Duration,
    revision: u64,
    /// Kind to namespaced flag, for kinds registered with `serve_kind`
    scopes: HashMap<String, bool>,
}

impl ClusterState {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn take_failure(&mut self, key: &ResourceKey) -> Option<Error> {
        let (failure, remaining) = *self.failures.get(key)?;
        match remaining {
            Some(0) => {
                self.failures.remove(key);
                return None;
            }
            Some(n) => {
                self.failures.insert(key.clone(), (failure, Some(n - 1)));
            }
            None => {}
        }
        let target = key.to_string();
        Some(match failure {
            InjectedFailure::Forbidden => Error::ApplyForbidden(target),
            InjectedFailure::Invalid => Error::ApplyInvalid(target),
            InjectedFailure::Conflict => Error::ApplyConflict(target),
        })
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable {
            return Err(Error::cluster_unreachable("connection refused"));
        }
        Ok(())
    }
}

/// In-memory [`ClusterClient`]
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<ClusterState>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object as-is, as if created by another client
    pub async fn insert(&self, object: Value) -> Option<ResourceKey> {
        let (_, key) = object_identity(&object)?;
        let mut state = self.state.lock().await;
        let mut object = object;
        let revision = state.next_revision();
        stamp_metadata(&mut object, None, &revision);
        state.objects.insert(key.clone(), object);
        Some(key)
    }

    pub async fn object(&self, key: &ResourceKey) -> Option<Value> {
        self.state.lock().await.objects.get(key).cloned()
    }

    pub async fn keys(&self) -> Vec<ResourceKey> {
        self.state.lock().await.objects.keys().cloned().collect()
    }

    /// Mutate a stored object out of band; returns false when absent
    pub async fn modify(&self, key: &ResourceKey, f: impl FnOnce(&mut Value)) -> bool {
        let mut state = self.state.lock().await;
        let revision = state.next_revision();
        match state.objects.get_mut(key) {
            Some(object) => {
                f(object);
                if let Some(meta) = object.get_mut("metadata").and_then(Value::as_object_mut) {
                    meta.insert("resourceVersion".to_string(), Value::String(revision));
                }
                true
            }
            None => false,
        }
    }

    /// Delete out of band
    pub async fn remove(&self, key: &ResourceKey) -> bool {
        self.state.lock().await.objects.remove(key).is_some()
    }

    /// Fail writes to `key`, `times` times or forever
    pub async fn fail(&self, key: ResourceKey, failure: InjectedFailure, times: Option<u32>) {
        self.state
            .lock()
            .await
            .failures
            .insert(key, (failure, times));
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.failures.clear();
    }

    pub async fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().await.unreachable = unreachable;
    }

    /// Serve `kind` with the given scope; unregistered kinds report no scope
    pub async fn serve_kind(&self, kind: &str, namespaced: bool) {
        self.state
            .lock()
            .await
            .scopes
            .insert(kind.to_string(), namespaced);
    }

    /// Delay every apply, to exercise timeouts and cancellation
    pub async fn set_apply_delay(&self, delay: Duration) {
        self.state.lock().await.apply_delay = delay;
    }

    /// Writes issued so far
    pub async fn calls(&self) -> Vec<ClusterCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn list(
        &self,
        _api_version: &str,
        kind: &str,
        label_selector: &str,
    ) -> Result<Vec<LiveResource>> {
        let state = self.state.lock().await;
        state.check_reachable()?;
        let wanted = parse_selector(label_selector);
        Ok(state
            .objects
            .iter()
            .filter(|(key, object)| key.kind == kind && labels_match(object, &wanted))
            .filter_map(|(_, object)| LiveResource::from_object(object.clone()))
            .collect())
    }

    async fn get(&self, _api_version: &str, key: &ResourceKey) -> Result<Option<LiveResource>> {
        let state = self.state.lock().await;
        state.check_reachable()?;
        Ok(state
            .objects
            .get(key)
            .and_then(|o| LiveResource::from_object(o.clone())))
    }

    async fn apply(&self, _api_version: &str, object: &Value) -> Result<LiveResource> {
        let (_, mut key) = object_identity(object)
            .ok_or_else(|| Error::manifest("<apply>", "object has no apiVersion, kind or name"))?;

        let delay = {
            let mut state = self.state.lock().await;
            state.check_reachable()?;
            state.calls.push(ClusterCall::Apply(key.clone()));
            if let Some(err) = state.take_failure(&key) {
                return Err(err);
            }
            state.apply_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        let mut stored = object.clone();
        if state.scopes.get(&key.kind) == Some(&false) {
            // The API server drops the namespace of cluster-scoped objects
            if let Some(meta) = stored.get_mut("metadata").and_then(Value::as_object_mut) {
                meta.remove("namespace");
            }
            key.namespace = None;
        }
        let existing = state.objects.get(&key).cloned();
        apply_server_defaults(&key.kind, &mut stored, state.revision);

        let generation = match &existing {
            Some(prev) => {
                let prev_gen = prev
                    .pointer("/metadata/generation")
                    .and_then(Value::as_i64)
                    .unwrap_or(1);
                if prev.get("spec") == stored.get("spec") {
                    prev_gen
                } else {
                    prev_gen + 1
                }
            }
            None => 1,
        };
        let revision = state.next_revision();
        stamp_metadata(&mut stored, existing.as_ref(), &revision);
        if let Some(meta) = stored.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert("generation".to_string(), json!(generation));
        }
        synthesize_status(&key.kind, &mut stored);

        state.objects.insert(key.clone(), stored.clone());
        LiveResource::from_object(stored).ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn delete(&self, _api_version: &str, key: &ResourceKey) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_reachable()?;
        state.calls.push(ClusterCall::Delete(key.clone()));
        if let Some(err) = state.take_failure(key) {
            return Err(err);
        }
        state.objects.remove(key);
        Ok(())
    }

    async fn is_namespaced(&self, _api_version: &str, kind: &str) -> Result<Option<bool>> {
        let state = self.state.lock().await;
        state.check_reachable()?;
        Ok(state.scopes.get(kind).copied())
    }
}

fn parse_selector(selector: &str) -> Vec<(String, String)> {
    selector
        .split(',')
        .filter_map(|part| part.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn labels_match(object: &Value, wanted: &[(String, String)]) -> bool {
    wanted.iter().all(|(k, v)| {
        object
            .pointer("/metadata/labels")
            .and_then(|l| l.get(k))
            .and_then(Value::as_str)
            == Some(v.as_str())
    })
}

/// Server metadata: uid and creation time survive updates
fn stamp_metadata(object: &mut Value, existing: Option<&Value>, revision: &str) {
    let Some(obj) = object.as_object_mut() else {
        return;
    };
    let meta = obj
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(meta) = meta.as_object_mut() else {
        return;
    };
    let previous = |field: &str| {
        existing
            .and_then(|e| e.pointer(&format!("/metadata/{}", field)))
            .cloned()
    };
    let uid = previous("uid").unwrap_or_else(|| json!(format!("uid-{}", revision)));
    let created =
        previous("creationTimestamp").unwrap_or_else(|| json!(Utc::now().to_rfc3339()));
    meta.insert("uid".to_string(), uid);
    meta.insert("creationTimestamp".to_string(), created);
    meta.insert("resourceVersion".to_string(), json!(revision));
    meta.entry("generation").or_insert(json!(1));
}

fn set_default(object: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = object;
    for segment in parents {
        let Some(map) = current.as_object_mut() else {
            return;
        };
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if let Some(map) = current.as_object_mut() {
        map.entry(last.to_string()).or_insert(value);
    }
}

fn each_item(object: &mut Value, path: &[&str], mut f: impl FnMut(&mut Value)) {
    let mut current = Some(object);
    for segment in path {
        current = current.and_then(|v| v.get_mut(*segment));
    }
    if let Some(Value::Array(items)) = current {
        for item in items {
            f(item);
        }
    }
}

fn pod_spec_defaults(pod_spec: &mut Value) {
    set_default(pod_spec, &["restartPolicy"], json!("Always"));
    set_default(pod_spec, &["dnsPolicy"], json!("ClusterFirst"));
    set_default(pod_spec, &["schedulerName"], json!("default-scheduler"));
    set_default(pod_spec, &["securityContext"], json!({}));
    set_default(pod_spec, &["terminationGracePeriodSeconds"], json!(30));
    for list in ["containers", "initContainers"] {
        each_item(pod_spec, &[list], |container| {
            set_default(container, &["imagePullPolicy"], json!("IfNotPresent"));
            set_default(
                container,
                &["terminationMessagePath"],
                json!("/dev/termination-log"),
            );
            set_default(container, &["terminationMessagePolicy"], json!("File"));
            set_default(container, &["resources"], json!({}));
            each_item(container, &["ports"], |port| {
                set_default(port, &["protocol"], json!("TCP"));
            });
        });
    }
}

/// Fields the API server fills in on write
fn apply_server_defaults(kind: &str, object: &mut Value, seed: u64) {
    match kind {
        "Deployment" => {
            set_default(object, &["spec", "replicas"], json!(1));
            set_default(object, &["spec", "revisionHistoryLimit"], json!(10));
            set_default(object, &["spec", "progressDeadlineSeconds"], json!(600));
            set_default(
                object,
                &["spec", "strategy"],
                json!({"type": "RollingUpdate", "rollingUpdate": {"maxSurge": "25%", "maxUnavailable": "25%"}}),
            );
            if let Some(pod_spec) = object.pointer_mut("/spec/template/spec") {
                pod_spec_defaults(pod_spec);
            }
        }
        "StatefulSet" => {
            set_default(object, &["spec", "replicas"], json!(1));
            set_default(object, &["spec", "revisionHistoryLimit"], json!(10));
            set_default(object, &["spec", "podManagementPolicy"], json!("OrderedReady"));
            set_default(
                object,
                &["spec", "updateStrategy"],
                json!({"type": "RollingUpdate", "rollingUpdate": {"partition": 0}}),
            );
            if let Some(pod_spec) = object.pointer_mut("/spec/template/spec") {
                pod_spec_defaults(pod_spec);
            }
        }
        "Pod" => {
            if let Some(pod_spec) = object.get_mut("spec") {
                pod_spec_defaults(pod_spec);
            }
        }
        "Service" => {
            let ip = format!("10.96.{}.{}", (seed / 250) % 250, seed % 250 + 1);
            set_default(object, &["spec", "type"], json!("ClusterIP"));
            set_default(object, &["spec", "clusterIP"], json!(ip));
            set_default(object, &["spec", "clusterIPs"], json!([ip]));
            set_default(object, &["spec", "sessionAffinity"], json!("None"));
            set_default(object, &["spec", "ipFamilies"], json!(["IPv4"]));
            set_default(object, &["spec", "ipFamilyPolicy"], json!("SingleStack"));
            set_default(object, &["spec", "internalTrafficPolicy"], json!("Cluster"));
            each_item(object, &["spec", "ports"], |port| {
                set_default(port, &["protocol"], json!("TCP"));
                if let Some(p) = port.get("port").cloned() {
                    set_default(port, &["targetPort"], p);
                }
            });
        }
        "Namespace" => {
            set_default(object, &["spec", "finalizers"], json!(["kubernetes"]));
            let name = object.pointer("/metadata/name").cloned();
            if let Some(name) = name {
                set_default(
                    object,
                    &["metadata", "labels", "kubernetes.io/metadata.name"],
                    name,
                );
            }
        }
        "Secret" => {
            if let Some(Value::Object(string_data)) =
                object.as_object_mut().and_then(|o| o.remove("stringData"))
            {
                for (k, v) in string_data {
                    if let Some(s) = v.as_str() {
                        set_default(object, &["data", k.as_str()], json!(BASE64.encode(s.as_bytes())));
                    }
                }
            }
            set_default(object, &["type"], json!("Opaque"));
        }
        _ => {}
    }
}

/// Report finished rollouts so workloads evaluate as healthy
fn synthesize_status(kind: &str, object: &mut Value) {
    let generation = object
        .pointer("/metadata/generation")
        .and_then(Value::as_i64)
        .unwrap_or(1);
    let replicas = object
        .pointer("/spec/replicas")
        .and_then(Value::as_i64)
        .unwrap_or(1);
    let status = match kind {
        "Deployment" => json!({
            "observedGeneration": generation,
            "replicas": replicas,
            "updatedReplicas": replicas,
            "readyReplicas": replicas,
            "availableReplicas": replicas
        }),
        "StatefulSet" => json!({
            "observedGeneration": generation,
            "replicas": replicas,
            "updatedReplicas": replicas,
            "readyReplicas": replicas,
            "currentReplicas": replicas
        }),
        "Namespace" => json!({"phase": "Active"}),
        "PersistentVolumeClaim" => json!({"phase": "Bound"}),
        _ => return,
    };
    if let Some(obj) = object.as_object_mut() {
        obj.insert("status".to_string(), status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_source_resolves_branches_and_head() {
        let source = MemorySource::new();
        let first = source.commit("repo", "main", &[("a.yaml", "x: 1")]).await;
        let release = source.commit("repo", "release", &[("b.yaml", "x: 2")]).await;

        let mut src = SourceRef {
            repo_url: "repo".into(),
            path: ".".into(),
            target_revision: "HEAD".into(),
        };
        assert_eq!(source.resolve(&src).await.unwrap(), first);
        src.target_revision = "release".into();
        assert_eq!(source.resolve(&src).await.unwrap(), release);

        source.set_unavailable(true);
        assert!(source.resolve(&src).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_memory_cluster_defaults_and_generation() {
        let cluster = MemoryCluster::new();
        let deployment = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "app"},
            "spec": {"template": {"spec": {"containers": [{"name": "web", "image": "nginx"}]}}}
        });
        let live = cluster.apply("apps/v1", &deployment).await.unwrap();
        assert_eq!(live.object.pointer("/spec/replicas"), Some(&json!(1)));
        assert_eq!(live.object.pointer("/metadata/generation"), Some(&json!(1)));
        assert_eq!(
            live.object
                .pointer("/spec/template/spec/containers/0/imagePullPolicy"),
            Some(&json!("IfNotPresent"))
        );

        let again = cluster.apply("apps/v1", &deployment).await.unwrap();
        assert_eq!(again.object.pointer("/metadata/generation"), Some(&json!(1)));
        assert_eq!(
            again.object.pointer("/metadata/uid"),
            live.object.pointer("/metadata/uid")
        );
    }

    #[tokio::test]
    async fn test_injected_failures_are_counted() {
        let cluster = MemoryCluster::new();
        let key = ResourceKey::namespaced("ConfigMap", "app", "a");
        cluster
            .fail(key.clone(), InjectedFailure::Conflict, Some(1))
            .await;
        let cm = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a", "namespace": "app"}});
        assert!(cluster.apply("v1", &cm).await.unwrap_err().is_conflict());
        assert!(cluster.apply("v1", &cm).await.is_ok());
    }

    #[test]
    fn test_memory_cluster_remove_and_keys() {
        let cluster = MemoryCluster::new();
        let cm = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a", "namespace": "app"}});
        let key = tokio_test::block_on(cluster.insert(cm)).unwrap();
        assert_eq!(tokio_test::block_on(cluster.keys()), vec![key.clone()]);
        assert!(tokio_test::block_on(cluster.remove(&key)));
        assert!(!tokio_test::block_on(cluster.remove(&key)));
        assert!(tokio_test::block_on(cluster.object(&key)).is_none());
    }
}
