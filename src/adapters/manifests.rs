//! Manifest store: reads desired resources from the source at a resolved commit

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::cluster::ClusterClient;
use super::source::{normalize_source_path, SourceRepository};
use crate::diff::CapabilityTable;
use crate::error::Result;
use crate::model::{object_identity, DesiredResource, ManagedApp, ResourceKey, TRACKING_LABEL};

/// Default upper bound for a single manifest file
pub const DEFAULT_MAX_MANIFEST_BYTES: usize = 1024 * 1024;

const MANIFEST_EXTENSIONS: &[&str] = &[".yaml", ".yml", ".json"];

/// A manifest document that could not be turned into a resource
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestError {
    pub path: String,
    /// Zero-based document index inside the file, when the error is per document
    pub document: Option<usize>,
    pub message: String,
}

impl ManifestError {
    fn file(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            document: None,
            message: message.into(),
        }
    }

    fn document(path: &str, index: usize, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            document: Some(index),
            message: message.into(),
        }
    }
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.document {
            Some(idx) => write!(f, "{}#{}: {}", self.path, idx, self.message),
            None => write!(f, "{}: {}", self.path, self.message),
        }
    }
}

/// Desired state of one application at one commit
#[derive(Clone, Debug, Default)]
pub struct ManifestSet {
    pub revision: String,
    pub resources: Vec<DesiredResource>,
    pub errors: Vec<ManifestError>,
}

impl ManifestSet {
    /// Distinct `(apiVersion, kind)` pairs declared
    pub fn kinds(&self) -> Vec<(String, String)> {
        let mut kinds: Vec<(String, String)> = self
            .resources
            .iter()
            .map(|r| (r.api_version.clone(), r.key.kind.clone()))
            .collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }
}

/// Reads and validates desired manifests
pub struct ManifestStore {
    source: Arc<dyn SourceRepository>,
    /// Answers which kinds are namespaced
    cluster: Arc<dyn ClusterClient>,
    capabilities: Arc<CapabilityTable>,
    max_bytes: usize,
}

impl ManifestStore {
    pub fn new(
        source: Arc<dyn SourceRepository>,
        cluster: Arc<dyn ClusterClient>,
        capabilities: Arc<CapabilityTable>,
        max_bytes: usize,
    ) -> Self {
        Self {
            source,
            cluster,
            capabilities,
            max_bytes,
        }
    }

    /// Resolve the app's revision and read every manifest under its path.
    ///
    /// Source failures abort with `SourceUnavailable`; malformed files or
    /// documents are reported in [`ManifestSet::errors`] while their valid
    /// siblings are still returned.
    pub async fn fetch_desired(&self, app: &ManagedApp) -> Result<ManifestSet> {
        let revision = self.source.resolve(&app.source).await?;
        let files = self.source.list_files(&app.source, &revision).await?;
        let root = normalize_source_path(&app.source.path);

        let mut set = ManifestSet {
            revision: revision.clone(),
            ..Default::default()
        };
        let mut seen: BTreeMap<ResourceKey, String> = BTreeMap::new();
        let mut scopes: HashMap<(String, String), bool> = HashMap::new();

        for path in files.iter().filter(|p| is_manifest_file(p, &root)) {
            let bytes = self.source.get(&app.source, &revision, path).await?;
            if bytes.len() > self.max_bytes {
                set.errors.push(ManifestError::file(
                    path,
                    format!(
                        "file is {} bytes, larger than the {} byte limit",
                        bytes.len(),
                        self.max_bytes
                    ),
                ));
                continue;
            }
            let content = match String::from_utf8(bytes) {
                Ok(c) => c,
                Err(_) => {
                    set.errors
                        .push(ManifestError::file(path, "file is not valid UTF-8"));
                    continue;
                }
            };

            let (objects, errors) = parse_manifests(path, &content);
            set.errors.extend(errors);

            for (index, object) in objects {
                let cluster_scoped = self.is_cluster_scoped(&mut scopes, &object).await?;
                let resource = self.prepare(app, path, object, cluster_scoped);
                match seen.get(&resource.key) {
                    Some(first) => set.errors.push(ManifestError::document(
                        path,
                        index,
                        format!("duplicate resource {}, first declared in {}", resource.key, first),
                    )),
                    None => {
                        seen.insert(resource.key.clone(), path.clone());
                        set.resources.push(resource);
                    }
                }
            }
        }

        for error in &set.errors {
            warn!(app = %app.name, revision = %revision, error = %error, "Invalid manifest");
        }
        debug!(
            app = %app.name,
            revision = %revision,
            resources = set.resources.len(),
            errors = set.errors.len(),
            "Fetched desired state"
        );
        Ok(set)
    }

    /// Scope as served by the cluster. Kinds the API server does not serve
    /// yet (a CRD applied in the same sync) fall back to the capability table.
    async fn is_cluster_scoped(
        &self,
        cache: &mut HashMap<(String, String), bool>,
        object: &Value,
    ) -> Result<bool> {
        let field = |name: &str| {
            object
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let cache_key = (field("apiVersion"), field("kind"));
        if let Some(scoped) = cache.get(&cache_key) {
            return Ok(*scoped);
        }
        let (api_version, kind) = &cache_key;
        let scoped = match self.cluster.is_namespaced(api_version, kind).await? {
            Some(namespaced) => !namespaced,
            None => self.capabilities.is_cluster_scoped(kind),
        };
        cache.insert(cache_key, scoped);
        Ok(scoped)
    }

    /// Fill in the tracking label and default namespace
    fn prepare(
        &self,
        app: &ManagedApp,
        path: &str,
        mut object: Value,
        cluster_scoped: bool,
    ) -> DesiredResource {
        let kind = object
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if let Some(meta) = object.get_mut("metadata").and_then(Value::as_object_mut) {
            if cluster_scoped {
                meta.remove("namespace");
            } else if !meta.contains_key("namespace") {
                meta.insert(
                    "namespace".to_string(),
                    Value::String(app.destination.namespace.clone()),
                );
            }
            let labels = meta
                .entry("labels")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(labels) = labels.as_object_mut() {
                labels.insert(
                    TRACKING_LABEL.to_string(),
                    Value::String(app.tracking_value()),
                );
            }
        }

        let (api_version, key) = object_identity(&object)
            .unwrap_or_else(|| (String::new(), ResourceKey::cluster(kind, String::new())));
        DesiredResource {
            key,
            api_version,
            source_path: path.to_string(),
            object,
        }
    }
}

fn is_manifest_file(path: &str, root: &str) -> bool {
    let under_root = root.is_empty()
        || path
            .strip_prefix(root)
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false);
    under_root && MANIFEST_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Parse one manifest file into validated objects, keyed by document index.
///
/// YAML files may hold several documents separated by `---`; each is parsed
/// on its own so one broken document does not hide its siblings. `*List`
/// documents are expanded into their items.
pub fn parse_manifests(path: &str, content: &str) -> (Vec<(usize, Value)>, Vec<ManifestError>) {
    let mut objects = Vec::new();
    let mut errors = Vec::new();

    let documents: Vec<std::result::Result<Value, String>> = if path.ends_with(".json") {
        vec![serde_json::from_str(content).map_err(|e| e.to_string())]
    } else {
        split_documents(content)
            .into_iter()
            .map(|doc| serde_yaml::from_str::<Value>(doc).map_err(|e| e.to_string()))
            .collect()
    };

    for (index, parsed) in documents.into_iter().enumerate() {
        let value = match parsed {
            Ok(Value::Null) => continue,
            Ok(v) => v,
            Err(e) => {
                errors.push(ManifestError::document(path, index, e));
                continue;
            }
        };

        if is_list(&value) {
            let items = value
                .get("items")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for (item_index, item) in items.into_iter().enumerate() {
                match validate_object(&item) {
                    Ok(()) => objects.push((index, item)),
                    Err(msg) => errors.push(ManifestError::document(
                        path,
                        index,
                        format!("items[{}]: {}", item_index, msg),
                    )),
                }
            }
            continue;
        }

        match validate_object(&value) {
            Ok(()) => objects.push((index, value)),
            Err(msg) => errors.push(ManifestError::document(path, index, msg)),
        }
    }

    (objects, errors)
}

/// Split a YAML stream on `---` separator lines, dropping empty documents
fn split_documents(content: &str) -> Vec<&str> {
    let mut docs = Vec::new();
    let mut start = 0;
    let mut offset = 0;
    for line in content.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if trimmed == "---" || trimmed.starts_with("--- ") {
            docs.push(&content[start..offset]);
            start = offset + line.len();
        }
        offset += line.len();
    }
    docs.push(&content[start..]);

    docs.into_iter()
        .filter(|doc| {
            doc.lines().any(|l| {
                let l = l.trim();
                !l.is_empty() && !l.starts_with('#') && l != "..."
            })
        })
        .collect()
}

fn is_list(value: &Value) -> bool {
    value
        .get("kind")
        .and_then(Value::as_str)
        .map(|k| k.ends_with("List"))
        .unwrap_or(false)
        && value.get("items").map(Value::is_array).unwrap_or(false)
}

fn validate_object(value: &Value) -> std::result::Result<(), String> {
    if !value.is_object() {
        return Err("document is not a mapping".to_string());
    }
    let non_empty = |pointer: &str| {
        value
            .pointer(pointer)
            .and_then(Value::as_str)
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false)
    };
    if !non_empty("/apiVersion") {
        return Err("missing apiVersion".to_string());
    }
    if !non_empty("/kind") {
        return Err("missing kind".to_string());
    }
    if !non_empty("/metadata/name") {
        return Err("missing metadata.name".to_string());
    }
    Ok(())
}
