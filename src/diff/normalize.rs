//! Normalization rules and the per-kind capability table

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Map, Value};

use super::health::{self, HealthEvaluable};
use super::{FieldPath, PathSegment};
use crate::crd::HealthStatus;
use crate::error::Result;
use crate::model::LAST_APPLIED_ANNOTATION;

/// Metadata fields written by the API server
const SERVER_METADATA: &[&str] = &[
    "uid",
    "resourceVersion",
    "generation",
    "creationTimestamp",
    "managedFields",
    "selfLink",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
];

/// Annotations maintained by the cluster or by client tooling
const IGNORED_ANNOTATIONS: &[&str] = &[
    LAST_APPLIED_ANNOTATION,
    "kubectl.kubernetes.io/last-applied-configuration",
    "deployment.kubernetes.io/revision",
];

/// Labels added by the API server
const IGNORED_LABELS: &[&str] = &["kubernetes.io/metadata.name"];

/// Kinds that are not namespaced
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "Node",
    "PersistentVolume",
    "StorageClass",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "PriorityClass",
    "IngressClass",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
    "APIService",
];

/// Segment of a field pattern
#[derive(Clone, Debug, PartialEq, Eq)]
enum PatternSegment {
    Key(String),
    AnyElement,
}

/// Field path pattern, e.g. `spec.template.spec.containers[*].imagePullPolicy`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldPattern(Vec<PatternSegment>);

impl FieldPattern {
    pub fn parse(pattern: &str) -> Self {
        let mut segments = Vec::new();
        for part in pattern.split('.').filter(|p| !p.is_empty()) {
            match part.strip_suffix("[*]") {
                Some(key) => {
                    segments.push(PatternSegment::Key(key.to_string()));
                    segments.push(PatternSegment::AnyElement);
                }
                None => segments.push(PatternSegment::Key(part.to_string())),
            }
        }
        Self(segments)
    }

    pub fn matches(&self, path: &FieldPath) -> bool {
        let segments = path.segments();
        self.0.len() == segments.len()
            && self.0.iter().zip(segments).all(|(p, s)| match (p, s) {
                (PatternSegment::Key(a), PathSegment::Key(b)) => a == b,
                (PatternSegment::AnyElement, PathSegment::Index(_))
                | (PatternSegment::AnyElement, PathSegment::Named(_)) => true,
                _ => false,
            })
    }
}

/// Kind-specific normalization capability
pub trait Normalizable: Send + Sync {
    /// Fields that are never compared
    fn is_ignored(&self, path: &FieldPath) -> bool;

    /// Whether a field present only in the live object is expected there,
    /// either as a documented default or as a server-assigned value
    fn accepts_live_only(&self, path: &FieldPath, live: &Value) -> bool;

    /// Rewrite the desired object into the form the API server stores
    fn normalize_desired(&self, _object: &mut Value) {}
}

/// Table-driven normalization rules
#[derive(Clone, Debug, Default)]
pub struct FieldRules {
    ignored: Vec<FieldPattern>,
    server_assigned: Vec<FieldPattern>,
    defaults: Vec<(FieldPattern, Value)>,
}

impl FieldRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never compare this field
    pub fn ignore(mut self, pattern: &str) -> Self {
        self.ignored.push(FieldPattern::parse(pattern));
        self
    }

    /// Accept any live value when the field is not declared
    pub fn server_assigned(mut self, pattern: &str) -> Self {
        self.server_assigned.push(FieldPattern::parse(pattern));
        self
    }

    /// Accept the live value when the field is not declared and equals `value`
    pub fn default_value(mut self, pattern: &str, value: Value) -> Self {
        self.defaults.push((FieldPattern::parse(pattern), value));
        self
    }

    /// Pod template defaults under `prefix` (e.g. `spec.template.spec`)
    pub fn pod_defaults(self, prefix: &str) -> Self {
        let p = |field: &str| format!("{}.{}", prefix, field);
        let mut rules = self
            .default_value(&p("restartPolicy"), json!("Always"))
            .default_value(&p("dnsPolicy"), json!("ClusterFirst"))
            .default_value(&p("schedulerName"), json!("default-scheduler"))
            .default_value(&p("securityContext"), json!({}))
            .default_value(&p("terminationGracePeriodSeconds"), json!(30))
            .default_value(&p("enableServiceLinks"), json!(true))
            .server_assigned(&p("serviceAccount"));
        for list in ["containers", "initContainers"] {
            let c = |field: &str| format!("{}.{}[*].{}", prefix, list, field);
            rules = rules
                .default_value(&c("imagePullPolicy"), json!("IfNotPresent"))
                .default_value(&c("terminationMessagePath"), json!("/dev/termination-log"))
                .default_value(&c("terminationMessagePolicy"), json!("File"))
                .default_value(&c("resources"), json!({}))
                .default_value(&c("ports[*].protocol"), json!("TCP"));
        }
        rules
    }

    fn default_matches(&self, path: &FieldPath, live: &Value) -> bool {
        self.defaults
            .iter()
            .any(|(pattern, value)| pattern.matches(path) && super::values_equal(value, live))
    }
}

impl Normalizable for FieldRules {
    fn is_ignored(&self, path: &FieldPath) -> bool {
        self.ignored.iter().any(|p| p.matches(path))
    }

    fn accepts_live_only(&self, path: &FieldPath, live: &Value) -> bool {
        self.server_assigned.iter().any(|p| p.matches(path)) || self.default_matches(path, live)
    }
}

/// Secrets: `stringData` is stored base64-encoded under `data`
struct SecretRules(FieldRules);

impl Normalizable for SecretRules {
    fn is_ignored(&self, path: &FieldPath) -> bool {
        self.0.is_ignored(path)
    }

    fn accepts_live_only(&self, path: &FieldPath, live: &Value) -> bool {
        self.0.accepts_live_only(path, live)
    }

    fn normalize_desired(&self, object: &mut Value) {
        let Some(obj) = object.as_object_mut() else {
            return;
        };
        let Some(Value::Object(string_data)) = obj.remove("stringData") else {
            return;
        };
        let data = obj
            .entry("data")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(data) = data.as_object_mut() {
            for (k, v) in string_data {
                if let Some(s) = v.as_str() {
                    data.insert(k, Value::String(BASE64.encode(s.as_bytes())));
                }
            }
        }
    }
}

/// Capabilities registered for one kind
#[derive(Clone, Default)]
pub struct KindCapabilities {
    pub normalizer: Option<Arc<dyn Normalizable>>,
    pub health: Option<Arc<dyn HealthEvaluable>>,
    pub cluster_scoped: bool,
}

impl KindCapabilities {
    pub fn with_normalizer(mut self, normalizer: impl Normalizable + 'static) -> Self {
        self.normalizer = Some(Arc::new(normalizer));
        self
    }

    pub fn with_health(mut self, health: impl HealthEvaluable + 'static) -> Self {
        self.health = Some(Arc::new(health));
        self
    }

    pub fn cluster_scoped(mut self) -> Self {
        self.cluster_scoped = true;
        self
    }
}

/// Registry of kind capabilities
#[derive(Clone, Default)]
pub struct CapabilityTable {
    kinds: HashMap<String, KindCapabilities>,
}

impl CapabilityTable {
    /// Table without any kind-specific rules
    pub fn empty() -> Self {
        Self::default()
    }

    /// Table with rules for the built-in Kubernetes kinds
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        for kind in CLUSTER_SCOPED_KINDS {
            table.register(kind, KindCapabilities::default().cluster_scoped());
        }

        table.register(
            "Namespace",
            KindCapabilities::default()
                .cluster_scoped()
                .with_normalizer(FieldRules::new().server_assigned("spec.finalizers"))
                .with_health(health::NamespaceHealth),
        );
        table.register(
            "Deployment",
            KindCapabilities::default()
                .with_normalizer(
                    FieldRules::new()
                        .default_value("spec.replicas", json!(1))
                        .default_value("spec.revisionHistoryLimit", json!(10))
                        .default_value("spec.progressDeadlineSeconds", json!(600))
                        .default_value(
                            "spec.strategy",
                            json!({
                                "type": "RollingUpdate",
                                "rollingUpdate": {"maxSurge": "25%", "maxUnavailable": "25%"}
                            }),
                        )
                        .default_value(
                            "spec.strategy.rollingUpdate",
                            json!({"maxSurge": "25%", "maxUnavailable": "25%"}),
                        )
                        .ignore("spec.template.metadata.creationTimestamp")
                        .pod_defaults("spec.template.spec"),
                )
                .with_health(health::DeploymentHealth),
        );
        table.register(
            "StatefulSet",
            KindCapabilities::default()
                .with_normalizer(
                    FieldRules::new()
                        .default_value("spec.replicas", json!(1))
                        .default_value("spec.revisionHistoryLimit", json!(10))
                        .default_value("spec.podManagementPolicy", json!("OrderedReady"))
                        .default_value(
                            "spec.updateStrategy",
                            json!({"type": "RollingUpdate", "rollingUpdate": {"partition": 0}}),
                        )
                        .default_value(
                            "spec.persistentVolumeClaimRetentionPolicy",
                            json!({"whenDeleted": "Retain", "whenScaled": "Retain"}),
                        )
                        .ignore("spec.template.metadata.creationTimestamp")
                        .pod_defaults("spec.template.spec"),
                )
                .with_health(health::StatefulSetHealth),
        );
        table.register(
            "DaemonSet",
            KindCapabilities::default()
                .with_normalizer(
                    FieldRules::new()
                        .default_value("spec.revisionHistoryLimit", json!(10))
                        .default_value(
                            "spec.updateStrategy",
                            json!({
                                "type": "RollingUpdate",
                                "rollingUpdate": {"maxSurge": 0, "maxUnavailable": 1}
                            }),
                        )
                        .ignore("spec.template.metadata.creationTimestamp")
                        .pod_defaults("spec.template.spec"),
                )
                .with_health(health::DaemonSetHealth),
        );
        table.register(
            "Job",
            KindCapabilities::default()
                .with_normalizer(
                    FieldRules::new()
                        .default_value("spec.backoffLimit", json!(6))
                        .default_value("spec.completions", json!(1))
                        .default_value("spec.parallelism", json!(1))
                        .default_value("spec.completionMode", json!("NonIndexed"))
                        .default_value("spec.suspend", json!(false))
                        .server_assigned("spec.selector")
                        .server_assigned("spec.template.metadata.labels")
                        .ignore("spec.template.metadata.creationTimestamp")
                        .pod_defaults("spec.template.spec"),
                )
                .with_health(health::JobHealth),
        );
        table.register(
            "Pod",
            KindCapabilities::default()
                .with_normalizer(
                    FieldRules::new()
                        .pod_defaults("spec")
                        .server_assigned("spec.nodeName")
                        .server_assigned("spec.tolerations")
                        .server_assigned("spec.volumes")
                        .server_assigned("spec.containers[*].volumeMounts"),
                )
                .with_health(health::PodHealth),
        );
        table.register(
            "Service",
            KindCapabilities::default()
                .with_normalizer(
                    FieldRules::new()
                        .server_assigned("spec.clusterIP")
                        .server_assigned("spec.clusterIPs")
                        .server_assigned("spec.ipFamilies")
                        .server_assigned("spec.ipFamilyPolicy")
                        .server_assigned("spec.ports[*].nodePort")
                        .server_assigned("spec.ports[*].targetPort")
                        .server_assigned("spec.healthCheckNodePort")
                        .default_value("spec.type", json!("ClusterIP"))
                        .default_value("spec.sessionAffinity", json!("None"))
                        .default_value("spec.internalTrafficPolicy", json!("Cluster"))
                        .default_value("spec.externalTrafficPolicy", json!("Cluster"))
                        .default_value("spec.ports[*].protocol", json!("TCP")),
                )
                .with_health(health::ServiceHealth),
        );
        table.register(
            "Ingress",
            KindCapabilities::default().with_health(health::IngressHealth),
        );
        table.register(
            "PersistentVolumeClaim",
            KindCapabilities::default()
                .with_normalizer(
                    FieldRules::new()
                        .server_assigned("spec.volumeName")
                        .server_assigned("spec.storageClassName")
                        .default_value("spec.volumeMode", json!("Filesystem")),
                )
                .with_health(health::PvcHealth),
        );
        table.register(
            "Secret",
            KindCapabilities::default().with_normalizer(SecretRules(
                FieldRules::new().default_value("type", json!("Opaque")),
            )),
        );
        table.register(
            "ServiceAccount",
            KindCapabilities::default()
                .with_normalizer(FieldRules::new().server_assigned("secrets")),
        );
        table
    }

    /// Register or replace the capabilities of a kind
    pub fn register(&mut self, kind: &str, capabilities: KindCapabilities) {
        self.kinds.insert(kind.to_string(), capabilities);
    }

    pub fn get(&self, kind: &str) -> Option<&KindCapabilities> {
        self.kinds.get(kind)
    }

    pub fn is_cluster_scoped(&self, kind: &str) -> bool {
        self.kinds
            .get(kind)
            .map(|c| c.cluster_scoped)
            .unwrap_or(false)
    }

    pub fn normalizer(&self, kind: &str) -> Option<&dyn Normalizable> {
        self.kinds.get(kind).and_then(|c| c.normalizer.as_deref())
    }

    /// Health of a live object; kinds without a health check are healthy once present
    pub fn health(&self, kind: &str, live: &Value) -> HealthStatus {
        self.kinds
            .get(kind)
            .and_then(|c| c.health.as_ref())
            .map(|h| h.evaluate(live))
            .unwrap_or(HealthStatus::Healthy)
    }
}

/// Remove identity and server-populated fields before comparison
pub fn strip_for_compare(mut object: Value) -> Value {
    if let Some(obj) = object.as_object_mut() {
        obj.remove("status");
        obj.remove("apiVersion");
        obj.remove("kind");
        if let Some(Value::Object(meta)) = obj.get_mut("metadata") {
            for field in SERVER_METADATA {
                meta.remove(*field);
            }
            prune_map(meta, "annotations", IGNORED_ANNOTATIONS);
            prune_map(meta, "labels", IGNORED_LABELS);
        }
    }
    object
}

fn prune_map(meta: &mut Map<String, Value>, field: &str, keys: &[&str]) {
    let empty = match meta.get_mut(field) {
        Some(Value::Object(map)) => {
            for key in keys {
                map.remove(*key);
            }
            map.is_empty()
        }
        Some(Value::Null) => true,
        _ => false,
    };
    if empty {
        meta.remove(field);
    }
}

/// The desired object as last applied by the operator, if recorded
pub fn last_applied(live: &Value) -> Option<Value> {
    live.pointer("/metadata/annotations")
        .and_then(|a| a.get(LAST_APPLIED_ANNOTATION))
        .and_then(Value::as_str)
        .and_then(|s| serde_json::from_str(s).ok())
}

/// Copy of `desired` carrying its own compact JSON as the last-applied annotation
pub fn with_last_applied(desired: &Value) -> Result<Value> {
    let mut recorded = desired.clone();
    if let Some(Value::Object(meta)) = recorded.pointer_mut("/metadata") {
        prune_map(meta, "annotations", &[LAST_APPLIED_ANNOTATION]);
    }
    let encoded = serde_json::to_string(&recorded)?;

    let mut out = desired.clone();
    if let Some(obj) = out.as_object_mut() {
        let meta = obj
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(meta) = meta.as_object_mut() {
            let annotations = meta
                .entry("annotations")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(annotations) = annotations.as_object_mut() {
                annotations.insert(LAST_APPLIED_ANNOTATION.to_string(), Value::String(encoded));
            }
        }
    }
    Ok(out)
}
