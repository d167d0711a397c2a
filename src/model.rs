//! Core domain types shared by the manifest store, diff engine, sync executor
//! and controllers.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Label that marks a live object as managed by an application
pub const TRACKING_LABEL: &str = "gitops.oso.sh/application";

/// Annotation holding the compact JSON of the last applied desired object
pub const LAST_APPLIED_ANNOTATION: &str = "gitops.oso.sh/last-applied";

/// Annotation ordering resources into sync waves (integer, default 0)
pub const SYNC_WAVE_ANNOTATION: &str = "gitops.oso.sh/sync-wave";

/// Annotation declaring dependencies: `Kind/namespace/name, Kind/name`
pub const DEPENDS_ON_ANNOTATION: &str = "gitops.oso.sh/depends-on";

/// Identity of a resource: `(kind, namespace, name)`
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceKey {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    /// Key of a namespaced resource
    pub fn namespaced(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of a cluster-scoped resource
    pub fn cluster(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: None,
            name: name.into(),
        }
    }

    /// Parse a dependency reference (`Kind/namespace/name` or `Kind/name`).
    ///
    /// The two-part form resolves to `default_namespace` unless the kind is
    /// cluster scoped.
    pub fn parse_ref(
        reference: &str,
        default_namespace: Option<&str>,
        cluster_scoped: impl Fn(&str) -> bool,
    ) -> Option<Self> {
        let parts: Vec<&str> = reference.trim().split('/').map(str::trim).collect();
        match parts.as_slice() {
            [kind, ns, name] if !kind.is_empty() && !ns.is_empty() && !name.is_empty() => {
                Some(Self::namespaced(*kind, *ns, *name))
            }
            [kind, name] if !kind.is_empty() && !name.is_empty() => {
                if cluster_scoped(kind) {
                    Some(Self::cluster(*kind, *name))
                } else {
                    Some(Self::new(*kind, default_namespace, *name))
                }
            }
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Extract `(apiVersion, key)` from a Kubernetes object
pub fn object_identity(object: &Value) -> Option<(String, ResourceKey)> {
    let api_version = object.get("apiVersion")?.as_str()?.to_string();
    let kind = object.get("kind")?.as_str()?;
    let name = object.pointer("/metadata/name")?.as_str()?;
    let namespace = object.pointer("/metadata/namespace").and_then(Value::as_str);
    Some((api_version, ResourceKey::new(kind, namespace, name)))
}

/// One manifest object read from the source at a resolved commit
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredResource {
    pub key: ResourceKey,
    pub api_version: String,
    /// File the object was read from
    pub source_path: String,
    /// Full manifest, tracking label and namespace already filled in
    pub object: Value,
}

impl DesiredResource {
    pub fn annotation(&self, name: &str) -> Option<&str> {
        self.object
            .pointer("/metadata/annotations")
            .and_then(|a| a.get(name))
            .and_then(Value::as_str)
    }

    /// Sync wave, defaulting to 0 when absent or unparsable
    pub fn sync_wave(&self) -> i32 {
        self.annotation(SYNC_WAVE_ANNOTATION)
            .and_then(|w| w.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// Observed state of an object in the cluster
#[derive(Clone, Debug, PartialEq)]
pub struct LiveResource {
    pub key: ResourceKey,
    pub api_version: String,
    pub object: Value,
}

impl LiveResource {
    /// Build from a raw object; `None` when apiVersion, kind or name is missing
    pub fn from_object(object: Value) -> Option<Self> {
        let (api_version, key) = object_identity(&object)?;
        Some(Self {
            key,
            api_version,
            object,
        })
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.object
            .pointer("/metadata/labels")
            .and_then(|l| l.get(name))
            .and_then(Value::as_str)
    }
}

/// Git source of an application
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceRef {
    pub repo_url: String,
    pub path: String,
    pub target_revision: String,
}

/// Target cluster and default namespace of an application
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DestinationRef {
    pub server: String,
    pub namespace: String,
}

/// Conflict retry policy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub limit: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based), doubling and capped
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: 3,
            backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Sync policy of an application
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncPolicy {
    pub automated: bool,
    pub prune: bool,
    pub self_heal: bool,
    /// Drift watcher period
    pub sync_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            automated: false,
            prune: false,
            self_heal: false,
            sync_interval: Duration::from_secs(180),
            retry: RetryPolicy::default(),
        }
    }
}

/// Validated registration record of one application
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagedApp {
    pub name: String,
    /// Namespace of the Application resource itself
    pub namespace: String,
    pub generation: Option<i64>,
    pub source: SourceRef,
    pub destination: DestinationRef,
    pub policy: SyncPolicy,
    pub cascade_delete: bool,
}

impl ManagedApp {
    /// Registry key, `namespace/name`
    pub fn id(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Value of the tracking label on managed objects
    pub fn tracking_value(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    /// Label selector matching every object managed by this application
    pub fn tracking_selector(&self) -> String {
        format!("{}={}", TRACKING_LABEL, self.tracking_value())
    }
}

/// Planned action on one resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

impl SyncAction {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncAction::Create => "create",
            SyncAction::Update => "update",
            SyncAction::Delete => "delete",
        }
    }
}

/// Result of one executed operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum OpOutcome {
    Succeeded,
    Failed,
    Skipped,
}

impl OpOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            OpOutcome::Succeeded => "succeeded",
            OpOutcome::Failed => "failed",
            OpOutcome::Skipped => "skipped",
        }
    }
}

/// Audit record of one sync operation
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    #[serde(flatten)]
    pub key: ResourceKey,
    pub action: SyncAction,
    pub outcome: OpOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Failed on a concurrent modification and may be retried with a fresh read
    #[serde(default)]
    pub conflict: bool,
}

impl OperationRecord {
    /// Record for an operation that never reached the cluster
    pub fn skipped(key: ResourceKey, action: SyncAction, message: impl Into<String>) -> Self {
        Self {
            key,
            action,
            outcome: OpOutcome::Skipped,
            message: Some(message.into()),
            attempts: 0,
            started_at: None,
            finished_at: Some(Utc::now()),
            conflict: false,
        }
    }
}
