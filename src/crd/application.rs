//! Application Custom Resource Definition

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::OperationRecord;

/// In-cluster API server address, the only destination currently supported
pub const IN_CLUSTER_SERVER: &str = "https://kubernetes.default.svc";

/// Application resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "gitops.oso.sh",
    version = "v1alpha1",
    kind = "Application",
    plural = "applications",
    singular = "application",
    shortname = "gapp",
    namespaced,
    status = "ApplicationStatus",
    printcolumn = r#"{"name": "Sync", "type": "string", "jsonPath": ".status.syncStatus"}"#,
    printcolumn = r#"{"name": "Health", "type": "string", "jsonPath": ".status.healthStatus"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Revision", "type": "string", "jsonPath": ".status.lastSyncedRevision"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    /// Where the desired manifests live
    pub source: SourceSpec,

    /// Where the manifests are applied
    pub destination: DestinationSpec,

    /// How and when the application is synced
    #[serde(default)]
    pub sync_policy: SyncPolicySpec,

    /// Delete managed resources when the Application is deleted
    #[serde(default)]
    pub cascade_delete: bool,
}

/// Git source specification
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    /// Repository URL (https, ssh, git@ or file)
    #[serde(rename = "repoURL")]
    pub repo_url: String,

    /// Directory inside the repository holding the manifests
    #[serde(default = "default_path")]
    pub path: String,

    /// Branch, tag or commit to track
    #[serde(default = "default_target_revision")]
    pub target_revision: String,
}

fn default_path() -> String {
    ".".to_string()
}

fn default_target_revision() -> String {
    "HEAD".to_string()
}

/// Destination cluster specification
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DestinationSpec {
    /// Cluster API endpoint
    #[serde(default = "default_server")]
    pub server: String,

    /// Namespace for namespaced resources that do not declare one
    pub namespace: String,
}

fn default_server() -> String {
    IN_CLUSTER_SERVER.to_string()
}

/// Sync policy specification
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicySpec {
    /// Sync automatically on every resync tick
    #[serde(default)]
    pub automated: bool,

    /// Delete live resources that are no longer declared
    #[serde(default)]
    pub prune: bool,

    /// Re-sync automatically when drift is detected
    #[serde(default)]
    pub self_heal: bool,

    /// Drift detection interval in seconds
    #[serde(default = "default_sync_interval")]
    pub sync_interval_seconds: u64,

    /// Conflict retry configuration
    #[serde(default)]
    pub retry: RetrySpec,
}

impl Default for SyncPolicySpec {
    fn default() -> Self {
        Self {
            automated: false,
            prune: false,
            self_heal: false,
            sync_interval_seconds: default_sync_interval(),
            retry: RetrySpec::default(),
        }
    }
}

fn default_sync_interval() -> u64 {
    180
}

/// Retry configuration for conflicting applies
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetrySpec {
    /// Maximum number of retries within one cycle
    #[serde(default = "default_retry_limit")]
    pub limit: u32,

    /// Initial backoff in seconds, doubled on every retry
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: u64,

    /// Upper bound for the backoff in seconds
    #[serde(default = "default_max_backoff_seconds")]
    pub max_backoff_seconds: u64,
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            limit: default_retry_limit(),
            backoff_seconds: default_backoff_seconds(),
            max_backoff_seconds: default_max_backoff_seconds(),
        }
    }
}

fn default_retry_limit() -> u32 {
    3
}

fn default_backoff_seconds() -> u64 {
    2
}

fn default_max_backoff_seconds() -> u64 {
    60
}

/// Aggregate comparison result between desired and live state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum SyncStatus {
    Synced,
    OutOfSync,
    #[default]
    Unknown,
}

/// Observed health of the managed resources
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum HealthStatus {
    Healthy,
    Progressing,
    Degraded,
    #[default]
    Unknown,
}

impl HealthStatus {
    fn severity(self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Progressing => 1,
            HealthStatus::Unknown => 2,
            HealthStatus::Degraded => 3,
        }
    }

    /// The less healthy of two statuses
    pub fn worst(self, other: HealthStatus) -> HealthStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// Aggregate a set of statuses; an empty set is healthy
    pub fn aggregate(statuses: impl IntoIterator<Item = HealthStatus>) -> HealthStatus {
        statuses
            .into_iter()
            .fold(HealthStatus::Healthy, HealthStatus::worst)
    }
}

/// Controller phase of one application
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum AppPhase {
    #[default]
    Idle,
    Refreshing,
    Diffing,
    InSync,
    Syncing,
    Failed,
}

impl AppPhase {
    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: AppPhase) -> bool {
        use AppPhase::*;
        matches!(
            (self, next),
            (Idle, Refreshing)
                | (Refreshing, Diffing)
                | (Refreshing, Failed)
                | (Diffing, InSync)
                | (Diffing, Syncing)
                | (Diffing, Idle)
                | (Diffing, Failed)
                | (InSync, Idle)
                | (Syncing, Syncing)
                | (Syncing, Idle)
                | (Syncing, Failed)
                | (Failed, Idle)
        )
    }

    /// Move to `next`, rejecting illegal transitions
    pub fn transition(self, next: AppPhase) -> Result<AppPhase> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::validation(format!(
                "illegal phase transition {:?} -> {:?}",
                self, next
            )))
        }
    }
}

/// Application status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    /// Aggregate sync status
    #[serde(default)]
    pub sync_status: SyncStatus,

    /// Aggregate health status
    #[serde(default)]
    pub health_status: HealthStatus,

    /// Controller phase at the end of the last cycle
    #[serde(default)]
    pub phase: AppPhase,

    /// Revision observed by the last completed diff
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    /// Revision of the last sync without failed operations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_revision: Option<String>,

    /// Time of the last sync without failed operations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,

    /// Time of the last completed diff
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_refresh_time: Option<DateTime<Utc>>,

    /// Latest error, kept until a cycle completes cleanly
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Standing warnings (invalid manifests, blocked prunes)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,

    /// Per-resource comparison results
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceStatus>,

    /// Last executed sync operation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationSummary>,

    /// Observed generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Comparison result for one managed resource
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    /// InSync, OutOfSync, Missing or Orphaned
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthStatus>,
    /// Changed field paths, when out of sync
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_fields: Vec<String>,
}

/// Summary of one sync execution
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperationSummary {
    /// What started the sync (Tick, SyncNow, SelfHeal)
    pub trigger: String,
    pub revision: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Number of conflict retries performed
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub cancelled: bool,
    /// Audit trail of every operation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<OperationRecord>,
}

/// Status condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    pub type_: String,

    /// Status (True, False, Unknown)
    pub status: String,

    /// Last transition time
    pub last_transition_time: DateTime<Utc>,

    /// Reason for the condition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
