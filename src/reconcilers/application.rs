//! Application reconciler
//!
//! Handles the business logic for one application:
//! - Spec validation and conversion into a [`ManagedApp`]
//! - One reconciliation cycle (refresh, diff, sync, verify)
//! - Read-only drift detection for the drift watcher
//! - Cascade deletion of managed resources
//! - Status projection

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::adapters::{
    fetch_live, ClusterClient, ManifestSet, ManifestStore, SourceRepository, StatusSink,
    DEFAULT_MAX_MANIFEST_BYTES, DEFAULT_TRACKED_KINDS,
};
use crate::crd::{
    AppPhase, Application, ApplicationStatus, Condition, HealthStatus, OperationSummary,
    ResourceStatus, SyncStatus, IN_CLUSTER_SERVER,
};
use crate::diff::{aggregate_sync_status, CapabilityTable, DiffEngine, DiffStatus, ResourceDiff};
use crate::error::{Error, Result};
use crate::metrics;
use crate::model::{
    DestinationRef, LiveResource, ManagedApp, OpOutcome, OperationRecord, ResourceKey,
    RetryPolicy, SourceRef, SyncPolicy,
};
use crate::sync::{self, PlanOptions, SyncExecutor, SyncPlan, SyncResult, DEFAULT_APPLY_TIMEOUT};

/// Shortest accepted drift detection interval
pub const MIN_SYNC_INTERVAL_SECONDS: u64 = 5;

/// Label values are limited to 63 characters
const MAX_TRACKING_VALUE_LEN: usize = 63;

const REPO_URL_PREFIXES: &[&str] = &["https://", "http://", "ssh://", "git@", "file://", "/"];

/// Validate the Application spec
pub fn validate(app: &Application) -> Result<()> {
    let name = app.metadata.name.as_deref().unwrap_or_default();
    if name.is_empty() {
        return Err(Error::validation("metadata.name must be set"));
    }
    let namespace = app.namespace().unwrap_or_else(|| "default".to_string());

    // Source
    let source = &app.spec.source;
    let repo_url = source.repo_url.trim();
    if repo_url.is_empty() {
        return Err(Error::validation("source.repoURL must be set"));
    }
    if !REPO_URL_PREFIXES.iter().any(|p| repo_url.starts_with(p)) {
        return Err(Error::validation(format!(
            "Invalid source.repoURL '{}': must be an https, http, ssh, git@ or file URL",
            repo_url
        )));
    }
    if source.path.split('/').any(|segment| segment == "..") {
        return Err(Error::validation(format!(
            "Invalid source.path '{}': must not leave the repository",
            source.path
        )));
    }
    let revision = source.target_revision.trim();
    if revision.is_empty() || revision.chars().any(char::is_whitespace) {
        return Err(Error::validation(format!(
            "Invalid source.targetRevision '{}'",
            source.target_revision
        )));
    }

    // Destination
    let destination = &app.spec.destination;
    if destination.server.trim_end_matches('/') != IN_CLUSTER_SERVER {
        return Err(Error::validation(format!(
            "Unsupported destination.server '{}': only {} is supported",
            destination.server, IN_CLUSTER_SERVER
        )));
    }
    if !is_dns_label(&destination.namespace) {
        return Err(Error::validation(format!(
            "Invalid destination.namespace '{}': must be a DNS-1123 label",
            destination.namespace
        )));
    }

    // Sync policy
    let policy = &app.spec.sync_policy;
    if policy.self_heal && !policy.automated {
        return Err(Error::validation(
            "syncPolicy.selfHeal requires syncPolicy.automated",
        ));
    }
    if policy.sync_interval_seconds < MIN_SYNC_INTERVAL_SECONDS {
        return Err(Error::validation(format!(
            "Invalid syncPolicy.syncIntervalSeconds {}: must be at least {}",
            policy.sync_interval_seconds, MIN_SYNC_INTERVAL_SECONDS
        )));
    }
    if policy.retry.backoff_seconds == 0 {
        return Err(Error::validation(
            "syncPolicy.retry.backoffSeconds must be greater than 0",
        ));
    }
    if policy.retry.max_backoff_seconds < policy.retry.backoff_seconds {
        return Err(Error::validation(format!(
            "Invalid syncPolicy.retry.maxBackoffSeconds {}: must be at least backoffSeconds ({})",
            policy.retry.max_backoff_seconds, policy.retry.backoff_seconds
        )));
    }

    let tracking = format!("{}.{}", namespace, name);
    if tracking.len() > MAX_TRACKING_VALUE_LEN {
        return Err(Error::validation(format!(
            "Application '{}' is too long to track: namespace and name must fit in {} characters",
            tracking, MAX_TRACKING_VALUE_LEN
        )));
    }

    Ok(())
}

fn is_dns_label(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.starts_with('-')
        && !value.ends_with('-')
}

/// Validate and convert into the registry record
pub fn to_managed_app(app: &Application) -> Result<ManagedApp> {
    validate(app)?;
    let spec = &app.spec;
    Ok(ManagedApp {
        name: app.name_any(),
        namespace: app.namespace().unwrap_or_else(|| "default".to_string()),
        generation: app.metadata.generation,
        source: SourceRef {
            repo_url: spec.source.repo_url.trim().to_string(),
            path: spec.source.path.clone(),
            target_revision: spec.source.target_revision.trim().to_string(),
        },
        destination: DestinationRef {
            server: spec.destination.server.trim_end_matches('/').to_string(),
            namespace: spec.destination.namespace.clone(),
        },
        policy: SyncPolicy {
            automated: spec.sync_policy.automated,
            prune: spec.sync_policy.prune,
            self_heal: spec.sync_policy.self_heal,
            sync_interval: Duration::from_secs(spec.sync_policy.sync_interval_seconds),
            retry: RetryPolicy {
                limit: spec.sync_policy.retry.limit,
                backoff: Duration::from_secs(spec.sync_policy.retry.backoff_seconds),
                max_backoff: Duration::from_secs(spec.sync_policy.retry.max_backoff_seconds),
            },
        },
        cascade_delete: spec.cascade_delete,
    })
}

/// What started a cycle, weakest first
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkItem {
    /// Recompute the status without syncing
    Refresh,
    /// Resync timer
    Tick,
    /// Drift detected with self-heal enabled
    SelfHeal,
    /// Explicit sync request
    SyncNow,
}

impl WorkItem {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkItem::Refresh => "Refresh",
            WorkItem::Tick => "Tick",
            WorkItem::SelfHeal => "SelfHeal",
            WorkItem::SyncNow => "SyncNow",
        }
    }

    /// Merge two queued triggers; the stronger one wins
    pub fn coalesce(self, other: WorkItem) -> WorkItem {
        self.max(other)
    }
}

/// Per-application state owned by its worker
#[derive(Clone, Debug, Default)]
pub struct AppState {
    /// Last projected status
    pub status: ApplicationStatus,
    /// The previous cycle ended in `Failed`
    pub last_cycle_failed: bool,
}

impl AppState {
    /// Resume from a previously published status
    pub fn seeded(status: ApplicationStatus) -> Self {
        let last_cycle_failed = status.phase == AppPhase::Failed;
        Self {
            status,
            last_cycle_failed,
        }
    }
}

/// Whether a cycle started by `trigger` may sync
pub fn wants_sync(app: &ManagedApp, state: &AppState, trigger: WorkItem) -> bool {
    match trigger {
        WorkItem::SyncNow => true,
        WorkItem::Tick => app.policy.automated,
        WorkItem::SelfHeal => {
            app.policy.automated && app.policy.self_heal && !state.last_cycle_failed
        }
        WorkItem::Refresh => false,
    }
}

/// Result of one cycle
#[derive(Clone, Debug)]
pub struct CycleOutcome {
    pub trigger: WorkItem,
    /// Phase reported in the status
    pub phase: AppPhase,
    pub revision: Option<String>,
    /// Present when the cycle executed a sync
    pub sync: Option<SyncResult>,
    /// Conflict retries performed
    pub retries: u32,
    pub error: Option<String>,
}

impl CycleOutcome {
    pub fn synced(&self) -> bool {
        self.sync.is_some()
    }
}

/// Read-only comparison made by the drift watcher
#[derive(Clone, Debug)]
pub struct DriftReport {
    pub revision: String,
    /// Keys that a sync would act on
    pub drifted: Vec<ResourceKey>,
}

impl DriftReport {
    pub fn has_drift(&self) -> bool {
        !self.drifted.is_empty()
    }
}

struct Projection<'a> {
    revision: &'a str,
    diffs: &'a [ResourceDiff],
    warnings: Vec<String>,
    phase: AppPhase,
    operation: Option<OperationSummary>,
    error: Option<String>,
    /// A sync ran to completion without failures
    sync_completed: bool,
}

/// Drives applications toward their desired state
pub struct ApplicationReconciler {
    manifests: ManifestStore,
    cluster: Arc<dyn ClusterClient>,
    engine: DiffEngine,
    executor: SyncExecutor,
    status: Arc<dyn StatusSink>,
    known_kinds: RwLock<HashMap<String, BTreeSet<(String, String)>>>,
}

impl ApplicationReconciler {
    pub fn new(
        manifests: ManifestStore,
        cluster: Arc<dyn ClusterClient>,
        engine: DiffEngine,
        executor: SyncExecutor,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            manifests,
            cluster,
            engine,
            executor,
            status,
            known_kinds: RwLock::new(HashMap::new()),
        }
    }

    /// Reconciler with the built-in capability table and default limits
    pub fn with_defaults(
        source: Arc<dyn SourceRepository>,
        cluster: Arc<dyn ClusterClient>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        let capabilities = Arc::new(CapabilityTable::builtin());
        Self::new(
            ManifestStore::new(
                source,
                cluster.clone(),
                capabilities.clone(),
                DEFAULT_MAX_MANIFEST_BYTES,
            ),
            cluster.clone(),
            DiffEngine::new(capabilities),
            SyncExecutor::new(cluster, DEFAULT_APPLY_TIMEOUT),
            status,
        )
    }

    /// Run one full cycle for `app`
    #[instrument(skip_all, fields(app = %app.id(), trigger = trigger.as_str()))]
    pub async fn run_cycle(
        &self,
        app: &ManagedApp,
        state: &mut AppState,
        trigger: WorkItem,
        cancel: &CancellationToken,
    ) -> CycleOutcome {
        let started = Instant::now();
        if matches!(trigger, WorkItem::Tick | WorkItem::SyncNow) {
            state.last_cycle_failed = false;
        }

        let mut phase = AppPhase::Idle;
        advance(app, &mut phase, AppPhase::Refreshing);
        let (desired, live) = match self.refresh(app).await {
            Ok(refreshed) => refreshed,
            Err(e) => return self.abort(app, state, trigger, phase, e, None, started).await,
        };

        advance(app, &mut phase, AppPhase::Diffing);
        let diffs = self.engine.compute(&desired.resources, &live);
        let options = PlanOptions {
            prune: app.policy.prune,
            prune_suspended: !desired.errors.is_empty(),
        };
        let plan = sync::plan(&diffs, options, self.engine.capabilities());
        let mut warnings = manifest_warnings(&desired);
        warnings.extend(plan.warnings.iter().cloned());
        let drift = diffs.iter().any(|d| d.is_drift(app.policy.prune));
        debug!(
            revision = %desired.revision,
            resources = diffs.len(),
            drift = drift,
            "Diff computed"
        );

        if !drift || !wants_sync(app, state, trigger) {
            let reported = if drift { AppPhase::Idle } else { AppPhase::InSync };
            advance(app, &mut phase, reported);
            let status = self.project(
                app,
                &state.status,
                Projection {
                    revision: &desired.revision,
                    diffs: &diffs,
                    warnings,
                    phase: reported,
                    operation: None,
                    // Unresolved drift keeps the last failure visible
                    error: if drift { state.status.last_error.clone() } else { None },
                    sync_completed: false,
                },
            );
            if reported == AppPhase::InSync {
                advance(app, &mut phase, AppPhase::Idle);
            }
            let outcome = CycleOutcome {
                trigger,
                phase: reported,
                revision: Some(desired.revision.clone()),
                sync: None,
                retries: 0,
                error: None,
            };
            return self.finish(app, state, status, outcome, started).await;
        }

        advance(app, &mut phase, AppPhase::Syncing);
        info!(
            revision = %desired.revision,
            operations = plan.len(),
            "Syncing application"
        );
        let syncing = self.project(
            app,
            &state.status,
            Projection {
                revision: &desired.revision,
                diffs: &diffs,
                warnings: warnings.clone(),
                phase: AppPhase::Syncing,
                operation: None,
                error: state.status.last_error.clone(),
                sync_completed: false,
            },
        );
        self.publish(app, &syncing).await;

        let sync_started = Utc::now();
        let mut result = self.executor.execute(app, &plan, cancel).await;
        let retries = self
            .retry_conflicts(app, &desired, &plan, &mut result, &mut phase, options, cancel)
            .await;
        let summary = operation_summary(trigger, &desired.revision, sync_started, &result, retries);

        // Verify against a fresh read so the status reflects the cluster after the sync
        let kinds = self.tracked_kinds(app, &desired).await;
        let verified = match fetch_live(self.cluster.as_ref(), app, &kinds).await {
            Ok(live) => self.engine.compute(&desired.resources, &live),
            Err(e) => {
                let outcome = self
                    .abort(app, state, trigger, phase, e, Some(summary), started)
                    .await;
                return CycleOutcome {
                    sync: Some(result),
                    retries,
                    ..outcome
                };
            }
        };

        let failed = result.has_failures();
        let reported = if failed { AppPhase::Failed } else { AppPhase::Idle };
        advance(app, &mut phase, reported);
        let error = result.first_failure().map(|record| {
            format!(
                "{} operation(s) failed; {}: {}",
                result.failed(),
                record.key,
                record.message.as_deref().unwrap_or("failed")
            )
        });
        let status = self.project(
            app,
            &state.status,
            Projection {
                revision: &desired.revision,
                diffs: &verified,
                warnings,
                phase: reported,
                operation: Some(summary),
                error: error.clone(),
                sync_completed: !failed && !result.cancelled,
            },
        );
        if failed {
            advance(app, &mut phase, AppPhase::Idle);
            state.last_cycle_failed = true;
        }

        info!(
            revision = %desired.revision,
            succeeded = result.succeeded(),
            failed = result.failed(),
            skipped = result.skipped(),
            retries = retries,
            cancelled = result.cancelled,
            "Sync finished"
        );

        let outcome = CycleOutcome {
            trigger,
            phase: reported,
            revision: Some(desired.revision.clone()),
            sync: Some(result),
            retries,
            error,
        };
        self.finish(app, state, status, outcome, started).await
    }

    /// Compare desired and live state without touching the cluster
    #[instrument(skip_all, fields(app = %app.id()))]
    pub async fn detect_drift(&self, app: &ManagedApp) -> Result<DriftReport> {
        let (desired, live) = self.refresh(app).await?;
        let drifted = self
            .engine
            .compute(&desired.resources, &live)
            .into_iter()
            .filter(|d| d.is_drift(app.policy.prune))
            .map(|d| d.key)
            .collect();
        Ok(DriftReport {
            revision: desired.revision,
            drifted,
        })
    }

    /// Delete every live object managed by `app`
    #[instrument(skip_all, fields(app = %app.id()))]
    pub async fn cascade_delete(&self, app: &ManagedApp) -> Result<SyncResult> {
        let mut kinds = self.known_kinds(app).await;
        match self.manifests.fetch_desired(app).await {
            Ok(desired) => kinds.extend(desired.kinds()),
            Err(e) => debug!(error = %e, "Source unavailable, deleting tracked kinds only"),
        }
        let live = fetch_live(self.cluster.as_ref(), app, &kinds).await?;
        let diffs = self.engine.compute(&[], &live);

        let mut pruning = app.clone();
        pruning.policy.prune = true;
        let options = PlanOptions {
            prune: true,
            prune_suspended: false,
        };
        let plan = sync::plan(&diffs, options, self.engine.capabilities());
        let result = self
            .executor
            .execute(&pruning, &plan, &CancellationToken::new())
            .await;

        info!(
            deleted = result.succeeded(),
            failed = result.failed(),
            "Cascade delete finished"
        );
        Ok(result)
    }

    /// Drop cached state of a removed application
    pub async fn forget(&self, app: &ManagedApp) {
        self.known_kinds.write().await.remove(&app.id());
    }

    async fn refresh(&self, app: &ManagedApp) -> Result<(ManifestSet, Vec<LiveResource>)> {
        let desired = self.manifests.fetch_desired(app).await?;
        for error in &desired.errors {
            warn!(app = %app.id(), error = %error, "Invalid manifest");
        }
        let kinds = self.tracked_kinds(app, &desired).await;
        let live = fetch_live(self.cluster.as_ref(), app, &kinds).await?;

        let mut seen: BTreeSet<(String, String)> = desired.kinds().into_iter().collect();
        seen.extend(
            live.iter()
                .map(|l| (l.api_version.clone(), l.key.kind.clone())),
        );
        self.known_kinds
            .write()
            .await
            .entry(app.id())
            .or_default()
            .extend(seen);

        Ok((desired, live))
    }

    async fn known_kinds(&self, app: &ManagedApp) -> BTreeSet<(String, String)> {
        let mut kinds: BTreeSet<(String, String)> = DEFAULT_TRACKED_KINDS
            .iter()
            .map(|(api_version, kind)| (api_version.to_string(), kind.to_string()))
            .collect();
        if let Some(known) = self.known_kinds.read().await.get(&app.id()) {
            kinds.extend(known.iter().cloned());
        }
        kinds
    }

    async fn tracked_kinds(
        &self,
        app: &ManagedApp,
        desired: &ManifestSet,
    ) -> BTreeSet<(String, String)> {
        let mut kinds = self.known_kinds(app).await;
        kinds.extend(desired.kinds());
        kinds
    }

    #[allow(clippy::too_many_arguments)]
    async fn retry_conflicts(
        &self,
        app: &ManagedApp,
        desired: &ManifestSet,
        plan: &SyncPlan,
        result: &mut SyncResult,
        phase: &mut AppPhase,
        options: PlanOptions,
        cancel: &CancellationToken,
    ) -> u32 {
        let retry = &app.policy.retry;
        let mut attempt = 0;
        while attempt < retry.limit && !result.cancelled {
            let conflicts = result.conflicts();
            if conflicts.is_empty() {
                break;
            }
            attempt += 1;
            let backoff = retry.backoff_for(attempt);
            info!(
                attempt = attempt,
                conflicts = conflicts.len(),
                backoff_ms = backoff.as_millis() as u64,
                "Retrying conflicting operations"
            );
            metrics::SYNC_RETRIES
                .with_label_values(&[&app.namespace, &app.name])
                .inc();

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => {
                    result.cancelled = true;
                    break;
                }
            }

            advance(app, phase, AppPhase::Syncing);
            match self
                .retry_once(app, desired, plan, &retry_keys(plan, result), options, cancel)
                .await
            {
                Ok(retried) => result.merge_retry(retried),
                Err(e) => {
                    warn!(app = %app.id(), error = %e, "Fresh read for retry failed");
                    break;
                }
            }
        }
        attempt
    }

    /// Re-read the retried objects, re-diff and re-execute them
    async fn retry_once(
        &self,
        app: &ManagedApp,
        desired: &ManifestSet,
        plan: &SyncPlan,
        keys: &[ResourceKey],
        options: PlanOptions,
        cancel: &CancellationToken,
    ) -> Result<SyncResult> {
        let wanted: Vec<_> = desired
            .resources
            .iter()
            .filter(|d| keys.contains(&d.key))
            .cloned()
            .collect();

        let mut live = Vec::new();
        for key in keys {
            let Some(op) = plan.operations().find(|op| &op.key == key) else {
                continue;
            };
            if let Some(object) = self.cluster.get(&op.api_version, key).await? {
                live.push(object);
            }
        }

        let diffs = self.engine.compute(&wanted, &live);
        let retry_plan = sync::plan(&diffs, options, self.engine.capabilities());
        let mut retried = self.executor.execute(app, &retry_plan, cancel).await;

        // Conflicts resolved by the other writer need no new operation
        for key in keys {
            if retried.records.iter().any(|r| &r.key == key) {
                continue;
            }
            let Some(op) = plan.operations().find(|op| &op.key == key) else {
                continue;
            };
            retried.records.push(OperationRecord {
                key: key.clone(),
                action: op.action,
                outcome: OpOutcome::Succeeded,
                message: Some("in sync after fresh read".to_string()),
                attempts: 0,
                started_at: None,
                finished_at: Some(Utc::now()),
                conflict: false,
            });
        }
        Ok(retried)
    }

    /// App-level failure: keep the previous status, record the error
    #[allow(clippy::too_many_arguments)]
    async fn abort(
        &self,
        app: &ManagedApp,
        state: &mut AppState,
        trigger: WorkItem,
        mut phase: AppPhase,
        error: Error,
        operation: Option<OperationSummary>,
        started: Instant,
    ) -> CycleOutcome {
        warn!(app = %app.id(), phase = ?phase, error = %error, "Cycle aborted");
        advance(app, &mut phase, AppPhase::Failed);
        metrics::CYCLE_FAILURES
            .with_label_values(&[&app.namespace, &app.name, failure_reason(&error)])
            .inc();

        let mut status = state.status.clone();
        status.phase = AppPhase::Failed;
        status.last_error = Some(error.to_string());
        status.observed_generation = app.generation;
        if operation.is_some() {
            status.operation = operation;
        }
        advance(app, &mut phase, AppPhase::Idle);
        state.last_cycle_failed = true;

        let outcome = CycleOutcome {
            trigger,
            phase: AppPhase::Failed,
            revision: None,
            sync: None,
            retries: 0,
            error: Some(error.to_string()),
        };
        self.finish(app, state, status, outcome, started).await
    }

    async fn finish(
        &self,
        app: &ManagedApp,
        state: &mut AppState,
        status: ApplicationStatus,
        outcome: CycleOutcome,
        started: Instant,
    ) -> CycleOutcome {
        self.publish(app, &status).await;
        metrics::record_app_status(
            &app.namespace,
            &app.name,
            status.sync_status,
            status.health_status,
        );
        let phase = format!("{:?}", outcome.phase);
        metrics::CYCLES_TOTAL
            .with_label_values(&[outcome.trigger.as_str(), &phase])
            .inc();
        metrics::CYCLE_DURATION
            .with_label_values(&[&app.namespace, &app.name])
            .observe(started.elapsed().as_secs_f64());

        state.status = status;
        outcome
    }

    async fn publish(&self, app: &ManagedApp, status: &ApplicationStatus) {
        if let Err(e) = self.status.publish(app, status).await {
            warn!(app = %app.id(), error = %e, "Failed to publish status");
        }
    }

    fn project(
        &self,
        app: &ManagedApp,
        previous: &ApplicationStatus,
        projection: Projection<'_>,
    ) -> ApplicationStatus {
        let now = Utc::now();
        let capabilities = self.engine.capabilities();

        let mut declared_health = Vec::new();
        let resources = projection
            .diffs
            .iter()
            .map(|diff| {
                let health = match (&diff.live, diff.status) {
                    (_, DiffStatus::Missing) => Some(HealthStatus::Degraded),
                    (Some(live), _) => Some(capabilities.health(&diff.key.kind, &live.object)),
                    (None, _) => None,
                };
                if diff.desired.is_some() {
                    declared_health.extend(health);
                }
                ResourceStatus {
                    kind: diff.key.kind.clone(),
                    namespace: diff.key.namespace.clone(),
                    name: diff.key.name.clone(),
                    status: diff.status.as_str().to_string(),
                    health,
                    changed_fields: diff.deltas.iter().map(|d| d.path.clone()).collect(),
                }
            })
            .collect();

        let sync_status = aggregate_sync_status(projection.diffs);
        let health_status = HealthStatus::aggregate(declared_health);

        ApplicationStatus {
            sync_status,
            health_status,
            phase: projection.phase,
            revision: Some(projection.revision.to_string()),
            last_synced_revision: if sync_status == SyncStatus::Synced {
                Some(projection.revision.to_string())
            } else {
                previous.last_synced_revision.clone()
            },
            last_sync_time: if projection.sync_completed {
                Some(now)
            } else {
                previous.last_sync_time
            },
            last_refresh_time: Some(now),
            last_error: projection.error,
            warnings: projection.warnings,
            resources,
            operation: projection.operation.or_else(|| previous.operation.clone()),
            observed_generation: app.generation,
            conditions: conditions(&previous.conditions, sync_status, health_status, now),
        }
    }
}

fn advance(app: &ManagedApp, phase: &mut AppPhase, next: AppPhase) {
    match phase.transition(next) {
        Ok(p) => {
            debug!(app = %app.id(), from = ?phase, to = ?p, "Phase transition");
            *phase = p;
        }
        Err(e) => warn!(app = %app.id(), error = %e, "Phase transition rejected"),
    }
}

fn failure_reason(error: &Error) -> &'static str {
    match error {
        Error::SourceUnavailable(_) => "source_unavailable",
        Error::ClusterUnreachable(_) => "cluster_unreachable",
        Error::Timeout { .. } => "timeout",
        Error::ApplyForbidden(_) => "forbidden",
        _ => "error",
    }
}

/// Conflicted keys plus the operations skipped because they depend on one
fn retry_keys(plan: &SyncPlan, result: &SyncResult) -> Vec<ResourceKey> {
    let mut keys: BTreeSet<ResourceKey> = result.conflicts().into_iter().collect();
    for op in plan.operations() {
        let skipped = result
            .records
            .iter()
            .any(|r| r.key == op.key && r.outcome == OpOutcome::Skipped);
        if skipped && op.depends_on.iter().any(|dep| keys.contains(dep)) {
            keys.insert(op.key.clone());
        }
    }
    keys.into_iter().collect()
}

fn manifest_warnings(desired: &ManifestSet) -> Vec<String> {
    desired
        .errors
        .iter()
        .map(|e| format!("ManifestInvalid: {}", e))
        .collect()
}

fn operation_summary(
    trigger: WorkItem,
    revision: &str,
    started_at: DateTime<Utc>,
    result: &SyncResult,
    retries: u32,
) -> OperationSummary {
    OperationSummary {
        trigger: trigger.as_str().to_string(),
        revision: revision.to_string(),
        started_at: Some(started_at),
        finished_at: Some(Utc::now()),
        succeeded: result.succeeded(),
        failed: result.failed(),
        skipped: result.skipped(),
        retries,
        cancelled: result.cancelled,
        records: result.records.clone(),
    }
}

fn conditions(
    previous: &[Condition],
    sync: SyncStatus,
    health: HealthStatus,
    now: DateTime<Utc>,
) -> Vec<Condition> {
    let synced = match sync {
        SyncStatus::Synced => "True",
        SyncStatus::OutOfSync => "False",
        SyncStatus::Unknown => "Unknown",
    };
    let healthy = match health {
        HealthStatus::Healthy => "True",
        HealthStatus::Unknown => "Unknown",
        HealthStatus::Progressing | HealthStatus::Degraded => "False",
    };
    vec![
        condition(previous, "Synced", synced, format!("{:?}", sync), now),
        condition(previous, "Healthy", healthy, format!("{:?}", health), now),
    ]
}

fn condition(
    previous: &[Condition],
    type_: &str,
    status: &str,
    reason: String,
    now: DateTime<Utc>,
) -> Condition {
    // Transition time only moves when the status flips
    let last_transition_time = previous
        .iter()
        .find(|c| c.type_ == type_ && c.status == status)
        .map(|c| c.last_transition_time)
        .unwrap_or(now);
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        last_transition_time,
        reason: Some(reason),
        message: None,
    }
}
