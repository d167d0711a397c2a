//! Reconciliation scenarios against in-memory collaborators
//!
//! Each test drives full cycles through `ApplicationReconciler` with a
//! `MemorySource` repository and a `MemoryCluster` that fills in server
//! defaults the way the API server does.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use gitops_sync_operator::adapters::{
    ClusterCall, InjectedFailure, MemoryCluster, MemorySource, MemoryStatusSink,
};
use gitops_sync_operator::crd::{AppPhase, HealthStatus, SyncStatus, IN_CLUSTER_SERVER};
use gitops_sync_operator::model::{
    DestinationRef, ManagedApp, OpOutcome, ResourceKey, RetryPolicy, SourceRef, SyncAction,
    SyncPolicy, TRACKING_LABEL,
};
use gitops_sync_operator::reconcilers::application::{
    AppState, ApplicationReconciler, CycleOutcome, WorkItem,
};

const REPO: &str = "https://git.example.com/platform/deploy.git";

const NAMESPACE_YAML: &str = r#"
apiVersion: v1
kind: Namespace
metadata:
  name: finance
"#;

const CONFIG_YAML: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
data:
  LOG_LEVEL: info
"#;

const DEPLOYMENT_YAML: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  annotations:
    gitops.oso.sh/depends-on: ConfigMap/settings
spec:
  selector:
    matchLabels:
      app: web
  template:
    metadata:
      labels:
        app: web
    spec:
      containers:
        - name: web
          image: nginx:1.25
          ports:
            - containerPort: 80
          envFrom:
            - configMapRef:
                name: settings
"#;

const SERVICE_YAML: &str = r#"
apiVersion: v1
kind: Service
metadata:
  name: web
spec:
  selector:
    app: web
  ports:
    - name: http
      port: 80
"#;

// ============================================================================
// Test Helpers
// ============================================================================

struct Harness {
    source: Arc<MemorySource>,
    cluster: Arc<MemoryCluster>,
    status: Arc<MemoryStatusSink>,
    reconciler: ApplicationReconciler,
}

impl Harness {
    fn new() -> Self {
        let source = Arc::new(MemorySource::new());
        let cluster = Arc::new(MemoryCluster::new());
        let status = Arc::new(MemoryStatusSink::new());
        let reconciler =
            ApplicationReconciler::with_defaults(source.clone(), cluster.clone(), status.clone());
        Self {
            source,
            cluster,
            status,
            reconciler,
        }
    }

    async fn commit(&self, files: &[(&str, &str)]) -> String {
        let files: Vec<(String, &str)> = files
            .iter()
            .map(|(name, content)| (format!("apps/finance/{}", name), *content))
            .collect();
        let files: Vec<(&str, &str)> = files.iter().map(|(p, c)| (p.as_str(), *c)).collect();
        self.source.commit(REPO, "main", &files).await
    }

    async fn commit_app(&self) -> String {
        self.commit(&[
            ("config.yaml", CONFIG_YAML),
            ("deployment.yaml", DEPLOYMENT_YAML),
            ("service.yaml", SERVICE_YAML),
        ])
        .await
    }

    async fn cycle(&self, app: &ManagedApp, state: &mut AppState, trigger: WorkItem) -> CycleOutcome {
        self.reconciler
            .run_cycle(app, state, trigger, &CancellationToken::new())
            .await
    }

    /// Insert an object labelled as managed by `app`, as if applied earlier
    async fn insert_managed(&self, app: &ManagedApp, kind: &str, name: &str) -> ResourceKey {
        let api_version = if kind == "Deployment" { "apps/v1" } else { "v1" };
        self.cluster
            .insert(json!({
                "apiVersion": api_version,
                "kind": kind,
                "metadata": {
                    "name": name,
                    "namespace": "finance",
                    "labels": {TRACKING_LABEL: app.tracking_value()}
                }
            }))
            .await
            .expect("object identity")
    }
}

fn finance_app(prune: bool) -> ManagedApp {
    ManagedApp {
        name: "finance-tracker".to_string(),
        namespace: "gitops".to_string(),
        generation: Some(1),
        source: SourceRef {
            repo_url: REPO.to_string(),
            path: "apps/finance".to_string(),
            target_revision: "main".to_string(),
        },
        destination: DestinationRef {
            server: IN_CLUSTER_SERVER.to_string(),
            namespace: "finance".to_string(),
        },
        policy: SyncPolicy {
            automated: true,
            prune,
            self_heal: true,
            sync_interval: Duration::from_secs(30),
            retry: RetryPolicy {
                limit: 3,
                backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(40),
            },
        },
        cascade_delete: false,
    }
}

fn key(kind: &str, name: &str) -> ResourceKey {
    ResourceKey::namespaced(kind, "finance", name)
}

fn applies(calls: &[ClusterCall]) -> Vec<String> {
    calls
        .iter()
        .map(|call| match call {
            ClusterCall::Apply(key) => format!("apply {}", key),
            ClusterCall::Delete(key) => format!("delete {}", key),
        })
        .collect()
}

// ============================================================================
// Convergence Tests
// ============================================================================

#[tokio::test]
async fn first_cycle_creates_everything_in_order() {
    let h = Harness::new();
    let revision = h
        .commit(&[
            ("namespace.yaml", NAMESPACE_YAML),
            ("config.yaml", CONFIG_YAML),
            ("deployment.yaml", DEPLOYMENT_YAML),
            ("service.yaml", SERVICE_YAML),
        ])
        .await;
    let app = finance_app(false);
    let mut state = AppState::default();

    let outcome = h.cycle(&app, &mut state, WorkItem::Tick).await;

    assert_eq!(outcome.phase, AppPhase::Idle);
    assert_eq!(outcome.revision.as_deref(), Some(revision.as_str()));
    let sync = outcome.sync.expect("sync executed");
    assert_eq!(sync.succeeded(), 4);
    assert_eq!(
        applies(&h.cluster.calls().await),
        vec![
            "apply Namespace/finance",
            "apply ConfigMap/finance/settings",
            "apply Deployment/finance/web",
            "apply Service/finance/web",
        ]
    );

    let status = h.status.latest(&app.id()).await.expect("status published");
    assert_eq!(status.sync_status, SyncStatus::Synced);
    assert_eq!(status.health_status, HealthStatus::Healthy);
    assert_eq!(status.phase, AppPhase::Idle);
    assert_eq!(status.last_synced_revision.as_deref(), Some(revision.as_str()));
    assert!(status.last_sync_time.is_some());
    assert!(status.last_error.is_none());
    assert_eq!(status.resources.len(), 4);
    assert_eq!(status.operation.as_ref().map(|o| o.succeeded), Some(4));

    let deployment = h.cluster.object(&key("Deployment", "web")).await.unwrap();
    assert_eq!(
        deployment.pointer(&format!("/metadata/labels/{}", TRACKING_LABEL.replace('/', "~1"))),
        Some(&json!("gitops.finance-tracker"))
    );
}

#[tokio::test]
async fn second_cycle_without_changes_makes_no_calls() {
    let h = Harness::new();
    h.commit_app().await;
    let app = finance_app(true);
    let mut state = AppState::default();

    h.cycle(&app, &mut state, WorkItem::Tick).await;
    h.cluster.clear_calls().await;

    let outcome = h.cycle(&app, &mut state, WorkItem::Tick).await;
    assert_eq!(outcome.phase, AppPhase::InSync);
    assert!(!outcome.synced());
    assert!(h.cluster.calls().await.is_empty());

    let status = h.status.latest(&app.id()).await.unwrap();
    assert_eq!(status.sync_status, SyncStatus::Synced);
    assert_eq!(status.phase, AppPhase::InSync);
    assert!(status.resources.iter().all(|r| r.status == "InSync"));
    // The last operation stays visible after a quiet cycle
    assert_eq!(status.operation.as_ref().map(|o| o.succeeded), Some(3));
}

#[tokio::test]
async fn server_defaults_are_not_reported_as_drift() {
    let h = Harness::new();
    h.commit_app().await;
    let app = finance_app(false);
    let mut state = AppState::default();
    h.cycle(&app, &mut state, WorkItem::Tick).await;

    let service = h.cluster.object(&key("Service", "web")).await.unwrap();
    assert!(service.pointer("/spec/clusterIP").is_some());
    let deployment = h.cluster.object(&key("Deployment", "web")).await.unwrap();
    assert_eq!(deployment.pointer("/spec/replicas"), Some(&json!(1)));

    let report = h.reconciler.detect_drift(&app).await.unwrap();
    assert!(!report.has_drift(), "unexpected drift: {:?}", report.drifted);
}

#[tokio::test]
async fn new_commit_is_rolled_out() {
    let h = Harness::new();
    h.commit_app().await;
    let app = finance_app(false);
    let mut state = AppState::default();
    h.cycle(&app, &mut state, WorkItem::Tick).await;
    h.cluster.clear_calls().await;

    let updated = DEPLOYMENT_YAML.replace("nginx:1.25", "nginx:1.26");
    let revision = h
        .commit(&[
            ("config.yaml", CONFIG_YAML),
            ("deployment.yaml", updated.as_str()),
            ("service.yaml", SERVICE_YAML),
        ])
        .await;

    let outcome = h.cycle(&app, &mut state, WorkItem::Tick).await;
    assert_eq!(outcome.revision.as_deref(), Some(revision.as_str()));
    assert_eq!(
        applies(&h.cluster.calls().await),
        vec!["apply Deployment/finance/web"]
    );
    let record = &outcome.sync.unwrap().records[0];
    assert_eq!(record.action, SyncAction::Update);

    let deployment = h.cluster.object(&key("Deployment", "web")).await.unwrap();
    assert_eq!(
        deployment.pointer("/spec/template/spec/containers/0/image"),
        Some(&json!("nginx:1.26"))
    );
    assert_eq!(deployment.pointer("/metadata/generation"), Some(&json!(2)));
}

#[tokio::test]
async fn manual_policy_waits_for_sync_now() {
    let h = Harness::new();
    h.commit_app().await;
    let mut app = finance_app(false);
    app.policy.automated = false;
    app.policy.self_heal = false;
    let mut state = AppState::default();

    let outcome = h.cycle(&app, &mut state, WorkItem::Tick).await;
    assert_eq!(outcome.phase, AppPhase::Idle);
    assert!(!outcome.synced());
    assert!(h.cluster.calls().await.is_empty());
    let status = h.status.latest(&app.id()).await.unwrap();
    assert_eq!(status.sync_status, SyncStatus::OutOfSync);
    assert_eq!(status.health_status, HealthStatus::Degraded);

    let outcome = h.cycle(&app, &mut state, WorkItem::SyncNow).await;
    assert!(outcome.synced());
    assert_eq!(h.cluster.calls().await.len(), 3);
    let status = h.status.latest(&app.id()).await.unwrap();
    assert_eq!(status.sync_status, SyncStatus::Synced);
}

// ============================================================================
// Prune Tests
// ============================================================================

#[tokio::test]
async fn orphan_is_kept_when_prune_is_disabled() {
    let h = Harness::new();
    h.commit_app().await;
    let app = finance_app(false);
    let legacy = h.insert_managed(&app, "Service", "legacy-svc").await;
    let mut state = AppState::default();

    h.cycle(&app, &mut state, WorkItem::Tick).await;
    for _ in 0..2 {
        let outcome = h.cycle(&app, &mut state, WorkItem::SelfHeal).await;
        assert!(!outcome.synced());
    }

    let calls = h.cluster.calls().await;
    assert!(calls.iter().all(|c| !matches!(c, ClusterCall::Delete(_))));
    assert!(h.cluster.object(&legacy).await.is_some());

    let status = h.status.latest(&app.id()).await.unwrap();
    assert_eq!(status.sync_status, SyncStatus::OutOfSync);
    let orphan = status
        .resources
        .iter()
        .find(|r| r.name == "legacy-svc")
        .unwrap();
    assert_eq!(orphan.status, "Orphaned");
    assert!(status
        .warnings
        .iter()
        .any(|w| w.starts_with("PruneBlocked: Service/finance/legacy-svc")));
    // Orphans do not count toward application health
    assert_eq!(status.health_status, HealthStatus::Healthy);

    let report = h.reconciler.detect_drift(&app).await.unwrap();
    assert!(!report.has_drift());
}

#[tokio::test]
async fn orphan_is_deleted_when_prune_is_enabled() {
    let h = Harness::new();
    h.commit_app().await;
    let app = finance_app(true);
    let legacy = h.insert_managed(&app, "Service", "legacy-svc").await;
    let mut state = AppState::default();

    let outcome = h.cycle(&app, &mut state, WorkItem::Tick).await;
    let sync = outcome.sync.unwrap();
    assert!(sync
        .records
        .iter()
        .any(|r| r.key == legacy && r.action == SyncAction::Delete && r.outcome == OpOutcome::Succeeded));
    assert!(h.cluster.object(&legacy).await.is_none());
    assert_eq!(
        applies(&h.cluster.calls().await).last().map(String::as_str),
        Some("delete Service/finance/legacy-svc")
    );
}

#[tokio::test]
async fn removed_manifest_is_pruned_on_next_commit() {
    let h = Harness::new();
    h.commit_app().await;
    let app = finance_app(true);
    let mut state = AppState::default();
    h.cycle(&app, &mut state, WorkItem::Tick).await;

    h.commit(&[("config.yaml", CONFIG_YAML), ("deployment.yaml", DEPLOYMENT_YAML)])
        .await;
    h.cycle(&app, &mut state, WorkItem::Tick).await;

    assert!(h.cluster.object(&key("Service", "web")).await.is_none());
    assert!(h.cluster.object(&key("Deployment", "web")).await.is_some());
}

#[tokio::test]
async fn unmanaged_objects_are_never_touched() {
    let h = Harness::new();
    h.commit_app().await;
    let app = finance_app(true);
    let foreign = h
        .cluster
        .insert(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "kube-root-ca.crt", "namespace": "finance"}
        }))
        .await
        .unwrap();
    let mut state = AppState::default();

    h.cycle(&app, &mut state, WorkItem::Tick).await;
    assert!(h.cluster.object(&foreign).await.is_some());
    let status = h.status.latest(&app.id()).await.unwrap();
    assert!(status.resources.iter().all(|r| r.name != "kube-root-ca.crt"));
}

// ============================================================================
// Self-heal Tests
// ============================================================================

#[tokio::test]
async fn deleted_dependency_is_recreated_by_self_heal() {
    let h = Harness::new();
    h.commit(&[("config.yaml", CONFIG_YAML), ("deployment.yaml", DEPLOYMENT_YAML)])
        .await;
    let app = finance_app(false);
    let mut state = AppState::default();
    h.cycle(&app, &mut state, WorkItem::Tick).await;
    h.cluster.clear_calls().await;

    assert!(h.cluster.remove(&key("ConfigMap", "settings")).await);

    let report = h.reconciler.detect_drift(&app).await.unwrap();
    assert_eq!(report.drifted, vec![key("ConfigMap", "settings")]);
    // Detection is read-only
    assert!(h.cluster.calls().await.is_empty());

    let outcome = h.cycle(&app, &mut state, WorkItem::SelfHeal).await;
    assert!(outcome.synced());
    assert_eq!(
        applies(&h.cluster.calls().await),
        vec!["apply ConfigMap/finance/settings"]
    );
    let status = h.status.latest(&app.id()).await.unwrap();
    assert_eq!(status.sync_status, SyncStatus::Synced);
    assert_eq!(status.operation.as_ref().map(|o| o.trigger.as_str()), Some("SelfHeal"));
}

#[tokio::test]
async fn manual_edit_is_reverted_by_self_heal() {
    let h = Harness::new();
    h.commit_app().await;
    let app = finance_app(false);
    let mut state = AppState::default();
    h.cycle(&app, &mut state, WorkItem::Tick).await;

    let web = key("Deployment", "web");
    h.cluster
        .modify(&web, |object| {
            object["spec"]["template"]["spec"]["containers"][0]["image"] = json!("nginx:debug");
        })
        .await;

    let report = h.reconciler.detect_drift(&app).await.unwrap();
    assert_eq!(report.drifted, vec![web.clone()]);

    h.cycle(&app, &mut state, WorkItem::SelfHeal).await;
    let deployment = h.cluster.object(&web).await.unwrap();
    assert_eq!(
        deployment.pointer("/spec/template/spec/containers/0/image"),
        Some(&json!("nginx:1.25"))
    );
}

#[tokio::test]
async fn self_heal_is_ignored_when_disabled() {
    let h = Harness::new();
    h.commit_app().await;
    let mut app = finance_app(false);
    app.policy.self_heal = false;
    let mut state = AppState::default();
    h.cycle(&app, &mut state, WorkItem::Tick).await;
    h.cluster.remove(&key("ConfigMap", "settings")).await;
    h.cluster.clear_calls().await;

    let outcome = h.cycle(&app, &mut state, WorkItem::SelfHeal).await;
    assert!(!outcome.synced());
    assert!(h.cluster.calls().await.is_empty());
    let status = h.status.latest(&app.id()).await.unwrap();
    assert_eq!(status.sync_status, SyncStatus::OutOfSync);
}

// ============================================================================
// Failure Tests
// ============================================================================

#[tokio::test]
async fn forbidden_resource_blocks_only_its_dependents() {
    let h = Harness::new();
    h.commit_app().await;
    let app = finance_app(false);
    h.cluster
        .fail(key("ConfigMap", "settings"), InjectedFailure::Forbidden, None)
        .await;
    let mut state = AppState::default();

    let outcome = h.cycle(&app, &mut state, WorkItem::Tick).await;
    assert_eq!(outcome.phase, AppPhase::Failed);
    assert_eq!(outcome.retries, 0);
    assert!(state.last_cycle_failed);

    let sync = outcome.sync.unwrap();
    let outcome_of = |kind: &str, name: &str| {
        sync.records
            .iter()
            .find(|r| r.key == key(kind, name))
            .map(|r| r.outcome)
    };
    assert_eq!(outcome_of("ConfigMap", "settings"), Some(OpOutcome::Failed));
    assert_eq!(outcome_of("Deployment", "web"), Some(OpOutcome::Skipped));
    assert_eq!(outcome_of("Service", "web"), Some(OpOutcome::Succeeded));
    assert!(h.cluster.object(&key("Service", "web")).await.is_some());
    assert!(h.cluster.object(&key("Deployment", "web")).await.is_none());

    let status = h.status.latest(&app.id()).await.unwrap();
    assert_eq!(status.phase, AppPhase::Failed);
    assert_eq!(status.sync_status, SyncStatus::OutOfSync);
    let error = status.last_error.unwrap();
    assert!(error.contains("ConfigMap/finance/settings"), "{}", error);
    assert!(error.contains("forbidden"), "{}", error);
}

#[tokio::test]
async fn forbidden_resource_does_not_fail_independent_siblings() {
    let h = Harness::new();
    let features = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: features
data:
  BETA: "false"
"#;
    h.commit(&[
        ("config.yaml", CONFIG_YAML),
        ("features.yaml", features),
        ("service.yaml", SERVICE_YAML),
    ])
    .await;
    let app = finance_app(false);
    h.cluster
        .fail(key("ConfigMap", "features"), InjectedFailure::Forbidden, None)
        .await;
    let mut state = AppState::default();

    let outcome = h.cycle(&app, &mut state, WorkItem::Tick).await;
    assert_eq!(outcome.phase, AppPhase::Failed);
    assert!(h.cluster.object(&key("ConfigMap", "settings")).await.is_some());
    assert!(h.cluster.object(&key("Service", "web")).await.is_some());
    assert!(h.cluster.object(&key("ConfigMap", "features")).await.is_none());

    let status = h.status.latest(&app.id()).await.unwrap();
    let operation = status.operation.expect("operation summary");
    assert_eq!(operation.failed, 1);
    assert_eq!(operation.succeeded, 2);
    assert_eq!(operation.skipped, 0);
    assert_eq!(status.sync_status, SyncStatus::OutOfSync);
    let settings = status
        .resources
        .iter()
        .find(|r| r.name == "settings")
        .unwrap();
    assert_eq!(settings.status, "InSync");
    let features = status
        .resources
        .iter()
        .find(|r| r.name == "features")
        .unwrap();
    assert_eq!(features.status, "Missing");
}

#[tokio::test]
async fn blocked_self_heal_keeps_last_error() {
    let h = Harness::new();
    h.commit_app().await;
    let app = finance_app(false);
    h.cluster
        .fail(key("ConfigMap", "settings"), InjectedFailure::Forbidden, None)
        .await;
    let mut state = AppState::default();

    h.cycle(&app, &mut state, WorkItem::Tick).await;
    let failed = h.status.latest(&app.id()).await.unwrap();
    let error = failed.last_error.clone().expect("error recorded");

    let outcome = h.cycle(&app, &mut state, WorkItem::SelfHeal).await;
    assert!(!outcome.synced());
    let status = h.status.latest(&app.id()).await.unwrap();
    assert_eq!(status.phase, AppPhase::Idle);
    assert_eq!(status.sync_status, SyncStatus::OutOfSync);
    assert_eq!(status.last_error.as_deref(), Some(error.as_str()));

    h.cycle(&app, &mut state, WorkItem::Refresh).await;
    let status = h.status.latest(&app.id()).await.unwrap();
    assert_eq!(status.last_error.as_deref(), Some(error.as_str()));

    // Resolving the drift clears it
    h.cluster.clear_failures().await;
    h.cycle(&app, &mut state, WorkItem::Tick).await;
    let status = h.status.latest(&app.id()).await.unwrap();
    assert_eq!(status.sync_status, SyncStatus::Synced);
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn failed_cycle_waits_for_the_next_tick() {
    let h = Harness::new();
    h.commit_app().await;
    let app = finance_app(false);
    let settings = key("ConfigMap", "settings");
    h.cluster
        .fail(settings.clone(), InjectedFailure::Invalid, None)
        .await;
    let mut state = AppState::default();
    h.cycle(&app, &mut state, WorkItem::Tick).await;

    h.cluster.clear_failures().await;
    h.cluster.clear_calls().await;

    let outcome = h.cycle(&app, &mut state, WorkItem::SelfHeal).await;
    assert!(!outcome.synced());
    assert!(h.cluster.calls().await.is_empty());

    let outcome = h.cycle(&app, &mut state, WorkItem::Tick).await;
    assert!(outcome.synced());
    assert_eq!(outcome.phase, AppPhase::Idle);
    assert!(!state.last_cycle_failed);
    let status = h.status.latest(&app.id()).await.unwrap();
    assert_eq!(status.sync_status, SyncStatus::Synced);
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn conflict_is_retried_within_the_cycle() {
    let h = Harness::new();
    h.commit_app().await;
    let app = finance_app(false);
    let settings = key("ConfigMap", "settings");
    h.cluster
        .fail(settings.clone(), InjectedFailure::Conflict, Some(1))
        .await;
    let mut state = AppState::default();

    let outcome = h.cycle(&app, &mut state, WorkItem::Tick).await;
    assert_eq!(outcome.retries, 1);
    assert_eq!(outcome.phase, AppPhase::Idle);
    let sync = outcome.sync.unwrap();
    assert!(!sync.has_failures());
    let record = sync.records.iter().find(|r| r.key == settings).unwrap();
    assert_eq!(record.outcome, OpOutcome::Succeeded);
    assert_eq!(record.attempts, 2);

    // The dependent skipped in the first pass is applied by the retry
    assert!(h.cluster.object(&key("Deployment", "web")).await.is_some());
    let status = h.status.latest(&app.id()).await.unwrap();
    assert_eq!(status.sync_status, SyncStatus::Synced);
    assert_eq!(status.operation.as_ref().map(|o| o.retries), Some(1));
}

#[tokio::test]
async fn persistent_conflict_escalates_to_failed() {
    let h = Harness::new();
    h.commit_app().await;
    let app = finance_app(false);
    h.cluster
        .fail(key("ConfigMap", "settings"), InjectedFailure::Conflict, None)
        .await;
    let mut state = AppState::default();

    let outcome = h.cycle(&app, &mut state, WorkItem::Tick).await;
    assert_eq!(outcome.retries, app.policy.retry.limit);
    assert_eq!(outcome.phase, AppPhase::Failed);
    let status = h.status.latest(&app.id()).await.unwrap();
    assert!(status.last_error.unwrap().contains("conflict"));
}

#[tokio::test]
async fn source_outage_keeps_previous_status() {
    let h = Harness::new();
    let revision = h.commit_app().await;
    let app = finance_app(true);
    let mut state = AppState::default();
    h.cycle(&app, &mut state, WorkItem::Tick).await;
    h.cluster.clear_calls().await;

    h.source.set_unavailable(true);
    let outcome = h.cycle(&app, &mut state, WorkItem::Tick).await;
    assert_eq!(outcome.phase, AppPhase::Failed);
    assert!(outcome.revision.is_none());
    assert!(h.cluster.calls().await.is_empty());

    let status = h.status.latest(&app.id()).await.unwrap();
    assert_eq!(status.phase, AppPhase::Failed);
    assert_eq!(status.sync_status, SyncStatus::Synced);
    assert_eq!(status.revision.as_deref(), Some(revision.as_str()));
    assert_eq!(status.resources.len(), 3);
    assert!(status.last_error.unwrap().contains("Source unavailable"));

    // Recovery clears the error
    h.source.set_unavailable(false);
    h.cycle(&app, &mut state, WorkItem::Tick).await;
    let status = h.status.latest(&app.id()).await.unwrap();
    assert_eq!(status.phase, AppPhase::InSync);
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn unreachable_cluster_aborts_the_cycle() {
    let h = Harness::new();
    h.commit_app().await;
    let app = finance_app(true);
    let mut state = AppState::default();
    h.cluster.set_unreachable(true).await;

    let outcome = h.cycle(&app, &mut state, WorkItem::Tick).await;
    assert_eq!(outcome.phase, AppPhase::Failed);
    assert!(!outcome.synced());
    assert!(outcome.error.unwrap().contains("Cluster unreachable"));
    assert!(h.cluster.keys().await.is_empty());
}

#[tokio::test]
async fn invalid_manifest_does_not_block_siblings() {
    let h = Harness::new();
    h.commit(&[
        ("config.yaml", CONFIG_YAML),
        ("broken.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n"),
        ("service.yaml", SERVICE_YAML),
    ])
    .await;
    let app = finance_app(true);
    let legacy = h.insert_managed(&app, "ConfigMap", "legacy").await;
    let mut state = AppState::default();

    let outcome = h.cycle(&app, &mut state, WorkItem::Tick).await;
    assert!(outcome.synced());
    assert!(h.cluster.object(&key("ConfigMap", "settings")).await.is_some());
    assert!(h.cluster.object(&key("Service", "web")).await.is_some());
    // Prune waits until every manifest parses
    assert!(h.cluster.object(&legacy).await.is_some());

    let status = h.status.latest(&app.id()).await.unwrap();
    assert!(status
        .warnings
        .iter()
        .any(|w| w.starts_with("ManifestInvalid: apps/finance/broken.yaml")));
    assert!(status
        .warnings
        .iter()
        .any(|w| w.contains("kept while some manifests are invalid")));
}

#[tokio::test]
async fn dependency_cycle_fails_only_its_members() {
    let h = Harness::new();
    let first = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: first
  annotations:
    gitops.oso.sh/depends-on: ConfigMap/second
"#;
    let second = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: second
  annotations:
    gitops.oso.sh/depends-on: ConfigMap/first
"#;
    h.commit(&[("first.yaml", first), ("second.yaml", second), ("service.yaml", SERVICE_YAML)])
        .await;
    let app = finance_app(false);
    let mut state = AppState::default();

    let outcome = h.cycle(&app, &mut state, WorkItem::Tick).await;
    assert_eq!(outcome.phase, AppPhase::Failed);
    assert!(outcome.error.unwrap().contains("dependency cycle"));
    assert_eq!(
        applies(&h.cluster.calls().await),
        vec!["apply Service/finance/web"]
    );
}

#[tokio::test]
async fn sync_now_cancellation_stops_between_steps() {
    let h = Harness::new();
    h.commit_app().await;
    let app = finance_app(false);
    h.cluster.set_apply_delay(Duration::from_millis(200)).await;
    let mut state = AppState::default();
    let cancel = CancellationToken::new();

    let (outcome, _) = tokio::join!(
        h.reconciler
            .run_cycle(&app, &mut state, WorkItem::Tick, &cancel),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        }
    );

    let sync = outcome.sync.unwrap();
    assert!(sync.cancelled);
    assert!(sync.skipped() >= 1);
    assert!(sync
        .records
        .iter()
        .filter(|r| r.outcome == OpOutcome::Skipped)
        .all(|r| r.message.as_deref() == Some("sync cancelled")));
    assert!(h.cluster.object(&key("ConfigMap", "settings")).await.is_some());
    assert!(h.cluster.object(&key("Service", "web")).await.is_none());

    let status = h.status.latest(&app.id()).await.unwrap();
    assert!(status.operation.unwrap().cancelled);
    assert!(status.last_sync_time.is_none());
}

#[tokio::test]
async fn syncing_phase_is_published_before_operations() {
    let h = Harness::new();
    h.commit_app().await;
    let app = finance_app(false);
    let mut state = AppState::default();
    h.cycle(&app, &mut state, WorkItem::Tick).await;

    let phases: Vec<AppPhase> = h
        .status
        .history(&app.id())
        .await
        .into_iter()
        .map(|s| s.phase)
        .collect();
    assert_eq!(phases, vec![AppPhase::Syncing, AppPhase::Idle]);
}

// ============================================================================
// Scope Tests
// ============================================================================

const CLUSTER_ISSUER_YAML: &str = r#"
apiVersion: cert-manager.io/v1
kind: ClusterIssuer
metadata:
  name: letsencrypt
spec:
  acme:
    server: https://acme-v02.api.letsencrypt.org/directory
"#;

#[tokio::test]
async fn custom_cluster_scoped_kind_is_not_namespaced() {
    let h = Harness::new();
    h.cluster.serve_kind("ClusterIssuer", false).await;
    h.commit(&[("config.yaml", CONFIG_YAML), ("issuer.yaml", CLUSTER_ISSUER_YAML)])
        .await;
    let app = finance_app(true);
    let mut state = AppState::default();

    let outcome = h.cycle(&app, &mut state, WorkItem::Tick).await;
    assert_eq!(outcome.phase, AppPhase::Idle);
    let issuer = ResourceKey::cluster("ClusterIssuer", "letsencrypt");
    let stored = h.cluster.object(&issuer).await.expect("issuer created");
    assert!(stored.pointer("/metadata/namespace").is_none());
    assert!(h
        .cluster
        .calls()
        .await
        .iter()
        .all(|c| !matches!(c, ClusterCall::Delete(_))));

    let status = h.status.latest(&app.id()).await.unwrap();
    assert_eq!(status.sync_status, SyncStatus::Synced);
    let issuer_status = status
        .resources
        .iter()
        .find(|r| r.kind == "ClusterIssuer")
        .unwrap();
    assert!(issuer_status.namespace.is_none());

    // Later cycles neither re-apply nor prune it
    h.cluster.clear_calls().await;
    let outcome = h.cycle(&app, &mut state, WorkItem::Tick).await;
    assert_eq!(outcome.phase, AppPhase::InSync);
    assert!(h.cluster.calls().await.is_empty());
    assert!(h.cluster.object(&issuer).await.is_some());
}

// ============================================================================
// Cascade Delete Tests
// ============================================================================

#[tokio::test]
async fn cascade_delete_removes_managed_objects_only() {
    let h = Harness::new();
    h.commit_app().await;
    let app = finance_app(false);
    let mut state = AppState::default();
    h.cycle(&app, &mut state, WorkItem::Tick).await;
    let foreign = h
        .cluster
        .insert(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "unrelated", "namespace": "finance"}
        }))
        .await
        .unwrap();

    let result = h.reconciler.cascade_delete(&app).await.unwrap();
    assert_eq!(result.succeeded(), 3);
    assert!(!result.has_failures());
    assert_eq!(h.cluster.keys().await, vec![foreign]);

    // Dependents go first
    let calls = applies(&h.cluster.calls().await);
    let deletes: Vec<&String> = calls.iter().filter(|c| c.starts_with("delete")).collect();
    assert_eq!(
        deletes,
        vec![
            "delete Service/finance/web",
            "delete Deployment/finance/web",
            "delete ConfigMap/finance/settings",
        ]
    );
}

#[tokio::test]
async fn cascade_delete_works_while_source_is_down() {
    let h = Harness::new();
    h.commit_app().await;
    let app = finance_app(false);
    let mut state = AppState::default();
    h.cycle(&app, &mut state, WorkItem::Tick).await;

    h.source.set_unavailable(true);
    let result = h.reconciler.cascade_delete(&app).await.unwrap();
    assert_eq!(result.succeeded(), 3);
    assert!(h.cluster.keys().await.is_empty());
}
