//! Integration tests for Application validation
//!
//! These tests verify that Application specs are accepted or rejected as
//! expected and converted into the registry record.

use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use gitops_sync_operator::crd::{
    Application, ApplicationSpec, DestinationSpec, RetrySpec, SourceSpec, SyncPolicySpec,
    IN_CLUSTER_SERVER,
};
use gitops_sync_operator::reconcilers::application::{self as app_reconciler, WorkItem};

// ============================================================================
// Test Helpers
// ============================================================================

fn valid_source() -> SourceSpec {
    SourceSpec {
        repo_url: "https://github.com/example/deploy.git".to_string(),
        path: "apps/finance".to_string(),
        target_revision: "main".to_string(),
    }
}

fn valid_destination() -> DestinationSpec {
    DestinationSpec {
        server: IN_CLUSTER_SERVER.to_string(),
        namespace: "finance".to_string(),
    }
}

fn valid_spec() -> ApplicationSpec {
    ApplicationSpec {
        source: valid_source(),
        destination: valid_destination(),
        sync_policy: SyncPolicySpec {
            automated: true,
            prune: true,
            self_heal: true,
            sync_interval_seconds: 30,
            retry: RetrySpec::default(),
        },
        cascade_delete: false,
    }
}

fn default_metadata(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some("gitops".to_string()),
        generation: Some(4),
        ..Default::default()
    }
}

fn create_application(spec: ApplicationSpec) -> Application {
    Application {
        metadata: default_metadata("finance-tracker"),
        spec,
        status: None,
    }
}

fn validation_error(spec: ApplicationSpec) -> String {
    let app = create_application(spec);
    match app_reconciler::validate(&app) {
        Ok(()) => panic!("Validation passed unexpectedly"),
        Err(e) => e.to_string(),
    }
}

// ============================================================================
// Validation Tests
// ============================================================================

#[test]
fn application_valid_spec_passes_validation() {
    let app = create_application(valid_spec());
    let result = app_reconciler::validate(&app);
    if let Err(e) = &result {
        panic!("Validation failed unexpectedly: {:?}", e);
    }
    assert!(result.is_ok());
}

#[test]
fn application_empty_repo_url_fails_validation() {
    let mut spec = valid_spec();
    spec.source.repo_url = "  ".to_string();
    assert!(validation_error(spec).contains("repoURL"));
}

#[test]
fn application_unsupported_repo_scheme_fails_validation() {
    let mut spec = valid_spec();
    spec.source.repo_url = "svn://example.com/deploy".to_string();
    assert!(validation_error(spec).contains("repoURL"));
}

#[test]
fn application_accepted_repo_url_forms_pass_validation() {
    for url in [
        "https://github.com/example/deploy.git",
        "ssh://git@github.com/example/deploy.git",
        "git@github.com:example/deploy.git",
        "file:///srv/git/deploy",
    ] {
        let mut spec = valid_spec();
        spec.source.repo_url = url.to_string();
        let app = create_application(spec);
        assert!(
            app_reconciler::validate(&app).is_ok(),
            "URL '{}' should be valid",
            url
        );
    }
}

#[test]
fn application_path_escaping_repository_fails_validation() {
    let mut spec = valid_spec();
    spec.source.path = "apps/../../etc".to_string();
    assert!(validation_error(spec).contains("source.path"));
}

#[test]
fn application_blank_target_revision_fails_validation() {
    let mut spec = valid_spec();
    spec.source.target_revision = "".to_string();
    assert!(validation_error(spec).contains("targetRevision"));

    let mut spec = valid_spec();
    spec.source.target_revision = "main branch".to_string();
    assert!(validation_error(spec).contains("targetRevision"));
}

#[test]
fn application_external_cluster_fails_validation() {
    let mut spec = valid_spec();
    spec.destination.server = "https://prod.example.com:6443".to_string();
    assert!(validation_error(spec).contains("destination.server"));
}

#[test]
fn application_in_cluster_server_with_trailing_slash_passes_validation() {
    let mut spec = valid_spec();
    spec.destination.server = format!("{}/", IN_CLUSTER_SERVER);
    assert!(app_reconciler::validate(&create_application(spec)).is_ok());
}

#[test]
fn application_invalid_namespace_fails_validation() {
    for namespace in ["", "Finance", "-finance", "finance_tracker"] {
        let mut spec = valid_spec();
        spec.destination.namespace = namespace.to_string();
        assert!(
            validation_error(spec).contains("destination.namespace"),
            "namespace '{}' should be rejected",
            namespace
        );
    }
}

#[test]
fn application_self_heal_without_automated_fails_validation() {
    let mut spec = valid_spec();
    spec.sync_policy.automated = false;
    assert!(validation_error(spec).contains("selfHeal"));
}

#[test]
fn application_manual_policy_passes_validation() {
    let mut spec = valid_spec();
    spec.sync_policy.automated = false;
    spec.sync_policy.self_heal = false;
    spec.sync_policy.prune = false;
    assert!(app_reconciler::validate(&create_application(spec)).is_ok());
}

#[test]
fn application_short_sync_interval_fails_validation() {
    let mut spec = valid_spec();
    spec.sync_policy.sync_interval_seconds = 1;
    assert!(validation_error(spec).contains("syncIntervalSeconds"));
}

#[test]
fn application_inverted_retry_backoff_fails_validation() {
    let mut spec = valid_spec();
    spec.sync_policy.retry.backoff_seconds = 30;
    spec.sync_policy.retry.max_backoff_seconds = 10;
    assert!(validation_error(spec).contains("maxBackoffSeconds"));

    let mut spec = valid_spec();
    spec.sync_policy.retry.backoff_seconds = 0;
    assert!(validation_error(spec).contains("backoffSeconds"));
}

#[test]
fn application_name_too_long_to_track_fails_validation() {
    let mut app = create_application(valid_spec());
    app.metadata.name = Some("a".repeat(60));
    let err = app_reconciler::validate(&app).unwrap_err();
    assert!(err.to_string().contains("too long"));
}

// ============================================================================
// Conversion Tests
// ============================================================================

#[test]
fn application_converts_to_managed_app() {
    let mut spec = valid_spec();
    spec.cascade_delete = true;
    spec.sync_policy.retry = RetrySpec {
        limit: 5,
        backoff_seconds: 1,
        max_backoff_seconds: 20,
    };
    let app = create_application(spec);

    let managed = app_reconciler::to_managed_app(&app).unwrap();
    assert_eq!(managed.id(), "gitops/finance-tracker");
    assert_eq!(managed.tracking_value(), "gitops.finance-tracker");
    assert_eq!(managed.generation, Some(4));
    assert_eq!(managed.source.target_revision, "main");
    assert_eq!(managed.destination.namespace, "finance");
    assert!(managed.policy.automated && managed.policy.prune && managed.policy.self_heal);
    assert_eq!(managed.policy.sync_interval, Duration::from_secs(30));
    assert_eq!(managed.policy.retry.limit, 5);
    assert_eq!(managed.policy.retry.max_backoff, Duration::from_secs(20));
    assert!(managed.cascade_delete);
}

#[test]
fn application_conversion_rejects_invalid_spec() {
    let mut spec = valid_spec();
    spec.destination.namespace = "".to_string();
    assert!(app_reconciler::to_managed_app(&create_application(spec)).is_err());
}

#[test]
fn work_items_order_by_strength() {
    assert!(WorkItem::SyncNow > WorkItem::SelfHeal);
    assert!(WorkItem::SelfHeal > WorkItem::Tick);
    assert!(WorkItem::Tick > WorkItem::Refresh);
}
