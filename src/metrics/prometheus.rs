//! Prometheus metrics definitions

use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};

use crate::crd::{HealthStatus, SyncStatus};

lazy_static::lazy_static! {
    /// Total number of reconciliations
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "gitops_sync_operator_reconciliations_total",
        "Total number of reconciliations",
        &["kind"]
    ).unwrap();

    /// Total number of reconciliation errors
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "gitops_sync_operator_reconciliation_errors_total",
        "Total number of reconciliation errors",
        &["kind"]
    ).unwrap();

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "gitops_sync_operator_reconcile_duration_seconds",
        "Duration of reconciliations in seconds",
        &["kind"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    /// Application cycles by trigger
    pub static ref CYCLES_TOTAL: CounterVec = register_counter_vec!(
        "gitops_sync_operator_cycles_total",
        "Total number of application cycles by trigger and final phase",
        &["trigger", "phase"]
    ).unwrap();

    /// Application cycle duration histogram
    pub static ref CYCLE_DURATION: HistogramVec = register_histogram_vec!(
        "gitops_sync_operator_cycle_duration_seconds",
        "Duration of application cycles",
        &["namespace", "name"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).unwrap();

    /// Cycles aborted by an application-level error
    pub static ref CYCLE_FAILURES: CounterVec = register_counter_vec!(
        "gitops_sync_operator_cycle_failures_total",
        "Application cycles aborted by an error",
        &["namespace", "name", "reason"]
    ).unwrap();

    /// Executed sync operations
    pub static ref SYNC_OPERATIONS: CounterVec = register_counter_vec!(
        "gitops_sync_operator_sync_operations_total",
        "Total number of sync operations by action and outcome",
        &["action", "outcome"]
    ).unwrap();

    /// Sync operation duration histogram
    pub static ref SYNC_OPERATION_DURATION: HistogramVec = register_histogram_vec!(
        "gitops_sync_operator_sync_operation_duration_seconds",
        "Duration of single apply and delete calls",
        &["action"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    /// Conflict retries
    pub static ref SYNC_RETRIES: CounterVec = register_counter_vec!(
        "gitops_sync_operator_sync_retries_total",
        "Sync retries after conflicting writes",
        &["namespace", "name"]
    ).unwrap();

    /// Drift detected by the drift watcher
    pub static ref DRIFT_DETECTIONS: CounterVec = register_counter_vec!(
        "gitops_sync_operator_drift_detections_total",
        "Drift detected between desired and live state",
        &["namespace", "name"]
    ).unwrap();

    /// Current sync status (1 for the active status)
    pub static ref APP_SYNC_STATUS: GaugeVec = register_gauge_vec!(
        "gitops_sync_operator_app_sync_status",
        "Sync status per application (1 = current status)",
        &["namespace", "name", "status"]
    ).unwrap();

    /// Current health status (1 for the active status)
    pub static ref APP_HEALTH_STATUS: GaugeVec = register_gauge_vec!(
        "gitops_sync_operator_app_health_status",
        "Health status per application (1 = current status)",
        &["namespace", "name", "status"]
    ).unwrap();

    /// Total number of cleanup operations
    pub static ref CLEANUPS: CounterVec = register_counter_vec!(
        "gitops_sync_operator_cleanups_total",
        "Total number of cleanup operations",
        &["kind"]
    ).unwrap();

    /// Applications currently registered
    pub static ref MANAGED_APPLICATIONS: Gauge = register_gauge!(
        "gitops_sync_operator_managed_applications",
        "Number of registered applications"
    ).unwrap();

    /// Operator health (1 = healthy, 0 = unhealthy)
    pub static ref OPERATOR_HEALTH: Gauge = register_gauge!(
        "gitops_sync_operator_health",
        "Operator health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();
}

const SYNC_STATUSES: &[(SyncStatus, &str)] = &[
    (SyncStatus::Synced, "Synced"),
    (SyncStatus::OutOfSync, "OutOfSync"),
    (SyncStatus::Unknown, "Unknown"),
];

const HEALTH_STATUSES: &[(HealthStatus, &str)] = &[
    (HealthStatus::Healthy, "Healthy"),
    (HealthStatus::Progressing, "Progressing"),
    (HealthStatus::Degraded, "Degraded"),
    (HealthStatus::Unknown, "Unknown"),
];

/// Set the status gauges of one application
pub fn record_app_status(namespace: &str, name: &str, sync: SyncStatus, health: HealthStatus) {
    for (status, label) in SYNC_STATUSES {
        let value = if *status == sync { 1.0 } else { 0.0 };
        APP_SYNC_STATUS
            .with_label_values(&[namespace, name, label])
            .set(value);
    }
    for (status, label) in HEALTH_STATUSES {
        let value = if *status == health { 1.0 } else { 0.0 };
        APP_HEALTH_STATUS
            .with_label_values(&[namespace, name, label])
            .set(value);
    }
}

/// Drop the status gauges of a removed application
pub fn forget_app(namespace: &str, name: &str) {
    for (_, label) in SYNC_STATUSES {
        let _ = APP_SYNC_STATUS.remove_label_values(&[namespace, name, label]);
    }
    for (_, label) in HEALTH_STATUSES {
        let _ = APP_HEALTH_STATUS.remove_label_values(&[namespace, name, label]);
    }
}

/// Text exposition of every registered metric
pub fn encode() -> Result<(Vec<u8>, String), prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
