//! Drift watcher
//!
//! Compares desired and live state every sync interval and feeds the
//! application's worker. It never writes to the cluster.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::model::ManagedApp;
use crate::reconcilers::application::{ApplicationReconciler, WorkItem};

/// Watch `app` until `shutdown` is cancelled or its worker goes away
pub async fn run(
    app: Arc<ManagedApp>,
    reconciler: Arc<ApplicationReconciler>,
    tx: mpsc::Sender<WorkItem>,
    shutdown: CancellationToken,
) {
    let period = app.policy.sync_interval;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }

        let report = match reconciler.detect_drift(&app).await {
            Ok(report) => report,
            Err(e) => {
                warn!(app = %app.id(), error = %e, "Drift check failed");
                continue;
            }
        };
        if !report.has_drift() {
            debug!(app = %app.id(), revision = %report.revision, "No drift");
            continue;
        }

        metrics::DRIFT_DETECTIONS
            .with_label_values(&[&app.namespace, &app.name])
            .inc();
        let item = if app.policy.automated && app.policy.self_heal {
            WorkItem::SelfHeal
        } else {
            WorkItem::Refresh
        };
        info!(
            app = %app.id(),
            revision = %report.revision,
            drifted = report.drifted.len(),
            trigger = item.as_str(),
            "Drift detected"
        );
        match tx.try_send(item) {
            Ok(()) => {}
            // The queue already holds work that covers this
            Err(TrySendError::Full(_)) => debug!(app = %app.id(), "Worker queue full"),
            Err(TrySendError::Closed(_)) => break,
        }
    }
    debug!(app = %app.id(), "Drift watcher stopped");
}
