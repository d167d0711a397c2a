//! Application controller
//!
//! Watches Application resources and keeps the registry in step with them.
//! The reconciliation cycles themselves run in the per-application workers.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::{
    api::{ListParams, Patch, PatchParams},
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        watcher::Config as WatcherConfig,
    },
    Api, Client, ResourceExt,
};
use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::controllers::Context;
use crate::crd::{AppPhase, Application, SyncStatus};
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::application as app_reconciler;

/// Finalizer name for Application resources
pub const FINALIZER_NAME: &str = "gitops.oso.sh/resources-finalizer";

/// Requeue period for registered applications
const REQUEUE: Duration = Duration::from_secs(300);

/// Run the Application controller
pub async fn run(client: Client, context: Arc<Context>) {
    let api: Api<Application> = Api::all(client.clone());

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("Application CRD not installed: {}", e);
        return;
    }

    info!("Starting Application controller");

    Controller::new(api, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    info!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or("default"),
                        "Reconciled Application"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation error");
                    metrics::RECONCILIATION_ERRORS
                        .with_label_values(&["Application"])
                        .inc();
                }
            }
        })
        .await;
}

/// Main reconciliation function
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<Application>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&["Application"])
        .start_timer();
    metrics::RECONCILIATIONS
        .with_label_values(&["Application"])
        .inc();

    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Application> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, FINALIZER_NAME, obj, |event| async {
        match event {
            FinalizerEvent::Apply(app) => apply(app, ctx.clone()).await,
            FinalizerEvent::Cleanup(app) => cleanup(app, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

/// Register or update the application
async fn apply(app: Arc<Application>, ctx: Arc<Context>) -> Result<Action> {
    let name = app.name_any();
    let namespace = app.namespace().unwrap_or_else(|| "default".to_string());

    info!(
        name = %name,
        namespace = %namespace,
        generation = app.metadata.generation.unwrap_or(0),
        "Reconciling Application"
    );

    let managed = match app_reconciler::to_managed_app(&app) {
        Ok(managed) => managed,
        Err(e) => {
            warn!(error = %e, "Validation failed");
            // Stop syncing an application whose spec became invalid
            ctx.registry.remove(&format!("{}/{}", namespace, name)).await?;
            update_status_invalid(&app, &ctx, &namespace, &e.to_string()).await?;
            return Ok(Action::requeue(REQUEUE));
        }
    };

    ctx.registry.upsert(managed).await?;
    Ok(Action::requeue(REQUEUE))
}

/// Unregister the application and delete its resources when asked to
async fn cleanup(app: Arc<Application>, ctx: Arc<Context>) -> Result<Action> {
    let name = app.name_any();
    let namespace = app.namespace().unwrap_or_else(|| "default".to_string());
    info!(name = %name, "Cleaning up Application");

    ctx.registry
        .remove(&format!("{}/{}", namespace, name))
        .await?;

    if app.spec.cascade_delete {
        match app_reconciler::to_managed_app(&app) {
            Ok(managed) => {
                let result = ctx.reconciler.cascade_delete(&managed).await?;
                if let Some(failure) = result.first_failure() {
                    return Err(Error::CleanupIncomplete(format!(
                        "{} of {} deletes failed, first {}: {}",
                        result.failed(),
                        result.records.len(),
                        failure.key,
                        failure.message.as_deref().unwrap_or("failed")
                    )));
                }
            }
            Err(e) => warn!(error = %e, "Invalid spec, skipping cascade delete"),
        }
    }

    metrics::CLEANUPS.with_label_values(&["Application"]).inc();

    Ok(Action::await_change())
}

/// Report a spec that cannot be registered
async fn update_status_invalid(
    app: &Application,
    ctx: &Context,
    namespace: &str,
    message: &str,
) -> Result<()> {
    let api: Api<Application> = Api::namespaced(ctx.client.clone(), namespace);
    let status = json!({
        "status": {
            "syncStatus": SyncStatus::Unknown,
            "phase": AppPhase::Failed,
            "lastError": message,
            "observedGeneration": app.metadata.generation,
        }
    });
    api.patch_status(
        &app.name_any(),
        &PatchParams::apply(&ctx.field_manager),
        &Patch::Merge(status),
    )
    .await?;
    Ok(())
}

/// Error policy for the controller
fn error_policy(obj: Arc<Application>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    error!(
        name = %name,
        error = %error,
        "Reconciliation failed, scheduling retry"
    );

    let requeue_duration = match error {
        Error::Kube(_) => Duration::from_secs(30),
        Error::Config(_) | Error::Validation(_) => Duration::from_secs(300),
        Error::ShuttingDown => Duration::from_secs(300),
        _ => Duration::from_secs(30),
    };

    Action::requeue(requeue_duration)
}
