//! GitOps Sync Operator
//!
//! Main entry point for the operator. Sets up the Kubernetes client, builds
//! the reconciliation pipeline, starts the registry supervisor and the
//! Application controller, and serves the HTTP API.

use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gitops_sync_operator::{
    adapters::{
        ClusterClient, FanoutSink, GitRepository, KubeCluster, KubeStatusSink, ManifestStore,
        StatusSink, WebhookNotifier,
    },
    config::{LogFormat, OperatorConfig},
    controllers::{self, supervisor, Context},
    diff::{CapabilityTable, DiffEngine},
    metrics,
    reconcilers::application::ApplicationReconciler,
    registry::StatusBoard,
    server,
    sync::SyncExecutor,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::parse();

    // Initialize tracing
    init_tracing(config.log_format);

    config.validate()?;
    info!("Starting GitOps Sync Operator");

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    // Reconciliation pipeline
    let capabilities = Arc::new(CapabilityTable::builtin());
    let source = Arc::new(GitRepository::new(config.git_cache_dir.clone()));
    let cluster: Arc<dyn ClusterClient> = Arc::new(KubeCluster::new(
        client.clone(),
        config.field_manager.clone(),
        config.force_conflicts,
    ));

    let board = Arc::new(StatusBoard::new());
    let mut sinks = FanoutSink::new()
        .with(board.clone())
        .with(Arc::new(KubeStatusSink::new(
            client.clone(),
            config.field_manager.clone(),
        )));
    if let Some(url) = &config.notify_webhook_url {
        info!(url = %url, "Status notifications enabled");
        sinks = sinks.with(Arc::new(WebhookNotifier::new(url.clone())));
    }
    let status: Arc<dyn StatusSink> = Arc::new(sinks);

    let reconciler = Arc::new(ApplicationReconciler::new(
        ManifestStore::new(
            source,
            cluster.clone(),
            capabilities.clone(),
            config.max_manifest_bytes,
        ),
        cluster.clone(),
        DiffEngine::new(capabilities),
        SyncExecutor::new(cluster, config.apply_timeout()),
        status,
    ));

    // Registry supervisor owns the per-application workers
    let shutdown = CancellationToken::new();
    let (registry, supervisor_handle) = supervisor::spawn(
        reconciler.clone(),
        board,
        config.resync_interval(),
        shutdown.clone(),
    );

    // Start HTTP server
    let server_handle = tokio::spawn(server::serve(config.http_port, registry.clone()));
    info!("HTTP server starting on port {}", config.http_port);

    // Create shared context
    let context = Arc::new(Context::new(
        client.clone(),
        registry,
        reconciler,
        config.field_manager.clone(),
    ));
    let application_controller = controllers::run_application_controller(client, context);

    // Handle graceful shutdown
    tokio::select! {
        _ = application_controller => {
            error!("Application controller exited unexpectedly");
        }
        result = server_handle => {
            error!(result = ?result, "HTTP server exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping operator");
        }
    }

    metrics::OPERATOR_HEALTH.set(0.0);
    shutdown.cancel();
    if let Err(e) = supervisor_handle.await {
        error!(error = %e, "Registry supervisor failed");
    }

    info!("GitOps Sync Operator stopped");
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
