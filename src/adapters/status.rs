//! Status sinks: where the projected application status is published

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::{
    api::{Patch, PatchParams},
    Api, Client,
};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::crd::{AppPhase, Application, ApplicationStatus, HealthStatus, SyncStatus};
use crate::error::Result;
use crate::model::ManagedApp;

/// Receives the status projection at the end of every cycle
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish(&self, app: &ManagedApp, status: &ApplicationStatus) -> Result<()>;
}

/// Writes to the Application `status` subresource
pub struct KubeStatusSink {
    client: Client,
    field_manager: String,
}

impl KubeStatusSink {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }
}

#[async_trait]
impl StatusSink for KubeStatusSink {
    async fn publish(&self, app: &ManagedApp, status: &ApplicationStatus) -> Result<()> {
        let api: Api<Application> = Api::namespaced(self.client.clone(), &app.namespace);
        let patch = json!({ "status": status });
        api.patch_status(
            &app.name,
            &PatchParams::apply(&self.field_manager),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

/// Posts status changes to an HTTP endpoint.
///
/// Only changes of sync status, health, phase or revision are sent.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    last_sent: Mutex<HashMap<String, (SyncStatus, HealthStatus, AppPhase, Option<String>)>>,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            last_sent: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl StatusSink for WebhookNotifier {
    async fn publish(&self, app: &ManagedApp, status: &ApplicationStatus) -> Result<()> {
        let fingerprint = (
            status.sync_status,
            status.health_status,
            status.phase,
            status.revision.clone(),
        );
        {
            let last = self.last_sent.lock().await;
            if last.get(&app.id()) == Some(&fingerprint) {
                return Ok(());
            }
        }

        let body = json!({
            "application": app.name,
            "namespace": app.namespace,
            "syncStatus": status.sync_status,
            "healthStatus": status.health_status,
            "phase": status.phase,
            "revision": status.revision,
            "lastError": status.last_error,
        });
        self.client
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        debug!(app = %app.name, url = %self.url, "Sent status notification");
        self.last_sent.lock().await.insert(app.id(), fingerprint);
        Ok(())
    }
}

/// Keeps every published status, newest last
#[derive(Default)]
pub struct MemoryStatusSink {
    history: Mutex<HashMap<String, Vec<ApplicationStatus>>>,
}

impl MemoryStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn latest(&self, app_id: &str) -> Option<ApplicationStatus> {
        self.history
            .lock()
            .await
            .get(app_id)
            .and_then(|h| h.last().cloned())
    }

    pub async fn history(&self, app_id: &str) -> Vec<ApplicationStatus> {
        self.history
            .lock()
            .await
            .get(app_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl StatusSink for MemoryStatusSink {
    async fn publish(&self, app: &ManagedApp, status: &ApplicationStatus) -> Result<()> {
        self.history
            .lock()
            .await
            .entry(app.id())
            .or_default()
            .push(status.clone());
        Ok(())
    }
}

/// Publishes to several sinks; a failing sink does not stop the others
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn StatusSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl StatusSink for FanoutSink {
    async fn publish(&self, app: &ManagedApp, status: &ApplicationStatus) -> Result<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.publish(app, status).await {
                warn!(app = %app.name, error = %e, "Failed to publish status");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
