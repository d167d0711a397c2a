//! Application registry
//!
//! Registered applications live in an [`ArcSwap`] snapshot: readers load the
//! current map without locking, and only the supervisor task replaces it.
//! Every mutation goes through [`RegistryHandle`] as a [`RegistryCommand`] on
//! the supervisor's queue.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::adapters::StatusSink;
use crate::crd::ApplicationStatus;
use crate::error::{Error, Result};
use crate::model::ManagedApp;

/// Registered applications keyed by `namespace/name`
pub type AppMap = HashMap<String, Arc<ManagedApp>>;

/// Mutations handled by the supervisor
#[derive(Debug)]
pub enum RegistryCommand {
    /// Register an application or replace its registration
    Upsert(ManagedApp),
    /// Unregister an application and stop its tasks
    Remove {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    /// Queue an explicit sync
    SyncNow {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    /// A repository received new commits
    SourceChanged {
        repo_url: String,
        reply: oneshot::Sender<usize>,
    },
}

/// Cloneable access to the registry
#[derive(Clone)]
pub struct RegistryHandle {
    apps: Arc<ArcSwap<AppMap>>,
    board: Arc<StatusBoard>,
    tx: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    pub(crate) fn new(
        apps: Arc<ArcSwap<AppMap>>,
        board: Arc<StatusBoard>,
        tx: mpsc::Sender<RegistryCommand>,
    ) -> Self {
        Self { apps, board, tx }
    }

    async fn send(&self, command: RegistryCommand) -> Result<()> {
        self.tx.send(command).await.map_err(|_| Error::ShuttingDown)
    }

    pub async fn upsert(&self, app: ManagedApp) -> Result<()> {
        self.send(RegistryCommand::Upsert(app)).await
    }

    /// Unregister `id`; resolves once its worker has stopped
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(RegistryCommand::Remove {
            id: id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// Queue a sync for `id`; false when the application is unknown
    pub async fn sync_now(&self, id: &str) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(RegistryCommand::SyncNow {
            id: id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// Queue a cycle for every application tracking `repo_url`
    pub async fn notify_source(&self, repo_url: &str) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(RegistryCommand::SourceChanged {
            repo_url: repo_url.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ManagedApp>> {
        self.apps.load().get(id).cloned()
    }

    pub fn snapshot(&self) -> Arc<AppMap> {
        self.apps.load_full()
    }

    /// Applications named `name`, optionally restricted to one namespace
    pub fn find_by_name(&self, name: &str, namespace: Option<&str>) -> Vec<Arc<ManagedApp>> {
        let mut found: Vec<Arc<ManagedApp>> = self
            .apps
            .load()
            .values()
            .filter(|app| app.name == name)
            .filter(|app| namespace.map_or(true, |ns| app.namespace == ns))
            .cloned()
            .collect();
        found.sort_by_key(|app| app.id());
        found
    }

    pub fn board(&self) -> &Arc<StatusBoard> {
        &self.board
    }
}

/// Latest published status per application
#[derive(Default)]
pub struct StatusBoard {
    statuses: ArcSwap<HashMap<String, ApplicationStatus>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, id: &str, status: &ApplicationStatus) {
        self.statuses.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(id.to_string(), status.clone());
            next
        });
    }

    pub fn get(&self, id: &str) -> Option<ApplicationStatus> {
        self.statuses.load().get(id).cloned()
    }

    pub fn all(&self) -> Arc<HashMap<String, ApplicationStatus>> {
        self.statuses.load_full()
    }

    pub fn remove(&self, id: &str) {
        self.statuses.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(id);
            next
        });
    }
}

#[async_trait]
impl StatusSink for StatusBoard {
    async fn publish(&self, app: &ManagedApp, status: &ApplicationStatus) -> Result<()> {
        self.record(&app.id(), status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::SyncStatus;

    #[test]
    fn test_status_board_record_and_remove() {
        let board = StatusBoard::new();
        let status = ApplicationStatus {
            sync_status: SyncStatus::Synced,
            ..Default::default()
        };
        board.record("apps/web", &status);
        assert_eq!(board.get("apps/web").map(|s| s.sync_status), Some(SyncStatus::Synced));
        assert_eq!(board.all().len(), 1);

        board.remove("apps/web");
        assert!(board.get("apps/web").is_none());
    }

    #[tokio::test]
    async fn test_handle_reports_shutdown_when_supervisor_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = RegistryHandle::new(
            Arc::new(ArcSwap::from_pointee(AppMap::new())),
            Arc::new(StatusBoard::new()),
            tx,
        );
        assert!(matches!(handle.sync_now("a/b").await, Err(Error::ShuttingDown)));
    }
}
