//! Registry supervisor
//!
//! The only writer of the application registry. It drains
//! [`RegistryCommand`]s, swaps in new registry snapshots and owns the worker
//! and drift watcher tasks of every registered application.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{drift_watcher, worker};
use crate::metrics;
use crate::model::ManagedApp;
use crate::reconcilers::application::{AppState, ApplicationReconciler, WorkItem};
use crate::registry::{AppMap, RegistryCommand, RegistryHandle, StatusBoard};

const COMMAND_CAPACITY: usize = 64;

struct Running {
    app: Arc<ManagedApp>,
    tx: mpsc::Sender<WorkItem>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
    watcher: JoinHandle<()>,
}

impl Running {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.worker.await {
            warn!(app = %self.app.id(), error = %e, "Worker task failed");
        }
        if let Err(e) = self.watcher.await {
            warn!(app = %self.app.id(), error = %e, "Drift watcher task failed");
        }
    }
}

/// Start the supervisor; statuses are recorded on `board`
pub fn spawn(
    reconciler: Arc<ApplicationReconciler>,
    board: Arc<StatusBoard>,
    resync: Duration,
    shutdown: CancellationToken,
) -> (RegistryHandle, JoinHandle<()>) {
    let apps = Arc::new(ArcSwap::from_pointee(AppMap::new()));
    let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
    let handle = RegistryHandle::new(apps.clone(), board.clone(), tx);

    let supervisor = Supervisor {
        apps,
        board,
        reconciler,
        resync,
        shutdown,
        running: HashMap::new(),
    };
    (handle, tokio::spawn(supervisor.run(rx)))
}

struct Supervisor {
    apps: Arc<ArcSwap<AppMap>>,
    board: Arc<StatusBoard>,
    reconciler: Arc<ApplicationReconciler>,
    resync: Duration,
    shutdown: CancellationToken,
    running: HashMap<String, Running>,
}

impl Supervisor {
    async fn run(mut self, mut rx: mpsc::Receiver<RegistryCommand>) {
        info!("Registry supervisor started");
        loop {
            let command = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.handle(command).await;
        }

        for (_, running) in self.running.drain() {
            running.stop().await;
        }
        info!("Registry supervisor stopped");
    }

    async fn handle(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::Upsert(app) => self.upsert(app).await,
            RegistryCommand::Remove { id, reply } => {
                let removed = self.remove(&id).await;
                let _ = reply.send(removed);
            }
            RegistryCommand::SyncNow { id, reply } => {
                let queued = match self.running.get(&id) {
                    Some(running) => running.tx.send(WorkItem::SyncNow).await.is_ok(),
                    None => false,
                };
                let _ = reply.send(queued);
            }
            RegistryCommand::SourceChanged { repo_url, reply } => {
                let wanted = normalize_repo_url(&repo_url);
                let mut notified = 0;
                for running in self.running.values() {
                    if normalize_repo_url(&running.app.source.repo_url) != wanted {
                        continue;
                    }
                    match running.tx.try_send(WorkItem::Tick) {
                        Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => notified += 1,
                        Err(mpsc::error::TrySendError::Closed(_)) => {}
                    }
                }
                debug!(repo_url = %repo_url, notified = notified, "Source change dispatched");
                let _ = reply.send(notified);
            }
        }
    }

    async fn upsert(&mut self, app: ManagedApp) {
        let id = app.id();
        if let Some(running) = self.running.get(&id) {
            if *running.app == app {
                debug!(app = %id, "Registration unchanged");
                return;
            }
        }
        if let Some(previous) = self.running.remove(&id) {
            info!(app = %id, "Registration changed, restarting tasks");
            previous.stop().await;
        } else {
            info!(app = %id, "Registering application");
        }

        let app = Arc::new(app);
        self.apps.rcu(|current| {
            let mut next = AppMap::clone(current);
            next.insert(id.clone(), app.clone());
            next
        });
        let state = self
            .board
            .get(&id)
            .map(AppState::seeded)
            .unwrap_or_default();
        let running = self.start(app, state);
        self.running.insert(id, running);
        metrics::MANAGED_APPLICATIONS.set(self.running.len() as f64);
    }

    fn start(&self, app: Arc<ManagedApp>, state: AppState) -> Running {
        let cancel = self.shutdown.child_token();
        let (tx, rx) = mpsc::channel(worker::QUEUE_CAPACITY);
        let worker = tokio::spawn(worker::run(
            app.clone(),
            self.reconciler.clone(),
            rx,
            self.resync,
            state,
            cancel.clone(),
        ));
        let watcher = tokio::spawn(drift_watcher::run(
            app.clone(),
            self.reconciler.clone(),
            tx.clone(),
            cancel.clone(),
        ));
        Running {
            app,
            tx,
            cancel,
            worker,
            watcher,
        }
    }

    async fn remove(&mut self, id: &str) -> bool {
        let Some(running) = self.running.remove(id) else {
            return false;
        };
        info!(app = %id, "Unregistering application");
        let app = running.app.clone();
        running.stop().await;

        self.apps.rcu(|current| {
            let mut next = AppMap::clone(current);
            next.remove(id);
            next
        });
        self.board.remove(id);
        self.reconciler.forget(&app).await;
        metrics::forget_app(&app.namespace, &app.name);
        metrics::MANAGED_APPLICATIONS.set(self.running.len() as f64);
        true
    }
}

/// Compare repository URLs ignoring case, a trailing `/` and `.git`
pub fn normalize_repo_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    let url = url.strip_suffix(".git").unwrap_or(url);
    url.to_ascii_lowercase()
}
