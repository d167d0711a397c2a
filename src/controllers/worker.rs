//! Per-application worker
//!
//! Serializes the cycles of one application. Triggers arriving while a cycle
//! runs are coalesced into a single follow-up cycle; a `SyncNow` additionally
//! cancels the running sync at its next step boundary.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::model::ManagedApp;
use crate::reconcilers::application::{AppState, ApplicationReconciler, WorkItem};

/// Capacity of a worker's trigger queue
pub const QUEUE_CAPACITY: usize = 16;

/// Run cycles for `app` until `shutdown` is cancelled or the queue closes.
///
/// The resync timer fires immediately, so a fresh worker starts with a cycle.
pub async fn run(
    app: Arc<ManagedApp>,
    reconciler: Arc<ApplicationReconciler>,
    mut rx: mpsc::Receiver<WorkItem>,
    resync: Duration,
    mut state: AppState,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(resync);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pending: Option<WorkItem> = None;

    info!(app = %app.id(), "Worker started");
    loop {
        let mut item = match pending.take() {
            Some(item) => item,
            None => tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => WorkItem::Tick,
                received = rx.recv() => match received {
                    Some(item) => item,
                    None => break,
                },
            },
        };
        while let Ok(next) = rx.try_recv() {
            item = item.coalesce(next);
        }
        if shutdown.is_cancelled() {
            break;
        }

        let cancel = shutdown.child_token();
        let cycle = reconciler.run_cycle(&app, &mut state, item, &cancel);
        tokio::pin!(cycle);
        let mut queue_open = true;
        loop {
            tokio::select! {
                outcome = &mut cycle => {
                    debug!(
                        app = %app.id(),
                        trigger = outcome.trigger.as_str(),
                        phase = ?outcome.phase,
                        "Cycle finished"
                    );
                    break;
                }
                received = rx.recv(), if queue_open => match received {
                    Some(next) => {
                        if next == WorkItem::SyncNow && !cancel.is_cancelled() {
                            info!(app = %app.id(), "Sync requested, cancelling running cycle");
                            cancel.cancel();
                        }
                        pending = Some(pending.map_or(next, |p| p.coalesce(next)));
                    }
                    None => queue_open = false,
                },
            }
        }
    }
    info!(app = %app.id(), "Worker stopped");
}
