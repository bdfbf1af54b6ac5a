#![allow(clippy::redundant_pub_crate)]
//! Worker task owning the transfer manager.
//!
//! Commands and periodic ticks are applied one at a time. Handlers that touch
//! the disk run through `off_scheduler` so chunk IO does not stall sibling
//! tasks on a multi-threaded runtime.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use anyhow::Result;
use slsk_events::{Event, EventBus, TransferDirection};
use slsk_telemetry::Metrics;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::command::TransferCommand;
use crate::manager::TransferManager;
use crate::store::TransferStore;

const STORE_COMPONENT: &str = "transfer_store";

/// Persistence targets of the worker.
pub(crate) struct Stores {
    pub(crate) downloads: TransferStore,
    pub(crate) uploads: TransferStore,
}

pub(crate) fn spawn(
    manager: TransferManager,
    stores: Stores,
    events: EventBus,
    metrics: Metrics,
    mut commands: mpsc::Receiver<TransferCommand>,
) {
    tokio::spawn(async move {
        let mut worker = Worker::new(manager, stores, events, metrics);
        worker.restore();

        let config = worker.manager.config().clone();
        let mut save = periodic(config.network.save_interval());
        let mut upload_check = periodic(config.uploads.check_interval());
        let mut retry = periodic(config.downloads.retry_interval());
        let mut place_in_queue = periodic(config.downloads.place_in_queue_interval());

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(command) => off_scheduler(|| worker.handle(command)),
                        None => break,
                    }
                }
                _ = save.tick() => off_scheduler(|| worker.save()),
                _ = upload_check.tick() => worker.manager.tick_upload_queue(),
                _ = retry.tick() => worker.manager.retry_failed_downloads(),
                _ = place_in_queue.tick() => worker.manager.request_queue_positions(),
            }
        }
        worker.save();
        info!("transfer worker stopped");
    });
}

/// Runs blocking work in place, handing the thread's other tasks to the pool
/// when the runtime has one.
fn off_scheduler<R>(work: impl FnOnce() -> R) -> R {
    match Handle::try_current().as_ref().map(Handle::runtime_flavor) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(work),
        _ => work(),
    }
}

fn periodic(period: Duration) -> tokio::time::Interval {
    let period = period.max(Duration::from_secs(1));
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

struct Worker {
    manager: TransferManager,
    stores: Stores,
    events: EventBus,
    metrics: Metrics,
    health: BTreeSet<String>,
}

impl Worker {
    const fn new(
        manager: TransferManager,
        stores: Stores,
        events: EventBus,
        metrics: Metrics,
    ) -> Self {
        Self {
            manager,
            stores,
            events,
            metrics,
            health: BTreeSet::new(),
        }
    }

    fn restore(&mut self) {
        for direction in [TransferDirection::Download, TransferDirection::Upload] {
            let store = self.store(direction);
            match store.load() {
                Ok(rows) => self.manager.restore(direction, rows),
                Err(err) => {
                    let detail = err.to_string();
                    self.mark_degraded(STORE_COMPONENT, Some(&detail));
                    warn!(direction = direction.as_str(), error = %err, "transfer list could not be loaded");
                }
            }
        }
        self.manager.start();
    }

    fn handle(&mut self, command: TransferCommand) {
        let manager = &mut self.manager;
        match command {
            TransferCommand::Enqueue { request, reply } => {
                let _ = reply.send(manager.enqueue_download(request).map_err(Into::into));
            }
            TransferCommand::Abort {
                direction,
                id,
                delete_partial,
                reply,
            } => {
                let _ = reply.send(
                    manager
                        .abort(direction, id, delete_partial)
                        .map_err(Into::into),
                );
            }
            TransferCommand::Clear {
                direction,
                id,
                reply,
            } => {
                let _ = reply.send(manager.clear(direction, id).map_err(Into::into));
            }
            TransferCommand::ClearFinished { direction, reply } => {
                manager.clear_finished(direction);
                let _ = reply.send(Ok(()));
            }
            TransferCommand::Pause { id, reply } => {
                let _ = reply.send(manager.pause(id).map_err(Into::into));
            }
            TransferCommand::Retry { id, reply } => {
                let _ = reply.send(manager.retry(id).map_err(Into::into));
            }
            TransferCommand::BanUser { username, reply } => {
                manager.ban_user(&username);
                let _ = reply.send(Ok(()));
            }
            TransferCommand::SetPrivileged { usernames, reply } => {
                manager.set_privileged_users(usernames);
                let _ = reply.send(Ok(()));
            }
            TransferCommand::List { direction, reply } => {
                let _ = reply.send(Ok(manager.snapshots(direction)));
            }
            TransferCommand::Save { reply } => {
                let result = self.try_save();
                let _ = reply.send(result);
            }
            TransferCommand::Network(event) => manager.handle_network_event(event),
            TransferCommand::Timer(event) => manager.handle_timer(event),
            TransferCommand::JobFinished {
                transfer_id,
                outcome,
            } => manager.handle_finalized(transfer_id, outcome),
        }
    }

    fn save(&mut self) {
        if let Err(err) = self.try_save() {
            warn!(error = %err, "transfer list save failed");
        }
    }

    fn try_save(&mut self) -> Result<()> {
        let started = Instant::now();
        let result = [TransferDirection::Download, TransferDirection::Upload]
            .into_iter()
            .try_for_each(|direction| {
                let rows = self.manager.persisted(direction);
                self.store(direction).save(&rows)
            });
        match result {
            Ok(()) => {
                self.metrics.observe_store_save(started.elapsed());
                self.mark_recovered(STORE_COMPONENT);
                debug!("transfer lists saved");
                Ok(())
            }
            Err(err) => {
                let detail = err.to_string();
                self.mark_degraded(STORE_COMPONENT, Some(&detail));
                Err(err.into())
            }
        }
    }

    const fn store(&self, direction: TransferDirection) -> &TransferStore {
        match direction {
            TransferDirection::Download => &self.stores.downloads,
            TransferDirection::Upload => &self.stores.uploads,
        }
    }

    fn mark_degraded(&mut self, component: &str, detail: Option<&str>) {
        if self.health.insert(component.to_string()) {
            let degraded = self.health.iter().cloned().collect::<Vec<_>>();
            self.events.publish(Event::HealthChanged { degraded });
            warn!(
                component = component,
                detail = detail.unwrap_or_default(),
                "transfer component degraded"
            );
        } else if let Some(detail) = detail {
            warn!(
                component = component,
                detail = %detail,
                "transfer component still degraded"
            );
        }
    }

    fn mark_recovered(&mut self, component: &str) {
        if self.health.remove(component) {
            let degraded = self.health.iter().cloned().collect::<Vec<_>>();
            self.events.publish(Event::HealthChanged { degraded });
            info!(component = component, "transfer component recovered");
        }
    }
}
