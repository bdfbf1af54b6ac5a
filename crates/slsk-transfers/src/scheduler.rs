//! Tokio-backed implementations of the timer and job collaborators.
//!
//! Both post their completions back onto the worker's command channel, so
//! the manager only ever sees them on its owner task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use slsk_transfer_core::{FinalizeJob, JobRunner, Scheduler, TimerEvent, TimerId};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::command::TransferCommand;
use crate::paths::finalize_download;

/// One-shot timers as sleeping tasks; cancelling aborts the task.
pub struct TokioScheduler {
    runtime: Handle,
    commands: mpsc::Sender<TransferCommand>,
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<TimerId, JoinHandle<()>>>>,
}

impl TokioScheduler {
    pub(crate) fn new(runtime: Handle, commands: mpsc::Sender<TransferCommand>) -> Self {
        Self {
            runtime,
            commands,
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<TimerId, JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, event: TimerEvent) -> TimerId {
        let timer = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let commands = self.commands.clone();
        let pending = Arc::clone(&self.pending);
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&timer);
            if commands.send(TransferCommand::Timer(event)).await.is_err() {
                debug!("transfer worker gone; dropping timer");
            }
        });
        self.lock_pending().insert(timer, handle);
        timer
    }

    fn cancel(&self, timer: TimerId) {
        if let Some(handle) = self.lock_pending().remove(&timer) {
            handle.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, handle) in self.lock_pending().drain() {
            handle.abort();
        }
    }
}

/// Runs finalize jobs on the blocking pool.
pub struct BlockingJobRunner {
    runtime: Handle,
    commands: mpsc::Sender<TransferCommand>,
}

impl BlockingJobRunner {
    pub(crate) const fn new(runtime: Handle, commands: mpsc::Sender<TransferCommand>) -> Self {
        Self { runtime, commands }
    }
}

impl JobRunner for BlockingJobRunner {
    fn submit(&self, job: FinalizeJob) {
        let commands = self.commands.clone();
        let blocking = self.runtime.spawn_blocking(move || {
            let outcome = finalize_download(&job);
            (job.transfer_id, outcome)
        });
        self.runtime.spawn(async move {
            match blocking.await {
                Ok((transfer_id, outcome)) => {
                    let command = TransferCommand::JobFinished {
                        transfer_id,
                        outcome,
                    };
                    if commands.send(command).await.is_err() {
                        debug!("transfer worker gone; dropping job result");
                    }
                }
                Err(err) => warn!(error = %err, "finalize job panicked"),
            }
        });
    }
}
