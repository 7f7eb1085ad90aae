//! Background wait for a downstream to catch up with replication.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use sirenia_core::{Config, Instance, Position, XLog, XLogError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::driver::{Shared, CHECK_INTERVAL};

/// A running wait. The peer learns the outcome through the synced
/// downstream reported in database info.
#[derive(Debug)]
pub(crate) struct SyncWait {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SyncWait {
    pub(crate) fn spawn(
        shared: Arc<Shared>,
        downstream: Instance,
        config: Config,
        enable_writes: bool,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            shared,
            downstream,
            config,
            enable_writes,
            cancel.clone(),
        ));
        Self { cancel, task }
    }

    /// Stop waiting and return once the task has finished.
    pub(crate) async fn cancel(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn run(
    shared: Arc<Shared>,
    downstream: Instance,
    config: Config,
    enable_writes: bool,
    cancel: CancellationToken,
) {
    let name = shared.logical_id(&downstream).to_owned();
    let xlog = shared.xlog();
    let mut progress = Progress::new(xlog.zero(), shared.repl_timeout(), Instant::now());
    info!(sync_name = %name, "waiting for downstream replication to catch up");

    loop {
        if cancel.is_cancelled() {
            debug!(sync_name = %name, "sync wait cancelled");
            return;
        }

        match shared.check_repl_status(&name).await {
            // Usually the standby has not connected yet. This does not count
            // against the timeout; a standby that never connects leaves the
            // cluster and the wait is cancelled by the next reconfigure.
            Err(err) => {
                debug!(sync_name = %name, error = %err, "replication status unavailable");
                progress.unavailable(Instant::now());
            }
            Ok((sent, flushed)) => match progress.observe(&*xlog, &sent, flushed, Instant::now()) {
                Ok(Step::CaughtUp) => {
                    info!(sync_name = %name, sent = %sent, "downstream caught up");
                    shared.set_synced_downstream(Some(downstream.clone()));
                    break;
                }
                Ok(Step::Stalled) => {
                    error!(
                        sync_name = %name,
                        last_flushed = %progress.last_flushed,
                        "downstream unable to make forward progress"
                    );
                    return;
                }
                Ok(Step::Pending) => {
                    debug!(sync_name = %name, sent = %sent, last_flushed = %progress.last_flushed, "continuing replication check");
                }
                Err(err) => {
                    error!(sync_name = %name, error = %err, "error parsing log locations");
                    return;
                }
            },
        }

        tokio::select! {
            () = cancel.cancelled() => {
                debug!(sync_name = %name, "sync wait cancelled");
                return;
            }
            () = tokio::time::sleep(CHECK_INTERVAL) => {}
        }
    }

    if enable_writes {
        if let Err(err) = shared.enable_writes(Some(&downstream), &config).await {
            error!(sync_name = %name, error = %err, "error enabling writes");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    CaughtUp,
    Pending,
    Stalled,
}

/// Replication progress of one downstream. The deadline moves forward
/// whenever the flushed position advances.
#[derive(Debug)]
pub(crate) struct Progress {
    zero: Position,
    last_flushed: Position,
    timeout: Duration,
    deadline: Instant,
}

impl Progress {
    pub(crate) fn new(zero: Position, timeout: Duration, now: Instant) -> Self {
        Self {
            last_flushed: zero.clone(),
            zero,
            timeout,
            deadline: now + timeout,
        }
    }

    pub(crate) fn unavailable(&mut self, now: Instant) {
        self.deadline = now + self.timeout;
    }

    pub(crate) fn observe(
        &mut self,
        xlog: &dyn XLog,
        sent: &Position,
        flushed: Position,
        now: Instant,
    ) -> Result<Step, XLogError> {
        let advanced = xlog.compare(&self.last_flushed, &flushed)? == Ordering::Less;
        if advanced || self.last_flushed == self.zero {
            self.deadline = now + self.timeout;
            self.last_flushed = flushed.clone();
        }
        if *sent == flushed {
            return Ok(Step::CaughtUp);
        }
        if now >= self.deadline {
            return Ok(Step::Stalled);
        }
        Ok(Step::Pending)
    }
}
