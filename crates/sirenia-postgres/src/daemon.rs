//! Supervision of the `postgres` server process.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::PostgresConfig;
use crate::error::{PostgresError, PostgresResult};

/// Signals sent in turn when stopping: fast shutdown, immediate shutdown,
/// then kill.
const STOP_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGQUIT, Signal::SIGKILL];

/// A running daemon. Clones share the same process.
#[derive(Debug, Clone)]
pub(crate) struct Daemon {
    pid: Pid,
    expect_exit: Arc<AtomicBool>,
    exited: CancellationToken,
}

impl Daemon {
    /// Spawn `postgres -D <data_dir>`. `crashed` is cancelled if the process
    /// exits without being asked to.
    pub(crate) async fn spawn(
        config: &PostgresConfig,
        crashed: CancellationToken,
    ) -> PostgresResult<Self> {
        // A stale pid file from an unclean exit stops postgres from starting.
        let pid_file = config.data_path("postmaster.pid");
        match tokio::fs::remove_file(&pid_file).await {
            Ok(()) => debug!(path = %pid_file.display(), "removed stale pid file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %pid_file.display(), error = %err, "error removing stale pid file"),
        }

        let mut child = Command::new(config.bin_path("postgres"))
            .arg("-D")
            .arg(config.data_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;
        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .ok_or(PostgresError::NotRunning)?;

        let expect_exit = Arc::new(AtomicBool::new(false));
        let exited = CancellationToken::new();
        tokio::spawn({
            let expect_exit = Arc::clone(&expect_exit);
            let exited = exited.clone();
            async move {
                let status = child.wait().await;
                if !expect_exit.load(Ordering::SeqCst) {
                    error!(status = ?status, "postgres exited unexpectedly");
                    crashed.cancel();
                }
                exited.cancel();
            }
        });

        Ok(Self {
            pid: Pid::from_raw(pid),
            expect_exit,
            exited,
        })
    }

    pub(crate) fn signal(&self, signal: Signal) -> PostgresResult<()> {
        debug!(pid = %self.pid, ?signal, "signalling daemon");
        kill(self.pid, signal)?;
        Ok(())
    }

    /// Stop the process, escalating through [`STOP_SIGNALS`] with
    /// `timeout` to exit after each.
    pub(crate) async fn stop(&self, timeout: Duration) -> PostgresResult<()> {
        self.expect_exit.store(true, Ordering::SeqCst);
        for signal in STOP_SIGNALS {
            if let Err(err) = self.signal(signal) {
                warn!(?signal, error = %err, "error signalling daemon");
            }
            if tokio::time::timeout(timeout, self.exited.cancelled())
                .await
                .is_ok()
            {
                return Ok(());
            }
        }
        Err(PostgresError::UnableToKill)
    }

    #[cfg(test)]
    fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }
}
