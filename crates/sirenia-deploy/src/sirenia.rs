//! Rolling replacement of a sirenia chain.
//!
//! Peers are replaced one at a time from the tail of the chain to the head
//! so that a primary with a caught-up sync exists throughout:
//!
//! 1. each async is replaced by a new job that joins at the tail,
//! 2. the sync is replaced the same way,
//! 3. the second new job is given time to catch up with the first, which
//!    is now the sync, so the coming takeover does not break its base
//!    backup,
//! 4. the primary is replaced, promoting the first new job,
//! 5. the old release is scaled to zero.
//!
//! None of this can be undone safely once it has started, so every failure
//! is reported as [`DeployError::SkipRollback`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sirenia_core::{EventKind, Instance, ServiceEvent, ServiceMeta, State};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::DeployConfig;
use crate::error::{DeployError, DeployResult};
use crate::traits::{Formation, PeerControl};
use crate::types::{DeployEvent, Deployment, DeploymentEvent, JobEvent, JobState};

pub struct SireniaDeploy {
    config: DeployConfig,
    formation: Arc<dyn Formation>,
    peers: Arc<dyn PeerControl>,
    progress: Option<mpsc::UnboundedSender<DeploymentEvent>>,
    stop: CancellationToken,
}

impl SireniaDeploy {
    pub fn new(
        config: DeployConfig,
        formation: Arc<dyn Formation>,
        peers: Arc<dyn PeerControl>,
    ) -> Self {
        Self {
            config,
            formation,
            peers,
            progress: None,
            stop: CancellationToken::new(),
        }
    }

    /// Report job transitions on `tx` as the rollout proceeds.
    #[must_use]
    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<DeploymentEvent>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Cancelling the token aborts the rollout at its next wait.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Roll the sirenia process of `deployment` over to the new release.
    ///
    /// `events` must carry the service's discovery events from the start
    /// of its watch, including the initial `current` marker, merged with
    /// the scheduler's job events.
    ///
    /// # Errors
    ///
    /// Every failure is wrapped in [`DeployError::SkipRollback`].
    pub async fn run(
        &self,
        deployment: &Deployment,
        events: mpsc::Receiver<DeployEvent>,
    ) -> DeployResult<()> {
        self.deploy(deployment, events)
            .await
            .map_err(DeployError::skip_rollback)
    }

    async fn deploy(
        &self,
        deployment: &Deployment,
        events: mpsc::Receiver<DeployEvent>,
    ) -> DeployResult<()> {
        let process = self.process_type(deployment)?;
        info!(process = %process, "starting sirenia deployment");

        let desired = deployment.processes.get(&process).copied().unwrap_or(0);
        if desired == 0 {
            info!(process = %process, "sirenia process scaled to zero, skipping");
            return Ok(());
        }
        let new_count = deployment.new_formation.get(&process).copied().unwrap_or(0);
        if new_count != 0 {
            return Err(logged(DeployError::NewReleaseScaled(new_count)));
        }

        let mut rollout = Rollout {
            deploy: self,
            deployment,
            process,
            events: Events {
                rx: events,
                old_release: deployment.old_release.id.clone(),
                old_down: HashSet::new(),
                stop: self.stop.clone(),
                timeout: self.config.timeout(),
            },
            new_count,
            new_primary: None,
            new_sync: None,
        };

        let state = rollout.current_state().await?;
        check_state(&state, desired)?;
        rollout.replace(&state).await?;

        info!("stopping old jobs");
        self.formation
            .scale(&deployment.old_release.id, &rollout.process, 0)
            .await
            .map_err(logged)?;
        rollout.events.wait_for_old_down(&rollout.process, desired).await?;
        info!("sirenia deployment complete");
        Ok(())
    }

    /// The process type named by the old release, else the new one.
    fn process_type(&self, deployment: &Deployment) -> DeployResult<String> {
        let key = &self.config.process_env_key;
        let process = [&deployment.old_release, &deployment.new_release]
            .into_iter()
            .filter_map(|release| release.env.get(key))
            .find(|process| !process.is_empty())
            .ok_or(DeployError::UnknownProcessType)?;
        if !deployment.new_release.processes.contains(process) {
            return Err(DeployError::ProcessNotInRelease(process.clone()));
        }
        Ok(process.clone())
    }

    fn report(&self, release_id: &str, process: &str, job_state: JobState) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(DeploymentEvent {
                release_id: release_id.to_owned(),
                process: process.to_owned(),
                job_state,
            });
        }
    }
}

/// Refuse clusters that are not a clean, fully populated chain.
fn check_state(state: &State, desired: u32) -> DeployResult<()> {
    if state.singleton {
        return Err(logged(DeployError::Singleton));
    }
    if state.sync.is_none() {
        return Err(logged(DeployError::Unhealthy("has no sync")));
    }
    if state.asyncs.is_empty() {
        return Err(logged(DeployError::Unhealthy("has no asyncs")));
    }
    if u32::try_from(state.asyncs.len()).ok().and_then(|n| n.checked_add(2)) != Some(desired) {
        return Err(logged(DeployError::Unhealthy("too few asyncs")));
    }
    Ok(())
}

fn logged(err: DeployError) -> DeployError {
    error!(error = %err, "sirenia deployment failed");
    err
}

/// One rollout in progress.
struct Rollout<'a> {
    deploy: &'a SireniaDeploy,
    deployment: &'a Deployment,
    process: String,
    events: Events,
    new_count: u32,
    /// First new job; becomes the primary.
    new_primary: Option<Instance>,
    /// Second new job; becomes the sync.
    new_sync: Option<Instance>,
}

impl Rollout<'_> {
    /// Read the initial snapshot of the service up to `current`.
    async fn current_state(&mut self) -> DeployResult<State> {
        let release_key = self.deploy.config.release_meta_key.clone();
        let new_release = self.deployment.new_release.id.clone();
        let mut meta: Option<ServiceMeta> = None;
        self.events
            .wait_for("current service event", |event| match event.kind {
                EventKind::Current => Ok(Some(())),
                EventKind::ServiceMeta => {
                    meta = event.service_meta;
                    Ok(None)
                }
                EventKind::Up
                    if event
                        .instance
                        .as_ref()
                        .and_then(|inst| inst.meta(&release_key))
                        == Some(new_release.as_str()) =>
                {
                    Err(DeployError::UnexpectedState)
                }
                _ => Ok(None),
            })
            .await
            .map_err(logged)?;

        let meta = meta.ok_or_else(|| logged(DeployError::MissingState))?;
        info!(index = meta.index, "decoding sirenia cluster state");
        State::decode(&meta.data)
            .map_err(|err| logged(err.into()))?
            .ok_or_else(|| logged(DeployError::MissingState))
    }

    async fn replace(&mut self, state: &State) -> DeployResult<()> {
        let sync = state.sync.as_ref().ok_or(DeployError::Unhealthy("has no sync"))?;

        // New asyncs join behind the current tail: the sync when it is the
        // only replica, otherwise the last async.
        let mut upstream = if state.asyncs.len() > 1 {
            state.asyncs.last().unwrap_or(sync).clone()
        } else {
            sync.clone()
        };
        for old in &state.asyncs {
            info!(addr = %old.addr, "replacing an async node");
            let new = self.start_instance().await?;
            self.stop_instance(old).await?;
            self.wait_for_sync(&upstream, &new).await?;
            upstream = new;
        }

        info!(addr = %sync.addr, "replacing the sync node");
        self.start_instance().await?;
        self.stop_instance(sync).await?;
        let new_primary = self
            .new_primary
            .clone()
            .ok_or(DeployError::UnexpectedState)?;
        let new_sync = self.new_sync.clone().ok_or(DeployError::UnexpectedState)?;
        // The first new job has moved up to sync of the old primary.
        self.wait_for_sync(&state.primary, &new_primary).await?;
        // Catch the next sync up before the old primary goes away.
        self.wait_for_sync(&new_primary, &new_sync).await?;

        info!(addr = %state.primary.addr, "replacing the primary node");
        self.start_instance().await?;
        self.stop_instance(&state.primary).await?;
        self.wait_for_read_write(&new_primary).await
    }

    /// Scale the new release up by one and wait for the job to register.
    async fn start_instance(&mut self) -> DeployResult<Instance> {
        let new_release = &self.deployment.new_release.id;
        info!("starting new instance");
        self.deploy
            .report(new_release, &self.process, JobState::Starting);
        self.new_count += 1;
        self.deploy
            .formation
            .scale(new_release, &self.process, self.new_count)
            .await
            .map_err(logged)?;

        info!("waiting for new instance to come up");
        let release_key = &self.deploy.config.release_meta_key;
        let process_key = &self.deploy.config.process_meta_key;
        let process = &self.process;
        let inst = self
            .events
            .wait_for("new instance to come up", |event| {
                Ok(match (event.kind, event.instance) {
                    (EventKind::Up, Some(inst))
                        if inst.meta(release_key) == Some(new_release.as_str())
                            && inst.meta(process_key) == Some(process.as_str()) =>
                    {
                        Some(inst)
                    }
                    _ => None,
                })
            })
            .await
            .map_err(logged)?;

        info!(addr = %inst.addr, id = %inst.id, "new instance up");
        if self.new_primary.is_none() {
            self.new_primary = Some(inst.clone());
        } else if self.new_sync.is_none() {
            self.new_sync = Some(inst.clone());
        }
        self.deploy.report(new_release, &self.process, JobState::Up);
        Ok(inst)
    }

    /// Stop a peer of the old release and wait for it to leave discovery.
    async fn stop_instance(&mut self, inst: &Instance) -> DeployResult<()> {
        let old_release = &self.deployment.old_release.id;
        self.deploy
            .report(old_release, &self.process, JobState::Stopping);
        info!(addr = %inst.addr, "stopping peer");
        self.deploy
            .peers
            .stop(inst)
            .await
            .map_err(|err| logged(DeployError::peer(&inst.addr, err)))?;

        info!(addr = %inst.addr, "waiting for peer to stop");
        self.events
            .wait_for("peer to stop", |event| {
                let down = event.kind == EventKind::Down
                    && event.instance.as_ref().is_some_and(|i| i.id == inst.id);
                Ok(down.then_some(()))
            })
            .await
            .map_err(logged)?;
        self.deploy.report(old_release, &self.process, JobState::Down);
        Ok(())
    }

    async fn wait_for_sync(&self, upstream: &Instance, downstream: &Instance) -> DeployResult<()> {
        info!(upstream = %upstream.addr, downstream = %downstream.addr, "waiting for replication sync");
        self.deploy
            .peers
            .wait_for_repl_sync(upstream, downstream, self.deploy.config.timeout())
            .await
            .map_err(|err| logged(DeployError::peer(&upstream.addr, err)))
    }

    async fn wait_for_read_write(&self, inst: &Instance) -> DeployResult<()> {
        info!(addr = %inst.addr, "waiting for read-write");
        self.deploy
            .peers
            .wait_for_read_write(inst, self.deploy.config.timeout())
            .await
            .map_err(|err| logged(DeployError::peer(&inst.addr, err)))
    }
}

/// The merged event stream. Job events of the old release are remembered
/// while waiting for discovery events so the final scale-down can count
/// jobs that went down earlier.
struct Events {
    rx: mpsc::Receiver<DeployEvent>,
    old_release: String,
    old_down: HashSet<String>,
    stop: CancellationToken,
    timeout: Duration,
}

impl Events {
    async fn next(&mut self, deadline: Instant, what: &'static str) -> DeployResult<DeployEvent> {
        tokio::select! {
            () = self.stop.cancelled() => Err(DeployError::Stopped),
            () = tokio::time::sleep_until(deadline) => Err(DeployError::Timeout(what)),
            event = self.rx.recv() => event.ok_or(DeployError::StreamClosed),
        }
    }

    /// Wait up to the deploy timeout for a discovery event accepted by
    /// `accept`.
    async fn wait_for<T>(
        &mut self,
        what: &'static str,
        mut accept: impl FnMut(ServiceEvent) -> DeployResult<Option<T>>,
    ) -> DeployResult<T> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.next(deadline, what).await? {
                DeployEvent::Service(event) => {
                    if let Some(found) = accept(event)? {
                        return Ok(found);
                    }
                }
                DeployEvent::Job(job) => self.record(&job),
            }
        }
    }

    fn record(&mut self, job: &JobEvent) {
        if job.release_id == self.old_release && job.state == JobState::Down {
            self.old_down.insert(format!("{}/{}", job.process, job.job_id));
        }
    }

    fn old_down(&self, process: &str) -> usize {
        let prefix = format!("{process}/");
        self.old_down
            .iter()
            .filter(|job| job.starts_with(&prefix))
            .count()
    }

    /// Wait until `count` jobs of `process` in the old release are down.
    async fn wait_for_old_down(&mut self, process: &str, count: u32) -> DeployResult<()> {
        let count = usize::try_from(count).unwrap_or(usize::MAX);
        let deadline = Instant::now() + self.timeout;
        while self.old_down(process) < count {
            if let DeployEvent::Job(job) = self
                .next(deadline, "old jobs to stop")
                .await
                .map_err(logged)?
            {
                self.record(&job);
            }
        }
        Ok(())
    }
}
