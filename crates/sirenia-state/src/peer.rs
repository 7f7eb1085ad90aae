//! The per-node state machine.
//!
//! A [`Peer`] is a cheap handle. All decisions are made by a single task
//! started with [`Peer::run`], which drains inputs in a fixed priority order:
//! discoverd events first so stale state never drives a reconfigure, then the
//! database ready signal, queued commands, a pending evaluation and finally a
//! pending reconfigure. Evaluation and reconfigure requests are coalesced.
//! Observers read an immutable [`PeerInfo`] snapshot that is swapped after
//! every change.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use sirenia_core::{
    Clock, Config, DiscoverdState, FreezeDetails, Instance, PeerInfo, Position, Role, State,
    SystemClock, Tunables, SINGLETON_FREEZE_REASON,
};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DatabaseError, StateError, StateResult};
use crate::traits::{Database, Discoverd};
use crate::types::{DatabaseEvent, DiscoverdEvent, PeerHooks};

const RETRY_DELAY: Duration = Duration::from_secs(1);
const COMMAND_BUFFER: usize = 8;

enum Command {
    UpdateTunables {
        tunables: Tunables,
        reply: oneshot::Sender<StateResult<()>>,
    },
}

#[derive(Debug, Default)]
struct Snapshot {
    info: RwLock<Arc<PeerInfo>>,
    config: RwLock<Option<Config>>,
}

/// Builder for [`Peer`].
pub struct PeerBuilder {
    instance: Instance,
    id_key: String,
    singleton: bool,
    discoverd: Arc<dyn Discoverd>,
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    hooks: Option<PeerHooks>,
}

impl PeerBuilder {
    #[must_use]
    pub fn singleton(mut self, singleton: bool) -> Self {
        self.singleton = singleton;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: PeerHooks) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn build(self) -> Peer {
        let id = self.instance.logical_id(&self.id_key).to_owned();
        let snapshot = Arc::new(Snapshot {
            info: RwLock::new(Arc::new(PeerInfo {
                id: id.clone(),
                ..PeerInfo::default()
            })),
            config: RwLock::new(None),
        });
        let (eval_tx, eval_rx) = mpsc::channel(1);
        let (apply_tx, apply_rx) = mpsc::channel(1);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);

        let machine = Machine {
            id: id.clone(),
            id_key: self.id_key,
            instance: self.instance,
            singleton: self.singleton,
            discoverd: self.discoverd,
            db: Arc::clone(&self.db),
            clock: self.clock,
            hooks: self.hooks,
            snapshot: Arc::clone(&snapshot),
            generation: 0,
            state_index: 0,
            online: None,
            setup: false,
            applied: None,
            upstream: None,
            downstream: None,
            moving: false,
            eval_on_start: false,
            inputs: 0,
            eval_tx,
            apply_tx,
        };
        let inputs = Inputs {
            eval: eval_rx,
            apply: apply_rx,
            commands: commands_rx,
        };

        Peer {
            inner: Arc::new(PeerInner {
                id,
                snapshot,
                db: self.db,
                cancel: CancellationToken::new(),
                commands: commands_tx,
                machine: Mutex::new(Some((machine, inputs))),
            }),
        }
    }
}

/// Handle to a peer state machine.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    id: String,
    snapshot: Arc<Snapshot>,
    db: Arc<dyn Database>,
    cancel: CancellationToken,
    commands: mpsc::Sender<Command>,
    machine: Mutex<Option<(Machine, Inputs)>>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

impl Peer {
    /// Start building a peer for `instance`, whose logical id is read from
    /// its metadata under `id_key`.
    pub fn builder(
        instance: Instance,
        id_key: impl Into<String>,
        discoverd: Arc<dyn Discoverd>,
        db: Arc<dyn Database>,
    ) -> PeerBuilder {
        PeerBuilder {
            instance,
            id_key: id_key.into(),
            singleton: false,
            discoverd,
            db,
            clock: Arc::new(SystemClock),
            hooks: None,
        }
    }

    /// Logical id of this peer.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Run the state machine until [`Peer::close`] or [`Peer::stop`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::AlreadyRunning`] on a second call, and an error if
    /// either input stream closes underneath the peer.
    pub async fn run(&self) -> StateResult<()> {
        let taken = self.inner.machine.lock().take();
        let Some((machine, inputs)) = taken else {
            return Err(StateError::AlreadyRunning);
        };
        machine.run(inputs, self.inner.cancel.clone()).await
    }

    /// Stop the loop without touching the database.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    /// Stop the loop and the local database.
    ///
    /// # Errors
    ///
    /// Returns the driver's error if the database could not be stopped.
    pub async fn stop(&self) -> StateResult<()> {
        self.close();
        self.inner.db.stop().await?;
        Ok(())
    }

    /// Latest observable snapshot.
    pub fn info(&self) -> Arc<PeerInfo> {
        Arc::clone(&self.inner.snapshot.info.read())
    }

    /// The driver config the peer intends to apply, once it has a role.
    pub fn config(&self) -> Option<Config> {
        self.inner.snapshot.config.read().clone()
    }

    /// Tunables of the last cluster state seen.
    pub fn tunables(&self) -> Option<Tunables> {
        self.info().state.as_ref().map(|s| s.tunables.clone())
    }

    /// Write a new tunables version into the cluster state. Only the primary
    /// accepts this, and `tunables.version` must be one above the current.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotPrimary`], [`StateError::TunablesVersion`], a
    /// validation error from the database, or the discoverd write error.
    pub async fn update_tunables(&self, tunables: Tunables) -> StateResult<()> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::UpdateTunables { tunables, reply })
            .await
            .map_err(|_| StateError::Stopped)?;
        rx.await.map_err(|_| StateError::Stopped)?
    }
}

struct Inputs {
    eval: mpsc::Receiver<()>,
    apply: mpsc::Receiver<()>,
    commands: mpsc::Receiver<Command>,
}

struct Machine {
    id: String,
    id_key: String,
    instance: Instance,
    singleton: bool,

    discoverd: Arc<dyn Discoverd>,
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    hooks: Option<PeerHooks>,
    snapshot: Arc<Snapshot>,

    /// Last generation handled.
    generation: u64,
    /// Index of the last cluster state received or written.
    state_index: u64,
    /// `None` until the database reports ready.
    online: Option<bool>,
    /// Whether the database existed when the driver started.
    setup: bool,
    applied: Option<Config>,
    upstream: Option<Instance>,
    downstream: Option<Instance>,

    moving: bool,
    /// A takeover was refused because the database was offline.
    eval_on_start: bool,
    /// External inputs handled, reported through the rest hook.
    inputs: u64,

    eval_tx: mpsc::Sender<()>,
    apply_tx: mpsc::Sender<()>,
}

enum Wake {
    Cancelled,
    Discoverd(Option<DiscoverdEvent>),
    Ready(Result<DatabaseEvent, oneshot::error::RecvError>),
    Command(Command),
    Eval,
    Apply,
}

async fn wait_ready(
    ready: &mut Option<oneshot::Receiver<DatabaseEvent>>,
) -> Result<DatabaseEvent, oneshot::error::RecvError> {
    match ready {
        Some(rx) => rx.await,
        None => std::future::pending().await,
    }
}

impl Machine {
    async fn run(mut self, mut inputs: Inputs, cancel: CancellationToken) -> StateResult<()> {
        let mut events = self.discoverd.events();
        let mut ready = Some(self.db.ready());
        info!(id = %self.id, singleton = self.singleton, "peer starting");

        loop {
            match events.try_recv() {
                Ok(event) => {
                    self.handle_discoverd_event(event);
                    continue;
                }
                Err(TryRecvError::Disconnected) => return Err(StateError::EventsClosed),
                Err(TryRecvError::Empty) => {}
            }
            if cancel.is_cancelled() {
                info!(id = %self.id, "peer stopped");
                return Ok(());
            }
            if let Some(rx) = ready.as_mut() {
                match rx.try_recv() {
                    Ok(event) => {
                        ready = None;
                        self.handle_ready(event).await;
                        continue;
                    }
                    Err(oneshot::error::TryRecvError::Closed) => {
                        return Err(StateError::ReadyDropped)
                    }
                    Err(oneshot::error::TryRecvError::Empty) => {}
                }
            }
            if let Ok(command) = inputs.commands.try_recv() {
                self.handle_command(command).await;
                continue;
            }
            if inputs.eval.try_recv().is_ok() {
                self.eval_cluster_state().await;
                continue;
            }
            if inputs.apply.try_recv().is_ok() {
                self.apply_config().await;
                continue;
            }

            self.rest();

            let wake = tokio::select! {
                biased;
                () = cancel.cancelled() => Wake::Cancelled,
                event = events.recv() => Wake::Discoverd(event),
                event = wait_ready(&mut ready) => Wake::Ready(event),
                Some(command) = inputs.commands.recv() => Wake::Command(command),
                Some(()) = inputs.eval.recv() => Wake::Eval,
                Some(()) = inputs.apply.recv() => Wake::Apply,
            };
            match wake {
                Wake::Cancelled => {}
                Wake::Discoverd(Some(event)) => self.handle_discoverd_event(event),
                Wake::Discoverd(None) => return Err(StateError::EventsClosed),
                Wake::Ready(Ok(event)) => {
                    ready = None;
                    self.handle_ready(event).await;
                }
                Wake::Ready(Err(_)) => return Err(StateError::ReadyDropped),
                Wake::Command(command) => self.handle_command(command).await,
                Wake::Eval => self.eval_cluster_state().await,
                Wake::Apply => self.apply_config().await,
            }
        }
    }

    // Snapshot plumbing

    fn info(&self) -> Arc<PeerInfo> {
        Arc::clone(&self.snapshot.info.read())
    }

    fn update_info(&self, f: impl FnOnce(&mut PeerInfo)) {
        {
            let mut guard = self.snapshot.info.write();
            let mut next = PeerInfo::clone(&guard);
            f(&mut next);
            *guard = Arc::new(next);
        }
        let config = self.config();
        *self.snapshot.config.write() = config;
    }

    fn set_state(&self, state: Option<State>) {
        self.update_info(|info| info.state = state);
    }

    fn set_peers(&self, peers: Vec<Instance>) {
        self.update_info(|info| info.peers = Some(peers));
    }

    fn set_role(&self, role: Role) {
        self.update_info(|info| info.role = role);
    }

    fn set_retry_pending(&self, at: Option<DateTime<Utc>>) {
        self.update_info(|info| info.retry_pending = at);
    }

    fn current_state(&self) -> State {
        match &self.info().state {
            Some(state) => state.clone(),
            None => panic!("cluster state required but not yet known"),
        }
    }

    // Scheduling

    fn trigger_eval(&self) {
        // A full buffer means an evaluation is already pending.
        let _ = self.eval_tx.try_send(());
    }

    fn trigger_apply(&self) {
        let _ = self.apply_tx.try_send(());
    }

    fn eval_later(&self, delay: Duration) {
        if let Some(hooks) = &self.hooks {
            let _ = hooks.retry.send(());
            return;
        }
        let tx = self.eval_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.try_send(());
        });
    }

    fn apply_config_later(&self, delay: Duration) {
        if let Some(hooks) = &self.hooks {
            let _ = hooks.retry.send(());
            return;
        }
        let tx = self.apply_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.try_send(());
        });
    }

    fn moving(&mut self) {
        if !self.moving {
            self.moving = true;
            debug!("moving");
        }
    }

    fn rest(&mut self) {
        if self.moving {
            self.moving = false;
            debug!("at rest");
        }
        if let Some(hooks) = &self.hooks {
            let inputs = self.inputs;
            hooks.rest.send_if_modified(|seen| {
                if *seen == inputs {
                    return false;
                }
                *seen = inputs;
                true
            });
        }
    }

    // Inputs

    async fn handle_ready(&mut self, event: DatabaseEvent) {
        self.inputs += 1;
        info!(online = event.online, setup = event.setup, "database ready");
        if self.online.is_some() {
            panic!("received database ready event after already initialised");
        }
        self.online = Some(event.online);
        self.setup = event.setup;

        if self.info().peers.is_some() {
            self.eval_cluster_state().await;
        }
    }

    fn handle_discoverd_event(&mut self, event: DiscoverdEvent) {
        self.inputs += 1;
        match event {
            DiscoverdEvent::Init { peers, state } => {
                info!(
                    peers = peers.len(),
                    state = state.state.is_some(),
                    "discoverd init"
                );
                if self.info().peers.is_some() {
                    panic!("received discoverd init after already initialised");
                }
                self.set_peers(peers);
                self.decode_state(state);
                if self.online.is_some() {
                    self.trigger_eval();
                }
            }
            DiscoverdEvent::Peers(peers) => {
                info!(peers = peers.len(), "discoverd peers");
                if self.info().peers.is_none() {
                    panic!("received discoverd peers before init");
                }
                self.set_peers(peers);
                self.trigger_eval();
            }
            DiscoverdEvent::State(state) => {
                info!(index = state.index, state = state.state.is_some(), "discoverd state");
                if self.info().peers.is_none() {
                    panic!("received discoverd state before init");
                }
                if self.decode_state(state) {
                    self.trigger_eval();
                } else {
                    debug!("already have this state");
                }
            }
        }
    }

    /// Install `state` if it is newer than the last one seen.
    fn decode_state(&mut self, state: DiscoverdState) -> bool {
        if state.index <= self.state_index {
            return false;
        }
        self.state_index = state.index;
        self.set_state(state.state);
        true
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::UpdateTunables { tunables, reply } => {
                let result = self.update_tunables(tunables).await;
                if let Err(err) = &result {
                    warn!(error = %err, "rejected tunables update");
                }
                let _ = reply.send(result);
            }
        }
    }

    async fn update_tunables(&mut self, tunables: Tunables) -> StateResult<()> {
        self.moving();
        let info = self.info();
        let state = match (&info.state, info.role) {
            (Some(state), Role::Primary) => state,
            _ => return Err(StateError::NotPrimary),
        };
        if state.is_frozen() {
            return Err(StateError::ClusterFrozen);
        }
        self.db.validate_tunables(&tunables)?;

        let expected = state.tunables.version + 1;
        if tunables.version != expected {
            return Err(StateError::TunablesVersion {
                expected,
                actual: tunables.version,
            });
        }

        let mut next = state.clone();
        next.tunables = tunables;
        info!(version = expected, "updating tunables");
        self.put_cluster_state(&next).await?;
        self.set_state(Some(next));
        self.trigger_apply();
        Ok(())
    }

    // Evaluation

    /// Examine the current cluster state and decide what to do next.
    ///
    /// Boxed because role assumption re-enters evaluation.
    fn eval_cluster_state(&mut self) -> BoxFuture<'_, ()> {
        async move {
            self.moving();
            if self.online.is_none() {
                debug!("database not ready, deferring state evaluation");
                return;
            }
            debug!("starting state evaluation");
            let info = self.info();

            let Some(state) = info.state.clone() else {
                let peers = info.peers.as_deref().unwrap_or_default();
                let leader = peers
                    .first()
                    .is_some_and(|first| self.is_self(first));
                debug!(
                    peers = peers.len(),
                    leader,
                    singleton = self.singleton,
                    "no cluster state"
                );
                if peers.is_empty() {
                    return;
                }
                if !self.setup && leader && (self.singleton || peers.len() > 1) {
                    self.start_initial_setup().await;
                } else if info.role != Role::Unassigned {
                    self.assume_unassigned();
                }
                return;
            };

            if self.singleton && !state.singleton {
                panic!("configured for singleton mode but cluster found in normal mode");
            }

            // A generation change sends everyone back to square one, except a
            // primary that has been replaced.
            if self.generation != state.generation {
                self.generation = state.generation;
                if info.role == Role::Primary {
                    if !self.is_self(&state.primary) {
                        self.assume_deposed();
                    }
                } else {
                    self.eval_init_cluster_state(&state).await;
                }
                return;
            }

            match info.role {
                Role::Unassigned => {
                    if let Some(i) = self.which_async(&state) {
                        self.assume_async(i);
                    }
                    return;
                }
                Role::Async => {
                    match self.which_async(&state) {
                        None => self.assume_unassigned(),
                        Some(i) => {
                            let upstream = lookup_upstream(&state, i);
                            let downstream = lookup_downstream(&state, i);
                            if !self.same_logical(upstream.as_ref(), self.upstream.as_ref())
                                || !self.same_logical(downstream.as_ref(), self.downstream.as_ref())
                            {
                                self.assume_async(i);
                            }
                        }
                    }
                    return;
                }
                Role::Sync => {
                    if !self.peer_is_present(&state.primary) {
                        self.start_takeover("primary gone", &state.init_wal).await;
                    } else if let Some(first) = state.asyncs.first() {
                        if !self.same_logical(Some(first), self.downstream.as_ref()) {
                            self.assume_sync().await;
                        }
                    }
                    return;
                }
                Role::Deposed => {
                    // Stale data: we stay deposed for as long as the state
                    // lists us there.
                    if state.deposed.iter().any(|peer| self.is_self(peer)) {
                        return;
                    }
                    match self.which_async(&state) {
                        Some(i) => {
                            info!("rebuilt after being deposed");
                            self.assume_async(i);
                        }
                        None => self.assume_unassigned(),
                    }
                    return;
                }
                Role::Primary => {}
                role => panic!("unexpected role {role}"),
            }

            // The primary rewrites the state when its discoverd instance
            // changed but its logical id did not.
            let state = if state.primary.id != self.instance.id && self.is_self(&state.primary) {
                info!(
                    old = %state.primary.id,
                    new = %self.instance.id,
                    "discoverd id in state differs from self, updating"
                );
                let mut next = state.clone();
                next.primary = self.instance.clone();
                match self.put_cluster_state(&next).await {
                    Ok(()) => {
                        self.set_state(Some(next.clone()));
                        next
                    }
                    Err(err) => {
                        error!(error = %err, "failed to update cluster state");
                        state
                    }
                }
            } else {
                state
            };

            if state.is_frozen() {
                info!("cluster frozen, not making any changes");
                return;
            }

            if !self.singleton && state.singleton {
                info!("configured for normal mode but cluster is in singleton mode, transitioning");
                self.start_transition_to_normal_mode().await;
                return;
            }

            if self.singleton {
                return;
            }

            let sync_present = state
                .sync
                .as_ref()
                .is_some_and(|sync| self.peer_is_present(sync));
            if !sync_present && self.start_takeover("sync gone", &state.init_wal).await {
                return;
            }

            let key = self.id_key.as_str();
            let mut known: HashSet<String> = HashSet::new();
            known.insert(state.primary.logical_id(key).to_owned());
            if let Some(sync) = &state.sync {
                known.insert(sync.logical_id(key).to_owned());
            }

            let mut new_async = Vec::with_capacity(state.asyncs.len());
            let mut changed = false;
            for peer in &state.asyncs {
                if self.peer_is_present(peer) {
                    known.insert(peer.logical_id(key).to_owned());
                    new_async.push(peer.clone());
                } else {
                    debug!(id = peer.logical_id(key), addr = %peer.addr, "async missing");
                    changed = true;
                }
            }

            // Deposed peers must be rebuilt before they rejoin.
            for peer in &state.deposed {
                known.insert(peer.logical_id(key).to_owned());
            }

            for peer in info.peers.as_deref().unwrap_or_default() {
                if known.insert(peer.logical_id(key).to_owned()) {
                    debug!(id = peer.logical_id(key), addr = %peer.addr, "new async");
                    new_async.push(peer.clone());
                    changed = true;
                }
            }

            if changed {
                self.start_update_asyncs(new_async).await;
            }
        }
        .boxed()
    }

    async fn eval_init_cluster_state(&mut self, state: &State) {
        if self.is_self(&state.primary) {
            self.assume_primary().await;
        } else if state.singleton {
            self.assume_unassigned();
        } else if state.sync.as_ref().is_some_and(|sync| self.is_self(sync)) {
            self.assume_sync().await;
        } else if state.deposed.iter().any(|peer| self.is_self(peer)) {
            self.assume_deposed();
        } else if let Some(i) = self.which_async(state) {
            self.assume_async(i);
        } else {
            self.assume_unassigned();
        }
    }

    async fn start_initial_setup(&mut self) {
        let peers = self.info().peers.clone().unwrap_or_default();
        let mut next = State {
            generation: 1,
            primary: self.instance.clone(),
            init_wal: self.db.xlog().zero(),
            tunables: self.db.default_tunables(),
            ..State::default()
        };
        if self.singleton {
            next.singleton = true;
            next.freeze = Some(FreezeDetails::new(SINGLETON_FREEZE_REASON, self.clock.now()));
        } else {
            next.sync = peers.get(1).cloned();
            next.asyncs = peers.iter().skip(2).cloned().collect();
        }

        info!(generation = 1, singleton = self.singleton, "creating initial cluster state");
        if let Err(err) = self.put_cluster_state(&next).await {
            error!(error = %err, "failed to create cluster state");
            self.eval_later(RETRY_DELAY);
            return;
        }
        self.set_state(Some(next));
        self.trigger_eval();
    }

    /// Promote ourselves using the first present async as the new sync.
    /// Returns `false` when no async is available.
    async fn start_takeover(&mut self, reason: &str, min_wal: &Position) -> bool {
        let state = self.current_state();
        let Some(new_sync) = state
            .asyncs
            .iter()
            .find(|peer| self.peer_is_present(peer))
            .cloned()
        else {
            warn!(reason, "would take over but no async peers present");
            return false;
        };

        debug!(reason, "preparing for new generation");
        let new_async = state
            .asyncs
            .iter()
            .filter(|peer| {
                !self.same_logical(Some(*peer), Some(&new_sync)) && self.peer_is_present(peer)
            })
            .cloned()
            .collect();
        let mut deposed = state.deposed.clone();
        if !self.is_self(&state.primary) {
            deposed.push(state.primary.clone());
        }

        self.start_takeover_with_peer(reason, min_wal, Some(new_sync), new_async, deposed)
            .await;
        true
    }

    async fn start_takeover_with_peer(
        &mut self,
        reason: &str,
        min_wal: &Position,
        sync: Option<Instance>,
        asyncs: Vec<Instance>,
        deposed: Vec<Instance>,
    ) {
        info!(reason, min_wal = %min_wal, "starting takeover");
        let current = self.current_state();
        let next = State {
            generation: current.generation + 1,
            primary: self.instance.clone(),
            sync,
            asyncs,
            deposed,
            tunables: current.tunables.clone(),
            ..State::default()
        };
        if !self.is_self(&current.primary) && next.deposed.is_empty() {
            panic!("declaring a new generation without deposing the old primary");
        }

        match self.declare_generation(&current, next, min_wal).await {
            Ok(()) => self.assume_primary().await,
            Err(StateError::DatabaseOffline) => {
                error!(reason, "failed to declare new generation, retrying once the database starts");
                self.eval_on_start = true;
            }
            Err(err @ StateError::ClusterFrozen) => {
                error!(reason, error = %err, "failed to declare new generation");
            }
            Err(err) => {
                error!(reason, error = %err, "failed to declare new generation, backing off");
                self.eval_later(RETRY_DELAY);
            }
        }
    }

    async fn declare_generation(
        &mut self,
        current: &State,
        mut next: State,
        min_wal: &Position,
    ) -> StateResult<()> {
        if current.is_frozen() {
            return Err(StateError::ClusterFrozen);
        }
        // Only a started database can report its log position.
        if self.online != Some(true) {
            return Err(StateError::DatabaseOffline);
        }
        let wal = self.db.xlog_position().await?;
        if self.db.xlog().compare(&wal, min_wal)? == Ordering::Less {
            warn!(found_wal = %wal, min_wal = %min_wal, "would take over but not caught up with primary yet");
            return Err(StateError::PeerNotCaughtUp);
        }
        next.init_wal = wal;

        info!(generation = next.generation, init_wal = %next.init_wal, "declaring new generation");
        self.put_cluster_state(&next).await?;
        self.generation = next.generation;
        self.set_state(Some(next));
        info!(generation = self.generation, "declared new generation");
        Ok(())
    }

    /// As a singleton primary, pick any other present peer as the sync. No
    /// catch-up is needed because nobody else holds data.
    async fn start_transition_to_normal_mode(&mut self) {
        let state = self.current_state();
        if !self.is_self(&state.primary) || self.info().role != Role::Primary {
            panic!("transition to normal mode attempted while not primary");
        }

        let peers = self.info().peers.clone().unwrap_or_default();
        let others: Vec<&Instance> = peers.iter().filter(|peer| !self.is_self(peer)).collect();
        let Some(new_sync) = others.last().map(|peer| (*peer).clone()) else {
            warn!("would transition to normal mode but no peers present");
            return;
        };
        let new_async = others
            .iter()
            .filter(|peer| !self.same_logical(Some(**peer), Some(&new_sync)))
            .map(|peer| (*peer).clone())
            .collect();

        debug!("transitioning to normal mode");
        let zero = self.db.xlog().zero();
        self.start_takeover_with_peer(
            "transitioning to normal mode",
            &zero,
            Some(new_sync),
            new_async,
            Vec::new(),
        )
        .await;
    }

    async fn start_update_asyncs(&mut self, asyncs: Vec<Instance>) {
        let mut next = self.current_state();
        next.asyncs = asyncs;
        info!(asyncs = next.asyncs.len(), "updating list of asyncs");
        match self.put_cluster_state(&next).await {
            Ok(()) => {
                self.set_state(Some(next));
                self.trigger_eval();
            }
            Err(err) => {
                error!(error = %err, "failed to update cluster state");
                self.eval_later(RETRY_DELAY);
            }
        }
    }

    async fn put_cluster_state(&mut self, state: &State) -> StateResult<()> {
        let index = self
            .discoverd
            .set_state(DiscoverdState {
                index: self.state_index,
                state: Some(state.clone()),
            })
            .await?;
        self.state_index = index;
        Ok(())
    }

    // Role assumption

    fn assume_unassigned(&mut self) {
        info!(role = "unassigned", "assuming unassigned role");
        self.upstream = None;
        self.downstream = None;
        self.set_role(Role::Unassigned);
        self.trigger_apply();
    }

    fn assume_deposed(&mut self) {
        info!(role = "deposed", "assuming deposed role");
        self.upstream = None;
        self.downstream = None;
        self.set_role(Role::Deposed);
        self.trigger_apply();
    }

    async fn assume_primary(&mut self) {
        info!(role = "primary", "assuming primary role");
        self.upstream = None;
        self.downstream = self.current_state().sync;
        self.set_role(Role::Primary);

        // Handle anything that changed alongside the role before applying.
        self.eval_cluster_state().await;
        self.trigger_apply();
    }

    async fn assume_sync(&mut self) {
        if self.singleton {
            panic!("cannot assume sync role in singleton mode");
        }
        info!(role = "sync", "assuming sync role");
        let state = self.current_state();
        self.upstream = Some(state.primary);
        self.downstream = state.asyncs.into_iter().next();
        self.set_role(Role::Sync);

        self.eval_cluster_state().await;
        self.trigger_apply();
    }

    fn assume_async(&mut self, i: usize) {
        if self.singleton {
            panic!("cannot assume async role in singleton mode");
        }
        info!(role = "async", position = i, "assuming async role");
        let state = self.current_state();
        self.upstream = lookup_upstream(&state, i);
        self.downstream = lookup_downstream(&state, i);
        self.set_role(Role::Async);
        self.trigger_apply();
    }

    // Database

    fn config(&self) -> Option<Config> {
        let info = self.info();
        match info.role {
            Role::Primary | Role::Sync | Role::Async => Some(Config {
                role: info.role,
                upstream: self.upstream.clone(),
                downstream: self.downstream.clone(),
                state: info.state.clone(),
                tunables: info
                    .state
                    .as_ref()
                    .map(|s| s.tunables.clone())
                    .unwrap_or_default(),
            }),
            Role::Unassigned | Role::Deposed => Some(Config {
                state: info.state.clone(),
                ..Config::none()
            }),
            Role::Unknown | Role::None => None,
        }
    }

    async fn apply_config(&mut self) {
        self.moving();
        let Some(online) = self.online else {
            panic!("applying config with database in unknown state");
        };
        let Some(config) = self.config() else {
            panic!("applying config with role {}", self.info().role);
        };
        if self
            .applied
            .as_ref()
            .is_some_and(|applied| applied.equivalent(&config))
        {
            debug!("skipping config apply, no changes");
            return;
        }

        if let Err(err) = self.reconfigure(&config, online).await {
            error!(error = %err, role = %config.role, "error applying database config");
            self.set_retry_pending(Some(self.clock.now()));
            self.apply_config_later(RETRY_DELAY);
            return;
        }

        info!(role = %config.role, "applied database config");
        self.set_retry_pending(None);
        let online = config.role != Role::None;
        self.online = Some(online);
        self.applied = Some(config);
        if online && std::mem::take(&mut self.eval_on_start) {
            self.trigger_eval();
        }

        // Take another lap in case the desired config moved meanwhile.
        self.trigger_apply();
    }

    async fn reconfigure(&self, config: &Config, online: bool) -> Result<(), DatabaseError> {
        info!(role = %config.role, "reconfiguring database");
        self.db.reconfigure(config).await?;

        if config.role != Role::None {
            if online {
                debug!("skipping start, already online");
            } else {
                debug!("starting database");
                self.db.start().await?;
            }
        } else if online {
            debug!("stopping database");
            self.db.stop().await?;
        } else {
            debug!("skipping stop, already offline");
        }
        Ok(())
    }

    // Chain helpers

    fn is_self(&self, peer: &Instance) -> bool {
        peer.logical_id(&self.id_key) == self.id
    }

    fn same_logical(&self, a: Option<&Instance>, b: Option<&Instance>) -> bool {
        match (a, b) {
            (Some(a), Some(b)) => a.logical_id(&self.id_key) == b.logical_id(&self.id_key),
            (None, None) => true,
            _ => false,
        }
    }

    fn which_async(&self, state: &State) -> Option<usize> {
        state.asyncs.iter().position(|peer| self.is_self(peer))
    }

    /// Whether `other` is in the latest peer list, by logical id.
    fn peer_is_present(&self, other: &Instance) -> bool {
        assert!(
            !self.is_self(other),
            "presence check must never be asked about ourselves"
        );
        let key = self.id_key.as_str();
        self.info().peers.as_ref().is_some_and(|peers| {
            peers
                .iter()
                .any(|peer| peer.logical_id(key) == other.logical_id(key))
        })
    }
}

fn lookup_upstream(state: &State, i: usize) -> Option<Instance> {
    match i {
        0 => state.sync.clone(),
        _ => state.asyncs.get(i - 1).cloned(),
    }
}

fn lookup_downstream(state: &State, i: usize) -> Option<Instance> {
    state.asyncs.get(i + 1).cloned()
}
