//! Deterministic single-peer simulator.
//!
//! One real [`Peer`] (always `node1`) runs against a [`MemoryDiscoverd`] and
//! a [`SimDatabase`]. Every other peer is simulated by the commands below,
//! which edit membership and the cluster state directly. After any command
//! that may wake the peer, the simulator blocks until the peer has handled
//! every event delivered to it and gone idle, so scripted sessions are
//! reproducible.

mod database;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use sirenia_core::{
    Clock, DiscoverdState, FixedClock, FreezeDetails, Instance, PeerInfo, State,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

pub use database::{SimDatabase, SimDbInfo};

use crate::error::{SimulatorError, StateResult};
use crate::memory::{MemoryDiscoverd, MemoryDiscoverdClient};
use crate::peer::Peer;
use crate::traits::{Database, Discoverd};
use crate::types::{DatabaseEvent, PeerHooks};

/// Metadata key holding each simulated peer's logical name.
pub const SIM_ID_KEY: &str = "SIM_ID";

const FREEZE_REASON: &str = "frozen by simulator";
const WAIT_TIMEOUT: Duration = Duration::from_secs(1);
const DEPOSE_WAL_STEP: u64 = 10;

type SimResult<T> = Result<T, SimulatorError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    AddPeer,
    Bootstrap,
    CatchUp,
    Depose,
    Rebuild,
    Echo,
    Freeze,
    Help,
    Ident,
    LsPeers,
    Peer,
    RmPeer,
    SetClusterState,
    StartPeer,
    Unfreeze,
    Discoverd,
    Exit,
}

struct Command {
    name: &'static str,
    args: &'static str,
    help: &'static str,
    /// Maximum number of arguments; the last one takes the rest of the line.
    arity: usize,
    wait_rest: bool,
    kind: Kind,
}

const COMMANDS: &[Command] = &[
    Command {
        name: "addpeer",
        args: "[NAME]",
        help: "simulate a new peer joining the discoverd cluster",
        arity: 1,
        wait_rest: true,
        kind: Kind::AddPeer,
    },
    Command {
        name: "bootstrap",
        args: "[PRIMARY [SYNC]]",
        help: "simulate initial setup",
        arity: 2,
        wait_rest: true,
        kind: Kind::Bootstrap,
    },
    Command {
        name: "catchUp",
        args: "",
        help: "simulate the peer's database catching up to the primary",
        arity: 0,
        wait_rest: false,
        kind: Kind::CatchUp,
    },
    Command {
        name: "depose",
        args: "",
        help: "simulate a takeover from the current state",
        arity: 0,
        wait_rest: true,
        kind: Kind::Depose,
    },
    Command {
        name: "rebuild",
        args: "NAME",
        help: "simulate rebuilding a deposed peer",
        arity: 1,
        wait_rest: true,
        kind: Kind::Rebuild,
    },
    Command {
        name: "echo",
        args: "STR",
        help: "emit the string to stdout",
        arity: 1,
        wait_rest: false,
        kind: Kind::Echo,
    },
    Command {
        name: "freeze",
        args: "",
        help: "freeze the cluster",
        arity: 0,
        wait_rest: true,
        kind: Kind::Freeze,
    },
    Command {
        name: "help",
        args: "",
        help: "show help output",
        arity: 0,
        wait_rest: false,
        kind: Kind::Help,
    },
    Command {
        name: "ident",
        args: "",
        help: "print the identity of the peer being tested",
        arity: 0,
        wait_rest: false,
        kind: Kind::Ident,
    },
    Command {
        name: "lspeers",
        args: "",
        help: "list simulated peers",
        arity: 0,
        wait_rest: false,
        kind: Kind::LsPeers,
    },
    Command {
        name: "peer",
        args: "",
        help: "dump the peer's current state",
        arity: 0,
        wait_rest: false,
        kind: Kind::Peer,
    },
    Command {
        name: "rmpeer",
        args: "NAME",
        help: "simulate a peer being removed from the discoverd cluster",
        arity: 1,
        wait_rest: true,
        kind: Kind::RmPeer,
    },
    Command {
        name: "setClusterState",
        args: "STATE",
        help: "simulate a write to the cluster state stored in discoverd",
        arity: 1,
        wait_rest: true,
        kind: Kind::SetClusterState,
    },
    Command {
        name: "startPeer",
        args: "",
        help: "start the peer state machine",
        arity: 0,
        wait_rest: true,
        kind: Kind::StartPeer,
    },
    Command {
        name: "unfreeze",
        args: "",
        help: "unfreeze the cluster",
        arity: 0,
        wait_rest: true,
        kind: Kind::Unfreeze,
    },
    Command {
        name: "discoverd",
        args: "",
        help: "print simulated discoverd state",
        arity: 0,
        wait_rest: false,
        kind: Kind::Discoverd,
    },
    Command {
        name: "exit",
        args: "",
        help: "exit the simulator",
        arity: 0,
        wait_rest: false,
        kind: Kind::Exit,
    },
];

/// Output of the `discoverd` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoverdInfo {
    pub state: DiscoverdState,
    pub peers: Vec<Instance>,
}

/// Output of the `peer` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerSimInfo {
    pub peer: PeerInfo,
    pub postgres: SimDbInfo,
}

struct Running {
    peer: Peer,
    task: JoinHandle<StateResult<()>>,
    rest: watch::Receiver<u64>,
    retry: mpsc::UnboundedReceiver<()>,
}

/// Scripted driver for a single [`Peer`].
pub struct Simulator {
    singleton: bool,
    next_peer: u32,
    idents: HashMap<String, Instance>,
    own_name: String,

    store: MemoryDiscoverd,
    client: Arc<MemoryDiscoverdClient>,
    db: Arc<SimDatabase>,
    clock: Arc<dyn Clock>,

    running: Option<Running>,
    /// Database ready events handed to the peer.
    ready_sent: u64,
    exited: bool,
}

impl Simulator {
    pub fn new(singleton: bool) -> Self {
        let store = MemoryDiscoverd::new();
        let own = sim_ident(1, None);
        let own_name = own.logical_id(SIM_ID_KEY).to_owned();
        Self {
            singleton,
            next_peer: 1,
            idents: HashMap::from([(own_name.clone(), own.clone())]),
            own_name,
            client: Arc::new(store.client()),
            db: Arc::new(SimDatabase::new(own, store.clone())),
            store,
            clock: Arc::new(FixedClock::default()),
            running: None,
            ready_sent: 0,
            exited: false,
        }
    }

    /// Replace the clock used for freeze timestamps. Must be called before
    /// `startPeer`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Whether the `exit` command has been run.
    pub fn exited(&self) -> bool {
        self.exited
    }

    pub fn store(&self) -> &MemoryDiscoverd {
        &self.store
    }

    /// The simulated peer's own discoverd instance, as last registered.
    pub fn own_instance(&self) -> Instance {
        self.idents
            .get(&self.own_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Stop the peer task.
    pub fn close(&mut self) {
        if let Some(running) = self.running.take() {
            running.peer.close();
            running.task.abort();
        }
    }

    /// Parse and execute one command line, returning its output.
    ///
    /// Command names are case-insensitive. A trailing `retrylater` makes the
    /// simulator also wait for the peer to schedule a retry.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown commands, bad arguments, rejected cluster
    /// edits, or when the peer does not settle within a second.
    pub async fn run_command(&mut self, line: &str) -> SimResult<String> {
        let line = line.trim();
        let (name, rest) = line.split_once(' ').unwrap_or((line, ""));
        let command = COMMANDS
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| SimulatorError::UnknownCommand(name.to_owned()))?;

        let rest = rest.trim();
        let (rest, retry_later) = match rest.strip_suffix("retrylater") {
            Some(stripped) => (stripped.trim(), true),
            None => (rest, false),
        };
        let args: Vec<&str> = if command.arity == 0 || rest.is_empty() {
            Vec::new()
        } else {
            rest.splitn(command.arity, ' ').collect()
        };

        if retry_later {
            self.drain_retries();
        }
        let output = self.dispatch(command.kind, &args).await?;

        if self.running.is_some() && retry_later {
            self.wait_retry().await?;
        }
        if self.running.is_some() && command.wait_rest {
            self.wait_rest().await?;
        }
        Ok(output)
    }

    async fn dispatch(&mut self, kind: Kind, args: &[&str]) -> SimResult<String> {
        match kind {
            Kind::AddPeer => self.add_peer(args.first().copied()),
            Kind::Bootstrap => self.bootstrap(args),
            Kind::CatchUp => {
                self.db.catch_up()?;
                Ok(String::new())
            }
            Kind::Depose => self.depose(),
            Kind::Rebuild => self.rebuild(args.first().copied()),
            Kind::Echo => Ok(args.first().map(|s| (*s).to_owned()).unwrap_or_default()),
            Kind::Freeze => self.freeze(true),
            Kind::Unfreeze => self.freeze(false),
            Kind::Help => Ok(help()),
            Kind::Ident => {
                let own = self.own_instance();
                Ok(format!("{} {}", own.id, own.addr))
            }
            Kind::LsPeers => dump(&self.store.peers()),
            Kind::Peer => self.peer_info(),
            Kind::RmPeer => self.rm_peer(args.first().copied()),
            Kind::SetClusterState => self.set_cluster_state(args.first().copied()),
            Kind::StartPeer => self.start_peer(),
            Kind::Discoverd => dump(&DiscoverdInfo {
                state: self.store.cluster_state(),
                peers: self.store.peers(),
            }),
            Kind::Exit => {
                self.exited = true;
                Ok(String::new())
            }
        }
    }

    // Synchronisation with the peer task

    fn drain_retries(&mut self) {
        if let Some(running) = self.running.as_mut() {
            while running.retry.try_recv().is_ok() {}
        }
    }

    async fn wait_retry(&mut self) -> SimResult<()> {
        let Some(running) = self.running.as_mut() else {
            return Ok(());
        };
        match tokio::time::timeout(WAIT_TIMEOUT, running.retry.recv()).await {
            Ok(Some(())) => Ok(()),
            Ok(None) => Err(SimulatorError::PeerExited),
            Err(_) => Err(SimulatorError::Timeout("retry signal")),
        }
    }

    /// Wait until the peer has handled every event delivered to it.
    async fn wait_rest(&mut self) -> SimResult<()> {
        let client = Arc::clone(&self.client);
        let ready = self.ready_sent;
        let Some(running) = self.running.as_mut() else {
            return Ok(());
        };
        let waited = tokio::time::timeout(
            WAIT_TIMEOUT,
            running
                .rest
                .wait_for(|handled| *handled >= client.delivered() + ready),
        )
        .await
        .map(|settled| settled.map(|_| ()));
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SimulatorError::PeerExited),
            Err(_) => Err(SimulatorError::Timeout("peer to come to rest")),
        }
    }

    // Identities

    fn new_ident(&mut self, name: Option<&str>) -> Instance {
        self.next_peer += 1;
        let instance = sim_ident(self.next_peer, name);
        self.idents.insert(
            instance.logical_id(SIM_ID_KEY).to_owned(),
            instance.clone(),
        );
        instance
    }

    /// Register `instance` with discoverd, remembering the index it was given.
    fn join(&mut self, instance: Instance) -> Option<Instance> {
        let joined = self.store.peer_joined(instance)?;
        self.idents.insert(
            joined.logical_id(SIM_ID_KEY).to_owned(),
            joined.clone(),
        );
        Some(joined)
    }

    fn put_state(&self, index: u64, state: &State) -> SimResult<u64> {
        Ok(self.store.set_cluster_state(DiscoverdState {
            index,
            state: Some(state.clone()),
        })?)
    }

    // Commands

    fn start_peer(&mut self) -> SimResult<String> {
        if self.running.is_some() {
            return Err(SimulatorError::rejected("peer already started"));
        }
        let own = self.own_instance();
        self.join(own);
        let own = self.own_instance();

        let (rest_tx, rest) = watch::channel(0);
        let (retry_tx, retry) = mpsc::unbounded_channel();
        let discoverd: Arc<dyn Discoverd> = self.client.clone();
        let db: Arc<dyn Database> = self.db.clone();
        let peer = Peer::builder(own, SIM_ID_KEY, discoverd, db)
            .singleton(self.singleton)
            .with_clock(Arc::clone(&self.clock))
            .with_hooks(PeerHooks {
                rest: rest_tx,
                retry: retry_tx,
            })
            .build();

        let task = tokio::spawn({
            let peer = peer.clone();
            async move {
                let result = peer.run().await;
                if let Err(err) = &result {
                    error!(error = %err, "peer exited");
                }
                result
            }
        });

        self.client.start();
        if self.db.start_simulation(DatabaseEvent::default()) {
            self.ready_sent = 1;
        }
        self.running = Some(Running {
            peer,
            task,
            rest,
            retry,
        });
        Ok(String::new())
    }

    fn peer_info(&self) -> SimResult<String> {
        let peer = match &self.running {
            Some(running) => PeerInfo::clone(&running.peer.info()),
            None => PeerInfo {
                id: self.own_name.clone(),
                ..PeerInfo::default()
            },
        };
        dump(&PeerSimInfo {
            peer,
            postgres: self.db.sim_info(),
        })
    }

    fn add_peer(&mut self, name: Option<&str>) -> SimResult<String> {
        let ident = match name.and_then(|name| self.idents.get(name)) {
            Some(ident) => ident.clone(),
            None => self.new_ident(name),
        };

        if let Some(peer) = self.join(ident) {
            // Stand in for a simulated primary noticing the newcomer.
            let cs = self.store.cluster_state();
            if let Some(mut state) = cs.state {
                let own_id = self.own_instance().id;
                let named = state.members().any(|member| member.id == peer.id);
                if state.primary.id != own_id
                    && !named
                    && state.sync.is_some()
                {
                    state.asyncs.push(peer);
                    self.put_state(cs.index, &state)?;
                }
            }
        }
        dump(&self.store.peers())
    }

    fn rm_peer(&mut self, name: Option<&str>) -> SimResult<String> {
        let name = name.ok_or(SimulatorError::Usage("rmpeer NAME"))?;
        if name != self.own_name {
            self.store
                .peer_removed(|peer| peer.logical_id(SIM_ID_KEY) == name);
        }

        let cs = self.store.cluster_state();
        let Some(mut state) = cs.state else {
            return Ok(String::new());
        };
        if state.primary.id == self.own_instance().id {
            return Ok(String::new());
        }

        // Stand in for a simulated primary reacting to the loss.
        let mut index = cs.index;
        if let Some(pos) = state
            .asyncs
            .iter()
            .position(|peer| peer.logical_id(SIM_ID_KEY) == name)
        {
            state.asyncs.remove(pos);
            index = self.put_state(index, &state)?;
        }
        let sync_removed = state
            .sync
            .as_ref()
            .is_some_and(|sync| sync.logical_id(SIM_ID_KEY) == name);
        if sync_removed && !state.asyncs.is_empty() {
            state.generation += 1;
            state.sync = Some(state.asyncs.remove(0));
            self.put_state(index, &state)?;
        }
        Ok(String::new())
    }

    fn bootstrap(&mut self, args: &[&str]) -> SimResult<String> {
        let cs = self.store.cluster_state();
        if cs.state.is_some() {
            return Err(SimulatorError::rejected("cluster is already set up"));
        }
        let peers = self.store.peers();
        if peers.len() < 2 {
            return Err(SimulatorError::rejected(
                "setup requires at least two peers",
            ));
        }

        let mut state = State {
            generation: 1,
            init_wal: self.db.xlog().zero(),
            tunables: self.db.default_tunables(),
            ..State::default()
        };
        match args {
            [primary_name, rest @ ..] => {
                let sync_name = rest.first().copied();
                let mut primary = None;
                let mut sync = None;
                for peer in peers {
                    let name = peer.logical_id(SIM_ID_KEY);
                    if name == *primary_name {
                        primary = Some(peer);
                    } else if sync_name.is_some_and(|s| s == name)
                        || (sync_name.is_none() && sync.is_none())
                    {
                        sync = Some(peer);
                    } else {
                        state.asyncs.push(peer);
                    }
                }
                state.primary = primary.ok_or_else(|| {
                    SimulatorError::rejected(format!("requested primary {primary_name:?} not found"))
                })?;
                state.sync = Some(sync.ok_or_else(|| {
                    SimulatorError::rejected(format!(
                        "requested sync {:?} not found",
                        sync_name.unwrap_or_default()
                    ))
                })?);
            }
            [] => {
                let mut peers = peers.into_iter();
                state.primary = peers.next().unwrap_or_default();
                state.sync = peers.next();
                state.asyncs = peers.collect();
                info!(
                    primary = state.primary.logical_id(SIM_ID_KEY),
                    "selected primary"
                );
            }
        }

        let index = self.put_state(cs.index, &state)?;
        dump(&DiscoverdState {
            index,
            state: Some(state),
        })
    }

    fn depose(&mut self) -> SimResult<String> {
        let cs = self.store.cluster_state();
        let Some(current) = cs.state else {
            return Err(SimulatorError::rejected(
                "cluster is not yet configured (try `bootstrap`)",
            ));
        };
        let Some(primary) = current.sync.clone() else {
            return Err(SimulatorError::rejected("cannot depose with no sync"));
        };
        if current.asyncs.is_empty() {
            return Err(SimulatorError::rejected("cannot depose with no asyncs"));
        }

        let mut asyncs = current.asyncs.clone();
        let sync = asyncs.remove(0);
        let mut deposed = current.deposed.clone();
        deposed.push(current.primary.clone());
        let next = State {
            generation: current.generation + 1,
            init_wal: self
                .db
                .xlog()
                .increment(&current.init_wal, DEPOSE_WAL_STEP)?,
            primary,
            sync: Some(sync),
            asyncs,
            deposed,
            tunables: current.tunables,
            ..State::default()
        };

        let index = self.put_state(cs.index, &next)?;
        dump(&DiscoverdState {
            index,
            state: Some(next),
        })
    }

    fn rebuild(&mut self, name: Option<&str>) -> SimResult<String> {
        let name = name.ok_or(SimulatorError::Usage("rebuild NAME"))?;
        let cs = self.store.cluster_state();
        let Some(mut state) = cs.state else {
            return Err(SimulatorError::rejected(
                "cluster is not yet configured (try `bootstrap`)",
            ));
        };
        let Some(pos) = state
            .deposed
            .iter()
            .position(|peer| peer.logical_id(SIM_ID_KEY) == name)
        else {
            return Err(SimulatorError::rejected(format!(
                "peer {name:?} is not deposed"
            )));
        };
        let peer = state.deposed.remove(pos);

        // A simulated primary takes the rebuilt peer back as an async.
        if state.primary.id != self.own_instance().id {
            state.asyncs.push(peer);
        }

        let index = self.put_state(cs.index, &state)?;
        dump(&DiscoverdState {
            index,
            state: Some(state),
        })
    }

    fn freeze(&mut self, frozen: bool) -> SimResult<String> {
        let cs = self.store.cluster_state();
        let Some(mut state) = cs.state else {
            return Err(SimulatorError::rejected(
                "cluster is not yet configured (try `bootstrap`)",
            ));
        };
        state.freeze = frozen.then(|| FreezeDetails::new(FREEZE_REASON, self.clock.now()));

        let index = self.put_state(cs.index, &state)?;
        dump(&DiscoverdState {
            index,
            state: Some(state),
        })
    }

    fn set_cluster_state(&mut self, raw: Option<&str>) -> SimResult<String> {
        let raw = raw.ok_or(SimulatorError::Usage("setClusterState STATE"))?;
        let state: Option<State> = serde_json::from_str(raw)?;
        let cs = self.store.cluster_state();
        self.store.set_cluster_state(DiscoverdState {
            index: cs.index,
            state,
        })?;
        Ok(String::new())
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.close();
    }
}

/// The `n`th simulated peer, named `node{n}` unless `name` is given.
fn sim_ident(n: u32, name: Option<&str>) -> Instance {
    let name = name.map_or_else(|| format!("node{n}"), str::to_owned);
    let addr = format!("10.0.0.{n}:5432");
    let proto = "tcp".to_owned();
    Instance {
        id: md5_hex(&format!("{proto}-{addr}")),
        addr,
        proto,
        meta: BTreeMap::from([(SIM_ID_KEY.to_owned(), name)]),
        index: 0,
    }
}

fn help() -> String {
    COMMANDS
        .iter()
        .map(|c| format!("{:<16}{:<18}{}", c.name, c.args, c.help))
        .collect::<Vec<_>>()
        .join("\n")
}

fn dump(value: &impl Serialize) -> SimResult<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

fn md5_hex(data: &str) -> String {
    hex::encode(Md5::digest(data.as_bytes()))
}
