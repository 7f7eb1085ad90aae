//! Shared harness for simulator-driven integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sirenia_core::{
    DiscoverdState, FreezeDetails, Instance, PeerInfo, Position, Role, State,
    SINGLETON_FREEZE_REASON,
};
use sirenia_state::simulator::{DiscoverdInfo, PeerSimInfo, SimDbInfo, Simulator, SIM_ID_KEY};

/// A simulator that panics on any failed command.
pub struct Harness {
    pub sim: Simulator,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            sim: Simulator::new(false),
        }
    }

    pub fn singleton() -> Self {
        Self {
            sim: Simulator::new(true),
        }
    }

    pub async fn run(&mut self, cmd: &str) -> String {
        self.sim
            .run_command(cmd)
            .await
            .unwrap_or_else(|err| panic!("`{cmd}` failed: {err}"))
    }

    pub async fn run_all(&mut self, cmds: &[&str]) {
        for cmd in cmds {
            self.run(cmd).await;
        }
    }

    pub async fn set_state(&mut self, state: &State) {
        let json = serde_json::to_string(state).unwrap();
        self.run(&format!("setClusterState {json}")).await;
    }

    pub async fn peer(&mut self) -> PeerSimInfo {
        serde_json::from_str(&self.run("peer").await).unwrap()
    }

    pub async fn discoverd(&mut self) -> DiscoverdInfo {
        serde_json::from_str(&self.run("discoverd").await).unwrap()
    }

    pub fn cluster_state(&self) -> DiscoverdState {
        self.sim.store().cluster_state()
    }
}

/// The instance the simulator creates for `node{n}` with presence `index`.
pub fn node(n: u32, index: u64) -> Instance {
    let addr = format!("10.0.0.{n}:5432");
    let digest = {
        use md5::{Digest, Md5};
        hex::encode(Md5::digest(format!("tcp-{addr}").as_bytes()))
    };
    Instance {
        id: digest,
        addr,
        proto: "tcp".to_owned(),
        meta: BTreeMap::from([(SIM_ID_KEY.to_owned(), format!("node{n}"))]),
        index,
    }
}

pub fn zero() -> Position {
    Position::new("0/00000000")
}

pub fn pos(raw: &str) -> Position {
    Position::new(raw)
}

pub fn frozen_at() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

pub fn singleton_state(primary: Instance) -> State {
    State {
        generation: 1,
        primary,
        init_wal: zero(),
        singleton: true,
        freeze: Some(FreezeDetails::new(SINGLETON_FREEZE_REASON, frozen_at())),
        ..State::default()
    }
}

/// Expected peer snapshot; the id is always `node1`.
pub fn expect_peer(info: &PeerSimInfo, role: Role, peers: Vec<Instance>, state: Option<State>) {
    let expected = PeerInfo {
        id: "node1".to_owned(),
        role,
        retry_pending: None,
        state,
        peers: Some(peers),
    };
    assert_eq!(info.peer, expected);
}

/// Builder for the expected simulated database.
#[derive(Debug, Clone)]
pub struct DbExpect {
    role: Role,
    upstream: Option<Instance>,
    downstream: Option<Instance>,
    online: bool,
    xlog: Position,
    waiting: Option<Position>,
}

impl DbExpect {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            upstream: None,
            downstream: None,
            online: role != Role::None,
            xlog: zero(),
            waiting: None,
        }
    }

    /// A database that was told to stop, or never started.
    pub fn offline() -> Self {
        Self::new(Role::None)
    }

    pub fn upstream(mut self, peer: Instance) -> Self {
        self.upstream = Some(peer);
        self
    }

    pub fn downstream(mut self, peer: Instance) -> Self {
        self.downstream = Some(peer);
        self
    }

    pub fn xlog(mut self, raw: &str) -> Self {
        self.xlog = pos(raw);
        self
    }

    pub fn waiting(mut self, raw: &str) -> Self {
        self.waiting = Some(pos(raw));
        self
    }

    pub fn check(&self, info: &SimDbInfo) {
        let config = info.config.as_ref().expect("database never configured");
        assert_eq!(config.role, self.role, "role");
        assert_eq!(config.upstream, self.upstream, "upstream");
        assert_eq!(config.downstream, self.downstream, "downstream");
        assert_eq!(info.online, self.online, "online");
        assert_eq!(info.xlog, self.xlog, "xlog");
        assert_eq!(info.xlog_waiting, self.waiting, "xlog_waiting");
    }
}
