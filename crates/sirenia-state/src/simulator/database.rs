//! Database double whose log position follows the cluster state.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sirenia_core::{
    Config, DatabaseInfo, Instance, PgXLog, Position, Role, State, Tunables, XLog,
};
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::error::DatabaseError;
use crate::memory::MemoryDiscoverd;
use crate::traits::Database;
use crate::types::DatabaseEvent;

/// Units the primary's log advances by whenever it is (re)configured.
const WRITE_STEP: u64 = 10;

/// What the simulated database looks like from outside.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimDbInfo {
    pub config: Option<Config>,
    pub online: bool,
    pub xlog: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xlog_waiting: Option<Position>,
}

/// A database that writes nothing but keeps a plausible log position.
///
/// As primary the position jumps forward on every reconfigure or start, as
/// if writes arrived immediately. A sync that has not yet reached the
/// generation's initial position records it as a target and only gets past
/// it on [`catch_up`]. Asyncs never move.
///
/// [`catch_up`]: SimDatabase::catch_up
#[derive(Debug)]
pub struct SimDatabase {
    instance: Instance,
    store: MemoryDiscoverd,
    xlog: Arc<PgXLog>,
    info: Mutex<SimDbInfo>,
    ready_tx: Mutex<Option<oneshot::Sender<DatabaseEvent>>>,
    ready_rx: Mutex<Option<oneshot::Receiver<DatabaseEvent>>>,
}

impl SimDatabase {
    pub fn new(instance: Instance, store: MemoryDiscoverd) -> Self {
        let xlog = Arc::new(PgXLog);
        let (tx, rx) = oneshot::channel();
        Self {
            instance,
            store,
            info: Mutex::new(SimDbInfo {
                xlog: xlog.zero(),
                ..SimDbInfo::default()
            }),
            xlog,
            ready_tx: Mutex::new(Some(tx)),
            ready_rx: Mutex::new(Some(rx)),
        }
    }

    pub fn sim_info(&self) -> SimDbInfo {
        self.info.lock().clone()
    }

    /// Send the ready event. Returns `false` if it was already sent.
    pub fn start_simulation(&self, event: DatabaseEvent) -> bool {
        match self.ready_tx.lock().take() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Let a waiting sync reach the primary's position.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is not a sync waiting to catch up.
    pub fn catch_up(&self) -> Result<(), DatabaseError> {
        let mut info = self.info.lock();
        let Some(waiting) = info.xlog_waiting.take() else {
            error!("catch up requested when not sync or not waiting");
            return Err(DatabaseError::invalid("not waiting to catch up"));
        };
        info.xlog = self.xlog.increment(&waiting, WRITE_STEP).map_err(|err| {
            DatabaseError::invalid(err.to_string())
        })?;
        Ok(())
    }

    fn update_xlog(&self, info: &mut SimDbInfo, state: Option<&State>) -> Result<(), DatabaseError> {
        let (Some(state), Some(_)) = (state, info.config.as_ref()) else {
            return Ok(());
        };
        if !info.online {
            return Ok(());
        }

        let compare = |a: &Position, b: &Position| {
            self.xlog
                .compare(a, b)
                .map_err(|err| DatabaseError::invalid(err.to_string()))
        };

        if state.primary.id == self.instance.id {
            if compare(&state.init_wal, &info.xlog)? == Ordering::Greater {
                return Err(DatabaseError::invalid(
                    "primary is behind the generation's initial xlog",
                ));
            }
            info.xlog = self
                .xlog
                .increment(&info.xlog, WRITE_STEP)
                .map_err(|err| DatabaseError::invalid(err.to_string()))?;
        } else if state
            .sync
            .as_ref()
            .is_some_and(|sync| sync.id == self.instance.id)
        {
            // A sync already past the generation start is streaming.
            if compare(&state.init_wal, &info.xlog)? != Ordering::Less {
                info.xlog_waiting = Some(state.init_wal.clone());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Database for SimDatabase {
    fn xlog(&self) -> Arc<dyn XLog> {
        self.xlog.clone()
    }

    async fn xlog_position(&self) -> Result<Position, DatabaseError> {
        let info = self.info.lock();
        if !info.online {
            return Err(DatabaseError::Offline);
        }
        Ok(info.xlog.clone())
    }

    async fn reconfigure(&self, config: &Config) -> Result<(), DatabaseError> {
        let cluster = self.store.cluster_state();
        if cluster.state.is_none() && config.role != Role::None {
            return Err(DatabaseError::invalid(
                "attempted to configure database with no cluster state",
            ));
        }

        let mut info = self.info.lock();
        if info
            .config
            .as_ref()
            .is_some_and(|current| current.equivalent(config))
        {
            return Ok(());
        }

        info!(role = %config.role, "reconfiguring database");
        info.xlog_waiting = None;
        info.config = Some(config.clone());
        self.update_xlog(&mut info, cluster.state.as_ref())
    }

    async fn start(&self) -> Result<(), DatabaseError> {
        let cluster = self.store.cluster_state();
        let mut info = self.info.lock();
        if info.config.is_none() {
            return Err(DatabaseError::invalid("cannot start before configured"));
        }
        if info.online {
            return Err(DatabaseError::invalid("cannot start while running"));
        }
        if let Some(waiting) = &info.xlog_waiting {
            return Err(DatabaseError::invalid(format!(
                "unexpected xlog_waiting {waiting}"
            )));
        }

        info!("starting database");
        info.online = true;
        self.update_xlog(&mut info, cluster.state.as_ref())
    }

    async fn stop(&self) -> Result<(), DatabaseError> {
        let mut info = self.info.lock();
        if !info.online {
            return Err(DatabaseError::invalid("cannot stop while stopped"));
        }
        info!("stopping database");
        info.online = false;
        Ok(())
    }

    fn ready(&self) -> oneshot::Receiver<DatabaseEvent> {
        self.ready_rx.lock().take().unwrap_or_else(|| {
            let (_, rx) = oneshot::channel();
            rx
        })
    }

    async fn info(&self) -> DatabaseInfo {
        let info = self.info.lock();
        DatabaseInfo {
            config: info.config.clone(),
            running: info.online,
            xlog: info.xlog.to_string(),
            user_exists: true,
            read_write: info
                .config
                .as_ref()
                .is_some_and(|config| config.role == Role::Primary),
            ..DatabaseInfo::default()
        }
    }

    fn default_tunables(&self) -> Tunables {
        Tunables::default()
    }

    fn validate_tunables(&self, _tunables: &Tunables) -> Result<(), DatabaseError> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use sirenia_core::DiscoverdState;

    use super::*;

    fn node(n: u8) -> Instance {
        Instance {
            id: format!("id{n}"),
            addr: format!("10.0.0.{n}:5432"),
            proto: "tcp".to_owned(),
            ..Instance::default()
        }
    }

    fn store_with(state: State) -> MemoryDiscoverd {
        let store = MemoryDiscoverd::new();
        store
            .set_cluster_state(DiscoverdState {
                index: 0,
                state: Some(state),
            })
            .unwrap();
        store
    }

    fn config(role: Role, upstream: Option<Instance>) -> Config {
        Config {
            role,
            upstream,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn primary_advances_on_start() {
        let store = store_with(State {
            generation: 1,
            primary: node(1),
            sync: Some(node(2)),
            init_wal: PgXLog.zero(),
            ..State::default()
        });
        let db = SimDatabase::new(node(1), store);
        assert!(matches!(db.xlog_position().await, Err(DatabaseError::Offline)));

        db.reconfigure(&config(Role::Primary, None)).await.unwrap();
        db.start().await.unwrap();
        assert_eq!(db.xlog_position().await.unwrap().as_str(), "0/0000000A");
    }

    #[tokio::test]
    async fn sync_waits_until_caught_up() {
        let store = store_with(State {
            generation: 2,
            primary: node(1),
            sync: Some(node(2)),
            init_wal: "0/0000000A".into(),
            ..State::default()
        });
        let db = SimDatabase::new(node(2), store);
        db.reconfigure(&config(Role::Sync, Some(node(1)))).await.unwrap();
        db.start().await.unwrap();

        let info = db.sim_info();
        assert_eq!(info.xlog, PgXLog.zero());
        assert_eq!(info.xlog_waiting, Some("0/0000000A".into()));

        db.catch_up().unwrap();
        let info = db.sim_info();
        assert_eq!(info.xlog.as_str(), "0/00000014");
        assert!(info.xlog_waiting.is_none());
        assert!(db.catch_up().is_err());
    }

    #[tokio::test]
    async fn equivalent_config_is_not_reapplied() {
        let store = store_with(State {
            generation: 1,
            primary: node(1),
            sync: Some(node(2)),
            init_wal: PgXLog.zero(),
            ..State::default()
        });
        let db = SimDatabase::new(node(1), store);
        let config = Config {
            downstream: Some(node(2)),
            ..config(Role::Primary, None)
        };
        db.reconfigure(&config).await.unwrap();
        db.start().await.unwrap();
        db.reconfigure(&config).await.unwrap();
        assert_eq!(db.xlog_position().await.unwrap().as_str(), "0/0000000A");

        // A new downstream is a real change.
        let config = Config {
            downstream: Some(node(3)),
            ..config
        };
        db.reconfigure(&config).await.unwrap();
        assert_eq!(db.xlog_position().await.unwrap().as_str(), "0/00000014");
    }

    #[tokio::test]
    async fn refuses_roles_without_cluster_state() {
        let db = SimDatabase::new(node(1), MemoryDiscoverd::new());
        assert!(db.reconfigure(&config(Role::Async, None)).await.is_err());
        db.reconfigure(&Config::none()).await.unwrap();
    }

    #[test]
    fn ready_is_sent_once() {
        let db = SimDatabase::new(node(1), MemoryDiscoverd::new());
        let mut rx = db.ready();
        assert!(db.start_simulation(DatabaseEvent::default()));
        assert!(!db.start_simulation(DatabaseEvent::default()));
        assert_eq!(rx.try_recv().unwrap(), DatabaseEvent::default());
    }
}
