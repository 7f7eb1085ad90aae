//! [`Database`] implementation that runs and configures PostgreSQL.
//!
//! The driver owns one data directory and at most one `postgres` process.
//! A primary runs with `synchronous_standby_names` naming its downstream
//! and stays read-only until that downstream has caught up. Standbys are
//! seeded with `pg_basebackup` the first time they start and follow their
//! upstream through `recovery.conf`. Promotion of a running sync touches
//! the trigger file rather than restarting.
//!
//! Operations are serialised; info queries run concurrently with them.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use parking_lot::{Mutex, RwLock};
use sirenia_client::SireniaClient;
use sirenia_core::{Config, DatabaseInfo, Instance, PgXLog, Position, Role, Tunables, XLog};
use sirenia_state::{Database, DatabaseError, DatabaseEvent};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::Executor;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::conf::{self, ConfigData, HBA_CONF, SUPERUSER};
use crate::config::{Identity, PostgresConfig};
use crate::daemon::Daemon;
use crate::error::{PostgresError, PostgresResult};
use crate::sync::SyncWait;
use crate::tunables;

/// Delay between connection and replication polls.
pub(crate) const CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Bound on waiting for an upstream before a base backup. Of the order of
/// the discovery heartbeat, so a vanished upstream is not waited on.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// State shared with the background sync wait.
#[derive(Debug)]
pub(crate) struct Shared {
    settings: PostgresConfig,
    identity: Identity,
    xlog: Arc<PgXLog>,
    pool: RwLock<Option<PgPool>>,
    config: RwLock<Option<Config>>,
    running: AtomicBool,
    synced_downstream: RwLock<Option<Instance>>,
    daemon: Mutex<Option<Daemon>>,
    crashed: CancellationToken,
}

impl Shared {
    pub(crate) fn xlog(&self) -> Arc<PgXLog> {
        Arc::clone(&self.xlog)
    }

    pub(crate) fn repl_timeout(&self) -> Duration {
        self.settings.repl_timeout()
    }

    pub(crate) fn logical_id<'a>(&self, inst: &'a Instance) -> &'a str {
        inst.logical_id(&self.identity.id_key)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn config(&self) -> Option<Config> {
        self.config.read().clone()
    }

    fn set_config(&self, config: Option<Config>) {
        *self.config.write() = config;
    }

    pub(crate) fn set_synced_downstream(&self, inst: Option<Instance>) {
        *self.synced_downstream.write() = inst;
    }

    fn pool(&self) -> PostgresResult<PgPool> {
        if !self.is_running() {
            return Err(PostgresError::NotRunning);
        }
        self.pool.read().clone().ok_or(PostgresError::NotRunning)
    }

    fn sighup(&self) -> PostgresResult<()> {
        debug!("reloading daemon configuration");
        let daemon = self.daemon.lock().clone();
        daemon
            .ok_or(PostgresError::NotRunning)?
            .signal(Signal::SIGHUP)
    }

    async fn write_config(
        &self,
        read_only: bool,
        sync: &str,
        tunables: &Tunables,
    ) -> PostgresResult<()> {
        let rendered = ConfigData {
            id: &self.identity.id,
            port: self.settings.port,
            sync,
            read_only,
            ext_whitelist: self.settings.ext_whitelist,
            tunables: Some(&tunables.data),
        }
        .render();
        let path = self.settings.config_path();
        tokio::fs::write(&path, rendered).await.map_err(|err| {
            error!(path = %path.display(), error = %err, "error writing postgresql.conf");
            PostgresError::from(err)
        })
    }

    /// Make the primary writable, naming `downstream` as its sync.
    pub(crate) async fn enable_writes(
        &self,
        downstream: Option<&Instance>,
        config: &Config,
    ) -> PostgresResult<()> {
        let sync = downstream.map_or("", |d| self.logical_id(d));
        self.write_config(false, sync, &config.tunables).await?;
        self.sighup()
    }

    async fn xlog_position(&self) -> PostgresResult<Position> {
        let pool = self.pool()?;
        let is_primary = self.config().is_some_and(|c| c.role == Role::Primary);
        let query = if is_primary {
            "SELECT pg_current_xlog_location()::text"
        } else {
            "SELECT pg_last_xlog_replay_location()::text"
        };
        let position: Option<String> = sqlx::query_scalar(query).fetch_one(&pool).await?;
        Ok(Position::new(position.unwrap_or_default()))
    }

    async fn user_exists(&self) -> PostgresResult<bool> {
        let pool = self.pool()?;
        let row: Option<i32> = sqlx::query_scalar("SELECT 1 FROM pg_roles WHERE rolname = $1")
            .bind(SUPERUSER)
            .fetch_optional(&pool)
            .await?;
        Ok(row.is_some())
    }

    async fn is_read_write(&self) -> PostgresResult<bool> {
        let pool = self.pool()?;
        let read_only: String = sqlx::query_scalar("SHOW default_transaction_read_only")
            .fetch_one(&pool)
            .await?;
        Ok(read_only == "off")
    }

    /// Sent and flushed positions of the standby connected as `name`.
    pub(crate) async fn check_repl_status(&self, name: &str) -> PostgresResult<(Position, Position)> {
        let pool = self.pool()?;
        let row: Option<(Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT sent_location::text, flush_location::text \
             FROM pg_stat_replication WHERE application_name = $1",
        )
        .bind(name)
        .fetch_optional(&pool)
        .await?;
        match row {
            Some((Some(sent), Some(flushed))) if !sent.is_empty() && !flushed.is_empty() => {
                Ok((Position::new(sent), Position::new(flushed)))
            }
            _ => Err(PostgresError::NoReplicationStatus),
        }
    }

    async fn fill_info(&self, info: &mut DatabaseInfo) -> PostgresResult<()> {
        info.xlog = self.xlog_position().await?.to_string();
        info.user_exists = self.user_exists().await?;
        info.read_write = self.is_read_write().await?;
        Ok(())
    }
}

/// Operation-scoped state, guarded by the operation lock.
#[derive(Debug, Default)]
struct Ops {
    /// The stored config has been applied to the running daemon.
    applied: bool,
    sync_wait: Option<SyncWait>,
}

/// PostgreSQL driver.
#[derive(Debug)]
pub struct Postgres {
    shared: Arc<Shared>,
    ops: tokio::sync::Mutex<Ops>,
    ready: Mutex<Option<oneshot::Receiver<DatabaseEvent>>>,
}

impl Postgres {
    pub fn new(settings: PostgresConfig, identity: Identity) -> Self {
        let (tx, rx) = oneshot::channel();
        // The driver never starts postgres by itself, so it is always ready
        // and offline.
        let _ = tx.send(DatabaseEvent::default());
        Self {
            shared: Arc::new(Shared {
                settings,
                identity,
                xlog: Arc::new(PgXLog),
                pool: RwLock::new(None),
                config: RwLock::new(None),
                running: AtomicBool::new(false),
                synced_downstream: RwLock::new(None),
                daemon: Mutex::new(None),
                crashed: CancellationToken::new(),
            }),
            ops: tokio::sync::Mutex::new(Ops::default()),
            ready: Mutex::new(Some(rx)),
        }
    }

    /// Cancelled when the daemon exits without being stopped. The process
    /// should exit, since the peer can no longer vouch for the database.
    pub fn unexpected_exit(&self) -> CancellationToken {
        self.shared.crashed.clone()
    }

    pub fn settings(&self) -> &PostgresConfig {
        &self.shared.settings
    }

    fn same_peer(&self, a: Option<&Instance>, b: Option<&Instance>) -> bool {
        match (a, b) {
            (Some(a), Some(b)) => self.shared.logical_id(a) == self.shared.logical_id(b),
            (None, None) => true,
            _ => false,
        }
    }

    fn validate(&self, config: &Config) -> PostgresResult<()> {
        match config.role {
            Role::Primary if !self.shared.identity.singleton && config.downstream.is_none() => {
                Err(PostgresError::MissingDownstream)
            }
            Role::Sync | Role::Async if config.upstream.is_none() => {
                Err(PostgresError::MissingUpstream)
            }
            Role::Primary | Role::Sync | Role::Async | Role::None => Ok(()),
            other => Err(PostgresError::UnknownRole(other)),
        }
    }

    /// Apply `next`, or the stored config when starting.
    async fn reconfigure_locked(&self, ops: &mut Ops, next: Option<&Config>) -> PostgresResult<()> {
        let current = self.shared.config();
        let config = next
            .or(current.as_ref())
            .cloned()
            .ok_or(PostgresError::Unconfigured)?;
        self.transition(ops, current.as_ref(), &config, next.is_some())
            .await?;
        self.shared.set_config(Some(config));
        ops.applied = true;
        Ok(())
    }

    async fn transition(
        &self,
        ops: &mut Ops,
        current: Option<&Config>,
        config: &Config,
        explicit: bool,
    ) -> PostgresResult<()> {
        if config.role == Role::None {
            info!(reason = "null role", "nothing to do");
            return Ok(());
        }

        let running = self.shared.is_running();
        if let Some(current) = current {
            if explicit && ops.applied && current.equivalent(config) {
                info!(reason = "config already applied", "nothing to do");
                return Ok(());
            }

            if running && current.is_tunables_update(config) {
                info!(version = config.tunables.version, "tunables only update");
                return self.apply_tunables(ops, current, config).await;
            }

            // Streaming from the same upstream works the same for either role.
            if explicit
                && ops.applied
                && running
                && current.role == Role::Async
                && config.role == Role::Sync
                && self.same_peer(current.upstream.as_ref(), config.upstream.as_ref())
            {
                if config.tunables.version > current.tunables.version {
                    info!("becoming sync with same upstream and updating tunables");
                    return self.apply_tunables(ops, current, config).await;
                }
                info!(reason = "becoming sync with same upstream", "nothing to do");
                return Ok(());
            }
        }

        self.cancel_sync_wait(ops).await;
        self.shared.set_synced_downstream(None);

        if let Some(current) = current.filter(|_| running) {
            if current.role == Role::Primary && config.role == Role::Primary {
                return self.update_sync(ops, config).await;
            }

            if current.is_new_downstream(config) {
                let mut result = Ok(());
                if config.tunables.version > current.tunables.version {
                    info!("updating tunables");
                    result = self.apply_tunables(ops, current, config).await;
                }
                if let Some(downstream) = &config.downstream {
                    info!(to = %downstream.addr, "downstream changed");
                    self.wait_for_sync(ops, downstream, config, false).await;
                }
                return result;
            }
        }

        if config.role == Role::Primary {
            self.assume_primary(ops, current, config).await
        } else {
            self.assume_standby(ops, config).await
        }
    }

    async fn apply_tunables(
        &self,
        ops: &mut Ops,
        current: &Config,
        config: &Config,
    ) -> PostgresResult<()> {
        let (read_only, sync) = if config.role == Role::Primary {
            let sync = config
                .downstream
                .as_ref()
                .map_or("", |d| self.shared.logical_id(d));
            (false, sync)
        } else {
            (true, "")
        };
        self.shared
            .write_config(read_only, sync, &config.tunables)
            .await?;

        if tunables::requires_restart(&current.tunables.data, &config.tunables.data) {
            info!("restarting database to apply tunables");
            self.stop_locked(ops).await?;
            self.start_daemon().await
        } else {
            info!("applying tunables online");
            self.shared.sighup()
        }
    }

    /// Point a running primary at a new sync, read-only until it catches up.
    async fn update_sync(&self, ops: &mut Ops, config: &Config) -> PostgresResult<()> {
        let Some(downstream) = &config.downstream else {
            return self.shared.enable_writes(None, config).await;
        };
        info!(downstream = %downstream.addr, "changing sync");
        self.shared
            .write_config(true, self.shared.logical_id(downstream), &config.tunables)
            .await?;
        self.shared.sighup()?;
        self.wait_for_sync(ops, downstream, config, true).await;
        Ok(())
    }

    async fn assume_primary(
        &self,
        ops: &mut Ops,
        current: Option<&Config>,
        config: &Config,
    ) -> PostgresResult<()> {
        let downstream = config.downstream.as_ref();

        if self.shared.is_running() {
            let role = current.map_or(Role::Unknown, |c| c.role);
            if role != Role::Sync {
                return Err(PostgresError::RunningAs(role));
            }
            info!("promoting to primary");
            let trigger = self.shared.settings.trigger_path();
            tokio::fs::write(&trigger, b"").await.map_err(|err| {
                error!(path = %trigger.display(), error = %err, "error creating trigger file");
                PostgresError::from(err)
            })?;
            match downstream {
                Some(downstream) => self.wait_for_sync(ops, downstream, config, true).await,
                None => self.shared.enable_writes(None, config).await?,
            }
            return Ok(());
        }

        info!(downstream = ?downstream.map(|d| &d.addr), "starting as primary");
        self.init_db().await?;
        remove_if_exists(&self.shared.settings.recovery_conf_path()).await?;
        self.shared
            .write_config(downstream.is_some(), "", &config.tunables)
            .await?;
        self.start_daemon().await?;

        if let Err(err) = self.create_superuser().await {
            error!(error = %err, "error creating superuser");
            if let Err(stop_err) = self.stop_locked(ops).await {
                debug!(error = %stop_err, "ignoring error stopping postgres");
            }
            return Err(err);
        }

        if let Some(downstream) = downstream {
            self.wait_for_sync(ops, downstream, config, true).await;
        }
        Ok(())
    }

    async fn assume_standby(&self, ops: &mut Ops, config: &Config) -> PostgresResult<()> {
        let upstream = config
            .upstream
            .as_ref()
            .ok_or(PostgresError::MissingUpstream)?;
        info!(upstream = %upstream.addr, "starting up as standby");

        if self.shared.is_running() {
            // Postgres follows a new upstream after a restart with a new
            // recovery.conf; no base backup needed.
            self.stop_locked(ops).await?;
        } else {
            if self.shared.settings.wait_upstream {
                self.wait_for_upstream(upstream).await?;
            }
            info!(upstream = %upstream.addr, "pulling basebackup");
            if let Err(err) = self.base_backup(upstream).await {
                error!(error = %err, "error pulling basebackup");
                self.wipe_data_dir().await;
                return Err(err);
            }
            // The upstream may be mid-takeover; a copied trigger file would
            // promote this standby too.
            remove_if_exists(&self.shared.settings.trigger_path()).await?;
        }

        self.shared.write_config(true, "", &config.tunables).await?;
        self.write_recovery_conf(upstream).await?;
        self.start_daemon().await?;

        if let Some(downstream) = &config.downstream {
            self.wait_for_sync(ops, downstream, config, false).await;
        }
        Ok(())
    }

    async fn wait_for_upstream(&self, upstream: &Instance) -> PostgresResult<()> {
        info!(upstream = %upstream.addr, "waiting for upstream to come online");
        let client =
            SireniaClient::for_database(&upstream.addr).map_err(|_| PostgresError::UpstreamOffline)?;
        let online = client
            .wait_for(UPSTREAM_TIMEOUT, |status| {
                status
                    .database
                    .as_ref()
                    .is_some_and(|db| db.running && db.user_exists && !db.xlog.is_empty())
            })
            .await;
        match online {
            Ok(()) => {
                info!(upstream = %upstream.addr, "upstream is online");
                Ok(())
            }
            Err(err) => {
                error!(upstream = %upstream.addr, error = %err, "upstream did not come online in time");
                Err(PostgresError::UpstreamOffline)
            }
        }
    }

    async fn base_backup(&self, upstream: &Instance) -> PostgresResult<()> {
        let settings = &self.shared.settings;
        let mut cmd = Command::new(settings.bin_path("pg_basebackup"));
        cmd.arg("--pgdata")
            .arg(settings.data_dir())
            .arg("--dbname")
            .arg(conf::conninfo(
                upstream,
                &settings.password,
                &self.shared.identity.id,
            ))
            .args(["--xlog-method=stream", "--progress", "--verbose"]);
        run_command(cmd).await
    }

    /// Initialise the data directory. Fails harmlessly when it already is.
    async fn init_db(&self) -> PostgresResult<()> {
        let settings = &self.shared.settings;
        debug!(dir = %settings.data_dir.display(), "starting initdb");
        let mut cmd = Command::new(settings.bin_path("initdb"));
        cmd.arg("--pgdata")
            .arg(settings.data_dir())
            .args([
                "--username=postgres",
                "--encoding=UTF-8",
                "--locale=en_US.UTF-8",
            ]);
        if let Err(err) = run_command(cmd).await {
            debug!(error = %err, "ignoring initdb error");
        }
        tokio::fs::write(settings.hba_conf_path(), HBA_CONF).await?;
        Ok(())
    }

    async fn create_superuser(&self) -> PostgresResult<()> {
        let pool = self.shared.pool()?;
        let mut tx = pool.begin().await?;
        (&mut *tx)
            .execute(sqlx::raw_sql("SET TRANSACTION READ WRITE"))
            .await?;
        let create = format!(
            "DO $body$ \
             BEGIN \
                IF NOT EXISTS (SELECT * FROM pg_catalog.pg_user WHERE usename = '{SUPERUSER}') THEN \
                   CREATE USER {SUPERUSER} WITH SUPERUSER CREATEDB CREATEROLE REPLICATION PASSWORD {password}; \
                END IF; \
             END \
             $body$;",
            password = conf::quote_literal(&self.shared.settings.password),
        );
        (&mut *tx).execute(sqlx::raw_sql(&create)).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn write_recovery_conf(&self, upstream: &Instance) -> PostgresResult<()> {
        let settings = &self.shared.settings;
        let info = conf::conninfo(upstream, &settings.password, &self.shared.identity.id);
        let trigger = settings.trigger_path();
        let rendered = conf::recovery_conf(&info, &trigger.to_string_lossy());
        tokio::fs::write(settings.recovery_conf_path(), rendered).await?;
        Ok(())
    }

    async fn wipe_data_dir(&self) {
        let dir = self.shared.settings.data_dir();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "error reading data dir");
                return;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let removed = match entry.file_type().await {
                Ok(kind) if kind.is_dir() => tokio::fs::remove_dir_all(&path).await,
                _ => tokio::fs::remove_file(&path).await,
            };
            if let Err(err) = removed {
                warn!(path = %path.display(), error = %err, "error wiping data dir");
            }
        }
    }

    /// Spawn the daemon and wait for it to accept connections.
    async fn start_daemon(&self) -> PostgresResult<()> {
        let settings = &self.shared.settings;
        info!(
            data_dir = %settings.data_dir.display(),
            bin_dir = %settings.bin_dir.display(),
            "starting postgres"
        );
        let daemon = Daemon::spawn(settings, self.shared.crashed.clone())
            .await
            .map_err(|err| {
                error!(error = %err, "failed to start postgres");
                err
            })?;
        *self.shared.daemon.lock() = Some(daemon);
        self.shared.running.store(true, Ordering::SeqCst);

        let options = PgConnectOptions::new()
            .host("127.0.0.1")
            .port(settings.port)
            .username("postgres")
            .database("postgres");
        let deadline = Instant::now() + settings.op_timeout();
        debug!("waiting for postgres to start");
        loop {
            let err = match PgPoolOptions::new()
                .max_connections(4)
                .acquire_timeout(Duration::from_secs(5))
                .connect_with(options.clone())
                .await
            {
                Ok(pool) => match sqlx::query("SELECT 1").execute(&pool).await {
                    Ok(_) => {
                        *self.shared.pool.write() = Some(pool);
                        info!("postgres started");
                        return Ok(());
                    }
                    Err(err) => {
                        pool.close().await;
                        err
                    }
                },
                Err(err) => err,
            };

            debug!(error = %err, "ignoring error connecting to postgres");
            if Instant::now() + CHECK_INTERVAL > deadline {
                error!(error = %err, "timed out waiting for postgres to start");
                if let Err(stop_err) = self.stop_daemon().await {
                    error!(error = %stop_err, "error stopping postgres");
                }
                return Err(err.into());
            }
            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    }

    async fn stop_locked(&self, ops: &mut Ops) -> PostgresResult<()> {
        self.cancel_sync_wait(ops).await;
        self.stop_daemon().await
    }

    async fn stop_daemon(&self) -> PostgresResult<()> {
        info!("stopping postgres");
        let pool = self.shared.pool.write().take();
        if let Some(pool) = pool {
            pool.close().await;
        }

        let daemon = self.shared.daemon.lock().clone();
        if let Some(daemon) = daemon {
            daemon.stop(self.shared.settings.op_timeout()).await?;
        }
        *self.shared.daemon.lock() = None;
        self.shared.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_for_sync(&self, ops: &mut Ops, downstream: &Instance, config: &Config, enable_writes: bool) {
        self.cancel_sync_wait(ops).await;
        ops.sync_wait = Some(SyncWait::spawn(
            Arc::clone(&self.shared),
            downstream.clone(),
            config.clone(),
            enable_writes,
        ));
    }

    async fn cancel_sync_wait(&self, ops: &mut Ops) {
        if let Some(wait) = ops.sync_wait.take() {
            wait.cancel().await;
        }
    }
}

#[async_trait]
impl Database for Postgres {
    fn xlog(&self) -> Arc<dyn XLog> {
        self.shared.xlog()
    }

    async fn xlog_position(&self) -> Result<Position, DatabaseError> {
        Ok(self.shared.xlog_position().await?)
    }

    async fn reconfigure(&self, config: &Config) -> Result<(), DatabaseError> {
        self.validate(config)?;
        let mut ops = self.ops.lock().await;
        if !self.shared.is_running() {
            self.shared.set_config(Some(config.clone()));
            ops.applied = false;
            return Ok(());
        }
        Ok(self.reconfigure_locked(&mut ops, Some(config)).await?)
    }

    async fn start(&self) -> Result<(), DatabaseError> {
        let mut ops = self.ops.lock().await;
        if self.shared.is_running() {
            return Err(PostgresError::AlreadyRunning.into());
        }
        match self.shared.config() {
            None => return Err(PostgresError::Unconfigured.into()),
            Some(config) if config.role == Role::None => {
                return Err(PostgresError::StartWithoutRole.into());
            }
            Some(_) => {}
        }
        Ok(self.reconfigure_locked(&mut ops, None).await?)
    }

    async fn stop(&self) -> Result<(), DatabaseError> {
        let mut ops = self.ops.lock().await;
        if !self.shared.is_running() {
            return Err(PostgresError::AlreadyStopped.into());
        }
        Ok(self.stop_locked(&mut ops).await?)
    }

    fn ready(&self) -> oneshot::Receiver<DatabaseEvent> {
        self.ready.lock().take().unwrap_or_else(|| {
            warn!("database ready receiver already taken");
            oneshot::channel().1
        })
    }

    async fn info(&self) -> DatabaseInfo {
        let mut info = DatabaseInfo {
            config: self.shared.config(),
            running: self.shared.is_running(),
            synced_downstream: self.shared.synced_downstream.read().clone(),
            ..DatabaseInfo::default()
        };
        if let Err(err) = self.shared.fill_info(&mut info).await {
            info.error = Some(err.to_string());
        }
        info
    }

    fn default_tunables(&self) -> Tunables {
        tunables::default_tunables()
    }

    fn validate_tunables(&self, tunables: &Tunables) -> Result<(), DatabaseError> {
        Ok(tunables::validate(tunables)?)
    }
}

async fn remove_if_exists(path: &Path) -> PostgresResult<()> {
    match tokio::fs::remove_file(path).await {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
            error!(path = %path.display(), error = %err, "error removing file");
            Err(err.into())
        }
        _ => Ok(()),
    }
}

async fn run_command(mut cmd: Command) -> PostgresResult<()> {
    debug!(command = ?cmd.as_std(), "running command");
    let status = cmd.status().await?;
    if status.success() {
        return Ok(());
    }
    Err(PostgresError::Command {
        command: cmd.as_std().get_program().to_string_lossy().into_owned(),
        status: status.to_string(),
    })
}
