//! `sirenia-postgres`: a sirenia peer supervising a local PostgreSQL.
//!
//! Registers with discoverd, runs the peer state machine against the
//! postgres driver and serves the status surface until stopped.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sirenia_core::Instance;
use sirenia_discoverd::{instance_id, DiscoverdClient, Heartbeater, ServiceDiscoverd};
use sirenia_postgres::{Identity, Postgres};
use sirenia_server::{router, AppState, ServerConfig};
use sirenia_state::Peer;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Sirenia PostgreSQL peer.
#[derive(Parser, Debug)]
#[command(name = "sirenia-postgres")]
#[command(about = "Run a sirenia peer managing a local PostgreSQL")]
#[command(version)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

/// Why the process is shutting down.
enum Exit {
    Signal,
    Stopped,
    DatabaseCrashed,
    PeerExited,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug,hyper=info,tower=info,sqlx=warn"
    } else {
        "info,sqlx=warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let config = ServerConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let addr = config.advertise_addr();
    info!(
        id = %config.peer.id,
        addr = %addr,
        singleton = config.peer.singleton,
        service = %config.discoverd.service,
        "sirenia peer starting"
    );

    let discoverd = DiscoverdClient::new(&config.discoverd.url)?;
    let service = discoverd.service(config.discoverd.service.clone());

    let instance = Instance {
        id: instance_id("tcp", &addr),
        addr,
        proto: "tcp".to_owned(),
        meta: BTreeMap::from([(config.peer.id_key.clone(), config.peer.id.clone())]),
        index: 0,
    };

    let db = Arc::new(Postgres::new(
        config.postgres.clone(),
        Identity::new(config.peer.id.clone())
            .with_id_key(config.peer.id_key.clone())
            .singleton(config.peer.singleton),
    ));
    let crashed = db.unexpected_exit();

    // Watch before registering so our own `up` event is not missed.
    let store = Arc::new(ServiceDiscoverd::spawn(service.clone()));
    let heartbeater = Heartbeater::start(
        service,
        instance.clone(),
        config.discoverd.heartbeat_interval(),
    )
    .await
    .context("registering with discoverd")?;

    let peer = Peer::builder(instance, config.peer.id_key.clone(), store.clone(), db.clone())
        .singleton(config.peer.singleton)
        .build();
    let mut peer_task = tokio::spawn({
        let peer = peer.clone();
        async move { peer.run().await }
    });

    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState {
        peer: peer.clone(),
        db: db.clone(),
        shutdown: shutdown.clone(),
    });

    let listener = tokio::net::TcpListener::bind(config.http.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.http.listen_addr))?;
    info!(addr = %config.http.listen_addr, "status server listening");

    let serve_cancel = CancellationToken::new();
    let server = tokio::spawn({
        let cancel = serve_cancel.clone();
        let app = router(state);
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
        }
    });

    let exit = tokio::select! {
        () = shutdown_signal() => Exit::Signal,
        () = shutdown.cancelled() => Exit::Stopped,
        () = crashed.cancelled() => Exit::DatabaseCrashed,
        result = &mut peer_task => {
            match result {
                Ok(Ok(())) => info!("peer exited"),
                Ok(Err(err)) => error!(error = %err, "peer exited with error"),
                Err(err) => error!(error = %err, "peer task panicked"),
            }
            Exit::PeerExited
        }
    };

    match exit {
        // `/stop` has already stopped the database.
        Exit::Stopped => {}
        _ => {
            if let Err(err) = peer.stop().await {
                warn!(error = %err, "error stopping peer");
            }
        }
    }

    if let Err(err) = heartbeater.stop().await {
        warn!(error = %err, "error unregistering from discoverd");
    }
    store.close();

    serve_cancel.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "status server failed"),
        Err(err) => error!(error = %err, "status server task panicked"),
    }

    if matches!(exit, Exit::DatabaseCrashed) {
        anyhow::bail!("postgres exited unexpectedly");
    }
    info!("sirenia peer shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
