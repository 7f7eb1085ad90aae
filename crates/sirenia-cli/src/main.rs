//! Sirenia CLI - inspect and operate sirenia peers.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sirenia")]
#[command(about = "Inspect and operate sirenia peers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a peer's status
    Status {
        /// Address of the peer's status port
        addr: String,
    },

    /// Gracefully stop a peer and its database
    Stop {
        /// Address of the peer's status port
        addr: String,
    },

    /// Read or change the cluster tunables
    Tunables {
        #[command(subcommand)]
        command: TunablesCommand,
    },

    /// Drive a simulated peer with commands read from stdin
    Sim {
        /// Start the cluster in singleton mode
        #[arg(long)]
        singleton: bool,
    },
}

#[derive(Subcommand)]
enum TunablesCommand {
    /// Print the current tunables
    Get {
        /// Address of the peer's status port
        addr: String,
    },

    /// Set tunables on the primary, bumping the version
    Set {
        /// Address of the primary's status port
        addr: String,

        /// Settings as KEY=VALUE
        #[arg(required = true)]
        settings: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let result: anyhow::Result<()> = match cli.command {
        Commands::Status { addr } => commands::peer::status(&addr).await,
        Commands::Stop { addr } => commands::peer::stop(&addr).await,
        Commands::Tunables { command } => match command {
            TunablesCommand::Get { addr } => commands::tunables::get(&addr).await,
            TunablesCommand::Set { addr, settings } => {
                commands::tunables::set(&addr, &settings).await
            }
        },
        Commands::Sim { singleton } => commands::sim::run(singleton).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
