//! Gossamer — seed-coordinated gossip overlay.
//!
//! Seeds keep the authoritative membership list through a quorum protocol;
//! peers bootstrap through the seeds, attach preferentially to
//! well-connected neighbors, flood gossip with dedup, and watch each other
//! for failures.

use clap::{Parser, Subcommand};
use gossamer::{config, peer, seed, NodeError};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "gossamer", version, about = "Seed-coordinated gossip overlay")]
struct Args {
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Run a membership seed.
    Seed {
        /// Seed directory file: one `IP,PORT` line per seed.
        config: PathBuf,
        /// Listen port; must appear in the seed directory.
        port: u16,
    },
    /// Run an overlay peer.
    Peer {
        /// Seed directory file: one `IP,PORT` line per seed.
        config: PathBuf,
        /// Listen port.
        port: u16,
        /// Address to bind and advertise (defaults to 127.0.0.1).
        bind_ip: Option<IpAddr>,
    },
}

impl Role {
    fn log_file(&self) -> String {
        match self {
            Role::Seed { port, .. } => format!("outputfile_seed_{port}.txt"),
            Role::Peer { port, .. } => format!("outputfile_peer_{port}.txt"),
        }
    }
}

fn init_logging(path: &str) -> Result<(), std::io::Error> {
    let file = std::fs::File::create(path)?;
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env().add_directive("gossamer=info".parse().unwrap()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file)),
        )
        .init();
    Ok(())
}

async fn run(args: Args) -> Result<(), NodeError> {
    match args.role {
        Role::Seed { config: path, port } => {
            let directory = config::load_seed_directory(&path)?;
            info!("seed directory: {} seeds", directory.len());
            let handle = seed::spawn(directory, port, config::NodeConfig::default()).await?;
            tokio::signal::ctrl_c().await?;
            info!("shutting down seed {}", handle.id);
            handle.shutdown();
        }
        Role::Peer {
            config: path,
            port,
            bind_ip,
        } => {
            let directory = config::load_seed_directory(&path)?;
            info!("seed directory: {} seeds", directory.len());
            let handle =
                peer::spawn(directory, port, bind_ip, config::NodeConfig::default()).await?;
            tokio::signal::ctrl_c().await?;
            info!("shutting down peer {}", handle.id);
            handle.shutdown();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = init_logging(&args.role.log_file()) {
        eprintln!("cannot open log file: {e}");
        std::process::exit(1);
    }
    info!("gossamer v{VERSION}");

    if let Err(e) = run(args).await {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}
