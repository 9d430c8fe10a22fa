use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod audit;
mod client;
mod config;
mod path;
mod plan;
mod progress;
mod protocol;
mod quic;
mod server;
mod session;
mod tls;
mod transport;

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Minimal QUIC-based point-to-point file transfer", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Display transfer progress
    #[arg(short, long, global = true)]
    progress: bool,

    /// Bytes per binary frame (overrides config)
    #[arg(long, global = true)]
    chunk_size: Option<usize>,

    /// Seconds to wait for the peer before giving up (overrides config)
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Config directory
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen for uploads and downloads
    Listen {
        /// Address to listen on, host[:port] (overrides config)
        addr: Option<String>,

        /// Confine transfers to this directory
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Audit log file path
        #[arg(short, long)]
        audit_log: Option<PathBuf>,
    },

    /// Copy a file to or from a listener
    #[command(visible_alias = "cp")]
    Copy {
        /// Source then destination; exactly one of them is host[:port]:/path
        #[arg(required = true, num_args = 1..)]
        paths: Vec<String>,
    },

    /// Generate default config
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Cli {
        verbose,
        progress,
        chunk_size,
        timeout,
        config_dir,
        command,
    } = Cli::parse();

    // Setup logging
    tracing_subscriber::fmt()
        .with_max_level(if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO })
        .init();

    let settings = || {
        config::Settings::resolve(
            config::load(config_dir.as_deref())?,
            &config::Overrides {
                chunk_size,
                timeout_secs: timeout,
                progress,
            },
        )
    };

    match command {
        Commands::Listen { addr, root, audit_log } => {
            let settings = settings()?;
            let (host, port) = match addr {
                Some(addr) => config::parse_listen_addr(&addr, settings.listener_port)?,
                None => (settings.listener_bind.clone(), settings.listener_port),
            };
            tracing::info!("Starting listener on {}:{}", host, port);
            server::run(&settings, &host, port, root, audit_log).await?;
        }
        Commands::Copy { paths } => {
            let settings = settings()?;
            client::run(&paths, &settings).await?;
        }
        Commands::Init => {
            config::init(config_dir.as_deref())?;
        }
    }

    Ok(())
}
