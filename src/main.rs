//! peerd: runs the peer pool of a node
//!
//! Loads the configuration, opens the address book, wires the in-memory sync
//! oracles into the pool and keeps it running until Ctrl-C.

use clap::{Parser, Subcommand};
use node_peers::config::{Chain, NodeConfig};
use node_peers::network::sync::DEFAULT_BATCH_SIZE;
use node_peers::network::{
    AddrBook, AddressFilter, AddressSource, BlockDownload, Connector, HeaderSync, JobSources,
    MessageBus, PoolManager, StatusEvent,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "peerd")]
#[command(version)]
#[command(about = "Peer connection daemon for a blockchain node", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the address book
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Chain to join (mainnet, testnet, regtest)
    #[arg(long, value_parser = parse_chain)]
    chain: Option<Chain>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the peer pool until interrupted
    Start {
        /// Peers to connect to first (comma separated)
        #[arg(long, value_delimiter = ',')]
        connect: Vec<String>,

        /// Addresses to accept connections on (comma separated)
        #[arg(short, long, value_delimiter = ',')]
        listen: Vec<String>,

        /// Number of outgoing connections to keep
        #[arg(short, long)]
        target: Option<usize>,
    },

    /// List addresses from the address book
    Addresses {
        /// Number of addresses to show
        #[arg(short, long, default_value = "20")]
        count: usize,

        /// Only addresses we completed a handshake with
        #[arg(long)]
        connected: bool,
    },

    /// Print the effective configuration
    Config,
}

fn parse_chain(s: &str) -> Result<Chain, String> {
    match s.to_ascii_lowercase().as_str() {
        "mainnet" | "main" => Ok(Chain::Mainnet),
        "testnet" | "test" => Ok(Chain::Testnet),
        "regtest" => Ok(Chain::Regtest),
        other => Err(format!("unknown chain '{}'", other)),
    }
}

fn main() -> Result<(), BoxError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(chain) = cli.chain {
        config.chain = chain;
    }
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    match cli.command {
        Commands::Start {
            connect,
            listen,
            target,
        } => {
            config.peers.extend(connect);
            config.listen.extend(listen);
            if let Some(target) = target {
                config.target_outgoing = target;
            }
            config.validate()?;
            run_start(config)
        }
        Commands::Addresses { count, connected } => {
            let book = AddrBook::open(&config.addr_book_path(), config.chain)?;
            let filter = AddressFilter {
                chain: Some(config.chain),
                connected_only: connected,
                limit: count,
                ..Default::default()
            };
            let found = book.find(&filter);
            println!("{} of {} addresses:", found.len(), book.len());
            for address in found {
                let seen = address
                    .last_connected
                    .and_then(|t| chrono::DateTime::from_timestamp(t, 0))
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!("  {:<48} {:?}  last connected {}", address.to_string(), address.services, seen);
            }
            Ok(())
        }
        Commands::Config => {
            config.validate()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn run_start(config: NodeConfig) -> Result<(), BoxError> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let book = Arc::new(AddrBook::open(&config.addr_book_path(), config.chain)?);
        let downloads = Arc::new(BlockDownload::new(DEFAULT_BATCH_SIZE));
        let headers = Arc::new(HeaderSync::new(config.chain).with_downloads(downloads.clone()));
        let jobs = JobSources::new(headers.clone(), downloads);
        let connector = Connector::with_bus(MessageBus::new());

        log::info!(
            "Starting peer pool on {} (target {} outgoing)",
            config.chain.name(),
            config.target_outgoing
        );
        let (pool, task) = PoolManager::start(&config, book, jobs, connector)?;

        for address in config.listen_addresses()? {
            pool.add_listener(address).await?;
        }

        let mut status = pool.subscribe_status();
        let reporter = tokio::spawn(async move {
            loop {
                match status.recv().await {
                    Ok(event) => log_status(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        log::debug!("Status reporter skipped {} events", skipped)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        tokio::signal::ctrl_c().await?;
        log::info!("Shutting down...");

        pool.shutdown().await?;
        task.await?;
        reporter.abort();

        let (height, hash) = headers.tip();
        log::info!("Header tip at height {}: {}", height, hash);
        Ok::<(), BoxError>(())
    })
}

fn log_status(event: &StatusEvent) {
    match event {
        StatusEvent::PeerCount { active, outgoing } => {
            log::info!("Peers: {} active, {} outgoing", active, outgoing)
        }
        StatusEvent::VerifiedCount(count) => log::info!("Verified peers: {}", count),
        StatusEvent::Disconnected {
            id,
            address,
            reason,
        } => log::debug!(
            "Peer {} ({}) gone: {}",
            id,
            address,
            reason.as_deref().unwrap_or("no reason")
        ),
        other => log::debug!("{:?}", other),
    }
}
