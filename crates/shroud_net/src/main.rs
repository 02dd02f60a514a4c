pub mod config;
pub mod data;
pub mod demo;
pub mod mailbox_client;
pub mod rendezvous;
pub mod wire;

use std::fs::File;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use shroud_core::{FunctionParty, PeerEngine, FP_ID};
use tracing::info;

use crate::config::Config;
use crate::demo::{DemoOptions, StaticLabels};
use crate::mailbox_client::TcpMailbox;
use crate::rendezvous::Rendezvous;

#[derive(Parser)]
#[command(name = "shroud")]
#[command(about = "Privacy-preserving joint Gram matrix computation over masked row partitions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host the rendezvous server and participant mailboxes
    Rendezvous {
        /// Public address to bind
        #[arg(long, default_value = "127.0.0.1:9530")]
        bind: SocketAddr,
        /// Input peer ids expected in this run
        #[arg(long, required = true, num_args = 1..)]
        peers: Vec<String>,
    },
    /// Contribute a row block as an input peer
    Peer {
        /// Participant id; the lexicographic order of ids fixes pairing roles
        #[arg(long)]
        id: String,
        /// Rendezvous address (defaults to the config file entry)
        #[arg(long)]
        rendezvous: Option<SocketAddr>,
        /// Headerless CSV file with this peer's rows
        #[arg(long)]
        data: PathBuf,
        /// Zero-based CSV column holding labels instead of features
        #[arg(long)]
        label_col: Option<usize>,
        /// Override the configured timeout threshold, in seconds
        #[arg(long)]
        timeout: Option<f64>,
    },
    /// Collect fragments as the function party and assemble the matrix
    Fp {
        /// Rendezvous address (defaults to the config file entry)
        #[arg(long)]
        rendezvous: Option<SocketAddr>,
        /// Also request each peer's label vector
        #[arg(long)]
        labels: bool,
        /// Override the configured timeout threshold, in seconds
        #[arg(long)]
        timeout: Option<f64>,
        /// Write the assembled matrix to this path as JSON
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Single-process demonstration on a synthetic partition
    Demo {
        #[arg(long, default_value_t = 3)]
        peers: usize,
        #[arg(long, default_value_t = 60)]
        samples: usize,
        #[arg(long, default_value_t = 2)]
        features: usize,
        /// Exercise the label collection path too
        #[arg(long)]
        labels: bool,
        /// Run k-NN outlier scoring on the result with this neighborhood size
        #[arg(long)]
        outlier_k: Option<usize>,
        #[arg(long, default_value_t = 7)]
        seed: u64,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Commands::Rendezvous { bind, peers } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(async {
                let rendezvous = Rendezvous::bind(bind, &peers).await?;
                info!(address = %rendezvous.local_addr()?, "rendezvous ready");
                rendezvous.serve().await
            })
        }
        Commands::Peer {
            id,
            rendezvous,
            data,
            label_col,
            timeout,
        } => {
            let config = Config::load()?;
            let addr = resolve_rendezvous(rendezvous, &config)?;
            let mut protocol = config.protocol.clone();
            if let Some(secs) = timeout {
                protocol.timeout_secs = secs;
            }
            let (block, labels) = crate::data::load_csv_matrix(&data, label_col)?;
            info!(id = %id, rows = block.rows(), cols = block.cols(), "row block loaded");

            let mailbox = TcpMailbox::connect(&id, addr, &config.transport)?;
            let others: Vec<String> = mailbox
                .input_peers()
                .into_iter()
                .filter(|p| *p != id)
                .collect();
            let mut engine =
                PeerEngine::new(&id, others, block, protocol, mailbox, StaticLabels { labels })?;
            engine.run()?;
            info!(id = %id, "peer finished");
            Ok(())
        }
        Commands::Fp {
            rendezvous,
            labels,
            timeout,
            output,
        } => {
            let config = Config::load()?;
            let addr = resolve_rendezvous(rendezvous, &config)?;
            let mut protocol = config.protocol.clone();
            if let Some(secs) = timeout {
                protocol.timeout_secs = secs;
            }

            let mailbox = TcpMailbox::connect(FP_ID, addr, &config.transport)?;
            let peers = mailbox.input_peers();
            let mut fp = FunctionParty::new(peers, protocol, mailbox, ())?;
            fp.run(labels)?;

            let gram = fp.gram_matrix()?;
            info!(rows = gram.rows(), cols = gram.cols(), "gram matrix assembled");
            if labels {
                match fp.labels_concatenated() {
                    Some(collected) => info!(count = collected.len(), "labels collected"),
                    None => tracing::warn!("label collection was incomplete"),
                }
            }
            if let Some(path) = output {
                serde_json::to_writer_pretty(File::create(&path)?, &gram)?;
                info!(path = %path.display(), "matrix written");
            }
            Ok(())
        }
        Commands::Demo {
            peers,
            samples,
            features,
            labels,
            outlier_k,
            seed,
        } => {
            demo::run(&DemoOptions {
                peers,
                samples,
                features,
                labels,
                outlier_k,
                seed,
            })?;
            Ok(())
        }
    }
}

fn resolve_rendezvous(cli: Option<SocketAddr>, config: &Config) -> anyhow::Result<SocketAddr> {
    match cli {
        Some(addr) => Ok(addr),
        None => config
            .transport
            .rendezvous
            .parse()
            .with_context(|| format!("bad rendezvous address `{}`", config.transport.rendezvous)),
    }
}
