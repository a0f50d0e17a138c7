//! Cinder node binary.
//!
//! Opens the chain database under the data directory and either runs the
//! node event loop or performs one maintenance command: mining, macroblock
//! and snapshot export/import, invariant checks and status queries.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, error, info, warn};

use cinder_chain::node::MINE_ATTEMPTS;
use cinder_chain::{ChainEvent, ChainRequest, Node, NodeConfig};
use cinder_core::crypto::Kdf;
use cinder_core::rules::Rules;
use cinder_core::types::{encode, HeightRange, Macroblock};

/// File under the data directory holding the miner key seed.
const SEED_FILE: &str = "miner.seed";

#[derive(Parser, Debug)]
#[command(name = "cinder-node", version, about = "Cinder chain-state node")]
struct Cli {
    /// Data directory for chain storage and the miner seed
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Local development rules: no proof-of-work, short maturities
    #[arg(long)]
    regtest: bool,

    /// Log level filter (overrides the configuration file)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the cursor, fossil height and pool size.
    Status,
    /// Assemble and mine blocks on top of the cursor.
    Mine {
        #[arg(long, default_value_t = 1)]
        count: u64,
    },
    /// Squash an active height range into a macroblock file.
    Export {
        #[arg(long)]
        from: u64,
        #[arg(long)]
        to: u64,
        #[arg(long)]
        out: PathBuf,
    },
    /// Write the whole live state as one macroblock file.
    Snapshot {
        #[arg(long)]
        out: PathBuf,
    },
    /// Apply a macroblock or snapshot file on top of the cursor.
    Import {
        #[arg(long)]
        file: PathBuf,
    },
    /// Verify database and tree invariants.
    Check,
    /// List rewards of blocks mined here.
    Mined {
        #[arg(long, default_value_t = 0)]
        since: u64,
    },
    /// Run the event loop until Ctrl+C.
    Run {
        /// Mine a block every N seconds
        #[arg(long)]
        mine_interval_secs: Option<u64>,
    },
}

impl Cli {
    fn node_config(&self) -> Result<NodeConfig> {
        let mut config = NodeConfig::load(self.config.as_deref()).context("loading configuration")?;
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if self.regtest {
            config.rules = Rules::regtest();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.node_config()?;
    init_logging(&config.log_level, &cli.log_format);

    info!("Cinder node v{}", env!("CARGO_PKG_VERSION"));
    info!(data_dir = %config.data_dir.display(), fake_pow = config.rules.fake_pow, "starting");

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    let kdf = load_or_create_seed(&config.data_dir)?;
    let (node, requests) = Node::new(config, kdf).context("opening node")?;

    match cli.command {
        Command::Status => status(&node),
        Command::Mine { count } => {
            for _ in 0..count {
                match node.mine_block(MINE_ATTEMPTS)? {
                    Some(id) => println!("{id}"),
                    None => bail!("no block mined at height {}", node.cursor().id.height + 1),
                }
            }
            Ok(())
        }
        Command::Export { from, to, out } => {
            let range = HeightRange::new(from, to);
            let Some(mb) = node.with_processor(|p| p.export_macroblock(range))? else {
                bail!("range {from}..={to} is not exportable");
            };
            write_macroblock(&out, &mb)
        }
        Command::Snapshot { out } => {
            let Some(mb) = node.with_processor(|p| p.export_snapshot())? else {
                bail!("nothing to snapshot: the chain is empty");
            };
            write_macroblock(&out, &mb)
        }
        Command::Import { file } => {
            let bytes = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let (mb, _): (Macroblock, usize) = bincode::decode_from_slice(&bytes, bincode::config::standard())
                .context("decoding macroblock")?;
            if !node.with_processor(|p| p.import_macroblock(&mb))? {
                bail!("macroblock rejected");
            }
            status(&node)
        }
        Command::Check => {
            node.with_processor(|p| p.check_invariants())?;
            println!("ok");
            Ok(())
        }
        Command::Mined { since } => {
            for (id, amount) in node.with_processor(|p| p.mined_since(since))? {
                println!("{id} {amount}");
            }
            Ok(())
        }
        Command::Run { mine_interval_secs } => {
            run(node, requests, mine_interval_secs).await;
            Ok(())
        }
    }
}

fn status(node: &Node) -> Result<()> {
    let cursor = node.cursor();
    let (fossil, tips, definition) = node.with_processor(|p| {
        let fossil = p.db().fossil_height()?;
        let tips = p.db().enum_tips()?.len();
        Ok::<_, cinder_chain::ChainError>((fossil, tips, p.definition(false)))
    })?;
    let report = serde_json::json!({
        "height": cursor.id.height,
        "hash": cursor.id.hash.to_string(),
        "definition": definition.to_string(),
        "tips": tips,
        "chain_work": cursor.chain_work.to_string(),
        "difficulty_next": cursor.difficulty_next,
        "subsidy_open": cursor.subsidy_open,
        "fossil_height": fossil,
        "pool_txs": node.pool_len(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn write_macroblock(path: &Path, mb: &Macroblock) -> Result<()> {
    let bytes = encode(mb).context("encoding macroblock")?;
    std::fs::write(path, &bytes).with_context(|| format!("writing {}", path.display()))?;
    let range = mb.range().context("macroblock has no valid height range")?;
    info!(min = range.min, max = range.max, bytes = bytes.len(), path = %path.display(), "macroblock written");
    Ok(())
}

/// Miner keys come from a hex seed kept next to the chain data.
fn load_or_create_seed(data_dir: &Path) -> Result<Kdf> {
    let path = data_dir.join(SEED_FILE);
    if path.exists() {
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let bytes = hex::decode(text.trim()).context("miner seed is not hex")?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("miner seed must be 32 bytes"))?;
        return Ok(Kdf::from_seed(seed));
    }
    let seed: [u8; 32] = rand::random();
    std::fs::write(&path, hex::encode(seed)).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "created miner seed");
    Ok(Kdf::from_seed(seed))
}

async fn run(
    node: Arc<Node>,
    mut requests: tokio::sync::mpsc::UnboundedReceiver<ChainRequest>,
    mine_interval_secs: Option<u64>,
) {
    // No transport is attached: requests are only logged.
    let watcher = Arc::clone(&node);
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            match request {
                ChainRequest::Data { id, want_body, .. } => {
                    debug!(%id, want_body, "data wanted, no transport attached");
                }
                ChainRequest::Misbehaved(peer) => warn!(%peer, "peer misbehaved"),
                ChainRequest::NewState => info!(cursor = %watcher.cursor().id, "new state"),
                ChainRequest::RolledBack => info!("chain rolled back"),
            }
        }
    });

    if let Some(secs) = mine_interval_secs {
        let events = node.events();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs.max(1)));
            loop {
                ticker.tick().await;
                if events.send(ChainEvent::Mine).is_err() {
                    break;
                }
            }
        });
    }

    info!("node running (Ctrl+C to stop)");
    tokio::select! {
        _ = node.run() => {
            info!("node event loop exited");
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("failed to listen for Ctrl+C: {}", e);
            }
            info!("shutdown signal received");
        }
    }
    info!("cinder node shutdown complete");
}

/// Initialize tracing with the given filter and output format.
///
/// `format = "json"` selects structured JSON output; anything else is text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
