// CLI commands

use crate::crypto::{Address, KeyPair};
use crate::error::NodeError;
use crate::network::worker::OverflowPolicy;
use crate::node::{Node, NodeConfig};
use clap::{Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "orecoin")]
#[command(about = "Proof-of-work ledger node", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum OverflowArg {
    Drop,
    Block,
    Reject,
}

impl From<OverflowArg> for OverflowPolicy {
    fn from(arg: OverflowArg) -> Self {
        match arg {
            OverflowArg::Drop => OverflowPolicy::DropNewest,
            OverflowArg::Block => OverflowPolicy::Block,
            OverflowArg::Reject => OverflowPolicy::Reject,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the genesis block
    Init {
        /// Address receiving the genesis reward
        address: String,
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,
    },

    /// Run the node
    Run {
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,
        /// Address to accept peer connections on
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Peer addresses to dial on startup
        #[arg(long = "peer")]
        peers: Vec<String>,
        /// Mine blocks
        #[arg(long)]
        mine: bool,
        /// Address receiving block rewards (required with --mine)
        #[arg(long)]
        reward_address: Option<String>,
        /// Message handler concurrency
        #[arg(long, default_value_t = 4)]
        workers: usize,
        /// What to do with inbound messages when the queue is full
        #[arg(long, value_enum, default_value_t = OverflowArg::Drop)]
        overflow: OverflowArg,
    },

    /// Print chain info
    Info {
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,
    },

    /// Generate a key pair and print its address
    KeyGen,
}

/// CLI handler
pub struct CliHandler;

impl CliHandler {
    pub fn handle(cli: Cli) -> Result<(), NodeError> {
        match cli.command {
            Commands::Init { address, data_dir } => Self::init(address, data_dir),
            Commands::Run {
                data_dir,
                listen,
                peers,
                mine,
                reward_address,
                workers,
                overflow,
            } => Self::run(data_dir, listen, peers, mine, reward_address, workers, overflow),
            Commands::Info { data_dir } => Self::info(data_dir),
            Commands::KeyGen => Self::keygen(),
        }
    }

    fn init(address: String, data_dir: PathBuf) -> Result<(), NodeError> {
        let node = Node::open(NodeConfig {
            data_dir: Some(data_dir),
            ..NodeConfig::default()
        })?;
        let genesis = node.create_genesis(&Address(address))?;

        println!("Genesis block created");
        println!("  Hash:   {}", genesis.hash);
        println!("  Height: {}", genesis.height);
        println!("  Reward: {}", genesis.transactions[0].outputs[0].value);
        Ok(())
    }

    fn run(
        data_dir: PathBuf,
        listen: Option<SocketAddr>,
        peers: Vec<String>,
        mine: bool,
        reward_address: Option<String>,
        workers: usize,
        overflow: OverflowArg,
    ) -> Result<(), NodeError> {
        if mine && reward_address.is_none() {
            return Err(NodeError::Internal(
                "--mine requires --reward-address".into(),
            ));
        }

        let cfg = NodeConfig {
            data_dir: Some(data_dir),
            listen_addr: listen,
            bootstrap: peers,
            miner: mine,
            reward_address: reward_address.map(Address),
            workers,
            overflow: overflow.into(),
            ..NodeConfig::default()
        };

        let runtime = tokio::runtime::Runtime::new()
            .map_err(|e| NodeError::Internal(format!("failed to start runtime: {}", e)))?;
        runtime.block_on(async {
            let mut node = Node::open(cfg)?;
            node.start().await?;
            log::info!("node running at height {}", node.best_height());

            tokio::signal::ctrl_c()
                .await
                .map_err(|e| NodeError::Internal(format!("signal wait failed: {}", e)))?;
            log::info!("shutting down");
            node.shutdown();
            Ok(())
        })
    }

    fn info(data_dir: PathBuf) -> Result<(), NodeError> {
        let node = Node::open(NodeConfig {
            data_dir: Some(data_dir),
            ..NodeConfig::default()
        })?;

        println!("Chain info:");
        println!("  Height: {}", node.best_height());
        match node.chain.tip() {
            Some(tip) => {
                println!("  Tip:    {}", tip.hash);
                println!("  Work:   {}", tip.work);
            }
            None => println!("  Tip:    (chain not initialized)"),
        }
        println!("  UTXO records: {}", node.utxo.len().map_err(NodeError::from)?);
        Ok(())
    }

    fn keygen() -> Result<(), NodeError> {
        let key = KeyPair::generate();
        println!("Address: {}", key.address);
        println!("Secret:  {}", hex::encode(key.secret_bytes()));
        Ok(())
    }
}
