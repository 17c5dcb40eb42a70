//! Transaction proposal engine CLI
//!
//! Developer tooling around the engine's storage and selector.

use clap::{Parser, Subcommand};
use multisig_txp::cli::{self, SelectArgs};
use multisig_txp::core::Coin;
use multisig_txp::selection::FeeMode;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "txp")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Transaction proposals for M-of-N multisig wallets", long_about = None)]
struct Cli {
    /// Data directory of the file-backed store
    #[arg(short, long, default_value = ".txp_data")]
    data_dir: PathBuf,

    /// Engine configuration file (JSON); defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run input selection over a JSON file of UTXOs
    Select {
        /// File holding a JSON array of UTXOs
        #[arg(short, long)]
        utxos: PathBuf,

        /// Output amounts in satoshis (repeatable)
        #[arg(short, long, required_unless_present = "send_max")]
        amount: Vec<u64>,

        #[arg(long, default_value = "btc")]
        coin: Coin,

        /// Fee rate in satoshis per kB
        #[arg(long, default_value = "10000")]
        fee_per_kb: u64,

        /// Absolute fee in satoshis; overrides --fee-per-kb
        #[arg(long)]
        fee: Option<u64>,

        /// Required signatures
        #[arg(short, default_value = "1")]
        m: u8,

        /// Total copayers
        #[arg(short, default_value = "1")]
        n: u8,

        #[arg(long)]
        exclude_unconfirmed: bool,

        /// Spend everything to a single output
        #[arg(long)]
        send_max: bool,
    },

    /// Register a wallet policy (JSON) in the data directory
    ImportWallet {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// List the open proposals of a wallet
    Pending {
        #[arg(short, long)]
        wallet: String,
    },

    /// Print the effective configuration
    Config,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Select {
            utxos,
            amount,
            coin,
            fee_per_kb,
            fee,
            m,
            n,
            exclude_unconfirmed,
            send_max,
        } => {
            let amounts = if send_max { vec![0] } else { amount };
            let fee = match fee {
                Some(fee) => FeeMode::Fixed(fee),
                None => FeeMode::PerKb(fee_per_kb),
            };
            let args = SelectArgs {
                coin,
                amounts,
                fee,
                m,
                n,
                exclude_unconfirmed,
                send_max,
            };
            cli::cmd_select(&config, &utxos, args)?;
        }

        Commands::ImportWallet { file } => {
            cli::cmd_import_wallet(&cli.data_dir, &file)?;
        }

        Commands::Pending { wallet } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::cmd_pending(&cli.data_dir, &wallet))?;
        }

        Commands::Config => {
            cli::cmd_config(&config)?;
        }
    }

    Ok(())
}
