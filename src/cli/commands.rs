//! CLI commands for the proposal engine
//!
//! Offline operator helpers: run the selector over a UTXO dump, register a
//! wallet in a data directory, list its open proposals, and print the
//! effective configuration.

use crate::chain::{adapter_for, CoinFamily};
use crate::core::{Coin, EngineConfig, Utxo, WalletAddress, WalletPolicy};
use crate::crypto::multisig_address;
use crate::selection::{FeeMode, SelectionParams, UtxoSelector};
use crate::storage::{FileStorage, Storage};
use std::fs;
use std::path::Path;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Load the configuration file if one was given, else the defaults
pub fn load_config(path: Option<&Path>) -> CliResult<EngineConfig> {
    match path {
        Some(path) => Ok(EngineConfig::from_file(path)?),
        None => Ok(EngineConfig::default()),
    }
}

/// What to select for
pub struct SelectArgs {
    pub coin: Coin,
    pub amounts: Vec<u64>,
    pub fee: FeeMode,
    pub m: u8,
    pub n: u8,
    pub exclude_unconfirmed: bool,
    pub send_max: bool,
}

/// Run the selector over a JSON array of UTXOs
pub fn cmd_select(config: &EngineConfig, utxo_file: &Path, args: SelectArgs) -> CliResult<()> {
    let adapter = adapter_for(args.coin);
    if adapter.capabilities().family != CoinFamily::Utxo {
        return Err(format!("{} has no inputs to select", args.coin).into());
    }

    let data = fs::read_to_string(utxo_file)?;
    let utxos: Vec<Utxo> = serde_json::from_str(&data)?;

    let mut params = SelectionParams::new(args.amounts, args.fee, args.m, args.n);
    params.exclude_unconfirmed = args.exclude_unconfirmed;
    params.send_max = args.send_max;

    let selection = UtxoSelector::new(adapter.as_ref(), &config.selection).select(&utxos, &params)?;

    println!("✅ Selected {} of {} inputs", selection.inputs.len(), utxos.len());
    for input in &selection.inputs {
        println!(
            "   ├─ {} ({} sat, {} conf)",
            input.outpoint(),
            input.satoshis,
            input.confirmations
        );
    }
    println!("   ├─ Amount: {} sat", selection.amount);
    println!("   ├─ Fee: {} sat", selection.fee);
    println!("   ├─ Change: {} sat", selection.change);
    println!("   └─ Size: {} bytes", selection.size);

    Ok(())
}

/// Register a wallet policy (JSON) in a data directory with its first
/// receive address
pub fn cmd_import_wallet(data_dir: &Path, policy_file: &Path) -> CliResult<()> {
    let data = fs::read_to_string(policy_file)?;
    let policy: WalletPolicy = serde_json::from_str(&data)?;
    let policy = WalletPolicy::new(
        policy.id.clone(),
        policy.m,
        policy.n,
        policy.coin,
        policy.network,
        policy.copayers.clone(),
    )?
    .with_single_address(policy.single_address);

    let path = "m/0/0".to_string();
    let address = WalletAddress {
        address: multisig_address(policy.m, &policy.signing_keys(), &path, policy.network),
        path,
        is_change: false,
    };

    let storage = FileStorage::open(data_dir)?;
    storage.insert_wallet(policy.clone(), vec![address.clone()])?;

    println!("✅ Imported wallet {}", policy.id);
    println!("   ├─ Quorum: {}", policy.description());
    println!("   ├─ Coin: {} ({})", policy.coin, policy.network);
    println!("   ├─ Copayers: {}/{}", policy.copayers.len(), policy.n);
    println!("   └─ Receive address: {}", address.address);

    Ok(())
}

/// List the open proposals of a stored wallet
pub async fn cmd_pending(data_dir: &Path, wallet_id: &str) -> CliResult<()> {
    let storage = FileStorage::open(data_dir)?;
    let policy = storage
        .fetch_wallet_policy(wallet_id)
        .await?
        .ok_or_else(|| format!("wallet {} not found", wallet_id))?;
    let proposals = storage.fetch_pending_proposals(wallet_id).await?;

    println!(
        "📋 Wallet {} ({} {}): {} open proposal(s)",
        policy.id,
        policy.description(),
        policy.coin,
        proposals.len()
    );
    for txp in &proposals {
        println!(
            "   ├─ {} [{}] {} sat + {} fee, {}/{} accepts, {}/{} rejects",
            txp.id,
            txp.status.as_str(),
            txp.amount(),
            txp.fee,
            txp.accept_count(),
            txp.required_signatures,
            txp.reject_count(),
            txp.required_rejections
        );
    }

    Ok(())
}

/// Print the effective configuration as JSON
pub fn cmd_config(config: &EngineConfig) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
