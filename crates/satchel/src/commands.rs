//! Subcommand handlers. Each prints one JSON document to stdout.

use std::path::Path;

use bitcoin::hex::FromHex;
use bitcoin::{Network, Txid};
use eyre::{eyre, WrapErr};
use serde::Serialize;

use satchel_core::provider::SeedKeyTree;
use satchel_core::psbt::PsbtService;
use satchel_core::units::{btc_to_sats, sats_to_btc};
use satchel_core::{Account, EngineConfig, SendRequest, Utxo, Wallet};

use crate::cli::{AccountArgs, Cli, Command};

// ==============================================================================
// Views
// ==============================================================================

#[derive(Debug, Serialize)]
struct AccountView {
    index: u32,
    script_type: String,
    hd_path: String,
    address: String,
    public_key: String,
    master_fingerprint: String,
}

impl From<&Account> for AccountView {
    fn from(account: &Account) -> Self {
        Self {
            index: account.index(),
            script_type: account.script_type().to_string(),
            hd_path: account.hd_path().to_owned(),
            address: account.address().to_string(),
            public_key: account.public_key().to_string(),
            master_fingerprint: account.master_fingerprint().to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct FeeView {
    amount: u64,
    fee: u64,
    inputs: usize,
    change: Option<u64>,
}

#[derive(Debug, Serialize)]
struct PsbtView {
    unsigned_txid: Txid,
    stage: String,
    inputs: usize,
    outputs: usize,
    fee: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ConvertView {
    sats: u64,
    btc: String,
    unit: String,
}

// ==============================================================================
// Dispatch
// ==============================================================================

pub async fn run(cli: Cli) -> eyre::Result<()> {
    let Cli {
        seed,
        network,
        config,
        command,
    } = cli;
    let config = load_config(config.as_deref())?;
    let wallet = Wallet::new(network, config);

    match command {
        Command::Account(args) => {
            let account = unlock(&wallet, seed.as_deref(), &args).await?;
            print_json(&AccountView::from(&account))
        }
        Command::EstimateFee {
            account,
            utxos,
            amount,
            fee_rate,
        } => {
            let account = unlock(&wallet, seed.as_deref(), &account).await?;
            let utxos = load_utxos(&utxos)?;
            let estimate = wallet
                .estimate_fee(&account, &utxos, amount, fee_rate)
                .context("estimate fee")?;
            print_json(&FeeView {
                amount,
                fee: estimate.fee,
                inputs: estimate.selection.inputs.len(),
                change: estimate.selection.change.as_ref().map(|c| c.value),
            })
        }
        Command::MaxSpendable {
            account,
            utxos,
            fee_rate,
        } => {
            let account = unlock(&wallet, seed.as_deref(), &account).await?;
            let utxos = load_utxos(&utxos)?;
            let max = wallet
                .max_spendable_balance(&account, &utxos, fee_rate)
                .context("search max spendable balance")?;
            print_json(&max)
        }
        Command::Create {
            account,
            utxos,
            recipients,
            fee_rate,
            rbf,
        } => {
            let account = unlock(&wallet, seed.as_deref(), &account).await?;
            let utxos = load_utxos(&utxos)?;
            let request = SendRequest {
                recipients,
                fee_rate,
                replaceable: rbf,
            };
            let created = wallet
                .create_transaction(&account, &utxos, &request)
                .context("create transaction")?;
            print_json(&created)
        }
        Command::Sign { account, psbt } => {
            let account = unlock(&wallet, seed.as_deref(), &account).await?;
            let signed = wallet
                .sign_transaction(&account, &psbt)
                .context("sign transaction")?;
            print_json(&signed)
        }
        Command::Decode { psbt } => {
            let service = PsbtService::from_base64(&psbt).context("decode PSBT")?;
            print_json(&PsbtView {
                unsigned_txid: service.psbt().unsigned_tx.compute_txid(),
                stage: service.stage().to_string(),
                inputs: service.input_count(),
                outputs: service.output_count(),
                fee: service.fee().ok().map(|fee| fee.to_sat()),
            })
        }
        Command::Convert { sats, btc } => {
            let sats = match (sats, btc) {
                (Some(sats), _) => sats,
                (None, Some(btc)) => btc_to_sats(&btc).context("parse BTC amount")?,
                (None, None) => return Err(eyre!("pass --sats or --btc")),
            };
            print_json(&ConvertView {
                sats,
                btc: sats_to_btc(sats).context("render BTC amount")?,
                unit: wallet.config().unit.clone(),
            })
        }
    }
}

// ==============================================================================
// Helpers
// ==============================================================================

fn load_config(path: Option<&Path>) -> eyre::Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    let config = EngineConfig::from_json(&json)
        .with_context(|| format!("parse config file {}", path.display()))?;
    tracing::info!(path = %path.display(), "loaded engine config");
    Ok(config)
}

fn load_utxos(path: &Path) -> eyre::Result<Vec<Utxo>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("read UTXO file {}", path.display()))?;
    let utxos: Vec<Utxo> = serde_json::from_str(&json)
        .with_context(|| format!("parse UTXO file {}", path.display()))?;
    tracing::info!(count = utxos.len(), path = %path.display(), "loaded UTXOs");
    Ok(utxos)
}

fn key_tree(seed: Option<&str>, network: Network) -> eyre::Result<SeedKeyTree> {
    let seed = seed.ok_or_else(|| eyre!("no seed given; pass --seed or set SATCHEL_SEED"))?;
    let bytes = Vec::<u8>::from_hex(seed.trim()).map_err(|e| eyre!("invalid seed hex: {e}"))?;
    SeedKeyTree::from_seed(&bytes, network).context("build key tree from seed")
}

async fn unlock(wallet: &Wallet, seed: Option<&str>, args: &AccountArgs) -> eyre::Result<Account> {
    let provider = key_tree(seed, wallet.network())?;
    wallet
        .unlock(&provider, args.index, &args.script_type)
        .await
        .with_context(|| format!("unlock {} account {}", args.script_type, args.index))
}

fn print_json<T: Serialize>(value: &T) -> eyre::Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{rendered}");
    Ok(())
}
