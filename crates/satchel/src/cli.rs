use std::path::PathBuf;

use bitcoin::Network;
use clap::{ArgGroup, Args, Parser, Subcommand};
use satchel_core::Recipient;

/// Offline HD wallet transaction builder. Derives accounts, quotes fees and
/// signs PSBTs from a BIP32 seed and a UTXO list.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Cli {
    /// Hex-encoded BIP32 seed.
    #[arg(long, env = "SATCHEL_SEED", hide_env_values = true, global = true)]
    pub seed: Option<String>,

    /// Network: bitcoin, testnet, signet or regtest.
    #[arg(
        long,
        env = "SATCHEL_NETWORK",
        default_value = "regtest",
        value_parser = parse_network,
        global = true
    )]
    pub network: Network,

    /// Engine policy file (JSON). Built-in defaults apply when omitted.
    #[arg(long, env = "SATCHEL_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct AccountArgs {
    /// Address index beneath the account's receive chain.
    #[arg(long, default_value_t = 0)]
    pub index: u32,

    /// Script type: p2pkh, p2sh-p2wpkh or p2wpkh (optionally `bip122:`-prefixed).
    #[arg(long, default_value = "p2wpkh")]
    pub script_type: String,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show the address and derivation metadata of an account.
    Account(AccountArgs),

    /// Quote the fee for sending an amount.
    EstimateFee {
        #[command(flatten)]
        account: AccountArgs,

        /// JSON file holding the account's UTXO list.
        #[arg(long)]
        utxos: PathBuf,

        /// Amount to send, in satoshis.
        #[arg(long)]
        amount: u64,

        /// Fee rate in sat/vB.
        #[arg(long)]
        fee_rate: Option<u64>,
    },

    /// Find the largest amount that can be sent.
    MaxSpendable {
        #[command(flatten)]
        account: AccountArgs,

        /// JSON file holding the account's UTXO list.
        #[arg(long)]
        utxos: PathBuf,

        /// Fee rate in sat/vB.
        #[arg(long)]
        fee_rate: Option<u64>,
    },

    /// Select coins and build an unsigned PSBT.
    Create {
        #[command(flatten)]
        account: AccountArgs,

        /// JSON file holding the account's UTXO list.
        #[arg(long)]
        utxos: PathBuf,

        /// Recipient as `<address>:<satoshis>` (repeatable).
        #[arg(long = "to", value_parser = parse_recipient, required = true)]
        recipients: Vec<Recipient>,

        /// Fee rate in sat/vB.
        #[arg(long)]
        fee_rate: Option<u64>,

        /// Signal BIP125 replace-by-fee.
        #[arg(long)]
        rbf: bool,
    },

    /// Sign and finalize a PSBT, printing the raw transaction.
    Sign {
        #[command(flatten)]
        account: AccountArgs,

        /// Base64-encoded PSBT.
        #[arg(long)]
        psbt: String,
    },

    /// Summarize a base64-encoded PSBT.
    Decode {
        /// Base64-encoded PSBT.
        psbt: String,
    },

    /// Convert between satoshis and BTC.
    #[command(group(ArgGroup::new("amount").required(true)))]
    Convert {
        /// Satoshis to render as BTC.
        #[arg(long, group = "amount")]
        sats: Option<u64>,

        /// BTC amount to convert to satoshis.
        #[arg(long, group = "amount")]
        btc: Option<String>,
    },
}

fn parse_network(value: &str) -> Result<Network, String> {
    match value.to_ascii_lowercase().as_str() {
        "bitcoin" | "main" | "mainnet" => Ok(Network::Bitcoin),
        "testnet" | "test" => Ok(Network::Testnet),
        "signet" => Ok(Network::Signet),
        "regtest" => Ok(Network::Regtest),
        other => Err(format!("unknown network `{other}`")),
    }
}

fn parse_recipient(value: &str) -> Result<Recipient, String> {
    let (address, sats) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("expected <address>:<satoshis>, got `{value}`"))?;
    let sats: u64 = sats
        .parse()
        .map_err(|e| format!("invalid satoshi amount `{sats}`: {e}"))?;
    if address.is_empty() {
        return Err(format!("missing address in `{value}`"));
    }
    Ok(Recipient {
        address: address.to_owned(),
        value: sats,
    })
}
