//! Domain types for Satchel's transaction engine.
//!
//! Contains the script-type enum shared by every component, the UTXO and
//! input/output wrappers consumed by coin selection and the PSBT builder,
//! the selection result, and the `TransactionInfo` summary handed back to
//! callers.

use std::str::FromStr;

use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, Amount, Network, OutPoint, Script, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};

use crate::error::{TxValidationError, WalletError};
use crate::units::{checked_amount, MAX_SATS};

// ==============================================================================
// Script Type
// ==============================================================================

/// The single-key script types an account can spend from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptType {
    #[serde(rename = "p2pkh")]
    P2pkh,
    #[serde(rename = "p2sh-p2wpkh")]
    P2shP2wpkh,
    #[serde(rename = "p2wpkh")]
    P2wpkh,
}

impl ScriptType {
    pub const ALL: [ScriptType; 3] = [Self::P2pkh, Self::P2shP2wpkh, Self::P2wpkh];

    /// BIP44 / BIP49 / BIP84 purpose level for the canonical root path.
    pub fn purpose(self) -> u32 {
        match self {
            Self::P2pkh => 44,
            Self::P2shP2wpkh => 49,
            Self::P2wpkh => 84,
        }
    }

    /// Virtual size of one signed input of this type, rounded up.
    ///
    /// 41 non-witness bytes (outpoint, sequence, script length) plus the
    /// scriptSig, plus a quarter of the witness (72-byte signature, 33-byte
    /// key and their pushes).
    pub fn input_vsize(self) -> u64 {
        match self {
            Self::P2pkh => 148,
            Self::P2shP2wpkh => 91,
            Self::P2wpkh => 68,
        }
    }

    pub fn is_segwit(self) -> bool {
        !matches!(self, Self::P2pkh)
    }

    /// Classify an output script. Nested segwit cannot be told apart from
    /// any other P2SH by its script alone; every P2SH output is assumed to
    /// wrap a P2WPKH program since that is the only P2SH form we create.
    pub fn from_script(script: &Script) -> Option<Self> {
        if script.is_p2pkh() {
            Some(Self::P2pkh)
        } else if script.is_p2sh() {
            Some(Self::P2shP2wpkh)
        } else if script.is_p2wpkh() {
            Some(Self::P2wpkh)
        } else {
            None
        }
    }
}

impl std::fmt::Display for ScriptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::P2pkh => write!(f, "p2pkh"),
            Self::P2shP2wpkh => write!(f, "p2sh-p2wpkh"),
            Self::P2wpkh => write!(f, "p2wpkh"),
        }
    }
}

/// Accepts `p2wpkh` as well as the namespaced `bip122:p2wpkh` form.
impl FromStr for ScriptType {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = match s.rsplit_once(':') {
            Some((_, name)) => name,
            None => s,
        };
        match name.to_ascii_lowercase().as_str() {
            "p2pkh" => Ok(Self::P2pkh),
            "p2sh-p2wpkh" => Ok(Self::P2shP2wpkh),
            "p2wpkh" => Ok(Self::P2wpkh),
            _ => Err(WalletError::UnknownScriptType(s.to_owned())),
        }
    }
}

// ==============================================================================
// UTXO
// ==============================================================================

/// An unspent output as reported by a chain data provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub block: u32,
    pub tx_hash: Txid,
    pub index: u32,
    /// Value in satoshis.
    pub value: u64,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.tx_hash, self.index)
    }
}

// ==============================================================================
// Transaction Input / Output
// ==============================================================================

/// A UTXO paired with the script that locks it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    utxo: Utxo,
    script_pubkey: ScriptBuf,
    script_type: ScriptType,
}

impl TxInput {
    /// Fails when the UTXO value exceeds the maximum supply, which keeps the
    /// `u64` and [`Amount`] views of the value interchangeable.
    pub fn new(
        utxo: Utxo,
        script_pubkey: ScriptBuf,
        script_type: ScriptType,
    ) -> Result<Self, TxValidationError> {
        if utxo.value > MAX_SATS {
            return Err(TxValidationError::InvalidAmount(format!(
                "utxo {}:{} value {} exceeds supply",
                utxo.tx_hash, utxo.index, utxo.value
            )));
        }
        Ok(Self {
            utxo,
            script_pubkey,
            script_type,
        })
    }

    pub fn utxo(&self) -> &Utxo {
        &self.utxo
    }

    pub fn outpoint(&self) -> OutPoint {
        self.utxo.outpoint()
    }

    pub fn script_pubkey(&self) -> &Script {
        &self.script_pubkey
    }

    pub fn script_type(&self) -> ScriptType {
        self.script_type
    }

    pub fn value(&self) -> u64 {
        self.utxo.value
    }

    pub fn amount(&self) -> Amount {
        Amount::from_sat(self.utxo.value)
    }

    pub fn vsize(&self) -> u64 {
        self.script_type.input_vsize()
    }
}

/// A transaction output. Only `value` may change after construction; the
/// coin selector writes the leftover into the change template through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub value: u64,
    address: String,
    script_pubkey: ScriptBuf,
}

impl TxOutput {
    /// Parse `address` for `network` and build an output paying `value` to it.
    pub fn new(value: u64, address: &str, network: Network) -> Result<Self, TxValidationError> {
        let parsed = address
            .parse::<Address<NetworkUnchecked>>()
            .map_err(|e| TxValidationError::InvalidAddress(format!("{address}: {e}")))?
            .require_network(network)
            .map_err(|e| TxValidationError::InvalidAddress(format!("{address}: {e}")))?;
        checked_amount(value).map_err(|e| TxValidationError::InvalidAmount(e.to_string()))?;
        Ok(Self::from_address(value, &parsed))
    }

    pub fn from_address(value: u64, address: &Address) -> Self {
        Self {
            value,
            address: address.to_string(),
            script_pubkey: address.script_pubkey(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn script_pubkey(&self) -> &Script {
        &self.script_pubkey
    }

    pub fn amount(&self) -> Amount {
        Amount::from_sat(self.value)
    }

    /// Serialized size: 8-byte value, length prefix, script.
    pub fn vsize(&self) -> u64 {
        8 + 1 + self.script_pubkey.len() as u64
    }
}

// ==============================================================================
// Selection Result
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionResult {
    pub inputs: Vec<TxInput>,
    /// Recipient outputs, excluding change.
    pub outputs: Vec<TxOutput>,
    pub change: Option<TxOutput>,
    /// Fee in satoshis.
    pub fee: u64,
}

impl SelectionResult {
    pub fn input_total(&self) -> u64 {
        self.inputs.iter().map(TxInput::value).sum()
    }

    pub fn output_total(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum::<u64>()
            + self.change.as_ref().map_or(0, |c| c.value)
    }
}

// ==============================================================================
// Transaction Info
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub address: String,
    /// Value in satoshis.
    pub value: u64,
}

impl From<&TxOutput> for Recipient {
    fn from(output: &TxOutput) -> Self {
        Self {
            address: output.address.clone(),
            value: output.value,
        }
    }
}

/// Summary of a created transaction, accumulated as outputs are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub sender: String,
    /// Fee rate in sat/vB.
    pub fee_rate: u64,
    pub fee: u64,
    pub recipients: Vec<Recipient>,
    pub change: Option<Recipient>,
}

impl TransactionInfo {
    pub fn new(sender: impl Into<String>, fee_rate: u64) -> Self {
        Self {
            sender: sender.into(),
            fee_rate,
            fee: 0,
            recipients: Vec::new(),
            change: None,
        }
    }

    pub fn add_recipient(&mut self, output: &TxOutput) {
        self.recipients.push(output.into());
    }

    pub fn set_change(&mut self, output: &TxOutput) {
        self.change = Some(output.into());
    }

    pub fn set_fee(&mut self, fee: u64) {
        self.fee = fee;
    }

    /// Fee plus every recipient plus change, in satoshis.
    pub fn total(&self) -> u64 {
        self.fee
            + self.recipients.iter().map(|r| r.value).sum::<u64>()
            + self.change.as_ref().map_or(0, |c| c.value)
    }
}
