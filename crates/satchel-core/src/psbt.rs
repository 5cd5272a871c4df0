//! PSBT assembly, signing, verification and finalization.
//!
//! [`PsbtService`] wraps a BIP174 [`Psbt`] and moves it forward through
//! [`Stage`]s. Each operation checks the current stage first; no operation
//! moves a PSBT backwards.

use std::collections::HashSet;

use bitcoin::absolute::LockTime;
use bitcoin::bip32::DerivationPath;
use bitcoin::ecdsa::Signature as EcdsaSignature;
use bitcoin::hashes::Hash;
use bitcoin::psbt::{self, Psbt};
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{Message, PublicKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{consensus, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use crate::account::Account;
use crate::config::MAX_STANDARD_TX_WEIGHT;
use crate::error::{CoreError, PsbtServiceError, TxValidationError};
use crate::keys::{verify_signature, Signer};
use crate::types::{ScriptType, TxInput, TxOutput};
use crate::units::checked_amount;

// ==============================================================================
// Stage
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Empty,
    Assembled,
    Signed,
    Verified,
    Finalized,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Assembled => "assembled",
            Self::Signed => "signed",
            Self::Verified => "verified",
            Self::Finalized => "finalized",
        }
    }

    /// Best guess at the stage of a PSBT decoded from the wire.
    fn infer(psbt: &Psbt) -> Self {
        if psbt.inputs.is_empty() && psbt.outputs.is_empty() {
            return Self::Empty;
        }
        let finalized = !psbt.inputs.is_empty()
            && psbt
                .inputs
                .iter()
                .all(|i| i.final_script_witness.is_some() || i.final_script_sig.is_some());
        if finalized {
            Self::Finalized
        } else if psbt.inputs.iter().any(|i| !i.partial_sigs.is_empty()) {
            Self::Signed
        } else {
            Self::Assembled
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==============================================================================
// PSBT Service
// ==============================================================================

#[derive(Debug, Clone)]
pub struct PsbtService {
    psbt: Psbt,
    stage: Stage,
    max_weight: u64,
    /// The extracted transaction, once finalized.
    transaction: Option<Transaction>,
}

impl Default for PsbtService {
    fn default() -> Self {
        Self::new()
    }
}

impl PsbtService {
    pub fn new() -> Self {
        let unsigned_tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: Vec::new(),
            output: Vec::new(),
        };
        Self {
            psbt: Psbt {
                unsigned_tx,
                version: 0,
                xpub: Default::default(),
                proprietary: Default::default(),
                unknown: Default::default(),
                inputs: Vec::new(),
                outputs: Vec::new(),
            },
            stage: Stage::Empty,
            max_weight: MAX_STANDARD_TX_WEIGHT,
            transaction: None,
        }
    }

    /// Override the weight ceiling enforced by [`PsbtService::finalize`].
    pub fn with_max_weight(mut self, max_weight: u64) -> Self {
        self.max_weight = max_weight;
        self
    }

    pub fn from_base64(encoded: &str) -> Result<Self, PsbtServiceError> {
        let psbt = encoded
            .trim()
            .parse::<Psbt>()
            .map_err(|e| PsbtServiceError::Decode(e.to_string()))?;
        let stage = Stage::infer(&psbt);
        let transaction =
            (stage == Stage::Finalized).then(|| psbt.clone().extract_tx_unchecked_fee_rate());
        Ok(Self {
            psbt,
            stage,
            max_weight: MAX_STANDARD_TX_WEIGHT,
            transaction,
        })
    }

    pub fn to_base64(&self) -> String {
        self.psbt.to_string()
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn psbt(&self) -> &Psbt {
        &self.psbt
    }

    pub fn input_count(&self) -> usize {
        self.psbt.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.psbt.outputs.len()
    }

    /// Input total minus output total.
    pub fn fee(&self) -> Result<Amount, PsbtServiceError> {
        self.psbt
            .fee()
            .map_err(|e| PsbtServiceError::Fee(e.to_string()))
    }

    /// The finalized transaction, available once [`Stage::Finalized`].
    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    fn require(&self, allowed: &[Stage], operation: &'static str) -> Result<(), PsbtServiceError> {
        if allowed.contains(&self.stage) {
            Ok(())
        } else {
            Err(PsbtServiceError::Stage {
                operation,
                stage: self.stage.as_str(),
            })
        }
    }

    // ==========================================================================
    // Assembly
    // ==========================================================================

    pub fn add_input(
        &mut self,
        input: &TxInput,
        account: &Account,
        replaceable: bool,
    ) -> Result<(), PsbtServiceError> {
        self.add_inputs(std::slice::from_ref(input), account, replaceable)
    }

    /// Add inputs locked to `account`, with the account's BIP32 metadata.
    ///
    /// The whole batch is validated before anything is added; every
    /// rejected entry is reported in one error.
    pub fn add_inputs(
        &mut self,
        inputs: &[TxInput],
        account: &Account,
        replaceable: bool,
    ) -> Result<(), PsbtServiceError> {
        self.require(&[Stage::Empty, Stage::Assembled], "add inputs to")?;

        let mut seen: HashSet<OutPoint> = self
            .psbt
            .unsigned_tx
            .input
            .iter()
            .map(|txin| txin.previous_output)
            .collect();
        let mut failures = Vec::new();
        for (position, input) in inputs.iter().enumerate() {
            let outpoint = input.outpoint();
            if let Err(reason) = check_input(input, account) {
                failures.push(format!("input {position} ({outpoint}): {reason}"));
            } else if !seen.insert(outpoint) {
                failures.push(format!("input {position} ({outpoint}): duplicate outpoint"));
            }
        }
        if !failures.is_empty() {
            return Err(PsbtServiceError::AddInputs(failures.join("; ")));
        }

        let sequence = if replaceable {
            Sequence::ENABLE_RBF_NO_LOCKTIME
        } else {
            Sequence::MAX
        };
        for input in inputs {
            self.psbt.unsigned_tx.input.push(TxIn {
                previous_output: input.outpoint(),
                script_sig: ScriptBuf::new(),
                sequence,
                witness: Witness::default(),
            });

            let mut psbt_input = psbt::Input {
                witness_utxo: Some(TxOut {
                    value: input.amount(),
                    script_pubkey: input.script_pubkey().to_owned(),
                }),
                redeem_script: account.redeem_script(),
                ..Default::default()
            };
            psbt_input.bip32_derivation.insert(
                account.public_key().0,
                (account.master_fingerprint(), account.derivation_path().clone()),
            );
            self.psbt.inputs.push(psbt_input);
        }

        tracing::debug!(added = inputs.len(), total = self.input_count(), replaceable, "added PSBT inputs");
        self.stage = Stage::Assembled;
        Ok(())
    }

    pub fn add_output(&mut self, output: &TxOutput) -> Result<(), PsbtServiceError> {
        self.add_outputs(std::slice::from_ref(output))
    }

    /// Add outputs, with the same all-or-nothing batch semantics as
    /// [`PsbtService::add_inputs`].
    pub fn add_outputs(&mut self, outputs: &[TxOutput]) -> Result<(), PsbtServiceError> {
        self.require(&[Stage::Empty, Stage::Assembled], "add outputs to")?;

        let failures: Vec<String> = outputs
            .iter()
            .enumerate()
            .filter_map(|(position, output)| {
                check_output(output)
                    .err()
                    .map(|reason| format!("output {position} ({}): {reason}", output.address()))
            })
            .collect();
        if !failures.is_empty() {
            return Err(PsbtServiceError::AddOutputs(failures.join("; ")));
        }

        for output in outputs {
            self.psbt.unsigned_tx.output.push(TxOut {
                value: output.amount(),
                script_pubkey: output.script_pubkey().to_owned(),
            });
            self.psbt.outputs.push(psbt::Output::default());
        }

        tracing::debug!(added = outputs.len(), total = self.output_count(), "added PSBT outputs");
        self.stage = Stage::Assembled;
        Ok(())
    }

    // ==========================================================================
    // Signing
    // ==========================================================================

    pub fn sign_and_verify(&mut self, signer: &Signer) -> Result<(), CoreError> {
        self.sign(signer)?;
        self.verify()
    }

    /// Sign every input with the key derived from `signer` along the
    /// input's BIP32 path. Nothing is written unless every input signs.
    pub fn sign(&mut self, signer: &Signer) -> Result<(), CoreError> {
        self.require(&[Stage::Assembled], "sign")?;
        if self.psbt.inputs.is_empty() {
            return Err(PsbtServiceError::Sign {
                input: 0,
                message: "PSBT has no inputs".into(),
            }
            .into());
        }

        let mut cache = SighashCache::new(&self.psbt.unsigned_tx);
        let mut signatures = Vec::with_capacity(self.psbt.inputs.len());
        for (index, input) in self.psbt.inputs.iter().enumerate() {
            let (public_key, path) = declared_key(index, input)?;
            let key = signer
                .derive_absolute(&path)
                .map_err(|e| sign_error(index, e.to_string()))?;
            if key.public_key().0 != public_key {
                return Err(sign_error(index, "derived key does not match declared public key".into()).into());
            }
            let message = input_message(&mut cache, index, input)?;
            signatures.push((public_key, key.sign(&message)));
        }

        for (input, (public_key, signature)) in self.psbt.inputs.iter_mut().zip(signatures) {
            input.partial_sigs.insert(
                bitcoin::PublicKey::new(public_key),
                EcdsaSignature {
                    signature,
                    sighash_type: EcdsaSighashType::All,
                },
            );
        }
        self.stage = Stage::Signed;
        Ok(())
    }

    /// Check each input's signature against its declared public key.
    pub fn verify(&mut self) -> Result<(), CoreError> {
        self.require(&[Stage::Signed], "verify")?;

        let mut cache = SighashCache::new(&self.psbt.unsigned_tx);
        for (index, input) in self.psbt.inputs.iter().enumerate() {
            let (public_key, _) = declared_key(index, input)?;
            let message = input_message(&mut cache, index, input)?;
            let valid = input
                .partial_sigs
                .get(&bitcoin::PublicKey::new(public_key))
                .is_some_and(|sig| {
                    sig.sighash_type == EcdsaSighashType::All
                        && verify_signature(&public_key, &message, &sig.signature)
                });
            if !valid {
                tracing::warn!(input = index, "rejected partial signature");
                return Err(TxValidationError::InvalidSignature { input: index }.into());
            }
        }
        self.stage = Stage::Verified;
        Ok(())
    }

    // ==========================================================================
    // Finalization
    // ==========================================================================

    /// Build the final scriptSig / witness for every input, extract the
    /// transaction and return its consensus hex encoding.
    pub fn finalize(&mut self) -> Result<String, CoreError> {
        self.require(&[Stage::Verified], "finalize")?;

        let mut psbt = self.psbt.clone();
        for (index, input) in psbt.inputs.iter_mut().enumerate() {
            finalize_input(index, input)?;
        }
        let transaction = psbt.clone().extract_tx_unchecked_fee_rate();

        let weight = transaction.weight().to_wu();
        if weight > self.max_weight {
            return Err(TxValidationError::TransactionTooLarge {
                weight,
                max: self.max_weight,
            }
            .into());
        }

        let hex = consensus::encode::serialize_hex(&transaction);
        tracing::info!(
            txid = %transaction.compute_txid(),
            weight,
            vsize = transaction.vsize(),
            inputs = transaction.input.len(),
            outputs = transaction.output.len(),
            "finalized transaction"
        );

        self.psbt = psbt;
        self.transaction = Some(transaction);
        self.stage = Stage::Finalized;
        Ok(hex)
    }

    /// Sign and finalize a throwaway copy, returning its fee. `self` is
    /// left untouched.
    pub fn sign_dummy(&self, signer: &Signer) -> Result<Amount, CoreError> {
        let mut copy = self.clone();
        copy.sign_and_verify(signer)?;
        copy.finalize()?;
        let fee = copy.fee()?;
        if let Some(transaction) = copy.transaction() {
            tracing::debug!(
                fee = fee.to_sat(),
                vsize = transaction.vsize(),
                "dummy-signed PSBT"
            );
        }
        Ok(fee)
    }
}

// ==============================================================================
// Helpers
// ==============================================================================

fn sign_error(input: usize, message: String) -> PsbtServiceError {
    PsbtServiceError::Sign { input, message }
}

fn check_input(input: &TxInput, account: &Account) -> Result<(), String> {
    if input.script_type() != account.script_type() {
        return Err(format!(
            "script type {} does not match account type {}",
            input.script_type(),
            account.script_type()
        ));
    }
    if input.script_pubkey() != account.script_pubkey() {
        return Err("script is not locked to the account".into());
    }
    if input.value() == 0 {
        return Err("zero value".into());
    }
    Ok(())
}

fn check_output(output: &TxOutput) -> Result<(), String> {
    if output.script_pubkey().is_empty() {
        return Err("empty script".into());
    }
    checked_amount(output.value).map_err(|e| e.to_string())?;
    Ok(())
}

/// The single public key and path an input declares in its BIP32 metadata.
fn declared_key(
    index: usize,
    input: &psbt::Input,
) -> Result<(PublicKey, DerivationPath), PsbtServiceError> {
    let mut entries = input.bip32_derivation.iter();
    match (entries.next(), entries.next()) {
        (Some((public_key, (_, path))), None) => Ok((*public_key, path.clone())),
        (None, _) => Err(sign_error(index, "missing BIP32 derivation".into())),
        (Some(_), Some(_)) => Err(sign_error(index, "multiple BIP32 derivations".into())),
    }
}

/// SIGHASH_ALL message for `index`: BIP143 for segwit inputs, legacy for
/// P2PKH.
fn input_message(
    cache: &mut SighashCache<&Transaction>,
    index: usize,
    input: &psbt::Input,
) -> Result<Message, PsbtServiceError> {
    let utxo = input
        .witness_utxo
        .as_ref()
        .ok_or_else(|| sign_error(index, "missing witness utxo".into()))?;
    let script_type = ScriptType::from_script(&utxo.script_pubkey)
        .ok_or_else(|| sign_error(index, format!("unsupported script {}", utxo.script_pubkey)))?;

    let digest = match script_type {
        ScriptType::P2wpkh => cache
            .p2wpkh_signature_hash(index, &utxo.script_pubkey, utxo.value, EcdsaSighashType::All)
            .map_err(|e| sign_error(index, e.to_string()))?
            .to_byte_array(),
        ScriptType::P2shP2wpkh => {
            let redeem = input
                .redeem_script
                .as_ref()
                .ok_or_else(|| sign_error(index, "missing redeem script".into()))?;
            cache
                .p2wpkh_signature_hash(index, redeem, utxo.value, EcdsaSighashType::All)
                .map_err(|e| sign_error(index, e.to_string()))?
                .to_byte_array()
        }
        ScriptType::P2pkh => cache
            .legacy_signature_hash(index, &utxo.script_pubkey, EcdsaSighashType::All.to_u32())
            .map_err(|e| sign_error(index, e.to_string()))?
            .to_byte_array(),
    };
    Ok(Message::from_digest(digest))
}

fn push_bytes(bytes: Vec<u8>) -> Result<PushBytesBuf, PsbtServiceError> {
    PushBytesBuf::try_from(bytes).map_err(|e| PsbtServiceError::Finalize(e.to_string()))
}

fn finalize_input(index: usize, input: &mut psbt::Input) -> Result<(), PsbtServiceError> {
    let finalize_error = |message: &str| PsbtServiceError::Finalize(format!("input {index}: {message}"));

    let (public_key, signature) = input
        .partial_sigs
        .iter()
        .next()
        .map(|(key, sig)| (*key, *sig))
        .ok_or_else(|| finalize_error("no signature"))?;
    let script_type = input
        .witness_utxo
        .as_ref()
        .and_then(|utxo| ScriptType::from_script(&utxo.script_pubkey))
        .ok_or_else(|| finalize_error("unknown spent script"))?;

    let witness = || Witness::from_slice(&[signature.to_vec(), public_key.to_bytes()]);
    match script_type {
        ScriptType::P2wpkh => {
            input.final_script_witness = Some(witness());
        }
        ScriptType::P2shP2wpkh => {
            let redeem = input
                .redeem_script
                .as_ref()
                .ok_or_else(|| finalize_error("missing redeem script"))?;
            input.final_script_sig = Some(
                Builder::new()
                    .push_slice(push_bytes(redeem.to_bytes())?)
                    .into_script(),
            );
            input.final_script_witness = Some(witness());
        }
        ScriptType::P2pkh => {
            input.final_script_sig = Some(
                Builder::new()
                    .push_slice(push_bytes(signature.to_vec())?)
                    .push_key(&public_key)
                    .into_script(),
            );
        }
    }

    input.partial_sigs.clear();
    input.sighash_type = None;
    input.redeem_script = None;
    input.witness_script = None;
    input.bip32_derivation.clear();
    Ok(())
}
