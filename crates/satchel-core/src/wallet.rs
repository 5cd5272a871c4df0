//! Wallet orchestration.
//!
//! A thin composition over the engine components: unlock accounts, select
//! coins and build a PSBT for a send, sign a previously built PSBT, and
//! expose the estimators and discovery with the wallet's policy applied.

use bitcoin::{Network, Txid};
use serde::{Deserialize, Serialize};

use crate::account::{Account, AccountFactory};
use crate::coin_selection::CoinSelector;
use crate::config::EngineConfig;
use crate::discovery::{discover, Discovery, DiscoveryStrategy};
use crate::error::{CoreError, PsbtServiceError, TxValidationError};
use crate::estimate::{self, FeeEstimate, MaxSpendable};
use crate::provider::{AddressActivity, KeyTreeProvider};
use crate::psbt::PsbtService;
use crate::types::{Recipient, TransactionInfo, TxInput, TxOutput, Utxo};

/// A send from one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub recipients: Vec<Recipient>,
    /// Fee rate in sat/vB; the configured default when absent.
    #[serde(default)]
    pub fee_rate: Option<u64>,
    /// Signal BIP125 replaceability.
    #[serde(default)]
    pub replaceable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedTransaction {
    /// Unsigned PSBT, base64.
    pub psbt: String,
    pub info: TransactionInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignedTransaction {
    pub txid: Txid,
    /// Consensus-encoded transaction, hex.
    pub hex: String,
}

pub struct Wallet {
    network: Network,
    config: EngineConfig,
}

impl Wallet {
    pub fn new(network: Network, config: EngineConfig) -> Self {
        Self { network, config }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn fee_rate(&self, requested: Option<u64>) -> u64 {
        requested.unwrap_or(self.config.default_fee_rate)
    }

    pub async fn unlock(
        &self,
        provider: &dyn KeyTreeProvider,
        index: u32,
        script_type: &str,
    ) -> Result<Account, CoreError> {
        Ok(AccountFactory::new(provider, self.network)
            .unlock(index, script_type)
            .await?)
    }

    /// Select coins for `request` and return the unsigned PSBT with a
    /// summary. The fee is read back from a dummy-signed copy.
    pub fn create_transaction(
        &self,
        account: &Account,
        utxos: &[Utxo],
        request: &SendRequest,
    ) -> Result<CreatedTransaction, CoreError> {
        let fee_rate = self.fee_rate(request.fee_rate);
        let outputs = self.recipient_outputs(account, &request.recipients)?;
        let inputs: Vec<TxInput> = utxos
            .iter()
            .map(|utxo| account.tx_input(utxo.clone()))
            .collect::<Result<_, _>>()?;

        let selection = CoinSelector::new(fee_rate, &self.config).select_coins(
            &inputs,
            outputs,
            account.change_template(),
        )?;

        let mut service = PsbtService::new().with_max_weight(self.config.max_weight);
        service.add_inputs(&selection.inputs, account, request.replaceable)?;
        service.add_outputs(&selection.outputs)?;
        if let Some(change) = &selection.change {
            service.add_output(change)?;
        }

        let fee = service.sign_dummy(account.signer())?.to_sat();
        if fee != selection.fee {
            return Err(PsbtServiceError::Fee(format!(
                "PSBT fee {fee} differs from selected fee {}",
                selection.fee
            ))
            .into());
        }

        let mut info = TransactionInfo::new(account.address().to_string(), fee_rate);
        for output in &selection.outputs {
            info.add_recipient(output);
        }
        if let Some(change) = &selection.change {
            info.set_change(change);
        }
        info.set_fee(fee);

        tracing::info!(
            sender = %info.sender,
            fee_rate,
            fee,
            inputs = selection.inputs.len(),
            recipients = info.recipients.len(),
            change = ?info.change.as_ref().map(|c| c.value),
            "created transaction"
        );
        Ok(CreatedTransaction {
            psbt: service.to_base64(),
            info,
        })
    }

    /// Sign, verify and finalize a PSBT created for `account`.
    pub fn sign_transaction(
        &self,
        account: &Account,
        psbt: &str,
    ) -> Result<SignedTransaction, CoreError> {
        let mut service = PsbtService::from_base64(psbt)?.with_max_weight(self.config.max_weight);
        service.sign_and_verify(account.signer())?;
        let hex = service.finalize()?;
        let txid = service
            .transaction()
            .map(|tx| tx.compute_txid())
            .ok_or_else(|| PsbtServiceError::Finalize("no transaction extracted".into()))?;
        Ok(SignedTransaction { txid, hex })
    }

    pub fn estimate_fee(
        &self,
        account: &Account,
        utxos: &[Utxo],
        amount: u64,
        fee_rate: Option<u64>,
    ) -> Result<FeeEstimate, CoreError> {
        estimate::estimate_fee(account, utxos, amount, self.fee_rate(fee_rate), &self.config)
    }

    pub fn max_spendable_balance(
        &self,
        account: &Account,
        utxos: &[Utxo],
        fee_rate: Option<u64>,
    ) -> Result<MaxSpendable, CoreError> {
        estimate::max_spendable_balance(account, utxos, self.fee_rate(fee_rate), &self.config)
    }

    pub async fn discover_addresses(
        &self,
        strategy: DiscoveryStrategy,
        addresses: &[&str],
        activity: &dyn AddressActivity,
    ) -> Result<Discovery, CoreError> {
        discover(strategy, addresses, activity).await
    }

    /// Parse recipients for this wallet's network, rejecting dust.
    fn recipient_outputs(
        &self,
        account: &Account,
        recipients: &[Recipient],
    ) -> Result<Vec<TxOutput>, CoreError> {
        if recipients.is_empty() {
            return Err(TxValidationError::NoRecipients.into());
        }
        recipients
            .iter()
            .map(|recipient| -> Result<TxOutput, CoreError> {
                let output = TxOutput::new(recipient.value, &recipient.address, account.network())?;
                let threshold = self.config.dust_limits.for_script(output.script_pubkey());
                if output.value < threshold {
                    return Err(TxValidationError::TransactionDust {
                        amount: output.value,
                        threshold,
                    }
                    .into());
                }
                Ok(output)
            })
            .collect()
    }
}
