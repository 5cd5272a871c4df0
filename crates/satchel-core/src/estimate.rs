//! Fee quotes and maximum-spendable search.
//!
//! Both estimators run the coin selector against a probe send to the
//! account's own address. Nothing is signed.

use serde::Serialize;

use crate::account::Account;
use crate::coin_selection::CoinSelector;
use crate::config::EngineConfig;
use crate::error::{CoreError, TxValidationError};
use crate::types::{SelectionResult, TxInput, TxOutput, Utxo};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeEstimate {
    /// Fee in satoshis.
    pub fee: u64,
    pub selection: SelectionResult,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaxSpendable {
    pub spendable: u64,
    pub fee: u64,
}

/// Quote the fee for sending `amount` satoshis from `account` at `fee_rate`
/// sat/vB.
///
/// Fails with [`TxValidationError::TransactionDust`] when `amount` is below
/// the dust limit for the account's script type; insufficient funds are
/// passed through unchanged.
pub fn estimate_fee(
    account: &Account,
    utxos: &[Utxo],
    amount: u64,
    fee_rate: u64,
    config: &EngineConfig,
) -> Result<FeeEstimate, CoreError> {
    let inputs = spendable_inputs(account, utxos)?;
    estimate_with_inputs(account, &inputs, amount, &CoinSelector::new(fee_rate, config), config)
}

/// Largest amount `account` can send at `fee_rate` sat/vB, with its fee.
///
/// Binary search over `[0, Σ values]`. A successful probe raises the lower
/// bound and records the amount; a dust rejection also raises the lower
/// bound; insufficient funds lowers the upper bound. Any other failure
/// aborts the search. Returns zeros when no dust-exceeding amount can be
/// sent.
pub fn max_spendable_balance(
    account: &Account,
    utxos: &[Utxo],
    fee_rate: u64,
    config: &EngineConfig,
) -> Result<MaxSpendable, CoreError> {
    let inputs = spendable_inputs(account, utxos)?;
    let selector = CoinSelector::new(fee_rate, config);
    let total: u64 = inputs.iter().map(TxInput::value).sum();

    let mut best = MaxSpendable::default();
    let mut low = 0u64;
    let mut high = total;
    let mut probes = 0u32;

    while low <= high {
        let mid = low + (high - low) / 2;
        probes += 1;
        match estimate_with_inputs(account, &inputs, mid, &selector, config) {
            Ok(estimate) => {
                best = MaxSpendable {
                    spendable: mid,
                    fee: estimate.fee,
                };
                low = mid + 1;
            }
            Err(err) if err.is_dust() => {
                low = mid + 1;
            }
            Err(err) if err.is_insufficient_funds() => {
                if mid == 0 {
                    break;
                }
                high = mid - 1;
            }
            Err(err) => return Err(err),
        }
    }

    tracing::debug!(
        total,
        fee_rate,
        probes,
        spendable = best.spendable,
        fee = best.fee,
        "max spendable search finished"
    );
    Ok(best)
}

fn spendable_inputs(account: &Account, utxos: &[Utxo]) -> Result<Vec<TxInput>, CoreError> {
    utxos
        .iter()
        .map(|utxo| account.tx_input(utxo.clone()).map_err(CoreError::from))
        .collect()
}

fn estimate_with_inputs(
    account: &Account,
    inputs: &[TxInput],
    amount: u64,
    selector: &CoinSelector,
    config: &EngineConfig,
) -> Result<FeeEstimate, CoreError> {
    let threshold = config.dust_limit(account.script_type());
    if amount < threshold {
        return Err(TxValidationError::TransactionDust { amount, threshold }.into());
    }

    let probe = TxOutput::from_address(amount, account.address());
    let selection = selector.select_coins(inputs, vec![probe], account.change_template())?;
    Ok(FeeEstimate {
        fee: selection.fee,
        selection,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{make_utxo, test_account};
    use crate::types::ScriptType;
    use crate::units::MAX_SATS;

    #[tokio::test]
    async fn dust_amount_is_rejected() {
        let account = test_account(ScriptType::P2wpkh, 0).await;
        let err = estimate_fee(&account, &[make_utxo(200, 1)], 200, 1, &EngineConfig::default())
            .unwrap_err();
        assert_eq!(
            err,
            CoreError::TxValidation(TxValidationError::TransactionDust {
                amount: 200,
                threshold: 294
            })
        );
    }

    #[tokio::test]
    async fn insufficient_funds_passes_through() {
        let account = test_account(ScriptType::P2wpkh, 0).await;
        let err = estimate_fee(&account, &[make_utxo(1_000, 1)], 5_000, 1, &EngineConfig::default())
            .unwrap_err();
        assert!(err.is_insufficient_funds());
    }

    #[tokio::test]
    async fn fee_matches_selection() {
        let account = test_account(ScriptType::P2wpkh, 0).await;
        let utxos = [make_utxo(100_000, 1), make_utxo(100_000, 2)];
        let estimate =
            estimate_fee(&account, &utxos, 100_000, 1, &EngineConfig::default()).unwrap();
        assert_eq!(estimate.fee, estimate.selection.fee);
        assert!(estimate.fee > 0);
        assert_eq!(
            estimate.selection.input_total(),
            estimate.selection.output_total() + estimate.fee
        );
    }

    #[tokio::test]
    async fn single_utxo_max_spends_everything_but_the_fee() {
        let config = EngineConfig::default();
        for script_type in ScriptType::ALL {
            let account = test_account(script_type, 0).await;
            for fee_rate in [1, 5, 20] {
                let value = 100_000;
                let max = max_spendable_balance(&account, &[make_utxo(value, 1)], fee_rate, &config)
                    .unwrap();
                assert!(max.spendable > config.dust_limit(script_type));
                assert_eq!(
                    max.spendable + max.fee,
                    value,
                    "{script_type} at {fee_rate} sat/vB"
                );
            }
        }
    }

    #[tokio::test]
    async fn p2wpkh_max_fee_is_one_in_one_out() {
        let account = test_account(ScriptType::P2wpkh, 0).await;
        let max =
            max_spendable_balance(&account, &[make_utxo(50_000, 1)], 2, &EngineConfig::default())
                .unwrap();
        // 10 overhead + 1 segwit + 68 input + 31 output.
        assert_eq!(max.fee, 2 * 110);
        assert_eq!(max.spendable, 50_000 - 220);
    }

    #[tokio::test]
    async fn multiple_utxos_are_all_spent() {
        let account = test_account(ScriptType::P2wpkh, 0).await;
        let utxos = [make_utxo(50_000, 1), make_utxo(50_000, 2), make_utxo(50_000, 3)];
        let max = max_spendable_balance(&account, &utxos, 2, &EngineConfig::default()).unwrap();
        assert_eq!(max.fee, 2 * (10 + 1 + 3 * 68 + 31));
        assert_eq!(max.spendable + max.fee, 150_000);
    }

    #[tokio::test]
    async fn too_small_to_send_returns_zero() {
        let account = test_account(ScriptType::P2wpkh, 0).await;
        let config = EngineConfig::default();
        for value in [0, 200, 400] {
            let utxos: Vec<Utxo> = if value == 0 { vec![] } else { vec![make_utxo(value, 1)] };
            let max = max_spendable_balance(&account, &utxos, 1, &config).unwrap();
            assert_eq!(max, MaxSpendable { spendable: 0, fee: 0 }, "value {value}");
        }
    }

    #[tokio::test]
    async fn other_failures_abort() {
        let account = test_account(ScriptType::P2wpkh, 0).await;
        let err = max_spendable_balance(
            &account,
            &[make_utxo(MAX_SATS + 1, 1)],
            1,
            &EngineConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CoreError::TxValidation(TxValidationError::InvalidAmount(_))
        ));
    }
}
