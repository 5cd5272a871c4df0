//! Fee-aware coin selection.
//!
//! Candidates are ordered by effective value (value minus the fee to spend
//! them) and two greedy passes are tried in turn:
//!
//! 1. **Blackjack** skips any input that would overshoot the target by more
//!    than the cost of a change output, looking for a changeless match.
//! 2. **Accumulative** adds inputs until the target plus fee is covered,
//!    skipping inputs that cost more to spend than they are worth.
//!
//! Leftover value goes into the caller's change template only when it is
//! worth more than both the change script's dust limit and the fee needed to
//! spend it later; otherwise it is absorbed into the fee. The selector sees
//! nothing but values and virtual sizes.

use std::cmp::Reverse;

use crate::config::{DustLimits, EngineConfig};
use crate::error::TxValidationError;
use crate::types::{ScriptType, SelectionResult, TxInput, TxOutput};

/// Version (4), locktime (4), and one-byte input and output counts.
const TX_OVERHEAD_VSIZE: u64 = 10;

/// Segwit marker and flag: two weight units, rounded up to one vbyte.
const SEGWIT_OVERHEAD_VSIZE: u64 = 1;

/// Estimated virtual size of a transaction spending `inputs` to `outputs`.
pub fn estimate_vsize<'a>(
    inputs: impl IntoIterator<Item = &'a TxInput>,
    outputs: &[TxOutput],
) -> u64 {
    let mut vsize = TX_OVERHEAD_VSIZE + outputs.iter().map(TxOutput::vsize).sum::<u64>();
    let mut segwit = false;
    for input in inputs {
        vsize += input.vsize();
        segwit |= input.script_type().is_segwit();
    }
    if segwit {
        vsize += SEGWIT_OVERHEAD_VSIZE;
    }
    vsize
}

pub struct CoinSelector {
    /// Fee rate in sat/vB.
    fee_rate: u64,
    dust_limits: DustLimits,
}

impl CoinSelector {
    pub fn new(fee_rate: u64, config: &EngineConfig) -> Self {
        Self {
            fee_rate,
            dust_limits: config.dust_limits,
        }
    }

    pub fn fee_rate(&self) -> u64 {
        self.fee_rate
    }

    /// Select inputs paying `outputs` at this selector's fee rate.
    ///
    /// `change` is a template for the change output; its value is
    /// overwritten with the leftover when a change output is kept.
    pub fn select_coins(
        &self,
        inputs: &[TxInput],
        outputs: Vec<TxOutput>,
        change: TxOutput,
    ) -> Result<SelectionResult, TxValidationError> {
        if outputs.is_empty() {
            return Err(TxValidationError::NoRecipients);
        }
        let target = outputs
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.value))
            .ok_or_else(|| TxValidationError::InvalidAmount("output total overflows".into()))?;

        let mut candidates: Vec<&TxInput> = inputs.iter().collect();
        candidates.sort_by_key(|input| Reverse(self.effective_value(input)));

        let threshold = self.change_threshold(&change);

        let (selected, strategy) = match self.blackjack(&candidates, &outputs, target, threshold) {
            Some(selected) => (selected, "blackjack"),
            None => match self.accumulative(&candidates, &outputs, target) {
                Some(selected) => (selected, "accumulative"),
                None => return Err(self.insufficient(inputs, &outputs, target)),
            },
        };

        let result = self.finish(selected, outputs, change, threshold);
        tracing::debug!(
            strategy,
            fee_rate = self.fee_rate,
            inputs = result.inputs.len(),
            outputs = result.outputs.len(),
            change = ?result.change.as_ref().map(|c| c.value),
            fee = result.fee,
            "selected coins"
        );
        Ok(result)
    }

    /// Value minus the fee to spend the input at the current rate.
    fn effective_value(&self, input: &TxInput) -> i128 {
        i128::from(input.value()) - i128::from(self.input_fee(input))
    }

    fn input_fee(&self, input: &TxInput) -> u64 {
        self.fee_rate.saturating_mul(input.vsize())
    }

    fn fee_for(&self, vsize: u64) -> u64 {
        self.fee_rate.saturating_mul(vsize)
    }

    /// Smallest leftover worth keeping as change: above the change script's
    /// dust limit and above the fee to spend it later.
    fn change_threshold(&self, change: &TxOutput) -> u64 {
        let spend_vsize = ScriptType::from_script(change.script_pubkey())
            .unwrap_or(ScriptType::P2pkh)
            .input_vsize();
        self.dust_limits
            .for_script(change.script_pubkey())
            .max(self.fee_for(spend_vsize))
    }

    fn blackjack<'a>(
        &self,
        candidates: &[&'a TxInput],
        outputs: &[TxOutput],
        target: u64,
        threshold: u64,
    ) -> Option<Vec<&'a TxInput>> {
        let mut selected: Vec<&TxInput> = Vec::new();
        let mut accumulated = 0u64;

        for &input in candidates {
            let fee = self.fee_for(estimate_vsize(
                selected.iter().copied().chain(std::iter::once(input)),
                outputs,
            ));
            let with_input = accumulated.saturating_add(input.value());
            if with_input > target.saturating_add(fee).saturating_add(threshold) {
                continue;
            }

            selected.push(input);
            accumulated = with_input;
            if accumulated >= target.saturating_add(fee) {
                return Some(selected);
            }
        }
        None
    }

    fn accumulative<'a>(
        &self,
        candidates: &[&'a TxInput],
        outputs: &[TxOutput],
        target: u64,
    ) -> Option<Vec<&'a TxInput>> {
        let mut selected: Vec<&TxInput> = Vec::new();
        let mut accumulated = 0u64;

        for &input in candidates {
            if self.input_fee(input) > input.value() {
                continue;
            }

            selected.push(input);
            accumulated = accumulated.saturating_add(input.value());
            let fee = self.fee_for(estimate_vsize(selected.iter().copied(), outputs));
            if accumulated >= target.saturating_add(fee) {
                return Some(selected);
            }
        }
        None
    }

    fn finish(
        &self,
        selected: Vec<&TxInput>,
        outputs: Vec<TxOutput>,
        mut change: TxOutput,
        threshold: u64,
    ) -> SelectionResult {
        let input_total: u64 = selected.iter().map(|i| i.value()).sum();
        let target: u64 = outputs.iter().map(|o| o.value).sum();

        let vsize_with_change = estimate_vsize(selected.iter().copied(), &outputs) + change.vsize();
        let remainder = input_total
            .saturating_sub(target)
            .saturating_sub(self.fee_for(vsize_with_change));

        let change = if remainder > threshold {
            change.value = remainder;
            Some(change)
        } else {
            if remainder > 0 {
                tracing::debug!(remainder, threshold, "leftover below change threshold; added to fee");
            }
            None
        };

        let fee = input_total - target - change.as_ref().map_or(0, |c| c.value);
        SelectionResult {
            inputs: selected.into_iter().cloned().collect(),
            outputs,
            change,
            fee,
        }
    }

    fn insufficient(
        &self,
        inputs: &[TxInput],
        outputs: &[TxOutput],
        target: u64,
    ) -> TxValidationError {
        let have: u64 = inputs.iter().map(TxInput::value).sum();
        let spendable: Vec<&TxInput> = inputs
            .iter()
            .filter(|input| self.input_fee(input) <= input.value())
            .collect();
        let need = target.saturating_add(self.fee_for(estimate_vsize(spendable, outputs)));
        tracing::debug!(have, need, fee_rate = self.fee_rate, "insufficient funds for selection");
        TxValidationError::InsufficientFunds { have, need }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{make_input, p2wpkh_address};

    fn selector(fee_rate: u64) -> CoinSelector {
        CoinSelector::new(fee_rate, &EngineConfig::default())
    }

    fn recipient(value: u64) -> TxOutput {
        TxOutput::from_address(value, &p2wpkh_address())
    }

    fn change() -> TxOutput {
        TxOutput::from_address(0, &p2wpkh_address())
    }

    fn assert_balanced(result: &SelectionResult) {
        assert_eq!(
            result.input_total(),
            result.output_total() + result.fee,
            "inputs must equal outputs plus fee"
        );
    }

    #[test]
    fn vsize_counts_segwit_overhead_once() {
        let inputs = vec![make_input(1_000, 1), make_input(2_000, 2)];
        let outputs = vec![recipient(500)];
        assert_eq!(estimate_vsize(&inputs, &outputs), 10 + 31 + 68 + 68 + 1);
        assert_eq!(estimate_vsize(std::iter::empty(), &outputs), 10 + 31);
    }

    #[test]
    fn two_utxos_cover_one_recipient() {
        let inputs = vec![make_input(100_000, 1), make_input(100_000, 2)];
        let result = selector(1)
            .select_coins(&inputs, vec![recipient(100_000)], change())
            .unwrap();

        assert_eq!(result.inputs.len(), 2);
        assert!(result.fee > 0);
        assert_balanced(&result);
        let change = result.change.as_ref().expect("large leftover becomes change");
        assert_eq!(change.value, 200_000 - 100_000 - result.fee);
        assert_eq!(result.fee, 10 + 31 + 31 + 68 + 68 + 1);
    }

    #[test]
    fn small_leftover_is_folded_into_fee() {
        let inputs = vec![make_input(10_000, 1)];
        let result = selector(1)
            .select_coins(&inputs, vec![recipient(9_600)], change())
            .unwrap();

        assert!(result.change.is_none());
        assert_eq!(result.fee, 400);
        assert_balanced(&result);
    }

    #[test]
    fn blackjack_prefers_changeless_match() {
        // The 5,200-sat input covers the target almost exactly; the larger
        // one would force a change output.
        let inputs = vec![make_input(50_000, 1), make_input(5_200, 2)];
        let result = selector(1)
            .select_coins(&inputs, vec![recipient(5_000)], change())
            .unwrap();

        assert_eq!(result.inputs.len(), 1);
        assert_eq!(result.inputs[0].value(), 5_200);
        assert!(result.change.is_none());
        assert_balanced(&result);
    }

    #[test]
    fn never_emits_change_below_dust() {
        let inputs = vec![make_input(20_000, 1), make_input(7_000, 2)];
        for rate in [0, 1, 3, 10] {
            for value in (1_000..26_000).step_by(137) {
                let Ok(result) =
                    selector(rate).select_coins(&inputs, vec![recipient(value)], change())
                else {
                    continue;
                };
                assert_balanced(&result);
                if let Some(change) = &result.change {
                    assert!(change.value > 294, "change {} is dust", change.value);
                }
                let vsize = estimate_vsize(&result.inputs, &result.outputs);
                assert!(result.fee >= rate * vsize, "fee below the rate floor");
            }
        }
    }

    #[test]
    fn insufficient_funds_is_reported() {
        let inputs = vec![make_input(1_000, 1), make_input(2_000, 2)];
        let err = selector(1)
            .select_coins(&inputs, vec![recipient(5_000)], change())
            .unwrap_err();
        assert!(matches!(
            err,
            TxValidationError::InsufficientFunds { have: 3_000, need } if need > 5_000
        ));
    }

    #[test]
    fn no_inputs_is_insufficient_not_empty_success() {
        let err = selector(1)
            .select_coins(&[], vec![recipient(1_000)], change())
            .unwrap_err();
        assert!(matches!(err, TxValidationError::InsufficientFunds { have: 0, .. }));
    }

    #[test]
    fn uneconomic_inputs_are_skipped() {
        // At 10 sat/vB a P2WPKH input costs 680 sats to spend.
        let inputs = vec![make_input(500, 1), make_input(50_000, 2)];
        let result = selector(10)
            .select_coins(&inputs, vec![recipient(30_000)], change())
            .unwrap();
        assert!(result.inputs.iter().all(|i| i.value() != 500));
        assert_balanced(&result);
    }

    #[test]
    fn requires_recipients() {
        let inputs = vec![make_input(10_000, 1)];
        assert_eq!(
            selector(1).select_coins(&inputs, vec![], change()),
            Err(TxValidationError::NoRecipients)
        );
    }

    #[test]
    fn zero_fee_rate_spends_exactly() {
        let inputs = vec![make_input(10_000, 1)];
        let result = selector(0)
            .select_coins(&inputs, vec![recipient(10_000)], change())
            .unwrap();
        assert_eq!(result.fee, 0);
        assert!(result.change.is_none());
    }
}
