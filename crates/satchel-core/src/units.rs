//! Fixed-point satoshi ⇄ BTC conversion.
//!
//! Satoshi values are exact `u64`s bounded by the maximum supply. BTC strings
//! are rendered with exactly eight decimals and parsed with the `bitcoin`
//! crate's denomination parser after a precision check of our own, so a
//! string with nine fractional digits is reported as too precise no matter
//! how large its integer part is.

use bitcoin::{Amount, Denomination};

use crate::error::UnitError;

pub const SATS_PER_BTC: u64 = 100_000_000;

/// 21,000,000 BTC in satoshis.
pub const MAX_SATS: u64 = 21_000_000 * SATS_PER_BTC;

const BTC_DECIMALS: usize = 8;

/// Parse a BTC-denominated decimal string into satoshis.
pub fn btc_to_sats(btc: &str) -> Result<u64, UnitError> {
    let trimmed = btc.trim();

    if let Some((_, fraction)) = trimmed.split_once('.') {
        if fraction.len() > BTC_DECIMALS {
            return Err(UnitError::TooPrecise(btc.to_owned()));
        }
    }
    if trimmed.starts_with('-') {
        return Err(UnitError::OutOfRange(btc.to_owned()));
    }

    let amount =
        Amount::from_str_in(trimmed, Denomination::Bitcoin).map_err(|e| UnitError::Invalid {
            input: btc.to_owned(),
            message: e.to_string(),
        })?;

    if amount.to_sat() > MAX_SATS {
        return Err(UnitError::OutOfRange(btc.to_owned()));
    }
    Ok(amount.to_sat())
}

/// Render satoshis as a BTC string with exactly eight decimals.
pub fn sats_to_btc(sats: u64) -> Result<String, UnitError> {
    if sats > MAX_SATS {
        return Err(UnitError::OutOfRange(sats.to_string()));
    }
    Ok(format!(
        "{}.{:08}",
        sats / SATS_PER_BTC,
        sats % SATS_PER_BTC
    ))
}

/// Wrap a satoshi value as an [`Amount`], rejecting anything above the
/// maximum supply.
pub fn checked_amount(sats: u64) -> Result<Amount, UnitError> {
    if sats > MAX_SATS {
        return Err(UnitError::OutOfRange(sats.to_string()));
    }
    Ok(Amount::from_sat(sats))
}
