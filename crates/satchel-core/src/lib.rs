pub mod account;
pub mod coin_selection;
pub mod config;
pub mod discovery;
pub mod error;
pub mod estimate;
pub mod keys;
pub mod provider;
pub mod psbt;
pub mod types;
pub mod units;
pub mod wallet;

#[cfg(test)]
pub(crate) mod test_util;

pub use account::{Account, AccountFactory};
pub use config::{DustLimits, EngineConfig};
pub use error::CoreError;
pub use types::{Recipient, ScriptType, TransactionInfo, Utxo};
pub use wallet::{SendRequest, Wallet};
