//! Shared test helpers for `satchel-core` unit tests.
//!
//! Deterministic seeds, keys, addresses and UTXOs so that tests across
//! modules share a single source of truth for dummy data construction.

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{Address, CompressedPublicKey, Network, Txid};

use crate::account::{Account, AccountFactory};
use crate::provider::SeedKeyTree;
use crate::types::{ScriptType, TxInput, Utxo};

/// Fixed master seed (BIP32 test vector 1).
pub const TEST_SEED: [u8; 16] = [
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
];

// ==============================================================================
// Txid Helpers
// ==============================================================================

/// Create a deterministic `Txid` from a single distinguishing byte.
pub fn txid_from_byte(b: u8) -> Txid {
    let mut bytes = [0u8; 32];
    bytes[0] = b;
    Txid::from_byte_array(bytes)
}

// ==============================================================================
// Keys and Addresses
// ==============================================================================

/// A regtest P2WPKH address for a fixed key, unrelated to [`TEST_SEED`].
pub fn p2wpkh_address() -> Address {
    let secp = Secp256k1::signing_only();
    let secret = SecretKey::from_slice(&[3u8; 32]).expect("valid secret key");
    let public_key = CompressedPublicKey(secret.public_key(&secp));
    Address::p2wpkh(&public_key, Network::Regtest)
}

/// Unlock the regtest account at `index` from [`TEST_SEED`].
pub async fn test_account(script_type: ScriptType, index: u32) -> Account {
    let provider = SeedKeyTree::from_seed(&TEST_SEED, Network::Regtest).expect("seed");
    AccountFactory::new(&provider, Network::Regtest)
        .unlock(index, &script_type.to_string())
        .await
        .expect("unlock test account")
}

// ==============================================================================
// UTXO Builders
// ==============================================================================

/// A confirmed UTXO at `txid_from_byte(byte):0`.
pub fn make_utxo(value: u64, byte: u8) -> Utxo {
    Utxo {
        block: 100,
        tx_hash: txid_from_byte(byte),
        index: 0,
        value,
    }
}

/// A P2WPKH input locked to [`p2wpkh_address`], for selection tests that
/// never sign.
pub fn make_input(value: u64, byte: u8) -> TxInput {
    TxInput::new(
        make_utxo(value, byte),
        p2wpkh_address().script_pubkey(),
        ScriptType::P2wpkh,
    )
    .expect("value within supply")
}
