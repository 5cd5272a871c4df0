//! Spendable accounts.
//!
//! An [`Account`] is the public identity of one derived child key (address,
//! output script, derivation metadata) together with a [`Signer`] holding the
//! root it was derived from. [`AccountFactory`] performs the unlock: resolve
//! the script type, walk root → child along the canonical path, wrap the
//! root as the signer.

use std::sync::OnceLock;

use bitcoin::bip32::{DerivationPath, Fingerprint};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Address, CompressedPublicKey, Network, Script, ScriptBuf};

use crate::error::{TxValidationError, WalletError};
use crate::keys::{format_path, parse_path, Deriver, Signer};
use crate::provider::KeyTreeProvider;
use crate::types::{ScriptType, TxInput, TxOutput, Utxo};

// ==============================================================================
// Canonical Paths
// ==============================================================================

/// Root path for `script_type` on `network`: `m/<purpose>'/<coin>'`.
pub fn root_path(script_type: ScriptType, network: Network) -> Vec<String> {
    let coin = match network {
        Network::Bitcoin => 0,
        _ => 1,
    };
    vec![
        "m".to_owned(),
        format!("{}'", script_type.purpose()),
        format!("{coin}'"),
    ]
}

/// Child path beneath the root: first account, receive chain, `index`.
pub fn child_path(index: u32) -> Vec<String> {
    vec![
        "m".to_owned(),
        "0'".to_owned(),
        "0".to_owned(),
        index.to_string(),
    ]
}

/// The payment address for a key of the given script type.
pub fn payment_address(
    script_type: ScriptType,
    public_key: &CompressedPublicKey,
    network: Network,
) -> Address {
    match script_type {
        ScriptType::P2pkh => Address::p2pkh(public_key.pubkey_hash(), network),
        ScriptType::P2shP2wpkh => Address::p2shwpkh(public_key, network),
        ScriptType::P2wpkh => Address::p2wpkh(public_key, network),
    }
}

// ==============================================================================
// Account
// ==============================================================================

#[derive(Debug, Clone)]
pub struct Account {
    master_fingerprint: Fingerprint,
    index: u32,
    hd_path: String,
    derivation_path: DerivationPath,
    public_key: CompressedPublicKey,
    network: Network,
    script_type: ScriptType,
    signer: Signer,
    address: OnceLock<Address>,
    script_pubkey: OnceLock<ScriptBuf>,
}

impl Account {
    pub fn master_fingerprint(&self) -> Fingerprint {
        self.master_fingerprint
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Full path from the master key, e.g. `m/84'/0'/0'/0/3`.
    pub fn hd_path(&self) -> &str {
        &self.hd_path
    }

    pub fn derivation_path(&self) -> &DerivationPath {
        &self.derivation_path
    }

    pub fn public_key(&self) -> &CompressedPublicKey {
        &self.public_key
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn script_type(&self) -> ScriptType {
        self.script_type
    }

    /// The root signer. Signing keys are re-derived beneath it.
    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    pub fn address(&self) -> &Address {
        self.address
            .get_or_init(|| payment_address(self.script_type, &self.public_key, self.network))
    }

    pub fn script_pubkey(&self) -> &Script {
        self.script_pubkey
            .get_or_init(|| self.address().script_pubkey())
    }

    /// The P2WPKH program nested inside a P2SH-P2WPKH output.
    pub fn redeem_script(&self) -> Option<ScriptBuf> {
        match self.script_type {
            ScriptType::P2shP2wpkh => Some(ScriptBuf::new_p2wpkh(&self.public_key.wpubkey_hash())),
            ScriptType::P2pkh | ScriptType::P2wpkh => None,
        }
    }

    /// Wrap a UTXO locked to this account as a spendable input.
    pub fn tx_input(&self, utxo: Utxo) -> Result<TxInput, TxValidationError> {
        TxInput::new(utxo, self.script_pubkey().to_owned(), self.script_type)
    }

    /// A zero-valued output back to this account, used as the change
    /// template during coin selection.
    pub fn change_template(&self) -> TxOutput {
        TxOutput::from_address(0, self.address())
    }
}

// ==============================================================================
// Account Factory
// ==============================================================================

pub struct AccountFactory<'a> {
    deriver: Deriver<'a>,
    network: Network,
}

impl<'a> AccountFactory<'a> {
    pub fn new(provider: &'a dyn KeyTreeProvider, network: Network) -> Self {
        Self {
            deriver: Deriver::new(provider, network),
            network,
        }
    }

    /// Unlock the account at `index` for `script_type` (`"p2wpkh"` or a
    /// namespaced `"bip122:p2wpkh"`).
    pub async fn unlock(&self, index: u32, script_type: &str) -> Result<Account, WalletError> {
        let script_type: ScriptType = script_type.parse()?;

        let root_components = root_path(script_type, self.network);
        let root_components: Vec<&str> = root_components.iter().map(String::as_str).collect();
        let child_components = child_path(index);
        let child_components: Vec<&str> = child_components.iter().map(String::as_str).collect();

        let root = self
            .deriver
            .get_root(&root_components)
            .await
            .map_err(WalletError::Unlock)?;
        let child = self
            .deriver
            .get_child(&root.xpriv, &child_components)
            .map_err(WalletError::Unlock)?;

        let full_components: Vec<&str> = root_components
            .iter()
            .chain(child_components.iter().skip(1))
            .copied()
            .collect();
        let derivation_path = parse_path(&full_components).map_err(WalletError::Unlock)?;
        let signer = Signer::from_root(&root);
        let secp = Secp256k1::signing_only();
        let public_key = CompressedPublicKey(child.private_key.public_key(&secp));

        let account = Account {
            master_fingerprint: root.master_fingerprint,
            index,
            hd_path: format_path(&full_components),
            derivation_path,
            public_key,
            network: self.network,
            script_type,
            signer,
            address: OnceLock::new(),
            script_pubkey: OnceLock::new(),
        };

        tracing::info!(
            index,
            %script_type,
            hd_path = %account.hd_path,
            address = %account.address(),
            "unlocked account"
        );
        Ok(account)
    }
}
