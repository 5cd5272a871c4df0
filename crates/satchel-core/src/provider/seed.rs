use async_trait::async_trait;
use bitcoin::bip32::{DerivationPath, Fingerprint, Xpriv};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::Network;

use crate::error::{CoreError, DeriverError};
use crate::keys::parse_path;

use super::{KeyTreeNode, KeyTreeProvider};

/// A [`KeyTreeProvider`] backed by a BIP32 seed held in memory.
pub struct SeedKeyTree {
    master: Xpriv,
    secp: Secp256k1<All>,
}

impl SeedKeyTree {
    pub fn from_seed(seed: &[u8], network: Network) -> Result<Self, DeriverError> {
        let master = Xpriv::new_master(network, seed).map_err(|_| DeriverError::NodeConstruction)?;
        Ok(Self {
            master,
            secp: Secp256k1::new(),
        })
    }

    pub fn master_fingerprint(&self) -> Fingerprint {
        self.master.fingerprint(&self.secp)
    }

    pub fn derive(&self, path: &DerivationPath) -> Result<Xpriv, DeriverError> {
        self.master
            .derive_priv(&self.secp, path)
            .map_err(|_| DeriverError::Derivation)
    }
}

#[async_trait]
impl KeyTreeProvider for SeedKeyTree {
    async fn get_node(&self, path: &[&str]) -> Result<KeyTreeNode, CoreError> {
        let node = self.derive(&parse_path(path)?)?;
        Ok(KeyTreeNode {
            private_key: Some(node.private_key.secret_bytes().to_vec()),
            chain_code: node.chain_code[..].to_vec(),
            depth: node.depth,
            index: u32::from(node.child_number),
            parent_fingerprint: fingerprint_to_u32(node.parent_fingerprint),
            master_fingerprint: Some(fingerprint_to_u32(self.master_fingerprint())),
        })
    }
}

fn fingerprint_to_u32(fingerprint: Fingerprint) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&fingerprint[..]);
    u32::from_be_bytes(bytes)
}
