//! Collaborator boundary.
//!
//! Defines the [`KeyTreeProvider`] and [`AddressActivity`] traits the engine
//! consumes, a seed-backed key tree ([`SeedKeyTree`]), and test mocks
//! (`mock::MockKeyTree`, `mock::MockActivity`).

#[cfg(test)]
pub mod mock;
mod seed;

pub use seed::SeedKeyTree;

use std::fmt;

use async_trait::async_trait;
use bitcoin::Txid;

use crate::error::CoreError;

/// Raw key-tree node as handed over by a key-tree provider.
///
/// `Debug` never prints key bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyTreeNode {
    pub private_key: Option<Vec<u8>>,
    pub chain_code: Vec<u8>,
    pub depth: u8,
    /// Child number, hardened bit included.
    pub index: u32,
    pub parent_fingerprint: u32,
    pub master_fingerprint: Option<u32>,
}

impl fmt::Debug for KeyTreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyTreeNode")
            .field(
                "private_key",
                &self.private_key.as_ref().map(|_| "<redacted>"),
            )
            .field("chain_code", &"<redacted>")
            .field("depth", &self.depth)
            .field("index", &self.index)
            .field("parent_fingerprint", &self.parent_fingerprint)
            .field("master_fingerprint", &self.master_fingerprint)
            .finish()
    }
}

/// Source of HD key material, e.g. a hardware keyring or a host's
/// entropy API.
#[async_trait]
pub trait KeyTreeProvider: Send + Sync {
    /// Fetch the node at `path`, given as components such as
    /// `["m", "84'", "0'"]`.
    async fn get_node(&self, path: &[&str]) -> Result<KeyTreeNode, CoreError>;
}

/// "Has this address ever been used" lookups backing address discovery.
#[async_trait]
pub trait AddressActivity: Send + Sync {
    /// Transaction ids touching `address`.
    async fn transaction_ids(&self, address: &str) -> Result<Vec<Txid>, CoreError>;

    async fn has_activity(&self, address: &str) -> Result<bool, CoreError> {
        Ok(!self.transaction_ids(address).await?.is_empty())
    }
}
