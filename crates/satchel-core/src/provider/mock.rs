use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::Txid;

use crate::error::CoreError;

use super::{AddressActivity, KeyTreeNode, KeyTreeProvider};

// ==============================================================================
// Key Tree
// ==============================================================================

/// A key-tree provider returning one canned node regardless of path.
pub struct MockKeyTree {
    node: KeyTreeNode,
    failure: Option<String>,
}

impl MockKeyTree {
    pub fn builder() -> MockKeyTreeBuilder {
        MockKeyTreeBuilder {
            node: KeyTreeNode {
                private_key: Some(vec![1u8; 32]),
                chain_code: vec![2u8; 32],
                depth: 2,
                index: 0x8000_0000,
                parent_fingerprint: 0,
                master_fingerprint: Some(0x0102_0304),
            },
            failure: None,
        }
    }
}

pub struct MockKeyTreeBuilder {
    node: KeyTreeNode,
    failure: Option<String>,
}

impl MockKeyTreeBuilder {
    pub fn with_private_key(mut self, key: Vec<u8>) -> Self {
        self.node.private_key = Some(key);
        self
    }

    pub fn without_private_key(mut self) -> Self {
        self.node.private_key = None;
        self
    }

    pub fn without_master_fingerprint(mut self) -> Self {
        self.node.master_fingerprint = None;
        self
    }

    pub fn with_chain_code(mut self, chain_code: Vec<u8>) -> Self {
        self.node.chain_code = chain_code;
        self
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_owned());
        self
    }

    pub fn build(self) -> MockKeyTree {
        MockKeyTree {
            node: self.node,
            failure: self.failure,
        }
    }
}

#[async_trait]
impl KeyTreeProvider for MockKeyTree {
    async fn get_node(&self, _path: &[&str]) -> Result<KeyTreeNode, CoreError> {
        match &self.failure {
            Some(message) => Err(CoreError::Provider(message.clone())),
            None => Ok(self.node.clone()),
        }
    }
}

// ==============================================================================
// Address Activity
// ==============================================================================

/// Address-activity lookups answered from a map, recording every address
/// queried in order.
pub struct MockActivity {
    history: HashMap<String, Vec<Txid>>,
    failing: Option<String>,
    calls: Mutex<Vec<String>>,
}

impl MockActivity {
    pub fn builder() -> MockActivityBuilder {
        MockActivityBuilder {
            history: HashMap::new(),
            failing: None,
        }
    }

    /// Addresses queried so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock poisoned").clone()
    }
}

pub struct MockActivityBuilder {
    history: HashMap<String, Vec<Txid>>,
    failing: Option<String>,
}

impl MockActivityBuilder {
    pub fn with_history(mut self, address: &str, txids: Vec<Txid>) -> Self {
        self.history.insert(address.to_owned(), txids);
        self
    }

    /// Fail every lookup of `address`.
    pub fn failing_on(mut self, address: &str) -> Self {
        self.failing = Some(address.to_owned());
        self
    }

    pub fn build(self) -> MockActivity {
        MockActivity {
            history: self.history,
            failing: self.failing,
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AddressActivity for MockActivity {
    async fn transaction_ids(&self, address: &str) -> Result<Vec<Txid>, CoreError> {
        self.calls
            .lock()
            .expect("calls lock poisoned")
            .push(address.to_owned());
        if self.failing.as_deref() == Some(address) {
            return Err(CoreError::Provider(format!("lookup failed for {address}")));
        }
        Ok(self.history.get(address).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::txid_from_byte;

    #[tokio::test]
    async fn activity_records_calls_in_order() {
        let activity = MockActivity::builder()
            .with_history("a1", vec![txid_from_byte(1)])
            .build();
        assert!(activity.has_activity("a1").await.unwrap());
        assert!(!activity.has_activity("a2").await.unwrap());
        assert_eq!(activity.calls(), vec!["a1".to_string(), "a2".to_string()]);
    }

    #[tokio::test]
    async fn failing_lookup_surfaces_provider_error() {
        let activity = MockActivity::builder().failing_on("bad").build();
        assert!(matches!(
            activity.has_activity("bad").await,
            Err(CoreError::Provider(_))
        ));
    }
}
