//! HD key derivation and signing.
//!
//! [`Deriver`] turns the raw node handed over by a [`KeyTreeProvider`] into a
//! BIP32 [`Xpriv`] and walks child paths from it. [`Signer`] wraps one node
//! and produces ECDSA signatures; accounts hold a signer built from the
//! *root* node so any descendant key named in a PSBT's derivation metadata
//! can be re-derived at signing time.

use std::fmt;

use bitcoin::bip32::{ChainCode, ChildNumber, DerivationPath, Fingerprint, Xpriv};
use bitcoin::secp256k1::{ecdsa, All, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::{CompressedPublicKey, Network};

use crate::error::{CoreError, DeriverError};
use crate::provider::KeyTreeProvider;

// ==============================================================================
// Path Parsing
// ==============================================================================

/// Parse path components such as `["m", "0'", "0", "3"]`. A leading `"m"`
/// is skipped and a trailing `'` marks a hardened step.
pub fn parse_path(components: &[&str]) -> Result<DerivationPath, DeriverError> {
    let steps = match components.first() {
        Some(&"m") => &components[1..],
        _ => components,
    };

    let mut children = Vec::with_capacity(steps.len());
    for component in steps {
        let invalid = || DeriverError::InvalidIndex((*component).to_owned());
        let child = match component.strip_suffix('\'') {
            Some(index) => {
                let index: u32 = index.parse().map_err(|_| invalid())?;
                ChildNumber::from_hardened_idx(index).map_err(|_| invalid())?
            }
            None => {
                let index: u32 = component.parse().map_err(|_| invalid())?;
                ChildNumber::from_normal_idx(index).map_err(|_| invalid())?
            }
        };
        children.push(child);
    }
    Ok(DerivationPath::from(children))
}

/// Render path components as `m/84'/0'/...`, skipping any leading `"m"`.
pub fn format_path(components: &[&str]) -> String {
    let mut rendered = String::from("m");
    for component in components.iter().skip_while(|c| **c == "m") {
        rendered.push('/');
        rendered.push_str(component);
    }
    rendered
}

// ==============================================================================
// Deriver
// ==============================================================================

/// A root node fetched from the key-tree provider.
#[derive(Clone)]
pub struct RootNode {
    pub xpriv: Xpriv,
    /// Absolute path of this node from the master key.
    pub path: DerivationPath,
    pub master_fingerprint: Fingerprint,
}

impl fmt::Debug for RootNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootNode")
            .field("path", &self.path)
            .field("depth", &self.xpriv.depth)
            .field("master_fingerprint", &self.master_fingerprint)
            .finish_non_exhaustive()
    }
}

pub struct Deriver<'a> {
    provider: &'a dyn KeyTreeProvider,
    network: Network,
    secp: Secp256k1<All>,
}

impl<'a> Deriver<'a> {
    pub fn new(provider: &'a dyn KeyTreeProvider, network: Network) -> Self {
        Self {
            provider,
            network,
            secp: Secp256k1::new(),
        }
    }

    /// Fetch the node at `path` from the provider and rebuild it as an
    /// [`Xpriv`].
    ///
    /// Constructing an `Xpriv` from key and chain code alone would leave it
    /// at depth zero; the provider's depth, child number and parent
    /// fingerprint are restored explicitly so later derivations and
    /// fingerprints are correct.
    pub async fn get_root(&self, path: &[&str]) -> Result<RootNode, DeriverError> {
        let derivation_path = parse_path(path)?;

        let node = self
            .provider
            .get_node(path)
            .await
            .map_err(|err| match err {
                CoreError::Deriver(inner) => inner,
                other => DeriverError::Provider(other.to_string()),
            })?;

        let key_bytes = node
            .private_key
            .as_deref()
            .ok_or(DeriverError::MissingPrivateKey)?;
        let private_key =
            SecretKey::from_slice(key_bytes).map_err(|_| DeriverError::NodeConstruction)?;
        let chain_code: [u8; 32] = node
            .chain_code
            .as_slice()
            .try_into()
            .map_err(|_| DeriverError::NodeConstruction)?;

        let xpriv = Xpriv {
            network: self.network.into(),
            depth: node.depth,
            parent_fingerprint: Fingerprint::from(node.parent_fingerprint.to_be_bytes()),
            child_number: ChildNumber::from(node.index),
            private_key,
            chain_code: ChainCode::from(chain_code),
        };

        let requested_steps: &[ChildNumber] = derivation_path.as_ref();
        if usize::from(node.depth) != requested_steps.len() {
            tracing::warn!(
                requested_depth = requested_steps.len(),
                reported_depth = node.depth,
                "key-tree provider depth does not match requested path"
            );
        }

        // Only a depth-zero node is its own master.
        let master_fingerprint = match node.master_fingerprint {
            Some(fp) => Fingerprint::from(fp.to_be_bytes()),
            None if node.depth == 0 => xpriv.fingerprint(&self.secp),
            None => return Err(DeriverError::MissingMasterFingerprint { depth: node.depth }),
        };

        tracing::debug!(path = %format_path(path), %master_fingerprint, "derived root node");

        Ok(RootNode {
            xpriv,
            path: derivation_path,
            master_fingerprint,
        })
    }

    /// Derive the descendant of `root` at the relative path `components`.
    pub fn get_child(&self, root: &Xpriv, components: &[&str]) -> Result<Xpriv, DeriverError> {
        let path = parse_path(components)?;
        root.derive_priv(&self.secp, &path)
            .map_err(|_| DeriverError::Derivation)
    }
}

// ==============================================================================
// Signer
// ==============================================================================

/// Signing capability bound to one HD node.
///
/// `derive_path` returns a new signer; the receiver is never moved along the
/// tree. Every signer derived from a root reports the root's fingerprint so
/// signature metadata stays attributable to the originating master key.
#[derive(Clone)]
pub struct Signer {
    node: Xpriv,
    /// Absolute path of `node` from the master key.
    path: DerivationPath,
    fingerprint: Fingerprint,
    secp: Secp256k1<All>,
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("path", &self.path)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl Signer {
    pub fn from_root(root: &RootNode) -> Self {
        Self {
            node: root.xpriv,
            path: root.path.clone(),
            fingerprint: root.master_fingerprint,
            secp: Secp256k1::new(),
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn path(&self) -> &DerivationPath {
        &self.path
    }

    pub fn public_key(&self) -> CompressedPublicKey {
        CompressedPublicKey(self.node.private_key.public_key(&self.secp))
    }

    pub fn sign(&self, message: &Message) -> ecdsa::Signature {
        self.secp.sign_ecdsa(message, &self.node.private_key)
    }

    pub fn verify(&self, message: &Message, signature: &ecdsa::Signature) -> bool {
        verify_signature(&self.public_key().0, message, signature)
    }

    /// A signer for the descendant at `relative` beneath this node.
    pub fn derive_path(&self, relative: &DerivationPath) -> Result<Signer, DeriverError> {
        let node = self
            .node
            .derive_priv(&self.secp, relative)
            .map_err(|_| DeriverError::Derivation)?;

        let relative_steps: &[ChildNumber] = relative.as_ref();
        let mut children: Vec<ChildNumber> = self.path.as_ref().to_vec();
        children.extend_from_slice(relative_steps);

        Ok(Signer {
            node,
            path: DerivationPath::from(children),
            fingerprint: self.fingerprint,
            secp: self.secp.clone(),
        })
    }

    /// A signer for the node at the absolute path `full`, which must lie at
    /// or beneath this signer's own path.
    pub fn derive_absolute(&self, full: &DerivationPath) -> Result<Signer, DeriverError> {
        let own: &[ChildNumber] = self.path.as_ref();
        let target: &[ChildNumber] = full.as_ref();
        if !target.starts_with(own) {
            return Err(DeriverError::PathOutsideRoot {
                path: full.to_string(),
                root: self.path.to_string(),
            });
        }
        self.derive_path(&DerivationPath::from(target[own.len()..].to_vec()))
    }
}

/// Verify `signature` over `message` against `public_key`.
///
/// Independent of any [`Signer`]: the verifying key is a derived child key
/// while the signer that produced the signature may hold the root.
pub fn verify_signature(
    public_key: &PublicKey,
    message: &Message,
    signature: &ecdsa::Signature,
) -> bool {
    Secp256k1::verification_only()
        .verify_ecdsa(message, signature, public_key)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::MockKeyTree;
    use crate::provider::{KeyTreeNode, SeedKeyTree};
    use crate::test_util::TEST_SEED;

    #[test]
    fn parse_path_handles_hardened_and_normal_steps() {
        let path = parse_path(&["m", "0'", "0", "3"]).unwrap();
        let steps: &[ChildNumber] = path.as_ref();
        assert_eq!(
            steps,
            &[
                ChildNumber::from_hardened_idx(0).unwrap(),
                ChildNumber::from_normal_idx(0).unwrap(),
                ChildNumber::from_normal_idx(3).unwrap(),
            ]
        );
    }

    #[test]
    fn parse_path_rejects_bad_components() {
        for bad in ["x", "-1", "1.5", "2147483648", "2147483648'", "'"] {
            assert_eq!(
                parse_path(&["m", bad]),
                Err(DeriverError::InvalidIndex(bad.to_owned())),
                "component {bad:?} must be rejected"
            );
        }
    }

    #[test]
    fn format_path_strips_leading_m() {
        assert_eq!(format_path(&["m", "84'", "0'"]), "m/84'/0'");
        assert_eq!(format_path(&["0'", "0", "1"]), "m/0'/0/1");
    }

    #[tokio::test]
    async fn get_root_restores_depth_and_index() {
        let provider = SeedKeyTree::from_seed(&TEST_SEED, Network::Regtest).unwrap();
        let deriver = Deriver::new(&provider, Network::Regtest);

        let root = deriver.get_root(&["m", "84'", "1'"]).await.unwrap();
        assert_eq!(root.xpriv.depth, 2);
        assert_eq!(
            root.xpriv.child_number,
            ChildNumber::from_hardened_idx(1).unwrap()
        );
        assert_eq!(root.master_fingerprint, provider.master_fingerprint());

        // Deriving through the rebuilt root matches deriving from the master.
        let child = deriver.get_child(&root.xpriv, &["m", "0'", "0", "3"]).unwrap();
        let direct = provider
            .derive(&parse_path(&["m", "84'", "1'", "0'", "0", "3"]).unwrap())
            .unwrap();
        assert_eq!(child.private_key, direct.private_key);
        assert_eq!(child.depth, 5);
    }

    #[tokio::test]
    async fn get_root_fails_without_private_key() {
        let provider = MockKeyTree::builder().without_private_key().build();
        let deriver = Deriver::new(&provider, Network::Regtest);
        let err = deriver.get_root(&["m", "84'", "0'"]).await.unwrap_err();
        assert_eq!(err, DeriverError::MissingPrivateKey);
    }

    #[tokio::test]
    async fn get_root_wraps_malformed_key_bytes() {
        let provider = MockKeyTree::builder()
            .with_private_key(vec![1u8; 31])
            .build();
        let deriver = Deriver::new(&provider, Network::Regtest);
        let err = deriver.get_root(&["m", "84'", "0'"]).await.unwrap_err();
        assert_eq!(err, DeriverError::NodeConstruction);

        let provider = MockKeyTree::builder().with_chain_code(vec![2u8; 16]).build();
        let deriver = Deriver::new(&provider, Network::Regtest);
        let err = deriver.get_root(&["m", "84'", "0'"]).await.unwrap_err();
        assert_eq!(err, DeriverError::NodeConstruction);
    }

    #[tokio::test]
    async fn get_root_maps_provider_failures() {
        let provider = MockKeyTree::builder().failing("keyring locked").build();
        let deriver = Deriver::new(&provider, Network::Regtest);
        let err = deriver.get_root(&["m", "84'", "0'"]).await.unwrap_err();
        assert!(matches!(err, DeriverError::Provider(msg) if msg.contains("keyring locked")));
    }

    /// Serves nodes from a seed but withholds the master fingerprint.
    struct NoMasterFingerprint(SeedKeyTree);

    #[async_trait::async_trait]
    impl KeyTreeProvider for NoMasterFingerprint {
        async fn get_node(&self, path: &[&str]) -> Result<KeyTreeNode, CoreError> {
            let mut node = self.0.get_node(path).await?;
            node.master_fingerprint = None;
            Ok(node)
        }
    }

    #[tokio::test]
    async fn get_root_requires_master_fingerprint_below_master() {
        let seed = SeedKeyTree::from_seed(&TEST_SEED, Network::Regtest).unwrap();
        let provider = NoMasterFingerprint(seed);
        let deriver = Deriver::new(&provider, Network::Regtest);
        let err = deriver.get_root(&["m", "84'", "1'"]).await.unwrap_err();
        assert_eq!(err, DeriverError::MissingMasterFingerprint { depth: 2 });

        let provider = MockKeyTree::builder().without_master_fingerprint().build();
        let deriver = Deriver::new(&provider, Network::Regtest);
        let err = deriver.get_root(&["m", "84'", "0'"]).await.unwrap_err();
        assert_eq!(err, DeriverError::MissingMasterFingerprint { depth: 2 });
    }

    #[tokio::test]
    async fn master_node_fingerprints_itself() {
        let seed = SeedKeyTree::from_seed(&TEST_SEED, Network::Regtest).unwrap();
        let expected = seed.master_fingerprint();
        let provider = NoMasterFingerprint(seed);
        let deriver = Deriver::new(&provider, Network::Regtest);
        let root = deriver.get_root(&["m"]).await.unwrap();
        assert_eq!(root.xpriv.depth, 0);
        assert_eq!(root.master_fingerprint, expected);
    }

    #[tokio::test]
    async fn derived_signers_keep_root_fingerprint() {
        let provider = SeedKeyTree::from_seed(&TEST_SEED, Network::Regtest).unwrap();
        let deriver = Deriver::new(&provider, Network::Regtest);
        let root = deriver.get_root(&["m", "84'", "1'"]).await.unwrap();
        let signer = Signer::from_root(&root);

        let child = signer
            .derive_path(&parse_path(&["0'", "0", "7"]).unwrap())
            .unwrap();
        assert_eq!(child.fingerprint(), signer.fingerprint());
        assert_eq!(child.path(), &parse_path(&["84'", "1'", "0'", "0", "7"]).unwrap());
        assert_ne!(child.public_key(), signer.public_key());

        // The receiver is untouched.
        assert_eq!(signer.path(), &root.path);
    }

    #[tokio::test]
    async fn derive_absolute_rejects_foreign_paths() {
        let provider = SeedKeyTree::from_seed(&TEST_SEED, Network::Regtest).unwrap();
        let deriver = Deriver::new(&provider, Network::Regtest);
        let root = deriver.get_root(&["m", "84'", "1'"]).await.unwrap();
        let signer = Signer::from_root(&root);

        let inside = parse_path(&["84'", "1'", "0'", "0", "2"]).unwrap();
        assert!(signer.derive_absolute(&inside).is_ok());

        let outside = parse_path(&["44'", "1'", "0'", "0", "2"]).unwrap();
        assert!(matches!(
            signer.derive_absolute(&outside),
            Err(DeriverError::PathOutsideRoot { .. })
        ));
    }

    #[tokio::test]
    async fn sign_then_verify() {
        let provider = SeedKeyTree::from_seed(&TEST_SEED, Network::Regtest).unwrap();
        let deriver = Deriver::new(&provider, Network::Regtest);
        let root = deriver.get_root(&["m", "84'", "1'"]).await.unwrap();
        let signer = Signer::from_root(&root)
            .derive_path(&parse_path(&["0'", "0", "0"]).unwrap())
            .unwrap();

        let message = Message::from_digest([7u8; 32]);
        let signature = signer.sign(&message);
        assert!(signer.verify(&message, &signature));
        assert!(verify_signature(&signer.public_key().0, &message, &signature));

        let other = Message::from_digest([8u8; 32]);
        assert!(!verify_signature(&signer.public_key().0, &other, &signature));
    }
}
