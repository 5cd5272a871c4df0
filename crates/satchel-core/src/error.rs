//! Error taxonomy for the engine.
//!
//! Callers match on these kinds to pick user-facing messaging ("insufficient
//! funds" versus "please retry"), so every library failure is mapped into one
//! of them before it leaves the component that produced it.

/// Key-tree derivation failures.
///
/// Variants deliberately carry no underlying library text: node construction
/// errors can echo key bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeriverError {
    #[error("key-tree provider returned no private key")]
    MissingPrivateKey,

    #[error("key-tree provider returned no master fingerprint for a depth-{depth} node")]
    MissingMasterFingerprint { depth: u8 },

    #[error("invalid index: {0}")]
    InvalidIndex(String),

    #[error("failed to construct key-tree node")]
    NodeConstruction,

    #[error("failed to derive child node")]
    Derivation,

    #[error("path {path} is not beneath the signer root {root}")]
    PathOutsideRoot { path: String, root: String },

    #[error("key-tree provider failure: {0}")]
    Provider(String),
}

/// Account unlock and script-type resolution failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalletError {
    #[error("unrecognized script type: {0}")]
    UnknownScriptType(String),

    #[error("failed to unlock account: {0}")]
    Unlock(#[source] DeriverError),
}

/// Transaction-content policy violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TxValidationError {
    #[error("insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: u64, need: u64 },

    #[error("amount {amount} is below the dust threshold of {threshold}")]
    TransactionDust { amount: u64, threshold: u64 },

    #[error("invalid signature on input {input}")]
    InvalidSignature { input: usize },

    #[error("transaction too large: weight {weight} exceeds {max}")]
    TransactionTooLarge { weight: u64, max: u64 },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("transaction has no recipients")]
    NoRecipients,
}

/// Mechanical PSBT failures not attributable to a policy violation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PsbtServiceError {
    #[error("cannot {operation} a PSBT in stage {stage}")]
    Stage {
        operation: &'static str,
        stage: &'static str,
    },

    #[error("failed to add inputs: {0}")]
    AddInputs(String),

    #[error("failed to add outputs: {0}")]
    AddOutputs(String),

    #[error("failed to sign input {input}: {message}")]
    Sign { input: usize, message: String },

    #[error("failed to finalize PSBT: {0}")]
    Finalize(String),

    #[error("failed to decode PSBT: {0}")]
    Decode(String),

    #[error("failed to compute PSBT fee: {0}")]
    Fee(String),
}

/// Satoshi / BTC conversion failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnitError {
    #[error("amount {0} has more than 8 fractional digits")]
    TooPrecise(String),

    #[error("amount {0} is outside the supply range")]
    OutOfRange(String),

    #[error("invalid amount {input}: {message}")]
    Invalid { input: String, message: String },
}

/// Umbrella error returned by operations spanning several components.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Deriver(#[from] DeriverError),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    TxValidation(#[from] TxValidationError),

    #[error(transparent)]
    Psbt(#[from] PsbtServiceError),

    #[error(transparent)]
    Unit(#[from] UnitError),

    #[error("provider failure: {0}")]
    Provider(String),
}

impl CoreError {
    /// `true` for the "requested amount is dust" outcome, which the
    /// max-spendable search treats as a narrowing signal.
    pub fn is_dust(&self) -> bool {
        matches!(
            self,
            Self::TxValidation(TxValidationError::TransactionDust { .. })
        )
    }

    pub fn is_insufficient_funds(&self) -> bool {
        matches!(
            self,
            Self::TxValidation(TxValidationError::InsufficientFunds { .. })
        )
    }
}
