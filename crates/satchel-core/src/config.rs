//! Engine policy configuration.
//!
//! Policy values are passed explicitly into the selector, estimators and
//! wallet rather than read from global state, so tests can run the engine
//! against arbitrary policy.

use bitcoin::Script;
use serde::{Deserialize, Serialize};

use crate::types::ScriptType;

/// Standard relay weight ceiling.
pub const MAX_STANDARD_TX_WEIGHT: u64 = 400_000;

// ==============================================================================
// Dust Limits
// ==============================================================================

/// Minimum economically spendable output value per script type, in satoshis.
///
/// Derived from the standard 3 sat/vB relay-fee assumption; these are not
/// recomputed from live fee rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DustLimits {
    pub p2pkh: u64,
    pub p2sh_p2wpkh: u64,
    pub p2wpkh: u64,
}

impl Default for DustLimits {
    fn default() -> Self {
        Self {
            p2pkh: 546,
            p2sh_p2wpkh: 540,
            p2wpkh: 294,
        }
    }
}

impl DustLimits {
    pub fn for_script_type(&self, script_type: ScriptType) -> u64 {
        match script_type {
            ScriptType::P2pkh => self.p2pkh,
            ScriptType::P2shP2wpkh => self.p2sh_p2wpkh,
            ScriptType::P2wpkh => self.p2wpkh,
        }
    }

    /// Dust limit for an arbitrary output script. Scripts we do not
    /// classify get the most conservative (largest) limit.
    pub fn for_script(&self, script: &Script) -> u64 {
        match ScriptType::from_script(script) {
            Some(script_type) => self.for_script_type(script_type),
            None => self.p2pkh.max(self.p2sh_p2wpkh).max(self.p2wpkh),
        }
    }
}

// ==============================================================================
// Engine Config
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub dust_limits: DustLimits,
    /// Fee rate in sat/vB used when a request does not name one.
    pub default_fee_rate: u64,
    /// Display label for BTC-denominated values.
    pub unit: String,
    pub max_weight: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dust_limits: DustLimits::default(),
            default_fee_rate: 1,
            unit: "BTC".into(),
            max_weight: MAX_STANDARD_TX_WEIGHT,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn dust_limit(&self, script_type: ScriptType) -> u64 {
        self.dust_limits.for_script_type(script_type)
    }
}
