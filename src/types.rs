use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::primitives::address::Network;
use crate::primitives::bip32::DerivationPath;
use crate::{HdError, Result};

// Re-export logging types
pub use crate::utils::logging::LogLevel;

/// Logical ledger an address or output belongs to.
///
/// Both contexts share the account root key but use distinct derivation
/// branches and address encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerContext {
    /// The transfer ledger. Used whenever a context is not specified.
    #[default]
    Primary,
    /// The staking/administrative ledger.
    Secondary,
}

impl fmt::Display for LedgerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerContext::Primary => write!(f, "primary"),
            LedgerContext::Secondary => write!(f, "secondary"),
        }
    }
}

/// The three derivation branches owned by an account coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchKind {
    /// Receiving addresses on the primary ledger
    External,
    /// Change addresses on the primary ledger
    Internal,
    /// Addresses on the secondary ledger
    SecondLedger,
}

impl BranchKind {
    pub const ALL: [BranchKind; 3] = [BranchKind::External, BranchKind::Internal, BranchKind::SecondLedger];

    /// Ledger context the branch's addresses are encoded for
    pub fn context(&self) -> LedgerContext {
        match self {
            BranchKind::External | BranchKind::Internal => LedgerContext::Primary,
            BranchKind::SecondLedger => LedgerContext::Secondary,
        }
    }

    /// Whether this branch's outputs feed the merged primary-ledger balance
    pub fn is_spend_branch(&self) -> bool {
        self.context() == LedgerContext::Primary
    }
}

impl fmt::Display for BranchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchKind::External => write!(f, "external"),
            BranchKind::Internal => write!(f, "internal"),
            BranchKind::SecondLedger => write!(f, "second_ledger"),
        }
    }
}

/// Main configuration for an account coordinator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CoreConfig {
    /// Network the account starts on
    pub network: Network,
    /// Number of consecutive unused addresses that ends index discovery
    pub gap_limit: u32,
    /// Path of the receiving branch, relative to the account key
    pub external_path: String,
    /// Path of the change branch, relative to the account key
    pub internal_path: String,
    /// Path of the secondary-ledger branch, relative to the account key
    pub second_ledger_path: String,
    /// Flat fee charged by the built-in assembler
    pub fee: u64,
    /// Change below this value is folded into the fee
    pub dust_limit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<LogLevel>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            gap_limit: 20,
            external_path: "m/0".to_string(),
            internal_path: "m/1".to_string(),
            second_ledger_path: "m/0".to_string(),
            fee: 1_000,
            dust_limit: 546,
            log_level: None,
        }
    }
}

impl CoreConfig {
    /// Branch path prefix for `kind`, parsed.
    pub fn branch_path(&self, kind: BranchKind) -> Result<DerivationPath> {
        let raw = match kind {
            BranchKind::External => &self.external_path,
            BranchKind::Internal => &self.internal_path,
            BranchKind::SecondLedger => &self.second_ledger_path,
        };
        DerivationPath::from_str(raw)
            .map_err(|e| HdError::Config(format!("{} path '{}': {}", kind, raw, e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.gap_limit == 0 {
            return Err(HdError::Config("gap_limit must be at least 1".to_string()));
        }

        let mut identities = Vec::with_capacity(3);
        for kind in BranchKind::ALL {
            let identity = (self.branch_path(kind)?, kind.context());
            if identities.contains(&identity) {
                return Err(HdError::Config(format!(
                    "{} branch duplicates another branch's path and ledger context",
                    kind
                )));
            }
            identities.push(identity);
        }

        Ok(())
    }
}
