use crate::transaction_builder::BuildError;
use crate::types::BranchKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HdError {
    #[error("Branch {branch} failed to initialize: {reason}")]
    Initialization { branch: BranchKind, reason: String },

    #[error("Branch {branch} failed to fetch unspent outputs: {reason}")]
    Fetch { branch: BranchKind, reason: String },

    #[error("Transaction build failed: {0}")]
    TransactionBuild(#[from] BuildError),

    #[error("Key derivation failed: {0}")]
    Derivation(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hex decoding error: {0}")]
    Hex(#[from] hex::FromHexError),
}

impl HdError {
    /// Wrap any branch-local failure as an initialization error for `branch`.
    pub fn initialization(branch: BranchKind, err: impl std::fmt::Display) -> Self {
        HdError::Initialization { branch, reason: err.to_string() }
    }

    /// Wrap any branch-local failure as a fetch error for `branch`.
    pub fn fetch(branch: BranchKind, err: impl std::fmt::Display) -> Self {
        HdError::Fetch { branch, reason: err.to_string() }
    }

    pub fn is_branch_local(&self) -> bool {
        matches!(self, HdError::Initialization { .. } | HdError::Fetch { .. })
    }
}

pub type Result<T> = std::result::Result<T, HdError>;
