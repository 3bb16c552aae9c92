//! # hdwallet-core
//!
//! Address and balance coordination for a single hierarchical-deterministic
//! account.
//!
//! An account owns three derivation branches sharing one root key: an external
//! branch for receiving, an internal branch for change, and a branch for the
//! secondary (staking) ledger. [`HdWalletCoordinator`] initializes and
//! refreshes them concurrently, folds their flags into account-level readiness
//! and activity, merges the spend branches' unspent outputs, and answers
//! address and index queries for either ledger context.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hdwallet_core::{init, CoreConfig, HdWalletCoordinator, LedgerContext, StaticUtxoProvider};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CoreConfig::default();
//!     init(&config)?;
//!
//!     let root = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8".parse()?;
//!     let provider = Arc::new(StaticUtxoProvider::new());
//!     let coordinator = HdWalletCoordinator::new(root, true, provider, &config)?;
//!
//!     coordinator.wait_until_ready().await?;
//!     println!("receive at {}", coordinator.current_receiving_address()?);
//!     println!("stake rewards to {}", coordinator.change_address(LedgerContext::Secondary)?);
//!
//!     coordinator.refresh_unspent_outputs().settled().await;
//!     println!("balance {}", coordinator.unspent_outputs().total_value());
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: the account coordinator and its state snapshot
//! - [`branch`]: the derivation branch contract and the BIP32 implementation
//! - [`provider`]: where branches learn address usage and unspent outputs
//! - [`transaction_builder`]: unsigned transaction assembly
//! - [`notifications`]: coordinator events
//! - [`primitives`]: BIP32 keys and address encoding
//! - [`utils`]: configuration and logging

pub mod branch;
pub mod coordinator;
pub mod error;
pub mod notifications;
pub mod primitives;
pub mod provider;
pub mod transaction_builder;
pub mod types;
pub mod utils;
pub mod utxo;

pub use branch::{DerivationBranch, HdBranch};
pub use coordinator::{Activity, BranchOutcomes, BranchTasks, CoordinatorState, HdWalletCoordinator, Readiness};
pub use error::{HdError, Result};
pub use notifications::{CoordinatorEvent, EventFilter, EventSubscription};
pub use primitives::address::Network;
pub use primitives::bip32::{AccountKey, DerivationPath};
pub use provider::{StaticUtxoProvider, UtxoProvider};
pub use transaction_builder::{BuildError, Order, SimpleAssembler, TransactionAssembler, UnsignedTransaction};
pub use types::{BranchKind, CoreConfig, LedgerContext};
pub use utxo::{OutPoint, Utxo, UtxoSet};

/// Initializes logging and checks `config`. Call once per process.
///
/// Safe to call again; a logger installed earlier, by this crate or the host
/// application, is left in place.
pub fn init(config: &CoreConfig) -> Result<()> {
    if !utils::logging::init_logging(config.log_level) {
        log::debug!("Logger already installed, keeping it");
    }

    config.validate()?;
    log::info!("hdwallet-core initialized with config: {:?}", config);
    Ok(())
}
