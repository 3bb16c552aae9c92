//! Network-facing data source for the derivation branches.

use crate::types::LedgerContext;
use crate::utils::{read_lock, write_lock};
use crate::utxo::{OutPoint, Utxo};
use crate::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Answers the two questions a branch asks of the network: which of these
/// addresses have history, and what do they currently hold.
#[async_trait]
pub trait UtxoProvider: Send + Sync {
    /// Subset of `addresses` that have appeared in any transaction.
    async fn used_addresses(&self, context: LedgerContext, addresses: &[String]) -> Result<HashSet<String>>;

    /// Unspent outputs controlled by any of `addresses`.
    async fn fetch_unspent(&self, context: LedgerContext, addresses: &[String]) -> Result<Vec<Utxo>>;
}

#[derive(Debug, Default)]
struct ContextLedger {
    used: HashSet<String>,
    unspent: HashMap<OutPoint, Utxo>,
}

/// In-memory provider for offline and regtest use.
///
/// Adding an output marks its address as used, matching what a chain indexer
/// would report.
#[derive(Debug, Default)]
pub struct StaticUtxoProvider {
    ledgers: RwLock<HashMap<LedgerContext, ContextLedger>>,
}

impl StaticUtxoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_used(&self, context: LedgerContext, address: impl Into<String>) {
        let mut ledgers = write_lock(&self.ledgers);
        ledgers.entry(context).or_default().used.insert(address.into());
    }

    pub fn add_utxo(&self, context: LedgerContext, utxo: Utxo) {
        let mut ledgers = write_lock(&self.ledgers);
        let ledger = ledgers.entry(context).or_default();
        ledger.used.insert(utxo.address.clone());
        ledger.unspent.insert(utxo.outpoint.clone(), utxo);
    }

    /// Mark an output spent. Its address stays used.
    pub fn spend(&self, context: LedgerContext, outpoint: &OutPoint) -> Option<Utxo> {
        let mut ledgers = write_lock(&self.ledgers);
        ledgers.get_mut(&context).and_then(|l| l.unspent.remove(outpoint))
    }

    pub fn clear(&self) {
        write_lock(&self.ledgers).clear();
    }
}

#[async_trait]
impl UtxoProvider for StaticUtxoProvider {
    async fn used_addresses(&self, context: LedgerContext, addresses: &[String]) -> Result<HashSet<String>> {
        let ledgers = read_lock(&self.ledgers);
        let Some(ledger) = ledgers.get(&context) else {
            return Ok(HashSet::new());
        };
        Ok(addresses.iter().filter(|a| ledger.used.contains(*a)).cloned().collect())
    }

    async fn fetch_unspent(&self, context: LedgerContext, addresses: &[String]) -> Result<Vec<Utxo>> {
        let ledgers = read_lock(&self.ledgers);
        let Some(ledger) = ledgers.get(&context) else {
            return Ok(Vec::new());
        };
        let wanted: HashSet<&String> = addresses.iter().collect();
        Ok(ledger
            .unspent
            .values()
            .filter(|u| wanted.contains(&u.address))
            .cloned()
            .collect())
    }
}
