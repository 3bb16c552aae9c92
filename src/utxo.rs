//! Unspent outputs and the keyed set used for per-branch and merged balances.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of an output: originating transaction and position within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: String,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: impl Into<String>, vout: u32) -> Self {
        Self { txid: txid.into(), vout }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// A spendable output owned by one of the account's addresses.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Utxo {
    pub outpoint: OutPoint,
    /// Value in base units
    pub value: u64,
    /// Address that controls this output
    pub address: String,
    /// Block height the output confirmed at, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_height: Option<u32>,
}

impl Utxo {
    pub fn new(outpoint: OutPoint, value: u64, address: impl Into<String>) -> Self {
        Self {
            outpoint,
            value,
            address: address.into(),
            block_height: None,
        }
    }
}

/// Outputs keyed by outpoint.
///
/// Two entries with the same outpoint describe the same output; if they ever
/// disagree the greater entry wins, which keeps `merge` commutative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Utxo>", into = "Vec<Utxo>")]
pub struct UtxoSet {
    outputs: BTreeMap<OutPoint, Utxo>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, utxo: Utxo) {
        match self.outputs.get(&utxo.outpoint) {
            Some(existing) if *existing >= utxo => {}
            _ => {
                self.outputs.insert(utxo.outpoint.clone(), utxo);
            }
        }
    }

    pub fn remove(&mut self, outpoint: &OutPoint) -> Option<Utxo> {
        self.outputs.remove(outpoint)
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&Utxo> {
        self.outputs.get(outpoint)
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.outputs.contains_key(outpoint)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Outputs in outpoint order
    pub fn iter(&self) -> impl Iterator<Item = &Utxo> {
        self.outputs.values()
    }

    /// Sum of all output values, saturating at `u64::MAX`.
    pub fn total_value(&self) -> u64 {
        self.outputs.values().fold(0u64, |total, u| total.saturating_add(u.value))
    }

    /// Set union of `self` and `other`.
    pub fn merge(&self, other: &UtxoSet) -> UtxoSet {
        let mut merged = self.clone();
        merged.extend(other.iter().cloned());
        merged
    }
}

impl Extend<Utxo> for UtxoSet {
    fn extend<I: IntoIterator<Item = Utxo>>(&mut self, iter: I) {
        for utxo in iter {
            self.insert(utxo);
        }
    }
}

impl FromIterator<Utxo> for UtxoSet {
    fn from_iter<I: IntoIterator<Item = Utxo>>(iter: I) -> Self {
        let mut set = UtxoSet::new();
        set.extend(iter);
        set
    }
}

impl From<Vec<Utxo>> for UtxoSet {
    fn from(outputs: Vec<Utxo>) -> Self {
        outputs.into_iter().collect()
    }
}

impl From<UtxoSet> for Vec<Utxo> {
    fn from(set: UtxoSet) -> Self {
        set.outputs.into_values().collect()
    }
}
