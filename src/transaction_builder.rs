//! Unsigned transaction assembly over the account's merged outputs.

use crate::primitives::address::{Address, Network};
use crate::types::{CoreConfig, LedgerContext};
use crate::utils::{read_lock, write_lock};
use crate::utxo::{OutPoint, Utxo, UtxoSet};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::RwLock;
use thiserror::Error;

/// Errors raised while turning orders into an unsigned transaction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Invalid destination address: {0}")]
    InvalidDestination(String),

    #[error("Output {0} is not in the account's unspent outputs")]
    UnknownOutput(OutPoint),

    #[error("Output {0} is not controlled by this account")]
    ForeignOutput(OutPoint),

    #[error("No orders given")]
    NoOrders,

    #[error("Payment amount must be greater than zero")]
    ZeroAmount,

    #[error("Memo is {len} bytes, at most {max} allowed")]
    MemoTooLarge { len: usize, max: usize },

    #[error("Amounts exceed the representable total")]
    AmountOverflow,
}

/// Sum of `values`, or [`BuildError::AmountOverflow`] if it does not fit in a `u64`.
fn checked_total(values: impl IntoIterator<Item = u64>) -> std::result::Result<u64, BuildError> {
    values
        .into_iter()
        .try_fold(0u64, |total, value| total.checked_add(value).ok_or(BuildError::AmountOverflow))
}

/// A single request folded into the transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    /// Send `amount` base units to the destination.
    Payment { amount: u64 },
    /// Move this exact output to the destination.
    SpendOutput(OutPoint),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: String,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    pub network: Network,
    pub inputs: Vec<Utxo>,
    pub outputs: Vec<TxOutput>,
    pub fee: u64,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "memo_hex")]
    pub memo: Option<Vec<u8>>,
}

impl UnsignedTransaction {
    pub fn input_value(&self) -> u64 {
        self.inputs.iter().map(|u| u.value).sum()
    }

    pub fn output_value(&self) -> u64 {
        self.outputs.iter().map(|o| o.amount).sum()
    }
}

mod memo_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(memo: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match memo {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Builds unsigned transactions from coordinator-gathered inputs.
///
/// Implementations own every feasibility check; callers pass their failures
/// through untouched.
#[async_trait]
pub trait TransactionAssembler: Send + Sync {
    async fn build(
        &self,
        orders: &[Order],
        destination: &str,
        ownership_addresses: &[String],
        unspent_outputs: &UtxoSet,
        change_address: &str,
        memo: Option<&[u8]>,
    ) -> Result<UnsignedTransaction>;

    /// Called when the account moves to another network.
    fn on_network_change(&self, _network: Network) {}
}

/// Coin selection strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CoinSelectionStrategy {
    /// Largest first - fewest inputs
    #[default]
    LargestFirst,
    /// Smallest first - consolidates small outputs
    SmallestFirst,
}

/// Flat-fee assembler for primary-ledger transfers.
#[derive(Debug)]
pub struct SimpleAssembler {
    network: RwLock<Network>,
    pub fee: u64,
    pub dust_limit: u64,
    pub max_memo_len: usize,
    pub selection: CoinSelectionStrategy,
}

impl SimpleAssembler {
    pub const DEFAULT_MAX_MEMO_LEN: usize = 256;

    pub fn new(network: Network) -> Self {
        Self::from_config(&CoreConfig {
            network,
            ..CoreConfig::default()
        })
    }

    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            network: RwLock::new(config.network),
            fee: config.fee,
            dust_limit: config.dust_limit,
            max_memo_len: Self::DEFAULT_MAX_MEMO_LEN,
            selection: CoinSelectionStrategy::default(),
        }
    }

    pub fn network(&self) -> Network {
        *read_lock(&self.network)
    }

    fn select_coins(&self, candidates: Vec<&Utxo>, target_amount: u64) -> Vec<Utxo> {
        let mut sorted_utxos = candidates;
        match self.selection {
            CoinSelectionStrategy::LargestFirst => sorted_utxos.sort_by(|a, b| b.value.cmp(&a.value)),
            CoinSelectionStrategy::SmallestFirst => sorted_utxos.sort_by(|a, b| a.value.cmp(&b.value)),
        }

        let mut selected = Vec::new();
        let mut total = 0u64;
        for utxo in sorted_utxos {
            if total >= target_amount {
                break;
            }
            total = total.saturating_add(utxo.value);
            selected.push(utxo.clone());
        }
        selected
    }
}

#[async_trait]
impl TransactionAssembler for SimpleAssembler {
    async fn build(
        &self,
        orders: &[Order],
        destination: &str,
        ownership_addresses: &[String],
        unspent_outputs: &UtxoSet,
        change_address: &str,
        memo: Option<&[u8]>,
    ) -> Result<UnsignedTransaction> {
        if orders.is_empty() {
            return Err(BuildError::NoOrders.into());
        }
        if let Some(memo) = memo {
            if memo.len() > self.max_memo_len {
                return Err(BuildError::MemoTooLarge {
                    len: memo.len(),
                    max: self.max_memo_len,
                }
                .into());
            }
        }
        let network = self.network();
        Address::parse(destination, network, LedgerContext::Primary)
            .map_err(|_| BuildError::InvalidDestination(destination.to_string()))?;

        let owned: HashSet<&str> = ownership_addresses.iter().map(String::as_str).collect();
        let mut payment_total = 0u64;
        let mut inputs: Vec<Utxo> = Vec::new();

        for order in orders {
            match order {
                Order::Payment { amount: 0 } => return Err(BuildError::ZeroAmount.into()),
                Order::Payment { amount } => {
                    payment_total = payment_total
                        .checked_add(*amount)
                        .ok_or(BuildError::AmountOverflow)?
                }
                Order::SpendOutput(outpoint) => {
                    let utxo = unspent_outputs
                        .get(outpoint)
                        .ok_or_else(|| BuildError::UnknownOutput(outpoint.clone()))?;
                    if !owned.contains(utxo.address.as_str()) {
                        return Err(BuildError::ForeignOutput(outpoint.clone()).into());
                    }
                    if !inputs.iter().any(|i| i.outpoint == utxo.outpoint) {
                        inputs.push(utxo.clone());
                    }
                }
            }
        }

        let explicit_total = checked_total(inputs.iter().map(|u| u.value))?;
        let send_amount = payment_total
            .checked_add(explicit_total)
            .ok_or(BuildError::AmountOverflow)?;
        let required = send_amount.checked_add(self.fee).ok_or(BuildError::AmountOverflow)?;

        let explicit: HashSet<&OutPoint> = inputs.iter().map(|u| &u.outpoint).collect();
        let candidates: Vec<&Utxo> = unspent_outputs
            .iter()
            .filter(|u| !explicit.contains(&u.outpoint) && owned.contains(u.address.as_str()))
            .collect();
        let spendable = candidates
            .iter()
            .fold(explicit_total, |total, u| total.saturating_add(u.value));

        let selected = self.select_coins(candidates, required.saturating_sub(explicit_total));
        inputs.extend(selected);
        let input_total = checked_total(inputs.iter().map(|u| u.value))?;
        if input_total < required {
            return Err(BuildError::InsufficientFunds {
                required,
                available: spendable,
            }
            .into());
        }

        let mut fee = self.fee;
        let mut outputs = vec![TxOutput {
            address: destination.to_string(),
            amount: send_amount,
        }];
        let change = input_total - required;
        if change >= self.dust_limit && change > 0 {
            outputs.push(TxOutput {
                address: change_address.to_string(),
                amount: change,
            });
        } else {
            fee += change;
        }

        log::debug!(
            "Assembled transaction: {} inputs, {} outputs, fee {}",
            inputs.len(),
            outputs.len(),
            fee
        );

        Ok(UnsignedTransaction {
            network,
            inputs,
            outputs,
            fee,
            memo: memo.map(<[u8]>::to_vec),
        })
    }

    fn on_network_change(&self, network: Network) {
        *write_lock(&self.network) = network;
    }
}
