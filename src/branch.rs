//! Derivation branches: one deterministic address sequence each.
//!
//! A branch owns its derived-address cache, its current index and its own
//! unspent outputs. The coordinator only ever reads these through the
//! [`DerivationBranch`] trait, so alternative branch implementations (a
//! hardware signer round-trip, a scripted branch in tests) plug in the same way.

use crate::primitives::address::{Address, Network};
use crate::primitives::bip32::{AccountKey, DerivationPath, ExtendedPublicKey};
use crate::provider::UtxoProvider;
use crate::types::BranchKind;
use crate::utils::logging::OperationTimer;
use crate::utils::{read_lock, write_lock};
use crate::utxo::UtxoSet;
use crate::{HdError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

#[async_trait]
pub trait DerivationBranch: Send + Sync {
    fn kind(&self) -> BranchKind;

    /// Path prefix of the branch, e.g. `m/1`
    fn path_label(&self) -> String;

    fn is_initialized(&self) -> bool;

    fn is_fetching(&self) -> bool;

    /// First unused derivation position.
    fn current_index(&self) -> u32;

    /// Address at [`current_index`](Self::current_index).
    fn current_address(&self) -> Result<String>;

    /// Addresses in derivation order.
    ///
    /// `None` returns the cache, which covers indices `0..=current_index`.
    /// `Some(n)` returns exactly the addresses at indices `0..n`.
    fn derived_addresses(&self, upto: Option<u32>) -> Result<Vec<String>>;

    fn address_at_index(&self, index: u32) -> Result<String>;

    fn utxo_set(&self) -> UtxoSet;

    /// Drop all network-specific state and re-key addresses for `network`.
    /// Operations already in flight keep running but their results are discarded.
    fn invalidate(&self, network: Network);

    async fn initialize(&self) -> Result<()>;

    /// Refresh the current index and this branch's unspent outputs.
    async fn fetch(&self) -> Result<UtxoSet>;

    async fn on_ledger_context_change(&self, network: Network) -> Result<()> {
        self.invalidate(network);
        self.initialize().await
    }
}

#[derive(Debug)]
struct BranchState {
    network: Network,
    generation: u64,
    initialized: bool,
    current_index: u32,
    addresses: Vec<String>,
    utxos: UtxoSet,
}

/// Decrements the in-flight fetch counter however the fetch ends.
struct FetchGuard<'a>(&'a AtomicUsize);

impl<'a> FetchGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        FetchGuard(counter)
    }
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Result of a gap-limit scan.
struct Discovery {
    current_index: u32,
    addresses: Vec<String>,
}

/// BIP32 public-derivation branch backed by a [`UtxoProvider`].
pub struct HdBranch {
    kind: BranchKind,
    prefix: DerivationPath,
    chain: ExtendedPublicKey,
    provider: Arc<dyn UtxoProvider>,
    gap_limit: u32,
    state: RwLock<BranchState>,
    fetches_in_flight: AtomicUsize,
}

impl HdBranch {
    /// Derive the branch chain key below `root`.
    ///
    /// Fails for hardened prefixes under a watch-only root.
    pub fn new(
        kind: BranchKind,
        root: &AccountKey,
        prefix: DerivationPath,
        provider: Arc<dyn UtxoProvider>,
        network: Network,
        gap_limit: u32,
    ) -> Result<Self> {
        let chain = root
            .derive_public(&prefix)
            .map_err(|e| HdError::initialization(kind, e))?;

        Ok(Self {
            kind,
            prefix,
            chain,
            provider,
            gap_limit: gap_limit.max(1),
            state: RwLock::new(BranchState {
                network,
                generation: 0,
                initialized: false,
                current_index: 0,
                addresses: Vec::new(),
                utxos: UtxoSet::new(),
            }),
            fetches_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn network(&self) -> Network {
        read_lock(&self.state).network
    }

    fn derive_address(&self, network: Network, index: u32) -> Result<String> {
        let child = self.chain.derive_child(index)?;
        Address::from_public_key(&child.public_key, network, self.kind.context()).encode()
    }

    fn snapshot(&self) -> (Network, u64) {
        let state = read_lock(&self.state);
        (state.network, state.generation)
    }

    /// Scan windows of `gap_limit` addresses until a whole window after the
    /// last used address comes back unused.
    async fn discover(&self, network: Network) -> Result<Discovery> {
        let context = self.kind.context();
        let mut addresses: Vec<String> = Vec::new();
        let mut next_unused = 0u32;

        loop {
            let start = addresses.len() as u32;
            let window = (start..start + self.gap_limit)
                .map(|index| self.derive_address(network, index))
                .collect::<Result<Vec<_>>>()?;

            let used = self.provider.used_addresses(context, &window).await?;
            if let Some(last) = window.iter().rposition(|address| used.contains(address)) {
                next_unused = start + last as u32 + 1;
            }
            addresses.extend(window);

            if addresses.len() as u32 - next_unused >= self.gap_limit {
                break;
            }
        }

        addresses.truncate(next_unused as usize + 1);
        Ok(Discovery {
            current_index: next_unused,
            addresses,
        })
    }

    /// Apply `discovery` if no invalidation happened since `generation` was read.
    fn apply(&self, generation: u64, discovery: Discovery, utxos: Option<UtxoSet>, mark_initialized: bool) -> bool {
        let mut state = write_lock(&self.state);
        if state.generation != generation {
            log::debug!(
                "Discarding stale {} result (generation {} != {})",
                self.kind,
                generation,
                state.generation
            );
            return false;
        }
        state.current_index = discovery.current_index;
        state.addresses = discovery.addresses;
        if let Some(utxos) = utxos {
            state.utxos = utxos;
        }
        if mark_initialized {
            state.initialized = true;
        }
        true
    }
}

#[async_trait]
impl DerivationBranch for HdBranch {
    fn kind(&self) -> BranchKind {
        self.kind
    }

    fn path_label(&self) -> String {
        self.prefix.to_string()
    }

    fn is_initialized(&self) -> bool {
        read_lock(&self.state).initialized
    }

    fn is_fetching(&self) -> bool {
        self.fetches_in_flight.load(Ordering::SeqCst) > 0
    }

    fn current_index(&self) -> u32 {
        read_lock(&self.state).current_index
    }

    fn current_address(&self) -> Result<String> {
        let (network, index) = {
            let state = read_lock(&self.state);
            if let Some(address) = state.addresses.get(state.current_index as usize) {
                return Ok(address.clone());
            }
            (state.network, state.current_index)
        };
        self.derive_address(network, index)
    }

    fn derived_addresses(&self, upto: Option<u32>) -> Result<Vec<String>> {
        let state = read_lock(&self.state);
        let Some(upto) = upto else {
            return Ok(state.addresses.clone());
        };

        let upto = upto as usize;
        let mut addresses: Vec<String> = state.addresses.iter().take(upto).cloned().collect();
        for index in addresses.len()..upto {
            addresses.push(self.derive_address(state.network, index as u32)?);
        }
        Ok(addresses)
    }

    fn address_at_index(&self, index: u32) -> Result<String> {
        let network = {
            let state = read_lock(&self.state);
            if let Some(address) = state.addresses.get(index as usize) {
                return Ok(address.clone());
            }
            state.network
        };
        self.derive_address(network, index)
    }

    fn utxo_set(&self) -> UtxoSet {
        read_lock(&self.state).utxos.clone()
    }

    fn invalidate(&self, network: Network) {
        let mut state = write_lock(&self.state);
        state.generation += 1;
        state.network = network;
        state.initialized = false;
        state.current_index = 0;
        state.addresses.clear();
        state.utxos = UtxoSet::new();
        log::debug!("{} branch invalidated for {}", self.kind, network);
    }

    async fn initialize(&self) -> Result<()> {
        let _timer = OperationTimer::start(format!("{} initialization", self.kind));
        let (network, generation) = self.snapshot();

        let discovery = self
            .discover(network)
            .await
            .map_err(|e| HdError::initialization(self.kind, e))?;
        let index = discovery.current_index;

        if self.apply(generation, discovery, None, true) {
            log::info!("{} branch initialized at index {} on {}", self.kind, index, network);
        }
        Ok(())
    }

    async fn fetch(&self) -> Result<UtxoSet> {
        let _guard = FetchGuard::enter(&self.fetches_in_flight);
        let _timer = OperationTimer::start(format!("{} fetch", self.kind));
        let (network, generation) = self.snapshot();

        let discovery = self
            .discover(network)
            .await
            .map_err(|e| HdError::fetch(self.kind, e))?;
        let utxos: UtxoSet = self
            .provider
            .fetch_unspent(self.kind.context(), &discovery.addresses)
            .await
            .map_err(|e| HdError::fetch(self.kind, e))?
            .into();

        log::debug!("{} branch fetched {} unspent outputs", self.kind, utxos.len());
        self.apply(generation, discovery, Some(utxos.clone()), false);
        Ok(utxos)
    }
}
