//! Account coordinator over the external, internal and second-ledger branches.
//!
//! Branch operations run as independent tokio tasks. Whenever one settles the
//! coordinator recomputes its aggregate state from the live branch flags and
//! publishes the result on a `watch` channel as one versioned
//! [`CoordinatorState`]. Every update goes through a single `send_modify`, so a
//! reader never sees a flag change without the merged outputs that go with it.
//!
//! A refresh counts as fetching from the moment it is launched: the
//! coordinator records one unsettled fetch per branch before spawning and
//! releases it in the same update that merges that branch's outputs.
//!
//! A ledger context change bumps the epoch. Operations remember the epoch they
//! were launched in; when a superseded one settles it still refreshes the
//! flags, but its outputs are never merged.

use crate::branch::{DerivationBranch, HdBranch};
use crate::notifications::{CoordinatorEvent, EventFilter, EventSubscription};
use crate::primitives::address::Network;
use crate::primitives::bip32::AccountKey;
use crate::provider::UtxoProvider;
use crate::transaction_builder::{Order, SimpleAssembler, TransactionAssembler, UnsignedTransaction};
use crate::types::{BranchKind, CoreConfig, LedgerContext};
use crate::utxo::UtxoSet;
use crate::{HdError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinError, JoinHandle};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Uninitialized,
    Initializing,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Idle,
    Fetching,
}

/// Aggregate account state, replaced as a whole on every branch event.
#[derive(Debug, Clone)]
pub struct CoordinatorState {
    /// Incremented on every update
    pub version: u64,
    /// Incremented on every ledger context change
    pub epoch: u64,
    pub network: Network,
    pub readiness: Readiness,
    pub activity: Activity,
    /// Merged outputs of the external and internal branches
    pub unspent: Arc<UtxoSet>,
    /// Launched fetches not yet settled, per branch slot
    unsettled_fetches: [u32; 3],
}

fn slot(kind: BranchKind) -> usize {
    match kind {
        BranchKind::External => 0,
        BranchKind::Internal => 1,
        BranchKind::SecondLedger => 2,
    }
}

impl CoordinatorState {
    fn new(network: Network) -> Self {
        Self {
            version: 0,
            epoch: 0,
            network,
            readiness: Readiness::Uninitialized,
            activity: Activity::Idle,
            unspent: Arc::new(UtxoSet::new()),
            unsettled_fetches: [0; 3],
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.readiness == Readiness::Ready
    }

    pub fn is_fetching(&self) -> bool {
        self.activity == Activity::Fetching
    }
}

/// One join handle per branch operation.
///
/// Dropping this detaches the tasks; they still run and still update the
/// coordinator when they finish.
#[derive(Debug)]
pub struct BranchTasks<T> {
    pub external: JoinHandle<Result<T>>,
    pub internal: JoinHandle<Result<T>>,
    pub second_ledger: JoinHandle<Result<T>>,
}

impl<T> BranchTasks<T> {
    /// Wait for all three operations, whatever their outcome.
    pub async fn settled(self) -> BranchOutcomes<T> {
        let (external, internal, second_ledger) = tokio::join!(self.external, self.internal, self.second_ledger);
        BranchOutcomes {
            external: flatten(external),
            internal: flatten(internal),
            second_ledger: flatten(second_ledger),
        }
    }
}

fn flatten<T>(joined: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    joined.map_err(|e| HdError::Task(e.to_string()))?
}

#[derive(Debug)]
pub struct BranchOutcomes<T> {
    pub external: Result<T>,
    pub internal: Result<T>,
    pub second_ledger: Result<T>,
}

impl<T> BranchOutcomes<T> {
    pub fn get(&self, kind: BranchKind) -> &Result<T> {
        match kind {
            BranchKind::External => &self.external,
            BranchKind::Internal => &self.internal,
            BranchKind::SecondLedger => &self.second_ledger,
        }
    }

    pub fn failures(&self) -> Vec<(BranchKind, &HdError)> {
        BranchKind::ALL
            .into_iter()
            .filter_map(|kind| self.get(kind).as_ref().err().map(|e| (kind, e)))
            .collect()
    }

    /// All three values, or the first failure in branch order.
    pub fn into_result(self) -> Result<(T, T, T)> {
        Ok((self.external?, self.internal?, self.second_ledger?))
    }
}

struct Inner {
    external: Arc<dyn DerivationBranch>,
    internal: Arc<dyn DerivationBranch>,
    second_ledger: Arc<dyn DerivationBranch>,
    assembler: Arc<dyn TransactionAssembler>,
    state: watch::Sender<CoordinatorState>,
    events: broadcast::Sender<CoordinatorEvent>,
    runtime: Handle,
    watch_only: bool,
}

impl Inner {
    fn branch(&self, kind: BranchKind) -> &Arc<dyn DerivationBranch> {
        match kind {
            BranchKind::External => &self.external,
            BranchKind::Internal => &self.internal,
            BranchKind::SecondLedger => &self.second_ledger,
        }
    }

    fn branches(&self) -> [&Arc<dyn DerivationBranch>; 3] {
        [&self.external, &self.internal, &self.second_ledger]
    }

    /// Readiness and activity as pure functions of the branch flags.
    ///
    /// A branch reports fetching while its own flag is raised or while a fetch
    /// launched for it has not settled yet.
    fn recompute(&self, state: &mut CoordinatorState) {
        let initialized = self.branches().iter().all(|b| b.is_initialized());
        let fetching = BranchKind::ALL
            .into_iter()
            .any(|kind| self.branch(kind).is_fetching() || state.unsettled_fetches[slot(kind)] > 0);

        state.readiness = if initialized {
            Readiness::Ready
        } else {
            Readiness::Initializing
        };
        state.activity = if fetching { Activity::Fetching } else { Activity::Idle };
        state.version += 1;
    }

    fn publish_flags(&self) {
        self.state.send_modify(|state| self.recompute(state));
    }

    fn emit(&self, event: CoordinatorEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn settle_initialize(&self, kind: BranchKind, epoch: u64, result: &Result<()>) {
        let mut current_epoch = epoch;
        self.state.send_modify(|state| {
            self.recompute(state);
            current_epoch = state.epoch;
        });
        match result {
            Ok(()) if epoch != current_epoch => {
                log::debug!("{} branch initialization from superseded epoch {} settled", kind, epoch);
            }
            Ok(()) => {
                log::debug!("{} branch initialization settled (epoch {})", kind, epoch);
                self.emit(CoordinatorEvent::BranchInitialized { branch: kind, epoch });
            }
            Err(e) => {
                log::warn!("{} branch initialization failed: {}", kind, e);
                self.emit(CoordinatorEvent::BranchFailed {
                    branch: kind,
                    epoch,
                    error: e.to_string(),
                });
            }
        }
    }

    /// Release one unsettled fetch of `kind` without a result.
    fn release_fetch(&self, kind: BranchKind) {
        self.state.send_modify(|state| {
            state.unsettled_fetches[slot(kind)] = state.unsettled_fetches[slot(kind)].saturating_sub(1);
            self.recompute(state);
        });
    }

    fn settle_fetch(&self, kind: BranchKind, epoch: u64, result: &Result<UtxoSet>) {
        self.state.send_modify(|state| {
            state.unsettled_fetches[slot(kind)] = state.unsettled_fetches[slot(kind)].saturating_sub(1);
            self.recompute(state);
            if result.is_ok() && kind.is_spend_branch() {
                if epoch == state.epoch {
                    state.unspent = Arc::new(self.external.utxo_set().merge(&self.internal.utxo_set()));
                } else {
                    log::debug!("Ignoring {} outputs from superseded epoch {}", kind, epoch);
                }
            }
        });

        match result {
            Ok(utxos) => self.emit(CoordinatorEvent::BranchFetched {
                branch: kind,
                epoch,
                outputs: utxos.len(),
            }),
            Err(e) => {
                log::warn!("{} branch fetch failed: {}", kind, e);
                self.emit(CoordinatorEvent::BranchFailed {
                    branch: kind,
                    epoch,
                    error: e.to_string(),
                });
            }
        }
    }
}

/// Releases the unsettled fetch if its task ends without settling it.
struct PendingFetch {
    inner: Arc<Inner>,
    kind: BranchKind,
    settled: bool,
}

impl Drop for PendingFetch {
    fn drop(&mut self) {
        if !self.settled {
            log::warn!("{} branch fetch ended without settling", self.kind);
            self.inner.release_fetch(self.kind);
        }
    }
}

/// Coordinates one account's three derivation branches.
///
/// Cloning is cheap and every clone observes the same state.
#[derive(Clone)]
pub struct HdWalletCoordinator {
    inner: Arc<Inner>,
}

impl HdWalletCoordinator {
    /// Create the branches for `root` and schedule their initialization.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        root: AccountKey,
        is_watch_only: bool,
        provider: Arc<dyn UtxoProvider>,
        config: &CoreConfig,
    ) -> Result<Self> {
        Self::start(root, is_watch_only, provider, config).map(|(coordinator, _)| coordinator)
    }

    /// Like [`new`](Self::new), also returning the initialization tasks.
    pub fn start(
        root: AccountKey,
        is_watch_only: bool,
        provider: Arc<dyn UtxoProvider>,
        config: &CoreConfig,
    ) -> Result<(Self, BranchTasks<()>)> {
        config.validate()?;
        let root = if is_watch_only { root.into_watch_only() } else { root };

        let make_branch = |kind: BranchKind| -> Result<Arc<dyn DerivationBranch>> {
            let branch = HdBranch::new(
                kind,
                &root,
                config.branch_path(kind)?,
                provider.clone(),
                config.network,
                config.gap_limit,
            )?;
            Ok(Arc::new(branch))
        };

        Self::assemble(
            make_branch(BranchKind::External)?,
            make_branch(BranchKind::Internal)?,
            make_branch(BranchKind::SecondLedger)?,
            Arc::new(SimpleAssembler::from_config(config)),
            config.network,
            is_watch_only,
        )
    }

    /// Coordinate caller-supplied branches.
    ///
    /// Each branch must report the kind of the slot it is passed in.
    pub fn with_branches(
        external: Arc<dyn DerivationBranch>,
        internal: Arc<dyn DerivationBranch>,
        second_ledger: Arc<dyn DerivationBranch>,
        assembler: Arc<dyn TransactionAssembler>,
        network: Network,
    ) -> Result<(Self, BranchTasks<()>)> {
        Self::assemble(external, internal, second_ledger, assembler, network, false)
    }

    fn assemble(
        external: Arc<dyn DerivationBranch>,
        internal: Arc<dyn DerivationBranch>,
        second_ledger: Arc<dyn DerivationBranch>,
        assembler: Arc<dyn TransactionAssembler>,
        network: Network,
        watch_only: bool,
    ) -> Result<(Self, BranchTasks<()>)> {
        let runtime = Handle::try_current()
            .map_err(|e| HdError::Task(format!("Coordinator needs a tokio runtime: {}", e)))?;

        for (expected, branch) in BranchKind::ALL.into_iter().zip([&external, &internal, &second_ledger]) {
            if branch.kind() != expected {
                return Err(HdError::InvalidInput(format!(
                    "{} branch passed where the {} branch belongs",
                    branch.kind(),
                    expected
                )));
            }
        }

        let (state, _) = watch::channel(CoordinatorState::new(network));
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let coordinator = Self {
            inner: Arc::new(Inner {
                external,
                internal,
                second_ledger,
                assembler,
                state,
                events,
                runtime,
                watch_only,
            }),
        };

        log::info!(
            "Starting account coordinator on {} (watch-only: {})",
            network,
            watch_only
        );
        coordinator.inner.publish_flags();
        let tasks = coordinator.spawn_initialization(0);
        Ok((coordinator, tasks))
    }

    fn spawn_initialization(&self, epoch: u64) -> BranchTasks<()> {
        BranchTasks {
            external: self.spawn_initialize(BranchKind::External, epoch),
            internal: self.spawn_initialize(BranchKind::Internal, epoch),
            second_ledger: self.spawn_initialize(BranchKind::SecondLedger, epoch),
        }
    }

    fn spawn_initialize(&self, kind: BranchKind, epoch: u64) -> JoinHandle<Result<()>> {
        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            let result = inner.branch(kind).initialize().await;
            inner.settle_initialize(kind, epoch, &result);
            result
        })
    }

    /// The caller has already recorded the unsettled fetch for `kind`.
    fn spawn_fetch(&self, kind: BranchKind, epoch: u64) -> JoinHandle<Result<UtxoSet>> {
        let mut pending = PendingFetch {
            inner: self.inner.clone(),
            kind,
            settled: false,
        };
        self.inner.runtime.spawn(async move {
            let result = pending.inner.branch(kind).fetch().await;
            pending.inner.settle_fetch(kind, epoch, &result);
            pending.settled = true;
            result
        })
    }

    /// Last merged primary-ledger outputs. Only as fresh as the last refresh.
    pub fn unspent_outputs(&self) -> Arc<UtxoSet> {
        self.inner.state.borrow().unspent.clone()
    }

    /// Fetch every branch concurrently. Each spend-branch completion re-merges
    /// the primary-ledger outputs on its own.
    ///
    /// The account reports fetching before this returns, so
    /// [`wait_until_idle`](Self::wait_until_idle) waits for these fetches.
    pub fn refresh_unspent_outputs(&self) -> BranchTasks<UtxoSet> {
        let mut epoch = 0;
        self.inner.state.send_modify(|state| {
            for count in state.unsettled_fetches.iter_mut() {
                *count += 1;
            }
            self.inner.recompute(state);
            epoch = state.epoch;
        });
        log::debug!("Refreshing unspent outputs (epoch {})", epoch);
        BranchTasks {
            external: self.spawn_fetch(BranchKind::External, epoch),
            internal: self.spawn_fetch(BranchKind::Internal, epoch),
            second_ledger: self.spawn_fetch(BranchKind::SecondLedger, epoch),
        }
    }

    /// Invalidate every branch for `network` and reinitialize them.
    ///
    /// Readiness drops immediately. Fetches already in flight keep the account
    /// marked as fetching until they settle, but their outputs are not merged.
    pub fn on_ledger_context_change(&self, network: Network) -> BranchTasks<()> {
        for branch in self.inner.branches() {
            branch.invalidate(network);
        }

        let mut epoch = 0;
        self.inner.state.send_modify(|state| {
            state.epoch += 1;
            state.network = network;
            state.unspent = Arc::new(UtxoSet::new());
            self.inner.recompute(state);
            epoch = state.epoch;
        });
        self.inner.assembler.on_network_change(network);

        log::info!("Ledger context changed to {} (epoch {})", network, epoch);
        self.inner.emit(CoordinatorEvent::LedgerContextChanged { network, epoch });
        self.spawn_initialization(epoch)
    }

    /// Recompute readiness and activity from the branches right now.
    ///
    /// Branch tasks do this themselves; call it after changing a branch
    /// outside the coordinator.
    pub fn recompute_state(&self) -> CoordinatorState {
        self.inner.publish_flags();
        self.state()
    }

    pub fn state(&self) -> CoordinatorState {
        self.inner.state.borrow().clone()
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<CoordinatorState> {
        self.inner.state.subscribe()
    }

    pub fn events(&self) -> EventSubscription {
        self.events_filtered(EventFilter::default())
    }

    pub fn events_filtered(&self, filter: EventFilter) -> EventSubscription {
        EventSubscription::new(self.inner.events.subscribe(), filter)
    }

    pub async fn wait_until_ready(&self) -> Result<CoordinatorState> {
        self.wait_for(CoordinatorState::is_initialized).await
    }

    pub async fn wait_until_idle(&self) -> Result<CoordinatorState> {
        self.wait_for(|state| !state.is_fetching()).await
    }

    async fn wait_for(&self, predicate: impl FnMut(&CoordinatorState) -> bool) -> Result<CoordinatorState> {
        let mut receiver = self.subscribe();
        let state = receiver
            .wait_for(predicate)
            .await
            .map_err(|e| HdError::Task(e.to_string()))?;
        Ok((*state).clone())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.state.borrow().is_initialized()
    }

    pub fn is_fetching(&self) -> bool {
        self.inner.state.borrow().is_fetching()
    }

    pub fn is_watch_only(&self) -> bool {
        self.inner.watch_only
    }

    pub fn network(&self) -> Network {
        self.inner.state.borrow().network
    }

    /// Every address derived so far on the external branch.
    pub fn receiving_addresses(&self) -> Result<Vec<String>> {
        self.inner.external.derived_addresses(None)
    }

    pub fn current_receiving_address(&self) -> Result<String> {
        self.inner.external.current_address()
    }

    /// Internal branch addresses followed by external branch addresses.
    pub fn ownership_addresses(&self) -> Result<Vec<String>> {
        let mut addresses = self.inner.internal.derived_addresses(None)?;
        addresses.extend(self.inner.external.derived_addresses(None)?);
        Ok(addresses)
    }

    /// Addresses to scan for transaction history.
    ///
    /// The internal branch shares its index watermark with the second-ledger
    /// branch, so its portion runs to the larger of the two current indices.
    pub fn history_addresses(&self) -> Result<Vec<String>> {
        let internal_width = self
            .inner
            .internal
            .current_index()
            .max(self.inner.second_ledger.current_index());
        let external_width = self.inner.external.current_index();

        let mut addresses = self.inner.internal.derived_addresses(Some(internal_width))?;
        addresses.extend(self.inner.external.derived_addresses(Some(external_width))?);
        Ok(addresses)
    }

    fn change_branch(&self, context: LedgerContext) -> &Arc<dyn DerivationBranch> {
        match context {
            LedgerContext::Primary => &self.inner.internal,
            LedgerContext::Secondary => &self.inner.second_ledger,
        }
    }

    pub fn change_address(&self, context: LedgerContext) -> Result<String> {
        self.change_branch(context).current_address()
    }

    pub fn change_index(&self, context: LedgerContext) -> u32 {
        self.change_branch(context).current_index()
    }

    /// Full derivation path of the current change address, e.g. `m/1/4`.
    pub fn change_path(&self, context: LedgerContext) -> String {
        let branch = self.change_branch(context);
        format!("{}/{}", branch.path_label(), branch.current_index())
    }

    /// Change-side address at `index`; `None` when no index is given.
    pub fn address_at_index(&self, index: Option<u32>, context: LedgerContext) -> Result<Option<String>> {
        index
            .map(|index| self.change_branch(context).address_at_index(index))
            .transpose()
    }

    /// External address 0, a stable identifier for the account.
    pub fn base_address(&self) -> Result<String> {
        self.inner.external.address_at_index(0)
    }

    pub fn external_index(&self) -> u32 {
        self.inner.external.current_index()
    }

    pub fn second_ledger_index(&self) -> u32 {
        self.inner.second_ledger.current_index()
    }

    pub fn second_ledger_addresses(&self) -> Result<Vec<String>> {
        self.inner.second_ledger.derived_addresses(None)
    }

    pub fn second_ledger_unspent_outputs(&self) -> UtxoSet {
        self.inner.second_ledger.utxo_set()
    }

    /// Second-ledger address that receives staking rewards.
    pub fn reward_address(&self) -> Result<String> {
        self.inner.second_ledger.current_address()
    }

    /// Hand the current change address, ownership addresses and merged
    /// outputs to the assembler. Its result is returned unchanged.
    pub async fn build_unsigned_transaction(
        &self,
        orders: &[Order],
        destination: &str,
        memo: Option<&[u8]>,
    ) -> Result<UnsignedTransaction> {
        let change_address = self.change_address(LedgerContext::Primary)?;
        let ownership = self.ownership_addresses()?;
        let unspent = self.unspent_outputs();

        self.inner
            .assembler
            .build(orders, destination, &ownership, &unspent, &change_address, memo)
            .await
    }
}
