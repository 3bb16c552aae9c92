#![allow(dead_code)]

use async_trait::async_trait;
use hdwallet_core::primitives::bip32::ExtendedPrivateKey;
use hdwallet_core::{
    AccountKey, BranchKind, BranchTasks, CoordinatorEvent, CoreConfig, DerivationBranch, EventSubscription,
    HdError, HdWalletCoordinator, Network, OutPoint, Result, SimpleAssembler, Utxo, UtxoSet,
};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

pub const SEED: &str = "000102030405060708090a0b0c0d0e0f";

pub fn test_root() -> AccountKey {
    let seed = hex::decode(SEED).unwrap();
    AccountKey::Private(ExtendedPrivateKey::new_master_from_seed(&seed, Network::Testnet).unwrap())
}

pub fn test_config() -> CoreConfig {
    CoreConfig {
        network: Network::Testnet,
        gap_limit: 5,
        fee: 100,
        dust_limit: 50,
        ..CoreConfig::default()
    }
}

pub fn utxo(txid: &str, vout: u32, value: u64, address: &str) -> Utxo {
    Utxo::new(OutPoint::new(txid, vout), value, address)
}

/// Lets a test decide when each scripted operation may finish.
pub struct Gate {
    open: AtomicBool,
    permits: Semaphore,
}

impl Gate {
    pub fn new(open: bool) -> Self {
        Self {
            open: AtomicBool::new(open),
            permits: Semaphore::new(0),
        }
    }

    /// Let one waiting (or future) operation through.
    pub fn release(&self) {
        self.permits.add_permits(1);
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.permits.add_permits(1024);
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    async fn pass(&self) {
        if self.open.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
    }
}

/// Branch double with scripted outcomes.
///
/// Addresses are plain strings built from kind, network and index. Like a
/// real branch it drops results that finish after an invalidation.
pub struct ScriptedBranch {
    kind: BranchKind,
    network: Mutex<Network>,
    generation: AtomicU64,
    initialized: AtomicBool,
    forced_fetching: AtomicBool,
    fetches_in_flight: AtomicUsize,
    current_index: AtomicU32,
    utxos: Mutex<UtxoSet>,
    next_fetch: Mutex<std::result::Result<Vec<Utxo>, String>>,
    init_failure: Mutex<Option<String>>,
    pub init_gate: Gate,
    pub fetch_gate: Gate,
}

impl ScriptedBranch {
    pub fn new(kind: BranchKind, network: Network, gates_open: bool) -> Self {
        Self {
            kind,
            network: Mutex::new(network),
            generation: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
            forced_fetching: AtomicBool::new(false),
            fetches_in_flight: AtomicUsize::new(0),
            current_index: AtomicU32::new(0),
            utxos: Mutex::new(UtxoSet::new()),
            next_fetch: Mutex::new(Ok(Vec::new())),
            init_failure: Mutex::new(None),
            init_gate: Gate::new(gates_open),
            fetch_gate: Gate::new(gates_open),
        }
    }

    pub fn address(kind: BranchKind, network: Network, index: u32) -> String {
        format!("{}-{}-{}", kind, network, index)
    }

    pub fn set_index(&self, index: u32) {
        self.current_index.store(index, Ordering::SeqCst);
    }

    pub fn set_initialized(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::SeqCst);
    }

    pub fn set_fetching(&self, fetching: bool) {
        self.forced_fetching.store(fetching, Ordering::SeqCst);
    }

    pub fn script_fetch(&self, outcome: std::result::Result<Vec<Utxo>, &str>) {
        *self.next_fetch.lock().unwrap() = outcome.map_err(str::to_string);
    }

    pub fn fail_init(&self, reason: &str) {
        *self.init_failure.lock().unwrap() = Some(reason.to_string());
    }

    fn network(&self) -> Network {
        *self.network.lock().unwrap()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DerivationBranch for ScriptedBranch {
    fn kind(&self) -> BranchKind {
        self.kind
    }

    fn path_label(&self) -> String {
        match self.kind {
            BranchKind::Internal => "m/1".to_string(),
            _ => "m/0".to_string(),
        }
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn is_fetching(&self) -> bool {
        self.forced_fetching.load(Ordering::SeqCst) || self.fetches_in_flight.load(Ordering::SeqCst) > 0
    }

    fn current_index(&self) -> u32 {
        self.current_index.load(Ordering::SeqCst)
    }

    fn current_address(&self) -> Result<String> {
        self.address_at_index(self.current_index())
    }

    fn derived_addresses(&self, upto: Option<u32>) -> Result<Vec<String>> {
        let end = upto.unwrap_or(self.current_index() + 1);
        (0..end).map(|i| self.address_at_index(i)).collect()
    }

    fn address_at_index(&self, index: u32) -> Result<String> {
        Ok(Self::address(self.kind, self.network(), index))
    }

    fn utxo_set(&self) -> UtxoSet {
        self.utxos.lock().unwrap().clone()
    }

    fn invalidate(&self, network: Network) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.network.lock().unwrap() = network;
        self.initialized.store(false, Ordering::SeqCst);
        self.current_index.store(0, Ordering::SeqCst);
        *self.utxos.lock().unwrap() = UtxoSet::new();
    }

    async fn initialize(&self) -> Result<()> {
        let generation = self.generation.load(Ordering::SeqCst);
        self.init_gate.pass().await;

        if let Some(reason) = self.init_failure.lock().unwrap().clone() {
            return Err(HdError::initialization(self.kind, reason));
        }
        if generation == self.generation.load(Ordering::SeqCst) {
            self.initialized.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn fetch(&self) -> Result<UtxoSet> {
        self.fetches_in_flight.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight(&self.fetches_in_flight);
        let generation = self.generation.load(Ordering::SeqCst);
        self.fetch_gate.pass().await;

        let outcome = self.next_fetch.lock().unwrap().clone();
        let utxos: UtxoSet = outcome.map_err(|e| HdError::fetch(self.kind, e))?.into();
        if generation == self.generation.load(Ordering::SeqCst) {
            *self.utxos.lock().unwrap() = utxos.clone();
        }
        Ok(utxos)
    }
}

pub struct Scripted {
    pub coordinator: HdWalletCoordinator,
    pub external: Arc<ScriptedBranch>,
    pub internal: Arc<ScriptedBranch>,
    pub second_ledger: Arc<ScriptedBranch>,
    pub init_tasks: BranchTasks<()>,
}

impl Scripted {
    pub fn branch(&self, kind: BranchKind) -> &Arc<ScriptedBranch> {
        match kind {
            BranchKind::External => &self.external,
            BranchKind::Internal => &self.internal,
            BranchKind::SecondLedger => &self.second_ledger,
        }
    }

    pub fn all(&self) -> [&Arc<ScriptedBranch>; 3] {
        [&self.external, &self.internal, &self.second_ledger]
    }
}

/// Coordinator over three scripted branches. With `gates_open == false` no
/// operation finishes until the test releases it.
pub fn scripted_coordinator(gates_open: bool) -> Scripted {
    let network = Network::Testnet;
    let external = Arc::new(ScriptedBranch::new(BranchKind::External, network, gates_open));
    let internal = Arc::new(ScriptedBranch::new(BranchKind::Internal, network, gates_open));
    let second_ledger = Arc::new(ScriptedBranch::new(BranchKind::SecondLedger, network, gates_open));

    let (coordinator, init_tasks) = HdWalletCoordinator::with_branches(
        external.clone(),
        internal.clone(),
        second_ledger.clone(),
        Arc::new(SimpleAssembler::from_config(&test_config())),
        network,
    )
    .unwrap();

    Scripted {
        coordinator,
        external,
        internal,
        second_ledger,
        init_tasks,
    }
}

/// Next event matching `predicate`, failing the test after a few seconds.
pub async fn next_event(
    events: &mut EventSubscription,
    mut predicate: impl FnMut(&CoordinatorEvent) -> bool,
) -> CoordinatorEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(event) if predicate(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for coordinator event")
}

pub async fn initialized_event(events: &mut EventSubscription, kind: BranchKind) -> CoordinatorEvent {
    next_event(events, |e| matches!(e, CoordinatorEvent::BranchInitialized { branch, .. } if *branch == kind)).await
}
