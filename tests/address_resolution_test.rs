mod common;

use common::*;
use hdwallet_core::primitives::address::Address;
use hdwallet_core::{
    BranchKind, DerivationBranch, HdBranch, HdWalletCoordinator, LedgerContext, Network, StaticUtxoProvider,
    UtxoProvider,
};
use std::sync::Arc;

fn hd_branch(kind: BranchKind, provider: Arc<StaticUtxoProvider>) -> HdBranch {
    let config = test_config();
    HdBranch::new(
        kind,
        &test_root(),
        config.branch_path(kind).unwrap(),
        provider,
        config.network,
        config.gap_limit,
    )
    .unwrap()
}

/// Mark `count` leading addresses of `kind` as used.
fn use_addresses(provider: &Arc<StaticUtxoProvider>, kind: BranchKind, count: u32) {
    let reference = hd_branch(kind, provider.clone());
    for index in 0..count {
        provider.mark_used(kind.context(), reference.address_at_index(index).unwrap());
    }
}

async fn ready_coordinator(provider: Arc<StaticUtxoProvider>) -> HdWalletCoordinator {
    let coordinator = HdWalletCoordinator::new(test_root(), false, provider, &test_config()).unwrap();
    coordinator.wait_until_ready().await.unwrap();
    coordinator
}

#[tokio::test]
async fn test_addresses_are_deterministic() {
    let provider = Arc::new(StaticUtxoProvider::new());
    use_addresses(&provider, BranchKind::External, 3);

    let a = ready_coordinator(provider.clone()).await;
    let b = ready_coordinator(provider).await;

    assert_eq!(a.receiving_addresses().unwrap(), b.receiving_addresses().unwrap());
    assert_eq!(a.ownership_addresses().unwrap(), b.ownership_addresses().unwrap());
    assert_eq!(a.base_address().unwrap(), b.base_address().unwrap());
    assert_eq!(
        a.address_at_index(Some(11), LedgerContext::Secondary).unwrap(),
        b.address_at_index(Some(11), LedgerContext::Secondary).unwrap()
    );
}

#[tokio::test]
async fn test_watch_only_account_derives_same_addresses() {
    let provider = Arc::new(StaticUtxoProvider::new());
    let full = ready_coordinator(provider.clone()).await;

    let watch_only = HdWalletCoordinator::new(test_root(), true, provider, &test_config()).unwrap();
    watch_only.wait_until_ready().await.unwrap();

    assert!(watch_only.is_watch_only());
    assert!(!full.is_watch_only());
    assert_eq!(full.history_addresses().unwrap(), watch_only.history_addresses().unwrap());
    assert_eq!(full.reward_address().unwrap(), watch_only.reward_address().unwrap());
}

#[tokio::test]
async fn test_ownership_is_internal_then_external() {
    let provider = Arc::new(StaticUtxoProvider::new());
    use_addresses(&provider, BranchKind::External, 2);
    use_addresses(&provider, BranchKind::Internal, 4);
    let coordinator = ready_coordinator(provider.clone()).await;

    let internal = hd_branch(BranchKind::Internal, provider.clone());
    let external = hd_branch(BranchKind::External, provider);
    internal.initialize().await.unwrap();
    external.initialize().await.unwrap();

    let mut expected = internal.derived_addresses(None).unwrap();
    expected.extend(external.derived_addresses(None).unwrap());
    assert_eq!(coordinator.ownership_addresses().unwrap(), expected);
    assert_eq!(coordinator.receiving_addresses().unwrap(), external.derived_addresses(None).unwrap());
}

#[tokio::test]
async fn test_history_width_follows_larger_shared_index() {
    let provider = Arc::new(StaticUtxoProvider::new());
    use_addresses(&provider, BranchKind::External, 2);
    use_addresses(&provider, BranchKind::Internal, 1);
    use_addresses(&provider, BranchKind::SecondLedger, 4);
    let coordinator = ready_coordinator(provider).await;

    assert_eq!(coordinator.external_index(), 2);
    assert_eq!(coordinator.change_index(LedgerContext::Primary), 1);
    assert_eq!(coordinator.second_ledger_index(), 4);

    let history = coordinator.history_addresses().unwrap();
    assert_eq!(history.len(), 4 + 2);

    // internal portion runs past the internal cache up to index 3
    for index in 0..4 {
        assert_eq!(
            history[index as usize],
            coordinator.address_at_index(Some(index), LedgerContext::Primary).unwrap().unwrap()
        );
    }
    assert_eq!(history[4], coordinator.base_address().unwrap());
}

#[tokio::test]
async fn test_history_of_fresh_account_is_empty() {
    let coordinator = ready_coordinator(Arc::new(StaticUtxoProvider::new())).await;
    assert!(coordinator.history_addresses().unwrap().is_empty());
    assert_eq!(coordinator.receiving_addresses().unwrap().len(), 1);
}

#[tokio::test]
async fn test_address_at_index_lookup() {
    let provider = Arc::new(StaticUtxoProvider::new());
    let coordinator = ready_coordinator(provider.clone()).await;

    assert_eq!(coordinator.address_at_index(None, LedgerContext::Primary).unwrap(), None);
    assert_eq!(coordinator.address_at_index(None, LedgerContext::Secondary).unwrap(), None);

    let second = hd_branch(BranchKind::SecondLedger, provider.clone());
    assert_eq!(
        coordinator.address_at_index(Some(5), LedgerContext::Secondary).unwrap(),
        Some(second.address_at_index(5).unwrap())
    );

    let internal = hd_branch(BranchKind::Internal, provider);
    assert_eq!(
        coordinator.address_at_index(Some(5), LedgerContext::Primary).unwrap(),
        Some(internal.address_at_index(5).unwrap())
    );
}

#[tokio::test]
async fn test_change_resolution_by_context() {
    let provider = Arc::new(StaticUtxoProvider::new());
    use_addresses(&provider, BranchKind::Internal, 3);
    use_addresses(&provider, BranchKind::SecondLedger, 1);
    let coordinator = ready_coordinator(provider).await;

    assert_eq!(coordinator.change_index(LedgerContext::Primary), 3);
    assert_eq!(coordinator.change_index(LedgerContext::Secondary), 1);
    assert_eq!(coordinator.change_path(LedgerContext::Primary), "m/1/3");
    assert_eq!(coordinator.change_path(LedgerContext::Secondary), "m/0/1");

    let change = coordinator.change_address(LedgerContext::Primary).unwrap();
    assert!(Address::parse(&change, Network::Testnet, LedgerContext::Primary).is_ok());
    assert_eq!(
        Some(change),
        coordinator.address_at_index(Some(3), LedgerContext::Primary).unwrap()
    );

    let stake_change = coordinator.change_address(LedgerContext::Secondary).unwrap();
    assert!(stake_change.starts_with("tstk1"));
    assert_eq!(stake_change, coordinator.reward_address().unwrap());
    assert_eq!(coordinator.second_ledger_addresses().unwrap().len(), 2);
}

#[tokio::test]
async fn test_context_change_rekeys_addresses() {
    let provider = Arc::new(StaticUtxoProvider::new());
    let coordinator = ready_coordinator(provider).await;
    let testnet_base = coordinator.base_address().unwrap();

    let tasks = coordinator.on_ledger_context_change(Network::Mainnet);
    assert!(!coordinator.is_initialized());
    tasks.settled().await.into_result().unwrap();
    coordinator.wait_until_ready().await.unwrap();

    let mainnet_base = coordinator.base_address().unwrap();
    assert_ne!(testnet_base, mainnet_base);
    assert!(mainnet_base.starts_with('1'));
    assert!(coordinator.reward_address().unwrap().starts_with("stk1"));
    assert_eq!(coordinator.network(), Network::Mainnet);
}

#[tokio::test]
async fn test_provider_sees_only_its_context() {
    let provider = Arc::new(StaticUtxoProvider::new());
    use_addresses(&provider, BranchKind::SecondLedger, 2);

    let external = hd_branch(BranchKind::External, provider.clone());
    let addresses = external.derived_addresses(Some(3)).unwrap();
    let used = provider.used_addresses(LedgerContext::Primary, &addresses).await.unwrap();
    assert!(used.is_empty());
}
