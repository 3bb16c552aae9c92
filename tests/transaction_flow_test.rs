mod common;

use common::*;
use hdwallet_core::{
    BranchKind, BuildError, DerivationBranch, HdBranch, HdError, HdWalletCoordinator, LedgerContext, Order,
    OutPoint, StaticUtxoProvider,
};
use std::sync::Arc;

fn branch_address(provider: &Arc<StaticUtxoProvider>, kind: BranchKind, index: u32) -> String {
    let config = test_config();
    HdBranch::new(
        kind,
        &test_root(),
        config.branch_path(kind).unwrap(),
        provider.clone(),
        config.network,
        config.gap_limit,
    )
    .unwrap()
    .address_at_index(index)
    .unwrap()
}

async fn funded_coordinator() -> (HdWalletCoordinator, Arc<StaticUtxoProvider>, String) {
    let provider = Arc::new(StaticUtxoProvider::new());
    let receive = branch_address(&provider, BranchKind::External, 0);
    let change = branch_address(&provider, BranchKind::Internal, 1);
    let stake = branch_address(&provider, BranchKind::SecondLedger, 0);

    provider.add_utxo(LedgerContext::Primary, utxo("aa", 0, 3_000, &receive));
    provider.add_utxo(LedgerContext::Primary, utxo("bb", 1, 1_500, &change));
    provider.add_utxo(LedgerContext::Secondary, utxo("cc", 0, 9_000, &stake));

    let coordinator = HdWalletCoordinator::new(test_root(), true, provider.clone(), &test_config()).unwrap();
    coordinator.wait_until_ready().await.unwrap();
    coordinator.refresh_unspent_outputs().settled().await.into_result().unwrap();

    // far past the gap limit, so never part of the scanned set
    let destination = branch_address(&provider, BranchKind::External, 40);
    (coordinator, provider, destination)
}

#[tokio::test]
async fn test_empty_account_reports_insufficient_funds() {
    let coordinator =
        HdWalletCoordinator::new(test_root(), false, Arc::new(StaticUtxoProvider::new()), &test_config()).unwrap();
    coordinator.wait_until_ready().await.unwrap();
    let destination = coordinator.base_address().unwrap();

    let result = coordinator
        .build_unsigned_transaction(&[Order::Payment { amount: 1_000 }], &destination, None)
        .await;

    match result {
        Err(HdError::TransactionBuild(BuildError::InsufficientFunds { available, .. })) => assert_eq!(available, 0),
        other => panic!("expected insufficient funds, got {:?}", other),
    }
}

#[tokio::test]
async fn test_merged_balance_excludes_second_ledger() {
    let (coordinator, _, _) = funded_coordinator().await;
    assert_eq!(coordinator.unspent_outputs().total_value(), 4_500);
    assert_eq!(coordinator.second_ledger_unspent_outputs().total_value(), 9_000);
    assert_eq!(coordinator.change_index(LedgerContext::Primary), 2);
}

#[tokio::test]
async fn test_payment_sends_change_to_current_change_address() {
    let (coordinator, _, destination) = funded_coordinator().await;

    let tx = coordinator
        .build_unsigned_transaction(&[Order::Payment { amount: 2_000 }], &destination, Some(&b"rent"[..]))
        .await
        .unwrap();

    assert_eq!(tx.inputs.len(), 1);
    assert_eq!(tx.inputs[0].outpoint, OutPoint::new("aa", 0));
    assert_eq!(tx.outputs[0].address, destination);
    assert_eq!(tx.outputs[0].amount, 2_000);
    assert_eq!(
        tx.outputs[1].address,
        coordinator.change_address(LedgerContext::Primary).unwrap()
    );
    assert_eq!(tx.outputs[1].amount, 900);
    assert_eq!(tx.memo.as_deref(), Some(&b"rent"[..]));
}

#[tokio::test]
async fn test_explicit_output_order() {
    let (coordinator, _, destination) = funded_coordinator().await;

    let tx = coordinator
        .build_unsigned_transaction(&[Order::SpendOutput(OutPoint::new("bb", 1))], &destination, None)
        .await
        .unwrap();
    assert!(tx.inputs.iter().any(|u| u.outpoint == OutPoint::new("bb", 1)));
    assert_eq!(tx.outputs[0].amount, 1_500);

    // second-ledger outputs are not part of the primary balance
    let result = coordinator
        .build_unsigned_transaction(&[Order::SpendOutput(OutPoint::new("cc", 0))], &destination, None)
        .await;
    assert!(matches!(
        result,
        Err(HdError::TransactionBuild(BuildError::UnknownOutput(_)))
    ));
}

#[tokio::test]
async fn test_assembler_errors_pass_through() {
    let (coordinator, _, _) = funded_coordinator().await;
    let stake_address = coordinator.reward_address().unwrap();

    let result = coordinator
        .build_unsigned_transaction(&[Order::Payment { amount: 10 }], &stake_address, None)
        .await;
    assert!(matches!(
        result,
        Err(HdError::TransactionBuild(BuildError::InvalidDestination(_)))
    ));

    let result = coordinator
        .build_unsigned_transaction(&[Order::Payment { amount: 1_000_000 }], &coordinator.base_address().unwrap(), None)
        .await;
    assert!(matches!(
        result,
        Err(HdError::TransactionBuild(BuildError::InsufficientFunds { available: 4_500, .. }))
    ));
}

async fn coordinator_with_receive_funds(provider: &Arc<StaticUtxoProvider>) -> HdWalletCoordinator {
    let receive = branch_address(provider, BranchKind::External, 0);
    provider.add_utxo(LedgerContext::Primary, utxo("aa", 0, 3_000, &receive));

    let coordinator = HdWalletCoordinator::new(test_root(), false, provider.clone(), &test_config()).unwrap();
    coordinator.wait_until_ready().await.unwrap();
    coordinator
}

#[tokio::test]
async fn test_wait_until_idle_after_refresh() {
    let provider = Arc::new(StaticUtxoProvider::new());
    let coordinator = coordinator_with_receive_funds(&provider).await;

    let _ = coordinator.refresh_unspent_outputs();
    assert!(coordinator.is_fetching());
    coordinator.wait_until_idle().await.unwrap();
    assert_eq!(coordinator.unspent_outputs().total_value(), 3_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_until_idle_after_refresh_on_worker_threads() {
    let provider = Arc::new(StaticUtxoProvider::new());
    let coordinator = coordinator_with_receive_funds(&provider).await;

    for _ in 0..10 {
        let _ = coordinator.refresh_unspent_outputs();
        let state = coordinator.wait_until_idle().await.unwrap();
        assert_eq!(state.unspent.total_value(), 3_000);
    }
}

#[tokio::test]
async fn test_oversized_payment_is_rejected() {
    let (coordinator, _, destination) = funded_coordinator().await;

    let result = coordinator
        .build_unsigned_transaction(&[Order::Payment { amount: u64::MAX }], &destination, None)
        .await;
    assert!(matches!(
        result,
        Err(HdError::TransactionBuild(BuildError::AmountOverflow))
    ));
}

#[tokio::test]
async fn test_spent_output_drops_out_after_refresh() {
    let (coordinator, provider, _) = funded_coordinator().await;
    provider.spend(LedgerContext::Primary, &OutPoint::new("aa", 0));

    coordinator.refresh_unspent_outputs().settled().await.into_result().unwrap();
    let merged = coordinator.unspent_outputs();
    assert_eq!(merged.total_value(), 1_500);
    assert!(!merged.contains(&OutPoint::new("aa", 0)));
    // the spent output's address is still used
    assert_eq!(coordinator.external_index(), 1);
}
