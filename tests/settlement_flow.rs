//! End-to-end settlement pipeline tests over the in-memory mocks.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use uuid::Uuid;

use custody_settlement::app::{
    ConfirmationWatcher, DepositPromoter, OrchestratorConfig, PromoterConfig, SettlementQueue,
    SettlementService, WatcherConfig, WithdrawalOrchestrator,
};
use custody_settlement::domain::{
    Blockchain, ChainWallet, Currency, CurrencyAttr, ExchangeCallbackRequest, ExchangeOutcome,
    LedgerStore, StagedDeposit, StagingStatus, SubmitWithdrawalRequest, TransactionStatus,
    TxAction, WalletPool, WithdrawRoute, WithdrawRoute::OnChain,
};
use custody_settlement::test_utils::{
    MockChainRpc, MockExchange, MockLedgerStore, MockMetadataStore, MockWalletPool,
    RecordingAlertSink,
};

const WALLET_ADDR: &str = "0x00000000000000000000000000000000000000aa";
const DEST_ADDR: &str = "0x00000000000000000000000000000000000000bb";

struct Fixture {
    store: Arc<MockLedgerStore>,
    wallets: Arc<MockWalletPool>,
    chain_rpc: Arc<MockChainRpc>,
    exchange: Arc<MockExchange>,
    alerts: Arc<RecordingAlertSink>,
    queue: SettlementQueue,
    service: SettlementService,
    orchestrator: WithdrawalOrchestrator,
    watcher: ConfirmationWatcher,
}

fn fixture(route: WithdrawRoute) -> Fixture {
    fixture_with(route, OrchestratorConfig::default())
}

fn fixture_with(route: WithdrawRoute, orchestrator_config: OrchestratorConfig) -> Fixture {
    let store = Arc::new(MockLedgerStore::new());
    let metadata = Arc::new(MockMetadataStore::new());
    let wallets = Arc::new(MockWalletPool::new());
    let chain_rpc = Arc::new(MockChainRpc::new());
    let exchange = Arc::new(MockExchange::new());
    let alerts = Arc::new(RecordingAlertSink::new());
    let (queue, _receiver, _shutdown) = SettlementQueue::new();

    metadata.add_chain(Blockchain {
        code: "ETH".to_string(),
        rpc_url: "http://localhost:8545".to_string(),
        explorer_url: "https://etherscan.io".to_string(),
        chain_id: 1,
        kind: "evm".to_string(),
        active: true,
    });
    metadata.add_currency(Currency {
        code: "USDT".to_string(),
        name: "Tether USD".to_string(),
        active: true,
    });
    metadata.add_attr(CurrencyAttr {
        currency: "USDT".to_string(),
        chain: "ETH".to_string(),
        contract: Some("0x00000000000000000000000000000000000000cc".to_string()),
        decimals: 6,
        route,
        fee: dec!(1),
        net_divisor: None,
        max_per_tx: Some(dec!(10000)),
        daily_limit: None,
    });

    let service = SettlementService::new(
        store.clone(),
        metadata.clone(),
        chain_rpc.clone(),
        queue.clone(),
    );
    let orchestrator = WithdrawalOrchestrator::new(
        store.clone(),
        metadata.clone(),
        wallets.clone(),
        chain_rpc.clone(),
        exchange.clone(),
        alerts.clone(),
        queue.clone(),
        orchestrator_config,
    );
    let watcher = ConfirmationWatcher::new(
        store.clone(),
        metadata.clone(),
        chain_rpc.clone(),
        alerts.clone(),
        queue.clone(),
        WatcherConfig::default(),
    );

    Fixture {
        store,
        wallets,
        chain_rpc,
        exchange,
        alerts,
        queue,
        service,
        orchestrator,
        watcher,
    }
}

fn wallet(id: &str) -> ChainWallet {
    ChainWallet {
        id: id.to_string(),
        chain: "ETH".to_string(),
        address: WALLET_ADDR.to_string(),
        private_key: SecretString::from("hunter2"),
        in_use: false,
        active: true,
    }
}

fn staged_deposit(hash: &str, amount: rust_decimal::Decimal) -> StagedDeposit {
    let now = Utc::now();
    StagedDeposit {
        id: Uuid::new_v4().to_string(),
        customer_id: "cust_1".to_string(),
        currency: "USDT".to_string(),
        chain: "ETH".to_string(),
        action: TxAction::Deposit,
        amount,
        fee: dec!(0),
        from_address: Some(DEST_ADDR.to_string()),
        to_address: Some(WALLET_ADDR.to_string()),
        tx_hash: hash.to_string(),
        status: StagingStatus::Created,
        created_at: now,
        updated_at: now,
    }
}

/// Pull a scheduled retry deadline into the past so the retry job is
/// due immediately.
async fn make_retry_due(f: &Fixture, id: &str) {
    let mut tx = f.store.transaction_by_id(id).await.unwrap().unwrap();
    tx.next_attempt_at = Some(Utc::now() - chrono::Duration::seconds(1));
    f.store.insert_transaction(tx);
}

/// Credit the customer through the staging pipeline so later balance
/// reads see a real completed deposit.
async fn fund_customer(f: &Fixture, amount: rust_decimal::Decimal) {
    let staged = f
        .store
        .insert_staged_deposit(&staged_deposit(&format!("0xfund{}", amount), amount))
        .await
        .unwrap();
    f.store.promote_deposit(&staged).await.unwrap();
}

#[tokio::test]
async fn test_on_chain_withdrawal_happy_path() {
    let f = fixture(OnChain);
    f.wallets.add_wallet(wallet("w1"));
    fund_customer(&f, dec!(500)).await;

    let request = SubmitWithdrawalRequest {
        customer_id: "cust_1".to_string(),
        currency: "USDT".to_string(),
        chain: "ETH".to_string(),
        amount: dec!(100),
        to_address: DEST_ADDR.to_string(),
        address_tag: None,
        note: None,
    };
    let tx = f.service.submit_withdrawal(&request).await.unwrap();
    assert_eq!(tx.status, TransactionStatus::Created);
    assert_eq!(tx.fee, dec!(1));

    let tx = f.service.accept_withdrawal(&tx.id).await.unwrap();
    assert_eq!(tx.status, TransactionStatus::Accepted);

    f.orchestrator.run(&tx.id, false, 0).await.unwrap();

    let tx = f.store.transaction_by_id(&tx.id).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Processing);
    let hash = tx.tx_hash.clone().expect("hash persisted after submission");

    // Wallet lease covers the submission only
    assert_eq!(f.wallets.leased_count(), 0);
    // Token transfer: 100 USDT at 6 decimals
    let submissions = f.chain_rpc.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].2, 100_000_000);

    f.watcher.poll(&tx.id, &hash, 0).await.unwrap();

    let tx = f.store.transaction_by_id(&tx.id).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Completed);
    assert_eq!(tx.balance_before, Some(dec!(500)));
    assert_eq!(tx.balance, Some(dec!(399)));
    assert!(tx.explorer_link.unwrap().contains("etherscan.io/tx/"));

    let balance = f.service.get_balance("cust_1", "USDT").await.unwrap();
    assert_eq!(balance.balance, dec!(399));
}

#[tokio::test]
async fn test_withdrawal_rejected_when_balance_insufficient() {
    let f = fixture(OnChain);
    fund_customer(&f, dec!(50)).await;

    let request = SubmitWithdrawalRequest {
        customer_id: "cust_1".to_string(),
        currency: "USDT".to_string(),
        chain: "ETH".to_string(),
        // 50 + 1 fee exceeds the 50 balance
        amount: dec!(50),
        to_address: DEST_ADDR.to_string(),
        address_tag: None,
        note: None,
    };
    assert!(f.service.submit_withdrawal(&request).await.is_err());
}

#[tokio::test]
async fn test_daily_limit_caps_rolling_withdrawals() {
    let store = Arc::new(MockLedgerStore::new());
    let metadata = Arc::new(MockMetadataStore::new());
    metadata.add_chain(Blockchain {
        code: "ETH".to_string(),
        rpc_url: "http://localhost:8545".to_string(),
        explorer_url: "https://etherscan.io".to_string(),
        chain_id: 1,
        kind: "evm".to_string(),
        active: true,
    });
    metadata.add_currency(Currency {
        code: "USDT".to_string(),
        name: "Tether USD".to_string(),
        active: true,
    });
    metadata.add_attr(CurrencyAttr {
        currency: "USDT".to_string(),
        chain: "ETH".to_string(),
        contract: None,
        decimals: 6,
        route: OnChain,
        fee: dec!(1),
        net_divisor: None,
        max_per_tx: None,
        daily_limit: Some(dec!(150)),
    });
    let (queue, _receiver, _shutdown) = SettlementQueue::new();
    let service = SettlementService::new(
        store.clone(),
        metadata,
        Arc::new(MockChainRpc::new()),
        queue,
    );

    let staged = store
        .insert_staged_deposit(&staged_deposit("0xlimit", dec!(1000)))
        .await
        .unwrap();
    store.promote_deposit(&staged).await.unwrap();

    let request = SubmitWithdrawalRequest {
        customer_id: "cust_1".to_string(),
        currency: "USDT".to_string(),
        chain: "ETH".to_string(),
        amount: dec!(100),
        to_address: DEST_ADDR.to_string(),
        address_tag: None,
        note: None,
    };
    let first = service.submit_withdrawal(&request).await.unwrap();

    // 100 used + 100 requested breaches the 150 cap
    assert!(service.submit_withdrawal(&request).await.is_err());

    // Canceled withdrawals stop counting against the window
    service.cancel_withdrawal(&first.id).await.unwrap();
    assert!(service.submit_withdrawal(&request).await.is_ok());
}

#[tokio::test]
async fn test_cancel_before_settlement_only() {
    let f = fixture(OnChain);
    f.wallets.add_wallet(wallet("w1"));
    fund_customer(&f, dec!(500)).await;

    let request = SubmitWithdrawalRequest {
        customer_id: "cust_1".to_string(),
        currency: "USDT".to_string(),
        chain: "ETH".to_string(),
        amount: dec!(10),
        to_address: DEST_ADDR.to_string(),
        address_tag: None,
        note: None,
    };
    let tx = f.service.submit_withdrawal(&request).await.unwrap();
    let canceled = f.service.cancel_withdrawal(&tx.id).await.unwrap();
    assert_eq!(canceled.status, TransactionStatus::Canceled);

    // Once processing, cancellation is refused
    let tx = f.service.submit_withdrawal(&request).await.unwrap();
    let tx = f.service.accept_withdrawal(&tx.id).await.unwrap();
    f.orchestrator.run(&tx.id, false, 0).await.unwrap();
    assert!(f.service.cancel_withdrawal(&tx.id).await.is_err());
}

#[tokio::test]
async fn test_wallet_exhaustion_keeps_withdrawal_alive() {
    let f = fixture(OnChain);
    // No wallets at all
    fund_customer(&f, dec!(500)).await;

    let request = SubmitWithdrawalRequest {
        customer_id: "cust_1".to_string(),
        currency: "USDT".to_string(),
        chain: "ETH".to_string(),
        amount: dec!(100),
        to_address: DEST_ADDR.to_string(),
        address_tag: None,
        note: None,
    };
    let tx = f.service.submit_withdrawal(&request).await.unwrap();
    let tx = f.service.accept_withdrawal(&tx.id).await.unwrap();

    // Several passes with an empty pool: never fails, never submits
    for attempt in 0..3 {
        f.orchestrator.run(&tx.id, false, attempt).await.unwrap();
        let current = f.store.transaction_by_id(&tx.id).await.unwrap().unwrap();
        assert_eq!(current.status, TransactionStatus::Accepted);
        assert!(current.next_attempt_at.is_some());
    }
    assert!(f.chain_rpc.submissions().is_empty());

    // Admin provisions a wallet; the next pass settles normally
    f.wallets.add_wallet(wallet("w1"));
    f.orchestrator.run(&tx.id, false, 3).await.unwrap();
    let current = f.store.transaction_by_id(&tx.id).await.unwrap().unwrap();
    assert_eq!(current.status, TransactionStatus::Processing);
    assert_eq!(f.chain_rpc.submissions().len(), 1);
}

#[tokio::test]
async fn test_wallet_exhaustion_alerts_at_threshold_only() {
    let config = OrchestratorConfig {
        exhaustion_alert_threshold: 2,
        ..OrchestratorConfig::default()
    };
    let f = fixture_with(OnChain, config);
    fund_customer(&f, dec!(500)).await;

    let request = SubmitWithdrawalRequest {
        customer_id: "cust_1".to_string(),
        currency: "USDT".to_string(),
        chain: "ETH".to_string(),
        amount: dec!(100),
        to_address: DEST_ADDR.to_string(),
        address_tag: None,
        note: None,
    };
    let tx = f.service.submit_withdrawal(&request).await.unwrap();
    let tx = f.service.accept_withdrawal(&tx.id).await.unwrap();

    f.orchestrator.run(&tx.id, false, 0).await.unwrap();
    assert!(f.alerts.withdrawals().is_empty());
    f.orchestrator.run(&tx.id, false, 1).await.unwrap();
    assert_eq!(f.alerts.withdrawals().len(), 1);
    f.orchestrator.run(&tx.id, false, 2).await.unwrap();
    // Fires exactly once, at the threshold
    assert_eq!(f.alerts.withdrawals().len(), 1);
}

#[tokio::test]
async fn test_transient_submission_failure_retries_without_double_spend() {
    let f = fixture(OnChain);
    f.wallets.add_wallet(wallet("w1"));
    fund_customer(&f, dec!(500)).await;
    f.chain_rpc.fail_submissions(1);

    let request = SubmitWithdrawalRequest {
        customer_id: "cust_1".to_string(),
        currency: "USDT".to_string(),
        chain: "ETH".to_string(),
        amount: dec!(100),
        to_address: DEST_ADDR.to_string(),
        address_tag: None,
        note: None,
    };
    let tx = f.service.submit_withdrawal(&request).await.unwrap();
    let tx = f.service.accept_withdrawal(&tx.id).await.unwrap();

    f.orchestrator.run(&tx.id, false, 0).await.unwrap();
    let current = f.store.transaction_by_id(&tx.id).await.unwrap().unwrap();
    assert_eq!(current.status, TransactionStatus::Processing);
    assert_eq!(current.attempts, 1);
    assert!(current.tx_hash.is_none());
    // Wallet came back to the pool despite the failure
    assert_eq!(f.wallets.leased_count(), 0);

    // A stale fresh job for the same transaction is a no-op now
    f.orchestrator.run(&tx.id, false, 0).await.unwrap();
    assert!(f.chain_rpc.submissions().is_empty());

    // The scheduled retry picks it up as Processing and submits once
    make_retry_due(&f, &tx.id).await;
    f.orchestrator.run(&tx.id, true, 0).await.unwrap();
    let current = f.store.transaction_by_id(&tx.id).await.unwrap().unwrap();
    assert!(current.tx_hash.is_some());
    assert_eq!(f.chain_rpc.submissions().len(), 1);
}

#[tokio::test]
async fn test_duplicate_retry_jobs_submit_only_once() {
    let f = fixture(OnChain);
    f.wallets.add_wallet(wallet("w1"));
    fund_customer(&f, dec!(500)).await;
    f.chain_rpc.fail_submissions(1);

    let request = SubmitWithdrawalRequest {
        customer_id: "cust_1".to_string(),
        currency: "USDT".to_string(),
        chain: "ETH".to_string(),
        amount: dec!(100),
        to_address: DEST_ADDR.to_string(),
        address_tag: None,
        note: None,
    };
    let tx = f.service.submit_withdrawal(&request).await.unwrap();
    let tx = f.service.accept_withdrawal(&tx.id).await.unwrap();
    f.orchestrator.run(&tx.id, false, 0).await.unwrap();
    make_retry_due(&f, &tx.id).await;

    // The reaper and the delayed in-process job can both fire for the
    // same deadline; only the first may spend
    f.orchestrator.run(&tx.id, true, 0).await.unwrap();
    f.orchestrator.run(&tx.id, true, 0).await.unwrap();

    let current = f.store.transaction_by_id(&tx.id).await.unwrap().unwrap();
    assert!(current.tx_hash.is_some());
    assert_eq!(f.chain_rpc.submissions().len(), 1);
}

#[tokio::test]
async fn test_retry_job_before_its_deadline_is_dropped() {
    let f = fixture(OnChain);
    f.wallets.add_wallet(wallet("w1"));
    fund_customer(&f, dec!(500)).await;
    f.chain_rpc.fail_submissions(1);

    let request = SubmitWithdrawalRequest {
        customer_id: "cust_1".to_string(),
        currency: "USDT".to_string(),
        chain: "ETH".to_string(),
        amount: dec!(100),
        to_address: DEST_ADDR.to_string(),
        address_tag: None,
        note: None,
    };
    let tx = f.service.submit_withdrawal(&request).await.unwrap();
    let tx = f.service.accept_withdrawal(&tx.id).await.unwrap();
    f.orchestrator.run(&tx.id, false, 0).await.unwrap();

    // The deadline is still a minute out; a premature retry job must
    // not claim the row
    f.orchestrator.run(&tx.id, true, 0).await.unwrap();

    let current = f.store.transaction_by_id(&tx.id).await.unwrap().unwrap();
    assert_eq!(current.status, TransactionStatus::Processing);
    assert_eq!(current.attempts, 1);
    assert!(current.tx_hash.is_none());
    assert!(f.chain_rpc.submissions().is_empty());
}

#[tokio::test]
async fn test_wallet_released_when_claim_write_errors() {
    let f = fixture(OnChain);
    f.wallets.add_wallet(wallet("w1"));
    fund_customer(&f, dec!(500)).await;

    let request = SubmitWithdrawalRequest {
        customer_id: "cust_1".to_string(),
        currency: "USDT".to_string(),
        chain: "ETH".to_string(),
        amount: dec!(100),
        to_address: DEST_ADDR.to_string(),
        address_tag: None,
        note: None,
    };
    let tx = f.service.submit_withdrawal(&request).await.unwrap();
    let tx = f.service.accept_withdrawal(&tx.id).await.unwrap();

    // The Accepted -> Processing write errors out mid-claim
    f.store.fail_update_status(1);
    assert!(f.orchestrator.run(&tx.id, false, 0).await.is_err());

    // The lease went back to the pool and nothing was spent
    assert_eq!(f.wallets.leased_count(), 0);
    assert!(f.chain_rpc.submissions().is_empty());
    let current = f.store.transaction_by_id(&tx.id).await.unwrap().unwrap();
    assert_eq!(current.status, TransactionStatus::Accepted);

    // The next pass settles normally
    f.orchestrator.run(&tx.id, false, 1).await.unwrap();
    let current = f.store.transaction_by_id(&tx.id).await.unwrap().unwrap();
    assert_eq!(current.status, TransactionStatus::Processing);
}

#[tokio::test]
async fn test_submission_attempts_exhaust_into_fail() {
    let config = OrchestratorConfig {
        max_attempts: 2,
        ..OrchestratorConfig::default()
    };
    let f = fixture_with(OnChain, config);
    f.wallets.add_wallet(wallet("w1"));
    fund_customer(&f, dec!(500)).await;
    f.chain_rpc.fail_submissions(10);

    let request = SubmitWithdrawalRequest {
        customer_id: "cust_1".to_string(),
        currency: "USDT".to_string(),
        chain: "ETH".to_string(),
        amount: dec!(100),
        to_address: DEST_ADDR.to_string(),
        address_tag: None,
        note: None,
    };
    let tx = f.service.submit_withdrawal(&request).await.unwrap();
    let tx = f.service.accept_withdrawal(&tx.id).await.unwrap();

    f.orchestrator.run(&tx.id, false, 0).await.unwrap();
    make_retry_due(&f, &tx.id).await;
    f.orchestrator.run(&tx.id, true, 0).await.unwrap();

    let current = f.store.transaction_by_id(&tx.id).await.unwrap().unwrap();
    assert_eq!(current.status, TransactionStatus::Fail);
    assert_eq!(current.attempts, 2);
    // The customer balance never moved
    assert_eq!(
        f.store.balance("cust_1", "USDT").await.unwrap(),
        dec!(500)
    );
    // Operators heard about the final failure
    assert!(!f.alerts.withdrawals().is_empty());
}

#[tokio::test]
async fn test_exchange_route_places_order_and_completes_via_callback() {
    let f = fixture(WithdrawRoute::Exchange("krakex".to_string()));
    fund_customer(&f, dec!(500)).await;

    let request = SubmitWithdrawalRequest {
        customer_id: "cust_1".to_string(),
        currency: "USDT".to_string(),
        chain: "ETH".to_string(),
        amount: dec!(100),
        to_address: DEST_ADDR.to_string(),
        address_tag: Some("memo-7".to_string()),
        note: None,
    };
    let tx = f.service.submit_withdrawal(&request).await.unwrap();
    let tx = f.service.accept_withdrawal(&tx.id).await.unwrap();

    f.orchestrator.run(&tx.id, false, 0).await.unwrap();

    let current = f.store.transaction_by_id(&tx.id).await.unwrap().unwrap();
    assert_eq!(current.status, TransactionStatus::Processing);
    let order_ref = current.order_ref.clone().expect("order recorded");

    let orders = f.exchange.orders();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].venue, "krakex");
    assert_eq!(orders[0].remark, tx.id);
    assert_eq!(orders[0].tag.as_deref(), Some("memo-7"));
    // No wallet involvement on the exchange route
    assert_eq!(f.wallets.leased_count(), 0);
    assert!(f.chain_rpc.submissions().is_empty());

    let callback = ExchangeCallbackRequest {
        transaction_id: tx.id.clone(),
        order_ref: Some(order_ref),
        outcome: ExchangeOutcome::Completed,
        tx_hash: None,
        reason: None,
    };
    let settled = f.service.process_exchange_callback(&callback).await.unwrap();
    assert_eq!(settled.status, TransactionStatus::Completed);
    assert_eq!(settled.balance, Some(dec!(399)));
}

#[tokio::test]
async fn test_exchange_callback_rejects_mismatched_order_ref() {
    let f = fixture(WithdrawRoute::Exchange("krakex".to_string()));
    fund_customer(&f, dec!(500)).await;

    let request = SubmitWithdrawalRequest {
        customer_id: "cust_1".to_string(),
        currency: "USDT".to_string(),
        chain: "ETH".to_string(),
        amount: dec!(100),
        to_address: DEST_ADDR.to_string(),
        address_tag: None,
        note: None,
    };
    let tx = f.service.submit_withdrawal(&request).await.unwrap();
    let tx = f.service.accept_withdrawal(&tx.id).await.unwrap();
    f.orchestrator.run(&tx.id, false, 0).await.unwrap();

    let callback = ExchangeCallbackRequest {
        transaction_id: tx.id.clone(),
        order_ref: Some("someone-elses-order".to_string()),
        outcome: ExchangeOutcome::Completed,
        tx_hash: None,
        reason: None,
    };
    assert!(f.service.process_exchange_callback(&callback).await.is_err());

    let current = f.store.transaction_by_id(&tx.id).await.unwrap().unwrap();
    assert_eq!(current.status, TransactionStatus::Processing);
}

#[tokio::test]
async fn test_exchange_rejection_fails_permanently() {
    let f = fixture(WithdrawRoute::Exchange("krakex".to_string()));
    fund_customer(&f, dec!(500)).await;
    f.exchange.set_rejecting(true);

    let request = SubmitWithdrawalRequest {
        customer_id: "cust_1".to_string(),
        currency: "USDT".to_string(),
        chain: "ETH".to_string(),
        amount: dec!(100),
        to_address: DEST_ADDR.to_string(),
        address_tag: None,
        note: None,
    };
    let tx = f.service.submit_withdrawal(&request).await.unwrap();
    let tx = f.service.accept_withdrawal(&tx.id).await.unwrap();

    f.orchestrator.run(&tx.id, false, 0).await.unwrap();

    let current = f.store.transaction_by_id(&tx.id).await.unwrap().unwrap();
    assert_eq!(current.status, TransactionStatus::Fail);
    assert_eq!(f.store.balance("cust_1", "USDT").await.unwrap(), dec!(500));
}

#[tokio::test]
async fn test_watcher_waits_for_required_depth() {
    let f = fixture(OnChain);
    f.wallets.add_wallet(wallet("w1"));
    fund_customer(&f, dec!(500)).await;
    // First two polls see no receipt
    f.chain_rpc.confirm_after(2);

    let request = SubmitWithdrawalRequest {
        customer_id: "cust_1".to_string(),
        currency: "USDT".to_string(),
        chain: "ETH".to_string(),
        amount: dec!(100),
        to_address: DEST_ADDR.to_string(),
        address_tag: None,
        note: None,
    };
    let tx = f.service.submit_withdrawal(&request).await.unwrap();
    let tx = f.service.accept_withdrawal(&tx.id).await.unwrap();
    f.orchestrator.run(&tx.id, false, 0).await.unwrap();
    let hash = f
        .store
        .transaction_by_id(&tx.id)
        .await
        .unwrap()
        .unwrap()
        .tx_hash
        .unwrap();

    f.watcher.poll(&tx.id, &hash, 0).await.unwrap();
    f.watcher.poll(&tx.id, &hash, 1).await.unwrap();
    let current = f.store.transaction_by_id(&tx.id).await.unwrap().unwrap();
    assert_eq!(current.status, TransactionStatus::Processing);
    // Still scheduled for the reaper while pending
    assert!(current.next_attempt_at.is_some());

    f.watcher.poll(&tx.id, &hash, 2).await.unwrap();
    let current = f.store.transaction_by_id(&tx.id).await.unwrap().unwrap();
    assert_eq!(current.status, TransactionStatus::Completed);
}

#[tokio::test]
async fn test_watcher_budget_exhaustion_parks_for_operator() {
    let f = fixture(OnChain);
    f.wallets.add_wallet(wallet("w1"));
    fund_customer(&f, dec!(500)).await;
    // Receipt never appears
    f.chain_rpc.confirm_after(u32::MAX);

    let request = SubmitWithdrawalRequest {
        customer_id: "cust_1".to_string(),
        currency: "USDT".to_string(),
        chain: "ETH".to_string(),
        amount: dec!(100),
        to_address: DEST_ADDR.to_string(),
        address_tag: None,
        note: None,
    };
    let tx = f.service.submit_withdrawal(&request).await.unwrap();
    let tx = f.service.accept_withdrawal(&tx.id).await.unwrap();
    f.orchestrator.run(&tx.id, false, 0).await.unwrap();
    let hash = f
        .store
        .transaction_by_id(&tx.id)
        .await
        .unwrap()
        .unwrap()
        .tx_hash
        .unwrap();

    // Final poll of the budget
    let max_polls = WatcherConfig::default().max_polls;
    f.watcher.poll(&tx.id, &hash, max_polls - 1).await.unwrap();

    let current = f.store.transaction_by_id(&tx.id).await.unwrap().unwrap();
    assert_eq!(current.status, TransactionStatus::Processing);
    // Parked: reaper deadline cleared so only an operator can resume it
    assert!(current.next_attempt_at.is_none());
    assert!(!f.alerts.errors().is_empty());
}

#[tokio::test]
async fn test_reverted_transfer_fails_without_burning_the_poll_budget() {
    let f = fixture(OnChain);
    f.wallets.add_wallet(wallet("w1"));
    fund_customer(&f, dec!(500)).await;

    let request = SubmitWithdrawalRequest {
        customer_id: "cust_1".to_string(),
        currency: "USDT".to_string(),
        chain: "ETH".to_string(),
        amount: dec!(100),
        to_address: DEST_ADDR.to_string(),
        address_tag: None,
        note: None,
    };
    let tx = f.service.submit_withdrawal(&request).await.unwrap();
    let tx = f.service.accept_withdrawal(&tx.id).await.unwrap();
    f.orchestrator.run(&tx.id, false, 0).await.unwrap();
    let hash = f
        .store
        .transaction_by_id(&tx.id)
        .await
        .unwrap()
        .unwrap()
        .tx_hash
        .unwrap();

    // The transfer executed and failed on-chain
    f.chain_rpc.set_reverted(true);
    f.watcher.poll(&tx.id, &hash, 0).await.unwrap();

    let current = f.store.transaction_by_id(&tx.id).await.unwrap().unwrap();
    assert_eq!(current.status, TransactionStatus::Fail);
    // No further polls scheduled for a dead transfer
    assert!(current.next_attempt_at.is_none());
    // The balance never moved and operators were told
    assert_eq!(f.store.balance("cust_1", "USDT").await.unwrap(), dec!(500));
    assert!(!f.alerts.withdrawals().is_empty());
}

#[tokio::test]
async fn test_concurrent_promotions_chain_the_balance() {
    let store = Arc::new(MockLedgerStore::new());
    let a = store
        .insert_staged_deposit(&staged_deposit("0xcc1", dec!(100)))
        .await
        .unwrap();
    let b = store
        .insert_staged_deposit(&staged_deposit("0xcc2", dec!(40)))
        .await
        .unwrap();

    let (ra, rb) = tokio::join!(store.promote_deposit(&a), store.promote_deposit(&b));
    ra.unwrap();
    rb.unwrap();

    // Whichever promotion lost the race read the winner's balance, not
    // the same starting snapshot
    assert_eq!(store.balance("cust_1", "USDT").await.unwrap(), dec!(140));
    let mut befores: Vec<_> = store
        .all_transactions()
        .into_iter()
        .filter(|t| t.status == TransactionStatus::Completed)
        .map(|t| t.balance_before.unwrap())
        .collect();
    befores.sort();
    assert_eq!(befores[0], dec!(0));
    assert!(befores[1] == dec!(40) || befores[1] == dec!(100));
}

#[tokio::test]
async fn test_deposit_promotion_is_idempotent() {
    let f = fixture(OnChain);
    let promoter = DepositPromoter::new(
        f.store.clone(),
        f.alerts.clone(),
        PromoterConfig::default(),
    );

    let staged = f
        .store
        .insert_staged_deposit(&staged_deposit("0xdep1", dec!(250)))
        .await
        .unwrap();
    // Re-observing the same hash stages nothing new
    let again = f
        .store
        .insert_staged_deposit(&staged_deposit("0xdep1", dec!(250)))
        .await
        .unwrap();
    assert_eq!(staged.id, again.id);

    assert_eq!(promoter.run_once().await.unwrap(), 1);
    // Second cycle finds nothing pending and credits nothing
    assert_eq!(promoter.run_once().await.unwrap(), 0);

    let completed: Vec<_> = f
        .store
        .all_transactions()
        .into_iter()
        .filter(|t| t.action == TxAction::Deposit)
        .collect();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].balance, Some(dec!(250)));
    assert_eq!(f.store.balance("cust_1", "USDT").await.unwrap(), dec!(250));
}

#[tokio::test]
async fn test_ledger_balance_chains_through_mixed_activity() {
    let f = fixture(OnChain);
    f.wallets.add_wallet(wallet("w1"));

    // Deposit 300, then 200
    fund_customer(&f, dec!(300)).await;
    fund_customer(&f, dec!(200)).await;
    assert_eq!(f.store.balance("cust_1", "USDT").await.unwrap(), dec!(500));

    // Withdraw 100 with fee 1
    let request = SubmitWithdrawalRequest {
        customer_id: "cust_1".to_string(),
        currency: "USDT".to_string(),
        chain: "ETH".to_string(),
        amount: dec!(100),
        to_address: DEST_ADDR.to_string(),
        address_tag: None,
        note: None,
    };
    let tx = f.service.submit_withdrawal(&request).await.unwrap();
    let tx = f.service.accept_withdrawal(&tx.id).await.unwrap();
    f.orchestrator.run(&tx.id, false, 0).await.unwrap();
    let hash = f
        .store
        .transaction_by_id(&tx.id)
        .await
        .unwrap()
        .unwrap()
        .tx_hash
        .unwrap();
    f.watcher.poll(&tx.id, &hash, 0).await.unwrap();

    let tx = f.store.transaction_by_id(&tx.id).await.unwrap().unwrap();
    assert_eq!(tx.balance_before, Some(dec!(500)));
    assert_eq!(tx.balance, Some(dec!(399)));

    // Every completed row satisfies the balance invariant
    for t in f.store.all_transactions() {
        if t.status == TransactionStatus::Completed {
            let before = t.balance_before.unwrap();
            assert_eq!(t.balance.unwrap(), t.settled_balance(before));
        }
    }
}

#[tokio::test]
async fn test_metadata_gap_reschedules_instead_of_failing() {
    let f = fixture(OnChain);
    f.wallets.add_wallet(wallet("w1"));
    fund_customer(&f, dec!(500)).await;

    let request = SubmitWithdrawalRequest {
        customer_id: "cust_1".to_string(),
        currency: "USDT".to_string(),
        chain: "ETH".to_string(),
        amount: dec!(100),
        to_address: DEST_ADDR.to_string(),
        address_tag: None,
        note: None,
    };
    let tx = f.service.submit_withdrawal(&request).await.unwrap();
    let tx = f.service.accept_withdrawal(&tx.id).await.unwrap();

    // Seed a fresh metadata store with the attr missing to simulate
    // late provisioning
    let bare_metadata = Arc::new(MockMetadataStore::new());
    bare_metadata.add_chain(Blockchain {
        code: "ETH".to_string(),
        rpc_url: "http://localhost:8545".to_string(),
        explorer_url: "https://etherscan.io".to_string(),
        chain_id: 1,
        kind: "evm".to_string(),
        active: true,
    });
    bare_metadata.add_currency(Currency {
        code: "USDT".to_string(),
        name: "Tether USD".to_string(),
        active: true,
    });
    let orchestrator = WithdrawalOrchestrator::new(
        f.store.clone(),
        bare_metadata,
        f.wallets.clone(),
        f.chain_rpc.clone(),
        f.exchange.clone(),
        f.alerts.clone(),
        f.queue.clone(),
        OrchestratorConfig::default(),
    );

    orchestrator.run(&tx.id, false, 0).await.unwrap();
    let current = f.store.transaction_by_id(&tx.id).await.unwrap().unwrap();
    // Not failed, not submitted; waiting on provisioning
    assert_eq!(current.status, TransactionStatus::Accepted);
    assert!(current.next_attempt_at.is_some());
    assert!(f.chain_rpc.submissions().is_empty());
}

#[tokio::test]
async fn test_wallet_lease_is_exclusive_under_concurrent_acquires() {
    let pool = Arc::new(MockWalletPool::new());
    pool.add_wallet(wallet("w1"));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move { pool.acquire("ETH").await }));
    }
    let mut leased = Vec::new();
    for handle in handles {
        if let Some(w) = handle.await.unwrap().unwrap() {
            leased.push(w);
        }
    }
    // Exactly one winner for a single wallet
    assert_eq!(leased.len(), 1);
    assert_eq!(pool.leased_count(), 1);

    pool.release(&leased[0].id).await.unwrap();
    assert_eq!(pool.leased_count(), 0);
    assert!(pool.acquire("ETH").await.unwrap().is_some());
}

#[tokio::test]
async fn test_second_withdrawal_settles_after_wallet_release() {
    let f = fixture(OnChain);
    f.wallets.add_wallet(wallet("w1"));
    fund_customer(&f, dec!(500)).await;

    let request = SubmitWithdrawalRequest {
        customer_id: "cust_1".to_string(),
        currency: "USDT".to_string(),
        chain: "ETH".to_string(),
        amount: dec!(50),
        to_address: DEST_ADDR.to_string(),
        address_tag: None,
        note: None,
    };
    let first = f.service.submit_withdrawal(&request).await.unwrap();
    let first = f.service.accept_withdrawal(&first.id).await.unwrap();
    let second = f.service.submit_withdrawal(&request).await.unwrap();
    let second = f.service.accept_withdrawal(&second.id).await.unwrap();

    // The only wallet is mid-submission for the first withdrawal
    let held = f.wallets.acquire("ETH").await.unwrap().unwrap();
    f.orchestrator.run(&second.id, false, 0).await.unwrap();
    let pending = f.store.transaction_by_id(&second.id).await.unwrap().unwrap();
    assert_eq!(pending.status, TransactionStatus::Accepted);

    // First submission finishes and releases; the retry settles
    f.wallets.release(&held.id).await.unwrap();
    f.orchestrator.run(&second.id, false, 1).await.unwrap();
    let settled = f.store.transaction_by_id(&second.id).await.unwrap().unwrap();
    assert_eq!(settled.status, TransactionStatus::Processing);
    assert!(settled.tx_hash.is_some());

    f.orchestrator.run(&first.id, false, 0).await.unwrap();
    let first = f.store.transaction_by_id(&first.id).await.unwrap().unwrap();
    assert_eq!(first.status, TransactionStatus::Processing);
}

#[tokio::test]
async fn test_overdue_scan_matches_reaper_rules() {
    let f = fixture(OnChain);
    fund_customer(&f, dec!(500)).await;

    let request = SubmitWithdrawalRequest {
        customer_id: "cust_1".to_string(),
        currency: "USDT".to_string(),
        chain: "ETH".to_string(),
        amount: dec!(10),
        to_address: DEST_ADDR.to_string(),
        address_tag: None,
        note: None,
    };

    // Accepted with an overdue deadline: picked up
    let overdue = f.service.submit_withdrawal(&request).await.unwrap();
    let overdue = f.service.accept_withdrawal(&overdue.id).await.unwrap();
    f.store
        .record_attempt(&overdue.id, Some(Utc::now() - chrono::Duration::seconds(5)))
        .await
        .unwrap();

    // Accepted with a future deadline: left alone
    let future = f.service.submit_withdrawal(&request).await.unwrap();
    let future = f.service.accept_withdrawal(&future.id).await.unwrap();
    f.store
        .record_attempt(&future.id, Some(Utc::now() + chrono::Duration::seconds(600)))
        .await
        .unwrap();

    let found = f.store.overdue_transactions(10).await.unwrap();
    let ids: Vec<_> = found.iter().map(|t| t.id.as_str()).collect();
    assert!(ids.contains(&overdue.id.as_str()));
    assert!(!ids.contains(&future.id.as_str()));
}
