//! Mock implementations for testing.
//!
//! The mocks keep the real contracts: status writes are conditional,
//! wallet claims are exclusive, and promotion is idempotent by hash, so
//! concurrency tests exercise the same semantics as the database.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::domain::{
    AlertSink, AppError, Blockchain, ChainError, ChainRpcClient, ChainTransfer, ChainWallet,
    Currency, CurrencyAttr, DatabaseError, ExchangeClient, ExchangeError, ExchangeWithdrawal,
    LedgerStore, MetadataStore, Promotion, StagedDeposit, StagingStatus, StatusWrite,
    SubmitWithdrawalRequest, Transaction, TransactionStatus, TxAction, TxUpdate, WalletPool,
};

/// Configuration for mock behavior
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    pub should_fail: bool,
    pub error_message: Option<String>,
}

impl MockConfig {
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            should_fail: true,
            error_message: Some(message.into()),
        }
    }
}

/// Mock ledger store for testing
pub struct MockLedgerStore {
    transactions: Arc<Mutex<HashMap<String, Transaction>>>,
    staged: Arc<Mutex<HashMap<String, StagedDeposit>>>,
    config: MockConfig,
    is_healthy: AtomicBool,
    update_status_failures: AtomicU32,
}

impl MockLedgerStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            transactions: Arc::new(Mutex::new(HashMap::new())),
            staged: Arc::new(Mutex::new(HashMap::new())),
            config,
            is_healthy: AtomicBool::new(true),
            update_status_failures: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    /// Make the next `count` calls to `update_status` fail with a
    /// connection error.
    pub fn fail_update_status(&self, count: u32) {
        self.update_status_failures.store(count, Ordering::Relaxed);
    }

    /// Seed a transaction directly (for testing)
    pub fn insert_transaction(&self, transaction: Transaction) {
        self.transactions
            .lock()
            .unwrap()
            .insert(transaction.id.clone(), transaction);
    }

    /// Get all stored transactions (for testing)
    pub fn all_transactions(&self) -> Vec<Transaction> {
        self.transactions.lock().unwrap().values().cloned().collect()
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            let msg = self
                .config
                .error_message
                .clone()
                .unwrap_or_else(|| "Mock error".to_string());
            return Err(AppError::Database(DatabaseError::Query(msg)));
        }
        Ok(())
    }

    /// Latest completed balance for (customer, currency), zero when none.
    fn current_balance(
        transactions: &HashMap<String, Transaction>,
        customer_id: &str,
        currency: &str,
    ) -> Decimal {
        transactions
            .values()
            .filter(|t| {
                t.customer_id == customer_id
                    && t.currency == currency
                    && t.status == TransactionStatus::Completed
                    && t.balance.is_some()
            })
            .max_by_key(|t| (t.updated_at, t.id.clone()))
            .and_then(|t| t.balance)
            .unwrap_or(Decimal::ZERO)
    }
}

impl Default for MockLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for MockLedgerStore {
    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Database(DatabaseError::Connection(
                "Unhealthy".to_string(),
            )));
        }
        self.check_should_fail()
    }

    async fn transaction_by_id(&self, id: &str) -> Result<Option<Transaction>, AppError> {
        self.check_should_fail()?;
        Ok(self.transactions.lock().unwrap().get(id).cloned())
    }

    async fn insert_withdrawal(
        &self,
        request: &SubmitWithdrawalRequest,
        fee: Decimal,
    ) -> Result<Transaction, AppError> {
        self.check_should_fail()?;
        let now = Utc::now();
        let transaction = Transaction {
            id: Uuid::new_v4().to_string(),
            customer_id: request.customer_id.clone(),
            currency: request.currency.clone(),
            chain: request.chain.clone(),
            action: TxAction::Withdraw,
            amount: request.amount,
            fee,
            balance: None,
            balance_before: None,
            from_address: None,
            to_address: Some(request.to_address.clone()),
            address_tag: request.address_tag.clone(),
            order_ref: None,
            note: request.note.clone(),
            tx_hash: None,
            explorer_link: None,
            status: TransactionStatus::Created,
            attempts: 0,
            next_attempt_at: None,
            created_at: now,
            updated_at: now,
        };
        self.transactions
            .lock()
            .unwrap()
            .insert(transaction.id.clone(), transaction.clone());
        Ok(transaction)
    }

    async fn update_status(
        &self,
        id: &str,
        expected: TransactionStatus,
        new: TransactionStatus,
        fields: &TxUpdate,
    ) -> Result<StatusWrite, AppError> {
        self.check_should_fail()?;
        if self
            .update_status_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AppError::Database(DatabaseError::Connection(
                "Connection reset".to_string(),
            )));
        }
        let mut transactions = self.transactions.lock().unwrap();
        let Some(tx) = transactions.get_mut(id) else {
            return Ok(StatusWrite::Conflict);
        };
        if tx.status != expected {
            return Ok(StatusWrite::Conflict);
        }
        tx.status = new;
        if let Some(tx_hash) = &fields.tx_hash {
            tx.tx_hash = Some(tx_hash.clone());
        }
        if let Some(order_ref) = &fields.order_ref {
            tx.order_ref = Some(order_ref.clone());
        }
        if let Some(link) = &fields.explorer_link {
            tx.explorer_link = Some(link.clone());
        }
        if let Some(note) = &fields.note {
            tx.note = Some(note.clone());
        }
        if let Some(next) = fields.next_attempt_at {
            tx.next_attempt_at = next;
        }
        tx.updated_at = Utc::now();
        Ok(StatusWrite::Applied)
    }

    async fn complete_withdrawal(
        &self,
        id: &str,
        tx_hash: Option<&str>,
        explorer_link: Option<&str>,
    ) -> Result<StatusWrite, AppError> {
        self.check_should_fail()?;
        let mut transactions = self.transactions.lock().unwrap();
        let Some(snapshot) = transactions.get(id).cloned() else {
            return Ok(StatusWrite::Conflict);
        };
        if snapshot.status != TransactionStatus::Processing {
            return Ok(StatusWrite::Conflict);
        }
        let before = Self::current_balance(&transactions, &snapshot.customer_id, &snapshot.currency);
        let tx = transactions.get_mut(id).expect("snapshot exists");
        tx.status = TransactionStatus::Completed;
        tx.balance_before = Some(before);
        tx.balance = Some(before - tx.amount - tx.fee);
        if let Some(hash) = tx_hash {
            tx.tx_hash = Some(hash.to_string());
        }
        if let Some(link) = explorer_link {
            tx.explorer_link = Some(link.to_string());
        }
        tx.next_attempt_at = None;
        tx.updated_at = Utc::now();
        Ok(StatusWrite::Applied)
    }

    async fn fail_transaction(&self, id: &str, reason: &str) -> Result<(), AppError> {
        self.check_should_fail()?;
        let mut transactions = self.transactions.lock().unwrap();
        if let Some(tx) = transactions.get_mut(id) {
            if !tx.status.is_terminal() {
                tx.status = TransactionStatus::Fail;
                tx.note = Some(reason.to_string());
                tx.next_attempt_at = None;
                tx.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn cancel_transaction(&self, id: &str) -> Result<StatusWrite, AppError> {
        self.check_should_fail()?;
        let mut transactions = self.transactions.lock().unwrap();
        let Some(tx) = transactions.get_mut(id) else {
            return Ok(StatusWrite::Conflict);
        };
        if !matches!(
            tx.status,
            TransactionStatus::Created | TransactionStatus::Accepted
        ) {
            return Ok(StatusWrite::Conflict);
        }
        tx.status = TransactionStatus::Canceled;
        tx.updated_at = Utc::now();
        Ok(StatusWrite::Applied)
    }

    async fn record_attempt(
        &self,
        id: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<i32, AppError> {
        self.check_should_fail()?;
        let mut transactions = self.transactions.lock().unwrap();
        let tx = transactions
            .get_mut(id)
            .ok_or_else(|| AppError::Database(DatabaseError::NotFound(id.to_string())))?;
        tx.attempts += 1;
        tx.next_attempt_at = next_attempt_at;
        tx.updated_at = Utc::now();
        Ok(tx.attempts)
    }

    async fn claim_retry(
        &self,
        id: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<StatusWrite, AppError> {
        self.check_should_fail()?;
        let mut transactions = self.transactions.lock().unwrap();
        let Some(tx) = transactions.get_mut(id) else {
            return Ok(StatusWrite::Conflict);
        };
        let due = match tx.next_attempt_at {
            Some(due) => due <= Utc::now(),
            None => false,
        };
        if tx.status != TransactionStatus::Processing || tx.tx_hash.is_some() || !due {
            return Ok(StatusWrite::Conflict);
        }
        tx.next_attempt_at = Some(next_attempt_at);
        tx.updated_at = Utc::now();
        Ok(StatusWrite::Applied)
    }

    async fn balance(&self, customer_id: &str, currency: &str) -> Result<Decimal, AppError> {
        self.check_should_fail()?;
        let transactions = self.transactions.lock().unwrap();
        Ok(Self::current_balance(&transactions, customer_id, currency))
    }

    async fn withdrawn_since(
        &self,
        customer_id: &str,
        currency: &str,
        since: DateTime<Utc>,
    ) -> Result<Decimal, AppError> {
        self.check_should_fail()?;
        let transactions = self.transactions.lock().unwrap();
        Ok(transactions
            .values()
            .filter(|t| {
                t.customer_id == customer_id
                    && t.currency == currency
                    && t.action == TxAction::Withdraw
                    && t.status != TransactionStatus::Canceled
                    && t.status != TransactionStatus::Fail
                    && t.created_at >= since
            })
            .map(|t| t.amount)
            .sum())
    }

    async fn overdue_transactions(&self, limit: i64) -> Result<Vec<Transaction>, AppError> {
        self.check_should_fail()?;
        let now = Utc::now();
        let stale_cutoff = now - Duration::seconds(300);
        let transactions = self.transactions.lock().unwrap();
        let mut overdue: Vec<Transaction> = transactions
            .values()
            .filter(|t| match (t.status, t.next_attempt_at) {
                (TransactionStatus::Accepted, Some(due)) => due <= now,
                (TransactionStatus::Accepted, None) => t.updated_at <= stale_cutoff,
                (TransactionStatus::Processing, Some(due)) => due <= now,
                _ => false,
            })
            .cloned()
            .collect();
        overdue.sort_by_key(|t| t.updated_at);
        overdue.truncate(limit as usize);
        Ok(overdue)
    }

    async fn insert_staged_deposit(
        &self,
        staged: &StagedDeposit,
    ) -> Result<StagedDeposit, AppError> {
        self.check_should_fail()?;
        let mut map = self.staged.lock().unwrap();
        if let Some(existing) = map.values().find(|s| s.tx_hash == staged.tx_hash) {
            return Ok(existing.clone());
        }
        map.insert(staged.id.clone(), staged.clone());
        Ok(staged.clone())
    }

    async fn staged_deposits(&self, limit: i64) -> Result<Vec<StagedDeposit>, AppError> {
        self.check_should_fail()?;
        let map = self.staged.lock().unwrap();
        let mut pending: Vec<StagedDeposit> = map
            .values()
            .filter(|s| s.status == StagingStatus::Created)
            .cloned()
            .collect();
        pending.sort_by_key(|s| s.created_at);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn promote_deposit(&self, staged: &StagedDeposit) -> Result<Promotion, AppError> {
        self.check_should_fail()?;
        let mut transactions = self.transactions.lock().unwrap();
        let mut staging = self.staged.lock().unwrap();

        let already = transactions
            .values()
            .any(|t| t.tx_hash.as_deref() == Some(staged.tx_hash.as_str()));
        if let Some(record) = staging.get_mut(&staged.id) {
            record.status = StagingStatus::Accepted;
            record.updated_at = Utc::now();
        }
        if already {
            return Ok(Promotion::AlreadyPromoted);
        }

        let before =
            Self::current_balance(&transactions, &staged.customer_id, &staged.currency);
        let now = Utc::now();
        let transaction = Transaction {
            id: Uuid::new_v4().to_string(),
            customer_id: staged.customer_id.clone(),
            currency: staged.currency.clone(),
            chain: staged.chain.clone(),
            action: TxAction::Deposit,
            amount: staged.amount,
            fee: staged.fee,
            balance: Some(before + staged.amount - staged.fee),
            balance_before: Some(before),
            from_address: staged.from_address.clone(),
            to_address: staged.to_address.clone(),
            address_tag: None,
            order_ref: None,
            note: None,
            tx_hash: Some(staged.tx_hash.clone()),
            explorer_link: None,
            status: TransactionStatus::Completed,
            attempts: 0,
            next_attempt_at: None,
            created_at: now,
            updated_at: now,
        };
        transactions.insert(transaction.id.clone(), transaction.clone());
        Ok(Promotion::Promoted(transaction))
    }
}

/// Mock metadata store backed by in-memory maps
pub struct MockMetadataStore {
    chains: Mutex<HashMap<String, Blockchain>>,
    currencies: Mutex<HashMap<String, Currency>>,
    attrs: Mutex<HashMap<(String, String), CurrencyAttr>>,
}

impl MockMetadataStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            chains: Mutex::new(HashMap::new()),
            currencies: Mutex::new(HashMap::new()),
            attrs: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_chain(&self, chain: Blockchain) {
        self.chains.lock().unwrap().insert(chain.code.clone(), chain);
    }

    pub fn add_currency(&self, currency: Currency) {
        self.currencies
            .lock()
            .unwrap()
            .insert(currency.code.clone(), currency);
    }

    pub fn add_attr(&self, attr: CurrencyAttr) {
        self.attrs
            .lock()
            .unwrap()
            .insert((attr.currency.clone(), attr.chain.clone()), attr);
    }
}

impl Default for MockMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for MockMetadataStore {
    async fn chain_by_code(&self, code: &str) -> Result<Option<Blockchain>, AppError> {
        Ok(self.chains.lock().unwrap().get(code).cloned())
    }

    async fn currency_by_code(&self, code: &str) -> Result<Option<Currency>, AppError> {
        Ok(self.currencies.lock().unwrap().get(code).cloned())
    }

    async fn currency_attr(
        &self,
        currency: &str,
        chain: &str,
    ) -> Result<Option<CurrencyAttr>, AppError> {
        Ok(self
            .attrs
            .lock()
            .unwrap()
            .get(&(currency.to_string(), chain.to_string()))
            .cloned())
    }
}

/// Mock wallet pool with exclusive in-memory leases
pub struct MockWalletPool {
    wallets: Mutex<Vec<ChainWallet>>,
}

impl MockWalletPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            wallets: Mutex::new(Vec::new()),
        }
    }

    pub fn add_wallet(&self, wallet: ChainWallet) {
        self.wallets.lock().unwrap().push(wallet);
    }

    /// Flip a wallet's active flag (simulates admin action)
    pub fn set_active(&self, wallet_id: &str, active: bool) {
        let mut wallets = self.wallets.lock().unwrap();
        if let Some(wallet) = wallets.iter_mut().find(|w| w.id == wallet_id) {
            wallet.active = active;
        }
    }

    /// Number of currently leased wallets (for testing)
    pub fn leased_count(&self) -> usize {
        self.wallets.lock().unwrap().iter().filter(|w| w.in_use).count()
    }
}

impl Default for MockWalletPool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WalletPool for MockWalletPool {
    async fn acquire(&self, chain: &str) -> Result<Option<ChainWallet>, AppError> {
        let mut wallets = self.wallets.lock().unwrap();
        match wallets
            .iter_mut()
            .find(|w| w.chain == chain && w.active && !w.in_use)
        {
            Some(wallet) => {
                wallet.in_use = true;
                Ok(Some(wallet.clone()))
            }
            None => Ok(None),
        }
    }

    async fn release(&self, wallet_id: &str) -> Result<(), AppError> {
        let mut wallets = self.wallets.lock().unwrap();
        if let Some(wallet) = wallets.iter_mut().find(|w| w.id == wallet_id) {
            wallet.in_use = false;
        }
        Ok(())
    }
}

/// Mock chain RPC client with scripted confirmation progression
pub struct MockChainRpc {
    /// Submissions observed: (chain, to_address, base units)
    submissions: Mutex<Vec<(String, String, u128)>>,
    /// Fail this many submissions before succeeding
    submission_failures: AtomicU32,
    /// Polls before a receipt appears
    confirm_after: AtomicU32,
    polls: AtomicU32,
    /// Depth reported once the receipt appears
    depth: AtomicU64,
    /// When set, confirmation polls report the transfer as reverted
    reverted: AtomicBool,
    next_hash: AtomicU64,
}

impl MockChainRpc {
    #[must_use]
    pub fn new() -> Self {
        Self {
            submissions: Mutex::new(Vec::new()),
            submission_failures: AtomicU32::new(0),
            confirm_after: AtomicU32::new(0),
            polls: AtomicU32::new(0),
            depth: AtomicU64::new(12),
            reverted: AtomicBool::new(false),
            next_hash: AtomicU64::new(1),
        }
    }

    /// Fail the next `count` submissions with a transient error
    pub fn fail_submissions(&self, count: u32) {
        self.submission_failures.store(count, Ordering::Relaxed);
    }

    /// Require `count` polls before a receipt appears
    pub fn confirm_after(&self, count: u32) {
        self.confirm_after.store(count, Ordering::Relaxed);
    }

    /// Depth reported once a receipt appears
    pub fn set_depth(&self, depth: u64) {
        self.depth.store(depth, Ordering::Relaxed);
    }

    /// Report the transfer as reverted on the next confirmation poll
    pub fn set_reverted(&self, reverted: bool) {
        self.reverted.store(reverted, Ordering::Relaxed);
    }

    /// Submissions observed so far (for testing)
    pub fn submissions(&self) -> Vec<(String, String, u128)> {
        self.submissions.lock().unwrap().clone()
    }
}

impl Default for MockChainRpc {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainRpcClient for MockChainRpc {
    async fn health_check(&self, _chain: &Blockchain) -> Result<(), AppError> {
        Ok(())
    }

    async fn send_transfer(
        &self,
        chain: &Blockchain,
        transfer: &ChainTransfer<'_>,
    ) -> Result<String, AppError> {
        let remaining = self.submission_failures.load(Ordering::Relaxed);
        if remaining > 0 {
            self.submission_failures
                .store(remaining - 1, Ordering::Relaxed);
            return Err(AppError::Chain(ChainError::Submission(
                "Mock submission failure".to_string(),
            )));
        }
        self.submissions.lock().unwrap().push((
            chain.code.clone(),
            transfer.to_address.to_string(),
            transfer.amount_base_units,
        ));
        let n = self.next_hash.fetch_add(1, Ordering::Relaxed);
        Ok(format!("0xhash{:04}", n))
    }

    async fn confirmations(
        &self,
        _chain: &Blockchain,
        _tx_hash: &str,
    ) -> Result<Option<u64>, AppError> {
        let poll = self.polls.fetch_add(1, Ordering::Relaxed) + 1;
        if self.reverted.load(Ordering::Relaxed) {
            return Err(AppError::Chain(ChainError::Reverted(
                "Mock execution failure".to_string(),
            )));
        }
        if poll <= self.confirm_after.load(Ordering::Relaxed) {
            return Ok(None);
        }
        Ok(Some(self.depth.load(Ordering::Relaxed)))
    }
}

/// Mock exchange client recording withdrawal orders
pub struct MockExchange {
    orders: Mutex<Vec<ExchangeWithdrawal>>,
    should_fail: AtomicBool,
    reject: AtomicBool,
}

impl MockExchange {
    #[must_use]
    pub fn new() -> Self {
        Self {
            orders: Mutex::new(Vec::new()),
            should_fail: AtomicBool::new(false),
            reject: AtomicBool::new(false),
        }
    }

    /// Make subsequent withdrawals fail with a transient error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.should_fail.store(unavailable, Ordering::Relaxed);
    }

    /// Make subsequent withdrawals fail with a permanent rejection
    pub fn set_rejecting(&self, rejecting: bool) {
        self.reject.store(rejecting, Ordering::Relaxed);
    }

    /// Orders placed so far (for testing)
    pub fn orders(&self) -> Vec<ExchangeWithdrawal> {
        self.orders.lock().unwrap().clone()
    }
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn withdraw(&self, request: &ExchangeWithdrawal) -> Result<String, AppError> {
        if self.should_fail.load(Ordering::Relaxed) {
            return Err(AppError::Exchange(ExchangeError::Unavailable(
                "Mock exchange down".to_string(),
            )));
        }
        if self.reject.load(Ordering::Relaxed) {
            return Err(AppError::Exchange(ExchangeError::Rejected(
                "Mock rejection".to_string(),
            )));
        }
        let mut orders = self.orders.lock().unwrap();
        orders.push(request.clone());
        Ok(format!("order-{}", orders.len()))
    }
}

/// Alert sink recording messages for assertions
pub struct RecordingAlertSink {
    errors: Mutex<Vec<String>>,
    withdrawals: Mutex<Vec<String>>,
}

impl RecordingAlertSink {
    #[must_use]
    pub fn new() -> Self {
        Self {
            errors: Mutex::new(Vec::new()),
            withdrawals: Mutex::new(Vec::new()),
        }
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    pub fn withdrawals(&self) -> Vec<String> {
        self.withdrawals.lock().unwrap().clone()
    }
}

impl Default for RecordingAlertSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }

    async fn withdrawal(&self, message: &str) {
        self.withdrawals.lock().unwrap().push(message.to_string());
    }
}
