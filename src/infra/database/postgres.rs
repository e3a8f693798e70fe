//! PostgreSQL persistence implementation.
//!
//! All state transitions are single-statement conditional writes so
//! concurrent workers can never double-settle a transaction, and the
//! wallet claim uses `FOR UPDATE SKIP LOCKED` so concurrent claims get
//! distinct wallets or none.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use secrecy::SecretString;
use sqlx::{PgPool, Row, postgres::PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::domain::{
    AppError, ChainWallet, Currency, CurrencyAttr, DatabaseError, LedgerStore, MetadataStore,
    Promotion, StagedDeposit, StagingStatus, StatusWrite, SubmitWithdrawalRequest, Transaction,
    TransactionStatus, TxAction, TxUpdate, WalletPool, WithdrawRoute,
};

/// Accepted rows with no schedule are considered lost after this long
/// without an update (crash between status write and enqueue).
const ACCEPTED_STALE_SECS: i64 = 300;

const TRANSACTION_COLUMNS: &str = r#"
    id, customer_id, currency, chain, action, amount, fee,
    balance, balance_before, from_address, to_address, address_tag,
    order_ref, note, tx_hash, explorer_link, status, attempts,
    next_attempt_at, created_at, updated_at
"#;

/// PostgreSQL connection pool configuration
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

/// PostgreSQL store with connection pooling
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with custom configuration
    pub async fn new(database_url: &str, config: PostgresConfig) -> Result<Self, AppError> {
        info!("Connecting to PostgreSQL...");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(database_url)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a new PostgreSQL store with default configuration
    pub async fn with_defaults(database_url: &str) -> Result<Self, AppError> {
        Self::new(database_url, PostgresConfig::default()).await
    }

    /// Run database migrations using sqlx migrate
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Migration(e.to_string())))?;
        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying connection pool (for testing)
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Parse a database row into a Transaction
    fn row_to_transaction(row: &sqlx::postgres::PgRow) -> Result<Transaction, AppError> {
        let status_str: String = row.get("status");
        let action_str: String = row.get("action");

        Ok(Transaction {
            id: row.get("id"),
            customer_id: row.get("customer_id"),
            currency: row.get("currency"),
            chain: row.get("chain"),
            action: action_str
                .parse()
                .map_err(|e: String| AppError::Database(DatabaseError::Query(e)))?,
            amount: row.get("amount"),
            fee: row.get("fee"),
            balance: row.get("balance"),
            balance_before: row.get("balance_before"),
            from_address: row.get("from_address"),
            to_address: row.get("to_address"),
            address_tag: row.get("address_tag"),
            order_ref: row.get("order_ref"),
            note: row.get("note"),
            tx_hash: row.get("tx_hash"),
            explorer_link: row.get("explorer_link"),
            status: status_str.parse().unwrap_or(TransactionStatus::Created),
            attempts: row.get("attempts"),
            next_attempt_at: row.get("next_attempt_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    /// Parse a database row into a StagedDeposit
    fn row_to_staged_deposit(row: &sqlx::postgres::PgRow) -> Result<StagedDeposit, AppError> {
        let status_str: String = row.get("status");
        let action_str: String = row.get("action");

        Ok(StagedDeposit {
            id: row.get("id"),
            customer_id: row.get("customer_id"),
            currency: row.get("currency"),
            chain: row.get("chain"),
            action: action_str
                .parse()
                .map_err(|e: String| AppError::Database(DatabaseError::Query(e)))?,
            amount: row.get("amount"),
            fee: row.get("fee"),
            from_address: row.get("from_address"),
            to_address: row.get("to_address"),
            tx_hash: row.get("tx_hash"),
            status: status_str.parse().unwrap_or(StagingStatus::Created),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    /// Serialize balance-chain writers for one (customer, currency)
    /// pair. The lock is transaction-scoped and released on commit or
    /// rollback.
    async fn lock_balance_chain(
        db_tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        customer_id: &str,
        currency: &str,
    ) -> Result<(), AppError> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1), hashtext($2))")
            .bind(customer_id)
            .bind(currency)
            .execute(&mut **db_tx)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PostgresStore {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn transaction_by_id(&self, id: &str) -> Result<Option<Transaction>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_transaction(&row)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, request), fields(customer = %request.customer_id, currency = %request.currency, amount = %request.amount))]
    async fn insert_withdrawal(
        &self,
        request: &SubmitWithdrawalRequest,
        fee: Decimal,
    ) -> Result<Transaction, AppError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO transactions (
                id, customer_id, currency, chain, action, amount, fee,
                to_address, address_tag, note, status, attempts,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&id)
        .bind(&request.customer_id)
        .bind(&request.currency)
        .bind(&request.chain)
        .bind(TxAction::Withdraw.as_str())
        .bind(request.amount)
        .bind(fee)
        .bind(&request.to_address)
        .bind(&request.address_tag)
        .bind(&request.note)
        .bind(TransactionStatus::Created.as_str())
        .bind(0i32)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        Ok(Transaction {
            id,
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
        })
    }

    #[instrument(skip(self, fields))]
    async fn update_status(
        &self,
        id: &str,
        expected: TransactionStatus,
        new: TransactionStatus,
        fields: &TxUpdate,
    ) -> Result<StatusWrite, AppError> {
        // Compare-and-swap: the status predicate and the write are one
        // statement, so a lost race shows up as zero affected rows.
        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET status = $1,
                tx_hash = COALESCE($2, tx_hash),
                order_ref = COALESCE($3, order_ref),
                explorer_link = COALESCE($4, explorer_link),
                note = COALESCE($5, note),
                next_attempt_at = CASE WHEN $6 THEN $7 ELSE next_attempt_at END,
                updated_at = NOW()
            WHERE id = $8 AND status = $9
            "#,
        )
        .bind(new.as_str())
        .bind(&fields.tx_hash)
        .bind(&fields.order_ref)
        .bind(&fields.explorer_link)
        .bind(&fields.note)
        .bind(fields.next_attempt_at.is_some())
        .bind(fields.next_attempt_at.flatten())
        .bind(id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        if result.rows_affected() == 0 {
            Ok(StatusWrite::Conflict)
        } else {
            Ok(StatusWrite::Applied)
        }
    }

    #[instrument(skip(self))]
    async fn complete_withdrawal(
        &self,
        id: &str,
        tx_hash: Option<&str>,
        explorer_link: Option<&str>,
    ) -> Result<StatusWrite, AppError> {
        // The balance snapshot reads the latest completed row for the
        // (customer, currency) and writes the next link in the chain.
        // Concurrent completions and promotions for the same pair must
        // not read the same snapshot, so writers serialize on a
        // transaction-scoped advisory lock keyed on the pair.
        let mut db_tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        let row = sqlx::query(
            r#"SELECT customer_id, currency FROM transactions WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&mut *db_tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        let Some(row) = row else {
            return Ok(StatusWrite::Conflict);
        };
        let customer_id: String = row.get("customer_id");
        let currency: String = row.get("currency");
        Self::lock_balance_chain(&mut db_tx, &customer_id, &currency).await?;

        let result = sqlx::query(
            r#"
            UPDATE transactions t
            SET status = 'completed',
                tx_hash = COALESCE($2, t.tx_hash),
                explorer_link = COALESCE($3, t.explorer_link),
                balance_before = b.current,
                balance = b.current - t.amount - t.fee,
                next_attempt_at = NULL,
                updated_at = NOW()
            FROM (
                SELECT COALESCE((
                    SELECT c.balance
                    FROM transactions c
                    JOIN transactions me ON me.id = $1
                    WHERE c.customer_id = me.customer_id
                      AND c.currency = me.currency
                      AND c.status = 'completed'
                      AND c.balance IS NOT NULL
                    ORDER BY c.updated_at DESC, c.id DESC
                    LIMIT 1
                ), 0) AS current
            ) b
            WHERE t.id = $1 AND t.status = 'processing'
            "#,
        )
        .bind(id)
        .bind(tx_hash)
        .bind(explorer_link)
        .execute(&mut *db_tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        db_tx
            .commit()
            .await
            .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        if result.rows_affected() == 0 {
            Ok(StatusWrite::Conflict)
        } else {
            Ok(StatusWrite::Applied)
        }
    }

    #[instrument(skip(self))]
    async fn fail_transaction(&self, id: &str, reason: &str) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET status = 'fail',
                note = $2,
                next_attempt_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('completed', 'fail', 'canceled')
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        if result.rows_affected() == 0 {
            warn!(id = %id, "Fail requested for a transaction already terminal");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cancel_transaction(&self, id: &str) -> Result<StatusWrite, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET status = 'canceled', updated_at = NOW()
            WHERE id = $1 AND status IN ('created', 'accepted')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        if result.rows_affected() == 0 {
            Ok(StatusWrite::Conflict)
        } else {
            Ok(StatusWrite::Applied)
        }
    }

    #[instrument(skip(self))]
    async fn record_attempt(
        &self,
        id: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<i32, AppError> {
        let row = sqlx::query(
            r#"
            UPDATE transactions
            SET attempts = attempts + 1,
                next_attempt_at = $2,
                updated_at = NOW()
            WHERE id = $1
            RETURNING attempts
            "#,
        )
        .bind(id)
        .bind(next_attempt_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        Ok(row.get("attempts"))
    }

    #[instrument(skip(self))]
    async fn claim_retry(
        &self,
        id: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<StatusWrite, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET next_attempt_at = $2,
                updated_at = NOW()
            WHERE id = $1
              AND status = 'processing'
              AND tx_hash IS NULL
              AND next_attempt_at IS NOT NULL
              AND next_attempt_at <= NOW()
            "#,
        )
        .bind(id)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        if result.rows_affected() == 0 {
            Ok(StatusWrite::Conflict)
        } else {
            Ok(StatusWrite::Applied)
        }
    }

    #[instrument(skip(self))]
    async fn balance(&self, customer_id: &str, currency: &str) -> Result<Decimal, AppError> {
        let row = sqlx::query(
            r#"
            SELECT balance
            FROM transactions
            WHERE customer_id = $1 AND currency = $2
              AND status = 'completed' AND balance IS NOT NULL
            ORDER BY updated_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(customer_id)
        .bind(currency)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        Ok(row
            .map(|r| r.get::<Decimal, _>("balance"))
            .unwrap_or(Decimal::ZERO))
    }

    #[instrument(skip(self))]
    async fn withdrawn_since(
        &self,
        customer_id: &str,
        currency: &str,
        since: DateTime<Utc>,
    ) -> Result<Decimal, AppError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(amount), 0) AS total
            FROM transactions
            WHERE customer_id = $1 AND currency = $2
              AND action = 'withdraw'
              AND status NOT IN ('canceled', 'fail')
              AND created_at >= $3
            "#,
        )
        .bind(customer_id)
        .bind(currency)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        Ok(row.get("total"))
    }

    #[instrument(skip(self))]
    async fn overdue_transactions(&self, limit: i64) -> Result<Vec<Transaction>, AppError> {
        let now = Utc::now();
        // Processing rows with no schedule are waiting on an operator,
        // never the reaper.
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM transactions
            WHERE (status = 'accepted'
                   AND (next_attempt_at <= $1
                        OR (next_attempt_at IS NULL AND updated_at <= $2)))
               OR (status = 'processing' AND next_attempt_at <= $1)
            ORDER BY updated_at ASC
            LIMIT $3
            "#
        ))
        .bind(now)
        .bind(now - chrono::Duration::seconds(ACCEPTED_STALE_SECS))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        rows.iter().map(Self::row_to_transaction).collect()
    }

    #[instrument(skip(self, staged), fields(tx_hash = %staged.tx_hash, customer = %staged.customer_id))]
    async fn insert_staged_deposit(
        &self,
        staged: &StagedDeposit,
    ) -> Result<StagedDeposit, AppError> {
        // Idempotent by hash: re-observing a deposit is a no-op.
        sqlx::query(
            r#"
            INSERT INTO transaction_staging (
                id, customer_id, currency, chain, action, amount, fee,
                from_address, to_address, tx_hash, status,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), NOW())
            ON CONFLICT (tx_hash) DO NOTHING
            "#,
        )
        .bind(&staged.id)
        .bind(&staged.customer_id)
        .bind(&staged.currency)
        .bind(&staged.chain)
        .bind(staged.action.as_str())
        .bind(staged.amount)
        .bind(staged.fee)
        .bind(&staged.from_address)
        .bind(&staged.to_address)
        .bind(&staged.tx_hash)
        .bind(StagingStatus::Created.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        let row = sqlx::query(
            r#"
            SELECT id, customer_id, currency, chain, action, amount, fee,
                   from_address, to_address, tx_hash, status, created_at, updated_at
            FROM transaction_staging
            WHERE tx_hash = $1
            "#,
        )
        .bind(&staged.tx_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        Self::row_to_staged_deposit(&row)
    }

    #[instrument(skip(self))]
    async fn staged_deposits(&self, limit: i64) -> Result<Vec<StagedDeposit>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT id, customer_id, currency, chain, action, amount, fee,
                   from_address, to_address, tx_hash, status, created_at, updated_at
            FROM transaction_staging
            WHERE status = 'created'
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        rows.iter().map(Self::row_to_staged_deposit).collect()
    }

    #[instrument(skip(self, staged), fields(tx_hash = %staged.tx_hash, customer = %staged.customer_id))]
    async fn promote_deposit(&self, staged: &StagedDeposit) -> Result<Promotion, AppError> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut db_tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;

        // Same advisory lock as withdrawal completion: the inline
        // balance subquery must not race another writer on this pair.
        Self::lock_balance_chain(&mut db_tx, &staged.customer_id, &staged.currency).await?;

        // The ledger's unique hash index is the idempotency guard: a
        // second promotion of the same hash inserts nothing.
        let inserted = sqlx::query(
            r#"
            INSERT INTO transactions (
                id, customer_id, currency, chain, action, amount, fee,
                balance_before, balance, from_address, to_address, tx_hash,
                status, attempts, created_at, updated_at
            )
            SELECT $1, $2, $3, $4, 'deposit', $5, $6,
                   b.current, b.current + $5 - $6,
                   $7, $8, $9, 'completed', 0, NOW(), NOW()
            FROM (
                SELECT COALESCE((
                    SELECT balance FROM transactions
                    WHERE customer_id = $2 AND currency = $3
                      AND status = 'completed' AND balance IS NOT NULL
                    ORDER BY updated_at DESC, id DESC
                    LIMIT 1
                ), 0) AS current
            ) b
            ON CONFLICT (tx_hash) WHERE tx_hash IS NOT NULL DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(&staged.customer_id)
        .bind(&staged.currency)
        .bind(&staged.chain)
        .bind(staged.amount)
        .bind(staged.fee)
        .bind(&staged.from_address)
        .bind(&staged.to_address)
        .bind(&staged.tx_hash)
        .execute(&mut *db_tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        sqlx::query(
            r#"
            UPDATE transaction_staging
            SET status = 'accepted', updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(&staged.id)
        .execute(&mut *db_tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        db_tx
            .commit()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        if inserted.rows_affected() == 0 {
            return Ok(Promotion::AlreadyPromoted);
        }

        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1"
        ))
        .bind(&id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        Ok(Promotion::Promoted(Self::row_to_transaction(&row)?))
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    #[instrument(skip(self))]
    async fn chain_by_code(
        &self,
        code: &str,
    ) -> Result<Option<crate::domain::Blockchain>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT code, rpc_url, explorer_url, chain_id, kind, active
            FROM blockchains
            WHERE code = $1
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        Ok(row.map(|row| crate::domain::Blockchain {
            code: row.get("code"),
            rpc_url: row.get("rpc_url"),
            explorer_url: row.get("explorer_url"),
            chain_id: row.get("chain_id"),
            kind: row.get("kind"),
            active: row.get("active"),
        }))
    }

    #[instrument(skip(self))]
    async fn currency_by_code(&self, code: &str) -> Result<Option<Currency>, AppError> {
        let row = sqlx::query("SELECT code, name, active FROM currencies WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        Ok(row.map(|row| Currency {
            code: row.get("code"),
            name: row.get("name"),
            active: row.get("active"),
        }))
    }

    #[instrument(skip(self))]
    async fn currency_attr(
        &self,
        currency: &str,
        chain: &str,
    ) -> Result<Option<CurrencyAttr>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT currency, chain, contract, decimals, route, venue,
                   fee, net_divisor, max_per_tx, daily_limit
            FROM currency_attrs
            WHERE currency = $1 AND chain = $2
            "#,
        )
        .bind(currency)
        .bind(chain)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        match row {
            Some(row) => {
                let route_str: String = row.get("route");
                let venue: Option<String> = row.get("venue");
                let route = WithdrawRoute::from_parts(&route_str, venue.as_deref())
                    .map_err(|e| AppError::Database(DatabaseError::Query(e)))?;
                let decimals: i32 = row.get("decimals");

                Ok(Some(CurrencyAttr {
                    currency: row.get("currency"),
                    chain: row.get("chain"),
                    contract: row.get("contract"),
                    decimals: decimals.max(0) as u32,
                    route,
                    fee: row.get("fee"),
                    net_divisor: row.get("net_divisor"),
                    max_per_tx: row.get("max_per_tx"),
                    daily_limit: row.get("daily_limit"),
                }))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl WalletPool for PostgresStore {
    #[instrument(skip(self))]
    async fn acquire(&self, chain: &str) -> Result<Option<ChainWallet>, AppError> {
        // Claim and lease in one statement; SKIP LOCKED makes concurrent
        // claims pick distinct rows instead of queueing on one.
        let row = sqlx::query(
            r#"
            UPDATE chain_wallets
            SET in_use = TRUE, updated_at = NOW()
            WHERE id = (
                SELECT id FROM chain_wallets
                WHERE chain = $1 AND active = TRUE AND in_use = FALSE
                ORDER BY updated_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, chain, address, private_key, in_use, active
            "#,
        )
        .bind(chain)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        Ok(row.map(|row| ChainWallet {
            id: row.get("id"),
            chain: row.get("chain"),
            address: row.get("address"),
            private_key: SecretString::from(row.get::<String, _>("private_key")),
            in_use: row.get("in_use"),
            active: row.get("active"),
        }))
    }

    #[instrument(skip(self))]
    async fn release(&self, wallet_id: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE chain_wallets
            SET in_use = FALSE, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(wallet_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        Ok(())
    }
}
