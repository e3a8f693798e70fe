//! Domain types with validation support.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

/// Lifecycle status of a ledger transaction.
///
/// Transitions are monotonic forward; `Completed`, `Fail` and `Canceled`
/// are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Initial state, created by a customer-facing request
    #[default]
    Created,
    /// Out-of-band verification passed, eligible for settlement
    Accepted,
    /// Picked up by the orchestrator, submission in flight
    Processing,
    /// Settled and reflected in the ledger balance
    Completed,
    /// Permanently failed after retries were exhausted
    Fail,
    /// Withdrawn by the customer before settlement started
    Canceled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Accepted => "accepted",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Fail => "fail",
            Self::Canceled => "canceled",
        }
    }

    /// Whether no further transition is permitted.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Fail | Self::Canceled)
    }

    /// Forward-only transition guard.
    ///
    /// `Canceled` is reachable from `Created`/`Accepted` only; once
    /// `Processing`, an in-flight submission cannot be un-sent. `Fail`
    /// is reachable from `Accepted` too: a permanent rejection (bad
    /// destination, exchange refusal) can land before any claim.
    #[must_use]
    pub fn can_transition(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Created, Accepted)
                | (Created, Canceled)
                | (Accepted, Processing)
                | (Accepted, Canceled)
                | (Accepted, Fail)
                | (Processing, Completed)
                | (Processing, Fail)
        )
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "accepted" => Ok(Self::Accepted),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "fail" => Ok(Self::Fail),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("Invalid transaction status: {}", s)),
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Direction of value movement recorded by a transaction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TxAction {
    Deposit,
    Withdraw,
}

impl TxAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdraw => "withdraw",
        }
    }

    /// Amount with the sign the ledger applies to the balance.
    #[must_use]
    pub fn signed_amount(&self, amount: Decimal) -> Decimal {
        match self {
            Self::Deposit => amount,
            Self::Withdraw => -amount,
        }
    }
}

impl std::str::FromStr for TxAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(Self::Deposit),
            "withdraw" => Ok(Self::Withdraw),
            _ => Err(format!("Invalid transaction action: {}", s)),
        }
    }
}

impl std::fmt::Display for TxAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ledger transaction: the append-oriented record of value movement and
/// the source of truth for balances.
///
/// Invariant: whenever `status == Completed`,
/// `balance == balance_before + action.signed_amount(amount) - fee`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct Transaction {
    /// Unique identifier (UUID)
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub id: String,
    /// Owning customer reference
    pub customer_id: String,
    /// Currency code (e.g. "USDT")
    pub currency: String,
    /// Chain code (e.g. "ETH", "BSC")
    pub chain: String,
    pub action: TxAction,
    /// Requested amount, in display units
    pub amount: Decimal,
    /// Platform fee charged on top of the amount
    pub fee: Decimal,
    /// Ledger balance after completion (written only by completion/promotion)
    pub balance: Option<Decimal>,
    /// Ledger balance before completion
    pub balance_before: Option<Decimal>,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    /// Destination memo/tag for chains and exchanges that require one
    pub address_tag: Option<String>,
    /// Exchange order reference for exchange-routed withdrawals
    pub order_ref: Option<String>,
    pub note: Option<String>,
    /// On-chain transaction hash; unique, doubles as the deposit
    /// promotion idempotency key
    pub tx_hash: Option<String>,
    pub explorer_link: Option<String>,
    pub status: TransactionStatus,
    /// Number of failed settlement attempts
    pub attempts: i32,
    /// When the next scheduled attempt (or confirmation check) is due
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Balance the ledger must record when this transaction completes.
    #[must_use]
    pub fn settled_balance(&self, balance_before: Decimal) -> Decimal {
        balance_before + self.action.signed_amount(self.amount) - self.fee
    }
}

/// Status of a staged deposit observation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StagingStatus {
    /// Observed on-chain, not yet promoted
    #[default]
    Created,
    /// Promoted into the ledger (or found already promoted)
    Accepted,
}

impl StagingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Accepted => "accepted",
        }
    }
}

impl std::str::FromStr for StagingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "accepted" => Ok(Self::Accepted),
            _ => Err(format!("Invalid staging status: {}", s)),
        }
    }
}

impl std::fmt::Display for StagingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Provisional deposit observation awaiting promotion into the ledger.
///
/// Keyed by `tx_hash`; promotion is at-most-once under the ledger's
/// uniqueness constraint on the same hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct StagedDeposit {
    pub id: String,
    pub customer_id: String,
    pub currency: String,
    pub chain: String,
    pub action: TxAction,
    pub amount: Decimal,
    pub fee: Decimal,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    /// On-chain transaction hash; the promotion idempotency key
    pub tx_hash: String,
    pub status: StagingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Hot wallet shared by withdrawals on one chain.
///
/// At any instant at most one in-flight withdrawal holds `in_use = true`;
/// the flag must be cleared on every exit path or the pool starves.
#[derive(Debug, Clone)]
pub struct ChainWallet {
    pub id: String,
    pub chain: String,
    pub address: String,
    /// Key material; handed to the chain RPC collaborator, never logged
    pub private_key: SecretString,
    pub in_use: bool,
    pub active: bool,
}

/// Chain metadata, admin-provisioned and read-only to the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct Blockchain {
    /// Chain code (e.g. "ETH")
    pub code: String,
    pub rpc_url: String,
    pub explorer_url: String,
    /// Numeric chain id (e.g. 1 for Ethereum mainnet)
    pub chain_id: i64,
    /// Family tag (e.g. "evm")
    pub kind: String,
    pub active: bool,
}

impl Blockchain {
    /// Explorer deep-link for a transaction hash.
    #[must_use]
    pub fn explorer_tx_link(&self, tx_hash: &str) -> String {
        format!("{}/tx/{}", self.explorer_url.trim_end_matches('/'), tx_hash)
    }
}

/// Currency metadata, admin-provisioned and read-only to the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct Currency {
    pub code: String,
    pub name: String,
    pub active: bool,
}

/// How withdrawals of a (currency, chain) pair are settled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case", tag = "type", content = "venue")]
pub enum WithdrawRoute {
    /// Direct signed submission to the chain
    OnChain,
    /// Delegated to a named custodial exchange withdrawal API
    Exchange(String),
}

impl WithdrawRoute {
    /// Reassemble from the two persisted columns.
    pub fn from_parts(route: &str, venue: Option<&str>) -> Result<Self, String> {
        match route {
            "on_chain" => Ok(Self::OnChain),
            "exchange" => venue
                .map(|v| Self::Exchange(v.to_string()))
                .ok_or_else(|| "exchange route requires a venue".to_string()),
            _ => Err(format!("Invalid withdraw route: {}", route)),
        }
    }

    /// The (route, venue) column pair this serializes to.
    #[must_use]
    pub fn to_parts(&self) -> (&'static str, Option<&str>) {
        match self {
            Self::OnChain => ("on_chain", None),
            Self::Exchange(venue) => ("exchange", Some(venue)),
        }
    }
}

/// Per (currency, chain) settlement attributes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct CurrencyAttr {
    pub currency: String,
    pub chain: String,
    /// Token contract address; `None` for the chain's native asset
    pub contract: Option<String>,
    /// Decimal places of the asset's base unit
    pub decimals: u32,
    pub route: WithdrawRoute,
    /// Flat withdrawal fee, in display units
    pub fee: Decimal,
    /// Data-driven payout adjustment: when set, the on-chain payout is
    /// `amount / net_divisor`. Replaces per-asset special cases.
    pub net_divisor: Option<Decimal>,
    /// Per-transaction withdrawal cap
    pub max_per_tx: Option<Decimal>,
    /// Rolling daily withdrawal cap
    pub daily_limit: Option<Decimal>,
}

impl CurrencyAttr {
    /// On-chain payout for a requested amount, after the optional
    /// net-of-fee divisor.
    #[must_use]
    pub fn payout_amount(&self, amount: Decimal) -> Decimal {
        match self.net_divisor {
            Some(divisor) if !divisor.is_zero() => amount / divisor,
            _ => amount,
        }
    }
}

/// Request to create a withdrawal transaction (status `Created`).
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct SubmitWithdrawalRequest {
    #[validate(length(min = 1, message = "Customer id is required"))]
    pub customer_id: String,
    #[validate(length(min = 1, message = "Currency code is required"))]
    #[schema(example = "USDT")]
    pub currency: String,
    #[validate(length(min = 1, message = "Chain code is required"))]
    #[schema(example = "ETH")]
    pub chain: String,
    /// Amount in display units; must be positive
    pub amount: Decimal,
    #[validate(length(min = 1, message = "Destination address is required"))]
    pub to_address: String,
    pub address_tag: Option<String>,
    pub note: Option<String>,
}

/// Settlement callback from an exchange venue for an exchange-routed
/// withdrawal.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct ExchangeCallbackRequest {
    /// Ledger transaction id (passed to the venue as the remark)
    #[validate(length(min = 1, message = "Transaction id is required"))]
    pub transaction_id: String,
    /// Venue order reference, cross-checked against the persisted one
    pub order_ref: Option<String>,
    /// Final settlement outcome
    pub outcome: ExchangeOutcome,
    /// On-chain hash when the venue reports one
    pub tx_hash: Option<String>,
    /// Failure reason for `Failed` outcomes
    pub reason: Option<String>,
}

/// Terminal outcome reported by an exchange callback.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeOutcome {
    Completed,
    Failed,
}

/// Ledger balance query result.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BalanceResponse {
    pub customer_id: String,
    pub currency: String,
    pub balance: Decimal,
}

/// Unit of work drained by the settlement worker pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SettlementJob {
    /// Drive a withdrawal transaction toward submission.
    ///
    /// `retry = false` resumes after wallet exhaustion (transaction still
    /// `Accepted`); `retry = true` resumes after a failed submission
    /// (transaction already `Processing`). The distinction keeps retries
    /// from double-submitting one transaction.
    SubmitWithdrawal {
        transaction_id: String,
        retry: bool,
        /// Consecutive wallet/metadata misses, for the alert threshold
        attempts: u32,
    },
    /// Poll a submitted transaction hash until confirmed.
    WatchConfirmation {
        transaction_id: String,
        tx_hash: String,
        polls: u32,
    },
}

/// Health status enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Some systems degraded but functional
    Degraded,
    /// Critical systems unavailable
    Unhealthy,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Overall system status
    pub status: HealthStatus,
    /// Database health status
    pub database: HealthStatus,
    /// Chain RPC health status
    pub chain_rpc: HealthStatus,
    /// Current server timestamp
    pub timestamp: DateTime<Utc>,
    /// Application version
    #[schema(example = "0.1.0")]
    pub version: String,
}

impl HealthResponse {
    #[must_use]
    pub fn new(database: HealthStatus, chain_rpc: HealthStatus) -> Self {
        let status = match (&database, &chain_rpc) {
            (HealthStatus::Healthy, HealthStatus::Healthy) => HealthStatus::Healthy,
            (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            _ => HealthStatus::Degraded,
        };
        Self {
            status,
            database,
            chain_rpc,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Error response structure
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error details
    pub error: ErrorDetail,
}

/// Error detail structure
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    /// Error type identifier
    #[schema(example = "validation_error")]
    pub r#type: String,
    /// Human-readable error message
    pub message: String,
}
