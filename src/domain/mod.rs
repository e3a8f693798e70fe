//! Domain layer containing core business types, traits, and error definitions.

pub mod error;
pub mod traits;
pub mod types;

pub use error::{AppError, ChainError, ConfigError, DatabaseError, ExchangeError, ValidationError};
pub use traits::{
    AlertSink, ChainRpcClient, ChainTransfer, ExchangeClient, ExchangeWithdrawal, LedgerStore,
    MetadataStore, Promotion, StatusWrite, TxUpdate, WalletPool,
};
pub use types::{
    BalanceResponse, Blockchain, ChainWallet, Currency, CurrencyAttr, ErrorDetail, ErrorResponse,
    ExchangeCallbackRequest, ExchangeOutcome, HealthResponse, HealthStatus, SettlementJob,
    StagedDeposit, StagingStatus, SubmitWithdrawalRequest, Transaction, TransactionStatus,
    TxAction, WithdrawRoute,
};
