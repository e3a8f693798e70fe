//! Infrastructure layer implementations.

pub mod alert;
pub mod chain;
pub mod database;
pub mod exchange;

pub use alert::WebhookAlertSink;
pub use chain::{HttpChainRpc, RpcClientConfig};
pub use database::{PostgresConfig, PostgresStore};
pub use exchange::HttpExchangeClient;
