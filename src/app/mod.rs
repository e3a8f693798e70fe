//! Application layer containing business logic and shared state.

pub mod orchestrator;
pub mod promoter;
pub mod queue;
pub mod service;
pub mod state;
pub mod watcher;
pub mod worker;

pub use orchestrator::{OrchestratorConfig, WithdrawalOrchestrator};
pub use promoter::{DepositPromoter, PromoterConfig, spawn_promoter};
pub use queue::SettlementQueue;
pub use service::SettlementService;
pub use state::AppState;
pub use watcher::{ConfirmationWatcher, WatcherConfig};
pub use worker::{JobRouter, WorkerConfig, spawn_reaper, spawn_workers};
