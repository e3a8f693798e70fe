//! Test utilities and mock implementations.

pub mod mocks;

pub use mocks::{
    MockChainRpc, MockConfig, MockExchange, MockLedgerStore, MockMetadataStore, MockWalletPool,
    RecordingAlertSink,
};
