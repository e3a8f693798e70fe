//! Chain RPC client implementations.

pub mod rpc;

pub use rpc::{HttpChainRpc, RpcClientConfig};
