//! JSON-RPC chain client for EVM-family nodes.
//!
//! Submission goes through the node's account API: the leased wallet's
//! secret is the unlock passphrase for `personal_sendTransaction`, so
//! key handling stays inside the node. Confirmation depth comes from
//! the receipt's block number against the current head.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::domain::{AppError, Blockchain, ChainError, ChainRpcClient, ChainTransfer};

/// ERC-20 `transfer(address,uint256)` selector
const TRANSFER_SELECTOR: &str = "a9059cbb";

/// Configuration for the JSON-RPC chain client
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub request_timeout: Duration,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    // `"result": null` is a meaningful reply (pending receipt), so the
    // field must round-trip as `Value::Null` rather than be absent.
    #[serde(default)]
    result: Value,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// HTTP JSON-RPC client for EVM-family chains
pub struct HttpChainRpc {
    http_client: reqwest::Client,
    request_id: AtomicU64,
}

impl HttpChainRpc {
    /// Create a new chain RPC client
    pub fn new(config: RpcClientConfig) -> Result<Self, AppError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AppError::Chain(ChainError::Connection(e.to_string())))?;
        Ok(Self {
            http_client,
            request_id: AtomicU64::new(1),
        })
    }

    /// Create a client with default configuration
    pub fn with_defaults() -> Result<Self, AppError> {
        Self::new(RpcClientConfig::default())
    }

    async fn call(
        &self,
        chain: &Blockchain,
        method: &'static str,
        params: Vec<Value>,
    ) -> Result<Value, AppError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.request_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .http_client
            .post(&chain.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Chain(ChainError::Timeout(format!("{}: {}", method, e)))
                } else {
                    AppError::Chain(ChainError::Connection(format!("{}: {}", method, e)))
                }
            })?;

        if !response.status().is_success() {
            return Err(AppError::Chain(ChainError::Connection(format!(
                "{}: HTTP {}",
                method,
                response.status()
            ))));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| AppError::Chain(ChainError::Protocol(e.to_string())))?;

        if let Some(error) = body.error {
            warn!(method = method, code = error.code, message = %error.message, "RPC node returned an error");
            return Err(AppError::Chain(ChainError::Submission(format!(
                "{} failed (code {}): {}",
                method, error.code, error.message
            ))));
        }

        Ok(body.result)
    }

    async fn block_number(&self, chain: &Blockchain) -> Result<u64, AppError> {
        let result = self.call(chain, "eth_blockNumber", vec![]).await?;
        parse_hex_quantity(&result)
    }
}

#[async_trait]
impl ChainRpcClient for HttpChainRpc {
    #[instrument(skip(self, chain), fields(chain = %chain.code))]
    async fn health_check(&self, chain: &Blockchain) -> Result<(), AppError> {
        self.block_number(chain).await?;
        Ok(())
    }

    #[instrument(skip(self, chain, transfer), fields(chain = %chain.code, from = %transfer.wallet.address, to = %transfer.to_address))]
    async fn send_transfer(
        &self,
        chain: &Blockchain,
        transfer: &ChainTransfer<'_>,
    ) -> Result<String, AppError> {
        validate_address(transfer.to_address)?;

        let tx_object = match transfer.contract {
            // Token transfer goes to the contract with the recipient and
            // amount in the calldata.
            Some(contract) => {
                validate_address(contract)?;
                json!({
                    "from": transfer.wallet.address,
                    "to": contract,
                    "value": "0x0",
                    "data": encode_transfer_calldata(transfer.to_address, transfer.amount_base_units)?,
                })
            }
            None => json!({
                "from": transfer.wallet.address,
                "to": transfer.to_address,
                "value": format!("0x{:x}", transfer.amount_base_units),
            }),
        };

        let result = self
            .call(
                chain,
                "personal_sendTransaction",
                vec![
                    tx_object,
                    json!(transfer.wallet.private_key.expose_secret()),
                ],
            )
            .await?;

        let tx_hash = result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AppError::Chain(ChainError::Protocol("Submission returned a non-string hash".to_string())))?;

        info!(tx_hash = %tx_hash, "Transfer submitted");
        Ok(tx_hash)
    }

    #[instrument(skip(self, chain), fields(chain = %chain.code))]
    async fn confirmations(
        &self,
        chain: &Blockchain,
        tx_hash: &str,
    ) -> Result<Option<u64>, AppError> {
        let receipt = self
            .call(chain, "eth_getTransactionReceipt", vec![json!(tx_hash)])
            .await?;
        if receipt.is_null() {
            debug!(tx_hash = %tx_hash, "Transaction not yet mined");
            return Ok(None);
        }

        if receipt.get("status").and_then(Value::as_str) == Some("0x0") {
            return Err(AppError::Chain(ChainError::Reverted(format!(
                "Transaction {} reverted on-chain",
                tx_hash
            ))));
        }

        let mined_block = receipt
            .get("blockNumber")
            .map(parse_hex_quantity)
            .transpose()?;
        let Some(mined_block) = mined_block else {
            // Receipt exists but no block yet: still pending
            return Ok(None);
        };

        let head = self.block_number(chain).await?;
        Ok(Some(head.saturating_sub(mined_block) + 1))
    }
}

/// Minimal 0x-address shape check; the node rejects anything deeper.
fn validate_address(address: &str) -> Result<(), AppError> {
    let hex = address
        .strip_prefix("0x")
        .ok_or_else(|| invalid_address(address, "missing 0x prefix"))?;
    if hex.len() != 40 {
        return Err(invalid_address(address, "expected 20 bytes"));
    }
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid_address(address, "non-hex characters"));
    }
    Ok(())
}

fn invalid_address(address: &str, reason: &str) -> AppError {
    AppError::Chain(ChainError::InvalidAddress(format!(
        "{}: {}",
        address, reason
    )))
}

/// ABI-encode `transfer(address,uint256)` calldata.
fn encode_transfer_calldata(to_address: &str, amount: u128) -> Result<String, AppError> {
    validate_address(to_address)?;
    let recipient = to_address.trim_start_matches("0x").to_lowercase();
    Ok(format!(
        "0x{}{:0>64}{:064x}",
        TRANSFER_SELECTOR, recipient, amount
    ))
}

/// Parse a JSON-RPC hex quantity (`"0x..."`) into a u64.
fn parse_hex_quantity(value: &Value) -> Result<u64, AppError> {
    let s = value
        .as_str()
        .ok_or_else(|| AppError::Chain(ChainError::Protocol("Expected a hex quantity".to_string())))?;
    let hex = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(hex, 16)
        .map_err(|e| AppError::Chain(ChainError::Protocol(format!("Bad hex quantity {}: {}", s, e))))
}
