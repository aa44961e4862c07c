//! JSON-RPC plumbing shared by the chain backends.
//!
//! A [`RpcTransport`] moves one request/response pair over some wire. [`RpcCaller`] layers
//! typed (de)serialization and bounded retries of transient failures on top of it. Calls
//! that broadcast something go through [`RpcCaller::call_once`]: a timed-out broadcast may
//! still have reached the node, so only the lifecycle above may decide to send it again.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::time::Duration;
use tracing::{instrument, warn};

use crate::domain::{AppError, BlockchainError};

/// Configuration for RPC access
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Wire abstraction for JSON-RPC calls, swappable in tests
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Send one request. A JSON `null` result is returned as [`Value::Null`].
    async fn send_request(&self, method: &str, params: Value) -> Result<Value, AppError>;

    /// Endpoint this transport talks to
    fn endpoint(&self) -> &str;
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonRpcRequest<T: Serialize> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: T,
}

#[derive(Debug, Deserialize)]
pub(crate) struct JsonRpcResponse<T> {
    #[serde(default)]
    pub id: Option<Value>,
    pub result: Option<T>,
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

impl<T> JsonRpcResponse<T> {
    /// Split the envelope into the result or a classified error
    pub(crate) fn into_result(self) -> Result<Option<T>, AppError> {
        match self.error {
            Some(error) => Err(map_rpc_error(error.code, &error.message)),
            None => Ok(self.result),
        }
    }
}

/// Classify a JSON-RPC error object
pub(crate) fn map_rpc_error(code: i64, message: &str) -> AppError {
    let lower = message.to_lowercase();
    let err = if lower.contains("out of gas")
        || lower.contains("intrinsic gas")
        || lower.contains("gas required exceeds")
    {
        BlockchainError::InsufficientGas(message.to_string())
    } else if lower.contains("revert") || lower.contains("rejected") || code == 3 {
        BlockchainError::TransactionFailed(message.to_string())
    } else {
        BlockchainError::RpcError(format!("{}: {}", code, message))
    };
    AppError::Blockchain(err)
}

/// HTTP JSON-RPC transport
pub struct HttpRpcTransport {
    http_client: Client,
    rpc_url: String,
}

impl HttpRpcTransport {
    pub fn new(rpc_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Blockchain(BlockchainError::Connection(e.to_string())))?;

        Ok(Self {
            http_client,
            rpc_url: rpc_url.to_string(),
        })
    }
}

#[async_trait]
impl RpcTransport for HttpRpcTransport {
    async fn send_request(&self, method: &str, params: Value) -> Result<Value, AppError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method: method.to_string(),
            params,
        };

        let response = self
            .http_client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Blockchain(BlockchainError::Timeout(e.to_string()))
                } else if e.is_connect() {
                    AppError::Blockchain(BlockchainError::Connection(e.to_string()))
                } else {
                    AppError::Blockchain(BlockchainError::RpcError(e.to_string()))
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(AppError::Blockchain(BlockchainError::Connection(format!(
                "HTTP {} from {}",
                status, self.rpc_url
            ))));
        }

        let rpc_response: JsonRpcResponse<Value> = response
            .json()
            .await
            .map_err(|e| AppError::Blockchain(BlockchainError::RpcError(e.to_string())))?;

        Ok(rpc_response.into_result()?.unwrap_or(Value::Null))
    }

    fn endpoint(&self) -> &str {
        &self.rpc_url
    }
}

/// Typed RPC calls with retry of transient failures
pub struct RpcCaller {
    transport: Box<dyn RpcTransport>,
    config: RpcClientConfig,
}

impl RpcCaller {
    pub fn new(transport: Box<dyn RpcTransport>, config: RpcClientConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &RpcClientConfig {
        &self.config
    }

    pub fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }

    /// Make a read-only RPC call, retrying connection and timeout errors up to
    /// `max_retries` times
    pub async fn call<P: Serialize + Send + Sync, R: DeserializeOwned + Send>(
        &self,
        method: &str,
        params: P,
    ) -> Result<R, AppError> {
        self.call_with_attempts(method, params, self.config.max_retries.saturating_add(1))
            .await
    }

    /// Make an RPC call exactly once, whatever the outcome
    pub async fn call_once<P: Serialize + Send + Sync, R: DeserializeOwned + Send>(
        &self,
        method: &str,
        params: P,
    ) -> Result<R, AppError> {
        self.call_with_attempts(method, params, 1).await
    }

    #[instrument(skip(self, params), fields(endpoint = %self.transport.endpoint()))]
    async fn call_with_attempts<P: Serialize + Send + Sync, R: DeserializeOwned + Send>(
        &self,
        method: &str,
        params: P,
        attempts: u32,
    ) -> Result<R, AppError> {
        let params_value = serde_json::to_value(params).map_err(|e| {
            AppError::Blockchain(BlockchainError::RpcError(format!(
                "Serialization error: {}",
                e
            )))
        })?;

        let mut last_error = None;
        for attempt in 0..attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay).await;
            }
            match self
                .transport
                .send_request(method, params_value.clone())
                .await
            {
                Ok(result_value) => {
                    return serde_json::from_value(result_value).map_err(|e| {
                        AppError::Blockchain(BlockchainError::RpcError(format!(
                            "Deserialization error: {}",
                            e
                        )))
                    });
                }
                Err(e) if e.is_retryable() => {
                    warn!(attempt = attempt, error = ?e, method = %method, "RPC call failed");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            AppError::Blockchain(BlockchainError::RpcError("Unknown error".to_string()))
        }))
    }
}

/// Parse a `0x`-prefixed hex quantity
pub(crate) fn parse_hex_u64(value: &str) -> Result<u64, AppError> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    if digits.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(digits, 16).map_err(|e| {
        AppError::Blockchain(BlockchainError::RpcError(format!(
            "Invalid hex quantity '{}': {}",
            value, e
        )))
    })
}
