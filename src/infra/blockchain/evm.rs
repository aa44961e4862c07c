//! EVM backend: anchors payloads as calldata to a ledger contract through a node-managed
//! sender account (`eth_sendTransaction`).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use super::rpc::{HttpRpcTransport, RpcCaller, RpcClientConfig, RpcTransport, parse_hex_u64};
use crate::domain::hash::canonical_json;
use crate::domain::{
    AnchorPayload, AppError, BatchPayload, BlockchainNetwork, ChainClient, ChainEvent,
    ChainSubmission, ChainTxStatus, ConfigError, LedgerConfiguration, TransactionDetails,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionReceipt {
    transaction_hash: String,
    block_number: Option<String>,
    transaction_index: Option<String>,
    gas_used: Option<String>,
    effective_gas_price: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingTransaction {
    hash: String,
    gas_price: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogEntry {
    transaction_hash: String,
    log_index: String,
    block_number: String,
    transaction_index: String,
    #[serde(default)]
    topics: Vec<String>,
    data: String,
}

fn parse_opt_hex(value: Option<&str>) -> Result<Option<u64>, AppError> {
    value.map(parse_hex_u64).transpose()
}

fn to_hex_quantity(value: u64) -> String {
    format!("0x{:x}", value)
}

/// Calldata for a payload: `0x` followed by the hex of its canonical JSON
fn encode_calldata<T: serde::Serialize>(payload: &T) -> Result<String, AppError> {
    let canonical = canonical_json(&serde_json::to_value(payload)?)?;
    Ok(format!("0x{}", hex::encode(canonical.as_bytes())))
}

/// EVM chain client over HTTP JSON-RPC
pub struct EvmBackend {
    rpc: RpcCaller,
    contract_address: String,
    sender_address: Option<String>,
    gas_limit: u64,
    gas_price: Option<u64>,
}

impl EvmBackend {
    /// Build a client for the tenant's HTTP endpoint
    pub fn new(config: &LedgerConfiguration, rpc_config: RpcClientConfig) -> Result<Self, AppError> {
        let transport = HttpRpcTransport::new(&config.rpc_endpoint, rpc_config.timeout)?;
        Self::with_transport(Box::new(transport), config, rpc_config)
    }

    /// Build a client over an arbitrary transport (useful for testing)
    pub fn with_transport(
        transport: Box<dyn RpcTransport>,
        config: &LedgerConfiguration,
        rpc_config: RpcClientConfig,
    ) -> Result<Self, AppError> {
        let contract_address = config.contract_address.clone().ok_or_else(|| {
            ConfigError::Invalid(format!(
                "EVM ledger for {} requires a contract_address",
                config.organization_id
            ))
        })?;

        info!(
            rpc_url = %transport.endpoint(),
            contract = %contract_address,
            "Created EVM ledger client"
        );
        Ok(Self {
            rpc: RpcCaller::new(transport, rpc_config),
            contract_address,
            sender_address: config.sender_address.clone(),
            gas_limit: u64::try_from(config.gas_limit).unwrap_or(0),
            gas_price: config.gas_price.and_then(|p| u64::try_from(p).ok()),
        })
    }

    fn call_object(&self, data: String, with_gas: bool) -> Value {
        let mut call = json!({
            "to": self.contract_address,
            "data": data,
        });
        if let Some(from) = &self.sender_address {
            call["from"] = json!(from);
        }
        if with_gas {
            if self.gas_limit > 0 {
                call["gas"] = json!(to_hex_quantity(self.gas_limit));
            }
            if let Some(price) = self.gas_price {
                call["gasPrice"] = json!(to_hex_quantity(price));
            }
        }
        call
    }

    async fn send_calldata(&self, data: String) -> Result<ChainSubmission, AppError> {
        let tx = self.call_object(data, true);
        let hash: String = self.rpc.call_once("eth_sendTransaction", json!([tx])).await?;
        Ok(ChainSubmission {
            hash,
            status: ChainTxStatus::Submitted,
        })
    }

    async fn receipt(&self, tx_hash: &str) -> Result<Option<TransactionReceipt>, AppError> {
        self.rpc
            .call("eth_getTransactionReceipt", json!([tx_hash]))
            .await
    }
}

#[async_trait]
impl ChainClient for EvmBackend {
    fn network(&self) -> BlockchainNetwork {
        BlockchainNetwork::Evm
    }

    #[instrument(skip(self))]
    async fn is_connected(&self) -> bool {
        match self.rpc.call::<_, bool>("net_listening", json!([])).await {
            Ok(listening) => listening,
            Err(e) => {
                warn!(error = ?e, endpoint = %self.rpc.endpoint(), "EVM endpoint unreachable");
                false
            }
        }
    }

    #[instrument(skip(self, payload), fields(source_id = %payload.source_id))]
    async fn submit_transaction(
        &self,
        payload: &AnchorPayload,
    ) -> Result<ChainSubmission, AppError> {
        let submission = self.send_calldata(encode_calldata(payload)?).await?;
        info!(tx_hash = %submission.hash, "Anchor transaction sent");
        Ok(submission)
    }

    #[instrument(skip(self, payload), fields(batch_hash = %payload.batch_hash, size = payload.transactions.len()))]
    async fn submit_batch(&self, payload: &BatchPayload) -> Result<ChainSubmission, AppError> {
        let submission = self.send_calldata(encode_calldata(payload)?).await?;
        info!(tx_hash = %submission.hash, "Batch anchor transaction sent");
        Ok(submission)
    }

    #[instrument(skip(self))]
    async fn verify_transaction(&self, chain_tx_id: &str) -> Result<bool, AppError> {
        Ok(self
            .receipt(chain_tx_id)
            .await?
            .is_some_and(|r| r.status.as_deref() == Some("0x1")))
    }

    #[instrument(skip(self))]
    async fn get_transaction_details(
        &self,
        chain_tx_id: &str,
    ) -> Result<Option<TransactionDetails>, AppError> {
        if let Some(receipt) = self.receipt(chain_tx_id).await? {
            let status = match receipt.status.as_deref() {
                Some("0x1") => ChainTxStatus::Confirmed,
                Some(_) => ChainTxStatus::Failed,
                None => ChainTxStatus::Submitted,
            };
            return Ok(Some(TransactionDetails {
                hash: receipt.transaction_hash,
                block_number: parse_opt_hex(receipt.block_number.as_deref())?,
                transaction_index: parse_opt_hex(receipt.transaction_index.as_deref())?
                    .and_then(|i| u32::try_from(i).ok()),
                gas_used: parse_opt_hex(receipt.gas_used.as_deref())?,
                gas_price: parse_opt_hex(receipt.effective_gas_price.as_deref())?,
                status,
            }));
        }

        let pending: Option<PendingTransaction> = self
            .rpc
            .call("eth_getTransactionByHash", json!([chain_tx_id]))
            .await?;
        debug!(known = pending.is_some(), "No receipt yet");
        pending
            .map(|tx| -> Result<TransactionDetails, AppError> {
                Ok(TransactionDetails {
                    hash: tx.hash,
                    block_number: None,
                    transaction_index: None,
                    gas_used: None,
                    gas_price: parse_opt_hex(tx.gas_price.as_deref())?,
                    status: ChainTxStatus::Pending,
                })
            })
            .transpose()
    }

    async fn estimate_gas(&self, payload: &AnchorPayload) -> Result<u64, AppError> {
        let call = self.call_object(encode_calldata(payload)?, false);
        let estimate: String = self.rpc.call("eth_estimateGas", json!([call])).await?;
        parse_hex_u64(&estimate)
    }

    async fn get_current_block_number(&self) -> Result<u64, AppError> {
        let block: String = self.rpc.call("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&block)
    }

    async fn get_events(
        &self,
        from_block: u64,
        to_block: Option<u64>,
        event_type: Option<&str>,
    ) -> Result<Vec<ChainEvent>, AppError> {
        let mut filter = json!({
            "fromBlock": to_hex_quantity(from_block),
            "toBlock": to_block.map_or_else(|| "latest".to_string(), to_hex_quantity),
            "address": self.contract_address,
        });
        if let Some(topic) = event_type {
            filter["topics"] = json!([topic]);
        }

        let logs: Vec<LogEntry> = self.rpc.call("eth_getLogs", json!([filter])).await?;
        logs.into_iter()
            .map(|log| -> Result<ChainEvent, AppError> {
                Ok(ChainEvent {
                    event_id: format!("{}:{}", log.transaction_hash, log.log_index),
                    event_type: log.topics.first().cloned().unwrap_or_default(),
                    event_data: json!({ "topics": log.topics, "data": log.data }),
                    block_number: parse_hex_u64(&log.block_number)?,
                    transaction_index: u32::try_from(parse_hex_u64(&log.transaction_index)?)
                        .unwrap_or(u32::MAX),
                    transaction_hash: log.transaction_hash,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calldata_is_hex_of_canonical_json() {
        let payload = serde_json::json!({"b": 1, "a": "x"});
        let data = encode_calldata(&payload).unwrap();
        assert_eq!(data, format!("0x{}", hex::encode(r#"{"a":"x","b":1}"#)));
    }

    #[test]
    fn test_requires_contract_address() {
        let config = LedgerConfiguration::new("org-1", BlockchainNetwork::Evm);
        let result = EvmBackend::new(&config, RpcClientConfig::default());
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_call_object_carries_gas_policy() {
        let mut config = LedgerConfiguration::new("org-1", BlockchainNetwork::Evm)
            .with_contract("0x00000000000000000000000000000000000000aa");
        config.sender_address = Some("0x00000000000000000000000000000000000000bb".to_string());
        config.gas_price = Some(20_000_000_000);
        let backend = EvmBackend::new(&config, RpcClientConfig::default()).unwrap();

        let call = backend.call_object("0x00".to_string(), true);
        assert_eq!(call["gas"], "0xf4240");
        assert_eq!(call["gasPrice"], "0x4a817c800");
        assert_eq!(call["from"], "0x00000000000000000000000000000000000000bb");

        let estimate = backend.call_object("0x00".to_string(), false);
        assert!(estimate.get("gas").is_none());
    }
}
