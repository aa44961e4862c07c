//! Substrate backend talking to a node that exposes the ledger pallet RPC.
//!
//! Extrinsic construction and signing live in the node (`ledger_submit*`), so this client
//! only exchanges JSON payloads.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use super::rpc::{RpcCaller, RpcClientConfig, RpcTransport, parse_hex_u64};
use super::ws::WsRpcTransport;
use crate::domain::hash::canonical_json;
use crate::domain::{
    AnchorPayload, AppError, BatchPayload, BlockchainNetwork, ChainClient, ChainEvent,
    ChainSubmission, ChainTxStatus, LedgerConfiguration, TransactionDetails,
};

/// Flat fee charged per anchored extrinsic in the local weight estimate
const BASE_WEIGHT: u64 = 21_000;
/// Weight charged per payload byte in the local estimate
const WEIGHT_PER_BYTE: u64 = 16;

/// `ledger_submit*` answers with either a bare hash or `{hash, status}`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SubmitResult {
    Hash(String),
    Detailed {
        hash: String,
        #[serde(default)]
        status: Option<ChainTxStatus>,
    },
}

impl From<SubmitResult> for ChainSubmission {
    fn from(result: SubmitResult) -> Self {
        match result {
            SubmitResult::Hash(hash) => Self {
                hash,
                status: ChainTxStatus::Submitted,
            },
            SubmitResult::Detailed { hash, status } => Self {
                hash,
                status: status.unwrap_or(ChainTxStatus::Submitted),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PalletTransaction {
    hash: String,
    block_number: Option<u64>,
    extrinsic_index: Option<u32>,
    weight: Option<u64>,
    fee: Option<u64>,
    status: ChainTxStatus,
}

#[derive(Debug, Deserialize)]
struct Header {
    number: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PalletEvent {
    event_id: String,
    extrinsic_hash: String,
    event_type: String,
    #[serde(default)]
    data: serde_json::Value,
    block_number: u64,
    extrinsic_index: u32,
}

/// Substrate chain client
pub struct SubstrateBackend {
    rpc: RpcCaller,
}

impl SubstrateBackend {
    /// Connect lazily to the tenant's WebSocket endpoint
    pub fn new(config: &LedgerConfiguration, rpc_config: RpcClientConfig) -> Result<Self, AppError> {
        let transport = WsRpcTransport::new(&config.rpc_endpoint, rpc_config.timeout)?;
        Ok(Self::with_transport(Box::new(transport), rpc_config))
    }

    pub fn with_transport(transport: Box<dyn RpcTransport>, rpc_config: RpcClientConfig) -> Self {
        info!(rpc_url = %transport.endpoint(), "Created Substrate ledger client");
        Self {
            rpc: RpcCaller::new(transport, rpc_config),
        }
    }
}

#[async_trait]
impl ChainClient for SubstrateBackend {
    fn network(&self) -> BlockchainNetwork {
        BlockchainNetwork::Substrate
    }

    #[instrument(skip(self))]
    async fn is_connected(&self) -> bool {
        match self
            .rpc
            .call::<_, serde_json::Value>("system_health", json!([]))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(error = ?e, endpoint = %self.rpc.endpoint(), "Substrate endpoint unreachable");
                false
            }
        }
    }

    #[instrument(skip(self, payload), fields(source_id = %payload.source_id))]
    async fn submit_transaction(
        &self,
        payload: &AnchorPayload,
    ) -> Result<ChainSubmission, AppError> {
        let result: SubmitResult = self
            .rpc
            .call_once("ledger_submitTransaction", json!([payload]))
            .await?;
        let submission = ChainSubmission::from(result);
        info!(tx_hash = %submission.hash, "Anchor extrinsic submitted");
        Ok(submission)
    }

    #[instrument(skip(self, payload), fields(batch_hash = %payload.batch_hash, size = payload.transactions.len()))]
    async fn submit_batch(&self, payload: &BatchPayload) -> Result<ChainSubmission, AppError> {
        let result: SubmitResult = self
            .rpc
            .call_once("ledger_submitBatch", json!([payload]))
            .await?;
        let submission = ChainSubmission::from(result);
        info!(tx_hash = %submission.hash, "Batch extrinsic submitted");
        Ok(submission)
    }

    async fn verify_transaction(&self, chain_tx_id: &str) -> Result<bool, AppError> {
        Ok(self
            .get_transaction_details(chain_tx_id)
            .await?
            .is_some_and(|d| d.status == ChainTxStatus::Confirmed))
    }

    #[instrument(skip(self))]
    async fn get_transaction_details(
        &self,
        chain_tx_id: &str,
    ) -> Result<Option<TransactionDetails>, AppError> {
        let tx: Option<PalletTransaction> = self
            .rpc
            .call("ledger_getTransaction", json!([chain_tx_id]))
            .await?;
        Ok(tx.map(|t| TransactionDetails {
            hash: t.hash,
            block_number: t.block_number,
            transaction_index: t.extrinsic_index,
            gas_used: t.weight,
            gas_price: t.fee,
            status: t.status,
        }))
    }

    /// Local estimate from the canonical payload size; weights are charged by the node.
    async fn estimate_gas(&self, payload: &AnchorPayload) -> Result<u64, AppError> {
        let encoded = canonical_json(&serde_json::to_value(payload)?)?;
        Ok(BASE_WEIGHT + encoded.len() as u64 * WEIGHT_PER_BYTE)
    }

    async fn get_current_block_number(&self) -> Result<u64, AppError> {
        let header: Header = self.rpc.call("chain_getHeader", json!([])).await?;
        parse_hex_u64(&header.number)
    }

    async fn get_events(
        &self,
        from_block: u64,
        to_block: Option<u64>,
        event_type: Option<&str>,
    ) -> Result<Vec<ChainEvent>, AppError> {
        let events: Vec<PalletEvent> = self
            .rpc
            .call("ledger_getEvents", json!([from_block, to_block, event_type]))
            .await?;
        Ok(events
            .into_iter()
            .map(|e| ChainEvent {
                event_id: e.event_id,
                transaction_hash: e.extrinsic_hash,
                event_type: e.event_type,
                event_data: e.data,
                block_number: e.block_number,
                transaction_index: e.extrinsic_index,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_result_accepts_both_shapes() {
        let bare: SubmitResult = serde_json::from_value(json!("0xabc")).unwrap();
        assert_eq!(
            ChainSubmission::from(bare),
            ChainSubmission {
                hash: "0xabc".to_string(),
                status: ChainTxStatus::Submitted
            }
        );

        let detailed: SubmitResult =
            serde_json::from_value(json!({"hash": "0xdef", "status": "confirmed"})).unwrap();
        assert_eq!(ChainSubmission::from(detailed).status, ChainTxStatus::Confirmed);
    }

    #[test]
    fn test_rejects_http_endpoint() {
        let config = LedgerConfiguration::new("org-1", BlockchainNetwork::Substrate)
            .with_endpoint("http://localhost:9944");
        assert!(SubstrateBackend::new(&config, RpcClientConfig::default()).is_err());
    }
}
