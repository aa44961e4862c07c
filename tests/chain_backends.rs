//! JSON-RPC backend tests against a mocked HTTP node.
//!
//! Uses `wiremock` to answer EVM and Substrate ledger-pallet RPC methods.

use std::time::Duration;

use serde_json::{Value, json};
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ledger_anchor::domain::{
    AnchorPayload, AppError, BatchPayload, BlockchainError, BlockchainNetwork, ChainClient,
    ChainTxStatus, LedgerConfiguration,
};
use ledger_anchor::infra::{EvmBackend, HttpRpcTransport, RpcClientConfig, SubstrateBackend};

fn rpc_result(result: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": result}))
}

fn rpc_error(code: i64, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "error": {"code": code, "message": message}
    }))
}

async fn mount(server: &MockServer, rpc_method: &str, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": rpc_method})))
        .respond_with(response)
        .mount(server)
        .await;
}

fn fast_rpc() -> RpcClientConfig {
    RpcClientConfig {
        timeout: Duration::from_secs(2),
        max_retries: 2,
        retry_delay: Duration::from_millis(10),
    }
}

fn payload() -> AnchorPayload {
    AnchorPayload {
        transaction_type: "invoice".to_string(),
        source_module: "finance".to_string(),
        source_id: "INV-001".to_string(),
        transaction_hash: "ab".repeat(32),
        organization_id: "org-1".to_string(),
        transaction_data: json!({"amount": 1000.0, "currency": "USD", "description": "x"}),
        timestamp: 1_700_000_000,
    }
}

// ============================================================================
// EVM
// ============================================================================

mod evm_tests {
    use super::*;

    fn backend(server: &MockServer) -> EvmBackend {
        let config = LedgerConfiguration::new("org-1", BlockchainNetwork::Evm)
            .with_endpoint(server.uri())
            .with_contract("0x00000000000000000000000000000000000000aa");
        let transport = HttpRpcTransport::new(&server.uri(), Duration::from_secs(2)).unwrap();
        EvmBackend::with_transport(Box::new(transport), &config, fast_rpc()).unwrap()
    }

    #[tokio::test]
    async fn test_submit_transaction_sends_calldata_to_contract() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "eth_sendTransaction",
                "params": [{"to": "0x00000000000000000000000000000000000000aa", "gas": "0xf4240"}]
            })))
            .respond_with(rpc_result(json!("0xfeed")))
            .expect(1)
            .mount(&server)
            .await;

        let submission = backend(&server).submit_transaction(&payload()).await.unwrap();
        assert_eq!(submission.hash, "0xfeed");
        assert_eq!(submission.status, ChainTxStatus::Submitted);
    }

    #[tokio::test]
    async fn test_submit_batch() {
        let server = MockServer::start().await;
        mount(&server, "eth_sendTransaction", rpc_result(json!("0xbatch"))).await;

        let batch = BatchPayload {
            batch_hash: "cd".repeat(32),
            transactions: vec![payload()],
            batch_timestamp: 1_700_000_000,
        };
        let submission = backend(&server).submit_batch(&batch).await.unwrap();
        assert_eq!(submission.hash, "0xbatch");
    }

    #[tokio::test]
    async fn test_revert_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_sendTransaction"})))
            .respond_with(rpc_error(3, "execution reverted"))
            .expect(1)
            .mount(&server)
            .await;

        let result = backend(&server).submit_transaction(&payload()).await;
        match result {
            Err(AppError::Blockchain(e)) => {
                assert!(matches!(e, BlockchainError::TransactionFailed(_)));
                assert!(!e.is_retryable());
            }
            other => panic!("expected a transaction failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_out_of_gas_maps_to_insufficient_gas() {
        let server = MockServer::start().await;
        mount(
            &server,
            "eth_sendTransaction",
            rpc_error(-32000, "intrinsic gas too low"),
        )
        .await;

        let result = backend(&server).submit_transaction(&payload()).await;
        assert!(matches!(
            result,
            Err(AppError::Blockchain(BlockchainError::InsufficientGas(_)))
        ));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let result = backend(&server).get_current_block_number().await;
        match result {
            Err(e) => assert!(e.is_retryable()),
            Ok(block) => panic!("unexpected block {}", block),
        }
    }

    #[tokio::test]
    async fn test_slow_broadcast_is_sent_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_sendTransaction"})))
            .respond_with(rpc_result(json!("0xlate")).set_delay(Duration::from_millis(400)))
            .expect(1)
            .mount(&server)
            .await;

        let config = LedgerConfiguration::new("org-1", BlockchainNetwork::Evm)
            .with_endpoint(server.uri())
            .with_contract("0x00000000000000000000000000000000000000aa");
        let transport =
            HttpRpcTransport::new(&server.uri(), Duration::from_millis(100)).unwrap();
        let backend = EvmBackend::with_transport(Box::new(transport), &config, fast_rpc()).unwrap();

        let result = backend.submit_transaction(&payload()).await;
        match result {
            Err(e) => assert!(e.is_retryable()),
            Ok(submission) => panic!("unexpected submission {:?}", submission),
        }
    }

    #[tokio::test]
    async fn test_transaction_details_from_receipt() {
        let server = MockServer::start().await;
        mount(
            &server,
            "eth_getTransactionReceipt",
            rpc_result(json!({
                "transactionHash": "0xfeed",
                "blockNumber": "0x3039",
                "transactionIndex": "0x2",
                "gasUsed": "0x5208",
                "effectiveGasPrice": "0x4a817c800",
                "status": "0x1"
            })),
        )
        .await;

        let backend = backend(&server);
        let details = backend
            .get_transaction_details("0xfeed")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(details.block_number, Some(12345));
        assert_eq!(details.transaction_index, Some(2));
        assert_eq!(details.gas_used, Some(21_000));
        assert_eq!(details.gas_price, Some(20_000_000_000));
        assert_eq!(details.status, ChainTxStatus::Confirmed);
        assert!(backend.verify_transaction("0xfeed").await.unwrap());
    }

    #[tokio::test]
    async fn test_reverted_receipt_is_failed() {
        let server = MockServer::start().await;
        mount(
            &server,
            "eth_getTransactionReceipt",
            rpc_result(json!({
                "transactionHash": "0xfeed",
                "blockNumber": "0x1",
                "transactionIndex": "0x0",
                "gasUsed": "0x5208",
                "status": "0x0"
            })),
        )
        .await;

        let backend = backend(&server);
        let details = backend
            .get_transaction_details("0xfeed")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(details.status, ChainTxStatus::Failed);
        assert!(!backend.verify_transaction("0xfeed").await.unwrap());
    }

    #[tokio::test]
    async fn test_pending_transaction_without_receipt() {
        let server = MockServer::start().await;
        mount(&server, "eth_getTransactionReceipt", rpc_result(Value::Null)).await;
        mount(
            &server,
            "eth_getTransactionByHash",
            rpc_result(json!({"hash": "0xfeed", "gasPrice": "0x1"})),
        )
        .await;

        let details = backend(&server)
            .get_transaction_details("0xfeed")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(details.status, ChainTxStatus::Pending);
        assert_eq!(details.block_number, None);
    }

    #[tokio::test]
    async fn test_unknown_transaction() {
        let server = MockServer::start().await;
        mount(&server, "eth_getTransactionReceipt", rpc_result(Value::Null)).await;
        mount(&server, "eth_getTransactionByHash", rpc_result(Value::Null)).await;

        let details = backend(&server).get_transaction_details("0xdead").await.unwrap();
        assert!(details.is_none());
    }

    #[tokio::test]
    async fn test_estimate_gas_and_block_number() {
        let server = MockServer::start().await;
        mount(&server, "eth_estimateGas", rpc_result(json!("0x7530"))).await;
        mount(&server, "eth_blockNumber", rpc_result(json!("0x10"))).await;

        let backend = backend(&server);
        assert_eq!(backend.estimate_gas(&payload()).await.unwrap(), 30_000);
        assert_eq!(backend.get_current_block_number().await.unwrap(), 16);
    }

    #[tokio::test]
    async fn test_is_connected() {
        let server = MockServer::start().await;
        mount(&server, "net_listening", rpc_result(json!(true))).await;
        assert!(backend(&server).is_connected().await);
    }

    #[tokio::test]
    async fn test_get_events_reads_contract_logs() {
        let server = MockServer::start().await;
        mount(
            &server,
            "eth_getLogs",
            rpc_result(json!([{
                "transactionHash": "0xfeed",
                "logIndex": "0x0",
                "blockNumber": "0x3039",
                "transactionIndex": "0x1",
                "topics": ["0xanchored"],
                "data": "0x"
            }])),
        )
        .await;

        let events = backend(&server).get_events(12_000, None, None).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, "0xfeed:0x0");
        assert_eq!(events[0].block_number, 12345);
        assert_eq!(events[0].event_type, "0xanchored");
    }
}

// ============================================================================
// SUBSTRATE
// ============================================================================

mod substrate_tests {
    use super::*;

    fn backend(server: &MockServer) -> SubstrateBackend {
        let transport = HttpRpcTransport::new(&server.uri(), Duration::from_secs(2)).unwrap();
        SubstrateBackend::with_transport(Box::new(transport), fast_rpc())
    }

    #[tokio::test]
    async fn test_submit_transaction_bare_hash() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "ledger_submitTransaction",
                "params": [{"source_id": "INV-001"}]
            })))
            .respond_with(rpc_result(json!("0xextrinsic")))
            .expect(1)
            .mount(&server)
            .await;

        let submission = backend(&server).submit_transaction(&payload()).await.unwrap();
        assert_eq!(submission.hash, "0xextrinsic");
        assert_eq!(submission.status, ChainTxStatus::Submitted);
    }

    #[tokio::test]
    async fn test_submit_batch_with_status() {
        let server = MockServer::start().await;
        mount(
            &server,
            "ledger_submitBatch",
            rpc_result(json!({"hash": "0xbatch", "status": "confirmed"})),
        )
        .await;

        let batch = BatchPayload {
            batch_hash: "cd".repeat(32),
            transactions: vec![payload(), payload()],
            batch_timestamp: 1_700_000_000,
        };
        let submission = backend(&server).submit_batch(&batch).await.unwrap();
        assert_eq!(submission.hash, "0xbatch");
        assert_eq!(submission.status, ChainTxStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_unavailable_node_gets_one_batch_broadcast() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "ledger_submitBatch"})))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let batch = BatchPayload {
            batch_hash: "cd".repeat(32),
            transactions: vec![payload()],
            batch_timestamp: 1_700_000_000,
        };
        let result = backend(&server).submit_batch(&batch).await;
        assert!(matches!(
            result,
            Err(AppError::Blockchain(BlockchainError::Connection(_)))
        ));
    }

    #[tokio::test]
    async fn test_transaction_details() {
        let server = MockServer::start().await;
        mount(
            &server,
            "ledger_getTransaction",
            rpc_result(json!({
                "hash": "0xextrinsic",
                "blockNumber": 42,
                "extrinsicIndex": 3,
                "weight": 125000,
                "fee": 10,
                "status": "confirmed"
            })),
        )
        .await;

        let backend = backend(&server);
        let details = backend
            .get_transaction_details("0xextrinsic")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(details.block_number, Some(42));
        assert_eq!(details.transaction_index, Some(3));
        assert_eq!(details.gas_used, Some(125_000));
        assert!(backend.verify_transaction("0xextrinsic").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_extrinsic() {
        let server = MockServer::start().await;
        mount(&server, "ledger_getTransaction", rpc_result(Value::Null)).await;

        let backend = backend(&server);
        assert!(backend.get_transaction_details("0x00").await.unwrap().is_none());
        assert!(!backend.verify_transaction("0x00").await.unwrap());
    }

    #[tokio::test]
    async fn test_block_number_from_header() {
        let server = MockServer::start().await;
        mount(
            &server,
            "chain_getHeader",
            rpc_result(json!({"number": "0x1a", "parentHash": "0x00"})),
        )
        .await;

        assert_eq!(backend(&server).get_current_block_number().await.unwrap(), 26);
    }

    #[tokio::test]
    async fn test_health() {
        let server = MockServer::start().await;
        mount(
            &server,
            "system_health",
            rpc_result(json!({"peers": 4, "isSyncing": false, "shouldHavePeers": true})),
        )
        .await;
        assert!(backend(&server).is_connected().await);
    }

    #[tokio::test]
    async fn test_unreachable_node_is_not_connected() {
        let transport =
            HttpRpcTransport::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        let backend = SubstrateBackend::with_transport(
            Box::new(transport),
            RpcClientConfig {
                max_retries: 0,
                ..fast_rpc()
            },
        );
        assert!(!backend.is_connected().await);
    }

    #[tokio::test]
    async fn test_local_weight_estimate() {
        let server = MockServer::start().await;
        let estimate = backend(&server).estimate_gas(&payload()).await.unwrap();
        assert!(estimate > 21_000);
    }
}
