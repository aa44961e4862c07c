//! WebSocket JSON-RPC transport.
//!
//! Holds one connection, opened lazily and reopened after a connection-level failure.
//! Calls are serialized over the connection; frames whose `id` does not match the pending
//! request (subscription notifications, stale replies) are skipped.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::debug;

use super::rpc::{JsonRpcRequest, JsonRpcResponse, RpcTransport};
use crate::domain::{AppError, BlockchainError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsRpcTransport {
    url: String,
    timeout: Duration,
    connection: Mutex<Option<WsStream>>,
    next_id: AtomicU64,
}

impl WsRpcTransport {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, AppError> {
        let parsed = url::Url::parse(url).map_err(|e| {
            AppError::Blockchain(BlockchainError::Connection(format!(
                "Invalid WebSocket URL '{}': {}",
                url, e
            )))
        })?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(AppError::Blockchain(BlockchainError::Connection(format!(
                "Unsupported WebSocket scheme: {}",
                parsed.scheme()
            ))));
        }
        Ok(Self {
            url: url.to_string(),
            timeout,
            connection: Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    async fn exchange(
        &self,
        slot: &mut Option<WsStream>,
        id: u64,
        body: String,
    ) -> Result<Value, AppError> {
        if slot.is_none() {
            let (stream, _) = connect_async(self.url.as_str())
                .await
                .map_err(|e| connection_error(e.to_string()))?;
            debug!(url = %self.url, "WebSocket connected");
            *slot = Some(stream);
        }
        let Some(stream) = slot.as_mut() else {
            return Err(connection_error("connection unavailable"));
        };

        stream
            .send(Message::Text(body.into()))
            .await
            .map_err(|e| connection_error(e.to_string()))?;

        while let Some(frame) = stream.next().await {
            match frame.map_err(|e| connection_error(e.to_string()))? {
                Message::Text(text) => {
                    let response: JsonRpcResponse<Value> = serde_json::from_str(text.as_str())
                        .map_err(|e| {
                            AppError::Blockchain(BlockchainError::RpcError(e.to_string()))
                        })?;
                    if response.id.as_ref().and_then(Value::as_u64) != Some(id) {
                        continue;
                    }
                    return Ok(response.into_result()?.unwrap_or(Value::Null));
                }
                Message::Close(_) => return Err(connection_error("server closed the connection")),
                _ => {}
            }
        }
        Err(connection_error("stream ended"))
    }
}

fn connection_error(message: impl Into<String>) -> AppError {
    AppError::Blockchain(BlockchainError::Connection(message.into()))
}

#[async_trait]
impl RpcTransport for WsRpcTransport {
    async fn send_request(&self, method: &str, params: Value) -> Result<Value, AppError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method: method.to_string(),
            params,
        };
        let body = serde_json::to_string(&request)?;

        let mut guard = self.connection.lock().await;
        let outcome = tokio::time::timeout(self.timeout, self.exchange(&mut guard, id, body)).await;
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.is_retryable() {
                    *guard = None;
                }
                Err(e)
            }
            Err(_) => {
                *guard = None;
                Err(AppError::Blockchain(BlockchainError::Timeout(format!(
                    "{} did not answer within {:?}",
                    method, self.timeout
                ))))
            }
        }
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Answers every request with `{"echo": method}`, preceded by an unrelated notification.
    async fn spawn_echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut ws = accept_async(stream).await.unwrap();
                    while let Some(Ok(Message::Text(text))) = ws.next().await {
                        let request: Value = serde_json::from_str(text.as_str()).unwrap();
                        let notification = json!({
                            "jsonrpc": "2.0",
                            "method": "chain_newHead",
                            "params": {"number": "0x1"}
                        });
                        ws.send(Message::Text(notification.to_string().into()))
                            .await
                            .unwrap();
                        let response = if request["method"] == "ledger_fail" {
                            json!({
                                "jsonrpc": "2.0",
                                "id": request["id"],
                                "error": {"code": -32601, "message": "Method not found"}
                            })
                        } else {
                            json!({
                                "jsonrpc": "2.0",
                                "id": request["id"],
                                "result": {"echo": request["method"]}
                            })
                        };
                        ws.send(Message::Text(response.to_string().into()))
                            .await
                            .unwrap();
                    }
                });
            }
        });
        format!("ws://{}", addr)
    }

    #[test]
    fn test_rejects_non_websocket_urls() {
        assert!(WsRpcTransport::new("http://localhost:9944", Duration::from_secs(1)).is_err());
        assert!(WsRpcTransport::new("not a url", Duration::from_secs(1)).is_err());
        assert!(WsRpcTransport::new("ws://localhost:9944", Duration::from_secs(1)).is_ok());
    }

    #[tokio::test]
    async fn test_round_trip_skips_notifications() {
        let url = spawn_echo_server().await;
        let transport = WsRpcTransport::new(&url, Duration::from_secs(5)).unwrap();

        let first = transport.send_request("system_health", json!([])).await.unwrap();
        assert_eq!(first["echo"], "system_health");

        let second = transport.send_request("chain_getHeader", json!([])).await.unwrap();
        assert_eq!(second["echo"], "chain_getHeader");
    }

    #[tokio::test]
    async fn test_rpc_errors_are_surfaced() {
        let url = spawn_echo_server().await;
        let transport = WsRpcTransport::new(&url, Duration::from_secs(5)).unwrap();

        let result = transport.send_request("ledger_fail", json!([])).await;
        assert!(matches!(
            result,
            Err(AppError::Blockchain(BlockchainError::RpcError(_)))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport =
            WsRpcTransport::new(&format!("ws://{}", addr), Duration::from_secs(5)).unwrap();
        let result = transport.send_request("system_health", json!([])).await;
        assert!(result.unwrap_err().is_retryable());
    }
}
