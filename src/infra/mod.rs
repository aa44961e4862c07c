//! Infrastructure layer implementations.

pub mod blockchain;
pub mod database;

pub use blockchain::{
    EvmBackend, HttpRpcTransport, RpcClientConfig, RpcTransport, SubstrateBackend,
    WsRpcTransport, build_chain_client,
};
pub use database::{PostgresConfig, PostgresLedgerStore};
