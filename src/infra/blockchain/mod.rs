//! Chain client implementations.
//!
//! The backend is chosen once from the tenant's configured network; everything above this
//! module only sees `Arc<dyn ChainClient>`.

pub mod evm;
pub mod rpc;
pub mod substrate;
pub mod ws;

use std::sync::Arc;

pub use evm::EvmBackend;
pub use rpc::{HttpRpcTransport, RpcCaller, RpcClientConfig, RpcTransport};
pub use substrate::SubstrateBackend;
pub use ws::WsRpcTransport;

use crate::domain::{AppError, BlockchainNetwork, ChainClient, LedgerConfiguration};

/// Build the chain client for a tenant configuration
pub fn build_chain_client(
    config: &LedgerConfiguration,
    rpc_config: RpcClientConfig,
) -> Result<Arc<dyn ChainClient>, AppError> {
    let client: Arc<dyn ChainClient> = match config.blockchain_network {
        BlockchainNetwork::Evm => Arc::new(EvmBackend::new(config, rpc_config)?),
        BlockchainNetwork::Substrate => Arc::new(SubstrateBackend::new(config, rpc_config)?),
    };
    Ok(client)
}
