//! Per-organization service resolution.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::service::{ServiceSettings, TransactionService};
use crate::domain::{AppError, ChainClient, ConfigError, LedgerConfiguration, LedgerStore};
use crate::infra::blockchain::{RpcClientConfig, build_chain_client};

/// Builds the chain client for a tenant configuration
pub type ChainFactory =
    Box<dyn Fn(&LedgerConfiguration) -> Result<Arc<dyn ChainClient>, AppError> + Send + Sync>;

/// Resolves an explicit organization id to its configured [`TransactionService`]
pub struct ServiceRegistry {
    store: Arc<dyn LedgerStore>,
    settings: ServiceSettings,
    chain_factory: ChainFactory,
    services: DashMap<String, Arc<TransactionService>>,
}

impl ServiceRegistry {
    /// Registry building real chain backends from each tenant's configuration
    #[must_use]
    pub fn new(
        store: Arc<dyn LedgerStore>,
        settings: ServiceSettings,
        rpc_config: RpcClientConfig,
    ) -> Self {
        Self::with_chain_factory(
            store,
            settings,
            Box::new(move |config| build_chain_client(config, rpc_config.clone())),
        )
    }

    #[must_use]
    pub fn with_chain_factory(
        store: Arc<dyn LedgerStore>,
        settings: ServiceSettings,
        chain_factory: ChainFactory,
    ) -> Self {
        Self {
            store,
            settings,
            chain_factory,
            services: DashMap::new(),
        }
    }

    /// Cached service for the organization, built on first use
    #[instrument(skip(self))]
    pub async fn service_for(
        &self,
        organization_id: &str,
    ) -> Result<Arc<TransactionService>, AppError> {
        if let Some(service) = self.services.get(organization_id) {
            return Ok(Arc::clone(service.value()));
        }

        let config = self
            .store
            .get_configuration(organization_id)
            .await?
            .ok_or_else(|| ConfigError::Missing(organization_id.to_string()))?;
        if !config.is_active {
            return Err(ConfigError::Inactive(organization_id.to_string()).into());
        }
        config
            .check()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let chain = (self.chain_factory)(&config)?;
        let network = config.blockchain_network;
        let service = Arc::new(TransactionService::new(
            Arc::clone(&self.store),
            chain,
            config,
            self.settings.clone(),
        ));

        // A concurrent caller may have built one meanwhile; keep whichever landed first
        let service = Arc::clone(
            self.services
                .entry(organization_id.to_string())
                .or_insert(service)
                .value(),
        );
        info!(org = %organization_id, %network, "Ledger service ready");
        Ok(service)
    }

    /// Drop the cached service so the next call rebuilds it from storage
    pub fn evict(&self, organization_id: &str) -> bool {
        let removed = self.services.remove(organization_id).is_some();
        if removed {
            debug!(org = %organization_id, "Evicted ledger service");
        }
        removed
    }

    /// Validate and persist a tenant configuration, invalidating any cached service
    #[instrument(skip(self, config), fields(org = %config.organization_id))]
    pub async fn save_configuration(&self, config: &LedgerConfiguration) -> Result<(), AppError> {
        config.check()?;
        self.store.upsert_configuration(config).await?;
        self.evict(&config.organization_id);
        info!(network = %config.blockchain_network, "Ledger configuration saved");
        Ok(())
    }

    /// Services for every active organization, skipping ones that fail to build
    pub async fn active_services(&self) -> Result<Vec<Arc<TransactionService>>, AppError> {
        let configs = self.store.list_active_configurations().await?;
        let mut services = Vec::with_capacity(configs.len());
        for config in configs {
            match self.service_for(&config.organization_id).await {
                Ok(service) => services.push(service),
                Err(e) => {
                    warn!(org = %config.organization_id, error = ?e, "Skipping organization");
                }
            }
        }
        Ok(services)
    }

    #[must_use]
    pub fn cached(&self) -> usize {
        self.services.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BlockchainNetwork;
    use crate::test_utils::{MockChainClient, MockLedgerStore};

    fn registry(store: Arc<MockLedgerStore>) -> ServiceRegistry {
        ServiceRegistry::with_chain_factory(
            store,
            ServiceSettings::default(),
            Box::new(|_| Ok(Arc::new(MockChainClient::new()) as Arc<dyn ChainClient>)),
        )
    }

    #[tokio::test]
    async fn test_service_for_missing_configuration() {
        let registry = registry(Arc::new(MockLedgerStore::new()));
        let result = registry.service_for("org-1").await;
        assert!(matches!(
            result,
            Err(AppError::Config(ConfigError::Missing(_)))
        ));
    }

    #[tokio::test]
    async fn test_service_for_inactive_configuration() {
        let store = Arc::new(MockLedgerStore::new());
        let mut config = LedgerConfiguration::new("org-1", BlockchainNetwork::Substrate);
        config.is_active = false;
        store.upsert_configuration(&config).await.unwrap();

        let result = registry(store).service_for("org-1").await;
        assert!(matches!(
            result,
            Err(AppError::Config(ConfigError::Inactive(_)))
        ));
    }

    #[tokio::test]
    async fn test_service_for_caches_and_evicts() {
        let store = Arc::new(MockLedgerStore::new());
        let registry = registry(Arc::clone(&store));
        registry
            .save_configuration(&LedgerConfiguration::new(
                "org-1",
                BlockchainNetwork::Substrate,
            ))
            .await
            .unwrap();

        let first = registry.service_for("org-1").await.unwrap();
        let second = registry.service_for("org-1").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.cached(), 1);

        assert!(registry.evict("org-1"));
        let third = registry.service_for("org-1").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[tokio::test]
    async fn test_save_configuration_rejects_invalid() {
        let store = Arc::new(MockLedgerStore::new());
        let registry = registry(Arc::clone(&store));
        // EVM needs a contract address
        let config = LedgerConfiguration::new("org-1", BlockchainNetwork::Evm);

        let result = registry.save_configuration(&config).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
        assert!(store.get_configuration("org-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_active_services_skips_inactive() {
        let store = Arc::new(MockLedgerStore::new());
        let registry = registry(Arc::clone(&store));
        registry
            .save_configuration(&LedgerConfiguration::new(
                "org-1",
                BlockchainNetwork::Substrate,
            ))
            .await
            .unwrap();
        let mut disabled = LedgerConfiguration::new("org-2", BlockchainNetwork::Substrate);
        disabled.is_active = false;
        store.upsert_configuration(&disabled).await.unwrap();

        let services = registry.active_services().await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].organization_id(), "org-1");
    }
}
