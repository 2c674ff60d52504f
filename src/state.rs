use std::sync::Arc;

use reqwest::Client;

use crate::agents::{ActivationReconciler, ConfigSynchronizer};
use crate::config::Config;
use crate::db::{
    agent_config_repository::AgentConfigRepository,
    daily_usage_repository::DailyUsageRepository,
    workflow_binding_repository::WorkflowBindingRepository,
};
use crate::services::engine::{EngineClient, RelayTransport};
use crate::services::n8n::N8nClient;
use crate::usage::{UsageAggregator, UsageExtractor};
use crate::utils::encryption::CredentialCipher;
use crate::worker::usage_poller::{AggregatorSource, PollingRegistry};

pub struct Repositories {
    pub configs: Arc<dyn AgentConfigRepository>,
    pub bindings: Arc<dyn WorkflowBindingRepository>,
    pub daily_usage: Arc<dyn DailyUsageRepository>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub http_client: Arc<Client>,
    pub bindings: Arc<dyn WorkflowBindingRepository>,
    pub engine: EngineClient,
    pub aggregator: UsageAggregator,
    pub synchronizer: ConfigSynchronizer,
    pub reconciler: ActivationReconciler,
    pub pollers: PollingRegistry,
    /// Upstream for the built-in relay endpoint; `None` when not configured.
    pub n8n: Option<N8nClient>,
}

impl AppState {
    pub fn new(
        config: Config,
        http_client: Client,
        transport: Arc<dyn RelayTransport>,
        repos: Repositories,
        cipher: Option<CredentialCipher>,
    ) -> Self {
        let engine = EngineClient::new(transport);
        let aggregator = UsageAggregator::new(
            engine.clone(),
            repos.daily_usage,
            UsageExtractor::default(),
            config.aggregator,
        );
        let synchronizer = ConfigSynchronizer::new(
            repos.configs,
            repos.bindings.clone(),
            engine.clone(),
            cipher,
        );
        let reconciler = ActivationReconciler::new(engine.clone(), repos.bindings.clone());
        let pollers = PollingRegistry::new(
            Arc::new(AggregatorSource {
                aggregator: aggregator.clone(),
                timezone: config.usage_timezone,
            }),
            config.poll_interval,
        );
        let n8n = config
            .n8n
            .as_ref()
            .map(|n8n| N8nClient::new(http_client.clone(), &n8n.base_url, &n8n.api_key));

        AppState {
            config: Arc::new(config),
            http_client: Arc::new(http_client),
            bindings: repos.bindings,
            engine,
            aggregator,
            synchronizer,
            reconciler,
            pollers,
            n8n,
        }
    }
}
