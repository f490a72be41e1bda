use std::sync::Arc;

use tas_core::config::{AppConfig, ConfigError};
use tas_core::errors::StrategyError;
use tas_core::{
    build_strategy, builtin_types, AddOutcome, EnforcerSettings, InMemoryCluster, MetricCache,
    MetricEnforcer,
};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub cache: Arc<MetricCache>,
    pub cluster: Arc<InMemoryCluster>,
    pub enforcer: Arc<MetricEnforcer>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("policy `{policy}` could not be loaded: {source}")]
    Policy {
        policy: String,
        #[source]
        source: StrategyError,
    },
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");
    config.validate()?;

    let cache = Arc::new(match config.cache.max_metric_age() {
        Some(max_age) => MetricCache::with_max_age(max_age),
        None => MetricCache::new(),
    });
    let cluster = Arc::new(InMemoryCluster::with_nodes(config.cluster.nodes.iter().cloned()));
    let enforcer = Arc::new(MetricEnforcer::new(
        cluster.clone(),
        EnforcerSettings::from(&config.enforcer),
    ));
    for prototype in builtin_types() {
        enforcer.register_strategy_type(prototype.as_ref());
    }

    let mut strategy_count = 0;
    for policy in &config.policies {
        for declaration in &policy.strategies {
            let strategy = build_strategy(declaration, &policy.name).map_err(|source| {
                BootstrapError::Policy { policy: policy.name.clone(), source }
            })?;
            if enforcer.add_strategy(strategy, &policy.name).await == AddOutcome::Inserted {
                strategy_count += 1;
            }
        }
    }

    info!(
        event_name = "system.bootstrap.policies_loaded",
        policy_count = config.policies.len(),
        strategy_count,
        node_count = config.cluster.nodes.len(),
        "static policies loaded"
    );

    Ok(Application { config, cache, cluster, enforcer })
}
