//! Root-object wiring
//!
//! Explicit construction of the application graph: storage, event bus,
//! unit-of-work factory, template manager, provider strategies and the
//! command/query buses. Strategies are produced by an injected factory so
//! tests can substitute fakes for the AWS-backed production path.

use crate::app::bus::{CommandBus, QueryBus};
use crate::app::capability::ProviderCapabilityService;
use crate::app::commands::register_command_handlers;
use crate::app::events::EventBus;
use crate::app::lifecycle::RequestLifecycleService;
use crate::app::queries::register_query_handlers;
use crate::app::selection::ProviderSelectionService;
use crate::aws::{
    AcquisitionLedger, AsgHandler, AwsApi, AwsApiMetrics, AwsHandler, AwsNativeSpecService,
    AwsOperations, AwsProviderStrategy, Ec2FleetHandler, HandlerDeps, LaunchTemplateManager,
    MachineAdapter, RunInstancesHandler, SpotFleetHandler,
};
use crate::config::{BrokerConfig, ProviderInstanceConfig};
use crate::di::{Container, Scope};
use crate::domain::ProviderApi;
use crate::error::Result;
use crate::provider::{ProviderContext, ProviderStrategy};
use crate::storage::{register_default_storage, RecordStore, StorageRegistry, UnitOfWorkFactory};
use crate::templates::TemplateManager;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Builds one provider strategy for one configured provider instance.
pub type StrategyFactory = Arc<
    dyn Fn(ProviderInstanceConfig, BrokerConfig) -> BoxFuture<'static, Result<Arc<dyn ProviderStrategy>>>
        + Send
        + Sync,
>;

/// Shared application state handed to every handler.
pub struct AppCore {
    pub config_path: Option<PathBuf>,
    pub config: RwLock<BrokerConfig>,
    pub templates: TemplateManager,
    pub selection: ProviderSelectionService,
    pub capability: ProviderCapabilityService,
    pub provider_context: ProviderContext,
    pub uow: UnitOfWorkFactory,
    pub event_bus: Arc<EventBus>,
    pub strategy_factory: StrategyFactory,
}

impl AppCore {
    /// Register a strategy for every enabled provider instance.
    pub async fn register_strategies(&self) -> Result<usize> {
        let config = self.config.read().await.clone();
        let mut registered = 0;
        for instance in config.enabled_provider_instances() {
            match (self.strategy_factory)(instance.clone(), config.clone()).await {
                Ok(strategy) => {
                    strategy.initialize().await?;
                    self.provider_context.register_strategy(strategy).await;
                    registered += 1;
                }
                Err(e) => {
                    warn!("Failed to build strategy for '{}': {}", instance.name, e);
                }
            }
        }
        if let Some(active) = &config.provider.active_provider {
            if self.provider_context.set_strategy(active).await.is_err() {
                warn!("Configured active provider '{}' is not registered", active);
            }
        }
        info!("Registered {} provider strategies", registered);
        Ok(registered)
    }

    /// Probe every registered strategy once.
    pub async fn probe_health_once(&self) {
        for name in self.provider_context.registered_names().await {
            match self.provider_context.check_strategy_health(&name).await {
                Ok(status) if status.healthy => {}
                Ok(status) => warn!(
                    "Provider '{}' unhealthy: {}",
                    name,
                    status.message.unwrap_or_default()
                ),
                Err(e) => warn!("Health check of provider '{}' failed: {}", name, e),
            }
        }
    }
}

/// Background health probing at the configured cadence.
pub fn spawn_health_probes(core: Arc<AppCore>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = {
            let config = core.config.read().await;
            std::time::Duration::from_secs(config.provider.health_check_interval.max(1))
        };
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            core.probe_health_once().await;
        }
    })
}

/// The assembled application.
pub struct App {
    pub core: Arc<AppCore>,
    pub commands: Arc<CommandBus>,
    pub queries: Arc<QueryBus>,
    pub lifecycle: Arc<RequestLifecycleService>,
    pub container: Container,
}

/// Assemble the application from explicit parts.
pub async fn build_app(
    config: BrokerConfig,
    config_path: Option<PathBuf>,
    store: Arc<dyn RecordStore>,
    strategy_factory: StrategyFactory,
) -> Result<App> {
    let event_bus = Arc::new(EventBus::new());
    let core = Arc::new(AppCore {
        config_path,
        templates: TemplateManager::new(config.clone()),
        selection: ProviderSelectionService::new(),
        capability: ProviderCapabilityService::new(),
        provider_context: ProviderContext::new(),
        uow: UnitOfWorkFactory::new(store, event_bus.clone()),
        event_bus: event_bus.clone(),
        strategy_factory,
        config: RwLock::new(config),
    });

    core.register_strategies().await?;

    let commands = Arc::new(CommandBus::new());
    let queries = Arc::new(QueryBus::new());
    register_command_handlers(&commands, core.clone()).await;
    register_query_handlers(&queries, core.clone()).await;

    let lifecycle = Arc::new(RequestLifecycleService::new(core.clone()));

    // Core singletons are also reachable through the container so optional
    // extensions (event subscribers, metrics sinks) can resolve them.
    let container = Container::new();
    container.register_instance(core.clone());
    container.register_instance(commands.clone());
    container.register_instance(queries.clone());
    container.register_instance(event_bus);
    container.register_instance(lifecycle.clone());
    container.register_factory::<ProviderSelectionService, _>(Scope::Transient, |_| {
        Ok(Arc::new(ProviderSelectionService::new()))
    });

    Ok(App { core, commands, queries, lifecycle, container })
}

/// Production wiring: registered storage backends plus SDK-backed AWS
/// strategies with shared instrumentation.
pub async fn build_production_app(config_path: Option<PathBuf>) -> Result<App> {
    let config = BrokerConfig::load(config_path.as_deref())?;

    let registry = StorageRegistry::new();
    register_default_storage(&registry).await?;
    let store = registry.open(&config.storage).await?;

    let metrics = Arc::new(AwsApiMetrics::new(config.aws_metrics.clone()));
    let strategy_factory = aws_strategy_factory(metrics);

    build_app(config, config_path, store, strategy_factory).await
}

/// Strategy factory that connects the AWS SDK per provider instance.
pub fn aws_strategy_factory(metrics: Arc<AwsApiMetrics>) -> StrategyFactory {
    Arc::new(move |instance, config| {
        let metrics = metrics.clone();
        Box::pin(async move {
            let region = instance.config_str("region").map(|s| s.to_string());
            let profile = instance.config_str("profile").map(|s| s.to_string());
            let api: Arc<dyn AwsApi> = Arc::new(
                crate::aws::SdkAwsApi::connect(&config.aws, region, profile, metrics.clone())
                    .await,
            );
            Ok(build_aws_strategy_with_metrics(&instance, &config, api, Some(metrics)))
        })
    })
}

/// Assemble an `AwsProviderStrategy` over an arbitrary `AwsApi` (the SDK in
/// production, a fake in tests).
pub fn build_aws_strategy(
    instance: &ProviderInstanceConfig,
    config: &BrokerConfig,
    api: Arc<dyn AwsApi>,
) -> Arc<dyn ProviderStrategy> {
    build_aws_strategy_with_metrics(instance, config, api, None)
}

pub fn build_aws_strategy_with_metrics(
    instance: &ProviderInstanceConfig,
    config: &BrokerConfig,
    api: Arc<dyn AwsApi>,
    metrics: Option<Arc<AwsApiMetrics>>,
) -> Arc<dyn ProviderStrategy> {
    let mut ops =
        AwsOperations::new(api.clone(), &config.provider.circuit_breaker, &config.performance);
    if let Some(metrics) = metrics {
        ops = ops.with_metrics(metrics);
    }
    let ops = Arc::new(ops);
    let deps = HandlerDeps {
        ops,
        launch_templates: Arc::new(LaunchTemplateManager::new(
            api.clone(),
            config.launch_template.clone(),
        )),
        native_spec: Arc::new(AwsNativeSpecService::new(
            config.template.native_spec_enabled,
            config.template.spec_dir.clone(),
            config.package_name.clone(),
            config.package_version.clone(),
        )),
        machines: Arc::new(MachineAdapter::new()),
        ledger: Arc::new(AcquisitionLedger::new()),
    };

    let mut handlers: HashMap<ProviderApi, Arc<dyn AwsHandler>> = HashMap::new();
    handlers.insert(ProviderApi::Ec2Fleet, Arc::new(Ec2FleetHandler::new(deps.clone())));
    handlers.insert(ProviderApi::SpotFleet, Arc::new(SpotFleetHandler::new(deps.clone())));
    handlers.insert(
        ProviderApi::Asg,
        Arc::new(AsgHandler::new(deps.clone(), config.package_name.clone())),
    );
    handlers.insert(ProviderApi::RunInstances, Arc::new(RunInstancesHandler::new(deps)));

    let capabilities = if instance.capabilities.is_empty() {
        vec![
            "EC2Fleet".to_string(),
            "SpotFleet".to_string(),
            "ASG".to_string(),
            "RunInstances".to_string(),
        ]
    } else {
        instance.capabilities.clone()
    };

    Arc::new(AwsProviderStrategy::new(&instance.name, capabilities, handlers, api))
}
