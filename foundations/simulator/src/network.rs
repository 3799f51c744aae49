//! Multi-node network foundation (`zombie`).

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use moonwall_foundation_core::{
    Activation, Cleanup, DynError, Foundation, FoundationKind, FoundationStatus, HealthCheckError,
    HealthCheckReason, Lifecycle, ShutdownError, Started, StartupError, StartupReason,
    config::NetworkConfig,
    provider::{ProviderConfig, ProviderKind},
    policy::{OperationKind, RetryPolicy, TimeoutSpec, with_timeout},
    readiness::{JsonRpcProbe, ReadinessCheck, ReadinessProbe, check_ready},
    resource::ResourceScope,
};
use moonwall_tracing::foundation_span;
use tokio::sync::watch;
use tracing::{Instrument as _, debug, info};

use crate::zombienet::ZombienetLauncher;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkNode {
    pub name: String,
    /// `None` when the node has no fixed RPC port.
    pub endpoint: Option<String>,
    /// `None` for relay chain validators.
    pub parachain: Option<u32>,
}

#[async_trait]
pub trait NetworkService: Send + Sync {
    async fn best_block(&self) -> Result<u64, DynError>;
}

pub struct LaunchedNetwork {
    pub relay_endpoint: String,
    pub nodes: Vec<NetworkNode>,
    pub service: Arc<dyn NetworkService>,
    pub cleanup: Cleanup,
}

#[async_trait]
pub trait NetworkLauncher: Send + Sync {
    async fn launch(&self, config: &NetworkConfig) -> Result<LaunchedNetwork, DynError>;
}

#[derive(Clone, Debug)]
pub struct NetworkInfo {
    pub relay_endpoint: String,
    pub node_count: usize,
    pub nodes: Vec<NetworkNode>,
    /// Connections a suite uses unless it configures its own.
    pub providers: Vec<ProviderConfig>,
    pub config: NetworkConfig,
}

/// A substrate provider for the relay chain and for the first addressable
/// parachain node, plus ethereum providers for that node when `ethereum` is
/// set.
#[must_use]
pub fn default_providers(
    relay_endpoint: &str,
    nodes: &[NetworkNode],
    ethereum: bool,
) -> Vec<ProviderConfig> {
    let mut providers = vec![ProviderConfig::new(
        "relaychain",
        ProviderKind::PolkadotJs,
        relay_endpoint,
    )];
    let parachain = nodes
        .iter()
        .filter(|node| node.parachain.is_some())
        .find_map(|node| node.endpoint.as_deref());
    if let Some(endpoint) = parachain {
        providers.push(ProviderConfig::new(
            "parachain",
            ProviderKind::PolkadotJs,
            endpoint,
        ));
        if ethereum {
            providers.push(ProviderConfig::new("ethers", ProviderKind::Ethers, endpoint));
            providers.push(ProviderConfig::new("viem", ProviderKind::Viem, endpoint));
        }
    }
    providers
}

struct NetworkRuntime {
    relay_endpoint: String,
}

pub struct NetworkFoundation {
    lifecycle: Lifecycle<NetworkRuntime>,
    launcher: Arc<dyn NetworkLauncher>,
    probe: Arc<dyn ReadinessProbe>,
    block_check: RetryPolicy,
}

impl Default for NetworkFoundation {
    fn default() -> Self {
        Self::new(Arc::new(ZombienetLauncher::default()))
    }
}

impl NetworkFoundation {
    #[must_use]
    pub fn new(launcher: Arc<dyn NetworkLauncher>) -> Self {
        Self {
            lifecycle: Lifecycle::new(FoundationKind::Zombie),
            launcher,
            probe: Arc::new(JsonRpcProbe::default()),
            block_check: RetryPolicy::fixed(240, Duration::from_millis(500)),
        }
    }

    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Polling schedule used while waiting for the first block.
    #[must_use]
    pub fn with_block_check(mut self, policy: RetryPolicy) -> Self {
        self.block_check = policy;
        self
    }

    async fn wait_for_blocks(&self, service: &dyn NetworkService) -> Result<u64, DynError> {
        self.block_check
            .retry(|attempt| async move {
                match service.best_block().await {
                    Ok(best) if best > 0 => Ok(best),
                    Ok(_) => {
                        debug!(attempt, "network is still at genesis");
                        Err(DynError::from("network is still at genesis"))
                    }
                    Err(error) => Err(error),
                }
            })
            .await
    }

    async fn bring_up(
        &self,
        config: NetworkConfig,
    ) -> Result<Activation<NetworkRuntime, NetworkInfo>, StartupReason> {
        let launched = self
            .launcher
            .launch(&config)
            .await
            .map_err(StartupReason::Network)?;
        let mut scope = ResourceScope::new();
        scope.defer(launched.cleanup);

        if config.skip_block_check {
            debug!(name = %config.name, "block production check skipped");
        } else {
            match self.wait_for_blocks(launched.service.as_ref()).await {
                Ok(best) => info!(name = %config.name, best, "network is producing blocks"),
                Err(error) => {
                    scope.close().await;
                    return Err(StartupReason::BlockProduction(error));
                }
            }
        }

        info!(
            name = %config.name,
            relay = %launched.relay_endpoint,
            nodes = launched.nodes.len(),
            "network running"
        );
        Ok(Activation {
            status: FoundationStatus::Running {
                endpoint: launched.relay_endpoint.clone(),
                pid: None,
            },
            runtime: NetworkRuntime {
                relay_endpoint: launched.relay_endpoint.clone(),
            },
            cleanup: scope.into_cleanup(format!("network {}", config.name)),
            info: NetworkInfo {
                providers: default_providers(
                    &launched.relay_endpoint,
                    &launched.nodes,
                    !config.disable_default_eth_providers,
                ),
                relay_endpoint: launched.relay_endpoint,
                node_count: launched.nodes.len(),
                nodes: launched.nodes,
                config,
            },
        })
    }
}

#[async_trait]
impl Foundation for NetworkFoundation {
    type Config = NetworkConfig;
    type Info = NetworkInfo;

    fn kind(&self) -> FoundationKind {
        FoundationKind::Zombie
    }

    async fn start(&self, config: NetworkConfig) -> Result<Started<NetworkInfo>, StartupError> {
        let name = config.name.clone();
        let startup_timeout_ms = config.startup_timeout_ms;
        self.lifecycle
            .start(&name, startup_timeout_ms, self.bring_up(config))
            .await
    }

    async fn stop(&self) -> Result<(), ShutdownError> {
        self.lifecycle.teardown().await
    }

    fn status(&self) -> FoundationStatus {
        self.lifecycle.status()
    }

    fn subscribe_status(&self) -> watch::Receiver<FoundationStatus> {
        self.lifecycle.subscribe()
    }

    async fn health_check(&self, endpoint: Option<&str>) -> Result<(), HealthCheckError> {
        let runtime = self.lifecycle.require_active()?;
        let name = self.lifecycle.name().unwrap_or_default();
        let endpoint = endpoint.unwrap_or(&runtime.relay_endpoint).to_owned();
        let spec = TimeoutSpec::new(
            OperationKind::HealthCheck,
            format!("health check of network `{name}`"),
        )
        .with_endpoint(endpoint.clone());
        let probe = check_ready(
            self.probe.as_ref(),
            &endpoint,
            false,
            ReadinessCheck::health_check(),
        );
        let outcome = with_timeout(spec, probe)
            .instrument(foundation_span(
                FoundationKind::Zombie.as_str(),
                "health_check",
                Some(&name),
            ))
            .await;

        let reason = match outcome {
            Ok(Ok(true)) => return Ok(()),
            Ok(Ok(false)) => HealthCheckReason::NotReady,
            Ok(Err(error)) => HealthCheckReason::Probe(error.into()),
            Err(timeout) => HealthCheckReason::Timeout(timeout),
        };
        Err(HealthCheckError::new(FoundationKind::Zombie, name, reason))
    }
}
