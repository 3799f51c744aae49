//! Foundation for chains that are already running elsewhere: nothing is
//! launched, only providers are connected.

use std::sync::Arc;

use async_trait::async_trait;
use moonwall_foundation_core::{
    Activation, Foundation, FoundationKind, FoundationStatus, HealthCheckError,
    HealthCheckReason, Lifecycle, ShutdownError, Started, StartupError, StartupReason,
    config::ReadOnlyConfig,
    policy::{OperationKind, TimeoutSpec, with_timeout},
    provider::{
        ConnectOptions, ConnectedProvider, JsonRpcProviderFactory, ProviderFactory, ProviderKind,
        ProviderManager,
    },
};
use moonwall_tracing::foundation_span;
use tokio::sync::watch;
use tracing::{Instrument as _, debug, info};

const KIND: FoundationKind = FoundationKind::ReadOnly;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderSummary {
    pub name: String,
    pub kind: ProviderKind,
    pub endpoint: String,
}

#[derive(Clone, Debug)]
pub struct ReadOnlyInfo {
    pub providers: Vec<ProviderSummary>,
    pub config: ReadOnlyConfig,
}

struct ReadOnlyRuntime {
    providers: Vec<ConnectedProvider>,
}

impl ReadOnlyRuntime {
    fn target(&self, endpoint: Option<&str>) -> Result<&ConnectedProvider, HealthCheckReason> {
        match endpoint {
            Some(endpoint) => self
                .providers
                .iter()
                .find(|provider| provider.config().serves(endpoint))
                .ok_or_else(|| HealthCheckReason::UnknownEndpoint(endpoint.to_owned())),
            None => self
                .providers
                .first()
                .ok_or_else(|| HealthCheckReason::Probe("no providers connected".into())),
        }
    }
}

pub struct ReadOnlyFoundation {
    lifecycle: Lifecycle<ReadOnlyRuntime>,
    factory: Arc<dyn ProviderFactory>,
    options: ConnectOptions,
}

impl Default for ReadOnlyFoundation {
    fn default() -> Self {
        Self::new(Arc::new(JsonRpcProviderFactory), ConnectOptions::default())
    }
}

impl ReadOnlyFoundation {
    #[must_use]
    pub fn new(factory: Arc<dyn ProviderFactory>, options: ConnectOptions) -> Self {
        Self {
            lifecycle: Lifecycle::new(KIND),
            factory,
            options,
        }
    }

    pub async fn connect(
        &self,
        config: ReadOnlyConfig,
    ) -> Result<Started<ReadOnlyInfo>, StartupError> {
        self.start(config).await
    }

    pub async fn disconnect(&self) -> Result<(), ShutdownError> {
        self.stop().await
    }

    async fn bring_up(
        &self,
        config: ReadOnlyConfig,
    ) -> Result<Activation<ReadOnlyRuntime, ReadOnlyInfo>, StartupReason> {
        if config.connections.is_empty() {
            return Err(StartupReason::NoConnections);
        }

        let manager = ProviderManager::new(Arc::clone(&self.factory), self.options);
        let connected = manager
            .connect(&config.connections)
            .instrument(foundation_span(KIND.as_str(), "connect", Some(&config.name)))
            .await?;
        if connected.is_empty() {
            return Err(StartupReason::NoProvidersConnected);
        }

        if config.disable_runtime_version_check {
            debug!(name = %config.name, "runtime version check disabled");
        } else {
            for provider in connected.iter() {
                greet(provider).await;
            }
        }

        let providers: Vec<ConnectedProvider> = connected.iter().cloned().collect();
        let endpoints = connected.endpoints();
        info!(name = %config.name, count = providers.len(), "providers connected");

        let cleanup = connected.into_cleanup(format!("providers of {}", config.name));

        Ok(Activation {
            status: FoundationStatus::Connected {
                count: providers.len(),
                endpoints,
            },
            info: ReadOnlyInfo {
                providers: providers.iter().map(summary).collect(),
                config,
            },
            runtime: ReadOnlyRuntime { providers },
            cleanup,
        })
    }
}

fn summary(provider: &ConnectedProvider) -> ProviderSummary {
    ProviderSummary {
        name: provider.name().to_owned(),
        kind: provider.kind(),
        endpoint: provider
            .config()
            .primary_endpoint()
            .unwrap_or_default()
            .to_owned(),
    }
}

/// Best effort; failures are only logged.
async fn greet(provider: &ConnectedProvider) {
    let spec = TimeoutSpec::new(
        OperationKind::RpcCall,
        format!("greeting provider `{}`", provider.name()),
    );
    match with_timeout(spec, provider.greet()).await {
        Ok(Ok(greeting)) => info!(
            provider = %provider.name(),
            chain = %greeting.chain,
            spec_version = ?greeting.spec_version,
            "provider greeted"
        ),
        Ok(Err(error)) => debug!(provider = %provider.name(), %error, "greeting failed"),
        Err(timeout) => debug!(provider = %provider.name(), %timeout, "greeting timed out"),
    }
}

#[async_trait]
impl Foundation for ReadOnlyFoundation {
    type Config = ReadOnlyConfig;
    type Info = ReadOnlyInfo;

    fn kind(&self) -> FoundationKind {
        KIND
    }

    async fn start(&self, config: ReadOnlyConfig) -> Result<Started<ReadOnlyInfo>, StartupError> {
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
        let provider = runtime
            .target(endpoint)
            .map_err(|reason| HealthCheckError::new(KIND, name.clone(), reason))?;

        let spec = TimeoutSpec::new(
            OperationKind::HealthCheck,
            format!("health check of provider `{}`", provider.name()),
        )
        .with_endpoint(provider.config().primary_endpoint().unwrap_or_default());
        let outcome = with_timeout(spec, provider.greet())
            .instrument(foundation_span(KIND.as_str(), "health_check", Some(&name)))
            .await;

        let reason = match outcome {
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(error)) => HealthCheckReason::Probe(error),
            Err(timeout) => HealthCheckReason::Timeout(timeout),
        };
        Err(HealthCheckError::new(KIND, name, reason))
    }
}
