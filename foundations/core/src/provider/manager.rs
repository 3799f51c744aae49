use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use super::{
    Greeting, ProviderClient, ProviderConfig, ProviderConnectionError, ProviderFactory,
    ProviderKind,
};
use crate::{
    DynError,
    policy::{OperationKind, RetryPolicy, TimeoutSpec, defaults, with_timeout},
    resource::{Cleanup, CleanupReport, ResourceScope},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectOptions {
    pub connection_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connection_timeout: defaults::PROVIDER_CONNECTION,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Clone)]
pub struct ConnectedProvider {
    config: ProviderConfig,
    client: Arc<dyn ProviderClient>,
}

impl ConnectedProvider {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub const fn kind(&self) -> ProviderKind {
        self.config.kind
    }

    #[must_use]
    pub const fn config(&self) -> &ProviderConfig {
        &self.config
    }

    #[must_use]
    pub fn client(&self) -> Arc<dyn ProviderClient> {
        Arc::clone(&self.client)
    }

    pub async fn greet(&self) -> Result<Greeting, DynError> {
        self.client.greet().await
    }

    fn into_cleanup(self) -> Cleanup {
        let name = format!("{} provider {}", self.config.kind, self.config.name);
        Cleanup::new(name, move || async move { self.client.disconnect().await })
    }
}

impl std::fmt::Debug for ConnectedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedProvider")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Every provider of one connect call, in connection order.
///
/// Dropping the set without disconnecting releases the providers in the
/// background.
#[derive(Debug, Default)]
pub struct ConnectedProviders {
    providers: Vec<ConnectedProvider>,
    scope: ResourceScope,
}

impl ConnectedProviders {
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectedProvider> {
        self.providers.iter()
    }

    #[must_use]
    pub fn first(&self) -> Option<&ConnectedProvider> {
        self.providers.first()
    }

    /// The provider configured with `endpoint`, if any.
    #[must_use]
    pub fn serving(&self, endpoint: &str) -> Option<&ConnectedProvider> {
        self.providers
            .iter()
            .find(|provider| provider.config.serves(endpoint))
    }

    #[must_use]
    pub fn endpoints(&self) -> Vec<String> {
        self.providers
            .iter()
            .filter_map(|provider| provider.config.primary_endpoint().map(str::to_owned))
            .collect()
    }

    fn push(&mut self, provider: ConnectedProvider) {
        self.scope.defer(provider.clone().into_cleanup());
        self.providers.push(provider);
    }

    /// Disconnects in reverse connection order. Failures are collected, not
    /// raised.
    pub async fn disconnect_all(self) -> CleanupReport {
        self.scope.close().await
    }

    /// One cleanup disconnecting every provider, failing if any of them
    /// failed to disconnect.
    pub fn into_cleanup(self, name: impl Into<String>) -> Cleanup {
        self.scope.into_cleanup(name)
    }
}

/// Connects a set of providers as a unit: either all of them connect or
/// the ones already connected are disconnected again.
pub struct ProviderManager {
    factory: Arc<dyn ProviderFactory>,
    options: ConnectOptions,
}

impl ProviderManager {
    #[must_use]
    pub fn new(factory: Arc<dyn ProviderFactory>, options: ConnectOptions) -> Self {
        Self { factory, options }
    }

    #[must_use]
    pub const fn options(&self) -> ConnectOptions {
        self.options
    }

    pub async fn connect(
        &self,
        configs: &[ProviderConfig],
    ) -> Result<ConnectedProviders, ProviderConnectionError> {
        let prepared = configs
            .iter()
            .map(|config| {
                self.factory
                    .prepare(config)
                    .map(|client| (config.clone(), client))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut connected = ConnectedProviders::default();
        for (config, client) in prepared {
            if let Err(error) = self.connect_one(&config, client.as_ref()).await {
                warn!(
                    provider = %config.name,
                    %error,
                    rollback = connected.len(),
                    "provider connection failed; disconnecting the ones already connected"
                );
                let report = connected.disconnect_all().await;
                if !report.is_clean() {
                    warn!(failed = ?report.failed_resources(), "rollback left providers behind");
                }
                return Err(error);
            }
            info!(provider = %config.name, kind = %config.kind, "provider connected");
            connected.push(ConnectedProvider { config, client });
        }
        Ok(connected)
    }

    async fn connect_one(
        &self,
        config: &ProviderConfig,
        client: &dyn ProviderClient,
    ) -> Result<(), ProviderConnectionError> {
        let policy = RetryPolicy::fixed(self.options.retry_attempts, self.options.retry_delay);
        policy
            .retry(|attempt| async move {
                debug!(provider = %config.name, attempt, "connecting provider");
                let spec = TimeoutSpec::new(
                    OperationKind::ProviderConnection,
                    format!("connecting {} provider `{}`", config.kind, config.name),
                )
                .with_duration(self.options.connection_timeout)
                .with_endpoint(config.primary_endpoint().unwrap_or_default())
                .with_context("attempt", attempt);
                match with_timeout(spec, client.connect()).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(source)) => Err(ProviderConnectionError::new(config, source)),
                    Err(timeout) => Err(ProviderConnectionError::new(config, timeout)),
                }
            })
            .await
    }
}
