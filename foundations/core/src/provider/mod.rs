//! Client connections to a running chain.

mod jsonrpc;
mod manager;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use jsonrpc::{JsonRpcProvider, JsonRpcProviderFactory};
pub use manager::{ConnectOptions, ConnectedProvider, ConnectedProviders, ProviderManager};

use crate::DynError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProviderKind {
    PolkadotJs,
    Ethers,
    Web3,
    Viem,
    Papi,
}

/// Which RPC dialect a provider speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderProtocol {
    Substrate,
    Ethereum,
}

impl ProviderKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PolkadotJs => "polkadotJs",
            Self::Ethers => "ethers",
            Self::Web3 => "web3",
            Self::Viem => "viem",
            Self::Papi => "papi",
        }
    }

    #[must_use]
    pub const fn protocol(self) -> ProviderProtocol {
        match self {
            Self::PolkadotJs | Self::Papi => ProviderProtocol::Substrate,
            Self::Ethers | Self::Web3 | Self::Viem => ProviderProtocol::Ethereum,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub endpoints: Vec<String>,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, kind: ProviderKind, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            endpoints: vec![endpoint.into()],
        }
    }

    #[must_use]
    pub fn primary_endpoint(&self) -> Option<&str> {
        self.endpoints.first().map(String::as_str)
    }

    #[must_use]
    pub fn serves(&self, endpoint: &str) -> bool {
        self.endpoints.iter().any(|candidate| candidate == endpoint)
    }
}

/// Identity reported by a connected chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Greeting {
    pub chain: String,
    pub spec_version: Option<u32>,
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn connect(&self) -> Result<(), DynError>;

    async fn greet(&self) -> Result<Greeting, DynError>;

    async fn disconnect(&self) -> Result<(), DynError>;
}

/// Turns configuration into unconnected clients. Must not perform I/O.
pub trait ProviderFactory: Send + Sync {
    fn prepare(&self, config: &ProviderConfig)
    -> Result<Arc<dyn ProviderClient>, ProviderConnectionError>;
}

#[derive(Debug, thiserror::Error)]
#[error("{kind} provider `{name}` could not connect to {endpoint}: {source}")]
pub struct ProviderConnectionError {
    kind: ProviderKind,
    name: String,
    endpoint: String,
    #[source]
    source: DynError,
}

impl ProviderConnectionError {
    pub fn new(config: &ProviderConfig, source: impl Into<DynError>) -> Self {
        Self {
            kind: config.kind,
            name: config.name.clone(),
            endpoint: config.primary_endpoint().unwrap_or("<none>").to_owned(),
            source: source.into(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ProviderKind {
        self.kind
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}
