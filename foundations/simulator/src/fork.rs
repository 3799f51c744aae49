//! Forked-chain simulator foundation (`chopsticks`).

use std::sync::Arc;

use async_trait::async_trait;
use moonwall_foundation_core::{
    Activation, Cleanup, DynError, Foundation, FoundationKind, FoundationStatus, HealthCheckError,
    HealthCheckReason, Lifecycle, ShutdownError, Started, StartupError, StartupReason,
    config::ForkConfig,
    policy::{OperationKind, TimeoutError, TimeoutSpec, with_timeout},
};
use moonwall_tracing::foundation_span;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{Instrument as _, debug, info};

use crate::chopsticks::ChopsticksLauncher;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BlockId {
    Number(u64),
    Hash(String),
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(number) => write!(f, "#{number}"),
            Self::Hash(hash) => f.write_str(hash),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CreateBlockParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transactions: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StorageWrite {
    pub module: String,
    pub method: String,
    pub params: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockSummary {
    pub hash: String,
    pub number: u64,
}

/// Runtime control surface of a forked chain.
#[async_trait]
pub trait ForkService: Send + Sync {
    async fn create_block(&self, params: CreateBlockParams) -> Result<BlockSummary, DynError>;

    async fn set_storage(&self, write: StorageWrite) -> Result<(), DynError>;

    /// `None` asks for the current head.
    async fn get_block(&self, id: Option<BlockId>) -> Result<Option<BlockSummary>, DynError>;

    async fn set_head(&self, id: BlockId) -> Result<(), DynError>;
}

pub struct LaunchedFork {
    pub address: String,
    pub port: u16,
    pub service: Arc<dyn ForkService>,
    pub cleanup: Cleanup,
}

#[async_trait]
pub trait ForkLauncher: Send + Sync {
    async fn launch(&self, config: &ForkConfig) -> Result<LaunchedFork, DynError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error("fork simulator is not running")]
    NotRunning,
    #[error("block operation failed: {0}")]
    Simulator(#[source] DynError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("fork simulator is not running")]
    NotRunning,
    #[error("storage write rejected: {0}")]
    Simulator(#[source] DynError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
}

#[derive(Clone, Debug)]
pub struct ForkInfo {
    pub address: String,
    pub port: u16,
    pub endpoint: String,
    pub config: ForkConfig,
}

struct ForkRuntime {
    service: Arc<dyn ForkService>,
}

pub struct ForkFoundation {
    lifecycle: Lifecycle<ForkRuntime>,
    launcher: Arc<dyn ForkLauncher>,
}

impl Default for ForkFoundation {
    fn default() -> Self {
        Self::new(Arc::new(ChopsticksLauncher::default()))
    }
}

impl ForkFoundation {
    #[must_use]
    pub fn new(launcher: Arc<dyn ForkLauncher>) -> Self {
        Self {
            lifecycle: Lifecycle::new(FoundationKind::Chopsticks),
            launcher,
        }
    }

    fn name(&self) -> String {
        self.lifecycle.name().unwrap_or_default()
    }

    pub async fn create_block(
        &self,
        params: CreateBlockParams,
    ) -> Result<BlockSummary, BlockError> {
        let runtime = self.lifecycle.runtime().ok_or(BlockError::NotRunning)?;
        let name = self.name();
        let spec = TimeoutSpec::new(
            OperationKind::BlockCreation,
            format!("creating block on `{name}`"),
        )
        .with_context("count", params.count.unwrap_or(1));
        let block = with_timeout(spec, runtime.service.create_block(params))
            .instrument(span("create_block", &name))
            .await?
            .map_err(BlockError::Simulator)?;
        debug!(number = block.number, hash = %block.hash, "block created");
        Ok(block)
    }

    pub async fn set_storage(&self, write: StorageWrite) -> Result<(), StorageError> {
        let runtime = self.lifecycle.runtime().ok_or(StorageError::NotRunning)?;
        let name = self.name();
        let spec = TimeoutSpec::new(
            OperationKind::StorageOperation,
            format!("setting {}.{} on `{name}`", write.module, write.method),
        );
        with_timeout(spec, runtime.service.set_storage(write))
            .instrument(span("set_storage", &name))
            .await?
            .map_err(StorageError::Simulator)
    }

    pub async fn get_block(
        &self,
        id: Option<BlockId>,
    ) -> Result<Option<BlockSummary>, BlockError> {
        let runtime = self.lifecycle.runtime().ok_or(BlockError::NotRunning)?;
        let name = self.name();
        let target = id.as_ref().map_or_else(|| "head".to_owned(), ToString::to_string);
        let spec = TimeoutSpec::new(
            OperationKind::RpcCall,
            format!("fetching block {target} on `{name}`"),
        );
        with_timeout(spec, runtime.service.get_block(id))
            .instrument(span("get_block", &name))
            .await?
            .map_err(BlockError::Simulator)
    }

    pub async fn set_head(&self, id: BlockId) -> Result<(), BlockError> {
        let runtime = self.lifecycle.runtime().ok_or(BlockError::NotRunning)?;
        let name = self.name();
        let spec = TimeoutSpec::new(
            OperationKind::RpcCall,
            format!("setting head of `{name}` to {id}"),
        );
        with_timeout(spec, runtime.service.set_head(id))
            .instrument(span("set_head", &name))
            .await?
            .map_err(BlockError::Simulator)
    }

    async fn bring_up(
        &self,
        config: ForkConfig,
    ) -> Result<Activation<ForkRuntime, ForkInfo>, StartupReason> {
        let launched = self
            .launcher
            .launch(&config)
            .await
            .map_err(StartupReason::Simulator)?;
        let endpoint = format!("ws://{}:{}", launched.address, launched.port);
        info!(name = %config.name, %endpoint, "fork simulator running");
        Ok(Activation {
            status: FoundationStatus::Running {
                endpoint: endpoint.clone(),
                pid: None,
            },
            runtime: ForkRuntime {
                service: launched.service,
            },
            cleanup: launched.cleanup,
            info: ForkInfo {
                address: launched.address,
                port: launched.port,
                endpoint,
                config,
            },
        })
    }
}

fn span(operation: &str, name: &str) -> tracing::Span {
    foundation_span(FoundationKind::Chopsticks.as_str(), operation, Some(name))
}

#[async_trait]
impl Foundation for ForkFoundation {
    type Config = ForkConfig;
    type Info = ForkInfo;

    fn kind(&self) -> FoundationKind {
        FoundationKind::Chopsticks
    }

    async fn start(&self, config: ForkConfig) -> Result<Started<ForkInfo>, StartupError> {
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

    async fn health_check(&self, _endpoint: Option<&str>) -> Result<(), HealthCheckError> {
        let runtime = self.lifecycle.require_active()?;
        let name = self.name();
        let spec = TimeoutSpec::new(
            OperationKind::HealthCheck,
            format!("health check of fork `{name}`"),
        );
        let outcome = with_timeout(spec, runtime.service.get_block(None))
            .instrument(span("health_check", &name))
            .await;

        let reason = match outcome {
            Ok(Ok(Some(_))) => return Ok(()),
            Ok(Ok(None)) => HealthCheckReason::Probe("simulator has no head block".into()),
            Ok(Err(error)) => HealthCheckReason::Probe(error),
            Err(timeout) => HealthCheckReason::Timeout(timeout),
        };
        Err(HealthCheckError::new(FoundationKind::Chopsticks, name, reason))
    }
}
