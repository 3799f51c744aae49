//! Default fork launcher: the chopsticks CLI driven over its `dev_*` RPC.

use std::sync::Arc;

use async_trait::async_trait;
use jsonrpsee::{core::client::ClientT as _, rpc_params, ws_client::WsClient};
use moonwall_foundation_core::{
    Cleanup, DynError,
    config::{BuildBlockMode, ForkConfig},
    readiness::local_ws_endpoint,
    resource::ResourceScope,
};
use moonwall_foundation_dev::process::{LaunchOptions, launch};
use serde_json::{Map, Value};
use tracing::info;

use crate::{
    fork::{
        BlockId, BlockSummary, CreateBlockParams, ForkLauncher, ForkService, LaunchedFork,
        StorageWrite,
    },
    rpc,
};

pub const DEFAULT_PORT: u16 = 8000;

#[derive(Clone, Debug)]
pub struct ChopsticksLauncher {
    command: String,
    base_args: Vec<String>,
}

impl Default for ChopsticksLauncher {
    fn default() -> Self {
        Self {
            command: "npx".to_owned(),
            base_args: vec!["@acala-network/chopsticks@latest".to_owned()],
        }
    }
}

impl ChopsticksLauncher {
    pub fn new(command: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            base_args,
        }
    }

    fn args(&self, config: &ForkConfig, port: u16) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.push(format!("--config={}", config.config_path.display()));
        args.push(format!("--port={port}"));
        if let Some(wasm) = &config.wasm_override {
            args.push(format!("--wasm-override={}", wasm.display()));
        }
        let mode = match config.build_block_mode {
            BuildBlockMode::Batch => "batch",
            BuildBlockMode::Manual => "manual",
            BuildBlockMode::Instant => "instant",
        };
        args.push(format!("--build-block-mode={mode}"));
        args
    }
}

#[async_trait]
impl ForkLauncher for ChopsticksLauncher {
    async fn launch(&self, config: &ForkConfig) -> Result<LaunchedFork, DynError> {
        let port = config.ws_port.unwrap_or(DEFAULT_PORT);
        let launched = launch(LaunchOptions::new(
            self.command.clone(),
            self.args(config, port),
            config.name.clone(),
        ))
        .await?;

        let mut scope = ResourceScope::new();
        scope.defer(launched.cleanup);

        let endpoint = local_ws_endpoint(port);
        let connected = async {
            rpc::wait_until_ready(&endpoint).await?;
            rpc::connect(&endpoint).await
        }
        .await;
        let client = match connected {
            Ok(client) => Arc::new(client),
            Err(error) => {
                scope.close().await;
                return Err(error);
            }
        };
        info!(name = %config.name, %endpoint, pid = launched.process.pid(), "chopsticks ready");

        Ok(LaunchedFork {
            address: "localhost".to_owned(),
            port,
            service: Arc::new(JsonRpcForkService { client }),
            cleanup: scope.into_cleanup(format!("chopsticks {}", config.name)),
        })
    }
}

/// Drives a simulator through its `dev_*` RPC namespace.
pub struct JsonRpcForkService {
    client: Arc<WsClient>,
}

impl JsonRpcForkService {
    #[must_use]
    pub const fn new(client: Arc<WsClient>) -> Self {
        Self { client }
    }

    async fn header(&self, hash: &str) -> Result<Option<BlockSummary>, DynError> {
        let header: Option<rpc::Header> = self
            .client
            .request("chain_getHeader", rpc_params![hash])
            .await?;
        let Some(header) = header else {
            return Ok(None);
        };
        Ok(Some(BlockSummary {
            hash: hash.to_owned(),
            number: rpc::parse_hex_number(&header.number)?,
        }))
    }

    async fn resolve_hash(&self, id: Option<BlockId>) -> Result<Option<String>, DynError> {
        Ok(match id {
            Some(BlockId::Hash(hash)) => Some(hash),
            Some(BlockId::Number(number)) => {
                self.client
                    .request("chain_getBlockHash", rpc_params![number])
                    .await?
            }
            None => Some(self.client.request("chain_getBlockHash", rpc_params![]).await?),
        })
    }
}

/// `{ Module: { method: params } }`, the shape `dev_setStorage` expects.
fn storage_payload(write: &StorageWrite) -> Value {
    let mut method = Map::new();
    method.insert(write.method.clone(), write.params.clone());
    let mut module = Map::new();
    module.insert(write.module.clone(), Value::Object(method));
    Value::Object(module)
}

#[async_trait]
impl ForkService for JsonRpcForkService {
    async fn create_block(&self, params: CreateBlockParams) -> Result<BlockSummary, DynError> {
        let hash: String = self.client.request("dev_newBlock", rpc_params![params]).await?;
        self.header(&hash)
            .await?
            .ok_or_else(|| format!("created block {hash} has no header").into())
    }

    async fn set_storage(&self, write: StorageWrite) -> Result<(), DynError> {
        let _: Value = self
            .client
            .request("dev_setStorage", rpc_params![storage_payload(&write)])
            .await?;
        Ok(())
    }

    async fn get_block(&self, id: Option<BlockId>) -> Result<Option<BlockSummary>, DynError> {
        match self.resolve_hash(id).await? {
            Some(hash) => self.header(&hash).await,
            None => Ok(None),
        }
    }

    async fn set_head(&self, id: BlockId) -> Result<(), DynError> {
        let _: Value = self.client.request("dev_setHead", rpc_params![id]).await?;
        Ok(())
    }
}
