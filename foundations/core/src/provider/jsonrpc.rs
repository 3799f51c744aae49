use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use jsonrpsee::{
    core::client::ClientT as _,
    rpc_params,
    ws_client::{WsClient, WsClientBuilder},
};
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    Greeting, ProviderClient, ProviderConfig, ProviderConnectionError, ProviderFactory,
    ProviderProtocol,
};
use crate::{DynError, policy::defaults};

/// Websocket JSON-RPC client used when no richer client library is plugged
/// in.
pub struct JsonRpcProvider {
    protocol: ProviderProtocol,
    endpoint: String,
    request_timeout: Duration,
    client: RwLock<Option<Arc<WsClient>>>,
}

impl JsonRpcProvider {
    #[must_use]
    pub fn new(protocol: ProviderProtocol, endpoint: impl Into<String>) -> Self {
        Self {
            protocol,
            endpoint: endpoint.into(),
            request_timeout: defaults::RPC_CALL,
            client: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn client(&self) -> Result<Arc<WsClient>, DynError> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| format!("not connected to {}", self.endpoint).into())
    }
}

#[async_trait]
impl ProviderClient for JsonRpcProvider {
    async fn connect(&self) -> Result<(), DynError> {
        let client = WsClientBuilder::default()
            .connection_timeout(defaults::WEBSOCKET_CONNECT)
            .request_timeout(self.request_timeout)
            .build(&self.endpoint)
            .await?;
        debug!(endpoint = %self.endpoint, "websocket connected");
        *self.client.write().await = Some(Arc::new(client));
        Ok(())
    }

    async fn greet(&self) -> Result<Greeting, DynError> {
        let client = self.client().await?;
        match self.protocol {
            ProviderProtocol::Substrate => {
                let chain: String = client.request("system_chain", rpc_params![]).await?;
                let version: serde_json::Value = client
                    .request("state_getRuntimeVersion", rpc_params![])
                    .await?;
                let spec_version = version
                    .get("specVersion")
                    .and_then(serde_json::Value::as_u64)
                    .and_then(|value| u32::try_from(value).ok());
                Ok(Greeting {
                    chain,
                    spec_version,
                })
            }
            ProviderProtocol::Ethereum => {
                let chain_id: String = client.request("eth_chainId", rpc_params![]).await?;
                Ok(Greeting {
                    chain: parse_chain_id(&chain_id)?.to_string(),
                    spec_version: None,
                })
            }
        }
    }

    async fn disconnect(&self) -> Result<(), DynError> {
        if self.client.write().await.take().is_some() {
            debug!(endpoint = %self.endpoint, "websocket closed");
        }
        Ok(())
    }
}

fn parse_chain_id(raw: &str) -> Result<u64, DynError> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    u64::from_str_radix(digits, 16)
        .map_err(|error| format!("invalid chain id {raw}: {error}").into())
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonRpcProviderFactory;

impl ProviderFactory for JsonRpcProviderFactory {
    fn prepare(
        &self,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn ProviderClient>, ProviderConnectionError> {
        let endpoint = config
            .primary_endpoint()
            .ok_or_else(|| ProviderConnectionError::new(config, "no endpoint configured"))?;
        if !endpoint.starts_with("ws://") && !endpoint.starts_with("wss://") {
            return Err(ProviderConnectionError::new(
                config,
                format!("unsupported endpoint scheme in {endpoint}"),
            ));
        }
        Ok(Arc::new(JsonRpcProvider::new(config.kind.protocol(), endpoint)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderKind;

    #[test]
    fn chain_ids_are_hex() {
        assert_eq!(parse_chain_id("0x507").unwrap(), 1287);
        assert!(parse_chain_id("moonbase").is_err());
    }

    #[test]
    fn prepare_rejects_missing_or_http_endpoints() {
        let mut config = ProviderConfig::new("eth", ProviderKind::Ethers, "http://localhost:9944");
        assert!(JsonRpcProviderFactory.prepare(&config).is_err());

        config.endpoints.clear();
        let error = JsonRpcProviderFactory.prepare(&config).err().unwrap();
        assert!(error.to_string().contains("no endpoint configured"));

        config.endpoints.push("ws://localhost:9944".to_owned());
        assert!(JsonRpcProviderFactory.prepare(&config).is_ok());
    }

    #[tokio::test]
    async fn greeting_requires_connection() {
        let provider = JsonRpcProvider::new(ProviderProtocol::Substrate, "ws://localhost:1");
        let error = provider.greet().await.unwrap_err();
        assert!(error.to_string().contains("not connected"));
        provider.disconnect().await.unwrap();
    }
}
