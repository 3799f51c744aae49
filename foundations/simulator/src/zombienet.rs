//! Default network launcher: the zombienet CLI with a JSON network
//! definition.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use jsonrpsee::ws_client::WsClient;
use moonwall_foundation_core::{
    DynError, config::NetworkConfig, readiness::local_ws_endpoint, resource::ResourceScope,
};
use moonwall_foundation_dev::process::{LaunchOptions, launch};
use serde::Deserialize;
use tracing::info;

use crate::{
    network::{LaunchedNetwork, NetworkLauncher, NetworkNode, NetworkService},
    rpc,
};

#[derive(Debug, Deserialize)]
pub struct NetworkDefinition {
    relaychain: RelayDefinition,
    #[serde(default)]
    parachains: Vec<ParachainDefinition>,
}

#[derive(Debug, Deserialize)]
struct RelayDefinition {
    #[serde(default)]
    nodes: Vec<NodeDefinition>,
}

#[derive(Debug, Deserialize)]
struct ParachainDefinition {
    id: u32,
    #[serde(default)]
    collators: Vec<NodeDefinition>,
    #[serde(default)]
    collator: Option<NodeDefinition>,
}

#[derive(Debug, Deserialize)]
struct NodeDefinition {
    name: String,
    #[serde(default, alias = "ws_port")]
    rpc_port: Option<u16>,
}

impl NetworkDefinition {
    pub fn from_json(raw: &str) -> Result<Self, DynError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Every node of the topology; only those with a fixed RPC port carry an
    /// endpoint.
    #[must_use]
    pub fn nodes(&self) -> Vec<NetworkNode> {
        let relay = self.relaychain.nodes.iter().map(|node| (node, None));
        let collators = self.parachains.iter().flat_map(|parachain| {
            parachain
                .collators
                .iter()
                .chain(parachain.collator.as_ref())
                .map(move |node| (node, Some(parachain.id)))
        });
        relay
            .chain(collators)
            .map(|(node, parachain)| NetworkNode {
                name: node.name.clone(),
                endpoint: node.rpc_port.map(local_ws_endpoint),
                parachain,
            })
            .collect()
    }

    #[must_use]
    pub fn relay_endpoint(&self) -> Option<String> {
        self.relaychain
            .nodes
            .iter()
            .find_map(|node| node.rpc_port.map(local_ws_endpoint))
    }
}

async fn read_definition(path: &Path) -> Result<NetworkDefinition, DynError> {
    if path.extension().and_then(|extension| extension.to_str()) != Some("json") {
        return Err(format!("{} is not a JSON network definition", path.display()).into());
    }
    let raw = tokio::fs::read_to_string(path).await?;
    NetworkDefinition::from_json(&raw)
}

#[derive(Clone, Debug)]
pub struct ZombienetLauncher {
    command: String,
    provider: String,
}

impl Default for ZombienetLauncher {
    fn default() -> Self {
        Self::new("zombienet", "native")
    }
}

impl ZombienetLauncher {
    pub fn new(command: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            provider: provider.into(),
        }
    }

    fn launch_options(&self, config: &NetworkConfig) -> LaunchOptions {
        let args = vec![
            "spawn".to_owned(),
            config.config_path.display().to_string(),
            "--provider".to_owned(),
            self.provider.clone(),
        ];
        LaunchOptions::new(self.command.clone(), args, config.name.clone())
            .with_output_echo(!config.disable_log_eavesdropping)
    }
}

#[async_trait]
impl NetworkLauncher for ZombienetLauncher {
    async fn launch(&self, config: &NetworkConfig) -> Result<LaunchedNetwork, DynError> {
        let definition = read_definition(&config.config_path).await?;
        let relay_endpoint = definition.relay_endpoint().ok_or_else(|| {
            format!(
                "{} declares no relay chain node with an rpc_port",
                config.config_path.display()
            )
        })?;

        let launched = launch(self.launch_options(config)).await?;
        let mut scope = ResourceScope::new();
        scope.defer(launched.cleanup);

        let connected = async {
            rpc::wait_until_ready(&relay_endpoint).await?;
            rpc::connect(&relay_endpoint).await
        }
        .await;
        let client = match connected {
            Ok(client) => client,
            Err(error) => {
                scope.close().await;
                return Err(error);
            }
        };
        info!(name = %config.name, relay = %relay_endpoint, "network relay chain reachable");

        Ok(LaunchedNetwork {
            relay_endpoint,
            nodes: definition.nodes(),
            service: Arc::new(RelayChainService { client }),
            cleanup: scope.into_cleanup(format!("zombienet {}", config.name)),
        })
    }
}

struct RelayChainService {
    client: WsClient,
}

#[async_trait]
impl NetworkService for RelayChainService {
    async fn best_block(&self) -> Result<u64, DynError> {
        rpc::best_block_number(&self.client).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFINITION: &str = r#"{
        "relaychain": {
            "chain": "rococo-local",
            "nodes": [
                { "name": "alice", "rpc_port": 9944 },
                { "name": "bob" }
            ]
        },
        "parachains": [
            { "id": 1000, "collator": { "name": "alith", "ws_port": 9947 } },
            { "id": 2000, "collators": [{ "name": "c1", "rpc_port": 9950 }] }
        ]
    }"#;

    #[test]
    fn definition_lists_every_node() {
        let definition = NetworkDefinition::from_json(DEFINITION).unwrap();

        assert_eq!(
            definition.relay_endpoint().as_deref(),
            Some("ws://localhost:9944")
        );
        let nodes = definition.nodes();
        assert_eq!(
            nodes
                .iter()
                .map(|node| (node.name.as_str(), node.parachain))
                .collect::<Vec<_>>(),
            vec![
                ("alice", None),
                ("bob", None),
                ("alith", Some(1000)),
                ("c1", Some(2000))
            ]
        );
        assert_eq!(nodes[1].endpoint, None);
        assert_eq!(nodes[2].endpoint.as_deref(), Some("ws://localhost:9947"));
    }

    #[test]
    fn node_output_is_echoed_unless_eavesdropping_is_disabled() {
        let mut config = NetworkConfig {
            name: "zombie".to_owned(),
            config_path: "network.json".into(),
            disable_default_eth_providers: false,
            disable_log_eavesdropping: false,
            skip_block_check: false,
            startup_timeout_ms: None,
        };
        let launcher = ZombienetLauncher::default();

        let options = launcher.launch_options(&config);
        assert!(options.echo_output);
        assert_eq!(options.args, ["spawn", "network.json", "--provider", "native"]);

        config.disable_log_eavesdropping = true;
        assert!(!launcher.launch_options(&config).echo_output);
    }

    #[tokio::test]
    async fn non_json_definitions_are_rejected() {
        let error = read_definition(Path::new("network.toml")).await.unwrap_err();
        assert!(error.to_string().contains("not a JSON network definition"));
    }
}
