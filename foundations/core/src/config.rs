//! Foundation configuration as it appears in environment YAML files.

use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{provider::ProviderConfig, status::FoundationStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FoundationKind {
    Dev,
    Chopsticks,
    Zombie,
    ReadOnly,
}

impl FoundationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Chopsticks => "chopsticks",
            Self::Zombie => "zombie",
            Self::ReadOnly => "read_only",
        }
    }

    /// Whether the foundation attaches to existing endpoints instead of
    /// owning a process.
    #[must_use]
    pub const fn is_connection(self) -> bool {
        matches!(self, Self::ReadOnly)
    }

    #[must_use]
    pub const fn idle_status(self) -> FoundationStatus {
        if self.is_connection() {
            FoundationStatus::Disconnected
        } else {
            FoundationStatus::Stopped
        }
    }

    #[must_use]
    pub const fn pending_status(self) -> FoundationStatus {
        if self.is_connection() {
            FoundationStatus::Connecting
        } else {
            FoundationStatus::Starting
        }
    }
}

impl fmt::Display for FoundationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FoundationConfig {
    Dev(DevConfig),
    Chopsticks(ForkConfig),
    Zombie(NetworkConfig),
    ReadOnly(ReadOnlyConfig),
}

impl FoundationConfig {
    #[must_use]
    pub const fn kind(&self) -> FoundationKind {
        match self {
            Self::Dev(_) => FoundationKind::Dev,
            Self::Chopsticks(_) => FoundationKind::Chopsticks,
            Self::Zombie(_) => FoundationKind::Zombie,
            Self::ReadOnly(_) => FoundationKind::ReadOnly,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Dev(config) => &config.name,
            Self::Chopsticks(config) => &config.name,
            Self::Zombie(config) => &config.name,
            Self::ReadOnly(config) => &config.name,
        }
    }

    #[must_use]
    pub const fn startup_timeout_ms(&self) -> Option<u64> {
        match self {
            Self::Dev(config) => config.startup_timeout_ms,
            Self::Chopsticks(config) => config.startup_timeout_ms,
            Self::Zombie(config) => config.startup_timeout_ms,
            Self::ReadOnly(config) => config.startup_timeout_ms,
        }
    }
}

/// A single locally launched node binary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DevConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub is_ethereum_chain: bool,
    #[serde(default)]
    pub log_directory: Option<PathBuf>,
    #[serde(default)]
    pub startup_timeout_ms: Option<u64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainType {
    Relaychain,
    #[default]
    Parachain,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildBlockMode {
    Batch,
    #[default]
    Manual,
    Instant,
}

/// A forked chain served by the simulator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForkConfig {
    pub name: String,
    pub config_path: PathBuf,
    #[serde(default)]
    pub ws_port: Option<u16>,
    /// Describes the forked chain for callers choosing providers; the
    /// simulator command line does not depend on it.
    #[serde(default)]
    pub chain_type: ChainType,
    #[serde(default)]
    pub wasm_override: Option<PathBuf>,
    #[serde(default)]
    pub build_block_mode: BuildBlockMode,
    #[serde(default)]
    pub startup_timeout_ms: Option<u64>,
}

/// A multi-node network described by a network definition file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub config_path: PathBuf,
    /// Leaves the ethereum providers out of the network's default set.
    #[serde(default)]
    pub disable_default_eth_providers: bool,
    /// Keeps node output in the log file only instead of also tracing it.
    #[serde(default)]
    pub disable_log_eavesdropping: bool,
    #[serde(default)]
    pub skip_block_check: bool,
    #[serde(default)]
    pub startup_timeout_ms: Option<u64>,
}

/// Connections to chains that are already running somewhere.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadOnlyConfig {
    pub name: String,
    #[serde(default)]
    pub connections: Vec<ProviderConfig>,
    #[serde(default)]
    pub disable_runtime_version_check: bool,
    #[serde(default)]
    pub startup_timeout_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderKind;

    #[test]
    fn parses_tagged_foundations() {
        let raw = r#"
- type: dev
  name: moonbeam
  command: ./moonbeam
  args: ["--dev", "--sealing=manual"]
  is_ethereum_chain: true
- type: chopsticks
  name: fork
  config_path: configs/polkadot.yml
  chain_type: relaychain
  build_block_mode: instant
- type: zombie
  name: net
  config_path: configs/zombie.json
  skip_block_check: true
- type: read_only
  name: live
  connections:
    - name: para
      type: polkadotJs
      endpoints: ["wss://rpc.example.org"]
"#;
        let configs: Vec<FoundationConfig> = serde_yaml::from_str(raw).unwrap();

        assert_eq!(
            configs.iter().map(FoundationConfig::kind).collect::<Vec<_>>(),
            vec![
                FoundationKind::Dev,
                FoundationKind::Chopsticks,
                FoundationKind::Zombie,
                FoundationKind::ReadOnly
            ]
        );
        let FoundationConfig::Dev(dev) = &configs[0] else {
            panic!("expected dev config");
        };
        assert!(dev.is_ethereum_chain);
        assert_eq!(dev.startup_timeout_ms, None);
        let FoundationConfig::Chopsticks(fork) = &configs[1] else {
            panic!("expected fork config");
        };
        assert_eq!(fork.chain_type, ChainType::Relaychain);
        assert_eq!(fork.build_block_mode, BuildBlockMode::Instant);
        let FoundationConfig::ReadOnly(read_only) = &configs[3] else {
            panic!("expected read-only config");
        };
        assert_eq!(read_only.connections[0].kind, ProviderKind::PolkadotJs);
        assert_eq!(configs[2].name(), "net");
    }

    #[test]
    fn idle_status_depends_on_kind() {
        assert_eq!(FoundationKind::Dev.idle_status(), FoundationStatus::Stopped);
        assert_eq!(
            FoundationKind::ReadOnly.idle_status(),
            FoundationStatus::Disconnected
        );
        assert_eq!(
            FoundationKind::ReadOnly.pending_status(),
            FoundationStatus::Connecting
        );
    }
}
