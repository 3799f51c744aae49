use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use moonwall_foundation_core::{
    Activation, Foundation, FoundationKind, FoundationStatus, HealthCheckError, HealthCheckReason,
    Lifecycle, ShutdownError, Started, StartupError, StartupReason,
    config::DevConfig,
    policy::{OperationKind, TimeoutSpec, with_timeout},
    readiness::{JsonRpcProbe, ReadinessCheck, ReadinessProbe, check_ready, local_ws_endpoint},
    resource::{Managed, ResourceScope},
};
use moonwall_tracing::foundation_span;
use tokio::sync::watch;
use tracing::{Instrument as _, info, warn};

use crate::{
    container::{
        ConflictPrompt, ContainerRuntime, DockerCli, TerminalPrompt, image_from_args,
        is_docker_command, resolve_conflicts,
    },
    discovery::PortDiscovery,
    process::{DEFAULT_LOG_DIRECTORY, LaunchOptions, ProcessHandle, launch},
};

/// Pre-allocated RPC port handed out by an outer orchestrator.
pub const RPC_PORT_ENV: &str = "MOONWALL_RPC_PORT";

const RPC_PORT_FLAGS: [&str; 2] = ["--rpc-port", "--ws-port"];

#[derive(Clone, Debug)]
pub struct DevInfo {
    pub process: ProcessHandle,
    pub port: u16,
    pub endpoint: String,
    pub log_path: PathBuf,
    pub config: DevConfig,
}

struct DevRuntime {
    port: u16,
    is_ethereum_chain: bool,
}

/// How the node's RPC port gets decided.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PortPlan {
    /// The port is known before launch.
    Fixed(u16),
    /// The node picks a port and it has to be discovered.
    Discover,
}

/// Adds an RPC port flag unless one is present and reports whether the port
/// still has to be discovered.
pub(crate) fn plan_rpc_port(args: &[String], preallocated: Option<u16>) -> (Vec<String>, PortPlan) {
    let mut args = args.to_vec();
    let explicit = args.iter().find_map(|arg| {
        RPC_PORT_FLAGS
            .iter()
            .find_map(|flag| arg.strip_prefix(flag))
            .map(|rest| rest.strip_prefix('=').and_then(|value| value.parse::<u16>().ok()))
    });
    let plan = match (explicit, preallocated) {
        (Some(Some(port)), _) if port != 0 => PortPlan::Fixed(port),
        (Some(_), _) => PortPlan::Discover,
        (None, Some(port)) => {
            args.push(format!("--rpc-port={port}"));
            PortPlan::Fixed(port)
        }
        (None, None) => {
            args.push("--rpc-port=0".to_owned());
            PortPlan::Discover
        }
    };
    (args, plan)
}

fn preallocated_port() -> Option<u16> {
    let raw = std::env::var(RPC_PORT_ENV).ok()?;
    match raw.parse() {
        Ok(port) => Some(port),
        Err(error) => {
            warn!(value = %raw, %error, "ignoring invalid {RPC_PORT_ENV}");
            None
        }
    }
}

/// A single node binary launched on the local machine.
pub struct DevFoundation {
    lifecycle: Lifecycle<DevRuntime>,
    discovery: PortDiscovery,
    probe: Arc<dyn ReadinessProbe>,
    containers: Arc<dyn ContainerRuntime>,
    prompt: Arc<dyn ConflictPrompt>,
}

impl Default for DevFoundation {
    fn default() -> Self {
        Self::new()
    }
}

impl DevFoundation {
    #[must_use]
    pub fn new() -> Self {
        let probe: Arc<dyn ReadinessProbe> = Arc::new(JsonRpcProbe::default());
        Self {
            lifecycle: Lifecycle::new(FoundationKind::Dev),
            discovery: PortDiscovery::default().with_probe(Arc::clone(&probe)),
            probe,
            containers: Arc::new(DockerCli),
            prompt: Arc::new(TerminalPrompt),
        }
    }

    /// A discovery without its own probe picks candidate ports with the
    /// foundation's probe.
    #[must_use]
    pub fn with_port_discovery(mut self, discovery: PortDiscovery) -> Self {
        self.discovery = discovery.or_probe(Arc::clone(&self.probe));
        self
    }

    /// Used for health checks and for choosing between candidate ports.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.discovery = self.discovery.with_probe(Arc::clone(&probe));
        self.probe = probe;
        self
    }

    #[must_use]
    pub fn with_container_runtime(
        mut self,
        containers: Arc<dyn ContainerRuntime>,
        prompt: Arc<dyn ConflictPrompt>,
    ) -> Self {
        self.containers = containers;
        self.prompt = prompt;
        self
    }

    async fn bring_up(
        &self,
        config: DevConfig,
    ) -> Result<Activation<DevRuntime, DevInfo>, StartupReason> {
        if is_docker_command(&config.command) {
            if let Some(image) = image_from_args(&config.args) {
                resolve_conflicts(self.containers.as_ref(), self.prompt.as_ref(), image).await?;
            }
        }

        let (args, plan) = plan_rpc_port(&config.args, preallocated_port());
        let log_directory = config
            .log_directory
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIRECTORY));
        let launched = launch(
            LaunchOptions::new(config.command.clone(), args, config.name.clone())
                .with_log_directory(log_directory),
        )
        .await?;

        let mut scope = ResourceScope::new();
        let process = scope.adopt(Managed::new(launched.process, launched.cleanup));

        let port = match plan {
            PortPlan::Fixed(port) => port,
            PortPlan::Discover => {
                match self
                    .discovery
                    .discover(process.pid(), config.is_ethereum_chain)
                    .await
                {
                    Ok(port) => port,
                    Err(error) => {
                        scope.close().await;
                        return Err(error.into());
                    }
                }
            }
        };

        let endpoint = local_ws_endpoint(port);
        info!(name = %config.name, pid = process.pid(), port, "dev node running");
        Ok(Activation {
            status: FoundationStatus::Running {
                endpoint: endpoint.clone(),
                pid: Some(process.pid()),
            },
            runtime: DevRuntime {
                port,
                is_ethereum_chain: config.is_ethereum_chain,
            },
            cleanup: scope.into_cleanup(format!("dev node {}", config.name)),
            info: DevInfo {
                log_path: process.log_path().to_path_buf(),
                process,
                port,
                endpoint,
                config,
            },
        })
    }
}

#[async_trait]
impl Foundation for DevFoundation {
    type Config = DevConfig;
    type Info = DevInfo;

    fn kind(&self) -> FoundationKind {
        FoundationKind::Dev
    }

    async fn start(&self, config: DevConfig) -> Result<Started<DevInfo>, StartupError> {
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
        let endpoint = endpoint.map_or_else(|| local_ws_endpoint(runtime.port), str::to_owned);

        let spec = TimeoutSpec::new(
            OperationKind::HealthCheck,
            format!("health check of dev node `{name}`"),
        )
        .with_endpoint(endpoint.clone());
        let probe = check_ready(
            self.probe.as_ref(),
            &endpoint,
            runtime.is_ethereum_chain,
            ReadinessCheck::health_check(),
        );
        let outcome = with_timeout(spec, probe)
            .instrument(foundation_span(FoundationKind::Dev.as_str(), "health_check", Some(&name)))
            .await;

        let reason = match outcome {
            Ok(Ok(true)) => return Ok(()),
            Ok(Ok(false)) => HealthCheckReason::NotReady,
            Ok(Err(error)) => HealthCheckReason::Probe(error.into()),
            Err(timeout) => HealthCheckReason::Timeout(timeout),
        };
        Err(HealthCheckError::new(FoundationKind::Dev, name, reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| (*value).to_owned()).collect()
    }

    #[test]
    fn appends_ephemeral_port_by_default() {
        let (args, plan) = plan_rpc_port(&strings(&["--dev"]), None);
        assert_eq!(args, strings(&["--dev", "--rpc-port=0"]));
        assert_eq!(plan, PortPlan::Discover);
    }

    #[test]
    fn preallocated_port_skips_discovery() {
        let (args, plan) = plan_rpc_port(&strings(&["--dev"]), Some(9944));
        assert_eq!(args, strings(&["--dev", "--rpc-port=9944"]));
        assert_eq!(plan, PortPlan::Fixed(9944));
    }

    #[test]
    fn explicit_flag_is_respected() {
        let (args, plan) = plan_rpc_port(&strings(&["--rpc-port=9955"]), Some(9944));
        assert_eq!(args, strings(&["--rpc-port=9955"]));
        assert_eq!(plan, PortPlan::Fixed(9955));

        let (args, plan) = plan_rpc_port(&strings(&["--rpc-port", "9955"]), None);
        assert_eq!(args.len(), 2);
        assert_eq!(plan, PortPlan::Discover);
    }
}
