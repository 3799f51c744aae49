//! Named deadlines around asynchronous operations.
//!
//! [`with_timeout`] only ever adds one failure mode: the deadline. Whatever the
//! wrapped future resolves to, including its own errors, is handed back
//! untouched in the `Ok` arm.

use std::{collections::BTreeMap, fmt, future::Future, time::Duration};

use serde::{Deserialize, Serialize};

/// Default deadlines per operation kind.
pub mod defaults {
    use std::time::Duration;

    pub const FOUNDATION_STARTUP: Duration = Duration::from_millis(120_000);
    pub const FOUNDATION_SHUTDOWN: Duration = Duration::from_millis(30_000);
    pub const PROVIDER_CONNECTION: Duration = Duration::from_millis(300_000);
    pub const BLOCK_CREATION: Duration = Duration::from_millis(30_000);
    pub const STORAGE_OPERATION: Duration = Duration::from_millis(10_000);
    pub const HEALTH_CHECK: Duration = Duration::from_millis(30_000);
    pub const RPC_CALL: Duration = Duration::from_millis(10_000);
    pub const WEBSOCKET_CONNECT: Duration = Duration::from_millis(30_000);
    pub const PORT_DISCOVERY: Duration = Duration::from_millis(120_000);
    pub const NODE_READINESS: Duration = Duration::from_millis(120_000);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    FoundationStartup,
    FoundationShutdown,
    ProviderConnection,
    BlockCreation,
    StorageOperation,
    HealthCheck,
    RpcCall,
    WebsocketConnect,
    PortDiscovery,
    NodeReadiness,
    Generic,
}

impl OperationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FoundationStartup => "foundation_startup",
            Self::FoundationShutdown => "foundation_shutdown",
            Self::ProviderConnection => "provider_connection",
            Self::BlockCreation => "block_creation",
            Self::StorageOperation => "storage_operation",
            Self::HealthCheck => "health_check",
            Self::RpcCall => "rpc_call",
            Self::WebsocketConnect => "websocket_connect",
            Self::PortDiscovery => "port_discovery",
            Self::NodeReadiness => "node_readiness",
            Self::Generic => "generic",
        }
    }

    /// Human-facing name used at the start of timeout messages.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::FoundationStartup => "Foundation startup",
            Self::FoundationShutdown => "Foundation shutdown",
            Self::ProviderConnection => "Provider connection",
            Self::BlockCreation => "Block creation",
            Self::StorageOperation => "Storage operation",
            Self::HealthCheck => "Health check",
            Self::RpcCall => "RPC call",
            Self::WebsocketConnect => "WebSocket connection",
            Self::PortDiscovery => "Port discovery",
            Self::NodeReadiness => "Node readiness check",
            Self::Generic => "Operation",
        }
    }

    #[must_use]
    pub const fn default_timeout(self) -> Duration {
        match self {
            Self::FoundationStartup => defaults::FOUNDATION_STARTUP,
            Self::FoundationShutdown => defaults::FOUNDATION_SHUTDOWN,
            Self::ProviderConnection => defaults::PROVIDER_CONNECTION,
            Self::BlockCreation => defaults::BLOCK_CREATION,
            Self::StorageOperation => defaults::STORAGE_OPERATION,
            Self::HealthCheck => defaults::HEALTH_CHECK,
            Self::RpcCall | Self::Generic => defaults::RPC_CALL,
            Self::WebsocketConnect => defaults::WEBSOCKET_CONNECT,
            Self::PortDiscovery => defaults::PORT_DISCOVERY,
            Self::NodeReadiness => defaults::NODE_READINESS,
        }
    }

    /// Remediation hints shown under a rendered timeout.
    #[must_use]
    pub const fn suggestions(self) -> &'static [&'static str] {
        match self {
            Self::FoundationStartup => &[
                "Check that the node binary is available and executable",
                "Check the node log file for startup errors",
                "Increase the startup timeout if the node is slow to boot",
            ],
            Self::FoundationShutdown => &[
                "Check for processes that ignore termination signals",
                "Kill any leftover node processes manually",
            ],
            Self::ProviderConnection | Self::WebsocketConnect => &[
                "Verify that the endpoint is reachable from this machine",
                "Check that the endpoint URL and port are correct",
            ],
            Self::BlockCreation => &[
                "Check that the simulator is still running",
                "Large blocks may need a longer block creation timeout",
            ],
            Self::StorageOperation => &["Check that the storage module and method names exist"],
            Self::HealthCheck | Self::NodeReadiness => &[
                "Check that the node process is still running",
                "Check the node log file for crashes",
            ],
            Self::RpcCall => &["Verify that the RPC endpoint is responsive"],
            Self::PortDiscovery => &[
                "Check that the node exposes an RPC port",
                "Check that `lsof` is installed",
            ],
            Self::Generic => &[],
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Describes one deadline: what is being waited for, how long, and where.
#[derive(Clone, Debug)]
pub struct TimeoutSpec {
    duration: Duration,
    kind: OperationKind,
    description: String,
    endpoint: Option<String>,
    context: BTreeMap<String, String>,
}

impl TimeoutSpec {
    #[must_use]
    pub fn new(kind: OperationKind, description: impl Into<String>) -> Self {
        Self {
            duration: kind.default_timeout(),
            kind,
            description: description.into(),
            endpoint: None,
            context: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Overrides the duration only when a value is given.
    #[must_use]
    pub fn with_duration_ms(self, duration_ms: Option<u64>) -> Self {
        match duration_ms {
            Some(ms) => self.with_duration(Duration::from_millis(ms)),
            None => self,
        }
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }

    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        self.kind
    }
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct TimeoutError {
    kind: OperationKind,
    description: String,
    timeout_ms: u64,
    endpoint: Option<String>,
    context: BTreeMap<String, String>,
    message: String,
}

impl TimeoutError {
    #[must_use]
    pub fn from_spec(spec: TimeoutSpec) -> Self {
        let mut message = format!(
            "{} timed out after {}: {}",
            spec.kind.label(),
            format_duration(spec.duration),
            spec.description
        );
        if let Some(endpoint) = &spec.endpoint {
            message.push_str(&format!(" (endpoint: {endpoint})"));
        }

        Self {
            kind: spec.kind,
            description: spec.description,
            timeout_ms: spec.duration.as_millis() as u64,
            endpoint: spec.endpoint,
            context: spec.context,
            message,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        self.kind
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub const fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    #[must_use]
    pub const fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Races `future` against the deadline in `spec`.
pub async fn with_timeout<F>(spec: TimeoutSpec, future: F) -> Result<F::Output, TimeoutError>
where
    F: Future,
{
    tokio::time::timeout(spec.duration, future)
        .await
        .map_err(|_| TimeoutError::from_spec(spec))
}

/// Renders a duration as `250ms`, `10s`, `1.5s`, `2m` or `2m 30s`.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let ms = duration.as_millis();
    if ms < 1_000 {
        return format!("{ms}ms");
    }
    if ms < 60_000 {
        return if ms % 1_000 == 0 {
            format!("{}s", ms / 1_000)
        } else {
            format!("{:.1}s", duration.as_secs_f64())
        };
    }
    let minutes = ms / 60_000;
    let seconds = (ms % 60_000) / 1_000;
    if seconds == 0 {
        format!("{minutes}m")
    } else {
        format!("{minutes}m {seconds}s")
    }
}

/// User-facing rendering: the message, any structured context, and the
/// operation's remediation hints.
#[must_use]
pub fn format_timeout_error(error: &TimeoutError) -> String {
    let mut rendered = error.message.clone();
    for (key, value) in &error.context {
        rendered.push_str(&format!("\n  {key}: {value}"));
    }

    let suggestions = error.kind.suggestions();
    if !suggestions.is_empty() {
        rendered.push_str("\n\nSuggestions:");
        for suggestion in suggestions {
            rendered.push_str(&format!("\n  - {suggestion}"));
        }
    }
    rendered
}
