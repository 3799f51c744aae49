//! Failure taxonomy for foundation lifecycles.

use std::{io, path::PathBuf};

use crate::{
    DynError, config::FoundationKind, policy::TimeoutError, provider::ProviderConnectionError,
};

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to create log directory {path}: {source}")]
    LogDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn `{command}` with args {args:?}: {source}")]
    Spawn {
        command: String,
        args: Vec<String>,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` was spawned but reported no process id")]
    MissingPid { command: String, args: Vec<String> },
}

#[derive(Debug, thiserror::Error)]
#[error("process operation `{operation}` failed (pid {pid:?}): {source}")]
pub struct ProcessError {
    operation: &'static str,
    pid: Option<u32>,
    #[source]
    source: DynError,
}

impl ProcessError {
    pub fn new(operation: &'static str, pid: Option<u32>, source: impl Into<DynError>) -> Self {
        Self {
            operation,
            pid,
            source: source.into(),
        }
    }

    #[must_use]
    pub const fn operation(&self) -> &'static str {
        self.operation
    }

    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[derive(Debug, thiserror::Error)]
#[error("no RPC port discovered for pid {pid} after {attempts} attempts")]
pub struct DiscoveryError {
    pid: u32,
    attempts: u32,
    #[source]
    source: Option<DynError>,
}

impl DiscoveryError {
    #[must_use]
    pub const fn new(pid: u32, attempts: u32, source: Option<DynError>) -> Self {
        Self {
            pid,
            attempts,
            source,
        }
    }

    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[derive(Debug, thiserror::Error)]
#[error("aborted by user: {prompt}")]
pub struct UserAbortError {
    prompt: String,
}

impl UserAbortError {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
        }
    }

    #[must_use]
    pub fn prompt(&self) -> &str {
        &self.prompt
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupReason {
    #[error("foundation is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Provider(#[from] ProviderConnectionError),
    #[error(transparent)]
    UserAbort(#[from] UserAbortError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error("container runtime failed: {0}")]
    Container(#[source] DynError),
    #[error("simulator failed to launch: {0}")]
    Simulator(#[source] DynError),
    #[error("network failed to launch: {0}")]
    Network(#[source] DynError),
    #[error("network did not produce blocks: {0}")]
    BlockProduction(#[source] DynError),
    #[error("no connections configured")]
    NoConnections,
    #[error("none of the configured providers could be connected")]
    NoProvidersConnected,
}

#[derive(Debug, thiserror::Error)]
#[error("{kind} foundation `{name}` failed to start: {reason}")]
pub struct StartupError {
    kind: FoundationKind,
    name: String,
    #[source]
    reason: StartupReason,
}

impl StartupError {
    pub fn new(
        kind: FoundationKind,
        name: impl Into<String>,
        reason: impl Into<StartupReason>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> FoundationKind {
        self.kind
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn reason(&self) -> &StartupReason {
        &self.reason
    }

    #[must_use]
    pub fn into_reason(self) -> StartupReason {
        self.reason
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{kind} foundation `{name}` failed to shut down cleanly: {message}")]
pub struct ShutdownError {
    kind: FoundationKind,
    name: String,
    message: String,
    failed_resources: Vec<String>,
    #[source]
    source: Option<DynError>,
}

impl ShutdownError {
    pub fn new(
        kind: FoundationKind,
        name: impl Into<String>,
        message: impl Into<String>,
        failed_resources: Vec<String>,
        source: Option<DynError>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            message: message.into(),
            failed_resources,
            source,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> FoundationKind {
        self.kind
    }

    #[must_use]
    pub fn failed_resources(&self) -> &[String] {
        &self.failed_resources
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HealthCheckReason {
    #[error("foundation is not {expected} (status: {status})")]
    NotRunning {
        expected: &'static str,
        status: String,
    },
    #[error("no connected provider serves {0}")]
    UnknownEndpoint(String),
    #[error("endpoint did not report ready")]
    NotReady,
    #[error("probe failed: {0}")]
    Probe(#[source] DynError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
}

#[derive(Debug, thiserror::Error)]
#[error("{kind} foundation `{name}` is unhealthy: {reason}")]
pub struct HealthCheckError {
    kind: FoundationKind,
    name: String,
    #[source]
    reason: HealthCheckReason,
}

impl HealthCheckError {
    pub fn new(kind: FoundationKind, name: impl Into<String>, reason: HealthCheckReason) -> Self {
        Self {
            kind,
            name: name.into(),
            reason,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> FoundationKind {
        self.kind
    }

    #[must_use]
    pub const fn reason(&self) -> &HealthCheckReason {
        &self.reason
    }
}
