use async_trait::async_trait;
use tokio::sync::watch;

use crate::{
    config::FoundationKind,
    errors::{HealthCheckError, ShutdownError, StartupError},
    lifecycle::Started,
    status::FoundationStatus,
};

/// Uniform lifecycle contract implemented by every foundation.
///
/// `start` hands back both the caller-facing info and a stop handle bound
/// to that particular run. `stop` tears down whatever run is current.
#[async_trait]
pub trait Foundation: Send + Sync {
    type Config: Send + 'static;
    type Info: Send + 'static;

    fn kind(&self) -> FoundationKind;

    async fn start(&self, config: Self::Config) -> Result<Started<Self::Info>, StartupError>;

    async fn stop(&self) -> Result<(), ShutdownError>;

    fn status(&self) -> FoundationStatus;

    fn subscribe_status(&self) -> watch::Receiver<FoundationStatus>;

    /// Probes the foundation without changing its status.
    async fn health_check(&self, endpoint: Option<&str>) -> Result<(), HealthCheckError>;
}
