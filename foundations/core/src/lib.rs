pub mod config;
pub mod errors;
pub mod foundation;
pub mod lifecycle;
pub mod policy;
pub mod provider;
pub mod readiness;
pub mod resource;
pub mod shutdown;
pub mod status;

pub use config::{FoundationConfig, FoundationKind};
pub use errors::{
    DiscoveryError, HealthCheckError, HealthCheckReason, LaunchError, ProcessError, ShutdownError,
    StartupError, StartupReason, UserAbortError,
};
pub use foundation::Foundation;
pub use lifecycle::{Activation, Lifecycle, Started, StopHandle};
pub use resource::{Cleanup, CleanupReport};
pub use status::FoundationStatus;

pub type DynError = Box<dyn std::error::Error + Send + Sync + 'static>;
