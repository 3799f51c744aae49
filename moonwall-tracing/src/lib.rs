pub mod logging;
pub mod otlp;
pub mod span;

use std::{env, sync::LazyLock};

pub use logging::{FileConfig, TracingError, TracingGuard, TracingSettings, init_tracing};
pub use span::{FOUNDATION_SPAN_PREFIX, foundation_span, foundation_span_name, in_foundation_span};

/// Environment variable that turns on OTLP trace export.
pub const TRACING_ENABLED_ENV: &str = "MOONWALL_TRACING_ENABLED";

pub static IS_TRACING_ENABLED: LazyLock<bool> = LazyLock::new(|| {
    env::var(TRACING_ENABLED_ENV).is_ok_and(|value| value == "true" || value == "1")
});
