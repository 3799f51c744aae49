use std::{error::Error, io, path::PathBuf};

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    filter::ParseError,
    fmt,
    layer::SubscriberExt as _,
    util::{SubscriberInitExt as _, TryInitError},
};

use crate::{
    IS_TRACING_ENABLED,
    otlp::{OtlpTracingConfig, create_otlp_tracing_layer, shutdown_tracer_provider},
};

const DEFAULT_LOG_FILE: &str = "moonwall.log";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileConfig {
    pub directory: PathBuf,
    pub prefix: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TracingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    #[serde(default = "default_filter")]
    pub filter: String,
    /// Write logs to a file instead of stderr.
    #[serde(default)]
    pub file: Option<FileConfig>,
    /// Export spans over OTLP; only honoured when tracing is enabled via env.
    #[serde(default)]
    pub otlp: Option<OtlpTracingConfig>,
}

impl Default for TracingSettings {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            file: None,
            otlp: None,
        }
    }
}

fn default_filter() -> String {
    "info".to_owned()
}

#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),
    #[error("failed to install OTLP exporter: {0}")]
    Otlp(#[source] Box<dyn Error + Send + Sync>),
    #[error("global subscriber already installed: {0}")]
    Init(#[from] TryInitError),
}

/// Keeps the non-blocking file writer alive and flushes exported spans when
/// dropped.
#[must_use = "dropping the guard stops log delivery"]
pub struct TracingGuard {
    _file_guard: Option<WorkerGuard>,
    otlp_installed: bool,
}

impl TracingGuard {
    #[must_use]
    pub const fn exports_traces(&self) -> bool {
        self.otlp_installed
    }
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        if self.otlp_installed {
            shutdown_tracer_provider();
        }
    }
}

pub fn init_tracing(settings: &TracingSettings) -> Result<TracingGuard, TracingError> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&settings.filter))?;

    let otlp_layer = match settings.otlp.clone() {
        Some(config) if *IS_TRACING_ENABLED => {
            Some(create_otlp_tracing_layer(config).map_err(TracingError::Otlp)?)
        }
        _ => None,
    };
    let otlp_installed = otlp_layer.is_some();

    let (file_layer, file_guard) = settings.file.as_ref().map_or((None, None), |file| {
        let file_name = file
            .prefix
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE));
        let appender = tracing_appender::rolling::never(&file.directory, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (
            Some(fmt::layer().with_ansi(false).with_writer(writer)),
            Some(guard),
        )
    });
    let stderr_layer = settings
        .file
        .is_none()
        .then(|| fmt::layer().with_writer(io::stderr));

    tracing_subscriber::registry()
        .with(otlp_layer)
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()?;

    Ok(TracingGuard {
        _file_guard: file_guard,
        otlp_installed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_fill_defaults() {
        let settings: TracingSettings = serde_yaml::from_str("file:\n  directory: /tmp/logs\n")
            .expect("settings should parse");

        assert_eq!(settings.filter, "info");
        assert!(settings.otlp.is_none());
        let file = settings.file.expect("file config");
        assert_eq!(file.directory, PathBuf::from("/tmp/logs"));
        assert!(file.prefix.is_none());
    }

    #[test]
    fn settings_parse_otlp_endpoint() {
        let raw = "filter: debug\n\
                   otlp:\n  \
                   endpoint: http://127.0.0.1:4318/v1/traces\n  \
                   service_name: moonwall-ci\n";
        let settings: TracingSettings = serde_yaml::from_str(raw).expect("settings should parse");

        let otlp = settings.otlp.expect("otlp config");
        assert_eq!(otlp.service_name, "moonwall-ci");
        assert_eq!(otlp.endpoint.port(), Some(4318));
    }
}
