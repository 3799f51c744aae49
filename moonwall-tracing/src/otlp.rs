use std::{env, error::Error};

use opentelemetry::{KeyValue, global, trace::TracerProvider as _};
use opentelemetry_otlp::{ExportConfig, Protocol, WithExportConfig as _};
use opentelemetry_sdk::{
    Resource, runtime,
    trace::{Config, Tracer},
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;
use url::Url;

const TRACER_NAME: &str = "moonwall";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OtlpTracingConfig {
    pub endpoint: Url,
    pub service_name: String,
}

pub fn create_otlp_tracing_layer<S>(
    config: OtlpTracingConfig,
) -> Result<OpenTelemetryLayer<S, Tracer>, Box<dyn Error + Send + Sync>>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let resource = Resource::new(vec![KeyValue::new(
        opentelemetry_semantic_conventions::resource::SERVICE_NAME,
        config.service_name,
    )])
    .merge(&Resource::new(env_resource_attributes()));

    let export_config = ExportConfig {
        endpoint: config.endpoint.into(),
        protocol: Protocol::HttpBinary,
        ..ExportConfig::default()
    };

    let tracer_provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .http()
                .with_http_client(Client::new())
                .with_export_config(export_config),
        )
        .with_trace_config(Config::default().with_resource(resource))
        .install_batch(runtime::Tokio)?;

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(TRACER_NAME);
    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}

/// Flushes pending spans; a no-op when no exporter was installed.
pub fn shutdown_tracer_provider() {
    global::shutdown_tracer_provider();
}

fn env_resource_attributes() -> Vec<KeyValue> {
    env::var("OTEL_RESOURCE_ATTRIBUTES")
        .map_or_else(|_| Vec::new(), |raw| parse_resource_attributes(&raw))
}

fn parse_resource_attributes(raw: &str) -> Vec<KeyValue> {
    raw.split(',')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?.trim();
            let value = parts.next().unwrap_or("").trim();
            if key.is_empty() {
                None
            } else {
                Some(KeyValue::new(key.to_owned(), value.to_owned()))
            }
        })
        .collect()
}
