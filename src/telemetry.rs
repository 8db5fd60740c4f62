use std::{collections::HashMap, env, time::Duration};

use anyhow::bail;
use log::info;
use opentelemetry::{global, metrics::Meter, KeyValue};
use opentelemetry_otlp::{Protocol, WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::{metrics::SdkMeterProvider, Resource};

pub fn get_meter() -> Meter {
    global::meter("replay")
}

/// Whether the environment asks for metric export at all.
pub fn export_requested() -> bool {
    dotenvy::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok()
}

/// Builds the resource from `OTEL_SERVICE_NAME` and `OTEL_RESOURCE_ATTRIBUTES`.
pub fn create_resource_from_env() -> Resource {
    let mut attributes = Vec::new();

    let service_name = env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "replay".to_string());
    attributes.push(KeyValue::new("service.name", service_name));

    if let Ok(service_version) = env::var("OTEL_SERVICE_VERSION") {
        attributes.push(KeyValue::new("service.version", service_version));
    }

    if let Ok(deployment_environment) = env::var("OTEL_DEPLOYMENT_ENVIRONMENT") {
        attributes.push(KeyValue::new(
            "deployment.environment",
            deployment_environment,
        ));
    }

    if let Ok(resource_attributes) = env::var("OTEL_RESOURCE_ATTRIBUTES") {
        for (key, value) in parse_pairs(&resource_attributes) {
            if !attributes.iter().any(|kv| kv.key.as_str() == key) {
                attributes.push(KeyValue::new(key, value));
            }
        }
    }

    Resource::builder().with_attributes(attributes).build()
}

/// Parses `key1=val1,key2=val2`, skipping malformed or empty pairs.
fn parse_pairs(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
        .collect()
}

fn parse_headers() -> HashMap<String, String> {
    dotenvy::var("OTEL_EXPORTER_OTLP_HEADERS")
        .map(|raw| parse_pairs(&raw).into_iter().collect())
        .unwrap_or_default()
}

fn build_metric_exporter() -> anyhow::Result<opentelemetry_otlp::MetricExporter> {
    let endpoint = dotenvy::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4318/v1/metrics".into());
    let protocol = dotenvy::var("OTEL_EXPORTER_OTLP_PROTOCOL")
        .unwrap_or_else(|_| "http/protobuf".into())
        .to_lowercase();

    info!("Sending metrics to {}", endpoint);

    let timeout = dotenvy::var("OTEL_EXPORTER_OTLP_TIMEOUT")
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(3));

    let protocol = match protocol.as_str() {
        "http/protobuf" => Protocol::HttpBinary,
        "http/json" => Protocol::HttpJson,
        other => bail!("Unsupported OTEL_EXPORTER_OTLP_PROTOCOL: {other}"),
    };

    Ok(opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_protocol(protocol)
        .with_endpoint(endpoint)
        .with_timeout(timeout)
        .with_headers(parse_headers())
        .build()?)
}

pub fn init_meter() -> anyhow::Result<SdkMeterProvider> {
    let metric_exporter = build_metric_exporter()?;
    let resource = create_resource_from_env();

    let meter_provider = SdkMeterProvider::builder()
        .with_periodic_exporter(metric_exporter)
        .with_resource(resource);

    #[cfg(feature = "verbose")]
    let meter_provider = meter_provider
        .with_periodic_exporter(opentelemetry_stdout::MetricExporter::builder().build());

    let meter_provider = meter_provider.build();
    global::set_meter_provider(meter_provider.clone());
    Ok(meter_provider)
}
