use std::env;

use opentelemetry::global;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the tracing subscriber. Spans are exported to Jaeger only when a
/// collector endpoint is given; logs always go to stdout.
pub fn init(jaeger_endpoint: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let telemetry = match jaeger_endpoint {
        Some(endpoint) => {
            // isahc would otherwise route collector traffic through the proxy
            env::remove_var("http_proxy");
            env::remove_var("https_proxy");
            env::remove_var("HTTP_PROXY");
            env::remove_var("HTTPS_PROXY");

            global::set_text_map_propagator(opentelemetry_jaeger::Propagator::new());

            let tracer = opentelemetry_jaeger::new_collector_pipeline()
                .with_endpoint(endpoint)
                .with_service_name("docq")
                .with_isahc()
                .with_timeout(std::time::Duration::from_secs(2))
                .install_batch(opentelemetry::runtime::Tokio)?;

            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let filter_layer = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    tracing_subscriber::registry()
        .with(telemetry)
        .with(filter_layer)
        .with(fmt::Layer::default())
        .try_init()?;

    Ok(())
}

pub fn shutdown() {
    global::shutdown_tracer_provider();
}
