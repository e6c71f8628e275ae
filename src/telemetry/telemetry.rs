use opentelemetry::trace::TraceId;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

/// Fetch an opentelemetry::trace::TraceId as hex through the full tracing stack
pub fn get_trace_id() -> TraceId {
    use opentelemetry::trace::TraceContextExt as _;
    use tracing_opentelemetry::OpenTelemetrySpanExt as _;

    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}

#[cfg(feature = "telemetry")]
fn resource() -> opentelemetry_sdk::Resource {
    opentelemetry_sdk::Resource::builder()
        .with_service_name(env!("CARGO_PKG_NAME"))
        .build()
}

#[cfg(feature = "telemetry")]
fn init_tracer() -> anyhow::Result<opentelemetry_sdk::trace::SdkTracer> {
    use opentelemetry::trace::TracerProvider;
    use opentelemetry_otlp::WithExportConfig;

    let endpoint = std::env::var("OPENTELEMETRY_ENDPOINT_URL")
        .unwrap_or_else(|_| "http://localhost:4318/v1/traces".to_string());
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()?;

    let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_resource(resource())
        .with_batch_exporter(exporter)
        .build();

    opentelemetry::global::set_tracer_provider(provider.clone());
    Ok(provider.tracer("rook-controllers"))
}

/// Initialize tracing. Log level comes from `RUST_LOG`, defaulting to info.
pub async fn init(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let logger = if json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().compact().boxed()
    };

    let collector = tracing_subscriber::registry().with(filter).with(logger);

    #[cfg(feature = "telemetry")]
    let collector = collector.with(tracing_opentelemetry::layer().with_tracer(init_tracer()?));

    collector.try_init()?;
    Ok(())
}
