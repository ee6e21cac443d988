use opentelemetry::trace::TraceId;
use thiserror::Error;
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Trace exporter error: {0}")]
    Exporter(String),

    #[error("Subscriber error: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

///  Fetch an opentelemetry::trace::TraceId as hex through the full tracing stack
pub fn get_trace_id() -> TraceId {
    use opentelemetry::trace::TraceContextExt as _; // opentelemetry::Context -> opentelemetry::trace::Span
    use tracing_opentelemetry::OpenTelemetrySpanExt as _; // tracing::Span to opentelemetry::Context

    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}

async fn init_tracer() -> Result<opentelemetry_sdk::trace::Tracer, TelemetryError> {
    use opentelemetry::trace::TracerProvider;
    #[cfg(feature = "telemetry")]
    use opentelemetry_otlp::SpanExporter;
    use opentelemetry_sdk::trace::SdkTracerProvider;

    #[cfg(feature = "telemetry")]
    let exporter = SpanExporter::builder()
        .with_tonic()
        .build()
        .map_err(|e| TelemetryError::Exporter(e.to_string()))?;
    let builder = SdkTracerProvider::builder();
    #[cfg(feature = "telemetry")]
    let builder = builder.with_batch_exporter(exporter);
    Ok(builder.build().tracer("addon-registration-controller"))
}

/// Initialize tracing
pub async fn init() -> Result<(), TelemetryError> {
    // Setup tracing layers
    let telemetry = tracing_opentelemetry::layer().with_tracer(init_tracer().await?);
    let logger = tracing_subscriber::fmt::layer().compact();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Decide on layers
    let collector = Registry::default()
        .with(telemetry)
        .with(logger)
        .with(env_filter);

    // Initialize tracing
    tracing::subscriber::set_global_default(collector)?;
    Ok(())
}
