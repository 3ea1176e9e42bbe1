use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::TracerProvider;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "shelfq=debug,sqlx=warn";

/// Installs the global subscriber. With `otel_stdout` spans are also exported
/// to stdout; the returned provider must stay alive until shutdown.
pub fn init_tracing(otel_stdout: bool) -> Option<TracerProvider> {
    let provider = otel_stdout.then(|| {
        TracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build()
    });
    let otel_layer = provider
        .as_ref()
        .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer("shelfq")));

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()))
        .with(otel_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();
    provider
}
