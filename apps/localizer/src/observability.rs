use anyhow::Result;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

const DEFAULT_FILTER: &str = "info,localizer=debug,localize=debug,task_queue=debug";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn env_filter() -> EnvFilter {
	EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn fmt_layer(json: bool) -> BoxedLayer {
	if json {
		tracing_subscriber::fmt::layer().json().with_target(true).boxed()
	} else {
		tracing_subscriber::fmt::layer().with_target(true).boxed()
	}
}

fn build_tracer_provider(service_name: &str) -> Result<SdkTracerProvider> {
	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or_else(|_| "http://localhost:4317".to_string());

	let exporter = SpanExporter::builder()
		.with_tonic()
		.with_endpoint(&otlp_endpoint)
		.build()
		.map_err(|e| anyhow::anyhow!("Failed to build OTLP exporter for {otlp_endpoint}: {e}"))?;

	let resource = Resource::builder()
		.with_service_name(service_name.to_string())
		.with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
		.build();

	Ok(SdkTracerProvider::builder()
		.with_batch_exporter(exporter)
		.with_sampler(Sampler::AlwaysOn)
		.with_id_generator(RandomIdGenerator::default())
		.with_resource(resource)
		.build())
}

/// Installs the global subscriber. With `otlp`, spans are also exported; if the exporter
/// cannot be built the process continues with local logging only.
pub fn init(service_name: &str, json: bool, otlp: bool) -> Option<SdkTracerProvider> {
	if !otlp {
		tracing_subscriber::registry().with(fmt_layer(json)).with(env_filter()).init();
		return None;
	}

	match build_tracer_provider(service_name) {
		Ok(provider) => {
			let tracer = provider.tracer(service_name.to_string());
			global::set_tracer_provider(provider.clone());
			tracing_subscriber::registry()
				.with(fmt_layer(json))
				.with(tracing_opentelemetry::layer().with_tracer(tracer))
				.with(env_filter())
				.init();
			info!(service = service_name, "✅ Observability initialized with OTLP export");
			Some(provider)
		}
		Err(e) => {
			tracing_subscriber::registry().with(fmt_layer(json)).with(env_filter()).init();
			warn!(error = %e, "⚠️ OTLP observability failed to initialize, falling back to local logging only");
			None
		}
	}
}

pub fn shutdown(provider: Option<SdkTracerProvider>) {
	if let Some(provider) = provider {
		if let Err(e) = provider.shutdown() {
			warn!(error = %e, "Failed to flush traces on shutdown");
		}
	}
}
