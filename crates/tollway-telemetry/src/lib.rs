//! Logging, tracing, and metrics for Tollway
//!
//! Logs always go to stdout through `tracing-subscriber`. When an OTLP
//! exporter is configured, spans and metrics are exported as well.

mod metadata;
pub mod metrics;

use opentelemetry::{global, trace::TracerProvider};
use opentelemetry_sdk::{
    Resource,
    metrics::SdkMeterProvider,
    trace::{Sampler, SdkTracerProvider},
};
use tollway_config::{
    TelemetryConfig,
    telemetry::{ExportProtocol, ExporterConfig, LogFormat},
};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt};

/// Keeps exporters alive; flushes and shuts them down on drop
pub struct TelemetryGuard {
    meter_provider: Option<SdkMeterProvider>,
    tracer_provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    /// Push pending metrics to the exporter now
    ///
    /// # Errors
    ///
    /// Returns an error if the meter provider fails to flush
    pub fn force_flush(&self) -> anyhow::Result<()> {
        if let Some(provider) = &self.meter_provider {
            provider
                .force_flush()
                .map_err(|e| anyhow::anyhow!("failed to flush metrics: {e}"))?;
        }
        Ok(())
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.meter_provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("failed to shutdown meter provider: {e}");
        }
        if let Some(provider) = self.tracer_provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("failed to shutdown tracer provider: {e}");
        }
    }
}

/// Install the global subscriber and, when configured, OTLP exporters
///
/// `log_filter` is an `EnvFilter` directive such as `info` or
/// `tollway=debug,tower_http=info`; an invalid directive falls back to
/// `info`. The returned guard must be held for the life of the process.
///
/// # Errors
///
/// Returns an error if an OTLP exporter cannot be built
pub fn init(config: Option<&TelemetryConfig>, log_filter: &str) -> anyhow::Result<TelemetryGuard> {
    let filter = EnvFilter::try_new(log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let format = config.map(|c| c.logs.format).unwrap_or_default();

    let mut guard = TelemetryGuard {
        meter_provider: None,
        tracer_provider: None,
    };

    let Some((telemetry, exporter)) = config.and_then(|c| c.exporter.as_ref().map(|e| (c, e))) else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer(format))
            .init();
        return Ok(guard);
    };

    let resource = metadata::build_resource(telemetry);

    let meter_provider = init_metrics(exporter, resource.clone())?;
    global::set_meter_provider(meter_provider.clone());
    guard.meter_provider = Some(meter_provider);

    let tracer_provider = init_tracer(exporter, resource)?;
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer_provider.tracer("tollway"));
    global::set_tracer_provider(tracer_provider.clone());
    guard.tracer_provider = Some(tracer_provider);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer(format))
        .with(otel_layer)
        .init();

    Ok(guard)
}

fn fmt_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

fn init_metrics(config: &ExporterConfig, resource: Resource) -> anyhow::Result<SdkMeterProvider> {
    use opentelemetry_otlp::{MetricExporter, WithExportConfig};
    use opentelemetry_sdk::metrics::PeriodicReader;

    let exporter = match config.protocol {
        ExportProtocol::Grpc => MetricExporter::builder()
            .with_tonic()
            .with_endpoint(config.endpoint.as_str())
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build gRPC metrics exporter: {e}"))?,
        ExportProtocol::HttpProto => MetricExporter::builder()
            .with_http()
            .with_endpoint(config.endpoint.as_str())
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP metrics exporter: {e}"))?,
    };

    Ok(SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(PeriodicReader::builder(exporter).build())
        .build())
}

fn init_tracer(config: &ExporterConfig, resource: Resource) -> anyhow::Result<SdkTracerProvider> {
    use opentelemetry_otlp::{SpanExporter, WithExportConfig};

    let exporter = match config.protocol {
        ExportProtocol::Grpc => SpanExporter::builder()
            .with_tonic()
            .with_endpoint(config.endpoint.as_str())
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build gRPC span exporter: {e}"))?,
        ExportProtocol::HttpProto => SpanExporter::builder()
            .with_http()
            .with_endpoint(config.endpoint.as_str())
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP span exporter: {e}"))?,
    };

    let sampler = if config.sampling_rate >= 1.0 {
        Sampler::AlwaysOn
    } else if config.sampling_rate <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(config.sampling_rate)
    };

    Ok(SdkTracerProvider::builder()
        .with_resource(resource)
        .with_sampler(Sampler::ParentBased(Box::new(sampler)))
        .with_batch_exporter(exporter)
        .build())
}
