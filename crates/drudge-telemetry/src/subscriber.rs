// crates/drudge-telemetry/src/subscriber.rs
//
// Process-wide `tracing` subscriber installation: env filter, plain or JSON
// formatting (ERROR to stderr, everything else to stdout), and an optional
// OpenTelemetry layer selected by `TraceExporter`.

use drudge_core::DrudgeError;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::{self, Sampler, TracerProvider};
use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Log line encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// Where spans go.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceExporter {
    /// Spans only scope log events.
    #[default]
    Disabled,
    /// Span close events are written by the log formatter, with timings.
    Log,
    /// Spans are recorded through OpenTelemetry with parent-based ratio
    /// sampling. Export is configured on the provider by the host.
    OpenTelemetry { sample_ratio: f64 },
}

impl TraceExporter {
    pub fn open_telemetry(sample_ratio: f64) -> Result<Self, DrudgeError> {
        let exporter = TraceExporter::OpenTelemetry { sample_ratio };
        exporter.validate()?;
        Ok(exporter)
    }

    pub fn validate(&self) -> Result<(), DrudgeError> {
        match self {
            TraceExporter::OpenTelemetry { sample_ratio }
                if !(0.0..=1.0).contains(sample_ratio) =>
            {
                Err(DrudgeError::Config(format!(
                    "trace sample_ratio must be within [0, 1], got {sample_ratio}"
                )))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    pub filter: String,
    pub format: LogFormat,
    pub tracing: TraceExporter,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Plain,
            tracing: TraceExporter::Disabled,
        }
    }
}

/// Keeps the tracer provider alive for the life of the process.
#[derive(Debug, Default)]
pub struct TelemetryGuard {
    provider: Option<TracerProvider>,
}

impl TelemetryGuard {
    pub fn provider(&self) -> Option<&TracerProvider> {
        self.provider.as_ref()
    }
}

/// Tracer provider matching `exporter`, if the exporter records spans.
pub fn tracer_provider(exporter: &TraceExporter) -> Result<Option<TracerProvider>, DrudgeError> {
    exporter.validate()?;
    let TraceExporter::OpenTelemetry { sample_ratio } = exporter else {
        return Ok(None);
    };
    let sampler = Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(*sample_ratio)));
    let provider = TracerProvider::builder()
        .with_config(trace::config().with_sampler(sampler))
        .build();
    Ok(Some(provider))
}

/// Install the global subscriber. `service_name` names the OpenTelemetry
/// tracer.
pub fn install(service_name: &str, config: &TelemetryConfig) -> Result<TelemetryGuard, DrudgeError> {
    let provider = tracer_provider(&config.tracing)?;
    install_with_provider(service_name, config, provider)
}

/// Like [`install`], with a provider built by the host (e.g. one carrying a
/// span exporter).
pub fn install_with_provider(
    service_name: &str,
    config: &TelemetryConfig,
    provider: Option<TracerProvider>,
) -> Result<TelemetryGuard, DrudgeError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let writer = std::io::stderr
        .with_max_level(tracing::Level::ERROR)
        .or_else(std::io::stdout);
    let span_events = match config.tracing {
        TraceExporter::Log => FmtSpan::CLOSE,
        _ => FmtSpan::NONE,
    };
    let fmt_layer = match config.format {
        LogFormat::Plain => tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_span_events(span_events)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_span_events(span_events)
            .boxed(),
    };

    let otel_layer = provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(service_name.to_string()))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(otel_layer)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| DrudgeError::Config(format!("tracing subscriber: {e}")))?;

    Ok(TelemetryGuard { provider })
}
