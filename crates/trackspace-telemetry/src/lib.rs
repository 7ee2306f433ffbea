//! Logging and metrics for the chat hub.
//!
//! [`init_telemetry`] installs the global `tracing` subscriber (JSON or
//! compact text on stdout, filtered by `RUST_LOG` when set) and hands back a
//! [`TelemetryGuard`] that owns the process-wide [`MetricsRecorder`].

mod metrics;

pub use metrics::{HistogramSummary, MetricType, MetricsRecorder, MetricsSnapshot};

use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "trackspace_server::hub" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// One JSON object per line instead of compact text.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// The `EnvFilter` directive string used when RUST_LOG is unset.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log level '{0}'")]
    InvalidLevel(String),
}

/// Parse `trace|debug|info|warn|error`, case-insensitive.
pub fn parse_level(raw: &str) -> Result<Level, TelemetryError> {
    raw.trim()
        .parse::<Level>()
        .map_err(|_| TelemetryError::InvalidLevel(raw.to_string()))
}

/// Handle to the telemetry subsystem. Keep it alive for the process lifetime.
pub struct TelemetryGuard {
    metrics: Arc<MetricsRecorder>,
    installed: bool,
}

impl TelemetryGuard {
    /// Shared metrics recorder.
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        self.metrics.clone()
    }

    /// False when another global subscriber was already set (tests, embedding).
    pub fn subscriber_installed(&self) -> bool {
        self.installed
    }
}

/// Initialize the telemetry subsystem. Call once at startup; later calls
/// leave the existing subscriber in place.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
    });
    let text_layer = (!config.json).then(|| tracing_subscriber::fmt::layer().with_target(true).compact());

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .is_ok();

    TelemetryGuard {
        metrics: Arc::new(MetricsRecorder::new()),
        installed,
    }
}
