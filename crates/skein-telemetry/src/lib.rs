mod history;
mod metrics;

pub use history::{spawn_history_task, HistoryError, HistoryQuery, MetricsHistory, UsageSnapshotRow};
pub use metrics::MetricsAggregator;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "skein_server" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines instead of human-readable output.
    pub json: bool,
    /// Whether to persist usage snapshots to SQLite.
    pub history_enabled: bool,
    pub history_db_path: PathBuf,
    pub history_snapshot_interval_secs: u64,
    pub history_retention_days: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
            history_enabled: false,
            history_db_path: skein_home().join("database/usage.db"),
            history_snapshot_interval_secs: 60,
            history_retention_days: 7,
        }
    }
}

/// Keeps telemetry resources alive for the life of the process.
pub struct TelemetryGuard {
    history: Option<Arc<MetricsHistory>>,
}

impl TelemetryGuard {
    pub fn history(&self) -> Option<&Arc<MetricsHistory>> {
        self.history.as_ref()
    }
}

fn filter_directives(config: &TelemetryConfig) -> String {
    let mut filter = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter
}

/// Initialize logging and optional usage history. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directives(&config)));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
    {
        eprintln!("skein-telemetry: subscriber already installed: {e}");
    }

    let history = if config.history_enabled {
        match MetricsHistory::open(&config.history_db_path) {
            Ok(h) => Some(Arc::new(h)),
            Err(e) => {
                tracing::warn!(error = %e, path = %config.history_db_path.display(), "failed to open usage history");
                None
            }
        }
    } else {
        None
    };

    TelemetryGuard { history }
}

/// `~/.skein`, or `/tmp/.skein` without a home directory.
pub fn skein_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".skein")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_module_levels() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("skein_server".into(), Level::DEBUG)],
            ..Default::default()
        };
        assert_eq!(filter_directives(&config), "warn,skein_server=debug");
    }

    #[test]
    fn init_without_history() {
        let guard = init_telemetry(TelemetryConfig::default());
        assert!(guard.history().is_none());
        // A second install is tolerated.
        let _again = init_telemetry(TelemetryConfig::default());
    }
}
