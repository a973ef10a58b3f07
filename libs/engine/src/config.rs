//! Engine settings.

use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::render::Capabilities;

/// Settings shared by every action.
///
/// Actions never read process state; embedding binaries build this value
/// (for example with [`EngineSettings::from_env`]) and pass it in through
/// [`Configuration`](crate::Configuration).
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Default timeout for each hook and for readiness waits.
    pub timeout: Duration,

    /// Interval between cluster state probes.
    pub poll_interval: Duration,

    /// Maximum revisions kept per release; 0 keeps everything.
    pub max_history: usize,

    /// Log filter directive used by [`EngineSettings::log_filter`] when
    /// `RUST_LOG` is unset.
    pub log_level: String,

    /// Cluster capabilities passed to the renderer.
    pub capabilities: Capabilities,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
            max_history: 0,
            log_level: "info".to_string(),
            capabilities: Capabilities::default(),
        }
    }
}

impl EngineSettings {
    /// Load settings from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Filter for an embedding binary's subscriber: `RUST_LOG` when set,
    /// else `log_level`, else `info`.
    pub fn log_filter(&self) -> EnvFilter {
        build_filter(std::env::var("RUST_LOG").ok(), &self.log_level)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let timeout = lookup("KEEL_TIMEOUT_SECS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout);

        let poll_interval = lookup("KEEL_POLL_INTERVAL_MS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        let max_history = lookup("KEEL_MAX_HISTORY")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_history);

        let log_level = lookup("KEEL_LOG_LEVEL").unwrap_or(defaults.log_level);

        Self {
            timeout,
            poll_interval,
            max_history,
            log_level,
            capabilities: defaults.capabilities,
        }
    }
}

fn build_filter(rust_log: Option<String>, log_level: &str) -> EnvFilter {
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_new(log_level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}
