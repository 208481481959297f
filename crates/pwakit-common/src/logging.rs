//! `tracing` subscriber setup shared by the worker binaries and tests.
//!
//! Explicit filter directives win over `RUST_LOG`. Without either, the
//! configured level applies to the PWAKit crates and everything else logs
//! warnings only. [`LogConfig::from_env`] reads directives from `PWAKIT_LOG`.

use std::env;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::PwaKitError;

/// Environment variable holding filter directives.
pub const LOG_ENV: &str = "PWAKIT_LOG";

/// Environment variable selecting the output format.
pub const LOG_FORMAT_ENV: &str = "PWAKIT_LOG_FORMAT";

const PWAKIT_TARGETS: &[&str] = &["pwakit_common", "pwakit_net", "pwakit_sw", "pwakit_smoke"];

/// HTTP stack crates are chatty at debug level.
const QUIET_TARGETS: &str = "hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human-readable.
    #[default]
    Pretty,
    Compact,
    /// One JSON object per event.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = PwaKitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(PwaKitError::config(format!("unknown log format '{other}'"))),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level for the PWAKit crates when no directives are given.
    pub level: Level,
    pub format: LogFormat,
    /// Include source file and line.
    pub include_location: bool,
    /// Log span enter/close, useful to follow one event through the loop.
    pub include_span_events: bool,
    /// Explicit filter directives, e.g. `"pwakit_sw::fetch=trace"`.
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            include_location: false,
            include_span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Per-request decisions (cache hit, miss, fallback) become visible.
    pub fn debug() -> Self {
        Self {
            level: Level::DEBUG,
            include_location: true,
            include_span_events: true,
            ..Default::default()
        }
    }

    /// JSON lines at info level.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            ..Default::default()
        }
    }

    /// Defaults overridden by `PWAKIT_LOG` and `PWAKIT_LOG_FORMAT`.
    pub fn from_env() -> Result<Self, PwaKitError> {
        let mut config = Self::default();
        if let Ok(directives) = env::var(LOG_ENV) {
            config.filter = Some(directives);
        }
        if let Ok(format) = env::var(LOG_FORMAT_ENV) {
            config.format = format.parse()?;
        }
        Ok(config)
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Directive string the subscriber will be built with.
    pub fn directives(&self) -> String {
        if let Some(filter) = &self.filter {
            return filter.clone();
        }
        if let Ok(rust_log) = env::var(EnvFilter::DEFAULT_ENV) {
            return rust_log;
        }
        let level = self.level.as_str().to_ascii_lowercase();
        let mut directives: Vec<String> = PWAKIT_TARGETS
            .iter()
            .map(|target| format!("{target}={level}"))
            .collect();
        directives.push("warn".to_string());
        directives.push(QUIET_TARGETS.to_string());
        directives.join(",")
    }

    fn env_filter(&self) -> Result<EnvFilter, PwaKitError> {
        let directives = self.directives();
        EnvFilter::try_new(&directives).map_err(|e| {
            PwaKitError::config_with_source(format!("invalid log filter '{directives}'"), e)
        })
    }

    fn span_events(&self) -> FmtSpan {
        if self.include_span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let layer = fmt::layer()
            .with_target(true)
            .with_file(self.include_location)
            .with_line_number(self.include_location)
            .with_span_events(self.span_events());

        match self.format {
            LogFormat::Pretty => layer.pretty().boxed(),
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Json => layer.json().with_current_span(true).boxed(),
        }
    }
}

/// Install the global subscriber.
///
/// Fails on an invalid filter or when a subscriber is already installed.
pub fn init_logging(config: LogConfig) -> Result<(), PwaKitError> {
    let filter = config.env_filter()?;

    Registry::default()
        .with(config.fmt_layer())
        .with(filter)
        .try_init()
        .map_err(|e| PwaKitError::config_with_source("logging already initialized", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_target_pwakit_crates() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(!config.include_location);

        if env::var(EnvFilter::DEFAULT_ENV).is_err() {
            let directives = config.directives();
            assert!(directives.starts_with("pwakit_common=info,pwakit_net=info"));
            assert!(directives.contains("reqwest=warn"));
        }
    }

    #[test]
    fn test_explicit_filter_wins() {
        let config = LogConfig::debug().with_filter("pwakit_sw::fetch=trace");
        assert_eq!(config.directives(), "pwakit_sw::fetch=trace");
        assert!(config.env_filter().is_ok());
    }

    #[test]
    fn test_invalid_filter_is_config_error() {
        let config = LogConfig::default().with_filter("pwakit_sw=loud");
        let err = config.env_filter().unwrap_err();
        assert_eq!(err.category(), "config");
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!(" JSON ".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
